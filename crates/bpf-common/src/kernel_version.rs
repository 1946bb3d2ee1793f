//! Version of the running kernel, used to pick defaults and reported in
//! diagnostics.

use std::{fmt, str::FromStr};

use anyhow::{Context, Result};
use nix::sys::utsname::uname;

const VERSION_SIGNATURE: &str = "/proc/version_signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    /// Fallback when detection fails.
    pub const MINIMUM: KernelVersion = KernelVersion::new(4, 18, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Read the running kernel version.
    ///
    /// Ubuntu reports the ABI version in `uname -r`; the upstream version is
    /// only found in `/proc/version_signature`.
    pub fn autodetect() -> Result<Self> {
        if let Ok(signature) = std::fs::read_to_string(VERSION_SIGNATURE) {
            return Self::from_version_signature(&signature);
        }
        let utsname = uname().context("calling uname()")?;
        let release = utsname
            .release()
            .to_str()
            .context("kernel release is not valid utf8")?;
        release.parse()
    }

    /// Format: `Ubuntu 5.4.0-12.15-generic 5.4.8`.
    fn from_version_signature(value: &str) -> Result<Self> {
        value
            .split_whitespace()
            .nth(2)
            .with_context(|| format!("invalid version signature: {value}"))?
            .parse()
    }

    /// Encoding of the `KERNEL_VERSION()` kernel macro.
    pub fn code(&self) -> u32 {
        (self.major << 16) + (self.minor << 8) + self.patch.min(255)
    }
}

impl FromStr for KernelVersion {
    type Err = anyhow::Error;

    /// Parse `major.minor.patch`, ignoring any suffix after the patch number.
    fn from_str(release: &str) -> Result<Self> {
        let mut parts = release.splitn(3, '.');
        let mut next = || -> Option<u32> {
            let part = parts.next()?;
            let digits = part
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(part.len());
            part[..digits].parse().ok()
        };
        match (next(), next(), next()) {
            (Some(major), Some(minor), Some(patch)) => Ok(Self::new(major, minor, patch)),
            _ => anyhow::bail!("invalid kernel release: {release}"),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_release() {
        assert_eq!(
            "6.1.8".parse::<KernelVersion>().unwrap(),
            KernelVersion::new(6, 1, 8)
        );
    }

    #[test]
    fn release_suffix() {
        assert_eq!(
            "6.1.8-arch1-1".parse::<KernelVersion>().unwrap(),
            KernelVersion::new(6, 1, 8)
        );
        assert_eq!(
            "5.15.79.1-microsoft-standard-WSL2"
                .parse::<KernelVersion>()
                .unwrap(),
            KernelVersion::new(5, 15, 79)
        );
    }

    #[test]
    fn missing_patch() {
        assert!("5.15".parse::<KernelVersion>().is_err());
    }

    #[test]
    fn ubuntu_signature() {
        assert_eq!(
            KernelVersion::from_version_signature("Ubuntu 5.4.0-12.15-generic 5.4.8\n").unwrap(),
            KernelVersion::new(5, 4, 8)
        );
    }

    #[test]
    fn version_code() {
        assert_eq!(KernelVersion::new(5, 17, 4).code(), 332036);
        assert!(KernelVersion::new(5, 4, 0) < KernelVersion::new(5, 13, 0));
    }
}
