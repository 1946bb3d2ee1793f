//! Kernel symbol resolution.
//!
//! Probes are declared against symbol names which may or may not exist on the
//! running kernel. A [`SymbolResolver`] answers whether a name is present and
//! at which address. [`Kallsyms`] is the production resolver, backed by
//! `/proc/kallsyms`.

use std::{collections::HashMap, fs, io, path::Path};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Resolve a kernel symbol name to its address.
///
/// Closures `Fn(&str) -> Option<u64>` implement this trait, which makes it
/// easy to inject a fixed symbol set in tests.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<u64>;
}

impl<F> SymbolResolver for F
where
    F: Fn(&str) -> Option<u64> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<u64> {
        self(name)
    }
}

/// Snapshot of the text symbols exported by the running kernel.
#[derive(Debug, Default, Clone)]
pub struct Kallsyms {
    symbols: HashMap<String, u64>,
}

impl Kallsyms {
    pub fn load() -> io::Result<Self> {
        Self::load_from(KALLSYMS_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        let kallsyms = Self::parse(&content);
        log::debug!("loaded {} kernel text symbols", kallsyms.len());
        Ok(kallsyms)
    }

    /// Parse the kallsyms format: `<address> <type> <name> [module]`.
    ///
    /// Only function symbols (`t`, `T`, `w`, `W`) are kept: those are the
    /// only ones kprobes can attach to. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let symbols = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let addr = fields.next()?;
                let kind = fields.next()?;
                let name = fields.next()?;
                if !matches!(kind, "t" | "T" | "w" | "W") {
                    return None;
                }
                let addr = u64::from_str_radix(addr, 16).ok()?;
                Some((name.to_string(), addr))
            })
            .collect();
        Self { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for Kallsyms {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

/// Prefix used by syscall wrappers on the current architecture.
#[cfg(target_arch = "x86_64")]
const ARCH_SYSCALL_PREFIX: Option<&str> = Some("__x64_sys_");
#[cfg(target_arch = "aarch64")]
const ARCH_SYSCALL_PREFIX: Option<&str> = Some("__arm64_sys_");
#[cfg(target_arch = "riscv64")]
const ARCH_SYSCALL_PREFIX: Option<&str> = Some("__riscv_sys_");
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
const ARCH_SYSCALL_PREFIX: Option<&str> = None;

/// Kernel symbols which may implement the given syscall, most specific first.
///
/// Kernels built with syscall wrappers (4.17+) expose `__<arch>_sys_<name>`,
/// some expose `__se_sys_<name>`, older ones the plain `sys_<name>`.
pub fn syscall_candidates(name: &str) -> Vec<String> {
    ARCH_SYSCALL_PREFIX
        .into_iter()
        .chain(["__se_sys_", "sys_"])
        .map(|prefix| format!("{prefix}{name}"))
        .collect()
}
