use anyhow::{Context, Result};
use nix::sys::resource::{RLIM_INFINITY, Resource, setrlimit};

/// Lift the memlock limit. Kernels before 5.11 charge BPF maps against it.
pub fn bump_memlock_rlimit() -> Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .context("Failed to increase memlock rlimit")
}
