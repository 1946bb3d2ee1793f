//! Make sure the BPF file system is available for pinning tables.

use std::{
    fs::DirBuilder,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use procfs::process::Process;
use sys_mount::Mount;

pub const BPF_FS_PATH: &str = "/sys/fs/bpf";
const BPF: &str = "bpf";

/// Mount bpffs on `/sys/fs/bpf` when missing, then create `pin_path` inside it.
pub fn check_or_mount_bpf_fs(pin_path: &Path) -> Result<()> {
    let mount_point = Path::new(BPF_FS_PATH);
    match bpf_fs_mounts(mount_point)? {
        0 => mount_bpf_fs(mount_point)?,
        1 => {}
        _ => bail!("Multiple bpf fs mounts detected on {BPF_FS_PATH}"),
    }

    if !pin_path.starts_with(mount_point) {
        log::warn!(
            "Pin path {} is outside {BPF_FS_PATH}, tables won't be pinned",
            pin_path.display()
        );
    }
    create_dir(pin_path)
}

/// Number of bpffs mounts on `mount_point`. Fails if something else is mounted there.
fn bpf_fs_mounts(mount_point: &Path) -> Result<usize> {
    let mounts = Process::myself()
        .context("Error accessing /proc/self")?
        .mountinfo()
        .context("Error accessing process mount info")?;

    let mut count = 0;
    for mount in mounts.into_iter().filter(|mount| mount.mount_point == mount_point) {
        if mount.fs_type != BPF {
            bail!(
                "{} is mounted with type {} instead of {BPF}",
                mount_point.display(),
                mount.fs_type
            );
        }
        if mount.root == "/" {
            count += 1;
        }
    }
    Ok(count)
}

fn mount_bpf_fs(mount_point: &Path) -> Result<()> {
    create_dir(mount_point)?;
    log::debug!("Mounting BPF file system on {}", mount_point.display());
    Mount::builder()
        .fstype(BPF)
        .mount(BPF, mount_point)
        .context("Failed to mount BPF file system")?;
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        bail!("'{}' already exists and is not a directory", path.display());
    }
    log::debug!("Creating {}", path.display());
    DirBuilder::new()
        .mode(0o755)
        .recursive(true)
        .create(path)
        .with_context(|| format!("Error creating {}", path.display()))
}

/// Location of a pinned table.
pub fn pinned_path(pin_path: &Path, table: &str) -> PathBuf {
    pin_path.join(table)
}
