//! Kernel-facing building blocks shared by procsentinel crates: the table
//! registry, kernel symbol resolution, probe specifications, the aya-backed
//! program loader and the sources of raw kernel records.

mod bump_memlock_rlimit;
pub mod bpf_fs;
pub mod kernel_version;
pub mod parsing;
pub mod probe;
pub mod program;
pub mod record;
pub mod ring_buffer;
pub mod symbols;
pub mod table;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod time;

pub use bump_memlock_rlimit::bump_memlock_rlimit;
pub use probe::{AttachKind, KernelSymbol, ProbeAttacher, ProbeSpec};
pub use program::{BpfContext, Program, ProgramError};
pub use record::{RawEventRecord, RecordError, RecordSource, RecordTag};
pub use symbols::SymbolResolver;
pub use table::{Layout, ReadDiscipline, TableError, TableRegistry, TableSpec};

pub use aya;

/// Utility function to pretty print an error with its sources.
///
/// By default Rust won't print the source of an error message, so anyhow is
/// used as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

pub use nix::unistd::Pid;
