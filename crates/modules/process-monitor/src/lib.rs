//! Process lifecycle monitoring: exec, fork and exit.

use std::sync::Arc;

use bpf_common::{
    KernelSymbol, Layout, Program, ProgramError, ReadDiscipline, TableError, TableRegistry,
    TableSpec, program::BpfContext,
};
use sentinel_core::{
    CapabilityModel, CapabilitySet, DecoderRegistry, Dispatcher, DispatcherConfig, HookPoint,
    HookPointRegistry, RegistryError,
};

pub mod decode;

use decode::{ExecDecoder, ExitDecoder, ForkDecoder};

pub const MODULE_NAME: &str = "process-monitor";

/// Capability held by consumers of process events.
pub const PROCESS_MONITORING: &str = "process-monitoring";

pub const EXEC_SCRATCH: &str = "exec_scratch";

/// Event codes written in the tag of every record.
pub mod event_code {
    pub const EXEC: u16 = 1;
    pub const FORK: u16 = 2;
    pub const EXIT: u16 = 3;
}

pub fn capability_model() -> CapabilityModel {
    CapabilityModel::new([PROCESS_MONITORING])
}

/// Hook points in declaration order. The position of a hook point is the
/// id kernel code writes in its records.
pub fn hook_points() -> Vec<HookPoint> {
    vec![
        HookPoint::new("sys_execve")
            .kprobe(KernelSymbol::syscall("execve"))
            .table(EXEC_SCRATCH)
            .any_event(CapabilitySet::empty()),
        // missing on some architectures and old kernels
        HookPoint::new("sys_execveat")
            .kprobe(KernelSymbol::syscall("execveat"))
            .table(EXEC_SCRATCH)
            .any_event(CapabilitySet::empty())
            .optional(),
        // renamed to kernel_clone in 5.10, _do_fork before that
        HookPoint::new("do_fork")
            .kretprobe(KernelSymbol::function("kernel_clone"))
            .kretprobe(KernelSymbol::function("_do_fork"))
            .kretprobe(KernelSymbol::function("do_fork"))
            .any_event(CapabilitySet::empty()),
        // do_exit never returns
        HookPoint::new("do_exit")
            .kprobe(KernelSymbol::function("do_exit"))
            .any_event(CapabilitySet::empty()),
    ]
}

pub fn catalog() -> Result<HookPointRegistry, RegistryError> {
    HookPointRegistry::new(&capability_model(), hook_points())
}

pub fn tables() -> Vec<TableSpec> {
    vec![
        TableSpec::new(
            EXEC_SCRATCH,
            Layout::new("u32", 4),
            Layout::new("struct exec_scratch", 4096),
            1024,
        )
        .with_read_discipline(ReadDiscipline::Snapshot),
    ]
}

pub fn declare_tables(registry: &mut TableRegistry) -> Result<(), TableError> {
    for table in tables() {
        registry.declare(table)?;
    }
    Ok(())
}

pub fn decoders() -> DecoderRegistry {
    DecoderRegistry::new()
        .with(event_code::EXEC, ExecDecoder)
        .with(event_code::FORK, ForkDecoder)
        .with(event_code::EXIT, ExitDecoder)
}

pub fn dispatcher(registry: Arc<HookPointRegistry>, config: DispatcherConfig) -> Dispatcher {
    Dispatcher::new(
        registry,
        Arc::new(capability_model()),
        decoders(),
        config,
    )
}

/// Load the pre-built probe object.
pub async fn program(ctx: BpfContext) -> Result<Program, ProgramError> {
    log::debug!(
        target: MODULE_NAME,
        "loading {} for kernel {}",
        ctx.object_path().display(),
        ctx.kernel_version()
    );
    Program::load(ctx).await
}
