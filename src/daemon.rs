use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use bpf_common::{
    BpfContext, Program, TableRegistry, bpf_fs, program::AyaAttacher, symbols::Kallsyms,
};
use nix::unistd::geteuid;
use process_monitor::MODULE_NAME;
use sentinel_core::{
    CapabilitySet, DecodedEvent, DrainExit, ProbeManager, ShutdownReport, Subsystem,
};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    config::{GeneralConfig, SentinelConfig},
    term_print::TermPrintable,
};

/// Print the catalog. Needs neither privileges nor a kernel object.
pub fn catalog() -> Result<()> {
    let registry = process_monitor::catalog().context("Error building hook point catalog")?;
    registry.term_print()?;
    process_monitor::tables().term_print()?;
    Ok(())
}

/// Attach every probe, print their status and detach.
pub async fn check(config: &SentinelConfig) -> Result<()> {
    let general = config.general()?;
    let (program, subsystem) = start(&general).await?;

    subsystem.status().term_print()?;
    let report = subsystem.shutdown().await;
    report_shutdown(report);
    drop(program);
    Ok(())
}

/// Stream events to stdout until SIGINT, SIGTERM or SIGHUP.
pub async fn run(config: &SentinelConfig, json: bool) -> Result<()> {
    let general = config.general()?;
    let capabilities: CapabilitySet = config
        .section(MODULE_NAME)
        .get_list::<String>("capabilities")?
        .into_iter()
        .collect();
    let (program, subsystem) = start(&general).await?;

    let consumer = subsystem
        .dispatcher()
        .subscribe(capabilities, move |event: Arc<DecodedEvent>| {
            if json {
                match serde_json::to_string(&*event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => log::error!("Error serializing event: {err}"),
                }
            } else {
                println!("{event:#}");
            }
        });
    log::debug!("printing events as consumer {consumer}");

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
        _ = sig_hup.recv() => log::trace!("SIGHUP received"),
    }

    log::info!("Terminating procsentinel...");
    let diagnostics = subsystem.diagnostics();
    let report = subsystem.shutdown().await;
    report_shutdown(report);
    drop(program);
    diagnostics.term_print()?;
    Ok(())
}

fn privileged_setup(general: &GeneralConfig) -> Result<()> {
    ensure!(geteuid().is_root(), "You must run this as root user!!!");

    bpf_fs::check_or_mount_bpf_fs(&general.pin_path)?;

    bpf_common::bump_memlock_rlimit()?;
    Ok(())
}

/// Load the probe object and start the subsystem on its ring buffer.
///
/// The returned program owns the kernel object and must outlive the
/// subsystem.
async fn start(general: &GeneralConfig) -> Result<(Program, Subsystem<AyaAttacher>)> {
    privileged_setup(general)?;

    let ctx = BpfContext::new(&general.object_path, &general.pin_path);
    let mut program = process_monitor::program(ctx)
        .await
        .with_context(|| format!("Error loading {}", general.object_path.display()))?;

    let registry = Arc::new(process_monitor::catalog()?);
    let mut tables = TableRegistry::new(program.tables());
    process_monitor::declare_tables(&mut tables).context("Error declaring tables")?;

    let kallsyms = tokio::task::spawn_blocking(Kallsyms::load)
        .await?
        .context("Error reading /proc/kallsyms")?;
    log::debug!("{} kernel symbols available", kallsyms.len());
    let manager = ProbeManager::new(program.attacher(), kallsyms);

    let source = program.ring_buffer(&general.ring_buffer)?;
    let dispatcher = process_monitor::dispatcher(registry.clone(), general.dispatcher);

    let subsystem = Subsystem::start(registry, tables, manager, dispatcher, Box::new(source))?;
    Ok((program, subsystem))
}

fn report_shutdown(report: ShutdownReport) {
    match report.drain {
        DrainExit::SourceFailed(err) => bpf_common::log_error("Error reading records", err),
        DrainExit::Aborted(err) => bpf_common::log_error("Event drain task failed", err),
        DrainExit::Shutdown | DrainExit::SourceClosed => {}
    }
    for failure in report.detach.failures {
        bpf_common::log_error("Error detaching probe", failure);
    }
    for failure in report.table_failures {
        bpf_common::log_error("Error releasing table", failure);
    }
}
