//! Wiring of tables, probes and the dispatcher into one running unit.
//!
//! Startup order is tables, probes, drain task. Shutdown goes the other way:
//! the drain task stops first so no record is read after its probes are gone,
//! then probes are detached and finally tables are released.

use std::sync::Arc;

use bpf_common::{ProbeAttacher, RecordSource, TableError, TableRegistry};

use crate::{
    diagnostics::Diagnostics,
    dispatcher::{Dispatcher, DrainExit, DrainHandle, DrainState},
    error_chain,
    hook_point::HookPointRegistry,
    manager::{AttachError, AttachedProbe, DetachReport, ProbeManager},
};

/// Everything left behind by [`Subsystem::shutdown`].
#[derive(Debug)]
pub struct ShutdownReport {
    pub drain: DrainExit,
    pub detach: DetachReport,
    pub table_failures: Vec<TableError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drain.is_clean() && self.detach.is_clean() && self.table_failures.is_empty()
    }
}

pub struct Subsystem<A: ProbeAttacher> {
    // Field order is drop order: drain task, probes, tables.
    drain: Option<DrainHandle>,
    manager: ProbeManager<A>,
    tables: TableRegistry,
    registry: Arc<HookPointRegistry>,
    dispatcher: Dispatcher,
}

impl<A: ProbeAttacher> Subsystem<A> {
    /// Attach every hook point and start draining `source`.
    ///
    /// On failure nothing stays attached and the declared tables are released.
    pub fn start(
        registry: Arc<HookPointRegistry>,
        mut tables: TableRegistry,
        mut manager: ProbeManager<A>,
        dispatcher: Dispatcher,
        source: Box<dyn RecordSource>,
    ) -> Result<Self, AttachError> {
        if let Err(err) = manager.attach_all(&registry, &tables) {
            log::error!("{}", error_chain(&err));
            for failure in tables.teardown() {
                log::warn!("{}", error_chain(&failure));
            }
            return Err(err);
        }

        let degraded = manager.degraded();
        if !degraded.is_empty() {
            log::warn!("running degraded, unavailable: {}", degraded.join(", "));
        }
        log::info!(
            "{} probe(s) attached, draining {}",
            manager.live_count(),
            source.name()
        );

        let drain = dispatcher.spawn_drain(source);
        Ok(Self {
            drain: Some(drain),
            manager,
            tables,
            registry,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &HookPointRegistry {
        &self.registry
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    pub fn status(&self) -> Vec<AttachedProbe> {
        self.manager.status()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let counters = self.dispatcher.counters();
        Diagnostics {
            probes: self.manager.status(),
            degraded: self.manager.degraded(),
            decode_errors: counters.decode_errors,
            dispatched: counters.dispatched,
            consumers: self.dispatcher.consumer_stats(),
            drain: self
                .drain
                .as_ref()
                .map_or(DrainState::Stopped, DrainHandle::state),
        }
    }

    pub async fn shutdown(mut self) -> ShutdownReport {
        let drain = match self.drain.take() {
            Some(drain) => drain.stop().await,
            None => DrainExit::Shutdown,
        };
        log::debug!("drain task exited: {drain}");
        let detach = self.manager.detach_all();
        let table_failures = self.tables.teardown();
        log::info!("{} probe(s) detached", detach.detached);
        ShutdownReport {
            drain,
            detach,
            table_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bpf_common::{
        KernelSymbol, Layout, Pid, RawEventRecord, RecordTag, TableSpec,
        record::record_channel,
        table::{MemoryTables, TableLedger},
        test_utils::FakeKernel,
        time::Timestamp,
    };

    use super::*;
    use crate::{
        capability::{CapabilityModel, CapabilitySet},
        decoder::{DecoderRegistry, EventDecoder, MalformedRecord, expect_size},
        dispatcher::DispatcherConfig,
        event::{DecodedEvent, Payload},
        hook_point::HookPoint,
    };

    struct Exit;

    impl EventDecoder for Exit {
        fn event_type(&self) -> &'static str {
            "exit"
        }

        fn decode(
            &self,
            hook_point: &str,
            record: &RawEventRecord,
        ) -> Result<DecodedEvent, MalformedRecord> {
            expect_size("exit", record, 0)?;
            Ok(DecodedEvent {
                hook_point: hook_point.to_string(),
                event_type: "exit",
                timestamp: record.timestamp,
                process_id: record.pid.as_raw(),
                payload: Payload::Exit {
                    exit_code: 0,
                    signal: 0,
                },
            })
        }
    }

    fn setup(
        kernel: &FakeKernel,
        backend: &MemoryTables,
    ) -> (Arc<HookPointRegistry>, TableRegistry, ProbeManager<FakeKernel>, Dispatcher) {
        let model = Arc::new(CapabilityModel::default());
        let registry = Arc::new(
            HookPointRegistry::new(
                &model,
                vec![
                    HookPoint::new("do_exit")
                        .kprobe(KernelSymbol::function("do_exit"))
                        .table("scratch")
                        .any_event(CapabilitySet::empty()),
                ],
            )
            .unwrap(),
        );
        let mut tables = TableRegistry::new(backend.clone());
        tables
            .declare(TableSpec::new(
                "scratch",
                Layout::new("u32", 4),
                Layout::new("u64", 8),
                16,
            ))
            .unwrap();
        let dispatcher = Dispatcher::new(
            registry.clone(),
            model,
            DecoderRegistry::new().with(3, Exit),
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let manager = ProbeManager::new(kernel.clone(), kernel.clone());
        (registry, tables, manager, dispatcher)
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let kernel = FakeKernel::with_symbols(["do_exit"]);
        let backend = MemoryTables::default();
        let (registry, tables, manager, dispatcher) = setup(&kernel, &backend);
        let (tx, source) = record_channel(8);

        let subsystem =
            Subsystem::start(registry, tables, manager, dispatcher, Box::new(source)).unwrap();
        assert_eq!(kernel.live_symbols(), vec!["do_exit"]);

        tx.send(Ok(RawEventRecord::new(
            RecordTag {
                hook_point: 0,
                event_code: 3,
            },
            Pid::from_raw(42),
            Timestamp::from_raw(1),
            Vec::new(),
        )));
        for _ in 0..100 {
            if subsystem.diagnostics().dispatched == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let diagnostics = subsystem.diagnostics();
        assert_eq!(diagnostics.dispatched, 1);
        assert_eq!(diagnostics.probes.len(), 1);
        assert!(diagnostics.degraded.is_empty());

        let report = subsystem.shutdown().await;
        assert!(report.is_clean());
        assert!(matches!(report.drain, DrainExit::Shutdown));
        assert_eq!(report.detach.detached, 1);
        assert!(kernel.live_symbols().is_empty());
        assert_eq!(
            backend.ledger(),
            TableLedger {
                live: vec![],
                released: vec!["scratch".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn failed_start_releases_tables() {
        let kernel = FakeKernel::with_symbols(Vec::<&str>::new());
        let backend = MemoryTables::default();
        let (registry, tables, manager, dispatcher) = setup(&kernel, &backend);
        let (_tx, source) = record_channel(8);

        let err = Subsystem::start(registry, tables, manager, dispatcher, Box::new(source))
            .err()
            .unwrap();
        assert!(matches!(err, AttachError::MandatoryProbeAttach { .. }));
        assert!(kernel.live_symbols().is_empty());
        assert!(backend.ledger().live.is_empty());
        assert_eq!(backend.ledger().released, vec!["scratch"]);
    }
}
