//! Probe lifecycle: resolve, attach, roll back, detach.
//!
//! [`ProbeManager::attach_all`] walks the registry in declaration order. For
//! every attach kind a hook point needs, candidates are tried in order until
//! one resolves and attaches. A mandatory hook point left unsatisfied rolls
//! back everything attached so far; an optional one only its own probes.
//!
//! Probes are detached in strict reverse attach order.

use std::sync::{Arc, PoisonError, RwLock};

use bpf_common::{
    AttachKind, ProbeAttacher, ProgramError, SymbolResolver, TableError, TableRegistry,
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    error_chain,
    hook_point::{HookPoint, HookPointRegistry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProbeStatus {
    Attached,
    Failed,
    SkippedOptional,
}

/// Outcome of the attachment of a hook point probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachedProbe {
    pub hook_point: String,
    /// Resolved kernel symbol. Missing when no candidate could be resolved.
    pub symbol: Option<String>,
    pub kind: AttachKind,
    pub status: ProbeStatus,
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("mandatory hook point {hook_point} could not be attached")]
    MandatoryProbeAttach { hook_point: String },
    #[error("hook point {hook_point} uses an undeclared table")]
    UnknownTable {
        hook_point: String,
        #[source]
        source: TableError,
    },
    #[error("probes are already attached")]
    AlreadyAttached,
}

#[derive(Error, Debug)]
#[error("failed to detach {program} of {hook_point} from {symbol}")]
pub struct DetachError {
    pub hook_point: String,
    pub program: String,
    pub symbol: String,
    #[source]
    pub source: ProgramError,
}

#[derive(Debug, Default)]
pub struct DetachReport {
    pub detached: usize,
    pub failures: Vec<DetachError>,
}

impl DetachReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Read-only view of the probe status records, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ProbeStatusHandle {
    inner: Arc<RwLock<Vec<AttachedProbe>>>,
}

impl ProbeStatusHandle {
    pub fn snapshot(&self) -> Vec<AttachedProbe> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attached_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|probe| probe.status == ProbeStatus::Attached)
            .count()
    }

    /// Hook points skipped because they are optional and couldn't attach.
    pub fn degraded(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|probe| probe.status == ProbeStatus::SkippedOptional)
            .map(|probe| probe.hook_point.clone())
            .collect()
    }

    fn replace(&self, records: Vec<AttachedProbe>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = records;
    }

    fn update(&self, f: impl FnOnce(&mut Vec<AttachedProbe>)) {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

struct LiveProbe<L> {
    hook_point: String,
    program: String,
    symbol: String,
    kind: AttachKind,
    link: L,
}

pub struct ProbeManager<A: ProbeAttacher> {
    attacher: A,
    resolver: Box<dyn SymbolResolver>,
    /// In attach order.
    live: Vec<LiveProbe<A::Link>>,
    status: ProbeStatusHandle,
}

impl<A: ProbeAttacher> ProbeManager<A> {
    pub fn new(attacher: A, resolver: impl SymbolResolver + 'static) -> Self {
        Self {
            attacher,
            resolver: Box::new(resolver),
            live: Vec::new(),
            status: ProbeStatusHandle::default(),
        }
    }

    pub fn attach_all(
        &mut self,
        registry: &HookPointRegistry,
        tables: &TableRegistry,
    ) -> Result<(), AttachError> {
        if !self.live.is_empty() {
            return Err(AttachError::AlreadyAttached);
        }

        for hook_point in registry.all() {
            for table in hook_point.tables() {
                tables
                    .lookup(table)
                    .map_err(|source| AttachError::UnknownTable {
                        hook_point: hook_point.name().to_string(),
                        source,
                    })?;
            }
        }

        let mut records = Vec::new();
        for hook_point in registry.all() {
            let first = self.live.len();
            match self.attach_hook_point(hook_point) {
                Ok(()) => {
                    records.extend(self.live[first..].iter().map(|probe| AttachedProbe {
                        hook_point: probe.hook_point.clone(),
                        symbol: Some(probe.symbol.clone()),
                        kind: probe.kind,
                        status: ProbeStatus::Attached,
                    }));
                }
                Err(kind) if hook_point.is_optional() => {
                    log::warn!(
                        target: hook_point.name(),
                        "optional hook point {} unavailable: no {kind} candidate attached",
                        hook_point.name()
                    );
                    self.rollback(first);
                    records.push(AttachedProbe {
                        hook_point: hook_point.name().to_string(),
                        symbol: None,
                        kind,
                        status: ProbeStatus::SkippedOptional,
                    });
                }
                Err(kind) => {
                    log::error!(
                        target: hook_point.name(),
                        "mandatory hook point {} failed: no {kind} candidate attached",
                        hook_point.name()
                    );
                    self.rollback(0);
                    self.status.replace(vec![AttachedProbe {
                        hook_point: hook_point.name().to_string(),
                        symbol: None,
                        kind,
                        status: ProbeStatus::Failed,
                    }]);
                    return Err(AttachError::MandatoryProbeAttach {
                        hook_point: hook_point.name().to_string(),
                    });
                }
            }
        }

        self.status.replace(records);
        Ok(())
    }

    /// Attach every kind needed by the hook point. Returns the first kind
    /// with no working candidate.
    fn attach_hook_point(&mut self, hook_point: &HookPoint) -> Result<(), AttachKind> {
        for kind in hook_point.required_kinds() {
            if !self.attach_kind(hook_point, kind) {
                return Err(kind);
            }
        }
        Ok(())
    }

    fn attach_kind(&mut self, hook_point: &HookPoint, kind: AttachKind) -> bool {
        let target = hook_point.name();
        for probe in hook_point.candidates(kind) {
            let Some(symbol) = probe.symbol.resolve(self.resolver.as_ref()) else {
                log::debug!(target: target, "{} not found in the running kernel", probe.symbol);
                continue;
            };
            let program = probe.program_name(target);
            match self.attacher.attach(&program, kind, &symbol) {
                Ok(link) => {
                    log::debug!(target: target, "{kind} {program} attached to {symbol}");
                    self.live.push(LiveProbe {
                        hook_point: target.to_string(),
                        program,
                        symbol,
                        kind,
                        link,
                    });
                    return true;
                }
                Err(err) => {
                    log::warn!(
                        target: target,
                        "{kind} {program} on {symbol}: {}",
                        error_chain(&err)
                    );
                }
            }
        }
        false
    }

    /// Detach probes attached after position `from`, newest first.
    fn rollback(&mut self, from: usize) {
        while self.live.len() > from {
            if let Some(probe) = self.live.pop() {
                if let Err(err) = self.detach_probe(probe) {
                    log::warn!("rollback: {}", error_chain(&err));
                }
            }
        }
    }

    fn detach_probe(&mut self, probe: LiveProbe<A::Link>) -> Result<(), DetachError> {
        let LiveProbe {
            hook_point,
            program,
            symbol,
            link,
            ..
        } = probe;
        match self.attacher.detach(link) {
            Ok(()) => {
                log::debug!(target: hook_point.as_str(), "{program} detached from {symbol}");
                Ok(())
            }
            Err(source) => Err(DetachError {
                hook_point,
                program,
                symbol,
                source,
            }),
        }
    }

    /// Detach every live probe, newest first. Failures are collected, never
    /// fatal. A second call has nothing left to detach.
    pub fn detach_all(&mut self) -> DetachReport {
        let mut report = DetachReport::default();
        while let Some(probe) = self.live.pop() {
            match self.detach_probe(probe) {
                Ok(()) => report.detached += 1,
                Err(err) => {
                    log::warn!("{}", error_chain(&err));
                    report.failures.push(err);
                }
            }
        }
        if report.detached > 0 || !report.failures.is_empty() {
            self.status
                .update(|records| records.retain(|probe| probe.status != ProbeStatus::Attached));
        }
        report
    }

    pub fn status(&self) -> Vec<AttachedProbe> {
        self.status.snapshot()
    }

    pub fn status_handle(&self) -> ProbeStatusHandle {
        self.status.clone()
    }

    pub fn degraded(&self) -> Vec<String> {
        self.status.degraded()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

impl<A: ProbeAttacher> Drop for ProbeManager<A> {
    fn drop(&mut self) {
        if !self.live.is_empty() {
            let report = self.detach_all();
            log::debug!("detached {} probe(s) on drop", report.detached);
        }
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::{
        KernelSymbol, Layout, TableSpec,
        table::MemoryTables,
        test_utils::{FakeKernel, FakeOp},
    };

    use super::*;
    use crate::capability::{CapabilityModel, CapabilitySet};

    fn registry(hook_points: Vec<HookPoint>) -> HookPointRegistry {
        HookPointRegistry::new(&CapabilityModel::default(), hook_points).unwrap()
    }

    fn fork() -> HookPoint {
        HookPoint::new("do_fork")
            .kretprobe(KernelSymbol::function("_do_fork"))
            .kretprobe(KernelSymbol::function("do_fork"))
            .any_event(CapabilitySet::empty())
    }

    fn exit() -> HookPoint {
        HookPoint::new("do_exit").kprobe(KernelSymbol::function("do_exit"))
    }

    fn manager(kernel: &FakeKernel) -> ProbeManager<FakeKernel> {
        ProbeManager::new(kernel.clone(), kernel.clone())
    }

    fn no_tables() -> TableRegistry {
        TableRegistry::new(MemoryTables::default())
    }

    #[test]
    fn first_resolved_candidate_wins() {
        let kernel = FakeKernel::with_symbols(["do_fork", "do_exit"]);
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![fork(), exit()]), &no_tables())
            .unwrap();
        assert_eq!(kernel.live_symbols(), vec!["do_fork", "do_exit"]);
        let status = manager.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].symbol.as_deref(), Some("do_fork"));
        assert!(status.iter().all(|p| p.status == ProbeStatus::Attached));
    }

    #[test]
    fn attach_failure_tries_next_candidate() {
        let kernel = FakeKernel::with_symbols(["_do_fork", "do_fork"]);
        kernel.refuse_attach("_do_fork");
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![fork()]), &no_tables())
            .unwrap();
        assert_eq!(kernel.live_symbols(), vec!["do_fork"]);
    }

    #[test]
    fn optional_skipped() {
        let kernel = FakeKernel::with_symbols(["do_exit"]);
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![fork().optional(), exit()]), &no_tables())
            .unwrap();
        assert_eq!(manager.degraded(), vec!["do_fork"]);
        assert_eq!(manager.status_handle().attached_count(), 1);
    }

    #[test]
    fn optional_partial_rollback() {
        // entry attaches, exit has no candidate
        let hook_point = HookPoint::new("tcp_connect")
            .kprobe(KernelSymbol::function("tcp_connect"))
            .kretprobe(KernelSymbol::function("tcp_connect_ret"))
            .optional();
        let kernel = FakeKernel::with_symbols(["tcp_connect", "do_exit"]);
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![exit(), hook_point]), &no_tables())
            .unwrap();
        assert_eq!(kernel.live_symbols(), vec!["do_exit"]);
        let status = manager.status();
        assert_eq!(status[1].status, ProbeStatus::SkippedOptional);
        assert_eq!(status[1].kind, AttachKind::Exit);
    }

    #[test]
    fn mandatory_rolls_back_everything() {
        let kernel = FakeKernel::with_symbols(["do_exit"]);
        let mut manager = manager(&kernel);
        let err = manager
            .attach_all(&registry(vec![exit(), fork()]), &no_tables())
            .unwrap_err();
        assert!(matches!(err, AttachError::MandatoryProbeAttach { hook_point } if hook_point == "do_fork"));
        assert!(kernel.live_symbols().is_empty());
        assert_eq!(
            manager.status(),
            vec![AttachedProbe {
                hook_point: "do_fork".to_string(),
                symbol: None,
                kind: AttachKind::Exit,
                status: ProbeStatus::Failed,
            }]
        );
        assert_eq!(manager.status_handle().attached_count(), 0);
    }

    #[test]
    fn detach_after_failed_attach() {
        let kernel = FakeKernel::with_symbols(["do_exit"]);
        let mut manager = manager(&kernel);
        assert!(
            manager
                .attach_all(&registry(vec![exit(), fork()]), &no_tables())
                .is_err()
        );
        let journal_len = kernel.journal().len();

        // the rollback already detached do_exit
        let report = manager.detach_all();
        assert_eq!(report.detached, 0);
        assert!(report.is_clean());
        assert_eq!(kernel.journal().len(), journal_len);
        assert!(kernel.live_symbols().is_empty());
    }

    #[test]
    fn unknown_table_attaches_nothing() {
        let kernel = FakeKernel::with_symbols(["do_exit"]);
        let mut manager = manager(&kernel);
        let err = manager
            .attach_all(&registry(vec![exit().table("exec_scratch")]), &no_tables())
            .unwrap_err();
        assert!(matches!(err, AttachError::UnknownTable { .. }));
        assert!(kernel.journal().is_empty());

        let mut tables = no_tables();
        tables
            .declare(TableSpec::new(
                "exec_scratch",
                Layout::new("u32", 4),
                Layout::new("struct exec_scratch", 4096),
                1,
            ))
            .unwrap();
        manager
            .attach_all(&registry(vec![exit().table("exec_scratch")]), &tables)
            .unwrap();
    }

    #[test]
    fn detach_reverse_order_and_idempotent() {
        let kernel = FakeKernel::with_symbols(["do_fork", "do_exit"]);
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![fork(), exit()]), &no_tables())
            .unwrap();
        assert!(matches!(
            manager.attach_all(&registry(vec![fork()]), &no_tables()),
            Err(AttachError::AlreadyAttached)
        ));

        let report = manager.detach_all();
        assert_eq!(report.detached, 2);
        assert!(report.is_clean());
        let detached: Vec<_> = kernel
            .journal()
            .into_iter()
            .filter_map(|op| match op {
                FakeOp::Detach { symbol, .. } => Some(symbol),
                _ => None,
            })
            .collect();
        assert_eq!(detached, vec!["do_exit", "do_fork"]);

        let journal_len = kernel.journal().len();
        let report = manager.detach_all();
        assert_eq!(report.detached, 0);
        assert!(report.is_clean());
        assert_eq!(kernel.journal().len(), journal_len);
    }

    #[test]
    fn detach_failures_are_collected() {
        let kernel = FakeKernel::with_symbols(["do_fork", "do_exit"]);
        kernel.refuse_detach("do_fork");
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![fork(), exit()]), &no_tables())
            .unwrap();
        let report = manager.detach_all();
        assert_eq!(report.detached, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].hook_point, "do_fork");
        assert_eq!(manager.status_handle().attached_count(), 0);
    }

    #[test]
    fn drop_detaches() {
        let kernel = FakeKernel::with_symbols(["do_exit"]);
        let mut manager = manager(&kernel);
        manager
            .attach_all(&registry(vec![exit()]), &no_tables())
            .unwrap();
        drop(manager);
        assert!(kernel.live_symbols().is_empty());
    }
}
