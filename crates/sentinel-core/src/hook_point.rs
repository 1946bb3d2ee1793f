//! Static catalog of the kernel locations to instrument.

use std::{borrow::Cow, collections::HashMap};

use bpf_common::{AttachKind, KernelSymbol, ProbeSpec};
use serde::Serialize;
use thiserror::Error;

use crate::capability::{Capability, CapabilityModel, CapabilitySet, EventCapabilities, EventTypeSelector};

/// A named kernel location and the probes that can instrument it.
///
/// Built with a builder:
///
/// ```
/// # use bpf_common::KernelSymbol;
/// # use sentinel_core::{capability::CapabilitySet, hook_point::HookPoint};
/// let hook_point = HookPoint::new("do_fork")
///     .kretprobe(KernelSymbol::function("_do_fork"))
///     .kretprobe(KernelSymbol::function("do_fork"))
///     .any_event(CapabilitySet::empty());
/// assert!(!hook_point.is_optional());
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct HookPoint {
    name: Cow<'static, str>,
    probes: Vec<ProbeSpec>,
    event_types: EventCapabilities,
    tables: Vec<Cow<'static, str>>,
    optional: bool,
}

impl HookPoint {
    pub fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            probes: Vec::new(),
            event_types: EventCapabilities::default(),
            tables: Vec::new(),
            optional: false,
        }
    }

    pub fn kprobe(self, symbol: KernelSymbol) -> Self {
        self.probe(ProbeSpec::entry(symbol))
    }

    pub fn kretprobe(self, symbol: KernelSymbol) -> Self {
        self.probe(ProbeSpec::exit(symbol))
    }

    /// Add a candidate probe. Candidates of the same kind are tried in order.
    pub fn probe(mut self, probe: ProbeSpec) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn event_type(mut self, selector: EventTypeSelector, capabilities: CapabilitySet) -> Self {
        self.event_types.insert(selector, capabilities);
        self
    }

    /// Requirements for every event type emitted by this hook point.
    pub fn any_event(self, capabilities: CapabilitySet) -> Self {
        self.event_type(EventTypeSelector::Any, capabilities)
    }

    pub fn table(mut self, name: &'static str) -> Self {
        self.tables.push(Cow::Borrowed(name));
        self
    }

    /// Failing to attach this hook point doesn't prevent start-up.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn probes(&self) -> &[ProbeSpec] {
        &self.probes
    }

    pub fn event_types(&self) -> &EventCapabilities {
        &self.event_types
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|table| table.as_ref())
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    /// Attach kinds which must be satisfied, in order of first declaration.
    pub fn required_kinds(&self) -> Vec<AttachKind> {
        let mut kinds = Vec::with_capacity(2);
        for probe in &self.probes {
            if !kinds.contains(&probe.kind) {
                kinds.push(probe.kind);
            }
        }
        kinds
    }

    pub fn candidates(&self, kind: AttachKind) -> impl Iterator<Item = &ProbeSpec> {
        self.probes.iter().filter(move |probe| probe.kind == kind)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown hook point {0}")]
    UnknownHookPoint(String),
    #[error("hook point {0} declared twice")]
    DuplicateHookPoint(String),
    #[error("hook point {0} has no probes")]
    EmptyProbeList(String),
    #[error("hook point {hook_point} requires undeclared capability {capability}")]
    UnknownCapability {
        hook_point: String,
        capability: Capability,
    },
    #[error("too many hook points ({0})")]
    TooManyHookPoints(usize),
}

/// Immutable, ordered catalog of hook points.
///
/// The position of a hook point is its id in record tags.
#[derive(Debug)]
pub struct HookPointRegistry {
    hook_points: Vec<HookPoint>,
    index: HashMap<String, u16>,
}

impl HookPointRegistry {
    pub fn new(model: &CapabilityModel, hook_points: Vec<HookPoint>) -> Result<Self, RegistryError> {
        if hook_points.len() > u16::MAX as usize + 1 {
            return Err(RegistryError::TooManyHookPoints(hook_points.len()));
        }

        let mut index = HashMap::with_capacity(hook_points.len());
        for (id, hook_point) in hook_points.iter().enumerate() {
            if hook_point.probes.is_empty() {
                return Err(RegistryError::EmptyProbeList(hook_point.name().to_string()));
            }
            for (_, capabilities) in hook_point.event_types.iter() {
                model
                    .validate(capabilities)
                    .map_err(|capability| RegistryError::UnknownCapability {
                        hook_point: hook_point.name().to_string(),
                        capability,
                    })?;
            }
            if index
                .insert(hook_point.name().to_string(), id as u16)
                .is_some()
            {
                return Err(RegistryError::DuplicateHookPoint(
                    hook_point.name().to_string(),
                ));
            }
        }

        Ok(Self { hook_points, index })
    }

    /// Hook points in declaration order.
    pub fn all(&self) -> &[HookPoint] {
        &self.hook_points
    }

    pub fn get(&self, name: &str) -> Result<&HookPoint, RegistryError> {
        self.id_of(name)
            .and_then(|id| self.by_id(id))
            .ok_or_else(|| RegistryError::UnknownHookPoint(name.to_string()))
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.index.get(name).copied()
    }

    pub fn by_id(&self, id: u16) -> Option<&HookPoint> {
        self.hook_points.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.hook_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hook_points.is_empty()
    }
}
