use std::fmt;

use serde::Serialize;

use crate::{
    dispatcher::{ConsumerStats, DrainState},
    manager::{AttachedProbe, ProbeStatus},
};

/// Point-in-time view of the subsystem health.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub probes: Vec<AttachedProbe>,
    pub degraded: Vec<String>,
    pub decode_errors: u64,
    pub dispatched: u64,
    pub consumers: Vec<ConsumerStats>,
    pub drain: DrainState,
}

impl Diagnostics {
    pub fn dropped(&self) -> u64 {
        self.consumers.iter().map(|consumer| consumer.dropped).sum()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached = self
            .probes
            .iter()
            .filter(|probe| probe.status == ProbeStatus::Attached)
            .count();
        writeln!(f, "probes attached: {attached}")?;
        if !self.degraded.is_empty() {
            writeln!(f, "degraded hook points: {}", self.degraded.join(", "))?;
        }
        writeln!(f, "events dispatched: {}", self.dispatched)?;
        writeln!(f, "malformed records: {}", self.decode_errors)?;
        for consumer in &self.consumers {
            writeln!(
                f,
                "consumer {} [{}]: delivered {}, dropped {}",
                consumer.handle, consumer.capabilities, consumer.delivered, consumer.dropped
            )?;
        }
        write!(f, "drain: {}", self.drain)
    }
}
