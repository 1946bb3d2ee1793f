//! Kernel timestamps.
//!
//! Probes stamp records with `bpf_ktime_get_ns()`, which reads
//! `CLOCK_MONOTONIC`. [`Timestamp`] keeps that raw value and converts it to
//! wall-clock time only when needed.

use std::{
    fmt,
    ops::Sub,
    time::{Duration, SystemTime},
};

use nix::time::{ClockId, clock_gettime};
use serde::{Deserialize, Serialize};

/// Nanoseconds since boot, as seen by the kernel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_raw(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Current monotonic time, comparable with timestamps generated by probes.
    pub fn now() -> Self {
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => Self(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64),
            Err(err) => {
                log::warn!("Error reading CLOCK_MONOTONIC: {err}");
                Self(0)
            }
        }
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_nanos(self.0.saturating_sub(rhs.0))
    }
}

/// Wall-clock conversion: `now - (monotonic_now - timestamp)`.
impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        let age = Timestamp::now() - ts;
        SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
