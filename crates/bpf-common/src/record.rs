//! Raw records emitted by kernel probes and the sources they are read from.
//!
//! Every record starts with a fixed header, followed by a payload whose
//! layout depends on the event code:
//!
//! ```text
//! hook_point: u16 | event_code: u16 | pid: u32 | timestamp: u64 | payload...
//! ```
//!
//! All fields are little-endian.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{Pid, time::Timestamp};

pub const RECORD_HEADER_SIZE: usize = 16;

/// Identifies who emitted a record and how to decode its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordTag {
    /// Index of the hook point in the registry.
    pub hook_point: u16,
    pub event_code: u16,
}

impl fmt::Display for RecordTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hook_point, self.event_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEventRecord {
    pub tag: RecordTag,
    pub pid: Pid,
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

impl RawEventRecord {
    pub fn new(tag: RecordTag, pid: Pid, timestamp: Timestamp, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            pid,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Parse a record as written by kernel code. The payload is copied.
    pub fn from_wire(mut data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated { len: data.len() });
        }
        let tag = RecordTag {
            hook_point: data.get_u16_le(),
            event_code: data.get_u16_le(),
        };
        let pid = Pid::from_raw(data.get_u32_le() as i32);
        let timestamp = Timestamp::from(data.get_u64_le());
        Ok(Self {
            tag,
            pid,
            timestamp,
            payload: Bytes::copy_from_slice(data),
        })
    }
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record shorter than its header ({len} bytes)")]
    Truncated { len: usize },
    #[error("record source closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A bounded, pollable stream of raw records.
#[async_trait]
pub trait RecordSource: Send {
    fn name(&self) -> &str;

    /// Wait until records are available, then append at most `max` of them to
    /// `batch`. Returns [`RecordError::Closed`] once the source is exhausted.
    ///
    /// Must be cancel safe: dropping the future loses no record.
    async fn fill_batch(
        &mut self,
        batch: &mut Vec<Result<RawEventRecord, RecordError>>,
        max: usize,
    ) -> Result<(), RecordError>;
}

/// Bounded in-process channel of records.
pub fn record_channel(capacity: usize) -> (RecordSender, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        RecordSender {
            tx,
            dropped: Default::default(),
        },
        ChannelSource { rx },
    )
}

/// Producer side of [`record_channel`]. Never blocks: records are dropped
/// when the channel is full.
#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Result<RawEventRecord, RecordError>>,
    dropped: Arc<AtomicU64>,
}

impl RecordSender {
    pub fn send(&self, record: Result<RawEventRecord, RecordError>) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("record channel full, dropping record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Parse and send a record in wire format.
    pub fn send_wire(&self, data: &[u8]) -> bool {
        self.send(RawEventRecord::from_wire(data))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct ChannelSource {
    rx: mpsc::Receiver<Result<RawEventRecord, RecordError>>,
}

#[async_trait]
impl RecordSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn fill_batch(
        &mut self,
        batch: &mut Vec<Result<RawEventRecord, RecordError>>,
        max: usize,
    ) -> Result<(), RecordError> {
        let first = self.rx.recv().await.ok_or(RecordError::Closed)?;
        let start = batch.len();
        batch.push(first);
        while batch.len() - start < max {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(hook_point: u16, event_code: u16, pid: u32, ts: u64, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&hook_point.to_le_bytes());
        data.extend_from_slice(&event_code.to_le_bytes());
        data.extend_from_slice(&pid.to_le_bytes());
        data.extend_from_slice(&ts.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn parse_header() {
        let record = RawEventRecord::from_wire(&wire(2, 3, 4242, 99, &[1, 2, 3])).unwrap();
        assert_eq!(
            record.tag,
            RecordTag {
                hook_point: 2,
                event_code: 3
            }
        );
        assert_eq!(record.pid, Pid::from_raw(4242));
        assert_eq!(record.timestamp, Timestamp::from_raw(99));
        assert_eq!(&record.payload[..], &[1, 2, 3]);
    }

    #[test]
    fn truncated_header() {
        assert!(matches!(
            RawEventRecord::from_wire(&[0; 10]),
            Err(RecordError::Truncated { len: 10 })
        ));
    }

    #[tokio::test]
    async fn channel_batches() {
        let (tx, mut source) = record_channel(8);
        for pid in 1..=5 {
            assert!(tx.send_wire(&wire(0, 1, pid, 0, &[])));
        }
        let mut batch = Vec::new();
        source.fill_batch(&mut batch, 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        batch.clear();
        source.fill_batch(&mut batch, 3).await.unwrap();
        let pids: Vec<_> = batch
            .iter()
            .map(|record| record.as_ref().unwrap().pid.as_raw())
            .collect();
        assert_eq!(pids, vec![4, 5]);

        drop(tx);
        batch.clear();
        assert!(matches!(
            source.fill_batch(&mut batch, 3).await,
            Err(RecordError::Closed)
        ));
    }

    #[test]
    fn full_channel_drops() {
        let (tx, _source) = record_channel(1);
        assert!(tx.send_wire(&wire(0, 1, 1, 0, &[])));
        assert!(!tx.send_wire(&wire(0, 1, 2, 0, &[])));
        assert_eq!(tx.dropped(), 1);
    }
}
