//! Turn raw records into [`DecodedEvent`]s.

use std::{collections::HashMap, sync::Arc};

use bpf_common::{RawEventRecord, parsing::IndexError};
use thiserror::Error;

use crate::event::DecodedEvent;

/// Why a record was dropped instead of being dispatched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("unknown hook point id {0}")]
    UnknownHookPoint(u16),
    #[error("unknown event code {0}")]
    UnknownEventCode(u16),
    #[error("event type {event_type} is not declared by hook point {hook_point}")]
    UndeclaredEventType {
        hook_point: String,
        event_type: &'static str,
    },
    #[error("{event_type} payload is {actual} bytes, expected {expected}")]
    SizeMismatch {
        event_type: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid {event_type} payload: {reason}")]
    Shape {
        event_type: &'static str,
        reason: String,
    },
    #[error("unreadable record: {0}")]
    Unreadable(String),
}

impl MalformedRecord {
    pub fn shape(event_type: &'static str, err: IndexError) -> Self {
        Self::Shape {
            event_type,
            reason: err.to_string(),
        }
    }
}

/// Decodes the payload layout identified by one event code.
pub trait EventDecoder: Send + Sync {
    fn event_type(&self) -> &'static str;

    fn decode(&self, hook_point: &str, record: &RawEventRecord)
    -> Result<DecodedEvent, MalformedRecord>;
}

/// Fail unless the payload has exactly `expected` bytes.
pub fn expect_size(
    event_type: &'static str,
    record: &RawEventRecord,
    expected: usize,
) -> Result<(), MalformedRecord> {
    if record.payload.len() != expected {
        return Err(MalformedRecord::SizeMismatch {
            event_type,
            expected,
            actual: record.payload.len(),
        });
    }
    Ok(())
}

/// Fail unless the payload has at least `minimum` bytes.
pub fn expect_min_size(
    event_type: &'static str,
    record: &RawEventRecord,
    minimum: usize,
) -> Result<(), MalformedRecord> {
    if record.payload.len() < minimum {
        return Err(MalformedRecord::SizeMismatch {
            event_type,
            expected: minimum,
            actual: record.payload.len(),
        });
    }
    Ok(())
}

#[derive(Default, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<u16, Arc<dyn EventDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for `event_code`, returning the one it replaces.
    pub fn register(
        &mut self,
        event_code: u16,
        decoder: impl EventDecoder + 'static,
    ) -> Option<Arc<dyn EventDecoder>> {
        self.decoders.insert(event_code, Arc::new(decoder))
    }

    pub fn with(mut self, event_code: u16, decoder: impl EventDecoder + 'static) -> Self {
        self.register(event_code, decoder);
        self
    }

    pub fn get(&self, event_code: u16) -> Option<&Arc<dyn EventDecoder>> {
        self.decoders.get(&event_code)
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::{Pid, RecordTag, time::Timestamp};

    use super::*;
    use crate::event::Payload;

    struct ForkDecoder;

    impl EventDecoder for ForkDecoder {
        fn event_type(&self) -> &'static str {
            "fork"
        }

        fn decode(
            &self,
            hook_point: &str,
            record: &RawEventRecord,
        ) -> Result<DecodedEvent, MalformedRecord> {
            expect_size("fork", record, 4)?;
            Ok(DecodedEvent {
                hook_point: hook_point.to_string(),
                event_type: "fork",
                timestamp: record.timestamp,
                process_id: i32::from_le_bytes([
                    record.payload[0],
                    record.payload[1],
                    record.payload[2],
                    record.payload[3],
                ]),
                payload: Payload::Fork {
                    ppid: record.pid.as_raw(),
                },
            })
        }
    }

    fn record(payload: &'static [u8]) -> RawEventRecord {
        RawEventRecord::new(
            RecordTag {
                hook_point: 0,
                event_code: 2,
            },
            Pid::from_raw(100),
            Timestamp::from_raw(1),
            payload,
        )
    }

    #[test]
    fn registry_lookup() {
        let registry = DecoderRegistry::new().with(2, ForkDecoder);
        assert_eq!(registry.get(2).unwrap().event_type(), "fork");
        assert!(registry.get(3).is_none());
    }

    #[test]
    fn size_check() {
        let decoder = ForkDecoder;
        let event = decoder.decode("do_fork", &record(&[101, 0, 0, 0])).unwrap();
        assert_eq!(event.process_id, 101);
        assert_eq!(
            decoder.decode("do_fork", &record(&[1, 0])).unwrap_err(),
            MalformedRecord::SizeMismatch {
                event_type: "fork",
                expected: 4,
                actual: 2
            }
        );
    }
}
