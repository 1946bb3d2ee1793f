//! Payload layouts written by the process probes.
//!
//! The payloads must be byte by byte re-interpretable, so variable length
//! data (file names, argument vectors) is appended after the fixed part and
//! referenced through a [`BufferIndex`]. Indexes are relative to the start
//! of the payload.

use bpf_common::{RawEventRecord, parsing::BufferIndex};
use bytes::Buf;
use sentinel_core::{
    DecodedEvent, EventDecoder, MalformedRecord, Payload,
    decoder::{expect_min_size, expect_size},
};

/// `filename: BufferIndex<str> | argv: BufferIndex<[u8]> | argc: u32 | ppid: i32`
pub const EXEC_FIXED_SIZE: usize = 16;
/// `child: i32`
pub const FORK_SIZE: usize = 4;
/// `code: i64`, the raw argument of `do_exit`
pub const EXIT_SIZE: usize = 8;

pub struct ExecDecoder;

impl EventDecoder for ExecDecoder {
    fn event_type(&self) -> &'static str {
        "exec"
    }

    fn decode(
        &self,
        hook_point: &str,
        record: &RawEventRecord,
    ) -> Result<DecodedEvent, MalformedRecord> {
        expect_min_size("exec", record, EXEC_FIXED_SIZE)?;
        let mut fixed = &record.payload[..EXEC_FIXED_SIZE];
        let filename = BufferIndex::<str>::read(&mut fixed);
        let argv = BufferIndex::<[u8]>::read(&mut fixed);
        let argc = fixed.get_u32_le();
        let ppid = fixed.get_i32_le();

        let filename = filename
            .string(&record.payload)
            .map_err(|err| MalformedRecord::shape("exec", err))?;
        let argv = extract_parameters(
            argv.bytes(&record.payload)
                .map_err(|err| MalformedRecord::shape("exec", err))?,
        );
        if argv.len() != argc as usize {
            log::warn!(
                target: hook_point,
                "argc ({argc}) doesn't match argv ({argv:?}) for {}",
                record.pid
            );
        }

        Ok(DecodedEvent {
            hook_point: hook_point.to_string(),
            event_type: "exec",
            timestamp: record.timestamp,
            process_id: record.pid.as_raw(),
            payload: Payload::Exec {
                filename,
                argv,
                ppid,
            },
        })
    }
}

pub struct ForkDecoder;

impl EventDecoder for ForkDecoder {
    fn event_type(&self) -> &'static str {
        "fork"
    }

    /// Emitted by the parent on return, the payload holds the child pid.
    fn decode(
        &self,
        hook_point: &str,
        record: &RawEventRecord,
    ) -> Result<DecodedEvent, MalformedRecord> {
        expect_size("fork", record, FORK_SIZE)?;
        let child = (&record.payload[..]).get_i32_le();
        Ok(DecodedEvent {
            hook_point: hook_point.to_string(),
            event_type: "fork",
            timestamp: record.timestamp,
            process_id: child,
            payload: Payload::Fork {
                ppid: record.pid.as_raw(),
            },
        })
    }
}

pub struct ExitDecoder;

impl EventDecoder for ExitDecoder {
    fn event_type(&self) -> &'static str {
        "exit"
    }

    fn decode(
        &self,
        hook_point: &str,
        record: &RawEventRecord,
    ) -> Result<DecodedEvent, MalformedRecord> {
        expect_size("exit", record, EXIT_SIZE)?;
        let code = (&record.payload[..]).get_i64_le();
        Ok(DecodedEvent {
            hook_point: hook_point.to_string(),
            event_type: "exit",
            timestamp: record.timestamp,
            process_id: record.pid.as_raw(),
            payload: Payload::Exit {
                exit_code: ((code >> 8) & 0xff) as u32,
                signal: (code & 0x7f) as u32,
            },
        })
    }
}

/// Split a NUL separated argument vector.
fn extract_parameters(argv: &[u8]) -> Vec<String> {
    // The last byte is always a 0, keeping it would produce a trailing ""
    let argv = argv.strip_suffix(&[0]).unwrap_or(argv);
    if argv.is_empty() {
        return Vec::new();
    }
    argv.split(|byte| *byte == 0)
        .map(String::from_utf8_lossy)
        .map(String::from)
        .collect()
}
