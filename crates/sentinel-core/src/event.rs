use std::{fmt, time::SystemTime};

use bpf_common::time::Timestamp;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A kernel record decoded into a typed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedEvent {
    pub hook_point: String,
    pub event_type: &'static str,
    pub timestamp: Timestamp,
    pub process_id: i32,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, strum::IntoStaticStr)]
#[serde(tag = "type", content = "content")]
#[strum(serialize_all = "snake_case")]
pub enum Payload {
    Exec {
        filename: String,
        argv: Vec<String>,
        ppid: i32,
    },
    Fork {
        ppid: i32,
    },
    Exit {
        exit_code: u32,
        signal: u32,
    },
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Exec {
                filename,
                argv,
                ppid,
            } => write!(
                f,
                "Exec {{ filename: {filename}, argv: {}, ppid: {ppid} }}",
                argv.join(" ")
            ),
            Payload::Fork { ppid } => write!(f, "Fork {{ ppid: {ppid} }}"),
            Payload::Exit { exit_code, signal } => {
                write!(f, "Exit {{ exit_code: {exit_code}, signal: {signal} }}")
            }
        }
    }
}

impl fmt::Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::<Utc>::from(SystemTime::from(self.timestamp)).format("%Y-%m-%dT%TZ");
        let pid = self.process_id;
        let hook_point = &self.hook_point;
        let payload = &self.payload;
        if f.alternate() {
            write!(
                f,
                "[{time} \x1b[1;30;46mEVENT\x1b[0m ({pid})] [{hook_point}] {payload}"
            )
        } else {
            write!(f, "[{time} EVENT ({pid})] [{hook_point}] {payload}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_payload() {
        let payload = Payload::Exec {
            filename: "/bin/echo".to_string(),
            argv: vec!["echo".to_string(), "-n".to_string()],
            ppid: 1,
        };
        assert_eq!(
            payload.to_string(),
            "Exec { filename: /bin/echo, argv: echo -n, ppid: 1 }"
        );
        let name: &'static str = (&payload).into();
        assert_eq!(name, "exec");
    }

    #[test]
    fn display_event() {
        let event = DecodedEvent {
            hook_point: "do_fork".to_string(),
            event_type: "fork",
            timestamp: Timestamp::from_raw(10),
            process_id: 42,
            payload: Payload::Fork { ppid: 1 },
        };
        let text = event.to_string();
        assert!(text.ends_with("EVENT (42)] [do_fork] Fork { ppid: 1 }"), "{text}");
    }
}
