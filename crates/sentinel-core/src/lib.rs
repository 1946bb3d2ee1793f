//! Capability-gated kernel instrumentation.
//!
//! A module declares its hook points, the tables they share with the kernel
//! side and the decoders of the records they emit. [`subsystem::Subsystem`]
//! attaches the probes, drains raw records and delivers decoded events to
//! the consumers allowed to see them.

pub mod capability;
pub mod config;
pub mod decoder;
pub mod diagnostics;
pub mod dispatcher;
pub mod event;
pub mod hook_point;
pub mod manager;
pub mod shutdown;
pub mod subsystem;

pub use capability::{Capability, CapabilityModel, CapabilitySet, EventTypeSelector};
pub use decoder::{DecoderRegistry, EventDecoder, MalformedRecord};
pub use dispatcher::{Dispatcher, DispatcherConfig, DrainExit, EventHandler, SubscriptionHandle};
pub use event::{DecodedEvent, Payload};
pub use hook_point::{HookPoint, HookPointRegistry, RegistryError};
pub use manager::{AttachError, AttachedProbe, ProbeManager, ProbeStatus};
pub use subsystem::{ShutdownReport, Subsystem};

/// Render an error followed by its sources, separated by `: `.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
