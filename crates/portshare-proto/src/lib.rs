//! Session Broker Protocol Definitions
//!
//! This crate defines the core data model, control messages, and state-change
//! events shared between the broker control plane, the forwarder, and the
//! transport layer.

pub mod events;
pub mod messages;
pub mod session;

pub use events::SessionEvent;
pub use messages::{ConnectionDetails, ForwardRequest, ForwardResponse, TransportEndpoint, TunnelMessage};
pub use session::{
    CloseReason, ProjectMetadata, SessionState, SessionStats, SessionSummary, TunnelSession,
    Visibility,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u32 = 0;
