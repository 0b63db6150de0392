//! Reverse proxy forwarder
//!
//! Routes inbound public requests to the owning session's reverse channel,
//! applying viewer admission for long-lived viewer connections and keeping
//! the in-flight accounting that teardown drains against.

pub mod forwarder;

pub use forwarder::{ForwardError, Forwarder, ForwarderConfig, ViewerTicket};
