//! Control messages exchanged with the owner's transport

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// A public HTTP request forwarded to the owner's local server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// HTTP method
    pub method: String,
    /// Request path and query
    pub path: String,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
}

/// The local server's response carried back over the reverse channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

/// Main tunnel protocol message enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TunnelMessage {
    // Control messages (Stream ID 0)
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    /// Owner's transport presents its credential to bind the reverse channel
    Connect {
        tunnel_id: String,
        credential: String,
    },
    /// Broker confirms the reverse channel is bound
    Connected {
        tunnel_id: String,
        public_url: String,
    },
    /// Either side announces teardown
    Disconnect {
        reason: String,
    },

    // Forwarded traffic
    Request {
        stream_id: u32,
        request: ForwardRequest,
    },
    Response {
        stream_id: u32,
        response: ForwardResponse,
    },

    // Long-lived viewer streams, counted against the tier cap
    ViewerOpen {
        stream_id: u32,
    },
    ViewerClose {
        stream_id: u32,
    },
}

/// Where the owner's transport should connect to establish the reverse channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct TransportEndpoint {
    /// Relay hostname
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Transport protocol name (e.g. "websocket")
    pub protocol: String,
}

impl TransportEndpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: protocol.into(),
        }
    }
}

/// Everything the owner needs to connect a session's transport
///
/// Only available while the session is not `closed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ConnectionDetails {
    /// Transport endpoint to dial
    pub endpoint: TransportEndpoint,
    /// Ephemeral transport credential
    pub credential: String,
    /// Local port the tunnel proxies to
    pub local_port: u16,
}
