//! Broker error taxonomy
//!
//! Every failure of a control-plane operation is reported synchronously to
//! the caller as one of these variants. Internal inconsistencies (e.g. a
//! viewer count about to go negative) are clamped and logged instead.

use portshare_auth::CredentialError;
use portshare_proto::SessionState;
use portshare_router::AllocatorError;
use thiserror::Error;

/// Errors returned by broker control-plane operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Project '{project}' already has a live session for this owner")]
    Conflict { project: String },

    #[error("Concurrent session capacity reached")]
    ResourceExhausted,

    #[error("URL namespace exhausted for '{slug}' after {attempts} attempts")]
    AllocationExhausted { slug: String, attempts: usize },

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Requester does not own this tunnel")]
    Forbidden,

    #[error("Viewer limit reached (cap {cap})")]
    ViewerLimitExceeded { cap: u32 },

    #[error("Transport deadline exceeded: {0}")]
    TransportTimeout(String),

    #[error("Operation not valid while session is {state}")]
    InvalidState { state: SessionState },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<CredentialError> for BrokerError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::ResourceExhausted => BrokerError::ResourceExhausted,
            // A bad, expired, revoked, or mismatched credential is an
            // authorization failure from the caller's point of view.
            CredentialError::Encoding(_)
            | CredentialError::Expired
            | CredentialError::Revoked
            | CredentialError::TunnelMismatch => BrokerError::Forbidden,
        }
    }
}

impl From<AllocatorError> for BrokerError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::InvalidProjectName(msg) => BrokerError::InvalidArgument(msg),
            AllocatorError::AllocationExhausted { slug, attempts } => {
                BrokerError::AllocationExhausted { slug, attempts }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_error_mapping() {
        assert!(matches!(
            BrokerError::from(CredentialError::ResourceExhausted),
            BrokerError::ResourceExhausted
        ));
        assert!(matches!(
            BrokerError::from(CredentialError::Revoked),
            BrokerError::Forbidden
        ));
    }

    #[test]
    fn test_allocator_error_mapping() {
        let err = BrokerError::from(AllocatorError::AllocationExhausted {
            slug: "demo".to_string(),
            attempts: 8,
        });
        assert!(matches!(
            err,
            BrokerError::AllocationExhausted { attempts: 8, .. }
        ));

        assert!(matches!(
            BrokerError::from(AllocatorError::InvalidProjectName("bad".to_string())),
            BrokerError::InvalidArgument(_)
        ));
    }
}
