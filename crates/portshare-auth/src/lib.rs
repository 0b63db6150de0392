//! Credential issuance for tunnel transports
//!
//! Mints the ephemeral, time-bounded credentials an owner's transport
//! presents when binding the reverse channel, and enforces the concurrent
//! session caps before any registry entry exists.

pub mod issuer;

pub use issuer::{CredentialClaims, CredentialError, CredentialIssuer, IssuerConfig};
