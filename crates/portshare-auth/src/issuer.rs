//! JWT credential issuer
//!
//! Each credential is an HS256 JWT bound 1:1 to a tunnel id via its `sub`
//! claim and a unique `jti`. The issuer keeps a private table of active
//! credentials: a revoked or superseded token fails validation even while
//! its signature and expiry are still good.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Claims carried by a transport credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialClaims {
    /// Subject (tunnel ID)
    pub sub: String,
    /// Owning account
    pub owner: String,
    /// Unique credential id; must match the issuer's active entry
    pub jti: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
}

impl CredentialClaims {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Credential errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Concurrent session capacity reached")]
    ResourceExhausted,

    #[error("Credential encoding error: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),

    #[error("Credential expired")]
    Expired,

    #[error("Credential revoked or unknown")]
    Revoked,

    #[error("Credential is bound to a different tunnel")]
    TunnelMismatch,
}

/// Issuer configuration
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    /// `iss` claim stamped on every credential
    pub issuer: String,
    /// `aud` claim stamped on every credential
    pub audience: String,
    /// Credential validity window; must cover the maximum session duration
    pub validity: Duration,
    /// Global concurrent session cap
    pub max_sessions: usize,
    /// Per-owner concurrent session cap
    pub max_sessions_per_owner: usize,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            issuer: "portshare-broker".to_string(),
            audience: "portshare-transport".to_string(),
            validity: Duration::hours(9),
            max_sessions: 512,
            max_sessions_per_owner: 5,
        }
    }
}

struct IssuedCredential {
    jti: String,
    owner_id: String,
}

/// Issues and validates transport credentials
///
/// The active-credential table is private to the issuer and mutated only
/// through `issue`/`revoke`.
pub struct CredentialIssuer {
    secret: Vec<u8>,
    config: IssuerConfig,
    active: Mutex<HashMap<String, IssuedCredential>>,
}

impl CredentialIssuer {
    pub fn new(secret: &[u8], config: IssuerConfig) -> Self {
        Self {
            secret: secret.to_vec(),
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a credential for `tunnel_id`
    ///
    /// Fails with `ResourceExhausted` when either concurrency cap is reached,
    /// before the caller has created any registry state. Issuing again for
    /// the same tunnel id supersedes the previous credential.
    pub fn issue(&self, tunnel_id: &str, owner_id: &str) -> Result<String, CredentialError> {
        let mut active = self.active.lock().unwrap();

        if !active.contains_key(tunnel_id) {
            if active.len() >= self.config.max_sessions {
                warn!(
                    tunnel_id = %tunnel_id,
                    active = active.len(),
                    "Global session cap reached, rejecting issuance"
                );
                return Err(CredentialError::ResourceExhausted);
            }

            let owned = active.values().filter(|c| c.owner_id == owner_id).count();
            if owned >= self.config.max_sessions_per_owner {
                warn!(
                    tunnel_id = %tunnel_id,
                    owner_id = %owner_id,
                    owned,
                    "Per-owner session cap reached, rejecting issuance"
                );
                return Err(CredentialError::ResourceExhausted);
            }
        }

        let now = Utc::now();
        let claims = CredentialClaims {
            sub: tunnel_id.to_string(),
            owner: owner_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + self.config.validity).timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )?;

        active.insert(
            tunnel_id.to_string(),
            IssuedCredential {
                jti: claims.jti.clone(),
                owner_id: owner_id.to_string(),
            },
        );

        debug!(tunnel_id = %tunnel_id, owner_id = %owner_id, "Issued transport credential");
        Ok(token)
    }

    /// Revoke the active credential for `tunnel_id`
    ///
    /// Returns whether a credential was actually revoked. Safe to call twice.
    pub fn revoke(&self, tunnel_id: &str) -> bool {
        let removed = self.active.lock().unwrap().remove(tunnel_id).is_some();
        if removed {
            debug!(tunnel_id = %tunnel_id, "Revoked transport credential");
        }
        removed
    }

    /// Validate a presented credential against the expected tunnel id
    ///
    /// Checks signature, expiry, issuer/audience, tunnel binding, and that
    /// the credential is still the active one for that tunnel.
    pub fn validate(
        &self,
        tunnel_id: &str,
        token: &str,
    ) -> Result<CredentialClaims, CredentialError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let claims = decode::<CredentialClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CredentialError::Expired,
            _ => CredentialError::Encoding(e),
        })?
        .claims;

        if claims.sub != tunnel_id {
            return Err(CredentialError::TunnelMismatch);
        }

        let active = self.active.lock().unwrap();
        match active.get(tunnel_id) {
            Some(issued) if issued.jti == claims.jti => Ok(claims),
            _ => Err(CredentialError::Revoked),
        }
    }

    /// Number of active credentials (equals non-closed sessions)
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Number of active credentials held by one owner
    pub fn active_count_for_owner(&self, owner_id: &str) -> usize {
        self.active
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.owner_id == owner_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    fn test_issuer() -> CredentialIssuer {
        CredentialIssuer::new(TEST_SECRET, IssuerConfig::default())
    }

    #[test]
    fn test_issue_and_validate() {
        let issuer = test_issuer();

        let token = issuer.issue("tun-1", "u1").unwrap();
        assert!(!token.is_empty());

        let claims = issuer.validate("tun-1", &token).unwrap();
        assert_eq!(claims.sub, "tun-1");
        assert_eq!(claims.owner, "u1");
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_validate_rejects_wrong_tunnel() {
        let issuer = test_issuer();
        let token = issuer.issue("tun-1", "u1").unwrap();

        let result = issuer.validate("tun-2", &token);
        assert!(matches!(result, Err(CredentialError::TunnelMismatch)));
    }

    #[test]
    fn test_revoked_credential_rejected() {
        let issuer = test_issuer();
        let token = issuer.issue("tun-1", "u1").unwrap();

        assert!(issuer.revoke("tun-1"));
        let result = issuer.validate("tun-1", &token);
        assert!(matches!(result, Err(CredentialError::Revoked)));

        // Second revoke is a no-op
        assert!(!issuer.revoke("tun-1"));
    }

    #[test]
    fn test_reissue_supersedes_previous_credential() {
        let issuer = test_issuer();
        let first = issuer.issue("tun-1", "u1").unwrap();
        let second = issuer.issue("tun-1", "u1").unwrap();

        assert!(matches!(
            issuer.validate("tun-1", &first),
            Err(CredentialError::Revoked)
        ));
        assert!(issuer.validate("tun-1", &second).is_ok());
        assert_eq!(issuer.active_count(), 1);
    }

    #[test]
    fn test_global_cap() {
        let issuer = CredentialIssuer::new(
            TEST_SECRET,
            IssuerConfig {
                max_sessions: 2,
                max_sessions_per_owner: 2,
                ..Default::default()
            },
        );

        issuer.issue("tun-1", "u1").unwrap();
        issuer.issue("tun-2", "u2").unwrap();

        let result = issuer.issue("tun-3", "u3");
        assert!(matches!(result, Err(CredentialError::ResourceExhausted)));

        // Revocation frees capacity
        issuer.revoke("tun-1");
        assert!(issuer.issue("tun-3", "u3").is_ok());
    }

    #[test]
    fn test_per_owner_cap() {
        let issuer = CredentialIssuer::new(
            TEST_SECRET,
            IssuerConfig {
                max_sessions: 100,
                max_sessions_per_owner: 1,
                ..Default::default()
            },
        );

        issuer.issue("tun-1", "u1").unwrap();

        let result = issuer.issue("tun-2", "u1");
        assert!(matches!(result, Err(CredentialError::ResourceExhausted)));

        // A different owner is unaffected
        assert!(issuer.issue("tun-3", "u2").is_ok());
        assert_eq!(issuer.active_count_for_owner("u1"), 1);
        assert_eq!(issuer.active_count_for_owner("u2"), 1);
    }

    #[test]
    fn test_expired_credential_rejected() {
        let issuer = CredentialIssuer::new(
            TEST_SECRET,
            IssuerConfig {
                validity: Duration::seconds(-10),
                ..Default::default()
            },
        );

        let token = issuer.issue("tun-1", "u1").unwrap();
        let result = issuer.validate("tun-1", &token);
        assert!(matches!(result, Err(CredentialError::Expired)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let issuer = test_issuer();
        issuer.issue("tun-1", "u1").unwrap();

        assert!(issuer.validate("tun-1", "not-a-jwt").is_err());
    }
}
