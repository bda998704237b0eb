//! Credential verifiers.
//!
//! A verifier answers one of three ways: the token is mine and valid
//! (`Ok(Some)`), the token is not mine (`Ok(None)`, the gate tries the next
//! verifier), or the token is mine and invalid or I cannot decide
//! (`Err`).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::{Identity, IdentityKind, ScopeSet};
use crate::config::{ApiKeyConfig, ConfigError, IntrospectionConfig, JwtAlgorithm, JwtConfig};

/// Why a verifier could not produce an identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// The credential was recognized and is invalid (expired, bad signature).
    #[error("credential rejected: {0}")]
    Rejected(String),

    /// The verifier itself could not be consulted.
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a bearer token into an identity.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, VerifyError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Static API keys
// ─────────────────────────────────────────────────────────────────────────────

/// Looks tokens up in the configured API-key table.
pub struct ApiKeyVerifier {
    keys: HashMap<String, Identity>,
}

impl ApiKeyVerifier {
    pub fn new(keys: &[ApiKeyConfig]) -> Self {
        let keys = keys
            .iter()
            .map(|k| {
                (
                    k.key.clone(),
                    Identity {
                        subject: k.subject.clone(),
                        credential_id: k.id.clone(),
                        scopes: ScopeSet::new(k.scopes.iter().cloned()),
                        kind: IdentityKind::ApiKey,
                    },
                )
            })
            .collect();
        Self { keys }
    }
}

#[async_trait]
impl CredentialVerifier for ApiKeyVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, VerifyError> {
        Ok(self.keys.get(token).cloned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signed tokens
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies HS256/RS256 JWTs locally.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    scope_claim: String,
}

impl JwtVerifier {
    pub fn from_config(config: &JwtConfig) -> Result<Self, ConfigError> {
        let (key, algorithm) = match config.algorithm {
            JwtAlgorithm::HS256 => {
                let secret = config
                    .secret
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| ConfigError::InvalidJwtKey {
                        message: "HS256 requires a secret".to_string(),
                    })?;
                (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
            }
            JwtAlgorithm::RS256 => {
                let pem = config
                    .public_key_pem
                    .as_deref()
                    .ok_or_else(|| ConfigError::InvalidJwtKey {
                        message: "RS256 requires a public key".to_string(),
                    })?;
                let key = DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
                    ConfigError::InvalidJwtKey {
                        message: format!("invalid RSA public key: {e}"),
                    }
                })?;
                (key, Algorithm::RS256)
            }
        };

        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            key,
            validation,
            scope_claim: config.scope_claim.clone(),
        })
    }

    fn scopes_from_claims(&self, claims: &Map<String, Value>) -> ScopeSet {
        match claims.get(&self.scope_claim) {
            Some(Value::String(s)) => ScopeSet::from_space_separated(s),
            Some(Value::Array(items)) => {
                ScopeSet::new(items.iter().filter_map(Value::as_str).map(str::to_string))
            }
            _ => ScopeSet::default(),
        }
    }
}

fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, VerifyError> {
        if !looks_like_jwt(token) {
            return Ok(None);
        }

        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation).map_err(
            |e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "token expired",
                    ErrorKind::InvalidSignature => "invalid token signature",
                    ErrorKind::InvalidIssuer => "invalid token issuer",
                    ErrorKind::InvalidAudience => "invalid token audience",
                    ErrorKind::ImmatureSignature => "token not yet valid",
                    _ => "invalid token",
                };
                debug!(error = %e, "JWT verification failed");
                VerifyError::Rejected(reason.to_string())
            },
        )?;

        let claims = data.claims;
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VerifyError::Rejected("token has no subject".to_string()))?
            .to_string();
        let credential_id = claims
            .get("jti")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| subject.clone());

        Ok(Some(Identity {
            scopes: self.scopes_from_claims(&claims),
            subject,
            credential_id,
            kind: IdentityKind::Jwt,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote introspection
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

/// Asks a remote endpoint whether a token is active (RFC 7662 shape).
pub struct IntrospectionVerifier {
    client: reqwest::Client,
    url: String,
}

impl IntrospectionVerifier {
    pub fn from_config(config: &IntrospectionConfig) -> Result<Self, ConfigError> {
        Self::new(config.url.clone(), config.timeout)
    }

    pub fn new(url: String, timeout: Duration) -> Result<Self, ConfigError> {
        reqwest::Url::parse(&url).map_err(|e| ConfigError::InvalidUrl {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::invalid("auth.introspection", e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl CredentialVerifier for IntrospectionVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, VerifyError> {
        let response = self
            .client
            .post(&self.url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

        if response.status().is_server_error() {
            return Err(VerifyError::Unavailable(format!(
                "introspection returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(VerifyError::Rejected(format!(
                "introspection returned {}",
                response.status()
            )));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| VerifyError::Unavailable(format!("invalid introspection body: {e}")))?;

        if !body.active {
            return Err(VerifyError::Rejected("token inactive".to_string()));
        }
        let subject = body
            .sub
            .ok_or_else(|| VerifyError::Rejected("token has no subject".to_string()))?;

        Ok(Some(Identity {
            credential_id: body.client_id.unwrap_or_else(|| subject.clone()),
            subject,
            scopes: body
                .scope
                .as_deref()
                .map(ScopeSet::from_space_separated)
                .unwrap_or_default(),
            kind: IdentityKind::Introspected,
        }))
    }
}
