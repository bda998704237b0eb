//! Authentication and scope authorization.
//!
//! [`AuthGate`] turns an `Authorization: Bearer <token>` header into an
//! [`Identity`] by asking each configured [`CredentialVerifier`] in turn,
//! then checks the identity's scopes against a route's requirement.
//!
//! The gate fails closed. A verifier that cannot be reached produces
//! `AuthServiceUnavailable`, never an anonymous pass.
//!
//! Every decision is written to the `audit` tracing target.

pub mod verifier;

pub use verifier::{ApiKeyVerifier, CredentialVerifier, IntrospectionVerifier, JwtVerifier, VerifyError};

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::config::{AuthConfig, ConfigError};
use crate::error::GatewayError;

/// How an identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    ApiKey,
    Jwt,
    Introspected,
    Anonymous,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Jwt => "jwt",
            Self::Introspected => "introspected",
            Self::Anonymous => "anonymous",
        }
    }
}

/// Set of granted scope names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(scopes.into_iter().map(Into::into).collect())
    }

    /// Parse a space-separated scope string (OAuth style).
    pub fn from_space_separated(s: &str) -> Self {
        Self::new(s.split_whitespace())
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    /// Scopes in `required` that this set lacks.
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|s| !self.0.contains(s.as_str()))
            .map(String::as_str)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated subject (user or service id).
    pub subject: String,
    /// Stable id of the credential used, never the secret itself.
    pub credential_id: String,
    pub scopes: ScopeSet,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn anonymous(scopes: ScopeSet) -> Self {
        Self {
            subject: "anonymous".to_string(),
            credential_id: "anonymous".to_string(),
            scopes,
            kind: IdentityKind::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == IdentityKind::Anonymous
    }
}

/// Bearer credential taken from the `Authorization` header.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Parse an `Authorization` header value.
    ///
    /// The scheme is matched case-insensitively. Anything other than a
    /// single non-empty bearer token is malformed.
    pub fn from_authorization(value: &str) -> Result<Self, GatewayError> {
        let mut parts = value.trim().splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().map(str::trim).unwrap_or_default();

        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(unauthenticated("unsupported authorization scheme"));
        }
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(unauthenticated("malformed bearer token"));
        }
        Ok(Self(token.to_string()))
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Credential and scope gate.
pub struct AuthGate {
    verifiers: Vec<Arc<dyn CredentialVerifier>>,
    allow_anonymous: bool,
    anonymous_scopes: ScopeSet,
}

impl AuthGate {
    pub fn new(verifiers: Vec<Arc<dyn CredentialVerifier>>) -> Self {
        Self {
            verifiers,
            allow_anonymous: false,
            anonymous_scopes: ScopeSet::default(),
        }
    }

    /// Admit requests without credentials as the anonymous identity.
    pub fn with_anonymous(mut self, scopes: ScopeSet) -> Self {
        self.allow_anonymous = true;
        self.anonymous_scopes = scopes;
        self
    }

    /// Build the gate and its verifiers from configuration.
    ///
    /// Unusable key material is a startup error.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let mut verifiers: Vec<Arc<dyn CredentialVerifier>> = Vec::new();

        if !config.api_keys.is_empty() {
            verifiers.push(Arc::new(ApiKeyVerifier::new(&config.api_keys)));
        }
        if let Some(jwt) = &config.jwt {
            verifiers.push(Arc::new(JwtVerifier::from_config(jwt)?));
        }
        if let Some(introspection) = &config.introspection {
            verifiers.push(Arc::new(IntrospectionVerifier::from_config(introspection)?));
        }

        let gate = Self::new(verifiers);
        Ok(if config.allow_anonymous {
            gate.with_anonymous(ScopeSet::new(config.anonymous_scopes.iter().cloned()))
        } else {
            gate
        })
    }

    /// Resolve the caller from the raw `Authorization` header.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, GatewayError> {
        let Some(header) = authorization else {
            if self.allow_anonymous {
                let identity = Identity::anonymous(self.anonymous_scopes.clone());
                audit_allow(&identity);
                return Ok(identity);
            }
            audit_deny("missing credential");
            return Err(unauthenticated("missing credential"));
        };

        let credential = Credential::from_authorization(header).inspect_err(|_| {
            audit_deny("malformed credential");
        })?;

        for verifier in &self.verifiers {
            match verifier.verify(credential.token()).await {
                Ok(Some(identity)) => {
                    audit_allow(&identity);
                    return Ok(identity);
                }
                Ok(None) => continue,
                Err(VerifyError::Rejected(reason)) => {
                    audit_deny(&reason);
                    return Err(GatewayError::Unauthenticated { reason });
                }
                Err(VerifyError::Unavailable(reason)) => {
                    audit_deny("verifier unavailable");
                    return Err(GatewayError::AuthServiceUnavailable { reason });
                }
            }
        }

        audit_deny("unknown credential");
        Err(unauthenticated("unknown credential"))
    }

    /// Check that `identity` holds every scope in `required`.
    pub fn authorize(&self, identity: &Identity, required: &[String]) -> Result<(), GatewayError> {
        let missing = identity.scopes.missing(required);
        if missing.is_empty() {
            return Ok(());
        }

        info!(
            target: "audit",
            decision = "forbidden",
            subject = %identity.subject,
            credential_id = %identity.credential_id,
            missing = ?missing,
            "Authorization denied"
        );
        Err(GatewayError::Forbidden {
            missing: missing.into_iter().map(str::to_string).collect(),
        })
    }
}

fn unauthenticated(reason: &str) -> GatewayError {
    GatewayError::Unauthenticated {
        reason: reason.to_string(),
    }
}

fn audit_allow(identity: &Identity) {
    info!(
        target: "audit",
        decision = "authenticated",
        subject = %identity.subject,
        credential_id = %identity.credential_id,
        kind = identity.kind.as_str(),
        "Authentication succeeded"
    );
}

fn audit_deny(reason: &str) {
    info!(
        target: "audit",
        decision = "unauthenticated",
        reason,
        "Authentication failed"
    );
}
