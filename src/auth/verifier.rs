//! Token verification against the credential store, locally or over HTTP.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::context::Identity;
use crate::auth::store::{CredentialStore, StoreError};

/// Verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The credential was checked and rejected
    Invalid(String),
    /// The verifier could not reach a decision (transport, decoding, database)
    Unavailable(String),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "Credential rejected: {}", reason),
            Self::Unavailable(msg) => write!(f, "Verifier unavailable: {}", msg),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<StoreError> for VerifyError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(msg) => Self::Unavailable(msg),
            other => Self::Invalid(other.reason().to_string()),
        }
    }
}

pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = Result<Identity, VerifyError>> + Send + 'a>>;

/// Resolves presented credentials to an identity.
pub trait TokenVerifier: Send + Sync {
    /// Check a session token.
    fn verify_session<'a>(&'a self, token: &'a str) -> VerifyFuture<'a>;

    /// Check an API key.
    fn validate_api_key<'a>(&'a self, key: &'a str) -> VerifyFuture<'a>;
}

/// Verifier backed by a local credential store.
pub struct StoreVerifier {
    store: CredentialStore,
}

impl StoreVerifier {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }
}

impl TokenVerifier for StoreVerifier {
    fn verify_session<'a>(&'a self, token: &'a str) -> VerifyFuture<'a> {
        Box::pin(async move { Ok(self.store.validate_session(token).await?) })
    }

    fn validate_api_key<'a>(&'a self, key: &'a str) -> VerifyFuture<'a> {
        Box::pin(async move { Ok(self.store.validate_api_key(key).await?) })
    }
}

/// Body of `POST /validate-key`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateKeyRequest {
    pub api_key: String,
}

/// Response of `POST /validate-key`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateKeyResponse {
    pub valid: bool,
    #[serde(default)]
    pub user: Option<Identity>,
}

/// Verifier that calls the identity service over HTTP.
///
/// Every call carries its own timeout. Nothing is cached.
pub struct RemoteVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteVerifier {
    /// Create a remote verifier rooted at `base_url`
    /// (e.g. `http://user-service:8081/internal`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// 200 proceeds; 5xx means no decision was reached; anything else is a rejection.
fn check_status(status: reqwest::StatusCode, credential: &str) -> Result<(), VerifyError> {
    if status == reqwest::StatusCode::OK {
        return Ok(());
    }
    if status.is_server_error() {
        return Err(VerifyError::Unavailable(format!(
            "identity service returned {}",
            status.as_u16()
        )));
    }
    debug!(status = %status, "{} rejected by identity service", credential);
    Err(VerifyError::Invalid(format!("status {}", status.as_u16())))
}

fn active_or_invalid(identity: Identity) -> Result<Identity, VerifyError> {
    if identity.is_active() {
        Ok(identity)
    } else {
        Err(VerifyError::Invalid("subject_inactive".to_string()))
    }
}

impl TokenVerifier for RemoteVerifier {
    fn verify_session<'a>(&'a self, token: &'a str) -> VerifyFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.endpoint("verify-session"))
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

            check_status(response.status(), "Session")?;

            let identity: Identity = response
                .json()
                .await
                .map_err(|e| VerifyError::Unavailable(format!("invalid verify response: {}", e)))?;

            active_or_invalid(identity)
        })
    }

    fn validate_api_key<'a>(&'a self, key: &'a str) -> VerifyFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.endpoint("validate-key"))
                .json(&ValidateKeyRequest {
                    api_key: key.to_string(),
                })
                .send()
                .await
                .map_err(|e| VerifyError::Unavailable(e.to_string()))?;

            check_status(response.status(), "API key")?;

            let body: ValidateKeyResponse = response.json().await.map_err(|e| {
                VerifyError::Unavailable(format!("invalid validate-key response: {}", e))
            })?;

            match (body.valid, body.user) {
                (true, Some(identity)) => active_or_invalid(identity),
                (true, None) => Err(VerifyError::Unavailable(
                    "validate-key response missing user".to_string(),
                )),
                (false, _) => Err(VerifyError::Invalid("invalid_key".to_string())),
            }
        })
    }
}
