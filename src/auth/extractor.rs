//! Credential classification for inbound HTTP requests.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::auth::context::Authenticated;
use crate::auth::credentials::constant_time_eq;
use crate::auth::verifier::{TokenVerifier, VerifyError};

/// Header carrying a per-subject API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Authentication errors. The display text is what the caller sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// `X-API-Key` was present but did not validate
    InvalidApiKey,
    /// No usable `Authorization: Bearer` header
    MissingAuthorization,
    /// `Authorization: Bearer` with nothing after the scheme
    EmptyToken,
    /// The bearer token was not the shared secret and did not verify
    InvalidToken,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidApiKey => write!(f, "Invalid API key"),
            Self::MissingAuthorization => write!(f, "Missing or invalid Authorization header"),
            Self::EmptyToken => write!(f, "Empty token"),
            Self::InvalidToken => write!(f, "Invalid token"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut response =
            (StatusCode::UNAUTHORIZED, format!("Unauthorized: {}", self)).into_response();
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        response
    }
}

/// Authentication extractor for HTTP requests.
///
/// Classification order:
/// 1. `X-API-Key`, if present, decides alone. There is no fallback.
/// 2. Otherwise `Authorization: Bearer <token>` is required.
/// 3. A token equal to the shared secret is admitted without a subject.
/// 4. Any other token is verified as a session.
#[derive(Clone)]
pub struct AuthExtractor {
    verifier: Arc<dyn TokenVerifier>,
    shared_secret: Option<String>,
}

impl AuthExtractor {
    /// Create a new auth extractor. No shared secret is honoured.
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            shared_secret: None,
        }
    }

    /// Honour `secret` as an administrative bearer token. Empty values are ignored.
    pub fn with_shared_secret(mut self, secret: Option<String>) -> Self {
        self.shared_secret = secret.filter(|s| !s.is_empty());
        self
    }

    /// Classify and verify the credentials in `headers`.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Authenticated, AuthError> {
        let api_key = headers
            .get(API_KEY_HEADER)
            .map(|v| v.to_str().unwrap_or_default());
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        self.extract(api_key, authorization).await
    }

    /// Classify and verify raw header values.
    pub async fn extract(
        &self,
        api_key: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Authenticated, AuthError> {
        if let Some(key) = api_key {
            if key.is_empty() {
                warn!(credential = "api_key", reason = "empty", "Credential rejected");
                return Err(AuthError::InvalidApiKey);
            }
            return match self.verifier.validate_api_key(key).await {
                Ok(identity) => Ok(Authenticated::Subject(identity)),
                Err(e) => {
                    log_rejection("api_key", &e);
                    Err(AuthError::InvalidApiKey)
                }
            };
        }

        let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) else {
            warn!(credential = "session", reason = "missing", "Credential rejected");
            return Err(AuthError::MissingAuthorization);
        };
        let token = token.trim();
        if token.is_empty() {
            warn!(credential = "session", reason = "empty", "Credential rejected");
            return Err(AuthError::EmptyToken);
        }

        if let Some(secret) = &self.shared_secret
            && constant_time_eq(token, secret)
        {
            return Ok(Authenticated::SharedSecret);
        }

        match self.verifier.verify_session(token).await {
            Ok(identity) => Ok(Authenticated::Subject(identity)),
            Err(e) => {
                log_rejection("session", &e);
                Err(AuthError::InvalidToken)
            }
        }
    }
}

fn log_rejection(credential: &'static str, e: &VerifyError) {
    match e {
        VerifyError::Invalid(reason) => {
            warn!(credential, reason = %reason, "Credential rejected");
        }
        VerifyError::Unavailable(msg) => {
            error!(credential, error = %msg, "Credential verification failed; denying request");
        }
    }
}
