// REST endpoints of the identity service

use axum::{
    Extension,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::auth::{
    Identity, MIN_PASSWORD_LEN, NewSubject, StoreError, ValidateKeyRequest, generate_session_token,
    to_utc,
};
use crate::db::{ApiKeyRecord, SubjectRecord};
use crate::identity::SharedIdentity;
use crate::types::{ApiKeyId, SubjectId};

/// Error response with a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn invalid_credentials() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Invalid credentials")
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not found")
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::not_found(),
            StoreError::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            StoreError::InvalidTtl => Self::bad_request(StoreError::InvalidTtl.to_string()),
            StoreError::Database(msg) => {
                error!(error = %msg, "Identity store failure");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
            StoreError::Expired | StoreError::Revoked | StoreError::SubjectInactive => {
                Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn required<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn optional(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn subject_json(subject: &SubjectRecord) -> Value {
    json!({
        "id": subject.subject_id,
        "username": subject.username,
        "email": subject.email,
        "first_name": subject.first_name,
        "last_name": subject.last_name,
        "is_active": subject.is_active,
        "created_at": subject.created_at.as_ref().map(to_utc),
    })
}

fn api_key_json(key: &ApiKeyRecord) -> Value {
    json!({
        "id": key.key_id,
        "name": key.name,
        "key_prefix": key.key_prefix,
        "is_active": key.is_active,
        "expires_at": to_utc(&key.expires_at),
        "created_at": key.created_at.as_ref().map(to_utc),
        "last_used_at": key.last_used_at.as_ref().map(to_utc),
    })
}

/// Role endpoints only ever address the caller.
fn ensure_self(identity: &Identity, id: &str) -> ApiResult<()> {
    if identity.subject_id().as_str() == id {
        Ok(())
    } else {
        Err(ApiError::not_found())
    }
}

pub async fn create_user(
    State(state): State<SharedIdentity>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (Some(username), Some(email), Some(password)) = (
        required(&payload, "username"),
        required(&payload, "email"),
        payload.get("password").and_then(Value::as_str),
    ) else {
        return Err(ApiError::bad_request(
            "Username, email and password are required",
        ));
    };

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_request(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let mut new = NewSubject::new(username, email, password);
    new.first_name = optional(&payload, "first_name");
    new.last_name = optional(&payload, "last_name");

    let subject = state.subjects.create_subject(new).await?;
    Ok((StatusCode::CREATED, Json(subject_json(&subject))))
}

pub async fn login(
    State(state): State<SharedIdentity>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let (Some(username), Some(password)) = (
        required(&payload, "username"),
        payload.get("password").and_then(Value::as_str),
    ) else {
        return Err(ApiError::bad_request("Username and password are required"));
    };

    let subject = match state.subjects.authenticate(username, password).await {
        Ok(subject) => subject,
        Err(StoreError::Database(msg)) => return Err(StoreError::Database(msg).into()),
        Err(e) => {
            warn!(username = %username, reason = e.reason(), "Login failed");
            return Err(ApiError::invalid_credentials());
        }
    };

    let token = generate_session_token();
    let session = state
        .credentials
        .create_session(&subject.subject_id, &token, state.config.session_ttl)
        .await?;

    info!(subject_id = %subject.subject_id, "Session created");

    Ok(Json(json!({
        "user": subject_json(&subject),
        "token": token,
        "expires_at": to_utc(&session.expires_at),
    })))
}

pub async fn logout(
    State(state): State<SharedIdentity>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    // Callers authenticated by API key have no session to end
    if let Some(token) = bearer_token(&headers) {
        state.credentials.delete_session(token).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_session(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

/// `POST /internal/verify-session`: 200 with the identity, 401 otherwise.
pub async fn internal_verify_session(
    State(state): State<SharedIdentity>,
    headers: HeaderMap,
) -> ApiResult<Json<Identity>> {
    let token = bearer_token(&headers).ok_or_else(ApiError::invalid_credentials)?;

    match state.credentials.validate_session(token).await {
        Ok(identity) => Ok(Json(identity)),
        Err(StoreError::Database(msg)) => Err(StoreError::Database(msg).into()),
        Err(e) => {
            debug!(reason = e.reason(), "Session verification failed");
            Err(ApiError::invalid_credentials())
        }
    }
}

/// `POST /internal/validate-key`: always 200 unless the store itself fails.
pub async fn internal_validate_key(
    State(state): State<SharedIdentity>,
    Json(req): Json<ValidateKeyRequest>,
) -> ApiResult<Json<Value>> {
    let identity = match state.credentials.validate_api_key(&req.api_key).await {
        Ok(identity) => identity,
        Err(StoreError::Database(msg)) => return Err(StoreError::Database(msg).into()),
        Err(e) => {
            debug!(reason = e.reason(), "API key validation failed");
            return Ok(Json(json!({ "valid": false })));
        }
    };

    let email = state
        .subjects
        .get_subject(identity.subject_id())
        .await?
        .map(|s| s.email);

    Ok(Json(json!({
        "valid": true,
        "user": {
            "id": identity.subject_id(),
            "username": identity.display_name(),
            "is_active": identity.is_active(),
            "email": email,
        }
    })))
}

pub async fn create_key(
    State(state): State<SharedIdentity>,
    Extension(identity): Extension<Identity>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let name = required(&payload, "name").ok_or_else(|| ApiError::bad_request("Name is required"))?;

    let ttl = match payload.get("expires_at").filter(|v| !v.is_null()) {
        Some(value) => {
            let expires_at = value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .ok_or_else(|| ApiError::bad_request("expires_at must be an RFC 3339 timestamp"))?
                .with_timezone(&Utc);
            let ttl = expires_at - Utc::now();
            if ttl <= chrono::Duration::zero() {
                return Err(ApiError::bad_request("expires_at must be in the future"));
            }
            ttl
        }
        None => state.config.api_key_ttl,
    };

    let issued = state
        .credentials
        .create_api_key(identity.subject_id(), name, ttl)
        .await?;
    let record = &issued.record;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": record.key_id,
            "name": record.name,
            "key": issued.key,
            "key_prefix": record.key_prefix,
            "expires_at": to_utc(&record.expires_at),
            "is_active": record.is_active,
            "created_at": record.created_at.as_ref().map(to_utc),
        })),
    ))
}

pub async fn list_keys(
    State(state): State<SharedIdentity>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<Value>> {
    let keys = state.credentials.list_api_keys(identity.subject_id()).await?;
    let api_keys: Vec<Value> = keys.iter().map(api_key_json).collect();

    Ok(Json(json!({
        "total": api_keys.len(),
        "api_keys": api_keys,
    })))
}

pub async fn revoke_key(
    State(state): State<SharedIdentity>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .credentials
        .revoke_api_key(&ApiKeyId::new(id), identity.subject_id())
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn delete_key(
    State(state): State<SharedIdentity>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .credentials
        .delete_api_key(&ApiKeyId::new(id), identity.subject_id())
        .await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn get_roles(
    State(state): State<SharedIdentity>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    ensure_self(&identity, &id)?;
    let roles = state.subjects.list_roles(identity.subject_id()).await?;
    Ok(Json(json!({ "user_id": id, "roles": roles })))
}

pub async fn replace_roles(
    State(state): State<SharedIdentity>,
    Extension(identity): Extension<Identity>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    ensure_self(&identity, &id)?;

    let roles = payload
        .get("roles")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                })
                .collect::<Option<Vec<String>>>()
        })
        .ok_or_else(|| ApiError::bad_request("roles must be an array of non-empty strings"))?;

    let roles = state
        .subjects
        .replace_roles(&SubjectId::new(id.clone()), roles)
        .await?;
    info!(subject_id = %id, count = roles.len(), "Replaced role set");

    Ok(Json(json!({ "user_id": id, "roles": roles })))
}
