//! Credential store: sessions and API keys.
//!
//! Every record is owned here. Callers never cache validation results, so a
//! revocation or logout is visible on the very next lookup.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use surrealdb::sql::Datetime;
use tracing::{debug, info};

use crate::auth::context::Identity;
use crate::auth::credentials::{generate_api_key, hash_credential};
use crate::auth::usage::{DEFAULT_USAGE_QUEUE, UsageRecorder};
use crate::db::{ApiKeyRecord, Db, SessionRecord, SubjectRecord};
use crate::types::{ApiKeyId, ApiKeyPrefix, SubjectId};

/// Credential store errors.
///
/// The distinct rejection reasons exist for operator logs only. Callers
/// facing the network collapse them into a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No matching record, or the record belongs to another subject
    NotFound,
    /// The credential's expiry has passed
    Expired,
    /// The API key was revoked
    Revoked,
    /// The owning subject is deactivated or gone
    SubjectInactive,
    /// A unique field already holds this value
    Conflict(String),
    /// The requested lifetime does not yield a representable expiry
    InvalidTtl,
    /// Database error
    Database(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "Credential not found"),
            Self::Expired => write!(f, "Credential has expired"),
            Self::Revoked => write!(f, "Credential has been revoked"),
            Self::SubjectInactive => write!(f, "Subject is inactive"),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::InvalidTtl => write!(f, "Credential lifetime is out of range"),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<surrealdb::Error> for StoreError {
    fn from(e: surrealdb::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl StoreError {
    /// Short machine-readable reason for structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::SubjectInactive => "subject_inactive",
            Self::Conflict(_) => "conflict",
            Self::InvalidTtl => "invalid_ttl",
            Self::Database(_) => "database",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An API key as returned once, at creation.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    /// The full secret. Not recoverable after this point.
    pub key: String,
    pub record: ApiKeyRecord,
}

pub(crate) fn to_utc(dt: &Datetime) -> DateTime<Utc> {
    DateTime::<Utc>::from(dt.clone())
}

/// `now + ttl`, refusing lifetimes that overflow the calendar.
fn expiry_after(ttl: Duration) -> StoreResult<Datetime> {
    Utc::now()
        .checked_add_signed(ttl)
        .map(Datetime::from)
        .ok_or(StoreError::InvalidTtl)
}

/// Credential store for sessions and API keys.
#[derive(Clone)]
pub struct CredentialStore {
    db: Db,
    usage: UsageRecorder,
}

impl CredentialStore {
    /// Create a new credential store. Spawns the usage recorder task.
    pub fn new(db: Db) -> Self {
        let usage = UsageRecorder::spawn(db.clone(), DEFAULT_USAGE_QUEUE);
        Self { db, usage }
    }

    /// Get reference to the database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Persist a session for `token`, valid for `ttl` from now.
    pub async fn create_session(
        &self,
        subject_id: &SubjectId,
        token: &str,
        ttl: Duration,
    ) -> StoreResult<SessionRecord> {
        let expires_at = expiry_after(ttl)?;

        let query = r#"
            CREATE session CONTENT {
                token_hash: $token_hash,
                subject_id: $subject_id,
                expires_at: $expires_at
            }
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("token_hash", hash_credential(token)))
            .bind(("subject_id", subject_id.clone()))
            .bind(("expires_at", expires_at))
            .await?;

        let sessions: Vec<SessionRecord> = res.take(0)?;
        sessions
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Database("Failed to create session".to_string()))
    }

    /// Resolve a session token to the identity of its subject.
    ///
    /// Expired sessions, and sessions whose subject is inactive or missing,
    /// are deleted as a side effect of the lookup.
    pub async fn validate_session(&self, token: &str) -> StoreResult<Identity> {
        let mut res = self
            .db
            .query("SELECT * FROM session WHERE token_hash = $token_hash LIMIT 1")
            .bind(("token_hash", hash_credential(token)))
            .await?;

        let sessions: Vec<SessionRecord> = res.take(0)?;
        let session = sessions.into_iter().next().ok_or(StoreError::NotFound)?;

        if to_utc(&session.expires_at) <= Utc::now() {
            self.delete_session_record(&session).await?;
            debug!(subject_id = %session.subject_id, "Purged expired session on lookup");
            return Err(StoreError::Expired);
        }

        match self.find_subject(&session.subject_id).await? {
            Some(subject) if subject.is_active => Ok(Identity::from(&subject)),
            _ => {
                self.delete_session_record(&session).await?;
                Err(StoreError::SubjectInactive)
            }
        }
    }

    /// Delete the session for `token`. Deleting an unknown token is not an error.
    pub async fn delete_session(&self, token: &str) -> StoreResult<()> {
        self.db
            .query("DELETE session WHERE token_hash = $token_hash")
            .bind(("token_hash", hash_credential(token)))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_session_record(&self, session: &SessionRecord) -> StoreResult<()> {
        self.db
            .query("DELETE session WHERE id = $id")
            .bind(("id", session.id.clone()))
            .await?
            .check()?;
        Ok(())
    }

    /// Delete every session whose expiry has passed. Returns the number removed.
    pub async fn purge_expired_sessions(&self) -> StoreResult<usize> {
        let mut res = self
            .db
            .query("DELETE session WHERE expires_at <= time::now() RETURN BEFORE")
            .await?;
        let purged: Vec<SessionRecord> = res.take(0)?;
        Ok(purged.len())
    }

    /// Issue a new API key for `subject_id`, valid for `ttl` from now.
    pub async fn create_api_key(
        &self,
        subject_id: &SubjectId,
        name: &str,
        ttl: Duration,
    ) -> StoreResult<IssuedApiKey> {
        let (full_key, prefix, key_hash) = generate_api_key();
        let key_id = ApiKeyId::new(uuid::Uuid::new_v4().to_string());
        let expires_at = expiry_after(ttl)?;

        let query = r#"
            CREATE api_key CONTENT {
                key_id: $key_id,
                key_hash: $key_hash,
                key_prefix: $key_prefix,
                subject_id: $subject_id,
                name: $name,
                is_active: true,
                expires_at: $expires_at
            }
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("key_id", key_id))
            .bind(("key_hash", key_hash))
            .bind(("key_prefix", prefix.clone()))
            .bind(("subject_id", subject_id.clone()))
            .bind(("name", name.to_string()))
            .bind(("expires_at", expires_at))
            .await?;

        let records: Vec<ApiKeyRecord> = res.take(0)?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Database("Failed to create API key".to_string()))?;

        info!(subject_id = %subject_id, key_prefix = %prefix, "Issued API key");

        Ok(IssuedApiKey {
            key: full_key,
            record,
        })
    }

    /// Resolve an API key to the identity of its owner.
    ///
    /// On success a `last_used_at` update is queued; it is not awaited.
    pub async fn validate_api_key(&self, key: &str) -> StoreResult<Identity> {
        let mut res = self
            .db
            .query("SELECT * FROM api_key WHERE key_hash = $key_hash LIMIT 1")
            .bind(("key_hash", hash_credential(key)))
            .await?;

        let records: Vec<ApiKeyRecord> = res.take(0)?;
        let record = records.into_iter().next().ok_or(StoreError::NotFound)?;

        if !record.is_active {
            return Err(StoreError::Revoked);
        }
        if to_utc(&record.expires_at) <= Utc::now() {
            return Err(StoreError::Expired);
        }

        let subject = match self.find_subject(&record.subject_id).await? {
            Some(subject) if subject.is_active => subject,
            _ => return Err(StoreError::SubjectInactive),
        };

        self.usage.record(record.key_id.clone());

        Ok(Identity::from(&subject))
    }

    /// Get a single key owned by `subject_id`.
    pub async fn get_api_key(
        &self,
        key_id: &ApiKeyId,
        subject_id: &SubjectId,
    ) -> StoreResult<ApiKeyRecord> {
        let mut res = self
            .db
            .query("SELECT * FROM api_key WHERE key_id = $key_id AND subject_id = $subject_id LIMIT 1")
            .bind(("key_id", key_id.clone()))
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let records: Vec<ApiKeyRecord> = res.take(0)?;
        records.into_iter().next().ok_or(StoreError::NotFound)
    }

    /// List every key owned by `subject_id`, newest first.
    pub async fn list_api_keys(&self, subject_id: &SubjectId) -> StoreResult<Vec<ApiKeyRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM api_key WHERE subject_id = $subject_id ORDER BY created_at DESC")
            .bind(("subject_id", subject_id.clone()))
            .await?;

        Ok(res.take(0)?)
    }

    /// Soft-revoke a key. Keys owned by another subject report `NotFound`.
    pub async fn revoke_api_key(&self, key_id: &ApiKeyId, subject_id: &SubjectId) -> StoreResult<()> {
        let query = r#"
            UPDATE api_key SET is_active = false
            WHERE key_id = $key_id AND subject_id = $subject_id
            RETURN AFTER
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("key_id", key_id.clone()))
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let updated: Vec<ApiKeyRecord> = res.take(0)?;
        if updated.is_empty() {
            return Err(StoreError::NotFound);
        }

        info!(subject_id = %subject_id, key_id = %key_id, "Revoked API key");
        Ok(())
    }

    /// Hard-delete a key. Keys owned by another subject report `NotFound`.
    pub async fn delete_api_key(&self, key_id: &ApiKeyId, subject_id: &SubjectId) -> StoreResult<()> {
        let query = r#"
            DELETE api_key
            WHERE key_id = $key_id AND subject_id = $subject_id
            RETURN BEFORE
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("key_id", key_id.clone()))
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let deleted: Vec<ApiKeyRecord> = res.take(0)?;
        if deleted.is_empty() {
            return Err(StoreError::NotFound);
        }

        info!(subject_id = %subject_id, key_id = %key_id, "Deleted API key");
        Ok(())
    }

    /// Soft-revoke every key with the given display prefix (operator use).
    ///
    /// Returns whether any key was revoked.
    pub async fn revoke_api_key_by_prefix(&self, prefix: &ApiKeyPrefix) -> StoreResult<bool> {
        let mut res = self
            .db
            .query("UPDATE api_key SET is_active = false WHERE key_prefix = $key_prefix RETURN AFTER")
            .bind(("key_prefix", prefix.clone()))
            .await?;

        let updated: Vec<ApiKeyRecord> = res.take(0)?;
        Ok(!updated.is_empty())
    }

    async fn find_subject(&self, subject_id: &SubjectId) -> StoreResult<Option<SubjectRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM subject WHERE subject_id = $subject_id LIMIT 1")
            .bind(("subject_id", subject_id.clone()))
            .await?;

        let subjects: Vec<SubjectRecord> = res.take(0)?;
        Ok(subjects.into_iter().next())
    }
}
