use serde::{Deserialize, Serialize};
use surrealdb::{RecordId, sql::Datetime};

use crate::types::{ApiKeyId, ApiKeyPrefix, CredentialHash, SubjectId, Username};

/// Persisted subject (a user account that can hold credentials).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectRecord {
    /// Database identifier
    pub id: RecordId,
    /// Stable public identifier forwarded to upstream services
    pub subject_id: SubjectId,
    pub username: Username,
    pub email: String,
    /// Argon2id PHC string
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
}

/// Persisted login session. Only the token digest is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: RecordId,
    pub token_hash: CredentialHash,
    pub subject_id: SubjectId,
    pub created_at: Option<Datetime>,
    pub expires_at: Datetime,
}

/// Persisted API key. Only the key digest and a display prefix are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: RecordId,
    /// Public identifier used by the key management endpoints
    pub key_id: ApiKeyId,
    /// SHA-256 hash of the full API key (never store raw keys)
    pub key_hash: CredentialHash,
    /// First part of the key for display/identification (e.g., "sk_Ab3dE9xZ")
    pub key_prefix: ApiKeyPrefix,
    /// Owner of this key
    pub subject_id: SubjectId,
    /// Human-readable name for this key
    pub name: String,
    /// Cleared on revocation
    pub is_active: bool,
    pub expires_at: Datetime,
    pub created_at: Option<Datetime>,
    /// Last time the key was used for authentication
    pub last_used_at: Option<Datetime>,
}

/// One role held by a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignmentRecord {
    pub id: RecordId,
    pub subject_id: SubjectId,
    pub role: String,
    pub created_at: Option<Datetime>,
}
