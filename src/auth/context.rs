//! Request-scoped identity.

use serde::{Deserialize, Serialize};

use crate::db::SubjectRecord;
use crate::types::{SubjectId, Username};

/// Identity resolved from a validated credential.
///
/// Attached to the request after authentication and dropped with it. The
/// serialized form (`id`, `username`, `is_active`) is the body of the
/// remote session-verification contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "id")]
    subject_id: SubjectId,
    #[serde(rename = "username")]
    display_name: Username,
    is_active: bool,
}

impl Identity {
    /// Create a new identity.
    pub fn new(subject_id: SubjectId, display_name: Username, is_active: bool) -> Self {
        Self {
            subject_id,
            display_name,
            is_active,
        }
    }

    /// Get the subject ID.
    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    /// Get the display name (the subject's username).
    pub fn display_name(&self) -> &Username {
        &self.display_name
    }

    /// Check whether the subject is active.
    pub fn is_active(&self) -> bool {
        self.is_active
    }
}

impl From<&SubjectRecord> for Identity {
    fn from(record: &SubjectRecord) -> Self {
        Self::new(
            record.subject_id.clone(),
            record.username.clone(),
            record.is_active,
        )
    }
}

/// Outcome of a successful authentication, stored as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authenticated {
    /// A subject presented a valid API key or session token.
    Subject(Identity),
    /// The caller presented the shared secret. No subject is attached.
    SharedSecret,
}

impl Authenticated {
    /// Identity of the caller, if the credential belongs to a subject.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Subject(identity) => Some(identity),
            Self::SharedSecret => None,
        }
    }
}
