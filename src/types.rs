//! NewType wrappers for strong typing across the gateway and identity service.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a username where a subject ID is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Stable identifier of a subject (a UUID string).
    ///
    /// This is the value forwarded upstream in `X-User-ID`. It is distinct
    /// from `Username`, which is chosen by the subject and shown to humans.
    SubjectId
);

newtype_string!(
    /// Login name of a subject, unique across the store.
    Username
);

newtype_string!(
    /// Public identifier of an API key record.
    ///
    /// Used in `/api/v1/keys/{id}` paths. It carries no secret material.
    ApiKeyId
);

newtype_string!(
    /// Display prefix of an API key (e.g., "sk_Ab3dE9xZ").
    ///
    /// The prefix can be safely shown in listings and logs. It does not
    /// reveal the full key and cannot be used for authentication.
    ApiKeyPrefix
);

newtype_string!(
    /// SHA-256 hex digest of an opaque credential (session token or API key).
    ///
    /// Raw credentials are never stored. Lookups hash the presented value
    /// and compare digests.
    CredentialHash
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_id_creation() {
        let id = SubjectId::new("7f1c2a4e-0000-4000-8000-000000000001");
        assert_eq!(id.as_str(), "7f1c2a4e-0000-4000-8000-000000000001");
        assert_eq!(id.to_string(), "7f1c2a4e-0000-4000-8000-000000000001");
    }

    #[test]
    fn test_username_from_string() {
        let name: Username = "alice".into();
        assert_eq!(name.as_str(), "alice");

        let name: Username = String::from("bob").into();
        assert_eq!(name.into_inner(), "bob");
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = ApiKeyId::new("key-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"key-1\"");

        let parsed: ApiKeyId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_type_hash_and_borrow() {
        use std::borrow::Borrow;
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(ApiKeyPrefix::new("sk_abc12345"));
        assert!(set.contains("sk_abc12345"));

        let hash = CredentialHash::new("deadbeef");
        let s: &str = hash.borrow();
        assert_eq!(s, "deadbeef");
    }
}
