//! Authentication: credentials, their storage, and request classification.
//!
//! Three credential kinds are accepted:
//!
//! - **API key**: `X-API-Key: sk_...`, owned by a subject
//! - **Session token**: `Authorization: Bearer <token>`, issued at login
//! - **Shared secret**: a static bearer token that admits the caller without a subject
//!
//! ## Security Model
//!
//! - Raw session tokens and API keys are never stored, only SHA-256 digests
//! - Every request is re-verified; there is no local validation cache
//! - Rejections carry one message per credential kind so callers cannot
//!   tell an expired key from an unknown one
//!
//! ## Usage
//!
//! ```ignore
//! let store = CredentialStore::new(db);
//! let extractor = AuthExtractor::new(Arc::new(StoreVerifier::new(store)));
//! let authenticated = extractor.authenticate(request.headers()).await?;
//! ```

mod context;
mod credentials;
mod extractor;
mod store;
mod subjects;
mod usage;
mod verifier;

pub use context::{Authenticated, Identity};
pub use credentials::{
    API_KEY_PREFIX, MIN_PASSWORD_LEN, constant_time_eq, generate_api_key, generate_session_token,
    hash_credential, hash_password, verify_password,
};
pub use extractor::{API_KEY_HEADER, AuthError, AuthExtractor};
pub(crate) use store::to_utc;
pub use store::{CredentialStore, IssuedApiKey, StoreError, StoreResult};
pub use subjects::{NewSubject, SubjectStore};
pub use usage::UsageRecorder;
pub use verifier::{
    RemoteVerifier, StoreVerifier, TokenVerifier, ValidateKeyRequest, ValidateKeyResponse,
    VerifyError, VerifyFuture,
};
