//! Opaque credential generation, hashing and comparison.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::types::{ApiKeyPrefix, CredentialHash};

/// Literal prefix carried by every API key.
pub const API_KEY_PREFIX: &str = "sk_";

/// Number of random bytes behind every session token and API key.
pub const CREDENTIAL_BYTES: usize = 32;

/// Characters of the random part kept in the display prefix.
const DISPLAY_PREFIX_CHARS: usize = 8;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

fn random_token() -> String {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash an opaque credential for storage and lookup (don't store raw values).
pub fn hash_credential(value: &str) -> CredentialHash {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    CredentialHash::new(format!("{:x}", hasher.finalize()))
}

/// Generate a new session token.
pub fn generate_session_token() -> String {
    random_token()
}

/// Generate a new API key: `sk_` followed by base64url random bytes.
///
/// Returns (full_key, display_prefix, hash).
pub fn generate_api_key() -> (String, ApiKeyPrefix, CredentialHash) {
    let full_key = format!("{}{}", API_KEY_PREFIX, random_token());
    let prefix = ApiKeyPrefix::new(&full_key[..API_KEY_PREFIX.len() + DISPLAY_PREFIX_CHARS]);
    let hash = hash_credential(&full_key);
    (full_key, prefix, hash)
}

/// Compare two secrets without short-circuiting on the first differing byte.
///
/// Both sides are hashed first so the comparison length never depends on
/// the presented value.
pub fn constant_time_eq(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hash a password using Argon2id. Returns the PHC string.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

/// Verify a password against a stored PHC hash.
pub fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}
