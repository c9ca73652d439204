// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod types;

// Services
pub mod gateway;
pub mod identity;

// Re-export key types and functions
pub use auth::{AuthExtractor, Authenticated, CredentialStore, Identity, SubjectStore};
pub use config::{GatewayConfig, IdentityConfig};
pub use db::{DatabaseConfig, Db, create_connection, ensure_schema};
pub use gateway::{GatewayState, create_gateway_router, start_gateway};
pub use identity::{IdentityState, create_identity_router, start_identity};
