use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE").unwrap_or_else(|_| "authgate".to_string()),
            database: env::var("SURREALDB_DATABASE").unwrap_or_else(|_| "identity".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

/// Define the credential store tables. Safe to run on every start.
pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = vec![
        // Subjects
        "DEFINE TABLE IF NOT EXISTS subject SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS subject_id ON TABLE subject TYPE string;
         DEFINE FIELD IF NOT EXISTS username ON TABLE subject TYPE string;
         DEFINE FIELD IF NOT EXISTS email ON TABLE subject TYPE string;
         DEFINE FIELD IF NOT EXISTS password_hash ON TABLE subject TYPE string;
         DEFINE FIELD IF NOT EXISTS first_name ON TABLE subject TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS last_name ON TABLE subject TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS is_active ON TABLE subject TYPE bool DEFAULT true;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE subject TYPE datetime DEFAULT time::now();
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE subject VALUE time::now();",

        // Sessions, keyed by the digest of the bearer token
        "DEFINE TABLE IF NOT EXISTS session SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS token_hash ON TABLE session TYPE string;
         DEFINE FIELD IF NOT EXISTS subject_id ON TABLE session TYPE string;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE session TYPE datetime DEFAULT time::now();
         DEFINE FIELD IF NOT EXISTS expires_at ON TABLE session TYPE datetime;",

        // API keys
        "DEFINE TABLE IF NOT EXISTS api_key SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS key_id ON TABLE api_key TYPE string;
         DEFINE FIELD IF NOT EXISTS key_hash ON TABLE api_key TYPE string;
         DEFINE FIELD IF NOT EXISTS key_prefix ON TABLE api_key TYPE string;
         DEFINE FIELD IF NOT EXISTS subject_id ON TABLE api_key TYPE string;
         DEFINE FIELD IF NOT EXISTS name ON TABLE api_key TYPE string;
         DEFINE FIELD IF NOT EXISTS is_active ON TABLE api_key TYPE bool DEFAULT true;
         DEFINE FIELD IF NOT EXISTS expires_at ON TABLE api_key TYPE datetime;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE api_key TYPE datetime DEFAULT time::now();
         DEFINE FIELD IF NOT EXISTS last_used_at ON TABLE api_key TYPE option<datetime>;",

        // Role assignments
        "DEFINE TABLE IF NOT EXISTS subject_role SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS subject_id ON TABLE subject_role TYPE string;
         DEFINE FIELD IF NOT EXISTS role ON TABLE subject_role TYPE string ASSERT string::len($value) > 0;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE subject_role TYPE datetime DEFAULT time::now();",

        // Indexes
        "DEFINE INDEX IF NOT EXISTS subject_subject_id ON TABLE subject COLUMNS subject_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS subject_username ON TABLE subject COLUMNS username UNIQUE;
         DEFINE INDEX IF NOT EXISTS subject_email ON TABLE subject COLUMNS email UNIQUE;
         DEFINE INDEX IF NOT EXISTS session_token_hash ON TABLE session COLUMNS token_hash UNIQUE;
         DEFINE INDEX IF NOT EXISTS session_subject ON TABLE session COLUMNS subject_id;
         DEFINE INDEX IF NOT EXISTS api_key_key_id ON TABLE api_key COLUMNS key_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS api_key_hash ON TABLE api_key COLUMNS key_hash UNIQUE;
         DEFINE INDEX IF NOT EXISTS api_key_prefix ON TABLE api_key COLUMNS key_prefix;
         DEFINE INDEX IF NOT EXISTS api_key_subject ON TABLE api_key COLUMNS subject_id;
         DEFINE INDEX IF NOT EXISTS subject_role_subject ON TABLE subject_role COLUMNS subject_id;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}
