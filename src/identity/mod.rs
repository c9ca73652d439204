//! Identity service: owns subjects, sessions and API keys.
//!
//! Serves login/logout, account creation, API key management and the
//! `/internal` verification contract consumed by the gateway's
//! `RemoteVerifier`. Protected endpoints run the same credential
//! classification as the gateway, backed by a local `StoreVerifier`.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, info, info_span, warn};

use crate::auth::{
    AuthError, AuthExtractor, Authenticated, CredentialStore, StoreVerifier, SubjectStore,
};
use crate::config::IdentityConfig;
use crate::db::{DatabaseConfig, Db, create_connection, ensure_schema};

/// Stores, extractor and configuration shared by every handler.
pub struct IdentityState {
    pub subjects: SubjectStore,
    pub credentials: CredentialStore,
    pub extractor: AuthExtractor,
    pub config: IdentityConfig,
}

pub type SharedIdentity = Arc<IdentityState>;

impl IdentityState {
    /// Build the stores on `db`. The shared secret is never honoured here.
    pub fn new(db: Db, config: IdentityConfig) -> Self {
        let subjects = SubjectStore::new(db.clone());
        let credentials = CredentialStore::new(db);
        let extractor = AuthExtractor::new(Arc::new(StoreVerifier::new(credentials.clone())));
        Self {
            subjects,
            credentials,
            extractor,
            config,
        }
    }
}

/// Resolve the caller to an `Identity` extension, or answer 401.
pub async fn require_subject(
    State(state): State<SharedIdentity>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let span = info_span!("authenticate", method = %req.method(), path = %req.uri().path());
    let authenticated = state
        .extractor
        .authenticate(req.headers())
        .instrument(span)
        .await?;

    let Authenticated::Subject(identity) = authenticated else {
        return Err(AuthError::InvalidToken);
    };

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

pub fn create_identity_router(state: SharedIdentity) -> Router {
    let protected = Router::new()
        .route("/api/v1/logout", post(handlers::logout))
        .route("/api/v1/verify-session", post(handlers::verify_session))
        .route(
            "/api/v1/keys",
            post(handlers::create_key).get(handlers::list_keys),
        )
        .route(
            "/api/v1/keys/{id}",
            put(handlers::revoke_key).delete(handlers::delete_key),
        )
        .route(
            "/api/v1/users/{id}/roles",
            get(handlers::get_roles).put(handlers::replace_roles),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_subject));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/users", post(handlers::create_user))
        .route("/api/v1/login", post(handlers::login))
        .route(
            "/internal/verify-session",
            post(handlers::internal_verify_session),
        )
        .route(
            "/internal/validate-key",
            post(handlers::internal_validate_key),
        )
        .merge(protected)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// Periodically delete expired sessions. Lookups already reject them; this
/// only bounds storage growth.
pub fn spawn_session_sweeper(
    credentials: CredentialStore,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match credentials.purge_expired_sessions().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged expired sessions"),
                Err(e) => warn!(error = %e, "Session sweep failed"),
            }
        }
    })
}

/// Run the identity service until the listener fails.
pub async fn start_identity(config: IdentityConfig, db_config: DatabaseConfig) -> anyhow::Result<()> {
    info!(url = %db_config.url, "Connecting to credential store");
    let db = create_connection(db_config).await?;
    ensure_schema(&db).await?;

    let bind = config.bind.clone();
    let sweep_interval = config.sweep_interval;
    let state = Arc::new(IdentityState::new(db, config));

    if let Some(every) = sweep_interval {
        info!(interval_secs = every.as_secs(), "Session sweeper enabled");
        spawn_session_sweeper(state.credentials.clone(), every);
    }

    let router = create_identity_router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Identity service listening on http://{}", bind);

    axum::serve(listener, router).await?;

    Ok(())
}
