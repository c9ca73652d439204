//! Request interceptors, applied in order: route resolution, authentication, forwarding.
//!
//! Each interceptor either short-circuits with a response or hands the
//! request on through `Next`. State flows between them as typed request
//! extensions (`ResolvedRoute`, `Authenticated`).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::auth::{AuthError, AuthExtractor, Authenticated, RemoteVerifier};
use crate::config::GatewayConfig;
use crate::gateway::proxy::Forwarder;
use crate::gateway::routes::{Route, RouteTable, has_dot_segment};

/// Everything the interceptors need. Immutable after start-up.
pub struct GatewayState {
    routes: RouteTable,
    extractor: AuthExtractor,
    forwarder: Forwarder,
}

pub type SharedGateway = Arc<GatewayState>;

impl GatewayState {
    pub fn new(routes: RouteTable, extractor: AuthExtractor, forwarder: Forwarder) -> Self {
        Self {
            routes,
            extractor,
            forwarder,
        }
    }

    /// Wire the route table, remote verifier and forwarder from configuration.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        let routes = RouteTable::from_config(config)?;
        let verifier = RemoteVerifier::new(config.verify_url.clone(), config.verify_timeout)?;
        let extractor =
            AuthExtractor::new(Arc::new(verifier)).with_shared_secret(config.shared_secret.clone());
        Ok(Self::new(routes, extractor, Forwarder::new()?))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

/// The route chosen for this request.
#[derive(Debug, Clone)]
pub struct ResolvedRoute(pub Route);

/// Attach the matching route, or answer 400/404 before any credential is looked at.
pub async fn resolve_route(
    State(state): State<SharedGateway>,
    mut req: Request,
    next: Next,
) -> Response {
    if has_dot_segment(req.uri().path()) {
        warn!(method = %req.method(), path = %req.uri().path(), "Rejected path with dot segments");
        return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
    }

    let Some(route) = state.routes.resolve(req.uri().path()).cloned() else {
        debug!(method = %req.method(), path = %req.uri().path(), "No route");
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    req.extensions_mut().insert(ResolvedRoute(route));
    next.run(req).await
}

/// Authenticate everything not on the allow-list. Failures end the request with 401.
pub async fn authenticate(
    State(state): State<SharedGateway>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if state.routes.is_public(req.method(), req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let span = info_span!("authenticate", method = %req.method(), path = %req.uri().path());
    let authenticated = state
        .extractor
        .authenticate(req.headers())
        .instrument(span)
        .await?;

    if let Some(identity) = authenticated.identity() {
        debug!(subject_id = %identity.subject_id(), "Authenticated request");
    }

    req.extensions_mut().insert(authenticated);
    Ok(next.run(req).await)
}

/// Terminal handler: forward to the resolved upstream.
pub async fn forward(State(state): State<SharedGateway>, req: Request) -> Response {
    let Some(ResolvedRoute(route)) = req.extensions().get::<ResolvedRoute>().cloned() else {
        error!(path = %req.uri().path(), "Forward reached without a resolved route");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let authenticated = req.extensions().get::<Authenticated>().cloned();

    state
        .forwarder
        .forward(&route, authenticated.as_ref(), req)
        .await
}
