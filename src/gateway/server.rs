use axum::{Router, middleware, routing::get};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::gateway::middleware::{GatewayState, SharedGateway, authenticate, forward, resolve_route};

/// Build the gateway router: `/health` plus the proxied surface.
pub fn create_gateway_router(state: SharedGateway) -> Router {
    let proxied = Router::new()
        .fallback(forward)
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(middleware::from_fn_with_state(state.clone(), resolve_route))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .fallback_service(proxied)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn health_check() -> &'static str {
    "OK"
}

/// Run the gateway until the listener fails.
pub async fn start_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    let state = GatewayState::from_config(&config)?;
    tracing::info!(
        routes = state.routes().routes().len(),
        verify_url = %config.verify_url,
        shared_secret = config.shared_secret.is_some(),
        "Gateway configured"
    );

    let router = create_gateway_router(std::sync::Arc::new(state));
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!("Gateway listening on http://{}", config.bind);

    axum::serve(listener, router).await?;

    Ok(())
}
