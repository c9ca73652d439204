//! Authenticating reverse proxy.
//!
//! Requests pass through `resolve_route`, then `authenticate`, then
//! `forward`. The gateway holds no credential state of its own: every
//! non-public request is re-verified against the identity service.

mod integration_tests;
pub mod middleware;
pub mod proxy;
pub mod routes;
pub mod server;
mod test_support;

pub use middleware::{GatewayState, ResolvedRoute, SharedGateway};
pub use proxy::{Forwarder, ProxyError};
pub use routes::{PublicRoute, Route, RouteClass, RouteTable, default_routes};
pub use server::{create_gateway_router, start_gateway};
