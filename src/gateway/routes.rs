//! Static route table: path prefix to upstream base URL.

use std::time::Duration;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::{GatewayConfig, RoutesFile, load_routes_file};

/// Payload class of a route, selecting its timeout and response cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// JSON APIs: short timeout, small cap
    #[default]
    Metadata,
    /// Binary and media payloads: long timeout, large cap
    Media,
}

/// A resolved forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    prefix: String,
    upstream: Url,
    class: RouteClass,
    rewrite: Option<String>,
    timeout: Duration,
    body_cap: u64,
}

impl Route {
    /// Create a route. `upstream` must be an absolute http(s) URL.
    pub fn new(
        prefix: &str,
        upstream: &str,
        class: RouteClass,
        timeout: Duration,
        body_cap: u64,
    ) -> anyhow::Result<Self> {
        let url = Url::parse(upstream)
            .map_err(|e| anyhow::anyhow!("Invalid upstream URL `{}`: {}", upstream, e))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(anyhow::anyhow!(
                "Upstream `{}` must be an absolute http(s) URL",
                upstream
            ));
        }

        Ok(Self {
            prefix: normalize_prefix(prefix),
            upstream: url,
            class,
            rewrite: None,
            timeout,
            body_cap,
        })
    }

    /// Replace the matched prefix with `rewrite` before forwarding.
    pub fn with_rewrite(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite = Some(rewrite.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn class(&self) -> RouteClass {
        self.class
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn body_cap(&self) -> u64 {
        self.body_cap
    }

    fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.prefix, path)
    }

    /// Build the outbound URL for an inbound path and query string.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let path = match &self.rewrite {
            Some(rewrite) => {
                let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
                let rewritten = format!("{}{}", rewrite.trim_end_matches('/'), rest);
                if rewritten.is_empty() {
                    "/".to_string()
                } else {
                    rewritten
                }
            }
            None => path.to_string(),
        };

        let base = self.upstream.as_str().trim_end_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", base, path, q),
            _ => format!("{}{}", base, path),
        }
    }
}

/// A path exempt from authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicRoute {
    prefix: String,
    method: Option<Method>,
    exact: bool,
}

impl PublicRoute {
    /// Any path under `prefix`, any method.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            prefix: normalize_prefix(prefix),
            method: None,
            exact: false,
        }
    }

    /// Exactly `path`, any method.
    pub fn exact(path: &str) -> Self {
        Self {
            exact: true,
            ..Self::prefix(path)
        }
    }

    /// Restrict to one method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    fn allows(&self, method: &Method, path: &str) -> bool {
        if let Some(m) = &self.method
            && m != method
        {
            return false;
        }
        if self.exact {
            normalize_prefix(path) == self.prefix
        } else {
            prefix_matches(&self.prefix, path)
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Segment-aware prefix test: `/api/v1/keys` matches `/api/v1/keys/x`, not `/api/v1/keysmith`.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// True if any segment of `path` is `.` or `..`, literally or percent-encoded.
///
/// URL parsing collapses these segments, so such a path would be routed under
/// one prefix and sent upstream under another. `\` counts as a separator
/// because `http` URLs treat it as one.
pub fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Immutable route table shared by every request.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    public: Vec<PublicRoute>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Route>, public: Vec<PublicRoute>) -> Self {
        // Longest prefix first so the most specific route wins
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes, public }
    }

    /// Find the route for `path`, if any.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    /// Whether `method path` skips authentication.
    pub fn is_public(&self, method: &Method, path: &str) -> bool {
        self.public.iter().any(|p| p.allows(method, path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Build the table from a routes file, applying class defaults from `config`.
    pub fn from_file(file: RoutesFile, config: &GatewayConfig) -> anyhow::Result<Self> {
        let mut routes = Vec::with_capacity(file.routes.len());
        for entry in file.routes {
            let limits = config.limits(entry.class);
            let timeout = entry
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(limits.timeout);
            let body_cap = entry.body_cap_bytes.unwrap_or(limits.body_cap);

            let mut route = Route::new(&entry.prefix, &entry.upstream, entry.class, timeout, body_cap)?;
            if let Some(rewrite) = entry.rewrite {
                route = route.with_rewrite(rewrite);
            }
            routes.push(route);
        }

        let mut public = Vec::with_capacity(file.public.len());
        for entry in file.public {
            let mut rule = if entry.exact {
                PublicRoute::exact(&entry.prefix)
            } else {
                PublicRoute::prefix(&entry.prefix)
            };
            if let Some(method) = entry.method {
                let method = Method::from_bytes(method.to_uppercase().as_bytes())
                    .map_err(|e| anyhow::anyhow!("Invalid method `{}`: {}", method, e))?;
                rule = rule.with_method(method);
            }
            public.push(rule);
        }

        Ok(Self::new(routes, public))
    }

    /// Load the configured routes file, or fall back to the built-in table.
    pub fn from_config(config: &GatewayConfig) -> anyhow::Result<Self> {
        match &config.routes_file {
            Some(path) => Self::from_file(load_routes_file(path)?, config),
            None => default_routes(config),
        }
    }
}

const USER_PREFIXES: &[&str] = &[
    "/api/v1/users",
    "/api/v1/login",
    "/api/v1/logout",
    "/api/v1/verify-session",
    "/api/v1/keys",
];

const AI_PREFIXES: &[(&str, RouteClass)] = &[
    ("/api/v1/completions", RouteClass::Metadata),
    ("/api/v1/embeddings", RouteClass::Metadata),
    ("/api/v1/similarity", RouteClass::Metadata),
    ("/api/v1/images", RouteClass::Media),
    ("/api/v1/audio", RouteClass::Media),
    ("/api/v1/tts", RouteClass::Media),
];

const ANALYTICS_PREFIXES: &[&str] = &["/api/v1/analytics", "/api/v1/stats"];

/// The built-in table: user, AI and analytics services.
pub fn default_routes(config: &GatewayConfig) -> anyhow::Result<RouteTable> {
    let route = |prefix: &str, upstream: &str, class: RouteClass| {
        let limits = config.limits(class);
        Route::new(prefix, upstream, class, limits.timeout, limits.body_cap)
    };

    let mut routes = Vec::new();
    for prefix in USER_PREFIXES {
        routes.push(route(*prefix, &config.user_service_url, RouteClass::Metadata)?);
    }
    for (prefix, class) in AI_PREFIXES {
        routes.push(route(*prefix, &config.ai_service_url, *class)?);
    }
    for prefix in ANALYTICS_PREFIXES {
        routes.push(route(*prefix, &config.analytics_service_url, RouteClass::Metadata)?);
    }

    let public = vec![
        PublicRoute::exact("/api/v1/login"),
        PublicRoute::exact("/api/v1/users").with_method(Method::POST),
    ];

    Ok(RouteTable::new(routes, public))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PublicEntry, RouteEntry};

    fn table() -> RouteTable {
        default_routes(&GatewayConfig::default()).unwrap()
    }

    #[test]
    fn test_resolve_is_segment_aware() {
        let table = table();

        let keys = table.resolve("/api/v1/keys").unwrap();
        assert_eq!(keys.upstream().as_str(), "http://user-service:8081/");
        assert!(table.resolve("/api/v1/keys/abc").is_some());
        assert!(table.resolve("/api/v1/keysmith").is_none());
        assert!(table.resolve("/unknown").is_none());
        assert!(table.resolve("/").is_none());
    }

    #[test]
    fn test_media_routes_use_media_limits() {
        let config = GatewayConfig::default();
        let table = table();

        let images = table.resolve("/api/v1/images/generate").unwrap();
        assert_eq!(images.class(), RouteClass::Media);
        assert_eq!(images.timeout(), config.media.timeout);
        assert_eq!(images.body_cap(), config.media.body_cap);

        let completions = table.resolve("/api/v1/completions").unwrap();
        assert_eq!(completions.class(), RouteClass::Metadata);
        assert_eq!(completions.body_cap(), config.metadata.body_cap);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let config = GatewayConfig::default();
        let short = Route::new("/api", "http://a:1", RouteClass::Metadata, config.metadata.timeout, 1).unwrap();
        let long = Route::new("/api/v1/ai", "http://b:2", RouteClass::Metadata, config.metadata.timeout, 1).unwrap();
        let table = RouteTable::new(vec![short, long], vec![]);

        assert_eq!(table.resolve("/api/v1/ai/chat").unwrap().prefix(), "/api/v1/ai");
        assert_eq!(table.resolve("/api/other").unwrap().prefix(), "/api");
    }

    #[test]
    fn test_public_allow_list() {
        let table = table();

        assert!(table.is_public(&Method::POST, "/api/v1/login"));
        assert!(table.is_public(&Method::POST, "/api/v1/users"));
        assert!(table.is_public(&Method::POST, "/api/v1/users/"));
        assert!(!table.is_public(&Method::GET, "/api/v1/users"));
        assert!(!table.is_public(&Method::POST, "/api/v1/users/u-1/roles"));
        assert!(!table.is_public(&Method::POST, "/api/v1/logout"));
    }

    #[test]
    fn test_target_url() {
        let route = table().resolve("/api/v1/stats").unwrap().clone();
        assert_eq!(
            route.target_url("/api/v1/stats/daily", Some("from=2024-01-01&to=2024-02-01")),
            "http://analytics-service:8083/api/v1/stats/daily?from=2024-01-01&to=2024-02-01"
        );
        assert_eq!(
            route.target_url("/api/v1/stats", None),
            "http://analytics-service:8083/api/v1/stats"
        );
    }

    #[test]
    fn test_target_url_with_rewrite() {
        let route = Route::new(
            "/api/v1/ai/",
            "http://ai:8082/base/",
            RouteClass::Metadata,
            Duration::from_secs(1),
            1,
        )
        .unwrap()
        .with_rewrite("/v1");

        assert_eq!(route.target_url("/api/v1/ai/chat", None), "http://ai:8082/base/v1/chat");
        assert_eq!(route.target_url("/api/v1/ai", Some("q=1")), "http://ai:8082/base/v1?q=1");
    }

    #[test]
    fn test_dot_segments_detected() {
        for path in [
            "/api/v1/stats/../../internal/validate-key",
            "/api/v1/stats/%2e%2e/%2E%2E/internal",
            "/api/v1/stats/.%2e/x",
            "/api/v1/stats/./daily",
            "/api/v1/stats/..",
            "/api/v1/stats\\..\\..\\internal",
        ] {
            assert!(has_dot_segment(path), "{}", path);
        }

        for path in ["/api/v1/stats", "/api/v1/stats/daily.json", "/api/v1/files/...", "/a/.hidden"] {
            assert!(!has_dot_segment(path), "{}", path);
        }
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let timeout = Duration::from_secs(1);
        assert!(Route::new("/x", "not a url", RouteClass::Metadata, timeout, 1).is_err());
        assert!(Route::new("/x", "ftp://files:21", RouteClass::Metadata, timeout, 1).is_err());
        assert!(Route::new("/x", "unix:/tmp/sock", RouteClass::Metadata, timeout, 1).is_err());
    }

    #[test]
    fn test_from_file_applies_overrides() {
        let config = GatewayConfig::default();
        let file = RoutesFile {
            routes: vec![RouteEntry {
                prefix: "/api/v1/audio".to_string(),
                upstream: "http://audio:9000".to_string(),
                class: RouteClass::Media,
                rewrite: None,
                timeout_secs: Some(600),
                body_cap_bytes: None,
            }],
            public: vec![PublicEntry {
                prefix: "/api/v1/audio/samples".to_string(),
                method: Some("get".to_string()),
                exact: false,
            }],
        };

        let table = RouteTable::from_file(file, &config).unwrap();
        let route = table.resolve("/api/v1/audio/x").unwrap();
        assert_eq!(route.timeout(), Duration::from_secs(600));
        assert_eq!(route.body_cap(), config.media.body_cap);
        assert!(table.is_public(&Method::GET, "/api/v1/audio/samples/1.wav"));
        assert!(!table.is_public(&Method::POST, "/api/v1/audio/samples/1.wav"));
    }
}
