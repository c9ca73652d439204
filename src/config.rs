use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use crate::gateway::RouteClass;

pub const DEFAULT_JSON_BODY_CAP: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MEDIA_BODY_CAP: u64 = 50 * 1024 * 1024;

/// Timeout and response cap applied to one class of routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLimits {
    pub timeout: Duration,
    pub body_cap: u64,
}

/// Gateway process configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    /// Static administrative bearer token. `None` disables the bypass.
    pub shared_secret: Option<String>,
    pub user_service_url: String,
    pub ai_service_url: String,
    pub analytics_service_url: String,
    /// Base of the remote verification contract (`/verify-session`, `/validate-key`)
    pub verify_url: String,
    pub verify_timeout: Duration,
    pub metadata: ClassLimits,
    pub media: ClassLimits,
    /// Optional JSON file replacing the built-in route table
    pub routes_file: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let user_service_url = "http://user-service:8081".to_string();
        Self {
            bind: "0.0.0.0:8080".to_string(),
            shared_secret: None,
            verify_url: format!("{}/internal", user_service_url),
            user_service_url,
            ai_service_url: "http://ai-service:8082".to_string(),
            analytics_service_url: "http://analytics-service:8083".to_string(),
            verify_timeout: Duration::from_secs(5),
            metadata: ClassLimits {
                timeout: Duration::from_secs(30),
                body_cap: DEFAULT_JSON_BODY_CAP,
            },
            media: ClassLimits {
                timeout: Duration::from_secs(120),
                body_cap: DEFAULT_MEDIA_BODY_CAP,
            },
            routes_file: None,
        }
    }
}

impl GatewayConfig {
    /// Build the configuration from environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let user_service_url = env_or("USER_SERVICE_URL", &defaults.user_service_url);
        let verify_url = env::var("IDENTITY_VERIFY_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("{}/internal", user_service_url.trim_end_matches('/')));

        Ok(Self {
            bind: env_or("GATEWAY_BIND", &defaults.bind),
            shared_secret: env::var("API_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            ai_service_url: env_or("AI_SERVICE_URL", &defaults.ai_service_url),
            analytics_service_url: env_or("ANALYTICS_SERVICE_URL", &defaults.analytics_service_url),
            user_service_url,
            verify_url,
            verify_timeout: Duration::from_secs(env_parse(
                "VERIFY_TIMEOUT_SECS",
                defaults.verify_timeout.as_secs(),
            )?),
            metadata: ClassLimits {
                timeout: Duration::from_secs(env_parse(
                    "METADATA_TIMEOUT_SECS",
                    defaults.metadata.timeout.as_secs(),
                )?),
                body_cap: env_parse("JSON_BODY_CAP_BYTES", defaults.metadata.body_cap)?,
            },
            media: ClassLimits {
                timeout: Duration::from_secs(env_parse(
                    "MEDIA_TIMEOUT_SECS",
                    defaults.media.timeout.as_secs(),
                )?),
                body_cap: env_parse("MEDIA_BODY_CAP_BYTES", defaults.media.body_cap)?,
            },
            routes_file: env::var("GATEWAY_ROUTES_FILE")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }

    /// Limits for a route class.
    pub fn limits(&self, class: RouteClass) -> ClassLimits {
        match class {
            RouteClass::Metadata => self.metadata,
            RouteClass::Media => self.media,
        }
    }
}

/// Identity service configuration.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub bind: String,
    pub session_ttl: chrono::Duration,
    /// Lifetime of API keys created without an explicit expiry
    pub api_key_ttl: chrono::Duration,
    /// Interval of the expired-session sweeper. `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8081".to_string(),
            session_ttl: chrono::Duration::hours(24),
            api_key_ttl: chrono::Duration::days(365),
            sweep_interval: None,
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let sweep_secs: u64 = env_parse("SESSION_SWEEP_INTERVAL_SECS", 0)?;

        Ok(Self {
            bind: env_or("IDENTITY_BIND", &defaults.bind),
            session_ttl: lifetime(
                "SESSION_TTL_HOURS",
                env_parse("SESSION_TTL_HOURS", defaults.session_ttl.num_hours())?,
                chrono::Duration::try_hours,
            )?,
            api_key_ttl: lifetime(
                "API_KEY_TTL_DAYS",
                env_parse("API_KEY_TTL_DAYS", defaults.api_key_ttl.num_days())?,
                chrono::Duration::try_days,
            )?,
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        })
    }
}

/// Convert a configured lifetime, rejecting values that are not positive or
/// that would put an expiry past the end of the calendar.
pub fn lifetime(
    name: &str,
    value: i64,
    unit: fn(i64) -> Option<chrono::Duration>,
) -> anyhow::Result<chrono::Duration> {
    unit(value)
        .filter(|ttl| *ttl > chrono::Duration::zero())
        .filter(|ttl| chrono::Utc::now().checked_add_signed(*ttl).is_some())
        .ok_or_else(|| anyhow::anyhow!("{} out of range: {}", name, value))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", name, raw, e)),
        _ => Ok(default),
    }
}

/// On-disk route table.
#[derive(Debug, Deserialize)]
pub struct RoutesFile {
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub public: Vec<PublicEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteEntry {
    pub prefix: String,
    pub upstream: String,
    #[serde(default)]
    pub class: RouteClass,
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub body_cap_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublicEntry {
    pub prefix: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub exact: bool,
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_route(entry: RouteEntry) -> RouteEntry {
    let mut entry = entry;
    entry.prefix = expand_env_vars(&entry.prefix);
    entry.upstream = expand_env_vars(&entry.upstream);
    if let Some(rewrite) = entry.rewrite.as_mut() {
        *rewrite = expand_env_vars(rewrite);
    }
    entry
}

/// Read a routes file, expanding `${VAR}` references in its string values.
pub fn load_routes_file(path: &Path) -> anyhow::Result<RoutesFile> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Could not read routes file {}: {}", path.display(), e))?;
    let mut cfg: RoutesFile = serde_json::from_str(&raw)?;

    cfg.routes = cfg.routes.into_iter().map(expand_route).collect();
    for entry in cfg.public.iter_mut() {
        entry.prefix = expand_env_vars(&entry.prefix);
    }

    Ok(cfg)
}
