//! Configuration snapshot for the gateway.
//!
//! All configuration is loaded from environment variables exactly once,
//! before any network resource is opened. The resulting [`ServerConfig`]
//! is immutable and passed by reference to every stage of the bootstrap.
//!
//! Loading goes through a lookup function so tests can supply a map
//! instead of mutating the process environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_db::{ConnectPolicy, PostgresConfig};

use crate::cors::{AllowedOrigins, CorsError, CorsPolicy};

/// Default interface the listener binds.
const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Default static asset root.
const DEFAULT_PUBLIC_DIR: &str = "public";

/// Default maximum request body size (100 KiB).
const DEFAULT_BODY_LIMIT_BYTES: usize = 102_400;

/// Default persistence URL.
const DEFAULT_DATABASE_URL: &str = "postgresql://localhost:5432/parley";

/// Errors that can occur when resolving configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is absent or empty.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is present but cannot be parsed.
    #[error("invalid value for {var}: {message}")]
    Invalid {
        /// Name of the offending variable.
        var: &'static str,
        /// Why the value was rejected.
        message: String,
    },
}

/// Cross-origin policy errors are attributed to the variable that enables
/// credentials.
impl From<CorsError> for ConfigError {
    fn from(err: CorsError) -> Self {
        Self::Invalid {
            var: "CORS_ALLOW_CREDENTIALS",
            message: err.to_string(),
        }
    }
}

/// Immutable configuration resolved at process start.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Externally reachable host, used for the advertised base URL
    /// (e.g. `http://localhost`).
    pub host: String,
    /// TCP port to listen on. `0` asks the OS for a free port.
    pub port: u16,
    /// Interface the listener binds (default `0.0.0.0`).
    pub bind_addr: IpAddr,
    /// Directory served as static assets.
    pub public_dir: PathBuf,
    /// Maximum accepted request body in bytes.
    pub body_limit: usize,
    /// Cross-origin policy shared by HTTP and the real-time transport.
    pub cors: CorsPolicy,
    /// Persistence pool settings.
    pub database: PostgresConfig,
    /// Timeout and retry policy around the persistence connect.
    pub connect_policy: ConnectPolicy,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// Required variables:
    /// - `HOST` -- externally reachable host or base URL
    /// - `PORT` -- TCP port
    ///
    /// Optional variables:
    /// - `BIND_ADDR` -- listener interface (default `0.0.0.0`)
    /// - `PUBLIC_DIR` -- static asset root (default `public`)
    /// - `BODY_LIMIT_BYTES` -- max request body (default 102400)
    /// - `CORS_ALLOWED_ORIGINS` -- `*` or a comma-separated list (default `*`)
    /// - `CORS_ALLOW_CREDENTIALS` -- `true`/`false` (default `false`)
    /// - `DATABASE_URL` -- persistence URL
    /// - `DB_MAX_CONNECTIONS` -- pool size (default 10)
    /// - `DB_CONNECT_TIMEOUT_MS` -- per-attempt connect deadline (default 5000)
    /// - `DB_CONNECT_RETRIES` -- retries after the first attempt (default 3)
    /// - `DB_RETRY_BASE_MS` -- backoff base (default 250)
    /// - `DB_RETRY_MAX_MS` -- backoff cap (default 5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let host = get("HOST").ok_or(ConfigError::Missing("HOST"))?;
        let port: u16 = parse_required(&get, "PORT")?;

        let bind_addr = parse_or(&get, "BIND_ADDR", DEFAULT_BIND_ADDR)?;
        let public_dir = get("PUBLIC_DIR").map_or_else(|| PathBuf::from(DEFAULT_PUBLIC_DIR), PathBuf::from);
        let body_limit = parse_or(&get, "BODY_LIMIT_BYTES", DEFAULT_BODY_LIMIT_BYTES)?;

        let origins = get("CORS_ALLOWED_ORIGINS").map_or(AllowedOrigins::Any, |raw| {
            AllowedOrigins::parse(&raw)
        });
        let allow_credentials = parse_or(&get, "CORS_ALLOW_CREDENTIALS", false)?;
        let cors = CorsPolicy {
            origins,
            allow_credentials,
            ..CorsPolicy::default()
        };
        cors.validate()?;

        let defaults = ConnectPolicy::default();
        let connect_policy = ConnectPolicy {
            attempt_timeout: parse_millis_or(&get, "DB_CONNECT_TIMEOUT_MS", defaults.attempt_timeout)?,
            max_retries: parse_or(&get, "DB_CONNECT_RETRIES", defaults.max_retries)?,
            base_delay: parse_millis_or(&get, "DB_RETRY_BASE_MS", defaults.base_delay)?,
            max_delay: parse_millis_or(&get, "DB_RETRY_MAX_MS", defaults.max_delay)?,
        };

        let database_url = get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned());
        let mut database = PostgresConfig::new(&database_url)
            .with_connect_timeout(connect_policy.attempt_timeout);
        if let Some(max) = get("DB_MAX_CONNECTIONS") {
            let max = parse_value::<u32>("DB_MAX_CONNECTIONS", &max)?;
            database = database.with_max_connections(max);
        }

        Ok(Self {
            host,
            port,
            bind_addr,
            public_dir,
            body_limit,
            cors,
            database,
            connect_policy,
        })
    }

    /// The externally reachable base address for `port`.
    ///
    /// `HOST` may carry a scheme (`http://localhost`); a bare host name is
    /// prefixed with `http://`. The port is passed explicitly so the
    /// address reflects the port actually bound when `PORT` is `0`.
    pub fn base_url(&self, port: u16) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            format!("{host}:{port}")
        } else {
            format!("http://{host}:{port}")
        }
    }
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        message: format!("{raw:?}: {e}"),
    })
}

fn parse_required<T, G>(get: &G, var: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(var).ok_or(ConfigError::Missing(var))?;
    parse_value(var, &raw)
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(var).map_or(Ok(default), |raw| parse_value(var, &raw))
}

fn parse_millis_or<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(var).map_or(Ok(default), |raw| {
        parse_value::<u64>(var, &raw).map(Duration::from_millis)
    })
}
