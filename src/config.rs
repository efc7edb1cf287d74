use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::TxnMiddlewareError;
use crate::retry::RetryPolicy;

/// Port used when the URI does not name one.
pub const DEFAULT_PORT: u16 = 7687;

static URI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://)?(?P<host>\[[0-9A-Fa-f:.]+\]|[^:/?#\[\]]+)(?::(?P<port>[0-9]+))?/?$",
    )
    .expect("URI pattern is valid")
});

/// Target address parsed from a driver URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parse `bolt://host:port`, `neo4j://host` or a bare `host[:port]`.
    ///
    /// # Errors
    /// Returns `TxnMiddlewareError::ConnectionError` if the URI is malformed, uses an unsupported
    /// scheme, or names an invalid port.
    pub fn parse(uri: &str) -> Result<Self, TxnMiddlewareError> {
        let caps = URI_PATTERN
            .captures(uri.trim())
            .ok_or_else(|| invalid_config(format!("malformed URI '{uri}'")))?;

        let scheme = caps
            .name("scheme")
            .map_or("bolt", |m| m.as_str())
            .to_ascii_lowercase();
        if scheme != "bolt" && scheme != "neo4j" {
            return Err(invalid_config(format!(
                "unsupported URI scheme '{scheme}' (expected bolt or neo4j)"
            )));
        }

        let host = caps
            .name("host")
            .map(|m| m.as_str().to_owned())
            .ok_or_else(|| invalid_config(format!("missing host in URI '{uri}'")))?;

        let port = match caps.name("port") {
            Some(m) => m
                .as_str()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid_config(format!("invalid port in URI '{uri}'")))?,
            None => DEFAULT_PORT,
        };

        Ok(Self { scheme, host, port })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Credentials handed to the transport untouched.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AuthToken {
    #[default]
    None,
    Basic {
        principal: String,
        credentials: String,
    },
    Bearer {
        credentials: String,
    },
}

// Keep secrets out of logs.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { principal, .. } => f
                .debug_struct("Basic")
                .field("principal", principal)
                .field("credentials", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("credentials", &"<redacted>")
                .finish(),
        }
    }
}

/// Options for creating a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub uri: String,
    pub auth: AuthToken,
    /// Upper bound for establishing the link
    pub connect_timeout: Duration,
    /// Client-side bound for a single transport request; `None` waits indefinitely
    pub request_timeout: Option<Duration>,
    /// Number of records the transport should pull per round trip
    pub fetch_size: u32,
    /// Policy for controllers created through the connection
    pub retry: RetryPolicy,
}

impl DriverConfig {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            auth: AuthToken::None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            fetch_size: 1000,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn builder(uri: impl Into<String>) -> DriverConfigBuilder {
        DriverConfigBuilder::new(uri)
    }

    /// Parse and validate the target address.
    ///
    /// # Errors
    /// Returns `TxnMiddlewareError::ConnectionError` if the URI or the numeric options are invalid.
    pub fn address(&self) -> Result<Address, TxnMiddlewareError> {
        if self.fetch_size == 0 {
            return Err(invalid_config("fetch_size must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid_config("connect_timeout must be positive"));
        }
        Address::parse(&self.uri)
    }

    /// Load options from a JSON document.
    ///
    /// ```rust
    /// use txn_middleware::DriverConfig;
    ///
    /// let cfg = DriverConfig::from_json(
    ///     r#"{"uri": "neo4j://db.local", "connect_timeout_ms": 250, "retry": {"max_attempts": 3}}"#,
    /// )
    /// .unwrap();
    /// assert_eq!(cfg.retry.max_attempts, 3);
    /// assert_eq!(cfg.address().unwrap().port, 7687);
    /// ```
    ///
    /// # Errors
    /// Returns `TxnMiddlewareError::ConnectionError` if the document does not describe a valid
    /// configuration.
    pub fn from_json(json: &str) -> Result<Self, TxnMiddlewareError> {
        let raw: RawDriverConfig = serde_json::from_str(json)
            .map_err(|e| invalid_config(format!("unreadable driver config: {e}")))?;
        Ok(raw.into_config())
    }
}

/// Fluent builder for [`DriverConfig`].
#[derive(Debug, Clone)]
pub struct DriverConfigBuilder {
    cfg: DriverConfig,
}

impl DriverConfigBuilder {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            cfg: DriverConfig::new(uri),
        }
    }

    #[must_use]
    pub fn basic_auth(mut self, principal: impl Into<String>, credentials: impl Into<String>) -> Self {
        self.cfg.auth = AuthToken::Basic {
            principal: principal.into(),
            credentials: credentials.into(),
        };
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: AuthToken) -> Self {
        self.cfg.auth = auth;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn fetch_size(mut self, fetch_size: u32) -> Self {
        self.cfg.fetch_size = fetch_size;
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.cfg.retry = policy;
        self
    }

    #[must_use]
    pub fn finish(self) -> DriverConfig {
        self.cfg
    }
}

#[derive(Debug, Deserialize)]
struct RawDriverConfig {
    uri: String,
    #[serde(default)]
    auth: AuthToken,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    fetch_size: Option<u32>,
    #[serde(default)]
    retry: RawRetryPolicy,
}

#[derive(Debug, Default, Deserialize)]
struct RawRetryPolicy {
    max_attempts: Option<u32>,
    max_retry_time_ms: Option<u64>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    retry_connection_errors: Option<bool>,
}

impl RawDriverConfig {
    fn into_config(self) -> DriverConfig {
        let mut cfg = DriverConfig::new(self.uri);
        cfg.auth = self.auth;
        if let Some(ms) = self.connect_timeout_ms {
            cfg.connect_timeout = Duration::from_millis(ms);
        }
        cfg.request_timeout = self.request_timeout_ms.map(Duration::from_millis);
        if let Some(fetch_size) = self.fetch_size {
            cfg.fetch_size = fetch_size;
        }

        let raw = self.retry;
        let policy = &mut cfg.retry;
        if let Some(n) = raw.max_attempts {
            policy.max_attempts = n;
        }
        if let Some(ms) = raw.max_retry_time_ms {
            policy.max_retry_time = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = raw.initial_delay_ms {
            policy.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(m) = raw.multiplier {
            policy.multiplier = m;
        }
        if let Some(j) = raw.jitter {
            policy.jitter = j;
        }
        if let Some(flag) = raw.retry_connection_errors {
            policy.retry_connection_errors = flag;
        }
        cfg
    }
}

fn invalid_config(msg: impl fmt::Display) -> TxnMiddlewareError {
    TxnMiddlewareError::ConnectionError(format!("invalid configuration: {msg}"))
}
