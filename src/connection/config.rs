use crate::core::{Result, StoreError};
use crate::persist::RecordCodec;
use rand::Rng;

const URL_SCHEME: &str = "kvsessions://";

/// Configuration for automatic conflict retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictRetryPolicy {
    /// Maximum number of read-modify-commit attempts per update.
    pub max_attempts: usize,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl ConflictRetryPolicy {
    /// Computes exponential retry backoff in milliseconds after `attempt`
    /// (1-based) was rejected.
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = self.base_backoff_ms;
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }

    /// Sleep before the next attempt, drawn uniformly from
    /// `[0, backoff_ms(attempt)]` so writers that lost the same round do not
    /// reload in lockstep.
    pub fn jittered_backoff_ms(&self, attempt: usize) -> u64 {
        let cap = self.backoff_ms(attempt);
        if cap == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=cap)
    }
}

/// Store configuration
///
/// Similar to a Redis connection string plus the engine's own knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Store host (used by remote `KvStore` implementations)
    pub host: String,

    /// Store port (used by remote `KvStore` implementations)
    pub port: u16,

    /// First segment of every key
    pub namespace: String,

    /// Conflict retry budget and backoff
    pub retry: ConflictRetryPolicy,

    /// Keys examined per scan round-trip
    pub scan_page_size: usize,

    /// Payload encoding of primary records
    pub codec: RecordCodec,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("kvsessions")
    }
}

impl StoreConfig {
    /// Create a new configuration for a key namespace
    pub fn new(namespace: &str) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            namespace: namespace.to_string(),
            retry: ConflictRetryPolicy::default(),
            scan_page_size: 100,
            codec: RecordCodec::default(),
        }
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set maximum update attempts
    pub fn max_attempts(mut self, max: usize) -> Self {
        self.retry.max_attempts = max;
        self
    }

    /// Set backoff bounds in milliseconds
    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.retry.base_backoff_ms = base;
        self.retry.max_backoff_ms = max;
        self
    }

    /// Set keys examined per scan round-trip
    pub fn scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    pub fn codec(mut self, codec: RecordCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Parse from connection string
    ///
    /// Format: `kvsessions://host:port/namespace?max_attempts=8&scan_page_size=100&codec=json`
    ///
    /// # Examples
    ///
    /// ```
    /// use kvsessions::StoreConfig;
    ///
    /// let config = StoreConfig::from_url("kvsessions://cache:6380/kc?max_attempts=5").unwrap();
    /// assert_eq!(config.namespace, "kc");
    /// assert_eq!(config.retry.max_attempts, 5);
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let invalid = |msg: &str| StoreError::InvalidConfig(format!("{}: '{}'", msg, url));

        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| invalid("URL must start with 'kvsessions://'"))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (host_port, namespace) = location
            .split_once('/')
            .ok_or_else(|| invalid("Invalid host/namespace format"))?;

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid("Invalid port"))?),
            None => (host_port, 6379),
        };

        let mut config = Self::new(namespace).host(host).port(port);

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("Invalid query parameter"))?;
            match name {
                "max_attempts" => {
                    config.retry.max_attempts =
                        value.parse().map_err(|_| invalid("Invalid max_attempts"))?;
                }
                "base_backoff_ms" => {
                    config.retry.base_backoff_ms =
                        value.parse().map_err(|_| invalid("Invalid base_backoff_ms"))?;
                }
                "max_backoff_ms" => {
                    config.retry.max_backoff_ms =
                        value.parse().map_err(|_| invalid("Invalid max_backoff_ms"))?;
                }
                "scan_page_size" => {
                    config.scan_page_size =
                        value.parse().map_err(|_| invalid("Invalid scan_page_size"))?;
                }
                "codec" => {
                    config.codec =
                        RecordCodec::from_name(value).ok_or_else(|| invalid("Unknown codec"))?;
                }
                _ => return Err(invalid("Unknown query parameter")),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        format!(
            "{}{}:{}/{}?max_attempts={}&base_backoff_ms={}&max_backoff_ms={}&scan_page_size={}&codec={}",
            URL_SCHEME,
            self.host,
            self.port,
            self.namespace,
            self.retry.max_attempts,
            self.retry.base_backoff_ms,
            self.retry.max_backoff_ms,
            self.scan_page_size,
            self.codec.name()
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(StoreError::InvalidConfig("namespace cannot be empty".into()));
        }

        if self.namespace.contains(':') {
            return Err(StoreError::InvalidConfig("namespace cannot contain ':'".into()));
        }

        if self.retry.max_attempts == 0 {
            return Err(StoreError::InvalidConfig("max_attempts must be > 0".into()));
        }

        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(StoreError::InvalidConfig(
                "base_backoff_ms cannot exceed max_backoff_ms".into(),
            ));
        }

        if self.scan_page_size == 0 {
            return Err(StoreError::InvalidConfig("scan_page_size must be > 0".into()));
        }

        Ok(())
    }
}
