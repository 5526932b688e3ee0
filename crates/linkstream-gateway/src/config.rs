//! Gateway configuration

use linkstream_core::{AdmissionConfig, FetchConfig, PoolConfig, SessionConfig};
use linkstream_upstream::{Credential, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix of environment variables read by [`GatewayConfig::load`]
pub const ENV_PREFIX: &str = "LINKSTREAM";

/// Gateway server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Base URL printed in generated links
    pub public_url: Option<String>,
    /// Use the in-memory messaging network (development)
    pub use_memory_store: bool,
    /// Directory whose files are loaded into the in-memory network
    pub seed_dir: Option<String>,
    /// One pooled upstream connection per credential
    pub credentials: Vec<Credential>,
    /// Data center ids handed out round-robin to memory connections
    pub client_dc_ids: Vec<u32>,
    /// User ids in the `owner` class
    pub owner_ids: Vec<String>,
    /// User ids in the `authorized` class (static authorizer)
    pub authorized_ids: Vec<String>,
    /// JWT secret for bearer tokens
    pub jwt_secret: Option<String>,
    /// Reject requests without a valid bearer token
    pub require_auth: bool,
    /// Edge burst limit (requests per second per identity, 0 disables)
    pub edge_rps: u32,
    /// Concurrent streams per upstream connection
    pub max_streams_per_client: usize,
    /// Upstream chunk size in bytes
    pub chunk_size: usize,
    pub fetch_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// How long a request waits for a client while the pool is blocked
    pub acquire_wait_secs: u64,
    pub meta_cache_ttl_secs: u64,
    pub meta_cache_capacity: usize,
    /// Enable per-user and global admission limits
    pub rate_limit_enabled: bool,
    pub max_files_per_period: usize,
    /// Per-user window length, fractions allowed
    pub period_minutes: f64,
    /// 0 disables the global window
    pub max_global_requests_per_minute: usize,
    pub authorized_limit_multiplier: usize,
    /// Queue bound for each priority class
    pub max_queue_size: usize,
    pub queue_timeout_secs: u64,
    pub drain_interval_ms: u64,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_url: None,
            use_memory_store: false,
            seed_dir: None,
            credentials: Vec::new(),
            client_dc_ids: vec![1, 2, 3, 4, 5],
            owner_ids: Vec::new(),
            authorized_ids: Vec::new(),
            jwt_secret: None,
            require_auth: false,
            edge_rps: 20,
            max_streams_per_client: 16,
            chunk_size: MAX_CHUNK_SIZE,
            fetch_timeout_secs: 30,
            retry_attempts: 4,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4_000,
            acquire_wait_secs: 10,
            meta_cache_ttl_secs: 600,
            meta_cache_capacity: 1_000,
            rate_limit_enabled: true,
            max_files_per_period: 20,
            period_minutes: 1.0,
            max_global_requests_per_minute: 600,
            authorized_limit_multiplier: 2,
            max_queue_size: 100,
            queue_timeout_secs: 120,
            drain_interval_ms: 1_000,
            cors_enabled: true,
        }
    }
}

impl GatewayConfig {
    /// Get the bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL for generated links
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind_addr()),
        }
    }

    /// Defaults, then `file` (format by extension), then `LINKSTREAM_*`
    /// environment variables. List values in the environment are comma
    /// separated.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&GatewayConfig::default())?);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("credentials")
                    .with_list_parse_key("client_dc_ids")
                    .with_list_parse_key("owner_ids")
                    .with_list_parse_key("authorized_ids"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Append `MULTI_TOKEN<n>` credentials, ordered by `n`
    pub fn with_env_tokens<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.credentials.extend(multi_tokens(vars));
        self
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_streams_per_client: self.max_streams_per_client,
            ..Default::default()
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            chunk_size: self.chunk_size,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            acquire_budget: Duration::from_secs(self.acquire_wait_secs),
            ..Default::default()
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            enabled: self.rate_limit_enabled,
            max_files_per_period: self.max_files_per_period,
            // negative or NaN becomes zero, which disables admission limits
            period: Duration::try_from_secs_f64(self.period_minutes * 60.0).unwrap_or(Duration::ZERO),
            max_global_per_minute: self.max_global_requests_per_minute,
            authorized_multiplier: self.authorized_limit_multiplier,
            max_queue_size: self.max_queue_size,
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
            drain_interval: Duration::from_millis(self.drain_interval_ms),
        }
    }

    /// Data center for the `index`-th memory connection
    pub fn dc_for_client(&self, index: usize) -> u32 {
        if self.client_dc_ids.is_empty() {
            return 1;
        }
        self.client_dc_ids[index % self.client_dc_ids.len()]
    }
}

/// Credentials from `MULTI_TOKEN1`, `MULTI_TOKEN2`, ... in numeric order.
/// Empty values and non-numeric suffixes are ignored.
pub fn multi_tokens<I>(vars: I) -> Vec<Credential>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut tokens: Vec<(u32, String)> = vars
        .into_iter()
        .filter_map(|(key, value)| {
            let index = key.strip_prefix("MULTI_TOKEN")?.parse::<u32>().ok()?;
            let value = value.trim();
            (!value.is_empty()).then(|| (index, value.to_string()))
        })
        .collect();
    tokens.sort_by_key(|(index, _)| *index);
    tokens.into_iter().map(|(_, token)| Credential::new(token)).collect()
}
