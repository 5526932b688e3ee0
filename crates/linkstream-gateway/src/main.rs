//! Linkstream Gateway - HTTP range streaming for messaging-network files

use clap::Parser;
use linkstream_gateway::{run_server, GatewayConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "linkstream")]
#[command(about = "Stream files stored in a messaging network over HTTP range requests")]
#[command(version)]
struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, env = "LINKSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Base URL used in printed links
    #[arg(long)]
    public_url: Option<String>,

    /// Use the in-memory messaging network (for development)
    #[arg(long)]
    memory_store: bool,

    /// Load every file of this directory into the in-memory network
    #[arg(long)]
    seed_dir: Option<String>,

    /// JWT secret for bearer tokens
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Reject requests without a valid bearer token
    #[arg(long)]
    require_auth: bool,

    /// Owner user ids (never rate limited)
    #[arg(long, value_delimiter = ',', env = "OWNER_IDS")]
    owner_ids: Vec<String>,

    /// Disable per-user and global admission limits
    #[arg(long)]
    no_rate_limit: bool,

    /// Enable debug logging
    #[arg(short, long, env = "LINKSTREAM_DEBUG")]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "LINKSTREAM_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply(self, mut config: GatewayConfig) -> GatewayConfig {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.public_url.is_some() {
            config.public_url = self.public_url;
        }
        if self.seed_dir.is_some() {
            config.seed_dir = self.seed_dir;
            config.use_memory_store = true;
        }
        if self.jwt_secret.is_some() {
            config.jwt_secret = self.jwt_secret;
        }
        if !self.owner_ids.is_empty() {
            config.owner_ids = self.owner_ids;
        }
        config.use_memory_store |= self.memory_store;
        config.require_auth |= self.require_auth;
        if self.no_rate_limit {
            config.rate_limit_enabled = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Parse arguments
    let args = Args::parse();

    // Setup logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!(
                "linkstream={level},linkstream_gateway={level},linkstream_core={level},tower_http=debug",
                level = log_level
            )
            .into()
        }))
        .with(args.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.log_json).then(tracing_subscriber::fmt::layer))
        .init();

    // Build configuration: defaults, file, environment, flags
    let config = GatewayConfig::load(args.config.as_deref())?;
    let config = args.apply(config).with_env_tokens(std::env::vars());

    tracing::info!("Starting Linkstream Gateway on {}", config.bind_addr());
    tracing::info!("Upstream connections: {}", config.credentials.len());

    if config.use_memory_store {
        tracing::warn!("⚠️  Using in-memory messaging network - files will NOT persist!");
    }

    if !config.rate_limit_enabled {
        tracing::warn!("⚠️  Admission limits are DISABLED");
    }

    // Run the server
    run_server(config).await
}
