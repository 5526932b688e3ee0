//! Application state

use crate::auth::Classifier;
use crate::config::GatewayConfig;
use crate::link::LinkId;
use linkstream_core::{AdmissionController, ChunkFetcher, ClientPool, MetadataCache, Streamer};
use linkstream_upstream::{
    Authorizer, Credential, FileMeta, FileStore, MemoryFileStore, MemoryNetwork, StaticAuthorizer,
    UpstreamClient,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Collaborators the gateway streams from
pub struct Backends {
    /// One entry per pooled connection
    pub clients: Vec<(Credential, Arc<dyn UpstreamClient>)>,
    pub file_store: Arc<dyn FileStore>,
    pub authorizer: Arc<dyn Authorizer>,
}

/// A file loaded from the seed directory
#[derive(Clone, Debug)]
pub struct SeededFile {
    pub message_id: u64,
    pub link: LinkId,
    pub meta: FileMeta,
}

impl SeededFile {
    pub fn path(&self) -> String {
        self.link.to_path(self.meta.file_name.as_deref())
    }
}

/// Application state shared across handlers
pub struct AppState {
    /// Gateway configuration
    pub config: GatewayConfig,
    /// Upstream client pool
    pub pool: ClientPool,
    /// Per-user and global admission
    pub admission: Arc<AdmissionController>,
    /// Metadata resolution and range streaming
    pub streamer: Streamer,
    pub file_store: Arc<dyn FileStore>,
    pub authorizer: Arc<dyn Authorizer>,
    pub classifier: Classifier,
    /// Files loaded at startup (memory backend only)
    pub seeded: Vec<SeededFile>,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new application state
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        if config.use_memory_store {
            info!("Using in-memory messaging network (files will not persist)");
        } else {
            warn!("No messaging network backend configured, falling back to in-memory network");
        }
        warn!("⚠ Upstream mode: In-memory (for development only)");

        let network = MemoryNetwork::new();
        let file_store = Arc::new(MemoryFileStore::new());
        let seeded = match config.seed_dir.as_deref() {
            Some(dir) => seed_from_dir(&config, &network, &file_store, Path::new(dir)).await?,
            None => Vec::new(),
        };

        let backends = Backends {
            clients: memory_clients(&config, &network),
            file_store,
            authorizer: Arc::new(StaticAuthorizer::new(config.authorized_ids.iter().cloned())),
        };

        let mut state = Self::with_backends(config, backends);
        state.seeded = seeded;
        Ok(state)
    }

    /// Build the state around already-connected collaborators
    pub fn with_backends(config: GatewayConfig, backends: Backends) -> Self {
        if backends.clients.is_empty() {
            warn!("No upstream credentials configured, every stream will be unavailable");
        } else {
            info!("✓ Client pool: {} connection(s)", backends.clients.len());
        }

        let pool = ClientPool::new(config.pool_config(), backends.clients);
        let fetcher = ChunkFetcher::new(pool.clone(), config.fetch_config());
        let cache = Arc::new(MetadataCache::new(
            config.meta_cache_capacity,
            Duration::from_secs(config.meta_cache_ttl_secs),
        ));
        let streamer = Streamer::new(pool.clone(), fetcher, cache, config.session_config());

        let admission = AdmissionController::new(config.admission_config());
        if admission.is_enabled() {
            info!(
                "✓ Admission: {} files per {} min, {} global per min",
                config.max_files_per_period, config.period_minutes, config.max_global_requests_per_minute
            );
        } else {
            warn!("⚠ Admission limits disabled");
        }

        let classifier = Classifier::new(config.owner_ids.iter().cloned());

        Self {
            config,
            pool,
            admission,
            streamer,
            file_store: backends.file_store,
            authorizer: backends.authorizer,
            classifier,
            seeded: Vec::new(),
            started_at: Instant::now(),
        }
    }
}

/// One memory connection per credential, data centers assigned round-robin.
/// Without credentials one development connection per data center is made.
pub fn memory_clients(
    config: &GatewayConfig,
    network: &MemoryNetwork,
) -> Vec<(Credential, Arc<dyn UpstreamClient>)> {
    let credentials = if config.credentials.is_empty() {
        let count = config.client_dc_ids.len().max(1);
        warn!("No credentials configured, creating {} development connection(s)", count);
        (1..=count)
            .map(|i| Credential::new(format!("dev-token-{}", i)))
            .collect()
    } else {
        config.credentials.clone()
    };

    credentials
        .into_iter()
        .enumerate()
        .map(|(i, credential)| {
            let client: Arc<dyn UpstreamClient> =
                Arc::new(network.connect(credential.clone(), config.dc_for_client(i)));
            (credential, client)
        })
        .collect()
}

/// Load every regular file in `dir` (sorted by name) as message ids `1..=N`
pub async fn seed_from_dir(
    config: &GatewayConfig,
    network: &MemoryNetwork,
    file_store: &MemoryFileStore,
    dir: &Path,
) -> anyhow::Result<Vec<SeededFile>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut seeded = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = tokio::fs::read(path).await?;
        let meta = network.put_file(&name, None, config.dc_for_client(index), data);
        let message_id = index as u64 + 1;
        file_store.insert(message_id, meta.file_ref.clone());
        seeded.push(SeededFile {
            message_id,
            link: LinkId::for_file(message_id, &meta),
            meta,
        });
    }

    info!("✓ Seeded {} file(s) from {}", seeded.len(), dir.display());
    Ok(seeded)
}
