use crate::fetcher::FetchConfig;
use crate::pool::{ClientPool, PoolConfig};
use linkstream_upstream::{Credential, MemoryNetwork, MemoryUpstream, UpstreamClient};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Fixture {
    pub network: MemoryNetwork,
    pub clients: Vec<Arc<MemoryUpstream>>,
    pub pool: ClientPool,
}

/// One memory connection per entry in `dcs`, all on a shared network
pub(crate) fn fixture(dcs: &[u32], max_streams_per_client: usize) -> Fixture {
    let network = MemoryNetwork::new();
    let clients: Vec<_> = dcs
        .iter()
        .enumerate()
        .map(|(i, dc)| Arc::new(network.connect(Credential::new(format!("token-{}", i)), *dc)))
        .collect();
    let pool = ClientPool::new(
        PoolConfig {
            max_streams_per_client,
            ..Default::default()
        },
        clients
            .iter()
            .map(|c| {
                let client: Arc<dyn UpstreamClient> = c.clone();
                (c.credential().clone(), client)
            })
            .collect(),
    );
    Fixture {
        network,
        clients,
        pool,
    }
}

/// Deterministic, non-repeating-per-chunk file content
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub(crate) fn fetch_config(chunk_size: usize) -> FetchConfig {
    FetchConfig {
        chunk_size,
        fetch_timeout: Duration::from_secs(5),
        retry_attempts: 4,
        retry_base_delay: Duration::from_millis(50),
        retry_max_delay: Duration::from_secs(1),
    }
}
