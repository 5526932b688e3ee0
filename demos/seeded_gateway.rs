//! Gateway over an in-memory messaging network with a few generated files
//!
//! This demo shows:
//! - Wiring the gateway to custom upstream backends
//! - Spreading three connections over two data centers
//! - A flood wait on the first fetch that fails the stream over to another connection
//!
//! Run with: cargo run --example seeded_gateway
//! Then try:  curl -r 5000000-5999999 -o part.bin <printed video link>

use bytes::Bytes;
use linkstream_gateway::{server, AppState, Backends, GatewayConfig, LinkId};
use linkstream_upstream::{Credential, MemoryFileStore, MemoryNetwork, StaticAuthorizer, UpstreamClient};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            "linkstream_gateway=info,linkstream_core=debug",
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Linkstream - Seeded Gateway Demo\n");

    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryFileStore::new());

    let video: Vec<u8> = (0..10_000_000u32).map(|i| (i % 251) as u8).collect();
    let files = [
        network.put_file("sample video.mp4", Some("video/mp4"), 2, Bytes::from(video)),
        network.put_file("notes.txt", None, 1, Bytes::from_static(b"hello from linkstream\n")),
    ];
    for (i, meta) in files.iter().enumerate() {
        store.insert(i as u64 + 1, meta.file_ref.clone());
    }

    // three connections, the first fetch on the first one is throttled for 10s
    let connections: Vec<_> = [(1, "demo-a"), (2, "demo-b"), (2, "demo-c")]
        .into_iter()
        .map(|(dc, token)| Arc::new(network.connect(Credential::new(token), dc)))
        .collect();
    connections[0].inject_flood_wait(10);

    let clients = connections
        .iter()
        .map(|conn| {
            let client: Arc<dyn UpstreamClient> = conn.clone();
            (conn.credential().clone(), client)
        })
        .collect();

    let config = GatewayConfig {
        host: "127.0.0.1".to_string(),
        max_files_per_period: 5,
        owner_ids: vec!["admin".to_string()],
        ..Default::default()
    };
    let base_url = config.base_url();
    let state = Arc::new(AppState::with_backends(
        config.clone(),
        Backends {
            clients,
            file_store: store,
            authorizer: Arc::new(StaticAuthorizer::default()),
        },
    ));

    println!("📋 Links:");
    for (i, meta) in files.iter().enumerate() {
        let link = LinkId::for_file(i as u64 + 1, meta);
        println!("   {}{}", base_url, link.to_path(meta.file_name.as_deref()));
    }
    println!("\n📊 Pool:");
    println!("{}", serde_json::to_string_pretty(&state.pool.snapshot())?);
    println!("\n   Status: {}/status\n", base_url);

    let listener = TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("Demo gateway listening on http://{}", config.bind_addr());
    server::serve(listener, state, server::shutdown_signal()).await
}
