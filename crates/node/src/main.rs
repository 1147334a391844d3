//! datsync-node: entry point for a bulletin board replica.
//!
//! Loads config, opens the store, serves the peer protocol over HTTP and
//! periodically refreshes the recent index and syncs subscribed threads.

use datsync_common::Peer;
use datsync_net::{HttpTransport, PeerServer};
use datsync_peer::LookupTable;
use datsync_storage::{FsyncPolicy, Store};
use datsync_sync::{
    ManagerRegistry, Network, RecentIndex, SuggestedTags, SyncSettings, Syncer, SystemClock,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    datsync_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = match datsync_config::load_from_file(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            datsync_config::load_from_str("listen: \"127.0.0.1:8000\"\nseeds: []\n")?
        }
    };

    let store = Store::open(
        &config.storage.data_dir,
        FsyncPolicy::from_str_config(&config.storage.fsync),
    )?;
    tracing::info!(
        "opened store at {} ({} key(s))",
        config.storage.data_dir.display(),
        store.key_count().await
    );

    let seeds: Vec<Peer> = config
        .seeds
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(peer) => Some(peer),
            Err(e) => {
                tracing::warn!("ignoring seed {}: {}", s, e);
                None
            }
        })
        .collect();
    let lookup = Arc::new(RwLock::new(LookupTable::with_nodes(seeds)));
    let transport = Arc::new(HttpTransport::new(Duration::from_millis(
        config.sync.talk_timeout_ms,
    ))?);

    let settings = SyncSettings {
        recent_range: config.sync.recent_range_secs,
        get_range: config.sync.get_range_secs,
        update_range: config.sync.update_range_secs,
        search_depth: config.sync.search_depth,
    };
    let recent = Arc::new(RecentIndex::new(
        store.clone(),
        Arc::new(SystemClock),
        Arc::new(SuggestedTags::new(config.sync.max_tags)),
        settings,
    ));
    let syncer = Syncer::new(
        Network::new(transport, lookup),
        recent.clone(),
        ManagerRegistry::new(),
        settings,
    );

    syncer
        .follow(config.sync.threads.iter().map(String::as_str))
        .await;

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = datsync_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Periodic refresh + sync. The first tick fires immediately and does a
    // full refresh.
    let interval = Duration::from_secs(config.sync.sync_interval_secs.max(1));
    let follow_recent = config.sync.follow_recent;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut first = true;
        loop {
            ticker.tick().await;
            let added = syncer.refresh(first).await;
            first = false;
            if follow_recent {
                syncer.follow_recent().await;
            }
            if let Err(e) = syncer.recent().remove_olds().await {
                tracing::warn!("failed to prune recent index: {}", e);
            }
            let updated = syncer.sync_all().await;
            tracing::info!(
                "sync round done: {} new recent head(s), {} thread(s) updated",
                added,
                updated
            );
            if let Err(e) = syncer.recent().store().sync().await {
                tracing::warn!("failed to sync store: {}", e);
            }
        }
    });

    let listener = TcpListener::bind(config.listen).await?;
    let server = Arc::new(PeerServer::new(&config.node_path, recent));

    tokio::select! {
        result = server.serve(listener) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    store.sync().await?;
    Ok(())
}
