//! Common helpers for the shuffle integration tests

use barks_shuffle::ShuffleConfig;
use barks_shuffle::split::SplitInfo;
use barks_shuffle::tracker::{ShuffleTracker, TrackerClient, TrackerHandle, TrackerServer};
use barks_shuffle::transfer::{
    BlockStore, MemoryBlockStore, SessionLimits, SplitBlockId, SplitServer, SplitServerHandle,
};
use std::sync::Arc;

/// Small blocks, short sessions and fast knocks on ephemeral ports.
#[allow(dead_code)]
pub fn test_config() -> ShuffleConfig {
    ShuffleConfig {
        master_host_address: "127.0.0.1".to_string(),
        master_tracker_port: 0,
        block_size: 1,
        min_knock_interval: 10,
        max_knock_interval: 80,
        max_rx_connections: 2,
        max_tx_connections: 2,
        max_chat_time: 250,
        max_chat_blocks: 2,
        throttle_fraction: 2.0,
        max_fetch_time: 20_000,
        shuffle_dir: None,
    }
}

/// Start a tracker for `reducers` reducers on an ephemeral port.
#[allow(dead_code)]
pub async fn start_tracker(reducers: u32, max_tx: usize) -> TrackerHandle {
    let tracker = Arc::new(ShuffleTracker::new("integration", reducers, max_tx));
    TrackerServer::bind("127.0.0.1:0".parse().unwrap(), tracker)
        .await
        .unwrap()
        .spawn()
}

/// Serve `payloads` (indexed by output split) as input split `input_split`
/// and publish it to the tracker.
#[allow(dead_code)] // not every test binary publishes splits itself
pub async fn publish_split(
    tracker: &TrackerClient,
    config: &ShuffleConfig,
    input_split: u32,
    payloads: Vec<Vec<u8>>,
    max_tx: usize,
) -> SplitServerHandle {
    let store = MemoryBlockStore::new(config.block_size_bytes());
    let mut totals = Vec::new();
    for (output_split, payload) in payloads.into_iter().enumerate() {
        let id = SplitBlockId::new(input_split, output_split as u32);
        totals.push(store.put_split(id, payload).await.unwrap());
    }
    let server = SplitServer::bind(
        "127.0.0.1",
        input_split,
        Arc::new(store),
        max_tx,
        SessionLimits::from_config(config),
    )
    .await
    .unwrap()
    .spawn();
    let location = server.location().clone();
    tracker
        .register_mapper(&SplitInfo::for_mapper(
            location.host_address,
            location.listen_port,
            input_split,
            totals,
        ))
        .await
        .unwrap();
    server
}

/// A payload whose bytes identify their position, `kib` KiB long.
#[allow(dead_code)]
pub fn patterned_payload(seed: u8, kib: usize) -> Vec<u8> {
    (0..kib * 1024)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
