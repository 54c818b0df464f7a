//! Reducer-side transfer against real split servers and a tracker.

mod common;

use barks_shuffle::ShuffleError;
use barks_shuffle::protocol::SplitLocation;
use barks_shuffle::tracker::{ShuffleTracker, TrackerClient, TrackerServer};
use barks_shuffle::transfer::BlockTransferScheduler;
use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_fetch_all_respects_budgets() {
    let config = test_config();
    let handle = start_tracker(1, config.max_tx_connections).await;
    let client = TrackerClient::new(handle.local_addr());

    let mut servers = Vec::new();
    for input_split in 0..5u32 {
        let payload = patterned_payload(input_split as u8, 5);
        servers.push(
            publish_split(
                &client,
                &config,
                input_split,
                vec![payload],
                config.max_tx_connections,
            )
            .await,
        );
    }

    client.register("r0", 0, "127.0.0.1").await.unwrap();
    let scheduler = Arc::new(BlockTransferScheduler::new(
        "integration",
        "r0",
        0,
        Arc::new(config.clone()),
        Arc::new(client),
    ));
    let fetched = scheduler
        .fetch_all(5, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fetched.len(), 5);
    for (input_split, split) in fetched.iter().enumerate() {
        assert_eq!(split.info.split_id, input_split as u32);
        assert_eq!(split.payload, patterned_payload(input_split as u8, 5));
        assert!(split.info.is_complete());
    }

    let progress = scheduler.progress();
    assert!(progress.all_complete());
    assert_eq!(progress.has_blocks_per_input_split, vec![5; 5]);

    let stats = scheduler.stats();
    assert!(stats.peak_pulls() <= config.max_rx_connections);
    assert!(stats.most_blocks_per_session() <= config.max_chat_blocks);
    // Five blocks at two per session take three sessions per split.
    assert!(stats.sessions() >= 15);

    for server in servers {
        assert!(server.stats().peak_serves() <= config.max_tx_connections);
        server.shutdown().await.unwrap();
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_saturated_mapper_backs_off_within_bounds() {
    let mut config = test_config();
    config.min_knock_interval = 20;
    config.max_knock_interval = 80;
    config.max_tx_connections = 1;

    let handle = start_tracker(2, 1).await;
    let client = Arc::new(TrackerClient::new(handle.local_addr()));
    let server = publish_split(&client, &config, 0, vec![patterned_payload(1, 3)], 1).await;

    // Another reducer holds the mapper's only lease for a while.
    client.register("holder", 1, "127.0.0.1").await.unwrap();
    let SplitLocation::Found { location, .. } = client.query_split("holder", 0).await.unwrap()
    else {
        panic!("the first query should be granted");
    };
    let holder = Arc::clone(&client);
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        holder
            .release_split("holder", 0, &location, 0, Duration::ZERO)
            .await
            .unwrap();
    });

    client.register("r0", 0, "127.0.0.1").await.unwrap();
    let scheduler = Arc::new(BlockTransferScheduler::new(
        "integration",
        "r0",
        0,
        Arc::new(config),
        Arc::clone(&client),
    ));
    let started = Instant::now();
    let fetched = scheduler
        .fetch_all(1, &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();
    release.await.unwrap();

    assert_eq!(fetched[0].payload, patterned_payload(1, 3));
    assert!(elapsed >= Duration::from_millis(300));
    // Probes never wait longer than the ceiling, so the pull resumes soon
    // after the lease comes back.
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert!(scheduler.stats().knocks() >= 3);

    server.shutdown().await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unpublished_split_fails_the_stage() {
    let mut config = test_config();
    config.max_fetch_time = 300;

    let handle = start_tracker(1, 2).await;
    let client = TrackerClient::new(handle.local_addr());
    client.register("r0", 0, "127.0.0.1").await.unwrap();

    let scheduler = Arc::new(BlockTransferScheduler::new(
        "integration",
        "r0",
        0,
        Arc::new(config),
        Arc::new(client),
    ));
    let started = Instant::now();
    let err = scheduler
        .fetch_all(1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ShuffleError::StageFailed { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(scheduler.stats().knocks() >= 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mapper_serves_at_most_max_tx_reducers() {
    let config = test_config();
    let reducers = 4u32;
    // The tracker would allow more; the split server enforces its own limit.
    let handle = start_tracker(reducers, 8).await;
    let client = TrackerClient::new(handle.local_addr());

    let payloads: Vec<Vec<u8>> = (0..reducers)
        .map(|r| patterned_payload(r as u8, 4))
        .collect();
    let server = publish_split(&client, &config, 0, payloads, 1).await;

    let mut pulls = Vec::new();
    for output_split in 0..reducers {
        let config = Arc::new(config.clone());
        let addr = handle.local_addr();
        pulls.push(tokio::spawn(async move {
            let client = Arc::new(TrackerClient::new(addr));
            let reducer_id = format!("r{}", output_split);
            client
                .register(&reducer_id, output_split, "127.0.0.1")
                .await
                .unwrap();
            let scheduler = Arc::new(BlockTransferScheduler::new(
                "integration",
                reducer_id,
                output_split,
                config,
                client,
            ));
            let fetched = scheduler
                .fetch_all(1, &CancellationToken::new())
                .await
                .unwrap();
            (output_split, fetched)
        }));
    }

    for pull in pulls {
        let (output_split, fetched) = pull.await.unwrap();
        assert_eq!(fetched[0].payload, patterned_payload(output_split as u8, 4));
    }
    assert_eq!(server.stats().peak_serves(), 1);

    server.shutdown().await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_split_completes_without_a_session() {
    let config = test_config();
    let handle = start_tracker(1, 2).await;
    let client = TrackerClient::new(handle.local_addr());
    let server = publish_split(&client, &config, 0, vec![Vec::new()], 2).await;
    client.register("r0", 0, "127.0.0.1").await.unwrap();

    let scheduler = Arc::new(BlockTransferScheduler::new(
        "integration",
        "r0",
        0,
        Arc::new(config),
        Arc::new(client),
    ));
    let fetched = scheduler
        .fetch_all(1, &CancellationToken::new())
        .await
        .unwrap();

    assert!(fetched[0].payload.is_empty());
    assert_eq!(scheduler.stats().sessions(), 0);
    assert_eq!(server.stats().sessions(), 0);

    server.shutdown().await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fast_reducer_yields_to_a_starved_one() {
    let config = test_config();
    let handle = start_tracker(2, config.max_tx_connections).await;
    let client = Arc::new(TrackerClient::new(handle.local_addr()));
    let server = publish_split(
        &client,
        &config,
        0,
        vec![patterned_payload(4, 6), Vec::new()],
        config.max_tx_connections,
    )
    .await;

    // A reducer whose only session moved nothing.
    client.register("starved", 1, "127.0.0.1").await.unwrap();
    let SplitLocation::Found { location, .. } =
        client.query_split("starved", 0).await.unwrap()
    else {
        panic!("the mapper has free leases");
    };
    client
        .release_split("starved", 0, &location, 0, Duration::from_millis(200))
        .await
        .unwrap();

    client.register("r0", 0, "127.0.0.1").await.unwrap();
    let scheduler = Arc::new(BlockTransferScheduler::new(
        "integration",
        "r0",
        0,
        Arc::new(config.clone()),
        Arc::clone(&client),
    ));
    let fetched = scheduler
        .fetch_all(1, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetched[0].payload, patterned_payload(4, 6));

    // Held back after every session but the last.
    let stats = scheduler.stats();
    assert!(stats.throttled() >= 1);
    assert_eq!(stats.throttled(), stats.sessions() - 1);

    server.shutdown().await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fetch_survives_a_tracker_restart() {
    let config = test_config();
    let tracker = Arc::new(ShuffleTracker::new("integration", 1, 2));
    let first = TrackerServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&tracker))
        .await
        .unwrap();
    let addr = first.local_addr();
    let handle = first.spawn();

    let client = Arc::new(TrackerClient::new(addr));
    let server = publish_split(&client, &config, 0, vec![patterned_payload(9, 4)], 2).await;
    client.register("r0", 0, "127.0.0.1").await.unwrap();

    // The tracker goes away with the client's connection and comes back
    // with the same registry a little later.
    handle.shutdown().await.unwrap();
    let restart = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        TrackerServer::bind(addr, tracker).await.unwrap().spawn()
    });

    let scheduler = Arc::new(BlockTransferScheduler::new(
        "integration",
        "r0",
        0,
        Arc::new(config),
        Arc::clone(&client),
    ));
    let fetched = scheduler
        .fetch_all(1, &CancellationToken::new())
        .await
        .unwrap();
    let handle = restart.await.unwrap();

    assert_eq!(fetched[0].payload, patterned_payload(9, 4));
    assert!(scheduler.stats().knocks() >= 1);
    assert_eq!(handle.tracker().active_leases(0, server.location()), 0);

    server.shutdown().await.unwrap();
    handle.shutdown().await.unwrap();
}
