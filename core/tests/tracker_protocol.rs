//! Tracker protocol tests over real TCP connections.

mod common;

use barks_shuffle::ShuffleError;
use barks_shuffle::protocol::{PeerLocation, ReducerState, ShuffleStatus, SplitLocation};
use barks_shuffle::split::SplitInfo;
use barks_shuffle::tracker::TrackerClient;
use common::*;
use std::time::Duration;
use tracing_test::traced_test;

fn in_progress(registered: u32, completed: u32) -> ShuffleStatus {
    ShuffleStatus::InProgress {
        registered,
        completed,
    }
}

#[tokio::test]
#[traced_test]
async fn test_reducer_lifecycle() {
    let handle = start_tracker(2, 8).await;
    let client = TrackerClient::new(handle.local_addr());

    assert_eq!(
        client.register("r0", 0, "127.0.0.1").await.unwrap(),
        in_progress(1, 0)
    );
    // Registering again refreshes the record instead of adding one.
    assert_eq!(
        client.register("r0", 0, "127.0.0.1").await.unwrap(),
        in_progress(1, 0)
    );
    assert_eq!(
        client.register("r1", 1, "127.0.0.1").await.unwrap(),
        in_progress(2, 0)
    );

    // Skipping Leaving is refused and changes nothing.
    let err = client
        .report_state("r0", ReducerState::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, ShuffleError::InvalidTransition { .. }));
    assert_eq!(
        handle.tracker().registration("r0").unwrap().state,
        ReducerState::Entering
    );

    for reducer in ["r0", "r1"] {
        client
            .report_state(reducer, ReducerState::Leaving)
            .await
            .unwrap();
        // A repeated report is a no-op.
        client
            .report_state(reducer, ReducerState::Leaving)
            .await
            .unwrap();
    }
    assert_eq!(
        client
            .report_state("r0", ReducerState::Completed)
            .await
            .unwrap(),
        in_progress(2, 1)
    );
    assert_eq!(
        client
            .report_state("r1", ReducerState::Completed)
            .await
            .unwrap(),
        ShuffleStatus::AlreadyFinished
    );

    assert_eq!(
        client.query_status().await.unwrap(),
        ShuffleStatus::AlreadyFinished
    );
    assert_eq!(
        client.register("late", 0, "127.0.0.1").await.unwrap(),
        ShuffleStatus::AlreadyFinished
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_reducer_query() {
    let handle = start_tracker(1, 8).await;
    let client = TrackerClient::new(handle.local_addr());
    client
        .register_mapper(&SplitInfo::for_mapper("127.0.0.1", 9000, 0, vec![4]))
        .await
        .unwrap();

    // R9 never registered: the tracker has no record of it.
    assert_eq!(
        client.query_split("R9", 0).await.unwrap(),
        SplitLocation::Unknown
    );

    client.register("r0", 0, "127.0.0.1").await.unwrap();
    client
        .report_state("r0", ReducerState::Leaving)
        .await
        .unwrap();
    client
        .report_state("r0", ReducerState::Completed)
        .await
        .unwrap();

    // Once the stage is done the answer is Finished, registered or not.
    assert_eq!(
        client.query_split("R9", 0).await.unwrap(),
        SplitLocation::Finished
    );
    assert_eq!(
        client.query_split("r0", 0).await.unwrap(),
        SplitLocation::Finished
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_saturated_mapper_is_busy_until_released() {
    let handle = start_tracker(3, 2).await;
    let client = TrackerClient::new(handle.local_addr());
    let location = PeerLocation::new("127.0.0.1", 9100);
    client
        .register_mapper(&SplitInfo::for_mapper(
            location.host_address.clone(),
            location.listen_port,
            5,
            vec![3, 6, 9],
        ))
        .await
        .unwrap();
    for (i, reducer) in ["r0", "r1", "r2"].into_iter().enumerate() {
        client.register(reducer, i as u32, "127.0.0.1").await.unwrap();
    }

    assert_eq!(
        client.query_split("r0", 5).await.unwrap(),
        SplitLocation::Found {
            location: location.clone(),
            total_blocks: 3
        }
    );
    assert_eq!(
        client.query_split("r1", 5).await.unwrap(),
        SplitLocation::Found {
            location: location.clone(),
            total_blocks: 6
        }
    );
    assert_eq!(client.query_split("r2", 5).await.unwrap(), SplitLocation::Busy);
    assert_eq!(handle.tracker().active_leases(5, &location), 2);

    let advice = client
        .release_split("r0", 5, &location, 3, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(advice.own_rate > 0.0);
    assert_eq!(handle.tracker().active_leases(5, &location), 1);

    assert_eq!(
        client.query_split("r2", 5).await.unwrap(),
        SplitLocation::Found {
            location,
            total_blocks: 9
        }
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_clients() {
    let reducers = 16;
    let handle = start_tracker(reducers, 8).await;
    let addr = handle.local_addr();

    let mut tasks = Vec::new();
    for i in 0..reducers {
        tasks.push(tokio::spawn(async move {
            let client = TrackerClient::new(addr);
            let id = format!("reducer-{}", i);
            client.register(&id, i, "127.0.0.1").await.unwrap();
            client
                .report_state(&id, ReducerState::Leaving)
                .await
                .unwrap();
            client
                .report_state(&id, ReducerState::Completed)
                .await
                .unwrap()
        }));
    }

    let mut finished = 0;
    for task in tasks {
        if task.await.unwrap() == ShuffleStatus::AlreadyFinished {
            finished += 1;
        }
    }
    // At least the last completion observes the finished shuffle.
    assert!(finished >= 1);
    assert!(handle.tracker().is_finished());

    handle.shutdown().await.unwrap();
}
