//! Locality routing: same-node and same-availability-zone preferences
//! and their fallback behavior under saturation.

mod common;

use common::*;
use replica_router::{PendingRequest, PowerOfTwoScheduler, RouterConfig};
use std::collections::HashSet;

fn locality_scheduler(prefer_node: bool, prefer_az: bool) -> PowerOfTwoScheduler {
    init_tracing();
    let config = RouterConfig {
        prefer_local_node: prefer_node,
        prefer_local_az: prefer_az,
        self_node_id: SCHEDULER_NODE_ID.to_string(),
        self_az: Some(SCHEDULER_AZ.to_string()),
        ..test_config()
    };
    PowerOfTwoScheduler::new(config).expect("scheduler construction")
}

async fn choose_batch(s: &PowerOfTwoScheduler, n: usize) -> Vec<String> {
    let mut chosen = Vec::new();
    for _ in 0..n {
        let replica = s
            .choose_replica_for_request(PendingRequest::new(), false)
            .await
            .unwrap();
        chosen.push(replica.replica_id().to_string());
    }
    chosen
}

/// Keep choosing in batches of 10 until every expected replica has been
/// seen (the spread is randomized, so one batch is not enough).
async fn assert_spreads_over(s: &PowerOfTwoScheduler, expected: &[&str]) {
    let expected: HashSet<String> = expected.iter().map(ToString::to_string).collect();
    let mut seen = HashSet::new();
    for _ in 0..100 {
        for id in choose_batch(s, 10).await {
            assert!(expected.contains(&id), "unexpected replica {id}");
            seen.insert(id);
        }
        if seen == expected {
            return;
        }
    }
    panic!("never spread over all of {expected:?}; saw {seen:?}");
}

#[tokio::test]
async fn prefer_replica_on_same_node() {
    let s = locality_scheduler(true, false);

    let r1 = FakeReplica::builder("r1").node_id(SCHEDULER_NODE_ID).build();
    r1.set_queue_len_response(0);
    let r2 = FakeReplica::builder("r2")
        .node_id("some-other-node-in-the-stratosphere")
        .build();
    r2.set_queue_len_response(0);
    s.update_replicas(as_handles(&[&r1, &r2])).await;

    // The colocated replica absorbs everything while it accepts.
    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r1");
    }

    // Once it rejects, requests fall back to the rest of the set.
    r1.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r2");
    }
    assert_drained(&s).await;
}

#[tokio::test]
async fn prefer_same_node_then_same_az_then_anywhere() {
    let s = locality_scheduler(true, true);

    let r1 = FakeReplica::builder("r1")
        .node_id(SCHEDULER_NODE_ID)
        .availability_zone(SCHEDULER_AZ)
        .build();
    let r2 = FakeReplica::builder("r2")
        .node_id("some-other-node-in-the-stratosphere")
        .availability_zone(SCHEDULER_AZ)
        .build();
    let r3 = FakeReplica::builder("r3")
        .node_id("some-other-node-in-the-stratosphere")
        .availability_zone("some-other-az-in-the-solar-system")
        .build();
    r1.set_queue_len_response(0);
    r2.set_queue_len_response(0);
    r3.set_queue_len_response(0);
    s.update_replicas(as_handles(&[&r1, &r2, &r3])).await;

    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r1", "same-node replica wins first");
    }

    r1.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r2", "same-AZ replica wins next");
    }

    r2.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r3", "anywhere as the last resort");
    }
    assert_drained(&s).await;
}

#[tokio::test]
async fn prefer_az_off_spreads_across_zones() {
    let s = locality_scheduler(false, false);

    let r1 = FakeReplica::builder("r1").availability_zone(SCHEDULER_AZ).build();
    let r2 = FakeReplica::builder("r2").availability_zone(SCHEDULER_AZ).build();
    let r3 = FakeReplica::builder("r3")
        .availability_zone("western-hemisphere")
        .build();
    r1.set_queue_len_response(0);
    r2.set_queue_len_response(0);
    r3.set_queue_len_response(0);
    s.update_replicas(as_handles(&[&r1, &r2, &r3])).await;

    assert_spreads_over(&s, &["r1", "r2", "r3"]).await;

    r1.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    assert_spreads_over(&s, &["r2", "r3"]).await;
    assert_drained(&s).await;
}

#[tokio::test]
async fn prefer_same_az_without_node_preference() {
    let s = locality_scheduler(false, true);

    let r1 = FakeReplica::builder("r1")
        .node_id(SCHEDULER_NODE_ID)
        .availability_zone(SCHEDULER_AZ)
        .build();
    let r2 = FakeReplica::builder("r2")
        .node_id("node-alpha")
        .availability_zone(SCHEDULER_AZ)
        .build();
    let r3 = FakeReplica::builder("r3")
        .node_id("node-beta")
        .availability_zone("some-zone")
        .build();
    r1.set_queue_len_response(0);
    r2.set_queue_len_response(0);
    r3.set_queue_len_response(0);
    s.update_replicas(as_handles(&[&r1, &r2, &r3])).await;

    // Without node preference, both same-AZ replicas share the load.
    assert_spreads_over(&s, &["r1", "r2"]).await;

    r2.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r1");
    }

    r1.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r3");
    }
    assert_drained(&s).await;
}

#[tokio::test]
async fn prefer_same_node_without_az_preference() {
    let s = locality_scheduler(true, false);

    let r1 = FakeReplica::builder("r1")
        .node_id(SCHEDULER_NODE_ID)
        .availability_zone(SCHEDULER_AZ)
        .build();
    let r2 = FakeReplica::builder("r2")
        .node_id("node-alpha")
        .availability_zone(SCHEDULER_AZ)
        .build();
    let r3 = FakeReplica::builder("r3")
        .node_id("node-beta")
        .availability_zone("west")
        .build();
    r1.set_queue_len_response(0);
    r2.set_queue_len_response(0);
    r3.set_queue_len_response(0);
    s.update_replicas(as_handles(&[&r1, &r2, &r3])).await;

    for id in choose_batch(&s, 10).await {
        assert_eq!(id, "r1");
    }

    // With the colocated replica blocked and AZ preference off, the
    // remaining replicas share the load across zones.
    r1.set_queue_len_response(DEFAULT_MAX_CONCURRENT + 1);
    assert_spreads_over(&s, &["r2", "r3"]).await;
    assert_drained(&s).await;
}
