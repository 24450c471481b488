//! Chaos test: replication under peer failures.
//!
//! Breaks subsets of the subgroup and verifies the engine degrades the way
//! the fail model promises: recovery while any replica survives, clean
//! requeue when none does, and identical plans across retries.

use keel_integration_tests::{resume_options, scan_options, test_data, ReplHarness};

#[tokio::test]
async fn test_recovery_survives_single_broken_peer() {
    let mut h = ReplHarness::new();
    for step in 1..=4u32 {
        let id = h.blob(step, 2048);
        h.add_missing_blob(id, test_data(2048, step as u8));
    }
    h.break_peer(5);

    let outcome = h.run_quantum(scan_options()).await;

    assert_eq!(outcome.info.blobs_recovered, 4);
    assert!(outcome.info.proxy_stat.transient_errors >= 1);
    assert!(outcome.info.unreplicated.is_empty());
}

#[tokio::test]
async fn test_recovery_survives_whole_ring_down() {
    // Mirror-3dc: one datacenter down leaves two full copies.
    let mut h = ReplHarness::new();
    let id = h.blob(1, 4096);
    let data = test_data(4096, 9);
    h.add_missing_blob(id, data.clone());
    // Ring 1 is order numbers 3, 4, 5.
    for order in 3..=5 {
        h.break_peer(order);
    }

    let outcome = h.run_quantum(scan_options()).await;

    assert_eq!(outcome.info.blobs_recovered, 1);
    assert_eq!(outcome.sst_blobs.get(&id).expect("recovered"), &data);
}

#[tokio::test]
async fn test_all_peers_down_requeues_everything() {
    let mut h = ReplHarness::new();
    let mut ids = Vec::new();
    for step in 1..=3u32 {
        let id = h.blob(step, 1024);
        h.add_missing_blob(id, test_data(1024, step as u8));
        ids.push(id);
    }
    for order in 1..9 {
        h.break_peer(order);
    }

    let outcome = h.run_quantum(scan_options()).await;

    assert_eq!(outcome.info.blobs_recovered, 0);
    assert_eq!(outcome.info.unreplicated, ids);
    assert!(outcome.info.proxy_stat.transient_errors >= 8);
}

#[tokio::test]
async fn test_failed_quantum_replans_identically() {
    // Round-trip property: a quantum that failed on every peer leaves the
    // index untouched, so planning again over the same snapshot yields the
    // same work.
    let mut h = ReplHarness::new();
    for step in 1..=5u32 {
        let id = h.blob(step, 512);
        h.add_missing_blob(id, test_data(512, step as u8));
    }
    for order in 1..9 {
        h.break_peer(order);
    }

    let first = h.run_quantum(scan_options()).await;
    let second = h.run_quantum(scan_options()).await;

    assert_eq!(first.info.items_planned, second.info.items_planned);
    assert_eq!(first.info.unreplicated, second.info.unreplicated);
    assert_eq!(first.info.last_key, second.info.last_key);
    assert_eq!(first.info.eof, second.info.eof);
}

#[tokio::test]
async fn test_broken_peers_recover_next_quantum() {
    // First quantum fails, peers come back, the requeued blobs are
    // retried by key range and everything lands.
    let mut h = ReplHarness::new();
    for step in 1..=3u32 {
        let id = h.blob(step, 1024);
        h.add_missing_blob(id, test_data(1024, step as u8));
    }
    for order in 1..9 {
        h.break_peer(order);
    }

    let first = h.run_quantum(scan_options()).await;
    assert_eq!(first.info.blobs_recovered, 0);
    assert_eq!(first.info.unreplicated.len(), 3);

    // Peers come back.
    let mut healthy = ReplHarness::new();
    for step in 1..=3u32 {
        let id = healthy.blob(step, 1024);
        healthy.add_missing_blob(id, test_data(1024, step as u8));
    }

    let second = healthy.run_quantum(resume_options(None)).await;
    assert_eq!(second.info.blobs_recovered, 3);
    assert!(second.info.unreplicated.is_empty());
}
