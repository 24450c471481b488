//! Integration test: a full replication quantum.
//!
//! Drives planning, peer merge, recovery, SST writing, and commit against
//! in-memory peers and verifies the data that lands on disk byte for byte.

use keel_integration_tests::{
    donor_options, queue_options, resume_options, scan_options, test_data, ReplHarness,
};
use keel_types::VDiskId;

#[tokio::test]
async fn test_recovered_data_matches_peer_copies() {
    let mut h = ReplHarness::new();
    let mut expected = Vec::new();
    for step in 1..=5u32 {
        let id = h.blob(step, 4096);
        let data = test_data(4096, step as u8);
        h.add_missing_blob(id, data.clone());
        expected.push((id, data));
    }

    let outcome = h.run_quantum(scan_options()).await;

    assert_eq!(outcome.info.blobs_recovered, 5);
    assert!(outcome.info.eof);
    assert_eq!(outcome.sst_blobs.len(), 5);
    for (id, data) in expected {
        assert_eq!(
            outcome.sst_blobs.get(&id).expect("blob committed"),
            &data,
            "committed bytes must match the replica copy for {id}"
        );
    }
}

#[tokio::test]
async fn test_sst_entries_in_key_order() {
    let mut h = ReplHarness::new();
    // Insert out of order; the index and the merge both sort by key.
    for step in [9u32, 2, 7, 4] {
        let id = h.blob(step, 512);
        h.add_missing_blob(id, test_data(512, step as u8));
    }

    let outcome = h.run_quantum(scan_options()).await;
    let keys: Vec<u32> = outcome.commit_order.iter().map(|id| id.step).collect();
    assert_eq!(keys, vec![2, 4, 7, 9], "commit record must list blobs in key order");
}

#[tokio::test]
async fn test_huge_blobs_bypass_sst() {
    let mut h = ReplHarness::new();
    let small = h.blob(1, 4096);
    let huge = h.blob(2, 2 << 20);
    h.add_missing_blob(small, test_data(4096, 1));
    let huge_data = test_data(2 << 20, 2);
    h.add_missing_blob(huge, huge_data.clone());

    let outcome = h.run_quantum(scan_options()).await;

    assert_eq!(outcome.info.blobs_recovered, 1);
    assert_eq!(outcome.info.huge_blobs_recovered, 1);
    assert!(outcome.sst_blobs.contains_key(&small));
    assert!(!outcome.sst_blobs.contains_key(&huge));
    assert_eq!(outcome.huge_blobs.get(&huge).expect("huge routed"), &huge_data);
}

#[tokio::test]
async fn test_metadata_only_blob_committed_without_data() {
    let mut h = ReplHarness::new();
    let id = h.blob(1, 0);
    h.add_missing_blob(id, bytes::Bytes::new());

    let outcome = h.run_quantum(scan_options()).await;

    assert_eq!(outcome.info.metadata_blobs, 1);
    let data = outcome.sst_blobs.get(&id).expect("metadata entry committed");
    assert!(data.is_empty());
}

#[tokio::test]
async fn test_budgeted_quanta_cover_index_without_overlap() {
    let mut h = ReplHarness::new();
    h.config.max_recovery_tasks = 3;
    for step in 1..=8u32 {
        let id = h.blob(step, 256);
        h.add_missing_blob(id, test_data(256, step as u8));
    }

    let mut recovered = std::collections::BTreeSet::new();
    let mut start_key = None;
    let mut quanta = 0;
    loop {
        let outcome = h.run_quantum(resume_options(start_key)).await;
        quanta += 1;
        for id in outcome.sst_blobs.keys() {
            assert!(recovered.insert(*id), "blob {id} recovered twice");
        }
        start_key = outcome.info.last_key;
        if outcome.info.eof {
            break;
        }
        assert!(quanta < 10, "runaway quantum loop");
    }

    assert_eq!(recovered.len(), 8);
    assert_eq!(quanta, 3, "3-task budget needs three quanta for 8 blobs");
}

#[tokio::test]
async fn test_queue_mode_retries_listed_blobs() {
    let mut h = ReplHarness::new();
    let wanted = h.blob(1, 1024);
    let other = h.blob(2, 1024);
    h.add_missing_blob(wanted, test_data(1024, 1));
    h.add_missing_blob(other, test_data(1024, 2));

    let outcome = h.run_quantum(queue_options(vec![wanted])).await;

    assert_eq!(outcome.info.blobs_recovered, 1);
    assert!(outcome.sst_blobs.contains_key(&wanted));
    assert!(!outcome.sst_blobs.contains_key(&other));
}

#[tokio::test]
async fn test_donor_quantum_drains_and_drops_donor() {
    let donor = VDiskId::new(9, 9, 0, 0, 0);
    let mut h = ReplHarness::new();
    for step in 1..=3u32 {
        let id = h.blob(step, 2048);
        h.add_donor_blob(donor, id, test_data(2048, step as u8));
    }

    let outcome = h.run_quantum(donor_options(donor)).await;

    assert_eq!(outcome.info.blobs_recovered, 3);
    assert!(outcome.info.drop_donor);
    assert!(outcome.phantom_batches.is_empty());
    assert_eq!(outcome.info.donor_vdisk_id, Some(donor));
}

#[tokio::test]
async fn test_empty_quantum_reports_eof() {
    let h = ReplHarness::new();
    let outcome = h.run_quantum(scan_options()).await;
    assert!(outcome.info.eof);
    assert_eq!(outcome.info.items_total, 0);
    assert!(outcome.sst_blobs.is_empty());
}
