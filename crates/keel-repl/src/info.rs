//! Quantum result counters, per-state time accounting, and the shared
//! monitoring handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use keel_types::{BlobId, VDiskId};

use crate::proxy::ProxyStat;

/// Everything a finished quantum reports to the owner.
#[derive(Debug, Clone, Default)]
pub struct ReplInfo {
    /// Blobs that needed work, including ones beyond this quantum's budget.
    pub items_total: u64,
    /// Blobs actually planned into this quantum.
    pub items_planned: u64,
    /// Work units (blob bytes) across everything that needs replication.
    pub work_units_total: u64,
    /// Work units planned into this quantum.
    pub work_units_planned: u64,
    /// Blobs recovered and handed to the writer.
    pub blobs_recovered: u64,
    /// Bytes recovered through the SST path.
    pub bytes_recovered: u64,
    /// Huge blobs recovered through the out-of-band channel.
    pub huge_blobs_recovered: u64,
    /// Bytes recovered through the huge-blob channel.
    pub huge_bytes_recovered: u64,
    /// Metadata-only parts materialized at finish.
    pub metadata_blobs: u64,
    /// Blobs confirmed phantom by cluster-wide verification.
    pub phantoms_detected: u64,
    /// Distinct chunks written by the SST writer.
    pub chunks_written: u64,
    /// Bytes pushed through chunk writes.
    pub sst_bytes_written: u64,
    /// Donor this quantum pulled from, if any.
    pub donor_vdisk_id: Option<VDiskId>,
    /// Key to resume the next quantum from (`None` once the index is
    /// exhausted).
    pub last_key: Option<BlobId>,
    /// Whether the index scan completed.
    pub eof: bool,
    /// Whether the donor can be decommissioned (donor mode, no transient
    /// errors anywhere).
    pub drop_donor: bool,
    /// Blobs that could not be recovered this quantum; the owner requeues
    /// them.
    pub unreplicated: Vec<BlobId>,
    /// Summed per-proxy transfer statistics.
    pub proxy_stat: ProxyStat,
    /// Wall-clock breakdown by job state.
    pub time: TimeStats,
}

impl ReplInfo {
    /// Record the quantum outcome.
    pub fn finish(&mut self, last_key: Option<BlobId>, eof: bool, drop_donor: bool) {
        self.last_key = last_key;
        self.eof = eof;
        self.drop_donor = drop_donor;
    }
}

// ---------------------------------------------------------------------------
// Time accounting
// ---------------------------------------------------------------------------

/// The states a job's wall-clock time is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeState {
    /// Waiting for the planner.
    PreparePlan,
    /// Waiting for the resume token.
    TokenWait,
    /// Waiting for peer proxy batches.
    ProxyWait,
    /// Merging peer replies.
    Merge,
    /// Waiting for block-device acks.
    PdiskOp,
    /// Waiting for the SST commit ack.
    Commit,
    /// Waiting for phantom-verification replies.
    Phantom,
    /// Everything else.
    Other,
}

const NUM_TIME_STATES: usize = 8;

/// Accumulated per-state durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeStats {
    totals: [Duration; NUM_TIME_STATES],
}

impl TimeStats {
    /// Time attributed to `state`.
    pub fn get(&self, state: TimeState) -> Duration {
        self.totals[state as usize]
    }
}

/// Tracks which state the job is in and attributes elapsed wall-clock time
/// to it.
#[derive(Debug)]
pub struct TimeAccount {
    current: TimeState,
    since: Instant,
    stats: TimeStats,
}

impl TimeAccount {
    /// Start accounting in the given state.
    pub fn new(initial: TimeState) -> Self {
        Self {
            current: initial,
            since: Instant::now(),
            stats: TimeStats::default(),
        }
    }

    /// Switch states, attributing the elapsed time to the previous one.
    pub fn set_state(&mut self, state: TimeState) {
        let now = Instant::now();
        self.stats.totals[self.current as usize] += now - self.since;
        self.since = now;
        self.current = state;
    }

    /// Close accounting and write the totals into `info`.
    pub fn finish(&mut self, info: &mut ReplInfo) {
        self.set_state(TimeState::Other);
        info.time = self.stats;
    }
}

// ---------------------------------------------------------------------------
// Monitoring handle
// ---------------------------------------------------------------------------

/// Shared monitoring counters, updated through this handle rather than
/// process-wide statics. Cheap to clone.
#[derive(Debug, Default)]
pub struct ReplMonGroup {
    /// Blobs recovered through the SST path since startup.
    pub blobs_recovered: AtomicU64,
    /// Bytes recovered through the SST path.
    pub blob_bytes_recovered: AtomicU64,
    /// Huge blobs recovered.
    pub huge_blobs_recovered: AtomicU64,
    /// Huge-blob bytes recovered.
    pub huge_blob_bytes_recovered: AtomicU64,
    /// Phantom-like blobs discovered by the planner.
    pub phantom_like_discovered: AtomicU64,
    /// Distinct chunks written by replication.
    pub chunks_written: AtomicU64,
    /// Work units still waiting for replication (set per plan).
    pub work_units_remaining: AtomicU64,
    /// Items still waiting for replication (set per plan).
    pub items_remaining: AtomicU64,
}

impl ReplMonGroup {
    /// Create a fresh, zeroed handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add to a counter.
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Overwrite a gauge.
    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }

    /// Read a counter.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_account_attributes_to_previous_state() {
        let mut account = TimeAccount::new(TimeState::PreparePlan);
        std::thread::sleep(Duration::from_millis(5));
        account.set_state(TimeState::Merge);

        let mut info = ReplInfo::default();
        account.finish(&mut info);

        assert!(info.time.get(TimeState::PreparePlan) >= Duration::from_millis(5));
        assert_eq!(info.time.get(TimeState::TokenWait), Duration::ZERO);
    }

    #[test]
    fn test_mon_group_counters() {
        let mon = ReplMonGroup::new();
        ReplMonGroup::add(&mon.blobs_recovered, 3);
        ReplMonGroup::add(&mon.blobs_recovered, 2);
        assert_eq!(ReplMonGroup::get(&mon.blobs_recovered), 5);

        ReplMonGroup::set(&mon.items_remaining, 42);
        assert_eq!(ReplMonGroup::get(&mon.items_remaining), 42);
    }
}
