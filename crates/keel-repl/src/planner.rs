//! Quantum planning: scan the local index for blobs that need replication.
//!
//! A planning pass streams the index forward from the last resume key (or
//! over an explicit blob queue), honors GC barriers, registers
//! metadata-only parts, and stops filling the recovery machine once the
//! byte or task budget is hit — everything past that point is only counted
//! into the totals so progress can be reported.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use keel_index::{LocalSnapshot, MemRec, SnapshotSource};
use keel_types::{BlobId, PartId, ReplConfig, VDiskId};
use keel_topology::GroupInfo;
use tracing::{debug, info};

use crate::error::ReplError;
use crate::info::ReplInfo;
use crate::machine::RecoveryMachine;

/// Budget checks happen every this many scanned keys.
const BUDGET_CHECK_PERIOD: u64 = 1024;

/// The outcome of one planning pass.
#[derive(Debug)]
pub struct PlanFinished {
    /// The filled recovery machine.
    pub machine: RecoveryMachine,
    /// First key not planned; the next quantum resumes here.
    pub last_key: Option<BlobId>,
    /// True when the scan exhausted the index.
    pub eof: bool,
    /// Counters accumulated during planning.
    pub info: ReplInfo,
}

/// One-shot planner for a single quantum.
pub struct ReplPlanner {
    config: ReplConfig,
    group: GroupInfo,
    /// Order number of the local disk within the group.
    self_order_number: u32,
    snapshot_source: Arc<dyn SnapshotSource>,
    start_key: Option<BlobId>,
    /// Explicit keys to replicate instead of an index scan (retry/donor
    /// path).
    blobs_to_replicate: Option<VecDeque<BlobId>>,
    donor: Option<VDiskId>,

    machine: RecoveryMachine,
    info: ReplInfo,
    quantum_bytes: u64,
    adding_tasks: bool,
    key_to_resume: Option<BlobId>,
}

impl ReplPlanner {
    /// Create a planner.
    ///
    /// `unreplicated` is the leftover queue from prior quanta; its blobs
    /// are counted into the totals up front and retried by the machine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplConfig,
        group: GroupInfo,
        self_order_number: u32,
        snapshot_source: Arc<dyn SnapshotSource>,
        start_key: Option<BlobId>,
        blobs_to_replicate: Option<VecDeque<BlobId>>,
        unreplicated: VecDeque<BlobId>,
        donor: Option<VDiskId>,
    ) -> Self {
        let mut info = ReplInfo {
            donor_vdisk_id: donor,
            ..ReplInfo::default()
        };

        // Leftovers from prior quanta count as outstanding work too.
        for id in &unreplicated {
            info.work_units_total += id.blob_size as u64;
        }
        info.items_total += unreplicated.len() as u64;

        let machine = RecoveryMachine::new(&config, unreplicated);

        Self {
            config,
            group,
            self_order_number,
            snapshot_source,
            start_key,
            blobs_to_replicate,
            donor,
            machine,
            info,
            quantum_bytes: 0,
            adding_tasks: true,
            key_to_resume: None,
        }
    }

    /// Run the planning pass to completion.
    ///
    /// The pass is time-boxed: every [`BUDGET_CHECK_PERIOD`] keys the
    /// elapsed time is checked against the plan quantum, and on expiry a
    /// *fresh* snapshot is taken and the scan resumes from the current key.
    pub async fn plan(mut self) -> Result<PlanFinished, ReplError> {
        let eof = loop {
            let snapshot = self.snapshot_source.take_snapshot().await?;
            let deadline = Instant::now() + self.config.plan_quantum;

            match self.run_pass(&snapshot, deadline) {
                PassOutcome::Finished { eof } => break eof,
                PassOutcome::QuantumExpired => {
                    debug!(
                        resume_key = ?self.start_key,
                        "plan quantum expired, refreshing snapshot"
                    );
                }
            }
        };

        info!(
            tasks = self.machine.num_tasks(),
            planned = self.info.items_planned,
            total = self.info.items_total,
            eof,
            "planning pass finished"
        );

        Ok(PlanFinished {
            machine: self.machine,
            last_key: self.key_to_resume,
            eof,
            info: self.info,
        })
    }

    fn run_pass(&mut self, snapshot: &LocalSnapshot, deadline: Instant) -> PassOutcome {
        if self.blobs_to_replicate.is_some() {
            self.run_queue_pass(snapshot, deadline)
        } else {
            self.run_scan_pass(snapshot, deadline)
        }
    }

    /// Scan mode: walk the index forward from the resume key.
    fn run_scan_pass(&mut self, snapshot: &LocalSnapshot, deadline: Instant) -> PassOutcome {
        let start = self.start_key.unwrap_or_default();
        let mut counter = 0u64;

        for (key, memrec) in snapshot.index.iter_from(&start) {
            self.start_key = Some(*key);
            counter += 1;
            if counter % BUDGET_CHECK_PERIOD == 0 && Instant::now() >= deadline {
                return PassOutcome::QuantumExpired;
            }

            if self.adding_tasks {
                self.process_item(snapshot, key, memrec);
            } else {
                // Out of budget: only count the remaining work.
                if self.needs_replication(snapshot, key, memrec) {
                    self.info.items_total += 1;
                    self.info.work_units_total += key.blob_size as u64;
                }
                if self.key_to_resume.is_none() {
                    self.key_to_resume = Some(*key);
                }
            }
        }

        PassOutcome::Finished {
            eof: self.key_to_resume.is_none(),
        }
    }

    /// Queue mode: seek each requested key in the snapshot.
    fn run_queue_pass(&mut self, snapshot: &LocalSnapshot, deadline: Instant) -> PassOutcome {
        let mut queue = self.blobs_to_replicate.take().unwrap_or_default();
        let mut counter = 0u64;

        while self.adding_tasks {
            let Some(key) = queue.front().copied() else {
                break;
            };
            counter += 1;
            if counter % BUDGET_CHECK_PERIOD == 0 && Instant::now() >= deadline {
                self.blobs_to_replicate = Some(queue);
                return PassOutcome::QuantumExpired;
            }

            if let Some(memrec) = snapshot.index.get(&key) {
                self.process_item(snapshot, &key, memrec);
            }
            queue.pop_front();
        }

        // Whatever did not fit is counted and carried over for retry.
        let eof = queue.is_empty();
        for key in queue {
            self.info.items_total += 1;
            self.info.work_units_total += key.blob_size as u64;
            self.machine.push_unreplicated(key);
        }
        PassOutcome::Finished { eof }
    }

    /// Missing parts for `key` on the local disk, after barrier filtering.
    fn missing_parts(
        &self,
        snapshot: &LocalSnapshot,
        key: &BlobId,
        memrec: &MemRec,
    ) -> Option<(keel_types::PartSet, bool)> {
        let topology = &self.group.topology;
        let subgroup = self.group.subgroup_for(key);
        let self_idx = topology.subgroup_idx_of(&subgroup, self.self_order_number)?;

        let must_have = memrec
            .ingress
            .parts_we_must_have_locally(topology, self_idx);
        let parts = must_have.difference(&memrec.local_parts);
        if parts.is_empty() {
            return None;
        }

        let status = snapshot
            .barriers
            .keep(key, memrec, snapshot.allow_keep_flags);
        if !status.keep_data {
            return None;
        }

        Some((parts, status.keep_by_barrier))
    }

    fn needs_replication(
        &self,
        snapshot: &LocalSnapshot,
        key: &BlobId,
        memrec: &MemRec,
    ) -> bool {
        self.missing_parts(snapshot, key, memrec).is_some()
    }

    fn process_item(&mut self, snapshot: &LocalSnapshot, key: &BlobId, memrec: &MemRec) {
        let Some((mut parts, keep_by_barrier)) = self.missing_parts(snapshot, key, memrec) else {
            return;
        };

        // Zero-length parts carry no data; register them separately.
        for part_idx in parts.iter().collect::<Vec<_>>() {
            let part = PartId::from_part_idx(*key, part_idx);
            if part.part_size() == 0 {
                parts.clear(part_idx);
                self.machine.add_metadata_part(part);
            }
        }

        self.info.items_planned += 1;
        self.info.work_units_planned += key.blob_size as u64;
        self.info.items_total += 1;
        self.info.work_units_total += key.blob_size as u64;

        if !parts.is_empty() {
            let phantom_like = !keep_by_barrier && self.donor.is_none();
            self.machine
                .add_task(*key, parts, phantom_like, memrec.ingress.clone());

            for part_idx in parts.iter() {
                self.quantum_bytes += PartId::from_part_idx(*key, part_idx).part_size() as u64;
            }
        }

        if self.machine.full_of_tasks() || self.quantum_bytes >= self.config.max_quantum_bytes {
            self.adding_tasks = false;
        }
    }
}

enum PassOutcome {
    Finished { eof: bool },
    QuantumExpired,
}
