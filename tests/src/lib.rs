//! Shared test harness for Keel integration tests.
//!
//! Provides [`ReplHarness`] — a mirror-3dc group with in-memory peer
//! stores that drives a full replication quantum: planning → peer merge →
//! recovery → SST write → commit → phantom verification. Phantom GETs are
//! answered by the real [`Mirror3dcGetStrategy`] running against the same
//! peer stores, so the engine and the cluster read path are tested as one
//! system.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use keel_index::{
    Barrier, BarrierEssence, IndexError, IndexSnapshot, Ingress, KeepMode, LocalSnapshot, MemRec,
    SnapshotSource,
};
use keel_repl::{
    OwnerMsg, PdiskMsg, PeerItem, PeerReader, PhantomResponse, ReplEnv, ReplError, ReplInfo,
    ReplJob, ReplJobOptions, ReplMonGroup, ReplQuoter, ReplEvent,
};
use keel_strategy::{BlobState, DiskRequests, Mirror3dcGetStrategy, Situation, StrategyOutcome};
use keel_topology::{GroupInfo, GroupTopology, NoDelayData, QuorumChecker};
use keel_types::{
    AccelerationMode, BlobId, IntervalSet, PartId, PartSet, ReplConfig, ReplyStatus, VDiskId,
};
use tokio::sync::mpsc;

/// Order number of the disk under test.
pub const SELF_ORDER: u32 = 0;

/// Install the test tracing subscriber once per test binary.
///
/// Honors `RUST_LOG`, so a failing run can be replayed with full engine
/// tracing.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Everything one quantum produced, observed from the outside.
#[derive(Debug)]
pub struct QuantumOutcome {
    /// The quantum's result counters.
    pub info: ReplInfo,
    /// Blobs written through the SST path, reassembled from the chunk
    /// writes and the commit record.
    pub sst_blobs: BTreeMap<BlobId, Bytes>,
    /// Blobs routed through the huge-blob channel.
    pub huge_blobs: BTreeMap<BlobId, Bytes>,
    /// Blob ids in the order the commit records listed them.
    pub commit_order: Vec<BlobId>,
    /// Phantom ids the job reported to the owner.
    pub phantom_notice: Vec<BlobId>,
    /// Sizes of the phantom GET batches observed.
    pub phantom_batches: Vec<usize>,
}

/// An in-memory mirror-3dc group around one disk that is missing data.
pub struct ReplHarness {
    /// The group under test.
    pub group: GroupInfo,
    /// Engine configuration (tests tweak budgets through this).
    pub config: ReplConfig,
    entries: BTreeMap<BlobId, MemRec>,
    barriers: BarrierEssence,
    peers: HashMap<(VDiskId, BlobId), (u8, Bytes)>,
    broken: HashSet<VDiskId>,
}

impl Default for ReplHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplHarness {
    /// A fresh harness with an empty index.
    pub fn new() -> Self {
        init_tracing();
        Self {
            group: GroupInfo::new(1, 1, GroupTopology::mirror_3dc()),
            config: ReplConfig {
                min_huge_blob_size: 1 << 20,
                ..ReplConfig::default()
            },
            entries: BTreeMap::new(),
            barriers: BarrierEssence::new(),
            peers: HashMap::new(),
            broken: HashSet::new(),
        }
    }

    /// A blob id in the harness's keyspace.
    pub fn blob(&self, step: u32, size: u32) -> BlobId {
        BlobId::new(4200, 1, step, 0, 0, size)
    }

    fn index_entry(&self, id: &BlobId, keep_mode: KeepMode) -> MemRec {
        let subgroup = self.group.subgroup_for(id);
        let self_idx = self
            .group
            .topology
            .subgroup_idx_of(&subgroup, SELF_ORDER)
            .expect("subgroup spans all disks");
        let mut ingress = Ingress::new(9, 3);
        ingress.set_part(self_idx, self.group.topology.ring_of_subgroup_idx(self_idx));
        MemRec {
            ingress,
            local_parts: PartSet::empty(3),
            keep_mode,
        }
    }

    /// Register a blob that exists on every peer but is missing locally.
    pub fn add_missing_blob(&mut self, id: BlobId, data: Bytes) {
        assert_eq!(id.blob_size as usize, data.len());
        self.entries.insert(id, self.index_entry(&id, KeepMode::Default));
        let subgroup = self.group.subgroup_for(&id);
        for (idx, &order) in subgroup.iter().enumerate() {
            if order == SELF_ORDER {
                continue;
            }
            let part_idx = self.group.topology.ring_of_subgroup_idx(idx as u32);
            self.peers
                .insert((self.group.vdisk_id(order), id), (part_idx, data.clone()));
        }
    }

    /// Register a keep-flag-saved blob that no disk anywhere holds: a
    /// phantom candidate that the cluster will confirm.
    pub fn add_phantom_candidate(&mut self, id: BlobId) {
        self.entries.insert(id, self.index_entry(&id, KeepMode::Keep));
        self.set_barrier_over(id);
    }

    /// Register a keep-flag-saved blob that peers DO hold: it looks
    /// phantom-like to the planner, but verification finds the data.
    pub fn add_false_phantom(&mut self, id: BlobId, data: Bytes) {
        self.add_missing_blob(id, data);
        self.entries.insert(id, self.index_entry(&id, KeepMode::Keep));
        self.set_barrier_over(id);
    }

    fn set_barrier_over(&mut self, id: BlobId) {
        self.barriers.set_barrier(
            id.tablet_id,
            id.channel,
            Barrier {
                collect_generation: u32::MAX,
                collect_step: u32::MAX,
            },
        );
    }

    /// Make one peer disk fail every fetch.
    pub fn break_peer(&mut self, order_number: u32) {
        self.broken.insert(self.group.vdisk_id(order_number));
    }

    /// Make a foreign donor disk fail every fetch.
    pub fn break_donor(&mut self, donor: VDiskId) {
        self.broken.insert(donor);
    }

    /// Register a blob missing locally whose only copy lives on a donor
    /// disk outside the group.
    pub fn add_donor_blob(&mut self, donor: VDiskId, id: BlobId, data: Bytes) {
        assert_eq!(id.blob_size as usize, data.len());
        self.entries.insert(id, self.index_entry(&id, KeepMode::Default));
        self.peers.insert((donor, id), (0, data));
    }

    /// Answer one phantom query the way the cluster's get path would:
    /// run the mirror-3dc strategy against the same peer stores.
    fn phantom_verdict(&self, id: BlobId) -> PhantomResponse {
        let topology = self.group.topology;
        let subgroup = self.group.subgroup_for(&id);
        let checker = QuorumChecker::new(topology);
        let strategy = Mirror3dcGetStrategy::new(None, AccelerationMode::SkipOneSlowest, true);

        let mut state = BlobState::new(
            id,
            IntervalSet::from_range(0, id.blob_size as u64),
            &subgroup,
            topology.num_parts(),
        );

        loop {
            let mut requests = DiskRequests::new();
            match strategy.process(&mut state, &topology, &checker, &NoDelayData, &mut requests) {
                StrategyOutcome::InProgress => {
                    for req in requests.drain() {
                        let vdisk = self.group.vdisk_id(req.order_number);
                        if self.broken.contains(&vdisk) {
                            state.process_reply(
                                req.order_number,
                                req.part_id,
                                ReplyStatus::Error,
                                0,
                                &[],
                            );
                            continue;
                        }
                        match self.peers.get(&(vdisk, id)) {
                            Some((part_idx, data)) if *part_idx == req.part_id.part_idx() => {
                                state.process_reply(
                                    req.order_number,
                                    req.part_id,
                                    ReplyStatus::Ok,
                                    0,
                                    data,
                                );
                            }
                            _ => state.process_reply(
                                req.order_number,
                                req.part_id,
                                ReplyStatus::NoData,
                                0,
                                &[],
                            ),
                        }
                    }
                }
                StrategyOutcome::Done => {
                    let status = match state.whole_situation {
                        Situation::Present => ReplyStatus::Ok,
                        Situation::Absent => ReplyStatus::NoData,
                        _ => ReplyStatus::Error,
                    };
                    return PhantomResponse {
                        id,
                        status,
                        looks_like_phantom: state.looks_like_phantom,
                    };
                }
                StrategyOutcome::Error(_) => {
                    return PhantomResponse {
                        id,
                        status: ReplyStatus::Error,
                        looks_like_phantom: false,
                    };
                }
            }
        }
    }

    /// Run one full quantum and observe everything it does.
    pub async fn run_quantum(&self, options: ReplJobOptions) -> QuantumOutcome {
        let (owner_tx, mut owner_rx) = mpsc::channel(64);
        let (pdisk_tx, mut pdisk_rx) = mpsc::channel(64);
        let (commit_tx, mut commit_rx) = mpsc::channel(64);
        let (huge_tx, mut huge_rx) = mpsc::channel(64);
        let (get_tx, mut get_rx) = mpsc::channel(64);

        let snapshot = LocalSnapshot {
            index: IndexSnapshot::from_entries(self.entries.clone()),
            barriers: Arc::new(self.barriers.clone()),
            allow_keep_flags: self.config.allow_keep_flags,
        };

        let env = ReplEnv {
            owner_tx,
            pdisk_tx,
            commit_tx,
            huge_tx,
            get_tx,
            snapshot_source: Arc::new(FixedSource { snapshot }),
            peer_reader: Arc::new(PeerMap {
                peers: self.peers.clone(),
                broken: self.broken.clone(),
            }),
            quoter: ReplQuoter::new(1 << 30),
            mon: ReplMonGroup::new(),
        };

        let (job, job_tx) = ReplJob::new(self.config.clone(), self.group.clone(), SELF_ORDER, env, options);
        let handle = tokio::spawn(job.run());

        let mut chunks: HashMap<u32, Bytes> = HashMap::new();
        let mut next_chunk = 0u32;
        let mut sst_blobs = BTreeMap::new();
        let mut commit_order = Vec::new();
        let mut huge_blobs = BTreeMap::new();
        let mut phantom_notice = Vec::new();
        let mut phantom_batches = Vec::new();

        let info = loop {
            tokio::select! {
                Some(msg) = owner_rx.recv() => match msg {
                    OwnerMsg::ReplStarted => {
                        job_tx.send(ReplEvent::Resume).await.unwrap();
                    }
                    OwnerMsg::DetectedPhantomBlob(ids) => {
                        phantom_notice = ids;
                        job_tx.send(ReplEvent::DetectedPhantomBlobCommitted).await.unwrap();
                    }
                    OwnerMsg::ReplFinished(info) => break *info,
                },
                Some(req) = pdisk_rx.recv() => match req.msg {
                    PdiskMsg::ChunkReserve { count } => {
                        let chunk_ids: Vec<u32> = (0..count).map(|i| next_chunk + i).collect();
                        next_chunk += count;
                        job_tx.send(ReplEvent::ChunkReserved { chunk_ids }).await.unwrap();
                    }
                    PdiskMsg::ChunkWrite { chunk_idx, data } => {
                        chunks.insert(chunk_idx, data);
                        job_tx.send(ReplEvent::ChunkWritten { chunk_idx }).await.unwrap();
                    }
                },
                Some(req) = commit_rx.recv() => {
                    // Resolve the committed entries against the written
                    // chunks: this is what a reader would see.
                    for entry in &req.msg.entries {
                        let data = if entry.len == 0 {
                            Bytes::new()
                        } else {
                            let chunk = chunks.get(&entry.chunk_idx).expect("entry chunk written");
                            chunk.slice(entry.offset as usize..(entry.offset + entry.len) as usize)
                        };
                        sst_blobs.insert(entry.id, data);
                        commit_order.push(entry.id);
                    }
                    job_tx.send(ReplEvent::SstCommitted).await.unwrap();
                },
                Some(blob) = huge_rx.recv() => {
                    huge_blobs.insert(blob.id, blob.data);
                    job_tx.send(ReplEvent::HugeBlobWritten).await.unwrap();
                },
                Some(get) = get_rx.recv() => {
                    assert!(get.phantom_check);
                    phantom_batches.push(get.queries.len());
                    let responses: Vec<PhantomResponse> =
                        get.queries.iter().map(|&id| self.phantom_verdict(id)).collect();
                    job_tx.send(ReplEvent::PhantomGetResult {
                        cookie: get.cookie,
                        responses,
                    }).await.unwrap();
                },
            }
        };

        handle.await.unwrap().unwrap();
        QuantumOutcome {
            info,
            sst_blobs,
            commit_order,
            huge_blobs,
            phantom_notice,
            phantom_batches,
        }
    }
}

struct FixedSource {
    snapshot: LocalSnapshot,
}

#[async_trait::async_trait]
impl SnapshotSource for FixedSource {
    async fn take_snapshot(&self) -> Result<LocalSnapshot, IndexError> {
        Ok(self.snapshot.clone())
    }
}

struct PeerMap {
    peers: HashMap<(VDiskId, BlobId), (u8, Bytes)>,
    broken: HashSet<VDiskId>,
}

#[async_trait::async_trait]
impl PeerReader for PeerMap {
    async fn fetch(
        &self,
        vdisk: VDiskId,
        blobs: Vec<(BlobId, u32)>,
    ) -> Result<Vec<PeerItem>, ReplError> {
        if self.broken.contains(&vdisk) {
            return Err(ReplError::PeerTransport("peer down".into()));
        }
        let mut items = Vec::new();
        for (blob, _expected) in blobs {
            match self.peers.get(&(vdisk, blob)) {
                Some((part_idx, data)) => items.push(PeerItem {
                    part_id: PartId::from_part_idx(blob, *part_idx),
                    status: ReplyStatus::Ok,
                    data: data.clone(),
                }),
                None => items.push(PeerItem {
                    part_id: PartId::from_part_idx(blob, 0),
                    status: ReplyStatus::NoData,
                    data: Bytes::new(),
                }),
            }
        }
        Ok(items)
    }
}

/// Deterministic test payload of the given size.
pub fn test_data(size: usize, seed: u8) -> Bytes {
    let mut data = Vec::with_capacity(size);
    for i in 0..size {
        data.push(seed.wrapping_add((i as u8).wrapping_mul(31)));
    }
    Bytes::from(data)
}

/// Options for a plain index-scan quantum.
pub fn scan_options() -> ReplJobOptions {
    ReplJobOptions::default()
}

/// Options for a donor-mode quantum.
pub fn donor_options(donor: VDiskId) -> ReplJobOptions {
    ReplJobOptions {
        donor: Some(donor),
        ..ReplJobOptions::default()
    }
}

/// Options resuming an index scan.
pub fn resume_options(start_key: Option<BlobId>) -> ReplJobOptions {
    ReplJobOptions {
        start_key,
        ..ReplJobOptions::default()
    }
}

/// Options retrying an explicit set of blobs.
pub fn queue_options(blobs: Vec<BlobId>) -> ReplJobOptions {
    ReplJobOptions {
        blobs_to_replicate: Some(VecDeque::from(blobs)),
        ..ReplJobOptions::default()
    }
}
