//! The replication job: one quantum of replication work, end to end.
//!
//! A job plans its tasks, waits for an admission token, fans out pull
//! proxies to the peers that may hold replicas, k-way merges their replies
//! in blob order, reconstructs blobs, streams them into SSTs (or the
//! out-of-band huge-blob channel), verifies apparent absences against the
//! cluster, and reports the quantum's outcome to its owner.
//!
//! The job is one cooperative task: it only suspends waiting for events on
//! its channel or for admission from the write-rate quoter. All mutable
//! state is local to the job.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use keel_index::SnapshotSource;
use keel_types::{BlobId, PartSet, RecoveredBlob, ReplConfig, VDiskId};
use keel_topology::GroupInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ReplError;
use crate::events::{
    CommitRequest, OwnerMsg, PdiskRequest, PhantomGetRequest, RecoveredHugeBlob, ReplEvent,
};
use crate::info::{ReplInfo, ReplMonGroup, TimeAccount, TimeState};
use crate::machine::{BlobReplies, RecoveryMachine};
use crate::planner::{PlanFinished, ReplPlanner};
use crate::proxy::{PeerReader, ProxyStat, VDiskProxy};
use crate::quoter::ReplQuoter;
use crate::writer::{PdiskMsg, SstWriter, WriterState};

/// At most this many queries per phantom-verification request.
const MAX_PHANTOM_BATCH_QUERIES: usize = 32;
/// At most this many phantom-verification requests in flight.
const MAX_PHANTOM_BATCHES_IN_FLIGHT: usize = 32;
/// Payload bytes per SST chunk.
const SST_CHUNK_PAYLOAD: usize = 8 << 20;
/// Chunks per SST before it is sealed and committed.
const SST_MAX_CHUNKS: usize = 16;
/// Event channel depth.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Everything a job needs from the outside world.
#[derive(Clone)]
pub struct ReplEnv {
    /// Upstream owner (receives start/phantom/finish notifications).
    pub owner_tx: mpsc::Sender<OwnerMsg>,
    /// Block device operations.
    pub pdisk_tx: mpsc::Sender<PdiskRequest>,
    /// Index-layer SST commits.
    pub commit_tx: mpsc::Sender<CommitRequest>,
    /// Out-of-band huge-blob writes.
    pub huge_tx: mpsc::Sender<RecoveredHugeBlob>,
    /// Cluster GET path for phantom verification.
    pub get_tx: mpsc::Sender<PhantomGetRequest>,
    /// The local index owner.
    pub snapshot_source: Arc<dyn SnapshotSource>,
    /// Peer transport.
    pub peer_reader: Arc<dyn PeerReader>,
    /// Process-wide write-rate quoter.
    pub quoter: Arc<ReplQuoter>,
    /// Monitoring counters.
    pub mon: Arc<ReplMonGroup>,
}

/// Per-quantum inputs.
#[derive(Debug, Default)]
pub struct ReplJobOptions {
    /// Key to resume the index scan from.
    pub start_key: Option<BlobId>,
    /// Explicit blobs to replicate instead of an index scan.
    pub blobs_to_replicate: Option<VecDeque<BlobId>>,
    /// Leftover queue from prior quanta.
    pub unreplicated: VecDeque<BlobId>,
    /// Donor disk to pull everything from (disables phantom checks).
    pub donor: Option<VDiskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    PreparePlan,
    TokenWait,
    /// Waiting for the first batch from every proxy.
    Init,
    Merge,
    /// Waiting for the owner to commit detected phantoms.
    WaitPhantomCommit,
    Terminated,
}

/// What to do after draining one proxy during a merge step.
enum AfterDrain {
    Reinsert(BlobId),
    Eof,
    NeedBatch,
}

enum QueueAction {
    Continue,
    Restart,
    Exit,
}

/// One bounded unit of replication work.
pub struct ReplJob {
    config: ReplConfig,
    group: GroupInfo,
    self_order_number: u32,
    env: ReplEnv,
    donor: Option<VDiskId>,

    rx: mpsc::Receiver<ReplEvent>,
    self_tx: mpsc::Sender<ReplEvent>,
    options: Option<ReplJobOptions>,

    /// Spawned child tasks; aborted on poison.
    planner_handle: Option<JoinHandle<()>>,
    fetch_handles: Vec<JoinHandle<()>>,

    state: JobState,
    machine: Option<RecoveryMachine>,
    machine_finished: bool,
    last_key: Option<BlobId>,
    eof: bool,

    proxies: Vec<Option<VDiskProxy>>,
    num_running_proxies: usize,
    merge_heap: BinaryHeap<Reverse<(BlobId, usize)>>,
    current_item: Option<BlobReplies>,
    last_processed_key: Option<BlobId>,

    recovery_queue: VecDeque<RecoveredBlob>,
    writer: SstWriter,
    writer_finished: bool,
    written_chunks: HashSet<u32>,

    huge_blobs_in_flight: u32,

    phantom_pending: VecDeque<(BlobId, PartSet)>,
    phantom_in_flight: HashMap<u64, Vec<(BlobId, PartSet)>>,
    last_phantom_cookie: u64,
    phantoms: Vec<BlobId>,

    info: ReplInfo,
    time: TimeAccount,
}

impl ReplJob {
    /// Create a job and the sender its collaborators deliver events
    /// through.
    pub fn new(
        config: ReplConfig,
        group: GroupInfo,
        self_order_number: u32,
        env: ReplEnv,
        options: ReplJobOptions,
    ) -> (Self, mpsc::Sender<ReplEvent>) {
        let (self_tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let donor = options.donor;
        let job = Self {
            config,
            group,
            self_order_number,
            env,
            donor,
            rx,
            self_tx: self_tx.clone(),
            options: Some(options),
            planner_handle: None,
            fetch_handles: Vec::new(),
            state: JobState::PreparePlan,
            machine: None,
            machine_finished: false,
            last_key: None,
            eof: false,
            proxies: Vec::new(),
            num_running_proxies: 0,
            merge_heap: BinaryHeap::new(),
            current_item: None,
            last_processed_key: None,
            recovery_queue: VecDeque::new(),
            writer: SstWriter::new(SST_CHUNK_PAYLOAD, SST_MAX_CHUNKS),
            writer_finished: false,
            written_chunks: HashSet::new(),
            huge_blobs_in_flight: 0,
            phantom_pending: VecDeque::new(),
            phantom_in_flight: HashMap::new(),
            last_phantom_cookie: 0,
            phantoms: Vec::new(),
            info: ReplInfo::default(),
            time: TimeAccount::new(TimeState::PreparePlan),
        };
        (job, self_tx)
    }

    /// Run the quantum to completion (or poison).
    pub async fn run(mut self) -> Result<(), ReplError> {
        debug!(donor = ?self.donor, "replication job started");
        self.spawn_planner();

        loop {
            let Some(event) = self.rx.recv().await else {
                return Err(ReplError::ChannelClosed("job event channel"));
            };

            match event {
                ReplEvent::Poison => {
                    info!("replication job poisoned, shutting down");
                    self.kill_children();
                    self.state = JobState::Terminated;
                    return Ok(());
                }
                ReplEvent::PlanFailed(e) => return Err(e),
                ReplEvent::PlanFinished(plan) => self.handle_plan_finished(*plan).await?,
                ReplEvent::Resume => self.handle_resume().await?,
                ReplEvent::ProxyNext { proxy_slot, result } => {
                    self.handle_proxy_next(proxy_slot, result).await?;
                }
                ReplEvent::ChunkReserved { chunk_ids } => {
                    self.writer.apply_chunk_reserved(&chunk_ids);
                    self.merge().await?;
                }
                ReplEvent::ChunkWritten { chunk_idx } => {
                    self.writer.apply_chunk_written(chunk_idx);
                    self.merge().await?;
                }
                ReplEvent::SstCommitted => {
                    self.writer.apply_commit();
                    self.merge().await?;
                }
                ReplEvent::HugeBlobWritten => {
                    assert!(self.huge_blobs_in_flight > 0);
                    self.huge_blobs_in_flight -= 1;
                    self.merge().await?;
                }
                ReplEvent::PhantomGetResult { cookie, responses } => {
                    self.handle_phantom_result(cookie, responses).await?;
                }
                ReplEvent::DetectedPhantomBlobCommitted => {
                    assert_eq!(self.state, JobState::WaitPhantomCommit);
                    self.complete().await?;
                }
            }

            if self.state == JobState::Terminated {
                return Ok(());
            }
        }
    }

    fn spawn_planner(&mut self) {
        let options = self.options.take().expect("planner spawned once");
        let planner = ReplPlanner::new(
            self.config.clone(),
            self.group.clone(),
            self.self_order_number,
            self.env.snapshot_source.clone(),
            options.start_key,
            options.blobs_to_replicate,
            options.unreplicated,
            options.donor,
        );
        let tx = self.self_tx.clone();
        self.planner_handle = Some(tokio::spawn(async move {
            let event = match planner.plan().await {
                Ok(plan) => ReplEvent::PlanFinished(Box::new(plan)),
                Err(e) => ReplEvent::PlanFailed(e),
            };
            let _ = tx.send(event).await;
        }));
    }

    /// Abort the planner and any in-flight proxy fetches.
    fn kill_children(&mut self) {
        if let Some(handle) = self.planner_handle.take() {
            handle.abort();
        }
        for handle in self.fetch_handles.drain(..) {
            handle.abort();
        }
    }

    async fn handle_plan_finished(&mut self, plan: PlanFinished) -> Result<(), ReplError> {
        assert_eq!(self.state, JobState::PreparePlan);
        self.info = plan.info;
        self.last_key = plan.last_key;
        self.eof = plan.eof;

        // A growing backlog between quanta means membership churn or peer
        // failures added work faster than we retire it.
        let mon = &self.env.mon;
        let prev_work = ReplMonGroup::get(&mon.work_units_remaining);
        let prev_items = ReplMonGroup::get(&mon.items_remaining);
        if (prev_work > 0 && self.info.work_units_total > prev_work)
            || (prev_items > 0 && self.info.items_total > prev_items)
        {
            warn!(
                work_units_total = self.info.work_units_total,
                work_units_remaining = prev_work,
                items_total = self.info.items_total,
                items_remaining = prev_items,
                "replication work added"
            );
        }
        ReplMonGroup::set(&mon.work_units_remaining, self.info.work_units_total);
        ReplMonGroup::set(&mon.items_remaining, self.info.items_total);

        if plan.machine.no_tasks() {
            self.machine = Some(plan.machine);
            debug!("nothing to replicate this quantum");
            self.start_finish().await?;
            return Ok(());
        }

        self.machine = Some(plan.machine);
        self.env
            .owner_tx
            .send(OwnerMsg::ReplStarted)
            .await
            .map_err(|_| ReplError::ChannelClosed("owner channel"))?;
        self.time.set_state(TimeState::TokenWait);
        self.state = JobState::TokenWait;
        Ok(())
    }

    async fn handle_resume(&mut self) -> Result<(), ReplError> {
        assert_eq!(self.state, JobState::TokenWait);
        debug!("resume token granted");
        self.time.set_state(TimeState::ProxyWait);

        self.setup_proxies();
        assert_eq!(self.num_running_proxies, 0);
        for slot in 0..self.proxies.len() {
            if self.proxies[slot].is_some() {
                self.num_running_proxies += 1;
                self.dispatch_batch(slot);
            }
        }

        if self.num_running_proxies == 0 {
            self.state = JobState::Merge;
            self.merge().await?;
        } else {
            self.state = JobState::Init;
        }
        Ok(())
    }

    /// Create one pull proxy per peer disk that may hold data we need.
    fn setup_proxies(&mut self) {
        let machine = self.machine.as_mut().expect("plan finished");

        if self.donor.is_some() {
            // A donor hands over everything it has; absence there proves
            // nothing about the cluster, so phantom checks are off.
            machine.clear_possible_phantom();
        }

        if let Some(donor_vdisk) = self.donor {
            let mut proxy = VDiskProxy::new(donor_vdisk);
            machine.for_each(|blob, parts, _ingress| {
                let expected: u32 = parts
                    .iter()
                    .map(|p| keel_types::PartId::from_part_idx(*blob, p).part_size())
                    .sum();
                proxy.put(*blob, expected);
            });
            self.proxies = vec![proxy.has_seeds().then_some(proxy)];
            return;
        }

        let group = &self.group;
        let self_order = self.self_order_number;
        let mut proxies: Vec<Option<VDiskProxy>> =
            (0..group.topology.total_disks()).map(|_| None).collect();

        machine.for_each(|blob, _parts, ingress| {
            let subgroup = group.subgroup_for(blob);
            for (idx, &order_number) in subgroup.iter().enumerate() {
                if order_number == self_order {
                    continue;
                }
                let proxy = proxies[order_number as usize]
                    .get_or_insert_with(|| VDiskProxy::new(group.vdisk_id(order_number)));

                // Pre-size the reply from the parts this peer is known to
                // hold so it can batch sensibly.
                let known = ingress.known_parts(idx as u32);
                let expected: u32 = known
                    .iter()
                    .map(|p| keel_types::PartId::from_part_idx(*blob, p).part_size())
                    .sum();
                proxy.put(*blob, expected);
            }
        });

        self.proxies = proxies;
    }

    /// Kick off the next batch fetch for one proxy.
    fn dispatch_batch(&mut self, slot: usize) {
        let proxy = self.proxies[slot].as_mut().expect("proxy exists");
        let Some(batch) = proxy.next_batch() else {
            return;
        };
        let vdisk = proxy.vdisk_id;
        let reader = self.env.peer_reader.clone();
        let tx = self.self_tx.clone();
        self.fetch_handles.retain(|handle| !handle.is_finished());
        self.fetch_handles.push(tokio::spawn(async move {
            let result = reader.fetch(vdisk, batch).await;
            let _ = tx
                .send(ReplEvent::ProxyNext {
                    proxy_slot: slot,
                    result,
                })
                .await;
        }));
    }

    async fn handle_proxy_next(
        &mut self,
        slot: usize,
        result: Result<Vec<crate::events::PeerItem>, ReplError>,
    ) -> Result<(), ReplError> {
        let proxy = self.proxies[slot].as_mut().expect("proxy exists");
        proxy.handle_next(result);

        if proxy.valid() {
            let key = proxy.current_blob().expect("valid proxy has a key");
            self.merge_heap.push(Reverse((key, slot)));
        } else if proxy.is_eof() {
            debug!(vdisk = %proxy.vdisk_id, "proxy finished");
            self.num_running_proxies -= 1;
        } else {
            // Empty batch with seeds remaining: ask for the next one.
            self.dispatch_batch(slot);
            return Ok(());
        }

        if self.merge_heap.len() == self.num_running_proxies {
            self.state = JobState::Merge;
            self.merge().await?;
        }
        Ok(())
    }

    async fn handle_phantom_result(
        &mut self,
        cookie: u64,
        responses: Vec<crate::events::PhantomResponse>,
    ) -> Result<(), ReplError> {
        let batch = self
            .phantom_in_flight
            .remove(&cookie)
            .expect("unknown phantom cookie");

        let mut verdicts: HashMap<BlobId, (bool, bool)> = responses
            .into_iter()
            .map(|r| {
                (
                    r.id,
                    (
                        r.status == keel_types::ReplyStatus::NoData,
                        r.looks_like_phantom,
                    ),
                )
            })
            .collect();

        let machine = self.machine.as_mut().expect("machine present");
        for (id, parts) in batch {
            let (is_phantom, looks_like_phantom) = verdicts
                .remove(&id)
                .expect("phantom reply must cover every queried blob");
            machine.process_phantom_blob(id, parts, is_phantom, looks_like_phantom);
            if is_phantom {
                self.phantoms.push(id);
                self.info.phantoms_detected += 1;
            }
        }

        self.merge().await
    }

    // -----------------------------------------------------------------------
    // Merge loop
    // -----------------------------------------------------------------------

    async fn merge(&mut self) -> Result<(), ReplError> {
        while self.merge_iteration().await? {}
        Ok(())
    }

    /// One pass of the merge machinery. Returns true when it should be run
    /// again immediately, false when the job must wait for an event.
    async fn merge_iteration(&mut self) -> Result<bool, ReplError> {
        // Drive the writer until it either accepts blobs or blocks.
        loop {
            let state = self.writer.state();
            let no_work_for_writer = self
                .recovery_queue
                .front()
                .map_or(true, |blob| blob.is_huge);
            if state == WriterState::Collect {
                assert!(!self.writer_finished);
                break;
            }
            if state == WriterState::Stopped && no_work_for_writer {
                break;
            }

            match state {
                WriterState::Stopped => {
                    assert!(!self.writer_finished);
                    self.writer.begin();
                }
                WriterState::PdiskMessagePending => {
                    let msg = self.writer.get_pending_pdisk_msg();
                    self.send_pdisk_msg(msg).await?;
                }
                WriterState::NotReady => {
                    self.time.set_state(TimeState::PdiskOp);
                    return Ok(false);
                }
                WriterState::CommitPending => {
                    let msg = self.writer.get_pending_commit_msg();
                    self.time.set_state(TimeState::Commit);
                    self.env
                        .commit_tx
                        .send(CommitRequest { msg })
                        .await
                        .map_err(|_| ReplError::ChannelClosed("commit channel"))?;
                    return Ok(false);
                }
                WriterState::WaitingForCommit => return Ok(false),
                WriterState::Error => {
                    return Err(ReplError::WriterFailure(
                        "sst writer entered error state".into(),
                    ));
                }
                WriterState::Collect => unreachable!("handled above"),
            }
        }

        match self.process_queue().await? {
            QueueAction::Continue => {}
            QueueAction::Restart => return Ok(true),
            QueueAction::Exit => return Ok(false),
        }

        debug_assert!(self.merge_heap.len() <= self.num_running_proxies);
        if self.merge_heap.len() != self.num_running_proxies {
            return Ok(false);
        }

        // The merge step proper; phantom batches queued during it are
        // dispatched before we yield, whatever the exit path.
        let flow = self.merge_step().await?;
        self.run_phantom_checks().await?;
        if let Some(resume) = flow {
            return Ok(resume);
        }

        if !self.phantom_in_flight.is_empty() {
            self.time.set_state(TimeState::Phantom);
            return Ok(false);
        }
        assert!(self.phantom_pending.is_empty());

        assert!(self.num_running_proxies == 0 && self.merge_heap.is_empty());
        assert!(self.recovery_queue.is_empty());
        self.time.set_state(TimeState::Other);

        if !self.machine_finished {
            let machine = self.machine.as_mut().expect("machine present");
            machine.finish(&mut self.recovery_queue, &mut self.info);
            self.machine_finished = true;
            debug!(
                trailing = self.recovery_queue.len(),
                "recovery machine finished"
            );
            return Ok(true);
        }

        if !self.writer_finished && self.writer.state() != WriterState::Stopped {
            debug!("finishing sst writer");
            self.writer.finish();
            self.writer_finished = true;
            return Ok(true);
        }

        if self.huge_blobs_in_flight != 0 {
            debug!(
                in_flight = self.huge_blobs_in_flight,
                "waiting for huge blob writes"
            );
            return Ok(false);
        }

        assert_eq!(self.writer.state(), WriterState::Stopped);
        self.start_finish().await?;
        Ok(false)
    }

    /// Consume every proxy whose current key matches, one blob at a time.
    ///
    /// Returns `Some(resume)` when the caller must return `resume` from
    /// the iteration, `None` when the merge ran the heap dry.
    async fn merge_step(&mut self) -> Result<Option<bool>, ReplError> {
        // A pending item survives across yields: its last contributor may
        // have gone EOF, leaving the heap empty with data still to recover.
        while !self.merge_heap.is_empty() || self.current_item.is_some() {
            self.time.set_state(TimeState::Merge);

            if self.current_item.is_none() {
                let Reverse((key, _)) = *self.merge_heap.peek().expect("heap not empty");
                assert!(
                    self.last_processed_key.map_or(true, |last| last < key),
                    "merge keys must be strictly increasing"
                );
                self.last_processed_key = Some(key);
                self.current_item = Some(BlobReplies::new(key));
            }
            let key = self.current_item.as_ref().expect("just set").id;

            // Pull every proxy currently positioned at this key.
            loop {
                let Some(&Reverse((top_key, slot))) = self.merge_heap.peek() else {
                    break;
                };
                if top_key != key {
                    break;
                }
                self.merge_heap.pop();

                let after = {
                    let item = self.current_item.as_mut().expect("collecting");
                    let proxy = self.proxies[slot].as_mut().expect("proxy exists");
                    while proxy.current_blob() == Some(key) {
                        item.add(proxy.take_item().expect("current blob present"));
                    }
                    if proxy.valid() {
                        AfterDrain::Reinsert(proxy.current_blob().expect("valid"))
                    } else if proxy.is_eof() {
                        debug!(vdisk = %proxy.vdisk_id, "proxy finished");
                        AfterDrain::Eof
                    } else {
                        AfterDrain::NeedBatch
                    }
                };

                match after {
                    AfterDrain::Reinsert(next_key) => {
                        debug_assert!(next_key > key);
                        self.merge_heap.push(Reverse((next_key, slot)));
                    }
                    AfterDrain::Eof => self.num_running_proxies -= 1,
                    AfterDrain::NeedBatch => self.dispatch_batch(slot),
                }
            }

            // More data for this key may still be in flight.
            if self.merge_heap.len() != self.num_running_proxies {
                self.time.set_state(TimeState::ProxyWait);
                return Ok(Some(false));
            }

            let replies = self.current_item.take().expect("collected");
            let machine = self.machine.as_mut().expect("machine present");
            let (handled, parts) = machine.recover(replies, &mut self.recovery_queue);
            if !handled {
                debug!(blob = %key, "queueing phantom verification");
                ReplMonGroup::add(&self.env.mon.phantom_like_discovered, 1);
                self.phantom_pending.push_back((key, parts));
            }

            match self.process_queue().await? {
                QueueAction::Continue => {}
                QueueAction::Restart => {
                    self.time.set_state(TimeState::Other);
                    return Ok(Some(true));
                }
                QueueAction::Exit => {
                    self.time.set_state(TimeState::Other);
                    return Ok(Some(false));
                }
            }
        }
        Ok(None)
    }

    /// Route recovered blobs: huge ones to the out-of-band channel
    /// (bounded in flight), the rest into the SST writer.
    async fn process_queue(&mut self) -> Result<QueueAction, ReplError> {
        loop {
            let is_huge = match self.recovery_queue.front() {
                Some(blob) => blob.is_huge,
                None => return Ok(QueueAction::Continue),
            };

            if is_huge {
                if self.huge_blobs_in_flight == self.config.huge_blobs_in_flight_max {
                    return Ok(QueueAction::Exit);
                }
                assert!(self.huge_blobs_in_flight < self.config.huge_blobs_in_flight_max);
                self.huge_blobs_in_flight += 1;

                let blob = self.recovery_queue.pop_front().expect("front exists");
                let bytes = blob.data.len() as u64;
                self.info.huge_blobs_recovered += 1;
                self.info.huge_bytes_recovered += bytes;
                ReplMonGroup::add(&self.env.mon.huge_blobs_recovered, 1);
                ReplMonGroup::add(&self.env.mon.huge_blob_bytes_recovered, bytes);

                self.env.quoter.acquire(bytes).await;
                self.env
                    .huge_tx
                    .send(RecoveredHugeBlob {
                        id: blob.id,
                        data: blob.data,
                    })
                    .await
                    .map_err(|_| ReplError::ChannelClosed("huge blob channel"))?;
                continue;
            }

            match self.writer.state() {
                WriterState::Stopped => return Ok(QueueAction::Restart),
                WriterState::Collect => {}
                other => unreachable!("writer in {other:?} during queue processing"),
            }

            let accepted = self
                .writer
                .add_recovered_blob(self.recovery_queue.front().expect("front exists"));
            if accepted {
                let blob = self.recovery_queue.pop_front().expect("front exists");
                let bytes = blob.data.len() as u64;
                self.info.blobs_recovered += 1;
                self.info.bytes_recovered += bytes;
                ReplMonGroup::add(&self.env.mon.blobs_recovered, 1);
                ReplMonGroup::add(&self.env.mon.blob_bytes_recovered, bytes);
            }

            if self.writer.state() != WriterState::Collect {
                return Ok(QueueAction::Restart);
            }
        }
    }

    /// Forward one writer message to the block device, with quoter
    /// accounting for chunk writes.
    async fn send_pdisk_msg(&mut self, msg: PdiskMsg) -> Result<(), ReplError> {
        if let PdiskMsg::ChunkWrite { chunk_idx, ref data } = msg {
            if self.written_chunks.insert(chunk_idx) {
                self.info.chunks_written += 1;
                ReplMonGroup::add(&self.env.mon.chunks_written, 1);
            }
            let bytes = data.len() as u64;
            self.info.sst_bytes_written += bytes;
            self.env.quoter.acquire(bytes).await;
        }
        self.env
            .pdisk_tx
            .send(PdiskRequest { msg })
            .await
            .map_err(|_| ReplError::ChannelClosed("pdisk channel"))
    }

    /// Dispatch pending phantom verifications, respecting the batch and
    /// in-flight caps and the one-tablet-per-request rule.
    async fn run_phantom_checks(&mut self) -> Result<(), ReplError> {
        while !self.phantom_pending.is_empty()
            && self.phantom_in_flight.len() < MAX_PHANTOM_BATCHES_IN_FLIGHT
        {
            self.last_phantom_cookie += 1;
            let cookie = self.last_phantom_cookie;

            let tablet_id = self.phantom_pending.front().expect("non-empty").0.tablet_id;
            let mut batch = Vec::new();
            while batch.len() < MAX_PHANTOM_BATCH_QUERIES {
                match self.phantom_pending.front() {
                    Some((id, _)) if id.tablet_id == tablet_id => {
                        batch.push(self.phantom_pending.pop_front().expect("non-empty"));
                    }
                    _ => break,
                }
            }

            let queries: Vec<BlobId> = batch.iter().map(|(id, _)| *id).collect();
            debug!(cookie, queries = queries.len(), tablet_id, "phantom check batch");
            self.phantom_in_flight.insert(cookie, batch);
            self.env
                .get_tx
                .send(PhantomGetRequest {
                    cookie,
                    queries,
                    phantom_check: true,
                })
                .await
                .map_err(|_| ReplError::ChannelClosed("phantom get channel"))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finish
    // -----------------------------------------------------------------------

    /// Everything is drained; hand detected phantoms to the owner (if any)
    /// and then report the quantum result.
    async fn start_finish(&mut self) -> Result<(), ReplError> {
        debug!(last_key = ?self.last_key, eof = self.eof, "finished replication job");
        if self.phantoms.is_empty() {
            self.complete().await
        } else {
            debug!(num_phantoms = self.phantoms.len(), "sending phantoms");
            let phantoms = std::mem::take(&mut self.phantoms);
            self.state = JobState::WaitPhantomCommit;
            self.env
                .owner_tx
                .send(OwnerMsg::DetectedPhantomBlob(phantoms))
                .await
                .map_err(|_| ReplError::ChannelClosed("owner channel"))
        }
    }

    async fn complete(&mut self) -> Result<(), ReplError> {
        let drop_donor = self.donor.is_some()
            && self
                .proxies
                .iter()
                .flatten()
                .all(|proxy| proxy.no_transient_errors());

        let mut stat = ProxyStat::default();
        for proxy in self.proxies.iter().flatten() {
            stat.merge(&proxy.stat);
        }
        self.info.proxy_stat = stat;

        if let Some(machine) = self.machine.as_mut() {
            self.info.unreplicated = machine.take_unreplicated();
        }

        self.info.finish(self.last_key, self.eof, drop_donor);
        self.time.finish(&mut self.info);

        info!(
            recovered = self.info.blobs_recovered,
            huge = self.info.huge_blobs_recovered,
            phantoms = self.info.phantoms_detected,
            unreplicated = self.info.unreplicated.len(),
            eof = self.info.eof,
            "replication quantum complete"
        );

        self.env
            .owner_tx
            .send(OwnerMsg::ReplFinished(Box::new(self.info.clone())))
            .await
            .map_err(|_| ReplError::ChannelClosed("owner channel"))?;
        self.state = JobState::Terminated;
        Ok(())
    }
}
