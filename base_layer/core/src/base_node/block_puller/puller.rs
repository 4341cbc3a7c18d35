// Copyright 2023. The Sable Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use futures::future;
use log::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use sable_comms::{clock::Clock, protocol::InvMessage, Command, ConnectivityRequester, MessageFrame, PeerId};
use sable_shutdown::ShutdownSignal;
use tokio::sync::Notify;

use crate::{
    base_node::block_puller::{config::BlockPullerConfig, peer_performance::PeerPerformance},
    blocks::{Block, ChainHeader},
    common::{rolling_avg::ExponentialMovingAverage, FixedHash},
};

const LOG_TARGET: &str = "c::bn::block_puller";

/// The peer id reported in null callbacks, where no peer was ever involved.
pub const UNASSIGNED_PEER: PeerId = PeerId(u64::MAX);

/// Peers scoring below this are skipped during selection while better peers exist.
const MIN_SELECTION_WEIGHT: f64 = 0.05;

/// Invoked exactly once per requested header: the block on success, `None` when no peer could serve it.
pub type BlockDeliveryCallback = Arc<dyn Fn(FixedHash, Option<Block>, PeerId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPriority {
    Normal,
    /// Released work that must be handed out again ahead of new work and without capacity constraints.
    Reassigned,
}

struct DownloadJob {
    id: u64,
    headers: Vec<Arc<ChainHeader>>,
    priority: DownloadPriority,
}

#[derive(Clone)]
struct AssignedDownload {
    header: Arc<ChainHeader>,
    peer_id: PeerId,
    assigned_at_millis: u64,
    job_id: u64,
}

/// State behind the queue lock.
struct QueueState {
    jobs: VecDeque<DownloadJob>,
    reassign: VecDeque<DownloadJob>,
    avg_block_size: ExponentialMovingAverage,
    max_in_flight: usize,
    next_job_id: u64,
}

/// State behind the assigned lock: one assignment per block hash, indexed three ways.
#[derive(Default)]
struct AssignedState {
    by_hash: HashMap<FixedHash, AssignedDownload>,
    by_peer: HashMap<PeerId, HashSet<FixedHash>>,
    by_height: BTreeSet<(u64, FixedHash)>,
}

impl AssignedState {
    fn insert(&mut self, hash: FixedHash, assignment: AssignedDownload) {
        self.by_peer.entry(assignment.peer_id).or_default().insert(hash);
        self.by_height.insert((assignment.header.height(), hash));
        self.by_hash.insert(hash, assignment);
    }

    fn remove(&mut self, hash: &FixedHash) -> Option<AssignedDownload> {
        let assignment = self.by_hash.remove(hash)?;
        if let Some(set) = self.by_peer.get_mut(&assignment.peer_id) {
            set.remove(hash);
            if set.is_empty() {
                self.by_peer.remove(&assignment.peer_id);
            }
        }
        self.by_height.remove(&(assignment.header.height(), *hash));
        Some(assignment)
    }

    fn take_peer(&mut self, peer_id: PeerId) -> Vec<AssignedDownload> {
        let hashes = self.by_peer.remove(&peer_id).unwrap_or_default();
        let mut taken = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(assignment) = self.by_hash.remove(&hash) {
                self.by_height.remove(&(assignment.header.height(), hash));
                taken.push(assignment);
            }
        }
        taken
    }
}

/// State behind the peer lock.
struct PeerState {
    peers: HashMap<PeerId, PeerPerformance>,
    fastest: Option<PeerId>,
    is_ibd: bool,
}

/// The download scheduler. Lock discipline: the peer, queue and assigned locks are leaf locks, never held
/// across an await and never held two at a time; where state from more than one is needed it is snapshotted
/// lock by lock in the order peer, queue, assigned.
pub struct BlockPuller {
    config: BlockPullerConfig,
    clock: Arc<dyn Clock>,
    connectivity: ConnectivityRequester,
    callback: BlockDeliveryCallback,
    queue: Mutex<QueueState>,
    assigned: Mutex<AssignedState>,
    peers: Mutex<PeerState>,
    rng: Mutex<StdRng>,
    assign_signal: Notify,
    consensus_height: AtomicU64,
    shutdown: ShutdownSignal,
}

impl BlockPuller {
    pub fn new(
        config: BlockPullerConfig,
        clock: Arc<dyn Clock>,
        connectivity: ConnectivityRequester,
        callback: BlockDeliveryCallback,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        let queue = QueueState {
            jobs: VecDeque::new(),
            reassign: VecDeque::new(),
            avg_block_size: ExponentialMovingAverage::new(config.block_size_ema_alpha),
            max_in_flight: config.min_in_flight,
            next_job_id: 0,
        };
        Arc::new(Self {
            clock,
            connectivity,
            callback,
            queue: Mutex::new(queue),
            assigned: Mutex::new(AssignedState::default()),
            peers: Mutex::new(PeerState {
                peers: HashMap::new(),
                fastest: None,
                is_ibd: true,
            }),
            rng: Mutex::new(StdRng::from_entropy()),
            assign_signal: Notify::new(),
            consensus_height: AtomicU64::new(0),
            shutdown,
            config,
        })
    }

    /// Pin the selection RNG. Test use only; production keeps the entropy-seeded generator.
    pub fn set_rng_seed(&self, seed: u64) {
        *self.rng.lock().expect("puller rng lock poisoned") = StdRng::seed_from_u64(seed);
    }

    /// Start the assigner and the stall sweep.
    pub fn spawn(self: &Arc<Self>) {
        let assigner = self.clone();
        tokio::spawn(async move { assigner.run_assigner().await });
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run_stall_monitor().await });
    }

    /// Queue a run of consecutive (possibly sparse) headers for download. Every header leads to exactly one
    /// callback invocation.
    pub fn request_download(&self, headers: Vec<Arc<ChainHeader>>, priority: DownloadPriority) {
        if headers.is_empty() {
            return;
        }
        {
            let mut queue = self.queue.lock().expect("puller queue lock poisoned");
            let id = queue.next_job_id;
            queue.next_job_id += 1;
            let job = DownloadJob { id, headers, priority };
            match priority {
                DownloadPriority::Normal => queue.jobs.push_back(job),
                DownloadPriority::Reassigned => queue.reassign.push_back(job),
            }
        }
        self.assign_signal.notify_one();
    }

    /// A peer has (newly) claimed this chain tip. Unknown peers are registered with the default speed.
    pub fn peer_tip_claimed(&self, peer_id: PeerId, tip: Arc<ChainHeader>) {
        let mut peers = self.peers.lock().expect("puller peer lock poisoned");
        let initial_speed = self.config.initial_peer_speed;
        let alpha = self.config.speed_ema_alpha;
        let perf = peers
            .peers
            .entry(peer_id)
            .or_insert_with(|| PeerPerformance::new(initial_speed, alpha));
        perf.claimed_tip = Some(tip);
        self.update_scores_locked(&mut peers, Some(peer_id));
    }

    /// Drop the peer and push its outstanding assignments onto the reassignment queue.
    pub fn peer_disconnected(&self, peer_id: PeerId) {
        let removed = {
            let mut peers = self.peers.lock().expect("puller peer lock poisoned");
            let removed = peers.peers.remove(&peer_id).is_some();
            if removed {
                self.update_scores_locked(&mut peers, None);
            }
            removed
        };
        if removed {
            debug!(target: LOG_TARGET, "{} left the download pool", peer_id);
        }
        self.release_peer_assignments(peer_id);
    }

    pub fn ibd_state_changed(&self, is_ibd: bool) {
        let mut peers = self.peers.lock().expect("puller peer lock poisoned");
        if peers.is_ibd != is_ibd {
            peers.is_ibd = is_ibd;
            // The cap only applies outside IBD, so every effective speed may have changed
            self.update_scores_locked(&mut peers, None);
        }
    }

    pub fn set_consensus_height(&self, height: u64) {
        self.consensus_height.store(height, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.assigned.lock().expect("puller assigned lock poisoned").by_hash.len()
    }

    /// Deliver a block pushed by a peer. Unexpected blocks and deliveries from a peer other than the
    /// assignee are dropped silently.
    pub fn push_block(&self, hash: FixedHash, block: Block, from_peer: PeerId) {
        let assignment = {
            let mut assigned = self.assigned.lock().expect("puller assigned lock poisoned");
            let assignee = assigned.by_hash.get(&hash).map(|a| a.peer_id);
            match assignee {
                None => {
                    trace!(target: LOG_TARGET, "Dropped unexpected block {} from {}", hash, from_peer);
                    return;
                },
                Some(assignee) if assignee != from_peer => {
                    debug!(
                        target: LOG_TARGET,
                        "Dropped block {} delivered by {} but assigned to {}", hash, from_peer, assignee
                    );
                    return;
                },
                Some(_) => assigned.remove(&hash).expect("present, checked above"),
            }
        };

        let bytes = block.encoded_size() as f64;
        let elapsed_millis = self
            .clock
            .now_millis()
            .saturating_sub(assignment.assigned_at_millis)
            .max(1);
        let bytes_per_sec = bytes / (elapsed_millis as f64 / 1000.0);

        let speed_sum = {
            let mut peers = self.peers.lock().expect("puller peer lock poisoned");
            if let Some(perf) = peers.peers.get_mut(&from_peer) {
                perf.add_speed_sample(bytes_per_sec);
            }
            self.update_scores_locked(&mut peers, Some(from_peer));
            self.effective_speed_sum_locked(&peers)
        };
        self.recompute_capacity(speed_sum, Some(bytes));

        trace!(
            target: LOG_TARGET,
            "{} delivered {} ({} bytes, {:.0} B/s, job {})",
            from_peer,
            hash,
            bytes,
            bytes_per_sec,
            assignment.job_id
        );
        if !self.shutdown.is_triggered() {
            (self.callback)(hash, Some(block), from_peer);
        }
        self.assign_signal.notify_one();
    }

    async fn run_assigner(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut retry = tokio::time::interval(std::time::Duration::from_secs(1));
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = self.assign_signal.notified() => {},
                _ = retry.tick() => {},
            }
            self.process_queues().await;
        }
        debug!(target: LOG_TARGET, "Assigner exited");
    }

    async fn run_stall_monitor(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut sweep = tokio::time::interval(self.config.stall_check_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = sweep.tick() => {},
            }
            self.check_stalls();
        }
        debug!(target: LOG_TARGET, "Stall monitor exited");
    }

    /// Reassignment jobs run unconditionally; normal jobs only while a healthy fraction of the in-flight
    /// budget is free (prevents assignment thrashing near capacity).
    async fn process_queues(&self) {
        loop {
            let job = {
                let mut queue = self.queue.lock().expect("puller queue lock poisoned");
                queue.reassign.pop_front()
            };
            match job {
                Some(job) => self.assign_job(job).await,
                None => break,
            }
        }
        loop {
            if !self.normal_capacity_available() {
                break;
            }
            let job = {
                let mut queue = self.queue.lock().expect("puller queue lock poisoned");
                queue.jobs.pop_front()
            };
            match job {
                Some(job) => self.assign_job(job).await,
                None => break,
            }
        }
    }

    fn normal_capacity_available(&self) -> bool {
        let assigned = self.in_flight();
        let queue = self.queue.lock().expect("puller queue lock poisoned");
        let free = queue.max_in_flight.saturating_sub(assigned);
        free as f64 >= queue.max_in_flight as f64 * self.config.queue_slot_fraction
    }

    async fn assign_job(&self, job: DownloadJob) {
        // Snapshot the peer pool once for the whole job
        let candidates: Vec<(PeerId, f64, Arc<ChainHeader>)> = {
            let peers = self.peers.lock().expect("puller peer lock poisoned");
            peers
                .peers
                .iter()
                .filter_map(|(id, perf)| perf.claimed_tip.clone().map(|tip| (*id, perf.quality_score, tip)))
                .collect()
        };

        let now = self.clock.now_millis();
        let mut per_peer: HashMap<PeerId, Vec<Arc<ChainHeader>>> = HashMap::new();
        let mut rest_failed = false;
        for header in job.headers {
            if rest_failed {
                self.fail_header(&header);
                continue;
            }
            // A peer is eligible when the header lies on (or is) its claimed tip's chain
            let eligible = candidates
                .iter()
                .filter(|(_, _, tip)| tip.has_ancestor_or_equal(&header))
                .map(|(id, score, _)| (*id, *score))
                .collect::<Vec<_>>();
            let Some(peer_id) = self.weighted_pick(&eligible) else {
                // Nothing can serve this header now; this and every later header in the job fail
                debug!(
                    target: LOG_TARGET,
                    "No eligible peer for {} at height {}; failing the rest of job {}",
                    header.hash(),
                    header.height(),
                    job.id
                );
                self.fail_header(&header);
                rest_failed = true;
                continue;
            };

            let hash = *header.hash();
            {
                let mut assigned = self.assigned.lock().expect("puller assigned lock poisoned");
                // A hash never appears in two assignments; an in-flight duplicate keeps its assignment
                if assigned.by_hash.contains_key(&hash) {
                    continue;
                }
                assigned.insert(hash, AssignedDownload {
                    header: header.clone(),
                    peer_id,
                    assigned_at_millis: now,
                    job_id: job.id,
                });
            }
            per_peer.entry(peer_id).or_default().push(header);
        }

        // Batched per-peer requests go out in parallel
        let requests = per_peer
            .into_iter()
            .map(|(peer_id, headers)| {
                let connectivity = self.connectivity.clone();
                async move {
                    let hashes = headers.iter().map(|h| **h.hash()).collect::<Vec<_>>();
                    let payload = InvMessage::blocks(hashes).to_payload();
                    let result = connectivity
                        .send_message(peer_id, MessageFrame::new(Command::GetData, payload))
                        .await;
                    (peer_id, result)
                }
            })
            .collect::<Vec<_>>();
        for (peer_id, result) in future::join_all(requests).await {
            if let Err(err) = result {
                warn!(
                    target: LOG_TARGET,
                    "Batch request to {} failed ({}); treating the peer as disconnected", peer_id, err
                );
                self.peer_disconnected(peer_id);
                let _ = self
                    .connectivity
                    .disconnect_peer(peer_id, "block request failed".to_string())
                    .await;
            }
        }
    }

    fn fail_header(&self, header: &Arc<ChainHeader>) {
        if !self.shutdown.is_triggered() {
            (self.callback)(*header.hash(), None, UNASSIGNED_PEER);
        }
    }

    /// Quality-weighted random selection. Peers far below the best are skipped while better peers exist.
    fn weighted_pick(&self, eligible: &[(PeerId, f64)]) -> Option<PeerId> {
        if eligible.is_empty() {
            return None;
        }
        let strong = eligible
            .iter()
            .filter(|(_, score)| *score >= MIN_SELECTION_WEIGHT)
            .copied()
            .collect::<Vec<_>>();
        let pool = if strong.is_empty() { eligible } else { &strong[..] };
        let total: f64 = pool.iter().map(|(_, score)| score.max(0.001)).sum();
        let mut roll = {
            let mut rng = self.rng.lock().expect("puller rng lock poisoned");
            rng.gen::<f64>() * total
        };
        for (peer_id, score) in pool {
            roll -= score.max(0.001);
            if roll <= 0.0 {
                return Some(*peer_id);
            }
        }
        pool.last().map(|(peer_id, _)| *peer_id)
    }

    /// Stall sweep: any important assignment older than the delivery deadline penalizes its peer and
    /// releases everything that peer holds onto the reassignment queue.
    fn check_stalls(&self) {
        let now = self.clock.now_millis();
        let deadline_millis = self.config.max_block_delivery_time.as_millis() as u64;
        let importance_ceiling = self
            .consensus_height
            .load(Ordering::SeqCst)
            .saturating_add(self.config.important_height_margin);

        let stalled_peers = {
            let assigned = self.assigned.lock().expect("puller assigned lock poisoned");
            assigned
                .by_hash
                .values()
                .filter(|a| {
                    a.header.height() <= importance_ceiling &&
                        now.saturating_sub(a.assigned_at_millis) > deadline_millis
                })
                .map(|a| a.peer_id)
                .collect::<HashSet<_>>()
        };
        if stalled_peers.is_empty() {
            return;
        }

        for peer_id in stalled_peers {
            warn!(
                target: LOG_TARGET,
                "{} stalled on an important download; penalizing and releasing its assignments", peer_id
            );
            {
                let mut peers = self.peers.lock().expect("puller peer lock poisoned");
                if let Some(perf) = peers.peers.get_mut(&peer_id) {
                    perf.reset_speed(self.config.stall_penalty_speed);
                }
                self.update_scores_locked(&mut peers, Some(peer_id));
            }
            self.release_peer_assignments(peer_id);
        }
    }

    /// Move every assignment of `peer_id` onto the reassignment queue (in height order).
    fn release_peer_assignments(&self, peer_id: PeerId) {
        let mut released = {
            let mut assigned = self.assigned.lock().expect("puller assigned lock poisoned");
            assigned.take_peer(peer_id)
        };
        if released.is_empty() {
            return;
        }
        released.sort_by_key(|a| a.header.height());
        let headers = released.into_iter().map(|a| a.header).collect::<Vec<_>>();
        debug!(
            target: LOG_TARGET,
            "Released {} assignment(s) from {} for reassignment",
            headers.len(),
            peer_id
        );
        self.request_download(headers, DownloadPriority::Reassigned);
    }

    /// Recompute quality scores. A change of the fastest peer rescales every score; otherwise only
    /// `updated` is recomputed. Call with the peer lock held.
    fn update_scores_locked(&self, state: &mut PeerState, updated: Option<PeerId>) {
        let cap = self.config.max_peer_speed_non_ibd;
        let is_ibd = state.is_ibd;
        let fastest = state
            .peers
            .iter()
            .max_by(|a, b| {
                a.1.effective_speed(is_ibd, cap)
                    .total_cmp(&b.1.effective_speed(is_ibd, cap))
            })
            .map(|(id, perf)| (*id, perf.effective_speed(is_ibd, cap)));

        let Some((fastest_id, fastest_speed)) = fastest else {
            state.fastest = None;
            return;
        };
        let fastest_speed = fastest_speed.max(f64::MIN_POSITIVE);
        let fastest_changed = state.fastest != Some(fastest_id);
        state.fastest = Some(fastest_id);

        let recompute = |perf: &mut PeerPerformance| {
            perf.quality_score = (perf.effective_speed(is_ibd, cap) / fastest_speed).clamp(0.0, 1.0);
        };
        if fastest_changed || updated.is_none() {
            for perf in state.peers.values_mut() {
                recompute(perf);
            }
        } else if let Some(peer_id) = updated {
            if let Some(perf) = state.peers.get_mut(&peer_id) {
                recompute(perf);
            }
        }
    }

    fn effective_speed_sum_locked(&self, state: &PeerState) -> f64 {
        let cap = self.config.max_peer_speed_non_ibd;
        state
            .peers
            .values()
            .map(|perf| perf.effective_speed(state.is_ibd, cap))
            .sum()
    }

    /// max_in_flight = (sum of peer speeds × headroom) / recent average block size, clamped below.
    fn recompute_capacity(&self, speed_sum: f64, new_block_size_sample: Option<f64>) {
        let mut queue = self.queue.lock().expect("puller queue lock poisoned");
        if let Some(sample) = new_block_size_sample {
            queue.avg_block_size.add_sample(sample);
        }
        let avg_size = queue
            .avg_block_size
            .value_or(self.config.initial_avg_block_size)
            .max(1.0);
        let target = (speed_sum * self.config.headroom_factor / avg_size) as usize;
        queue.max_in_flight = target.max(self.config.min_in_flight);
    }
}
