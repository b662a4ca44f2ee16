//! Consensus engine and executor for one Rabia instance.
//!
//! This file contains the per-slot agreement state machine (the executor
//! task), the ordered commit applier that drives the state machine, and the
//! engine's metrics. The ingress side (the message handler task) lives in
//! `handler.rs`; both operate on the same shared ledger.
//!
//! The executor follows the Rabia pseudo-code: phase 0 collects proposals
//! and takes a first binary vote, and every later phase exchanges state
//! bits and votes again, falling back to the deterministic common coin
//! until some threshold commits. The handler wakes the executor through the
//! per-slot mailbox exactly once per (phase, round), which freezes the
//! majority values the executor then reads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task;
use tracing::{debug, error, info, warn};

use super::coin::CommonCoin;
use super::queue::PendingQueue;
use super::slot::{Ledger, NoticeKind, SlotNotice};
use super::types::{
    Batch, BatchId, Bit, ClientReply, Config, Message, Seq, StateMachine, Transport,
};

/// The core consensus engine: owns the ledger, the pending queue, and the
/// transport, and lends itself to the handler/executor/applier tasks.
pub struct Engine {
    pub(crate) cfg: Config,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) pending: Arc<PendingQueue>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) commit_notify: Notify,
    pub(crate) metrics: EngineMetrics,
}

/// Atomically updated counters snapshotted for logging.
#[derive(Default)]
pub(crate) struct EngineMetrics {
    pub(crate) normal_slots: AtomicU64,
    pub(crate) unmatched_slots: AtomicU64,
    pub(crate) null_slots: AtomicU64,
    pub(crate) older_term_msgs: AtomicU64,
    pub(crate) too_new_msgs: AtomicU64,
    pub(crate) total_rounds: AtomicU64,
    pub(crate) decided_client_batches: AtomicU64,
    pub(crate) max_consecutive_nulls: AtomicU64,
}

/// Point-in-time view of [`EngineMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineMetricsSnapshot {
    /// Decided slots whose value was this server's own proposal.
    pub normal_slots: u64,
    /// Decided slots whose value was another server's proposal.
    pub unmatched_slots: u64,
    pub null_slots: u64,
    pub older_term_msgs: u64,
    pub too_new_msgs: u64,
    pub total_rounds: u64,
    pub decided_client_batches: u64,
    pub max_consecutive_nulls: u64,
}

impl EngineMetricsSnapshot {
    pub fn decided_slots(&self) -> u64 {
        self.normal_slots + self.unmatched_slots + self.null_slots
    }
}

/// Executor-local state that survives across slots.
struct Cursor {
    next_seq: Seq,
    coin: CommonCoin,
    /// Identities already committed by other slots; skipped when they
    /// resurface from the pending queue.
    discard: HashSet<BatchId>,
    consecutive_nulls: u64,
}

/// What a mailbox wait produced.
enum Wait {
    Ready,
    Decided(Batch),
    Shutdown,
}

/// How a completed round left the slot.
enum Step {
    Commit(Batch),
    Continue,
    Shutdown,
}

/// Where `find_return_value` gets the committed object from.
enum FindValue {
    Local(Batch),
    Request,
    Null,
}

impl Engine {
    pub fn new(
        cfg: Config,
        ledger: Arc<Ledger>,
        pending: Arc<PendingQueue>,
        transport: Arc<dyn Transport>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            ledger,
            pending,
            transport,
            shutdown,
            commit_notify: Notify::new(),
            metrics: EngineMetrics::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            normal_slots: self.metrics.normal_slots.load(Ordering::Relaxed),
            unmatched_slots: self.metrics.unmatched_slots.load(Ordering::Relaxed),
            null_slots: self.metrics.null_slots.load(Ordering::Relaxed),
            older_term_msgs: self.metrics.older_term_msgs.load(Ordering::Relaxed),
            too_new_msgs: self.metrics.too_new_msgs.load(Ordering::Relaxed),
            total_rounds: self.metrics.total_rounds.load(Ordering::Relaxed),
            decided_client_batches: self.metrics.decided_client_batches.load(Ordering::Relaxed),
            max_consecutive_nulls: self.metrics.max_consecutive_nulls.load(Ordering::Relaxed),
        }
    }

    /// The executor task: drives one slot at a time through the agreement
    /// state machine, consuming notices from the slot mailbox and emitting
    /// broadcasts. `replies` carries inbound `ProposalReply` messages.
    pub async fn run_executor(self: Arc<Self>, mut replies: mpsc::Receiver<Message>) {
        let mut shutdown = self.shutdown.clone();
        if !self.cfg.consensus_start_after.is_zero() {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.cfg.consensus_start_after) => {}
            }
        }

        let mut cur = Cursor {
            next_seq: 0,
            coin: CommonCoin::new(),
            discard: HashSet::new(),
            consecutive_nulls: 0,
        };

        'main: loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(seq) = self.acquire_next_slot(&mut cur) else {
                task::yield_now().await;
                continue;
            };
            let mut mailbox = self
                .ledger
                .take_mailbox(seq)
                .unwrap_or_else(|| panic!("slot mailbox for seq {seq} already taken"));

            // Phase 0, round 1: collect proposals.
            let proposal = self
                .ledger
                .with_slot(seq, |st| st.my_proposal.clone())
                .expect("slot acquired without a proposal");
            self.broadcast(Message::Proposal {
                seq,
                batch: proposal,
            })
            .await;
            match self.wait(seq, &mut mailbox, &mut shutdown).await {
                Wait::Shutdown => break 'main,
                Wait::Decided(dec) => {
                    self.epilogue(seq, dec, &mut cur);
                    continue 'main;
                }
                Wait::Ready => {}
            }
            if let Some(dec) = self.phase0_round1_after(seq) {
                self.broadcast(Message::Decision {
                    seq,
                    batch: dec.clone(),
                })
                .await;
                self.epilogue(seq, dec, &mut cur);
                continue 'main;
            }

            // Phase 0, round 2: first binary vote.
            let bit = self.ledger.with_slot(seq, |st| st.my_bc(0, 2));
            self.broadcast(Message::Vote { seq, phase: 0, bit }).await;
            match self.wait(seq, &mut mailbox, &mut shutdown).await {
                Wait::Shutdown => break 'main,
                Wait::Decided(dec) => {
                    self.epilogue(seq, dec, &mut cur);
                    continue 'main;
                }
                Wait::Ready => {}
            }
            match self
                .phase0_round2_after(seq, &mut replies, &mut shutdown)
                .await
            {
                Step::Shutdown => break 'main,
                Step::Commit(dec) => {
                    self.broadcast(Message::Decision {
                        seq,
                        batch: dec.clone(),
                    })
                    .await;
                    self.epilogue(seq, dec, &mut cur);
                    continue 'main;
                }
                Step::Continue => {}
            }

            // Phases >= 1: state exchange, then a coin-assisted vote.
            loop {
                let phase = self.ledger.with_slot(seq, |st| st.phase);
                let bit = self.ledger.with_slot(seq, |st| st.my_bc(phase, 1));
                self.broadcast(Message::State { seq, phase, bit }).await;
                match self.wait(seq, &mut mailbox, &mut shutdown).await {
                    Wait::Shutdown => break 'main,
                    Wait::Decided(dec) => {
                        self.epilogue(seq, dec, &mut cur);
                        continue 'main;
                    }
                    Wait::Ready => {}
                }
                match self
                    .phase_n_round1_after(seq, phase, &mut replies, &mut shutdown)
                    .await
                {
                    Step::Shutdown => break 'main,
                    Step::Commit(dec) => {
                        self.broadcast(Message::Decision {
                            seq,
                            batch: dec.clone(),
                        })
                        .await;
                        self.epilogue(seq, dec, &mut cur);
                        continue 'main;
                    }
                    Step::Continue => {}
                }

                let bit = self.ledger.with_slot(seq, |st| st.my_bc(phase, 2));
                self.broadcast(Message::Vote { seq, phase, bit }).await;
                match self.wait(seq, &mut mailbox, &mut shutdown).await {
                    Wait::Shutdown => break 'main,
                    Wait::Decided(dec) => {
                        self.epilogue(seq, dec, &mut cur);
                        continue 'main;
                    }
                    Wait::Ready => {}
                }
                match self
                    .phase_n_round2_after(seq, phase, &mut cur.coin, &mut replies, &mut shutdown)
                    .await
                {
                    Step::Shutdown => break 'main,
                    Step::Commit(dec) => {
                        self.broadcast(Message::Decision {
                            seq,
                            batch: dec.clone(),
                        })
                        .await;
                        self.epilogue(seq, dec, &mut cur);
                        continue 'main;
                    }
                    Step::Continue => {}
                }
            }
        }

        info!(node = self.cfg.node_id, "consensus executor stopped");
    }

    /// Pop the next pending batch and install it as this server's proposal
    /// for the next slot. Returns `None` when the queue is empty or the
    /// popped identity was already committed elsewhere.
    fn acquire_next_slot(&self, cur: &mut Cursor) -> Option<Seq> {
        let batch = self.pending.pop()?;
        if cur.discard.remove(&batch.id) {
            return None;
        }
        let seq = cur.next_seq;
        cur.next_seq += 1;
        self.ledger.update_term_if_necessary(seq, true);
        let mut proposal = batch;
        proposal.server_seq = seq;
        self.ledger.with_slot(seq, |st| {
            st.my_proposal = Some(proposal);
            st.round = 1;
        });
        cur.coin.reseed();
        Some(seq)
    }

    /// Block on the slot mailbox until the handler signals enough messages
    /// for the current (phase, round), a peer's decision arrives, or
    /// shutdown. Ready notices that race a received decision are skipped.
    async fn wait(
        &self,
        seq: Seq,
        mailbox: &mut mpsc::Receiver<SlotNotice>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Wait {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Wait::Shutdown,
                notice = mailbox.recv() => {
                    let Some(notice) = notice else {
                        panic!("slot mailbox for seq {seq} was replaced mid-decision");
                    };
                    match notice {
                        SlotNotice::Ready { kind, phase } => {
                            let skip = self.ledger.with_slot(seq, |st| {
                                if st.has_recv_dec {
                                    return true;
                                }
                                assert_eq!(
                                    phase, st.phase,
                                    "notice phase diverged from slot phase at seq {seq}"
                                );
                                let expected = match (st.phase, st.round) {
                                    (0, 1) => NoticeKind::Proposal,
                                    (_, 1) => NoticeKind::State,
                                    (_, 2) => NoticeKind::Vote,
                                    (p, r) => {
                                        panic!("slot {seq} at impossible position ({p}, {r})")
                                    }
                                };
                                assert_eq!(
                                    kind, expected,
                                    "notice kind diverged from slot position at seq {seq}"
                                );
                                false
                            });
                            if skip {
                                continue;
                            }
                            return Wait::Ready;
                        }
                        SlotNotice::Decision(batch) => {
                            self.ledger.with_slot(seq, |st| {
                                assert!(!st.is_done, "decision notice after seq {seq} decided");
                            });
                            return Wait::Decided(batch);
                        }
                    }
                }
            }
        }
    }

    /// Phase 0, round 1 resolution: a majority-plus-f proposal tally commits
    /// outright; a plain majority votes 1; anything less votes `?`.
    fn phase0_round1_after(&self, seq: Seq) -> Option<Batch> {
        let majority = self.cfg.majority() as u32;
        let majority_plus_f = self.cfg.majority_plus_f() as u32;
        self.ledger.with_slot(seq, |st| {
            let (maj, tally) = st.recv_proposals_maj();
            let decided = if tally >= majority_plus_f {
                let mut dec = maj;
                dec.server_seq = seq;
                Some(dec)
            } else if tally >= majority {
                st.set_my_bc(0, 2, Bit::One);
                None
            } else {
                st.set_my_bc(0, 2, Bit::Maybe);
                None
            };
            st.round += 1;
            decided
        })
    }

    /// Phase 0, round 2 resolution: f+1 agreeing votes commit; any vote
    /// majority seeds the next state bit; silence seeds 0.
    async fn phase0_round2_after(
        &self,
        seq: Seq,
        replies: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Step {
        let faulty_plus_one = self.cfg.faulty_plus_one() as u32;
        let commit = self.ledger.with_slot(seq, |st| {
            let (v, tally) = st.recv_bc_maj(0, 2);
            if tally >= faulty_plus_one {
                st.round += 1;
                true
            } else {
                if tally >= 1 {
                    st.set_my_bc(1, 1, v);
                } else {
                    st.set_my_bc(1, 1, Bit::Zero);
                }
                st.incr_phase_decr_round();
                false
            }
        });
        if !commit {
            return Step::Continue;
        }
        match self.find_return_value(seq, 0, 2, replies, shutdown).await {
            Some(dec) => Step::Commit(dec),
            None => Step::Shutdown,
        }
    }

    /// Phase >= 1, round 1 resolution over the exchanged state bits.
    async fn phase_n_round1_after(
        &self,
        seq: Seq,
        phase: u32,
        replies: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Step {
        let majority = self.cfg.majority() as u32;
        let majority_plus_f = self.cfg.majority_plus_f() as u32;
        let commit = self.ledger.with_slot(seq, |st| {
            let (v, tally) = st.recv_bc_maj(phase, 1);
            let commit = tally >= majority_plus_f;
            if !commit {
                if tally >= majority {
                    st.set_my_bc(phase, 2, v);
                } else {
                    st.set_my_bc(phase, 2, Bit::Maybe);
                }
            }
            st.round += 1;
            commit
        });
        if !commit {
            return Step::Continue;
        }
        match self
            .find_return_value(seq, phase, 1, replies, shutdown)
            .await
        {
            Some(dec) => Step::Commit(dec),
            None => Step::Shutdown,
        }
    }

    /// Phase >= 1, round 2 resolution. The coin is flipped exactly once per
    /// entry so replicas stay in lockstep on the shared bit stream; it only
    /// seeds the next state bit when the votes were silent.
    async fn phase_n_round2_after(
        &self,
        seq: Seq,
        phase: u32,
        coin: &mut CommonCoin,
        replies: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Step {
        let coin_bit = coin.flip();
        let faulty_plus_one = self.cfg.faulty_plus_one() as u32;
        let commit = self.ledger.with_slot(seq, |st| {
            let (v, tally) = st.recv_bc_maj(phase, 2);
            if tally >= faulty_plus_one {
                st.round += 1;
                return true;
            }
            if tally >= 1 {
                st.set_my_bc(phase + 1, 1, v);
            } else {
                st.set_my_bc(phase + 1, 1, coin_bit);
            }
            st.incr_phase_decr_round();
            false
        });
        if !commit {
            return Step::Continue;
        }
        match self
            .find_return_value(seq, phase, 2, replies, shutdown)
            .await
        {
            Some(dec) => Step::Commit(dec),
            None => Step::Shutdown,
        }
    }

    /// Resolve the value to commit after a binary majority: 1 means the
    /// proposal majority (fetched from peers when this server's own tally
    /// is short of a majority), 0 means the null batch.
    async fn find_return_value(
        &self,
        seq: Seq,
        phase: u32,
        round: u32,
        replies: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Batch> {
        let majority = self.cfg.majority() as u32;
        let source = self.ledger.with_slot(seq, |st| {
            let (v, _) = st.recv_bc_maj(phase, round);
            if v == Bit::Zero {
                return FindValue::Null;
            }
            if st.recv_proposals.is_empty() {
                return FindValue::Request;
            }
            let (maj, tally) = st.recv_proposals_maj();
            if tally >= majority {
                FindValue::Local(maj)
            } else {
                FindValue::Request
            }
        });
        match source {
            FindValue::Null => Some(Batch::null(seq)),
            FindValue::Local(mut batch) => {
                batch.server_seq = seq;
                Some(batch)
            }
            FindValue::Request => self.request_proposal_and_wait(seq, replies, shutdown).await,
        }
    }

    /// Broadcast a proposal request and block until a usable reply. Replies
    /// carrying an older seq are leftovers from earlier slots and skipped.
    async fn request_proposal_and_wait(
        &self,
        seq: Seq,
        replies: &mut mpsc::Receiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Batch> {
        self.broadcast(Message::ProposalRequest {
            seq,
            from: self.cfg.node_id,
        })
        .await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return None,
                msg = replies.recv() => {
                    let Some(msg) = msg else { return None };
                    match msg {
                        Message::ProposalReply { seq: reply_seq, batch, .. } => {
                            if reply_seq < seq {
                                continue;
                            }
                            let mut batch = batch;
                            batch.server_seq = seq;
                            return Some(batch);
                        }
                        other => panic!("executor reply channel received {other:?}"),
                    }
                }
            }
        }
    }

    /// Record a decision into the slot and settle this server's proposal:
    /// null and unmatched decisions push it back for a later slot, and an
    /// unmatched decision's identity goes to the discard set so it is not
    /// re-proposed by this server.
    fn epilogue(&self, seq: Seq, dec: Batch, cur: &mut Cursor) {
        let (my_proposal, phase, round) = self.ledger.with_slot(seq, |st| {
            st.decision = Some(dec.clone());
            st.is_done = true;
            (st.my_proposal.clone(), st.phase, st.round)
        });

        if dec.is_null {
            self.metrics.null_slots.fetch_add(1, Ordering::Relaxed);
            cur.consecutive_nulls += 1;
            self.metrics
                .max_consecutive_nulls
                .fetch_max(cur.consecutive_nulls, Ordering::Relaxed);
            if let Some(p) = my_proposal {
                self.pending.push(p);
            }
        } else {
            cur.consecutive_nulls = 0;
            match my_proposal {
                Some(p) if !p.same_identity(&dec) => {
                    self.metrics.unmatched_slots.fetch_add(1, Ordering::Relaxed);
                    cur.discard.insert(dec.id);
                    self.pending.push(p);
                }
                _ => {
                    self.metrics.normal_slots.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.metrics
                .decided_client_batches
                .fetch_add(dec.client_ids.len() as u64, Ordering::Relaxed);
        }

        // Normalized round count: a slot always costs at least 3 rounds, and
        // even positions round up to the next odd count.
        let mut rounds = phase * 2 + round;
        if rounds <= 3 {
            rounds = 3;
        } else if rounds % 2 == 0 {
            rounds += 1;
        }
        self.metrics
            .total_rounds
            .fetch_add(u64::from(rounds), Ordering::Relaxed);

        debug!(
            seq,
            is_null = dec.is_null,
            proposer = dec.id.proposer_id,
            proposer_seq = dec.id.proposer_seq,
            "slot decided"
        );
        self.commit_notify.notify_waiters();
    }

    /// The commit applier task: walks the ledger in strict sequence order,
    /// applies non-null decisions to the state machine, and emits one reply
    /// per client entry. Reply routing (and dropping replies for clients
    /// connected elsewhere) is the proxy's job.
    pub async fn run_applier(
        self: Arc<Self>,
        store: Arc<dyn StateMachine>,
        replies: mpsc::Sender<ClientReply>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let mut seq: Seq = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(dec) = self.ledger.committed_decision(seq) else {
                // notify_waiters does not latch, so pair it with a tick.
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = self.commit_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
                continue;
            };
            if !dec.is_null {
                let applied = match store.apply_batch(&dec.commands).await {
                    Ok(r) => r,
                    Err(err) => {
                        error!(seq, error = ?err, "state machine apply failed; applier stopping");
                        return;
                    }
                };
                let per_client = self.cfg.client_batch_size.max(1);
                for (idx, chunk) in applied.chunks(per_client).enumerate() {
                    let (Some(client_id), Some(client_seq)) =
                        (dec.client_ids.get(idx), dec.client_seqs.get(idx))
                    else {
                        warn!(seq, "decision carries more commands than client entries");
                        break;
                    };
                    let reply = ClientReply {
                        server_seq: seq,
                        client_id: *client_id,
                        client_seq: *client_seq,
                        replies: chunk.to_vec(),
                    };
                    if replies.send(reply).await.is_err() {
                        return;
                    }
                }
            }
            seq += 1;
        }
        info!(node = self.cfg.node_id, "commit applier stopped");
    }

    pub(crate) async fn broadcast(&self, msg: Message) {
        if let Err(err) = self.transport.broadcast(msg).await {
            warn!(error = ?err, "broadcast failed");
        }
    }
}
