//! The ledger ring and its per-slot state.
//!
//! A `Ledger` is a fixed-size ring of `Slot`s indexed by `seq % L`; the term
//! counter of a slot records how many times the ring index has been reused,
//! so slot `i` at term `t` represents log entry `t * L + i`. Each slot holds
//! everything this server currently knows about one replicated log entry:
//! its own proposal and binary-consensus bits, peers' proposals and bits
//! (tallied, not stored), whether a decision message arrived, whether a
//! decision was recorded, and the current protocol phase/round.
//!
//! Majority conventions:
//!
//! - proposal majority: the batch tallied most often; on equal counts the
//!   batch whose identity wins the less-than relation is preferred.
//! - binary majority: whichever of 0/1 was received more often; on a tie the
//!   protocol requires 1.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::types::{Batch, Bit, Config, Seq};

/// Counts the occurrences of one proposal, keyed by batch identity.
#[derive(Clone, Debug)]
pub struct Tally {
    pub batch: Batch,
    pub count: u32,
}

/// What a mailbox notice announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeKind {
    Proposal,
    State,
    Vote,
}

/// A notification from the message handler to the executor: either "enough
/// messages arrived for this (phase, round)" or a decision to adopt.
#[derive(Debug)]
pub enum SlotNotice {
    Ready { kind: NoticeKind, phase: u32 },
    Decision(Batch),
}

/// Outcome of checking an incoming message's term against a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermCheck {
    /// The message's term matches the slot (possibly after a reset).
    Current,
    /// The message is older than the slot's current term.
    Stale,
    /// The message is more than one term ahead; this replica is severely
    /// behind.
    TooNew,
}

impl TermCheck {
    pub fn is_current(self) -> bool {
        matches!(self, TermCheck::Current)
    }
}

/// Mutable per-slot state, protected by the slot lock.
///
/// Every read or write of `term`, `is_done`, `decision`, `has_recv_dec` or
/// `my_proposal` happens under this lock; term resets replace the mailbox
/// while holding it. Critical sections are short and never cross an await.
pub(crate) struct SlotState {
    pub(crate) term: u32,
    pub(crate) is_done: bool,
    pub(crate) has_recv_dec: bool,
    pub(crate) decision: Option<Batch>,
    pub(crate) phase: u32,
    pub(crate) round: u32,
    pub(crate) my_proposal: Option<Batch>,
    pub(crate) recv_proposals: Vec<Tally>,
    /// my_bc[p][0] is this server's State bit for phase p round 1;
    /// my_bc[p][1] is its Vote bit for phase p round 2.
    my_bc: Vec<[Bit; 2]>,
    /// recv_bc[p][r-1][v] counts value v received at phase p round r.
    recv_bc: Vec<[[u32; 3]; 2]>,
    /// recv_bc_total[p][r-1] sums recv_bc over values; the (0, 1) entry also
    /// counts tallied proposals.
    recv_bc_total: Vec<[u32; 2]>,
    n_minus_f: u32,
    block_len: usize,
    notice_tx: mpsc::Sender<SlotNotice>,
}

impl SlotState {
    fn fresh(
        block_len: usize,
        n_minus_f: u32,
        mailbox_cap: usize,
    ) -> (Self, mpsc::Receiver<SlotNotice>) {
        let (tx, rx) = mpsc::channel(mailbox_cap);
        let state = Self {
            term: 0,
            is_done: false,
            has_recv_dec: false,
            decision: None,
            phase: 0,
            round: 0,
            my_proposal: None,
            recv_proposals: Vec::new(),
            my_bc: vec![[Bit::Zero; 2]; block_len],
            recv_bc: vec![[[0; 3]; 2]; block_len],
            recv_bc_total: vec![[0; 2]; block_len],
            n_minus_f,
            block_len,
            notice_tx: tx,
        };
        (state, rx)
    }

    /// Clear every field except the term, and install a fresh mailbox.
    /// Returns the new receiver; the caller stores it on the slot and bumps
    /// the term, all under the slot lock.
    fn reset(&mut self, mailbox_cap: usize) -> mpsc::Receiver<SlotNotice> {
        let (tx, rx) = mpsc::channel(mailbox_cap);
        self.is_done = false;
        self.has_recv_dec = false;
        self.decision = None;
        self.phase = 0;
        self.round = 0;
        self.my_proposal = None;
        self.recv_proposals.clear();
        self.my_bc = vec![[Bit::Zero; 2]; self.block_len];
        self.recv_bc = vec![[[0; 3]; 2]; self.block_len];
        self.recv_bc_total = vec![[0; 2]; self.block_len];
        self.notice_tx = tx;
        rx
    }

    /// Tally a received proposal by identity. Also counts toward the
    /// phase 0 round 1 total.
    pub(crate) fn put_recv_proposal(&mut self, batch: Batch) {
        self.recv_bc_total[0][0] += 1;
        for tally in &mut self.recv_proposals {
            if tally.batch.same_identity(&batch) {
                tally.count += 1;
                return;
            }
        }
        self.recv_proposals.push(Tally { batch, count: 1 });
    }

    /// The proposal tallied most often and its count. Ties prefer the batch
    /// whose identity wins the less-than relation.
    pub(crate) fn recv_proposals_maj(&mut self) -> (Batch, u32) {
        self.recv_proposals.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.batch.id.cmp(&b.batch.id))
        });
        let top = self
            .recv_proposals
            .first()
            .expect("proposal majority requested with no proposals tallied");
        (top.batch.clone(), top.count)
    }

    pub(crate) fn set_my_bc(&mut self, phase: u32, round: u32, bit: Bit) {
        self.my_bc[phase as usize][round_index(round)] = bit;
    }

    pub(crate) fn my_bc(&self, phase: u32, round: u32) -> Bit {
        self.my_bc[phase as usize][round_index(round)]
    }

    /// Tally a received State or Vote bit. The total advances with it.
    pub(crate) fn put_recv_bc(&mut self, phase: u32, round: u32, bit: Bit) {
        let p = phase as usize;
        assert!(p < self.block_len, "phase {phase} exceeds the block array");
        self.recv_bc[p][round_index(round)][bit.index()] += 1;
        self.recv_bc_total[p][round_index(round)] += 1;
    }

    /// The binary majority at (phase, round) and its count; a tie between
    /// 0 and 1 yields 1, as the algorithm requires.
    pub(crate) fn recv_bc_maj(&self, phase: u32, round: u32) -> (Bit, u32) {
        let counts = &self.recv_bc[phase as usize][round_index(round)];
        if counts[0] > counts[1] {
            (Bit::Zero, counts[0])
        } else {
            (Bit::One, counts[1])
        }
    }

    /// Whether at least n - f messages arrived at (phase, round).
    pub(crate) fn has_enough(&self, phase: u32, round: u32) -> bool {
        self.recv_bc_total[phase as usize][round_index(round)] >= self.n_minus_f
    }

    /// Hand the executor its single per-(phase, round) notice. The mailbox
    /// capacity covers a full term's worth of notices, so `try_send` only
    /// fails against a mailbox that a reset has already replaced.
    pub(crate) fn notify(&self, kind: NoticeKind, phase: u32) {
        let _ = self.notice_tx.try_send(SlotNotice::Ready { kind, phase });
    }

    pub(crate) fn notify_decision(&self, batch: Batch) {
        let _ = self.notice_tx.try_send(SlotNotice::Decision(batch));
    }

    pub(crate) fn incr_phase_decr_round(&mut self) {
        self.phase += 1;
        self.round -= 1;
    }
}

fn round_index(round: u32) -> usize {
    match round {
        1 => 0,
        2 => 1,
        other => panic!("round {other} is not a Rabia round"),
    }
}

/// One ring entry: the state plus the executor-side mailbox receiver.
struct Slot {
    state: Mutex<SlotState>,
    mailbox: Mutex<Option<mpsc::Receiver<SlotNotice>>>,
}

/// The fixed-size ring of slots shared by the message handler, the executor,
/// and the commit applier.
pub struct Ledger {
    slots: Vec<Slot>,
    len: u32,
    mailbox_cap: usize,
}

impl Ledger {
    pub fn new(cfg: &Config) -> Self {
        let mailbox_cap = 2 * cfg.block_array_len + 2;
        let n_minus_f = cfg.n_minus_f() as u32;
        let slots = (0..cfg.ledger_len)
            .map(|_| {
                let (state, rx) = SlotState::fresh(cfg.block_array_len, n_minus_f, mailbox_cap);
                Slot {
                    state: Mutex::new(state),
                    mailbox: Mutex::new(Some(rx)),
                }
            })
            .collect();
        Self {
            slots,
            len: cfg.ledger_len,
            mailbox_cap,
        }
    }

    fn slot(&self, seq: Seq) -> &Slot {
        &self.slots[(seq % self.len) as usize]
    }

    fn term_of(&self, seq: Seq) -> u32 {
        seq / self.len
    }

    /// Check an incoming message's term against the slot for `seq`, and
    /// advance the term by resetting the slot when the message is exactly
    /// one term ahead. This is the only path that advances a slot's term.
    ///
    /// With `strict` the caller asserts the term must be acceptable; a stale
    /// or too-new seq is then a protocol violation and panics.
    pub fn update_term_if_necessary(&self, seq: Seq, strict: bool) -> TermCheck {
        let slot = self.slot(seq);
        let msg_term = self.term_of(seq);
        let mut st = slot.state.lock().unwrap();
        let check = if msg_term == st.term {
            TermCheck::Current
        } else if msg_term == st.term + 1 {
            let rx = st.reset(self.mailbox_cap);
            st.term = msg_term;
            *slot.mailbox.lock().unwrap() = Some(rx);
            TermCheck::Current
        } else if msg_term < st.term {
            TermCheck::Stale
        } else {
            TermCheck::TooNew
        };
        if strict && !check.is_current() {
            panic!(
                "seq {seq} carries term {msg_term} but the slot holds term {} ({check:?})",
                st.term
            );
        }
        check
    }

    /// Whether `seq`'s term equals the slot's current term, with no side
    /// effects.
    pub fn is_term_matched(&self, seq: Seq) -> bool {
        let slot = self.slot(seq);
        let msg_term = self.term_of(seq);
        slot.state.lock().unwrap().term == msg_term
    }

    /// Run `f` with the slot state for `seq` locked.
    pub(crate) fn with_slot<R>(&self, seq: Seq, f: impl FnOnce(&mut SlotState) -> R) -> R {
        let mut st = self.slot(seq).state.lock().unwrap();
        f(&mut st)
    }

    /// Take the executor-side mailbox receiver for the slot's current term.
    pub(crate) fn take_mailbox(&self, seq: Seq) -> Option<mpsc::Receiver<SlotNotice>> {
        self.slot(seq).mailbox.lock().unwrap().take()
    }

    /// The committed decision for logical `seq`, if the slot still holds
    /// that term and has decided. Used by the commit applier.
    pub fn committed_decision(&self, seq: Seq) -> Option<Batch> {
        let slot = self.slot(seq);
        let st = slot.state.lock().unwrap();
        if st.term != self.term_of(seq) || !st.is_done {
            return None;
        }
        st.decision.clone()
    }
}
