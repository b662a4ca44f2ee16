//! Ingress gate between the network and the executor.
//!
//! The handler does not forward individual Proposal, State, or Vote
//! messages. It tallies them into the slot, and once strictly n - f have
//! arrived for a (phase, round) it places a single notice in the slot
//! mailbox and ignores everything later for that round, so the majority
//! values the executor reads are frozen at the handoff. Decisions pass
//! through at most once per term; proposal requests are answered directly
//! when this slot can vouch for a proposal majority.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::engine::Engine;
use super::slot::{NoticeKind, TermCheck};
use super::types::{Message, NodeId, Seq};

impl Engine {
    /// The message handler task: consumes every inbound peer message except
    /// `ProposalReply`, which the transport routes to the executor.
    pub async fn run_message_handler(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_ingress(msg).await;
                }
            }
        }
        info!(node = self.cfg.node_id, "message handler stopped");
    }

    async fn handle_ingress(&self, msg: Message) {
        match msg {
            Message::ClientRequest { batch } => self.pending.push(batch),
            Message::ProposalRequest { seq, from } => {
                self.handle_proposal_request(seq, from).await;
            }
            Message::Proposal { .. }
            | Message::State { .. }
            | Message::Vote { .. }
            | Message::Decision { .. } => self.handle_agreement(msg),
            Message::ProposalReply { .. } => {
                panic!("proposal replies are routed to the executor, not the handler")
            }
        }
    }

    /// Answer a peer's proposal request iff this slot already collected
    /// n - f proposals and the majority proposal has a true majority.
    /// Otherwise stay silent; the requester retries by re-entering its
    /// fetch, and a reply for a stale seq is ignored on its side.
    async fn handle_proposal_request(&self, seq: Seq, from: NodeId) {
        if !self.ledger.is_term_matched(seq) {
            return;
        }
        let majority = self.cfg.majority() as u32;
        let reply = self.ledger.with_slot(seq, |st| {
            if !st.has_enough(0, 1) {
                return None;
            }
            let (maj, tally) = st.recv_proposals_maj();
            if tally < majority {
                return None;
            }
            let mut batch = maj;
            batch.server_seq = seq;
            Some(Message::ProposalReply {
                seq,
                to: from,
                batch,
            })
        });
        if let Some(reply) = reply {
            if let Err(err) = self.transport.send_to(from, reply).await {
                warn!(peer = from, error = ?err, "proposal reply send failed");
            }
        }
    }

    /// Tally a Proposal, State, Vote, or Decision into its slot, advancing
    /// the slot's term first when the message is exactly one term ahead.
    fn handle_agreement(&self, msg: Message) {
        let seq = match &msg {
            Message::Proposal { seq, .. }
            | Message::State { seq, .. }
            | Message::Vote { seq, .. }
            | Message::Decision { seq, .. } => *seq,
            _ => unreachable!(),
        };
        match self.ledger.update_term_if_necessary(seq, false) {
            TermCheck::Current => {}
            TermCheck::Stale => {
                self.metrics.older_term_msgs.fetch_add(1, Ordering::Relaxed);
                return;
            }
            TermCheck::TooNew => {
                self.metrics.too_new_msgs.fetch_add(1, Ordering::Relaxed);
                warn!(
                    seq,
                    "dropping message more than one term ahead; this replica is far behind"
                );
                return;
            }
        }
        self.ledger.with_slot(seq, |st| {
            if st.is_done {
                return;
            }
            match msg {
                Message::Proposal { batch, .. } => {
                    if st.has_enough(0, 1) {
                        return;
                    }
                    st.put_recv_proposal(batch);
                    if st.has_enough(0, 1) && !st.has_recv_dec {
                        st.notify(NoticeKind::Proposal, 0);
                    }
                }
                Message::State { phase, bit, .. } => {
                    if st.has_enough(phase, 1) {
                        return;
                    }
                    st.put_recv_bc(phase, 1, bit);
                    if st.has_enough(phase, 1) && !st.has_recv_dec {
                        st.notify(NoticeKind::State, phase);
                    }
                }
                Message::Vote { phase, bit, .. } => {
                    if st.has_enough(phase, 2) {
                        return;
                    }
                    st.put_recv_bc(phase, 2, bit);
                    if st.has_enough(phase, 2) && !st.has_recv_dec {
                        st.notify(NoticeKind::Vote, phase);
                    }
                }
                Message::Decision { batch, .. } => {
                    if !st.has_recv_dec {
                        st.has_recv_dec = true;
                        st.notify_decision(batch);
                    }
                }
                _ => unreachable!(),
            }
        });
    }
}
