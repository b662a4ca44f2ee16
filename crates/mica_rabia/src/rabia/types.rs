//! Shared types for the Rabia consensus engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus engine and the transport/proxy layers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Logical server identifier within the cluster.
pub type NodeId = u32;
/// Logical client identifier.
pub type ClientId = u32;
/// Logical log position. The ring index is `seq % ledger_len` and the term is
/// `seq / ledger_len`.
pub type Seq = u32;

/// Identity of a proposed batch: the proposing server plus a per-server
/// counter. Two batches are the same proposal iff their ids are equal, and
/// the derived lexicographic order is the strict tie-break order used when
/// proposal tallies collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub proposer_id: NodeId,
    pub proposer_seq: u32,
}

/// The agreement value: a proxy-batched group of client commands.
///
/// `server_seq` is the log slot the batch was decided into, filled in by the
/// deciding server. A null batch represents an empty commit: no client batch
/// was chosen for that slot, and proposers reclaim their objects.
///
/// Protocol equality is identity equality (`id`), never payload equality;
/// compare with [`Batch::same_identity`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub server_seq: Seq,
    pub is_null: bool,
    pub client_ids: Vec<ClientId>,
    pub client_seqs: Vec<u32>,
    pub commands: Vec<String>,
}

impl Batch {
    /// Build the null batch for a slot.
    pub fn null(seq: Seq) -> Self {
        Self {
            id: BatchId {
                proposer_id: 0,
                proposer_seq: 0,
            },
            server_seq: seq,
            is_null: true,
            client_ids: Vec::new(),
            client_seqs: Vec::new(),
            commands: Vec::new(),
        }
    }

    pub fn same_identity(&self, other: &Batch) -> bool {
        self.id == other.id
    }
}

/// A binary-consensus value. `Maybe` is the ternary undecided vote (`?`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bit {
    Zero,
    One,
    Maybe,
}

impl Bit {
    /// Stable index used for tally arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Bit::Zero => 0,
            Bit::One => 1,
            Bit::Maybe => 2,
        }
    }
}

/// A peer-to-peer consensus message. The embedded `seq` names the slot the
/// message is for; `phase` is the Rabia phase of the sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// A proxy-batched client request, broadcast by the originating server's
    /// proxy to every server (including itself).
    ClientRequest { batch: Batch },
    /// This server's phase-0 proposal for `seq`.
    Proposal { seq: Seq, batch: Batch },
    /// Round-1 state exchange bit for phases >= 1.
    State { seq: Seq, phase: u32, bit: Bit },
    /// Round-2 vote bit (0, 1, or ?).
    Vote { seq: Seq, phase: u32, bit: Bit },
    /// A decided value for `seq`; lets lagging peers short-circuit.
    Decision { seq: Seq, batch: Batch },
    /// Request the proposal majority for `seq` from peers; `from` is the
    /// requesting server, which the reply is addressed to.
    ProposalRequest { seq: Seq, from: NodeId },
    /// Point-to-point answer to a `ProposalRequest`.
    ProposalReply { seq: Seq, to: NodeId, batch: Batch },
}

/// One client request as received by the proxy: a fixed-size group of
/// encoded commands.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientCommand {
    pub client_id: ClientId,
    pub client_seq: u32,
    pub commands: Vec<String>,
}

/// One reply batch sent back to a locally connected client after its request
/// was decided and applied.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientReply {
    pub server_seq: Seq,
    pub client_id: ClientId,
    pub client_seq: u32,
    pub replies: Vec<String>,
}

/// Immutable per-server configuration, plumbed through at construction.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: NodeId,
    /// Cluster size n.
    pub n_servers: usize,
    /// Tolerated crash faults f, with f < n/2.
    pub n_faulty: usize,
    /// Ring length L of the ledger.
    pub ledger_len: u32,
    /// Maximum number of phases tracked per slot.
    pub block_array_len: usize,
    /// Client requests batched into one consensus object.
    pub proxy_batch_size: usize,
    /// Max time between submitting non-empty proxy batches.
    pub proxy_batch_timeout: Duration,
    /// Commands in one client request.
    pub client_batch_size: usize,
    /// Fixed length of store keys inside encoded commands.
    pub key_len: usize,
    /// Fixed length of store values inside encoded commands.
    pub value_len: usize,
    /// Capacity of the bulk inter-actor channels.
    pub channel_len: usize,
    /// Delay before the executor starts deciding slots (load priming).
    pub consensus_start_after: Duration,
}

impl Config {
    pub fn new(node_id: NodeId, n_servers: usize, n_faulty: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(n_servers > 0, "cluster size must be positive");
        anyhow::ensure!(
            n_faulty * 2 < n_servers,
            "fault threshold {n_faulty} must satisfy f < n/2 for n = {n_servers}"
        );
        Ok(Self {
            node_id,
            n_servers,
            n_faulty,
            ledger_len: 10_000,
            block_array_len: 10,
            proxy_batch_size: 10,
            proxy_batch_timeout: Duration::from_millis(5),
            client_batch_size: 1,
            key_len: 8,
            value_len: 8,
            channel_len: 500_000,
            consensus_start_after: Duration::ZERO,
        })
    }

    pub fn majority(&self) -> usize {
        self.n_servers / 2 + 1
    }

    pub fn majority_plus_f(&self) -> usize {
        self.n_servers / 2 + self.n_faulty + 1
    }

    pub fn faulty_plus_one(&self) -> usize {
        self.n_faulty + 1
    }

    pub fn n_minus_f(&self) -> usize {
        self.n_servers - self.n_faulty
    }
}

/// Transport interface for consensus messages.
///
/// The consensus engine is transport-agnostic; concrete implementations can
/// use TCP meshes, in-memory channels, or test harnesses. `broadcast` must
/// deliver to all n servers including the sender: the protocol counts the
/// sender's own message toward its n - f threshold.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn broadcast(&self, msg: Message) -> anyhow::Result<()>;

    /// Point-to-point send, used for the proposal-reply path.
    async fn send_to(&self, peer: NodeId, msg: Message) -> anyhow::Result<()>;
}

/// Application state machine driven by the commit applier.
///
/// Commands are the fixed-layout strings described in the proxy protocol
/// (`op || key || value`); `apply` executes one and returns the encoded
/// reply. Backends that can amortize round trips (multi-get/multi-set
/// services) override `apply_batch`.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    async fn apply(&self, cmd: &str) -> anyhow::Result<String>;

    async fn apply_batch(&self, cmds: &[String]) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            out.push(self.apply(cmd).await?);
        }
        Ok(out)
    }
}
