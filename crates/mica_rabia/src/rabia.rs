//! Rabia module wiring.
//!
//! `engine` contains the per-slot state machine, the ordered commit applier,
//! and the ingress handler (in `handler`); `slot` holds the ledger ring and
//! per-slot tallies; `queue` is the pending-batch priority queue; `types`
//! defines the shared wire records and trait contracts (transport, state
//! machine).

mod coin;
mod engine;
mod handler;
mod queue;
mod slot;
mod types;

pub use coin::CommonCoin;
pub use engine::{Engine, EngineMetricsSnapshot};
pub use queue::PendingQueue;
pub use slot::{Ledger, NoticeKind, SlotNotice, Tally, TermCheck};
pub use types::{
    Batch, BatchId, Bit, ClientCommand, ClientId, ClientReply, Config, Message, NodeId, Seq,
    StateMachine, Transport,
};
