//! Three engines wired through an in-process channel mesh: the cluster must
//! agree on one decision sequence, apply it identically, and reply exactly
//! once per decided client batch.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{make_batch, wait_until};
use mica_rabia::rabia::{
    Batch, ClientReply, Config, Engine, Ledger, Message, NodeId, PendingQueue, StateMachine,
    Transport,
};
use tokio::sync::{mpsc, watch};

/// Channel-backed mesh: broadcast reaches every node's router (loopback
/// included) and routes by message type the way the node transport does.
struct ChannelMesh {
    handlers: Vec<mpsc::Sender<Message>>,
    executors: Vec<mpsc::Sender<Message>>,
}

impl ChannelMesh {
    async fn deliver(&self, peer: usize, msg: Message) -> anyhow::Result<()> {
        let tx = match msg {
            Message::ProposalReply { .. } => &self.executors[peer],
            _ => &self.handlers[peer],
        };
        tx.send(msg).await.map_err(|_| anyhow::anyhow!("peer {peer} is gone"))
    }
}

#[async_trait]
impl Transport for ChannelMesh {
    async fn broadcast(&self, msg: Message) -> anyhow::Result<()> {
        for peer in 0..self.handlers.len() {
            self.deliver(peer, msg.clone()).await?;
        }
        Ok(())
    }

    async fn send_to(&self, peer: NodeId, msg: Message) -> anyhow::Result<()> {
        self.deliver(peer as usize, msg).await
    }
}

/// Write-only map store mirroring the node's command layout (`op || key8 ||
/// value`).
#[derive(Default)]
struct TestStore {
    data: Mutex<HashMap<String, String>>,
}

impl TestStore {
    fn snapshot(&self) -> HashMap<String, String> {
        self.data.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateMachine for TestStore {
    async fn apply(&self, cmd: &str) -> anyhow::Result<String> {
        let op = &cmd[..1];
        let key = &cmd[1..9];
        let value = &cmd[9..];
        if op == "0" {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(format!("0{key}ok"))
        } else {
            let value = self
                .data
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or_default();
            Ok(format!("1{key}{value}"))
        }
    }
}

struct ClusterNode {
    ledger: Arc<Ledger>,
    store: Arc<TestStore>,
    replies: mpsc::Receiver<ClientReply>,
}

fn spawn_cluster(
    n: usize,
    f: usize,
) -> (Vec<ClusterNode>, Vec<mpsc::Sender<Message>>, watch::Sender<bool>) {
    let mut handler_txs = Vec::new();
    let mut handler_rxs = Vec::new();
    let mut executor_txs = Vec::new();
    let mut executor_rxs = Vec::new();
    for _ in 0..n {
        let (h_tx, h_rx) = mpsc::channel(4096);
        let (e_tx, e_rx) = mpsc::channel(4096);
        handler_txs.push(h_tx);
        handler_rxs.push(h_rx);
        executor_txs.push(e_tx);
        executor_rxs.push(e_rx);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut nodes = Vec::new();
    for (id, (h_rx, e_rx)) in handler_rxs
        .into_iter()
        .zip(executor_rxs.into_iter())
        .enumerate()
    {
        let cfg = Config::new(id as NodeId, n, f).unwrap();
        let ledger = Arc::new(Ledger::new(&cfg));
        let pending = Arc::new(PendingQueue::new());
        let mesh = Arc::new(ChannelMesh {
            handlers: handler_txs.clone(),
            executors: executor_txs.clone(),
        });
        let engine = Arc::new(Engine::new(
            cfg,
            ledger.clone(),
            pending,
            mesh,
            shutdown_rx.clone(),
        ));
        let store = Arc::new(TestStore::default());
        let (reply_tx, reply_rx) = mpsc::channel(4096);
        tokio::spawn(engine.clone().run_message_handler(h_rx));
        tokio::spawn(engine.clone().run_executor(e_rx));
        tokio::spawn(engine.clone().run_applier(store.clone(), reply_tx));
        nodes.push(ClusterNode {
            ledger,
            store,
            replies: reply_rx,
        });
    }
    (nodes, handler_txs, shutdown_tx)
}

fn submitted_batches(count: u32) -> Vec<Batch> {
    (0..count).map(|i| make_batch(0, i)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn cluster_agrees_applies_and_replies() {
    let (mut nodes, handlers, shutdown_tx) = spawn_cluster(3, 1);
    let batches = submitted_batches(5);

    // Client batches are broadcast to every server, as the proxy does.
    for batch in &batches {
        for handler in &handlers {
            handler
                .send(Message::ClientRequest {
                    batch: batch.clone(),
                })
                .await
                .unwrap();
        }
    }

    // Every store must converge on the five written keys.
    let expected: HashMap<String, String> = batches
        .iter()
        .map(|b| {
            let cmd = &b.commands[0];
            (cmd[1..9].to_string(), cmd[9..].to_string())
        })
        .collect();

    wait_until(Duration::from_secs(20), || {
        nodes
            .iter()
            .all(|n| n.store.snapshot() == expected)
            .then_some(())
    })
    .await
    .expect("all stores should converge on the submitted writes");

    // Agreement: wherever two nodes both decided a slot, the decisions
    // carry the same identity and nullness.
    let max_seq = 32;
    for seq in 0..max_seq {
        let decisions: Vec<Option<Batch>> = nodes
            .iter()
            .map(|n| n.ledger.committed_decision(seq))
            .collect();
        for a in 0..decisions.len() {
            for b in (a + 1)..decisions.len() {
                if let (Some(da), Some(db)) = (&decisions[a], &decisions[b]) {
                    assert_eq!(da.is_null, db.is_null, "nullness diverged at seq {seq}");
                    if !da.is_null {
                        assert!(
                            da.same_identity(db),
                            "decision identity diverged at seq {seq}"
                        );
                    }
                }
            }
        }
    }

    // Reply liveness: each node replies exactly once per decided batch.
    for node in &mut nodes {
        let mut seen = HashSet::new();
        for _ in 0..batches.len() {
            let reply = tokio::time::timeout(Duration::from_secs(5), node.replies.recv())
                .await
                .expect("reply should arrive")
                .expect("reply channel open");
            assert_eq!(reply.client_id, 0);
            assert!(
                seen.insert(reply.client_seq),
                "duplicate reply for client seq {}",
                reply.client_seq
            );
            assert_eq!(reply.replies.len(), 1);
            assert!(reply.replies[0].starts_with('0'));
            assert!(reply.replies[0].ends_with("ok"));
        }
    }

    let _ = shutdown_tx.send(true);
}
