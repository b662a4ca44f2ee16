//! Deterministic single-engine tests: the test plays the rest of the
//! cluster, reflecting chosen messages into the handler and asserting on
//! recorded outbound traffic.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{make_batch, wait_until, RecordingTransport};
use mica_rabia::rabia::{Bit, Config, Engine, Ledger, Message, PendingQueue};
use tokio::sync::{mpsc, watch};

struct TestNode {
    engine: Arc<Engine>,
    ledger: Arc<Ledger>,
    transport: Arc<RecordingTransport>,
    to_handler: mpsc::Sender<Message>,
    to_executor: mpsc::Sender<Message>,
    _shutdown_tx: watch::Sender<bool>,
}

fn spawn_node(cfg: Config) -> TestNode {
    let ledger = Arc::new(Ledger::new(&cfg));
    let pending = Arc::new(PendingQueue::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let transport = RecordingTransport::new();
    let engine = Arc::new(Engine::new(
        cfg,
        ledger.clone(),
        pending,
        transport.clone(),
        shutdown_rx,
    ));
    let (h_tx, h_rx) = mpsc::channel(1024);
    let (e_tx, e_rx) = mpsc::channel(1024);
    tokio::spawn(engine.clone().run_message_handler(h_rx));
    tokio::spawn(engine.clone().run_executor(e_rx));
    TestNode {
        engine,
        ledger,
        transport,
        to_handler: h_tx,
        to_executor: e_tx,
        _shutdown_tx: shutdown_tx,
    }
}

fn config(node_id: u32, n: usize, f: usize) -> Config {
    Config::new(node_id, n, f).unwrap()
}

async fn submit(node: &TestNode, batch: mica_rabia::rabia::Batch) {
    node.to_handler
        .send(Message::ClientRequest { batch })
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unanimous_proposals_commit_in_phase_zero() {
    // n = 5, f = 1: n - f = 4 proposals are admitted, and a tally of 4
    // reaches majority + f, so the slot commits without any votes.
    let node = spawn_node(config(1, 5, 1));
    let o = make_batch(1, 0);
    submit(&node, o.clone()).await;

    let sent = node.transport.wait_broadcasts(1).await;
    assert!(matches!(&sent[0], Message::Proposal { seq: 0, .. }));

    for _ in 0..4 {
        node.to_handler
            .send(Message::Proposal {
                seq: 0,
                batch: o.clone(),
            })
            .await
            .unwrap();
    }

    let sent = node.transport.wait_broadcasts(2).await;
    match &sent[1] {
        Message::Decision { seq: 0, batch } => assert!(batch.same_identity(&o)),
        other => panic!("expected a decision broadcast, got {other:?}"),
    }
    wait_until(Duration::from_secs(5), || {
        (node.engine.metrics().normal_slots == 1).then_some(())
    })
    .await
    .expect("slot should count as a matched decision");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_proposals_commit_through_the_first_vote() {
    // This server proposes o1 while the two admitted proposals are both o2:
    // the proposal majority is o2 with a plain majority, everyone votes 1,
    // and f + 1 one-votes commit o2. o1 goes back to the queue and o2's
    // identity lands in the discard set.
    let node = spawn_node(config(1, 3, 1));
    let o1 = make_batch(1, 0);
    let o2 = make_batch(2, 0);
    submit(&node, o1.clone()).await;

    node.transport.wait_broadcasts(1).await;
    for _ in 0..2 {
        node.to_handler
            .send(Message::Proposal {
                seq: 0,
                batch: o2.clone(),
            })
            .await
            .unwrap();
    }

    let sent = node.transport.wait_broadcasts(2).await;
    assert!(
        matches!(
            &sent[1],
            Message::Vote {
                seq: 0,
                phase: 0,
                bit: Bit::One
            }
        ),
        "majority tally below majority+f must vote 1, got {:?}",
        sent[1]
    );

    for _ in 0..2 {
        node.to_handler
            .send(Message::Vote {
                seq: 0,
                phase: 0,
                bit: Bit::One,
            })
            .await
            .unwrap();
    }

    let sent = node.transport.wait_broadcasts(4).await;
    match &sent[2] {
        Message::Decision { seq: 0, batch } => assert!(batch.same_identity(&o2)),
        other => panic!("expected a decision broadcast, got {other:?}"),
    }
    // The displaced proposal is re-proposed for the next slot right away.
    match &sent[3] {
        Message::Proposal { seq: 1, batch } => assert!(batch.same_identity(&o1)),
        other => panic!("expected o1 re-proposed at seq 1, got {other:?}"),
    }

    let metrics = node.engine.metrics();
    assert_eq!(metrics.unmatched_slots, 1);

    // o2 resurfacing from the queue is skipped via the discard set: settle
    // seq 1 first, then check that no proposal is made for o2.
    node.to_handler
        .send(Message::Decision {
            seq: 1,
            batch: o1.clone(),
        })
        .await
        .unwrap();
    wait_until(Duration::from_secs(5), || {
        (node.engine.metrics().normal_slots == 1).then_some(())
    })
    .await
    .expect("seq 1 should decide for o1");

    submit(&node, o2.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = node.transport.broadcasts();
    assert!(
        !sent
            .iter()
            .any(|m| matches!(m, Message::Proposal { seq: 2, .. })),
        "a discarded identity must not be re-proposed: {sent:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_way_split_decides_null() {
    let node = spawn_node(config(1, 3, 1));
    let o1 = make_batch(1, 0);
    submit(&node, o1.clone()).await;

    node.transport.wait_broadcasts(1).await;
    node.to_handler
        .send(Message::Proposal {
            seq: 0,
            batch: make_batch(2, 0),
        })
        .await
        .unwrap();
    node.to_handler
        .send(Message::Proposal {
            seq: 0,
            batch: make_batch(3, 0),
        })
        .await
        .unwrap();

    // No proposal reaches a majority, so the vote is ?.
    let sent = node.transport.wait_broadcasts(2).await;
    assert!(matches!(
        &sent[1],
        Message::Vote {
            seq: 0,
            phase: 0,
            bit: Bit::Maybe
        }
    ));

    // All votes are ?, so there is no 0/1 majority at all and the next
    // state bit defaults to 0.
    for _ in 0..2 {
        node.to_handler
            .send(Message::Vote {
                seq: 0,
                phase: 0,
                bit: Bit::Maybe,
            })
            .await
            .unwrap();
    }
    let sent = node.transport.wait_broadcasts(3).await;
    assert!(matches!(
        &sent[2],
        Message::State {
            seq: 0,
            phase: 1,
            bit: Bit::Zero
        }
    ));

    // Phase 1: a majority of 0-states votes 0, and f + 1 zero-votes commit
    // the null batch.
    for _ in 0..2 {
        node.to_handler
            .send(Message::State {
                seq: 0,
                phase: 1,
                bit: Bit::Zero,
            })
            .await
            .unwrap();
    }
    let sent = node.transport.wait_broadcasts(4).await;
    assert!(matches!(
        &sent[3],
        Message::Vote {
            seq: 0,
            phase: 1,
            bit: Bit::Zero
        }
    ));

    for _ in 0..2 {
        node.to_handler
            .send(Message::Vote {
                seq: 0,
                phase: 1,
                bit: Bit::Zero,
            })
            .await
            .unwrap();
    }
    let sent = node.transport.wait_broadcasts(5).await;
    match &sent[4] {
        Message::Decision { seq: 0, batch } => assert!(batch.is_null),
        other => panic!("expected a null decision, got {other:?}"),
    }

    let metrics = node.engine.metrics();
    assert_eq!(metrics.null_slots, 1);
    // The proposer reclaims its batch and retries it on the next slot.
    let sent = node.transport.wait_broadcasts(6).await;
    match &sent[5] {
        Message::Proposal { seq: 1, batch } => assert!(batch.same_identity(&o1)),
        other => panic!("expected o1 retried at seq 1, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peer_decision_short_circuits_the_slot() {
    let node = spawn_node(config(1, 3, 1));
    let o1 = make_batch(1, 0);
    submit(&node, o1.clone()).await;
    node.transport.wait_broadcasts(1).await;

    // One proposal is not enough to wake the executor; a peer's decision
    // must interrupt the wait.
    node.to_handler
        .send(Message::Proposal {
            seq: 0,
            batch: o1.clone(),
        })
        .await
        .unwrap();
    let v = make_batch(9, 9);
    node.to_handler
        .send(Message::Decision {
            seq: 0,
            batch: v.clone(),
        })
        .await
        .unwrap();

    // The displaced proposal comes back for seq 1; the adopted decision is
    // not re-broadcast.
    let sent = node.transport.wait_broadcasts(2).await;
    match &sent[1] {
        Message::Proposal { seq: 1, batch } => assert!(batch.same_identity(&o1)),
        other => panic!("expected o1 re-proposed at seq 1, got {other:?}"),
    }
    assert!(
        !sent.iter().any(|m| matches!(m, Message::Decision { .. })),
        "an adopted decision must not be re-broadcast: {sent:?}"
    );

    let dec = node
        .ledger
        .committed_decision(0)
        .expect("slot 0 should be decided");
    assert!(dec.same_identity(&v));
    assert_eq!(node.engine.metrics().unmatched_slots, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proposal_requests_are_answered_from_a_majority_slot() {
    let node = spawn_node(config(1, 3, 1));
    let o2 = make_batch(2, 0);

    // Fill slot 0 with an n - f proposal majority without involving the
    // local executor.
    for _ in 0..2 {
        node.to_handler
            .send(Message::Proposal {
                seq: 0,
                batch: o2.clone(),
            })
            .await
            .unwrap();
    }
    node.to_handler
        .send(Message::ProposalRequest { seq: 0, from: 7 })
        .await
        .unwrap();

    let directs = node.transport.wait_directs(1).await;
    match &directs[0] {
        (
            7,
            Message::ProposalReply {
                seq: 0,
                to: 7,
                batch,
            },
        ) => assert!(batch.same_identity(&o2)),
        other => panic!("expected a proposal reply to node 7, got {other:?}"),
    }

    // A slot without enough proposals stays silent.
    node.to_handler
        .send(Message::ProposalRequest { seq: 1, from: 7 })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.transport.directs().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_proposal_tally_fetches_the_value_from_peers() {
    let node = spawn_node(config(1, 3, 1));
    let o1 = make_batch(1, 0);
    submit(&node, o1.clone()).await;
    node.transport.wait_broadcasts(1).await;

    // Two distinct proposals: no majority locally.
    node.to_handler
        .send(Message::Proposal {
            seq: 0,
            batch: make_batch(2, 0),
        })
        .await
        .unwrap();
    node.to_handler
        .send(Message::Proposal {
            seq: 0,
            batch: make_batch(3, 0),
        })
        .await
        .unwrap();
    node.transport.wait_broadcasts(2).await;

    // A one-vote majority commits, but the local proposal tally cannot name
    // the value, so the executor must ask the cluster.
    for _ in 0..2 {
        node.to_handler
            .send(Message::Vote {
                seq: 0,
                phase: 0,
                bit: Bit::One,
            })
            .await
            .unwrap();
    }
    let sent = node.transport.wait_broadcasts(3).await;
    assert!(matches!(
        &sent[2],
        Message::ProposalRequest { seq: 0, from: 1 }
    ));

    let v = make_batch(2, 0);
    node.to_executor
        .send(Message::ProposalReply {
            seq: 0,
            to: 1,
            batch: v.clone(),
        })
        .await
        .unwrap();

    let sent = node.transport.wait_broadcasts(4).await;
    match &sent[3] {
        Message::Decision { seq: 0, batch } => assert!(batch.same_identity(&v)),
        other => panic!("expected the fetched value decided, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ring_reuse_advances_terms_and_drops_stale_messages() {
    let mut cfg = config(1, 3, 1);
    cfg.ledger_len = 4;
    let node = spawn_node(cfg);

    // Decide seqs 0..=3 through peer decisions, filling one full ring turn.
    for seq in 0..4u32 {
        let o = make_batch(1, seq);
        submit(&node, o.clone()).await;
        node.transport.wait_broadcasts(seq as usize + 1).await;
        node.to_handler
            .send(Message::Decision { seq, batch: o })
            .await
            .unwrap();
        wait_until(Duration::from_secs(5), || {
            (node.engine.metrics().normal_slots == u64::from(seq) + 1).then_some(())
        })
        .await
        .expect("peer decision should settle the slot");
    }

    // Seq 4 reuses ring index 0 at term 1.
    let o4 = make_batch(1, 4);
    submit(&node, o4.clone()).await;
    wait_until(Duration::from_secs(5), || {
        node.transport
            .broadcasts()
            .iter()
            .any(|m| matches!(m, Message::Proposal { seq: 4, .. }))
            .then_some(())
    })
    .await
    .expect("seq 4 should be proposed");

    // The old term's decision is no longer readable through the ring.
    assert!(node.ledger.committed_decision(0).is_none());

    // A vote for the reclaimed seq 0 is stale; a vote three terms ahead is
    // rejected as too new.
    node.to_handler
        .send(Message::Vote {
            seq: 0,
            phase: 0,
            bit: Bit::One,
        })
        .await
        .unwrap();
    node.to_handler
        .send(Message::Vote {
            seq: 12,
            phase: 0,
            bit: Bit::One,
        })
        .await
        .unwrap();
    wait_until(Duration::from_secs(5), || {
        let m = node.engine.metrics();
        (m.older_term_msgs == 1 && m.too_new_msgs == 1).then_some(())
    })
    .await
    .expect("stale and too-new messages should be counted and dropped");

    // The new term still decides normally.
    node.to_handler
        .send(Message::Decision {
            seq: 4,
            batch: o4.clone(),
        })
        .await
        .unwrap();
    wait_until(Duration::from_secs(5), || {
        node.ledger
            .committed_decision(4)
            .map(|d| assert!(d.same_identity(&o4)))
    })
    .await
    .expect("seq 4 should decide at term 1");
}
