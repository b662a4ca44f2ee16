//! Shared helpers for consensus integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mica_rabia::rabia::{Batch, BatchId, Message, NodeId, Transport};

/// Transport that records outbound traffic for assertions. Tests act as the
/// rest of the cluster: they decide which messages to reflect back.
#[derive(Default)]
pub struct RecordingTransport {
    broadcasts: Mutex<Vec<Message>>,
    directs: Mutex<Vec<(NodeId, Message)>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn broadcast(&self, msg: Message) -> anyhow::Result<()> {
        self.broadcasts.lock().unwrap().push(msg);
        Ok(())
    }

    async fn send_to(&self, peer: NodeId, msg: Message) -> anyhow::Result<()> {
        self.directs.lock().unwrap().push((peer, msg));
        Ok(())
    }
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broadcasts(&self) -> Vec<Message> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn directs(&self) -> Vec<(NodeId, Message)> {
        self.directs.lock().unwrap().clone()
    }

    /// Wait until at least `n` broadcasts were recorded and return them.
    pub async fn wait_broadcasts(&self, n: usize) -> Vec<Message> {
        wait_until(Duration::from_secs(5), || {
            let seen = self.broadcasts();
            (seen.len() >= n).then_some(seen)
        })
        .await
        .unwrap_or_else(|| {
            panic!(
                "timed out waiting for {n} broadcasts; saw {:?}",
                self.broadcasts()
            )
        })
    }

    /// Wait until at least `n` direct sends were recorded and return them.
    pub async fn wait_directs(&self, n: usize) -> Vec<(NodeId, Message)> {
        wait_until(Duration::from_secs(5), || {
            let seen = self.directs();
            (seen.len() >= n).then_some(seen)
        })
        .await
        .unwrap_or_else(|| {
            panic!(
                "timed out waiting for {n} direct sends; saw {:?}",
                self.directs()
            )
        })
    }
}

/// Poll `probe` until it yields a value or the deadline passes.
pub async fn wait_until<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A batch with one write command, identified by `(proposer_id, proposer_seq)`.
pub fn make_batch(proposer_id: u32, proposer_seq: u32) -> Batch {
    Batch {
        id: BatchId {
            proposer_id,
            proposer_seq,
        },
        server_seq: 0,
        is_null: false,
        client_ids: vec![proposer_id],
        client_seqs: vec![proposer_seq],
        commands: vec![format!("0k{proposer_id:03}.{proposer_seq:03}v{proposer_seq:07}")],
    }
}
