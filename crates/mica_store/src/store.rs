//! Storage backends and the replicated command layout.
//!
//! Commands are fixed-layout strings, identical on every replica:
//! `op || key || value` with a one-character op (`'0'` write, anything else
//! read), a fixed-length key, and the value as the remainder. Replies are
//! `"0" + key + "ok"` for writes and `"1" + key + value` for reads, with an
//! empty value when the key is absent.
//!
//! Two backends implement the engine's `StateMachine`: an in-memory map and
//! an external RESP2 (Redis-compatible) service that amortizes batches into
//! one MSET plus one MGET.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mica_rabia::rabia::StateMachine;
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const OP_WRITE: &str = "0";

/// Split a command into `(op, key, value)` against a fixed key length.
pub fn split_command(cmd: &str, key_len: usize) -> anyhow::Result<(&str, &str, &str)> {
    anyhow::ensure!(cmd.is_ascii(), "command is not ascii");
    anyhow::ensure!(cmd.len() > key_len, "command shorter than its key");
    Ok((&cmd[..1], &cmd[1..1 + key_len], &cmd[1 + key_len..]))
}

/// Encode a write command.
pub fn encode_write(key: &str, value: &str) -> String {
    format!("0{key}{value}")
}

/// Encode a read command.
pub fn encode_read(key: &str) -> String {
    format!("1{key}")
}

/// The in-memory map backend.
pub struct MemStore {
    key_len: usize,
    data: Mutex<HashMap<String, String>>,
}

impl MemStore {
    pub fn new(key_len: usize) -> Self {
        Self {
            key_len,
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.data.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateMachine for MemStore {
    async fn apply(&self, cmd: &str) -> anyhow::Result<String> {
        let (op, key, value) = split_command(cmd, self.key_len)?;
        if op == OP_WRITE {
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

/// External multi-get/multi-set backend speaking RESP2 over one connection.
pub struct RespStore {
    key_len: usize,
    conn: tokio::sync::Mutex<Framed<TcpStream, Resp2>>,
}

impl RespStore {
    pub async fn connect(addr: SocketAddr, key_len: usize) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to storage service at {addr}"))?;
        socket.set_nodelay(true).ok();
        Ok(Self {
            key_len,
            conn: tokio::sync::Mutex::new(Framed::new(socket, Resp2::default())),
        })
    }

    async fn roundtrip(
        conn: &mut Framed<TcpStream, Resp2>,
        frame: BytesFrame,
    ) -> anyhow::Result<BytesFrame> {
        conn.send(frame).await.context("storage service write")?;
        match conn.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(err)) => Err(err).context("storage service read"),
            None => anyhow::bail!("storage service closed the connection"),
        }
    }
}

fn bulk(value: &str) -> BytesFrame {
    BytesFrame::BulkString(Bytes::from(value.as_bytes().to_vec()))
}

fn frame_to_value(frame: BytesFrame) -> anyhow::Result<String> {
    match frame {
        BytesFrame::BulkString(bytes) | BytesFrame::SimpleString(bytes) => {
            Ok(String::from_utf8(bytes.to_vec())?)
        }
        BytesFrame::Null => Ok(String::new()),
        BytesFrame::Error(err) => anyhow::bail!("storage service error: {err:?}"),
        other => anyhow::bail!("unexpected storage reply frame: {other:?}"),
    }
}

#[async_trait]
impl StateMachine for RespStore {
    async fn apply(&self, cmd: &str) -> anyhow::Result<String> {
        let (op, key, value) = split_command(cmd, self.key_len)?;
        let mut conn = self.conn.lock().await;
        if op == OP_WRITE {
            let frame = BytesFrame::Array(vec![bulk("SET"), bulk(key), bulk(value)]);
            let resp = Self::roundtrip(&mut conn, frame).await?;
            if let BytesFrame::Error(err) = resp {
                anyhow::bail!("SET failed: {err:?}");
            }
            Ok(format!("0{key}ok"))
        } else {
            let frame = BytesFrame::Array(vec![bulk("GET"), bulk(key)]);
            let resp = Self::roundtrip(&mut conn, frame).await?;
            let value = frame_to_value(resp)?;
            Ok(format!("1{key}{value}"))
        }
    }

    /// One MSET covers every write in the batch and one MGET every read;
    /// read replies are backfilled in command order.
    async fn apply_batch(&self, cmds: &[String]) -> anyhow::Result<Vec<String>> {
        let mut replies = vec![String::new(); cmds.len()];
        let mut mset = vec![bulk("MSET")];
        let mut mget = vec![bulk("MGET")];
        let mut read_slots = Vec::new();

        for (idx, cmd) in cmds.iter().enumerate() {
            let (op, key, value) = split_command(cmd, self.key_len)?;
            if op == OP_WRITE {
                mset.push(bulk(key));
                mset.push(bulk(value));
                replies[idx] = format!("0{key}ok");
            } else {
                mget.push(bulk(key));
                read_slots.push(idx);
            }
        }

        let mut conn = self.conn.lock().await;
        if mset.len() > 1 {
            let resp = Self::roundtrip(&mut conn, BytesFrame::Array(mset)).await?;
            if let BytesFrame::Error(err) = resp {
                anyhow::bail!("MSET failed: {err:?}");
            }
        }
        if !read_slots.is_empty() {
            let resp = Self::roundtrip(&mut conn, BytesFrame::Array(mget)).await?;
            let BytesFrame::Array(values) = resp else {
                anyhow::bail!("MGET returned a non-array frame");
            };
            anyhow::ensure!(
                values.len() == read_slots.len(),
                "MGET returned {} values for {} keys",
                values.len(),
                read_slots.len()
            );
            for (idx, frame) in read_slots.into_iter().zip(values) {
                let (_, key, _) = split_command(&cmds[idx], self.key_len)?;
                let value = frame_to_value(frame)?;
                replies[idx] = format!("1{key}{value}");
            }
        }
        Ok(replies)
    }
}
