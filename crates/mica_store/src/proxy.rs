//! Client-facing proxy: connection handling, request batching, and reply
//! routing.
//!
//! The proxy owns three concerns. Per-client connection actors decode
//! commands and forward them to the batcher; the batcher folds client
//! requests into consensus batches and broadcasts them to the whole cluster
//! (every server learns of every pending batch); and the reply router hands
//! applied results back to whichever of this server's clients are still
//! connected. Replies for clients connected to some other server are
//! dropped here; that server produces the same reply from the same decided
//! slot.

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use mica_rabia::rabia::{
    Batch, BatchId, ClientCommand, ClientId, ClientReply, Config, Message, Transport,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::wire;

/// Reply channels for the clients currently connected to this server.
#[derive(Default)]
pub struct ClientRegistry {
    inner: RwLock<HashMap<ClientId, mpsc::Sender<ClientReply>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: ClientId, tx: mpsc::Sender<ClientReply>) {
        self.inner.write().unwrap().insert(client_id, tx);
    }

    pub fn deregister(&self, client_id: ClientId) {
        self.inner.write().unwrap().remove(&client_id);
    }

    pub fn sender(&self, client_id: ClientId) -> Option<mpsc::Sender<ClientReply>> {
        self.inner.read().unwrap().get(&client_id).cloned()
    }

    pub fn connected(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

/// Accept client connections and spawn one actor per connection.
pub async fn run_client_listener(
    listen: SocketAddr,
    registry: Arc<ClientRegistry>,
    to_batcher: mpsc::Sender<ClientCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding client listener on {listen}"))?;
    info!(%listen, "client listener ready");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            conn = listener.accept() => {
                match conn {
                    Ok((stream, addr)) => {
                        debug!(%addr, "client connected");
                        tokio::spawn(handle_client(
                            stream,
                            registry.clone(),
                            to_batcher.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(err) => warn!(error = ?err, "client accept failed"),
                }
            }
        }
    }
    Ok(())
}

/// One connected client: commands in, replies out. The client is registered
/// lazily on its first command, since that is where its id appears.
async fn handle_client(
    stream: TcpStream,
    registry: Arc<ClientRegistry>,
    to_batcher: mpsc::Sender<ClientCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let framed = Framed::new(stream, wire::codec());
    let (mut sink, mut frames) = framed.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<ClientReply>(1024);
    let mut client_id: Option<ClientId> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            reply = reply_rx.recv() => {
                let Some(reply) = reply else { break };
                let frame = match wire::encode(&reply) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = ?err, "client reply encode failed");
                        continue;
                    }
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            frame = frames.next() => {
                let bytes = match frame {
                    None => break,
                    Some(Err(err)) => {
                        warn!(error = ?err, "client read failed");
                        break;
                    }
                    Some(Ok(bytes)) => bytes,
                };
                let cmd: ClientCommand = match wire::decode(&bytes) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        warn!(error = ?err, "dropping undecodable client frame");
                        break;
                    }
                };
                if client_id.is_none() {
                    client_id = Some(cmd.client_id);
                    registry.register(cmd.client_id, reply_tx.clone());
                }
                if to_batcher.send(cmd).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(id) = client_id {
        registry.deregister(id);
        debug!(client = id, "client disconnected");
    }
}

/// Fold client commands into consensus batches.
///
/// A batch is emitted when the buffers hold `proxy_batch_size` client
/// requests, or on the periodic tick when they are non-empty. Buffers are
/// freshly allocated after each emission and the proposer counter advances
/// by one per batch.
pub async fn run_batcher(
    cfg: Config,
    mut commands: mpsc::Receiver<ClientCommand>,
    transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.proxy_batch_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut client_ids: Vec<ClientId> = Vec::with_capacity(cfg.proxy_batch_size);
    let mut client_seqs: Vec<u32> = Vec::with_capacity(cfg.proxy_batch_size);
    let mut buffered: Vec<String> =
        Vec::with_capacity(cfg.proxy_batch_size * cfg.client_batch_size);
    let mut proposer_seq: u32 = 0;

    loop {
        let flush = tokio::select! {
            _ = shutdown.changed() => break,
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                client_ids.push(cmd.client_id);
                client_seqs.push(cmd.client_seq);
                buffered.extend(cmd.commands);
                client_ids.len() == cfg.proxy_batch_size
            }
            _ = ticker.tick() => !client_ids.is_empty(),
        };
        if !flush {
            continue;
        }

        let batch = Batch {
            id: BatchId {
                proposer_id: cfg.node_id,
                proposer_seq,
            },
            server_seq: 0,
            is_null: false,
            client_ids: mem::take(&mut client_ids),
            client_seqs: mem::take(&mut client_seqs),
            commands: mem::take(&mut buffered),
        };
        proposer_seq += 1;
        if let Err(err) = transport.broadcast(Message::ClientRequest { batch }).await {
            warn!(error = ?err, "client batch broadcast failed");
        }
    }
    info!(node = cfg.node_id, "proxy batcher stopped");
}

/// Forward applied replies to locally connected clients; drop the rest.
pub async fn run_reply_router(
    registry: Arc<ClientRegistry>,
    mut replies: mpsc::Receiver<ClientReply>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            reply = replies.recv() => {
                let Some(reply) = reply else { break };
                let Some(tx) = registry.sender(reply.client_id) else {
                    // The client is connected to some other server.
                    continue;
                };
                if tx.try_send(reply).is_err() {
                    warn!("client reply channel full or closed; dropping reply");
                }
            }
        }
    }
}
