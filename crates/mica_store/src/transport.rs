//! TCP mesh transport between servers.
//!
//! Each node listens for inbound peer connections and keeps one outbound
//! send-only connection per remote peer, so a full mesh carries every
//! direction on its own socket. Inbound frames are routed by type: proposal
//! replies go straight to the executor, everything else to the message
//! handler. Delivery to self never touches a socket; a broadcast loops back
//! through the same router channel inbound frames use, which satisfies the
//! protocol's requirement that a server's own message counts toward its
//! n - f threshold.
//!
//! Peer loss is tolerated: a failed write triggers background reconnects
//! while the rest of the cluster keeps the protocol live, provided n - f
//! servers stay reachable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mica_rabia::rabia::{Message, NodeId, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::wire;

const DIAL_RETRY_DELAY: Duration = Duration::from_millis(300);

/// One mesh endpoint, ordered by node id.
#[derive(Clone, Debug)]
pub struct PeerAddr {
    pub id: NodeId,
    pub addr: SocketAddr,
}

struct Peer {
    id: NodeId,
    tx: mpsc::Sender<Message>,
}

/// The node's view of the cluster mesh; implements the engine's transport
/// capability.
pub struct TcpMesh {
    node_id: NodeId,
    to_handler: mpsc::Sender<Message>,
    to_executor: mpsc::Sender<Message>,
    peers: Vec<Peer>,
}

#[async_trait]
impl Transport for TcpMesh {
    async fn broadcast(&self, msg: Message) -> anyhow::Result<()> {
        // Loopback first so local progress never depends on the network.
        route(&self.to_handler, &self.to_executor, msg.clone()).await?;
        for peer in &self.peers {
            if peer.tx.send(msg.clone()).await.is_err() {
                warn!(peer = peer.id, "peer writer is gone; dropping message");
            }
        }
        Ok(())
    }

    async fn send_to(&self, peer: NodeId, msg: Message) -> anyhow::Result<()> {
        if peer == self.node_id {
            return route(&self.to_handler, &self.to_executor, msg).await;
        }
        let Some(p) = self.peers.iter().find(|p| p.id == peer) else {
            anyhow::bail!("unknown peer {peer}");
        };
        p.tx.send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("peer {peer} writer is gone"))
    }
}

impl TcpMesh {
    /// Bind the peer listener, dial every remote peer until the mesh is
    /// complete, and spawn the reader/writer tasks.
    pub async fn start(
        node_id: NodeId,
        listen: SocketAddr,
        peers: Vec<PeerAddr>,
        to_handler: mpsc::Sender<Message>,
        to_executor: mpsc::Sender<Message>,
        channel_len: usize,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding peer listener on {listen}"))?;
        info!(node = node_id, %listen, "peer listener ready");

        {
            let to_handler = to_handler.clone();
            let to_executor = to_executor.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        conn = listener.accept() => {
                            match conn {
                                Ok((stream, addr)) => {
                                    debug!(%addr, "peer connected");
                                    tokio::spawn(run_peer_reader(
                                        stream,
                                        to_handler.clone(),
                                        to_executor.clone(),
                                        shutdown.clone(),
                                    ));
                                }
                                Err(err) => warn!(error = ?err, "peer accept failed"),
                            }
                        }
                    }
                }
            });
        }

        let mut mesh_peers = Vec::new();
        for peer in peers.into_iter().filter(|p| p.id != node_id) {
            let (tx, rx) = mpsc::channel(channel_len);
            let mut dial_shutdown = shutdown.clone();
            let stream = dial(&peer, &mut dial_shutdown)
                .await
                .with_context(|| format!("connecting to peer {} at {}", peer.id, peer.addr))?;
            info!(node = node_id, peer = peer.id, addr = %peer.addr, "peer link established");
            tokio::spawn(run_peer_writer(peer.clone(), stream, rx, shutdown.clone()));
            mesh_peers.push(Peer { id: peer.id, tx });
        }

        Ok(Arc::new(Self {
            node_id,
            to_handler,
            to_executor,
            peers: mesh_peers,
        }))
    }
}

/// Route one inbound or loopback message to the right engine channel.
async fn route(
    to_handler: &mpsc::Sender<Message>,
    to_executor: &mpsc::Sender<Message>,
    msg: Message,
) -> anyhow::Result<()> {
    let tx = match msg {
        Message::ProposalReply { .. } => to_executor,
        _ => to_handler,
    };
    tx.send(msg)
        .await
        .map_err(|_| anyhow::anyhow!("engine inbound channel closed"))
}

/// Decode frames from one inbound peer connection until it closes.
async fn run_peer_reader(
    stream: TcpStream,
    to_handler: mpsc::Sender<Message>,
    to_executor: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framed = FramedRead::new(stream, wire::codec());
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            frame = framed.next() => {
                let bytes = match frame {
                    None => return,
                    Some(Err(err)) => {
                        warn!(error = ?err, "peer read failed");
                        return;
                    }
                    Some(Ok(bytes)) => bytes,
                };
                let msg: Message = match wire::decode(&bytes) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(error = ?err, "dropping undecodable peer frame");
                        return;
                    }
                };
                if route(&to_handler, &to_executor, msg).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Drain the per-peer outbound queue onto its socket, redialing on failure.
async fn run_peer_writer(
    peer: PeerAddr,
    first: TcpStream,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = Some(first);
    loop {
        let socket = match stream.take() {
            Some(s) => s,
            None => match dial(&peer, &mut shutdown).await {
                Ok(s) => s,
                Err(_) => return,
            },
        };
        let mut framed = FramedWrite::new(socket, wire::codec());
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                msg = rx.recv() => {
                    let Some(msg) = msg else { return };
                    let frame = match wire::encode(&msg) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = ?err, "message encode failed");
                            continue;
                        }
                    };
                    if let Err(err) = framed.send(frame).await {
                        warn!(peer = peer.id, error = ?err, "peer write failed; reconnecting");
                        break;
                    }
                }
            }
        }
    }
}

/// Dial a peer until it answers or shutdown wins.
async fn dial(peer: &PeerAddr, shutdown: &mut watch::Receiver<bool>) -> anyhow::Result<TcpStream> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => anyhow::bail!("shutdown while dialing peer {}", peer.id),
            conn = TcpStream::connect(peer.addr) => {
                match conn {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        return Ok(stream);
                    }
                    Err(err) => {
                        debug!(peer = peer.id, error = ?err, "peer dial failed; retrying");
                        tokio::time::sleep(DIAL_RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}
