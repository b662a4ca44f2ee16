//! Client-side API for the proxy protocol.
//!
//! Used by the workload generator and the integration tests. A client owns
//! one framed connection to one server's proxy; replies arrive only from
//! that server, even though the batch is decided cluster-wide.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mica_rabia::rabia::{ClientCommand, ClientId, ClientReply};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::wire;

pub struct ProxyClient {
    client_id: ClientId,
    next_seq: u32,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl ProxyClient {
    pub async fn connect(addr: SocketAddr, client_id: ClientId) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to proxy at {addr}"))?;
        socket.set_nodelay(true).ok();
        Ok(Self {
            client_id,
            next_seq: 0,
            framed: Framed::new(socket, wire::codec()),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Submit one command batch; returns the client sequence it was sent
    /// under.
    pub async fn send(&mut self, commands: Vec<String>) -> anyhow::Result<u32> {
        let client_seq = self.next_seq;
        self.next_seq += 1;
        let cmd = ClientCommand {
            client_id: self.client_id,
            client_seq,
            commands,
        };
        self.framed
            .send(wire::encode(&cmd)?)
            .await
            .context("proxy write")?;
        Ok(client_seq)
    }

    pub async fn recv(&mut self) -> anyhow::Result<ClientReply> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("proxy closed the connection"))?
            .context("proxy read")?;
        wire::decode(&frame)
    }

    /// Split into independent send/receive halves for pipelined use.
    pub fn into_split(self) -> (ProxyClientSender, ProxyClientReceiver) {
        let (sink, stream) = self.framed.split();
        (
            ProxyClientSender {
                client_id: self.client_id,
                next_seq: self.next_seq,
                sink,
            },
            ProxyClientReceiver { stream },
        )
    }

    /// Closed-loop submit: send one batch and wait for its reply.
    pub async fn call(
        &mut self,
        commands: Vec<String>,
        timeout: Duration,
    ) -> anyhow::Result<ClientReply> {
        let client_seq = self.send(commands).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| anyhow::anyhow!("timed out waiting for client seq {client_seq}"))?;
            let reply = tokio::time::timeout(remaining, self.recv())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for client seq {client_seq}"))??;
            if reply.client_seq == client_seq {
                return Ok(reply);
            }
        }
    }
}

/// Send half of a split client.
pub struct ProxyClientSender {
    client_id: ClientId,
    next_seq: u32,
    sink: SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>,
}

impl ProxyClientSender {
    pub async fn send(&mut self, commands: Vec<String>) -> anyhow::Result<u32> {
        let client_seq = self.next_seq;
        self.next_seq += 1;
        let cmd = ClientCommand {
            client_id: self.client_id,
            client_seq,
            commands,
        };
        self.sink
            .send(wire::encode(&cmd)?)
            .await
            .context("proxy write")?;
        Ok(client_seq)
    }
}

/// Receive half of a split client.
pub struct ProxyClientReceiver {
    stream: SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl ProxyClientReceiver {
    pub async fn recv(&mut self) -> anyhow::Result<ClientReply> {
        let frame = self
            .stream
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("proxy closed the connection"))?
            .context("proxy read")?;
        wire::decode(&frame)
    }
}
