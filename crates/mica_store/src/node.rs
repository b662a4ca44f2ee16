//! Node assembly: CLI arguments, configuration, and actor wiring.
//!
//! `run_node` builds the whole server out of the engine tasks (message
//! handler, executor, commit applier) and the node-side actors (peer mesh,
//! client listener, batcher, reply router, stats logger), then parks until
//! the shutdown watch flips.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use mica_rabia::rabia::{Config, Engine, Ledger, PendingQueue, StateMachine, Transport};
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::proxy::{self, ClientRegistry};
use crate::store::{MemStore, RespStore};
use crate::transport::{PeerAddr, TcpMesh};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageMode {
    /// In-memory map.
    Mem,
    /// External RESP2 (Redis-compatible) service.
    Resp,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mica-store", about = "Replicated key/value server")]
pub struct NodeArgs {
    /// This server's id; must be its index into --peers.
    #[arg(long)]
    pub node_id: u32,

    /// Peer-facing listen address.
    #[arg(long)]
    pub listen_peer: SocketAddr,

    /// Client-facing listen address.
    #[arg(long)]
    pub listen_client: SocketAddr,

    /// Comma-separated peer mesh addresses for every server, ordered by
    /// node id (including this one).
    #[arg(long)]
    pub peers: String,

    /// Tolerated crash faults (f < n/2).
    #[arg(long, default_value_t = 1)]
    pub n_faulty: usize,

    /// Client requests folded into one consensus batch.
    #[arg(long, default_value_t = 10)]
    pub proxy_batch_size: usize,

    /// Max time a partial proxy batch waits before submission.
    #[arg(long, default_value = "5ms")]
    pub proxy_batch_timeout: humantime::Duration,

    /// Commands per client request.
    #[arg(long, default_value_t = 1)]
    pub client_batch_size: usize,

    /// Fixed key length inside encoded commands.
    #[arg(long, default_value_t = 8)]
    pub key_len: usize,

    /// Fixed value length inside encoded commands.
    #[arg(long, default_value_t = 8)]
    pub value_len: usize,

    /// Ledger ring length; must stay well above peak in-flight slots.
    #[arg(long, default_value_t = 10_000)]
    pub ledger_len: u32,

    /// Maximum phases tracked per slot.
    #[arg(long, default_value_t = 10)]
    pub block_array_len: usize,

    /// Capacity of the bulk inter-actor channels.
    #[arg(long, default_value_t = 500_000)]
    pub channel_len: usize,

    /// Delay before the executor starts deciding (load priming).
    #[arg(long, default_value = "0s")]
    pub consensus_start_after: humantime::Duration,

    /// Storage backend.
    #[arg(long, value_enum, default_value_t = StorageMode::Mem)]
    pub storage: StorageMode,

    /// Address of the external RESP service (required with --storage resp).
    #[arg(long)]
    pub resp_addr: Option<SocketAddr>,

    /// Interval between periodic stats log lines.
    #[arg(long, default_value = "4s")]
    pub stats_interval: humantime::Duration,
}

/// Parse the ordered peer list; node ids are list positions.
pub fn parse_peers(raw: &str) -> anyhow::Result<Vec<PeerAddr>> {
    let mut peers = Vec::new();
    for (id, part) in raw.split(',').enumerate() {
        let addr: SocketAddr = part
            .trim()
            .parse()
            .with_context(|| format!("bad peer address {part:?}"))?;
        peers.push(PeerAddr {
            id: id as u32,
            addr,
        });
    }
    anyhow::ensure!(!peers.is_empty(), "peer list is empty");
    Ok(peers)
}

/// Build the engine configuration from the CLI arguments.
pub fn build_config(args: &NodeArgs, n_servers: usize) -> anyhow::Result<Config> {
    let mut cfg = Config::new(args.node_id, n_servers, args.n_faulty)?;
    cfg.ledger_len = args.ledger_len;
    cfg.block_array_len = args.block_array_len;
    cfg.proxy_batch_size = args.proxy_batch_size;
    cfg.proxy_batch_timeout = args.proxy_batch_timeout.into();
    cfg.client_batch_size = args.client_batch_size;
    cfg.key_len = args.key_len;
    cfg.value_len = args.value_len;
    cfg.channel_len = args.channel_len;
    cfg.consensus_start_after = args.consensus_start_after.into();
    anyhow::ensure!(cfg.ledger_len > 0, "ledger length must be positive");
    anyhow::ensure!(cfg.block_array_len > 0, "block array length must be positive");
    Ok(cfg)
}

/// Run one server until the shutdown watch flips.
pub async fn run_node(args: NodeArgs, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let peers = parse_peers(&args.peers)?;
    anyhow::ensure!(
        (args.node_id as usize) < peers.len(),
        "node id {} is not an index into the peer list",
        args.node_id
    );
    let cfg = build_config(&args, peers.len())?;
    info!(
        node = cfg.node_id,
        n = cfg.n_servers,
        f = cfg.n_faulty,
        "starting mica-store node"
    );

    let store: Arc<dyn StateMachine> = match args.storage {
        StorageMode::Mem => Arc::new(MemStore::new(cfg.key_len)),
        StorageMode::Resp => {
            let addr = args
                .resp_addr
                .context("--resp-addr is required with --storage resp")?;
            Arc::new(RespStore::connect(addr, cfg.key_len).await?)
        }
    };

    let (handler_tx, handler_rx) = mpsc::channel(cfg.channel_len);
    let (executor_tx, executor_rx) = mpsc::channel(cfg.channel_len);
    let mesh = TcpMesh::start(
        cfg.node_id,
        args.listen_peer,
        peers,
        handler_tx,
        executor_tx,
        cfg.channel_len,
        shutdown.clone(),
    )
    .await?;

    let ledger = Arc::new(Ledger::new(&cfg));
    let pending = Arc::new(PendingQueue::new());
    let engine = Arc::new(Engine::new(
        cfg.clone(),
        ledger,
        pending,
        mesh.clone() as Arc<dyn Transport>,
        shutdown.clone(),
    ));

    let registry = Arc::new(ClientRegistry::new());
    let (reply_tx, reply_rx) = mpsc::channel(cfg.channel_len);
    let (command_tx, command_rx) = mpsc::channel(cfg.channel_len);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(
        engine.clone().run_message_handler(handler_rx),
    ));
    tasks.push(tokio::spawn(engine.clone().run_executor(executor_rx)));
    tasks.push(tokio::spawn(engine.clone().run_applier(store, reply_tx)));
    tasks.push(tokio::spawn(proxy::run_batcher(
        cfg.clone(),
        command_rx,
        mesh as Arc<dyn Transport>,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(proxy::run_reply_router(
        registry.clone(),
        reply_rx,
        shutdown.clone(),
    )));
    {
        let registry = registry.clone();
        let listen_client = args.listen_client;
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) =
                proxy::run_client_listener(listen_client, registry, command_tx, shutdown).await
            {
                tracing::error!(error = ?err, "client listener failed");
            }
        }));
    }
    tasks.push(tokio::spawn(run_stats_logger(
        engine,
        registry,
        args.stats_interval.into(),
        shutdown.clone(),
    )));

    let mut shutdown = shutdown;
    let _ = shutdown.changed().await;
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    info!(node = args.node_id, "node stopped");
    Ok(())
}

/// Periodic stats line: decided slot mix and interval throughput.
async fn run_stats_logger(
    engine: Arc<Engine>,
    registry: Arc<ClientRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let client_batch_size = engine.config().client_batch_size as u64;
    let mut last_decided_batches = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let m = engine.metrics();
                let interval_batches = m.decided_client_batches - last_decided_batches;
                last_decided_batches = m.decided_client_batches;
                let throughput =
                    interval_batches as f64 * client_batch_size as f64 / interval.as_secs_f64();
                info!(
                    clients = registry.connected(),
                    normal_slots = m.normal_slots,
                    unmatched_slots = m.unmatched_slots,
                    null_slots = m.null_slots,
                    older_term_msgs = m.older_term_msgs,
                    throughput_cmd_per_sec = throughput,
                    "server stats"
                );
            }
        }
    }
}
