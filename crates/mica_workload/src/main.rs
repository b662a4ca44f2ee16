//! Workload generator for exercising a MicaStore cluster.
//!
//! This binary drives GET/SET command batches through one server's proxy
//! with a pool of concurrent clients, either closed-loop (wait for each
//! reply) or open-loop (fixed rate with an outstanding-request window), and
//! prints throughput and latency percentiles at exit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use mica_store::client::ProxyClient;
use mica_store::store::{encode_read, encode_write};
use rand::distributions::Alphanumeric;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Each client waits for a reply before sending the next batch.
    Closed,
    /// Each client sends at a fixed rate, bounded by the outstanding window.
    Open,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "mica-workload")]
struct Args {
    /// Proxy address of the server to drive.
    #[arg(long)]
    proxy: SocketAddr,

    /// Number of concurrent clients (one connection each).
    #[arg(long, default_value_t = 10)]
    clients: usize,

    /// Total runtime.
    #[arg(long, default_value = "30s")]
    duration: humantime::Duration,

    #[arg(long, value_enum, default_value_t = Mode::Closed)]
    mode: Mode,

    /// Per-client send rate in batches/sec (open loop only).
    #[arg(long, default_value_t = 1000)]
    rate: u64,

    /// Unreplied batches allowed in flight before an open-loop client
    /// pauses.
    #[arg(long, default_value_t = 10_000)]
    window: u64,

    /// Commands per client batch.
    #[arg(long, default_value_t = 1)]
    client_batch_size: usize,

    /// Number of hot keys shared by the workload.
    #[arg(long, default_value_t = 1000)]
    keys: usize,

    #[arg(long, default_value_t = 8)]
    key_len: usize,

    #[arg(long, default_value_t = 8)]
    value_len: usize,

    /// Percent of commands that are writes.
    #[arg(long, default_value_t = 50)]
    write_pct: u8,

    /// Random seed (0 picks one from the clock).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-batch reply timeout (closed loop).
    #[arg(long, default_value = "10s")]
    op_timeout: humantime::Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = Args::parse();
    if args.seed == 0 {
        args.seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64
            | 1;
    }
    anyhow::ensure!(args.write_pct <= 100, "--write-pct must be 0..=100");
    tracing::info!(
        mode = ?args.mode,
        clients = args.clients,
        seed = args.seed,
        "starting workload"
    );

    let keys = Arc::new(generate_keys(&args));
    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let started = Instant::now();
    let mut handles = Vec::new();
    for client_idx in 0..args.clients {
        let args = args.clone();
        let keys = keys.clone();
        let sent = sent.clone();
        let received = received.clone();
        handles.push(tokio::spawn(async move {
            match args.mode {
                Mode::Closed => run_closed_loop(args, client_idx, keys, received).await,
                Mode::Open => run_open_loop(args, client_idx, keys, sent, received).await,
            }
        }));
    }

    let mut latencies: Vec<Duration> = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(mut client_latencies)) => latencies.append(&mut client_latencies),
            Ok(Err(err)) => tracing::warn!(error = ?err, "client exited with error"),
            Err(err) => tracing::warn!(error = ?err, "client task panicked"),
        }
    }

    let elapsed = started.elapsed();
    let replied = received.load(Ordering::Relaxed);
    let commands = replied * args.client_batch_size as u64;
    tracing::info!(
        replied_batches = replied,
        commands,
        elapsed = ?elapsed,
        throughput_cmd_per_sec = commands as f64 / elapsed.as_secs_f64(),
        "workload finished"
    );
    if !latencies.is_empty() {
        latencies.sort_unstable();
        tracing::info!(
            p50 = ?percentile(&latencies, 50),
            p95 = ?percentile(&latencies, 95),
            p99 = ?percentile(&latencies, 99),
            max = ?latencies[latencies.len() - 1],
            "batch latency"
        );
    }
    Ok(())
}

fn generate_keys(args: &Args) -> Vec<String> {
    let mut rng = SmallRng::seed_from_u64(args.seed);
    (0..args.keys.max(1))
        .map(|_| random_string(&mut rng, args.key_len))
        .collect()
}

fn random_string(rng: &mut SmallRng, len: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn make_batch(args: &Args, rng: &mut SmallRng, keys: &[String]) -> Vec<String> {
    (0..args.client_batch_size)
        .map(|_| {
            let key = &keys[rng.gen_range(0..keys.len())];
            if rng.gen_range(0..100u8) < args.write_pct {
                encode_write(key, &random_string(rng, args.value_len))
            } else {
                encode_read(key)
            }
        })
        .collect()
}

async fn run_closed_loop(
    args: Args,
    client_idx: usize,
    keys: Arc<Vec<String>>,
    received: Arc<AtomicU64>,
) -> anyhow::Result<Vec<Duration>> {
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(client_idx as u64 + 1));
    let mut client = ProxyClient::connect(args.proxy, client_idx as u32)
        .await
        .context("connecting workload client")?;

    let duration: Duration = args.duration.into();
    let deadline = Instant::now() + duration;
    let mut latencies = Vec::new();
    while Instant::now() < deadline {
        let batch = make_batch(&args, &mut rng, &keys);
        let sent_at = Instant::now();
        client.call(batch, args.op_timeout.into()).await?;
        latencies.push(sent_at.elapsed());
        received.fetch_add(1, Ordering::Relaxed);
    }
    Ok(latencies)
}

async fn run_open_loop(
    args: Args,
    client_idx: usize,
    keys: Arc<Vec<String>>,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
) -> anyhow::Result<Vec<Duration>> {
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(client_idx as u64 + 1));
    let client = ProxyClient::connect(args.proxy, client_idx as u32)
        .await
        .context("connecting workload client")?;
    let (mut tx, mut rx) = client.into_split();

    let client_received = Arc::new(AtomicU64::new(0));
    let reader_received = client_received.clone();
    let reader_total = received.clone();
    let reader = tokio::spawn(async move {
        while rx.recv().await.is_ok() {
            reader_received.fetch_add(1, Ordering::Relaxed);
            reader_total.fetch_add(1, Ordering::Relaxed);
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(
        1.0 / args.rate.max(1) as f64,
    ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Burst);

    let duration: Duration = args.duration.into();
    let deadline = Instant::now() + duration;
    let window = args.window * args.client_batch_size as u64;
    let mut client_sent = 0u64;
    while Instant::now() < deadline {
        ticker.tick().await;
        // Self-throttle: cap unreplied batches in flight, then back off.
        if client_sent - client_received.load(Ordering::Relaxed) >= window {
            tokio::time::sleep(Duration::from_millis(500)).await;
            continue;
        }
        tx.send(make_batch(&args, &mut rng, &keys)).await?;
        client_sent += 1;
        sent.fetch_add(1, Ordering::Relaxed);
    }

    // Give stragglers a moment before tearing the connection down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    reader.abort();
    Ok(Vec::new())
}

fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    let idx = (sorted.len() * pct).div_ceil(100);
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}
