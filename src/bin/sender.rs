//! Audio Sender Application
//!
//! Captures audio (or a test tone) and streams it to every configured peer
//! over UDP, re-aligning the peers' playout delay periodically.
//!
//! Usage: `sender [--config <path>] [--device <id>] [--tone] [peer:port ...]`

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_sync::{
    audio::{capture::AudioCapture, capture::TestTone, device::list_devices},
    config::AppConfig,
    monitor::{AppState, MonitorServer},
    sync::Ticker,
    Session,
};

/// Capture blocks buffered between the device thread and the network loop
const CAPTURE_QUEUE_BLOCKS: usize = 32;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

struct Args {
    config: Option<PathBuf>,
    device: Option<String>,
    tone: bool,
    peers: Vec<SocketAddr>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        device: None,
        tone: false,
        peers: Vec::new(),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
            "--device" => args.device = Some(iter.next().context("--device needs an id")?),
            "--tone" => args.tone = true,
            other => args
                .peers
                .push(other.parse().with_context(|| format!("Invalid peer address: {}", other))?),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Sender");

    let args = parse_args()?;
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if !args.peers.is_empty() {
        config.network.peers = args.peers.clone();
    }
    if config.network.peers.is_empty() {
        anyhow::bail!("No peers configured; pass at least one receiver address");
    }

    if !args.tone {
        println!("\n=== Available Input Devices ===");
        for device in list_devices().iter().filter(|d| d.is_input) {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    ID: {}", device.id);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        println!();
    }

    let session = Arc::new(
        Session::open(
            config.session.clone(),
            config.network.clone(),
            config.sync.clone(),
        )
        .await?,
    );
    tracing::info!(
        "Session {} on {} streaming to {:?}",
        session.id(),
        session.local_addr(),
        session.peers()
    );

    let cancel = CancellationToken::new();

    if config.monitor.enabled {
        let state = Arc::new(AppState::new(session.clone(), "sender"));
        MonitorServer::new(config.monitor.clone(), state).start_background(cancel.clone());
    }

    let sync_interval = Duration::from_secs(config.sync.reevaluate_interval_secs.max(1));
    let sync_task = tokio::spawn(run_sync(session.clone(), sync_interval, cancel.clone()));

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    let result = if args.tone {
        let tone = TestTone::new(440.0, 0.25, &config.session);
        run_tone(&session, tone, &cancel).await
    } else {
        let capture = AudioCapture::new(args.device.as_deref(), &config.session, CAPTURE_QUEUE_BLOCKS);
        run_capture(&session, capture, &cancel).await
    };

    cancel.cancel();
    let _ = sync_task.await;
    session.close().await;
    result
}

/// Stream a generated tone paced by the block duration
async fn run_tone(session: &Session, mut tone: TestTone, cancel: &CancellationToken) -> Result<()> {
    tracing::info!("Streaming test tone - press Ctrl+C to stop");

    let mut pace = tokio::time::interval(tone.block_duration());
    let mut last_stats = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = pace.tick() => {
                if let Err(e) = session.send_block(&tone.next_block()).await {
                    tracing::warn!("Failed to send block: {}", e);
                }
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            log_stats(session);
        }
    }
    Ok(())
}

/// Stream blocks from the capture device
async fn run_capture(
    session: &Session,
    mut capture: AudioCapture,
    cancel: &CancellationToken,
) -> Result<()> {
    capture.start()?;
    let blocks = capture.blocks();
    tracing::info!("Audio capture started - press Ctrl+C to stop");

    let mut last_stats = Instant::now();

    while !cancel.is_cancelled() {
        while let Ok(block) = blocks.try_recv() {
            if let Err(e) = session.send_block(&block).await {
                tracing::warn!("Failed to send block: {}", e);
            }
        }

        if let Some(e) = capture.check_errors() {
            tracing::warn!("Capture error: {}", e);
        }
        if !capture.is_running() {
            anyhow::bail!("Capture stream stopped");
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let (captured, dropped) = capture.counts();
            tracing::info!("Capture: {} blocks, {} dropped", captured, dropped);
            log_stats(session);
        }

        // Small sleep to prevent busy-waiting
        tokio::time::sleep(Duration::from_micros(500)).await;
    }

    capture.stop();
    Ok(())
}

/// Probe peers and redistribute delays once per interval
async fn run_sync(session: Arc<Session>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = Ticker::new(interval);

    loop {
        let wait = ticker.remaining(Instant::now());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if !ticker.due(Instant::now()) {
            continue;
        }

        match session.synchronize().await {
            Ok(Some(report)) => tracing::info!(
                "Alignment: target {:.2} ms, spread {:.2} ms{}",
                report.target_latency_ms,
                report.spread_ms,
                if report.within_tolerance { "" } else { " (out of tolerance)" }
            ),
            Ok(None) => tracing::debug!("No peers to align"),
            Err(e) => {
                tracing::warn!("Synchronization failed: {}", e);
                break;
            }
        }
    }
}

fn log_stats(session: &Session) {
    let stats = session.diagnostics().sender;
    tracing::info!(
        "Stats: {} blocks, {} packets sent, {:.1} KB sent, {} send errors",
        stats.blocks_sent,
        stats.packets_sent,
        stats.bytes_sent as f64 / 1024.0,
        stats.send_errors
    );
}
