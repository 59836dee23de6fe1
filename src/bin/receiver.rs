//! Audio Receiver Application
//!
//! Receives the redundant UDP stream, recovers the sender's clock and plays
//! the result on an output device. Latency probes and delay assignments from
//! the sender are answered by the session itself.
//!
//! Usage: `receiver [--config <path>] [--device <id>] [--port <udp port>]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_sync::{
    audio::{device::list_devices, playback::AudioPlayback},
    config::AppConfig,
    monitor::{AppState, MonitorServer},
    Session,
};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

struct Args {
    config: Option<PathBuf>,
    device: Option<String>,
    port: Option<u16>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        device: None,
        port: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
            "--device" => args.device = Some(iter.next().context("--device needs an id")?),
            "--port" => {
                let port = iter.next().context("--port needs a number")?;
                args.port = Some(port.parse().with_context(|| format!("Invalid port: {}", port))?);
            }
            other => anyhow::bail!("Unknown argument: {}", other),
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

    tracing::info!("Starting LAN Audio Receiver");

    let args = parse_args()?;
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.network.udp_port = port;
    }

    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| d.is_output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let session = Arc::new(
        Session::open(
            config.session.clone(),
            config.network.clone(),
            config.sync.clone(),
        )
        .await?,
    );
    tracing::info!("Session {} listening on {}", session.id(), session.local_addr());

    let cancel = CancellationToken::new();

    if config.monitor.enabled {
        let state = Arc::new(AppState::new(session.clone(), "receiver"));
        MonitorServer::new(config.monitor.clone(), state).start_background(cancel.clone());
    }

    let stage = session
        .take_output()
        .context("Output stage already taken")?;
    let mut playback = match AudioPlayback::start(args.device.as_deref(), &config.session, stage) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!("No playback ({}); running for diagnostics only", e);
            None
        }
    };

    tracing::info!("Waiting for audio - press Ctrl+C to stop");

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = stats.tick() => {
                if let Some(p) = &playback {
                    if let Some(e) = p.check_errors() {
                        tracing::warn!("Playback error: {}", e);
                    }
                    tracing::debug!(
                        "Playback: {} callbacks, {:.2} ms device latency",
                        p.callbacks(),
                        p.output_latency_ms()
                    );
                }
                log_diagnostics(&session);
            }
        }
    }

    cancel.cancel();
    session.close().await;
    if let Some(p) = playback.as_mut() {
        p.stop();
    }
    Ok(())
}

fn log_diagnostics(session: &Session) {
    let d = session.diagnostics();
    tracing::info!(
        "Receiver stats: {} packets, {} blocks, {} duplicates, {} stale, {} invalid",
        d.transport.packets_received,
        d.transport.blocks_delivered,
        d.transport.duplicates,
        d.transport.stale,
        d.transport.invalid_packets
    );
    tracing::info!(
        "Clock: {:?}, level {:.2} packets, {:+.1} ppm, rate {:.2} Hz, stability {:.2}, delay {:.2} ms{}",
        d.buffer_health,
        d.smoothed_level,
        d.drift_ppm,
        d.current_sample_rate,
        d.stability_score,
        d.applied_delay_ms,
        if d.degraded { " [DEGRADED]" } else { "" }
    );
    tracing::info!(
        "Output: {} lost, {} late, {} underruns, {} overflow drops, {} resyncs",
        d.output.lost,
        d.output.late,
        d.output.underruns,
        d.output.overflow_drops,
        d.output.resyncs
    );
}
