//! framecast: live frame recorder speaking JSON lines on stdin/stdout.
//!
//! Pipeline:
//!   stdin (client events) → EventRouter → one task per session → Dispatcher
//!     → SessionRegistry → one writer thread per session
//!   stdout ← reply channel ← server events (acks, drops, errors, "Video saved")
//!
//! Usage:
//!   framecast [--config recorder.json]
//!   EOF on stdin or Ctrl+C finalizes every open session.
//!
//! Logs go to stderr (`RUST_LOG`, default `info`) so stdout stays protocol-only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use framecast::{AckPolicy, Dispatcher, EventRouter, RecorderConfig, ServerEvent, SessionRegistry};

/// Replies waiting for stdout.
const REPLY_BUFFER: usize = 256;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_args()?;
    let config = RecorderConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    let ack = AckPolicy::every(config.ack_interval);
    let registry = SessionRegistry::new(config.clone()).with_context(|| {
        format!("Failed to create output directory {}", config.output_dir.display())
    })?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), ack));

    info!(
        output_dir = %config.output_dir.display(),
        encoder = ?config.encoder,
        drain_timeout_ms = config.drain_timeout_ms,
        "framecast ready; reading events from stdin"
    );

    let (replies, outbox) = mpsc::channel(REPLY_BUFFER);
    let stdout_writer = tokio::spawn(write_events(outbox));
    let mut router = EventRouter::new(dispatcher.clone(), replies.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                router.route_line(&line).await;
            }
            _ = &mut interrupted => {
                info!("Interrupted, stopping");
                break;
            }
        }
    }

    // ── Shutdown: let session tasks finish, then drain whatever is still recording ──
    router.close().await;
    for (session, recording) in dispatcher.shutdown().await {
        let event = ServerEvent::ServerMessage {
            session: session.to_string(),
            message: format!("Video saved: {}", recording.path.display()),
        };
        if replies.send(event).await.is_err() {
            break;
        }
    }
    drop(replies);
    stdout_writer.await.context("stdout writer panicked")??;
    info!("framecast stopped");
    Ok(())
}

fn parse_args() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            other => bail!("Unknown argument {other:?} (usage: framecast [--config <path>])"),
        }
    }
    Ok(config)
}

/// Sole owner of stdout, so replies from concurrent sessions never interleave.
async fn write_events(mut outbox: mpsc::Receiver<ServerEvent>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = outbox.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        if let Err(e) = stdout.write_all(&line).await {
            error!("Failed to write to stdout: {e}");
            return Err(e.into());
        }
        stdout.flush().await?;
    }
    Ok(())
}
