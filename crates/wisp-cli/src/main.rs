mod config;
mod disk;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use wisp_transfer::{
    FileSource, MemoryRendezvous, ReceiveHandle, SessionEvent, SessionOutcome, generate_code, start_receive, start_send,
};

use crate::config::LoopbackConfig;
use crate::disk::{DirectorySink, DiskFile};

/// Sends the files named on the command line through a full sender/receiver
/// pair inside this process and writes them to `WISP_OUTPUT_DIR`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "wisp=info".into()),
        )
        .init();

    let paths: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        eprintln!("usage: wisp-loopback <file>...");
        std::process::exit(2);
    }
    let config = LoopbackConfig::from_env()?;

    let mut files: Vec<Arc<dyn FileSource>> = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = DiskFile::open(path)
            .await
            .with_context(|| format!("cannot send {}", path.display()))?;
        files.push(Arc::new(file));
    }
    let sink = DirectorySink::create(&config.output_dir)
        .await
        .with_context(|| format!("cannot write to {}", config.output_dir.display()))?;

    let hub = MemoryRendezvous::new();
    let (sender, mut sender_events) = start_send(files, Arc::new(hub.clone()), generate_code, config.send_options())?;
    let code = loop {
        match sender_events.recv().await {
            Some(SessionEvent::CodeIssued { code }) => break code,
            Some(event) => report("send", &event),
            None => bail!("sender ended before a code was issued"),
        }
    };
    info!("Pairing code {code}");

    let (receiver, receiver_events) =
        start_receive(&code, Arc::new(hub), Box::new(sink), config.receive_options())?;
    let sender_log = tokio::spawn(log_events("send", sender_events));

    let stopped = drive_receiver(&receiver, receiver_events, config.confirm).await?;
    if stopped {
        sender.stop();
    }

    let sent = sender.join().await;
    let received = receiver.join().await;
    let _ = sender_log.await;

    match (&sent, &received) {
        (SessionOutcome::Completed(summary), SessionOutcome::Completed(_)) => {
            info!(
                "Transferred {} file(s), {} bytes in {:?} ({} chunks, peak {} in flight)",
                summary.files, summary.bytes, summary.elapsed, summary.chunks, summary.peak_in_flight
            );
            Ok(())
        }
        _ => bail!("transfer did not complete: sender {sent:?}, receiver {received:?}"),
    }
}

/// Follow the receiver until it closes. Handles confirmation prompts and
/// Ctrl+C. Returns whether the user interrupted.
async fn drive_receiver(
    receiver: &ReceiveHandle,
    mut events: UnboundedReceiver<SessionEvent>,
    confirm: bool,
) -> anyhow::Result<bool> {
    let mut meter = ProgressMeter::default();
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::FileOffered { manifest, total_size, awaiting_confirmation: true, .. }) if confirm => {
                    for file in &manifest {
                        info!("Offered: {} ({} bytes, {})", file.name, file.size, file.mime);
                    }
                    if ask(&format!("Accept {} file(s), {total_size} bytes? [y/N] ", manifest.len())).await? {
                        receiver.accept();
                    } else {
                        receiver.stop();
                    }
                }
                Some(SessionEvent::Progress(progress)) => meter.update("recv", progress),
                Some(SessionEvent::Closed) | None => return Ok(interrupted),
                Some(event) => report("recv", &event),
            },
            _ = &mut ctrl_c, if !interrupted => {
                info!("Received Ctrl+C, stopping...");
                interrupted = true;
                receiver.stop();
            }
        }
    }
}

async fn log_events(role: &'static str, mut events: UnboundedReceiver<SessionEvent>) {
    let mut meter = ProgressMeter::default();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Progress(progress) => meter.update(role, progress),
            SessionEvent::Closed => break,
            other => report(role, &other),
        }
    }
}

fn report(role: &str, event: &SessionEvent) {
    match event {
        SessionEvent::CodeAttempt { code } => info!("[{role}] trying code {code}"),
        SessionEvent::CodeIssued { code } => info!("[{role}] code {code}"),
        SessionEvent::StateChanged(phase) => info!("[{role}] {phase:?}"),
        SessionEvent::FileOffered { file, total_size, .. } => {
            info!("[{role}] offered {} ({} bytes, {total_size} total)", file.name, file.size)
        }
        SessionEvent::FileStarted { index, file } => info!("[{role}] file {index}: {}", file.name),
        SessionEvent::FileFinished { index, bytes, .. } => info!("[{role}] file {index} done, {bytes} bytes"),
        SessionEvent::Progress(p) => info!("[{role}] {:.1}%", p.percent),
        SessionEvent::Completed(summary) => info!("[{role}] completed: {} bytes", summary.bytes),
        SessionEvent::Failed(err) if err.is_alarming() => warn!("[{role}] failed: {err}"),
        SessionEvent::Failed(err) => info!("[{role}] {err}"),
        SessionEvent::Cancelled { by } => info!("[{role}] cancelled by {by}"),
        SessionEvent::Disconnected => info!("[{role}] peer disconnected"),
        SessionEvent::Closed => info!("[{role}] closed"),
    }
}

/// Logs progress in ten-percent steps.
#[derive(Default)]
struct ProgressMeter {
    last_step: Option<u32>,
}

impl ProgressMeter {
    fn update(&mut self, role: &str, progress: wisp_types::Progress) {
        let step = (progress.percent / 10.0) as u32;
        if self.last_step != Some(step) {
            self.last_step = Some(step);
            info!(
                "[{role}] {:.0}% ({} / {} bytes)",
                progress.percent, progress.processed_bytes, progress.total_bytes
            );
        }
    }
}

async fn ask(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{prompt}");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
