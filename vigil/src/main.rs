//! vigild - monitoring scheduler daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use vigil::checker::ProcessChecker;
use vigil::clock::SystemClock;
use vigil::config::EngineConfig;
use vigil::external::process_external_command;
use vigil::{Engine, EventLoop, LoopHandle};

/// Vigil - host and service monitoring scheduler
#[derive(Parser, Debug)]
#[command(name = "vigild", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "VIGIL_CONFIG", default_value = "/grimoire/system/vigil.yaml")]
    config: PathBuf,

    /// External command pipe, overrides the configured one
    #[arg(long)]
    command_file: Option<PathBuf>,

    /// Check the configuration and exit
    #[arg(long)]
    verify_config: bool,

    /// Debug mode
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let log_level = if args.debug { "debug".to_string() } else { config.logging.level.clone() };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .init();

    if args.verify_config {
        config.validate().context("configuration is invalid")?;
        info!(
            "Configuration OK: {} hosts, {} services",
            config.hosts.len(),
            config.services.len()
        );
        return Ok(());
    }

    info!("Vigil v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(path) = args.command_file {
        config.commands.command_file = Some(path);
    }
    let command_file = config
        .commands
        .command_file
        .clone()
        .filter(|_| config.commands.check_external_commands);

    let checker = ProcessChecker::new(tokio::runtime::Handle::current());
    let mut engine = Engine::new(config, Arc::new(SystemClock), Box::new(checker))
        .context("failed to build engine")?;
    engine.start();

    let mut event_loop = EventLoop::new(engine, Some(args.config.clone()));
    let handle = event_loop.handle();
    let engine = event_loop.engine();

    tokio::spawn(signal_loop(handle.clone()));
    if let Some(path) = command_file {
        tokio::spawn(command_file_loop(path, handle.clone()));
    }

    info!("Vigil ready");
    let outcome = tokio::task::spawn_blocking(move || event_loop.run())
        .await
        .context("event loop panicked")?;

    if let Err(e) = engine.lock().save_retention() {
        error!("Failed to save retention data: {}", e);
    }
    outcome.context("event loop failed")?;

    info!("Vigil stopped");
    Ok(())
}

/// SIGTERM and SIGINT stop the loop, SIGHUP reloads the configuration
async fn signal_loop(handle: LoopHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    );
    let (mut sigterm, mut sigint, mut sighup) = match signals {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        _ => {
            error!("Failed to install signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating shutdown");
                handle.request_shutdown();
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating shutdown");
                handle.request_shutdown();
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                handle.request_reload();
            }
        }
    }
}

/// Read command lines from a named pipe and queue them for the loop
async fn command_file_loop(path: PathBuf, handle: LoopHandle) {
    if !is_fifo(&path) {
        warn!("Command file {} is not a named pipe, ignoring it", path.display());
        return;
    }
    info!("Reading external commands from {}", path.display());

    while !handle.is_shutdown() {
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to open command file {}: {}", path.display(), e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let mut lines = BufReader::new(file).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => handle.submit(move |engine: &mut Engine| {
                    process_external_command(engine, &line);
                }),
                // writer closed the pipe
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read command file: {}", e);
                    break;
                }
            }
        }
    }
}

fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}
