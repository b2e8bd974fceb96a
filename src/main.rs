use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use pgrr::{
    capture::{self, CaptureSummary},
    config::{BackendAddr, Config},
    logging,
    record_log::RecordLog,
    replay::{self, ReplayOptions, ReplaySummary},
    sessions::{self, SessionFilter},
};

#[derive(Debug, Parser)]
#[command(name = "pgrr", about = "Capture and replay PostgreSQL wire traffic")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the capture proxy until interrupted.
    Capture {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address clients connect to.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Backend database as `host:port`.
        #[arg(long)]
        backend: Option<BackendAddr>,
        /// Record log to append captured traffic to.
        #[arg(long = "log")]
        log_path: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Replay client traffic from a record log against a server.
    Replay {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Timeline multiplier; 2.0 replays twice as fast.
        #[arg(short, long)]
        speed: Option<f64>,
        #[arg(long)]
        capture_log: Option<PathBuf>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        replay_log: Option<PathBuf>,
        /// Only replay the captured connection from this client port.
        #[arg(long)]
        client_port: Option<u16>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
struct CaptureOverrides {
    listen: Option<SocketAddr>,
    backend: Option<BackendAddr>,
    log_path: Option<PathBuf>,
}

impl CaptureOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.capture.listen = listen;
        }
        if let Some(backend) = self.backend {
            config.capture.backend = backend;
        }
        if let Some(log_path) = self.log_path {
            config.capture.log_path = log_path;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ReplayOverrides {
    speed: Option<f64>,
    capture_log: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    replay_log: Option<PathBuf>,
    client_port: Option<u16>,
}

impl ReplayOverrides {
    fn apply(self, config: &mut Config) {
        let replay = &mut config.replay;
        if let Some(speed) = self.speed {
            replay.speed = speed;
        }
        if let Some(capture_log) = self.capture_log {
            replay.capture_log = capture_log;
        }
        if let Some(host) = self.host {
            replay.target_host = host;
        }
        if let Some(port) = self.port {
            replay.target_port = port;
        }
        if let Some(replay_log) = self.replay_log {
            replay.replay_log_path = replay_log;
        }
        if self.client_port.is_some() {
            replay.peer_port = self.client_port;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Capture {
            config,
            listen,
            backend,
            log_path,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            CaptureOverrides {
                listen,
                backend,
                log_path,
            }
            .apply(&mut config);
            logging::init(&config, log_level.as_deref())?;

            let proxy = capture::serve(&config).await?;
            eprintln!("{}", capture_startup_summary(&config, proxy.listen_addr));
            tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
            let summary = proxy.shutdown().await?;
            println!("{}", capture_summary_line(&summary));
        }
        Command::Replay {
            config,
            speed,
            capture_log,
            host,
            port,
            replay_log,
            client_port,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            ReplayOverrides {
                speed,
                capture_log,
                host,
                port,
                replay_log,
                client_port,
            }
            .apply(&mut config);
            let options = ReplayOptions::from_config(&config.replay)?;
            logging::init(&config, log_level.as_deref())?;

            let filter = SessionFilter {
                peer_port: config.replay.peer_port,
            };
            let loaded = sessions::load_sessions(&config.replay.capture_log, filter).await?;
            let replay_log = RecordLog::open(&config.replay.replay_log_path)?;
            let summary = replay::replay_until(&loaded, &options, &replay_log, interrupted()).await;
            println!("{}", replay_summary_line(&summary));
        }
    }

    Ok(())
}

async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}

fn capture_startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    let source = config
        .source_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());
    format!(
        "capture: listen={}, backend={}, log={}, config={}",
        listen_addr,
        config.capture.backend,
        config.capture.log_path.display(),
        source
    )
}

fn capture_summary_line(summary: &CaptureSummary) -> String {
    format!(
        "connections={} written={} skipped={} log={}",
        summary.connections_accepted,
        summary.records_written,
        summary.records_skipped,
        summary.log_path.display()
    )
}

fn replay_summary_line(summary: &ReplaySummary) -> String {
    format!("sent={} skipped={}", summary.sent, summary.skipped)
}
