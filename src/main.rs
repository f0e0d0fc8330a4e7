use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mayadrop_rs::agent::{expand_paths, Agent, AgentOptions};
use mayadrop_rs::config::Config;
use mayadrop_rs::console::ConsoleObserver;
use mayadrop_rs::signaling::SignalingServer;
use mayadrop_rs::sink::FileSinkFactory;

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3000";

#[derive(Parser, Debug)]
#[command(name = "mayadrop-rs", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct PeerArgs {
    /// Signaling server URL (ws://, wss://, http:// or https://)
    #[arg(long = "server")]
    server: Option<String>,
    /// Display name
    #[arg(long)]
    name: Option<String>,
    /// Room to join
    #[arg(long)]
    room: Option<String>,
    /// Shared passphrase for end-to-end encryption
    #[arg(long)]
    passphrase: Option<String>,
    /// Never try a direct channel
    #[arg(long = "relay-only")]
    relay_only: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the signaling server
    Serve {
        /// Listen address; defaults to $HOST:$PORT or 0.0.0.0:3000
        #[arg(long)]
        addr: Option<String>,
    },
    /// Send files or directories to a peer
    Send {
        #[command(flatten)]
        peer: PeerArgs,
        /// Peer id or display name
        #[arg(long)]
        to: String,
        /// Seconds to wait for the peer to show up
        #[arg(long, default_value_t = 30)]
        wait: u64,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Stay online and receive files
    Receive {
        #[command(flatten)]
        peer: PeerArgs,
        /// Where received files go
        #[arg(long = "download-dir")]
        download_dir: Option<PathBuf>,
        /// Accept every offer without asking
        #[arg(short = 'y', long = "yes")]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr } => {
            mayadrop_rs::logging::init_stdout();
            run_server(addr.unwrap_or_else(default_listen_addr)).await?;
        }
        Commands::Send {
            peer,
            to,
            wait,
            paths,
        } => {
            let cfg = load_config(cli.config.as_ref(), &peer)?;
            init_logging(&cfg)?;
            run_send(cfg, &to, Duration::from_secs(wait), &paths).await?;
        }
        Commands::Receive {
            peer,
            download_dir,
            yes,
        } => {
            let mut cfg = load_config(cli.config.as_ref(), &peer)?;
            if let Some(dir) = download_dir {
                cfg.download_dir = dir;
            }
            if yes {
                cfg.auto_accept = true;
            }
            cfg.finish()?;
            init_logging(&cfg)?;
            run_receive(cfg).await?;
        }
    }

    Ok(())
}

fn default_listen_addr() -> String {
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    format!("{host}:{port}")
}

fn load_config(path: Option<&PathBuf>, args: &PeerArgs) -> Result<Config> {
    let mut cfg = match path {
        Some(path) => {
            let mut cfg = Config::load(path)?;
            // Before the overrides below, so flags never end up in the file.
            if let Err(err) = cfg.persist_identity() {
                eprintln!("warning: could not save peer id to {}: {err:#}", path.display());
            }
            cfg
        }
        None => Config::default_for(args.server.as_deref().unwrap_or(DEFAULT_SERVER_URL))?,
    };
    if let Some(server) = &args.server {
        cfg.server_url = server.clone();
    }
    if let Some(name) = &args.name {
        cfg.name = name.clone();
    }
    if let Some(room) = &args.room {
        cfg.room = room.clone();
    }
    if let Some(pass) = &args.passphrase {
        cfg.passphrase = Some(pass.clone());
    }
    if args.relay_only {
        cfg.direct_enabled = false;
    }
    cfg.finish()?;
    Ok(cfg)
}

fn init_logging(cfg: &Config) -> Result<()> {
    match &cfg.log_file {
        Some(path) => mayadrop_rs::logging::init_log_file(path),
        None => {
            mayadrop_rs::logging::init_stdout();
            Ok(())
        }
    }
}

async fn run_server(addr: String) -> Result<()> {
    let server = SignalingServer::start(&addr).await?;
    mayadrop_rs::logging::info_kv(
        "signaling server listening",
        &[("addr", &server.bound_addr().to_string()), ("ws", &server.ws_url())],
    );
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    mayadrop_rs::logging::info("shutting down");
    server.stop();
    Ok(())
}

async fn connect_agent(cfg: &Config) -> Result<Agent> {
    let observer = Arc::new(ConsoleObserver::new(cfg.auto_accept));
    let sinks = Arc::new(FileSinkFactory::new(&cfg.download_dir));
    let agent = Agent::connect(AgentOptions::from_config(cfg), observer, sinks).await?;
    mayadrop_rs::logging::info_kv(
        "connected",
        &[("id", agent.id()), ("name", &cfg.name), ("room", &cfg.room)],
    );
    Ok(agent)
}

async fn run_send(cfg: Config, to: &str, wait: Duration, paths: &[PathBuf]) -> Result<()> {
    let files = expand_paths(paths)?;
    if files.is_empty() {
        anyhow::bail!("no files to send");
    }
    let agent = connect_agent(&cfg).await?;
    let peer = agent
        .wait_for_peer(to, wait)
        .await
        .with_context(|| format!("peer '{to}' not found in room {}", cfg.room))?;
    let res = agent.send_files(&peer.id, &files).await;
    agent.shutdown();
    match res {
        Ok(summaries) => {
            let total: u64 = summaries.iter().map(|s| s.bytes_transferred).sum();
            mayadrop_rs::logging::info_kv(
                "all files sent",
                &[("files", &summaries.len().to_string()), ("bytes", &total.to_string())],
            );
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("send to {}", peer.name)),
    }
}

async fn run_receive(cfg: Config) -> Result<()> {
    let agent = connect_agent(&cfg).await?;
    mayadrop_rs::logging::info_kv(
        "waiting for files",
        &[("download_dir", &cfg.download_dir.display().to_string())],
    );
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("wait for ctrl-c")?;
            agent.shutdown();
        }
        _ = agent.closed() => {
            anyhow::bail!("signaling connection closed");
        }
    }
    Ok(())
}
