//! quakefeed: Earthquake feed ingestion binary
//!
//! Keeps the P2P and Wolfx websocket feeds connected, serves health and
//! replay endpoints, and relaunches itself after the host kills it.

mod host;
mod network;
mod sink;

use clap::{Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quakefeed_connector_lib::{
    fire_scheduled_relaunch, run_server, FileStateStore, Keepalive, LivenessProbe, MessageCache,
    NotificationSink, PidFile, PidFileProbe, ServerState, StateStore, Supervisor,
    SupervisorConfig, WsTransport,
};
use quakefeed_metadata::{Environment, FeedList};

use crate::host::{ProcessLauncher, ProcessRelaunchTimer, SelfCommand};
use crate::sink::{FileSink, LogSink};

#[derive(Parser, Debug)]
#[command(name = "quakefeed")]
#[command(about = "Resilient earthquake feed ingestion")]
struct Args {
    /// Path to feed list file (built-in P2P and Wolfx feeds when omitted)
    #[arg(long, env = "QUAKEFEED_FEEDS", global = true)]
    feeds: Option<PathBuf>,

    /// Path to environment configuration file
    #[arg(long, env = "QUAKEFEED_ENV", global = true)]
    env: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run ingestion until stopped
    Run {
        /// HTTP bind address (overrides the environment file)
        #[arg(long)]
        health_addr: Option<String>,

        #[arg(long, value_enum, default_value = "log")]
        sink: SinkKind,

        /// Base directory for the file sink
        #[arg(long, default_value = "data")]
        output_dir: PathBuf,

        /// Skip the network reachability monitor
        #[arg(long)]
        no_network_monitor: bool,
    },
    /// Ask a running instance to stop for good
    Stop,
    /// Relaunch ingestion whenever it is found dead
    Keepalive {
        /// Check once and exit
        #[arg(long)]
        once: bool,
    },
    /// One-shot relaunch helper (spawned at teardown)
    Relaunch {
        #[arg(long)]
        after_ms: u64,

        #[arg(long)]
        token: u64,
    },
    /// Print buffered messages of a running instance
    Replay {
        /// Pop one feed's messages instead of listing everything
        #[arg(long)]
        feed: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SinkKind {
    Log,
    File,
}

impl Args {
    /// Config flags forwarded to helper processes
    fn forwarded_args(&self) -> Vec<OsString> {
        let mut forwarded = Vec::new();
        if let Some(ref feeds) = self.feeds {
            forwarded.push(OsString::from("--feeds"));
            forwarded.push(feeds.clone().into_os_string());
        }
        if let Some(ref env) = self.env {
            forwarded.push(OsString::from("--env"));
            forwarded.push(env.clone().into_os_string());
        }
        forwarded
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let feeds = match args.feeds {
        Some(ref path) => FeedList::load(path)?,
        None => FeedList::default(),
    };
    feeds.validate()?;

    let env_config = match args.env {
        Some(ref path) => Environment::load(path)?,
        None => Environment::default(),
    };
    let (env_config, clamped) = env_config.validated();
    if clamped {
        warn!("Environment periods out of range, clamped to minimums");
    }
    info!(env = %env_config.name, feeds = feeds.feeds.len(), "Loaded configuration");

    let command = SelfCommand::current(args.forwarded_args())?;

    match args.command {
        Command::Run {
            health_addr,
            sink,
            output_dir,
            no_network_monitor,
        } => {
            let health_addr: SocketAddr = health_addr
                .unwrap_or_else(|| env_config.health_addr.clone())
                .parse()?;
            let sink: Arc<dyn NotificationSink> = match sink {
                SinkKind::Log => Arc::new(LogSink),
                SinkKind::File => Arc::new(FileSink::new(output_dir)),
            };
            run(&feeds, &env_config, command, sink, health_addr, !no_network_monitor).await
        }
        Command::Stop => stop(&env_config).await,
        Command::Keepalive { once } => keepalive(&env_config, command, once).await,
        Command::Relaunch { after_ms, token } => {
            let exit_wait = shutdown_bound(&feeds);
            relaunch(&env_config, command, Duration::from_millis(after_ms), token, exit_wait).await
        }
        Command::Replay { feed } => replay(&env_config, feed).await,
    }
}

async fn run(
    feeds: &FeedList,
    env_config: &Environment,
    command: SelfCommand,
    sink: Arc<dyn NotificationSink>,
    health_addr: SocketAddr,
    network_monitor: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pid_file = PidFile::new(env_config.state.pid_file());
    if PidFileProbe::new(pid_file.clone()).is_process_alive() {
        warn!(pid = ?pid_file.read(), "Ingestion already running, exiting");
        return Ok(());
    }
    pid_file.write_current()?;

    let state: Arc<dyn StateStore> = Arc::new(FileStateStore::new(env_config.state.state_file()));
    let timer = ProcessRelaunchTimer::new(
        command,
        Arc::clone(&state),
        env_config.relaunch.allow_exact,
        env_config.relaunch.inexact_slack(),
    );

    let supervisor = Arc::new(Supervisor::new(
        SupervisorConfig::from_environment(feeds, env_config),
        Arc::new(WsTransport::new()),
        Arc::new(MessageCache::new()),
        sink,
        state,
        Arc::new(timer),
    ));

    // Set up signal handlers before anything is started
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let (monitor_tx, monitor_rx) = watch::channel(false);
    let mut monitor = None;
    let network_events = if network_monitor {
        let (events_tx, events_rx) = mpsc::channel(8);
        monitor = Some(network::spawn_monitor(
            env_config.network.probe_addr.clone(),
            Duration::from_secs(env_config.network.poll_secs),
            events_tx,
            monitor_rx,
        ));
        Some(events_rx)
    } else {
        None
    };

    supervisor.activate(network_events).await;

    let stopped = Arc::new(Notify::new());
    let server_state = ServerState::new(Arc::clone(&supervisor), Arc::clone(&stopped));
    let server = tokio::spawn(async move {
        if let Err(e) = run_server(health_addr, server_state).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!(addr = %health_addr, "Ingestion running, waiting for SIGTERM/SIGINT or a stop request");

    tokio::select! {
        _ = sigterm.recv() => {
            // Terminated by the host: come back unless a stop was requested
            let outcome = supervisor.on_teardown_signal();
            info!(?outcome, "SIGTERM received, shutting down");
            supervisor.deactivate().await;
        }
        _ = sigint.recv() => {
            info!("SIGINT received, stopping intentionally");
            supervisor.stop_intentionally().await;
        }
        _ = stopped.notified() => {
            info!("Stopped by request");
        }
    }

    let _ = monitor_tx.send(true);
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    server.abort();
    pid_file.remove();
    info!("Shutdown complete");
    Ok(())
}

fn base_url(env_config: &Environment) -> String {
    format!("http://{}", env_config.health_addr)
}

async fn stop(env_config: &Environment) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/stop", base_url(env_config));
    let body: serde_json::Value = reqwest::Client::new()
        .post(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    info!(status = %body["status"], "Stop request accepted");
    Ok(())
}

async fn keepalive(
    env_config: &Environment,
    command: SelfCommand,
    once: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let keepalive = Keepalive::new(
        env_config.relaunch.keepalive_interval(),
        Arc::new(FileStateStore::new(env_config.state.state_file())),
        Arc::new(PidFileProbe::new(PidFile::new(env_config.state.pid_file()))),
        Arc::new(ProcessLauncher::new(command)),
    );

    if once {
        let outcome = keepalive.check()?;
        info!(?outcome, "Keepalive check complete");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx.send(true).ok();
    });
    keepalive.run(shutdown_rx).await;
    Ok(())
}

/// Longest a terminated ingestion process should take to exit: feeds are
/// closed one after another, each bounded by its write timeout
fn shutdown_bound(feeds: &FeedList) -> Duration {
    feeds.active().map(|feed| feed.timeouts.write()).sum::<Duration>() * 2
}

async fn relaunch(
    env_config: &Environment,
    command: SelfCommand,
    after: Duration,
    token: u64,
    exit_wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    tokio::time::sleep(after).await;

    let state = FileStateStore::new(env_config.state.state_file());
    let probe = PidFileProbe::new(PidFile::new(env_config.state.pid_file()));
    let launcher = ProcessLauncher::new(command);
    let outcome = fire_scheduled_relaunch(&state, &probe, &launcher, token, exit_wait).await?;
    info!(token, ?outcome, "Scheduled relaunch fired");
    Ok(())
}

async fn replay(
    env_config: &Environment,
    feed: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let request = match feed {
        Some(ref feed) => client.post(format!("{}/replay/{}/pop", base_url(env_config), feed)),
        None => client.get(format!("{}/replay", base_url(env_config))),
    };
    let body: serde_json::Value = request.send().await?.error_for_status()?.json().await?;

    if let Some(messages) = body["messages"].as_array() {
        for message in messages {
            if let Some(text) = message.as_str() {
                println!("{}", text);
            }
        }
    }
    Ok(())
}
