//! NetTester CLI
//!
//! Minimal datagram client for exercising the NetTester protocol.

mod config;

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use nettester_core::{ClientError, Endpoint, MinimalClient, NetEvent, UdpEnvironment};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

use config::Config;

/// NetTester - minimal network test client
#[derive(Parser)]
#[command(name = "nettester")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/nettester/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept peers and run an interactive session
    Listen {
        /// Local host or address to bind
        host: String,
        /// Local port
        port: u16,
    },

    /// Connect to a listener and run an interactive session
    Connect {
        /// Listener host
        host: String,
        /// Listener port
        port: u16,
    },

    /// Connect, send one text message and exit
    Send {
        /// Listener host
        host: String,
        /// Listener port
        port: u16,
        /// Message text
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::resolve(cli.config.as_deref()).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            return ExitCode::from(1);
        }
    };

    init_logging(cli.verbose, &config);

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<()> {
    match command {
        Commands::Listen { host, port } => {
            let endpoint = resolve_endpoint(&host, port).await?;
            run_session(endpoint, SessionMode::Listen, config).await
        }
        Commands::Connect { host, port } => {
            let endpoint = resolve_endpoint(&host, port).await?;
            run_session(endpoint, SessionMode::Connect, config).await
        }
        Commands::Send { host, port, text } => {
            let endpoint = resolve_endpoint(&host, port).await?;
            send_once(endpoint, &text, config).await
        }
    }
}

/// Resolve `host` on the runtime so the client only ever sees IP literals
async fn resolve_endpoint(host: &str, port: u16) -> Result<Endpoint, ClientError> {
    let endpoint = Endpoint::new(host, port);
    if let Some(addr) = endpoint.ip_literal() {
        return Ok(Endpoint::from(addr));
    }
    if host.is_empty() {
        return Err(ClientError::Setup("empty host".to_string()));
    }

    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClientError::Setup(format!("cannot resolve {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| ClientError::Setup(format!("{endpoint} resolved to no addresses")))?;
    tracing::debug!("Resolved {} to {}", endpoint, addr);
    Ok(Endpoint::from(addr))
}

/// `--verbose` wins, then `RUST_LOG`, then the config file
fn init_logging(verbose: bool, config: &Config) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// 1 for setup failures, 2 for sends without a usable connection
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::NotConnected | ClientError::Channel(_) | ClientError::Connection(_)) => 2,
        _ => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionMode {
    Listen,
    Connect,
}

fn new_client(config: &Config) -> anyhow::Result<(MinimalClient, UnboundedReceiver<NetEvent>)> {
    let environment = UdpEnvironment::new(config.to_transport_config());
    let mut client = MinimalClient::new(Box::new(environment), config.to_client_config()?)?;
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(Box::new(tx));
    Ok((client, rx))
}

fn tick_timer(config: &Config) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Print an event; returns `true` if it ends an outbound session
fn print_event(event: &NetEvent, mode: SessionMode) -> bool {
    match event {
        NetEvent::TextReceived { connection, text } => {
            println!("{} {}", style(format!("[{connection}]")).cyan(), text);
            false
        }
        NetEvent::Connected(connection) => {
            println!("{} connection {} open", style("+").green().bold(), connection);
            false
        }
        NetEvent::ConnectionFailed { connection, reason } => {
            println!(
                "{} connection {} failed: {}",
                style("!").red().bold(),
                connection,
                reason
            );
            mode == SessionMode::Connect
        }
        NetEvent::Disconnected(connection) => {
            println!("{} connection {} closed", style("-").yellow().bold(), connection);
            mode == SessionMode::Connect
        }
        NetEvent::ControlReceived {
            connection,
            payload,
        } => {
            println!(
                "{} control {}",
                style(format!("[{connection}]")).cyan(),
                hex::encode(payload)
            );
            false
        }
        NetEvent::DecodeError { connection, error } => {
            tracing::warn!("Connection {}: undecodable message: {}", connection, error);
            false
        }
    }
}

fn print_status(client: &MinimalClient) {
    println!("NetTester Status");
    if let (Some(role), Some(addr)) = (client.role(), client.local_addr()) {
        println!("  Role: {:?}", role);
        println!("  Local: {}", addr);
    }
    println!("  Clock: {:?}", client.clock());
    println!("  Pending reliable: {}", client.pending_reliable());

    let connections = client.connections();
    if connections.is_empty() {
        println!("  No connections");
    }
    for info in connections {
        println!(
            "  {} {} {:?} sent={} recv={} retransmits={}",
            info.id,
            info.remote,
            info.state,
            info.stats.packets_sent,
            info.stats.packets_received,
            info.stats.retransmits
        );
    }
}

/// Interactive session: reads `send <text>`, `disconnect` and `status` from stdin
async fn run_session(endpoint: Endpoint, mode: SessionMode, config: &Config) -> anyhow::Result<()> {
    let (mut client, mut events) = new_client(config)?;

    match mode {
        SessionMode::Listen => client.listen(&endpoint)?,
        SessionMode::Connect => client.connect(&endpoint)?,
    }
    if let Some(addr) = client.local_addr() {
        tracing::info!("Session started on {} ({:?})", addr, mode);
    }
    println!("Commands: send <text>, status, disconnect. Press Ctrl+C to stop");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut timer = tick_timer(config);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            now = timer.tick() => {
                client.tick(now.duration_since(last_tick));
                last_tick = now;
            }
            Some(event) = events.recv() => {
                if print_event(&event, mode) {
                    break;
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&mut client, line.trim()) {
                            break;
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(err) => {
                        tracing::warn!("stdin closed: {}", err);
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    client.cleanup();
    while let Ok(event) = events.try_recv() {
        print_event(&event, mode);
    }
    Ok(())
}

/// Run one stdin command; returns `false` to end the session
fn handle_command(client: &mut MinimalClient, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "send" => match client.send_text(rest) {
            Ok(count) => tracing::debug!("Sent to {} connection(s)", count),
            Err(err) => eprintln!("{} {}", style("send failed:").red(), err),
        },
        "status" => print_status(client),
        "disconnect" | "quit" | "exit" => return false,
        other => eprintln!("Unknown command: {other} (expected send, status or disconnect)"),
    }
    true
}

/// Connect, wait for the handshake, send `text` and exit
async fn send_once(endpoint: Endpoint, text: &str, config: &Config) -> anyhow::Result<()> {
    let (mut client, mut events) = new_client(config)?;
    client.connect(&endpoint)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .map_err(|e| anyhow::anyhow!("progress template: {}", e))?,
    );
    spinner.set_message(format!("Connecting to {endpoint}"));
    spinner.enable_steady_tick(Duration::from_millis(100));

    // Bounded by the connection timeout, which fails the connection itself
    let wait = Duration::from_millis(config.session.handshake_wait_ms)
        .max(Duration::from_millis(config.connection.timeout_ms));
    let deadline = Instant::now() + wait;
    let mut timer = tick_timer(config);
    let mut last_tick = Instant::now();
    let mut failed = false;

    while !client.is_connected() && !failed && Instant::now() < deadline {
        let now = timer.tick().await;
        client.tick(now.duration_since(last_tick));
        last_tick = now;
        while let Ok(event) = events.try_recv() {
            if let NetEvent::ConnectionFailed { reason, .. } = &event {
                tracing::warn!("Handshake with {} failed: {}", endpoint, reason);
                failed = true;
            }
        }
    }
    spinner.finish_and_clear();

    let result = client.send_text(text);
    if result.is_ok() {
        // Give the reliable frame a chance to be acknowledged
        let drain_deadline = Instant::now() + config.tick_interval() * 10;
        while client.pending_reliable() > 0 && Instant::now() < drain_deadline {
            let now = timer.tick().await;
            client.tick(now.duration_since(last_tick));
            last_tick = now;
        }
    }
    client.cleanup();

    let sent = result?;
    println!("{} sent {} bytes to {}", style("✓").green(), text.len(), endpoint);
    tracing::debug!("Message written to {} connection(s)", sent);
    Ok(())
}
