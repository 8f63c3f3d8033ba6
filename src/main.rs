//! netbus CLI - run a bus server or join one as a line-chat client.
//!
//! See the `netbus` library for the protocol itself.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use netbus::{
    BusConfig, ClientHooks, ClientStatus, EntityId, MessageClient, MessageServer, MessageType, MioTransport,
    NetworkMessage, ServerHooks,
};
use std::{
    io::BufRead,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

/// Chat line, carried in the `text` property.
const CHAT: MessageType = MessageType::FIRST_USER;
const TEXT: &str = "text";
const TICK: Duration = Duration::from_millis(100);

// CLI
#[derive(Parser)]
#[command(name = "netbus")]
#[command(version)]
#[command(about = "Message bus server and client over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bus server
    Serve {
        /// Port to listen on (0 picks one)
        #[arg(long, default_value_t = 7100)]
        port: u16,
        /// Password clients must present
        #[arg(long, default_value = "")]
        password: String,
        /// Override the configured client limit
        #[arg(long)]
        max_clients: Option<u32>,
    },
    /// Join a bus and chat: stdin lines are broadcast, messages are printed
    Connect {
        /// Server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server port
        #[arg(long, default_value_t = 7100)]
        port: u16,
        /// Server password
        #[arg(long, default_value = "")]
        password: String,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = BusConfig::load()?;

    match cli.command {
        Commands::Serve {
            port,
            password,
            max_clients,
        } => {
            let mut config = config;
            if let Some(max_clients) = max_clients {
                config.max_clients = max_clients;
            }
            run_server(config, port, &password)?;
        }
        Commands::Connect { host, port, password } => {
            run_client(config, &host, port, &password)?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Install a Ctrl-C handler and return the flag it raises.
fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        log::info!("Shutdown signal received");
        raised.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(flag)
}

struct ServerLog;

impl ServerHooks for ServerLog {
    fn client_connected(&self, server: &MessageServer, client: EntityId) {
        log::info!("{client} joined ({} connected)", server.num_clients());
    }

    fn client_disconnected(&self, server: &MessageServer, client: EntityId) {
        log::info!("{client} left ({} connected)", server.num_clients());
    }

    fn received_message(&self, _server: &MessageServer, message: NetworkMessage) {
        log::info!("{message}");
    }
}

fn run_server(config: BusConfig, port: u16, password: &str) -> Result<()> {
    let shutdown = shutdown_flag()?;
    let transport = MioTransport::start().context("Failed to start transport")?;
    let handshake_timeout = config.handshake_timeout();
    let server = MessageServer::with_hooks(transport, config, Arc::new(ServerLog));

    server.start(port, password).context("Failed to start server")?;
    server
        .wait_started(handshake_timeout)
        .context("Server did not start listening")?;
    let port = server.port().unwrap_or(port);
    println!("Listening on port {port}");

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(TICK);
    }

    server.stop()?;
    Ok(())
}

struct ChatPrinter {
    closed: Arc<AtomicBool>,
}

impl ClientHooks for ChatPrinter {
    fn client_connected(&self, client: &MessageClient) {
        println!("Connected as {}", client.id());
    }

    fn client_disconnected(&self, _client: &MessageClient, result: netbus::Result<()>) {
        match result {
            Ok(()) => println!("Disconnected"),
            Err(e) => println!("Disconnected: {e}"),
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    fn received_message(&self, _client: &MessageClient, message: NetworkMessage) {
        match message.value_str(TEXT) {
            Some(text) if message.msg_type() == CHAT => println!("[{}] {text}", message.src()),
            _ => log::info!("{message}"),
        }
    }
}

fn run_client(config: BusConfig, host: &str, port: u16, password: &str) -> Result<()> {
    let shutdown = shutdown_flag()?;
    let closed = Arc::new(AtomicBool::new(false));
    let transport = MioTransport::start().context("Failed to start transport")?;
    let client = MessageClient::with_hooks(
        transport,
        config,
        Arc::new(ChatPrinter {
            closed: Arc::clone(&closed),
        }),
    );

    if let Err(e) = client.connect(host, port, password) {
        bail!("Failed to connect to {host}:{port}: {e}");
    }

    let (lines_tx, lines_rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("netbus-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if lines_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("Failed to spawn stdin reader")?;

    while !shutdown.load(Ordering::SeqCst) && !closed.load(Ordering::SeqCst) {
        match lines_rx.recv_timeout(TICK) {
            Ok(line) => {
                if client.status() != ClientStatus::Connected {
                    log::warn!("Not connected yet, dropping line");
                    continue;
                }
                let mut message = client.prepare_message(CHAT, EntityId::EVERYONE)?;
                message.set_value(TEXT, line);
                client.send_message(message)?;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if client.status() == ClientStatus::Connected {
        client.disconnect()?;
    }
    match client.result() {
        Ok(()) => Ok(()),
        Err(e) => bail!("Connection ended: {e}"),
    }
}
