//! Tether CLI
//!
//! Serve and connect over TCP, and provision SRP verifiers.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use config::Config;
use tether_core::{
    BincodeCodec, Channel, ConnectionRef, Credentials, Handler, Manager, MemoryUserDirectory,
    NetworkError, Reliability, Responder,
};
use tether_crypto::Authenticator;

/// Tether - authenticated messaging, RPC and state replication
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections, echo requests and replicate an uptime clock
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Users file: one `identifier hex-verifier` per line
        #[arg(long)]
        users: Option<PathBuf>,
    },

    /// Connect to a server
    Connect {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Identifier to authenticate as
        #[arg(long, requires = "secret")]
        identifier: Option<String>,

        /// Secret for the identifier
        #[arg(long, requires = "identifier")]
        secret: Option<String>,

        /// Register the identifier before authenticating
        #[arg(long, requires = "identifier")]
        register: bool,

        /// Fire-and-forget message to send
        #[arg(short, long)]
        message: Option<String>,

        /// Request to send; the response is printed
        #[arg(short, long)]
        request: Option<String>,

        /// Seconds to stay connected and print channel updates
        #[arg(long, default_value_t = 0)]
        linger: u64,
    },

    /// Print the hex verifier for a users file entry
    Verifier {
        /// User identifier
        #[arg(long)]
        identifier: String,

        /// User secret
        #[arg(long)]
        secret: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::resolve(cli.config.as_deref())?;
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    match cli.command {
        Commands::Serve { bind, users } => serve(bind, users, &config).await?,
        Commands::Connect {
            addr,
            identifier,
            secret,
            register,
            message,
            request,
            linger,
        } => {
            let credentials = match (identifier, secret) {
                (Some(identifier), Some(secret)) if register => {
                    Some(Credentials::register(identifier, secret))
                }
                (Some(identifier), Some(secret)) => Some(Credentials::login(identifier, secret)),
                _ => None,
            };
            connect(addr, credentials, message, request, linger, &config).await?;
        }
        Commands::Verifier { identifier, secret } => {
            let verifier = Authenticator::create_verifier(&identifier, &secret)?;
            println!("{} {}", identifier, hex::encode(verifier));
        }
    }

    Ok(())
}

/// Server-side event handler.
struct ServerHandler {
    clock: OnceLock<Channel<String>>,
}

impl Handler<String> for ServerHandler {
    fn on_connection(
        &self,
        connection: &ConnectionRef<String>,
        request: Option<&String>,
    ) -> Result<Option<String>, String> {
        let name = connection
            .user()
            .map_or_else(|| "guest".to_string(), |user| user.identifier);
        tracing::info!(connection = connection.id(), user = %name, request = ?request, "accepting");
        Ok(Some(format!("welcome {name}")))
    }

    fn on_connected(&self, connection: &ConnectionRef<String>, _message: Option<&String>) {
        if let Some(clock) = self.clock.get() {
            if let Err(err) = clock.open(connection) {
                tracing::warn!("clock channel unavailable: {}", err);
            }
        }
    }

    fn on_disconnected(&self, connection: &ConnectionRef<String>, error: Option<&NetworkError>) {
        match error {
            Some(err) => tracing::info!(connection = connection.id(), "dropped: {}", err),
            None => tracing::info!(connection = connection.id(), "disconnected"),
        }
    }

    fn on_received(&self, connection: &ConnectionRef<String>, message: String) {
        println!("[{}] {}", connection.id(), message);
    }

    fn on_request(
        &self,
        _connection: &ConnectionRef<String>,
        message: String,
        responder: Responder<String>,
    ) {
        if let Err(err) = responder.respond(message) {
            tracing::debug!("response not sent: {}", err);
        }
    }
}

/// Run a TCP server until Ctrl+C
async fn serve(bind: Option<String>, users: Option<PathBuf>, config: &Config) -> anyhow::Result<()> {
    let addr: SocketAddr = match bind {
        Some(bind) => bind.parse().context("invalid bind address")?,
        None => config.parse_listen_addr()?,
    };

    let directory = match users.as_ref().or(config.auth.users_file.as_ref()) {
        Some(path) => config::load_users(path)?,
        None => MemoryUserDirectory::new(),
    };
    tracing::info!(users = directory.len(), "user directory loaded");

    let handler = Arc::new(ServerHandler {
        clock: OnceLock::new(),
    });
    let manager = Manager::with_directory(
        config.network_config(),
        Arc::new(BincodeCodec::<String>::new()),
        handler.clone(),
        Arc::new(directory),
    )?;

    let clock = manager.open_channel(Some("uptime".to_string())).await?;
    tracing::debug!(channel = clock.id(), "clock channel created");
    let _ = handler.clock.set(clock);

    manager.host(Arc::new(config.tcp_host(addr))).await?;
    println!("Tether server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", addr);
    println!("Press Ctrl+C to stop");

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let stop = tokio::signal::ctrl_c();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                if let Some(clock) = handler.clock.get() {
                    let uptime = format!("{}s", started.elapsed().as_secs());
                    if clock.update(uptime).is_err() {
                        break;
                    }
                }
            }
        }
    }

    println!("\nShutting down...");
    manager.shutdown().await;
    Ok(())
}

/// Client-side event handler.
struct ClientHandler;

impl Handler<String> for ClientHandler {
    fn on_received(&self, _connection: &ConnectionRef<String>, message: String) {
        println!("message: {}", message);
    }

    fn on_channel_opened(
        &self,
        _connection: &ConnectionRef<String>,
        channel: i32,
        profile: Option<String>,
    ) {
        println!("channel {} opened ({})", channel, profile.unwrap_or_default());
    }

    fn on_channel_update(&self, _connection: &ConnectionRef<String>, channel: i32, message: String) {
        println!("channel {}: {}", channel, message);
    }

    fn on_channel_closed(&self, _connection: &ConnectionRef<String>, channel: i32) {
        println!("channel {} closed", channel);
    }
}

/// Connect, send, and optionally linger
async fn connect(
    addr: String,
    credentials: Option<Credentials>,
    message: Option<String>,
    request: Option<String>,
    linger: u64,
    config: &Config,
) -> anyhow::Result<()> {
    let remote: SocketAddr = addr.parse().context("invalid server address")?;
    let manager = Manager::new(
        config.network_config(),
        Arc::new(BincodeCodec::<String>::new()),
        Arc::new(ClientHandler),
    )?;

    let (connection, response) = manager
        .connect(Arc::new(config.tcp_link(remote)), None, credentials)
        .await?;
    println!("Connected to {} (secure: {})", remote, connection.is_secure());
    if let Some(response) = response {
        println!("Server: {}", response);
    }

    if let Some(message) = message {
        connection.send(message, Reliability::Ordered)?;
    }
    if let Some(request) = request {
        let reply = connection.request(request, None).await?;
        println!("Response: {}", reply);
    }

    if linger > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = tokio::time::sleep(Duration::from_secs(linger)) => {}
        }
    }

    manager.shutdown().await;
    Ok(())
}
