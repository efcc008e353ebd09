//! simple-disco command line: key generation, registry server, discovery client.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simple_disco::client::{random_identity, random_port};
use simple_disco::config::{DEFAULT_PRIVATE_KEY_PATH, DEFAULT_PUBLIC_KEY_DIR, DiscoConfig};
use simple_disco::identity::{self, KeyPair, load_public_key};
use simple_disco::transport::parse_bind_address;
use simple_disco::{
    DirectoryTrustStore, DiscoClient, DiscoError, Dispatcher, PeerRegistry, RegistryServer,
    TcpConnector, TrustOracle, logging,
};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_CONFIG: u8 = 1;
const EXIT_SERVER_LOST: u8 = 2;
const EXIT_BIND: u8 = 3;

#[derive(Parser)]
#[command(
    name = "simple-disco",
    about = "Authenticated peer discovery registry",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a key pair (`<name>` and `<name>_secret`) unless one exists
    Keygen {
        /// Secret key path; the public key is written next to it
        #[arg(long, env = "PRIVATE_KEY_PATH", default_value = DEFAULT_PRIVATE_KEY_PATH)]
        private_key: PathBuf,
    },

    /// Run a registry server
    Server {
        /// Bind address, e.g. tcp://*:9999
        bind: Option<String>,

        /// Directory of trusted client public keys
        #[arg(long, env = "PUBLIC_KEY_DIR_PATH")]
        public_key_dir: Option<PathBuf>,

        /// Server secret key (generated if missing)
        #[arg(long, env = "PRIVATE_KEY_PATH")]
        private_key: Option<PathBuf>,

        /// How long a peer stays listed after its last PUBLISH
        #[arg(long, value_parser = parse_duration)]
        peer_ttl: Option<Duration>,

        /// Reuse a loaded trusted set for this long (0s reloads every request)
        #[arg(long, value_parser = parse_duration)]
        trust_cache: Option<Duration>,
    },

    /// Run a discovery client against one or more servers
    Client {
        /// Server addresses, e.g. tcp://127.0.0.1:9999
        servers: Vec<String>,

        /// Client secret key (generated if missing)
        #[arg(long, env = "PRIVATE_KEY_PATH")]
        private_key: Option<PathBuf>,

        /// Only accept servers presenting this public key
        #[arg(long)]
        server_key: Option<PathBuf>,

        /// Identity to announce (default: random UUID)
        #[arg(long)]
        id: Option<String>,

        /// Port to announce (default: random in 2000-2020)
        #[arg(long)]
        port: Option<u16>,

        /// Reply timeout per request
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Pause between publish cycles
        #[arg(long, value_parser = parse_duration)]
        interval: Option<Duration>,
    },
}

/// Marks a failure to open the listening socket.
#[derive(Debug)]
struct BindFailed(String);

impl fmt::Display for BindFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to bind {}", self.0)
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_level.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    if e.downcast_ref::<BindFailed>().is_some() {
        return EXIT_BIND;
    }
    match e.downcast_ref::<DiscoError>() {
        Some(DiscoError::ServerUnreachable(_)) => EXIT_SERVER_LOST,
        _ => EXIT_CONFIG,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => DiscoConfig::load(path)?,
        None => DiscoConfig::default(),
    };

    match cli.command {
        Commands::Keygen { private_key } => {
            if !identity::keygen(&private_key).context("Failed to generate keys")? {
                println!("Key already exists at {}", private_key.display());
            }
            Ok(())
        }

        Commands::Server {
            bind,
            public_key_dir,
            private_key,
            peer_ttl,
            trust_cache,
        } => {
            let mut server = config.server;
            if let Some(bind) = bind {
                server.bind = bind;
            }
            if let Some(dir) = public_key_dir {
                server.public_key_dir = dir;
            }
            if let Some(key) = private_key {
                server.private_key = key;
            }
            if let Some(ttl) = peer_ttl {
                server.peer_ttl = ttl;
            }
            if let Some(window) = trust_cache {
                server.trust_cache = window;
            }
            server.validate()?;
            run_server(server).await
        }

        Commands::Client {
            servers,
            private_key,
            server_key,
            id,
            port,
            timeout,
            interval,
        } => {
            let mut client = config.client;
            if !servers.is_empty() {
                client.servers = servers;
            }
            if let Some(key) = private_key {
                client.private_key = key;
            }
            client.server_key = server_key.or(client.server_key);
            client.id = id.or(client.id);
            client.port = port.or(client.port);
            if let Some(timeout) = timeout {
                client.reply_timeout = timeout;
            }
            if let Some(interval) = interval {
                client.interval = interval;
            }
            client.validate()?;
            run_client(client).await
        }
    }
}

async fn run_server(config: simple_disco::ServerConfig) -> Result<()> {
    let keys = KeyPair::load_or_generate(&config.private_key)
        .with_context(|| format!("Failed to load key {}", config.private_key.display()))?;

    if !config.public_key_dir.is_dir() {
        warn!(
            dir = %config.public_key_dir.display(),
            default = DEFAULT_PUBLIC_KEY_DIR,
            "Public key directory does not exist, every client will be ignored"
        );
    }
    let oracle = TrustOracle::new(DirectoryTrustStore::new(&config.public_key_dir))
        .with_cache_window(config.trust_cache);
    let registry = PeerRegistry::new().with_ttl(config.peer_ttl);

    let addr = parse_bind_address(&config.bind)?;
    let server = RegistryServer::bind(addr, keys, Dispatcher::new(registry, oracle))
        .await
        .context(BindFailed(config.bind.clone()))?
        .with_handshake_timeout(config.handshake_timeout);

    info!(
        bind = %config.bind,
        trust_dir = %config.public_key_dir.display(),
        peer_ttl = ?config.peer_ttl,
        "Registry server ready"
    );
    server.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}

async fn run_client(config: simple_disco::ClientConfig) -> Result<()> {
    let keys = KeyPair::load_or_generate(&config.private_key)
        .with_context(|| format!("Failed to load key {}", config.private_key.display()))?;
    info!(
        public_key = %keys.public_hex(),
        "Client key loaded; servers must trust this key"
    );

    let server_key = config
        .server_key
        .as_ref()
        .map(|path| {
            load_public_key(path)
                .with_context(|| format!("Failed to load server key {}", path.display()))
        })
        .transpose()?;

    let connector = TcpConnector::new(Arc::new(keys))
        .with_server_key(server_key)
        .with_handshake_timeout(config.dial_timeout());
    let identity = config.id.clone().unwrap_or_else(random_identity);
    let port = config.port.unwrap_or_else(random_port);

    let mut client = DiscoClient::new(connector, &config.servers, identity, port)
        .with_reply_timeout(config.reply_timeout)
        .with_interval(config.interval);

    let mut views = client.subscribe();
    tokio::spawn(async move {
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            println!("{} peer(s)", view.len());
            for (identity, endpoint) in &view {
                println!("  {identity} {endpoint}");
            }
        }
    });

    client.run(shutdown_on_ctrl_c()).await?;
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });
    token
}
