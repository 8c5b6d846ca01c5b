//! CoLab Broker Server - Main Entry Point
//!
//! TCP TLS listener carrying length-prefixed JSON events between clients
//! and the room session coordinator.

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, pki_types::PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use colab_chat::broker::Broker;
use colab_chat::history::MemoryMessageStore;
use colab_chat::protocol::{ClientMessage, ServerMessage};
use colab_chat::store::{MemoryUserStore, UserRecord, UserStore};
use colab_chat::ServerConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "colab-server")]
#[command(about = "CoLab room-based chat and call-signaling broker")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    // Load configuration
    let config = if args.config.exists() {
        ServerConfig::from_file(args.config.to_str().unwrap())?
    } else {
        info!("Config file not found, using defaults");
        ServerConfig::default()
    };

    let host = args.host.unwrap_or(config.bind_host.clone());
    let port = args.port.unwrap_or(config.bind_port);

    // Load TLS certificates
    let certs = load_certs(&config.certfile)?;
    let key = load_key(&config.keyfile)?;

    // Configure TLS
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    // Wire the coordinator to its adapters and seed the root admin.
    let users: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
    if config.admin_password == "admin" {
        warn!("Root admin is using the default password - set admin_password in the config");
    }
    users
        .create(UserRecord::root_admin(
            config.admin_password.clone(),
            config.rooms.clone(),
        ))
        .await?;

    let history = Arc::new(MemoryMessageStore::new());
    let max_frame_bytes = config.max_frame_bytes;
    let broker = Arc::new(Broker::new(&config, users, history));

    info!("Rooms available: {}", config.rooms.join(", "));

    // Bind TCP listener
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("CoLab broker listening on {}", addr);

    // Accept connections
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let broker = broker.clone();

        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    info!("New TLS connection from {}", peer_addr);
                    if let Err(e) =
                        handle_client(tls_stream, peer_addr, broker, max_frame_bytes).await
                    {
                        error!("Client {} error: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Handle a connected client
async fn handle_client<S>(
    stream: tokio_rustls::server::TlsStream<S>,
    peer_addr: SocketAddr,
    broker: Arc<Broker>,
    max_frame_bytes: usize,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // Create the event channel for broadcasts to this client
    let (message_tx, mut message_rx) = mpsc::unbounded_channel();
    let session = broker.connect(message_tx);

    // Split stream for concurrent reading and writing
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // Spawn task to drain outgoing events (broadcasts from the broker)
    let writer_task = tokio::spawn(async move {
        while let Some(message) = message_rx.recv().await {
            if let Ok(data) = message.to_framed() {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    // Handle incoming events
    loop {
        // Read event length (4 bytes)
        let mut len_buf = [0u8; 4];
        if read_half.read_exact(&mut len_buf).await.is_err() {
            break;
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > max_frame_bytes {
            error!("Frame too large from {} ({} bytes)", peer_addr, msg_len);
            break;
        }

        // Read event body
        let mut msg_buf = vec![0u8; msg_len];
        if read_half.read_exact(&mut msg_buf).await.is_err() {
            break;
        }

        // Parse and dispatch
        match ClientMessage::from_bytes(&msg_buf) {
            Ok(event) => broker.dispatch(&session, event).await,
            Err(e) => {
                error!("Invalid event from {}: {}", peer_addr, e);
                session.send(ServerMessage::Error {
                    kind: "bad_request".to_string(),
                    message: "Invalid event format".to_string(),
                });
            }
        }
    }

    // Cleanup: room leave and call teardown happen inside the broker.
    broker.disconnect(&session);
    writer_task.abort();
    info!("Client {} disconnected", peer_addr);

    Ok(())
}

/// Load TLS certificates
fn load_certs(path: &PathBuf) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key
fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let keys = rustls_pemfile::private_key(&mut reader)?;
    keys.ok_or_else(|| anyhow::anyhow!("No private key found"))
}
