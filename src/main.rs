//! tcp-mux demo server entry point.
//!
//! Accepts TCP connections, rejects anything that does not open with a
//! multiplexer frame, and echoes every inbound stream back to its sender.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use tcp_mux::config::ServerConfig;
use tcp_mux::conn::{PeekConn, Role, Supervisor};
use tcp_mux::domain::{MasterRegistry, StreamId};
use tcp_mux::protocol::VERSION;
use tcp_mux::stream::{MuxStream, StreamEndpoint};
use tcp_mux::MuxConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = ServerConfig::from_env().context("loading configuration")?;
    tracing::info!(addr = %config.listen_addr, "starting tcp-mux echo server");

    let master = Arc::new(MasterRegistry::new());

    // Start server
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    loop {
        let (socket, peer) = listener.accept().await.context("accepting connection")?;
        let master = Arc::clone(&master);
        let mux = config.mux.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(socket, master, mux).await {
                tracing::warn!(%peer, error = %err, "connection rejected");
            }
        });
    }
}

/// Sniffs the first byte and hands multiplexed connections to a supervisor.
async fn serve(
    socket: TcpStream,
    master: Arc<MasterRegistry>,
    mux: MuxConfig,
) -> anyhow::Result<()> {
    let mut conn = PeekConn::new(socket);
    let first = conn.peek_first_byte().await.context("peeking first byte")?;
    anyhow::ensure!(first == VERSION, "unexpected first byte {first:#04x}");

    let supervisor = Supervisor::builder(master)
        .config(mux)
        .role(Role::Server)
        .on_new_stream(accept_echo)
        .on_error(|err| {
            tracing::warn!(error = %err, "connection failed");
            false
        })
        .start(conn)
        .await?;
    tracing::info!(conn = %supervisor.id(), "multiplexed connection accepted");
    Ok(())
}

async fn accept_echo(conn: Arc<Supervisor>, id: StreamId) {
    match MuxStream::accept(&conn, id).await {
        Ok(endpoint) => {
            tokio::spawn(echo(endpoint));
        }
        Err(err) => tracing::warn!(stream = %id, error = %err, "accept failed"),
    }
}

async fn echo(mut endpoint: StreamEndpoint) {
    let id = endpoint.id();
    loop {
        match endpoint.read().await {
            Ok(Some(data)) => {
                if let Err(err) = endpoint.write(&data).await {
                    tracing::debug!(stream = %id, error = %err, "echo write failed");
                    break;
                }
            }
            Ok(None) => {
                if let Err(err) = endpoint.close().await {
                    tracing::debug!(stream = %id, error = %err, "close failed");
                }
                break;
            }
            Err(err) => {
                tracing::debug!(stream = %id, error = %err, "echo read failed");
                break;
            }
        }
    }
    tracing::debug!(stream = %id, "echo finished");
}
