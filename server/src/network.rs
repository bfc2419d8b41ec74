//! Server network layer handling WebSocket connections

use crate::client::{Connection, Outgoing};
use crate::registry::LobbyRegistry;
use crate::session::{Flow, Session};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
    #[error("websocket handshake with {peer} failed: {source}")]
    Handshake {
        peer: SocketAddr,
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Accepts WebSocket connections and runs one [`Session`] per connection
pub struct Server {
    listener: TcpListener,
    registry: Arc<LobbyRegistry>,
    outbound_capacity: usize,
    next_connection_id: AtomicU64,
}

impl Server {
    pub async fn new(addr: &str, outbound_capacity: usize) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!("Server listening on {}", addr);

        Ok(Server {
            listener,
            registry: Arc::new(LobbyRegistry::new()),
            outbound_capacity: outbound_capacity.max(1),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<LobbyRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(&self) -> Result<(), NetworkError> {
        loop {
            let (stream, peer) = self.listener.accept().await.map_err(NetworkError::Accept)?;
            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let registry = Arc::clone(&self.registry);
            let capacity = self.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, id, registry, capacity).await {
                    warn!("{}", e);
                }
            });
        }
    }

    /// Accepts connections until `shutdown` resolves, then drops the listener.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), NetworkError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run() => {
                if let Err(e) = &result {
                    error!("Accept loop stopped: {}", e);
                }
                result
            }
            _ = shutdown => {
                info!("Server shutting down");
                Ok(())
            }
        }
    }
}

/// Drives a single connection from handshake to close.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    registry: Arc<LobbyRegistry>,
    capacity: usize,
) -> Result<(), NetworkError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|source| NetworkError::Handshake { peer, source })?;
    info!("Connection {} open from {}", id, peer);

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(capacity);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outgoing::Text(text) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("Connection {}: send failed: {}", id, e);
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut session = Session::new(Connection::new(id, tx), registry);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if session.handle_message(text.as_str()).await == Flow::Disconnect {
                    break;
                }
            }
            Ok(Message::Binary(_)) => debug!("Connection {}: ignoring binary frame", id),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {}: read failed: {}", id, e);
                break;
            }
        }
    }

    session.on_close().await;
    // Last sender goes away with the session, which lets the writer finish.
    drop(session);
    let _ = writer.await;

    info!("Connection {} from {} closed", id, peer);
    Ok(())
}
