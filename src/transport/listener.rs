//! WebSocket listener: the accepting side of the multiplexer.
//!
//! The accept loop never exits on a transient failure: a failed TCP accept
//! is logged and retried, a failed TLS or WebSocket upgrade rejects only
//! that connection. Each successful upgrade is wrapped in a
//! [`Connection`] and surfaced through [`Listener::accept`], and handling
//! one connection never blocks acceptance of the next.

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::mux::Connection;

// ============================================================================
// Constants
// ============================================================================

/// Poll interval for the shutdown flag while blocked in accept.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Back-off after a failed TCP accept before retrying.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// ============================================================================
// ListenerConfig
// ============================================================================

/// Configuration for [`Listener::bind`].
///
/// Providing both a certificate and a key switches the listener into TLS
/// mode.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// IP address to bind to.
    pub ip: IpAddr,
    /// Port to bind to (0 for an OS-assigned port).
    pub port: u16,
    /// PEM certificate + private key paths enabling TLS.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl ListenerConfig {
    /// Creates a plaintext config for the given address.
    #[must_use]
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            tls: None,
        }
    }

    /// Creates a localhost config with an OS-assigned port.
    #[must_use]
    pub fn localhost() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    /// Enables TLS with a PEM certificate and private key pair.
    #[must_use]
    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert.into(), key.into()));
        self
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Accepts raw transport connections and wraps each in a [`Connection`].
///
/// # Example
///
/// ```ignore
/// let mut listener = Listener::bind(ListenerConfig::localhost()).await?;
/// println!("listening on {}", listener.ws_url());
///
/// while let Some(conn) = listener.accept().await {
///     conn.register("echo", |channel, data| async move {
///         channel.close(data).await;
///         Ok(())
///     });
/// }
/// ```
pub struct Listener {
    /// Local address the listener is bound to.
    local_addr: SocketAddr,
    /// Whether connections are TLS-wrapped.
    tls: bool,
    /// Accepted, upgraded connections.
    accepted_rx: mpsc::UnboundedReceiver<Connection>,
    /// Stops the accept loop.
    shutdown: Arc<AtomicBool>,
}

impl Listener {
    /// Binds the listener and starts its accept loop.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if binding or reading the TLS files fails
    /// - [`Error::Tls`] if the certificate/key pair is rejected
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        let addr = SocketAddr::new(config.ip, config.port);
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;

        let acceptor = match &config.tls {
            Some((cert_path, key_path)) => {
                let cert = tokio::fs::read(cert_path).await?;
                let key = tokio::fs::read(key_path).await?;
                let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
                Some(Arc::new(TlsAcceptor::from(native_tls::TlsAcceptor::new(
                    identity,
                )?)))
            }
            None => None,
        };

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        info!(addr = %local_addr, tls = acceptor.is_some(), "Listener bound");

        tokio::spawn(Self::accept_loop(
            tcp,
            acceptor.clone(),
            accepted_tx,
            Arc::clone(&shutdown),
        ));

        Ok(Self {
            local_addr,
            tls: acceptor.is_some(),
            accepted_rx,
            shutdown,
        })
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the URL clients should dial.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}", self.local_addr)
    }

    /// Waits for the next accepted connection.
    ///
    /// Returns `None` once the listener has shut down.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.accepted_rx.recv().await
    }

    /// Stops the accept loop. Already-accepted connections are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Background task accepting raw connections.
    ///
    /// Transient accept errors are logged and retried indefinitely; only
    /// shutdown (or every receiver going away) ends the loop.
    async fn accept_loop(
        tcp: TcpListener,
        acceptor: Option<Arc<TlsAcceptor>>,
        accepted_tx: mpsc::UnboundedSender<Connection>,
        shutdown: Arc<AtomicBool>,
    ) {
        debug!("Accept loop started");

        loop {
            if shutdown.load(Ordering::SeqCst) || accepted_tx.is_closed() {
                break;
            }

            match timeout(SHUTDOWN_POLL, tcp.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let acceptor = acceptor.clone();
                    let accepted_tx = accepted_tx.clone();
                    tokio::spawn(async move {
                        match Self::upgrade(stream, acceptor).await {
                            Ok(connection) => {
                                info!(?addr, "Connection accepted");
                                let _ = accepted_tx.send(connection);
                            }
                            Err(e) => {
                                // Rejects this connection only.
                                warn!(error = %e, ?addr, "Upgrade failed");
                            }
                        }
                    });
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed; retrying");
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(_) => {
                    // Poll timeout; recheck shutdown.
                }
            }
        }

        debug!("Accept loop terminated");
    }

    /// Upgrades one raw stream to a multiplexed connection.
    async fn upgrade(
        stream: TcpStream,
        acceptor: Option<Arc<TlsAcceptor>>,
    ) -> Result<Connection> {
        match acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await?;
                let ws_stream = tokio_tungstenite::accept_async(tls_stream)
                    .await
                    .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;
                Ok(Connection::new(ws_stream))
            }
            None => {
                let ws_stream = tokio_tungstenite::accept_async(stream)
                    .await
                    .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;
                Ok(Connection::new(ws_stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
