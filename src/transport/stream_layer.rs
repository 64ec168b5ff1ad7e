use crate::transport::{TlsConfig, TransportError};
use futures::Stream;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_rustls::webpki::DNSNameRef;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tonic::transport::server::Connected;

/// StreamLayer is the encrypted byte-stream transport that raft traffic rides on. Every connection
/// is mutually authenticated: the listener only completes handshakes with peers holding a
/// certificate signed by the configured CA, and `dial` verifies the remote the same way.
///
/// Inbound handshakes run in their own tasks, so a peer that connects and then stalls only holds
/// up its own connection.
pub struct StreamLayer {
    local_addr: SocketAddr,
    connector: TlsConnector,
    server_name: String,
    handshaked: Mutex<mpsc::Receiver<Result<ServerPeerStream, TransportError>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl StreamLayer {
    /// Binds the listener and starts accepting in the background. Must be called from within a
    /// tokio runtime. Accepting stops once the layer is closed or dropped.
    pub async fn bind(
        logger: slog::Logger,
        addr: SocketAddr,
        tls: &TlsConfig,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        // Validate before binding, so a bad config doesn't hold the port.
        DNSNameRef::try_from_ascii_str(&tls.server_name)
            .map_err(|_| TransportError::InvalidServerName(tls.server_name.clone()))?;
        let acceptor = TlsAcceptor::from(tls.server_config()?);
        let connector = TlsConnector::from(tls.client_config()?);

        let listener = TcpListener::bind(addr).await.map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let (closed_tx, closed_rx) = watch::channel(false);
        let (handshaked_tx, handshaked_rx) = mpsc::channel(HANDSHAKED_BACKLOG);

        slog::info!(logger, "Stream layer bound to {}", local_addr);

        tokio::spawn(
            AcceptLoop {
                logger,
                listener,
                acceptor,
                handshake_timeout,
                handshaked_tx,
            }
            .run(closed_rx.clone()),
        );

        Ok(StreamLayer {
            local_addr,
            connector,
            server_name: tls.server_name.clone(),
            handshaked: Mutex::new(handshaked_rx),
            closed_tx,
            closed_rx,
        })
    }

    /// Opens a TLS connection to `address`. The whole connect and handshake must finish within
    /// `timeout`.
    pub async fn dial(&self, address: &str, timeout: Duration) -> Result<client::TlsStream<TcpStream>, TransportError> {
        let domain = DNSNameRef::try_from_ascii_str(&self.server_name)
            .map_err(|_| TransportError::InvalidServerName(self.server_name.clone()))?;

        let connect = async {
            let tcp = TcpStream::connect(address).await.map_err(TransportError::Connect)?;
            let _ = tcp.set_nodelay(true);
            self.connector
                .connect(domain, tcp)
                .await
                .map_err(TransportError::Handshake)
        };

        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::DialTimeout(timeout))?
    }

    /// Waits for the next inbound connection to complete its TLS handshake. Connections are
    /// returned in the order their handshakes finish, which may differ from the order they arrived.
    pub async fn accept(&self) -> Result<ServerPeerStream, TransportError> {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut handshaked = self.handshaked.lock().await;
        tokio::select! {
            next = handshaked.recv() => next.unwrap_or(Err(TransportError::Closed)),
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    /// Stops accepting. Pending and future `accept()` calls fail with `Closed`. Connections that
    /// were already accepted are unaffected.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepted connections as a stream, for handing to the RPC server. Failed handshakes are
    /// skipped; the accept loop has already logged them. The stream ends once the layer is closed.
    pub(crate) fn incoming(self: Arc<Self>) -> impl Stream<Item = Result<ServerPeerStream, io::Error>> {
        futures::stream::unfold(self, |layer| async move {
            loop {
                match layer.accept().await {
                    Ok(stream) => return Some((Ok(stream), layer)),
                    Err(TransportError::Closed) => return None,
                    Err(_) => {}
                }
            }
        })
    }
}

const HANDSHAKED_BACKLOG: usize = 64;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct AcceptLoop {
    logger: slog::Logger,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    handshaked_tx: mpsc::Sender<Result<ServerPeerStream, TransportError>>,
}

impl AcceptLoop {
    async fn run(self, mut closed: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, remote_addr)) => self.spawn_handshake(tcp, remote_addr),
                    Err(e) => {
                        slog::warn!(self.logger, "Failed to accept inbound connection: {}", e);
                        if self.handshaked_tx.send(Err(TransportError::Connect(e))).await.is_err() {
                            break;
                        }
                        // Typically out of file descriptors. Don't spin.
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                // Also fires if the layer was dropped.
                _ = closed.changed() => break,
            }
            if *closed.borrow() {
                break;
            }
        }
        slog::debug!(self.logger, "Stopped accepting inbound connections");
    }

    fn spawn_handshake(&self, tcp: TcpStream, remote_addr: SocketAddr) {
        let _ = tcp.set_nodelay(true);
        let logger = self.logger.clone();
        let handshake = self.acceptor.accept(tcp);
        let handshake_timeout = self.handshake_timeout;
        let handshaked_tx = self.handshaked_tx.clone();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(handshake_timeout, handshake).await {
                Ok(Ok(stream)) => Ok(ServerPeerStream { stream, remote_addr }),
                Ok(Err(e)) => Err(TransportError::Handshake(e)),
                Err(_) => Err(TransportError::DialTimeout(handshake_timeout)),
            };
            if let Err(e) = &result {
                slog::warn!(logger, "Rejected inbound connection from {}: {}", remote_addr, e);
            }
            let _ = handshaked_tx.send(result).await;
        });
    }
}

/// ServerPeerStream is an accepted, authenticated connection.
pub struct ServerPeerStream {
    stream: server::TlsStream<TcpStream>,
    remote_addr: SocketAddr,
}

impl ServerPeerStream {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Connected for ServerPeerStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }
}

impl AsyncRead for ServerPeerStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ServerPeerStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
