//! One-shot TCP connection gate for the downstream consumer.

use std::future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::info;

/// Port the gate listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8888;

/// Error type for the connection gate.
#[derive(Debug, Error)]
pub enum GateError {
    /// The socket could not be created.
    #[error("error creating socket: {0}")]
    Socket(#[source] io::Error),
    /// Binding to the address failed.
    #[error("error binding socket to {addr}: {source}")]
    Bind {
        /// Address that could not be bound.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Listening failed.
    #[error("error listening on socket: {0}")]
    Listen(#[source] io::Error),
    /// Accepting the client failed.
    #[error("error accepting connection: {0}")]
    Accept(#[source] io::Error),
}

/// Accepts exactly one downstream consumer.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionGate {
    addr: SocketAddr,
}

impl ConnectionGate {
    /// Gate on the IPv4 any-address.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self::with_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Gate on a specific address.
    #[must_use]
    pub const fn with_addr(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Address the gate binds to.
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind and listen with a backlog of one.
    ///
    /// Must be called within a tokio runtime context.
    pub fn listen(&self) -> Result<PendingConnection, GateError> {
        let socket = TcpSocket::new_v4().map_err(GateError::Socket)?;
        socket.bind(self.addr).map_err(|source| GateError::Bind {
            addr: self.addr,
            source,
        })?;
        let listener = socket.listen(1).map_err(GateError::Listen)?;
        Ok(PendingConnection { listener })
    }

    /// Listen, then accept one client.
    pub async fn accept_one(&self) -> Result<Connection, GateError> {
        self.listen()?.accept().await
    }
}

/// A listening gate waiting for its single client.
#[derive(Debug)]
pub struct PendingConnection {
    listener: TcpListener,
}

impl PendingConnection {
    /// Local address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one client. The listening socket is closed afterwards.
    pub async fn accept(self) -> Result<Connection, GateError> {
        info!(addr = ?self.listener.local_addr().ok(), "Waiting for a connection...");
        let (stream, peer) = self.listener.accept().await.map_err(GateError::Accept)?;
        info!(%peer, "Client connected!");
        Ok(Connection { stream, peer })
    }
}

/// The accepted downstream consumer.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Address of the client.
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Keep the connection open until the future is dropped.
    pub async fn hold(self) {
        let _stream = self.stream;
        // TODO: stream frame data once the dispatcher forwards pixels.
        future::pending::<()>().await;
    }
}
