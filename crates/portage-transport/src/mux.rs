//! Stream multiplexing over one encrypted transport connection.
//!
//! Many independent, individually flow-controlled byte-streams share a single
//! KCP session, so per-request setup costs nothing beyond a stream id. The
//! server side is exposed as a generic acceptor (accept / close / peer
//! address) so the HTTP layer on top never learns it is speaking over a
//! multiplexer.

use std::io;
use std::net::SocketAddr;

use async_smux::{MuxAcceptor, MuxBuilder, MuxConnector, MuxStream};
use tokio::task::JoinHandle;
use tokio_kcp::KcpStream;
use tracing::debug;

use crate::seal::SecureStream;

/// The encrypted byte stream every mux session runs over.
pub type TransportIo = SecureStream<KcpStream>;

/// One multiplexed stream; plain `AsyncRead + AsyncWrite`.
pub type Stream = MuxStream<TransportIo>;

/// Client half of a multiplexed session. Dropping or closing it tears down
/// the worker and with it every open stream.
pub struct MuxSession {
    connector: MuxConnector<TransportIo>,
    worker: JoinHandle<Result<(), async_smux::error::MuxError>>,
}

impl MuxSession {
    /// Start the client-side multiplexer over an established transport.
    pub fn client(io: TransportIo) -> Self {
        let (connector, _acceptor, worker) = MuxBuilder::client().with_connection(io).build();
        let worker = tokio::spawn(worker);
        Self { connector, worker }
    }

    /// Open a fresh stream. Fails once the session is closed.
    pub fn open_stream(&self) -> io::Result<Stream> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "mux session is closed",
            ));
        }
        self.connector.connect().map_err(io::Error::other)
    }

    /// True once the session worker has stopped, for any reason.
    pub fn is_closed(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn close(&self) {
        debug!("closing mux session");
        self.worker.abort();
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Server half: a stream acceptor for one client connection.
pub struct StreamAcceptor {
    acceptor: MuxAcceptor<TransportIo>,
    worker: JoinHandle<Result<(), async_smux::error::MuxError>>,
    peer: SocketAddr,
}

impl StreamAcceptor {
    /// Start the server-side multiplexer over an accepted transport.
    pub fn server(io: TransportIo, peer: SocketAddr) -> Self {
        let (_connector, acceptor, worker) = MuxBuilder::server().with_connection(io).build();
        let worker = tokio::spawn(worker);
        Self { acceptor, worker, peer }
    }

    /// Wait for the peer to open the next stream. `None` means the session
    /// ended (transport failure or clean shutdown).
    pub async fn accept(&mut self) -> Option<Stream> {
        self.acceptor.accept().await
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn close(&self) {
        debug!(peer = %self.peer, "closing acceptor");
        self.worker.abort();
    }
}

impl Drop for StreamAcceptor {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
