//! KCP session tuning and setup.
//!
//! The tuning is system-wide and deliberately aggressive: this transport
//! carries a single flow through a private tunnel, so it trades fairness to
//! competing traffic for throughput and latency. Large windows, no-delay mode
//! with a short retransmission interval, fast retransmit after two duplicate
//! ACKs, congestion backoff disabled, and an MTU low enough to avoid IP
//! fragmentation on common paths.

use std::io;
use std::net::SocketAddr;

use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};

use crate::seal::{secure, SecureStream};

/// Send/receive window sizes, in packets.
const WINDOW_SIZE: u16 = 1024;

/// Retransmission check interval, milliseconds.
const NODELAY_INTERVAL: i32 = 10;

/// Duplicate-ACK count that triggers fast retransmit.
const FAST_RESEND: i32 = 2;

/// MTU below the usual 1500-byte Ethernet payload, leaving room for
/// IP/UDP headers plus KCP overhead.
const MTU: usize = 1350;

/// The one shared KCP tuning used by both peers.
pub fn transport_config() -> KcpConfig {
    KcpConfig {
        mtu: MTU,
        nodelay: KcpNoDelayConfig {
            nodelay: true,
            interval: NODELAY_INTERVAL,
            resend: FAST_RESEND,
            // Congestion backoff off: single private flow.
            nc: true,
        },
        wnd_size: (WINDOW_SIZE, WINDOW_SIZE),
        ..Default::default()
    }
}

/// Dial a server and wrap the connection in the sealed-frame layer.
pub async fn dial(addr: SocketAddr, key: &[u8; 32]) -> io::Result<SecureStream<KcpStream>> {
    let stream = KcpStream::connect(&transport_config(), addr)
        .await
        .map_err(io::Error::other)?;
    Ok(secure(stream, key))
}

/// Bind the server-side KCP listener.
pub async fn listen(addr: SocketAddr) -> io::Result<KcpListener> {
    KcpListener::bind(transport_config(), addr)
        .await
        .map_err(io::Error::other)
}
