//! Encrypted reliable-UDP transport for portage.
//!
//! Layering, bottom up:
//!
//! ```text
//! UDP socket
//!   └─ KCP ARQ session        (tokio_kcp, tuned for a single aggressive flow)
//!        └─ sealed frames     (AES-256-GCM, length-delimited)
//!             └─ smux streams (async-smux, many independent byte-streams)
//! ```
//!
//! The passphrase-derived key seals every frame of the session. A peer with
//! the wrong key produces frames that fail authentication; the connection is
//! dropped without a reply, so a wrong key is indistinguishable from an
//! unreachable server.

pub mod keys;
pub mod kcp;
pub mod mux;
pub mod seal;

pub use keys::{derive_key, KeyError};
pub use kcp::{dial, listen, transport_config};
pub use mux::{MuxSession, Stream, StreamAcceptor, TransportIo};
pub use seal::{secure, SealedCodec, SecureStream};
pub use tokio_kcp::{KcpListener, KcpStream};
