//! Client session: dial, handshake, and per-request HTTP plumbing.
//!
//! A `Client` owns at most one multiplexed session to the server. Every HTTP
//! request opens a fresh mux stream and runs a dedicated HTTP/1.1 connection
//! over it, so requests never queue behind each other and a failed stream
//! never poisons the session.
//!
//! Connecting races the dial-plus-probe against a fixed timeout. The probe is
//! a raw `HEAD /` written down the first stream; until the server answers at
//! least one byte, nothing proves the passphrase matched. A wrong passphrase
//! makes the server drop the connection silently, so the caller only ever
//! sees the timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use portage_transport::{derive_key, dial, MuxSession};

use crate::error::{Error, Result};

/// How long a connect attempt may take end to end, probe included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const PROBE: &[u8] = b"HEAD / HTTP/1.1\r\nHost: portage\r\nConnection: close\r\n\r\n";

/// Bytes that must be escaped inside a query value.
const QUERY_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'%');

/// Bytes that must be escaped inside a URL path (slashes stay).
const PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'%')
    .add(b'{')
    .add(b'}');

pub(crate) fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_VALUE).to_string()
}

pub(crate) fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH).to_string()
}

/// Build a `?a=1&b=2` suffix, skipping empty values.
pub(crate) fn build_query(pairs: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        if value.is_empty() {
            continue;
        }
        out.push(if out.is_empty() { '?' } else { '&' });
        out.push_str(key);
        out.push('=');
        out.push_str(&encode_query_value(value));
    }
    out
}

/// Where the session currently stands. Purely observational; methods that
/// need a live session check for one themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Dialing = 1,
    AwaitingHandshake = 2,
    Connected = 3,
    Failed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::Dialing,
            2 => ConnState::AwaitingHandshake,
            3 => ConnState::Connected,
            4 => ConnState::Failed,
            _ => ConnState::Disconnected,
        }
    }
}

/// Handle to one server. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct Client {
    server_addr: SocketAddr,
    key: [u8; 32],
    session: Mutex<Option<MuxSession>>,
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.server_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Derive the session key from `passphrase` and prepare a disconnected
    /// client. No network traffic happens until [`Client::connect`].
    pub fn new(server_addr: SocketAddr, passphrase: &str) -> Result<Self> {
        let key = derive_key(passphrase).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            server_addr,
            key,
            session: Mutex::new(None),
            state: Arc::new(AtomicU8::new(ConnState::Disconnected as u8)),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn session_guard(&self) -> MutexGuard<'_, Option<MuxSession>> {
        self.session.lock().expect("session lock poisoned")
    }

    /// True while an established session is still alive.
    pub fn is_connected(&self) -> bool {
        self.session_guard()
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Establish the session: dial, then prove the key with a probe request.
    ///
    /// The whole attempt is bounded by [`CONNECT_TIMEOUT`]. If the timeout
    /// wins the race, the late session (if any) is torn down by the dial
    /// task, never handed out.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(stale) = self.session_guard().take() {
            stale.close();
        }
        self.set_state(ConnState::Dialing);

        let addr = self.server_addr;
        let key = self.key;
        let state = Arc::clone(&self.state);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = dial_and_probe(addr, key, &state).await;
            if let Err(unclaimed) = tx.send(outcome) {
                // The timeout already fired; don't leak a live session.
                if let Ok(session) = unclaimed {
                    session.close();
                }
            }
        });

        match tokio::time::timeout(CONNECT_TIMEOUT, rx).await {
            Ok(Ok(Ok(session))) => {
                *self.session_guard() = Some(session);
                self.set_state(ConnState::Connected);
                debug!(server = %addr, "session established");
                Ok(())
            }
            Ok(Ok(Err(err))) => {
                self.set_state(ConnState::Failed);
                Err(err)
            }
            Ok(Err(_)) => {
                self.set_state(ConnState::Failed);
                Err(Error::Connection("handshake task vanished".into()))
            }
            Err(_) => {
                self.set_state(ConnState::Failed);
                Err(Error::Connection(format!(
                    "handshake with {addr} timed out after {CONNECT_TIMEOUT:?} \
                     (server unreachable or wrong passphrase)"
                )))
            }
        }
    }

    /// Tear down the session. Outstanding streams fail; subsequent requests
    /// return a connection error until [`Client::connect`] succeeds again.
    pub fn close(&self) {
        if let Some(session) = self.session_guard().take() {
            session.close();
        }
        self.set_state(ConnState::Disconnected);
    }

    /// Run one HTTP request over a fresh mux stream.
    pub(crate) async fn request<B>(&self, req: Request<B>) -> Result<Response<Incoming>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = {
            let guard = self.session_guard();
            let Some(session) = guard.as_ref() else {
                return Err(Error::Connection("not connected".into()));
            };
            session.open_stream().map_err(Error::connection)?
        };

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(Error::connection)?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "request connection ended");
            }
        });
        sender.send_request(req).await.map_err(Error::connection)
    }

    /// Shorthand for bodyless requests.
    pub(crate) async fn request_empty(
        &self,
        method: Method,
        path_and_query: String,
    ) -> Result<Response<Incoming>> {
        let req = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(header::HOST, "portage")
            .body(Empty::<Bytes>::new())
            .map_err(Error::connection)?;
        self.request(req).await
    }

    /// Shorthand for requests carrying a small in-memory body.
    pub(crate) async fn request_bytes(
        &self,
        method: Method,
        path_and_query: String,
        body: Bytes,
    ) -> Result<Response<Incoming>> {
        let req = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(header::HOST, "portage")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(body))
            .map_err(Error::connection)?;
        self.request(req).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.session.lock() {
            if let Some(session) = guard.take() {
                session.close();
            }
        }
    }
}

async fn dial_and_probe(
    addr: SocketAddr,
    key: [u8; 32],
    state: &AtomicU8,
) -> Result<MuxSession> {
    let io = dial(addr, &key).await.map_err(Error::connection)?;
    // Only advance if the connect attempt is still in flight; once the
    // timeout stores Failed, this task no longer owns the state.
    let _ = state.compare_exchange(
        ConnState::Dialing as u8,
        ConnState::AwaitingHandshake as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    let session = MuxSession::client(io);
    let mut stream = session.open_stream().map_err(Error::connection)?;
    stream.write_all(PROBE).await.map_err(Error::connection)?;
    stream.flush().await.map_err(Error::connection)?;

    // Any byte back means the server decrypted our frames.
    let mut first = [0u8; 1];
    if let Err(err) = stream.read_exact(&mut first).await {
        session.close();
        return Err(Error::connection(err));
    }
    drop(stream);
    Ok(session)
}

/// Check the status and drain the body; non-success becomes a typed error
/// carrying the server's message.
pub(crate) async fn expect_success(resp: Response<Incoming>) -> Result<Response<Incoming>> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = read_body(resp).await.unwrap_or_default();
    let mut message = String::from_utf8_lossy(&body).trim().to_string();
    message.truncate(512);
    warn!(%status, %message, "server rejected request");
    Err(Error::from_status(status, message))
}

/// Collect a response body into memory. Only used for small payloads
/// (listings, checksums, error messages); transfers stream frame by frame.
pub(crate) async fn read_body(resp: Response<Incoming>) -> Result<Bytes> {
    let collected = resp
        .into_body()
        .collect()
        .await
        .map_err(Error::connection)?;
    Ok(collected.to_bytes())
}
