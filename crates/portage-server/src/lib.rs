//! The portage file server.
//!
//! One KCP listener; each accepted connection is wrapped in the sealed-frame
//! layer and multiplexed, and every mux stream the client opens carries one
//! HTTP/1.1 exchange served by the axum router. A client holding the wrong
//! passphrase produces frames that fail authentication, so its session dies
//! without a single byte of reply.

mod routes;
pub mod safety;
mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use portage_transport::{derive_key, listen, secure, KcpStream, StreamAcceptor};

pub use routes::AppState;
pub use safety::FsRoot;

/// Everything the server needs to run.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub root: PathBuf,
    pub passphrase: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::health))
        .route("/files/{*path}", get(routes::download))
        .route("/api/upload", put(routes::upload))
        .route("/api/list", get(routes::list))
        .route("/api/stat", get(routes::stat))
        .route("/api/checksum", get(routes::checksum))
        .route("/api/delete", delete(routes::delete_path))
        .route("/api/mkdir", post(routes::mkdir))
        .route("/api/rename", post(routes::rename))
        .route("/api/chmod", post(routes::chmod))
        .route("/api/edit", get(routes::edit_get).put(routes::edit_put))
        .route("/api/compress", post(routes::compress))
        .route("/api/extract", post(routes::extract))
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024 * 1024)) // 4 GB max
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the task is dropped or the listener fails fatally.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let key = derive_key(&config.passphrase)?;
    let root = Arc::new(FsRoot::new(&config.root)?);
    info!("serving {}", root.root().display());

    let app = build_router(AppState { root });
    let mut listener = listen(config.bind).await?;
    info!("portage server listening on {} (KCP)", config.bind);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        debug!(%peer, "transport connection accepted");
        tokio::spawn(handle_connection(stream, peer, key, app.clone()));
    }
}

async fn handle_connection(stream: KcpStream, peer: SocketAddr, key: [u8; 32], app: Router) {
    let io = secure(stream, &key);
    let mut acceptor = StreamAcceptor::server(io, peer);
    while let Some(stream) = acceptor.accept().await {
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("stream connection ended: {err}");
            }
        });
    }
    debug!(%peer, "session ended");
}
