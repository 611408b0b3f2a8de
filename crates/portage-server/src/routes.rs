use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use portage_archive::ArchiveError;
use portage_proto::range::{parse_content_range, parse_range, ContentRange};
use portage_proto::{ArchiveFormat, ListItem, StatInfo, HDR_AUTO_EXTRACT, HDR_FILE_SIZE, HDR_UPLOADED_BYTES, MAX_EDIT_BYTES};

use crate::safety::FsRoot;
use crate::storage;

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: Arc<FsRoot>,
}

// ── Query types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
    pub recursive: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameQuery {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Deserialize)]
pub struct ChmodQuery {
    pub path: String,
    /// Octal, e.g. `755`.
    pub mode: String,
}

#[derive(Debug, Deserialize)]
pub struct CompressQuery {
    /// Comma-separated source paths.
    pub paths: String,
    pub output: String,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtractQuery {
    pub path: String,
    pub dest: Option<String>,
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn resolve(state: &AppState, client_path: &str) -> Result<PathBuf, StatusCode> {
    state.root.resolve(client_path).map_err(|err| {
        warn!("{err}");
        StatusCode::FORBIDDEN
    })
}

fn io_status(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn archive_status(err: &ArchiveError) -> StatusCode {
    match err {
        ArchiveError::PathEscape(_) => StatusCode::FORBIDDEN,
        ArchiveError::UnsupportedFormat(_) | ArchiveError::GzipSingleSource => {
            StatusCode::BAD_REQUEST
        }
        ArchiveError::Io(io) => io_status(io),
        ArchiveError::Zip(_) => StatusCode::BAD_REQUEST,
    }
}

/// Run a blocking filesystem closure off the reactor.
async fn blocking<T, F>(job: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            warn!("filesystem operation failed: {e}");
            io_status(&e)
        })
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET / — liveness, and the target of the client's handshake probe.
pub async fn health() -> &'static str {
    "portage file server"
}

/// GET /api/list?path=&recursive=1 — directory listing, optionally flattened.
pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<ListItem>>, StatusCode> {
    let path = q.path.unwrap_or_else(|| "/".into());
    let abs = resolve(&state, &path)?;
    let recursive = matches!(q.recursive.as_deref(), Some("1") | Some("true"));
    let root = Arc::clone(&state.root);
    let items = blocking(move || storage::list_dir(&root, &abs, recursive)).await?;
    Ok(Json(items))
}

/// GET /api/stat?path= — attributes of one path.
pub async fn stat(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<Json<StatInfo>, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    let root = Arc::clone(&state.root);
    let info = blocking(move || storage::stat_path(&root, &abs)).await?;
    Ok(Json(info))
}

/// GET /api/checksum?path= — hex SHA-256 of a file, as the response body.
pub async fn checksum(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<String, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    blocking(move || storage::file_sha256(&abs)).await
}

/// DELETE /api/delete?path= — remove a file or a directory tree.
pub async fn delete_path(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<StatusCode, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    let meta = tokio::fs::metadata(&abs).await.map_err(|e| io_status(&e))?;
    let removed = if meta.is_dir() {
        tokio::fs::remove_dir_all(&abs).await
    } else {
        tokio::fs::remove_file(&abs).await
    };
    removed.map_err(|e| {
        warn!("delete {} failed: {e}", abs.display());
        io_status(&e)
    })?;
    info!("deleted {}", state.root.display_path(&abs));
    Ok(StatusCode::OK)
}

/// POST /api/mkdir?path= — create a directory, parents included.
pub async fn mkdir(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<StatusCode, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    tokio::fs::create_dir_all(&abs)
        .await
        .map_err(|e| io_status(&e))?;
    Ok(StatusCode::CREATED)
}

/// POST /api/rename?old=&new= — rename or move within the root.
pub async fn rename(
    State(state): State<AppState>,
    Query(q): Query<RenameQuery>,
) -> Result<StatusCode, StatusCode> {
    let old = resolve(&state, &q.old)?;
    let new = resolve(&state, &q.new)?;
    tokio::fs::rename(&old, &new)
        .await
        .map_err(|e| io_status(&e))?;
    Ok(StatusCode::OK)
}

/// POST /api/chmod?path=&mode=755 — set permission bits.
pub async fn chmod(
    State(state): State<AppState>,
    Query(q): Query<ChmodQuery>,
) -> Result<StatusCode, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    let bits = u32::from_str_radix(&q.mode, 8).map_err(|_| StatusCode::BAD_REQUEST)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&abs, std::fs::Permissions::from_mode(bits))
            .await
            .map_err(|e| io_status(&e))?;
    }
    #[cfg(not(unix))]
    {
        // Permission bits have no equivalent here; accept and ignore.
        let _ = bits;
        tokio::fs::metadata(&abs).await.map_err(|e| io_status(&e))?;
    }
    Ok(StatusCode::OK)
}

/// GET /api/edit?path= — fetch a small text file.
pub async fn edit_get(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    let meta = tokio::fs::metadata(&abs).await.map_err(|e| io_status(&e))?;
    if meta.is_dir() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if meta.len() > MAX_EDIT_BYTES {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    let content = tokio::fs::read(&abs).await.map_err(|e| io_status(&e))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    ))
}

/// PUT /api/edit?path= — write back a small text file.
pub async fn edit_put(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
    body: bytes::Bytes,
) -> Result<StatusCode, StatusCode> {
    if body.len() as u64 > MAX_EDIT_BYTES {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    let abs = resolve(&state, &q.path)?;
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_status(&e))?;
    }
    tokio::fs::write(&abs, &body)
        .await
        .map_err(|e| io_status(&e))?;
    Ok(StatusCode::OK)
}

/// POST /api/compress?paths=a,b&output=&format= — archive server-side.
pub async fn compress(
    State(state): State<AppState>,
    Query(q): Query<CompressQuery>,
) -> Result<StatusCode, StatusCode> {
    let format: ArchiveFormat = q
        .format
        .as_deref()
        .unwrap_or("targz")
        .parse()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let sources: Vec<PathBuf> = q
        .paths
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| resolve(&state, s))
        .collect::<Result<_, _>>()?;
    if sources.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let output = resolve(&state, &q.output)?;
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_status(&e))?;
    }

    let result = tokio::task::spawn_blocking(move || {
        portage_archive::create_archive(format, &output, &sources)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    result.map_err(|e| {
        warn!("compress failed: {e}");
        archive_status(&e)
    })?;
    info!("compressed {} source(s) into {}", q.paths.split(',').count(), q.output);
    Ok(StatusCode::OK)
}

/// POST /api/extract?path=&dest= — extract an archive server-side.
///
/// Without `dest`, the archive extracts into a sibling directory named after
/// it with the archive extension dropped.
pub async fn extract(
    State(state): State<AppState>,
    Query(q): Query<ExtractQuery>,
) -> Result<StatusCode, StatusCode> {
    let archive = resolve(&state, &q.path)?;
    let dest = match q.dest.as_deref() {
        Some(dest) if !dest.is_empty() => resolve(&state, dest)?,
        _ => default_extract_dest(&archive),
    };

    let result = tokio::task::spawn_blocking({
        let archive = archive.clone();
        let dest = dest.clone();
        move || portage_archive::extract_archive(&archive, &dest)
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    result.map_err(|e| {
        warn!("extract {} failed: {e}", archive.display());
        archive_status(&e)
    })?;
    info!("extracted {} into {}", q.path, state.root.display_path(&dest));
    Ok(StatusCode::OK)
}

fn default_extract_dest(archive: &FsPath) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = ["tar.gz", "tgz", "zip", "tar", "gz"]
        .iter()
        .find_map(|ext| name.strip_suffix(&format!(".{ext}")))
        .unwrap_or(&name);
    archive
        .parent()
        .map(|p| p.join(stem))
        .unwrap_or_else(|| PathBuf::from(stem))
}

/// GET/HEAD /files/{*path} — streaming download with byte-range support.
pub async fn download(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let abs = resolve(&state, &path)?;
    let meta = tokio::fs::metadata(&abs).await.map_err(|e| io_status(&e))?;
    if meta.is_dir() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let size = meta.len();

    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);
    let (start, end, partial) = match requested {
        None => (0, size.saturating_sub(1), false),
        Some(r) => {
            if r.start >= size {
                return Err(StatusCode::RANGE_NOT_SATISFIABLE);
            }
            (r.start, r.end.map_or(size - 1, |e| e.min(size - 1)), true)
        }
    };
    let content_length = if size == 0 { 0 } else { end - start + 1 };

    let body = Body::from_stream(stream_file(abs, start, content_length));
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, "application/octet-stream".parse().unwrap());
    response_headers.insert(header::CONTENT_LENGTH, content_length.to_string().parse().unwrap());
    response_headers.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());

    if partial {
        let span = ContentRange { start, end, total: size };
        response_headers.insert(header::CONTENT_RANGE, span.format().parse().unwrap());
        Ok((StatusCode::PARTIAL_CONTENT, response_headers, body))
    } else {
        Ok((StatusCode::OK, response_headers, body))
    }
}

fn stream_file(
    path: PathBuf,
    start: u64,
    length: u64,
) -> impl futures_util::Stream<Item = std::io::Result<bytes::Bytes>> + Send + 'static {
    async_stream::stream! {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                yield Err(e);
                return;
            }
        };
        if start > 0 {
            if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
                yield Err(e);
                return;
            }
        }

        let mut remaining = length;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let to_read = (remaining as usize).min(buf.len());
            match file.read(&mut buf[..to_read]).await {
                Ok(0) => break,
                Ok(n) => {
                    remaining -= n as u64;
                    yield Ok(bytes::Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    }
}

/// PUT /api/upload?path= — streaming upload.
///
/// A `Content-Range: bytes S-E/T` header addresses one span of the target
/// without truncating it, which is how parallel chunk uploads coexist on one
/// file. Without the header, the upload replaces the file. The
/// auto-extract header makes the server unpack the uploaded `.tar.gz` in
/// place after replying.
pub async fn upload(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, StatusCode> {
    let abs = resolve(&state, &q.path)?;
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_status(&e))?;
    }

    let span = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range);
    let auto_extract = headers.contains_key(HDR_AUTO_EXTRACT);

    let mut file = match span {
        Some(cr) => {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&abs)
                .await
                .map_err(|e| io_status(&e))?;
            file.seek(std::io::SeekFrom::Start(cr.start))
                .await
                .map_err(|e| io_status(&e))?;
            file
        }
        None => tokio::fs::File::create(&abs)
            .await
            .map_err(|e| io_status(&e))?,
    };

    let mut written: u64 = 0;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let data = chunk.map_err(|e| {
            warn!("upload body aborted: {e}");
            StatusCode::BAD_REQUEST
        })?;
        file.write_all(&data).await.map_err(|e| {
            warn!("upload write failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
        written += data.len() as u64;
    }
    // Durable before the client counts the span as done.
    file.sync_all()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if let Some(cr) = span {
        let expected = cr.end - cr.start + 1;
        if written != expected {
            warn!(
                "upload span {} got {written} bytes, expected {expected}",
                cr.format()
            );
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let total = tokio::fs::metadata(&abs)
        .await
        .map(|m| m.len())
        .unwrap_or(written);
    debug!(
        "upload {} wrote {written} bytes (file now {total})",
        state.root.display_path(&abs)
    );

    if auto_extract {
        let archive = abs.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || storage::extract_uploaded_archive(&archive))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("auto-extract failed: {err}"),
                Err(err) => warn!("auto-extract task failed: {err}"),
            }
        });
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(HDR_UPLOADED_BYTES, written.to_string().parse().unwrap());
    response_headers.insert(HDR_FILE_SIZE, total.to_string().parse().unwrap());
    Ok((StatusCode::CREATED, response_headers))
}
