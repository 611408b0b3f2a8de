//! The chunked transfer engine.
//!
//! Files below [`CHUNK_THRESHOLD`] move as a single streamed request. Larger
//! files are split by [`plan_chunks`] and moved by up to
//! [`TRANSFER_WORKERS`] concurrent workers, each on its own mux stream:
//! uploads address disjoint spans with `Content-Range`, downloads fetch
//! `Range` spans into a temporary chunk directory and merge them in index
//! order. Every download ends with a SHA-256 comparison against the server.
//!
//! Progress is sampled, not pushed: workers bump a shared byte counter and a
//! 500 ms ticker turns it into (fraction done, MiB/s) callbacks.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Frame};
use hyper::{header, Method, Request, StatusCode};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use portage_proto::range::{format_range, format_range_from, ContentRange};
use portage_proto::{CHUNK_THRESHOLD, HDR_AUTO_EXTRACT, TRANSFER_WORKERS};

use crate::chunk::{plan_chunks, ChunkRange};
use crate::client::{build_query, encode_path, expect_success, Client};
use crate::error::{Error, Result};

/// Progress callback: `(fraction_done, mib_per_second)`.
pub type ProgressFn = Arc<dyn Fn(f64, f64) + Send + Sync>;

/// Cooperative cancellation shared between a task and its workers. Checked
/// at chunk boundaries and between body frames, so cancellation lands within
/// one frame's worth of work.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

// ── Progress sampling ──

struct Ticker {
    counter: Arc<AtomicU64>,
    total: u64,
    base: u64,
    started: Instant,
    progress: Option<ProgressFn>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Start sampling `counter` every 500 ms. `base` is the byte count that
    /// was already present before this session (resume), excluded from the
    /// speed figure.
    fn start(counter: Arc<AtomicU64>, total: u64, base: u64, progress: Option<ProgressFn>) -> Self {
        let started = Instant::now();
        let handle = progress.clone().map(|progress| {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(500));
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    emit(&progress, &counter, total, base, started, false);
                }
            })
        });
        Self { counter, total, base, started, progress, handle }
    }

    /// Stop the ticker and emit the terminal 100% sample.
    fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        if let Some(progress) = &self.progress {
            emit(progress, &self.counter, self.total, self.base, self.started, true);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn emit(
    progress: &ProgressFn,
    counter: &AtomicU64,
    total: u64,
    base: u64,
    started: Instant,
    done: bool,
) {
    let bytes = counter.load(Ordering::Relaxed);
    let fraction = if done {
        1.0
    } else if total == 0 {
        0.0
    } else {
        (bytes as f64 / total as f64).min(1.0)
    };
    let secs = started.elapsed().as_secs_f64().max(1e-3);
    let speed = bytes.saturating_sub(base) as f64 / (1024.0 * 1024.0) / secs;
    progress(fraction, speed);
}

// ── Upload ──

/// Upload a local file to `remote`. Splits into concurrent chunk requests at
/// the threshold; below it, one streamed request.
pub async fn upload_file(
    client: &Arc<Client>,
    local: &Path,
    remote: &str,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    cancel.check()?;
    let meta = fs::metadata(local).await?;
    if !meta.is_file() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", local.display()),
        )));
    }
    let size = meta.len();
    let counter = Arc::new(AtomicU64::new(0));
    let ticker = Ticker::start(Arc::clone(&counter), size, 0, progress);

    if size < CHUNK_THRESHOLD {
        upload_span(client, local, remote, None, size, false, &counter, cancel).await?;
    } else {
        upload_parallel(client, local, remote, size, &counter, cancel).await?;
    }
    ticker.finish();
    debug!(local = %local.display(), remote, size, "upload complete");
    Ok(())
}

/// Upload a packed archive in one request and have the server extract it in
/// place.
pub(crate) async fn upload_auto_extract(
    client: &Arc<Client>,
    local: &Path,
    remote: &str,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    cancel.check()?;
    let size = fs::metadata(local).await?.len();
    let counter = Arc::new(AtomicU64::new(0));
    let ticker = Ticker::start(Arc::clone(&counter), size, 0, progress);
    upload_span(client, local, remote, None, size, true, &counter, cancel).await?;
    ticker.finish();
    Ok(())
}

async fn upload_parallel(
    client: &Arc<Client>,
    local: &Path,
    remote: &str,
    size: u64,
    counter: &Arc<AtomicU64>,
    cancel: &CancelFlag,
) -> Result<()> {
    let chunks = plan_chunks(size, TRANSFER_WORKERS, CHUNK_THRESHOLD);
    debug!(remote, size, chunks = chunks.len(), "parallel upload");

    let mut set = JoinSet::new();
    for range in chunks {
        let client = Arc::clone(client);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let counter = Arc::clone(counter);
        let cancel = cancel.clone();
        set.spawn(async move {
            cancel.check()?;
            upload_span(&client, &local, &remote, Some(range), size, false, &counter, &cancel)
                .await
        });
    }
    join_workers(set, cancel).await
}

/// One upload request: the whole file, or the span named by `range` with a
/// `Content-Range` header.
#[allow(clippy::too_many_arguments)]
async fn upload_span(
    client: &Arc<Client>,
    local: &Path,
    remote: &str,
    range: Option<ChunkRange>,
    total: u64,
    auto_extract: bool,
    counter: &Arc<AtomicU64>,
    cancel: &CancelFlag,
) -> Result<()> {
    let mut file = File::open(local).await?;
    let (offset, len) = match range {
        Some(r) => (r.start, r.len()),
        None => (0, total),
    };
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let query = build_query(&[("path", remote)]);
    let mut builder = Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/upload{query}"))
        .header(header::HOST, "portage")
        .header(header::CONTENT_LENGTH, len);
    if let Some(r) = range {
        let span = ContentRange { start: r.start, end: r.end - 1, total };
        builder = builder.header(header::CONTENT_RANGE, span.format());
    }
    if auto_extract {
        builder = builder.header(HDR_AUTO_EXTRACT, "1");
    }
    let req = builder
        .body(counting_body(file, len, Arc::clone(counter), cancel.clone()))
        .map_err(Error::connection)?;

    let resp = client.request(req).await;
    cancel.check()?;
    expect_success(resp?).await.map(drop)
}

/// Body that streams `len` bytes from `file`, counting what it hands to the
/// connection and failing fast once canceled.
fn counting_body(
    file: File,
    len: u64,
    counter: Arc<AtomicU64>,
    cancel: CancelFlag,
) -> impl Body<Data = Bytes, Error = std::io::Error> + Send + 'static {
    let stream =
        tokio_util::io::ReaderStream::with_capacity(file.take(len), 64 * 1024).map(move |chunk| {
            if cancel.is_canceled() {
                return Err(std::io::Error::other("transfer canceled"));
            }
            let data = chunk?;
            counter.fetch_add(data.len() as u64, Ordering::Relaxed);
            Ok(Frame::data(data))
        });
    StreamBody::new(stream)
}

// ── Download ──

/// Download `remote` into `local`, verifying the SHA-256 afterwards.
///
/// A local file already at (or past) the remote size is treated as complete
/// and nothing is fetched. A shorter local file resumes from its length on
/// the single-request path; the parallel path refetches from scratch.
pub async fn download_file(
    client: &Arc<Client>,
    remote: &str,
    local: &Path,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    cancel.check()?;
    let size = client.remote_size(remote).await?;

    if let Ok(meta) = fs::metadata(local).await {
        if meta.is_file() && meta.len() >= size {
            debug!(remote, local = %local.display(), "already complete, skipping");
            if let Some(progress) = progress {
                progress(1.0, 0.0);
            }
            return Ok(());
        }
    }
    if let Some(parent) = local.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    if size < CHUNK_THRESHOLD {
        download_single(client, remote, local, size, progress, cancel).await?;
    } else {
        download_parallel(client, remote, local, size, progress, cancel).await?;
    }
    verify_checksum(client, remote, local).await?;
    debug!(remote, local = %local.display(), size, "download complete");
    Ok(())
}

async fn download_single(
    client: &Arc<Client>,
    remote: &str,
    local: &Path,
    size: u64,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    let mut offset = match fs::metadata(local).await {
        Ok(meta) if meta.is_file() => meta.len().min(size),
        _ => 0,
    };

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(format!("/files{}", encode_path(remote)))
        .header(header::HOST, "portage");
    if offset > 0 {
        builder = builder.header(header::RANGE, format_range_from(offset));
    }
    let req = builder
        .body(Empty::<Bytes>::new())
        .map_err(Error::connection)?;
    let resp = expect_success(client.request(req).await?).await?;
    if offset > 0 && resp.status() != StatusCode::PARTIAL_CONTENT {
        // Server sent the whole file; restart rather than corrupt the tail.
        offset = 0;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(local)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let counter = Arc::new(AtomicU64::new(offset));
    let ticker = Ticker::start(Arc::clone(&counter), size, offset, progress);

    let mut body = resp.into_body();
    while let Some(frame) = body.frame().await {
        cancel.check()?;
        let frame = frame.map_err(Error::connection)?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data).await?;
            counter.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
    }
    file.flush().await?;
    ticker.finish();
    Ok(())
}

async fn download_parallel(
    client: &Arc<Client>,
    remote: &str,
    local: &Path,
    size: u64,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", local.display()),
            ))
        })?;
    let parent = match local.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp_dir = parent.join(format!(".tmp_{name}"));
    let _ = fs::remove_dir_all(&tmp_dir).await;
    fs::create_dir_all(&tmp_dir).await?;
    // Removes the chunk directory on every exit path.
    let _tmp_guard = TempDirGuard(tmp_dir.clone());

    let chunks = plan_chunks(size, TRANSFER_WORKERS, CHUNK_THRESHOLD);
    debug!(remote, size, chunks = chunks.len(), "parallel download");

    let counter = Arc::new(AtomicU64::new(0));
    let ticker = Ticker::start(Arc::clone(&counter), size, 0, progress);
    let semaphore = Arc::new(Semaphore::new(TRANSFER_WORKERS as usize));

    let mut set = JoinSet::new();
    for range in &chunks {
        let range = *range;
        let client = Arc::clone(client);
        let remote = remote.to_string();
        let chunk_path = tmp_dir.join(chunk_file_name(range.index));
        let counter = Arc::clone(&counter);
        let cancel = cancel.clone();
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return Err(Error::Canceled);
            };
            cancel.check()?;
            download_chunk(&client, &remote, &chunk_path, range, &counter, &cancel).await
        });
    }
    join_workers(set, cancel).await?;

    // Assemble in index order; a failure here leaves no half-written target.
    let merge = merge_chunks(&tmp_dir, local, chunks.len() as u64).await;
    if merge.is_err() {
        let _ = fs::remove_file(local).await;
    }
    merge?;
    ticker.finish();
    Ok(())
}

fn chunk_file_name(index: u64) -> String {
    format!("chunk_{index:04}.tmp")
}

async fn download_chunk(
    client: &Arc<Client>,
    remote: &str,
    chunk_path: &Path,
    range: ChunkRange,
    counter: &Arc<AtomicU64>,
    cancel: &CancelFlag,
) -> Result<()> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("/files{}", encode_path(remote)))
        .header(header::HOST, "portage")
        .header(header::RANGE, format_range(range.start, range.end - 1))
        .body(Empty::<Bytes>::new())
        .map_err(Error::connection)?;
    let resp = expect_success(client.request(req).await?).await?;
    if resp.status() != StatusCode::PARTIAL_CONTENT {
        return Err(Error::Protocol {
            status: resp.status().as_u16(),
            message: "server ignored range request".into(),
        });
    }

    let mut file = File::create(chunk_path).await?;
    let mut body = resp.into_body();
    let mut written = 0u64;
    while let Some(frame) = body.frame().await {
        cancel.check()?;
        let frame = frame.map_err(Error::connection)?;
        if let Ok(data) = frame.into_data() {
            file.write_all(&data).await?;
            written += data.len() as u64;
            counter.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
    }
    file.flush().await?;

    if written != range.len() {
        return Err(Error::Protocol {
            status: StatusCode::PARTIAL_CONTENT.as_u16(),
            message: format!(
                "chunk {} returned {written} bytes, expected {}",
                range.index,
                range.len()
            ),
        });
    }
    Ok(())
}

async fn merge_chunks(tmp_dir: &Path, local: &Path, count: u64) -> Result<()> {
    let mut out = File::create(local).await?;
    for index in 0..count {
        let mut chunk = File::open(tmp_dir.join(chunk_file_name(index))).await?;
        tokio::io::copy(&mut chunk, &mut out).await?;
    }
    out.flush().await?;
    Ok(())
}

/// Drain a worker set; the first failure aborts the rest. A set cancel flag
/// overrides whatever error the losing workers happened to report.
async fn join_workers(mut set: JoinSet<Result<()>>, cancel: &CancelFlag) -> Result<()> {
    let mut result = Ok(());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                set.abort_all();
                result = Err(err);
                break;
            }
            Err(join_err) => {
                set.abort_all();
                result = Err(Error::Connection(format!("worker task failed: {join_err}")));
                break;
            }
        }
    }
    if cancel.is_canceled() {
        return Err(Error::Canceled);
    }
    result
}

// ── Integrity ──

async fn verify_checksum(client: &Arc<Client>, remote: &str, local: &Path) -> Result<()> {
    let remote_sum = client.checksum(remote).await?;
    let local_sum = file_sha256(local).await?;
    if !remote_sum.eq_ignore_ascii_case(&local_sum) {
        warn!(remote, %remote_sum, %local_sum, "checksum mismatch");
        return Err(Error::Integrity { remote: remote_sum, local: local_sum });
    }
    Ok(())
}

/// Hex SHA-256 of a local file.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

struct TempDirGuard(PathBuf);

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    #[tokio::test]
    async fn file_sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        stdfs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn merge_reassembles_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join(".tmp_big.bin");
        stdfs::create_dir_all(&tmp).unwrap();
        stdfs::write(tmp.join(chunk_file_name(0)), b"aaaa").unwrap();
        stdfs::write(tmp.join(chunk_file_name(1)), b"bb").unwrap();
        stdfs::write(tmp.join(chunk_file_name(2)), b"c").unwrap();

        let out = dir.path().join("big.bin");
        merge_chunks(&tmp, &out, 3).await.unwrap();
        assert_eq!(stdfs::read(&out).unwrap(), b"aaaabbc");
    }

    #[test]
    fn canceled_flag_turns_into_the_canceled_error() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        flag.cancel();
        assert!(matches!(flag.check(), Err(Error::Canceled)));
    }
}
