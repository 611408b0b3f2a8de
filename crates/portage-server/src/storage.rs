//! Filesystem helpers behind the route handlers.
//!
//! Everything here is blocking; handlers call in through
//! `tokio::task::spawn_blocking`. Listing, hashing and the permission-string
//! rendering live here so the handlers stay thin.

use std::fs::Metadata;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use portage_proto::{ListItem, StatInfo};

use crate::safety::FsRoot;

fn mod_time_secs(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

/// Render `ls -l` style permissions, e.g. `drwxr-xr-x`.
pub fn mode_string(meta: &Metadata) -> String {
    let bits = mode_bits(meta);
    let mut out = String::with_capacity(10);
    out.push(if meta.is_dir() { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let triad = (bits >> shift) & 0o7;
        out.push(if triad & 0o4 != 0 { 'r' } else { '-' });
        out.push(if triad & 0o2 != 0 { 'w' } else { '-' });
        out.push(if triad & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

fn item_for(root: &FsRoot, path: &Path, meta: &Metadata) -> ListItem {
    ListItem {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: root.display_path(path),
        size: if meta.is_dir() { 0 } else { meta.len() },
        mod_time: mod_time_secs(meta),
        is_dir: meta.is_dir(),
        mode: mode_string(meta),
    }
}

/// List `dir`, optionally flattening the whole subtree. Entries that vanish
/// mid-walk are skipped rather than failing the listing.
pub fn list_dir(root: &FsRoot, dir: &Path, recursive: bool) -> std::io::Result<Vec<ListItem>> {
    let mut items = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if recursive && meta.is_dir() {
                stack.push(path.clone());
            }
            items.push(item_for(root, &path, &meta));
        }
    }
    items.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(items)
}

pub fn stat_path(root: &FsRoot, path: &Path) -> std::io::Result<StatInfo> {
    let meta = std::fs::metadata(path)?;
    Ok(StatInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: root.display_path(path),
        size: if meta.is_dir() { 0 } else { meta.len() },
        mod_time: mod_time_secs(&meta),
        is_dir: meta.is_dir(),
        mode: mode_string(&meta),
        mode_num: mode_bits(&meta),
    })
}

/// Hex SHA-256 of a file, streamed in 1 MiB reads.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Extract an uploaded archive next to itself, then delete the archive.
///
/// The delete retries with exponential backoff because the extracting
/// process may still hold the file open on some platforms.
pub fn extract_uploaded_archive(archive: &Path) -> Result<(), String> {
    let dest = archive
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    portage_archive::extract_tar(archive, &dest).map_err(|e| e.to_string())?;

    let mut delay = Duration::from_millis(100);
    for attempt in 1..=5 {
        match std::fs::remove_file(archive) {
            Ok(()) => return Ok(()),
            Err(err) if attempt == 5 => {
                warn!(archive = %archive.display(), error = %err, "could not remove archive");
                return Err(err.to_string());
            }
            Err(_) => {
                std::thread::sleep(delay);
                delay *= 2;
            }
        }
    }
    Ok(())
}
