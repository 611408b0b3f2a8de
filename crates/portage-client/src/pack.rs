//! Pack transfer: compress first, move one archive, extract on arrival.
//!
//! Directories always pack (the chunk engine only moves single files);
//! single files pack once they reach the configured threshold. Packed
//! uploads ride the auto-extract header so the server unpacks and removes
//! the archive itself. Packed downloads ask the server to build a `.tar.gz`,
//! fetch it through the ordinary chunk engine, then extract locally.
//!
//! Pack setup failures fall back to the plain path; packing is an
//! optimization, never a correctness requirement.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use portage_proto::ArchiveFormat;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::transfer::{download_file, upload_auto_extract, upload_file, CancelFlag, ProgressFn};

/// Pack-transfer policy knobs. Disabled by default.
#[derive(Debug, Clone, Copy)]
pub struct PackConfig {
    pub enabled: bool,
    /// Files at or above this size pack; directories always do.
    pub threshold_bytes: u64,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self { enabled: false, threshold_bytes: 10 * 1024 * 1024 }
    }
}

/// Decide whether a source should take the packed path.
pub fn should_pack(config: &PackConfig, is_dir: bool, size: u64) -> bool {
    config.enabled && (is_dir || size >= config.threshold_bytes)
}

fn scratch_archive(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{prefix}_{}.tar.gz", Uuid::new_v4()))
}

/// Upload `local` (file or directory) honoring the pack policy.
pub async fn upload_packed(
    client: &Arc<Client>,
    local: &Path,
    remote: &str,
    config: &PackConfig,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    cancel.check()?;
    let meta = tokio::fs::metadata(local).await?;
    if !should_pack(config, meta.is_dir(), meta.len()) {
        return upload_file(client, local, remote, progress, cancel).await;
    }

    let archive = scratch_archive("pack_upload");
    let source = local.to_path_buf();
    let output = archive.clone();
    let packed =
        tokio::task::spawn_blocking(move || portage_archive::compress_to_tar_gz(&source, &output))
            .await;
    match packed {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            // Couldn't build the archive locally; the plain path still works
            // for files. Directories have nothing to fall back to.
            let _ = tokio::fs::remove_file(&archive).await;
            if meta.is_dir() {
                return Err(Error::Io(std::io::Error::other(err.to_string())));
            }
            warn!(error = %err, "pack failed, falling back to plain upload");
            return upload_file(client, local, remote, progress, cancel).await;
        }
        Err(join_err) => {
            let _ = tokio::fs::remove_file(&archive).await;
            return Err(Error::Io(std::io::Error::other(join_err.to_string())));
        }
    }

    debug!(local = %local.display(), remote, "packed upload");
    let remote_archive = format!("{}.tar.gz", remote.trim_end_matches('/'));
    let sent = upload_auto_extract(client, &archive, &remote_archive, progress, cancel).await;
    let _ = tokio::fs::remove_file(&archive).await;
    sent
}

/// Download `remote` honoring the pack policy.
pub async fn download_packed(
    client: &Arc<Client>,
    remote: &str,
    local: &Path,
    config: &PackConfig,
    progress: Option<ProgressFn>,
    cancel: &CancelFlag,
) -> Result<()> {
    cancel.check()?;
    let stat = match client.stat(remote).await {
        Ok(stat) => stat,
        // Let the plain path produce the canonical error for a missing file.
        Err(_) => return download_file(client, remote, local, progress, cancel).await,
    };
    if !should_pack(config, stat.is_dir, stat.size) {
        return download_file(client, remote, local, progress, cancel).await;
    }

    let remote_archive = format!("{}.tar.gz", remote.trim_end_matches('/'));
    if let Err(err) = client
        .compress_remote(
            std::slice::from_ref(&remote.to_string()),
            &remote_archive,
            ArchiveFormat::TarGz,
        )
        .await
    {
        if stat.is_dir {
            return Err(err);
        }
        warn!(error = %err, "remote pack failed, falling back to plain download");
        return download_file(client, remote, local, progress, cancel).await;
    }

    debug!(remote, local = %local.display(), "packed download");
    let archive = scratch_archive("pack_download");
    let fetched = download_file(client, &remote_archive, &archive, progress, cancel).await;
    // The server-side archive is scratch either way.
    let _ = client.delete(&remote_archive).await;
    if let Err(err) = fetched {
        let _ = tokio::fs::remove_file(&archive).await;
        return Err(err);
    }

    // The archive holds `basename(remote)/...`; extract into the directory
    // that makes that tree land at `local`.
    let remote_base = remote.rsplit('/').next().unwrap_or(remote).to_string();
    let local_base = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extract_dir = if stat.is_dir && local_base != remote_base {
        local.to_path_buf()
    } else {
        match local.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    };

    let archive_for_extract = archive.clone();
    let dest = extract_dir.clone();
    let extracted = tokio::task::spawn_blocking(move || {
        portage_archive::extract_tar(&archive_for_extract, &dest)
    })
    .await;
    let _ = tokio::fs::remove_file(&archive).await;
    match extracted {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Error::Io(std::io::Error::other(err.to_string()))),
        Err(join_err) => Err(Error::Io(std::io::Error::other(join_err.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_never_packs() {
        let config = PackConfig::default();
        assert!(!should_pack(&config, true, 0));
        assert!(!should_pack(&config, false, u64::MAX));
    }

    #[test]
    fn directories_always_pack_when_enabled() {
        let config = PackConfig { enabled: true, threshold_bytes: 10 * 1024 * 1024 };
        assert!(should_pack(&config, true, 0));
    }

    #[test]
    fn files_pack_at_the_threshold() {
        let config = PackConfig { enabled: true, threshold_bytes: 10 * 1024 * 1024 };
        assert!(!should_pack(&config, false, 10 * 1024 * 1024 - 1));
        assert!(should_pack(&config, false, 10 * 1024 * 1024));
    }
}
