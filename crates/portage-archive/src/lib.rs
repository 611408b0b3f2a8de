//! Archive codecs for the compress/extract actions and pack transfer.
//!
//! Thin wrappers over `tar`, `flate2` and `zip`: create an archive from a set
//! of sources, or extract one into a destination directory. Every extractor
//! refuses entries that would land outside the destination.
//!
//! All functions here do blocking I/O; async callers run them through
//! `tokio::task::spawn_blocking`.

use std::path::{Path, PathBuf};

use portage_proto::ArchiveFormat;
use thiserror::Error;

mod tarball;
mod zipfile;

pub use tarball::{compress_to_tar_gz, extract_tar, is_tar_gz};
pub use zipfile::{create_zip, extract_zip};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("zip: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive entry escapes destination: {0}")]
    PathEscape(String),
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),
    #[error("gzip accepts exactly one source file")]
    GzipSingleSource,
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Create an archive of `sources` at `output` in the requested format.
pub fn create_archive(format: ArchiveFormat, output: &Path, sources: &[PathBuf]) -> Result<()> {
    match format {
        ArchiveFormat::Zip => create_zip(output, sources),
        ArchiveFormat::Tar => tarball::create_tar(output, sources, false),
        ArchiveFormat::TarGz => tarball::create_tar(output, sources, true),
        ArchiveFormat::Gzip => {
            let [source] = sources else {
                return Err(ArchiveError::GzipSingleSource);
            };
            tarball::create_gzip(output, source)
        }
    }
}

/// Extract `archive` into `dest`, choosing the codec from the file extension.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive.to_string_lossy().to_ascii_lowercase();
    if name.ends_with(".zip") {
        extract_zip(archive, dest)
    } else if name.ends_with(".tar") || is_tar_gz(&name) {
        extract_tar(archive, dest)
    } else if name.ends_with(".gz") {
        tarball::extract_gzip(archive, dest)
    } else {
        let ext = archive
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        Err(ArchiveError::UnsupportedFormat(ext))
    }
}
