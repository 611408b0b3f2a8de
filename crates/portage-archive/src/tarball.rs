//! tar, tar.gz and single-file gzip codecs.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::{ArchiveError, Result};

/// True for the extensions the pack-transfer path produces.
pub fn is_tar_gz(name: &str) -> bool {
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Archive entry name for a source: its final path component, so the archive
/// always contains `basename/...` regardless of where the source lived.
fn entry_name(source: &Path) -> Result<PathBuf> {
    source
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ArchiveError::PathEscape(source.display().to_string()))
}

fn append_source<W: Write>(builder: &mut tar::Builder<W>, source: &Path) -> Result<()> {
    let name = entry_name(source)?;
    if source.is_dir() {
        builder.append_dir_all(&name, source)?;
    } else {
        builder.append_path_with_name(source, &name)?;
    }
    Ok(())
}

/// Create a tar (optionally gzipped) of the given sources.
pub fn create_tar(output: &Path, sources: &[PathBuf], gzip: bool) -> Result<()> {
    let file = BufWriter::new(File::create(output)?);
    if gzip {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for source in sources {
            append_source(&mut builder, source)?;
        }
        builder.into_inner()?.finish()?.flush()?;
    } else {
        let mut builder = tar::Builder::new(file);
        for source in sources {
            append_source(&mut builder, source)?;
        }
        builder.into_inner()?.flush()?;
    }
    Ok(())
}

/// Pack-transfer helper: one source, tar.gz output.
pub fn compress_to_tar_gz(source: &Path, output: &Path) -> Result<()> {
    debug!(source = %source.display(), output = %output.display(), "packing tar.gz");
    create_tar(output, std::slice::from_ref(&source.to_path_buf()), true)
}

/// Reject entry paths that could climb out of the destination (tar slip).
fn check_entry_path(entry: &Path) -> Result<()> {
    for component in entry.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::PathEscape(entry.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn unpack_entries<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Extract a `.tar`, `.tar.gz` or `.tgz` archive into `dest`.
pub fn extract_tar(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive.to_string_lossy().to_ascii_lowercase();
    let file = BufReader::new(File::open(archive)?);
    if is_tar_gz(&name) {
        unpack_entries(tar::Archive::new(GzDecoder::new(file)), dest)
    } else {
        unpack_entries(tar::Archive::new(file), dest)
    }
}

/// Gzip a single file.
pub fn create_gzip(output: &Path, source: &Path) -> Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let writer = BufWriter::new(File::create(output)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Decompress a plain `.gz` file into `dest`, dropping the extension.
pub fn extract_gzip(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let stem = archive
        .file_stem()
        .ok_or_else(|| ArchiveError::PathEscape(archive.display().to_string()))?;
    let target = dest.join(stem);
    let mut decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
    let mut out = BufWriter::new(File::create(target)?);
    io::copy(&mut decoder, &mut out)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn tar_gz_round_trip_keeps_tree_shape() {
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("payload");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("nested/b.bin"), vec![7u8; 4096]).unwrap();

        let archive = work.path().join("payload.tar.gz");
        compress_to_tar_gz(&src, &archive).unwrap();

        let out = work.path().join("out");
        extract_tar(&archive, &out).unwrap();

        assert_eq!(fs::read(out.join("payload/a.txt")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(out.join("payload/nested/b.bin")).unwrap(),
            vec![7u8; 4096]
        );
    }

    #[test]
    fn single_file_tar_contains_basename() {
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("report.csv");
        fs::write(&src, b"x,y\n1,2\n").unwrap();

        let archive = work.path().join("report.tar");
        create_tar(&archive, &[src], false).unwrap();

        let out = work.path().join("out");
        extract_tar(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("report.csv")).unwrap(), b"x,y\n1,2\n");
    }

    #[test]
    fn gzip_round_trip() {
        let work = tempfile::tempdir().unwrap();
        let src = work.path().join("log.txt");
        fs::write(&src, b"0123456789").unwrap();

        let archive = work.path().join("log.txt.gz");
        create_gzip(&archive, &src).unwrap();

        let out = work.path().join("out");
        extract_gzip(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("log.txt")).unwrap(), b"0123456789");
    }

    #[test]
    fn parent_components_are_rejected() {
        assert!(check_entry_path(Path::new("ok/inner.txt")).is_ok());
        assert!(check_entry_path(Path::new("../evil.txt")).is_err());
        assert!(check_entry_path(Path::new("a/../../evil.txt")).is_err());
    }
}
