//! zip codec.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{ArchiveError, Result};

fn options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn add_path<W: Write + io::Seek>(
    writer: &mut ZipWriter<W>,
    path: &Path,
    name: &str,
) -> Result<()> {
    if path.is_dir() {
        writer.add_directory(format!("{name}/"), options())?;
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let child = entry.path();
            let child_name = format!("{}/{}", name, entry.file_name().to_string_lossy());
            add_path(writer, &child, &child_name)?;
        }
    } else {
        writer.start_file(name, options())?;
        let mut reader = BufReader::new(File::open(path)?);
        io::copy(&mut reader, writer)?;
    }
    Ok(())
}

/// Create a zip archive of the given sources; each source appears under its
/// own basename at the archive root.
pub fn create_zip(output: &Path, sources: &[PathBuf]) -> Result<()> {
    let file = BufWriter::new(File::create(output)?);
    let mut writer = ZipWriter::new(file);
    for source in sources {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchiveError::PathEscape(source.display().to_string()))?;
        add_path(&mut writer, source, &name)?;
    }
    writer.finish()?.flush()?;
    Ok(())
}

/// Extract a zip archive into `dest`. Entries whose names would escape the
/// destination are rejected outright.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = BufReader::new(File::open(archive)?);
    let mut zip = ZipArchive::new(file)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(ArchiveError::PathEscape(entry.name().to_string()));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&target)?);
        io::copy(&mut entry, &mut out)?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn zip_round_trip_with_multiple_sources() {
        let work = tempfile::tempdir().unwrap();
        let dir = work.path().join("photos");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("one.raw"), vec![1u8; 2048]).unwrap();
        let lone = work.path().join("notes.md");
        fs::write(&lone, b"# notes").unwrap();

        let archive = work.path().join("bundle.zip");
        create_zip(&archive, &[dir, lone]).unwrap();

        let out = work.path().join("out");
        extract_zip(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("photos/one.raw")).unwrap(), vec![1u8; 2048]);
        assert_eq!(fs::read(out.join("notes.md")).unwrap(), b"# notes");
    }
}
