//! Shared wire types and constants for the portage protocol.
//!
//! The client and server speak plain HTTP/1.1 over multiplexed transport
//! streams. This crate holds the pieces both sides agree on: the listing and
//! stat JSON shapes, the action query names, byte-range header helpers, and
//! the transfer tuning constants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod range;

/// Files at or above this size transfer as parallel chunks; chunk size is
/// also rounded up to at least this value.
pub const CHUNK_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Default worker count for parallel chunked transfers.
pub const TRANSFER_WORKERS: u64 = 8;

/// Upper bound for edit-get/edit-put payloads.
pub const MAX_EDIT_BYTES: u64 = 1024 * 1024;

/// Request header: ask the server to extract an uploaded `.tar.gz` in place.
pub const HDR_AUTO_EXTRACT: &str = "x-auto-extract";

/// Response header: bytes written by this upload request.
pub const HDR_UPLOADED_BYTES: &str = "x-uploaded-bytes";

/// Response header: total size of the destination file after the write.
pub const HDR_FILE_SIZE: &str = "x-file-size";

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub name: String,
    /// Server-relative path, always starting with `/`.
    pub path: String,
    pub size: u64,
    /// Modification time, epoch seconds.
    pub mod_time: i64,
    pub is_dir: bool,
    /// Permission string, e.g. `drwxr-xr-x`.
    pub mode: String,
}

/// Detailed attributes of a single path, as returned by the stat action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mod_time: i64,
    pub is_dir: bool,
    pub mode: String,
    /// Numeric permission bits, for chmod round-trips.
    pub mode_num: u32,
}

/// Archive formats accepted by the compress action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    Gzip,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "targz",
            ArchiveFormat::Gzip => "gzip",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            "targz" | "tar.gz" => Ok(ArchiveFormat::TarGz),
            "gzip" | "gz" => Ok(ArchiveFormat::Gzip),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_item_wire_names_are_camel_case() {
        let item = ListItem {
            name: "a.txt".into(),
            path: "/docs/a.txt".into(),
            size: 42,
            mod_time: 1_700_000_000,
            is_dir: false,
            mode: "-rw-r--r--".into(),
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"modTime\":1700000000"));
        assert!(json.contains("\"isDir\":false"));
    }

    #[test]
    fn archive_format_parses_aliases() {
        assert_eq!("targz".parse::<ArchiveFormat>(), Ok(ArchiveFormat::TarGz));
        assert_eq!("tar.gz".parse::<ArchiveFormat>(), Ok(ArchiveFormat::TarGz));
        assert!("rar".parse::<ArchiveFormat>().is_err());
    }
}
