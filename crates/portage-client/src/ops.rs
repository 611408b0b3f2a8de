//! Remote file-management actions.
//!
//! Each action is one request/response over its own mux stream. Paths are
//! server-relative; the server decides whether they stay inside its root.

use hyper::{header, Method};
use portage_proto::{ListItem, StatInfo, ArchiveFormat, MAX_EDIT_BYTES};

use crate::client::{build_query, encode_path, expect_success, read_body, Client};
use crate::error::{Error, Result};

impl Client {
    /// List a directory. With `recursive`, the server flattens the whole
    /// subtree into one listing.
    pub async fn list(&self, path: &str, recursive: bool) -> Result<Vec<ListItem>> {
        let query = build_query(&[("path", path), ("recursive", if recursive { "1" } else { "" })]);
        let resp = self
            .request_empty(Method::GET, format!("/api/list{query}"))
            .await?;
        let body = read_body(expect_success(resp).await?).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Protocol {
            status: 200,
            message: format!("malformed listing: {e}"),
        })
    }

    /// Attributes of a single path.
    pub async fn stat(&self, path: &str) -> Result<StatInfo> {
        let query = build_query(&[("path", path)]);
        let resp = self
            .request_empty(Method::GET, format!("/api/stat{query}"))
            .await?;
        let body = read_body(expect_success(resp).await?).await?;
        serde_json::from_slice(&body).map_err(|e| Error::Protocol {
            status: 200,
            message: format!("malformed stat: {e}"),
        })
    }

    /// Hex SHA-256 of a remote file, computed server-side.
    pub async fn checksum(&self, path: &str) -> Result<String> {
        let query = build_query(&[("path", path)]);
        let resp = self
            .request_empty(Method::GET, format!("/api/checksum{query}"))
            .await?;
        let body = read_body(expect_success(resp).await?).await?;
        Ok(String::from_utf8_lossy(&body).trim().to_string())
    }

    /// Size of a remote file, from a HEAD on the download endpoint.
    pub async fn remote_size(&self, path: &str) -> Result<u64> {
        let resp = self
            .request_empty(Method::HEAD, format!("/files{}", encode_path(path)))
            .await?;
        let resp = expect_success(resp).await?;
        resp.headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Protocol {
                status: resp.status().as_u16(),
                message: "missing content-length on HEAD".into(),
            })
    }

    /// Delete a file or directory (directories recursively).
    pub async fn delete(&self, path: &str) -> Result<()> {
        let query = build_query(&[("path", path)]);
        let resp = self
            .request_empty(Method::DELETE, format!("/api/delete{query}"))
            .await?;
        expect_success(resp).await.map(drop)
    }

    /// Create a directory, parents included.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let query = build_query(&[("path", path)]);
        let resp = self
            .request_empty(Method::POST, format!("/api/mkdir{query}"))
            .await?;
        expect_success(resp).await.map(drop)
    }

    /// Rename or move within the server root.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let query = build_query(&[("old", old), ("new", new)]);
        let resp = self
            .request_empty(Method::POST, format!("/api/rename{query}"))
            .await?;
        expect_success(resp).await.map(drop)
    }

    /// Change permission bits, e.g. `0o755`.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let mode = format!("{mode:o}");
        let query = build_query(&[("path", path), ("mode", &mode)]);
        let resp = self
            .request_empty(Method::POST, format!("/api/chmod{query}"))
            .await?;
        expect_success(resp).await.map(drop)
    }

    /// Fetch a small text file for editing. The server refuses files over
    /// the edit limit.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let query = build_query(&[("path", path)]);
        let resp = self
            .request_empty(Method::GET, format!("/api/edit{query}"))
            .await?;
        let body = read_body(expect_success(resp).await?).await?;
        String::from_utf8(body.to_vec()).map_err(|_| Error::Protocol {
            status: 200,
            message: "edit payload is not valid UTF-8".into(),
        })
    }

    /// Write back an edited text file. Capped client-side as well, so an
    /// oversized save never leaves the machine.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<()> {
        if content.len() as u64 > MAX_EDIT_BYTES {
            return Err(Error::Config(format!(
                "edit payload is {} bytes, limit is {MAX_EDIT_BYTES}",
                content.len()
            )));
        }
        let query = build_query(&[("path", path)]);
        let resp = self
            .request_bytes(
                Method::PUT,
                format!("/api/edit{query}"),
                content.as_bytes().to_vec().into(),
            )
            .await?;
        expect_success(resp).await.map(drop)
    }

    /// Ask the server to archive `sources` into `output`.
    pub async fn compress_remote(
        &self,
        sources: &[String],
        output: &str,
        format: ArchiveFormat,
    ) -> Result<()> {
        let paths = sources.join(",");
        let query = build_query(&[
            ("paths", &paths),
            ("output", output),
            ("format", format.as_str()),
        ]);
        let resp = self
            .request_empty(Method::POST, format!("/api/compress{query}"))
            .await?;
        expect_success(resp).await.map(drop)
    }

    /// Ask the server to extract an archive. Without `dest` the server
    /// extracts next to the archive.
    pub async fn extract_remote(&self, archive: &str, dest: Option<&str>) -> Result<()> {
        let query = build_query(&[("path", archive), ("dest", dest.unwrap_or(""))]);
        let resp = self
            .request_empty(Method::POST, format!("/api/extract{query}"))
            .await?;
        expect_success(resp).await.map(drop)
    }
}
