//! Path containment.
//!
//! Every client-supplied path is resolved lexically against the served root
//! before any filesystem call. Resolution is purely textual: `..` pops a
//! component and popping past the root is a rejection, so symlink layout and
//! file existence never influence the verdict. Leading slashes are treated
//! as root-relative, matching how the client names remote paths.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("path escapes the served root: {0}")]
pub struct PathRejected(pub String);

/// The directory this server agrees to expose.
#[derive(Debug, Clone)]
pub struct FsRoot {
    root: PathBuf,
}

impl FsRoot {
    /// Create the root directory if needed and pin its canonical location.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root: root.canonicalize()? })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Turn a client path into an absolute path under the root, or refuse.
    pub fn resolve(&self, client_path: &str) -> Result<PathBuf, PathRejected> {
        Ok(self.root.join(clean_relative(client_path)?))
    }

    /// Client-facing name for an absolute path under the root: `/`-separated
    /// and always starting with `/`.
    pub fn display_path(&self, abs: &Path) -> String {
        let rel = abs.strip_prefix(&self.root).unwrap_or(abs);
        let joined = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        format!("/{joined}")
    }
}

fn clean_relative(client_path: &str) -> Result<PathBuf, PathRejected> {
    let trimmed = client_path.trim_start_matches('/');
    let mut cleaned = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    return Err(PathRejected(client_path.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathRejected(client_path.to_string()));
            }
        }
    }
    Ok(cleaned)
}
