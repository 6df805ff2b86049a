//! Filesystem sandbox confining the file tools to one directory tree.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// A canonicalized root directory that every file access must stay under.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create a sandbox rooted at `root`, which must exist and be a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            Error::Config(format!("Cannot resolve sandbox root {}: {}", root.display(), e))
        })?;
        if !canonical.is_dir() {
            return Err(Error::Config(format!(
                "Sandbox root is not a directory: {}",
                canonical.display()
            )));
        }
        debug!(root = %canonical.display(), "Sandbox ready");
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative request path to a canonical path under the root.
    ///
    /// Symlinks are followed, so a link pointing outside the root is refused.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let relative = Path::new(requested);
        if relative.is_absolute() || relative.has_root() {
            return Err(Error::AccessDenied(format!(
                "absolute paths are not allowed: {}",
                requested
            )));
        }
        if relative
            .components()
            .any(|c| matches!(c, Component::Prefix(_)))
        {
            return Err(Error::InvalidPath(requested.to_string()));
        }

        let canonical = tokio::fs::canonicalize(self.root.join(relative))
            .await
            .map_err(|e| Error::InvalidPath(format!("{}: {}", requested, e)))?;

        if !canonical.starts_with(&self.root) {
            return Err(Error::AccessDenied(format!(
                "path escapes sandbox: {}",
                requested
            )));
        }
        Ok(canonical)
    }

    /// Path of `path` relative to the root, with `/` separators.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}
