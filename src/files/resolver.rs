//! Request target to file resolution.
//!
//! Resolution happens in two steps. The target is first normalized lexically
//! (query stripped, percent-decoding, `.` and `..` collapsed); a `..` that
//! would climb above the root is rejected outright. The resulting path is then
//! canonicalized on disk so that symlinks pointing outside the root are
//! rejected as well.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use percent_encoding::percent_decode_str;
use tokio::fs::File;

use crate::http::mime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    NotFound,
    /// The target escapes the document root or is not allowed to be read.
    Forbidden,
    /// The file exists but could not be opened.
    Unreadable,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::NotFound => write!(f, "not found"),
            ResolveError::Forbidden => write!(f, "forbidden"),
            ResolveError::Unreadable => write!(f, "unreadable"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Base directory all served files must live under.
#[derive(Debug, Clone)]
pub struct DocumentRoot {
    path: PathBuf,
    index_file: String,
}

impl DocumentRoot {
    /// Canonicalizes `path`, which must be an existing directory.
    pub fn new(path: impl AsRef<Path>, index_file: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path)
            .with_context(|| format!("document root {} is not accessible", path.display()))?;

        if !canonical.is_dir() {
            bail!("document root {} is not a directory", canonical.display());
        }

        Ok(Self {
            path: canonical,
            index_file: index_file.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index_file(&self) -> &str {
        &self.index_file
    }

    fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

/// An opened file ready to be sent.
#[derive(Debug)]
pub struct StaticFile {
    pub file: File,
    pub len: u64,
    pub content_type: &'static str,
    pub path: PathBuf,
}

/// Lexically normalizes a request target into a path relative to the root.
///
/// ```
/// # use portico::files::resolver::{normalize, ResolveError};
/// # use std::path::PathBuf;
/// assert_eq!(normalize("/css/./../js/app.js?v=1"), Ok(PathBuf::from("js/app.js")));
/// assert_eq!(normalize("/%2e%2e/etc/passwd"), Err(ResolveError::Forbidden));
/// ```
pub fn normalize(target: &str) -> Result<PathBuf, ResolveError> {
    let raw = target.split(['?', '#']).next().unwrap_or_default();

    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| ResolveError::NotFound)?;

    if decoded.contains('\0') {
        return Err(ResolveError::Forbidden);
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ResolveError::Forbidden);
                }
            }
            s if s.contains('\\') => return Err(ResolveError::Forbidden),
            s => segments.push(s),
        }
    }

    Ok(segments.iter().collect())
}

/// Resolves `target` to an open file below `root`.
///
/// Directories resolve to their index file. Anything that is not a regular
/// file is reported as `NotFound`.
pub async fn resolve(target: &str, root: &DocumentRoot) -> Result<StaticFile, ResolveError> {
    let relative = normalize(target)?;

    let mut path = canonical_within(root, &root.path.join(&relative)).await?;
    let mut metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ResolveError::NotFound)?;

    if metadata.is_dir() {
        path = canonical_within(root, &path.join(&root.index_file)).await?;
        metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| ResolveError::NotFound)?;
    }

    if !metadata.is_file() {
        return Err(ResolveError::NotFound);
    }

    let file = File::open(&path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => ResolveError::NotFound,
        ErrorKind::PermissionDenied => ResolveError::Forbidden,
        _ => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to open file");
            ResolveError::Unreadable
        }
    })?;

    Ok(StaticFile {
        file,
        len: metadata.len(),
        content_type: mime::from_path(&path),
        path,
    })
}

async fn canonical_within(root: &DocumentRoot, path: &Path) -> Result<PathBuf, ResolveError> {
    let canonical = tokio::fs::canonicalize(path)
        .await
        .map_err(|_| ResolveError::NotFound)?;

    if !root.contains(&canonical) {
        tracing::warn!(
            path = %path.display(),
            resolved = %canonical.display(),
            "Blocked path resolving outside the document root"
        );
        return Err(ResolveError::Forbidden);
    }

    Ok(canonical)
}
