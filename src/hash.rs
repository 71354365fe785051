//! Content hashing for copied files
//!
//! Copy steps are fingerprinted by the bytes of the files they copy, not
//! by their paths. Same content = same digest, regardless of mtime or
//! file name.
//!
//! A directory digests as its sorted tree: every entry's path relative to
//! the directory, plus file contents and symlink targets.

use crate::error::StrataError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Digest and size of one file's contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Hex-encoded SHA256 of the file contents
    pub digest: String,
    /// File size in bytes
    pub size_bytes: u64,
}

impl FileDigest {
    /// Hash an in-memory byte buffer
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            digest: hex::encode(hasher.finalize()),
            size_bytes: bytes.len() as u64,
        }
    }
}

/// Why a digest could not be produced
#[derive(Debug)]
pub enum HashFailure {
    /// The path does not exist (an unresolved input)
    Missing,
    /// The path escapes the build context
    OutsideContext,
    /// Reading the file failed
    Unreadable(String),
}

/// Source of content digests for build inputs
#[async_trait]
pub trait ContentHasher: Send + Sync {
    /// Digest the file at `path` (relative to the build context)
    async fn digest(&self, path: &str) -> Result<FileDigest, HashFailure>;
}

/// Hashes files on disk under a build context directory
#[derive(Debug, Clone)]
pub struct FsHasher {
    context: PathBuf,
}

impl FsHasher {
    /// Create a hasher rooted at `context`
    pub fn new(context: impl Into<PathBuf>) -> Self {
        Self {
            context: context.into(),
        }
    }

    /// The build context directory
    pub fn context(&self) -> &Path {
        &self.context
    }
}

/// Reject absolute paths and `..` so inputs stay inside the context
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl ContentHasher for FsHasher {
    async fn digest(&self, path: &str) -> Result<FileDigest, HashFailure> {
        let relative = Path::new(path);
        if path.is_empty() || !is_contained(relative) {
            return Err(HashFailure::OutsideContext);
        }

        let full = self.context.join(relative);
        let metadata = match tokio::fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(HashFailure::Missing),
            Err(e) => return Err(HashFailure::Unreadable(e.to_string())),
        };

        if metadata.is_dir() {
            let root = full.clone();
            let digest = tokio::task::spawn_blocking(move || digest_directory(&root))
                .await
                .map_err(|e| HashFailure::Unreadable(e.to_string()))??;
            debug!(
                "Hashed directory {} -> {}",
                full.display(),
                &digest.digest[..12]
            );
            return Ok(digest);
        }

        let contents = match tokio::fs::read(&full).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(HashFailure::Missing),
            Err(e) => return Err(HashFailure::Unreadable(e.to_string())),
        };

        let digest = FileDigest::of_bytes(&contents);
        debug!("Hashed {} -> {}", full.display(), &digest.digest[..12]);
        Ok(digest)
    }
}

fn digest_directory(root: &Path) -> Result<FileDigest, HashFailure> {
    let unreadable = |e: std::io::Error| HashFailure::Unreadable(e.to_string());
    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| HashFailure::Unreadable(e.to_string()))?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy();

        let file_type = entry.file_type();
        let line = if file_type.is_file() {
            let file = FileDigest::of_bytes(&std::fs::read(entry.path()).map_err(unreadable)?);
            size_bytes = size_bytes.saturating_add(file.size_bytes);
            format!("F:{}:{}", name, file.digest)
        } else if file_type.is_dir() {
            format!("D:{}", name)
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path()).map_err(unreadable)?;
            format!("L:{}:{}", name, target.to_string_lossy())
        } else {
            // sockets, fifos and devices
            continue;
        };

        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    Ok(FileDigest {
        digest: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

impl HashFailure {
    /// Map to the engine's error taxonomy for a given step
    pub fn into_error(self, stage: &str, index: usize, kind: &str, path: &str) -> StrataError {
        match self {
            Self::Missing => StrataError::dependency(stage, index, kind, format!("file '{}'", path)),
            Self::OutsideContext => StrataError::dependency(
                stage,
                index,
                kind,
                format!("file '{}' is outside the build context", path),
            ),
            Self::Unreadable(reason) => StrataError::HashComputation {
                path: PathBuf::from(path),
                reason,
            },
        }
    }
}
