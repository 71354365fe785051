//! Cache persistence
//!
//! The store is loaded from a JSON file at startup and flushed back after
//! a build. Entries are decoded and re-verified one at a time: an entry
//! that does not parse, or whose recorded recipe no longer hashes to its
//! fingerprint, is dropped and becomes a miss. The rest still load.

use crate::cache::store::{CacheEntry, CacheStore, Layer};
use crate::error::{StrataError, StrataResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Current on-disk format version
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    layer: Layer,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

/// What happened while loading a cache file
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Entries accepted into the store
    pub loaded: usize,
    /// Entries dropped because they did not parse or verify
    pub discarded: Vec<StrataError>,
    /// The file existed but could not be parsed; the store starts empty
    pub unreadable: bool,
}

/// Load a cache file, returning an empty store if it does not exist
pub async fn load(path: &Path) -> StrataResult<(CacheStore, LoadReport)> {
    if !path.exists() {
        debug!("No cache file at {}, starting empty", path.display());
        return Ok((CacheStore::new(), LoadReport::default()));
    }

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StrataError::io(format!("reading cache file {}", path.display()), e))?;

    // A version we do not understand is rejected rather than overwritten
    let raw: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!("Cache file {} is unreadable, starting empty: {}", path.display(), e);
            return Ok((
                CacheStore::new(),
                LoadReport {
                    unreadable: true,
                    ..LoadReport::default()
                },
            ));
        }
    };
    let found = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if found != CACHE_FORMAT_VERSION {
        return Err(StrataError::CacheVersion {
            path: path.to_path_buf(),
            found,
            expected: CACHE_FORMAT_VERSION,
        });
    }

    let entries = match raw.get("entries").and_then(|v| v.as_array()) {
        Some(entries) => entries,
        None => {
            warn!("Cache file {} has no entry list, starting empty", path.display());
            return Ok((
                CacheStore::new(),
                LoadReport {
                    unreadable: true,
                    ..LoadReport::default()
                },
            ));
        }
    };

    let mut report = LoadReport::default();
    let mut accepted = Vec::with_capacity(entries.len());

    for (position, value) in entries.iter().enumerate() {
        let entry = match PersistedEntry::deserialize(value) {
            Ok(entry) => entry,
            Err(e) => {
                let err = StrataError::CacheEntryMalformed {
                    position,
                    reason: e.to_string(),
                };
                warn!("Discarding cache entry: {}", err);
                report.discarded.push(err);
                continue;
            }
        };

        match entry.layer.verify() {
            Ok(()) => accepted.push(CacheEntry {
                layer: Arc::new(entry.layer),
                created_at: entry.created_at,
                last_used_at: entry.last_used_at,
            }),
            Err(e) => {
                warn!("Discarding cache entry: {}", e);
                report.discarded.push(e);
            }
        }
    }

    report.loaded = accepted.len();
    info!(
        "Loaded {} cached layer(s) from {}",
        report.loaded,
        path.display()
    );
    Ok((CacheStore::from_entries(accepted), report))
}

/// Write the store to `path`, replacing the previous file atomically.
/// Returns the number of entries written.
pub async fn flush(store: &CacheStore, path: &Path) -> StrataResult<usize> {
    let entries: Vec<PersistedEntry> = store
        .entries()
        .await
        .into_iter()
        .map(|e| PersistedEntry {
            layer: (*e.layer).clone(),
            created_at: e.created_at,
            last_used_at: e.last_used_at,
        })
        .collect();
    let count = entries.len();

    let file = CacheFile {
        version: CACHE_FORMAT_VERSION,
        saved_at: Utc::now(),
        entries,
    };
    let content = serde_json::to_string(&file)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|e| StrataError::io(format!("writing cache file {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| StrataError::io(format!("replacing cache file {}", path.display()), e))?;

    debug!("Flushed {} cached layer(s) to {}", count, path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::fingerprint::ResolvedInput;
    use crate::build::step::StepKind;
    use tempfile::TempDir;

    fn layer(tag: &str) -> Layer {
        Layer::new(
            StepKind::BaseImage,
            vec![ResolvedInput::Image { tag: tag.into() }],
            None,
            42,
        )
    }

    #[tokio::test]
    async fn missing_file_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let (store, report) = load(&dir.path().join("cache.json")).await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(report.loaded, 0);
        assert!(!report.unreadable);
    }

    #[tokio::test]
    async fn flush_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("cache.json");

        let store = CacheStore::new();
        let a = layer("a");
        store.insert_if_absent(a.clone()).await;
        store.insert_if_absent(layer("b")).await;

        assert_eq!(flush(&store, &path).await.unwrap(), 2);
        assert!(!path.with_extension("json.tmp").exists());

        let (loaded, report) = load(&path).await.unwrap();
        assert_eq!(report.loaded, 2);
        assert!(report.discarded.is_empty());
        assert_eq!(*loaded.peek(&a.fingerprint).await.unwrap(), a);
    }

    #[tokio::test]
    async fn tampered_entry_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let store = CacheStore::new();
        let good = layer("good");
        store.insert_if_absent(good.clone()).await;
        store.insert_if_absent(layer("victim")).await;
        flush(&store, &path).await.unwrap();

        // Rewrite one layer's recorded input without changing its fingerprint
        let content = std::fs::read_to_string(&path).unwrap();
        let content = content.replace("\"tag\":\"victim\"", "\"tag\":\"swapped\"");
        std::fs::write(&path, content).unwrap();

        let (loaded, report) = load(&path).await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.discarded.len(), 1);
        assert!(matches!(
            report.discarded[0],
            StrataError::CacheCorruption { .. }
        ));
        assert!(loaded.contains(&good.fingerprint).await);
    }

    #[tokio::test]
    async fn malformed_entry_spares_the_rest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");

        let store = CacheStore::new();
        let kept = [layer("a"), layer("b")];
        for l in &kept {
            store.insert_if_absent(l.clone()).await;
        }
        store.insert_if_absent(layer("c")).await;
        flush(&store, &path).await.unwrap();

        // Give one entry a step kind this version does not know
        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let victim = raw["entries"]
            .as_array_mut()
            .unwrap()
            .iter_mut()
            .find(|e| e["layer"]["inputs"][0]["tag"] == "c")
            .unwrap();
        victim["layer"]["kind"] = "healthcheck".into();
        std::fs::write(&path, raw.to_string()).unwrap();

        let (loaded, report) = load(&path).await.unwrap();
        assert!(!report.unreadable);
        assert_eq!(report.loaded, 2);
        assert_eq!(report.discarded.len(), 1);
        assert!(matches!(
            report.discarded[0],
            StrataError::CacheEntryMalformed { .. }
        ));
        for l in &kept {
            assert!(loaded.contains(&l.fingerprint).await);
        }
    }

    #[tokio::test]
    async fn garbage_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();

        let (store, report) = load(&path).await.unwrap();
        assert!(store.is_empty().await);
        assert!(report.unreadable);
    }

    #[tokio::test]
    async fn unknown_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"version": 99, "entries": []}"#).unwrap();

        let err = load(&path).await.err().unwrap();
        assert!(matches!(err, StrataError::CacheVersion { found: 99, .. }));
    }
}
