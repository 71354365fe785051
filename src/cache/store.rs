//! In-memory layer store
//!
//! Layers are kept in an arena keyed by fingerprint; a layer refers to its
//! parent by fingerprint, never by pointer. The store is shared by `Arc`
//! between concurrently building stages and only grows through
//! insert-if-absent, so racing inserts of one fingerprint keep one layer.

use crate::build::fingerprint::{self, Fingerprint, ResolvedInput};
use crate::build::step::StepKind;
use crate::error::{StrataError, StrataResult};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Immutable result of executing one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Content-derived identifier
    pub fingerprint: Fingerprint,
    /// Kind of the step that produced the layer
    pub kind: StepKind,
    /// Normalized inputs the fingerprint was computed from
    pub inputs: Vec<ResolvedInput>,
    /// Parent layer, `None` for the first step of a stage
    pub parent: Option<Fingerprint>,
    /// Layer size in bytes
    pub size_bytes: u64,
}

impl Layer {
    /// Synthesize a layer for a step, computing its fingerprint
    pub fn new(
        kind: StepKind,
        inputs: Vec<ResolvedInput>,
        parent: Option<Fingerprint>,
        size_bytes: u64,
    ) -> Self {
        let inputs = fingerprint::normalize(inputs);
        let fingerprint = fingerprint::compute(kind, &inputs, parent.as_ref());
        Self {
            fingerprint,
            kind,
            inputs,
            parent,
            size_bytes,
        }
    }

    /// Fingerprint recomputed from the recorded recipe
    pub fn recompute(&self) -> Fingerprint {
        fingerprint::compute(self.kind, &self.inputs, self.parent.as_ref())
    }

    /// Check that the stored fingerprint matches the recipe
    pub fn verify(&self) -> StrataResult<()> {
        let recomputed = self.recompute();
        if recomputed == self.fingerprint {
            Ok(())
        } else {
            Err(StrataError::CacheCorruption {
                stored: self.fingerprint.to_string(),
                recomputed: recomputed.to_string(),
            })
        }
    }
}

/// Outcome of an insert-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The layer was added
    Inserted,
    /// A layer with this fingerprint already existed; nothing changed
    AlreadyPresent,
}

/// Snapshot of a cached layer and its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub layer: Arc<Layer>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

struct Slot {
    layer: Arc<Layer>,
    created_at: DateTime<Utc>,
    // Unix millis; bumped under the read lock
    last_used_ms: AtomicI64,
}

impl Slot {
    fn new(layer: Arc<Layer>, created_at: DateTime<Utc>, last_used_at: DateTime<Utc>) -> Self {
        Self {
            layer,
            created_at,
            last_used_ms: AtomicI64::new(last_used_at.timestamp_millis()),
        }
    }

    fn touch(&self) {
        self.last_used_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheEntry {
        let ms = self.last_used_ms.load(Ordering::Relaxed);
        let last_used_at = Utc
            .timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.created_at);
        CacheEntry {
            layer: Arc::clone(&self.layer),
            created_at: self.created_at,
            last_used_at,
        }
    }
}

/// Process-wide fingerprint -> layer map
#[derive(Default)]
pub struct CacheStore {
    slots: RwLock<HashMap<Fingerprint, Slot>>,
}

impl CacheStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted entries
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let slots = entries
            .into_iter()
            .map(|e| {
                let fp = e.layer.fingerprint.clone();
                (fp, Slot::new(e.layer, e.created_at, e.last_used_at))
            })
            .collect();
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Find a layer and mark it used
    pub async fn lookup(&self, fp: &Fingerprint) -> Option<Arc<Layer>> {
        let slots = self.slots.read().await;
        slots.get(fp).map(|slot| {
            slot.touch();
            Arc::clone(&slot.layer)
        })
    }

    /// Find a layer without touching its last-use time
    pub async fn peek(&self, fp: &Fingerprint) -> Option<Arc<Layer>> {
        self.slots.read().await.get(fp).map(|s| Arc::clone(&s.layer))
    }

    /// Whether a fingerprint is cached
    pub async fn contains(&self, fp: &Fingerprint) -> bool {
        self.slots.read().await.contains_key(fp)
    }

    /// Insert a layer unless its fingerprint is already present
    pub async fn insert_if_absent(&self, layer: Layer) -> InsertOutcome {
        self.get_or_insert(layer).await.1
    }

    /// Return the cached layer for `layer.fingerprint`, inserting `layer`
    /// if there is none. The returned layer is the one the store keeps.
    pub async fn get_or_insert(&self, layer: Layer) -> (Arc<Layer>, InsertOutcome) {
        if let Some(existing) = self.lookup(&layer.fingerprint).await {
            return (existing, InsertOutcome::AlreadyPresent);
        }

        let mut slots = self.slots.write().await;
        // Another stage may have inserted between the read and write lock
        if let Some(slot) = slots.get(&layer.fingerprint) {
            slot.touch();
            return (Arc::clone(&slot.layer), InsertOutcome::AlreadyPresent);
        }

        let now = Utc::now();
        let layer = Arc::new(layer);
        debug!(
            "Caching layer {} ({} bytes)",
            layer.fingerprint.short(),
            layer.size_bytes
        );
        slots.insert(
            layer.fingerprint.clone(),
            Slot::new(Arc::clone(&layer), now, now),
        );
        (layer, InsertOutcome::Inserted)
    }

    /// Remove a layer, returning it if present
    pub async fn remove(&self, fp: &Fingerprint) -> Option<Arc<Layer>> {
        self.slots.write().await.remove(fp).map(|s| s.layer)
    }

    /// Remove every layer, returning how many were removed
    pub async fn clear(&self) -> usize {
        let mut slots = self.slots.write().await;
        let count = slots.len();
        slots.clear();
        count
    }

    /// Number of cached layers
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Whether the store holds no layers
    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    /// Sum of all cached layer sizes (each layer counted once)
    pub async fn total_size(&self) -> u64 {
        self.slots
            .read()
            .await
            .values()
            .map(|s| s.layer.size_bytes)
            .fold(0, u64::saturating_add)
    }

    /// Snapshot of all entries, oldest first
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> =
            self.slots.read().await.values().map(Slot::snapshot).collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.layer.fingerprint.cmp(&b.layer.fingerprint))
        });
        entries
    }

    /// Resolve a (possibly abbreviated) fingerprint to a cached layer
    pub async fn find_prefix(&self, prefix: &str) -> StrataResult<Arc<Layer>> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() {
            return Err(StrataError::LayerNotFound(prefix));
        }

        let slots = self.slots.read().await;
        let mut matches = slots
            .iter()
            .filter(|(fp, _)| fp.as_str().starts_with(&prefix));

        match (matches.next(), matches.next()) {
            (Some((_, slot)), None) => Ok(Arc::clone(&slot.layer)),
            (Some(_), Some(_)) => Err(StrataError::AmbiguousFingerprint(prefix)),
            (None, _) => Err(StrataError::LayerNotFound(prefix)),
        }
    }

    /// Walk from a layer to its root, stopping at the first evicted parent
    pub async fn chain(&self, fp: &Fingerprint) -> Vec<Arc<Layer>> {
        let slots = self.slots.read().await;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(fp.clone());

        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                break;
            }
            match slots.get(&current) {
                Some(slot) => {
                    next = slot.layer.parent.clone();
                    chain.push(Arc::clone(&slot.layer));
                }
                None => break,
            }
        }
        chain
    }

    /// Re-verify every layer, discarding those whose fingerprint does not
    /// match their recipe. Returns the discarded discrepancies.
    pub async fn verify(&self) -> Vec<StrataError> {
        let mut slots = self.slots.write().await;
        let mut corrupt = Vec::new();

        slots.retain(|fp, slot| {
            let key_matches = *fp == slot.layer.fingerprint;
            match slot.layer.verify() {
                Ok(()) if key_matches => true,
                Ok(()) => {
                    corrupt.push(StrataError::CacheCorruption {
                        stored: fp.to_string(),
                        recomputed: slot.layer.fingerprint.to_string(),
                    });
                    false
                }
                Err(e) => {
                    corrupt.push(e);
                    false
                }
            }
        });
        corrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_layer(tag: &str) -> Layer {
        Layer::new(
            StepKind::BaseImage,
            vec![ResolvedInput::Image { tag: tag.into() }],
            None,
            100,
        )
    }

    fn run_layer(parent: &Layer, command: &str) -> Layer {
        Layer::new(
            StepKind::RunCommand,
            vec![ResolvedInput::Command {
                command: command.into(),
            }],
            Some(parent.fingerprint.clone()),
            10,
        )
    }

    #[test]
    fn layer_verifies() {
        let layer = base_layer("x");
        assert!(layer.verify().is_ok());

        let mut tampered = layer.clone();
        tampered.size_bytes = 1; // not part of the fingerprint
        assert!(tampered.verify().is_ok());

        tampered.inputs = vec![ResolvedInput::Image { tag: "y".into() }];
        assert!(matches!(
            tampered.verify(),
            Err(StrataError::CacheCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn insert_then_lookup() {
        let store = CacheStore::new();
        let layer = base_layer("x");
        let fp = layer.fingerprint.clone();

        assert!(store.lookup(&fp).await.is_none());
        assert_eq!(store.insert_if_absent(layer).await, InsertOutcome::Inserted);
        assert_eq!(store.lookup(&fp).await.unwrap().size_bytes, 100);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = CacheStore::new();
        let layer = base_layer("x");

        assert_eq!(
            store.insert_if_absent(layer.clone()).await,
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(layer.clone()).await,
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(store.len().await, 1);
        assert_eq!(store.total_size().await, 100);
    }

    #[tokio::test]
    async fn existing_layer_wins() {
        let store = CacheStore::new();
        let first = base_layer("x");
        let mut second = first.clone();
        second.size_bytes = 999;

        store.insert_if_absent(first).await;
        let (kept, outcome) = store.get_or_insert(second).await;

        assert_eq!(outcome, InsertOutcome::AlreadyPresent);
        assert_eq!(kept.size_bytes, 100);
    }

    #[tokio::test]
    async fn concurrent_inserts_keep_one_layer() {
        let store = Arc::new(CacheStore::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert_if_absent(base_layer("node:18-alpine")).await
            }));
        }

        let outcomes = futures_util::future::join_all(handles).await;
        let inserted = outcomes
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|o| *o == InsertOutcome::Inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.total_size().await, 100);
    }

    #[tokio::test]
    async fn chain_walks_parents() {
        let store = CacheStore::new();
        let base = base_layer("x");
        let install = run_layer(&base, "install");
        let build = run_layer(&install, "build");
        let top = build.fingerprint.clone();

        store.insert_if_absent(base.clone()).await;
        store.insert_if_absent(install.clone()).await;
        store.insert_if_absent(build).await;

        let chain = store.chain(&top).await;
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[2].fingerprint, base.fingerprint);

        store.remove(&install.fingerprint).await;
        assert_eq!(store.chain(&top).await.len(), 1);
    }

    #[tokio::test]
    async fn find_by_prefix() {
        let store = CacheStore::new();
        let layer = base_layer("x");
        let fp = layer.fingerprint.clone();
        store.insert_if_absent(layer).await;

        let found = store.find_prefix(fp.short()).await.unwrap();
        assert_eq!(found.fingerprint, fp);
        assert!(matches!(
            store.find_prefix("zzzz").await,
            Err(StrataError::LayerNotFound(_))
        ));
        assert!(store.find_prefix("").await.is_err());
    }

    #[tokio::test]
    async fn verify_discards_corrupt_entries() {
        let good = base_layer("x");
        let mut bad = base_layer("y");
        bad.inputs = vec![ResolvedInput::Image { tag: "z".into() }];

        let now = Utc::now();
        let store = CacheStore::from_entries([good.clone(), bad].into_iter().map(|layer| {
            CacheEntry {
                layer: Arc::new(layer),
                created_at: now,
                last_used_at: now,
            }
        }));

        let corrupt = store.verify().await;
        assert_eq!(corrupt.len(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.contains(&good.fingerprint).await);
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let store = CacheStore::new();
        store.insert_if_absent(base_layer("a")).await;
        store.insert_if_absent(base_layer("b")).await;

        assert_eq!(store.clear().await, 2);
        assert!(store.is_empty().await);
    }
}
