//! Cache eviction
//!
//! Eviction only ever turns future hits into misses, so any policy is
//! safe. Layers are dropped by age first, then least-recently-used until
//! the count and size bounds hold.

use crate::build::fingerprint::Fingerprint;
use crate::cache::store::{CacheEntry, CacheStore};
use crate::config::schema::EvictionConfig;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// Convert MB to bytes, clamping at `u64::MAX`
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

/// Total of a set of layer sizes, clamping at `u64::MAX`
pub fn sum_bytes(sizes: impl IntoIterator<Item = u64>) -> u64 {
    sizes.into_iter().fold(0, u64::saturating_add)
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Bounds a prune enforces; `None` disables a bound
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Drop layers unused for longer than this
    pub max_age: Option<Duration>,
    /// Keep at most this many layers
    pub max_entries: Option<usize>,
    /// Keep at most this many bytes of layers
    pub max_total_bytes: Option<u64>,
}

impl EvictionPolicy {
    /// Whether any bound is set
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_entries.is_none() && self.max_total_bytes.is_none()
    }
}

impl EvictionPolicy {
    /// Replace the bounds that were given on the command line.
    /// As in config, `0` disables a bound.
    pub fn with_overrides(
        mut self,
        max_entries: Option<usize>,
        max_mb: Option<u64>,
        days: Option<u32>,
    ) -> Self {
        if let Some(n) = max_entries {
            self.max_entries = entries_bound(n);
        }
        if let Some(mb) = max_mb {
            self.max_total_bytes = size_bound(mb);
        }
        if let Some(d) = days {
            self.max_age = age_bound(d);
        }
        self
    }
}

fn entries_bound(max_entries: usize) -> Option<usize> {
    (max_entries > 0).then_some(max_entries)
}

fn size_bound(max_mb: u64) -> Option<u64> {
    (max_mb > 0).then(|| mb_to_bytes(max_mb))
}

fn age_bound(days: u32) -> Option<Duration> {
    (days > 0).then(|| Duration::days(i64::from(days)))
}

impl From<&EvictionConfig> for EvictionPolicy {
    fn from(config: &EvictionConfig) -> Self {
        Self {
            max_age: age_bound(config.max_age_days),
            max_entries: entries_bound(config.max_entries),
            max_total_bytes: size_bound(config.max_total_mb),
        }
    }
}

/// Result of a prune
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Fingerprints removed (or that would be, on a dry run)
    pub removed: Vec<Fingerprint>,
    /// Bytes freed
    pub freed_bytes: u64,
    /// Layers remaining
    pub remaining: usize,
}

/// Choose which entries a policy evicts, in eviction order
pub fn plan_eviction(
    entries: &[CacheEntry],
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> Vec<Fingerprint> {
    let mut by_use: Vec<&CacheEntry> = entries.iter().collect();
    by_use.sort_by(|a, b| {
        a.last_used_at
            .cmp(&b.last_used_at)
            .then_with(|| a.layer.fingerprint.cmp(&b.layer.fingerprint))
    });

    let mut evicted = Vec::new();
    let mut count = by_use.len();
    let mut size = sum_bytes(by_use.iter().map(|e| e.layer.size_bytes));

    for entry in by_use {
        let expired = policy
            .max_age
            .is_some_and(|age| now - entry.last_used_at > age);
        let over_count = policy.max_entries.is_some_and(|max| count > max);
        let over_size = policy.max_total_bytes.is_some_and(|max| size > max);

        if expired || over_count || over_size {
            evicted.push(entry.layer.fingerprint.clone());
            count -= 1;
            size = size.saturating_sub(entry.layer.size_bytes);
        } else {
            // Sorted oldest first: no later entry can violate a bound
            break;
        }
    }
    evicted
}

impl CacheStore {
    /// Apply an eviction policy. With `dry_run`, report without removing.
    pub async fn prune(&self, policy: &EvictionPolicy, dry_run: bool) -> PruneReport {
        let entries = self.entries().await;
        let total = entries.len();

        if policy.is_unbounded() {
            return PruneReport {
                remaining: total,
                ..PruneReport::default()
            };
        }

        let victims = plan_eviction(&entries, policy, Utc::now());
        let mut report = PruneReport {
            remaining: total - victims.len(),
            ..PruneReport::default()
        };

        for fp in victims {
            let size = if dry_run {
                self.peek(&fp).await.map(|l| l.size_bytes)
            } else {
                self.remove(&fp).await.map(|l| l.size_bytes)
            };
            if let Some(size) = size {
                debug!("Evicting layer {}", fp.short());
                report.freed_bytes = report.freed_bytes.saturating_add(size);
                report.removed.push(fp);
            }
        }

        if !dry_run && !report.removed.is_empty() {
            info!(
                "Evicted {} layer(s), freed {}",
                report.removed.len(),
                format_bytes(report.freed_bytes)
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::fingerprint::ResolvedInput;
    use crate::build::step::StepKind;
    use crate::cache::store::Layer;
    use std::sync::Arc;

    fn entry(tag: &str, size: u64, used_days_ago: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            layer: Arc::new(Layer::new(
                StepKind::BaseImage,
                vec![ResolvedInput::Image { tag: tag.into() }],
                None,
                size,
            )),
            created_at: now - Duration::days(used_days_ago),
            last_used_at: now - Duration::days(used_days_ago),
        }
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(mb_to_bytes(3)), "3.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn byte_arithmetic_clamps() {
        assert_eq!(mb_to_bytes(20_000_000_000_000), u64::MAX);
        assert_eq!(sum_bytes([u64::MAX, 1, 2]), u64::MAX);
        assert_eq!(sum_bytes([1, 2, 3]), 6);
    }

    #[test]
    fn policy_from_config_zero_disables() {
        let config = EvictionConfig {
            max_entries: 0,
            max_total_mb: 0,
            max_age_days: 0,
        };
        assert!(EvictionPolicy::from(&config).is_unbounded());

        let policy = EvictionPolicy::from(&EvictionConfig::default());
        assert_eq!(policy.max_entries, Some(10_000));
        assert_eq!(policy.max_age, Some(Duration::days(30)));
    }

    #[test]
    fn zero_override_disables_bound() {
        let policy = EvictionPolicy::from(&EvictionConfig::default())
            .with_overrides(Some(0), None, Some(0));
        assert_eq!(policy.max_entries, None);
        assert_eq!(policy.max_age, None);

        let policy = EvictionPolicy::default().with_overrides(Some(5), Some(2), Some(7));
        assert_eq!(policy.max_entries, Some(5));
        assert_eq!(policy.max_total_bytes, Some(mb_to_bytes(2)));
        assert_eq!(policy.max_age, Some(Duration::days(7)));
    }

    #[tokio::test]
    async fn zero_days_keeps_every_layer() {
        let store = CacheStore::from_entries(vec![entry("a", 5, 3), entry("b", 5, 0)]);
        let policy = EvictionPolicy::default().with_overrides(None, None, Some(0));

        assert!(policy.is_unbounded());
        let report = store.prune(&policy, false).await;
        assert!(report.removed.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[test]
    fn evicts_expired_entries() {
        let entries = vec![entry("old", 1, 40), entry("new", 1, 1)];
        let policy = EvictionPolicy {
            max_age: Some(Duration::days(30)),
            ..EvictionPolicy::default()
        };

        let victims = plan_eviction(&entries, &policy, Utc::now());
        assert_eq!(victims, vec![entries[0].layer.fingerprint.clone()]);
    }

    #[test]
    fn evicts_least_recently_used_over_count() {
        let entries = vec![entry("a", 1, 3), entry("b", 1, 1), entry("c", 1, 2)];
        let policy = EvictionPolicy {
            max_entries: Some(1),
            ..EvictionPolicy::default()
        };

        let victims = plan_eviction(&entries, &policy, Utc::now());
        assert_eq!(
            victims,
            vec![
                entries[0].layer.fingerprint.clone(),
                entries[2].layer.fingerprint.clone()
            ]
        );
    }

    #[test]
    fn evicts_until_under_size() {
        let entries = vec![entry("a", 60, 3), entry("b", 30, 2), entry("c", 30, 1)];
        let policy = EvictionPolicy {
            max_total_bytes: Some(70),
            ..EvictionPolicy::default()
        };

        let victims = plan_eviction(&entries, &policy, Utc::now());
        assert_eq!(victims, vec![entries[0].layer.fingerprint.clone()]);
    }

    #[tokio::test]
    async fn prune_dry_run_keeps_entries() {
        let store = CacheStore::from_entries(vec![entry("a", 5, 3), entry("b", 5, 1)]);
        let policy = EvictionPolicy {
            max_entries: Some(1),
            ..EvictionPolicy::default()
        };

        let report = store.prune(&policy, true).await;
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.freed_bytes, 5);
        assert_eq!(store.len().await, 2);

        let report = store.prune(&policy, false).await;
        assert_eq!(report.remaining, 1);
        assert_eq!(store.len().await, 1);
    }
}
