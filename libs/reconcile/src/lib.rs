//! Convergence helpers shared by the scheduler's control loops.
//!
//! Everything here is pure and deterministic given its inputs:
//!
//! - **Rolling steps**: how far a deployment may move its old and new
//!   applications in one step without breaking surge/unavailability bounds.
//! - **Reschedule backoff**: the delay before a failed pod is rebuilt.
//! - **Spec hashing**: a stable fingerprint of a workload definition.
//! - **Retry tracking**: bounded retries per key within a time window.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Two versions with identical definitions hash identically regardless of
/// key order, so a pod built from either is considered up to date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Rolling steps
// =============================================================================

/// Which side of a rolling step moves first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingOrder {
    /// Start new replicas, wait until they are healthy, then remove old ones.
    #[default]
    CreateFirst,
    /// Remove old replicas first, then start their replacements.
    DeleteFirst,
}

/// Bounds for moving replicas from an old application to a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingStrategy {
    /// Replicas that may be created above the desired count in one step.
    pub max_surge: u32,

    /// Replicas that may be missing below the desired count in one step.
    pub max_unavailable: u32,

    pub order: RollingOrder,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 1,
            order: RollingOrder::CreateFirst,
        }
    }
}

/// Instance targets for the two applications at the end of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingStep {
    pub new_target: u32,
    pub old_target: u32,
}

impl RollingStrategy {
    /// Compute the next step, or `None` once the new application holds every
    /// desired replica and the old one is empty.
    ///
    /// A step grows the new application by at most `max_surge` (create-first)
    /// or shrinks the old one by at most `max_unavailable` (delete-first), and
    /// the opposite side moves by the same amount. Zero bounds are treated as
    /// one so a rollout always makes progress.
    pub fn next_step(&self, desired: u32, old_current: u32, new_current: u32) -> Option<RollingStep> {
        let missing = desired.saturating_sub(new_current);
        if missing == 0 && old_current == 0 {
            return None;
        }

        let step = match self.order {
            RollingOrder::CreateFirst => {
                let grow = self.max_surge.max(1).min(missing);
                let shrink = if grow > 0 { grow } else { self.max_surge.max(1) };
                RollingStep {
                    new_target: new_current + grow,
                    old_target: old_current.saturating_sub(shrink),
                }
            }
            RollingOrder::DeleteFirst => {
                let bound = self.max_unavailable.max(1);
                let shrink = bound.min(old_current);
                let grow = if shrink > 0 { shrink.min(missing) } else { bound.min(missing) };
                RollingStep {
                    new_target: new_current + grow,
                    old_target: old_current - shrink,
                }
            }
        };

        Some(step)
    }
}

// =============================================================================
// Reschedule backoff
// =============================================================================

/// Delay before the `count`-th reschedule of a pod.
///
/// `interval + count * backoff`, clamped to `max`.
pub fn reschedule_delay(interval: Duration, backoff: Duration, count: u32, max: Duration) -> Duration {
    backoff
        .checked_mul(count)
        .and_then(|extra| interval.checked_add(extra))
        .unwrap_or(max)
        .min(max)
}

// =============================================================================
// Retry tracking
// =============================================================================

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record an attempt for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        self.record_failure_at(resource_key, Instant::now())
    }

    /// Same as [`RetryTracker::record_failure`] with an explicit clock reading.
    pub fn record_failure_at(&mut self, resource_key: &str, now: Instant) -> bool {
        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Drops entries whose window has passed.
    pub fn prune(&mut self) {
        self.prune_at(Instant::now());
    }

    pub fn prune_at(&mut self, now: Instant) {
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "s"}});
        let json2 = serde_json::json!({"a": {"x": "s", "y": [1, 2]}, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
        assert!(SpecHash::from_json(&json1).as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_differs_on_content() {
        let a = SpecHash::from_json(&serde_json::json!({"image": "web:1"}));
        let b = SpecHash::from_json(&serde_json::json!({"image": "web:2"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_create_first_rollout_sequence() {
        let strategy = RollingStrategy::default();
        let mut old = 3;
        let mut new = 0;
        let mut steps = Vec::new();
        while let Some(step) = strategy.next_step(3, old, new) {
            steps.push(step);
            old = step.old_target;
            new = step.new_target;
        }
        assert_eq!(
            steps,
            vec![
                RollingStep { new_target: 1, old_target: 2 },
                RollingStep { new_target: 2, old_target: 1 },
                RollingStep { new_target: 3, old_target: 0 },
            ]
        );
    }

    #[test]
    fn test_delete_first_respects_unavailable() {
        let strategy = RollingStrategy {
            max_surge: 0,
            max_unavailable: 2,
            order: RollingOrder::DeleteFirst,
        };
        let step = strategy.next_step(5, 5, 0).unwrap();
        assert_eq!(step, RollingStep { new_target: 2, old_target: 3 });
    }

    #[test]
    fn test_leftover_old_replicas_are_drained() {
        let strategy = RollingStrategy::default();
        let step = strategy.next_step(2, 1, 2).unwrap();
        assert_eq!(step, RollingStep { new_target: 2, old_target: 0 });
        assert!(strategy.next_step(2, 0, 2).is_none());
    }

    #[test]
    fn test_reschedule_delay() {
        let interval = Duration::from_secs(5);
        let backoff = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        assert_eq!(reschedule_delay(interval, backoff, 0, max), Duration::from_secs(5));
        assert_eq!(reschedule_delay(interval, backoff, 2, max), Duration::from_secs(25));
        assert_eq!(reschedule_delay(interval, backoff, 100, max), max);
        assert_eq!(reschedule_delay(interval, backoff, u32::MAX, max), max);
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("resource-1"));
        assert!(!tracker.record_failure("resource-1"));
        assert!(!tracker.record_failure("resource-1"));
        assert!(tracker.record_failure("resource-1"));
        assert!(!tracker.record_failure("resource-2"));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_retry_tracker_prunes_expired_keys() {
        let mut tracker = RetryTracker::new(1, Duration::from_secs(10));
        let start = Instant::now();
        tracker.record_failure_at("old", start);
        tracker.record_failure_at("new", start + Duration::from_secs(8));

        tracker.prune_at(start + Duration::from_secs(11));
        assert_eq!(tracker.len(), 1);
        // The surviving key keeps its count.
        assert!(tracker.record_failure_at("new", start + Duration::from_secs(12)));

        tracker.prune_at(start + Duration::from_secs(30));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_retry_tracker_window_resets() {
        let mut tracker = RetryTracker::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(!tracker.record_failure_at("k", start));
        assert!(tracker.record_failure_at("k", start + Duration::from_secs(1)));
        assert!(!tracker.record_failure_at("k", start + Duration::from_secs(12)));
    }

    proptest! {
        #[test]
        fn prop_unit_bounds_keep_steps_small(
            desired in 1u32..50,
            old_current in 0u32..50,
            new_current in 0u32..50,
            delete_first in any::<bool>(),
        ) {
            let strategy = RollingStrategy {
                max_surge: 1,
                max_unavailable: 1,
                order: if delete_first { RollingOrder::DeleteFirst } else { RollingOrder::CreateFirst },
            };
            if let Some(step) = strategy.next_step(desired, old_current, new_current) {
                prop_assert!(step.old_target + 1 >= old_current);
                prop_assert!(step.new_target <= new_current + 1);
                prop_assert!(step.old_target <= old_current);
                prop_assert!(step.new_target >= new_current);
            }
        }

        #[test]
        fn prop_rollout_terminates(desired in 1u32..20, surge in 0u32..4, unavailable in 0u32..4) {
            for order in [RollingOrder::CreateFirst, RollingOrder::DeleteFirst] {
                let strategy = RollingStrategy { max_surge: surge, max_unavailable: unavailable, order };
                let (mut old, mut new) = (desired, 0);
                let mut steps = 0;
                while let Some(step) = strategy.next_step(desired, old, new) {
                    old = step.old_target;
                    new = step.new_target;
                    steps += 1;
                    prop_assert!(steps <= 2 * desired + 2);
                }
                prop_assert_eq!((old, new), (0, desired));
            }
        }
    }
}
