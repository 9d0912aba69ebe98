// =============================================================================
// Cooldown Tracker: per (entity, reason bucket) suppression windows
// =============================================================================
//
// A denial that is expected to repeat every cycle (noise, bootstrap, min hold,
// blocked) registers here. The first denial opens a window; repeats inside the
// window only bump the suppression counter, so the same signal is not logged
// or re-escalated every scan. Every N-th suppression is flagged `should_log`
// so operators still see that suppression is ongoing.
//
// Windows are not extended by repeats. A window always elapses, after which
// the next denial opens a fresh one.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::reason::CooldownBucket;
use crate::runtime_config::CooldownParams;
use crate::types::MS_PER_MINUTE;

/// Suppression state for one (entity, bucket) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub entity: String,
    pub bucket: CooldownBucket,
    pub suppressed_until_ms: i64,
    pub suppression_count: u32,
    pub first_triggered_ms: i64,
    pub last_triggered_ms: i64,
    /// Free-form cause of the most recent suppression, for audit only.
    pub last_cause: String,
}

/// Result of a cooldown lookup or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownStatus {
    pub on_cooldown: bool,
    pub should_log: bool,
    pub remaining_ms: i64,
    pub suppression_count: u32,
}

impl CooldownStatus {
    fn clear() -> Self {
        Self {
            on_cooldown: false,
            should_log: true,
            remaining_ms: 0,
            suppression_count: 0,
        }
    }
}

type Key = (String, CooldownBucket);

pub struct CooldownTracker {
    entries: RwLock<HashMap<Key, CooldownEntry>>,
    params: CooldownParams,
}

impl CooldownTracker {
    pub fn new(params: CooldownParams) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            params,
        }
    }

    /// Window length for a bucket.
    pub fn duration_ms(&self, bucket: &CooldownBucket) -> i64 {
        let minutes = match bucket {
            b if b.is_extended() => self.params.extended_minutes,
            CooldownBucket::ScoreHealth => self.params.health_minutes,
            CooldownBucket::Velocity => self.params.velocity_minutes,
            _ => self.params.default_minutes,
        };
        minutes as i64 * MS_PER_MINUTE
    }

    /// Look up the suppression state without mutating it.
    pub fn check(&self, entity: &str, bucket: &CooldownBucket, now_ms: i64) -> CooldownStatus {
        let entries = self.entries.read();
        match entries.get(&(entity.to_string(), bucket.clone())) {
            Some(e) if now_ms < e.suppressed_until_ms => CooldownStatus {
                on_cooldown: true,
                should_log: self.periodic_log(e.suppression_count),
                remaining_ms: e.suppressed_until_ms - now_ms,
                suppression_count: e.suppression_count,
            },
            _ => CooldownStatus::clear(),
        }
    }

    /// [`check`](Self::check) keyed by a free-form reason string.
    pub fn check_reason(&self, entity: &str, reason: &str, now_ms: i64) -> CooldownStatus {
        self.check(entity, &CooldownBucket::normalize(reason), now_ms)
    }

    /// Register a suppression. Opens a window if none is active, otherwise
    /// counts one more suppression inside the current window.
    pub fn record(
        &self,
        entity: &str,
        bucket: &CooldownBucket,
        cause: &str,
        now_ms: i64,
    ) -> CooldownStatus {
        let duration = self.duration_ms(bucket);
        let mut entries = self.entries.write();
        let key = (entity.to_string(), bucket.clone());

        if let Some(e) = entries.get_mut(&key) {
            if now_ms < e.suppressed_until_ms {
                e.suppression_count += 1;
                e.last_triggered_ms = now_ms;
                e.last_cause = cause.to_string();
                return CooldownStatus {
                    on_cooldown: true,
                    should_log: self.periodic_log(e.suppression_count),
                    remaining_ms: e.suppressed_until_ms - now_ms,
                    suppression_count: e.suppression_count,
                };
            }
        }

        entries.insert(
            key,
            CooldownEntry {
                entity: entity.to_string(),
                bucket: bucket.clone(),
                suppressed_until_ms: now_ms + duration,
                suppression_count: 1,
                first_triggered_ms: now_ms,
                last_triggered_ms: now_ms,
                last_cause: cause.to_string(),
            },
        );

        CooldownStatus {
            on_cooldown: true,
            should_log: true,
            remaining_ms: duration,
            suppression_count: 1,
        }
    }

    /// Remove one bucket, or every bucket when `bucket` is `None`, for an
    /// entity. Returns how many entries were dropped.
    pub fn clear(&self, entity: &str, bucket: Option<&CooldownBucket>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        match bucket {
            Some(b) => {
                entries.remove(&(entity.to_string(), b.clone()));
            }
            None => entries.retain(|(e, _), _| e != entity),
        }
        before - entries.len()
    }

    /// Drop every window that has elapsed.
    pub fn prune_expired(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now_ms < e.suppressed_until_ms);
        before - entries.len()
    }

    pub fn active_count(&self, now_ms: i64) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| now_ms < e.suppressed_until_ms)
            .count()
    }

    /// All entries held for an entity, sorted by bucket label.
    pub fn snapshot(&self, entity: &str) -> Vec<CooldownEntry> {
        let mut out: Vec<CooldownEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.entity == entity)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.bucket.label());
        out
    }

    fn periodic_log(&self, count: u32) -> bool {
        let n = self.params.log_every_n_suppressions;
        n > 0 && count % n == 0
    }
}

impl std::fmt::Debug for CooldownTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownTracker")
            .field("entries", &self.entries.read().len())
            .field("params", &self.params)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CooldownTracker {
        CooldownTracker::new(CooldownParams::default())
    }

    #[test]
    fn fourth_call_sees_three_suppressions() {
        let t = tracker();
        let bucket = CooldownBucket::ScoreHealth;
        for i in 0..3 {
            t.record("pool-1", &bucket, "MHI_DROP", i * 1_000);
        }

        let status = t.check("pool-1", &bucket, 3_000);
        assert!(status.on_cooldown);
        assert_eq!(status.suppression_count, 3);

        // Health window is 10 minutes from the first record.
        let after = t.check("pool-1", &bucket, 10 * MS_PER_MINUTE);
        assert!(!after.on_cooldown);
        assert_eq!(after.suppression_count, 0);
    }

    #[test]
    fn variants_share_one_window() {
        let t = tracker();
        t.record("pool-1", &CooldownBucket::normalize("MHI_DROP_12"), "a", 0);
        let status = t.check_reason("pool-1", "score drop to 30", 1_000);
        assert!(status.on_cooldown, "score variants must share the MHI window");
        assert_eq!(status.suppression_count, 1);
    }

    #[test]
    fn bucket_durations_follow_tiers() {
        let t = tracker();
        let extended = t.duration_ms(&CooldownBucket::CostNotAmortized);
        let health = t.duration_ms(&CooldownBucket::ScoreHealth);
        let velocity = t.duration_ms(&CooldownBucket::Velocity);
        let other = t.duration_ms(&CooldownBucket::Other("X".into()));
        assert!(extended > health && health > velocity && velocity > other);
        assert_eq!(extended, 30 * MS_PER_MINUTE);
    }

    #[test]
    fn should_log_every_nth_suppression() {
        let mut params = CooldownParams::default();
        params.log_every_n_suppressions = 3;
        let t = CooldownTracker::new(params);
        let bucket = CooldownBucket::Velocity;

        let logs: Vec<bool> = (0..7)
            .map(|i| t.record("p", &bucket, "velocity", i).should_log)
            .collect();
        // 1st opens the window, then counts 3 and 6 are periodic.
        assert_eq!(logs, vec![true, false, true, false, false, true, false]);
    }

    #[test]
    fn repeats_do_not_extend_the_window() {
        let t = tracker();
        let bucket = CooldownBucket::Velocity;
        t.record("p", &bucket, "v", 0);
        t.record("p", &bucket, "v", 4 * MS_PER_MINUTE);
        assert!(!t.check("p", &bucket, 5 * MS_PER_MINUTE).on_cooldown);

        let reopened = t.record("p", &bucket, "v", 5 * MS_PER_MINUTE);
        assert_eq!(reopened.suppression_count, 1);
        assert!(reopened.should_log);
    }

    #[test]
    fn clear_one_or_all() {
        let t = tracker();
        t.record("p", &CooldownBucket::Velocity, "v", 0);
        t.record("p", &CooldownBucket::MinHoldNotMet, "m", 0);
        t.record("q", &CooldownBucket::Velocity, "v", 0);

        assert_eq!(t.clear("p", Some(&CooldownBucket::Velocity)), 1);
        assert_eq!(t.snapshot("p").len(), 1);
        assert_eq!(t.clear("p", None), 1);
        assert!(t.snapshot("p").is_empty());
        assert_eq!(t.active_count(0), 1);
    }

    #[test]
    fn prune_drops_elapsed_windows() {
        let t = tracker();
        t.record("p", &CooldownBucket::Other("X".into()), "x", 0);
        t.record("p", &CooldownBucket::CostNotAmortized, "c", 0);
        assert_eq!(t.prune_expired(3 * MS_PER_MINUTE), 1);
        assert_eq!(t.active_count(3 * MS_PER_MINUTE), 1);
    }
}
