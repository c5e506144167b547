use crate::error::{ChronError, Result};
use log::debug;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Per-`(document_id, branch)` version counter. Monotonically
/// non-decreasing (spec §3 invariant).
#[derive(Default)]
pub struct VersionTracker {
    versions: Mutex<HashMap<(String, String), u64>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str, branch: &str) -> u64 {
        *self
            .versions
            .lock()
            .unwrap()
            .get(&(id.to_string(), branch.to_string()))
            .unwrap_or(&0)
    }

    pub fn set(&self, id: &str, branch: &str, v: u64) {
        self.versions
            .lock()
            .unwrap()
            .insert((id.to_string(), branch.to_string()), v);
    }

    pub fn increment(&self, id: &str, branch: &str) -> u64 {
        let mut map = self.versions.lock().unwrap();
        let entry = map.entry((id.to_string(), branch.to_string())).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Raises `VersionConflict` iff `expected != current` and a version
    /// has actually been recorded (`current > 0`) — a never-before-seen
    /// document has no conflict to detect yet.
    pub fn verify(&self, id: &str, branch: &str, expected: u64) -> Result<()> {
        let actual = self.get(id, branch);
        if expected != actual && actual > 0 {
            return Err(ChronError::VersionConflict {
                expected,
                actual,
                id: id.to_string(),
                branch: branch.to_string(),
            });
        }
        Ok(())
    }
}

/// One exclusive lock per branch, acquired for the entire write critical
/// section. Reads never take this lock.
#[derive(Default)]
pub struct BranchLocks {
    locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, branch: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(branch.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` with `branch`'s exclusive lock held for `f`'s entire
    /// duration, released on every exit path including panics (the guard
    /// unwinds normally since the lock is a local binding).
    pub fn with_lock<T>(&self, branch: &str, f: impl FnOnce() -> T) -> T {
        let mutex = self.mutex_for(branch);
        let _guard = mutex.lock().unwrap();
        f()
    }
}

/// Retry configuration for `with_occ_retry` (spec §4.D defaults).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    pub mult: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_ms: 10,
            cap_ms: 1000,
            mult: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Runs `f`; on `VersionConflict` sleeps with bounded exponential backoff
/// plus jitter and retries up to `config.max_retries` times. Any other
/// error propagates immediately. `on_retry`/`on_conflict` fire before each
/// sleep, in that order.
pub fn with_occ_retry<T>(
    config: &RetryConfig,
    mut on_conflict: impl FnMut(u32, &ChronError),
    mut on_retry: impl FnMut(u32, Duration),
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e @ ChronError::VersionConflict { .. }) => {
                attempt += 1;
                on_conflict(attempt, &e);
                if attempt > config.max_retries {
                    return Err(e);
                }
                let delay = backoff_delay(config, attempt);
                on_retry(attempt, delay);
                debug!("occ: retry {} after {:?}", attempt, delay);
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = config.base_ms as f64 * config.mult.powi(attempt as i32 - 1);
    let capped = raw.min(config.cap_ms as f64);
    let jitter_span = capped * config.jitter_factor;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let final_ms = (capped + jitter).max(0.0);
    Duration::from_millis(final_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn verify_passes_on_match() {
        let vt = VersionTracker::new();
        vt.set("a", "main", 5);
        assert!(vt.verify("a", "main", 5).is_ok());
    }

    #[test]
    fn verify_fails_on_mismatch() {
        let vt = VersionTracker::new();
        vt.set("a", "main", 5);
        let err = vt.verify("a", "main", 4).unwrap_err();
        assert!(matches!(err, ChronError::VersionConflict { expected: 4, actual: 5, .. }));
    }

    #[test]
    fn verify_skips_never_seen_document() {
        let vt = VersionTracker::new();
        assert!(vt.verify("new-doc", "main", 0).is_ok());
        assert!(vt.verify("new-doc", "main", 99).is_ok());
    }

    #[test]
    fn increment_is_monotonic() {
        let vt = VersionTracker::new();
        assert_eq!(vt.increment("a", "main"), 1);
        assert_eq!(vt.increment("a", "main"), 2);
        assert_eq!(vt.get("a", "main"), 2);
    }

    #[test]
    fn branch_lock_serializes_access() {
        let locks = BranchLocks::new();
        let counter = std::sync::Arc::new(AtomicU32::new(0));
        let locks = std::sync::Arc::new(locks);

        let mut handles = vec![];
        for _ in 0..4 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                locks.with_lock("main", || {
                    let before = counter.load(Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    counter.store(before + 1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn retry_loop_succeeds_after_conflicts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 3,
            base_ms: 1,
            cap_ms: 2,
            mult: 2.0,
            jitter_factor: 0.0,
        };
        let result = with_occ_retry(
            &config,
            |_, _| {},
            |_, _| {},
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ChronError::VersionConflict {
                        expected: 1,
                        actual: 2,
                        id: "a".into(),
                        branch: "main".into(),
                    })
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_loop_surfaces_after_max_retries() {
        let config = RetryConfig {
            max_retries: 2,
            base_ms: 1,
            cap_ms: 2,
            mult: 2.0,
            jitter_factor: 0.0,
        };
        let result: Result<()> = with_occ_retry(
            &config,
            |_, _| {},
            |_, _| {},
            || {
                Err(ChronError::VersionConflict {
                    expected: 1,
                    actual: 2,
                    id: "a".into(),
                    branch: "main".into(),
                })
            },
        );
        assert!(matches!(result, Err(ChronError::VersionConflict { .. })));
    }

    #[test]
    fn retry_loop_propagates_non_conflict_immediately() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default();
        let result: Result<()> = with_occ_retry(
            &config,
            |_, _| {},
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChronError::StorageUnavailable)
            },
        );
        assert!(matches!(result, Err(ChronError::StorageUnavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
