//! Per-script-name mutual exclusion.
//!
//! Every mutation operation holds the lock for its script's normalized
//! name for the duration of its read-modify-write cycle, so two
//! operations on the same logical script from the same session queue
//! instead of interleaving. Unrelated scripts never block each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::lock_api::ArcMutexGuard;

#[derive(Debug, Default)]
pub struct ScriptLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one operation; dropping it releases the slot.
pub struct ScriptLockGuard {
    _guard: ArcMutexGuard<parking_lot::RawMutex, ()>,
}

impl ScriptLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the slot for `key` is free and claim it. The map entry
    /// is created on first use and lives for the session.
    pub fn acquire(&self, key: &str) -> ScriptLockGuard {
        let slot = {
            let mut map = self.inner.lock();
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        ScriptLockGuard {
            _guard: slot.lock_arc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_serializes_critical_sections() {
        let locks = Arc::new(ScriptLocks::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for worker in 0..4 {
            let locks = Arc::clone(&locks);
            let log = Arc::clone(&log);
            handles.push(thread::spawn(move || {
                let _guard = locks.acquire("user:foo/bar.js");
                log.lock().push((worker, "enter"));
                thread::sleep(Duration::from_millis(5));
                log.lock().push((worker, "exit"));
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let log = log.lock();
        // Entries must strictly alternate enter/exit per holder.
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "enter");
            assert_eq!(pair[1].1, "exit");
        }
    }

    #[test]
    fn different_keys_do_not_block() {
        let locks = ScriptLocks::new();
        let first = locks.acquire("user:a/a.js");
        // Acquiring an unrelated key while the first is held must not
        // deadlock or wait.
        let second = locks.acquire("user:b/b.js");
        drop(first);
        drop(second);
    }

    #[test]
    fn slot_is_reusable_after_release() {
        let locks = ScriptLocks::new();
        drop(locks.acquire("user:a/a.js"));
        drop(locks.acquire("user:a/a.js"));
    }
}
