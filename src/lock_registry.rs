use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Mutual exclusion scoped by object key, for an unbounded and changing key set.
///
/// A single mutex guards the set of currently-locked keys; a condvar parks waiters.
/// No per-key primitive is allocated — the set only ever holds currently contended
/// keys, so holders of different keys never block each other and the registry's
/// memory footprint tracks concurrency, not the (much larger) key space.
#[derive(Default)]
pub struct LockRegistry {
    locked: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` has no holder, then record the caller as holder.
    pub fn acquire(&self, key: &str) {
        let mut locked = self.locked.lock().unwrap();
        while locked.contains(key) {
            locked = self.released.wait(locked).unwrap();
        }
        locked.insert(key.to_string());
    }

    /// Remove the holder record for `key` and wake any waiters.
    pub fn release(&self, key: &str) {
        self.locked.lock().unwrap().remove(key);
        self.released.notify_all();
    }

    /// Acquire `key`, run `body`, and release on every exit path (including panics).
    pub fn with_lock<T>(&self, key: &str, body: impl FnOnce() -> T) -> T {
        let _guard = self.lock(key);
        body()
    }

    /// Acquire `key` and return a guard that releases it on drop.
    pub fn lock<'a>(&'a self, key: &str) -> LockGuard<'a> {
        self.acquire(key);
        LockGuard { registry: self, key: key.to_string() }
    }
}

pub struct LockGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn disjoint_keys_never_block_each_other() {
        let registry = LockRegistry::new();
        let _a = registry.lock("a");
        // "b" must be acquirable while "a" is held.
        let _b = registry.lock("b");
    }

    #[test]
    fn same_key_serializes_holders() {
        let registry = Arc::new(LockRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let registry = registry.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(thread::spawn(move || {
                registry.with_lock("obj", || {
                    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_releases_on_early_return() {
        let registry = LockRegistry::new();
        fn do_with(registry: &LockRegistry) {
            let _guard = registry.lock("x");
            // implicit early return point
        }
        do_with(&registry);
        // if the guard had not released, this would deadlock.
        let _again = registry.lock("x");
    }
}
