//! Per currency-pair serialization of read-modify-write sequences.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use ratefeed_common::CurrencyPair;

/// One mutex per currency-pair type, created on first use.
///
/// Unrelated pairs never contend. Callers that need two locks must take the
/// pivot lock first.
#[derive(Default)]
pub struct TypeLocks {
    locks: DashMap<CurrencyPair, Arc<Mutex<()>>>,
}

impl TypeLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `pair`.
    pub fn with_lock<R>(&self, pair: &CurrencyPair, f: impl FnOnce() -> R) -> R {
        // Clone the Arc out so the map shard is not held while waiting
        let lock = self
            .locks
            .entry(pair.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock();
        f()
    }

    /// Number of types seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_type_is_serialized() {
        let locks = Arc::new(TypeLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let pair: CurrencyPair = "EUR_USD".parse().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                let pair = pair.clone();
                thread::spawn(move || {
                    locks.with_lock(&pair, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_nested_locks_on_different_types() {
        let locks = TypeLocks::new();
        let pivot = CurrencyPair::usd_try();
        let other: CurrencyPair = "EUR_USD".parse().unwrap();

        let value = locks.with_lock(&pivot, || locks.with_lock(&other, || 42));
        assert_eq!(value, 42);
        assert_eq!(locks.len(), 2);
    }
}
