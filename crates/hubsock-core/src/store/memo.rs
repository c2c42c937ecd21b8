// ── Memoized requests ──
//
// Coalesces concurrent and repeated read-only requests by key. While a
// request is in flight the cache holds only a weak handle to its shared
// future, so callers arriving meanwhile await the same reply but the
// cache itself never keeps an abandoned request alive. The caller that
// sees the reply stores the value; failures are evicted so the next call
// retries. A generation number keeps a completion or eviction from
// touching a newer entry stored under the same key.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures_util::FutureExt as _;
use futures_util::future::{BoxFuture, Shared, WeakShared};
use serde_json::Value;

use crate::error::ConnectionError;

pub(crate) type MemoFuture = Shared<BoxFuture<'static, Result<Value, ConnectionError>>>;

enum Slot {
    Ready(Value),
    InFlight(WeakShared<BoxFuture<'static, Result<Value, ConnectionError>>>),
}

#[derive(Default)]
pub(crate) struct MemoCache {
    inner: Mutex<MemoInner>,
}

#[derive(Default)]
struct MemoInner {
    next_generation: u64,
    entries: HashMap<String, (u64, Slot)>,
}

impl MemoInner {
    fn store(&mut self, key: &str, slot: Slot) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(key.to_owned(), (generation, slot));
        generation
    }
}

impl MemoCache {
    /// The stored value, or the request still in flight for `key`, with
    /// the generation to pass to [`complete`](Self::complete) or
    /// [`evict`](Self::evict).
    pub fn get(&self, key: &str) -> Option<(u64, MemoFuture)> {
        let mut inner = self.lock();
        let (generation, fut) = match inner.entries.get(key)? {
            (generation, Slot::Ready(value)) => (*generation, Some(ready(value.clone()))),
            (generation, Slot::InFlight(weak)) => (*generation, weak.upgrade()),
        };
        if let Some(fut) = fut {
            Some((generation, fut))
        } else {
            // Every caller gave up before the reply arrived.
            inner.entries.remove(key);
            None
        }
    }

    /// Track an in-flight request under `key`, replacing any previous
    /// entry. Returns its generation.
    pub fn insert(&self, key: &str, fut: &MemoFuture) -> u64 {
        let mut inner = self.lock();
        match fut.downgrade() {
            Some(weak) => inner.store(key, Slot::InFlight(weak)),
            None => match fut.peek() {
                Some(Ok(value)) => inner.store(key, Slot::Ready(value.clone())),
                _ => {
                    inner.entries.remove(key);
                    0
                }
            },
        }
    }

    /// Store an already known value.
    pub fn put(&self, key: &str, value: Value) {
        self.lock().store(key, Slot::Ready(value));
    }

    /// Replace the in-flight entry of `generation` with its reply.
    pub fn complete(&self, key: &str, generation: u64, value: &Value) {
        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            Some((g, slot)) if *g == generation => *slot = Slot::Ready(value.clone()),
            _ => {}
        }
    }

    /// Remove `key` if it still holds the entry of `generation`.
    pub fn evict(&self, key: &str, generation: u64) {
        let mut inner = self.lock();
        if inner.entries.get(key).is_some_and(|(g, _)| *g == generation) {
            inner.entries.remove(key);
        }
    }

    pub fn remove(&self, key: &str) {
        self.lock().entries.remove(key);
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ready(value: Value) -> MemoFuture {
    futures_util::future::ready(Ok(value)).boxed().shared()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> MemoFuture {
        futures_util::future::pending::<Result<Value, ConnectionError>>()
            .boxed()
            .shared()
    }

    #[tokio::test]
    async fn put_then_get() {
        let memo = MemoCache::default();
        memo.put("uuid", json!("abc"));
        let (_, fut) = memo.get("uuid").unwrap();
        assert_eq!(fut.await, Ok(json!("abc")));
        memo.remove("uuid");
        assert!(memo.get("uuid").is_none());
    }

    #[test]
    fn stale_eviction_keeps_newer_entry() {
        let memo = MemoCache::default();
        let fut = pending();
        let first = memo.insert("k", &fut);
        memo.put("k", json!(2));
        memo.evict("k", first);
        memo.complete("k", first, &json!(1));
        assert!(memo.contains("k"));
    }

    #[tokio::test]
    async fn completed_request_is_served_as_value() {
        let memo = MemoCache::default();
        let fut = pending();
        let generation = memo.insert("k", &fut);
        memo.complete("k", generation, &json!(7));
        drop(fut);

        let (_, cached) = memo.get("k").unwrap();
        assert_eq!(cached.await, Ok(json!(7)));
    }

    #[test]
    fn abandoned_request_is_not_kept_alive() {
        let memo = MemoCache::default();
        let fut = pending();
        memo.insert("k", &fut);
        assert!(memo.get("k").is_some());

        drop(fut);
        assert!(memo.get("k").is_none());
        assert!(!memo.contains("k"));
    }
}
