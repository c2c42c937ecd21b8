// ── Subscription tables ──
//
// Pattern-keyed handler registries for states, objects and files, plus
// the instance-message registry. Handlers are compared by `Arc` identity,
// so registering the same `Arc` twice under one pattern is a no-op.
// Tables are plain data owned by the connection; callers take the lock,
// mutate, collect what must be announced, and release it before any I/O
// or handler invocation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::pattern::Pattern;

/// Identity comparison for shared handlers (vtable pointers ignored).
pub(crate) fn same_handler<H: ?Sized>(a: &Arc<H>, b: &Arc<H>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn push_unique<H: ?Sized>(handlers: &mut Vec<Arc<H>>, handler: Arc<H>) -> bool {
    if handlers.iter().any(|h| same_handler(h, &handler)) {
        return false;
    }
    handlers.push(handler);
    true
}

// ── SubscriptionTable ────────────────────────────────────────────────

struct Entry<H: ?Sized> {
    pattern: Pattern,
    handlers: Vec<Arc<H>>,
}

/// Handlers keyed by subscription pattern.
///
/// A pattern is tracked while at least one handler is registered on it.
pub(crate) struct SubscriptionTable<H: ?Sized> {
    entries: BTreeMap<String, Entry<H>>,
}

impl<H: ?Sized> Default for SubscriptionTable<H> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<H: ?Sized> SubscriptionTable<H> {
    /// Register `handler` on `pattern`. Returns `true` when the pattern
    /// was not tracked before and must be announced.
    pub fn subscribe(&mut self, pattern: &str, handler: Arc<H>) -> bool {
        match self.entries.get_mut(pattern) {
            Some(entry) => {
                push_unique(&mut entry.handlers, handler);
                false
            }
            None => {
                self.entries.insert(
                    pattern.to_owned(),
                    Entry {
                        pattern: Pattern::new(pattern),
                        handlers: vec![handler],
                    },
                );
                true
            }
        }
    }

    /// Remove `handler` (or every handler when `None`) from `pattern`.
    /// Returns `true` when the pattern is no longer tracked as a result.
    pub fn unsubscribe(&mut self, pattern: &str, handler: Option<&Arc<H>>) -> bool {
        let Some(entry) = self.entries.get_mut(pattern) else {
            return false;
        };
        match handler {
            Some(handler) => entry.handlers.retain(|h| !same_handler(h, handler)),
            None => entry.handlers.clear(),
        }
        if entry.handlers.is_empty() {
            self.entries.remove(pattern);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.contains_key(pattern)
    }

    /// Handlers of every pattern matching `id`, in pattern order.
    pub fn matching(&self, id: &str) -> Vec<Arc<H>> {
        self.entries
            .values()
            .filter(|entry| entry.pattern.matches(id))
            .flat_map(|entry| entry.handlers.iter().cloned())
            .collect()
    }

    /// Handlers registered on exactly `pattern`.
    pub fn exact(&self, pattern: &str) -> Vec<Arc<H>> {
        self.entries
            .get(pattern)
            .map(|entry| entry.handlers.clone())
            .unwrap_or_default()
    }

    pub fn patterns(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── FileSubscriptions ────────────────────────────────────────────────

struct FileEntry<H: ?Sized> {
    id: Pattern,
    file: Pattern,
    handlers: Vec<Arc<H>>,
}

/// File-change handlers keyed by (meta id, file-name pattern).
pub(crate) struct FileSubscriptions<H: ?Sized> {
    entries: BTreeMap<(String, String), FileEntry<H>>,
}

impl<H: ?Sized> Default for FileSubscriptions<H> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<H: ?Sized> FileSubscriptions<H> {
    pub fn subscribe(&mut self, id: &str, file_pattern: &str, handler: Arc<H>) -> bool {
        let key = (id.to_owned(), file_pattern.to_owned());
        match self.entries.get_mut(&key) {
            Some(entry) => {
                push_unique(&mut entry.handlers, handler);
                false
            }
            None => {
                self.entries.insert(
                    key,
                    FileEntry {
                        id: Pattern::new(id),
                        file: Pattern::new(file_pattern),
                        handlers: vec![handler],
                    },
                );
                true
            }
        }
    }

    pub fn unsubscribe(&mut self, id: &str, file_pattern: &str, handler: Option<&Arc<H>>) -> bool {
        let key = (id.to_owned(), file_pattern.to_owned());
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        match handler {
            Some(handler) => entry.handlers.retain(|h| !same_handler(h, handler)),
            None => entry.handlers.clear(),
        }
        if entry.handlers.is_empty() {
            self.entries.remove(&key);
            true
        } else {
            false
        }
    }

    /// Handlers whose id and file-name patterns both match.
    pub fn matching(&self, id: &str, file_name: &str) -> Vec<Arc<H>> {
        self.entries
            .values()
            .filter(|entry| entry.id.matches(id) && entry.file.matches(file_name))
            .flat_map(|entry| entry.handlers.iter().cloned())
            .collect()
    }

    /// Tracked file patterns grouped by meta id.
    pub fn grouped(&self) -> Vec<(String, Vec<String>)> {
        let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
        for (id, file) in self.entries.keys() {
            match grouped.last_mut() {
                Some((last, files)) if last == id => files.push(file.clone()),
                _ => grouped.push((id.clone(), vec![file.clone()])),
            }
        }
        grouped
    }
}

// ── InstanceSubscriptions ────────────────────────────────────────────

struct InstanceEntry<H: ?Sized> {
    message_type: String,
    handler: Arc<H>,
}

/// Instance-message handlers keyed by `system.adapter.<instance>`.
pub(crate) struct InstanceSubscriptions<H: ?Sized> {
    entries: HashMap<String, Vec<InstanceEntry<H>>>,
}

impl<H: ?Sized> Default for InstanceSubscriptions<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H: ?Sized> InstanceSubscriptions<H> {
    /// Register a (type, handler) pair. Returns `false` if it already was.
    pub fn subscribe(&mut self, instance: &str, message_type: &str, handler: Arc<H>) -> bool {
        let subs = self.entries.entry(instance.to_owned()).or_default();
        if subs
            .iter()
            .any(|s| s.message_type == message_type && same_handler(&s.handler, &handler))
        {
            return false;
        }
        subs.push(InstanceEntry {
            message_type: message_type.to_owned(),
            handler,
        });
        true
    }

    /// Remove the first registration matching the filters. Returns the
    /// removed message type and whether any other registration of that
    /// type remains for the instance.
    pub fn remove_one(
        &mut self,
        instance: &str,
        message_type: Option<&str>,
        handler: Option<&Arc<H>>,
    ) -> Option<(String, bool)> {
        let subs = self.entries.get_mut(instance)?;
        let pos = subs.iter().position(|s| {
            message_type.is_none_or(|t| s.message_type == t)
                && handler.is_none_or(|h| same_handler(&s.handler, h))
        })?;
        let removed = subs.remove(pos);
        let type_remains = subs.iter().any(|s| s.message_type == removed.message_type);
        if subs.is_empty() {
            self.entries.remove(instance);
        }
        Some((removed.message_type, type_remains))
    }

    /// Handlers registered for messages of `message_type` from `instance`.
    pub fn matching(&self, instance: &str, message_type: &str) -> Vec<Arc<H>> {
        self.entries
            .get(instance)
            .into_iter()
            .flatten()
            .filter(|s| s.message_type == message_type)
            .map(|s| Arc::clone(&s.handler))
            .collect()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Handler = dyn Fn(&str) + Send + Sync;

    fn handler() -> Arc<Handler> {
        Arc::new(|_: &str| {})
    }

    #[test]
    fn subscribe_reports_only_new_patterns() {
        let mut table: SubscriptionTable<Handler> = SubscriptionTable::default();
        let h = handler();
        assert!(table.subscribe("a.*", Arc::clone(&h)));
        assert!(!table.subscribe("a.*", Arc::clone(&h)));
        assert!(!table.subscribe("a.*", handler()));
        assert_eq!(table.exact("a.*").len(), 2);
    }

    #[test]
    fn same_handler_twice_is_delivered_once() {
        let mut table: SubscriptionTable<Handler> = SubscriptionTable::default();
        let h = handler();
        table.subscribe("a.b", Arc::clone(&h));
        table.subscribe("a.b", Arc::clone(&h));
        assert_eq!(table.matching("a.b").len(), 1);
    }

    #[test]
    fn removing_last_handler_drops_pattern() {
        let mut table: SubscriptionTable<Handler> = SubscriptionTable::default();
        let h1 = handler();
        let h2 = handler();
        table.subscribe("a.b", Arc::clone(&h1));
        table.subscribe("a.b", Arc::clone(&h2));

        assert!(!table.unsubscribe("a.b", Some(&h1)));
        assert!(table.contains("a.b"));
        assert!(table.unsubscribe("a.b", Some(&h2)));
        assert!(!table.contains("a.b"));
        assert!(table.matching("a.b").is_empty());
    }

    #[test]
    fn unsubscribe_without_handler_clears_pattern() {
        let mut table: SubscriptionTable<Handler> = SubscriptionTable::default();
        table.subscribe("x", handler());
        table.subscribe("x", handler());
        assert!(table.unsubscribe("x", None));
        assert!(table.is_empty());
        assert!(!table.unsubscribe("x", None));
    }

    #[test]
    fn matching_spans_overlapping_patterns() {
        let mut table: SubscriptionTable<Handler> = SubscriptionTable::default();
        table.subscribe("hm-rpc.0.*", handler());
        table.subscribe("hm-rpc.0.dev1.STATE", handler());
        table.subscribe("zigbee.*", handler());
        assert_eq!(table.matching("hm-rpc.0.dev1.STATE").len(), 2);
        assert_eq!(table.patterns().len(), 3);
    }

    #[test]
    fn files_match_on_both_patterns() {
        let mut files: FileSubscriptions<Handler> = FileSubscriptions::default();
        files.subscribe("vis.0", "main/*.json", handler());
        files.subscribe("vis.0", "*.css", handler());
        files.subscribe("web.0", "*", handler());

        assert_eq!(files.matching("vis.0", "main/views.json").len(), 1);
        assert_eq!(files.matching("vis.0", "other.txt").len(), 0);
        assert_eq!(
            files.grouped(),
            vec![
                ("vis.0".to_owned(), vec!["*.css".to_owned(), "main/*.json".to_owned()]),
                ("web.0".to_owned(), vec!["*".to_owned()]),
            ]
        );
    }

    #[test]
    fn instance_registrations_are_unique_per_type_and_handler() {
        let mut subs: InstanceSubscriptions<Handler> = InstanceSubscriptions::default();
        let h = handler();
        assert!(subs.subscribe("system.adapter.a.0", "t1", Arc::clone(&h)));
        assert!(!subs.subscribe("system.adapter.a.0", "t1", Arc::clone(&h)));
        assert!(subs.subscribe("system.adapter.a.0", "t2", Arc::clone(&h)));
        assert_eq!(subs.matching("system.adapter.a.0", "t1").len(), 1);

        assert_eq!(
            subs.remove_one("system.adapter.a.0", Some("t1"), None),
            Some(("t1".to_owned(), false))
        );
        assert_eq!(
            subs.remove_one("system.adapter.a.0", None, Some(&h)),
            Some(("t2".to_owned(), false))
        );
        assert!(subs.is_empty());
    }
}
