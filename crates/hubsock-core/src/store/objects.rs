// ── Object cache ──
//
// Last-known object documents by id. The cache starts out unloaded;
// change pushes are ignored until a bulk fetch (or the initial load)
// populates it. After a disconnect the cache is stale: it still takes
// pushes, but bulk reads must refetch because pushes sent while offline
// were missed.

use std::collections::HashMap;

use crate::model::{IoObject, ObjectIdentity};

/// Outcome of applying an `objectChange` push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ObjectUpdate {
    /// Cache not loaded yet.
    Ignored,
    /// Same content as the cached copy, or deletion of an unknown id.
    Unchanged,
    /// Inserted, replaced or removed. `previous` is the identity of the
    /// cached copy, if there was one.
    Changed { previous: Option<ObjectIdentity> },
}

#[derive(Debug, Default)]
pub(crate) struct ObjectCache {
    objects: Option<HashMap<String, IoObject>>,
    stale: bool,
}

impl ObjectCache {
    pub fn is_loaded(&self) -> bool {
        self.objects.is_some()
    }

    pub fn snapshot(&self) -> Option<HashMap<String, IoObject>> {
        self.objects.clone()
    }

    /// Like [`snapshot`](Self::snapshot), but `None` while stale.
    pub fn fresh_snapshot(&self) -> Option<HashMap<String, IoObject>> {
        if self.stale { None } else { self.snapshot() }
    }

    /// Require the next bulk read to refetch.
    pub fn mark_stale(&mut self) {
        self.stale = self.objects.is_some();
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&IoObject> {
        self.objects.as_ref()?.get(id)
    }

    /// Replace the whole cache.
    pub fn replace(&mut self, objects: HashMap<String, IoObject>) {
        self.objects = Some(objects);
        self.stale = false;
    }

    /// Upsert one document, creating the cache if needed.
    pub fn insert(&mut self, obj: IoObject) {
        self.objects
            .get_or_insert_with(HashMap::new)
            .insert(obj.id.clone(), obj);
    }

    /// Apply a pushed change. `None` means the object was deleted.
    pub fn apply(&mut self, id: &str, obj: Option<IoObject>) -> ObjectUpdate {
        let Some(objects) = self.objects.as_mut() else {
            return ObjectUpdate::Ignored;
        };
        let previous = objects.get(id).map(IoObject::identity);

        match obj {
            Some(obj) => {
                if let Some(cached) = objects.get_mut(id) {
                    // A new revision alone is not a content change.
                    if obj.rev.is_some() {
                        cached.rev.clone_from(&obj.rev);
                    }
                    if *cached == obj {
                        return ObjectUpdate::Unchanged;
                    }
                }
                objects.insert(id.to_owned(), obj);
                ObjectUpdate::Changed { previous }
            }
            // Deleting an id the cache never held changes nothing.
            None => match objects.remove(id) {
                Some(_) => ObjectUpdate::Changed { previous },
                None => ObjectUpdate::Unchanged,
            },
        }
    }
}
