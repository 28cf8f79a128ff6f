//! In-memory object store for one (cluster, kind) pair.
//!
//! Objects are bucketed per namespace (cluster-scoped kinds use the empty
//! namespace), so namespace-scoped reads touch one bucket. The owning watch
//! loop is the only writer; readers take a short read lock and leave with
//! `Arc` clones, so a reader never holds the lock while decoding.

use super::errors::{lock_poisoned_error, CacheError};
use crate::k8s::selector::LabelSelector;
use kube::core::DynamicObject;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

type Bucket = BTreeMap<String, Arc<DynamicObject>>;

#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: RwLock<BTreeMap<String, Bucket>>,
    retired: AtomicBool,
}

impl ObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a complete list result in one step, so readers see either the old
    /// or the new snapshot and never a partially applied list. Returns every
    /// namespace present in either snapshot.
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a previous writer panicked
    pub fn replace(&self, items: Vec<DynamicObject>) -> Result<BTreeSet<String>, CacheError> {
        let mut fresh: BTreeMap<String, Bucket> = BTreeMap::new();
        for obj in items {
            let namespace = obj.namespace().unwrap_or_default();
            fresh
                .entry(namespace)
                .or_default()
                .insert(obj.name_any(), Arc::new(obj));
        }

        let mut objects = self
            .objects
            .write()
            .map_err(|_| lock_poisoned_error("object store write lock poisoned"))?;
        if self.is_retired() {
            return Ok(BTreeSet::new());
        }
        let touched = objects.keys().chain(fresh.keys()).cloned().collect();
        *objects = fresh;
        drop(objects);
        Ok(touched)
    }

    /// Insert or overwrite one object (watch `Added`/`Modified`)
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a previous writer panicked
    pub fn apply(&self, obj: DynamicObject) -> Result<(), CacheError> {
        let namespace = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let mut objects = self
            .objects
            .write()
            .map_err(|_| lock_poisoned_error("object store write lock poisoned"))?;
        if !self.is_retired() {
            objects.entry(namespace).or_default().insert(name, Arc::new(obj));
        }
        drop(objects);
        Ok(())
    }

    /// Remove one object (watch `Deleted`); returns whether it was present
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a previous writer panicked
    pub fn delete(&self, namespace: &str, name: &str) -> Result<bool, CacheError> {
        let mut objects = self
            .objects
            .write()
            .map_err(|_| lock_poisoned_error("object store write lock poisoned"))?;
        let Some(bucket) = objects.get_mut(namespace) else {
            return Ok(false);
        };
        let removed = bucket.remove(name).is_some();
        if bucket.is_empty() {
            objects.remove(namespace);
        }
        drop(objects);
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns `LockPoisoned` if a previous writer panicked
    pub fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>, CacheError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| lock_poisoned_error("object store read lock poisoned"))?;
        Ok(objects.get(namespace).and_then(|bucket| bucket.get(name)).cloned())
    }

    /// Objects matching `selector`, in one namespace or across all of them
    ///
    /// # Errors
    ///
    /// Returns `LockPoisoned` if a previous writer panicked
    pub fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| lock_poisoned_error("object store read lock poisoned"))?;
        let matching = |bucket: &Bucket| -> Vec<Arc<DynamicObject>> {
            bucket
                .values()
                .filter(|obj| selector.matches(obj.metadata.labels.as_ref()))
                .cloned()
                .collect()
        };
        Ok(match namespace {
            Some(ns) => objects.get(ns).map(matching).unwrap_or_default(),
            None => objects.values().flat_map(matching).collect(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .map_or(0, |objects| objects.values().map(BTreeMap::len).sum())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all objects and ignore further writes; in-flight readers keep their `Arc`s
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if let Ok(mut objects) = self.objects.write() {
            objects.clear();
        }
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Poison the lock the way a panicking writer would
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _objects = self.objects.write();
            panic!("writer panicked while holding the store lock");
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::cache::kind::ResourceKind;

    fn pod(ns: &str, name: &str, app: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ResourceKind::Pod.api_resource()).within(ns);
        obj.metadata.labels = Some(BTreeMap::from([("app".to_string(), app.to_string())]));
        obj
    }

    #[test]
    fn test_replace_and_scoped_list() {
        let store = ObjectStore::new();
        store
            .replace(vec![
                pod("default", "a", "web"),
                pod("default", "b", "db"),
                pod("kube-system", "c", "web"),
            ])
            .unwrap();

        assert_eq!(store.len(), 3);
        let everything = LabelSelector::everything();
        assert_eq!(store.list(Some("default"), &everything).unwrap().len(), 2);
        assert_eq!(store.list(Some("missing"), &everything).unwrap().len(), 0);

        let web: LabelSelector = "app=web".parse().unwrap();
        assert_eq!(store.list(None, &web).unwrap().len(), 2);
        assert_eq!(store.list(Some("kube-system"), &web).unwrap().len(), 1);
    }

    #[test]
    fn test_apply_and_delete() {
        let store = ObjectStore::new();
        store.apply(pod("default", "a", "web")).unwrap();
        store.apply(pod("default", "a", "api")).unwrap();
        assert_eq!(store.len(), 1);

        let current = store.get("default", "a").unwrap().unwrap();
        assert_eq!(current.labels().get("app").map(String::as_str), Some("api"));

        assert!(store.delete("default", "a").unwrap());
        assert!(!store.delete("default", "a").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_replace_drops_objects_missing_from_new_list() {
        let store = ObjectStore::new();
        store
            .replace(vec![pod("default", "a", "web"), pod("default", "b", "web")])
            .unwrap();
        store.replace(vec![pod("default", "b", "web")]).unwrap();
        assert!(store.get("default", "a").unwrap().is_none());
        assert!(store.get("default", "b").unwrap().is_some());
    }

    #[test]
    fn test_replace_reports_old_and_new_namespaces() {
        let store = ObjectStore::new();
        let first = store
            .replace(vec![pod("team-a", "a", "web"), pod("team-b", "b", "web")])
            .unwrap();
        assert_eq!(first, BTreeSet::from(["team-a".to_string(), "team-b".to_string()]));

        let second = store.replace(vec![pod("team-c", "c", "web")]).unwrap();
        assert_eq!(
            second,
            BTreeSet::from(["team-a".to_string(), "team-b".to_string(), "team-c".to_string()])
        );
    }

    #[test]
    fn test_retire_keeps_outstanding_references() {
        let store = ObjectStore::new();
        store.apply(pod("default", "a", "web")).unwrap();
        let held = store.get("default", "a").unwrap().unwrap();

        store.retire();
        assert!(store.is_retired());
        assert!(store.is_empty());
        assert_eq!(held.name_any(), "a");

        store.apply(pod("default", "b", "web")).unwrap();
        assert!(store.replace(vec![pod("default", "c", "web")]).unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_poisoned_lock_is_reported() {
        let store = ObjectStore::new();
        store.poison();
        assert!(matches!(store.replace(Vec::new()), Err(CacheError::LockPoisoned(_))));
        assert!(matches!(store.get("default", "a"), Err(CacheError::LockPoisoned(_))));
    }
}
