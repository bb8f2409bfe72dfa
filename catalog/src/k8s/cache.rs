use crate::k8s::handlers::EventKind;
use kube::Resource;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Namespace-qualified object name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.as_deref(), meta.name.as_deref()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug)]
pub struct Change<K> {
    pub kind: EventKind,
    pub key: ObjectKey,
    pub object: Arc<K>,
}

impl<K> Clone for Change<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            key: self.key.clone(),
            object: self.object.clone(),
        }
    }
}

pub type Snapshot<K> = Arc<HashMap<ObjectKey, Arc<K>>>;

/// Last observed snapshot of every live object.
#[derive(Debug)]
pub struct Cache<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
        }
    }
}

impl<K: Resource> Cache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn snapshot(&self) -> Snapshot<K> {
        Arc::new(self.objects.clone())
    }

    /// Stores the object, classifying the change by whether the key was
    /// already present rather than by what the remote claimed.
    pub fn upsert(&mut self, key: ObjectKey, obj: K) -> Change<K> {
        let object = Arc::new(obj);
        let kind = match self.objects.insert(key.clone(), object.clone()) {
            Some(_) => EventKind::Updated,
            None => EventKind::Added,
        };
        Change { kind, key, object }
    }

    /// Removes the key. The change carries the snapshot the cache held, the
    /// last version handlers were told about. Unknown keys produce no change.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<Change<K>> {
        let object = self.objects.remove(key)?;
        Some(Change {
            kind: EventKind::Deleted,
            key: key.clone(),
            object,
        })
    }

    /// Replaces the whole cache with a fresh listing and returns the changes
    /// needed to get from the old contents to the new: additions in listing
    /// order, updates for objects whose resource version moved, then
    /// deletions of everything the listing no longer contains.
    pub fn replace(&mut self, listing: Vec<(ObjectKey, K)>) -> Vec<Change<K>> {
        let mut changes = Vec::new();
        let mut fresh = HashMap::with_capacity(listing.len());

        for (key, obj) in listing {
            let object = Arc::new(obj);
            match self.objects.get(&key) {
                None => changes.push(Change {
                    kind: EventKind::Added,
                    key: key.clone(),
                    object: object.clone(),
                }),
                Some(old) if old.meta().resource_version != object.meta().resource_version => {
                    changes.push(Change {
                        kind: EventKind::Updated,
                        key: key.clone(),
                        object: object.clone(),
                    })
                }
                Some(_) => {}
            }
            fresh.insert(key, object);
        }

        let mut stale: Vec<(&ObjectKey, &Arc<K>)> = self
            .objects
            .iter()
            .filter(|(key, _)| !fresh.contains_key(*key))
            .collect();
        stale.sort_by(|a, b| a.0.cmp(b.0));
        changes.extend(stale.into_iter().map(|(key, object)| Change {
            kind: EventKind::Deleted,
            key: key.clone(),
            object: object.clone(),
        }));

        self.objects = fresh;
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn svc(name: &str, version: &str) -> (ObjectKey, Service) {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        (ObjectKey::new(Some("default"), name), svc)
    }

    fn summary(changes: &[Change<Service>]) -> Vec<(EventKind, String)> {
        changes
            .iter()
            .map(|c| (c.kind, c.key.to_string()))
            .collect()
    }

    #[test]
    fn key_requires_a_name() {
        let (key, obj) = svc("svc-a", "1");
        assert_eq!(ObjectKey::of(&obj), Some(key.clone()));
        assert_eq!(key.to_string(), "default/svc-a");
        assert_eq!(ObjectKey::new(None, "cluster").to_string(), "cluster");
        assert_eq!(ObjectKey::of(&Service::default()), None);
    }

    #[test]
    fn upsert_classifies_by_presence() {
        let mut cache = Cache::new();
        let (key, obj) = svc("svc-a", "1");
        assert_eq!(cache.upsert(key.clone(), obj).kind, EventKind::Added);

        let (key, obj) = svc("svc-a", "2");
        let change = cache.upsert(key.clone(), obj);
        assert_eq!(change.kind, EventKind::Updated);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.snapshot()[&key].metadata.resource_version.as_deref(),
            Some("2")
        );
    }

    #[test]
    fn remove_of_unknown_key_is_a_no_op() {
        let mut cache = Cache::new();
        let (key, obj) = svc("svc-a", "1");
        assert!(cache.remove(&key).is_none());

        cache.upsert(key.clone(), obj);
        let change = cache.remove(&key).unwrap();
        assert_eq!(change.kind, EventKind::Deleted);
        assert_eq!(change.object.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(cache.len(), 0);
        assert!(cache.remove(&key).is_none());
    }

    #[test]
    fn replace_into_empty_cache_adds_in_listing_order() {
        let mut cache = Cache::new();
        let changes = cache.replace(vec![svc("svc-b", "1"), svc("svc-a", "1")]);
        assert_eq!(
            summary(&changes),
            vec![
                (EventKind::Added, "default/svc-b".to_string()),
                (EventKind::Added, "default/svc-a".to_string()),
            ]
        );
    }

    #[test]
    fn replace_repairs_a_corrupted_cache() {
        let mut cache = Cache::new();
        cache.replace(vec![svc("svc-a", "1"), svc("svc-b", "1"), svc("svc-c", "1")]);

        let (missing, _) = svc("svc-b", "1");
        cache.objects.remove(&missing);
        let (stale, obj) = svc("svc-x", "9");
        cache.objects.insert(stale, Arc::new(obj));

        let changes = cache.replace(vec![svc("svc-a", "1"), svc("svc-b", "1"), svc("svc-c", "1")]);
        assert_eq!(
            summary(&changes),
            vec![
                (EventKind::Added, "default/svc-b".to_string()),
                (EventKind::Deleted, "default/svc-x".to_string()),
            ]
        );

        let mut keys: Vec<String> = cache.snapshot().keys().map(|k| k.to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["default/svc-a", "default/svc-b", "default/svc-c"]);
    }

    #[test]
    fn replace_reports_moved_versions_as_updates() {
        let mut cache = Cache::new();
        cache.replace(vec![svc("svc-a", "1"), svc("svc-b", "1")]);
        let changes = cache.replace(vec![svc("svc-a", "1"), svc("svc-b", "2")]);
        assert_eq!(
            summary(&changes),
            vec![(EventKind::Updated, "default/svc-b".to_string())]
        );
    }
}
