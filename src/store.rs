use std::collections::BTreeMap;
use std::sync::Arc;

/// Keys added, replaced and removed relative to the original snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CowDelta<K> {
    pub added: Vec<K>,
    pub changed: Vec<K>,
    pub deleted: Vec<K>,
}

impl<K> Default for CowDelta<K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            changed: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

/// An ordered keyed store backed by an immutable snapshot. Reads go to the
/// current map, which is the snapshot itself until the first write; the
/// first write shallow-copies the snapshot. Writing a value equal to the
/// stored one (under the injected equality predicate) before any other
/// write is a no-op and does not mark the store dirty.
pub struct CowMap<K, V> {
    original: Arc<BTreeMap<K, V>>,
    current: Option<BTreeMap<K, V>>,
    equals: fn(&V, &V) -> bool,
}

impl<K: Clone + Ord, V: Clone + PartialEq> CowMap<K, V> {
    pub fn new(original: Arc<BTreeMap<K, V>>) -> Self {
        Self::with_equals(original, |a, b| a == b)
    }

    /// Creates a store with a custom value-equality predicate. The
    /// predicate decides both write suppression and change detection.
    pub fn with_equals(original: Arc<BTreeMap<K, V>>, equals: fn(&V, &V) -> bool) -> Self {
        Self {
            original,
            current: None,
            equals,
        }
    }

    fn map(&self) -> &BTreeMap<K, V> {
        self.current.as_ref().unwrap_or(&self.original)
    }

    fn map_mut(&mut self) -> &mut BTreeMap<K, V> {
        if self.current.is_none() {
            self.current = Some(self.original.as_ref().clone());
        }
        self.current.as_mut().unwrap()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map().get(key)
    }

    /// Reads the snapshot value regardless of later writes.
    pub fn get_original(&self, key: &K) -> Option<&V> {
        self.original.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map_mut().get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map().contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.current.is_none() {
            if let Some(stored) = self.original.get(&key) {
                if (self.equals)(stored, &value) {
                    return;
                }
            }
        }
        self.map_mut().insert(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.contains(key) {
            return None;
        }
        self.map_mut().remove(key)
    }

    pub fn clear(&mut self) {
        if self.map().is_empty() {
            return;
        }
        self.map_mut().clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map().keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map().values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map().iter()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Returns true when the current map differs from the snapshot.
    pub fn has_changed(&self) -> bool {
        let current = match &self.current {
            None => return false,
            Some(current) => current,
        };
        if current.len() != self.original.len() {
            return true;
        }
        !current
            .iter()
            .zip(self.original.iter())
            .all(|((ck, cv), (ok, ov))| ck == ok && (self.equals)(cv, ov))
    }

    /// Returns the keys added, replaced and removed relative to the
    /// snapshot.
    pub fn delta(&self) -> CowDelta<K> {
        let mut delta = CowDelta::default();
        let current = match &self.current {
            None => return delta,
            Some(current) => current,
        };
        for (key, value) in current {
            match self.original.get(key) {
                None => delta.added.push(key.clone()),
                Some(stored) if !(self.equals)(stored, value) => delta.changed.push(key.clone()),
                Some(_) => {}
            }
        }
        for key in self.original.keys() {
            if !current.contains_key(key) {
                delta.deleted.push(key.clone());
            }
        }
        delta
    }

    /// Clones the current map.
    pub fn to_map(&self) -> BTreeMap<K, V> {
        self.map().clone()
    }

    /// Consumes the store, returning the current map.
    pub fn into_map(self) -> BTreeMap<K, V> {
        match self.current {
            Some(current) => current,
            None => self.original.as_ref().clone(),
        }
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for CowMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CowMap")
            .field("dirty", &self.current.is_some())
            .field("current", self.current.as_ref().unwrap_or(&self.original))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> CowMap<String, i32> {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1);
        map.insert("b".to_string(), 2);
        CowMap::new(Arc::new(map))
    }

    #[test]
    fn reads_pass_through_until_first_write() {
        let map = seeded();
        assert_eq!(map.get(&"a".to_string()), Some(&1));
        assert!(!map.has_changed());
        assert_eq!(map.delta(), CowDelta::default());
    }

    #[test]
    fn equal_insert_is_suppressed() {
        let mut map = seeded();
        map.insert("a".to_string(), 1);
        assert!(!map.has_changed());
    }

    #[test]
    fn writes_copy_and_track_delta() {
        let mut map = seeded();
        map.insert("a".to_string(), 10);
        map.insert("c".to_string(), 3);
        map.remove(&"b".to_string());
        assert!(map.has_changed());
        assert_eq!(map.get_original(&"a".to_string()), Some(&1));
        let delta = map.delta();
        assert_eq!(delta.added, vec!["c".to_string()]);
        assert_eq!(delta.changed, vec!["a".to_string()]);
        assert_eq!(delta.deleted, vec!["b".to_string()]);
    }

    #[test]
    fn write_then_revert_reports_unchanged() {
        let mut map = seeded();
        map.insert("a".to_string(), 10);
        map.insert("a".to_string(), 1);
        assert!(!map.has_changed());
        assert_eq!(map.delta(), CowDelta::default());
    }

    #[test]
    fn removing_a_missing_key_does_not_dirty() {
        let mut map = seeded();
        assert_eq!(map.remove(&"zzz".to_string()), None);
        assert!(!map.has_changed());
    }
}
