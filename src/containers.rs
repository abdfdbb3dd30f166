use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
    sync::RwLock,
};

// Lock-wrapped map and set used for the shared state of the router: the
// ban cache, the live-stream sets, and the registry's connection table.
// Every operation takes the lock for its full duration; callbacks passed
// to `each` and `filter` must not re-enter the same container.

pub(crate) struct SyncMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub(crate) fn new() -> Self {
        SyncMap {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.write().expect("not poisoned").insert(key, value)
    }

    pub(crate) fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.read().expect("not poisoned").get(key).cloned()
    }

    #[allow(dead_code)]
    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        self.inner.write().expect("not poisoned").remove(key)
    }

    #[allow(dead_code)]
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.inner.read().expect("not poisoned").contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().expect("not poisoned").len()
    }

    #[allow(dead_code)]
    pub(crate) fn clear(&self) {
        self.inner.write().expect("not poisoned").clear()
    }

    // Iterates under a shared lock, stopping at the first error the
    // callback returns. Iteration order is unspecified.
    #[allow(dead_code)]
    pub(crate) fn each<E>(&self, mut callback: impl FnMut(&K, &V) -> Result<(), E>) -> Result<(), E> {
        let map = self.inner.read().expect("not poisoned");
        for (key, value) in map.iter() {
            callback(key, value)?;
        }
        Ok(())
    }

    // Iterates under an exclusive lock, dropping entries for which the
    // predicate returns false.
    pub(crate) fn filter(&self, mut predicate: impl FnMut(&K, &V) -> bool) {
        self.inner
            .write()
            .expect("not poisoned")
            .retain(|key, value| predicate(key, value))
    }
}

pub(crate) struct SyncSet<T> {
    inner: RwLock<HashSet<T>>,
}

impl<T> SyncSet<T>
where
    T: Eq + Hash,
{
    pub(crate) fn new() -> Self {
        SyncSet {
            inner: RwLock::new(HashSet::new()),
        }
    }

    pub(crate) fn insert(&self, item: T) -> bool {
        self.inner.write().expect("not poisoned").insert(item)
    }

    pub(crate) fn remove(&self, item: &T) -> bool {
        self.inner.write().expect("not poisoned").remove(item)
    }

    #[allow(dead_code)]
    pub(crate) fn contains(&self, item: &T) -> bool {
        self.inner.read().expect("not poisoned").contains(item)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.read().expect("not poisoned").len()
    }

    #[allow(dead_code)]
    pub(crate) fn clear(&self) {
        self.inner.write().expect("not poisoned").clear()
    }

    pub(crate) fn each<E>(&self, mut callback: impl FnMut(&T) -> Result<(), E>) -> Result<(), E> {
        let set = self.inner.read().expect("not poisoned");
        for item in set.iter() {
            callback(item)?;
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub(crate) fn filter(&self, mut predicate: impl FnMut(&T) -> bool) {
        self.inner
            .write()
            .expect("not poisoned")
            .retain(|item| predicate(item))
    }
}
