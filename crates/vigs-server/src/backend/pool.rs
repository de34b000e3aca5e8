//! Shared scratch resources keyed by their shape.
//!
//! Surfaces of the same size and format share one resource (e.g. the temporary texture a GL
//! surface needs for self-copies). The resource lives as long as at least one [`PoolLease`] for
//! its key does.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

struct PoolEntry<T> {
    resource: Arc<T>,
    users: usize,
}

type PoolMap<K, T> = Mutex<HashMap<K, PoolEntry<T>>>;

pub struct ResourcePool<K, T> {
    map: Arc<PoolMap<K, T>>,
}

impl<K, T> Default for ResourcePool<K, T> {
    fn default() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<K, T>(map: &PoolMap<K, T>) -> MutexGuard<'_, HashMap<K, PoolEntry<T>>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, T> ResourcePool<K, T>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource for `key`, creating it on first use.
    pub fn acquire<E, F>(&self, key: K, create: F) -> Result<PoolLease<K, T>, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut map = lock(&self.map);
        let resource = match map.get_mut(&key) {
            Some(entry) => {
                entry.users += 1;
                Arc::clone(&entry.resource)
            }
            None => {
                let resource = Arc::new(create()?);
                map.insert(
                    key.clone(),
                    PoolEntry {
                        resource: Arc::clone(&resource),
                        users: 1,
                    },
                );
                resource
            }
        };

        Ok(PoolLease {
            pool: Arc::downgrade(&self.map),
            key,
            resource,
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn users(&self, key: &K) -> usize {
        lock(&self.map).get(key).map_or(0, |entry| entry.users)
    }
}

/// One user's claim on a pooled resource.
pub struct PoolLease<K: Eq + Hash, T> {
    pool: Weak<PoolMap<K, T>>,
    key: K,
    resource: Arc<T>,
}

impl<K: Eq + Hash, T> PoolLease<K, T> {
    pub fn get(&self) -> &T {
        &self.resource
    }
}

impl<K: Eq + Hash, T> Drop for PoolLease<K, T> {
    fn drop(&mut self) {
        let Some(map) = self.pool.upgrade() else {
            return;
        };
        // Take the entry out before dropping it so the resource's own Drop runs unlocked.
        let released = {
            let mut map = lock(&map);
            match map.get_mut(&self.key) {
                Some(entry) if entry.users > 1 => {
                    entry.users -= 1;
                    None
                }
                Some(_) => map.remove(&self.key),
                None => None,
            }
        };
        drop(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn same_key_shares_one_resource_until_last_release() {
        let pool: ResourcePool<(u32, u32), Counted> = ResourcePool::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        let created = AtomicUsize::new(0);
        let make = || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(Counted(Arc::clone(&dropped)))
        };

        let a = pool.acquire((64, 32), make).unwrap();
        let b = pool.acquire((64, 32), make).unwrap();
        let c = pool.acquire((8, 8), make).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.users(&(64, 32)), 2);
        assert!(std::ptr::eq(a.get(), b.get()));

        drop(a);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);

        drop(c);
        assert!(pool.is_empty());
    }

    #[test]
    fn failed_create_leaves_no_entry() {
        let pool: ResourcePool<u32, u32> = ResourcePool::new();
        assert_eq!(pool.acquire(1, || Err("no memory")).err(), Some("no memory"));
        assert!(pool.is_empty());
    }

    #[test]
    fn lease_outliving_the_pool_is_harmless() {
        let pool: ResourcePool<u32, u32> = ResourcePool::new();
        let lease = pool.acquire(1, || Ok::<_, ()>(5)).unwrap();
        drop(pool);
        assert_eq!(*lease.get(), 5);
    }
}
