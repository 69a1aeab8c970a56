//! Identity-stable item registry.
//!
//! Items are created once per id and then live until removed. Reconciliation
//! mutates their contents in place, so references held elsewhere stay valid.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use dashmap::DashMap;

/// Registry of `Arc<T>` keyed by id, with an insertion-ordered snapshot.
///
/// Lookups and snapshot reads are lock-free. Writers serialize on an
/// internal mutex so the snapshot always matches the map.
#[derive(Debug)]
pub struct ItemManager<T> {
    items: DashMap<String, Arc<T>>,
    snapshot: ArcSwap<Vec<Arc<T>>>,
    write_lock: Mutex<()>,
}

impl<T> ItemManager<T> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn try_get(&self, id: &str) -> Option<Arc<T>> {
        self.items.get(id).map(|entry| entry.value().clone())
    }

    /// Return the item for `id`, creating it with `create` if absent.
    /// The flag is true when a new item was created.
    pub fn get_or_create(&self, id: &str, create: impl FnOnce(&str) -> T) -> (Arc<T>, bool) {
        if let Some(existing) = self.try_get(id) {
            return (existing, false);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.try_get(id) {
            return (existing, false);
        }

        let item = Arc::new(create(id));
        self.items.insert(id.to_string(), item.clone());

        let mut next = Vec::with_capacity(self.snapshot.load().len() + 1);
        next.extend(self.snapshot.load().iter().cloned());
        next.push(item.clone());
        self.snapshot.store(Arc::new(next));

        (item, true)
    }

    /// Remove the item for `id`, returning it if it existed.
    pub fn try_remove(&self, id: &str) -> Option<Arc<T>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, removed) = self.items.remove(id)?;

        let next: Vec<_> = self
            .snapshot
            .load()
            .iter()
            .filter(|item| !Arc::ptr_eq(item, &removed))
            .cloned()
            .collect();
        self.snapshot.store(Arc::new(next));

        Some(removed)
    }

    /// All items in insertion order.
    pub fn items(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.load_full()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for ItemManager<T> {
    fn default() -> Self {
        Self::new()
    }
}
