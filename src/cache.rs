use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use anyhow::Result;

/// Bounded cache of constructed pages keyed by context. Ownership of a page
/// transfers to the cache; the eviction callback is the single place that
/// tears a page's resources down, both on LRU eviction and on `clear`.
pub struct PageCache<K, V>
where
    K: Eq + Hash + Clone,
{
    capacity: usize,
    order: VecDeque<K>,
    pages: HashMap<K, V>,
    on_evict: Box<dyn FnMut(&K, &mut V) + Send>,
}

impl<K, V> PageCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize, on_evict: Box<dyn FnMut(&K, &mut V) + Send>) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            pages: HashMap::new(),
            on_evict,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pages.contains_key(key)
    }

    /// Read-only lookup that does not disturb the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.pages.get(key)
    }

    /// Visits every cached page without disturbing the recency order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.pages.iter_mut()
    }

    /// Returns the cached page, marking it most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.pages.contains_key(key) {
            self.touch(key);
        }
        self.pages.get_mut(key)
    }

    /// Returns the page for `key`, building it with `factory` on a miss. A
    /// factory error propagates and inserts nothing. Inserting may evict the
    /// least recently used page through the teardown callback.
    pub fn get_or_create<F>(&mut self, key: K, factory: F) -> Result<&mut V>
    where
        F: FnOnce() -> Result<V>,
    {
        if self.pages.contains_key(&key) {
            self.touch(&key);
            return Ok(self.pages.get_mut(&key).expect("touched entry present"));
        }

        let page = factory()?;
        while self.pages.len() >= self.capacity {
            self.evict_oldest();
        }
        self.order.push_back(key.clone());
        self.pages.insert(key.clone(), page);
        Ok(self.pages.get_mut(&key).expect("inserted entry present"))
    }

    /// Tears down every cached page.
    pub fn clear(&mut self) {
        while !self.order.is_empty() {
            self.evict_oldest();
        }
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos).expect("position in bounds");
            self.order.push_back(key);
        }
    }

    fn evict_oldest(&mut self) {
        let Some(key) = self.order.pop_front() else {
            return;
        };
        if let Some(mut page) = self.pages.remove(&key) {
            (self.on_evict)(&key, &mut page);
        }
    }
}
