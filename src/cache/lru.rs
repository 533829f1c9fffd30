use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LruCacheError {
	#[error("cache capacity must be at least 1")]
	InvalidCapacity,
}

struct Entry<V> {
	value: V,
	last_used: u64,
}

/// Bounded key-value map; `get` and `set` both mark the key most-recently
/// used, and overflow evicts the least-recently-used entry.
pub struct LruCache<K, V> {
	max_size: usize,
	entries: HashMap<K, Entry<V>>,
	clock: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
	pub fn new(max_size: usize) -> Result<Self, LruCacheError> {
		if max_size == 0 {
			return Err(LruCacheError::InvalidCapacity);
		}
		Ok(Self { max_size, entries: HashMap::with_capacity(max_size), clock: 0 })
	}

	fn tick(&mut self) -> u64 {
		self.clock += 1;
		self.clock
	}

	pub fn get(&mut self, key: &K) -> Option<&V> {
		let tick = self.tick();
		if let Some(entry) = self.entries.get_mut(key) {
			entry.last_used = tick;
			Some(&entry.value)
		} else {
			None
		}
	}

	pub fn set(&mut self, key: K, value: V) {
		let tick = self.tick();
		if self.entries.contains_key(&key) {
			self.entries.insert(key, Entry { value, last_used: tick });
			return;
		}

		if self.entries.len() >= self.max_size {
			self.evict_lru();
		}
		self.entries.insert(key, Entry { value, last_used: tick });
	}

	fn evict_lru(&mut self) {
		if let Some(lru_key) = self
			.entries
			.iter()
			.min_by_key(|(_, entry)| entry.last_used)
			.map(|(k, _)| k.clone())
		{
			self.entries.remove(&lru_key);
		}
	}

	pub fn has(&self, key: &K) -> bool {
		self.entries.contains_key(key)
	}

	pub fn delete(&mut self, key: &K) -> Option<V> {
		self.entries.remove(key).map(|entry| entry.value)
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn size(&self) -> usize {
		self.entries.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capacity_zero_fails_validation() {
		assert_eq!(LruCache::<u32, u32>::new(0).unwrap_err(), LruCacheError::InvalidCapacity);
	}

	#[test]
	fn size_never_exceeds_max_size() {
		let mut cache = LruCache::new(2).unwrap();
		cache.set("a", 1);
		cache.set("b", 2);
		cache.set("c", 3);
		assert!(cache.size() <= 2);
	}

	#[test]
	fn capacity_one_evicts_previous_key() {
		let mut cache = LruCache::new(1).unwrap();
		cache.set("a", 1);
		cache.set("b", 2);
		assert_eq!(cache.get(&"a"), None);
		assert_eq!(cache.get(&"b"), Some(&2));
		assert_eq!(cache.size(), 1);
	}

	#[test]
	fn most_recently_accessed_key_survives_eviction() {
		let mut cache = LruCache::new(2).unwrap();
		cache.set("a", 1);
		cache.set("b", 2);
		// touch "a" so "b" becomes the least-recently-used entry
		cache.get(&"a");
		cache.set("c", 3);
		assert_eq!(cache.get(&"b"), None);
		assert_eq!(cache.get(&"a"), Some(&1));
		assert_eq!(cache.get(&"c"), Some(&3));
	}

	#[test]
	fn delete_and_clear_and_has() {
		let mut cache = LruCache::new(3).unwrap();
		cache.set("a", 1);
		assert!(cache.has(&"a"));
		assert_eq!(cache.delete(&"a"), Some(1));
		assert!(!cache.has(&"a"));
		cache.set("b", 2);
		cache.clear();
		assert_eq!(cache.size(), 0);
	}
}
