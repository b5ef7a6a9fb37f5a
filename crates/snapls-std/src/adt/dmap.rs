//! A map that shards items by their digest.

use std::{collections::HashMap, num::NonZeroU32};

use crate::hash::Digest;

/// A global upper bound on the shard size.
/// If there are too many shards, the memory overhead is unacceptable.
const MAX_SHARD_SIZE: u32 = 512;

/// Return a read-only default shard size.
fn default_shard_size() -> NonZeroU32 {
    static ITEM_SHARD_SIZE: std::sync::OnceLock<NonZeroU32> = std::sync::OnceLock::new();

    fn determine_default_shard_size() -> NonZeroU32 {
        // This detection is from rayon.
        let thread_cnt = {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };

        // A valid shard size is a power of two.
        let size = (thread_cnt.next_power_of_two() * 2) as u32;
        // Perform early non-zero check to avoid panics.
        NonZeroU32::new(size.min(MAX_SHARD_SIZE)).unwrap()
    }

    *ITEM_SHARD_SIZE.get_or_init(determine_default_shard_size)
}

/// A map that shards items by their digest.
///
/// It is fast since a digest produced by a cryptographic hash splits items
/// into different shards evenly without rehashing.
pub struct DigestMap<V> {
    mask: u32,
    shards: Vec<parking_lot::RwLock<HashMap<Digest, V>>>,
}

impl<V> Default for DigestMap<V> {
    fn default() -> Self {
        Self::new(default_shard_size())
    }
}

impl<V> DigestMap<V> {
    /// Create a new `DigestMap` with the given shard size.
    pub fn new(shard_size: NonZeroU32) -> Self {
        let shard_size = shard_size.get().next_power_of_two();
        let shard_size = shard_size.min(MAX_SHARD_SIZE);

        assert!(
            shard_size.is_power_of_two(),
            "shard size must be a power of two"
        );
        Self {
            mask: shard_size - 1,
            shards: (0..shard_size)
                .map(|_| parking_lot::RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    /// Selects the shard owning the given digest.
    pub fn shard(&self, key: Digest) -> &parking_lot::RwLock<HashMap<Digest, V>> {
        let route = u32::from_le_bytes(key.0[..4].try_into().unwrap_or_default());
        &self.shards[(route & self.mask) as usize]
    }

    /// Whether the map contains no items.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Iterate over all items in the map.
    pub fn into_items(self) -> impl Iterator<Item = (Digest, V)> {
        self.shards
            .into_iter()
            .flat_map(|shard| shard.into_inner().into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_routing_is_stable() {
        let map = DigestMap::<u32>::default();
        let key = Digest::of(b"route");
        map.shard(key).write().insert(key, 1);
        assert_eq!(map.shard(key).read().get(&key), Some(&1));
    }
}
