//! Defines partitioners for distributing data in a shuffle.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Assigns each key to one of `num_partitions` output splits.
pub trait Partitioner<K>: Send + Sync {
    fn num_partitions(&self) -> u32;

    fn get_partition(&self, key: &K) -> u32;
}

/// A partitioner that uses the hash of the key to distribute data.
///
/// `DefaultHasher::new` always starts from the same keys, so every mapper
/// process assigns a given key to the same output split.
#[derive(Clone, Debug)]
pub struct HashPartitioner {
    num_partitions: u32,
}

impl HashPartitioner {
    pub fn new(num_partitions: u32) -> Self {
        assert!(num_partitions > 0, "Number of partitions must be positive.");
        Self { num_partitions }
    }
}

impl<K: Hash> Partitioner<K> for HashPartitioner {
    fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    fn get_partition(&self, key: &K) -> u32 {
        let mut s = DefaultHasher::new();
        key.hash(&mut s);
        (s.finish() % self.num_partitions as u64) as u32
    }
}

/// Split `records` into one bucket per output partition.
pub fn bucket_records<K, V, P>(partitioner: &P, records: Vec<(K, V)>) -> Vec<Vec<(K, V)>>
where
    P: Partitioner<K> + ?Sized,
{
    let mut buckets: Vec<Vec<(K, V)>> = (0..partitioner.num_partitions())
        .map(|_| Vec::new())
        .collect();
    for (key, value) in records {
        let index = partitioner.get_partition(&key) as usize;
        buckets[index].push((key, value));
    }
    buckets
}
