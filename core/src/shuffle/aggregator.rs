//! Defines the Aggregator trait for combining values in shuffle operations.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Combines the values of one key.
///
/// V: Input value type
/// C: Combiner (intermediate/output) type
///
/// Mappers fold their values with `create_combiner`/`merge_value`; reducers
/// fold the combiners pulled from every mapper with `merge_combiners`, which
/// must be associative.
pub trait Aggregator<V, C>: Send + Sync + Debug {
    /// Create a combiner from the first value for a key.
    fn create_combiner(&self, v: V) -> C;

    /// Merge a new value into an existing combiner.
    fn merge_value(&self, c: C, v: V) -> C;

    /// Merge two combiners.
    fn merge_combiners(&self, c1: C, c2: C) -> C;
}

/// Map-side combine of one bucket of records.
pub fn combine_values<K, V, C, A>(
    aggregator: &A,
    records: impl IntoIterator<Item = (K, V)>,
) -> HashMap<K, C>
where
    K: Hash + Eq,
    A: Aggregator<V, C> + ?Sized,
{
    let mut combined: HashMap<K, C> = HashMap::new();
    for (key, value) in records {
        let next = match combined.remove(&key) {
            Some(c) => aggregator.merge_value(c, value),
            None => aggregator.create_combiner(value),
        };
        combined.insert(key, next);
    }
    combined
}

/// Reduce-side merge of combiners coming from several mappers.
pub fn merge_combiners<K, V, C, A>(
    aggregator: &A,
    into: &mut HashMap<K, C>,
    combiners: impl IntoIterator<Item = (K, C)>,
) where
    K: Hash + Eq,
    A: Aggregator<V, C> + ?Sized,
{
    for (key, combiner) in combiners {
        let next = match into.remove(&key) {
            Some(existing) => aggregator.merge_combiners(existing, combiner),
            None => combiner,
        };
        into.insert(key, next);
    }
}

/// A simple aggregator for reduceByKey operations where the combiner type is the same as the value type
#[derive(Clone, Debug)]
pub struct ReduceAggregator<V> {
    reduce_func: fn(V, V) -> V,
}

impl<V> ReduceAggregator<V> {
    pub fn new(reduce_func: fn(V, V) -> V) -> Self {
        Self { reduce_func }
    }
}

impl<V> Aggregator<V, V> for ReduceAggregator<V>
where
    V: Send + Sync + Debug + 'static,
{
    fn create_combiner(&self, v: V) -> V {
        v
    }

    fn merge_value(&self, c: V, v: V) -> V {
        (self.reduce_func)(c, v)
    }

    fn merge_combiners(&self, c1: V, c2: V) -> V {
        (self.reduce_func)(c1, c2)
    }
}

/// A generic aggregator for combine_by_key operations
#[derive(Clone, Debug)]
pub struct CombineAggregator<V, C> {
    create_combiner: fn(V) -> C,
    merge_value: fn(C, V) -> C,
    merge_combiners: fn(C, C) -> C,
}

impl<V, C> CombineAggregator<V, C> {
    pub fn new(
        create_combiner: fn(V) -> C,
        merge_value: fn(C, V) -> C,
        merge_combiners: fn(C, C) -> C,
    ) -> Self {
        Self {
            create_combiner,
            merge_value,
            merge_combiners,
        }
    }
}

impl<V, C> Aggregator<V, C> for CombineAggregator<V, C>
where
    V: Send + Sync + Debug + 'static,
    C: Send + Sync + Debug + 'static,
{
    fn create_combiner(&self, v: V) -> C {
        (self.create_combiner)(v)
    }

    fn merge_value(&self, c: C, v: V) -> C {
        (self.merge_value)(c, v)
    }

    fn merge_combiners(&self, c1: C, c2: C) -> C {
        (self.merge_combiners)(c1, c2)
    }
}

/// Collects every value of a key, for groupByKey.
#[derive(Clone, Debug, Default)]
pub struct GroupByKeyAggregator;

impl<V> Aggregator<V, Vec<V>> for GroupByKeyAggregator
where
    V: Send + Sync + Debug + 'static,
{
    fn create_combiner(&self, v: V) -> Vec<V> {
        vec![v]
    }

    fn merge_value(&self, mut c: Vec<V>, v: V) -> Vec<V> {
        c.push(v);
        c
    }

    fn merge_combiners(&self, mut c1: Vec<V>, mut c2: Vec<V>) -> Vec<V> {
        c1.append(&mut c2);
        c1
    }
}
