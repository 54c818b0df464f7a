//! Combining, partitioning and the shuffle stage itself.

pub mod aggregator;
pub mod compute;
pub mod partitioner;

pub use aggregator::*;
pub use compute::*;
pub use partitioner::*;
