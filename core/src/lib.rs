//! Barks Shuffle - tracked peer-to-peer shuffle
//!
//! Mappers cut their partitioned, map-side combined output into blocks and
//! serve them; reducers find mappers through a central tracker and pull
//! blocks from many mappers at once in short, rate-limited chat sessions.
//! The tracker only brokers locations and lifecycle state, never data.

pub mod protocol;
pub mod shuffle;
pub mod split;
pub mod tracker;
pub mod transfer;

pub use barks_common::{Result, ShuffleConfig, ShuffleError, ThreadPoolFactory, WorkerPool};
pub use protocol::{ReducerState, ShuffleStatus, SplitLocation};
pub use shuffle::{Aggregator, HashPartitioner, Partitioner, TrackedShuffle};
pub use split::{BlockBitSet, BlockReceipt, ReducerProgress, SplitInfo};
pub use tracker::{ShuffleTracker, TrackerClient, TrackerServer};
pub use transfer::{BlockStore, BlockTransferScheduler, SplitServer};
