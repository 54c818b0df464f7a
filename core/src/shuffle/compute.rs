//! The tracked shuffle stage.
//!
//! [`TrackedShuffle::compute`] runs a whole shuffle inside the calling
//! process: it starts a tracker, partitions and combines every input split
//! map-side, serves the encoded splits from one [`SplitServer`] per input
//! split, and drives one reducer per output split through
//! `Entering -> Fetching -> Leaving -> Completed`.

use crate::protocol::{ReducerState, ShuffleStatus};
use crate::shuffle::aggregator::{Aggregator, combine_values, merge_combiners};
use crate::shuffle::partitioner::{HashPartitioner, bucket_records};
use crate::split::SplitInfo;
use crate::tracker::{ShuffleTracker, TrackerClient, TrackerHandle, TrackerServer};
use crate::transfer::{
    BlockStore, BlockTransferScheduler, FileBlockStore, MemoryBlockStore, SessionLimits,
    SplitBlockId, SplitServer, SplitServerHandle,
};
use barks_common::{Result, ShuffleConfig, ShuffleError, ThreadPoolFactory};
use bincode::{Decode, Encode};
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a reducer is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerPhase {
    Entering,
    Fetching,
    Leaving,
    Completed,
}

impl fmt::Display for ReducerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReducerPhase::Entering => "Entering",
            ReducerPhase::Fetching => "Fetching",
            ReducerPhase::Leaving => "Leaving",
            ReducerPhase::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// Everything a stage starts, torn down once it ends.
#[derive(Default)]
struct StageResources {
    tracker: Option<TrackerHandle>,
    servers: Vec<SplitServerHandle>,
    file_store: Option<FileBlockStore>,
}

impl StageResources {
    async fn release(self) {
        for server in self.servers {
            if let Err(e) = server.shutdown().await {
                warn!("failed to stop split server: {}", e);
            }
        }
        if let Some(tracker) = self.tracker {
            if let Err(e) = tracker.shutdown().await {
                warn!("failed to stop tracker: {}", e);
            }
        }
        if let Some(store) = self.file_store {
            if let Err(e) = store.remove_all().await {
                warn!("failed to remove shuffle files: {}", e);
            }
        }
    }
}

/// A shuffle that redistributes combined records through a tracker.
pub struct TrackedShuffle<K, V, C> {
    config: Arc<ShuffleConfig>,
    aggregator: Arc<dyn Aggregator<V, C>>,
    _keys: PhantomData<fn() -> K>,
}

impl<K, V, C> TrackedShuffle<K, V, C>
where
    K: Hash + Eq + Encode + Decode<()> + Send + 'static,
    V: Send + 'static,
    C: Encode + Decode<()> + Send + 'static,
{
    pub fn new(config: Arc<ShuffleConfig>, aggregator: Arc<dyn Aggregator<V, C>>) -> Self {
        Self {
            config,
            aggregator,
            _keys: PhantomData,
        }
    }

    pub fn config(&self) -> &ShuffleConfig {
        &self.config
    }

    /// Shuffle `inputs` (one record list per input split) into
    /// `num_output_splits` partitions of merged combiners.
    ///
    /// Every tracker, server and worker started here is stopped before this
    /// returns. Failures come back as [`ShuffleError::StageFailed`] unless the
    /// shuffle had already finished.
    pub async fn compute(
        &self,
        inputs: Vec<Vec<(K, V)>>,
        num_output_splits: u32,
    ) -> Result<Vec<Vec<(K, C)>>> {
        if num_output_splits == 0 {
            return Err(ShuffleError::configuration_error(
                "a shuffle needs at least one output split",
            ));
        }
        let shuffle_id = Uuid::new_v4().to_string();
        info!(
            "Starting shuffle {}: {} input splits, {} output splits",
            shuffle_id,
            inputs.len(),
            num_output_splits
        );

        let mut resources = StageResources::default();
        let result = self
            .run(&shuffle_id, inputs, num_output_splits, &mut resources)
            .await;
        resources.release().await;

        match result {
            Ok(outputs) => {
                info!("Shuffle {} finished", shuffle_id);
                Ok(outputs)
            }
            Err(
                e @ (ShuffleError::StageFailed { .. }
                | ShuffleError::ShuffleAlreadyFinished { .. }),
            ) => Err(e),
            Err(e) => Err(ShuffleError::stage_failed_with_source(
                format!("shuffle {} failed", shuffle_id),
                e,
            )),
        }
    }

    async fn run(
        &self,
        shuffle_id: &str,
        inputs: Vec<Vec<(K, V)>>,
        num_output_splits: u32,
        resources: &mut StageResources,
    ) -> Result<Vec<Vec<(K, C)>>> {
        let num_input_splits = inputs.len() as u32;

        let tracker = Arc::new(ShuffleTracker::new(
            shuffle_id,
            num_output_splits,
            self.config.max_tx_connections,
        ));
        let server = TrackerServer::bind(self.config.tracker_addr()?, tracker).await?;
        let tracker_addr = server.local_addr();
        resources.tracker = Some(server.spawn());

        self.publish_splits(shuffle_id, inputs, num_output_splits, tracker_addr, resources)
            .await?;

        let cancel = CancellationToken::new();
        let mut reducers = ThreadPoolFactory::new_child_cached_pool("reducers", &cancel);
        for output_split in 0..num_output_splits {
            let reducer = ReducerTask {
                shuffle_id: shuffle_id.to_string(),
                reducer_id: format!("reducer-{}", output_split),
                output_split,
                num_input_splits,
                config: Arc::clone(&self.config),
                aggregator: Arc::clone(&self.aggregator),
                tracker: Arc::new(TrackerClient::new(tracker_addr)),
                cancel: cancel.clone(),
                phase: ReducerPhase::Entering,
                _keys: PhantomData,
            };
            reducers.spawn(reducer.run());
        }

        let mut outputs: Vec<Option<Vec<(K, C)>>> =
            (0..num_output_splits).map(|_| None).collect();
        while let Some(joined) = reducers.join_next().await {
            match joined.and_then(|finished| finished) {
                Ok((output_split, records)) => outputs[output_split as usize] = Some(records),
                Err(e) => {
                    reducers.shutdown().await;
                    return Err(e);
                }
            }
        }

        let status = TrackerClient::new(tracker_addr).query_status().await?;
        if status != ShuffleStatus::AlreadyFinished {
            return Err(ShuffleError::internal_error(format!(
                "every reducer returned but the tracker reports {:?}",
                status
            )));
        }

        outputs
            .into_iter()
            .enumerate()
            .map(|(output_split, records)| {
                records.ok_or_else(|| {
                    ShuffleError::internal_error(format!(
                        "no output for split {}",
                        output_split
                    ))
                })
            })
            .collect()
    }

    /// Mapper side: partition and combine every input split, store the
    /// encoded results, serve them and publish them to the tracker.
    async fn publish_splits(
        &self,
        shuffle_id: &str,
        inputs: Vec<Vec<(K, V)>>,
        num_output_splits: u32,
        tracker_addr: SocketAddr,
        resources: &mut StageResources,
    ) -> Result<()> {
        let payloads = self.partition_inputs(inputs, num_output_splits).await?;

        let block_size = self.config.block_size_bytes();
        let store: Arc<dyn BlockStore> = match &self.config.shuffle_dir {
            Some(dir) => {
                let store = FileBlockStore::new(dir.join(shuffle_id), block_size)?;
                resources.file_store = Some(store.clone());
                Arc::new(store)
            }
            None => Arc::new(MemoryBlockStore::new(block_size)),
        };

        let client = TrackerClient::new(tracker_addr);
        for (input_split, outputs) in payloads.into_iter().enumerate() {
            let input_split = input_split as u32;
            let mut totals = Vec::with_capacity(outputs.len());
            for (output_split, payload) in outputs.into_iter().enumerate() {
                let id = SplitBlockId::new(input_split, output_split as u32);
                totals.push(store.put_split(id, payload).await?);
            }

            let server = SplitServer::bind(
                &self.config.master_host_address,
                input_split,
                Arc::clone(&store),
                self.config.max_tx_connections,
                SessionLimits::from_config(&self.config),
            )
            .await?;
            let location = server.location().clone();
            resources.servers.push(server.spawn());

            debug!(
                "publishing split {} at {} with blocks {:?}",
                input_split, location, totals
            );
            client
                .register_mapper(&SplitInfo::for_mapper(
                    location.host_address,
                    location.listen_port,
                    input_split,
                    totals,
                ))
                .await?;
        }
        Ok(())
    }

    /// Bucket and combine every input split on the rayon pool.
    async fn partition_inputs(
        &self,
        inputs: Vec<Vec<(K, V)>>,
        num_output_splits: u32,
    ) -> Result<Vec<Vec<Vec<u8>>>> {
        let aggregator = Arc::clone(&self.aggregator);
        tokio::task::spawn_blocking(move || {
            let partitioner = HashPartitioner::new(num_output_splits);
            inputs
                .into_par_iter()
                .map(|records| encode_buckets(&*aggregator, &partitioner, records))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| ShuffleError::internal_error(format!("map-side combine failed: {}", e)))?
    }
}

/// Combine one input split per output split and encode each result.
fn encode_buckets<K, V, C>(
    aggregator: &dyn Aggregator<V, C>,
    partitioner: &HashPartitioner,
    records: Vec<(K, V)>,
) -> Result<Vec<Vec<u8>>>
where
    K: Hash + Eq + Encode,
    C: Encode,
{
    bucket_records(partitioner, records)
        .into_iter()
        .map(|bucket| {
            let combined: Vec<(K, C)> = combine_values::<K, V, C, _>(aggregator, bucket)
                .into_iter()
                .collect();
            bincode::encode_to_vec(&combined, bincode::config::standard())
                .map_err(|e| ShuffleError::codec_error_with_source("failed to encode combiners", e))
        })
        .collect()
}

struct ReducerTask<K, V, C> {
    shuffle_id: String,
    reducer_id: String,
    output_split: u32,
    num_input_splits: u32,
    config: Arc<ShuffleConfig>,
    aggregator: Arc<dyn Aggregator<V, C>>,
    tracker: Arc<TrackerClient>,
    cancel: CancellationToken,
    phase: ReducerPhase,
    _keys: PhantomData<fn() -> K>,
}

impl<K, V, C> ReducerTask<K, V, C>
where
    K: Hash + Eq + Decode<()> + Send + 'static,
    V: Send + 'static,
    C: Decode<()> + Send + 'static,
{
    fn advance(&mut self, phase: ReducerPhase) {
        debug!("{}: {} -> {}", self.reducer_id, self.phase, phase);
        self.phase = phase;
    }

    async fn run(mut self) -> Result<(u32, Vec<(K, C)>)> {
        let address = self.config.master_host_address.clone();
        let status = self
            .tracker
            .register(&self.reducer_id, self.output_split, &address)
            .await?;
        if status == ShuffleStatus::AlreadyFinished {
            return Err(ShuffleError::already_finished(self.shuffle_id.clone()));
        }

        self.advance(ReducerPhase::Fetching);
        let scheduler = Arc::new(BlockTransferScheduler::new(
            self.shuffle_id.clone(),
            self.reducer_id.clone(),
            self.output_split,
            Arc::clone(&self.config),
            Arc::clone(&self.tracker),
        ));
        let fetched = scheduler
            .fetch_all(self.num_input_splits, &self.cancel)
            .await?;

        self.advance(ReducerPhase::Leaving);
        self.tracker
            .report_state(&self.reducer_id, ReducerState::Leaving)
            .await?;

        let mut merged: HashMap<K, C> = HashMap::new();
        for split in fetched {
            let (records, _): (Vec<(K, C)>, usize) =
                bincode::decode_from_slice(&split.payload, bincode::config::standard()).map_err(
                    |e| {
                        ShuffleError::codec_error_with_source(
                            format!("cannot decode split {}", split.info.split_id),
                            e,
                        )
                    },
                )?;
            merge_combiners::<K, V, C, _>(&*self.aggregator, &mut merged, records);
        }

        self.tracker
            .report_state(&self.reducer_id, ReducerState::Completed)
            .await?;
        self.advance(ReducerPhase::Completed);
        info!(
            "{} merged {} keys for output split {}",
            self.reducer_id,
            merged.len(),
            self.output_split
        );
        Ok((self.output_split, merged.into_iter().collect()))
    }
}
