//! Shuffle tracker registry.
//!
//! The tracker owns two tables: reducers (lifecycle state and progress rate)
//! and mappers (where each input split is served and how many reducers hold a
//! lease on it). Connection handlers only go through the methods below; no
//! lock is ever held across an await.

use crate::protocol::{
    PeerLocation, ReducerId, ReducerState, ShuffleStatus, SplitLocation, ThrottleAdvice,
};
use barks_common::{Result, ShuffleError, blocks_per_second, current_timestamp_millis};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tracker-side record of one reducer.
#[derive(Debug, Clone)]
pub struct ReducerRegistration {
    pub reducer_id: ReducerId,
    pub output_split: u32,
    pub state: ReducerState,
    pub address: String,
    pub registered_at_ms: u64,
    pub blocks_received: u64,
    pub busy_time: Duration,
    /// Mapper leases granted to this reducer and not yet given back.
    pub held_leases: Vec<(u32, PeerLocation)>,
}

impl ReducerRegistration {
    fn take_leases(&mut self, split_id: Option<u32>) -> Vec<(u32, PeerLocation)> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held_leases)
            .into_iter()
            .partition(|(held, _)| split_id.is_none_or(|id| id == *held));
        self.held_leases = kept;
        taken
    }

    /// Cumulative transfer rate, or `None` before the first released lease.
    pub fn rate(&self) -> Option<f64> {
        if self.busy_time.is_zero() {
            None
        } else {
            Some(blocks_per_second(self.blocks_received, self.busy_time))
        }
    }
}

/// Tracker-side record of one mapper serving an input split.
#[derive(Debug)]
struct MapperEntry {
    location: PeerLocation,
    total_blocks_per_output_split: Vec<u32>,
    active_leases: AtomicUsize,
}

impl MapperEntry {
    /// Take a lease unless the mapper is already at `max_leases`.
    fn try_lease(&self, max_leases: usize) -> bool {
        self.active_leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_leases).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .active_leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Registry of reducers and mappers for one shuffle.
#[derive(Debug)]
pub struct ShuffleTracker {
    shuffle_id: String,
    expected_reducers: u32,
    max_tx_connections: usize,
    reducers: RwLock<HashMap<ReducerId, Arc<Mutex<ReducerRegistration>>>>,
    mappers: RwLock<HashMap<u32, Vec<MapperEntry>>>,
    registered: AtomicU32,
    completed: AtomicU32,
    finished: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ShuffleTracker {
    /// Create a tracker expecting `expected_reducers` reducers, one per output split.
    pub fn new(
        shuffle_id: impl Into<String>,
        expected_reducers: u32,
        max_tx_connections: usize,
    ) -> Self {
        Self {
            shuffle_id: shuffle_id.into(),
            expected_reducers,
            max_tx_connections,
            reducers: RwLock::new(HashMap::new()),
            mappers: RwLock::new(HashMap::new()),
            registered: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn shuffle_id(&self) -> &str {
        &self.shuffle_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ShuffleStatus {
        if self.is_finished() {
            ShuffleStatus::AlreadyFinished
        } else {
            ShuffleStatus::InProgress {
                registered: self.registered.load(Ordering::Acquire),
                completed: self.completed.load(Ordering::Acquire),
            }
        }
    }

    fn reducer(&self, reducer_id: &str) -> Option<Arc<Mutex<ReducerRegistration>>> {
        self.reducers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reducer_id)
            .cloned()
    }

    /// Snapshot of one reducer's registration.
    pub fn registration(&self, reducer_id: &str) -> Option<ReducerRegistration> {
        self.reducer(reducer_id).map(|entry| {
            let registration = lock(&entry).clone();
            registration
        })
    }

    /// Record a reducer entering the shuffle.
    ///
    /// Registering an existing id refreshes its address and timestamp without
    /// touching its state. Once the shuffle has finished every registration
    /// is answered with [`ShuffleStatus::AlreadyFinished`].
    pub fn register(&self, reducer_id: &str, output_split: u32, address: &str) -> ShuffleStatus {
        if self.is_finished() {
            debug!(
                "Rejecting registration of {} into finished shuffle {}",
                reducer_id, self.shuffle_id
            );
            return ShuffleStatus::AlreadyFinished;
        }

        if let Some(entry) = self.reducer(reducer_id) {
            let stale = {
                let mut registration = lock(&entry);
                registration.address = address.to_string();
                registration.registered_at_ms = current_timestamp_millis();
                debug!(
                    "Refreshed registration of reducer {} ({})",
                    reducer_id, registration.state
                );
                registration.take_leases(None)
            };
            self.reclaim(reducer_id, &stale);
            return self.status();
        }

        let mut reducers = self.reducers.write().unwrap_or_else(PoisonError::into_inner);
        reducers.entry(reducer_id.to_string()).or_insert_with(|| {
            self.registered.fetch_add(1, Ordering::AcqRel);
            info!(
                "Reducer {} entering shuffle {} for output split {}",
                reducer_id, self.shuffle_id, output_split
            );
            Arc::new(Mutex::new(ReducerRegistration {
                reducer_id: reducer_id.to_string(),
                output_split,
                state: ReducerState::Entering,
                address: address.to_string(),
                registered_at_ms: current_timestamp_millis(),
                blocks_received: 0,
                busy_time: Duration::ZERO,
                held_leases: Vec::new(),
            }))
        });
        drop(reducers);
        self.status()
    }

    /// Move a reducer to `new_state`.
    ///
    /// Transitions follow Entering -> Leaving -> Completed. Reporting the
    /// current state again is a no-op; anything else is rejected and leaves
    /// the registry untouched.
    pub fn report_state(&self, reducer_id: &str, new_state: ReducerState) -> Result<ShuffleStatus> {
        let entry = self.reducer(reducer_id).ok_or_else(|| {
            ShuffleError::protocol_error(format!(
                "reducer {} is not registered with shuffle {}",
                reducer_id, self.shuffle_id
            ))
        })?;

        let mut registration = lock(&entry);
        let current = registration.state;
        if current == new_state {
            debug!("Reducer {} re-reported {}", reducer_id, new_state);
            drop(registration);
            return Ok(self.status());
        }
        if current.next() != Some(new_state) {
            warn!(
                "Rejecting transition {} -> {} for reducer {}",
                current, new_state, reducer_id
            );
            return Err(ShuffleError::invalid_transition(
                reducer_id, current, new_state,
            ));
        }
        registration.state = new_state;
        let stale = registration.take_leases(None);
        drop(registration);
        self.reclaim(reducer_id, &stale);

        info!("Reducer {} is now {}", reducer_id, new_state);
        if new_state == ReducerState::Completed {
            let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
            if completed >= self.expected_reducers {
                self.finished.store(true, Ordering::Release);
                info!(
                    "Shuffle {} finished: {} reducers completed",
                    self.shuffle_id, completed
                );
            }
        }
        Ok(self.status())
    }

    /// Publish the location of a partitioned input split.
    ///
    /// A second publication from the same location replaces the first; one
    /// from another location adds a replica.
    pub fn register_mapper(
        &self,
        split_id: u32,
        location: PeerLocation,
        total_blocks_per_output_split: Vec<u32>,
    ) {
        let mut mappers = self.mappers.write().unwrap_or_else(PoisonError::into_inner);
        let replicas = mappers.entry(split_id).or_default();
        replicas.retain(|m| m.location != location);
        info!(
            "Mapper for split {} published at {} ({} output splits)",
            split_id,
            location,
            total_blocks_per_output_split.len()
        );
        replicas.push(MapperEntry {
            location,
            total_blocks_per_output_split,
            active_leases: AtomicUsize::new(0),
        });
    }

    /// Where `reducer_id` can pull input split `split_id` from right now.
    ///
    /// Picks the replica with the fewest active leases and takes a lease on
    /// it. The lease must be given back with [`ShuffleTracker::release_split`];
    /// a lease the reducer still holds on the same split is reclaimed first.
    pub fn query_split(&self, reducer_id: &str, split_id: u32) -> SplitLocation {
        if self.is_finished() {
            return SplitLocation::Finished;
        }
        let Some(entry) = self.reducer(reducer_id) else {
            return SplitLocation::Unknown;
        };
        let (output_split, stale) = {
            let mut registration = lock(&entry);
            let stale = registration.take_leases(Some(split_id));
            (registration.output_split, stale)
        };
        self.reclaim(reducer_id, &stale);

        let answer = self.lease_replica(split_id, output_split);
        if let SplitLocation::Found { location, .. } = &answer {
            lock(&entry).held_leases.push((split_id, location.clone()));
        }
        answer
    }

    fn lease_replica(&self, split_id: u32, output_split: u32) -> SplitLocation {
        let mappers = self.mappers.read().unwrap_or_else(PoisonError::into_inner);
        let Some(replicas) = mappers.get(&split_id) else {
            return SplitLocation::Unknown;
        };

        let mut candidates: Vec<&MapperEntry> = replicas.iter().collect();
        candidates.sort_by_key(|m| m.active_leases.load(Ordering::Acquire));
        for mapper in candidates {
            let Some(&total_blocks) = mapper
                .total_blocks_per_output_split
                .get(output_split as usize)
            else {
                warn!(
                    "Mapper {} for split {} has no output split {}",
                    mapper.location, split_id, output_split
                );
                continue;
            };
            if mapper.try_lease(self.max_tx_connections) {
                return SplitLocation::Found {
                    location: mapper.location.clone(),
                    total_blocks,
                };
            }
        }
        SplitLocation::Busy
    }

    /// Return leases a reducer can no longer be releasing.
    fn reclaim(&self, reducer_id: &str, stale: &[(u32, PeerLocation)]) {
        if !stale.is_empty() {
            debug!("Reclaiming {} lease(s) of reducer {}", stale.len(), reducer_id);
            self.return_leases(stale);
        }
    }

    fn return_leases(&self, leases: &[(u32, PeerLocation)]) {
        let mappers = self.mappers.read().unwrap_or_else(PoisonError::into_inner);
        for (split_id, location) in leases {
            if let Some(mapper) = mappers
                .get(split_id)
                .and_then(|replicas| replicas.iter().find(|m| &m.location == location))
            {
                mapper.release();
            }
        }
    }

    /// Give back a lease and record the transfer it covered.
    ///
    /// Only a lease the reducer actually holds is returned, and only then is
    /// the transfer counted, so a repeated release changes nothing.
    pub fn release_split(
        &self,
        reducer_id: &str,
        split_id: u32,
        location: &PeerLocation,
        blocks: u64,
        elapsed: Duration,
    ) -> ThrottleAdvice {
        let (returned, own_rate) = match self.reducer(reducer_id) {
            Some(entry) => {
                let mut registration = lock(&entry);
                let held = registration
                    .held_leases
                    .iter()
                    .position(|(held, at)| *held == split_id && at == location)
                    .map(|index| registration.held_leases.swap_remove(index));
                if held.is_some() {
                    registration.blocks_received += blocks;
                    registration.busy_time += elapsed;
                }
                (held, registration.rate().unwrap_or(0.0))
            }
            None => (None, 0.0),
        };
        if let Some(lease) = returned {
            self.return_leases(std::slice::from_ref(&lease));
        }

        ThrottleAdvice {
            own_rate,
            slowest_rate: self.slowest_active_rate(),
        }
    }

    /// Slowest rate among reducers still fetching that have reported progress.
    pub fn slowest_active_rate(&self) -> Option<f64> {
        let reducers = self.reducers.read().unwrap_or_else(PoisonError::into_inner);
        reducers
            .values()
            .filter_map(|entry| {
                let registration = lock(entry);
                if registration.state == ReducerState::Entering {
                    registration.rate()
                } else {
                    None
                }
            })
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Active leases on the mapper serving `split_id` from `location`.
    pub fn active_leases(&self, split_id: u32, location: &PeerLocation) -> usize {
        self.mappers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&split_id)
            .and_then(|replicas| replicas.iter().find(|m| &m.location == location))
            .map(|m| m.active_leases.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}
