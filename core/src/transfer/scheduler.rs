//! Reducer-side block transfer.
//!
//! A [`BlockTransferScheduler`] pulls one output split's blocks from every
//! input split. Each input split gets its own puller; at most
//! `maxRxConnections` pullers run at once. A puller asks the tracker where
//! its split is served, opens a bounded chat session with that mapper and
//! hands the lease back with what it received, repeating until every block
//! has arrived.

use crate::protocol::{
    ChatRequest, ChatResponse, PeerLocation, SplitLocation, ThrottleAdvice, peer_framed,
    recv_message, send_message,
};
use crate::split::{BlockReceipt, ReducerProgress, SplitInfo};
use crate::tracker::TrackerClient;
use barks_common::{ErrorSeverity, Result, ShuffleConfig, ShuffleError, ThreadPoolFactory};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Slack over `maxChatTime` allowed for reaching a peer.
const PEER_IO_GRACE: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Doubling backoff between probes of a busy or unknown source.
///
/// Keyed by what was probed: a split for tracker answers, a peer for mapper
/// answers. The first wait is `min`, each further probe of the same key
/// doubles it up to `max`, and a successful probe resets it.
#[derive(Debug)]
pub struct KnockBackoff<K> {
    min: Duration,
    max: Duration,
    intervals: HashMap<K, Duration>,
}

impl<K: Hash + Eq> KnockBackoff<K> {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            intervals: HashMap::new(),
        }
    }

    /// How long to wait before probing `key` again.
    pub fn next_delay(&mut self, key: K) -> Duration {
        let interval = self.intervals.entry(key).or_insert(self.min);
        let delay = *interval;
        *interval = (*interval * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self, key: &K) {
        self.intervals.remove(key);
    }
}

/// Whether a reducer moving at `own_rate` should yield to the slowest one.
///
/// A reducer that has been turned away so far counts with rate zero, so any
/// reducer that is making progress yields to it.
pub fn should_throttle(
    own_rate: f64,
    slowest_rate: Option<f64>,
    throttle_fraction: f64,
) -> bool {
    slowest_rate.is_some_and(|slowest| own_rate > throttle_fraction * slowest)
}

/// Counters kept by one reducer's scheduler.
#[derive(Debug, Default)]
pub struct TransferStats {
    active_pulls: AtomicUsize,
    peak_pulls: AtomicUsize,
    sessions: AtomicU64,
    knocks: AtomicU64,
    throttled: AtomicU64,
    most_blocks_per_session: AtomicUsize,
}

impl TransferStats {
    /// Most pulls ever in flight at the same time.
    pub fn peak_pulls(&self) -> usize {
        self.peak_pulls.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Probes answered with busy or unknown.
    pub fn knocks(&self) -> u64 {
        self.knocks.load(Ordering::SeqCst)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::SeqCst)
    }

    /// Largest number of blocks read in a single session.
    pub fn most_blocks_per_session(&self) -> usize {
        self.most_blocks_per_session.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ActivePull {
        let now = self.active_pulls.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_pulls.fetch_max(now, Ordering::SeqCst);
        ActivePull(Arc::clone(self))
    }
}

struct ActivePull(Arc<TransferStats>);

impl Drop for ActivePull {
    fn drop(&mut self) {
        self.0.active_pulls.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Blocks of one split collected so far.
#[derive(Debug)]
pub struct SplitBuffer {
    info: SplitInfo,
    blocks: Vec<Option<Vec<u8>>>,
}

impl SplitBuffer {
    pub fn new(location: &PeerLocation, split_id: u32, total_blocks: u32) -> Self {
        Self {
            info: SplitInfo::for_reducer(
                location.host_address.clone(),
                location.listen_port,
                split_id,
                total_blocks as usize,
            ),
            blocks: vec![None; total_blocks as usize],
        }
    }

    pub fn info(&self) -> &SplitInfo {
        &self.info
    }

    pub fn is_complete(&self) -> bool {
        self.info.is_complete()
    }

    /// Record a block. A block received twice keeps its first copy.
    pub fn accept(&mut self, index: u32, data: Vec<u8>) -> Result<BlockReceipt> {
        let receipt = self.info.mark_received(index)?;
        if receipt != BlockReceipt::Duplicate {
            self.blocks[index as usize] = Some(data);
        }
        Ok(receipt)
    }

    fn relocate(&mut self, location: &PeerLocation) {
        self.info.host_address = location.host_address.clone();
        self.info.listen_port = location.listen_port;
    }

    /// Concatenate the blocks in index order.
    pub fn into_fetched(self) -> Result<FetchedSplit> {
        let mut payload = Vec::new();
        for (index, block) in self.blocks.into_iter().enumerate() {
            let block = block.ok_or_else(|| {
                ShuffleError::internal_error(format!(
                    "block {} of split {} missing from a complete buffer",
                    index, self.info.split_id
                ))
            })?;
            payload.extend_from_slice(&block);
        }
        Ok(FetchedSplit {
            info: self.info,
            payload,
        })
    }
}

/// A completely received input split.
#[derive(Debug)]
pub struct FetchedSplit {
    pub info: SplitInfo,
    pub payload: Vec<u8>,
}

enum SessionEnd {
    /// The mapper turned the session away.
    Busy,
    /// The session ran; the buffer holds whatever arrived.
    Closed,
}

/// Pulls one reducer's blocks from all mappers.
pub struct BlockTransferScheduler {
    shuffle_id: String,
    reducer_id: String,
    output_split: u32,
    config: Arc<ShuffleConfig>,
    tracker: Arc<TrackerClient>,
    split_backoff: Mutex<KnockBackoff<u32>>,
    peer_backoff: Mutex<KnockBackoff<PeerLocation>>,
    progress: Mutex<ReducerProgress>,
    stats: Arc<TransferStats>,
}

impl BlockTransferScheduler {
    pub fn new(
        shuffle_id: impl Into<String>,
        reducer_id: impl Into<String>,
        output_split: u32,
        config: Arc<ShuffleConfig>,
        tracker: Arc<TrackerClient>,
    ) -> Self {
        let split_backoff = KnockBackoff::new(config.min_knock(), config.max_knock());
        let peer_backoff = KnockBackoff::new(config.min_knock(), config.max_knock());
        Self {
            shuffle_id: shuffle_id.into(),
            reducer_id: reducer_id.into(),
            output_split,
            config,
            tracker,
            split_backoff: Mutex::new(split_backoff),
            peer_backoff: Mutex::new(peer_backoff),
            progress: Mutex::new(ReducerProgress::new(0)),
            stats: Arc::new(TransferStats::default()),
        }
    }

    pub fn reducer_id(&self) -> &str {
        &self.reducer_id
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// Blocks received so far from each input split.
    pub fn progress(&self) -> ReducerProgress {
        lock(&self.progress).clone()
    }

    /// Pull every input split, returning them ordered by input split id.
    ///
    /// Fails on the first split that cannot be completed; the remaining
    /// pullers are cancelled.
    pub async fn fetch_all(
        self: &Arc<Self>,
        num_input_splits: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<FetchedSplit>> {
        *lock(&self.progress) = ReducerProgress::new(num_input_splits as usize);
        let mut pullers = ThreadPoolFactory::new_child_fixed_pool(
            &format!("{}-pullers", self.reducer_id),
            self.config.max_rx_connections,
            cancel,
        );
        for split_id in 0..num_input_splits {
            let scheduler = Arc::clone(self);
            pullers.spawn(async move { scheduler.pull_split(split_id).await });
        }

        let mut fetched = Vec::with_capacity(num_input_splits as usize);
        while let Some(joined) = pullers.join_next().await {
            match joined.and_then(|pulled| pulled) {
                Ok(split) => {
                    lock(&self.progress).record(&split.info);
                    fetched.push(split);
                }
                Err(e) => {
                    match e.severity() {
                        ErrorSeverity::Fatal => {
                            error!("reducer {} giving up on its fetch: {}", self.reducer_id, e)
                        }
                        _ => warn!("reducer {} giving up on its fetch: {}", self.reducer_id, e),
                    }
                    pullers.shutdown().await;
                    return Err(e);
                }
            }
        }

        if fetched.len() < num_input_splits as usize {
            return Err(ShuffleError::stage_failed(format!(
                "reducer {} cancelled with {} of {} splits fetched",
                self.reducer_id,
                fetched.len(),
                num_input_splits
            )));
        }
        fetched.sort_by_key(|split| split.info.split_id);
        info!(
            "reducer {} fetched {} blocks from {} splits in {} sessions",
            self.reducer_id,
            lock(&self.progress).total_blocks(),
            num_input_splits,
            self.stats.sessions()
        );
        Ok(fetched)
    }

    async fn wait(&self, delay: Duration, deadline: Instant) {
        self.stats.knocks.fetch_add(1, Ordering::SeqCst);
        sleep(delay.min(deadline.saturating_duration_since(Instant::now()))).await;
    }

    /// Back off after the tracker had no source for `split_id`.
    async fn knock_split(&self, split_id: u32, deadline: Instant) {
        let delay = lock(&self.split_backoff).next_delay(split_id);
        self.wait(delay, deadline).await;
    }

    /// Back off after the mapper at `location` turned a session away.
    async fn knock_peer(&self, location: &PeerLocation, deadline: Instant) {
        let delay = lock(&self.peer_backoff).next_delay(location.clone());
        self.wait(delay, deadline).await;
    }

    /// Hand a lease back, retrying through tracker outages until `deadline`.
    async fn release(
        &self,
        split_id: u32,
        location: &PeerLocation,
        blocks: u64,
        elapsed: Duration,
        deadline: Instant,
    ) -> Result<ThrottleAdvice> {
        loop {
            match self
                .tracker
                .release_split(&self.reducer_id, split_id, location, blocks, elapsed)
                .await
            {
                Err(e) if e.is_retryable() && Instant::now() < deadline => {
                    warn!(
                        "reducer {} could not release split {} at {}: {}",
                        self.reducer_id, split_id, location, e
                    );
                    self.knock_split(split_id, deadline).await;
                }
                other => return other,
            }
        }
    }

    /// Acquire every block of one input split.
    pub async fn pull_split(&self, split_id: u32) -> Result<FetchedSplit> {
        let _active = self.stats.enter();
        let deadline = Instant::now() + self.config.fetch_deadline();
        let mut buffer: Option<SplitBuffer> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(ShuffleError::stage_failed(format!(
                    "reducer {} could not fetch split {} within {} ms",
                    self.reducer_id, split_id, self.config.max_fetch_time
                )));
            }

            let answer = match self.tracker.query_split(&self.reducer_id, split_id).await {
                Ok(answer) => answer,
                Err(e) if e.is_retryable() => {
                    warn!(
                        "reducer {} could not query split {}: {}",
                        self.reducer_id, split_id, e
                    );
                    self.knock_split(split_id, deadline).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let (location, total_blocks) = match answer {
                SplitLocation::Found {
                    location,
                    total_blocks,
                } => (location, total_blocks),
                SplitLocation::Busy | SplitLocation::Unknown => {
                    self.knock_split(split_id, deadline).await;
                    continue;
                }
                SplitLocation::Finished => {
                    return Err(ShuffleError::already_finished(self.shuffle_id.clone()));
                }
            };
            lock(&self.split_backoff).reset(&split_id);

            let pending =
                buffer.get_or_insert_with(|| SplitBuffer::new(&location, split_id, total_blocks));
            pending.relocate(&location);
            if pending.info().total_blocks() != total_blocks as usize {
                self.release(split_id, &location, 0, Duration::ZERO, deadline)
                    .await?;
                return Err(ShuffleError::protocol_error(format!(
                    "split {} changed size from {} to {} blocks",
                    split_id,
                    pending.info().total_blocks(),
                    total_blocks
                )));
            }

            let before = pending.info().has_splits();
            let started = Instant::now();
            let session = if pending.is_complete() {
                Ok(SessionEnd::Closed)
            } else {
                self.chat(&location, pending).await
            };
            let received = (pending.info().has_splits() - before) as u64;
            let advice = self
                .release(split_id, &location, received, started.elapsed(), deadline)
                .await?;

            match session {
                Ok(SessionEnd::Closed) if received > 0 || pending.is_complete() => {
                    lock(&self.peer_backoff).reset(&location);
                }
                Ok(_) => {
                    self.knock_peer(&location, deadline).await;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "session with {} for split {} failed: {}",
                        location, split_id, e
                    );
                    self.knock_peer(&location, deadline).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            if pending.is_complete() {
                debug!(
                    "reducer {} completed split {} ({} blocks)",
                    self.reducer_id, split_id, total_blocks
                );
                break;
            }
            self.throttle(&advice).await;
        }

        match buffer {
            Some(buffer) => buffer.into_fetched(),
            None => Err(ShuffleError::internal_error(format!(
                "split {} finished without a buffer",
                split_id
            ))),
        }
    }

    async fn throttle(&self, advice: &ThrottleAdvice) {
        if should_throttle(
            advice.own_rate,
            advice.slowest_rate,
            self.config.throttle_fraction,
        ) {
            self.stats.throttled.fetch_add(1, Ordering::SeqCst);
            debug!(
                "reducer {} throttling at {:.1} blocks/s",
                self.reducer_id, advice.own_rate
            );
            sleep(self.config.min_knock()).await;
        }
    }

    /// One chat session with the mapper at `location`, over within `maxChatTime`.
    async fn chat(&self, location: &PeerLocation, buffer: &mut SplitBuffer) -> Result<SessionEnd> {
        let stream = timeout(
            self.config.chat_time() + PEER_IO_GRACE,
            TcpStream::connect((location.host_address.as_str(), location.listen_port)),
        )
        .await
        .map_err(|_| ShuffleError::network_error(format!("timed out connecting to {}", location)))?
        .map_err(|e| {
            ShuffleError::network_error_with_source(format!("cannot connect to {}", location), e)
        })?;
        stream.set_nodelay(true)?;
        let block_size = self.config.block_size_bytes();
        let mut framed = peer_framed(stream, block_size);
        self.stats.sessions.fetch_add(1, Ordering::SeqCst);

        let request = ChatRequest {
            reducer_id: self.reducer_id.clone(),
            input_split: buffer.info().split_id,
            output_split: self.output_split,
            have: buffer.info().bit_vector().clone(),
        };
        send_message(&mut framed, &request).await?;

        let session_deadline = Instant::now() + self.config.chat_time();
        let mut announced = false;
        let mut read = 0;
        loop {
            let Ok(reply) =
                timeout_at(session_deadline, recv_message::<ChatResponse>(&mut framed)).await
            else {
                // Out of time; whatever arrived stays in the buffer.
                return Ok(SessionEnd::Closed);
            };
            match reply? {
                Some(ChatResponse::Busy) => return Ok(SessionEnd::Busy),
                Some(ChatResponse::Header { total_blocks }) => {
                    announced = true;
                    if total_blocks as usize != buffer.info().total_blocks() {
                        return Err(ShuffleError::protocol_error(format!(
                            "{} announced {} blocks, tracker said {}",
                            location,
                            total_blocks,
                            buffer.info().total_blocks()
                        )));
                    }
                }
                Some(ChatResponse::Block { index, data }) => {
                    if data.len() > block_size {
                        return Err(ShuffleError::protocol_error(format!(
                            "{} sent a {} byte block, limit is {}",
                            location,
                            data.len(),
                            block_size
                        )));
                    }
                    read += 1;
                    self.stats
                        .most_blocks_per_session
                        .fetch_max(read, Ordering::SeqCst);
                    let receipt = buffer.accept(index, data)?;
                    if receipt == BlockReceipt::Completed || read >= self.config.max_chat_blocks {
                        return Ok(SessionEnd::Closed);
                    }
                }
                Some(ChatResponse::EndOfChat) => return Ok(SessionEnd::Closed),
                Some(ChatResponse::Rejected { message }) => {
                    return Err(ShuffleError::protocol_error(format!(
                        "{} rejected the session: {}",
                        location, message
                    )));
                }
                // The mapper cuts off sessions that run out of time.
                None if announced => return Ok(SessionEnd::Closed),
                None => {
                    return Err(ShuffleError::network_error(format!(
                        "{} closed the session early",
                        location
                    )));
                }
            }
        }
    }
}
