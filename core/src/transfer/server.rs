//! Mapper-side peer serving the blocks of one published input split.
//!
//! Each connection carries one chat session: the reducer sends a
//! [`ChatRequest`] with the blocks it already holds, the server answers with
//! a header, streams missing blocks until the block limit is hit and closes
//! with [`ChatResponse::EndOfChat`]. A session still open after `maxChatTime`
//! is cut off mid-block. Reducers beyond `maxTxConnections` get
//! [`ChatResponse::Busy`].

use crate::protocol::{
    ChatRequest, ChatResponse, PeerLocation, peer_framed, recv_message, send_message,
};
use crate::transfer::store::{BlockStore, SplitBlockId};
use barks_common::{ErrorSeverity, Result, ShuffleConfig, ShuffleError, ThreadPoolFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters kept by a split server.
#[derive(Debug, Default)]
pub struct ServeStats {
    active: AtomicUsize,
    peak: AtomicUsize,
    sessions: AtomicU64,
    blocks_served: AtomicU64,
    busy_replies: AtomicU64,
}

impl ServeStats {
    /// Most sessions ever served at the same time.
    pub fn peak_serves(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active_serves(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn blocks_served(&self) -> u64 {
        self.blocks_served.load(Ordering::SeqCst)
    }

    pub fn busy_replies(&self) -> u64 {
        self.busy_replies.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ActiveServe {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.sessions.fetch_add(1, Ordering::SeqCst);
        ActiveServe(Arc::clone(self))
    }
}

struct ActiveServe(Arc<ServeStats>);

impl Drop for ActiveServe {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Limits applied to every chat session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_blocks: usize,
    pub max_time: Duration,
}

impl SessionLimits {
    pub fn from_config(config: &ShuffleConfig) -> Self {
        Self {
            max_blocks: config.max_chat_blocks,
            max_time: config.chat_time(),
        }
    }
}

struct ServeContext {
    input_split: u32,
    store: Arc<dyn BlockStore>,
    permits: Arc<Semaphore>,
    limits: SessionLimits,
    stats: Arc<ServeStats>,
}

impl ServeContext {
    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut framed = peer_framed(stream, self.store.block_size());
        let Some(request) = recv_message::<ChatRequest>(&mut framed).await? else {
            return Ok(());
        };

        if request.input_split != self.input_split {
            let message = format!(
                "this peer serves split {}, not {}",
                self.input_split, request.input_split
            );
            return send_message(&mut framed, &ChatResponse::Rejected { message }).await;
        }

        let Ok(_permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.stats.busy_replies.fetch_add(1, Ordering::SeqCst);
            debug!(
                "split {} busy, turning away {}",
                self.input_split, request.reducer_id
            );
            return send_message(&mut framed, &ChatResponse::Busy).await;
        };
        let _active = self.stats.enter();

        let id = SplitBlockId::new(request.input_split, request.output_split);
        let Some(total_blocks) = self.store.block_count(&id).await? else {
            let message = format!(
                "no payload for split {}->{}",
                request.input_split, request.output_split
            );
            return send_message(&mut framed, &ChatResponse::Rejected { message }).await;
        };
        if request.have.len() != total_blocks as usize {
            let message = format!(
                "split {}->{} has {} blocks, request tracks {}",
                request.input_split,
                request.output_split,
                total_blocks,
                request.have.len()
            );
            return send_message(&mut framed, &ChatResponse::Rejected { message }).await;
        }

        let deadline = Instant::now() + self.limits.max_time;
        send_message(&mut framed, &ChatResponse::Header { total_blocks }).await?;

        let mut served = 0;
        for index in request.have.iter_zeros() {
            if served >= self.limits.max_blocks {
                break;
            }
            let index = index as u32;
            let sent = timeout_at(deadline, async {
                let data = self.store.get_block(&id, index).await?;
                send_message(&mut framed, &ChatResponse::Block { index, data }).await
            })
            .await;
            match sent {
                Ok(result) => result?,
                Err(_) => {
                    // Out of time: close without the trailer.
                    debug!(
                        "session with {} on split {}->{} hit {:?} after {} blocks",
                        request.reducer_id,
                        request.input_split,
                        request.output_split,
                        self.limits.max_time,
                        served
                    );
                    return Ok(());
                }
            }
            served += 1;
            self.stats.blocks_served.fetch_add(1, Ordering::SeqCst);
        }

        debug!(
            "served {} blocks of split {}->{} to {}",
            served, request.input_split, request.output_split, request.reducer_id
        );
        send_message(&mut framed, &ChatResponse::EndOfChat).await
    }
}

/// Serves one input split's blocks to reducers.
pub struct SplitServer {
    context: Arc<ServeContext>,
    listener: TcpListener,
    location: PeerLocation,
}

impl SplitServer {
    /// Bind on an ephemeral port of `host`.
    pub async fn bind(
        host: &str,
        input_split: u32,
        store: Arc<dyn BlockStore>,
        max_tx_connections: usize,
        limits: SessionLimits,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, 0)).await.map_err(|e| {
            ShuffleError::network_error_with_source(
                format!("cannot bind split server {} on {}", input_split, host),
                e,
            )
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            context: Arc::new(ServeContext {
                input_split,
                store,
                permits: Arc::new(Semaphore::new(max_tx_connections.max(1))),
                limits,
                stats: Arc::new(ServeStats::default()),
            }),
            listener,
            location: PeerLocation::new(host, local_addr.port()),
        })
    }

    pub fn location(&self) -> &PeerLocation {
        &self.location
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ServeStats> {
        Arc::clone(&self.context.stats)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        debug!(
            "split server {} listening on {}",
            self.context.input_split, self.location
        );
        let mut handlers = ThreadPoolFactory::new_child_cached_pool::<()>(
            &format!("split-server-{}", self.context.input_split),
            &shutdown,
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        handlers.reap();
                        let context = Arc::clone(&self.context);
                        handlers.spawn(async move {
                            if let Err(e) = context.handle_connection(stream).await {
                                match e.severity() {
                                    ErrorSeverity::Recoverable => debug!(
                                        "chat with {} on split {} ended: {}",
                                        peer, context.input_split, e
                                    ),
                                    _ => warn!(
                                        "chat with {} on split {} failed: {}",
                                        peer, context.input_split, e
                                    ),
                                }
                            }
                        });
                    }
                    Err(e) => error!("split server accept failed: {}", e),
                },
            }
        }
        handlers.shutdown().await;
        info!(
            "split server {} stopped after {} sessions, {} blocks",
            self.context.input_split,
            self.context.stats.sessions(),
            self.context.stats.blocks_served()
        );
        Ok(())
    }

    pub fn spawn(self) -> SplitServerHandle {
        let shutdown = CancellationToken::new();
        let location = self.location.clone();
        let stats = self.stats();
        let task = tokio::spawn(self.serve(shutdown.clone()));
        SplitServerHandle {
            location,
            stats,
            shutdown,
            task,
        }
    }
}

/// A split server running in the background.
pub struct SplitServerHandle {
    location: PeerLocation,
    stats: Arc<ServeStats>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl SplitServerHandle {
    pub fn location(&self) -> &PeerLocation {
        &self.location
    }

    pub fn stats(&self) -> &Arc<ServeStats> {
        &self.stats
    }

    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.map_err(|e| {
            ShuffleError::internal_error(format!("split server task ended abnormally: {}", e))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::BlockBitSet;
    use crate::transfer::store::MemoryBlockStore;

    async fn start(blocks: usize, max_tx: usize, limits: SessionLimits) -> SplitServerHandle {
        let store = MemoryBlockStore::new(2);
        store
            .put_split(SplitBlockId::new(0, 0), vec![7; blocks * 2])
            .await
            .unwrap();
        SplitServer::bind("127.0.0.1", 0, Arc::new(store), max_tx, limits)
            .await
            .unwrap()
            .spawn()
    }

    async fn open(location: &PeerLocation, have: BlockBitSet) -> crate::protocol::FramedStream {
        let stream = TcpStream::connect((location.host_address.as_str(), location.listen_port))
            .await
            .unwrap();
        let mut framed = peer_framed(stream, 2);
        send_message(
            &mut framed,
            &ChatRequest {
                reducer_id: "r0".into(),
                input_split: 0,
                output_split: 0,
                have,
            },
        )
        .await
        .unwrap();
        framed
    }

    async fn drain(framed: &mut crate::protocol::FramedStream) -> Vec<ChatResponse> {
        let mut replies = Vec::new();
        while let Some(reply) = recv_message::<ChatResponse>(framed).await.unwrap() {
            let end = matches!(
                reply,
                ChatResponse::EndOfChat | ChatResponse::Busy | ChatResponse::Rejected { .. }
            );
            replies.push(reply);
            if end {
                break;
            }
        }
        replies
    }

    #[tokio::test]
    async fn test_session_stops_at_block_limit() {
        let limits = SessionLimits {
            max_blocks: 3,
            max_time: Duration::from_secs(10),
        };
        let server = start(5, 2, limits).await;

        let mut have = BlockBitSet::new(5);
        have.set(0);
        let mut framed = open(server.location(), have).await;
        let replies = drain(&mut framed).await;

        assert_eq!(replies[0], ChatResponse::Header { total_blocks: 5 });
        let indices: Vec<u32> = replies
            .iter()
            .filter_map(|r| match r {
                ChatResponse::Block { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(replies.last(), Some(&ChatResponse::EndOfChat));

        server.shutdown().await.unwrap();
    }

    /// Store whose reads take a while, keeping sessions open.
    struct SlowStore(MemoryBlockStore);

    #[async_trait::async_trait]
    impl BlockStore for SlowStore {
        fn block_size(&self) -> usize {
            self.0.block_size()
        }

        async fn put_split(&self, id: SplitBlockId, payload: Vec<u8>) -> Result<u32> {
            self.0.put_split(id, payload).await
        }

        async fn get_block(&self, id: &SplitBlockId, index: u32) -> Result<Vec<u8>> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.0.get_block(id, index).await
        }

        async fn block_count(&self, id: &SplitBlockId) -> Result<Option<u32>> {
            self.0.block_count(id).await
        }

        async fn remove_split(&self, id: &SplitBlockId) -> Result<()> {
            self.0.remove_split(id).await
        }
    }

    #[tokio::test]
    async fn test_saturated_server_answers_busy() {
        let store = SlowStore(MemoryBlockStore::new(2));
        store
            .put_split(SplitBlockId::new(0, 0), vec![1; 8])
            .await
            .unwrap();
        let limits = SessionLimits {
            max_blocks: 1,
            max_time: Duration::from_secs(10),
        };
        let server = SplitServer::bind("127.0.0.1", 0, Arc::new(store), 1, limits)
            .await
            .unwrap()
            .spawn();

        // The header arrives while the first session still holds the only permit.
        let mut first = open(server.location(), BlockBitSet::new(4)).await;
        let header: ChatResponse = recv_message(&mut first).await.unwrap().unwrap();
        assert_eq!(header, ChatResponse::Header { total_blocks: 4 });

        let mut second = open(server.location(), BlockBitSet::new(4)).await;
        assert_eq!(drain(&mut second).await, vec![ChatResponse::Busy]);
        assert_eq!(server.stats().busy_replies(), 1);

        let rest = drain(&mut first).await;
        assert_eq!(rest.len(), 2);
        assert_eq!(server.stats().peak_serves(), 1);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_is_cut_off_at_time_limit() {
        let store = SlowStore(MemoryBlockStore::new(2));
        store
            .put_split(SplitBlockId::new(0, 0), vec![1; 8])
            .await
            .unwrap();
        let limits = SessionLimits {
            max_blocks: 8,
            max_time: Duration::from_millis(200),
        };
        let server = SplitServer::bind("127.0.0.1", 0, Arc::new(store), 1, limits)
            .await
            .unwrap()
            .spawn();

        let started = Instant::now();
        let mut framed = open(server.location(), BlockBitSet::new(4)).await;
        let mut replies = Vec::new();
        while let Ok(Some(reply)) = recv_message::<ChatResponse>(&mut framed).await {
            replies.push(reply);
        }
        let elapsed = started.elapsed();

        // Every read takes longer than the session may last.
        assert_eq!(replies, vec![ChatResponse::Header { total_blocks: 4 }]);
        assert!(elapsed < Duration::from_millis(450), "took {:?}", elapsed);
        assert_eq!(server.stats().blocks_served(), 0);
        assert_eq!(server.stats().active_serves(), 0);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_request_is_rejected() {
        let limits = SessionLimits {
            max_blocks: 8,
            max_time: Duration::from_secs(10),
        };
        let server = start(3, 2, limits).await;

        let mut framed = open(server.location(), BlockBitSet::new(9)).await;
        let replies = drain(&mut framed).await;
        assert!(matches!(replies.as_slice(), [ChatResponse::Rejected { .. }]));

        server.shutdown().await.unwrap();
    }
}
