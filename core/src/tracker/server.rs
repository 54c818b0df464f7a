//! TCP front end of the shuffle tracker.

use crate::protocol::{
    ReducerState, TrackerRequest, TrackerResponse, recv_message, send_message, tracker_framed,
};
use crate::tracker::ShuffleTracker;
use barks_common::{ErrorSeverity, Result, ShuffleError, ThreadPoolFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answer one request against the registry.
pub fn dispatch(tracker: &ShuffleTracker, request: TrackerRequest) -> TrackerResponse {
    match request {
        TrackerRequest::ReducerEntering {
            reducer_id,
            output_split,
            address,
        } => TrackerResponse::Status(tracker.register(&reducer_id, output_split, &address)),
        TrackerRequest::ReducerLeaving { reducer_id } => {
            report(tracker, &reducer_id, ReducerState::Leaving)
        }
        TrackerRequest::ReducerCompleted { reducer_id } => {
            report(tracker, &reducer_id, ReducerState::Completed)
        }
        TrackerRequest::QuerySplit {
            reducer_id,
            split_id,
        } => TrackerResponse::Split(tracker.query_split(&reducer_id, split_id)),
        TrackerRequest::ReleaseSplit {
            reducer_id,
            split_id,
            location,
            blocks,
            elapsed_ms,
        } => TrackerResponse::Throttle(tracker.release_split(
            &reducer_id,
            split_id,
            &location,
            blocks,
            Duration::from_millis(elapsed_ms),
        )),
        TrackerRequest::QueryStatus => TrackerResponse::Status(tracker.status()),
        TrackerRequest::RegisterMapper {
            split_id,
            location,
            total_blocks_per_output_split,
        } => {
            tracker.register_mapper(split_id, location, total_blocks_per_output_split);
            TrackerResponse::Ack
        }
    }
}

fn report(tracker: &ShuffleTracker, reducer_id: &str, to: ReducerState) -> TrackerResponse {
    match tracker.report_state(reducer_id, to) {
        Ok(status) => TrackerResponse::Status(status),
        Err(ShuffleError::InvalidTransition { .. }) => match tracker.registration(reducer_id) {
            Some(registration) => TrackerResponse::InvalidTransition {
                from: registration.state,
                to,
            },
            None => TrackerResponse::Rejected {
                message: format!("reducer {} is not registered", reducer_id),
            },
        },
        Err(e) => TrackerResponse::Rejected {
            message: e.to_string(),
        },
    }
}

async fn handle_connection(tracker: Arc<ShuffleTracker>, stream: TcpStream) -> Result<()> {
    let mut framed = tracker_framed(stream);
    while let Some(request) = recv_message::<TrackerRequest>(&mut framed).await? {
        debug!("tracker received message kind {}", request.kind());
        let response = dispatch(&tracker, request);
        send_message(&mut framed, &response).await?;
    }
    Ok(())
}

/// Accepts reducer and mapper connections, one handler per connection.
pub struct TrackerServer {
    tracker: Arc<ShuffleTracker>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TrackerServer {
    pub async fn bind(addr: SocketAddr, tracker: Arc<ShuffleTracker>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            ShuffleError::network_error_with_source(format!("cannot bind tracker on {}", addr), e)
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            tracker,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tracker(&self) -> Arc<ShuffleTracker> {
        Arc::clone(&self.tracker)
    }

    /// Serve until `shutdown` is cancelled, then stop every handler.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Shuffle tracker for {} listening on {}",
            self.tracker.shuffle_id(),
            self.local_addr
        );
        let mut handlers = ThreadPoolFactory::new_child_cached_pool::<()>("tracker", &shutdown);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        handlers.reap();
                        let tracker = Arc::clone(&self.tracker);
                        handlers.spawn(async move {
                            if let Err(e) = handle_connection(tracker, stream).await {
                                match e.severity() {
                                    ErrorSeverity::Recoverable => {
                                        debug!("tracker connection from {} dropped: {}", peer, e)
                                    }
                                    _ => warn!("tracker connection from {} failed: {}", peer, e),
                                }
                            }
                        });
                    }
                    Err(e) => error!("tracker accept failed: {}", e),
                },
            }
        }
        handlers.shutdown().await;
        info!("Shuffle tracker on {} stopped", self.local_addr);
        Ok(())
    }

    /// Run the server in the background.
    pub fn spawn(self) -> TrackerHandle {
        let shutdown = CancellationToken::new();
        let local_addr = self.local_addr;
        let tracker = self.tracker();
        let task = tokio::spawn(self.serve(shutdown.clone()));
        TrackerHandle {
            local_addr,
            tracker,
            shutdown,
            task,
        }
    }
}

/// A tracker running in the background.
pub struct TrackerHandle {
    local_addr: SocketAddr,
    tracker: Arc<ShuffleTracker>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl TrackerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tracker(&self) -> &Arc<ShuffleTracker> {
        &self.tracker
    }

    /// Stop accepting, close every handler and wait for the server task.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.map_err(|e| {
            ShuffleError::internal_error(format!("tracker task ended abnormally: {}", e))
        })?
    }
}
