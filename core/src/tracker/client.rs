//! Client side of the tracker protocol, used by reducers and mappers.

use crate::protocol::{
    FramedStream, PeerLocation, ReducerState, ShuffleStatus, SplitLocation, ThrottleAdvice,
    TrackerRequest, TrackerResponse, recv_message, send_message, tracker_framed,
};
use crate::split::SplitInfo;
use barks_common::{Result, ShuffleError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IDEMPOTENT_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// A connection to the tracker, reopened after any failure.
pub struct TrackerClient {
    addr: SocketAddr,
    connection: Mutex<Option<FramedStream>>,
}

impl TrackerClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connection: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> Result<FramedStream> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                ShuffleError::network_error(format!("timed out connecting to tracker {}", self.addr))
            })?
            .map_err(|e| {
                ShuffleError::network_error_with_source(
                    format!("cannot connect to tracker {}", self.addr),
                    e,
                )
            })?;
        stream.set_nodelay(true)?;
        Ok(tracker_framed(stream))
    }

    async fn call(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        let mut connection = self.connection.lock().await;
        let mut framed = match connection.take() {
            Some(framed) => framed,
            None => self.connect().await?,
        };

        send_message(&mut framed, request).await?;
        match recv_message::<TrackerResponse>(&mut framed).await? {
            Some(response) => {
                *connection = Some(framed);
                Ok(response)
            }
            None => Err(ShuffleError::network_error(format!(
                "tracker {} closed the connection",
                self.addr
            ))),
        }
    }

    /// Send a request whose repetition is harmless, retrying network failures.
    async fn call_idempotent(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        let mut attempt = 1;
        loop {
            match self.call(request).await {
                Err(e) if e.is_retryable() && attempt < IDEMPOTENT_ATTEMPTS => {
                    warn!(
                        "tracker request kind {} failed (attempt {}): {}",
                        request.kind(),
                        attempt,
                        e
                    );
                    attempt += 1;
                    sleep(RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    fn unexpected(response: TrackerResponse) -> ShuffleError {
        match response {
            TrackerResponse::Rejected { message } => ShuffleError::protocol_error(message),
            other => ShuffleError::protocol_error(format!(
                "unexpected tracker response: {:?}",
                other
            )),
        }
    }

    /// Enter the shuffle. Answers `AlreadyFinished` for a late reducer.
    pub async fn register(
        &self,
        reducer_id: &str,
        output_split: u32,
        address: &str,
    ) -> Result<ShuffleStatus> {
        let request = TrackerRequest::ReducerEntering {
            reducer_id: reducer_id.to_string(),
            output_split,
            address: address.to_string(),
        };
        match self.call_idempotent(&request).await? {
            TrackerResponse::Status(status) => Ok(status),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Report a lifecycle transition. Out-of-order reports come back as
    /// [`ShuffleError::InvalidTransition`].
    pub async fn report_state(&self, reducer_id: &str, state: ReducerState) -> Result<ShuffleStatus> {
        let request = match state {
            ReducerState::Entering => {
                return Err(ShuffleError::protocol_error(
                    "Entering is reported through register",
                ));
            }
            ReducerState::Leaving => TrackerRequest::ReducerLeaving {
                reducer_id: reducer_id.to_string(),
            },
            ReducerState::Completed => TrackerRequest::ReducerCompleted {
                reducer_id: reducer_id.to_string(),
            },
        };
        match self.call_idempotent(&request).await? {
            TrackerResponse::Status(status) => Ok(status),
            TrackerResponse::InvalidTransition { from, to } => {
                Err(ShuffleError::invalid_transition(reducer_id, from, to))
            }
            other => Err(Self::unexpected(other)),
        }
    }

    /// Ask where to pull `split_id` from. A `Found` answer holds a lease.
    pub async fn query_split(&self, reducer_id: &str, split_id: u32) -> Result<SplitLocation> {
        let request = TrackerRequest::QuerySplit {
            reducer_id: reducer_id.to_string(),
            split_id,
        };
        match self.call(&request).await? {
            TrackerResponse::Split(location) => {
                debug!(
                    "split {} for {} -> {}",
                    split_id,
                    reducer_id,
                    location.code()
                );
                Ok(location)
            }
            other => Err(Self::unexpected(other)),
        }
    }

    /// Give back the lease taken by [`TrackerClient::query_split`].
    pub async fn release_split(
        &self,
        reducer_id: &str,
        split_id: u32,
        location: &PeerLocation,
        blocks: u64,
        elapsed: Duration,
    ) -> Result<ThrottleAdvice> {
        let request = TrackerRequest::ReleaseSplit {
            reducer_id: reducer_id.to_string(),
            split_id,
            location: location.clone(),
            blocks,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        match self.call(&request).await? {
            TrackerResponse::Throttle(advice) => Ok(advice),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn query_status(&self) -> Result<ShuffleStatus> {
        match self.call_idempotent(&TrackerRequest::QueryStatus).await? {
            TrackerResponse::Status(status) => Ok(status),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Publish a mapper's split.
    pub async fn register_mapper(&self, split: &SplitInfo) -> Result<()> {
        let request = TrackerRequest::RegisterMapper {
            split_id: split.split_id,
            location: PeerLocation::new(split.host_address.clone(), split.listen_port),
            total_blocks_per_output_split: split.total_blocks_per_output_split.clone(),
        };
        match self.call_idempotent(&request).await? {
            TrackerResponse::Ack => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }
}
