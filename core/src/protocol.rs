//! Wire protocol shared by the tracker and the split servers.
//!
//! Every connection is a length-delimited frame stream. Each frame holds one
//! bincode-encoded message: [`TrackerRequest`]/[`TrackerResponse`] on tracker
//! connections and [`ChatRequest`]/[`ChatResponse`] on peer connections.

use crate::split::BlockBitSet;
use barks_common::{Result, ShuffleError};
use bincode::{Decode, Encode};
use futures::{SinkExt, StreamExt};
use std::fmt;
use tokio::net::TcpStream;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Reducer identifier, unique within one shuffle.
pub type ReducerId = String;

/// Listen port reported for a saturated mapper.
pub const MAPPERS_BUSY: i32 = -1;
/// Query result for a reducer or split the tracker has no record of.
pub const TRACKER_DOES_NOT_EXIST: i32 = -1;
/// Query result once every reducer has completed.
pub const SHUFFLE_ALREADY_FINISHED: i32 = -2;
/// Placeholder for fields a message does not use.
pub const UNUSED_PARAM: i32 = 0;

/// Headroom above one block for the rest of a block frame.
const FRAME_OVERHEAD: usize = 64 * 1024;

/// Lifecycle of a reducer as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum ReducerState {
    Entering,
    Leaving,
    Completed,
}

impl ReducerState {
    /// Message code of the report that moves a reducer into this state.
    pub fn code(self) -> i32 {
        match self {
            ReducerState::Entering => 0,
            ReducerState::Leaving => 1,
            ReducerState::Completed => 2,
        }
    }

    /// The only state a reducer may move to from this one.
    pub fn next(self) -> Option<ReducerState> {
        match self {
            ReducerState::Entering => Some(ReducerState::Leaving),
            ReducerState::Leaving => Some(ReducerState::Completed),
            ReducerState::Completed => None,
        }
    }
}

impl fmt::Display for ReducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReducerState::Entering => "Entering",
            ReducerState::Leaving => "Leaving",
            ReducerState::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// Address a mapper serves its splits from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct PeerLocation {
    pub host_address: String,
    pub listen_port: u16,
}

impl PeerLocation {
    pub fn new(host_address: impl Into<String>, listen_port: u16) -> Self {
        Self {
            host_address: host_address.into(),
            listen_port,
        }
    }
}

impl fmt::Display for PeerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_address, self.listen_port)
    }
}

/// Answer to a split availability query.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum SplitLocation {
    /// Pull from `location`; the reducer's output split has `total_blocks` blocks there.
    /// A tracker lease is held until the reducer releases the split.
    Found {
        location: PeerLocation,
        total_blocks: u32,
    },
    /// Every mapper holding the split is serving its maximum.
    Busy,
    /// Unregistered reducer or unpublished split.
    Unknown,
    /// The shuffle has completed.
    Finished,
}

impl SplitLocation {
    /// Integer form used in logs and by peers that speak the numeric protocol.
    pub fn code(&self) -> i32 {
        match self {
            SplitLocation::Found { location, .. } => location.listen_port as i32,
            SplitLocation::Busy => MAPPERS_BUSY,
            SplitLocation::Unknown => TRACKER_DOES_NOT_EXIST,
            SplitLocation::Finished => SHUFFLE_ALREADY_FINISHED,
        }
    }
}

/// Overall shuffle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ShuffleStatus {
    InProgress { registered: u32, completed: u32 },
    AlreadyFinished,
}

impl ShuffleStatus {
    pub fn code(&self) -> i32 {
        match self {
            ShuffleStatus::InProgress { .. } => UNUSED_PARAM,
            ShuffleStatus::AlreadyFinished => SHUFFLE_ALREADY_FINISHED,
        }
    }
}

/// Returned when a reducer gives back a split lease.
#[derive(Debug, Clone, Copy, PartialEq, Encode, Decode)]
pub struct ThrottleAdvice {
    /// The reducer's own cumulative rate, in blocks per second.
    pub own_rate: f64,
    /// Slowest rate among reducers still fetching, if any has reported.
    pub slowest_rate: Option<f64>,
}

/// Messages sent to the tracker.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum TrackerRequest {
    ReducerEntering {
        reducer_id: ReducerId,
        output_split: u32,
        address: String,
    },
    ReducerLeaving {
        reducer_id: ReducerId,
    },
    ReducerCompleted {
        reducer_id: ReducerId,
    },
    QuerySplit {
        reducer_id: ReducerId,
        split_id: u32,
    },
    ReleaseSplit {
        reducer_id: ReducerId,
        split_id: u32,
        location: PeerLocation,
        blocks: u64,
        elapsed_ms: u64,
    },
    QueryStatus,
    RegisterMapper {
        split_id: u32,
        location: PeerLocation,
        total_blocks_per_output_split: Vec<u32>,
    },
}

impl TrackerRequest {
    /// Numeric message kind. Lifecycle reports use the reducer state codes.
    pub fn kind(&self) -> i32 {
        match self {
            TrackerRequest::ReducerEntering { .. } => ReducerState::Entering.code(),
            TrackerRequest::ReducerLeaving { .. } => ReducerState::Leaving.code(),
            TrackerRequest::ReducerCompleted { .. } => ReducerState::Completed.code(),
            TrackerRequest::QuerySplit { .. } => 3,
            TrackerRequest::ReleaseSplit { .. } => 4,
            TrackerRequest::QueryStatus => 5,
            TrackerRequest::RegisterMapper { .. } => 6,
        }
    }
}

/// Tracker replies.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum TrackerResponse {
    Status(ShuffleStatus),
    Split(SplitLocation),
    Throttle(ThrottleAdvice),
    Ack,
    InvalidTransition {
        from: ReducerState,
        to: ReducerState,
    },
    /// The request was refused; the tracker itself is unaffected.
    Rejected { message: String },
}

/// Opens a chat session with a mapper.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ChatRequest {
    pub reducer_id: ReducerId,
    pub input_split: u32,
    pub output_split: u32,
    /// Blocks the reducer already holds; the mapper skips them.
    pub have: BlockBitSet,
}

/// Mapper replies within a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ChatResponse {
    /// The mapper is serving its maximum number of reducers.
    Busy,
    Header { total_blocks: u32 },
    Block { index: u32, data: Vec<u8> },
    /// The mapper closed the session; blocks may remain.
    EndOfChat,
    Rejected { message: String },
}

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Frame a tracker connection.
pub fn tracker_framed(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LengthDelimitedCodec::new())
}

/// Frame a peer connection carrying blocks of up to `block_size` bytes.
pub fn peer_framed(stream: TcpStream, block_size: usize) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(block_size + FRAME_OVERHEAD)
        .new_codec();
    Framed::new(stream, codec)
}

pub async fn send_message<M: Encode>(framed: &mut FramedStream, message: &M) -> Result<()> {
    let bytes = bincode::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| ShuffleError::codec_error_with_source("failed to encode message", e))?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| ShuffleError::network_error_with_source("failed to send frame", e))
}

/// Read the next message, or `None` once the peer has closed the connection.
pub async fn recv_message<M: Decode<()>>(framed: &mut FramedStream) -> Result<Option<M>> {
    let frame = match framed.next().await {
        Some(frame) => {
            frame.map_err(|e| ShuffleError::network_error_with_source("failed to read frame", e))?
        }
        None => return Ok(None),
    };
    let (message, _) = bincode::decode_from_slice(&frame, bincode::config::standard())
        .map_err(|e| ShuffleError::codec_error_with_source("failed to decode message", e))?;
    Ok(Some(message))
}
