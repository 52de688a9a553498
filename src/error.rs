//! Error taxonomy for the toolkit core
//!
//! Every failure belongs to one of three classes:
//!
//! - **Fatal**: the event loop terminates (connection lost, unrecoverable
//!   write failure, a backing store that cannot be allocated even after a
//!   resize has been undone).
//! - **Recoverable**: logged and dropped locally (a pipe that could not be
//!   created, one sub-surface that failed to get a drawable, an out of range
//!   cursor image).
//! - **Protocol violation**: the request is rejected and no state changes.

use std::io;

use thiserror::Error;

use crate::offer::OfferId;
use crate::redraw::SurfaceId;
use crate::selection::{Channel, PeerId};

/// How an error affects the running loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Recoverable,
    ProtocolViolation,
}

#[derive(Debug, Error)]
pub enum ToolkitError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event loop error: {0}")]
    Loop(#[from] calloop::Error),

    #[error("connection to the display server lost: {0}")]
    ConnectionLost(#[source] io::Error),

    #[error("failed to flush outgoing protocol messages: {0}")]
    FlushFailed(#[source] io::Error),

    #[error("could not allocate a drawable for surface {surface:?} at {width}x{height}")]
    DrawableUnavailable {
        surface: SurfaceId,
        width: i32,
        height: i32,
    },

    #[error("could not draw a surface, the backing store allocator is unusable (check space in XDG_RUNTIME_DIR)")]
    BackingStoreExhausted,

    #[error("could not create a transfer pipe: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("cursor image index {index} out of range ({count} images)")]
    CursorIndexOutOfRange { index: usize, count: usize },

    #[error("unknown data offer {0:?}")]
    UnknownOffer(OfferId),

    #[error("offer does not advertise mime type {0}")]
    UnsupportedMimeType(String),

    #[error("no selection offer is available")]
    NoSelection,

    #[error("data source is no longer the active {0:?} selection")]
    SourceGone(Channel),

    #[error("peer {peer:?} does not hold the focus required to set the {channel:?} selection")]
    NotFocused { peer: PeerId, channel: Channel },

    #[error("peer {peer:?} cannot install a data source owned by {owner:?}")]
    ForeignSource { peer: PeerId, owner: PeerId },
}

impl ToolkitError {
    pub fn severity(&self) -> Severity {
        match self {
            ToolkitError::ConnectionLost(_)
            | ToolkitError::FlushFailed(_)
            | ToolkitError::BackingStoreExhausted => Severity::Fatal,
            ToolkitError::NotFocused { .. } | ToolkitError::ForeignSource { .. } => {
                Severity::ProtocolViolation
            }
            _ => Severity::Recoverable,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub type Result<T> = std::result::Result<T, ToolkitError>;
