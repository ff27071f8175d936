use std::io;

use thiserror::Error;

/// Ways a line-oriented connection can end or fail.
///
/// `PeerClosed` and `WriteFailed` are the normal end of a session and drive
/// state transitions rather than propagating. `LineTooLong` means the peer is
/// misbehaving and the connection must be closed.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("line exceeds {limit} bytes without a terminator")]
    LineTooLong { limit: usize },

    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),
}

impl TransportError {
    /// True for the conditions that simply mean the other side went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::PeerClosed | TransportError::WriteFailed(_))
    }
}
