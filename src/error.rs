//! Error types for the WebSocket connection core.
//!
//! Every error that can terminate the connection is `Clone` so the
//! write-once terminal cause can be handed to each blocked caller.

use std::sync::Arc;

use thiserror::Error;

use crate::message::CloseFrame;

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by connection operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The connection has been closed; wraps the terminal cause.
    ///
    /// Once the connection reaches this state, every subsequent operation
    /// returns the same value.
    #[error("websocket closed: {0}")]
    ConnectionClosed(Arc<Error>),

    /// The connection was closed with a status code and reason, either by
    /// the peer or by a local call to [`Conn::close`](crate::Conn::close).
    #[error("websocket closed with status {} and reason {:?}", .0.code.as_u16(), .0.reason)]
    Close(CloseFrame),

    /// Protocol violation detected.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Reserved bits set without a negotiated extension.
    #[error("reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Reserved opcode used.
    #[error("reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame with FIN clear (RFC violation).
    #[error("control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload larger than 125 bytes.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(u64),

    /// A message began with a continuation frame.
    #[error("continuation frame without initiating data frame")]
    UnexpectedContinuation,

    /// A new data frame arrived before the previous message finished.
    #[error("new data frame before previous message finished")]
    InterleavedDataFrame,

    /// Close payload was a lone status byte or carried a non-UTF-8
    /// reason.
    #[error("invalid close payload")]
    InvalidClosePayload,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(String),

    /// The caller's cancellation scope fired while the operation was
    /// suspended.
    #[error("operation cancelled by caller scope")]
    Cancelled,

    /// The read deadline fired during an inflight frame read.
    #[error("data read timed out")]
    ReadTimedOut,

    /// The write deadline fired during an inflight frame write.
    #[error("data write timed out")]
    WriteTimedOut,

    /// The parent scope registered via [`Conn::context`](crate::Conn::context)
    /// was cancelled.
    #[error("parent scope cancelled")]
    ParentCancelled,

    /// The message writer was used after `finish`.
    #[error("cannot use finished message writer")]
    WriterFinished,

    /// The message reader was used after end-of-message was delivered.
    #[error("cannot use exhausted message reader")]
    ReaderExhausted,

    /// A single message exceeded the configured read limit.
    #[error("message exceeds read limit of {0} bytes")]
    ReadLimited(u64),

    /// Close reason longer than the 123 bytes a close frame can carry.
    #[error("close reason too long: {0} bytes (max: 123)")]
    ReasonTooLong(usize),

    /// Close status code that must never appear on the wire.
    #[error("close status code {0} is forbidden on the wire")]
    CloseCodeForbidden(u16),

    /// The connection was dropped without an explicit close.
    #[error("connection dropped without close")]
    ConnectionDropped,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CloseCode;

    #[test]
    fn test_terminal_wrapping_display() {
        let err = Error::ConnectionClosed(Arc::new(Error::ReadTimedOut));
        assert_eq!(err.to_string(), "websocket closed: data read timed out");
    }

    #[test]
    fn test_close_display() {
        let err = Error::Close(CloseFrame::new(CloseCode::Normal, "bye"));
        assert_eq!(
            err.to_string(),
            "websocket closed with status 1000 and reason \"bye\""
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let ws_err: Error = io_err.into();
        assert!(matches!(ws_err, Error::Io(_)));
    }

    #[test]
    fn test_terminal_equality() {
        let cause = Error::Close(CloseFrame::new(CloseCode::GoingAway, ""));
        let a = Error::ConnectionClosed(Arc::new(cause.clone()));
        let b = Error::ConnectionClosed(Arc::new(cause));
        assert_eq!(a, b);
    }
}
