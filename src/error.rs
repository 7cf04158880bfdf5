use std::io;

/// Error kinds surfaced to user callbacks. All of them except
///  [TransportError::MessageTooLarge] are fatal for the endpoint: once one is
///  delivered, the socket is closed and no further callbacks fire.
///
/// The variants are `Clone` + `PartialEq` because a single fatal condition is
///  delivered to both the reliable and the unreliable receive hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer sent a packet that does not decode. There is no way to resync
    ///  within the session, so the endpoint closes.
    #[error("malformed packet")]
    Parse,

    /// No datagram arrived within the receive timeout (5x keepalive period).
    #[error("receive timed out")]
    TimedOut,

    /// The peer announced an orderly close.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Message payloads are bounded by the u16 `total_size` field on the wire.
    #[error("message exceeds {} bytes", u16::MAX)]
    MessageTooLarge,

    /// The operation was attempted on an endpoint that is already closed.
    #[error("socket is closed")]
    Closed,

    /// An underlying UDP send or receive failed. Carries the kind only so the
    ///  error stays cheap to clone.
    #[error("i/o error: {0}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e.kind())
    }
}
