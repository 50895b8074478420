use std::io;

pub type TransportResult<T> = Result<T, TransportError>;

/// Two-level error plumbing for the transport. `Wait` covers every
/// recoverable I/O state (would-block, not enough data) and is never
/// surfaced to the upper layer; `Fatal` is terminal for the endpoint.
#[derive(Debug, Eq, PartialEq)]
pub enum TransportError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Peer closed the stream or reset the connection.
    PeerHungUp,
    /// The non-blocking connect was refused or failed.
    ConnectFailed,
    /// Handshake magic or byte-order sentinel did not match.
    HandshakeMagic,
    /// Handshake protocol version did not match.
    VersionMismatch,
    /// Handshake did not complete within the configured timeout.
    Timeout,
    /// Requested size exceeds the maximum send size.
    PayloadTooLarge,
    /// Malformed header or segment table on the wire.
    Corrupt,
    /// The free list reached its configured maximum.
    Exhausted,
    /// Endpoint torn down by `del_procs`.
    PeerRemoved,
    /// Outstanding work cancelled by transport teardown.
    Cancelled,
    /// Endpoint is shutting down and accepts no new sends.
    Closing,
    /// No local interface matched the include/exclude configuration.
    NoInterface,
    /// No port in `[port_min, port_min + port_range)` could be bound.
    PortRangeExhausted,
    Io(io::ErrorKind),
}

impl From<io::Error> for TransportError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => TransportError::Wait,
            kind => TransportError::Fatal(ErrorType::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for TransportResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(TransportError::Wait) => false,
            _ => true,
        }
    }
}

/// Outcome reported to a fragment's completion callback.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CompletionStatus {
    Ok,
    Error(ErrorType),
}

impl CompletionStatus {
    #[inline]
    pub fn is_ok(&self) -> bool {
        *self == CompletionStatus::Ok
    }
}

/// Descriptor flags carried by a fragment.
///
/// `pool_owned` means the transport reclaims the fragment into its origin
/// free list once the completion callback returns. `always_callback` forces
/// the callback even when the send completes inline in `send`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DescFlags {
    pub pool_owned: bool,
    pub always_callback: bool,
}

impl Default for DescFlags {
    #[inline]
    fn default() -> Self {
        DescFlags {
            pool_owned: true,
            always_callback: false,
        }
    }
}

pub type CompletionFn = Box<dyn FnOnce(CompletionStatus) + Send>;
