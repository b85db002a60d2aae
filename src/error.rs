//! The error type surfaced by the user-facing stack operations.
use core::fmt;

/// The error type for stack operations.
///
/// Wire-level parse failures never reach the user API; malformed input is
/// logged and dropped inside the engine. These kinds cover everything a
/// caller of `open`/`send`/`receive`/`close` or the setup functions can
/// observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An argument was rejected before the operation started.
    ///
    /// Examples: an out-of-range control block id, a requested active TCP
    /// open, a source address that does not belong to the routed interface.
    InvalidArgument,

    /// A fixed-size resource pool was exhausted.
    ///
    /// Control block tables and device queues have a fixed capacity; the
    /// stack keeps running and the operation may be retried after other
    /// users release their share.
    ResourceExhausted,

    /// No route matched the destination address.
    NotRouted,

    /// The packet was handed to address resolution instead of the wire.
    ///
    /// Resolution was started (or is still outstanding) for the nexthop;
    /// nothing was transmitted. Callers currently treat this as a send
    /// failure and drop the datagram.
    InProgress,

    /// A blocking call was interrupted before its condition was met.
    ///
    /// Raised by the stack-wide event broadcast and by releasing a control
    /// block out from under a sleeping caller. The call may be retried.
    Interrupted,

    /// The operation is not legal in the current state.
    ///
    /// Examples: binding an endpoint that is already bound, sending on a
    /// connection that is not established, output on a device that is not
    /// up.
    InvalidState,

    /// The payload does not fit the device MTU and fragmentation is not
    /// supported.
    TooLong,

    /// The device driver failed to transmit.
    Device,
}

/// The result type for stack operations.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::NotRouted => write!(f, "no route to destination"),
            Error::InProgress => write!(f, "address resolution in progress"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::TooLong => write!(f, "payload too long"),
            Error::Device => write!(f, "device transmit failure"),
        }
    }
}

impl std::error::Error for Error {}

/// Parse failures surface as `InvalidArgument` on the rare paths where the
/// engine builds a packet from caller-supplied values.
impl From<crate::wire::Error> for Error {
    fn from(_: crate::wire::Error) -> Self {
        Error::InvalidArgument
    }
}
