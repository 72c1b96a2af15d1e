//! Standard error codes used across the kernel and chip crates.

/// Standard errors.
///
/// Fallible synchronous operations return `Result<_, ErrorCode>`;
/// asynchronous completions carry a `Result<(), ErrorCode>` to the client
/// callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Generic failure condition.
    FAIL = 1,
    /// Underlying system is busy; retry.
    BUSY = 2,
    /// The state requested is already set.
    ALREADY = 3,
    /// The component is powered down or not attached.
    OFF = 4,
    /// Reservation required before use.
    RESERVE = 5,
    /// An invalid parameter was passed.
    INVAL = 6,
    /// Parameter passed was too large.
    SIZE = 7,
    /// Operation canceled by a call.
    CANCEL = 8,
    /// Memory required not available.
    NOMEM = 9,
    /// Operation is not supported.
    NOSUPPORT = 10,
    /// Device is not available.
    NODEVICE = 11,
    /// Device is not physically installed.
    UNINSTALLED = 12,
    /// Packet transmission not acknowledged.
    NOACK = 13,
    /// A bounded wait exceeded its deadline.
    TIMEOUT = 14,
}

impl From<ErrorCode> for usize {
    fn from(err: ErrorCode) -> usize {
        err as usize
    }
}
