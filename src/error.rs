use std::fmt;

/// Errors surfaced across the storage kernel.
///
/// There are three kinds, matching the error surface described for the
/// kernel: capacity (`BufferFull`), concurrency (`TxnAbort`), and I/O or
/// precondition failures (`Io`/`Precondition`). None of these are used for
/// routine control flow via panics -- every fallible operation returns a
/// `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No free frame was available and the requested page is not resident.
    BufferFull,

    /// A deadlock was detected, or a lock wait timed out. The caller must
    /// call `transaction_abort` and may retry with a fresh transaction id.
    TxnAbort,

    /// A generic I/O failure from the file abstraction.
    Io(String),

    /// A precondition was violated (read past EOF, write to a read-only
    /// file, a short input file, etc).
    Precondition(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BufferFull => write!(f, "buffer pool is full"),
            Error::TxnAbort => write!(f, "transaction aborted (deadlock or lock timeout)"),
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Precondition(msg) => write!(f, "precondition violated: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_distinguishable() {
        assert_ne!(Error::BufferFull.to_string(), Error::TxnAbort.to_string());
        assert!(Error::Io("short read".into()).to_string().contains("short read"));
    }
}
