//! Line-level faults.
//!
//! Only errors of this type escape the worker loop. Everything that happens
//! inside a single transaction is logged and turned into a soft failure.

/// Represents a fault of the serial line itself.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `std::io::Error`.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Wraps `tokio_serial::Error`, raised when the port cannot be opened or configured.
    #[error(transparent)]
    Serial(#[from] tokio_serial::Error),

    /// The line was used before it was opened.
    #[error("Serial line {0} is not connected")]
    NotConnected(String),
}

/// The result type for line operations.
pub type Result<T> = std::result::Result<T, Error>;
