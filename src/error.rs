use std::time::SystemTimeError;

use thiserror::Error;

/// The `Error` type for all store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("An IO error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// SystemTime error.
    #[error("A system time error occurred: {0}")]
    SystemTime(#[from] SystemTimeError),

    /// Key not found error.
    #[error("Key not found")]
    KeyNotFound,

    /// The store directory is locked by another live instance.
    #[error("Store is already open")]
    AlreadyOpen,

    /// A mutating operation was called on a read-only store.
    #[error("Store is read-only")]
    ReadOnly,

    /// An operation was called on a closed store.
    #[error("Store is closed")]
    Closed,

    /// Keys must be non-empty.
    #[error("Key is empty")]
    EmptyKey,

    /// Key exceeds the maximum encodable size.
    #[error("Key of {0} bytes exceeds the maximum of 65535")]
    KeyTooLarge(usize),

    /// Value exceeds the maximum encodable size.
    #[error("Value of {0} bytes exceeds the maximum of 4294967294")]
    ValueTooLarge(usize),

    /// On-disk data failed an integrity check.
    #[error("Data corruption detected: {0}")]
    Corruption(String),
}

/// The `Result` type for all store operations.
pub type Result<T> = std::result::Result<T, Error>;
