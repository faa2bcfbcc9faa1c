//! Error types for sonotag.

use thiserror::Error;

/// Main error type for sonotag operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Relative block number outside the 0..=3 range of a sector.
    #[error("relative block {0} is out of range for a sector")]
    InvalidBlockNumber(u8),

    /// Attempted write to a sector trailer block.
    #[error("block {0} is a sector trailer")]
    TrailerBlockWrite(u8),

    /// Card authentication failed.
    #[error("authentication failed for block {0}")]
    AuthenticationFailure(u8),

    /// Card read failed after authentication.
    #[error("read failed for block {0}")]
    ReadFailure(u8),

    /// Card write failed after authentication.
    #[error("write failed for block {0}")]
    WriteFailure(u8),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration load/store error.
    #[error("config error: {0}")]
    Config(String),
}
