//! # Error Types
//!
//! This module provides the error types used throughout the tsmux library.
//! It defines a central error type `MuxError` that encapsulates all possible
//! errors that can occur while configuring and running the multiplexer.
//!
//! ## Example Usage
//!
//! ```rust
//! use tsmux::error::{MuxError, Result};
//!
//! fn check_pid(pid: u16) -> Result<()> {
//!     if pid >= 0x1fff {
//!         return Err(MuxError::Config(format!("reserved PID {}", pid)));
//!     }
//!     Ok(())
//! }
//! ```

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the tsmux library
#[derive(Error, Debug)]
pub enum MuxError {
    /// I/O errors surfaced by a downstream sink
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid multiplexer or packetizer configuration, detected at open time
    #[error("config error: {0}")]
    Config(String),

    /// The elementary stream format is not handled by this packetizer.
    ///
    /// The registry treats this as "try another packetizer subtype" before
    /// giving up on the input.
    #[error("unsupported codec: {0}")]
    Unsupported(String),

    /// Errors that occur during parsing of option strings
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Errors that occur during integer parsing
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// A specialized Result type for tsmux operations.
///
/// This type is used throughout the tsmux library to handle operations
/// that can produce a `MuxError`.
///
/// ## Example
///
/// ```rust
/// use tsmux::error::{MuxError, Result};
///
/// fn parse_program(s: &str) -> Result<u16> {
///     s.parse::<u16>().map_err(MuxError::from)
/// }
/// ```
pub type Result<T> = std::result::Result<T, MuxError>;
