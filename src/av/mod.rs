//! # Audio/Video Core Types
//!
//! This module provides the core types for feeding media into the
//! multiplexer:
//!
//! - `Block`: one timed access unit (a coded picture, an audio frame, a
//!   subtitle page) with decode/presentation timestamps and flags
//! - `StreamFormat`: the elementary stream description used to select and
//!   configure a packetizer
//!
//! ## Example Usage
//!
//! ```rust
//! use tsmux::av::{Block, StreamFormat};
//!
//! let fmt = StreamFormat::audio_mp2(48_000, 1152, 192_000);
//! let frame = Block::new(vec![0u8; 576])
//!     .with_dts(20_000)
//!     .with_pts(20_000);
//! assert!(fmt.audio.is_some());
//! assert_eq!(frame.dts, Some(20_000));
//! ```

/// Timed media blocks
pub mod block;

/// Elementary stream format descriptions
pub mod format;

pub use block::{Block, BlockFlags};
pub use format::{AudioParams, CodecId, StreamCategory, StreamFormat, VideoParams};
