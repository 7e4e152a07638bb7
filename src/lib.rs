#![doc(html_root_url = "https://docs.rs/tsmux/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # tsmux - MPEG-2 Transport Stream multiplexer
//!
//! `tsmux` is a multiplexer for MPEG-2 Transport Streams (ISO/IEC 13818-1)
//! with optional DVB (EN 300 468) service information. It accepts elementary
//! stream access units (video frames, audio frames, subtitle pages), wraps
//! them into PES and 188-byte TS packets, generates and repeats PSI/SI
//! tables, inserts Program Clock References, and emits a single scheduled
//! transport stream, optionally RTP-encapsulated.
//!
//! ## Features
//!
//! ### Elementary stream packetizers
//! - MPEG-1/2 video, MPEG-4 Part 2 and H.264 video
//! - MPEG audio, ADTS AAC, AC-3, DTS
//! - DVB subtitles
//! - User-private encapsulation for non-standard video codecs
//!
//! ### Tables and timing
//! - PAT, PMT, SDT, NIT and TDT generation with periodic or
//!   random-access-point-anchored repetition
//! - T-STD-aware per-PID peak-rate shaping
//! - CBR, capped-VBR and VBR scheduling with bit-accurate pacing
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tsmux = "0.1.0"
//! ```
//!
//! ### Muxing an H.264 stream to a byte sink
//!
//! ```rust,no_run
//! use tsmux::{Block, MuxConfig, MuxOutput, StreamFormat, TsMux};
//!
//! struct Collect(Vec<u8>);
//! impl MuxOutput for Collect {
//!     fn send(&mut self, group: bytes::Bytes) {
//!         self.0.extend_from_slice(&group);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MuxConfig::default();
//! let mut mux = TsMux::new(config, Box::new(Collect(Vec::new())))?;
//!
//! let fmt = StreamFormat::video_h264(25, 1, 4_000_000);
//! let video = mux.add_input(&fmt)?;
//!
//! let frame = Block::new(vec![0u8; 1024])
//!     .with_dts(1_000_000)
//!     .with_pts(1_000_000)
//!     .key_frame();
//! mux.send(video, vec![frame])?;
//! mux.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - `av`: timed media blocks and elementary stream format descriptions
//! - `ts`: byte-level TS, PES, PSI and RTP primitives
//! - `mux`: the mux core, per-input packetizers and table generators
//! - `config`: stream-global and per-PID configuration
//! - `error`: error types and the crate `Result` alias
//! - `utils`: ISO-639 language codes and DVB text encoding

/// Timed media blocks and elementary stream formats
pub mod av;

/// Stream-global and per-PID configuration
pub mod config;

/// Error types and utilities
pub mod error;

/// Mux core, per-input packetizers and PSI/SI table generators
pub mod mux;

/// Byte-level TS, PES, PSI and RTP primitives
pub mod ts;

/// Language codes and DVB text encoding helpers
pub mod utils;

pub use av::{Block, BlockFlags, StreamFormat};
pub use config::MuxConfig;
pub use error::{MuxError, Result};
pub use mux::{InputHandle, MuxOutput, TsMux};
