//! # Transport Stream primitives
//!
//! Byte-level writers and readers for the on-wire structures of ISO/IEC
//! 13818-1: 188-byte TS packets with adaptation fields, PES headers, PSI
//! sections with CRC-32/MPEG-2 sealing, and the RTP encapsulation header
//! of RFC 3550 used for TS-over-RTP (payload type 33).
//!
//! These are pure, stateless building blocks; all scheduling and repetition
//! logic lives in the `mux` module.
//!
//! ## Example Usage
//!
//! ### Building a TS packet
//!
//! ```rust
//! use tsmux::ts::{TsPacket, TS_PACKET_SIZE};
//!
//! let mut packet = TsPacket::init();
//! packet.set_pid(68);
//! packet.set_cc(5);
//! packet.set_unit_start();
//! packet.set_payload(&[0u8; 100]);
//! assert_eq!(packet.as_bytes().len(), TS_PACKET_SIZE);
//! assert_eq!(packet.as_bytes()[0], 0x47);
//! ```

/// CRC-32/MPEG-2 for PSI section sealing
pub mod crc;

/// 188-byte TS packet writer/reader
pub mod packet;

/// PES header serialization
pub mod pes;

/// PSI section framing, splitting limits and descriptors
pub mod psi;

/// RTP fixed-header encapsulation for TS groups
pub mod rtp;

/// Core TS constants: PIDs, table ids, stream types, clock rates
pub mod types;

// Re-export commonly used types and constants
pub use crc::Crc32Mpeg2;
pub use packet::TsPacket;
pub use pes::PesHeader;
pub use psi::Descriptor;
pub use types::{
    PID_NIT, PID_NULL, PID_PAT, PID_SDT, PID_TDT, TS_PACKET_SIZE,
};
