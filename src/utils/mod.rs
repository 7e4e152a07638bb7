//! # Utility Functions and Types
//!
//! This module provides helpers shared by the packetizers and table
//! generators:
//!
//! - ISO-639 language code normalization (part 1 / 2B / 2T lookup)
//! - UTF-8 to DVB-coded text conversion (EN 300 468 annex A)
//!
//! ## Language Lookup
//!
//! ```rust
//! use tsmux::utils::lang;
//!
//! assert_eq!(lang::to_iso639_2t("fr"), Some(*b"fra"));
//! assert_eq!(lang::to_iso639_2t("fre"), Some(*b"fra"));
//! ```

/// DVB text encoding (EN 300 468 annex A)
pub mod charset;

/// ISO-639 language code tables
pub mod lang;

pub use charset::DvbCharset;
