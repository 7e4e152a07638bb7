//! DVB text encoding.
//!
//! Text fields of DVB SI tables (service names, provider names, network
//! names) carry a character-table selector defined in EN 300 468 annex A.
//! The multiplexer takes UTF-8 from the caller and converts it to the
//! configured single-byte table, falling back to raw UTF-8 with its own
//! selector when the configured charset cannot represent the text.

use log::warn;

/// Converter from UTF-8 strings to DVB-coded byte strings
#[derive(Debug, Clone)]
pub struct DvbCharset {
    name: String,
    selector: &'static [u8],
    latin_offset: Option<u32>,
}

// EN 300 468 annex A, table A.3: 0x10 0x00 NN selects ISO/IEC 8859-NN.
const ISO8859_TABLES: &[(&str, u8)] = &[
    ("ISO_8859-1", 1),
    ("ISO_8859-2", 2),
    ("ISO_8859-3", 3),
    ("ISO_8859-4", 4),
    ("ISO_8859-5", 5),
    ("ISO_8859-7", 7),
    ("ISO_8859-9", 9),
    ("ISO_8859-13", 13),
    ("ISO_8859-15", 15),
];

static SELECTORS: [[u8; 3]; 15] = [
    [0x10, 0x00, 1], [0x10, 0x00, 2], [0x10, 0x00, 3], [0x10, 0x00, 4],
    [0x10, 0x00, 5], [0x10, 0x00, 6], [0x10, 0x00, 7], [0x10, 0x00, 8],
    [0x10, 0x00, 9], [0x10, 0x00, 10], [0x10, 0x00, 11], [0x10, 0x00, 12],
    [0x10, 0x00, 13], [0x10, 0x00, 14], [0x10, 0x00, 15],
];

impl DvbCharset {
    /// Creates a converter for the given charset name.
    ///
    /// Supported: `ISO 6937` (the DVB default table, no selector),
    /// the `ISO_8859-N` family and `UTF-8`. Unknown names warn and fall
    /// back to UTF-8 coding.
    pub fn new(name: &str) -> Self {
        if name.eq_ignore_ascii_case("ISO 6937") || name.eq_ignore_ascii_case("ISO6937") {
            return Self {
                name: name.to_string(),
                selector: &[],
                latin_offset: None,
            };
        }
        if name.eq_ignore_ascii_case("UTF-8") {
            return Self {
                name: name.to_string(),
                selector: &[0x15],
                latin_offset: None,
            };
        }
        for &(table_name, table) in ISO8859_TABLES {
            if name.eq_ignore_ascii_case(table_name) {
                return Self {
                    name: name.to_string(),
                    selector: &SELECTORS[(table - 1) as usize],
                    // only the Latin-1 table maps 1:1 from Unicode
                    latin_offset: (table == 1).then_some(0x100),
                };
            }
        }
        warn!("unknown charset {}, using UTF-8", name);
        Self {
            name: name.to_string(),
            selector: &[0x15],
            latin_offset: None,
        }
    }

    /// The configured charset name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Converts a UTF-8 string to the DVB-coded form, selector included.
    ///
    /// For the ISO 8859-1 table, code points above U+00FF become '?'. For
    /// the other single-byte tables only ASCII is mapped and the rest
    /// becomes '?' as well; callers needing full coverage should configure
    /// UTF-8.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.selector.len() + text.len());
        out.extend_from_slice(self.selector);

        if self.selector == [0x15] {
            out.extend_from_slice(text.as_bytes());
            return out;
        }

        for ch in text.chars() {
            let code = ch as u32;
            let byte = if code < 0x80 {
                code as u8
            } else if self.latin_offset.is_some() && code < 0x100 {
                code as u8
            } else {
                b'?'
            };
            out.push(byte);
        }
        out
    }
}

impl Default for DvbCharset {
    fn default() -> Self {
        Self::new("ISO_8859-1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_latin1_selector_and_mapping() {
        let charset = DvbCharset::new("ISO_8859-1");
        let coded = charset.encode("café");
        assert_eq!(&coded[..3], &[0x10, 0x00, 0x01]);
        assert_eq!(&coded[3..], &[b'c', b'a', b'f', 0xe9]);
    }

    #[test]
    fn test_latin1_unmappable() {
        let charset = DvbCharset::new("ISO_8859-1");
        let coded = charset.encode("中");
        assert_eq!(coded[3], b'?');
    }

    #[test]
    fn test_utf8_passthrough() {
        let charset = DvbCharset::new("UTF-8");
        let coded = charset.encode("aé");
        assert_eq!(coded[0], 0x15);
        assert_eq!(&coded[1..], "aé".as_bytes());
    }

    #[test]
    fn test_default_table_no_selector() {
        let charset = DvbCharset::new("ISO 6937");
        let coded = charset.encode("abc");
        assert_eq!(coded, b"abc".to_vec());
    }
}
