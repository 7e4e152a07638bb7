//! ISO-639 language code tables.
//!
//! The multiplexer accepts 2-letter (part 1) and 3-letter (part 2B or 2T)
//! codes and always emits the terminology (2T) form in ISO-639 language
//! descriptors, as DVB receivers expect.

struct LangEntry {
    iso1: &'static [u8; 2],
    iso2b: &'static [u8; 3],
    iso2t: &'static [u8; 3],
}

// The part-2B column differs from 2T only for a handful of languages;
// the table keeps both so either spelling resolves.
static LANGUAGES: &[LangEntry] = &[
    LangEntry { iso1: b"ar", iso2b: b"ara", iso2t: b"ara" },
    LangEntry { iso1: b"cs", iso2b: b"cze", iso2t: b"ces" },
    LangEntry { iso1: b"da", iso2b: b"dan", iso2t: b"dan" },
    LangEntry { iso1: b"de", iso2b: b"ger", iso2t: b"deu" },
    LangEntry { iso1: b"el", iso2b: b"gre", iso2t: b"ell" },
    LangEntry { iso1: b"en", iso2b: b"eng", iso2t: b"eng" },
    LangEntry { iso1: b"es", iso2b: b"spa", iso2t: b"spa" },
    LangEntry { iso1: b"et", iso2b: b"est", iso2t: b"est" },
    LangEntry { iso1: b"fi", iso2b: b"fin", iso2t: b"fin" },
    LangEntry { iso1: b"fr", iso2b: b"fre", iso2t: b"fra" },
    LangEntry { iso1: b"he", iso2b: b"heb", iso2t: b"heb" },
    LangEntry { iso1: b"hi", iso2b: b"hin", iso2t: b"hin" },
    LangEntry { iso1: b"hr", iso2b: b"scr", iso2t: b"hrv" },
    LangEntry { iso1: b"hu", iso2b: b"hun", iso2t: b"hun" },
    LangEntry { iso1: b"is", iso2b: b"ice", iso2t: b"isl" },
    LangEntry { iso1: b"it", iso2b: b"ita", iso2t: b"ita" },
    LangEntry { iso1: b"ja", iso2b: b"jpn", iso2t: b"jpn" },
    LangEntry { iso1: b"ko", iso2b: b"kor", iso2t: b"kor" },
    LangEntry { iso1: b"lt", iso2b: b"lit", iso2t: b"lit" },
    LangEntry { iso1: b"lv", iso2b: b"lav", iso2t: b"lav" },
    LangEntry { iso1: b"nl", iso2b: b"dut", iso2t: b"nld" },
    LangEntry { iso1: b"no", iso2b: b"nor", iso2t: b"nor" },
    LangEntry { iso1: b"pl", iso2b: b"pol", iso2t: b"pol" },
    LangEntry { iso1: b"pt", iso2b: b"por", iso2t: b"por" },
    LangEntry { iso1: b"ro", iso2b: b"rum", iso2t: b"ron" },
    LangEntry { iso1: b"ru", iso2b: b"rus", iso2t: b"rus" },
    LangEntry { iso1: b"sk", iso2b: b"slo", iso2t: b"slk" },
    LangEntry { iso1: b"sl", iso2b: b"slv", iso2t: b"slv" },
    LangEntry { iso1: b"sr", iso2b: b"scc", iso2t: b"srp" },
    LangEntry { iso1: b"sv", iso2b: b"swe", iso2t: b"swe" },
    LangEntry { iso1: b"th", iso2b: b"tha", iso2t: b"tha" },
    LangEntry { iso1: b"tr", iso2b: b"tur", iso2t: b"tur" },
    LangEntry { iso1: b"uk", iso2b: b"ukr", iso2t: b"ukr" },
    LangEntry { iso1: b"vi", iso2b: b"vie", iso2t: b"vie" },
    LangEntry { iso1: b"zh", iso2b: b"chi", iso2t: b"zho" },
];

/// Resolves a 2-letter (part 1) or 3-letter (part 2B or 2T) language code
/// to the 3-letter terminology (2T) code.
///
/// Returns None for unknown codes; the caller keeps whatever 3-letter
/// string it already had in that case.
pub fn to_iso639_2t(code: &str) -> Option<[u8; 3]> {
    let code = code.as_bytes();
    match code.len() {
        2 => LANGUAGES
            .iter()
            .find(|entry| entry.iso1.eq_ignore_ascii_case(code))
            .map(|entry| *entry.iso2t),
        3 => LANGUAGES
            .iter()
            .find(|entry| {
                entry.iso2b.eq_ignore_ascii_case(code)
                    || entry.iso2t.eq_ignore_ascii_case(code)
            })
            .map(|entry| *entry.iso2t),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part1_lookup() {
        assert_eq!(to_iso639_2t("en"), Some(*b"eng"));
        assert_eq!(to_iso639_2t("de"), Some(*b"deu"));
    }

    #[test]
    fn test_bibliographic_normalized_to_terminology() {
        assert_eq!(to_iso639_2t("fre"), Some(*b"fra"));
        assert_eq!(to_iso639_2t("ger"), Some(*b"deu"));
        assert_eq!(to_iso639_2t("deu"), Some(*b"deu"));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(to_iso639_2t("xx"), None);
        assert_eq!(to_iso639_2t("q"), None);
        assert_eq!(to_iso639_2t("lingua"), None);
    }
}
