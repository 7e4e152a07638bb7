//! # Multiplexer configuration
//!
//! Stream-global options consumed once when the mux is opened, plus the
//! option-chain grammar used to address individual inputs and tables:
//!
//! - `inputs`: per-ES option overlay, e.g.
//!   `68{lang=fra}:video{pid=68}:mpga{align}` (first match wins; an entry
//!   is matched by ES id, by fourcc, or by category)
//! - `tables`: `auto`, or an explicit chain such as
//!   `pat:pmt{rap-advance=6}:nit:sdt{services=My TV/ACME/1}`
//!
//! ## Example Usage
//!
//! ```rust
//! use tsmux::config::{MuxConfig, MuxMode, Conformance};
//!
//! let mut config = MuxConfig::default();
//! config.conformance = Conformance::Dvb;
//! config.muxmode = MuxMode::Cbr;
//! config.muxrate = 6_000_000;
//! config.tables = "pat:pmt:nit:sdt".to_string();
//! ```

use crate::av::{StreamCategory, StreamFormat};
use crate::error::{MuxError, Result};

/// Conformance level applied to stream types, descriptors and repetition
/// rate checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conformance {
    /// No conformance checking
    #[default]
    None,
    /// Plain ISO/IEC 13818-1
    Iso,
    /// ATSC (System A)
    Atsc,
    /// DVB (System B, EN 300 468)
    Dvb,
    /// Blu-ray HDMV
    Hdmv,
}

impl Conformance {
    /// Parses a conformance name; unknown names warn and yield `None`
    pub fn parse(name: &str) -> Self {
        match name {
            "" | "none" => Conformance::None,
            "iso" => Conformance::Iso,
            "atsc" => Conformance::Atsc,
            "dvb" => Conformance::Dvb,
            "hdmv" => Conformance::Hdmv,
            other => {
                log::warn!("invalid conformance {}", other);
                Conformance::None
            }
        }
    }

    /// Display name, mirroring the accepted option values
    pub fn name(&self) -> &'static str {
        match self {
            Conformance::None => "none",
            Conformance::Iso => "iso",
            Conformance::Atsc => "atsc",
            Conformance::Dvb => "dvb",
            Conformance::Hdmv => "hdmv",
        }
    }
}

/// Output scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxMode {
    /// Choose per stream: VBR when any input lacks a declared bitrate,
    /// capped VBR otherwise
    #[default]
    Auto,
    /// Variable bitrate, no padding
    Vbr,
    /// Constant bitrate, padded with null packets
    Cbr,
    /// Capped VBR: never exceeds the mux rate but stalls instead of padding
    Capped,
}

impl MuxMode {
    /// Parses a mux mode name; unknown names warn and yield `Auto`
    pub fn parse(name: &str) -> Self {
        match name {
            "" | "auto" => MuxMode::Auto,
            "vbr" => MuxMode::Vbr,
            "cbr" => MuxMode::Cbr,
            "capped-vbr" => MuxMode::Capped,
            other => {
                log::warn!("invalid muxmode {}", other);
                MuxMode::Auto
            }
        }
    }
}

/// Stream-global multiplexer configuration
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Conformance level
    pub conformance: Conformance,
    /// Charset used for SI text fields (default `ISO_8859-1`)
    pub charset: String,
    /// Reuse the caller-side ES id as PID when no PID is configured
    pub es_id_pid: bool,
    /// First dynamically assigned PID
    pub dynamic_pid: u16,
    /// Elect a single PCR PID automatically
    pub auto_pcr: bool,
    /// Default PCR period in milliseconds for the elected PID
    pub pcr_period_ms: u32,
    /// Per-input option overlay chain
    pub inputs: String,
    /// Table chain: `auto` or `pat:pmt[:nit:sdt:tdt]` with options
    pub tables: String,
    /// In automatic tables mode, add the mandatory but mostly unused
    /// conformance tables (NIT, SDT, TDT for DVB)
    pub conformance_tables: bool,
    /// Transport stream ID (-1 picks a random one)
    pub tsid: i32,
    /// Network ID / original network ID
    pub nid: u16,
    /// Scheduling mode
    pub muxmode: MuxMode,
    /// Constant or capped bitrate in bits per second (0 = automatic)
    pub muxrate: u32,
    /// Extra padding bitrate provisioned in automatic rate mode, bits/s
    pub padding_bitrate: u32,
    /// Drop packets that are late compared to the output time
    pub drop_late: bool,
    /// Temporarily burst when there are late packets
    pub burst_late: bool,
    /// Number of TS packets output at once (0 = 7 synchronous,
    /// 1 asynchronous)
    pub granularity: u32,
    /// Asynchronous-mode buffering between input and output, milliseconds
    pub async_delay_ms: u32,
    /// Wall-clock paced operation on a dedicated mux thread
    pub sync: bool,
    /// Prepend an RTP header to each packet group
    pub rtp: bool,
    /// RTP synchronization source as a dotted quad (empty = random)
    pub ssrc: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            conformance: Conformance::None,
            charset: "ISO_8859-1".to_string(),
            es_id_pid: false,
            dynamic_pid: 66,
            auto_pcr: true,
            pcr_period_ms: 70,
            inputs: String::new(),
            tables: "auto".to_string(),
            conformance_tables: false,
            tsid: -1,
            nid: 0xffff,
            muxmode: MuxMode::Auto,
            muxrate: 0,
            padding_bitrate: 0,
            drop_late: false,
            burst_late: false,
            granularity: 0,
            async_delay_ms: 1000,
            sync: false,
            rtp: false,
            ssrc: String::new(),
        }
    }
}

/// Parses a dotted-quad SSRC option value
pub fn parse_ssrc(value: &str) -> Option<[u8; 4]> {
    let mut bytes = [0u8; 4];
    let mut parts = value.split('.');
    for byte in &mut bytes {
        *byte = parts.next()?.parse().ok()?;
    }
    parts.next().is_none().then_some(bytes)
}

/// A parsed `{key=value,...}` option bag
#[derive(Debug, Clone, Default)]
pub struct OptionMap {
    entries: Vec<(String, Option<String>)>,
}

impl OptionMap {
    /// Returns the raw string value of `key`, if present
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Returns an integer value of `key`, if present and well-formed
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Returns a boolean: a bare key counts as true
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| {
            match v.as_deref() {
                None | Some("true") | Some("1") => true,
                _ => false,
            }
        })
    }

    /// Returns true when no options were given
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One `name{options}` element of an option chain
#[derive(Debug, Clone)]
pub struct ChainEntry {
    /// Entry name (table name, or input selector)
    pub name: String,
    /// Options attached to the entry
    pub options: OptionMap,
}

/// Parses an option chain `name{k=v,...}:name2:...`
///
/// Braces do not nest; an empty string yields an empty chain.
pub fn parse_chain(chain: &str) -> Result<Vec<ChainEntry>> {
    let mut entries = Vec::new();
    let mut rest = chain.trim();

    while !rest.is_empty() {
        let (name, options, tail) = match rest.find(&['{', ':'][..]) {
            Some(pos) if rest.as_bytes()[pos] == b'{' => {
                let name = &rest[..pos];
                let close = rest[pos..]
                    .find('}')
                    .map(|c| pos + c)
                    .ok_or_else(|| MuxError::Parser(format!("unclosed option block in {}", chain)))?;
                let options = parse_options(&rest[pos + 1..close])?;
                let tail = rest[close + 1..].strip_prefix(':').unwrap_or(&rest[close + 1..]);
                (name, options, tail)
            }
            Some(pos) => (&rest[..pos], OptionMap::default(), &rest[pos + 1..]),
            None => (rest, OptionMap::default(), ""),
        };

        if !name.is_empty() {
            entries.push(ChainEntry {
                name: name.to_string(),
                options,
            });
        }
        rest = tail;
    }

    Ok(entries)
}

fn parse_options(body: &str) -> Result<OptionMap> {
    let mut map = OptionMap::default();
    for item in body.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('=') {
            Some((key, value)) => map
                .entries
                .push((key.trim().to_string(), Some(value.trim().to_string()))),
            None => map.entries.push((item.to_string(), None)),
        }
    }
    Ok(map)
}

/// Matches an input overlay entry name against a stream format: an ES id,
/// a 3- or 4-character fourcc, or a category keyword
pub fn input_matches(fmt: &StreamFormat, name: &str) -> bool {
    if let Ok(id) = name.parse::<i32>() {
        return id == fmt.es_id;
    }

    if name.len() == 3 || name.len() == 4 {
        let mut fourcc = [b' '; 4];
        fourcc[..name.len()].copy_from_slice(name.as_bytes());
        if fourcc == fmt.codec.fourcc() {
            return true;
        }
    }

    match name {
        "video" => fmt.codec.category() == StreamCategory::Video,
        "audio" => fmt.codec.category() == StreamCategory::Audio,
        "spu" => fmt.codec.category() == StreamCategory::Subtitle,
        _ => false,
    }
}

/// Per-input options common to every packetizer subtype
#[derive(Debug, Clone)]
pub struct InputOptions {
    /// Configured PID (0x1fff = assign dynamically)
    pub pid: u16,
    /// Total bitrate including PES and TS overhead, bits/s (0 = derive)
    pub total_bitrate: u32,
    /// PCR period in milliseconds (0 = not a PCR carrier unless elected)
    pub pcr_period_ms: u32,
    /// Declared ES bitrate in bits/s (0 = take it from the format)
    pub bitrate: u32,
    /// Language override
    pub lang: Option<String>,
    /// Frame alignment override (packetizers pick their own default)
    pub align: Option<bool>,
    /// Audio frames coalesced per PES
    pub frames_per_pes: u32,
    /// ISO-639 descriptor audio type (0 unknown, 1 clean effects,
    /// 2 hearing impaired, 3 visual impaired commentary)
    pub audio_type: u8,
    /// ADTS buffer fullness field written by the AAC packetizer
    pub adts_fullness: u16,
    /// DVB subtitling languages, `page=lang[/type],...`
    pub sub_langs: Option<String>,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            pid: 0x1fff,
            total_bitrate: 0,
            pcr_period_ms: 0,
            bitrate: 0,
            lang: None,
            align: None,
            frames_per_pes: 6,
            audio_type: 0,
            adts_fullness: 0x7ff,
            sub_langs: None,
        }
    }
}

impl InputOptions {
    /// Builds input options from a parsed option bag
    pub fn from_options(options: &OptionMap) -> Self {
        let mut opts = Self::default();
        if let Some(pid) = options.get_int("pid") {
            opts.pid = pid as u16;
        }
        if let Some(rate) = options.get_int("total-bitrate") {
            opts.total_bitrate = rate as u32;
        }
        if let Some(pcr) = options.get_int("pcr") {
            opts.pcr_period_ms = pcr as u32;
        }
        if let Some(rate) = options.get_int("bitrate") {
            opts.bitrate = rate as u32;
        }
        if let Some(lang) = options.get("lang") {
            opts.lang = Some(lang.to_string());
            opts.sub_langs = Some(lang.to_string());
        }
        if let Some(align) = options.get_bool("align") {
            opts.align = Some(align);
        }
        if let Some(frames) = options.get_int("frames-per-pes") {
            opts.frames_per_pes = frames.max(1) as u32;
        }
        if let Some(audio_type) = options.get_int("audio-type") {
            opts.audio_type = audio_type as u8;
        }
        if let Some(fullness) = options.get_int("adts-fullness") {
            opts.adts_fullness = fullness as u16;
        }
        opts
    }
}

/// Per-table repetition options common to every table
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Configured PID (0x1fff = the table's well-known or a dynamic PID)
    pub pid: u16,
    /// Total bitrate override, bits/s
    pub total_bitrate: u32,
    /// Interval between sections, milliseconds
    pub interval_ms: u32,
    /// Interval between TS packets of one section, milliseconds
    pub ts_interval_ms: u32,
    /// Repetition period, milliseconds
    pub period_ms: u32,
    /// Periodic-mode offset, milliseconds
    pub offset_ms: u32,
    /// RAP anchoring advance in milliseconds (-1 = periodic mode)
    pub rap_advance_ms: i32,
    /// Minimum period in RAP mode, milliseconds
    pub rap_min_period_ms: u32,
    /// Maximum period in RAP mode, milliseconds
    pub rap_max_period_ms: u32,
    /// Table-specific options (programs, services, versions, ...)
    pub extra: OptionMap,
}

impl TableOptions {
    /// Builds table options from a parsed option bag, with per-table
    /// defaults for PID, period, max period and offset
    pub fn from_options(
        options: &OptionMap,
        default_pid: u16,
        default_period_ms: u32,
        default_max_period_ms: u32,
        default_offset_ms: u32,
    ) -> Self {
        Self {
            pid: options.get_int("pid").map(|v| v as u16).unwrap_or(default_pid),
            total_bitrate: options.get_int("total-bitrate").unwrap_or(0) as u32,
            interval_ms: options.get_int("interval").unwrap_or(30) as u32,
            ts_interval_ms: options.get_int("ts-interval").unwrap_or(20) as u32,
            period_ms: options.get_int("period").unwrap_or(default_period_ms as i64) as u32,
            offset_ms: options.get_int("offset").unwrap_or(default_offset_ms as i64) as u32,
            rap_advance_ms: options.get_int("rap-advance").unwrap_or(-1) as i32,
            rap_min_period_ms: options.get_int("rap-min-period").unwrap_or(200) as u32,
            rap_max_period_ms: options
                .get_int("rap-max-period")
                .unwrap_or(default_max_period_ms as i64) as u32,
            extra: options.clone(),
        }
    }
}
