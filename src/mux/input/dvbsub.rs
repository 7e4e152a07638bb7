//! DVB subtitles input packetizer (EN 300 743 encapsulation).

use bytes::BytesMut;
use log::{debug, warn};

use crate::av::{Block, BlockFlags, CodecId, StreamFormat};
use crate::config::{Conformance, InputOptions};
use crate::error::{MuxError, Result};
use crate::ts::pes::{self, PesHeader};
use crate::ts::types::{DESC_TAG_SUBTITLING, STREAM_ID_PRIVATE_1, STREAM_TYPE_PRIVATE_PES};

use super::super::stream::TsBlock;
use super::{InputCodec, PesFrame, TsInput, TsParameters};

/// T-STD buffer for subtitle PES data, bytes
const T_STD_BUFFER: i64 = 24576;
/// T-STD peak rate for a subtitling PID, bits/s
const T_STD_PEAK_RATE: u32 = 192_000;
const T_STD_MAX_RETENTION: i64 = 200_000;
const DEFAULT_DELAY: i64 = 200_000;

/// DVB subtitles packetizer state
#[derive(Debug, Default)]
pub(crate) struct DvbSubSys {
    pub first: bool,
}

// One `page=lang[/type]` entry of the subtitling configuration.
fn parse_lang_entry(entry: &str) -> Option<([u8; 3], u16, u16, u8)> {
    let (page, rest) = entry.split_once('=')?;
    let page: u32 = page.trim().parse().ok()?;
    let (lang, subtitling_type) = match rest.split_once('/') {
        Some((lang, ty)) => (lang, ty.trim().parse().ok()?),
        // DVB-subtitles (normal) with no AR criticality
        None => (rest, 0x10),
    };
    let lang = lang.trim().as_bytes();
    if lang.len() < 3 {
        return None;
    }
    Some((
        [lang[0], lang[1], lang[2]],
        (page & 0xffff) as u16,
        (page >> 16) as u16,
        subtitling_type,
    ))
}

fn build_subtitling_descriptor(config: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    for entry in config.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match parse_lang_entry(entry) {
            Some((lang, composition, ancillary, subtitling_type)) => {
                payload.extend_from_slice(&lang);
                payload.push(subtitling_type);
                payload.extend_from_slice(&composition.to_be_bytes());
                payload.extend_from_slice(&ancillary.to_be_bytes());
            }
            None => warn!("invalid subtitling language {}", entry),
        }
    }

    let mut descriptor = Vec::with_capacity(2 + payload.len());
    descriptor.push(DESC_TAG_SUBTITLING);
    descriptor.push(payload.len() as u8);
    descriptor.extend_from_slice(&payload);
    descriptor
}

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    params: &TsParameters,
) -> Result<TsInput> {
    if fmt.codec != CodecId::DvbSub {
        return Err(MuxError::Unsupported("not DVB subtitles".to_string()));
    }

    if params.conformance != Conformance::Dvb {
        warn!("DVB sub encapsulation requires DVB conformance");
    }

    let mut input = TsInput::new(fmt, opts, InputCodec::DvbSub(DvbSubSys { first: true }));
    input.stream_type = STREAM_TYPE_PRIVATE_PES;

    let configured = opts.sub_langs.as_deref().unwrap_or("");
    if !configured.is_empty() || fmt.extra.is_empty() {
        input.descriptors = build_subtitling_descriptor(configured);
    } else {
        let mut descriptor = Vec::with_capacity(2 + fmt.extra.len());
        descriptor.push(DESC_TAG_SUBTITLING);
        descriptor.push(fmt.extra.len() as u8);
        descriptor.extend_from_slice(&fmt.extra);
        input.descriptors = descriptor;
    }

    input.pack.peak_bitrate = T_STD_PEAK_RATE;
    if input.pack.total_bitrate == 0 {
        input.pack.total_bitrate = T_STD_PEAK_RATE;
    }

    // The T-STD TS buffer delay would violate the retention constraint
    // for subtitles, so the PID is not CBR-shaped.
    input.pack.ts_delay = 0;

    debug!(
        "setting up dvbs/{} total {} bitrate {}",
        input.fmt.es_id, input.pack.total_bitrate, input.bitrate
    );

    Ok(input)
}

fn set_pes_header(frame: &Block) -> Vec<u8> {
    let mut header =
        PesHeader::new(STREAM_ID_PRIVATE_1).with_pts((frame.pts.unwrap_or(0) * 9 / 100) as u64);
    header.data_alignment = true;

    let mut buf = BytesMut::with_capacity(header.len() + frame.data.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&frame.data);

    let mut data = buf.to_vec();
    let total = data.len();
    pes::patch_length(&mut data, total);
    data
}

pub(crate) fn send(input: &mut TsInput, frames: Vec<Block>) -> Vec<TsBlock> {
    let first = match &mut input.codec {
        InputCodec::DvbSub(sys) => {
            let first = sys.first;
            sys.first = false;
            first
        }
        _ => unreachable!("dvbsub send on another packetizer"),
    };

    let mut frames = frames;
    if first {
        if let Some(head) = frames.first_mut() {
            head.flags.insert(BlockFlags::DISCONTINUITY);
        }
    }

    let mut out = Vec::new();
    for frame in frames {
        let delay = if input.bitrate != 0 {
            (T_STD_BUFFER - frame.data.len() as i64) * 8_000_000 / input.bitrate as i64
        } else {
            DEFAULT_DELAY
        };
        let pes = PesFrame {
            data: set_pes_header(&frame),
            dts: frame.dts.unwrap_or(0),
            delay: delay.min(T_STD_MAX_RETENTION),
            flags: frame.flags,
        };
        super::check_muxing(input, &pes);
        out.extend(super::build_ts(input, &pes));
    }
    out
}
