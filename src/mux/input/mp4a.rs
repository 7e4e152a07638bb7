//! MPEG-4 AAC input packetizer.
//!
//! Carries AAC as ADTS (stream type 0x0f), synthesizing the ADTS header
//! from the two leading bytes of the AudioSpecificConfig.

use log::{debug, warn};

use crate::av::{Block, CodecId, StreamFormat};
use crate::config::InputOptions;
use crate::error::{MuxError, Result};
use crate::ts::types::{PES_HEADER_SIZE_PTS, STREAM_ID_AUDIO_MPEG, STREAM_TYPE_ADTS_AAC};

use super::super::stream::TsBlock;
use super::audio::{self, AudioSys};
use super::{InputCodec, TsInput, TsParameters};

/// Size of an ADTS header without CRC
pub(crate) const ADTS_HEADER_SIZE: usize = 7;

/// AAC packetizer state: the shared audio state plus the ADTS template
#[derive(Debug, Default)]
pub(crate) struct Mp4aSys {
    pub audio: AudioSys,
    pub adts: [u8; ADTS_HEADER_SIZE],
}

fn adts_template(
    profile: u8,
    index: u8,
    channels: u8,
    fullness: u16,
) -> [u8; ADTS_HEADER_SIZE] {
    let mut adts = [0u8; ADTS_HEADER_SIZE];
    // syncword, MPEG-2 style ID, layer 0, no CRC
    adts[0] = 0xff;
    adts[1] = 0xf9;
    adts[2] = (profile << 6) | ((index & 0x0f) << 2) | ((channels >> 2) & 0x01);
    adts[3] = (channels & 0x03) << 6;
    adts[5] = ((fullness >> 6) & 0x1f) as u8;
    adts[6] = ((fullness & 0x3f) << 2) as u8;
    adts
}

fn adts_header(template: &[u8; ADTS_HEADER_SIZE], frame_size: usize) -> [u8; ADTS_HEADER_SIZE] {
    let length = frame_size + ADTS_HEADER_SIZE;
    let mut adts = *template;
    adts[3] |= ((length >> 11) & 0x03) as u8;
    adts[4] = (length >> 3) as u8;
    adts[5] |= ((length & 0x07) << 5) as u8;
    adts
}

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    _params: &TsParameters,
) -> Result<TsInput> {
    if fmt.codec != CodecId::Mp4a {
        return Err(MuxError::Unsupported("not AAC".to_string()));
    }

    let mut input = TsInput::new(fmt, opts, InputCodec::Mp4a(Mp4aSys::default()));
    input.stream_type = STREAM_TYPE_ADTS_AAC;
    audio::setup(&mut input, opts, STREAM_ID_AUDIO_MPEG, false);

    let extra = &input.fmt.extra;
    let mut adts = None;
    if extra.len() >= 2 {
        let index = ((extra[0] << 1) | (extra[1] >> 7)) & 0x0f;
        let profile = (extra[0] >> 3).wrapping_sub(1);

        if index != 0x0f || extra.len() >= 5 {
            let channels =
                (extra[if index == 0x0f { 4 } else { 1 }] >> 3) & 0x0f;
            // The fullness is fixed because no known implementation
            // computes it; spec-strict decoders can override it.
            adts = Some(adts_template(profile, index, channels, opts.adts_fullness));
        }
    }
    match adts {
        Some(template) => {
            if let InputCodec::Mp4a(sys) = &mut input.codec {
                sys.adts = template;
            }
        }
        None => warn!("not enough data for ADTS header"),
    }

    let (frames_per_pes, align) = {
        let sys = audio::sys_ref(&input);
        (sys.frames_per_pes, sys.align)
    };
    let frame_length = input.fmt.audio.map_or(0, |audio| audio.frame_length);
    if input.pack.total_bitrate == 0 && input.bitrate != 0 && frame_length != 0 {
        let rate = input.fmt.audio.map_or(0, |audio| audio.rate) as u64;
        // ADTS overhead per frame
        let es_bitrate = input.bitrate as u64
            + (ADTS_HEADER_SIZE as u64 * 8 * rate + frame_length as u64 - 1)
                / frame_length as u64;
        input.pack.total_bitrate = super::total_bitrate_overhead(
            es_bitrate as u32,
            PES_HEADER_SIZE_PTS,
            rate as u32,
            frame_length * frames_per_pes,
            align,
        );
    }
    super::derive_ts_delay(&mut input);

    debug!(
        "setting up mp4a/{} total {} bitrate {} frame {} {}",
        input.fmt.es_id,
        input.pack.total_bitrate,
        input.bitrate,
        frames_per_pes,
        if align { "aligned" } else { "unaligned" }
    );

    Ok(input)
}

pub(crate) fn send(input: &mut TsInput, frames: Vec<Block>) -> Vec<TsBlock> {
    let template = match &input.codec {
        InputCodec::Mp4a(sys) => sys.adts,
        _ => unreachable!("mp4a send on another packetizer"),
    };

    let frames = frames
        .into_iter()
        .map(|mut frame| {
            let header = adts_header(&template, frame.data.len());
            let mut data = Vec::with_capacity(ADTS_HEADER_SIZE + frame.data.len());
            data.extend_from_slice(&header);
            data.append(&mut frame.data);
            frame.data = data;
            frame
        })
        .collect();

    audio::send(input, frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> TsParameters {
        TsParameters {
            conformance: crate::config::Conformance::None,
            charset: crate::utils::charset::DvbCharset::default(),
            packet_interval: 2_000,
            max_prepare: 4_000,
        }
    }

    #[test]
    fn test_adts_from_audio_specific_config() {
        // AAC-LC (object type 2), 48 kHz (index 3), stereo:
        // 00010 0011 0010 000
        let asc = vec![0x11, 0x90];
        let fmt = StreamFormat::audio_aac(48_000, 128_000, asc);
        let input = open(&fmt, &InputOptions::default(), &params()).unwrap();

        let adts = match &input.codec {
            InputCodec::Mp4a(sys) => sys.adts,
            _ => unreachable!(),
        };
        assert_eq!(adts[0], 0xff);
        assert_eq!(adts[1], 0xf9);
        assert_eq!(adts[2] >> 6, 1); // profile = object type - 1
        assert_eq!((adts[2] >> 2) & 0x0f, 3); // sampling index
        assert_eq!(((adts[2] & 0x01) << 2) | (adts[3] >> 6), 2); // channels
        // default fullness 0x7ff
        assert_eq!(
            (((adts[5] & 0x1f) as u16) << 6) | ((adts[6] >> 2) as u16),
            0x7ff
        );
    }

    #[test]
    fn test_adts_length_field() {
        let template = adts_template(1, 3, 2, 0x7ff);
        let header = adts_header(&template, 1000);
        let length = (((header[3] & 0x03) as usize) << 11)
            | ((header[4] as usize) << 3)
            | ((header[5] >> 5) as usize);
        assert_eq!(length, 1007);
    }

    #[test]
    fn test_send_prepends_adts() {
        let asc = vec![0x11, 0x90];
        let fmt = StreamFormat::audio_aac(48_000, 128_000, asc);
        let opts = InputOptions {
            frames_per_pes: 1,
            ..InputOptions::default()
        };
        let mut input = open(&fmt, &opts, &params()).unwrap();
        input.pack.pid = 257;

        let frame = |index: i64| {
            Block::new(vec![0u8; 300])
                .with_dts(1_000_000 + index * 21_333)
                .with_pts(1_000_000 + index * 21_333)
        };
        assert!(send(&mut input, vec![frame(0)]).is_empty());
        let out = send(&mut input, vec![frame(1)]);
        assert!(!out.is_empty());

        // PES payload starts with the PES header then the ADTS syncword
        let offset = out[0].packet.payload_offset();
        let bytes = &out[0].packet.as_bytes()[offset..];
        assert_eq!(&bytes[0..3], &[0, 0, 1]);
        assert_eq!(bytes[PES_HEADER_SIZE_PTS], 0xff);
        assert_eq!(bytes[PES_HEADER_SIZE_PTS + 1], 0xf9);
    }
}
