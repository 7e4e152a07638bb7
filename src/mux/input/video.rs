//! MPEG video input packetizer: MPEG-1/2, MPEG-4 Part 2 and H.264.
//!
//! Buffers one frame so the tail of the previous PES can overlap into the
//! next one, elects I-frames as random access points, and forces a PCR on
//! every I-frame when the input carries the program clock.

use bytes::BytesMut;
use log::{debug, error};

use crate::av::{Block, BlockFlags, CodecId, StreamFormat};
use crate::config::InputOptions;
use crate::error::{MuxError, Result};
use crate::ts::pes::{self, PesHeader};
use crate::ts::types::{
    PES_HEADER_SIZE_PTSDTS, STREAM_ID_VIDEO_MPEG, STREAM_TYPE_H264, STREAM_TYPE_MPEG2_VIDEO,
    STREAM_TYPE_MPEG4_VIDEO,
};

use super::super::stream::TsBlock;
use super::{InputCodec, PesFrame, TsInput, TsParameters};

/// Retention limit of the video multiplex buffer, microseconds
const T_STD_MAX_RETENTION: i64 = 1_000_000;
/// Delay applied to non-CPB streams, microseconds
const DEFAULT_DELAY: i64 = 500_000;

/// Video packetizer state
#[derive(Debug, Default)]
pub(crate) struct VideoSys {
    pub align: bool,
    pub first: bool,
    pub last_frame: Option<PesFrame>,
}

// Light validation of an AVC decoder configuration record: enough to
// reject streams whose parameter sets cannot be recovered.
fn validate_avc_config(extra: &[u8]) -> Result<()> {
    if extra[0] != 1 {
        // Annex B extradata, nothing to check
        return Ok(());
    }
    if extra.len() < 7 || (extra[5] & 0x1f) == 0 {
        return Err(MuxError::Config(
            "invalid AVC configuration record (no SPS)".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    _params: &TsParameters,
) -> Result<TsInput> {
    let stream_type = match fmt.codec {
        CodecId::Mpgv => STREAM_TYPE_MPEG2_VIDEO,
        CodecId::Mp4v => STREAM_TYPE_MPEG4_VIDEO,
        CodecId::H264 => STREAM_TYPE_H264,
        _ => return Err(MuxError::Unsupported("not MPEG video".to_string())),
    };

    let video = fmt
        .video
        .filter(|video| video.frame_rate != 0 && video.frame_rate_base != 0)
        .ok_or_else(|| MuxError::Config("video input without a frame rate".to_string()))?;

    if fmt.codec == CodecId::H264 && !fmt.extra.is_empty() {
        validate_avc_config(&fmt.extra)?;
    }

    let sys = VideoSys {
        align: opts.align.unwrap_or(fmt.codec == CodecId::Mpgv),
        first: true,
        last_frame: None,
    };
    let mut input = TsInput::new(fmt, opts, InputCodec::VideoMpeg(sys));
    input.stream_type = stream_type;

    input.pack.peak_bitrate = if video.max_bitrate != 0 {
        6 * video.max_bitrate / 5
    } else {
        6 * input.bitrate / 5
    };

    if input.pack.total_bitrate == 0
        && input.bitrate != 0
        && video.frame_rate_base != 0
        && video.cpb_buffer != 0
    {
        input.pack.total_bitrate = super::total_bitrate_overhead(
            input.bitrate,
            PES_HEADER_SIZE_PTSDTS,
            video.frame_rate,
            video.frame_rate_base,
            // at worst 187 bytes wasted per frame, if all frames are
            // I-frames or if we are aligned
            true,
        );
    }
    super::derive_ts_delay(&mut input);

    debug!(
        "setting up {:?}/{} total {} bitrate {} CPB {}",
        input.fmt.codec,
        input.fmt.es_id,
        input.pack.total_bitrate,
        input.bitrate,
        video.cpb_buffer
    );

    Ok(input)
}

fn set_pes_header(frame: Block) -> PesFrame {
    let dts = frame.dts.unwrap_or(0);
    let pts = frame.pts.unwrap_or(0);
    let has_dts = dts != pts;

    let mut header = PesHeader::new(STREAM_ID_VIDEO_MPEG).with_pts((pts * 9 / 100) as u64);
    if has_dts {
        header = header.with_dts((dts * 9 / 100) as u64);
    }
    header.data_alignment = frame.flags.contains(BlockFlags::ALIGNED);

    let mut buf = BytesMut::with_capacity(header.len() + frame.data.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&frame.data);

    PesFrame {
        data: buf.to_vec(),
        dts,
        delay: frame.delay,
        flags: frame.flags,
    }
}

fn output_frame(input: &mut TsInput, frame: PesFrame) -> Vec<TsBlock> {
    let mut frame = frame;
    let total = frame.data.len();
    pes::patch_length(&mut frame.data, total);

    let cpb_buffer = input.fmt.video.map_or(0, |video| video.cpb_buffer);
    if cpb_buffer == 0 {
        frame.delay = DEFAULT_DELAY;
    } else if input.fmt.codec != CodecId::H264 && frame.delay > T_STD_MAX_RETENTION {
        frame.delay = T_STD_MAX_RETENTION;
    }
    super::check_muxing(input, &frame);

    if frame.flags.contains(BlockFlags::TYPE_I) && input.pcr_period != 0 {
        // force a PCR on the random access point
        input.next_pcr = input.last_muxing;
    }
    let mut blocks = super::build_ts(input, &frame);

    if frame.flags.contains(BlockFlags::TYPE_I) {
        match blocks.first_mut() {
            Some(first) if first.packet.adaptation_length() > 0 => {
                first.packet.set_random_access();
            }
            _ => {
                if input.pcr_period != 0 {
                    error!("random access point without an adaptation field");
                }
            }
        }
        for block in &mut blocks {
            block.packet.set_transport_priority();
            if block.packet.adaptation_length() > 0 {
                block.packet.set_stream_priority();
            }
        }
    }

    blocks
}

pub(crate) fn send(input: &mut TsInput, frames: Vec<Block>) -> Vec<TsBlock> {
    let mut sys = match &mut input.codec {
        InputCodec::VideoMpeg(sys) => std::mem::take(sys),
        _ => unreachable!("video send on another packetizer"),
    };
    let mut frames = frames;
    let mut out = Vec::new();

    if sys.first {
        if let Some(first) = frames.first_mut() {
            first.flags.insert(BlockFlags::DISCONTINUITY);
            sys.first = false;
        }
    }

    for mut frame in frames {
        if frame.flags.contains(BlockFlags::TYPE_I) || sys.align {
            frame.flags.insert(BlockFlags::ALIGNED);
        } else if let Some(last) = &mut sys.last_frame {
            if !last.flags.contains(BlockFlags::TYPE_I) {
                let overlap = super::check_overlap(input, last);
                if overlap != 0 {
                    super::overlap_frames(&mut frame.data, &mut last.data, overlap);
                }
            }
        }

        if let Some(last) = sys.last_frame.take() {
            out.extend(output_frame(input, last));
        }

        sys.last_frame = Some(set_pes_header(frame));
    }

    // No need to bufferize one frame if we know we'll be aligned.
    let flush = sys
        .last_frame
        .as_ref()
        .is_some_and(|last| sys.align || last.flags.contains(BlockFlags::TYPE_I));
    if flush {
        if let Some(last) = sys.last_frame.take() {
            out.extend(output_frame(input, last));
        }
    }

    match &mut input.codec {
        InputCodec::VideoMpeg(slot) => *slot = sys,
        _ => unreachable!(),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::VideoParams;
    use pretty_assertions::assert_eq;

    fn params() -> TsParameters {
        TsParameters {
            conformance: crate::config::Conformance::None,
            charset: crate::utils::charset::DvbCharset::default(),
            packet_interval: 2_000,
            max_prepare: 4_000,
        }
    }

    fn h264_format() -> StreamFormat {
        let mut fmt = StreamFormat::video_h264(25, 1, 4_000_000);
        fmt.video = Some(VideoParams {
            frame_rate: 25,
            frame_rate_base: 1,
            width: 1280,
            height: 720,
            max_bitrate: 5_000_000,
            cpb_buffer: 2_000_000,
        });
        fmt
    }

    fn open_input() -> TsInput {
        let mut input = open(&h264_format(), &InputOptions::default(), &params()).unwrap();
        input.pack.pid = 68;
        input
    }

    fn video_frame(index: i64, size: usize) -> Block {
        Block::new(vec![0u8; size])
            .with_dts(1_000_000 + index * 40_000)
            .with_pts(1_040_000 + index * 40_000)
            .with_delay(150_000)
    }

    #[test]
    fn test_open_checks() {
        assert_eq!(open_input().stream_type, STREAM_TYPE_H264);
        // peak follows max_bitrate
        assert_eq!(open_input().pack.peak_bitrate, 6_000_000);

        // no frame rate is a configuration error
        let fmt = StreamFormat::new(CodecId::H264);
        assert!(matches!(
            open(&fmt, &InputOptions::default(), &params()),
            Err(MuxError::Config(_))
        ));

        // a bad avcC is rejected, Annex B extradata is not
        let mut fmt = h264_format();
        fmt.extra = vec![1, 0x64, 0x00, 0x28, 0xff, 0xe0];
        assert!(matches!(
            open(&fmt, &InputOptions::default(), &params()),
            Err(MuxError::Config(_))
        ));
        let mut fmt = h264_format();
        fmt.extra = vec![0, 0, 0, 1, 0x67];
        assert!(open(&fmt, &InputOptions::default(), &params()).is_ok());
    }

    #[test]
    fn test_non_key_frames_are_buffered() {
        let mut input = open_input();
        // one non-key frame stays buffered until the next frame arrives
        let out = send(&mut input, vec![video_frame(0, 1000)]);
        assert!(out.is_empty());
        let out = send(&mut input, vec![video_frame(1, 1000)]);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_key_frame_marks_rap_and_priorities() {
        let mut input = open_input();
        let key = video_frame(0, 2000).key_frame();
        let out = send(&mut input, vec![key]);
        assert!(!out.is_empty());

        // the I-frame flushes immediately: first packet starts the PES
        // with the random access indicator, all packets carry the
        // transport priority
        assert!(out[0].packet.unit_start());
        assert!(out[0].packet.has_random_access());
        for block in &out {
            assert!(block.packet.as_bytes()[1] & 0x20 != 0);
        }
    }

    #[test]
    fn test_key_frame_forces_pcr() {
        let mut input = open_input();
        input.pcr_period = 40_000;
        let key = video_frame(0, 2000).key_frame();
        let out = send(&mut input, vec![key]);

        assert!(out.iter().any(|block| block.packet.has_pcr()));
    }

    #[test]
    fn test_pes_has_pts_and_dts_when_different() {
        let mut input = open_input();
        let key = video_frame(0, 500).key_frame();
        let out = send(&mut input, vec![key]);

        let offset = out[0].packet.payload_offset();
        let bytes = &out[0].packet.as_bytes()[offset..];
        assert_eq!(&bytes[0..3], &[0, 0, 1]);
        assert_eq!(bytes[3], STREAM_ID_VIDEO_MPEG);
        assert_eq!(bytes[7] & 0xc0, 0xc0); // PTS and DTS present
    }
}
