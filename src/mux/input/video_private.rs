//! User-private video encapsulation for codecs without a standard TS
//! mapping (H.263, WMV, MS-MPEG4, MJPEG, lossless codecs).
//!
//! Emits stream type 0xa0 with a private descriptor carrying the fourcc,
//! picture geometry and extradata, so a cooperating receiver can rebuild
//! the decoder configuration.

use bytes::BytesMut;
use log::{debug, error, warn};

use crate::av::{Block, BlockFlags, CodecId, StreamFormat};
use crate::config::{Conformance, InputOptions};
use crate::error::{MuxError, Result};
use crate::ts::pes::{self, PesHeader};
use crate::ts::types::{
    PES_HEADER_SIZE_PTSDTS, STREAM_ID_PRIVATE_VIDEO, STREAM_TYPE_USER_PRIVATE,
};

use super::super::stream::TsBlock;
use super::{InputCodec, PesFrame, TsInput, TsParameters};

const DEFAULT_DELAY: i64 = 500_000;

/// Private-video packetizer state
#[derive(Debug, Default)]
pub(crate) struct PrivateSys {
    pub first: bool,
}

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    params: &TsParameters,
) -> Result<TsInput> {
    match fmt.codec {
        CodecId::H263
        | CodecId::H263i
        | CodecId::Wmv1
        | CodecId::Wmv2
        | CodecId::Wmv3
        | CodecId::Div1
        | CodecId::Div2
        | CodecId::Div3
        | CodecId::Mjpg
        | CodecId::Ffv1
        | CodecId::FfvHuff => {}
        _ => return Err(MuxError::Unsupported("not a private video codec".to_string())),
    }

    if params.conformance != Conformance::None {
        warn!("MSCODEC encapsulation isn't standard-compliant");
    }

    let mut input = TsInput::new(fmt, opts, InputCodec::VideoPrivate(PrivateSys { first: true }));
    input.stream_type = STREAM_TYPE_USER_PRIVATE;

    if fmt.extra.len() < 256 {
        let video = fmt.video.unwrap_or_default();
        let mut descriptor = Vec::with_capacity(12 + fmt.extra.len());
        descriptor.push(0xa0); // user private
        descriptor.push((10 + fmt.extra.len()) as u8);
        descriptor.extend_from_slice(&fmt.codec.fourcc());
        descriptor.extend_from_slice(&(video.width as u16).to_be_bytes());
        descriptor.extend_from_slice(&(video.height as u16).to_be_bytes());
        descriptor.extend_from_slice(&(fmt.extra.len() as u16).to_be_bytes());
        descriptor.extend_from_slice(&fmt.extra);
        input.descriptors = descriptor;
    } else {
        warn!("private descriptor is too large {}", fmt.extra.len());
    }

    if input.pack.total_bitrate == 0 && input.bitrate != 0 {
        if let Some(video) = fmt.video.filter(|video| video.frame_rate_base != 0) {
            input.pack.total_bitrate = super::total_bitrate_overhead(
                input.bitrate,
                PES_HEADER_SIZE_PTSDTS,
                video.frame_rate,
                video.frame_rate_base,
                true,
            );
            super::derive_ts_delay(&mut input);
        }
    }

    debug!(
        "setting up {:?}/{} total {} bitrate {}",
        input.fmt.codec, input.fmt.es_id, input.pack.total_bitrate, input.bitrate
    );

    Ok(input)
}

fn set_pes_header(frame: Block) -> PesFrame {
    let dts = frame.dts.unwrap_or(0);
    let pts = frame.pts.unwrap_or(0);
    let has_dts = dts != pts;

    let mut header = PesHeader::new(STREAM_ID_PRIVATE_VIDEO).with_pts((pts * 9 / 100) as u64);
    if has_dts {
        header = header.with_dts((dts * 9 / 100) as u64);
    }
    header.data_alignment = frame.flags.contains(BlockFlags::ALIGNED);

    let mut buf = BytesMut::with_capacity(header.len() + frame.data.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&frame.data);

    let mut data = buf.to_vec();
    let total = data.len();
    pes::patch_length(&mut data, total);

    PesFrame {
        data,
        dts,
        delay: frame.delay,
        flags: frame.flags,
    }
}

fn output_frame(input: &mut TsInput, frame: PesFrame) -> Vec<TsBlock> {
    let mut frame = frame;
    frame.delay = DEFAULT_DELAY;
    super::check_muxing(input, &frame);

    if frame.flags.contains(BlockFlags::TYPE_I) && input.pcr_period != 0 {
        input.next_pcr = input.last_muxing;
    }
    let mut blocks = super::build_ts(input, &frame);

    if frame.flags.contains(BlockFlags::TYPE_I) {
        match blocks.first_mut() {
            Some(first) if first.packet.adaptation_length() > 0 => {
                first.packet.set_random_access();
            }
            _ => error!("random access point without an adaptation field"),
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
    let first = match &mut input.codec {
        InputCodec::VideoPrivate(sys) => {
            let first = sys.first;
            sys.first = false;
            first
        }
        _ => unreachable!("private video send on another packetizer"),
    };

    let mut frames = frames;
    if first {
        if let Some(head) = frames.first_mut() {
            head.flags.insert(BlockFlags::DISCONTINUITY);
        }
    }

    let mut out = Vec::new();
    for frame in frames {
        let pes = set_pes_header(frame);
        out.extend(output_frame(input, pes));
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
            conformance: Conformance::None,
            charset: crate::utils::charset::DvbCharset::default(),
            packet_interval: 2_000,
            max_prepare: 4_000,
        }
    }

    #[test]
    fn test_private_descriptor_layout() {
        let mut fmt = StreamFormat::new(CodecId::Wmv3);
        fmt.extra = vec![0xde, 0xad];
        fmt.video = Some(VideoParams {
            frame_rate: 30,
            frame_rate_base: 1,
            width: 640,
            height: 480,
            ..VideoParams::default()
        });
        let input = open(&fmt, &InputOptions::default(), &params()).unwrap();

        assert_eq!(input.stream_type, STREAM_TYPE_USER_PRIVATE);
        let descriptor = &input.descriptors;
        assert_eq!(descriptor[0], 0xa0);
        assert_eq!(descriptor[1] as usize, 10 + 2);
        assert_eq!(&descriptor[2..6], b"WMV3");
        assert_eq!(&descriptor[6..8], &[0x02, 0x80]); // 640
        assert_eq!(&descriptor[8..10], &[0x01, 0xe0]); // 480
        assert_eq!(&descriptor[10..12], &[0x00, 0x02]);
        assert_eq!(&descriptor[12..], &[0xde, 0xad]);
    }

    #[test]
    fn test_frames_are_not_buffered() {
        let mut fmt = StreamFormat::new(CodecId::Mjpg);
        fmt.video = Some(VideoParams {
            frame_rate: 25,
            frame_rate_base: 1,
            ..VideoParams::default()
        });
        let mut input = open(&fmt, &InputOptions::default(), &params()).unwrap();
        input.pack.pid = 70;

        let frame = Block::new(vec![0u8; 400])
            .with_dts(1_000_000)
            .with_pts(1_000_000);
        let out = send(&mut input, vec![frame]);
        assert!(!out.is_empty());
        assert!(out[0].packet.unit_start());
    }
}
