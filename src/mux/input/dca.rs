//! DTS Coherent Acoustics input packetizer.

use log::{debug, warn};

use crate::av::{Block, CodecId, StreamFormat};
use crate::config::{Conformance, InputOptions};
use crate::error::{MuxError, Result};
use crate::ts::psi::{self, Descriptor};
use crate::ts::types::{
    DESC_TAG_REGISTRATION, PES_HEADER_SIZE_PTS, STREAM_ID_PRIVATE_1, STREAM_TYPE_HDMV_DTS,
    STREAM_TYPE_PRIVATE_PES,
};

use super::super::stream::TsBlock;
use super::audio::{self, AudioSys};
use super::{InputCodec, TsInput, TsParameters};

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    params: &TsParameters,
) -> Result<TsInput> {
    if fmt.codec != CodecId::Dts {
        return Err(MuxError::Unsupported("not DTS".to_string()));
    }

    let mut input = TsInput::new(fmt, opts, InputCodec::Dca(AudioSys::default()));
    audio::setup(&mut input, opts, STREAM_ID_PRIVATE_1, false);

    match params.conformance {
        Conformance::Hdmv => {
            input.stream_type = STREAM_TYPE_HDMV_DTS;
        }
        conformance => {
            if conformance != Conformance::Dvb {
                warn!("DTS encapsulation requires DVB conformance");
            }
            input.stream_type = STREAM_TYPE_PRIVATE_PES;
        }
    }

    let frame_length = input.fmt.audio.map_or(0, |audio| audio.frame_length);
    let mut identifier = *b"DTS2";
    match frame_length {
        512 => identifier[3] = b'1',
        2048 => identifier[3] = b'3',
        1024 => {}
        other => warn!("unknown frame length {}, signalling 1024", other),
    }
    psi::append_descriptor(
        &mut input.descriptors,
        &Descriptor::new(DESC_TAG_REGISTRATION, identifier.to_vec()),
    );

    let (frames_per_pes, align) = {
        let sys = audio::sys_ref(&input);
        (sys.frames_per_pes, sys.align)
    };
    if input.pack.total_bitrate == 0 && input.bitrate != 0 && frame_length != 0 {
        let rate = input.fmt.audio.map_or(0, |audio| audio.rate);
        input.pack.total_bitrate = super::total_bitrate_overhead(
            input.bitrate,
            PES_HEADER_SIZE_PTS,
            rate,
            frame_length * frames_per_pes,
            align,
        );
    }
    super::derive_ts_delay(&mut input);

    debug!(
        "setting up dts/{} total {} bitrate {}",
        input.fmt.es_id, input.pack.total_bitrate, input.bitrate
    );

    Ok(input)
}

pub(crate) fn send(input: &mut TsInput, frames: Vec<Block>) -> Vec<TsBlock> {
    audio::send(input, frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::AudioParams;
    use pretty_assertions::assert_eq;

    fn dts_format(frame_length: u32) -> StreamFormat {
        let mut fmt = StreamFormat::new(CodecId::Dts);
        fmt.bitrate = 1_536_000;
        fmt.audio = Some(AudioParams {
            rate: 48_000,
            frame_length,
            bytes_per_frame: 0,
        });
        fmt
    }

    fn params(conformance: Conformance) -> TsParameters {
        TsParameters {
            conformance,
            charset: crate::utils::charset::DvbCharset::default(),
            packet_interval: 2_000,
            max_prepare: 4_000,
        }
    }

    #[test]
    fn test_registration_identifier_by_frame_length() {
        for (frame_length, expected) in [(512u32, b"DTS1"), (1024, b"DTS2"), (2048, b"DTS3")] {
            let input = open(
                &dts_format(frame_length),
                &InputOptions::default(),
                &params(Conformance::Dvb),
            )
            .unwrap();
            let offset =
                psi::find_descriptor(&input.descriptors, DESC_TAG_REGISTRATION).unwrap();
            assert_eq!(&input.descriptors[offset + 2..offset + 6], expected);
        }
    }

    #[test]
    fn test_hdmv_stream_type() {
        let input = open(
            &dts_format(1024),
            &InputOptions::default(),
            &params(Conformance::Hdmv),
        )
        .unwrap();
        assert_eq!(input.stream_type, STREAM_TYPE_HDMV_DTS);
    }
}
