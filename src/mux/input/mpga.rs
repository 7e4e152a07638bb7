//! MPEG-1/2 audio input packetizer.

use log::debug;

use crate::av::{Block, CodecId, StreamFormat};
use crate::config::InputOptions;
use crate::error::{MuxError, Result};
use crate::ts::types::{PES_HEADER_SIZE_PTS, STREAM_ID_AUDIO_MPEG, STREAM_TYPE_MPEG_AUDIO};

use super::super::stream::TsBlock;
use super::audio::{self, AudioSys};
use super::{InputCodec, TsInput, TsParameters};

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    _params: &TsParameters,
) -> Result<TsInput> {
    if fmt.codec != CodecId::Mpga {
        return Err(MuxError::Unsupported("not MPEG audio".to_string()));
    }

    let mut input = TsInput::new(fmt, opts, InputCodec::Mpga(AudioSys::default()));
    input.stream_type = STREAM_TYPE_MPEG_AUDIO;
    audio::setup(&mut input, opts, STREAM_ID_AUDIO_MPEG, true);

    let (frames_per_pes, align) = {
        let sys = audio::sys_ref(&input);
        (sys.frames_per_pes, sys.align)
    };
    let frame_length = input.fmt.audio.map_or(0, |audio| audio.frame_length);
    if input.pack.total_bitrate == 0 && input.bitrate != 0 && frame_length != 0 {
        let rate = input.fmt.audio.map_or(0, |audio| audio.rate);
        let base = frame_length * frames_per_pes;
        input.pack.total_bitrate = super::total_bitrate_overhead(
            input.bitrate,
            PES_HEADER_SIZE_PTS,
            rate,
            base,
            align,
        );
    }
    super::derive_ts_delay(&mut input);

    debug!(
        "setting up mpga/{} total {} bitrate {} frame {} {}",
        input.fmt.es_id,
        input.pack.total_bitrate,
        input.bitrate,
        frames_per_pes,
        if align { "aligned" } else { "unaligned" }
    );

    Ok(input)
}

pub(crate) fn send(input: &mut TsInput, frames: Vec<Block>) -> Vec<TsBlock> {
    audio::send(input, frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_accepts_mpga_only() {
        let params = TsParameters {
            conformance: crate::config::Conformance::None,
            charset: crate::utils::charset::DvbCharset::default(),
            packet_interval: 2_000,
            max_prepare: 4_000,
        };
        let fmt = StreamFormat::audio_mp2(48_000, 1152, 192_000);
        let input = open(&fmt, &InputOptions::default(), &params).unwrap();
        assert_eq!(input.stream_type, STREAM_TYPE_MPEG_AUDIO);
        assert!(input.pack.total_bitrate > 192_000);
        assert!(input.pack.ts_delay > 0);

        let fmt = StreamFormat::video_h264(25, 1, 0);
        assert!(matches!(
            open(&fmt, &InputOptions::default(), &params),
            Err(MuxError::Unsupported(_))
        ));
    }
}
