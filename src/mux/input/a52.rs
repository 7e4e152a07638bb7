//! AC-3 (Dolby Digital) input packetizer.
//!
//! DVB systems carry AC-3 as private PES data with an AC-3 descriptor;
//! ATSC systems use stream type 0x81 with a registration descriptor.

use log::{debug, warn};

use crate::av::{Block, CodecId, StreamFormat};
use crate::config::{Conformance, InputOptions};
use crate::error::{MuxError, Result};
use crate::ts::psi::{self, Descriptor};
use crate::ts::types::{
    DESC_TAG_AC3, DESC_TAG_REGISTRATION, PES_HEADER_SIZE_PTS, STREAM_ID_PRIVATE_1,
    STREAM_TYPE_ATSC_A52, STREAM_TYPE_PRIVATE_PES,
};

use super::super::stream::TsBlock;
use super::audio::{self, AudioSys};
use super::{InputCodec, TsInput, TsParameters};

pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    params: &TsParameters,
) -> Result<TsInput> {
    if fmt.codec != CodecId::A52 {
        return Err(MuxError::Unsupported("not AC-3".to_string()));
    }

    let mut input = TsInput::new(fmt, opts, InputCodec::A52(AudioSys::default()));
    audio::setup(&mut input, opts, STREAM_ID_PRIVATE_1, false);

    match params.conformance {
        Conformance::Atsc => {
            input.stream_type = STREAM_TYPE_ATSC_A52;
            psi::append_descriptor(
                &mut input.descriptors,
                &Descriptor::new(DESC_TAG_REGISTRATION, b"AC-3".to_vec()),
            );
        }
        conformance => {
            if conformance != Conformance::Dvb {
                warn!("A/52 encapsulation requires DVB or ATSC conformance");
            }
            input.stream_type = STREAM_TYPE_PRIVATE_PES;
            // AC-3 descriptor with all component flags cleared
            psi::append_descriptor(
                &mut input.descriptors,
                &Descriptor::new(DESC_TAG_AC3, vec![0x00]),
            );
        }
    }

    let (frames_per_pes, align) = {
        let sys = audio::sys_ref(&input);
        (sys.frames_per_pes, sys.align)
    };
    let frame_length = input.fmt.audio.map_or(0, |audio| audio.frame_length);
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
        "setting up a52/{} total {} bitrate {}",
        input.fmt.es_id, input.pack.total_bitrate, input.bitrate
    );

    Ok(input)
}

pub(crate) fn send(input: &mut TsInput, frames: Vec<Block>) -> Vec<TsBlock> {
    audio::send(input, frames)
}
