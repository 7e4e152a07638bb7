//! Per-input packetizers.
//!
//! One packetizer per elementary stream: it frames access units into PES,
//! splits PES into TS packets, interleaves PCR-only packets when the input
//! carries the program clock, and assigns each TS packet its muxing window
//! (`dts`, `delay`).

use log::{debug, error, warn};

use crate::av::{Block, BlockFlags, StreamFormat};
use crate::config::InputOptions;
use crate::error::{MuxError, Result};
use crate::ts::packet::TsPacket;
use crate::ts::types::*;

use super::stream::{
    Packetizer, Priority, TsBlock, TsParameters, DEFAULT_BITRATE, DEFAULT_PCR_TOLERANCE,
};

pub(crate) mod a52;
pub(crate) mod audio;
pub(crate) mod dca;
pub(crate) mod dvbsub;
pub(crate) mod mp4a;
pub(crate) mod mpga;
pub(crate) mod video;
pub(crate) mod video_private;

/// Codec-specific packetizer state
pub(crate) enum InputCodec {
    VideoMpeg(video::VideoSys),
    VideoPrivate(video_private::PrivateSys),
    Mpga(audio::AudioSys),
    Mp4a(mp4a::Mp4aSys),
    A52(audio::AudioSys),
    Dca(audio::AudioSys),
    DvbSub(dvbsub::DvbSubSys),
}

/// An elementary stream input packetizer
pub(crate) struct TsInput {
    pub pack: Packetizer,
    pub fmt: StreamFormat,
    /// PCR period requested by configuration, microseconds (0 = none)
    pub cfg_pcr_period: i64,
    /// Effective PCR period, microseconds (0 = not the PCR carrier)
    pub pcr_period: i64,
    pub pcr_tolerance: i64,
    /// Declared ES bitrate, bits/s
    pub bitrate: u32,
    /// Bumped when the PMT-visible description of this ES changes
    pub es_version: u32,
    pub stream_type: u8,
    /// Raw PMT descriptor loop bytes for this ES
    pub descriptors: Vec<u8>,
    /// Date of the next PCR to emit (0 = not started)
    pub next_pcr: i64,
    /// Muxing date reached by the last built packet (0 = not started)
    pub last_muxing: i64,
    pub cc: u8,
    pub codec: InputCodec,
}

impl TsInput {
    pub(crate) fn new(fmt: &StreamFormat, opts: &InputOptions, codec: InputCodec) -> Self {
        let bitrate = if opts.bitrate != 0 {
            opts.bitrate
        } else {
            fmt.bitrate
        };
        Self {
            pack: Packetizer::new(opts.pid, opts.total_bitrate),
            fmt: fmt.clone(),
            cfg_pcr_period: opts.pcr_period_ms as i64 * 1000,
            pcr_period: 0,
            pcr_tolerance: DEFAULT_PCR_TOLERANCE,
            bitrate,
            es_version: 1,
            stream_type: 0,
            descriptors: Vec::new(),
            next_pcr: 0,
            last_muxing: 0,
            cc: 0,
            codec,
        }
    }

    /// Validates the PCR period against the conformance level and derives
    /// the tolerance from the input bitrate
    pub(crate) fn validate_pcr(&mut self, conformance: crate::config::Conformance) {
        use crate::config::Conformance;

        self.pcr_tolerance = if self.bitrate != 0 {
            TS_PACKET_SIZE as i64 * 8_000_000 / self.bitrate as i64
        } else {
            DEFAULT_PCR_TOLERANCE
        };

        match conformance {
            Conformance::None => {}
            Conformance::Iso | Conformance::Atsc | Conformance::Dvb | Conformance::Hdmv => {
                if self.pcr_period + self.pcr_tolerance > 100_000 {
                    warn!(
                        "PCR period shouldn't exceed 100 ms ({} + {})",
                        self.pcr_period, self.pcr_tolerance
                    );
                }
            }
        }
    }

    /// Feeds a chain of access units and returns the built TS packets
    pub(crate) fn send(&mut self, frames: Vec<Block>) -> Vec<TsBlock> {
        enum Kind {
            Video,
            Private,
            Audio,
            Mp4a,
            DvbSub,
        }
        let kind = match &self.codec {
            InputCodec::VideoMpeg(_) => Kind::Video,
            InputCodec::VideoPrivate(_) => Kind::Private,
            InputCodec::Mpga(_) | InputCodec::A52(_) | InputCodec::Dca(_) => Kind::Audio,
            InputCodec::Mp4a(_) => Kind::Mp4a,
            InputCodec::DvbSub(_) => Kind::DvbSub,
        };
        match kind {
            Kind::Video => video::send(self, frames),
            Kind::Private => video_private::send(self, frames),
            Kind::Audio => audio::send(self, frames),
            Kind::Mp4a => mp4a::send(self, frames),
            Kind::DvbSub => dvbsub::send(self, frames),
        }
    }

    /// Releases pending frames without emitting them
    pub(crate) fn close(&mut self) {
        match &mut self.codec {
            InputCodec::VideoMpeg(sys) => sys.last_frame = None,
            InputCodec::Mpga(sys) | InputCodec::A52(sys) | InputCodec::Dca(sys) => {
                sys.pending = None
            }
            InputCodec::Mp4a(sys) => sys.audio.pending = None,
            _ => {}
        }
    }
}

/// Tries every packetizer subtype in order until one accepts the format
pub(crate) fn open(
    fmt: &StreamFormat,
    opts: &InputOptions,
    params: &TsParameters,
) -> Result<TsInput> {
    type Opener = fn(&StreamFormat, &InputOptions, &TsParameters) -> Result<TsInput>;
    let openers: [Opener; 7] = [
        video::open,
        mpga::open,
        mp4a::open,
        a52::open,
        dca::open,
        dvbsub::open,
        video_private::open,
    ];

    for opener in openers {
        match opener(fmt, opts, params) {
            Err(MuxError::Unsupported(_)) => continue,
            result => return result,
        }
    }
    Err(MuxError::Unsupported(format!("{:?}", fmt.codec)))
}

/// A serialized PES packet with its muxing metadata
#[derive(Debug)]
pub(crate) struct PesFrame {
    pub data: Vec<u8>,
    pub dts: i64,
    pub delay: i64,
    pub flags: BlockFlags,
}

/// Resets the input muxing date on startup or after a discontinuity,
/// interpolating backwards from the frame date at the ES bitrate
pub(crate) fn check_muxing(input: &mut TsInput, frame: &PesFrame) {
    let bitrate = if input.bitrate != 0 {
        input.bitrate
    } else {
        DEFAULT_BITRATE
    } as i64;
    let interpolated =
        frame.dts - frame.delay - frame.data.len() as i64 * 8_000_000 / bitrate;

    if input.last_muxing == 0
        || (frame.flags.contains(BlockFlags::DISCONTINUITY) && input.last_muxing < interpolated)
    {
        debug!(
            "resetting muxing date ({}->{})",
            input.last_muxing, interpolated
        );
        input.last_muxing = interpolated;
    }
}

/// Number of PCRs due in `[last_muxing, end]` given the PCR period
pub(crate) fn nb_pcr(input: &mut TsInput, end: i64) -> usize {
    if input.pcr_period == 0 {
        return 0;
    }
    if input.next_pcr == 0 {
        input.next_pcr = input.last_muxing;
    }

    let mut next_pcr = input.next_pcr;
    let mut count = 0;
    while next_pcr <= end + input.pcr_tolerance {
        count += 1;
        next_pcr += input.pcr_period;
    }
    count
}

/// Size of the last incomplete TS payload slice of a PES, or 0 when moving
/// it would destroy the PES
pub(crate) fn check_overlap(input: &mut TsInput, frame: &PesFrame) -> usize {
    let mut pcr_left = nb_pcr(input, frame.dts - frame.delay);
    let mut next_ts_size = TS_PACKET_SIZE
        - if pcr_left != 0 {
            TS_HEADER_SIZE_PCR
        } else {
            TS_HEADER_SIZE
        };
    let mut frame_size = frame.data.len();

    if frame_size <= next_ts_size {
        return 0;
    }

    while frame_size >= next_ts_size {
        frame_size -= next_ts_size;
        pcr_left = pcr_left.saturating_sub(1);
        next_ts_size = TS_PACKET_SIZE
            - if pcr_left != 0 {
                TS_HEADER_SIZE_PCR
            } else {
                TS_HEADER_SIZE
            };
    }

    frame_size
}

/// Moves the last `overlap` bytes of `src` to the front of `dest`
pub(crate) fn overlap_frames(dest: &mut Vec<u8>, src: &mut Vec<u8>, overlap: usize) {
    let tail = src.split_off(src.len() - overlap);
    let mut merged = Vec::with_capacity(tail.len() + dest.len());
    merged.extend_from_slice(&tail);
    merged.append(dest);
    *dest = merged;
}

/// Number of TS packets needed to carry a PES
pub(crate) fn nb_ts(input: &mut TsInput, frame: &PesFrame) -> usize {
    let mut pcr_left = nb_pcr(input, frame.dts - frame.delay);
    let mut next_ts_size = TS_PACKET_SIZE
        - if pcr_left != 0 {
            TS_HEADER_SIZE_PCR
        } else if frame.flags.contains(BlockFlags::DISCONTINUITY) {
            TS_HEADER_SIZE_AF
        } else {
            TS_HEADER_SIZE
        };

    let mut count = 0;
    let mut frame_size = frame.data.len() as isize;
    while frame_size > 0 {
        frame_size -= next_ts_size as isize;
        count += 1;
        pcr_left = pcr_left.saturating_sub(1);
        next_ts_size = TS_PACKET_SIZE
            - if pcr_left != 0 {
                TS_HEADER_SIZE_PCR
            } else {
                TS_HEADER_SIZE
            };
    }
    count
}

/// Builds an adaptation-only TS packet that will carry a PCR
fn build_pcr_ts(input: &TsInput) -> TsPacket {
    let mut packet = TsPacket::init();
    packet.set_pid(input.pack.pid);
    packet.set_cc(input.cc);
    packet.set_adaptation(TS_PACKET_SIZE - TS_HEADER_SIZE - 1);
    packet
}

/// Builds a payload TS packet, stuffing through the adaptation field when
/// the payload is short
fn build_payload_ts(input: &mut TsInput, payload: &[u8]) -> TsPacket {
    let mut packet = TsPacket::init();
    packet.set_pid(input.pack.pid);
    input.cc = input.cc.wrapping_add(1);
    packet.set_cc(input.cc);

    if payload.len() < TS_PACKET_SIZE - TS_HEADER_SIZE {
        packet.set_adaptation(TS_PACKET_SIZE - payload.len() - TS_HEADER_SIZE - 1);
    }
    packet.set_payload(payload);
    packet
}

/// Builds the chain of TS packets for one PES, interleaving PCR-only
/// packets and assigning per-packet muxing windows
pub(crate) fn build_ts(input: &mut TsInput, frame: &PesFrame) -> Vec<TsBlock> {
    let count = nb_ts(input, frame);
    let duration = frame.dts - frame.delay - input.last_muxing;
    let peak_duration = if input.pack.peak_bitrate != 0 {
        frame.data.len() as i64 * 8_000_000 / input.pack.peak_bitrate as i64
    } else {
        duration
    };

    let mut out = Vec::with_capacity(count);
    let mut offset = 0;

    for i in (0..count as i64).rev() {
        let muxing = frame.dts - frame.delay - i * duration / count as i64;

        if input.pcr_period != 0 {
            while input.next_pcr < muxing - input.pcr_tolerance {
                // Insert an adaptation-only packet for the PCR deadline.
                let mut block = TsBlock::new(build_pcr_ts(input));
                block.dts = frame.dts - i * peak_duration / count as i64;
                block.delay = block.dts - input.next_pcr + input.pack.ts_delay;
                // overwritten at output time
                block.packet.set_pcr(0, 0);
                input.next_pcr += input.pcr_period;
                out.push(block);
            }
        }

        let has_pcr =
            input.pcr_period != 0 && input.next_pcr <= muxing + input.pcr_tolerance;
        let mut ts_payload = if has_pcr {
            TS_PACKET_SIZE - TS_HEADER_SIZE_PCR
        } else if i == count as i64 - 1 && frame.flags.contains(BlockFlags::DISCONTINUITY) {
            TS_PACKET_SIZE - TS_HEADER_SIZE_AF
        } else {
            TS_PACKET_SIZE - TS_HEADER_SIZE
        };
        if ts_payload > frame.data.len() - offset {
            ts_payload = frame.data.len() - offset;
        }

        let mut block =
            TsBlock::new(build_payload_ts(input, &frame.data[offset..offset + ts_payload]));
        block.dts = frame.dts - i * peak_duration / count as i64;
        block.delay = block.dts - muxing + input.pack.ts_delay;
        if block.delay <= 0 {
            warn!(
                "too short delay {} (pes={}), d={} p={}",
                block.delay, frame.delay, duration, peak_duration
            );
            block.delay = 0;
        }

        if i == count as i64 - 1 {
            block.packet.set_unit_start();
            if frame.flags.contains(BlockFlags::DISCONTINUITY) {
                block.packet.set_discontinuity();
            }
        }
        if has_pcr {
            // overwritten at output time
            block.packet.set_pcr(0, 0);
            input.next_pcr += input.pcr_period;
        }

        offset += ts_payload;
        out.push(block);
    }
    input.last_muxing = frame.dts - frame.delay;

    if offset != frame.data.len() {
        error!(
            "residual bytes after TS build ({})",
            frame.data.len() - offset
        );
    }

    out
}

/// Adds the PES, alignment-waste and TS overheads to an ES bitrate, per
/// frame cadence (`rate` frames per `base` ticks)
pub(crate) fn total_bitrate_overhead(
    es_bitrate: u32,
    pes_header_size: usize,
    rate: u32,
    base: u32,
    aligned: bool,
) -> u32 {
    let rate = rate as u64;
    let base = base as u64;
    let mut total = es_bitrate as u64;
    // PES overhead
    total += (pes_header_size as u64 * 8 * rate + base - 1) / base;
    // At worst 187 bytes wasted per frame when aligned
    if aligned {
        total += ((TS_PACKET_SIZE as u64 - 1) * 8 * rate + base - 1) / base;
    }
    // TS overhead
    total += (total * TS_HEADER_SIZE as u64 + (TS_PACKET_SIZE - TS_HEADER_SIZE) as u64 - 1)
        / (TS_PACKET_SIZE - TS_HEADER_SIZE) as u64;
    total as u32
}

/// Derives the transport buffer delay from the provisioned total bitrate
pub(crate) fn derive_ts_delay(input: &mut TsInput) {
    if input.pack.total_bitrate != 0 {
        input.pack.ts_delay = super::stream::T_STD_TS_BUFFER as i64 * 8_000_000
            / input.pack.total_bitrate as i64;
    }
}

/// Marks the elected PCR carrier
pub(crate) fn set_pcr_carrier(input: &mut TsInput, period: i64) {
    input.pcr_period = period;
    input.pack.priority = if period != 0 {
        Priority::Pcr
    } else {
        Priority::None
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::CodecId;
    use pretty_assertions::assert_eq;

    fn test_input() -> TsInput {
        let fmt = StreamFormat::audio_mp2(48_000, 1152, 192_000);
        let opts = InputOptions::default();
        let mut input = TsInput::new(&fmt, &opts, InputCodec::Mpga(audio::AudioSys::default()));
        input.pack.pid = 257;
        input
    }

    fn frame(len: usize, dts: i64, delay: i64) -> PesFrame {
        PesFrame {
            data: vec![0u8; len],
            dts,
            delay,
            flags: BlockFlags::default(),
        }
    }

    #[test]
    fn test_nb_ts_exact_and_partial() {
        let mut input = test_input();
        input.last_muxing = 1;
        // exactly one full payload
        assert_eq!(nb_ts(&mut input, &frame(184, 100_000, 0)), 1);
        assert_eq!(nb_ts(&mut input, &frame(185, 100_000, 0)), 2);
        assert_eq!(nb_ts(&mut input, &frame(368, 100_000, 0)), 2);
    }

    #[test]
    fn test_nb_pcr_counts_period() {
        let mut input = test_input();
        input.last_muxing = 1_000_000;
        input.pcr_period = 40_000;
        input.pcr_tolerance = 1_000;
        // PCRs at 1.0s, 1.04s, ..., within [1.0, 1.1]
        let count = nb_pcr(&mut input, 1_100_000);
        assert_eq!(count, 3);
        assert_eq!(input.next_pcr, 1_000_000);
    }

    #[test]
    fn test_build_ts_framing() {
        let mut input = test_input();
        input.last_muxing = 900_000;
        let pes = frame(400, 1_000_000, 10_000);
        let blocks = build_ts(&mut input, &pes);

        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].packet.unit_start());
        assert!(!blocks[1].packet.unit_start());
        // continuity increments on each payload packet
        assert_eq!(blocks[0].packet.cc(), 1);
        assert_eq!(blocks[1].packet.cc(), 2);
        assert_eq!(blocks[2].packet.cc(), 3);
        // last packet carries the stuffing
        assert_eq!(blocks[2].packet.payload_len(), 400 - 2 * 184);
        assert_eq!(input.last_muxing, 990_000);
        // muxing dates are increasing
        assert!(blocks[0].muxing() < blocks[2].muxing());
    }

    #[test]
    fn test_build_ts_discontinuity_first_packet() {
        let mut input = test_input();
        input.last_muxing = 900_000;
        let mut pes = frame(300, 1_000_000, 10_000);
        pes.flags.insert(BlockFlags::DISCONTINUITY);
        let blocks = build_ts(&mut input, &pes);

        assert!(blocks[0].packet.unit_start());
        assert!(blocks[0].packet.has_adaptation());
        assert_eq!(blocks[0].packet.payload_len(), 182);
    }

    #[test]
    fn test_build_ts_interleaves_pcr() {
        let mut input = test_input();
        input.last_muxing = 1_000_000;
        input.pcr_period = 20_000;
        input.pcr_tolerance = 100;
        // one PES spanning 100 ms: several PCR deadlines fall inside
        let pes = frame(2 * 184, 1_100_000, 0);
        let blocks = build_ts(&mut input, &pes);

        let pcr_only: Vec<_> = blocks.iter().filter(|b| !b.packet.has_payload()).collect();
        assert!(!pcr_only.is_empty());
        for block in &pcr_only {
            assert!(block.packet.has_pcr());
        }
        let carried: usize = blocks.iter().map(|b| b.packet.payload_len()).sum();
        assert_eq!(carried, 2 * 184);
    }

    #[test]
    fn test_check_overlap_preserves_small_pes() {
        let mut input = test_input();
        assert_eq!(check_overlap(&mut input, &frame(100, 0, 0)), 0);
        assert_eq!(check_overlap(&mut input, &frame(184, 0, 0)), 0);
        // 200 = 184 + 16 remainder
        assert_eq!(check_overlap(&mut input, &frame(200, 0, 0)), 16);
    }

    #[test]
    fn test_overlap_frames_moves_tail() {
        let mut src = vec![1, 2, 3, 4, 5];
        let mut dest = vec![9, 9];
        overlap_frames(&mut dest, &mut src, 2);
        assert_eq!(src, vec![1, 2, 3]);
        assert_eq!(dest, vec![4, 5, 9, 9]);
    }

    #[test]
    fn test_open_rejects_unknown_video_without_params() {
        let fmt = StreamFormat::new(CodecId::H264);
        let params = TsParameters {
            conformance: crate::config::Conformance::None,
            charset: crate::utils::charset::DvbCharset::default(),
            packet_interval: 2_000,
            max_prepare: 4_000,
        };
        // H.264 without a frame rate is a configuration error, not a
        // format mismatch
        assert!(matches!(
            open(&fmt, &InputOptions::default(), &params),
            Err(MuxError::Config(_))
        ));
    }
}
