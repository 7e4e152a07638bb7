use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;
use crate::av::Block;
use crate::config::{Conformance, MuxConfig, MuxMode};
use crate::ts::types::{PID_NIT, PID_NULL, PID_SDT, PID_TDT};

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<Bytes>>>);

impl MuxOutput for SharedSink {
    fn send(&mut self, group: Bytes) {
        self.0.lock().push(group);
    }
}

impl SharedSink {
    fn flat(&self) -> Vec<u8> {
        self.0.lock().iter().flat_map(|g| g.to_vec()).collect()
    }
    fn groups(&self) -> Vec<Bytes> {
        self.0.lock().clone()
    }
}

fn packets(data: &[u8]) -> Vec<&[u8]> {
    assert_eq!(data.len() % 188, 0, "output is not packet-aligned");
    data.chunks_exact(188).collect()
}

fn pid_of(packet: &[u8]) -> u16 {
    (((packet[1] & 0x1f) as u16) << 8) | packet[2] as u16
}

fn pusi(packet: &[u8]) -> bool {
    packet[1] & 0x40 != 0
}

fn has_payload(packet: &[u8]) -> bool {
    packet[3] & 0x10 != 0
}

fn payload_offset(packet: &[u8]) -> usize {
    if packet[3] & 0x20 != 0 {
        4 + 1 + packet[4] as usize
    } else {
        4
    }
}

fn has_pcr(packet: &[u8]) -> bool {
    packet[3] & 0x20 != 0 && packet[4] > 0 && packet[5] & 0x10 != 0
}

fn pcr_value(packet: &[u8]) -> u64 {
    let base = ((packet[6] as u64) << 25)
        | ((packet[7] as u64) << 17)
        | ((packet[8] as u64) << 9)
        | ((packet[9] as u64) << 1)
        | ((packet[10] as u64) >> 7);
    let ext = (((packet[10] & 0x01) as u64) << 8) | packet[11] as u64;
    base * 300 + ext
}

// First whole section on a PID (sections here are single-TS).
fn find_section(data: &[u8], pid: u16) -> Option<Vec<u8>> {
    for packet in packets(data) {
        if pid_of(packet) == pid && pusi(packet) && has_payload(packet) {
            let payload = &packet[payload_offset(packet)..];
            let pointer = payload[0] as usize;
            return Some(payload[1 + pointer..].to_vec());
        }
    }
    None
}

// (program, pid) entries of a PAT section.
fn parse_pat(section: &[u8]) -> Vec<(u16, u16)> {
    let length = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
    let mut entries = Vec::new();
    let mut offset = 8;
    while offset + 4 <= 3 + length - 4 {
        let program = ((section[offset] as u16) << 8) | section[offset + 1] as u16;
        let pid = (((section[offset + 2] & 0x1f) as u16) << 8) | section[offset + 3] as u16;
        entries.push((program, pid));
        offset += 4;
    }
    entries
}

// (pid, stream_type, descriptors) entries plus the PCR PID of a PMT.
fn parse_pmt(section: &[u8]) -> (u16, Vec<(u16, u8, Vec<u8>)>) {
    let length = (((section[1] & 0x0f) as usize) << 8) | section[2] as usize;
    let end = 3 + length - 4;
    let pcr_pid = (((section[8] & 0x1f) as u16) << 8) | section[9] as u16;
    let program_info = (((section[10] & 0x0f) as usize) << 8) | section[11] as usize;

    let mut streams = Vec::new();
    let mut offset = 12 + program_info;
    while offset + 5 <= end {
        let stream_type = section[offset];
        let pid = (((section[offset + 1] & 0x1f) as u16) << 8) | section[offset + 2] as u16;
        let info_len =
            (((section[offset + 3] & 0x0f) as usize) << 8) | section[offset + 4] as usize;
        let descriptors = section[offset + 5..offset + 5 + info_len].to_vec();
        streams.push((pid, stream_type, descriptors));
        offset += 5 + info_len;
    }
    (pcr_pid, streams)
}

fn video_frame(index: i64, size: usize) -> Block {
    let dts = 10_000_000 + index * 40_000;
    let mut frame = Block::new(vec![(index & 0xff) as u8; size])
        .with_dts(dts)
        .with_pts(dts + 40_000)
        .with_delay(150_000);
    if index % 12 == 0 {
        frame = frame.key_frame();
    }
    frame
}

fn audio_frame(index: i64, size: usize) -> Block {
    let dts = 10_000_000 + index * 24_000;
    Block::new(vec![(index & 0xff) as u8; size])
        .with_dts(dts)
        .with_pts(dts)
}

// Async run with an H.264 input on PID 68 and MPEG audio on PID 69.
fn run_two_streams(mut config: MuxConfig) -> SharedSink {
    config.es_id_pid = true;
    let sink = SharedSink::default();
    let mut mux = TsMux::new(config, Box::new(sink.clone())).unwrap();

    let video_fmt = StreamFormat::video_h264(25, 1, 400_000).with_es_id(68);
    let audio_fmt = StreamFormat::audio_mp2(48_000, 1152, 192_000)
        .with_es_id(69)
        .with_language("eng");
    let video = mux.add_input(&video_fmt).unwrap();
    let audio = mux.add_input(&audio_fmt).unwrap();

    for index in 0..100 {
        mux.send(video, vec![video_frame(index, 2000)]).unwrap();
        mux.send(audio, vec![audio_frame(index * 2, 500)]).unwrap();
        mux.send(audio, vec![audio_frame(index * 2 + 1, 500)]).unwrap();
    }
    mux.close().unwrap();
    sink
}

#[test]
fn test_output_is_packet_aligned_and_synced() {
    let sink = run_two_streams(MuxConfig::default());
    let data = sink.flat();
    assert!(!data.is_empty());

    for packet in packets(&data) {
        assert_eq!(packet[0], 0x47);
    }
}

#[test]
fn test_program_tables_round_trip() {
    let sink = run_two_streams(MuxConfig::default());
    let data = sink.flat();

    let pat = find_section(&data, 0).expect("no PAT in output");
    assert_eq!(pat[0], 0x00);
    let programs = parse_pat(&pat);
    assert_eq!(programs.len(), 1);
    let (program, pmt_pid) = programs[0];
    assert_ne!(program, 0);

    let pmt = find_section(&data, pmt_pid).expect("no PMT in output");
    assert_eq!(pmt[0], 0x02);
    let (pcr_pid, streams) = parse_pmt(&pmt);
    // PCR elected on the video PID
    assert_eq!(pcr_pid, 68);
    let mapped: Vec<(u16, u8)> = streams.iter().map(|(p, t, _)| (*p, *t)).collect();
    assert_eq!(mapped, vec![(68, 0x1b), (69, 0x04)]);

    // the audio ES carries an ISO-639 descriptor with the 2T code
    let audio_descriptors = &streams[1].2;
    let offset = crate::ts::psi::find_descriptor(audio_descriptors, 0x0a)
        .expect("no language descriptor");
    assert_eq!(&audio_descriptors[offset + 2..offset + 5], b"eng");
}

#[test]
fn test_continuity_counters() {
    let sink = run_two_streams(MuxConfig::default());
    let data = sink.flat();

    let mut last_cc: std::collections::HashMap<u16, u8> = Default::default();
    for packet in packets(&data) {
        let pid = pid_of(packet);
        if pid == PID_NULL {
            continue;
        }
        let cc = packet[3] & 0x0f;
        if let Some(&previous) = last_cc.get(&pid) {
            if has_payload(packet) {
                assert_eq!(cc, (previous + 1) & 0x0f, "cc break on PID {}", pid);
            } else {
                assert_eq!(cc, previous, "adaptation-only packet moved cc on PID {}", pid);
            }
        }
        last_cc.insert(pid, cc);
    }
}

#[test]
fn test_pcr_monotonic_on_video_pid() {
    let sink = run_two_streams(MuxConfig::default());
    let data = sink.flat();

    let mut last_pcr = None;
    let mut count = 0;
    for packet in packets(&data) {
        if pid_of(packet) == 68 && has_pcr(packet) {
            let pcr = pcr_value(packet);
            if let Some(previous) = last_pcr {
                assert!(pcr >= previous, "PCR went backwards");
            }
            last_pcr = Some(pcr);
            count += 1;
        }
    }
    assert!(count > 10, "too few PCRs: {}", count);
}

#[test]
fn test_video_pes_starts_on_unit_start() {
    let sink = run_two_streams(MuxConfig::default());
    let data = sink.flat();

    let mut seen = 0;
    for packet in packets(&data) {
        if pid_of(packet) == 68 && pusi(packet) && has_payload(packet) {
            let payload = &packet[payload_offset(packet)..];
            assert_eq!(&payload[0..3], &[0x00, 0x00, 0x01]);
            assert_eq!(payload[3], 0xe0);
            seen += 1;
        }
    }
    assert!(seen > 50, "too few video PES: {}", seen);
}

#[test]
fn test_first_video_packet_has_discontinuity() {
    let sink = run_two_streams(MuxConfig::default());
    let data = sink.flat();

    let first = packets(&data)
        .into_iter()
        .find(|packet| pid_of(packet) == 68)
        .expect("no video packet");
    assert!(pusi(first));
    assert!(first[3] & 0x20 != 0, "no adaptation field");
    assert!(first[5] & 0x80 != 0, "no discontinuity indicator");
}

#[test]
fn test_dvb_conformance_tables() {
    let mut config = MuxConfig::default();
    config.conformance = Conformance::Dvb;
    config.conformance_tables = true;
    let sink = run_two_streams(config);
    let data = sink.flat();

    let pids: std::collections::HashSet<u16> =
        packets(&data).into_iter().map(pid_of).collect();
    assert!(pids.contains(&0));
    assert!(pids.contains(&PID_NIT));
    assert!(pids.contains(&PID_SDT));
    // no TDT in asynchronous mode
    assert!(!pids.contains(&PID_TDT));

    let nit = find_section(&data, PID_NIT).expect("no NIT section");
    assert_eq!(nit[0], 0x40);
    let sdt = find_section(&data, PID_SDT).expect("no SDT section");
    assert_eq!(sdt[0], 0x42);

    // the PAT announces the NIT as program 0
    let pat = find_section(&data, 0).expect("no PAT");
    let programs = parse_pat(&pat);
    assert!(programs.iter().any(|&(program, pid)| program == 0 && pid == PID_NIT));
}

#[test]
fn test_audio_type_in_language_descriptor() {
    let mut config = MuxConfig::default();
    config.inputs = "mpga{audio-type=2,lang=fra}".to_string();
    let sink = run_two_streams(config);
    let data = sink.flat();

    let pat = find_section(&data, 0).unwrap();
    let (_, pmt_pid) = parse_pat(&pat)[0];
    let pmt = find_section(&data, pmt_pid).unwrap();
    let (_, streams) = parse_pmt(&pmt);

    let audio = streams.iter().find(|(pid, _, _)| *pid == 69).unwrap();
    let offset = crate::ts::psi::find_descriptor(&audio.2, 0x0a).unwrap();
    assert_eq!(&audio.2[offset + 2..offset + 5], b"fra");
    assert_eq!(audio.2[offset + 5], 2);
}

#[test]
fn test_cbr_pads_with_null_packets() {
    let mut config = MuxConfig::default();
    config.muxmode = MuxMode::Cbr;
    config.muxrate = 2_000_000;
    let sink = run_two_streams(config);
    let data = sink.flat();

    let nulls = packets(&data)
        .into_iter()
        .filter(|packet| pid_of(packet) == PID_NULL)
        .count();
    assert!(nulls > 0, "CBR output carries no padding");
}

#[test]
fn test_idempotent_output() {
    let mut config = MuxConfig::default();
    config.tsid = 0x42;
    config.tables = "pat{version=0}:pmt{version=0,program=1}".to_string();

    let first = run_two_streams(config.clone()).flat();
    let second = run_two_streams(config).flat();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_rtp_groups() {
    let mut config = MuxConfig::default();
    config.rtp = true;
    config.ssrc = "1.2.3.4".to_string();
    config.granularity = 7;
    let sink = run_two_streams(config);

    let groups = sink.groups();
    assert!(!groups.is_empty());
    let mut last_seq: Option<u16> = None;
    for group in &groups {
        assert_eq!(group[0], 0x80);
        assert_eq!(group[1] & 0x7f, 33);
        assert_eq!(&group[8..12], &[1, 2, 3, 4]);
        assert_eq!((group.len() - 12) % 188, 0);

        let seq = ((group[2] as u16) << 8) | group[3] as u16;
        if let Some(previous) = last_seq {
            assert_eq!(seq, previous.wrapping_add(1));
        }
        last_seq = Some(seq);
    }
}

#[test]
fn test_input_resurrection_keeps_pid() {
    let sink = SharedSink::default();
    let mut mux = TsMux::new(MuxConfig::default(), Box::new(sink.clone())).unwrap();

    let fmt = StreamFormat::video_h264(25, 1, 400_000).with_es_id(12);
    let first = mux.add_input(&fmt).unwrap();
    mux.send(first, vec![video_frame(0, 1000)]).unwrap();
    mux.remove_input(first);

    // same format: the deleted input is resurrected
    let second = mux.add_input(&fmt).unwrap();
    assert_eq!(first, second);

    // different format: a fresh input
    let other_fmt = StreamFormat::video_h264(30, 1, 400_000).with_es_id(13);
    let third = mux.add_input(&other_fmt).unwrap();
    assert_ne!(first, third);
    mux.close().unwrap();
}

#[test]
fn test_unknown_codec_is_rejected() {
    let sink = SharedSink::default();
    let mut mux = TsMux::new(MuxConfig::default(), Box::new(sink.clone())).unwrap();

    // a video format no packetizer accepts (frame rate missing)
    let fmt = StreamFormat::new(crate::av::CodecId::H264);
    assert!(mux.add_input(&fmt).is_err());
    mux.close().unwrap();
}

#[test]
fn test_invalid_timestamps_drop_chain() {
    let sink = SharedSink::default();
    let mut mux = TsMux::new(MuxConfig::default(), Box::new(sink.clone())).unwrap();

    let fmt = StreamFormat::audio_mp2(48_000, 1152, 192_000);
    let audio = mux.add_input(&fmt).unwrap();
    // missing PTS: dropped with a warning, not an error
    let frame = Block::new(vec![0u8; 100]).with_dts(1_000_000);
    mux.send(audio, vec![frame]).unwrap();
    mux.close().unwrap();
    assert!(sink.flat().is_empty());
}

#[test]
fn test_sync_mode_starts_and_stops() {
    let mut config = MuxConfig::default();
    config.sync = true;
    let sink = SharedSink::default();
    let mut mux = TsMux::new(config, Box::new(sink.clone())).unwrap();

    let fmt = StreamFormat::video_h264(25, 1, 400_000);
    let video = mux.add_input(&fmt).unwrap();

    let base = mux.now() + 200_000;
    for index in 0..10 {
        let dts = base + index * 40_000;
        let mut frame = Block::new(vec![0u8; 1000])
            .with_dts(dts)
            .with_pts(dts)
            .with_delay(100_000);
        if index == 0 {
            frame = frame.key_frame();
        }
        mux.send(video, vec![frame]).unwrap();
    }
    std::thread::sleep(std::time::Duration::from_millis(400));
    mux.close().unwrap();

    // whatever was paced out is well-formed
    let data = sink.flat();
    assert_eq!(data.len() % 188, 0);
}
