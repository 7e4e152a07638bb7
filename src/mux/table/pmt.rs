//! Program Map Table generator (ISO/IEC 13818-1).

use bytes::BufMut;
use log::{debug, warn};

use crate::config::{Conformance, OptionMap, TableOptions};
use crate::ts::crc::Crc32Mpeg2;
use crate::ts::psi;
use crate::ts::types::{PID_NULL, TABLE_ID_PMT};

use super::super::stream::{TsBlock, TsStream};
use super::{TableKind, TsTable};

const DEFAULT_PERIOD_MS: u32 = 300;
const DEFAULT_MAX_PERIOD_MS: u32 = 700;
const DEFAULT_OFFSET_MS: u32 = 150;
const DEFAULT_AUTODELETE_MS: u32 = 5000;

/// One elementary stream tracked by the PMT
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct PmtEs {
    pub pid: u16,
    /// -1 marks a configured PID with no live input (manual mode)
    pub es_version: i64,
}

/// PMT generator state
pub(crate) struct PmtSys {
    pub auto: bool,
    /// Exclude inputs idle for longer than this, microseconds (0 disables)
    pub autodelete: i64,
    pub last_check: i64,
    pub es: Option<Vec<PmtEs>>,
    pub pcr_pid: u16,
    pub version: u8,
}

// What the section builder needs to know about one input.
#[derive(Clone)]
struct EsDescription {
    pid: u16,
    stream_type: u8,
    descriptors: Vec<u8>,
}

pub(crate) fn open(options: &OptionMap, ts: &TsStream) -> TsTable {
    let opts = TableOptions::from_options(
        options,
        PID_NULL,
        DEFAULT_PERIOD_MS,
        DEFAULT_MAX_PERIOD_MS,
        DEFAULT_OFFSET_MS,
    );

    let version = match opts.extra.get_int("version") {
        Some(version) if version != -1 => (version % 32) as u8,
        _ => rand::random::<u8>() % 32,
    };
    let autodelete = opts
        .extra
        .get_int("autodelete-delay")
        .unwrap_or(DEFAULT_AUTODELETE_MS as i64)
        * 1000;

    let mut table = TsTable::new(
        "pmt",
        &opts,
        TableKind::Pmt(PmtSys {
            auto: true,
            autodelete,
            last_check: 0,
            es: None,
            pcr_pid: PID_NULL,
            version,
        }),
    );
    table.defines_program = true;

    match ts.params.conformance {
        Conformance::Atsc => {
            if table.checked_period() > 400_000 {
                warn!("PMT period shouldn't exceed 400 ms in ATSC systems");
            }
        }
        Conformance::Dvb => {
            if table.checked_period() > 100_000 {
                warn!("PMT period shouldn't exceed 100 ms in DVB systems");
            }
        }
        _ => {}
    }

    // program number: configured, validated unique; else random
    let configured = opts.extra.get_int("program").unwrap_or(-1);
    let mut program = if configured != -1 {
        (configured % 65536) as u16
    } else {
        rand::random::<u16>()
    };
    while !validate_program(ts, program) {
        if i64::from(program) == configured {
            warn!("invalid program {}", program);
        }
        program = rand::random::<u16>();
    }
    table.program = program;

    let es_option = opts.extra.get("es").unwrap_or("auto").to_string();
    if es_option.is_empty() || es_option == "auto" {
        build_es(&mut table, ts, 0);
    } else {
        let mut es = Vec::new();
        for entry in es_option.split(':') {
            match entry.trim().parse::<u16>() {
                Ok(pid) => es.push(PmtEs {
                    pid,
                    es_version: -1,
                }),
                Err(_) => warn!("invalid ES {}", entry),
            }
        }
        if let TableKind::Pmt(sys) = &mut table.kind {
            sys.auto = false;
            sys.es = Some(es);
        }
        check_es(&mut table, ts, 0);
    }

    table.force();
    debug!(
        "setting up PMT program {} mode {}",
        table.program,
        if matches!(&table.kind, TableKind::Pmt(sys) if sys.auto) {
            "auto"
        } else {
            "manual"
        }
    );
    table
}

/// A program number must be non-zero (reserved for the NIT) and unique
fn validate_program(ts: &TsStream, program: u16) -> bool {
    if program == 0 {
        return false;
    }
    !ts.tables
        .iter()
        .any(|unit| unit.table.defines_program && unit.table.program == program)
}

fn describe_input(ts: &TsStream, pid: u16) -> Option<EsDescription> {
    ts.inputs
        .iter()
        .find(|unit| unit.input.pack.pid == pid)
        .map(|unit| EsDescription {
            pid,
            stream_type: unit.input.stream_type,
            descriptors: unit.input.descriptors.clone(),
        })
}

/// Auto mode: rebuild the ES list from the live inputs; returns whether
/// the PMT changed
fn build_es(table: &mut TsTable, ts: &TsStream, now: i64) -> bool {
    let autodelete = match &table.kind {
        TableKind::Pmt(sys) => sys.autodelete,
        _ => return false,
    };

    let mut es = Vec::new();
    let mut pcr_pid = PID_NULL;
    for unit in &ts.inputs {
        let input = &unit.input;
        if autodelete != 0 && input.last_muxing + autodelete < now {
            continue;
        }
        es.push(PmtEs {
            pid: input.pack.pid,
            es_version: input.es_version as i64,
        });
        if input.pcr_period != 0 && pcr_pid == PID_NULL {
            pcr_pid = input.pack.pid;
        }
    }

    // Keep the list in ascending order to get reproducible behaviour.
    es.sort();

    table.last_stream_version = ts.stream_version;

    let changed = match &table.kind {
        TableKind::Pmt(sys) => sys.pcr_pid != pcr_pid || sys.es.as_ref() != Some(&es),
        _ => false,
    };
    if !changed {
        return false;
    }

    let descriptions: Vec<EsDescription> = es
        .iter()
        .filter_map(|entry| describe_input(ts, entry.pid))
        .collect();

    if let TableKind::Pmt(sys) = &mut table.kind {
        sys.es = Some(es);
        sys.pcr_pid = pcr_pid;
        sys.version = (sys.version + 1) % 32;
    }
    update_table(table, &descriptions);
    true
}

/// Manual mode: refresh the es_version and PCR PID of the configured PIDs
fn check_es(table: &mut TsTable, ts: &TsStream, now: i64) -> bool {
    let autodelete = match &table.kind {
        TableKind::Pmt(sys) => sys.autodelete,
        _ => return false,
    };
    let mut changed = table.last_table.is_empty();
    let mut pcr_pid = PID_NULL;

    let mut es = match &table.kind {
        TableKind::Pmt(sys) => sys.es.clone().unwrap_or_default(),
        _ => return false,
    };
    for entry in &mut es {
        let found = ts.inputs.iter().find(|unit| {
            let input = &unit.input;
            if autodelete != 0 && input.last_muxing + autodelete < now {
                return false;
            }
            input.pack.pid == entry.pid
        });

        let es_version = match found {
            Some(unit) => {
                if unit.input.pcr_period != 0 && pcr_pid == PID_NULL {
                    pcr_pid = unit.input.pack.pid;
                }
                unit.input.es_version as i64
            }
            None => -1,
        };
        if entry.es_version != es_version {
            changed = true;
        }
        entry.es_version = es_version;
    }

    let pcr_moved = match &table.kind {
        TableKind::Pmt(sys) => sys.pcr_pid != pcr_pid,
        _ => false,
    };
    if changed || pcr_moved {
        let descriptions: Vec<EsDescription> = es
            .iter()
            .filter(|entry| entry.es_version != -1)
            .filter_map(|entry| describe_input(ts, entry.pid))
            .collect();
        if let TableKind::Pmt(sys) = &mut table.kind {
            sys.es = Some(es);
            sys.pcr_pid = pcr_pid;
            sys.version = (sys.version + 1) % 32;
        }
        update_table(table, &descriptions);
    } else if let TableKind::Pmt(sys) = &mut table.kind {
        sys.es = Some(es);
    }
    changed
}

/// Serializes the single PMT section (one section per program, normative)
fn update_table(table: &mut TsTable, descriptions: &[EsDescription]) {
    let (version, pcr_pid) = match &table.kind {
        TableKind::Pmt(sys) => (sys.version, sys.pcr_pid),
        _ => return,
    };

    if descriptions.is_empty() {
        debug!("no ES left in PMT PID {}, disabling", table.pack.pid);
        table.defines_program = false;
        table.last_table.clear();
        table.pack.total_bitrate = 0;
        return;
    }
    table.defines_program = true;

    let crc = Crc32Mpeg2::new();
    let mut section = psi::begin_section(TABLE_ID_PMT, table.program, version, 0);
    section.put_u16(0xe000 | pcr_pid);
    section.put_u16(0xf000); // no program descriptors

    let mut written = 0;
    for description in descriptions {
        if psi::section_room(&section) < 5 + description.descriptors.len() {
            warn!("PMT is too big and can't be split");
            break;
        }
        section.put_u8(description.stream_type);
        section.put_u16(0xe000 | description.pid);
        section.put_u16(0xf000 | description.descriptors.len() as u16);
        section.put_slice(&description.descriptors);
        written += 1;
    }

    psi::finish_section(&mut section, &crc);
    super::install_sections(table, vec![section.to_vec()]);

    debug!(
        "new PMT PID {} version {} with {} ES, bitrate {}",
        table.pack.pid, version, written, table.pack.total_bitrate
    );
}

/// PMT send pass: rebuild on registry moves or autodelete expiry, then
/// emit when due
pub(crate) fn send(ts: &mut TsStream, idx: usize, now: i64) -> Option<Vec<TsBlock>> {
    let (auto, autodelete, last_check) = match &ts.tables[idx].table.kind {
        TableKind::Pmt(sys) => (sys.auto, sys.autodelete, sys.last_check),
        _ => return None,
    };
    let last_stream_version = ts.tables[idx].table.last_stream_version;

    if ts.stream_version > last_stream_version
        || (autodelete != 0 && last_check + autodelete < now)
    {
        // The registry cannot be borrowed while the table is rebuilt, so
        // the table briefly leaves its slot.
        let mut table = std::mem::replace(
            &mut ts.tables[idx].table,
            TsTable::new("pmt", &placeholder_options(), TableKind::Tdt),
        );
        if let TableKind::Pmt(sys) = &mut table.kind {
            sys.last_check = now;
        }
        let bitrate = table.pack.total_bitrate;
        let changed = if auto {
            build_es(&mut table, ts, now)
        } else {
            check_es(&mut table, ts, now)
        };
        if changed {
            table.force();
        }
        if table.pack.total_bitrate != bitrate {
            // make sure the operating mode is re-derived
            ts.stream_version += 1;
        }
        ts.tables[idx].table = table;
    }

    let packet_interval = ts.params.packet_interval;
    let max_prepare = ts.params.max_prepare;
    let raps = ts.raps.clone();
    super::send_common(
        &mut ts.tables[idx].table,
        now,
        packet_interval,
        max_prepare,
        &raps,
    )
}

fn placeholder_options() -> TableOptions {
    TableOptions::from_options(
        &OptionMap::default(),
        PID_NULL,
        DEFAULT_PERIOD_MS,
        DEFAULT_MAX_PERIOD_MS,
        DEFAULT_OFFSET_MS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::StreamFormat;
    use crate::config::{parse_chain, InputOptions};
    use crate::mux::input::{self, InputCodec};
    use crate::mux::stream::{InputUnit, TsParameters};
    use crate::utils::charset::DvbCharset;
    use pretty_assertions::assert_eq;

    fn stream_with_inputs() -> TsStream {
        let mut ts = TsStream {
            stream_version: 1,
            raps: Vec::new(),
            inputs: Vec::new(),
            tables: Vec::new(),
            params: TsParameters {
                conformance: Conformance::None,
                charset: DvbCharset::default(),
                packet_interval: 2_000,
                max_prepare: 4_000,
            },
            tsid: 1,
            nid: 0xffff,
        };

        let fmt = StreamFormat::audio_mp2(48_000, 1152, 192_000);
        let mut audio = input::TsInput::new(
            &fmt,
            &InputOptions::default(),
            InputCodec::Mpga(Default::default()),
        );
        audio.pack.pid = 257;
        audio.stream_type = 0x04;
        ts.inputs.push(InputUnit {
            handle: 1,
            queue: Default::default(),
            input: audio,
        });

        let fmt = StreamFormat::video_h264(25, 1, 4_000_000);
        let mut video = input::TsInput::new(
            &fmt,
            &InputOptions::default(),
            InputCodec::Mpga(Default::default()),
        );
        video.pack.pid = 256;
        video.stream_type = 0x1b;
        video.pcr_period = 40_000;
        ts.inputs.push(InputUnit {
            handle: 2,
            queue: Default::default(),
            input: video,
        });

        ts
    }

    #[test]
    fn test_auto_pmt_lists_sorted_es_and_pcr() {
        let ts = stream_with_inputs();
        let chain = parse_chain("pmt{version=0,program=1}").unwrap();
        let table = open(&chain[0].options, &ts);

        assert!(table.defines_program);
        assert_eq!(table.program, 1);
        let section = &table.last_table[0];
        // PCR PID is the video input
        assert_eq!(((section[9] as u16 & 0x1f) << 8) | section[10] as u16, 256);
        // first ES is PID 256 (sorted ascending), stream type H.264
        assert_eq!(section[13], 0x1b);
        assert_eq!(((section[14] as u16 & 0x1f) << 8) | section[15] as u16, 256);
        // then the audio ES
        assert_eq!(section[18], 0x04);
        assert_eq!(((section[19] as u16 & 0x1f) << 8) | section[20] as u16, 257);

        let crc = Crc32Mpeg2::new();
        assert_eq!(crc.calculate(&section[1..]), 0);
    }

    #[test]
    fn test_es_version_move_bumps_table_version() {
        let mut ts = stream_with_inputs();
        let chain = parse_chain("pmt{version=0,program=1}").unwrap();
        let table = open(&chain[0].options, &ts);
        ts.tables.push(super::super::super::stream::TableUnit {
            queue: Default::default(),
            table,
        });

        // language change on the audio input
        ts.inputs[0].input.es_version += 1;
        ts.stream_version += 1;
        let _ = send(&mut ts, 0, 1_000_000);

        // the open-time build took version 0 to 1, the change to 2
        let section = &ts.tables[0].table.last_table[0];
        assert_eq!((section[6] >> 1) & 0x1f, 2);
    }

    #[test]
    fn test_program_zero_is_rejected() {
        let ts = stream_with_inputs();
        assert!(!validate_program(&ts, 0));
        assert!(validate_program(&ts, 1));
    }
}
