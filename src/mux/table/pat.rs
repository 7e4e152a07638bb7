//! Program Association Table generator (ISO/IEC 13818-1).

use bytes::BufMut;
use log::{debug, warn};

use crate::config::{Conformance, OptionMap, TableOptions};
use crate::ts::crc::Crc32Mpeg2;
use crate::ts::psi;
use crate::ts::types::{PID_PAT, TABLE_ID_PAT};

use super::super::stream::{TsBlock, TsStream};
use super::{TableKind, TsTable};

const DEFAULT_PERIOD_MS: u32 = 300;
const DEFAULT_MAX_PERIOD_MS: u32 = 700;
const DEFAULT_OFFSET_MS: u32 = 0;

/// One (program, PMT PID) association
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct PatProgram {
    pub program: u16,
    pub pid: u16,
}

/// PAT generator state
pub(crate) struct PatSys {
    pub auto: bool,
    /// None until the first build, so an empty registry still triggers one
    pub programs: Option<Vec<PatProgram>>,
    pub version: u8,
}

pub(crate) fn open(options: &OptionMap, ts: &TsStream) -> TsTable {
    let opts = TableOptions::from_options(
        options,
        PID_PAT,
        DEFAULT_PERIOD_MS,
        DEFAULT_MAX_PERIOD_MS,
        DEFAULT_OFFSET_MS,
    );

    let version = match opts.extra.get_int("version") {
        Some(version) if version != -1 => (version % 32) as u8,
        _ => rand::random::<u8>() % 32,
    };

    let mut table = TsTable::new(
        "pat",
        &opts,
        TableKind::Pat(PatSys {
            auto: true,
            programs: None,
            version,
        }),
    );

    match ts.params.conformance {
        Conformance::Atsc | Conformance::Dvb => {
            if table.checked_period() > 100_000 {
                warn!("PAT period shouldn't exceed 100 ms in {} systems",
                      ts.params.conformance.name());
            }
        }
        _ => {}
    }

    let programs_option = opts.extra.get("programs").unwrap_or("auto");
    if programs_option.is_empty() || programs_option == "auto" {
        let snapshot = program_snapshot(ts);
        if let TableKind::Pat(sys) = &mut table.kind {
            sys.auto = true;
        }
        build_programs(&mut table, snapshot, ts.stream_version, ts.tsid);
    } else {
        let mut programs = Vec::new();
        for entry in programs_option.split(':') {
            match entry.split_once('/') {
                Some((program, pid)) => {
                    let parsed = program
                        .trim()
                        .parse::<u16>()
                        .ok()
                        .zip(pid.trim().parse::<u16>().ok());
                    match parsed {
                        Some((program, pid)) => programs.push(PatProgram { program, pid }),
                        None => warn!("invalid program {}", entry),
                    }
                }
                None => warn!("invalid program {}", entry),
            }
        }
        if let TableKind::Pat(sys) = &mut table.kind {
            sys.auto = false;
            sys.programs = Some(programs);
        }
        update_table(&mut table, ts.tsid);
    }

    table.force();
    debug!(
        "setting up PAT TSID {} mode {}",
        ts.tsid,
        if matches!(&table.kind, TableKind::Pat(sys) if sys.auto) {
            "auto"
        } else {
            "manual"
        }
    );
    table
}

fn program_snapshot(ts: &TsStream) -> Vec<PatProgram> {
    ts.tables
        .iter()
        .filter(|unit| unit.table.defines_program)
        .map(|unit| PatProgram {
            program: unit.table.program,
            pid: unit.table.pack.pid,
        })
        .collect()
}

/// Rebuilds the program list in auto mode; returns whether the PAT changed
fn build_programs(
    table: &mut TsTable,
    mut programs: Vec<PatProgram>,
    stream_version: u64,
    tsid: u16,
) -> bool {
    table.last_stream_version = stream_version;

    // Keep the list in ascending order to get reproducible behaviour.
    programs.sort();

    let TableKind::Pat(sys) = &mut table.kind else {
        return false;
    };
    if sys.programs.as_ref() == Some(&programs) {
        return false;
    }

    sys.programs = Some(programs);
    sys.version = (sys.version + 1) % 32;
    update_table(table, tsid);
    true
}

/// Serializes the PAT sections; returns whether the bitrate moved
fn update_table(table: &mut TsTable, tsid: u16) -> bool {
    let TableKind::Pat(sys) = &table.kind else {
        return false;
    };
    let programs = sys.programs.clone().unwrap_or_default();
    let version = sys.version;

    if programs.is_empty() {
        debug!("no program left in PAT, disabling");
        table.last_table.clear();
        table.pack.total_bitrate = 0;
        return false;
    }

    let crc = Crc32Mpeg2::new();
    let mut sections = Vec::new();
    let mut remaining = programs.as_slice();
    let mut section_number = 0u8;

    while !remaining.is_empty() || sections.is_empty() {
        let mut section = psi::begin_section(TABLE_ID_PAT, tsid, version, section_number);
        while let Some((head, tail)) = remaining.split_first() {
            if psi::section_room(&section) < 4 {
                break;
            }
            section.put_u16(head.program);
            section.put_u16(0xe000 | head.pid);
            remaining = tail;
        }
        sections.push(section);
        section_number += 1;
    }

    let last_section = (sections.len() - 1) as u8;
    let mut sealed = Vec::with_capacity(sections.len());
    for mut section in sections {
        psi::set_last_section(&mut section, last_section);
        psi::finish_section(&mut section, &crc);
        sealed.push(section.to_vec());
    }

    let changed = super::install_sections(table, sealed);

    debug!(
        "new PAT version {} with {} programs {} sections, bitrate {}",
        version,
        programs.len(),
        last_section + 1,
        table.pack.total_bitrate
    );
    changed
}

/// PAT send pass: rebuild when the registry moved, then emit when due
pub(crate) fn send(ts: &mut TsStream, idx: usize, now: i64) -> Option<Vec<TsBlock>> {
    let (auto, last_stream_version) = match &ts.tables[idx].table.kind {
        TableKind::Pat(sys) => (sys.auto, ts.tables[idx].table.last_stream_version),
        _ => return None,
    };

    if auto && ts.stream_version > last_stream_version {
        let snapshot = program_snapshot(ts);
        let stream_version = ts.stream_version;
        let tsid = ts.tsid;
        let table = &mut ts.tables[idx].table;
        let bitrate = table.pack.total_bitrate;
        if build_programs(table, snapshot, stream_version, tsid) {
            table.force();
        }
        // make sure the operating mode is re-derived
        if table.pack.total_bitrate != bitrate {
            ts.stream_version += 1;
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_chain;
    use crate::utils::charset::DvbCharset;
    use pretty_assertions::assert_eq;

    fn empty_stream() -> TsStream {
        TsStream {
            stream_version: 0,
            raps: Vec::new(),
            inputs: Vec::new(),
            tables: Vec::new(),
            params: super::super::super::stream::TsParameters {
                conformance: Conformance::None,
                charset: DvbCharset::default(),
                packet_interval: 2_000,
                max_prepare: 4_000,
            },
            tsid: 0x0042,
            nid: 0xffff,
        }
    }

    #[test]
    fn test_manual_programs_build_sections() {
        let ts = empty_stream();
        let chain = parse_chain("pat{programs=1/336:2/352,version=5}").unwrap();
        let table = open(&chain[0].options, &ts);

        assert_eq!(table.last_table.len(), 1);
        let section = &table.last_table[0];
        assert_eq!(section[0], 0); // pointer field
        assert_eq!(section[1], TABLE_ID_PAT);
        // TSID
        assert_eq!(&section[4..6], &[0x00, 0x42]);
        // version 5, current
        assert_eq!(section[6], 0xc0 | (5 << 1) | 1);
        // program 1 -> PID 336
        assert_eq!(&section[9..13], &[0x00, 0x01, 0xe1, 0x50]);
        // program 2 -> PID 352
        assert_eq!(&section[13..17], &[0x00, 0x02, 0xe1, 0x60]);

        // sealed with a valid CRC
        let crc = Crc32Mpeg2::new();
        assert_eq!(crc.calculate(&section[1..]), 0);
    }

    #[test]
    fn test_auto_rebuild_on_version_move() {
        let mut ts = empty_stream();
        let chain = parse_chain("pat{version=0}").unwrap();
        let table = open(&chain[0].options, &ts);
        ts.tables.push(super::super::super::stream::TableUnit {
            queue: Default::default(),
            table,
        });

        // no programs yet: forced send yields nothing
        assert!(send(&mut ts, 0, 1_000_000).is_none()
            || ts.tables[0].table.last_table.is_empty());

        // a program-defining table appears
        let chain = parse_chain("pat{version=3}").unwrap();
        let mut fake_pmt = open(&chain[0].options, &ts);
        fake_pmt.defines_program = true;
        fake_pmt.program = 7;
        fake_pmt.pack.pid = 336;
        ts.tables.push(super::super::super::stream::TableUnit {
            queue: Default::default(),
            table: fake_pmt,
        });
        ts.stream_version += 1;

        let out = send(&mut ts, 0, 10_000_000);
        assert!(out.is_some());
        let section = &ts.tables[0].table.last_table[0];
        // program 7 -> PID 336
        assert_eq!(&section[9..13], &[0x00, 0x07, 0xe1, 0x50]);
        // one bump for the empty table at open, one for the new program
        assert_eq!((section[6] >> 1) & 0x1f, 2);
    }
}
