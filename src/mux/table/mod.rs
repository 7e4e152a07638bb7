//! PSI/SI table packetizers.
//!
//! Tables own the last serialized set of sections and re-emit them either
//! periodically or anchored to upcoming random access points. Unlike
//! inputs, table generators read the stream registry (the PAT enumerates
//! the PMTs, the PMT enumerates the inputs), so they are always driven
//! from inside the mux lock.

use log::warn;

use crate::config::TableOptions;
use crate::ts::packet::TsPacket;
use crate::ts::types::{TS_HEADER_SIZE, TS_PACKET_SIZE};

use super::stream::{Packetizer, Priority, TsBlock, TsStream, T_STD_TS_BUFFER};

pub(crate) mod nit;
pub(crate) mod pat;
pub(crate) mod pmt;
pub(crate) mod sdt;
pub(crate) mod tdt;

/// T-STD peak rate for PSI PIDs, bits/s
pub(crate) const T_STD_PEAK_RATE: u32 = 1_000_000;

/// Table-specific generator state
pub(crate) enum TableKind {
    Pat(pat::PatSys),
    Pmt(pmt::PmtSys),
    Sdt(sdt::SdtSys),
    Nit(nit::NitSys),
    Tdt,
}

/// A PSI/SI table packetizer
pub(crate) struct TsTable {
    pub pack: Packetizer,
    pub name: String,
    /// Registry version the table was last rebuilt against
    pub last_stream_version: u64,
    /// The currently repeated sections, pointer field included
    pub last_table: Vec<Vec<u8>>,
    /// Interval between sections, microseconds
    pub interval: i64,
    /// Interval between TS packets of one section, microseconds
    pub ts_interval: i64,
    pub period: i64,
    pub offset: i64,
    /// -1 disables RAP anchoring
    pub rap_advance: i64,
    pub min_period: i64,
    pub max_period: i64,
    /// Date of the last (or next forced, -1) emission
    pub last_muxing: i64,
    pub cc: u8,
    /// The table defines a PAT entry (PMT, or NIT as program 0)
    pub defines_program: bool,
    pub program: u16,
    pub kind: TableKind,
}

impl TsTable {
    pub(crate) fn new(name: &str, opts: &TableOptions, kind: TableKind) -> Self {
        let mut table = Self {
            pack: Packetizer::new(opts.pid, opts.total_bitrate),
            name: name.to_string(),
            last_stream_version: 0,
            last_table: Vec::new(),
            interval: opts.interval_ms as i64 * 1000,
            ts_interval: opts.ts_interval_ms as i64 * 1000,
            period: opts.period_ms as i64 * 1000,
            offset: opts.offset_ms as i64 * 1000,
            rap_advance: if opts.rap_advance_ms == -1 {
                -1
            } else {
                opts.rap_advance_ms as i64 * 1000
            },
            min_period: opts.rap_min_period_ms as i64 * 1000,
            max_period: opts.rap_max_period_ms as i64 * 1000,
            last_muxing: 0,
            cc: 0,
            defines_program: false,
            program: 0,
            kind,
        };
        table.pack.peak_bitrate = T_STD_PEAK_RATE;
        table.pack.priority = Priority::Si;
        table
    }

    /// The period the conformance checks apply to
    pub(crate) fn checked_period(&self) -> i64 {
        if self.rap_advance == -1 {
            self.max_period
        } else {
            self.period
        }
    }

    /// Forces an emission at the next send pass
    pub(crate) fn force(&mut self) {
        self.last_muxing = -1;
    }
}

/// Number of TS packets needed for one section
pub(crate) fn nb_ts(section_len: usize) -> usize {
    let ts_payload = TS_PACKET_SIZE - TS_HEADER_SIZE;
    (section_len + ts_payload - 1) / ts_payload
}

/// Splits a section into TS packets, stuffing the tail with 0xff.
///
/// Unlike the input packetizer, durations and muxing timestamps are
/// assigned by the caller.
pub(crate) fn build_ts(table: &mut TsTable, section: &[u8]) -> Vec<TsPacket> {
    let ts_payload = TS_PACKET_SIZE - TS_HEADER_SIZE;
    let count = nb_ts(section.len());
    let mut out = Vec::with_capacity(count);

    for (index, chunk) in section.chunks(ts_payload).enumerate() {
        let mut packet = TsPacket::init();
        packet.set_pid(table.pack.pid);
        table.cc = table.cc.wrapping_add(1);
        packet.set_cc(table.cc);
        if index == 0 {
            packet.set_unit_start();
        }

        let mut payload = [0xffu8; TS_PACKET_SIZE - TS_HEADER_SIZE];
        payload[..chunk.len()].copy_from_slice(chunk);
        packet.set_payload(&payload);
        out.push(packet);
    }

    out
}

/// Wall time needed to output all sections of the table
pub(crate) fn duration(table: &TsTable) -> i64 {
    let mut total = -table.interval;
    for section in &table.last_table {
        total += (nb_ts(section.len()) as i64 - 1) * table.ts_interval + table.interval;
    }
    total.max(0)
}

/// Earliest RAP suitable for an anchored emission
fn next_rap(table: &TsTable, raps: &[i64]) -> i64 {
    for &rap in raps {
        let anchored = rap - table.rap_advance;
        if anchored > table.last_muxing + table.min_period {
            return anchored;
        }
    }
    -1
}

/// Muxing date of the table's next packet, or -1 when nothing is due
pub(crate) fn next_muxing(
    table: &TsTable,
    now: i64,
    packet_interval: i64,
    max_prepare: i64,
    raps: &[i64],
) -> i64 {
    let prepare = max_prepare + packet_interval;

    if table.last_muxing == -1 {
        // forced
        return now + prepare;
    }

    if table.rap_advance == -1 {
        let next = table.last_muxing + table.period;

        // The offset avoids that after an error affecting all tables with
        // the same configuration, they all get sent at the same time.
        if next < now {
            warn!(
                "exceeding period by {} us",
                now + prepare + table.offset - next
            );
            return now + prepare + table.offset;
        }
        next
    } else {
        if now + prepare > table.last_muxing + table.max_period {
            return now + prepare;
        }

        let rap = next_rap(table, raps);
        if rap == -1 {
            return -1;
        }

        let next = rap - duration(table);
        if next < now {
            return now + prepare;
        }
        next
    }
}

/// Emits the table's sections as TS packets when the emission date is due
pub(crate) fn send_common(
    table: &mut TsTable,
    now: i64,
    packet_interval: i64,
    max_prepare: i64,
    raps: &[i64],
) -> Option<Vec<TsBlock>> {
    let mut next = next_muxing(table, now, packet_interval, max_prepare, raps);
    if next == -1 || next > now + max_prepare + 3 * packet_interval {
        return None;
    }

    let mut out = Vec::new();
    let sections = std::mem::take(&mut table.last_table);
    for section in &sections {
        for packet in build_ts(table, section) {
            let mut block = TsBlock::new(packet);
            block.dts = next + packet_interval;
            block.delay = packet_interval * 2;
            out.push(block);
            next += table.ts_interval;
        }
        next += table.interval - table.ts_interval;
    }
    table.last_table = sections;

    if table.last_muxing == -1 && table.rap_advance == -1 && table.offset != 0 {
        // Try to take the offset into account even though we are forced.
        table.last_muxing = next - (table.period - table.offset);
    } else {
        table.last_muxing = next;
    }

    Some(out)
}

/// Recomputes the table bitrate from its sections; returns true when the
/// stream version must be bumped so the mux re-derives its parameters
pub(crate) fn update_total_bitrate(table: &mut TsTable) -> bool {
    let total_size: u64 = table
        .last_table
        .iter()
        .map(|section| nb_ts(section.len()) as u64 * TS_PACKET_SIZE as u64 * 8)
        .sum();

    let basis = if table.rap_advance == -1 {
        table.period
    } else {
        table.min_period
    };
    let total_bitrate = ((total_size * 1_000_000 + basis as u64 - 1) / basis as u64) as u32;

    let changed = table.pack.total_bitrate != total_bitrate;
    table.pack.total_bitrate = total_bitrate;
    if total_bitrate != 0 {
        table.pack.ts_delay = T_STD_TS_BUFFER as i64 * 8_000_000 / total_bitrate as i64;
    }
    changed
}

/// Drives one table: rebuild when the registry moved, then emit when due
pub(crate) fn table_send(ts: &mut TsStream, idx: usize, now: i64) -> Option<Vec<TsBlock>> {
    enum Tag {
        Pat,
        Pmt,
        Sdt,
        Nit,
        Tdt,
    }
    let tag = match &ts.tables[idx].table.kind {
        TableKind::Pat(_) => Tag::Pat,
        TableKind::Pmt(_) => Tag::Pmt,
        TableKind::Sdt(_) => Tag::Sdt,
        TableKind::Nit(_) => Tag::Nit,
        TableKind::Tdt => Tag::Tdt,
    };
    match tag {
        Tag::Pat => pat::send(ts, idx, now),
        Tag::Pmt => pmt::send(ts, idx, now),
        Tag::Sdt => sdt::send(ts, idx, now),
        Tag::Nit => nit::send(ts, idx, now),
        Tag::Tdt => tdt::send(ts, idx, now),
    }
}

/// Seals a section list and refreshes the table bitrate; shared tail of
/// every generator's update path
pub(crate) fn install_sections(table: &mut TsTable, sections: Vec<Vec<u8>>) -> bool {
    table.last_table = sections;
    update_total_bitrate(table)
}
