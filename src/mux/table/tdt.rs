//! Time and Date Table generator (EN 300 468).
//!
//! A short-form section carrying UTC as MJD plus BCD time, rebuilt for
//! every emission. Only meaningful in wall-clock paced operation.

use bytes::BufMut;
use chrono::{Datelike, Duration, Timelike, Utc};
use log::{debug, warn};

use crate::config::{Conformance, OptionMap, TableOptions};
use crate::ts::psi;
use crate::ts::types::{PID_TDT, TABLE_ID_TDT, TS_PACKET_SIZE};

use super::super::stream::{TsBlock, TsStream};
use super::{TableKind, TsTable};

const DEFAULT_PERIOD_MS: u32 = 25000;
const DEFAULT_MAX_PERIOD_MS: u32 = 29000;
const DEFAULT_OFFSET_MS: u32 = 0;

// days from 0001-01-01 (CE) to the MJD epoch 1858-11-17
const MJD_EPOCH_DAYS_FROM_CE: i32 = 678576;

pub(crate) fn open(options: &OptionMap, ts: &TsStream) -> TsTable {
    let opts = TableOptions::from_options(
        options,
        PID_TDT,
        DEFAULT_PERIOD_MS,
        DEFAULT_MAX_PERIOD_MS,
        DEFAULT_OFFSET_MS,
    );

    let mut table = TsTable::new("tdt", &opts, TableKind::Tdt);
    // RAP advance mode is not adequate here
    table.rap_advance = -1;

    match ts.params.conformance {
        Conformance::Atsc => warn!("TDT is not compatible with ATSC conformance"),
        Conformance::Dvb => {
            if table.period > 30_000_000 {
                warn!("TDT period shouldn't exceed 30 s in DVB systems");
            }
        }
        _ => {}
    }

    table.pack.total_bitrate = ((TS_PACKET_SIZE as u64 * 8 * 1_000_000
        + table.period as u64
        - 1)
        / table.period as u64) as u32;

    table.force();
    debug!("setting up TDT");
    table
}

fn bcd(value: u32) -> u8 {
    (((value / 10) << 4) | (value % 10)) as u8
}

/// Builds the TDT section for the table's emission date
fn build_tdt(table: &mut TsTable, now: i64, packet_interval: i64) -> Vec<TsBlock> {
    let offset = table.last_muxing - now;
    let output_time = Utc::now() + Duration::microseconds(offset);

    let mjd = output_time.date_naive().num_days_from_ce() - MJD_EPOCH_DAYS_FROM_CE;
    let utc: u64 = ((mjd as u64 & 0xffff) << 24)
        | ((bcd(output_time.hour()) as u64) << 16)
        | ((bcd(output_time.minute()) as u64) << 8)
        | bcd(output_time.second()) as u64;

    let mut section = psi::begin_short_section(TABLE_ID_TDT);
    section.put_u16((utc >> 24) as u16);
    section.put_u8((utc >> 16) as u8);
    section.put_u8((utc >> 8) as u8);
    section.put_u8(utc as u8);
    psi::finish_short_section(&mut section);

    debug!("new TDT date {:x}", utc);

    let packets = super::build_ts(table, &section);
    packets
        .into_iter()
        .map(|packet| {
            let mut block = TsBlock::new(packet);
            block.dts = table.last_muxing + packet_interval;
            block.delay = packet_interval * 2;
            block
        })
        .collect()
}

/// TDT send pass: rebuild the section with the current clock on every
/// period
pub(crate) fn send(ts: &mut TsStream, idx: usize, now: i64) -> Option<Vec<TsBlock>> {
    let packet_interval = ts.params.packet_interval;
    let max_prepare = ts.params.max_prepare;
    let raps = ts.raps.clone();
    let table = &mut ts.tables[idx].table;

    let next = super::next_muxing(table, now, packet_interval, max_prepare, &raps);
    if next == -1 || next > now + max_prepare + 3 * packet_interval {
        return None;
    }
    table.last_muxing = next;

    Some(build_tdt(table, now, packet_interval))
}
