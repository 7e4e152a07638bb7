//! Network Information Table generator (EN 300 468).
//!
//! Declares a single transport stream on the configured network and
//! occupies program 0 in the PAT, as the NIT PID is signalled there.

use bytes::BufMut;
use log::{debug, warn};

use crate::config::{Conformance, OptionMap, TableOptions};
use crate::ts::crc::Crc32Mpeg2;
use crate::ts::psi;
use crate::ts::types::{DESC_TAG_NETWORK_NAME, PID_NIT, TABLE_ID_NIT_ACTUAL};

use super::super::stream::{TsBlock, TsStream};
use super::{TableKind, TsTable};

const DEFAULT_PERIOD_MS: u32 = 8000;
const DEFAULT_MAX_PERIOD_MS: u32 = 8000;
const DEFAULT_OFFSET_MS: u32 = 0;
const DEFAULT_NETWORK_NAME: &str = "tsmux network";

/// NIT generator state
pub(crate) struct NitSys {
    pub network_name: Vec<u8>,
    pub version: u8,
}

pub(crate) fn open(options: &OptionMap, ts: &TsStream) -> TsTable {
    let opts = TableOptions::from_options(
        options,
        PID_NIT,
        DEFAULT_PERIOD_MS,
        DEFAULT_MAX_PERIOD_MS,
        DEFAULT_OFFSET_MS,
    );

    let version = match opts.extra.get_int("version") {
        Some(version) if version != -1 => (version % 32) as u8,
        _ => rand::random::<u8>() % 32,
    };

    let network_name_option = opts
        .extra
        .get("network-name")
        .unwrap_or(DEFAULT_NETWORK_NAME)
        .to_string();
    let mut network_name = ts.params.charset.encode(&network_name_option);
    if network_name.len() > 255 {
        warn!("network name is too large: {}", network_name_option);
        network_name.truncate(255);
    }

    let mut table = TsTable::new(
        "nit",
        &opts,
        TableKind::Nit(NitSys {
            network_name,
            version,
        }),
    );

    match ts.params.conformance {
        Conformance::Atsc => warn!("NIT is not compatible with ATSC conformance"),
        Conformance::Dvb => {
            if table.checked_period() > 10_000_000 {
                warn!("NIT period shouldn't exceed 10 s in DVB systems");
            }
        }
        _ => {}
    }

    update_table(&mut table, ts.tsid, ts.nid);

    // the NIT PID is announced as program 0 of the PAT
    table.defines_program = true;
    table.program = 0;

    table.force();
    debug!(
        "setting up NIT network ID {} name \"{}\"",
        ts.nid, network_name_option
    );
    table
}

/// Serializes the single NIT section (one section per TSID, and only one
/// TSID is declared)
fn update_table(table: &mut TsTable, tsid: u16, nid: u16) {
    let (version, network_name) = match &table.kind {
        TableKind::Nit(sys) => (sys.version, sys.network_name.clone()),
        _ => return,
    };

    let crc = Crc32Mpeg2::new();
    let mut section = psi::begin_section(TABLE_ID_NIT_ACTUAL, nid, version, 0);

    if !network_name.is_empty() {
        let descriptors_length = 2 + network_name.len();
        section.put_u16(0xf000 | descriptors_length as u16);
        section.put_u8(DESC_TAG_NETWORK_NAME);
        section.put_u8(network_name.len() as u8);
        section.put_slice(&network_name);
    } else {
        section.put_u16(0xf000);
    }

    // transport stream loop with a single entry and no descriptors
    section.put_u16(0xf000 | 6);
    section.put_u16(tsid);
    section.put_u16(nid);
    section.put_u16(0xf000);

    psi::finish_section(&mut section, &crc);
    super::install_sections(table, vec![section.to_vec()]);

    debug!("new NIT version {}", version);
}

/// NIT send pass: the table is static, only the repetition logic runs
pub(crate) fn send(ts: &mut TsStream, idx: usize, now: i64) -> Option<Vec<TsBlock>> {
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
