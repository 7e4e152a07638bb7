//! Service Description Table generator (EN 300 468).

use bytes::BufMut;
use log::{debug, warn};

use crate::config::{Conformance, OptionMap, TableOptions};
use crate::ts::crc::Crc32Mpeg2;
use crate::ts::psi;
use crate::ts::types::{DESC_TAG_SERVICE, PID_SDT, TABLE_ID_SDT_ACTUAL};
use crate::utils::charset::DvbCharset;

use super::super::stream::{TsBlock, TsStream};
use super::{TableKind, TsTable};

const DEFAULT_PERIOD_MS: u32 = 1500;
const DEFAULT_MAX_PERIOD_MS: u32 = 1800;
const DEFAULT_OFFSET_MS: u32 = 0;
const DEFAULT_SERVICES: &str = "tsmux service/rust-vdk/1";

/// One SDT service entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SdtService {
    pub sid: u16,
    pub service_name: Vec<u8>,
    pub provider_name: Vec<u8>,
    pub service_type: u8,
}

/// SDT generator state
pub(crate) struct SdtSys {
    pub auto: bool,
    /// Shared name applied to every auto-mode service, charset-coded
    pub service_name: Vec<u8>,
    pub provider_name: Vec<u8>,
    pub service_type: u8,
    pub services: Option<Vec<SdtService>>,
    pub version: u8,
}

fn encode_name(charset: &DvbCharset, name: &str) -> Vec<u8> {
    let mut coded = charset.encode(name);
    if coded.len() > 255 {
        warn!("service name is too large: {}", name);
        coded.truncate(255);
    }
    coded
}

pub(crate) fn open(options: &OptionMap, ts: &TsStream) -> TsTable {
    let opts = TableOptions::from_options(
        options,
        PID_SDT,
        DEFAULT_PERIOD_MS,
        DEFAULT_MAX_PERIOD_MS,
        DEFAULT_OFFSET_MS,
    );

    let version = match opts.extra.get_int("version") {
        Some(version) if version != -1 => (version % 32) as u8,
        _ => rand::random::<u8>() % 32,
    };

    let mut table = TsTable::new(
        "sdt",
        &opts,
        TableKind::Sdt(SdtSys {
            auto: true,
            service_name: Vec::new(),
            provider_name: Vec::new(),
            service_type: 0x1,
            services: None,
            version,
        }),
    );

    match ts.params.conformance {
        Conformance::Atsc => warn!("SDT is not compatible with ATSC conformance"),
        Conformance::Dvb => {
            if table.checked_period() > 2_000_000 {
                warn!("SDT period shouldn't exceed 2 s in DVB systems");
            }
        }
        _ => {}
    }

    let services_option = opts
        .extra
        .get("services")
        .unwrap_or(DEFAULT_SERVICES)
        .to_string();

    // A leading service id means an explicit service list; otherwise the
    // option carries the shared name/provider/type for auto mode.
    let manual = services_option
        .split_once('=')
        .and_then(|(sid, _)| sid.trim().parse::<u16>().ok())
        .is_some();

    if !manual {
        let mut parts = services_option.splitn(3, '/');
        let name = parts.next().unwrap_or("");
        let provider = parts.next().unwrap_or("");
        let service_type = parts
            .next()
            .and_then(|ty| ty.trim().parse::<u8>().ok())
            .unwrap_or(0x1);

        if let TableKind::Sdt(sys) = &mut table.kind {
            sys.auto = true;
            sys.service_name = encode_name(&ts.params.charset, name);
            sys.provider_name = encode_name(&ts.params.charset, provider);
            sys.service_type = service_type;
        }
        build_services(&mut table, ts);
    } else {
        let mut services = Vec::new();
        for entry in services_option.split(':') {
            let Some((sid, rest)) = entry.split_once('=') else {
                warn!("invalid service {}", entry);
                continue;
            };
            let Ok(sid) = sid.trim().parse::<u16>() else {
                warn!("invalid service {}", entry);
                continue;
            };
            if sid == 0 {
                warn!("invalid service {}", entry);
                continue;
            }
            let mut parts = rest.splitn(3, '/');
            let name = parts.next().unwrap_or("");
            let provider = parts.next().unwrap_or("");
            let service_type = parts
                .next()
                .and_then(|ty| ty.trim().parse::<u8>().ok())
                .unwrap_or(0x1);
            services.push(SdtService {
                sid,
                service_name: encode_name(&ts.params.charset, name),
                provider_name: encode_name(&ts.params.charset, provider),
                service_type,
            });
        }
        if let TableKind::Sdt(sys) = &mut table.kind {
            sys.auto = false;
            sys.services = Some(services);
        }
        update_table(&mut table, ts.tsid, ts.nid);
    }

    table.force();
    debug!(
        "setting up SDT TSID {} ONID {} mode {}",
        ts.tsid,
        ts.nid,
        if matches!(&table.kind, TableKind::Sdt(sys) if sys.auto) {
            "auto"
        } else {
            "manual"
        }
    );
    table
}

/// Auto mode: one service per program-defining table with a non-zero
/// program number; returns whether the SDT changed
fn build_services(table: &mut TsTable, ts: &TsStream) -> bool {
    table.last_stream_version = ts.stream_version;

    let (shared_name, shared_provider, shared_type) = match &table.kind {
        TableKind::Sdt(sys) => (
            sys.service_name.clone(),
            sys.provider_name.clone(),
            sys.service_type,
        ),
        _ => return false,
    };

    let mut services: Vec<SdtService> = ts
        .tables
        .iter()
        .filter(|unit| unit.table.defines_program && unit.table.program != 0)
        .map(|unit| SdtService {
            sid: unit.table.program,
            service_name: shared_name.clone(),
            provider_name: shared_provider.clone(),
            service_type: shared_type,
        })
        .collect();

    // Keep the list in ascending order to get reproducible behaviour.
    services.sort();

    let TableKind::Sdt(sys) = &mut table.kind else {
        return false;
    };
    if sys.services.as_ref() == Some(&services) {
        return false;
    }
    sys.services = Some(services);
    sys.version = (sys.version + 1) % 32;
    let (tsid, nid) = (ts.tsid, ts.nid);
    update_table(table, tsid, nid);
    true
}

/// Serializes the SDT sections
fn update_table(table: &mut TsTable, tsid: u16, nid: u16) {
    let (version, services) = match &table.kind {
        TableKind::Sdt(sys) => (sys.version, sys.services.clone().unwrap_or_default()),
        _ => return,
    };

    let crc = Crc32Mpeg2::new();
    let mut sections = Vec::new();
    let mut remaining = services.as_slice();
    let mut section_number = 0u8;

    loop {
        let mut section =
            psi::begin_section(TABLE_ID_SDT_ACTUAL, tsid, version, section_number);
        section.put_u16(nid);
        section.put_u8(0xff); // reserved

        while let Some((service, tail)) = remaining.split_first() {
            let desc_length = if service.service_name.is_empty()
                && service.provider_name.is_empty()
            {
                0
            } else {
                // service descriptor: type, provider, name
                3 + 1 + service.provider_name.len() + 1 + service.service_name.len()
            };
            if psi::section_room(&section) < 5 + desc_length {
                // a service descriptor is necessarily smaller than a
                // section, so the outer loop makes progress
                break;
            }

            section.put_u16(service.sid);
            section.put_u8(0xfc); // no EIT schedule, no EIT p/f
            // running, not scrambled
            section.put_u16(0x8000 | (desc_length as u16 & 0x0fff));
            if desc_length != 0 {
                section.put_u8(DESC_TAG_SERVICE);
                section.put_u8((desc_length - 2) as u8);
                section.put_u8(service.service_type);
                section.put_u8(service.provider_name.len() as u8);
                section.put_slice(&service.provider_name);
                section.put_u8(service.service_name.len() as u8);
                section.put_slice(&service.service_name);
            }
            remaining = tail;
        }

        sections.push(section);
        section_number += 1;
        if remaining.is_empty() {
            break;
        }
    }

    let last_section = (sections.len() - 1) as u8;
    let mut sealed = Vec::with_capacity(sections.len());
    for mut section in sections {
        psi::set_last_section(&mut section, last_section);
        psi::finish_section(&mut section, &crc);
        sealed.push(section.to_vec());
    }

    super::install_sections(table, sealed);

    debug!(
        "new SDT version {} with {} services {} sections, bitrate {}",
        version,
        services.len(),
        last_section + 1,
        table.pack.total_bitrate
    );
}

/// SDT send pass
pub(crate) fn send(ts: &mut TsStream, idx: usize, now: i64) -> Option<Vec<TsBlock>> {
    let (auto, last_stream_version) = match &ts.tables[idx].table.kind {
        TableKind::Sdt(_) => (
            matches!(&ts.tables[idx].table.kind, TableKind::Sdt(sys) if sys.auto),
            ts.tables[idx].table.last_stream_version,
        ),
        _ => return None,
    };

    if auto && ts.stream_version > last_stream_version {
        let mut table = std::mem::replace(
            &mut ts.tables[idx].table,
            TsTable::new(
                "sdt",
                &TableOptions::from_options(
                    &OptionMap::default(),
                    PID_SDT,
                    DEFAULT_PERIOD_MS,
                    DEFAULT_MAX_PERIOD_MS,
                    DEFAULT_OFFSET_MS,
                ),
                TableKind::Tdt,
            ),
        );
        let bitrate = table.pack.total_bitrate;
        if build_services(&mut table, ts) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_chain;
    use crate::mux::stream::{TableUnit, TsParameters};
    use pretty_assertions::assert_eq;

    fn dvb_stream() -> TsStream {
        TsStream {
            stream_version: 0,
            raps: Vec::new(),
            inputs: Vec::new(),
            tables: Vec::new(),
            params: TsParameters {
                conformance: Conformance::Dvb,
                charset: DvbCharset::default(),
                packet_interval: 2_000,
                max_prepare: 4_000,
            },
            tsid: 100,
            nid: 200,
        }
    }

    #[test]
    fn test_manual_services_section() {
        let ts = dvb_stream();
        let chain = parse_chain("sdt{services=5=News/ACME/1,version=0}").unwrap();
        let table = open(&chain[0].options, &ts);

        let section = &table.last_table[0];
        assert_eq!(section[1], TABLE_ID_SDT_ACTUAL);
        // TSID 100
        assert_eq!(&section[4..6], &[0, 100]);
        // ONID 200 right after the PSI header
        assert_eq!(&section[9..11], &[0, 200]);
        // first service: sid 5, running
        assert_eq!(&section[12..14], &[0, 5]);
        assert_eq!(section[15] & 0xe0, 0x80);
        // service descriptor with provider and name, Latin-1 selector
        assert_eq!(section[17], DESC_TAG_SERVICE);
        assert_eq!(section[19], 1); // service type

        let crc = Crc32Mpeg2::new();
        assert_eq!(crc.calculate(&section[1..]), 0);
    }

    #[test]
    fn test_auto_services_follow_programs() {
        let mut ts = dvb_stream();
        let chain = parse_chain("sdt{version=0,services=News/ACME/1}").unwrap();
        let table = open(&chain[0].options, &ts);
        ts.tables.push(TableUnit {
            queue: Default::default(),
            table,
        });

        // a PMT appears (program 9) and the NIT (program 0, skipped)
        let chain = parse_chain("sdt{version=0,services=X/Y/1}").unwrap();
        let mut pmt_like = open(&chain[0].options, &ts);
        pmt_like.defines_program = true;
        pmt_like.program = 9;
        ts.tables.push(TableUnit {
            queue: Default::default(),
            table: pmt_like,
        });
        let chain = parse_chain("sdt{version=0,services=X/Y/1}").unwrap();
        let mut nit_like = open(&chain[0].options, &ts);
        nit_like.defines_program = true;
        nit_like.program = 0;
        ts.tables.push(TableUnit {
            queue: Default::default(),
            table: nit_like,
        });

        ts.stream_version += 1;
        let out = send(&mut ts, 0, 1_000_000);
        assert!(out.is_some());

        let section = &ts.tables[0].table.last_table[0];
        // exactly one service: sid 9
        assert_eq!(&section[12..14], &[0, 9]);
    }
}
