use std::collections::VecDeque;

use log::warn;

use crate::config::Conformance;
use crate::ts::packet::TsPacket;
use crate::utils::charset::DvbCharset;

use super::input::TsInput;
use super::table::TsTable;

/// T-STD transport buffer (TBn) size in bytes, used to derive per-PID
/// TS delays
pub(crate) const T_STD_TS_BUFFER: u32 = 512;

/// Fallback ES bitrate for muxing-date interpolation when none is declared
pub(crate) const DEFAULT_BITRATE: u32 = 3_000_000;

/// Default PCR tolerance when the input bitrate is unknown, microseconds
pub(crate) const DEFAULT_PCR_TOLERANCE: i64 = 5_000;

/// Arbitration priority of a packetizer; higher wins timestamp ties
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Priority {
    None,
    Pcr,
    Si,
}

/// Stream-global parameters shared by every packetizer
#[derive(Debug, Clone)]
pub(crate) struct TsParameters {
    pub conformance: Conformance,
    pub charset: DvbCharset,
    /// Interval between two granularity groups, microseconds
    pub packet_interval: i64,
    /// Packets for time T should be generated no later than T - max_prepare
    pub max_prepare: i64,
}

/// Common packetizer fields shared by inputs and tables
#[derive(Debug, Clone)]
pub(crate) struct Packetizer {
    pub pid: u16,
    pub cfg_pid: u16,
    pub priority: Priority,
    /// Including PES and TS overhead, bits/s
    pub total_bitrate: u32,
    /// T-STD peak rate, bits/s
    pub peak_bitrate: u32,
    /// Transport buffer delay, microseconds
    pub ts_delay: i64,
}

impl Packetizer {
    pub fn new(cfg_pid: u16, total_bitrate: u32) -> Self {
        Self {
            pid: 0x1fff,
            cfg_pid,
            priority: Priority::None,
            total_bitrate,
            peak_bitrate: 0,
            ts_delay: 0,
        }
    }
}

/// A built TS packet waiting in a per-PID FIFO, with its muxing metadata
#[derive(Debug, Clone)]
pub(crate) struct TsBlock {
    pub packet: TsPacket,
    /// Latest acceptable output time, microseconds
    pub dts: i64,
    /// Buffering delay; dts - delay is the earliest muxing time
    pub delay: i64,
}

impl TsBlock {
    pub fn new(packet: TsPacket) -> Self {
        Self {
            packet,
            dts: 0,
            delay: 0,
        }
    }

    /// Earliest muxing time of the block
    pub fn muxing(&self) -> i64 {
        self.dts - self.delay
    }
}

/// Per-PID output queue state shared by inputs and tables
#[derive(Debug, Default)]
pub(crate) struct Queue {
    pub fifo: VecDeque<TsBlock>,
    pub deleted: bool,
    /// T-STD shaping: no packet before this date
    pub min_muxing: i64,
    /// Payload bytes muxed since the last shaping update
    pub muxed_size: u32,
}

/// An elementary stream input and its queue
pub(crate) struct InputUnit {
    /// Caller-side identity of the input, stable across resurrection
    pub handle: u64,
    pub queue: Queue,
    pub input: TsInput,
}

/// A PSI/SI table generator and its queue
pub(crate) struct TableUnit {
    pub queue: Queue,
    pub table: TsTable,
}

/// The stream registry: every packetizer, the RAP list and the global
/// stream version
pub(crate) struct TsStream {
    /// Bumped on any change that affects muxing parameters
    pub stream_version: u64,
    /// Future random access point dates, ascending, microseconds
    pub raps: Vec<i64>,
    /// Inputs in insertion order
    pub inputs: Vec<InputUnit>,
    /// Tables in insertion order (PAT first, then PMT, then SI)
    pub tables: Vec<TableUnit>,
    pub params: TsParameters,
    pub tsid: u16,
    pub nid: u16,
}

impl TsStream {
    /// Checks that a PID is below the reserved range and unused
    pub fn pid_free(&self, pid: u16) -> bool {
        if pid >= 0x1fff {
            return false;
        }
        !self
            .inputs
            .iter()
            .map(|unit| unit.input.pack.pid)
            .chain(self.tables.iter().map(|unit| unit.table.pack.pid))
            .any(|used| used == pid)
    }

    /// Picks a PID: the configured one, the caller ES id in `es_id_pid`
    /// mode, or the next free dynamic PID
    pub fn allocate_pid(
        &self,
        cfg_pid: u16,
        es_id: i32,
        es_id_pid: bool,
        next_dynamic_pid: &mut u16,
    ) -> u16 {
        let wanted = if cfg_pid != 0x1fff {
            Some(cfg_pid)
        } else if es_id_pid && es_id != -1 {
            Some((es_id as u16) & 0x1fff)
        } else {
            None
        };

        if let Some(pid) = wanted {
            if self.pid_free(pid) {
                return pid;
            }
            warn!("invalid PID {}", pid);
        }

        loop {
            let pid = *next_dynamic_pid;
            *next_dynamic_pid += 1;
            if *next_dynamic_pid == 0x1fff {
                *next_dynamic_pid = 0x10;
            }
            if self.pid_free(pid) {
                return pid;
            }
        }
    }

    /// Drops random access points that are already in the past
    pub fn clear_raps(&mut self, last_muxing: i64) {
        while self.raps.first().is_some_and(|&rap| rap <= last_muxing) {
            self.raps.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Si > Priority::Pcr);
        assert!(Priority::Pcr > Priority::None);
    }

    #[test]
    fn test_ts_block_muxing() {
        let block = TsBlock {
            packet: TsPacket::null(),
            dts: 1000,
            delay: 300,
        };
        assert_eq!(block.muxing(), 700);
    }
}
