//! # Mux core
//!
//! Arbitrates the per-PID packet queues into a single ordered transport
//! stream: picks the next packet by muxing date (SI tables win timestamp
//! ties), pads or stalls according to the scheduling mode, enforces the
//! per-PID T-STD peak rates, stamps PCR values, optionally prepends an RTP
//! header, and pushes granularity groups to the output.
//!
//! Two operating regimes exist:
//!
//! - **synchronous** (`MuxConfig::sync = true`): a dedicated thread paces
//!   the output against the wall clock, sleeping on a condition variable
//!   between groups. Use it for network sinks.
//! - **asynchronous**: every `send()` pumps out as many groups as the
//!   enqueued timestamps allow; nothing ever blocks on a clock. Use it
//!   for file sinks.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::av::{Block, StreamCategory, StreamFormat};
use crate::config::{
    self, ChainEntry, Conformance, InputOptions, MuxConfig, MuxMode,
};
use crate::error::{MuxError, Result};
use crate::ts::packet::TsPacket;
use crate::ts::rtp;
use crate::ts::types::{TS_HEADER_SIZE, TS_HEADER_SIZE_PCR, TS_PACKET_SIZE};
use crate::utils::charset::DvbCharset;

pub(crate) mod input;
pub(crate) mod stream;
pub(crate) mod table;

use stream::{InputUnit, Priority, Queue, TableUnit, TsBlock, TsParameters, TsStream};

/// Default interval between groups in VBR mode, microseconds
const VBR_DEFAULT_INTERVAL: i64 = 5_000;
/// Packets are prepared at most this many packet intervals early
const MAX_PREPARE_PKT: i64 = 2;
/// Absolute cap on the preparation window, microseconds
const MAX_PREPARE_TIME: i64 = 20_000;
/// Late packets beyond this are dropped, microseconds
const MAX_DELAYING: i64 = 200_000;

/// The minimal contract the mux uses to push gathered packet groups
///
/// In RTP mode each group is one datagram; otherwise groups are plain
/// byte ranges of the transport stream.
pub trait MuxOutput: Send {
    /// Delivers one gathered group
    fn send(&mut self, group: Bytes);
}

/// Identifies an input added to the mux
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputHandle(u64);

// Which queue a packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueId {
    Table(usize),
    Input(usize),
}

struct MuxState {
    ts: TsStream,

    // PID and handle management
    next_handle: u64,
    next_dynamic_pid: u16,
    es_id_pid: bool,

    // inputs
    inputs_cfg: Vec<ChainEntry>,
    auto_pcr: bool,
    auto_pcr_period: i64,
    pcr_input: Option<u64>,

    // muxing
    muxrate: u32, // bytes/s
    muxmode: MuxMode,
    auto_muxrate: bool,
    auto_muxmode: bool,
    padding_bitrate: u32,
    last_stream_version: u64,
    drop_late: bool,
    burst_late: bool,
    granularity: i64,
    granularity_size: i64, // granularity * 188 bytes, in 10^6 bit units
    async_delay: i64,
    last_muxing: i64,
    last_muxing_remainder: i64,

    // temporary buffer for a stalled partial group
    tmp_blocks: Vec<TsBlock>,
    tmp_nb_packets: i64,

    killed: bool,
}

struct MuxShared {
    state: Mutex<MuxState>,
    wait: Condvar,
    output: Mutex<Box<dyn MuxOutput>>,
    epoch: Instant,
    sync: bool,
    rtp: bool,
    ssrc: [u8; 4],
    rtp_cc: AtomicU16,
}

/// The Transport Stream multiplexer
///
/// Create one with a configuration and an output, add inputs, feed access
/// units with `send`, and `close` to flush.
pub struct TsMux {
    shared: Arc<MuxShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TsMux {
    /// Opens the multiplexer and, in synchronous mode, starts the mux
    /// thread
    pub fn new(config: MuxConfig, output: Box<dyn MuxOutput>) -> Result<Self> {
        let params = TsParameters {
            conformance: config.conformance,
            charset: DvbCharset::new(&config.charset),
            packet_interval: 0,
            max_prepare: 0,
        };

        let tsid = if config.tsid != -1 {
            (config.tsid % 65536) as u16
        } else {
            rand::random::<u16>()
        };

        let granularity = if config.granularity != 0 {
            config.granularity as i64
        } else if config.sync {
            7
        } else {
            1
        };

        let mut state = MuxState {
            ts: TsStream {
                stream_version: 0,
                raps: Vec::new(),
                inputs: Vec::new(),
                tables: Vec::new(),
                params,
                tsid,
                nid: config.nid,
            },
            next_handle: 1,
            next_dynamic_pid: config.dynamic_pid,
            es_id_pid: config.es_id_pid,
            inputs_cfg: config::parse_chain(&config.inputs)?,
            auto_pcr: config.auto_pcr,
            auto_pcr_period: config.pcr_period_ms as i64 * 1000,
            pcr_input: None,
            muxrate: (config.muxrate + 7) / 8,
            muxmode: MuxMode::Vbr,
            auto_muxrate: true,
            auto_muxmode: true,
            padding_bitrate: config.padding_bitrate,
            // force a mode computation on the first pass
            last_stream_version: u64::MAX,
            drop_late: config.drop_late,
            burst_late: config.burst_late,
            granularity,
            granularity_size: granularity * TS_PACKET_SIZE as i64 * 1_000_000,
            async_delay: config.async_delay_ms as i64 * 1000,
            last_muxing: -1,
            last_muxing_remainder: 0,
            tmp_blocks: Vec::new(),
            tmp_nb_packets: 0,
            killed: false,
        };

        match config.muxmode {
            MuxMode::Auto => {}
            MuxMode::Vbr => {
                state.auto_muxmode = false;
                state.muxmode = MuxMode::Vbr;
                validate_params(&mut state);
            }
            mode => {
                state.auto_muxmode = false;
                state.muxmode = mode;
                state.auto_muxrate = state.muxrate == 0;
                if !state.auto_muxrate {
                    validate_params(&mut state);
                }
            }
        }

        // tables - in the end because the operating mode must be known
        let tables = if config.tables == "auto" {
            match config.conformance {
                Conformance::Dvb if config.conformance_tables => {
                    if config.sync {
                        "pat:pmt:nit:sdt:tdt".to_string()
                    } else {
                        "pat:pmt:nit:sdt".to_string()
                    }
                }
                Conformance::Atsc if config.conformance_tables => {
                    warn!("ATSC conformance tables are currently unimplemented");
                    "pat:pmt".to_string()
                }
                _ => "pat:pmt".to_string(),
            }
        } else {
            config.tables.clone()
        };
        for entry in config::parse_chain(&tables)? {
            table_add(&mut state, &entry);
        }

        let ssrc = if !config.ssrc.is_empty() {
            match config::parse_ssrc(&config.ssrc) {
                Some(ssrc) => ssrc,
                None => {
                    warn!("invalid RTP SSRC {}", config.ssrc);
                    rand::random()
                }
            }
        } else {
            rand::random()
        };

        let shared = Arc::new(MuxShared {
            state: Mutex::new(state),
            wait: Condvar::new(),
            output: Mutex::new(output),
            epoch: Instant::now(),
            sync: config.sync,
            rtp: config.rtp,
            ssrc,
            rtp_cc: AtomicU16::new(rand::random()),
        });

        let thread = if config.sync {
            let shared = Arc::clone(&shared);
            Some(
                thread::Builder::new()
                    .name("ts mux".to_string())
                    .spawn(move || mux_thread(shared))
                    .map_err(MuxError::Io)?,
            )
        } else {
            None
        };

        debug!(
            "starting TS mux with {} conformance",
            config.conformance.name()
        );

        Ok(Self { shared, thread })
    }

    /// Microseconds elapsed on the mux clock; block timestamps in
    /// synchronous mode live on this clock
    pub fn now(&self) -> i64 {
        now_us(&self.shared)
    }

    /// Adds an elementary stream, resurrecting a previously deleted input
    /// with an identical format
    pub fn add_input(&mut self, fmt: &StreamFormat) -> Result<InputHandle> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;

        for unit in &mut state.ts.inputs {
            if unit.queue.deleted && unit.input.fmt == *fmt {
                unit.queue.deleted = false;
                return Ok(InputHandle(unit.handle));
            }
        }

        let opts = state
            .inputs_cfg
            .iter()
            .find(|entry| config::input_matches(fmt, &entry.name))
            .map(|entry| InputOptions::from_options(&entry.options))
            .unwrap_or_default();

        let mut packetizer = input::open(fmt, &opts, &state.ts.params)?;
        let pid = state.ts.allocate_pid(
            packetizer.pack.cfg_pid,
            fmt.es_id,
            state.es_id_pid,
            &mut state.next_dynamic_pid,
        );
        packetizer.pack.pid = pid;

        let handle = state.next_handle;
        state.next_handle += 1;
        state.ts.inputs.push(InputUnit {
            handle,
            queue: Queue::default(),
            input: packetizer,
        });
        state.ts.stream_version += 1;

        if state.auto_pcr {
            elect_pcr(state);
        } else {
            let cfg_period = state.ts.inputs.last().map_or(0, |u| u.input.cfg_pcr_period);
            if cfg_period != 0 {
                let conformance = state.ts.params.conformance;
                if let Some(unit) = state.ts.inputs.last_mut() {
                    input::set_pcr_carrier(&mut unit.input, cfg_period);
                    unit.input.validate_pcr(conformance);
                }
            }
        }

        debug!("adding PID {} ({:?}/{})", pid, fmt.codec, fmt.es_id);
        Ok(InputHandle(handle))
    }

    /// Removes an input; removal is deferred until its queue drains
    pub fn remove_input(&mut self, handle: InputHandle) {
        let mut state = self.shared.state.lock();
        let Some(idx) = find_input(&state, handle.0) else {
            return;
        };

        if !state.ts.inputs[idx].queue.fifo.is_empty() {
            let input = &state.ts.inputs[idx].input;
            debug!(
                "scheduled removal of PID {} ({:?}/{})",
                input.pack.pid, input.fmt.codec, input.fmt.es_id
            );
            state.ts.inputs[idx].queue.deleted = true;
        } else {
            input_delete(&mut state, idx);
        }
    }

    /// Updates the declared language of an input; the audio packetizers
    /// rewrite their ISO-639 descriptor on the next send
    pub fn set_input_language(&mut self, handle: InputHandle, language: &str) {
        let mut state = self.shared.state.lock();
        if let Some(idx) = find_input(&state, handle.0) {
            state.ts.inputs[idx].input.fmt.language = Some(language.to_string());
        }
    }

    /// Feeds a chain of access units to an input
    ///
    /// Blocks with missing timestamps cause the whole chain to be dropped
    /// with a warning.
    pub fn send(&mut self, handle: InputHandle, frames: Vec<Block>) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(idx) = find_input(&state, handle.0) else {
            return Err(MuxError::InvalidData("unknown input".to_string()));
        };

        if frames
            .iter()
            .any(|frame| frame.dts.is_none() || frame.pts.is_none())
        {
            warn!(
                "packet with invalid timestamp on PID {}",
                state.ts.inputs[idx].input.pack.pid
            );
            return Ok(());
        }

        let out = state.ts.inputs[idx].input.send(frames);
        if out.is_empty() {
            return Ok(());
        }

        if state.ts.inputs[idx].input.fmt.codec.category() == StreamCategory::Video {
            for block in &out {
                if block.packet.has_random_access() {
                    let rap = block.muxing();
                    state.ts.raps.push(rap);
                }
            }
        }

        let horizon = state.last_muxing + state.ts.params.max_prepare;
        if let Some(first) = out.first() {
            if first.muxing() < horizon {
                warn!(
                    "received late buffer PID {} ({})",
                    state.ts.inputs[idx].input.pack.pid,
                    horizon - first.muxing()
                );
            }
        }

        state.ts.inputs[idx].queue.fifo.extend(out);

        if self.shared.sync {
            self.shared.wait.notify_one();
            drop(state);
        } else {
            drop(state);
            mux_async(&self.shared, false);
        }
        Ok(())
    }

    /// Stops the mux: joins the mux thread in synchronous mode, or flushes
    /// every queue in asynchronous mode
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let mut state = self.shared.state.lock();
                state.killed = true;
                self.shared.wait.notify_one();
            }
            let _ = thread.join();
        } else if !self.shared.sync {
            mux_async(&self.shared, true);
        }

        let mut state = self.shared.state.lock();
        for unit in &mut state.ts.inputs {
            unit.input.close();
        }
    }
}

impl Drop for TsMux {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn now_us(shared: &MuxShared) -> i64 {
    shared.epoch.elapsed().as_micros() as i64
}

fn find_input(state: &MuxState, handle: u64) -> Option<usize> {
    state.ts.inputs.iter().position(|unit| unit.handle == handle)
}

/*
 * Tables
 */

fn table_add(state: &mut MuxState, entry: &ChainEntry) {
    let mut table = match entry.name.as_str() {
        "pat" => table::pat::open(&entry.options, &state.ts),
        "pmt" => table::pmt::open(&entry.options, &state.ts),
        "sdt" => table::sdt::open(&entry.options, &state.ts),
        "nit" => table::nit::open(&entry.options, &state.ts),
        "tdt" => table::tdt::open(&entry.options, &state.ts),
        other => {
            warn!("unknown table {}", other);
            return;
        }
    };

    let pid = state.ts.allocate_pid(
        table.pack.cfg_pid,
        -1,
        false,
        &mut state.next_dynamic_pid,
    );
    table.pack.pid = pid;

    state.ts.tables.push(TableUnit {
        queue: Queue::default(),
        table,
    });
    state.ts.stream_version += 1;

    debug!("adding PID {} ({})", pid, entry.name);
}

// Check tables for new buffers; called with the mux clock advanced.
fn table_send_pass(state: &mut MuxState) {
    let now = state.last_muxing;
    for idx in 0..state.ts.tables.len() {
        let Some(out) = table::table_send(&mut state.ts, idx, now) else {
            continue;
        };
        if out.is_empty() {
            continue;
        }

        let horizon = state.last_muxing + state.ts.params.max_prepare;
        if let Some(first) = out.first() {
            if first.muxing() < horizon {
                warn!(
                    "received late buffer PID {} ({})",
                    state.ts.tables[idx].table.pack.pid,
                    horizon - first.muxing()
                );
            }
        }
        state.ts.tables[idx].queue.fifo.extend(out);
    }
}

/*
 * PCR election
 */

fn elect_pcr(state: &mut MuxState) {
    if state.ts.inputs.is_empty() {
        return;
    }

    let mut candidate = state.pcr_input;
    for unit in &state.ts.inputs {
        let category = unit.input.fmt.codec.category();
        if (candidate.is_none() && category == StreamCategory::Audio)
            || category == StreamCategory::Video
        {
            candidate = Some(unit.handle);
        } else if unit.input.cfg_pcr_period != 0 {
            candidate = Some(unit.handle);
            break;
        }
    }

    if candidate == state.pcr_input {
        return;
    }

    if let Some(old) = state.pcr_input {
        if let Some(idx) = find_input(state, old) {
            input::set_pcr_carrier(&mut state.ts.inputs[idx].input, 0);
        }
    }

    state.pcr_input = candidate;
    state.ts.stream_version += 1;

    match candidate.and_then(|handle| find_input(state, handle)) {
        Some(idx) => {
            let auto_period = state.auto_pcr_period;
            let conformance = state.ts.params.conformance;
            let unit = &mut state.ts.inputs[idx];
            let period = if unit.input.cfg_pcr_period != 0 {
                unit.input.cfg_pcr_period
            } else {
                auto_period
            };
            input::set_pcr_carrier(&mut unit.input, period);
            unit.input.validate_pcr(conformance);
            debug!(
                "new PCR PID is {} period={}",
                unit.input.pack.pid, unit.input.pcr_period
            );
        }
        None => debug!("new PCR PID is 8191"),
    }
}

fn input_delete(state: &mut MuxState, idx: usize) {
    let unit = state.ts.inputs.remove(idx);
    debug!(
        "removing PID {} ({:?}/{})",
        unit.input.pack.pid, unit.input.fmt.codec, unit.input.fmt.es_id
    );

    state.ts.stream_version += 1;
    if state.auto_pcr && state.pcr_input == Some(unit.handle) {
        state.pcr_input = None;
        elect_pcr(state);
    }
}

/*
 * Muxing
 */

// Calculate new TS parameters from muxmode/muxrate.
fn validate_params(state: &mut MuxState) {
    state.ts.params.packet_interval = if state.muxmode == MuxMode::Vbr {
        VBR_DEFAULT_INTERVAL
    } else {
        state.granularity_size / state.muxrate as i64
    };

    state.ts.params.max_prepare =
        (state.ts.params.packet_interval * MAX_PREPARE_PKT).min(MAX_PREPARE_TIME);
}

// Automatically choose the appropriate operating mode.
fn check_mode(state: &mut MuxState) {
    let mut vbr_needed = false;
    let mut total_bitrate: u64 = 0;

    for unit in &state.ts.tables {
        total_bitrate += unit.table.pack.total_bitrate as u64;
    }
    for unit in state.ts.inputs.iter().rev() {
        let input = &unit.input;
        if input.pack.total_bitrate == 0 {
            vbr_needed = true;
        } else {
            total_bitrate += input.pack.total_bitrate as u64;
        }
        if input.pcr_period != 0 {
            let af_overhead = (TS_HEADER_SIZE_PCR - TS_HEADER_SIZE) as u64;
            total_bitrate += (af_overhead * 8_000_000 + input.pcr_period as u64 - 1)
                / input.pcr_period as u64;
        }
    }
    total_bitrate += state.padding_bitrate as u64;

    if state.auto_muxmode {
        state.muxmode = if vbr_needed {
            MuxMode::Vbr
        } else {
            MuxMode::Capped
        };
    } else if vbr_needed && state.muxmode != MuxMode::Vbr {
        warn!("constant-rate mode requested but only vbr is possible");
    }

    if state.auto_muxrate {
        state.muxrate = (((total_bitrate + 7) / 8) as u32).max(1);
    } else if state.muxmode != MuxMode::Vbr
        && (state.muxrate as u64) < (total_bitrate + 7) / 8
    {
        warn!(
            "{} bitrate requested is too low (should be {})",
            state.muxrate as u64 * 8,
            total_bitrate
        );
    }

    validate_params(state);

    if state.auto_muxrate || state.auto_muxmode {
        if state.muxmode == MuxMode::Vbr {
            debug!("now operating in vbr mode");
        } else {
            debug!(
                "now operating in {:?} mode at bitrate {}, packet interval {} us",
                state.muxmode,
                state.muxrate as u64 * 8,
                state.ts.params.packet_interval
            );
            state.last_muxing_remainder = 0;
        }
    }

    state.last_stream_version = state.ts.stream_version;
}

// Latest tolerable muxing date over every input, for the asynchronous
// pump; -1 until every stream has at least one packet enqueued.
fn check_async(state: &MuxState) -> i64 {
    let mut max_muxing = -1;

    // Do not check the tables because they have plenty of time.
    for unit in &state.ts.inputs {
        if unit.queue.deleted {
            continue;
        }
        match unit.queue.fifo.back() {
            None => return -1,
            Some(block) => {
                if max_muxing == -1 || block.muxing() < max_muxing {
                    max_muxing = block.muxing();
                }
            }
        }
    }

    max_muxing
}

// Muxing date of the next available TS over all queues.
fn mux_show(state: &MuxState) -> i64 {
    let mut min_muxing = -1;

    let mut consider = |queue: &Queue| {
        if let Some(block) = queue.fifo.front() {
            let muxing = block.muxing().max(queue.min_muxing);
            if min_muxing == -1 || muxing < min_muxing {
                min_muxing = muxing;
            }
        }
    };
    for unit in &state.ts.tables {
        consider(&unit.queue);
    }
    for unit in state.ts.inputs.iter().rev() {
        consider(&unit.queue);
    }

    min_muxing
}

// Date of the next granularity group.
fn show_muxing(state: &MuxState) -> i64 {
    if state.muxmode != MuxMode::Vbr && state.last_muxing != -1 {
        return state.last_muxing
            + (state.last_muxing_remainder + state.granularity_size) / state.muxrate as i64;
    }
    mux_show(state)
}

// Advance the mux clock to the next group, carrying the pacing remainder
// for bit-accurate constant rates.
fn increment_muxing(state: &mut MuxState, next_muxing: i64) {
    if state.muxmode == MuxMode::Vbr || state.last_muxing == -1 {
        state.last_muxing = next_muxing;
    } else {
        let step = state.last_muxing_remainder + state.granularity_size;
        state.last_muxing += step / state.muxrate as i64;
        state.last_muxing_remainder = step % state.muxrate as i64;
    }
}

// Remove inputs whose deletion was deferred and whose queue drained.
fn reap_inputs(state: &mut MuxState) {
    let mut idx = state.ts.inputs.len();
    while idx > 0 {
        idx -= 1;
        if state.ts.inputs[idx].queue.deleted && state.ts.inputs[idx].queue.fifo.is_empty() {
            input_delete(state, idx);
        }
    }
}

// Pick the next queue to be muxed: smallest eligible muxing date, ties to
// the higher priority; queues hitting the emergency horizon win outright.
fn mux_get(state: &mut MuxState) -> Option<QueueId> {
    reap_inputs(state);

    let emergency_muxing = state.last_muxing + state.ts.params.packet_interval;
    let mut min_muxing = -1;
    let mut priority = Priority::None;
    let mut next_queue = None;

    {
        let mut consider = |queue: &Queue, queue_priority: Priority, id: QueueId| -> Option<QueueId> {
            let block = queue.fifo.front()?;
            let muxing = block.muxing().max(queue.min_muxing);
            if (min_muxing == -1 || muxing < min_muxing || queue_priority > priority)
                && muxing <= state.last_muxing
            {
                min_muxing = muxing;
                priority = queue_priority;
                next_queue = Some(id);
            }
            if block.dts <= emergency_muxing {
                return Some(id);
            }
            None
        };

        // Tables in ascending order so the PAT goes out before the PMT at
        // equal dates; inputs in descending order.
        for idx in 0..state.ts.tables.len() {
            let unit = &state.ts.tables[idx];
            if let Some(id) = consider(&unit.queue, unit.table.pack.priority, QueueId::Table(idx))
            {
                return Some(id);
            }
        }
        for idx in (0..state.ts.inputs.len()).rev() {
            let unit = &state.ts.inputs[idx];
            if let Some(id) = consider(&unit.queue, unit.input.pack.priority, QueueId::Input(idx))
            {
                return Some(id);
            }
        }
    }

    next_queue
}

fn queue_pop(state: &mut MuxState, id: QueueId) -> Option<TsBlock> {
    match id {
        QueueId::Table(idx) => state.ts.tables[idx].queue.fifo.pop_front(),
        QueueId::Input(idx) => state.ts.inputs[idx].queue.fifo.pop_front(),
    }
}

fn queue_mut(state: &mut MuxState, id: QueueId) -> &mut Queue {
    match id {
        QueueId::Table(idx) => &mut state.ts.tables[idx].queue,
        QueueId::Input(idx) => &mut state.ts.inputs[idx].queue,
    }
}

fn queue_pid(state: &MuxState, id: QueueId) -> u16 {
    match id {
        QueueId::Table(idx) => state.ts.tables[idx].table.pack.pid,
        QueueId::Input(idx) => state.ts.inputs[idx].input.pack.pid,
    }
}

// Check for late packets and return the first deliverable one.
fn check_late(state: &mut MuxState) -> Option<(QueueId, TsBlock)> {
    loop {
        let id = mux_get(state)?;
        let Some(block) = queue_pop(state, id) else {
            return None;
        };

        if block.dts < state.last_muxing {
            let lateness = state.last_muxing - block.dts;
            if lateness > MAX_DELAYING || state.drop_late {
                warn!(
                    "dropping late packet pid={} lateness={} delay={}",
                    queue_pid(state, id),
                    lateness,
                    block.delay
                );
                continue;
            } else if state.burst_late {
                warn!(
                    "bursting late packet pid={} lateness={} delay={}",
                    queue_pid(state, id),
                    lateness,
                    block.delay
                );
                state.last_muxing = block.dts;
                state.last_muxing_remainder = 0;
            } else {
                warn!(
                    "delaying late packet pid={} lateness={} delay={}",
                    queue_pid(state, id),
                    lateness,
                    block.delay
                );
            }
        }

        return Some((id, block));
    }
}

// How much the pending group could bear being delayed.
fn check_increment(blocks: &[TsBlock]) -> i64 {
    blocks
        .iter()
        .map(|block| block.dts)
        .min()
        .unwrap_or(-1)
}

// Update the per-queue shaping dates from the peak bitrates.
fn fix_queues(state: &mut MuxState) {
    let last_muxing = state.last_muxing;
    let mut fix = |queue: &mut Queue, peak_bitrate: u32| {
        if peak_bitrate != 0 && queue.muxed_size != 0 {
            queue.min_muxing =
                last_muxing + queue.muxed_size as i64 * 8_000_000 / peak_bitrate as i64;
            queue.muxed_size = 0;
        }
    };
    for unit in &mut state.ts.tables {
        fix(&mut unit.queue, unit.table.pack.peak_bitrate);
    }
    for unit in &mut state.ts.inputs {
        fix(&mut unit.queue, unit.input.pack.peak_bitrate);
    }
}

// Prepare one granularity group; None when the mux should stall.
fn mux(state: &mut MuxState) -> Option<Vec<TsBlock>> {
    let mut nb_packets = state.granularity;
    let mut last_packet_muxing = state.last_muxing;
    let mut blocks: Vec<TsBlock> = Vec::new();

    if state.tmp_nb_packets != 0 {
        nb_packets = state.tmp_nb_packets;
        blocks = std::mem::take(&mut state.tmp_blocks);
        state.tmp_nb_packets = 0;
    }

    if state.muxmode == MuxMode::Vbr {
        // Small hack to avoid running the group builder too often.
        let max_muxing = check_increment(&blocks);
        if max_muxing == -1
            || max_muxing > state.last_muxing + state.ts.params.packet_interval
        {
            state.last_muxing += state.ts.params.packet_interval;
        } else {
            state.last_muxing = max_muxing;
        }
    }

    let mut current = check_late(state);

    loop {
        match current.take() {
            None => {
                if state.muxmode != MuxMode::Cbr {
                    let max_muxing = check_increment(&blocks);
                    if max_muxing == -1 || max_muxing >= show_muxing(state) {
                        state.tmp_nb_packets = nb_packets;
                        state.tmp_blocks = blocks;
                        return None;
                    }
                }
                blocks.push(TsBlock::new(TsPacket::null()));
            }
            Some((id, block)) => {
                let payload_size = TS_PACKET_SIZE - block.packet.payload_offset();
                queue_mut(state, id).muxed_size += payload_size as u32;
                last_packet_muxing = block.muxing();
                blocks.push(block);
            }
        }

        nb_packets -= 1;
        if nb_packets == 0 {
            break;
        }

        current = mux_get(state).and_then(|id| queue_pop(state, id).map(|block| (id, block)));
    }

    if state.muxmode == MuxMode::Vbr {
        // Fix the small hack.
        state.last_muxing = last_packet_muxing;
    }

    let last_muxing = state.last_muxing;
    state.ts.clear_raps(last_muxing);
    fix_queues(state);

    Some(blocks)
}

// Stamp the PCRs and concatenate the group for the output plug-in.
fn gather(shared: &MuxShared, mut blocks: Vec<TsBlock>, pcr_date: i64) -> Bytes {
    for block in &mut blocks {
        if block.packet.has_pcr() {
            block
                .packet
                .set_pcr((pcr_date / 300) as u64, (pcr_date % 300) as u16);
        }
    }

    let mut buf = BytesMut::with_capacity(
        blocks.len() * TS_PACKET_SIZE + if shared.rtp { 12 } else { 0 },
    );
    if shared.rtp {
        let sequence = shared.rtp_cc.fetch_add(1, Ordering::Relaxed);
        rtp::write_header(&mut buf, sequence, (pcr_date / 300) as u32, shared.ssrc);
    }
    for block in &blocks {
        buf.extend_from_slice(block.packet.as_bytes());
    }
    buf.freeze()
}

// Run in asynchronous mode (eg. reading from and writing to a file).
fn mux_async(shared: &MuxShared, flush: bool) {
    loop {
        let mut state = shared.state.lock();
        if state.last_stream_version != state.ts.stream_version {
            check_mode(&mut state);
        }

        let mut next_muxing = show_muxing(&state);
        if next_muxing == -1 {
            return;
        }
        if state.last_muxing == -1 {
            // Allow for an early start.
            next_muxing -= 2 * state.ts.params.max_prepare;
        }

        if !flush {
            let max_muxing = check_async(&state);
            if max_muxing == -1
                || max_muxing
                    < next_muxing
                        + state.ts.params.max_prepare
                        + state.ts.params.packet_interval
                        + state.async_delay
            {
                return;
            }
        } else if mux_show(&state) == -1 {
            return;
        }

        increment_muxing(&mut state, next_muxing);
        table_send_pass(&mut state);
        let blocks = mux(&mut state);
        let last_muxing = state.last_muxing;
        let remainder = state.last_muxing_remainder;
        let muxrate = state.muxrate;
        drop(state);

        if let Some(blocks) = blocks {
            // sub-microsecond PCR precision from the pacing remainder
            let mut pcr_clock = last_muxing * 27;
            if muxrate != 0 {
                pcr_clock += remainder * 27 / muxrate as i64;
            }
            shared.output.lock().send(gather(shared, blocks, pcr_clock));
        }
    }
}

// Run in synchronous mode, pacing against the wall clock.
fn mux_thread(shared: Arc<MuxShared>) {
    debug!("starting TS mux thread");

    loop {
        let mut state = shared.state.lock();
        if state.killed {
            break;
        }
        if state.last_stream_version != state.ts.stream_version {
            check_mode(&mut state);
        }

        let init = state.last_muxing == -1;
        let mut next_muxing = show_muxing(&state);
        let current_date = now_us(&shared);

        if init && next_muxing != -1 {
            // Allow for an early start.
            next_muxing -= 2 * state.ts.params.max_prepare;
        }

        if next_muxing == -1 {
            shared.wait.wait(&mut state);
        } else if next_muxing > current_date + state.ts.params.max_prepare {
            let deadline = shared.epoch
                + Duration::from_micros(
                    (next_muxing - state.ts.params.max_prepare).max(0) as u64,
                );
            let _ = shared.wait.wait_until(&mut state, deadline);
        } else {
            increment_muxing(&mut state, next_muxing);
            table_send_pass(&mut state);
            if init {
                // The tables are prepended so we must start earlier.
                state.last_muxing = -1;
                let restart = show_muxing(&state);
                increment_muxing(&mut state, restart);
            }
            let blocks = mux(&mut state);
            let last_muxing = state.last_muxing;
            drop(state);

            if let Some(blocks) = blocks {
                let current_date = now_us(&shared);
                if current_date > last_muxing + 5_000 {
                    warn!("output late buffer ({})", current_date - last_muxing);
                } else if last_muxing > current_date {
                    thread::sleep(Duration::from_micros((last_muxing - current_date) as u64));
                }

                // mdate() granularity bounds the PCR precision here
                let pcr_clock = now_us(&shared) * 27;
                shared.output.lock().send(gather(&shared, blocks, pcr_clock));
            }
        }
    }
}

#[cfg(test)]
mod tests;
