//! Multi-connection streamer (spec.md §3 "Streamer", §4.E): owns the
//! connection/stream slab, the one designated sync master, and drives the
//! period-by-period main loop.
//!
//! Design Notes §9 "Cyclic references": every back-reference (a stream's
//! sync-master, the streamer's own bookkeeping) is a plain `usize` index
//! into `Streamer::streams`, never a pointer or `Rc` — the slab itself is
//! the sole owner and never moves entries once pushed.

use crate::codec::{self, Am824Settings};
use crate::config::EngineConfig;
use crate::connection::{ConnState, Connection, ConnectionConfig, Direction, ProcessStatus};
use crate::cycletimer::{self, INVALID_TICKS};
use crate::device::{IsoBackend, KernelEvent};
use crate::diagnostics::{Component, Counter, DiagnosticsSink, Level};
use crate::error::{ConfigError, FlowError, Result};
use crate::stream_info::{StreamHandle, StreamInfo};
use crate::stream_settings::StreamSettings;

/// Maximum receive/transmit connections a single streamer may own (spec.md
/// §3 "Streamer": "Owns up to MAX_RCV receive and MAX_XMT transmit
/// connections").
pub const MAX_RCV: usize = 16;
pub const MAX_XMT: usize = 16;

/// Bounded retries while waiting for every running connection's hardware
/// cursor to advance past the period boundary (spec.md §5 "all retries have
/// bounded iteration count").
const MAX_POLL_ITERATIONS: u32 = 64;

/// One connection plus its attached timing/settings state (spec.md §3:
/// "StreamInfos are created with the Connection and never move").
pub struct Stream {
    pub connection: Connection,
    pub info: StreamInfo,
    pub settings: StreamSettings,
    pub am824: Am824Settings,
    /// Set on `start_connection` and on a sync-master switch; cleared after
    /// the stream's first alignment under the new anchor (spec.md §4.E
    /// "start_connection... Marks all receive connections as need_align").
    pub need_align: bool,
}

/// DLL state smoothing the transmit-side write timestamp (spec.md §3
/// "Streamer", §4.E step 6).
struct DllState {
    b: f64,
    c: f64,
    e2: f64,
    last_write_tsp: u32,
    next_write_tsp: u32,
    initialized: bool,
}

/// Result of one `wait_for_period` call (spec.md §7 "User-visible failure
/// behavior").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    Ok,
    Xrun,
    Stopped,
}

/// Multi-connection scheduler (spec.md §4.E).
pub struct Streamer {
    config: EngineConfig,
    diagnostics: Box<dyn DiagnosticsSink>,
    streams: Vec<Stream>,
    sync_master: Option<StreamHandle>,
    /// Utility backend used solely to read the hardware cycle timer on
    /// demand (spec.md §3: "Holds a utility file descriptor for reading the
    /// hardware cycle timer").
    util_backend: Box<dyn IsoBackend>,
    dll: DllState,
    prev_period_start_tsp: u32,
    stop_requested: bool,
}

impl Streamer {
    /// `util_backend` need only implement `get_cycle_timer`; a real caller
    /// hands in the same kind of backend `Connection`s use, opened against
    /// the configured port (spec.md §6 "port").
    pub fn new(config: EngineConfig, util_backend: Box<dyn IsoBackend>, diagnostics: Box<dyn DiagnosticsSink>) -> Result<Self> {
        let config = config.validate()?;
        let bw_rel = config.period_size as f64 / config.sample_rate as f64;
        if bw_rel >= 0.5 {
            return Err(ConfigError::BandwidthTooHigh(bw_rel).into());
        }
        let dll_b = 2.0f64.sqrt() * 2.0 * std::f64::consts::PI * bw_rel;
        let dll_c = (2.0 * std::f64::consts::PI * bw_rel).powi(2);
        Ok(Self {
            config,
            diagnostics,
            streams: Vec::new(),
            sync_master: None,
            util_backend,
            dll: DllState { b: dll_b, c: dll_c, e2: 0.0, last_write_tsp: 0, next_write_tsp: 0, initialized: false },
            prev_period_start_tsp: INVALID_TICKS,
            stop_requested: false,
        })
    }

    pub fn stream(&self, handle: StreamHandle) -> Option<&Stream> {
        self.streams.get(handle)
    }

    /// Mutable access to a stream's connection/settings for test harnesses
    /// that need to poke payload/header state directly (spec.md §8
    /// end-to-end scenarios have no real kernel DMA to generate traffic).
    #[cfg(any(test, feature = "test-util"))]
    pub fn stream_mut(&mut self, handle: StreamHandle) -> Option<&mut Stream> {
        self.streams.get_mut(handle)
    }

    pub fn sync_master(&self) -> Option<StreamHandle> {
        self.sync_master
    }

    /// Allocates a connection of the configured direction and links one
    /// `StreamInfo` to it 1:1 (spec.md §4.E "add_stream(settings)").
    pub fn add_stream(
        &mut self,
        connection_cfg: ConnectionConfig,
        backend: Box<dyn IsoBackend>,
        am824: Am824Settings,
        settings: StreamSettings,
    ) -> Result<StreamHandle> {
        let direction = connection_cfg.direction;
        let max = match direction {
            Direction::Receive => MAX_RCV,
            Direction::Transmit => MAX_XMT,
        };
        let count = self.streams.iter().filter(|s| s.connection.direction() == direction).count();
        if count >= max {
            return Err(ConfigError::TooManyConnections(direction, max).into());
        }
        let connection = Connection::new(connection_cfg, backend)?;
        let info = StreamInfo::new(self.config.sample_rate);
        self.streams.push(Stream { connection, info, settings, am824, need_align: false });
        Ok(self.streams.len() - 1)
    }

    /// spec.md §4.E "set_sync_connection(handle)": the referenced connection
    /// must already be Running. Every other stream's `master` back-reference
    /// is updated; receive streams get `need_align` reasserted (scenario 3).
    pub fn set_sync_connection(&mut self, handle: StreamHandle) -> Result<()> {
        let state = self.streams.get(handle).ok_or(ConfigError::UnknownStream)?.connection.state();
        if state != ConnState::Running {
            return Err(ConfigError::SyncMasterNotRunning.into());
        }
        self.sync_master = Some(handle);
        let has_tsp = self.streams[handle].info.last_tsp != INVALID_TICKS;
        if !has_tsp {
            // tx-only case (spec.md §4.E): substitute the current cycle
            // timer as the master's initial anchor.
            if let Ok(cycle_timer) = self.util_backend.get_cycle_timer() {
                self.streams[handle].info.last_tsp = cycle_timer;
            }
        }
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if i == handle {
                continue;
            }
            stream.info.assign_master(handle);
            if stream.connection.direction() == Direction::Receive {
                stream.need_align = true;
            }
        }
        Ok(())
    }

    /// spec.md §4.E "start_connection(handle, start_cycle)": for transmit
    /// connections, fills the ring with encoded payload before issuing
    /// `START_ISO` so the hardware never sees an empty queue.
    pub fn start_connection(&mut self, handle: StreamHandle, start_cycle: i32) -> Result<()> {
        let diagnostics = self.diagnostics.as_ref();
        let stream = self.streams.get_mut(handle).ok_or(ConfigError::UnknownStream)?;
        let Stream { connection, info, settings, am824, .. } = stream;
        if connection.direction() == Direction::Transmit {
            let effective_tpf = info.tpf;
            connection.process_data(-1, Some(start_cycle as u32), |request_cycle, data, len_io| {
                let (status, len) = codec::encode_packet(am824, info, effective_tpf, &mut settings.substreams, request_cycle, data, diagnostics);
                *len_io = len;
                status
            });
            let prepared = connection.prepare_packets(-1);
            connection.queue_packets(prepared)?;
        }
        connection.start(start_cycle)?;
        if connection.direction() == Direction::Receive {
            stream.need_align = true;
        }
        Ok(())
    }

    /// Requests the loop stop at the next period boundary (spec.md §4.E
    /// "Cancellation"). Idempotent.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Best-effort `SCHED_FIFO` promotion of the calling thread (spec.md §5
    /// "Scheduling", SPEC_FULL.md §5 ambient). Failure is logged, never
    /// fatal — the loop continues at the default scheduling class.
    #[cfg(unix)]
    pub fn raise_realtime_priority(&self) {
        if !self.config.realtime {
            return;
        }
        let param = libc::sched_param { sched_priority: self.config.packetizer_priority };
        let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if ret != 0 {
            self.diagnostics.event(Level::Warn, Component::Streamer, "failed to raise to SCHED_FIFO, continuing at default priority");
        }
    }

    #[cfg(not(unix))]
    pub fn raise_realtime_priority(&self) {}

    fn sleep_until(&self, target_tsp: u32) {
        let Ok(current) = self.util_backend.get_cycle_timer() else { return };
        let delta_ticks = cycletimer::diff_ticks(target_tsp, current);
        if delta_ticks <= 0 {
            return;
        }
        let micros = (delta_ticks as f64 / cycletimer::TICKS_PER_SECOND as f64 * 1_000_000.0) as u64;
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }

    /// Runs one period of spec.md §4.E's main loop.
    pub fn wait_for_period(&mut self) -> PeriodOutcome {
        if self.stop_requested {
            return PeriodOutcome::Stopped;
        }

        // Step 1: prepare period — clear sticky TIMED_OUT, invalidate the
        // affected stream's timestamps so the next interrupt re-anchors it.
        for stream in &mut self.streams {
            if stream.connection.prepare_period() {
                stream.info.last_tsp = INVALID_TICKS;
                stream.info.last_recv_tsp = INVALID_TICKS;
            }
        }

        let Some(master) = self.sync_master else {
            // Nothing to align against yet; the caller must add a sync
            // master before packets can be aligned to a period.
            return PeriodOutcome::Ok;
        };

        let tpf = self.streams[master].info.tpf;
        let one_packet_in_ticks = (8.0 * tpf).round() as u32;
        let one_period_in_ticks = (self.config.period_size as f64 * tpf).round() as u32;

        // Step 2: determine period_start_tsp.
        let master_last_tsp = self.streams[master].info.last_tsp;
        let period_start_tsp = if master_last_tsp != INVALID_TICKS {
            cycletimer::add_ticks(master_last_tsp, one_packet_in_ticks)
        } else if self.prev_period_start_tsp != INVALID_TICKS {
            cycletimer::add_ticks(self.prev_period_start_tsp, one_period_in_ticks)
        } else {
            match self.util_backend.get_cycle_timer() {
                Ok(t) => t,
                Err(_) => return PeriodOutcome::Xrun,
            }
        };
        if cfg!(debug_assertions) && self.prev_period_start_tsp != INVALID_TICKS {
            let predicted = cycletimer::add_ticks(self.prev_period_start_tsp, one_period_in_ticks);
            if cycletimer::diff_ticks(period_start_tsp, predicted).abs() > 500 {
                self.diagnostics.event(Level::Debug, Component::Streamer, "period_start_tsp drift exceeds 500 ticks");
            }
        }

        // Step 3: poll until the next period boundary.
        let wake_at_tsp = cycletimer::add_ticks(period_start_tsp, cycletimer::add_ticks(one_period_in_ticks, cycletimer::TICKS_PER_CYCLE));
        self.sleep_until(wake_at_tsp);
        let target_cycle = cycletimer::cycle_of(wake_at_tsp);
        let mut advanced = vec![false; self.streams.len()];
        for iterations in 0.. {
            let mut all_advanced = true;
            for (i, stream) in self.streams.iter_mut().enumerate() {
                if stream.connection.state() != ConnState::Running {
                    advanced[i] = true;
                    continue;
                }
                if let Ok(Some(event)) = stream.connection.poll_event(0) {
                    match event {
                        KernelEvent::Interrupt { cycle, headers } => stream.connection.on_interrupt(cycle, &headers),
                        KernelEvent::BusReset { .. } => {
                            stream.connection.on_timeout();
                            crate::diagnostics::with_scratch(format_args!("{}", crate::error::TimingError::Timeout), |msg| {
                                self.diagnostics.event(Level::Warn, Component::Connection, msg)
                            });
                            self.diagnostics.counter(Counter::Timeout, 1);
                        }
                        KernelEvent::Unexpected => {
                            self.diagnostics.event(Level::Error, Component::Streamer, "unexpected kernel event");
                        }
                    }
                }
                let hw_cycle = stream.connection.hw_ptr_cycle();
                if hw_cycle >= 0 && cycletimer::diff_cycles(hw_cycle as u32, target_cycle) >= 0 {
                    advanced[i] = true;
                }
                if !advanced[i] {
                    all_advanced = false;
                }
            }
            if all_advanced {
                break;
            }
            if iterations >= MAX_POLL_ITERATIONS {
                for (i, stream) in self.streams.iter_mut().enumerate() {
                    if !advanced[i] && stream.connection.state() == ConnState::Running {
                        stream.connection.on_timeout();
                        crate::diagnostics::with_scratch(format_args!("{}", crate::error::TimingError::Timeout), |msg| {
                            self.diagnostics.event(Level::Warn, Component::Connection, msg)
                        });
                        self.diagnostics.counter(Counter::Timeout, 1);
                    }
                }
                break;
            }
        }

        // Step 4: process headers (pure cursor advance, H -> I).
        for stream in &mut self.streams {
            if stream.connection.state() == ConnState::Running {
                stream.connection.process_headers();
            }
        }

        let mut xrun = false;

        // Step 5: align receive streams.
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if stream.connection.direction() != Direction::Receive || stream.connection.state() != ConnState::Running {
                continue;
            }
            stream.info.start_period(period_start_tsp, self.config.period_size);
            stream.need_align = false;
            let is_master = Some(i) == Some(master);
            let effective_tpf = if is_master { stream.info.tpf } else { tpf };
            let ring_size = stream.connection.n_descriptors();
            if stream.connection.payload_space() == 0 {
                // spec.md:132/203: rx side finding nothing ready to consume
                // is a non-fatal, recoverable underrun (xrun candidate).
                crate::diagnostics::with_scratch(format_args!("{}", FlowError::PayloadBufferEmpty), |msg| {
                    self.diagnostics.event(Level::Warn, Component::Connection, msg)
                });
                self.diagnostics.counter(Counter::PayloadBufferEmpty, 1);
            }
            let Stream { connection, info, settings, am824, .. } = stream;
            let diagnostics = self.diagnostics.as_ref();
            let status = connection.process_data(-1, None, |arrival_ticks, data, len_io| {
                codec::decode_packet(am824, info, is_master, effective_tpf, ring_size, &mut settings.substreams, arrival_ticks, data, *len_io, diagnostics)
            });
            if status != ProcessStatus::HaveEnough {
                xrun = true;
                self.diagnostics.counter(Counter::Xrun, 1);
            }
        }

        // Step 6: DLL update for the transmit write timestamp.
        let write_tsp_meas = cycletimer::add_ticks(
            period_start_tsp,
            ((self.config.period_size as f64 * self.config.nb_periods as f64 + self.config.frame_slack as f64) * tpf).round() as u32,
        );
        if !self.dll.initialized {
            self.dll.e2 = self.config.period_size as f64 * tpf;
            self.dll.next_write_tsp = cycletimer::add_ticks(write_tsp_meas, self.dll.e2.round() as u32);
            self.dll.last_write_tsp = write_tsp_meas;
            self.dll.initialized = true;
        } else {
            let err = cycletimer::diff_ticks(write_tsp_meas, self.dll.next_write_tsp) as f64;
            self.dll.last_write_tsp = self.dll.next_write_tsp;
            self.dll.next_write_tsp = cycletimer::add_ticks(self.dll.next_write_tsp, (self.dll.b * err + self.dll.e2).round() as u32);
            self.dll.e2 += self.dll.c * err;
        }
        let write_tsp = self.dll.last_write_tsp;

        // Step 7: write transmit streams, symmetric to step 5.
        for (i, stream) in self.streams.iter_mut().enumerate() {
            if stream.connection.direction() != Direction::Transmit || stream.connection.state() != ConnState::Running {
                continue;
            }
            stream.info.start_period(write_tsp, self.config.period_size);
            stream.need_align = false;
            let is_master = Some(i) == Some(master);
            let effective_tpf = if is_master { stream.info.tpf } else { tpf };
            let request_cycle_base = stream.connection.hw_ptr_cycle().max(0) as u32;
            if stream.connection.payload_space() == 0 {
                // spec.md:132/292: tx side has no free ring slot to write
                // into this period — non-fatal, recoverable underrun.
                crate::diagnostics::with_scratch(format_args!("{}", FlowError::PayloadBufferEmpty), |msg| {
                    self.diagnostics.event(Level::Warn, Component::Connection, msg)
                });
                self.diagnostics.counter(Counter::PayloadBufferEmpty, 1);
            }
            let Stream { connection, info, settings, am824, .. } = stream;
            let diagnostics = self.diagnostics.as_ref();
            let status = connection.process_data(-1, Some(request_cycle_base), |request_cycle, data, len_io| {
                let (status, len) = codec::encode_packet(am824, info, effective_tpf, &mut settings.substreams, request_cycle, data, diagnostics);
                *len_io = len;
                status
            });
            if status != ProcessStatus::HaveEnough {
                xrun = true;
                self.diagnostics.counter(Counter::Xrun, 1);
            }
        }

        // Step 8: queue next period.
        let irq_tsp = cycletimer::add_ticks(
            period_start_tsp,
            ((self.config.nb_periods as f64 + 1.0) * self.config.period_size as f64 * tpf).round() as u32,
        );
        let irq_cycle = cycletimer::cycle_of(irq_tsp) as i32;
        for stream in &mut self.streams {
            if stream.connection.state() != ConnState::Running {
                continue;
            }
            let queue_cycle = stream.connection.queue_cycle();
            if queue_cycle < 0 {
                continue;
            }
            let mut npackets = cycletimer::diff_cycles(irq_cycle as u32, queue_cycle as u32) + 1;
            let mut target_cycle = irq_cycle;
            if npackets < 0 {
                target_cycle = queue_cycle;
                npackets = 1;
            }
            let prepared = stream.connection.prepare_packets(npackets as isize) as i32;
            if prepared < npackets {
                let shortfall = npackets - prepared;
                target_cycle = (((target_cycle - shortfall) % 8000) + 8000) % 8000;
                // spec.md:132: buffer-full on queue is a non-fatal warning,
                // recoverable once the next interrupt delivers a fresh anchor.
                crate::diagnostics::with_scratch(format_args!("{}", FlowError::HeaderBufferFull), |msg| {
                    self.diagnostics.event(Level::Warn, Component::Connection, msg)
                });
                self.diagnostics.counter(Counter::HeaderBufferFull, 1);
            }
            if stream.connection.queue_packets(prepared.max(0) as usize).is_err() {
                xrun = true;
            }
            if stream.connection.request_interrupt(target_cycle as u32).is_err() {
                self.diagnostics.counter(Counter::InterruptRequestRejected, 1);
            }
        }

        // Step 9.
        self.prev_period_start_tsp = period_start_tsp;

        if xrun {
            PeriodOutcome::Xrun
        } else {
            PeriodOutcome::Ok
        }
    }
}
