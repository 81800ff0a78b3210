//! Per-stream timing state (spec.md §3 "StreamInfo", §4.D).
//!
//! One `StreamInfo` per connection (1:1 mapping). It never moves once
//! created — Design Notes §9 "Cyclic references" stores its sync-master
//! back-reference and its owning connection's reference as non-owning
//! indices into the streamer's stable connection slab, not pointers or
//! `Rc`s, so there is no reference cycle in the ownership graph.

use crate::cycletimer::{self, INVALID_TICKS};

/// Non-owning handle into the streamer's connection slab (Design Notes §9).
pub type StreamHandle = usize;

/// Per-stream timing state (spec.md §3).
pub struct StreamInfo {
    /// Timestamp of the last-received SYT (rx) or last-emitted packet (tx).
    pub last_tsp: u32,
    /// Timestamp attributed to the frame at offset 0 of the current period.
    pub base_tsp: u32,
    /// Frames already consumed/produced this period.
    pub offset: i64,
    /// Frames remaining this period; `<= 0` means "period satisfied".
    pub todo: i64,
    /// Ticks per frame. Updated only by the sync master (spec.md §4.C step 5).
    pub tpf: f64,
    /// Non-owning back-reference to the designated sync-master's stream.
    pub master: Option<StreamHandle>,
    /// Raw cycle-stamp of the last packet's arrival, for continuity checks
    /// (spec.md §8 "consecutive rx packets" invariant).
    pub last_recv_tsp: u32,
    /// Set once this stream has produced at least one valid timestamp; gates
    /// the `INIT` branch the spec calls out in Design Notes §9's third
    /// open question (steady-state vs. first-packet handling).
    pub initialized: bool,
}

impl StreamInfo {
    pub fn new(nominal_rate: u32) -> Self {
        let mut s = Self {
            last_tsp: INVALID_TICKS,
            base_tsp: INVALID_TICKS,
            offset: 0,
            todo: 0,
            tpf: 0.0,
            master: None,
            last_recv_tsp: INVALID_TICKS,
            initialized: false,
        };
        s.reset(nominal_rate);
        s
    }

    /// spec.md §4.D "reset()": invalidates timestamps and reseeds `tpf`
    /// from the nominal rate. Called at construction and whenever a
    /// connection comes back from `TIMED_OUT`.
    pub fn reset(&mut self, nominal_rate: u32) {
        self.last_tsp = INVALID_TICKS;
        self.last_recv_tsp = INVALID_TICKS;
        self.base_tsp = INVALID_TICKS;
        self.tpf = cycletimer::TICKS_PER_SECOND as f64 / nominal_rate as f64;
        self.initialized = false;
    }

    /// spec.md §4.D "assign_master(ptr)".
    pub fn assign_master(&mut self, handle: StreamHandle) {
        self.master = Some(handle);
    }

    pub fn is_valid_tsp(&self, tick: u32) -> bool {
        tick != INVALID_TICKS
    }

    /// Starts a new period: anchor the base timestamp and reset the
    /// per-period counters (spec.md §4.E step 5/7 "align streams").
    pub fn start_period(&mut self, base_tsp: u32, period_size: u32) {
        self.base_tsp = base_tsp;
        self.offset = 0;
        self.todo = period_size as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_invalidates_timestamps_and_seeds_tpf() {
        let mut info = StreamInfo::new(48000);
        assert_eq!(info.last_tsp, INVALID_TICKS);
        assert!((info.tpf - 512.0).abs() < 1e-9);
        info.last_tsp = 1234;
        info.reset(48000);
        assert_eq!(info.last_tsp, INVALID_TICKS);
    }

    #[test]
    fn start_period_seeds_offset_and_todo() {
        let mut info = StreamInfo::new(48000);
        info.start_period(1000, 512);
        assert_eq!(info.base_tsp, 1000);
        assert_eq!(info.offset, 0);
        assert_eq!(info.todo, 512);
    }
}
