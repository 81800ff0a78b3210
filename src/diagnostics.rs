//! Diagnostics sink — isolates the "process-wide async log buffer" the
//! original carries (Design Notes §9 "Global state") into an injected
//! trait instead of static state. No allocation and no blocking on the RT
//! path: [`DiagnosticsSink::event`] writes into a fixed-capacity slot of a
//! bounded SPSC ring and [`DiagnosticsSink::counter`] is a single atomic
//! add. The drain side (never called from the RT thread) is the only place
//! that allocates, turning each slot's raw bytes into an owned `String`.

use std::cell::{RefCell, UnsafeCell};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

thread_local! {
    static SCRATCH: RefCell<String> = RefCell::new(String::with_capacity(EVENT_MSG_CAP));
}

/// Formats `args` into a thread-local scratch buffer reused across calls and
/// hands the resulting `&str` to `f`, so building an interpolated message
/// (typically a typed error's `Display` impl) never allocates on the RT path
/// after the buffer's capacity has warmed up (spec.md §9 "lock-free message
/// buffer").
pub fn with_scratch<R>(args: std::fmt::Arguments<'_>, f: impl FnOnce(&str) -> R) -> R {
    SCRATCH.with(|cell| {
        let mut buf = cell.borrow_mut();
        buf.clear();
        let _ = buf.write_fmt(args);
        f(&buf)
    })
}

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Trace,
    Debug,
    Warn,
    Error,
}

/// Emitting component, for filtering/labelling by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    CycleTimerCheck,
    Connection,
    Codec,
    StreamInfo,
    Streamer,
}

/// Countable recurring events (spec.md §7 kinds 3 and 4, plus timing
/// recovery events). Each variant maps to one atomic counter in
/// [`ChannelSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    BogusPacket,
    SytMismatch,
    HeaderBufferFull,
    PayloadBufferEmpty,
    InterruptRequestRejected,
    CatchUp,
    Xrun,
    Timeout,
}

const COUNTER_VARIANTS: usize = 8;

fn counter_index(c: Counter) -> usize {
    match c {
        Counter::BogusPacket => 0,
        Counter::SytMismatch => 1,
        Counter::HeaderBufferFull => 2,
        Counter::PayloadBufferEmpty => 3,
        Counter::InterruptRequestRejected => 4,
        Counter::CatchUp => 5,
        Counter::Xrun => 6,
        Counter::Timeout => 7,
    }
}

/// Injected at `Streamer` construction; every component logs through this
/// instead of `println!`/`eprintln!` (Design Notes §9).
pub trait DiagnosticsSink: Send + Sync {
    fn event(&self, level: Level, component: Component, message: &str);
    fn counter(&self, counter: Counter, delta: u64);
}

/// Drops everything. Default sink for callers that don't care.
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn event(&self, _level: Level, _component: Component, _message: &str) {}
    fn counter(&self, _counter: Counter, _delta: u64) {}
}

/// Longest message byte length a slot stores; longer messages are
/// truncated. Generous enough for every literal codec.rs/connection.rs/
/// streamer.rs pass today.
const EVENT_MSG_CAP: usize = 96;

/// One fixed-size ring slot, never resized or heap-allocated after
/// construction.
struct Slot {
    level: UnsafeCell<Level>,
    component: UnsafeCell<Component>,
    len: UnsafeCell<usize>,
    data: UnsafeCell<[u8; EVENT_MSG_CAP]>,
}

// Safety: a slot at ring position `i` is written only by the producer while
// advancing `write_idx` past `i`, and read only by the drain-side consumer
// while advancing `read_idx` past `i`; the Release/Acquire pair on those
// cursors (see `event`/`drain`) establishes happens-before between the two,
// so no two callers ever touch the same slot's `UnsafeCell`s concurrently.
unsafe impl Sync for Slot {}

impl Slot {
    fn empty() -> Self {
        Self {
            level: UnsafeCell::new(Level::Trace),
            component: UnsafeCell::new(Component::Streamer),
            len: UnsafeCell::new(0),
            data: UnsafeCell::new([0u8; EVENT_MSG_CAP]),
        }
    }
}

/// Lock-free push side (an `AtomicU64` array for counters plus a bounded
/// single-producer/single-consumer ring of fixed-capacity byte slots,
/// guarded only by cursor atomics), mirroring the teacher's
/// `Producer`/`Consumer`-split `ringbuf` usage (`bass-aes67/src/input/stream.rs`)
/// but reimplemented over fixed `Copy` slots here since event messages are
/// variable-length text rather than `ringbuf`'s single-sample-type elements.
pub struct ChannelSink {
    counters: [AtomicU64; COUNTER_VARIANTS],
    overflow: AtomicU64,
    slots: Box<[Slot]>,
    capacity: usize,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot::empty()).collect::<Vec<_>>().into_boxed_slice();
        Arc::new(Self {
            counters: Default::default(),
            overflow: AtomicU64::new(0),
            slots,
            capacity,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
        })
    }

    /// Snapshot of all counters, indexed the same way as [`counter_index`].
    pub fn counters(&self) -> [u64; COUNTER_VARIANTS] {
        let mut out = [0u64; COUNTER_VARIANTS];
        for (i, c) in self.counters.iter().enumerate() {
            out[i] = c.load(Ordering::Relaxed);
        }
        out
    }

    pub fn counter_value(&self, counter: Counter) -> u64 {
        self.counters[counter_index(counter)].load(Ordering::Relaxed)
    }

    /// Number of events dropped because the ring was full.
    pub fn overflow(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Drain buffered events for off-line inspection (never called from the
    /// RT thread). This is the only place in this module that allocates.
    pub fn drain(&self) -> Vec<(Level, Component, String)> {
        let mut out = Vec::new();
        loop {
            let r = self.read_idx.load(Ordering::Relaxed);
            let w = self.write_idx.load(Ordering::Acquire);
            if r == w {
                break;
            }
            let slot = &self.slots[r % self.capacity];
            // Safety: `w != r` means the producer's Release store publishing
            // this slot happened-before this Acquire load, and drain is not
            // invoked from the RT thread (single drain-side caller).
            let (level, component, message) = unsafe {
                let len = *slot.len.get();
                let bytes = &(*slot.data.get())[..len];
                (*slot.level.get(), *slot.component.get(), String::from_utf8_lossy(bytes).into_owned())
            };
            self.read_idx.store(r.wrapping_add(1), Ordering::Release);
            out.push((level, component, message));
        }
        out
    }
}

impl DiagnosticsSink for ChannelSink {
    fn event(&self, level: Level, component: Component, message: &str) {
        let w = self.write_idx.load(Ordering::Relaxed);
        let r = self.read_idx.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.capacity {
            // Ring full: drop the oldest slot rather than block or grow.
            self.read_idx.store(r.wrapping_add(1), Ordering::Release);
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
        let slot = &self.slots[w % self.capacity];
        let bytes = message.as_bytes();
        let n = bytes.len().min(EVENT_MSG_CAP);
        // Safety: this slot was either never published or just reclaimed by
        // the `read_idx` advance above, so the producer is its sole writer;
        // the Release store below publishes these writes to the consumer.
        unsafe {
            (*slot.data.get())[..n].copy_from_slice(&bytes[..n]);
            *slot.len.get() = n;
            *slot.level.get() = level;
            *slot.component.get() = component;
        }
        self.write_idx.store(w.wrapping_add(1), Ordering::Release);
    }

    fn counter(&self, counter: Counter, delta: u64) {
        self.counters[counter_index(counter)].fetch_add(delta, Ordering::Relaxed);
    }
}

/// Lets a caller keep an `Arc<ChannelSink>` for introspection (`counter_value`,
/// `drain`, ...) while also handing a `Box<dyn DiagnosticsSink>` sharing the
/// same underlying state to a [`crate::streamer::Streamer`] — the same shape
/// `device.rs`'s `impl IsoBackend for Arc<FakeBackend>` uses for its test
/// double.
impl<T: DiagnosticsSink + ?Sized> DiagnosticsSink for Arc<T> {
    fn event(&self, level: Level, component: Component, message: &str) {
        (**self).event(level, component, message)
    }

    fn counter(&self, counter: Counter, delta: u64) {
        (**self).counter(counter, delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_is_inert() {
        let sink = NullSink;
        sink.event(Level::Warn, Component::Codec, "ignored");
        sink.counter(Counter::Xrun, 1);
    }

    #[test]
    fn channel_sink_counts_and_drains() {
        let sink = ChannelSink::new(4);
        sink.counter(Counter::Xrun, 1);
        sink.counter(Counter::Xrun, 2);
        assert_eq!(sink.counter_value(Counter::Xrun), 3);

        for i in 0..6 {
            sink.event(Level::Debug, Component::Connection, &format!("e{i}"));
        }
        assert_eq!(sink.overflow(), 2);
        let drained = sink.drain();
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0].2, "e2");
        assert_eq!(drained[3].2, "e5");
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn long_message_is_truncated_not_allocated_unbounded() {
        let sink = ChannelSink::new(2);
        let long = "x".repeat(EVENT_MSG_CAP * 3);
        sink.event(Level::Warn, Component::Codec, &long);
        let drained = sink.drain();
        assert_eq!(drained[0].2.len(), EVENT_MSG_CAP);
    }
}
