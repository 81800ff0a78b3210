//! CycleTimer tick arithmetic.
//!
//! A tick is a 32-bit point on the 1394 bus's 128-second wheel: 3 bits of
//! seconds (mod 128), 13 bits of cycle (0..8000), 12 bits of offset
//! (0..3072, units of 1/24.576 MHz). All arithmetic here is modular —
//! there is no "largest" tick, only distances around the circle.

/// Ticks per 125 us bus cycle.
pub const TICKS_PER_CYCLE: u32 = 3072;
/// Bus cycles per second.
pub const CYCLES_PER_SECOND: u32 = 8000;
/// Ticks per second.
pub const TICKS_PER_SECOND: u32 = CYCLES_PER_SECOND * TICKS_PER_CYCLE;
/// Full wrap period of a tick, in ticks: 128 seconds.
pub const MAX_TICKS: u64 = 128 * TICKS_PER_SECOND as u64;

/// Sentinel meaning "not yet known".
pub const INVALID_TICKS: u32 = 0xFFFF_FFFF;

/// Sentinel SYT value meaning "no timestamp in this packet".
pub const SYT_NO_TIMESTAMP: u16 = 0xFFFF;

#[inline]
fn wrap(v: u64) -> u32 {
    (v % MAX_TICKS) as u32
}

/// Wrap-safe `a + b` on the tick circle.
pub fn add_ticks(a: u32, b: u32) -> u32 {
    wrap(a as u64 + b as u64)
}

/// Wrap-safe `a - b` on the tick circle (always non-negative result).
pub fn sub_ticks(a: u32, b: u32) -> u32 {
    wrap(a as u64 + MAX_TICKS - b as u64 % MAX_TICKS)
}

/// Signed shortest-path distance `a - b`, in `(-MAX_TICKS/2, MAX_TICKS/2]`.
///
/// Used throughout the codec/streamer to compare timestamps that live on a
/// wrapping clock without ever materializing a "larger" absolute tick.
pub fn diff_ticks(a: u32, b: u32) -> i64 {
    let half = (MAX_TICKS / 2) as i64;
    let raw = sub_ticks(a, b) as i64;
    if raw > half {
        raw - MAX_TICKS as i64
    } else {
        raw
    }
}

/// Signed shortest-path distance between two bus cycles, modulo 8000.
pub fn diff_cycles(a: u32, b: u32) -> i32 {
    let m = CYCLES_PER_SECOND as i64;
    let raw = ((a as i64 - b as i64) % m + m) % m;
    if raw > m / 2 {
        (raw - m) as i32
    } else {
        raw as i32
    }
}

/// Extract the 13-bit cycle field of a tick.
pub fn cycle_of(tick: u32) -> u32 {
    (tick / TICKS_PER_CYCLE) % CYCLES_PER_SECOND
}

/// Extract the 12-bit offset field of a tick.
pub fn offset_of(tick: u32) -> u32 {
    tick % TICKS_PER_CYCLE
}

/// Total number of bus-cycle slots the tick wheel holds: `MAX_TICKS /
/// TICKS_PER_CYCLE`, i.e. 128 seconds worth of cycles (0..8000 each).
const ABS_CYCLES: i64 = (MAX_TICKS / TICKS_PER_CYCLE as u64) as i64;

#[inline]
fn wrap_abs_cycle(v: i64) -> u64 {
    (((v % ABS_CYCLES) + ABS_CYCLES) % ABS_CYCLES) as u64
}

/// Compute the 16-bit SYT carried on the wire for a full tick:
/// `(cycle_low<<12) | offset`, where `cycle_low` is the cycle field's low 4
/// bits and `offset` is the 12-bit offset field (spec.md §3, §6 "SYT").
pub fn ticks_to_syt(tick: u32) -> u16 {
    (((cycle_of(tick) & 0xF) << 12) | offset_of(tick)) as u16
}

/// Reconstruct the full 32-bit timestamp from a received 16-bit SYT given
/// the arrival time, by pinning the SYT's 4-bit cycle-low field to the
/// absolute cycle count nearest `arrival_ticks` that shares those low bits,
/// then restoring the 12-bit offset verbatim.
///
/// SYT is ambiguous beyond 16 cycles (~2ms) since it only carries the
/// cycle count's low 4 bits; the only way to lift it back to an absolute
/// tick is to anchor it near a known-good local time.
pub fn syt_recv_to_full_ticks(syt16: u16, arrival_ticks: u32) -> u32 {
    let cycle_low4 = ((syt16 >> 12) & 0xF) as i64;
    let offset = (syt16 & 0x0FFF) as u64;

    let arrival_abs_cycle = (arrival_ticks / TICKS_PER_CYCLE) as i64;
    let base = arrival_abs_cycle - arrival_abs_cycle.rem_euclid(16) + cycle_low4;

    [base - 16, base, base + 16]
        .into_iter()
        .map(|c| wrap(wrap_abs_cycle(c) * TICKS_PER_CYCLE as u64 + offset))
        .min_by_key(|&c| diff_ticks(c, arrival_ticks).abs())
        .unwrap()
}
