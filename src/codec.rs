//! AM824 / IEC-61883-6 codec (spec.md §4.C): per-packet CIP header
//! build/parse, audio/MIDI substream demux/mux, SYT timestamp decode/encode.
//!
//! Design Notes §9 "Manual header byte-swap": wire quadlets never become a
//! host-endian bitfield struct. [`cip`] exposes the 8-byte CIP header as a
//! plain `[u8; 8]` and every field is read/written through an accessor
//! function, matching the teacher's `rtp::header` module (parse/encode
//! pairs over a byte buffer, no `#[repr(C, packed)]` bitfields).

use crate::connection::ProcessStatus;
use crate::cycletimer::{self, INVALID_TICKS};
use crate::diagnostics::{self, Component, Counter, DiagnosticsSink, Level};
use crate::error::{ConfigError, ProtocolError};
use crate::stream_info::StreamInfo;
use crate::stream_settings::{Substream, SubstreamBuffer, SubstreamKind};

/// CIP / AM824 wire constants (spec.md §6 "CIP packet format" / "AM824
/// event format").
pub mod cip {
    pub const HEADER_LEN: usize = 8;
    pub const FMT_AMDTP: u8 = 0x10;
    pub const FDF_NO_DATA: u8 = 0xFF;
    pub const SYT_NO_TIMESTAMP: u16 = 0xFFFF;

    pub const LABEL_AUDIO: u8 = 0x40;
    pub const LABEL_MIDI_NO_DATA: u8 = 0x80;
    pub const LABEL_MIDI_1BYTE: u8 = 0x81;

    /// `sid`, `dbs`, `dbc` from quadlet 0; `fmt`, `fdf`, `syt` from quadlet 1.
    pub fn sid(header: &[u8]) -> u8 {
        header[0] & 0x3F
    }
    pub fn dbs(header: &[u8]) -> u8 {
        header[1]
    }
    pub fn dbc(header: &[u8]) -> u8 {
        header[3]
    }
    pub fn fmt(header: &[u8]) -> u8 {
        header[4] & 0x3F
    }
    pub fn fdf(header: &[u8]) -> u8 {
        header[5]
    }
    pub fn syt(header: &[u8]) -> u16 {
        u16::from_be_bytes([header[6], header[7]])
    }

    /// Builds an 8-byte CIP header. `EOH` is fixed at `0b10` in the top two
    /// bits of both quadlet-0 and quadlet-1's leading byte (spec.md §6).
    pub fn build(sid: u8, dbs: u8, dbc: u8, fmt: u8, fdf: u8, syt: u16) -> [u8; 8] {
        let syt_bytes = syt.to_be_bytes();
        [
            0x80 | (sid & 0x3F),
            dbs,
            0,
            dbc,
            0x80 | (fmt & 0x3F),
            fdf,
            syt_bytes[0],
            syt_bytes[1],
        ]
    }
}

/// syt_interval / FDF-SFC lookup (spec.md §4.C "Sample-rate table").
pub fn rate_params(samplerate: u32) -> Result<(u8, u8), ConfigError> {
    match samplerate {
        32000 => Ok((8, 0x00)),
        44100 => Ok((8, 0x01)),
        48000 => Ok((8, 0x02)),
        88200 => Ok((16, 0x03)),
        96000 => Ok((16, 0x04)),
        176400 => Ok((32, 0x05)),
        192000 => Ok((32, 0x06)),
        other => Err(ConfigError::UnsupportedRate(other)),
    }
}

/// Per-AM824-stream settings (spec.md §3 "AM824 settings"): rate-derived
/// constants plus the running CIP state (`dbc`) that belongs to exactly one
/// connection.
pub struct Am824Settings {
    pub samplerate: u32,
    pub nb_channels: u8,
    pub syt_interval: u8,
    pub fdf: u8,
    pub packet_length: usize,
    pub transfer_delay: u32,
    sid: u8,
    dbc: u8,
    /// Frames between MIDI bytes actually placed on (or taken off) the
    /// wire, derived from the real sample rate rather than a fixed divisor
    /// (Design Notes §9, third open question).
    midi_lock_frames: u32,
}

/// Default transfer delay, ticks (spec.md GLOSSARY: "typically ~9000 ticks").
pub const DEFAULT_TRANSFER_DELAY: u32 = 9000;

impl Am824Settings {
    pub fn new(samplerate: u32, nb_channels: u8, sid: u8, transfer_delay: u32) -> Result<Self, ConfigError> {
        let (syt_interval, fdf) = rate_params(samplerate)?;
        let packet_length = syt_interval as usize * 4 * nb_channels as usize + cip::HEADER_LEN;
        let midi_lock_frames = (samplerate / 3125).max(1);
        Ok(Self {
            samplerate,
            nb_channels,
            syt_interval,
            fdf,
            packet_length,
            transfer_delay,
            sid,
            dbc: 0,
            midi_lock_frames,
        })
    }

    pub fn dbc(&self) -> u8 {
        self.dbc
    }
}

fn sign_extend_24(v: u32) -> i32 {
    let v = v & 0x00FF_FFFF;
    if v & 0x0080_0000 != 0 {
        (v | 0xFF00_0000) as i32
    } else {
        v as i32
    }
}

/// Decodes one big-endian 32-bit AM824 audio sample to `f32` in `[-1, 1]`
/// (spec.md §4.C "Audio demux").
pub fn decode_audio_sample(word: u32) -> f32 {
    sign_extend_24(word) as f32 / 0x007F_FFFF as f32
}

/// Encodes an `f32` sample (clamped to `[-1, 1]`) into an AM824 audio word
/// with the `0x40` label (spec.md §4.C "Transmit path" step 5).
pub fn encode_audio_sample(sample: f32) -> u32 {
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = (clamped * 0x007F_FFFF as f32).round() as i32;
    let bits = (scaled as u32) & 0x00FF_FFFF;
    ((cip::LABEL_AUDIO as u32) << 24) | bits
}

/// Maximum catch-up steps per call (spec.md §5 "all retries have bounded
/// iteration count").
const MAX_CATCHUP_STEPS: u32 = 8;

/// Receive path (spec.md §4.C "Receive path"). `arrival_ticks` is the tick
/// [`crate::connection::Connection::process_data`] synthesized for this
/// packet; `data` is the raw `[CIP header][payload]` bytes, `len` the
/// actual received length in bytes. `ring_size` is the connection's
/// descriptor count, used for the consecutive-cycle continuity check
/// (spec.md §8).
#[allow(clippy::too_many_arguments)]
pub fn decode_packet(
    settings: &Am824Settings,
    info: &mut StreamInfo,
    is_sync_master: bool,
    effective_tpf: f64,
    ring_size: usize,
    substreams: &mut [Substream],
    arrival_ticks: u32,
    data: &[u8],
    len: usize,
    sink: &dyn DiagnosticsSink,
) -> ProcessStatus {
    if len < cip::HEADER_LEN || data.len() < cip::HEADER_LEN {
        sink.counter(Counter::BogusPacket, 1);
        return ProcessStatus::NeedMore;
    }
    let header = &data[..cip::HEADER_LEN];
    let fmt = cip::fmt(header);
    let fdf = cip::fdf(header);
    let dbs = cip::dbs(header);

    if fmt != cip::FMT_AMDTP {
        let err = ProtocolError::BadFmt(fmt);
        diagnostics::with_scratch(format_args!("{err}"), |msg| sink.event(Level::Warn, Component::Codec, msg));
        sink.counter(Counter::BogusPacket, 1);
        return ProcessStatus::NeedMore;
    }
    if fdf == cip::FDF_NO_DATA {
        // no-data packet: header cursor already advanced by the caller.
        diagnostics::with_scratch(format_args!("{}", ProtocolError::NoData), |msg| sink.event(Level::Trace, Component::Codec, msg));
        return ProcessStatus::NeedMore;
    }
    if dbs == 0 {
        diagnostics::with_scratch(format_args!("{}", ProtocolError::ZeroDbs), |msg| sink.event(Level::Warn, Component::Codec, msg));
        sink.counter(Counter::BogusPacket, 1);
        return ProcessStatus::NeedMore;
    }

    let syt = cip::syt(header);
    if syt == cip::SYT_NO_TIMESTAMP {
        return ProcessStatus::NeedMore;
    }

    let this_ts = cycletimer::syt_recv_to_full_ticks(syt, arrival_ticks);
    let lifted_syt = cycletimer::ticks_to_syt(this_ts);
    if lifted_syt != syt {
        let err = ProtocolError::SytRoundTripMismatch { expected: syt, got: lifted_syt };
        diagnostics::with_scratch(format_args!("{err}"), |msg| sink.event(Level::Warn, Component::Codec, msg));
        sink.counter(Counter::SytMismatch, 1);
    }

    if len < 2 * 4 {
        sink.counter(Counter::BogusPacket, 1);
        return ProcessStatus::NeedMore;
    }
    let n_quadlets = (len / 4).saturating_sub(2);
    if n_quadlets % dbs as usize != 0 {
        let err = ProtocolError::PayloadNotMultipleOfDbs { len, dbs };
        diagnostics::with_scratch(format_args!("{err}"), |msg| sink.event(Level::Warn, Component::Codec, msg));
        sink.counter(Counter::BogusPacket, 1);
        return ProcessStatus::NeedMore;
    }
    let nframes = n_quadlets / dbs as usize;
    if nframes != settings.syt_interval as usize || nframes % 8 != 0 {
        sink.event(Level::Warn, Component::Codec, "nframes does not match syt_interval");
        sink.counter(Counter::BogusPacket, 1);
        return ProcessStatus::NeedMore;
    }

    // Continuity check (spec.md §8): a gap of 0 or > ring_size cycles
    // invalidates last_tsp but processing continues.
    if info.last_recv_tsp != INVALID_TICKS {
        // spec.md:305: forward-only `(cycle_curr - cycle_prev) mod 8000`, not
        // `diff_cycles`'s shortest-signed-path — a regressed/duplicate stamp
        // must show up as a huge forward gap, not a small negative one.
        let gap = (cycletimer::cycle_of(this_ts) as i64 - cycletimer::cycle_of(info.last_recv_tsp) as i64).rem_euclid(8000) as usize;
        if gap == 0 || gap > ring_size {
            info.last_tsp = INVALID_TICKS;
        }
    }
    info.last_recv_tsp = this_ts;

    // spec.md §4.C step 5: the sync master updates tpf with a one-pole IIR
    // over the inter-packet delta. First packet (no prior last_tsp) just
    // seeds last_tsp without touching tpf (Design Notes §9 INIT branch).
    if is_sync_master {
        if info.last_tsp != INVALID_TICKS {
            let delta_ticks = cycletimer::diff_ticks(this_ts, info.last_tsp) as f64;
            info.tpf += 0.01 * (delta_ticks / nframes as f64 - info.tpf);
        }
        info.last_tsp = this_ts;
        info.initialized = true;
    } else if info.base_tsp == INVALID_TICKS {
        // Non-master stream hasn't been aligned to a period yet; nothing
        // more to do until the streamer anchors its base_tsp.
        info.last_tsp = this_ts;
        return ProcessStatus::NeedMore;
    } else {
        info.last_tsp = this_ts;
    }

    // For the sync master, `info.tpf` was just updated above and is the
    // authoritative value; other streams use the master's tpf resolved by
    // the caller (streamer owns the non-owning master lookup).
    let tpf = if is_sync_master { info.tpf } else { effective_tpf };
    if tpf <= 0.0 {
        return ProcessStatus::NeedMore;
    }

    let mut ticks_in_buffer = info.offset as f64 * tpf;
    let mut next_tsp = cycletimer::add_ticks(info.base_tsp, ticks_in_buffer.round() as u32);
    let mut frames_late = cycletimer::diff_ticks(this_ts, next_tsp) as f64 / tpf;

    let half_interval = settings.syt_interval as f64 / 2.0;
    if frames_late < -half_interval {
        sink.event(Level::Warn, Component::Codec, "packet older than period anchor, dropped");
        return ProcessStatus::NeedMore;
    }
    let mut steps = 0;
    while frames_late >= half_interval && steps < MAX_CATCHUP_STEPS {
        info.base_tsp = cycletimer::add_ticks(info.base_tsp, (settings.syt_interval as f64 * tpf).round() as u32);
        ticks_in_buffer = info.offset as f64 * tpf;
        next_tsp = cycletimer::add_ticks(info.base_tsp, ticks_in_buffer.round() as u32);
        frames_late = cycletimer::diff_ticks(this_ts, next_tsp) as f64 / tpf;
        sink.counter(Counter::CatchUp, 1);
        sink.event(Level::Debug, Component::Codec, "rx catch-up: advanced base_tsp by one syt_interval");
        steps += 1;
    }

    let payload = &data[cip::HEADER_LEN..cip::HEADER_LEN + nframes * dbs as usize * 4];
    demux(payload, nframes, dbs as usize, info.offset as usize, substreams, sink);

    info.offset += nframes as i64;
    info.todo -= nframes as i64;
    if info.todo <= 0 {
        ProcessStatus::HaveEnough
    } else {
        ProcessStatus::NeedMore
    }
}

fn demux(payload: &[u8], nframes: usize, dbs: usize, base_offset: usize, substreams: &mut [Substream], sink: &dyn DiagnosticsSink) {
    for frame in 0..nframes {
        for col in 0..dbs {
            let off = (frame * dbs + col) * 4;
            if off + 4 > payload.len() {
                continue;
            }
            let word = u32::from_be_bytes([payload[off], payload[off + 1], payload[off + 2], payload[off + 3]]);
            let Some(sub) = substreams.get_mut(col) else { continue };
            if !sub.is_on() {
                continue;
            }
            match (&mut sub.buffer, sub.kind) {
                (SubstreamBuffer::Audio(handle), SubstreamKind::Audio) => {
                    handle.write(base_offset + frame, decode_audio_sample(word));
                }
                (SubstreamBuffer::Midi(ring), SubstreamKind::Midi) => {
                    let label = (word >> 24) as u8;
                    if label != cip::LABEL_MIDI_NO_DATA {
                        let byte = (word & 0xFF) as u8;
                        if !ring.push(byte) {
                            sink.event(Level::Warn, Component::Codec, "rx midi ring overflow, dropped oldest byte");
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Transmit path (spec.md §4.C "Transmit path"). Writes the encoded packet
/// into `out` (must be at least `settings.packet_length` bytes) and returns
/// `(status, bytes_written)`.
pub fn encode_packet(
    settings: &mut Am824Settings,
    info: &mut StreamInfo,
    effective_tpf: f64,
    substreams: &mut [Substream],
    request_cycle: u32,
    out: &mut [u8],
    sink: &dyn DiagnosticsSink,
) -> (ProcessStatus, usize) {
    let empty = |out: &mut [u8]| -> usize {
        let header = cip::build(0, 0, 0, cip::FMT_AMDTP, cip::FDF_NO_DATA, cip::SYT_NO_TIMESTAMP);
        out[..cip::HEADER_LEN].copy_from_slice(&header);
        cip::HEADER_LEN
    };

    if info.base_tsp == INVALID_TICKS {
        return (ProcessStatus::NeedMore, empty(out));
    }
    let tpf = effective_tpf;
    if tpf <= 0.0 {
        return (ProcessStatus::NeedMore, empty(out));
    }

    let mut next_tsp = cycletimer::add_ticks(info.base_tsp, (info.offset as f64 * tpf).round() as u32);
    let mut transmit_at_tsp = cycletimer::sub_ticks(next_tsp, settings.transfer_delay);
    let mut transmit_at_cycle = cycletimer::cycle_of(transmit_at_tsp);
    let mut cycles_late = cycletimer::diff_cycles(request_cycle, transmit_at_cycle);

    if cycles_late < 0 {
        return (ProcessStatus::NeedMore, empty(out));
    }

    let mut steps = 0;
    while cycles_late > 8 && steps < MAX_CATCHUP_STEPS {
        info.base_tsp = cycletimer::add_ticks(info.base_tsp, (settings.syt_interval as f64 * tpf).round() as u32);
        next_tsp = cycletimer::add_ticks(info.base_tsp, (info.offset as f64 * tpf).round() as u32);
        transmit_at_tsp = cycletimer::sub_ticks(next_tsp, settings.transfer_delay);
        transmit_at_cycle = cycletimer::cycle_of(transmit_at_tsp);
        cycles_late = cycletimer::diff_cycles(request_cycle, transmit_at_cycle);
        sink.counter(Counter::CatchUp, 1);
        sink.event(Level::Debug, Component::Codec, "tx catch-up: advanced base_tsp by one syt_interval");
        steps += 1;
    }

    settings.dbc = settings.dbc.wrapping_add(settings.syt_interval);
    let header = cip::build(
        settings.sid,
        settings.nb_channels,
        settings.dbc,
        cip::FMT_AMDTP,
        settings.fdf,
        cycletimer::ticks_to_syt(transmit_at_tsp),
    );
    out[..cip::HEADER_LEN].copy_from_slice(&header);

    let nframes = settings.syt_interval as usize;
    let dbs = settings.nb_channels as usize;
    let payload_len = nframes * dbs * 4;
    mux(&mut out[cip::HEADER_LEN..cip::HEADER_LEN + payload_len], nframes, dbs, info.offset as usize, substreams, settings.midi_lock_frames);

    info.offset += nframes as i64;
    info.todo -= nframes as i64;
    let status = if info.todo <= 0 { ProcessStatus::HaveEnough } else { ProcessStatus::NeedMore };
    (status, cip::HEADER_LEN + payload_len)
}

fn mux(payload: &mut [u8], nframes: usize, dbs: usize, base_offset: usize, substreams: &mut [Substream], midi_lock_frames: u32) {
    for frame in 0..nframes {
        let global_frame = (base_offset + frame) as u32;
        for col in 0..dbs {
            let off = (frame * dbs + col) * 4;
            if off + 4 > payload.len() {
                continue;
            }
            let word = match substreams.get_mut(col) {
                Some(sub) if sub.is_on() => match (&mut sub.buffer, sub.kind) {
                    (SubstreamBuffer::Audio(handle), SubstreamKind::Audio) => {
                        encode_audio_sample(handle.read(base_offset + frame))
                    }
                    (SubstreamBuffer::Midi(ring), SubstreamKind::Midi) => {
                        // one possible byte slot per 8-frame group, further
                        // rate-limited to the real MIDI byte rate.
                        if frame % 8 == 0 && global_frame % midi_lock_frames == 0 {
                            match ring.pop() {
                                Some(byte) => ((cip::LABEL_MIDI_1BYTE as u32) << 24) | byte as u32,
                                None => (cip::LABEL_MIDI_NO_DATA as u32) << 24,
                            }
                        } else {
                            (cip::LABEL_MIDI_NO_DATA as u32) << 24
                        }
                    }
                    _ => (cip::LABEL_MIDI_NO_DATA as u32) << 24,
                },
                _ => (cip::LABEL_MIDI_NO_DATA as u32) << 24,
            };
            payload[off..off + 4].copy_from_slice(&word.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::NullSink;
    use crate::stream_settings::{AudioBufferHandle, MidiRing, SubstreamState};

    #[test]
    fn rate_table_rejects_unsupported_rate() {
        assert_eq!(rate_params(22050), Err(ConfigError::UnsupportedRate(22050)));
        assert_eq!(rate_params(48000), Ok((8, 0x02)));
        assert_eq!(rate_params(176400), Ok((32, 0x05)));
    }

    #[test]
    fn audio_sample_roundtrip_full_scale() {
        for s in [-1.0f32, -0.5, 0.0, 0.25, 0.999, 1.0] {
            let word = encode_audio_sample(s);
            let back = decode_audio_sample(word);
            assert!((back - s).abs() < 1e-6, "s={s} back={back}");
        }
    }

    #[test]
    fn silence_payload_decodes_to_zero() {
        let word = (cip::LABEL_AUDIO as u32) << 24;
        assert_eq!(decode_audio_sample(word), 0.0);
    }

    #[test]
    fn cip_header_round_trips_fields() {
        let header = cip::build(5, 6, 200, cip::FMT_AMDTP, 0x02, 0xABCD);
        assert_eq!(cip::sid(&header), 5);
        assert_eq!(cip::dbs(&header), 6);
        assert_eq!(cip::dbc(&header), 200);
        assert_eq!(cip::fmt(&header), cip::FMT_AMDTP);
        assert_eq!(cip::fdf(&header), 0x02);
        assert_eq!(cip::syt(&header), 0xABCD);
    }

    fn audio_substream() -> (Substream, Vec<f32>) {
        let mut backing = vec![0.0f32; 64];
        let handle = unsafe { AudioBufferHandle::new(backing.as_mut_ptr(), 64, 1) };
        (Substream::audio("ch0", handle), backing)
    }

    #[test]
    fn decode_rejects_non_amdtp_fmt() {
        let settings = Am824Settings::new(48000, 2, 0, DEFAULT_TRANSFER_DELAY).unwrap();
        let mut info = StreamInfo::new(48000);
        info.start_period(0, 512);
        let header = cip::build(0, 2, 0, 0x20 /* not AMDTP */, 0x02, 0);
        let mut data = vec![0u8; 8 + 8 * 2 * 4];
        data[..8].copy_from_slice(&header);
        let (sub, _backing) = audio_substream();
        let mut subs = [sub];
        let status = decode_packet(&settings, &mut info, true, 512.0, 16, &mut subs, 0, &data, data.len(), &NullSink);
        assert_eq!(status, ProcessStatus::NeedMore);
        assert_eq!(info.offset, 0);
    }

    #[test]
    fn decode_demuxes_audio_silence_to_zero() {
        let settings = Am824Settings::new(48000, 1, 0, DEFAULT_TRANSFER_DELAY).unwrap();
        let mut info = StreamInfo::new(48000);
        info.start_period(0, 512);
        info.last_tsp = crate::cycletimer::INVALID_TICKS;

        let nframes = 8usize;
        let dbs = 1usize;
        let tick: u32 = 1000;
        let syt = cycletimer::ticks_to_syt(tick);
        let header = cip::build(0, dbs as u8, 0, cip::FMT_AMDTP, 0x02, syt);
        let mut data = vec![0u8; 8 + nframes * dbs * 4];
        data[..8].copy_from_slice(&header);
        for f in 0..nframes {
            let word = (cip::LABEL_AUDIO as u32) << 24;
            data[8 + f * 4..8 + f * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }

        let (sub, backing) = audio_substream();
        let mut subs = vec![sub];
        let status = decode_packet(&settings, &mut info, true, 512.0, 16, &mut subs, tick, &data, data.len(), &NullSink);
        assert_eq!(status, ProcessStatus::NeedMore);
        assert_eq!(info.offset, nframes as i64);
        for i in 0..nframes {
            assert_eq!(backing[i], 0.0);
        }
    }

    #[test]
    fn encode_empty_packet_when_base_invalid() {
        let mut settings = Am824Settings::new(48000, 1, 0, DEFAULT_TRANSFER_DELAY).unwrap();
        let mut info = StreamInfo::new(48000);
        let mut subs: Vec<Substream> = vec![];
        let mut out = vec![0u8; 64];
        let (status, len) = encode_packet(&mut settings, &mut info, 512.0, &mut subs, 0, &mut out, &NullSink);
        assert_eq!(status, ProcessStatus::NeedMore);
        assert_eq!(len, 8);
        assert_eq!(cip::syt(&out), cip::SYT_NO_TIMESTAMP);
        assert_eq!(cip::fdf(&out), cip::FDF_NO_DATA);
        assert_eq!(settings.dbc(), 0, "empty packet must not advance dbc");
    }

    #[test]
    fn encode_constant_full_scale_sample_produces_expected_bits() {
        let mut settings = Am824Settings::new(88200, 2, 0, DEFAULT_TRANSFER_DELAY).unwrap();
        let mut info = StreamInfo::new(88200);
        info.start_period(0, 512);
        info.tpf = crate::cycletimer::TICKS_PER_SECOND as f64 / 88200.0;

        let mut ch0_backing = vec![1.0f32; 32];
        let mut ch1_backing = vec![0.0f32; 32];
        let ch0 = unsafe { AudioBufferHandle::new(ch0_backing.as_mut_ptr(), 32, 1) };
        let ch1 = unsafe { AudioBufferHandle::new(ch1_backing.as_mut_ptr(), 32, 1) };
        let mut subs = vec![Substream::audio("ch0", ch0), Substream::audio("ch1", ch1)];

        let mut out = vec![0u8; settings.packet_length];
        let (status, len) = encode_packet(&mut settings, &mut info, info.tpf, &mut subs, 5000, &mut out, &NullSink);
        assert_eq!(len, settings.packet_length);
        assert_eq!(status, ProcessStatus::NeedMore);
        assert_eq!(settings.dbc(), 16, "dbc must advance by syt_interval on a data packet");

        let word0 = u32::from_be_bytes([out[8], out[9], out[10], out[11]]);
        assert_eq!(word0, 0x407F_FFFF);
        let word1 = u32::from_be_bytes([out[12], out[13], out[14], out[15]]);
        assert_eq!(word1 >> 24, cip::LABEL_AUDIO as u32);
        assert_eq!(word1 & 0x00FF_FFFF, 0);
    }

    /// spec.md §8 end-to-end scenario 6 ("Catch-up slide"): a packet whose
    /// lifted timestamp is `3·syt_interval·tpf` ahead of `next_tsp` must
    /// advance `base_tsp` in exactly three bounded catch-up steps, each
    /// counted, and still be consumed afterward.
    #[test]
    fn decode_catch_up_advances_base_tsp_through_three_bounded_steps() {
        let settings = Am824Settings::new(48000, 1, 0, DEFAULT_TRANSFER_DELAY).unwrap();
        let mut info = StreamInfo::new(48000);
        info.start_period(0, 512);

        let tpf = 512.0_f64; // TICKS_PER_SECOND / 48000, exact
        let one_syt_interval_ticks = (settings.syt_interval as f64 * tpf).round() as u32;
        let this_ts = 3 * one_syt_interval_ticks;
        let syt = cycletimer::ticks_to_syt(this_ts);

        let nframes = settings.syt_interval as usize;
        let dbs = 1usize;
        let header = cip::build(0, dbs as u8, 0, cip::FMT_AMDTP, 0x02, syt);
        let mut data = vec![0u8; 8 + nframes * dbs * 4];
        data[..8].copy_from_slice(&header);
        for f in 0..nframes {
            let word = (cip::LABEL_AUDIO as u32) << 24;
            data[8 + f * 4..8 + f * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }

        let (sub, _backing) = audio_substream();
        let mut subs = [sub];
        let sink = crate::diagnostics::ChannelSink::new(8);
        let status = decode_packet(&settings, &mut info, false, tpf, 16, &mut subs, this_ts, &data, data.len(), sink.as_ref());

        assert_eq!(status, ProcessStatus::NeedMore, "512-frame period isn't satisfied by one 8-frame packet");
        assert_eq!(info.base_tsp, 3 * one_syt_interval_ticks);
        assert_eq!(sink.counter_value(Counter::CatchUp), 3);
    }

    #[test]
    fn midi_ring_gates_through_mux() {
        let mut settings = Am824Settings::new(48000, 1, 0, DEFAULT_TRANSFER_DELAY).unwrap();
        settings.midi_lock_frames = 1;
        let mut info = StreamInfo::new(48000);
        info.start_period(0, 512);
        info.tpf = crate::cycletimer::TICKS_PER_SECOND as f64 / 48000.0;

        let mut ring = MidiRing::new(crate::stream_settings::RX_MIDI_CAPACITY);
        ring.push(0x90);
        let sub = Substream { name: "midi0".into(), kind: SubstreamKind::Midi, state: SubstreamState::On, buffer: SubstreamBuffer::Midi(ring) };
        let mut subs = vec![sub];

        let mut out = vec![0u8; settings.packet_length];
        let (_status, _len) = encode_packet(&mut settings, &mut info, info.tpf, &mut subs, 5000, &mut out, &NullSink);
        let word0 = u32::from_be_bytes([out[8], out[9], out[10], out[11]]);
        assert_eq!(word0 >> 24, cip::LABEL_MIDI_1BYTE as u32);
        assert_eq!(word0 & 0xFF, 0x90);
    }
}
