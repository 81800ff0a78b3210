//! Error taxonomy for the streaming engine.
//!
//! Grouped by the five kinds in spec.md §7. Configuration and kernel/I/O
//! errors are the only ones that ever reach a caller through `Result`;
//! protocol and flow errors are observed through the [`crate::diagnostics`]
//! sink and counted, never propagated (spec.md §7 "Propagation policy").
//! Timing errors never propagate through `Result` either: a timed-out
//! connection surfaces to its caller only as the `Xrun` variant of
//! `PeriodOutcome`, with [`TimingError`] used solely to label the
//! diagnostics event recording why.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("sample rate {0} Hz is not one of the supported AM824 rates")]
    UnsupportedRate(u32),
    #[error("period_size {period} is smaller than syt_interval {syt_interval}")]
    PeriodTooSmall { period: u32, syt_interval: u32 },
    #[error("too many {0:?} connections (maximum is {1})")]
    TooManyConnections(crate::connection::Direction, usize),
    #[error("DLL bandwidth ratio {0} is out of the stable range (must be < 0.5)")]
    BandwidthTooHigh(f64),
    #[error("channel {0} is out of range 0..64")]
    InvalidChannel(u8),
    #[error("packet_size must be nonzero")]
    ZeroPacketSize,
    #[error("nb_periods must be at least 2, got {0}")]
    TooFewPeriods(u32),
    #[error("sync-master candidate connection is not Running")]
    SyncMasterNotRunning,
    #[error("no such stream handle")]
    UnknownStream,
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("failed to open firewire character device at {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("mmap of {length} bytes failed: {source}")]
    Mmap {
        length: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("received unexpected kernel event (expected iso interrupt or bus reset)")]
    UnexpectedEvent,
}

/// Protocol-layer failures (spec.md §7 kind 3). Never escape the codec;
/// reported through [`crate::diagnostics::DiagnosticsSink`] and dropped.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum ProtocolError {
    #[error("CIP fmt field {0:#x} is not AMDTP (0x10)")]
    BadFmt(u8),
    #[error("CIP dbs field is zero")]
    ZeroDbs,
    #[error("payload length {len} is not a multiple of dbs {dbs}")]
    PayloadNotMultipleOfDbs { len: usize, dbs: u8 },
    #[error("SYT round-trip mismatch: lifted tick encodes {got:#06x}, wire carried {expected:#06x}")]
    SytRoundTripMismatch { expected: u16, got: u16 },
    #[error("packet carries no-data FDF (0xff); skipped")]
    NoData,
}

/// Flow-control failures (spec.md §7 kind 4). Logged and counted, not fatal.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum FlowError {
    #[error("header ring is full")]
    HeaderBufferFull,
    #[error("payload ring is empty")]
    PayloadBufferEmpty,
    #[error("requested interrupt cycle lies outside the queued region [I, Q)")]
    NotYetQueued,
}

/// Timing failures (spec.md §7 kind 5). Never part of a `Result` path: a
/// connection that stops delivering interrupts sets its sticky `TIMED_OUT`
/// bit and the enclosing period reports `PeriodOutcome::Xrun`; this variant
/// exists only so the diagnostics sink can name *why* a given period's Xrun
/// happened, the same way `ProtocolError`/`FlowError` name non-fatal causes.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum TimingError {
    #[error("connection stopped delivering interrupts, marked timed out")]
    Timeout,
}
