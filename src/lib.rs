//! Isochronous AM824/IEC-61883-6 streaming engine
//!
//! A user-space engine for professional multichannel audio and MIDI over
//! IEEE-1394 (FireWire), built on the Linux `/dev/fw*` isochronous ioctl
//! interface. It owns CIP/AM824 packet framing, cycle-timer tick
//! arithmetic, per-connection ring buffers and the realtime streaming
//! loop that keeps one or more connections aligned to a shared sync
//! master.
//!
//! Modules map onto the pieces of that pipeline:
//! - [`cycletimer`]: 32-bit wrap-safe tick arithmetic and SYT lift/recover.
//! - [`device`]: the [`device::IsoBackend`] trait over the kernel ioctl
//!   family, plus the real FFI backend and a test double.
//! - [`connection`]: the four-cursor ring buffer over one iso context.
//! - [`codec`]: CIP header fields and AM824 event encode/decode.
//! - [`stream_info`]: per-connection timestamp/cadence bookkeeping.
//! - [`stream_settings`]: substream (audio/MIDI) buffer configuration.
//! - [`streamer`]: the [`streamer::Streamer`] main loop tying everything
//!   together across all connections of an engine instance.
//! - [`config`]: recognized engine options and their validation.
//! - [`error`]: the error taxonomy shared by every layer above.
//! - [`diagnostics`]: the injectable sink for non-fatal protocol/flow
//!   events and counters.

pub mod codec;
pub mod config;
pub mod connection;
pub mod cycletimer;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod stream_info;
pub mod stream_settings;
pub mod streamer;

pub use config::EngineConfig;
pub use connection::{Connection, ConnectionConfig, Direction, Speed};
pub use diagnostics::{ChannelSink, DiagnosticsSink, NullSink};
pub use error::{ConfigError, Error, FlowError, KernelError, ProtocolError, Result, TimingError};
pub use stream_info::StreamHandle;
pub use stream_settings::{Substream, StreamSettings, SubstreamKind};
pub use streamer::{PeriodOutcome, Stream, Streamer};
