//! Gap-aware I/Q stream recorder.
//!
//! Device callbacks copy sample batches into bounded rings (`ingest`), a
//! single writer thread turns them back into one interleaved stream
//! (`writer`) and the result lands in a raw, Linrad or RIFF/RF64 container
//! (`output`). `session` ties the pieces together for one recording.

pub mod buffers;
pub mod config;
pub mod gains;
pub mod ingest;
pub mod input;
pub mod inspect;
pub mod output;
pub mod ring;
pub mod sequence;
pub mod session;
pub mod stats;
pub mod status;
pub mod timeinfo;
pub mod writer;

pub use config::{ConfigError, OutputType, RecorderConfig};
pub use session::{Session, SessionError, SessionReport, TerminateHandle};
pub use status::StreamStatus;
