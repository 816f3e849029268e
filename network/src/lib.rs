//! A deterministic, single-threaded, virtual-clock network simulator.
//!
//! Messages are delayed, duplicated, dropped and rate-limited according to
//! a seeded configuration; headers must be delivered before bodies; every
//! decision is recorded in an ordered structured log. Two runs with the
//! same seed, configuration, topology and caller sequence produce
//! byte-identical logs.

mod config;
mod event_log;
mod simulator;

pub use config::{LinkProfile, NetworkConfig};
pub use event_log::{dump_logs, LogEntry};
pub use simulator::{envelope_wire_size, EnvelopeHandler, NetworkSimulator, OutboundEnvelope};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
}
