//! Error types for the exporter daemon
//!
//! Startup failures (attach, map initialization) are fatal; map I/O failures
//! during a tick abandon that tick and are retried; a histogram read failure
//! indicates corrupted kernel state and aborts the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("loading classifier object: {0}")]
    Load(String),

    #[error("attaching classifier to interface {iface}: {reason}")]
    Attach { iface: String, reason: String },

    #[error("initializing {map} map: {reason}")]
    MapInit { map: &'static str, reason: String },

    #[error("map I/O during tick: {0}")]
    MapIo(#[from] aya::maps::MapError),

    #[error("reading latency histogram: {0}")]
    HistogramRead(aya::maps::MapError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ExporterError>;
