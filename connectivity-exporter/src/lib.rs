//! Connectivity Exporter Userspace Library
//!
//! Provides the components of the TLS connectivity exporter daemon: loading
//! and attaching the eBPF classifier, the per-tick aggregator, the latency
//! histogram tracker, and the Prometheus metrics sink.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod histogram;
pub mod loader;
pub mod metrics;

pub use aggregator::Aggregator;
pub use error::ExporterError;
pub use histogram::{HistogramReader, HistogramSnapshot};
pub use loader::ProbeLoader;
pub use metrics::{ConnTriple, Inc, MetricsRegistry, SinkEvent};
