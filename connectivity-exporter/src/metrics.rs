//! Metrics sink and Prometheus scrape endpoint
//!
//! The aggregator emits one [`Inc`] per observed triple per tick; the sink
//! folds those into monotonic per-series counters and exposes them, together
//! with the classifier latency histogram, in Prometheus text format v0.0.4.
//! Series whose SNI expired are forgotten so the scrape output shrinks with
//! the carry-over state.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{ExporterError, Result};
use crate::histogram::HistogramSnapshot;

/// Labels identifying one exported series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnTriple {
    pub sni: String,
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
}

/// Counter increments for one triple in one tick.
///
/// `successful`/`rejected`/`rejected_by_client` count connections; the
/// `*_seconds` fields are 0 or 1 and accumulate into seconds counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inc {
    pub successful: u64,
    pub rejected: u64,
    pub rejected_by_client: u64,
    pub active_seconds: u64,
    pub active_failed_seconds: u64,
    pub failed_seconds: u64,
}

impl Inc {
    fn add(&mut self, other: &Inc) {
        self.successful += other.successful;
        self.rejected += other.rejected;
        self.rejected_by_client += other.rejected_by_client;
        self.active_seconds += other.active_seconds;
        self.active_failed_seconds += other.active_failed_seconds;
        self.failed_seconds += other.failed_seconds;
    }
}

/// Messages from the aggregator to the sink.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Fold the increments into the triple's series.
    Inc { triple: ConnTriple, inc: Inc },
    /// The SNI's retention window elapsed; drop every series labeled with it.
    ExpireSni(String),
}

/// Monotonic counter store behind the scrape endpoint.
#[derive(Default)]
pub struct MetricsRegistry {
    series: HashMap<ConnTriple, Inc>,
    histogram: Option<HistogramSnapshot>,
}

impl MetricsRegistry {
    pub fn apply(&mut self, triple: ConnTriple, inc: &Inc) {
        self.series.entry(triple).or_default().add(inc);
    }

    /// Drop every series carrying the expired SNI label. Returns how many
    /// series were forgotten.
    pub fn expire_sni(&mut self, sni: &str) -> usize {
        let before = self.series.len();
        self.series.retain(|triple, _| triple.sni != sni);
        before - self.series.len()
    }

    pub fn set_histogram(&mut self, snapshot: HistogramSnapshot) {
        self.histogram = Some(snapshot);
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Render the Prometheus exposition text.
    pub fn render(&self) -> String {
        let mut out = String::new();

        // Deterministic output order for scrapes and tests.
        let mut series: Vec<(&ConnTriple, &Inc)> = self.series.iter().collect();
        series.sort_by(|a, b| a.0.cmp(b.0));

        render_counter(
            &mut out,
            &series,
            "connectivity_successful_connections_total",
            "Connections that completed the TLS handshake and terminated cleanly",
            |inc| inc.successful,
        );
        render_counter(
            &mut out,
            &series,
            "connectivity_rejected_connections_total",
            "Connections rejected by a server RST",
            |inc| inc.rejected,
        );
        render_counter(
            &mut out,
            &series,
            "connectivity_rejected_connections_by_client_total",
            "Connections aborted by a client RST",
            |inc| inc.rejected_by_client,
        );
        render_counter(
            &mut out,
            &series,
            "connectivity_active_seconds_total",
            "Seconds in which the triple had any accounted traffic",
            |inc| inc.active_seconds,
        );
        render_counter(
            &mut out,
            &series,
            "connectivity_active_failed_seconds_total",
            "Seconds in which the triple had a rejected or stalled connection",
            |inc| inc.active_failed_seconds,
        );
        render_counter(
            &mut out,
            &series,
            "connectivity_failed_seconds_total",
            "Seconds that failed, or were inactive while carrying a prior failure",
            |inc| inc.failed_seconds,
        );

        if let Some(histogram) = &self.histogram {
            render_histogram(&mut out, histogram);
        }

        out
    }
}

fn render_counter(
    out: &mut String,
    series: &[(&ConnTriple, &Inc)],
    name: &str,
    help: &str,
    field: impl Fn(&Inc) -> u64,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (triple, inc) in series {
        let _ = writeln!(
            out,
            "{name}{{sni=\"{}\",source_ip=\"{}\",destination_ip=\"{}\"}} {}",
            escape_label(&triple.sni),
            triple.source_ip,
            triple.dest_ip,
            field(inc)
        );
    }
    out.push('\n');
}

fn render_histogram(out: &mut String, snapshot: &HistogramSnapshot) {
    let name = "connectivity_classifier_execution_time_nanoseconds";
    let _ = writeln!(out, "# HELP {name} Classifier execution time per packet");
    let _ = writeln!(out, "# TYPE {name} histogram");
    let cumulative = snapshot.cumulative();
    for (bucket, count) in cumulative.iter().enumerate() {
        if bucket + 1 == cumulative.len() {
            break;
        }
        // bucket i covers [2^i, 2^(i+1)) ns
        let upper = 1u128 << (bucket + 1);
        let _ = writeln!(out, "{name}_bucket{{le=\"{upper}\"}} {count}");
    }
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", snapshot.count);
    let _ = writeln!(out, "{name}_sum {}", snapshot.sum);
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    out.push('\n');

    let dropped = "connectivity_stats_dropped_increments_total";
    let _ = writeln!(
        out,
        "# HELP {dropped} Completed-connection increments dropped because the stats ring was full"
    );
    let _ = writeln!(out, "# TYPE {dropped} counter");
    let _ = writeln!(out, "{dropped} {}", snapshot.stats_dropped);
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Consume aggregator events and histogram snapshots into the shared
/// registry. Exits when both producers have closed their channels.
pub async fn run_sink(
    mut events: mpsc::Receiver<SinkEvent>,
    mut snapshots: mpsc::Receiver<HistogramSnapshot>,
    registry: Arc<Mutex<MetricsRegistry>>,
) {
    let mut events_open = true;
    let mut snapshots_open = true;
    while events_open || snapshots_open {
        tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(SinkEvent::Inc { triple, inc }) => {
                    registry.lock().await.apply(triple, &inc);
                }
                Some(SinkEvent::ExpireSni(sni)) => {
                    let removed = registry.lock().await.expire_sni(&sni);
                    debug!("expired sni {sni:?}: {removed} series dropped");
                }
                None => events_open = false,
            },
            snapshot = snapshots.recv(), if snapshots_open => match snapshot {
                Some(snapshot) => registry.lock().await.set_histogram(snapshot),
                None => snapshots_open = false,
            },
        }
    }
}

/// Serve the scrape endpoint until shutdown.
pub async fn serve_metrics(
    addr: SocketAddr,
    registry: Arc<Mutex<MetricsRegistry>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        ExporterError::Config(format!("binding metrics endpoint {addr}: {e}"))
    })?;
    info!("metrics endpoint listening on http://{addr}/metrics");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accepting scrape connection: {e}");
                        continue;
                    }
                };
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle_scrape(stream, registry).await {
                        debug!("scrape from {peer} failed: {e}");
                    }
                });
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

async fn handle_scrape(
    mut stream: TcpStream,
    registry: Arc<Mutex<MetricsRegistry>>,
) -> std::io::Result<()> {
    let mut request = [0u8; 1024];
    let read = stream.read(&mut request).await?;
    let request = String::from_utf8_lossy(&request[..read]);

    let response = if request.starts_with("GET /metrics") {
        let body = registry.lock().await.render();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_owned()
    };
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(sni: &str) -> ConnTriple {
        ConnTriple {
            sni: sni.to_owned(),
            source_ip: Ipv4Addr::new(10, 0, 0, 1),
            dest_ip: Ipv4Addr::new(192, 168, 1, 2),
        }
    }

    #[test]
    fn apply_accumulates_monotonically() {
        let mut registry = MetricsRegistry::default();
        let inc = Inc {
            successful: 2,
            active_seconds: 1,
            ..Default::default()
        };
        registry.apply(triple("a.test"), &inc);
        registry.apply(triple("a.test"), &inc);

        let rendered = registry.render();
        assert!(rendered.contains(
            "connectivity_successful_connections_total{sni=\"a.test\",source_ip=\"10.0.0.1\",destination_ip=\"192.168.1.2\"} 4"
        ));
        assert!(rendered.contains(
            "connectivity_active_seconds_total{sni=\"a.test\",source_ip=\"10.0.0.1\",destination_ip=\"192.168.1.2\"} 2"
        ));
    }

    #[test]
    fn expire_drops_every_series_with_the_sni() {
        let mut registry = MetricsRegistry::default();
        let inc = Inc::default();
        registry.apply(triple("a.test"), &inc);
        registry.apply(
            ConnTriple {
                sni: "a.test".to_owned(),
                source_ip: Ipv4Addr::new(10, 0, 0, 9),
                dest_ip: Ipv4Addr::new(192, 168, 1, 2),
            },
            &inc,
        );
        registry.apply(triple("b.test"), &inc);

        assert_eq!(registry.expire_sni("a.test"), 2);
        assert_eq!(registry.series_count(), 1);
        assert!(!registry.render().contains("a.test"));
        assert!(registry.render().contains("b.test"));
    }

    #[test]
    fn render_emits_empty_sni_label() {
        let mut registry = MetricsRegistry::default();
        registry.apply(
            triple(""),
            &Inc {
                failed_seconds: 1,
                ..Default::default()
            },
        );
        assert!(registry
            .render()
            .contains("connectivity_failed_seconds_total{sni=\"\","));
    }

    #[test]
    fn render_histogram_is_cumulative() {
        let mut registry = MetricsRegistry::default();
        let mut buckets = vec![0u64; 64];
        buckets[0] = 1; // [1, 2) ns
        buckets[10] = 2; // [1024, 2048) ns
        registry.set_histogram(HistogramSnapshot {
            buckets,
            sum: 3000,
            count: 3,
            stats_dropped: 7,
        });

        let rendered = registry.render();
        assert!(rendered.contains(
            "connectivity_classifier_execution_time_nanoseconds_bucket{le=\"2\"} 1"
        ));
        assert!(rendered.contains(
            "connectivity_classifier_execution_time_nanoseconds_bucket{le=\"2048\"} 3"
        ));
        assert!(rendered.contains(
            "connectivity_classifier_execution_time_nanoseconds_bucket{le=\"+Inf\"} 3"
        ));
        assert!(rendered.contains("connectivity_classifier_execution_time_nanoseconds_sum 3000"));
        assert!(rendered.contains("connectivity_stats_dropped_increments_total 7"));
    }

    #[test]
    fn label_escaping() {
        assert_eq!(escape_label("a\"b"), "a\\\"b");
        assert_eq!(escape_label("a\\b"), "a\\\\b");
    }

    #[tokio::test]
    async fn sink_applies_events_in_order_and_exits_when_channels_close() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(8);
        let registry = Arc::new(Mutex::new(MetricsRegistry::default()));
        let sink = tokio::spawn(run_sink(event_rx, snapshot_rx, Arc::clone(&registry)));

        event_tx
            .send(SinkEvent::Inc {
                triple: triple("a.test"),
                inc: Inc {
                    successful: 1,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        event_tx
            .send(SinkEvent::ExpireSni("a.test".to_owned()))
            .await
            .unwrap();
        snapshot_tx
            .send(HistogramSnapshot {
                buckets: vec![0; 64],
                sum: 10,
                count: 1,
                stats_dropped: 0,
            })
            .await
            .unwrap();
        drop(event_tx);
        drop(snapshot_tx);
        sink.await.unwrap();

        let registry = registry.lock().await;
        assert_eq!(registry.series_count(), 0);
        assert!(registry
            .render()
            .contains("connectivity_classifier_execution_time_nanoseconds_count 1"));
    }
}
