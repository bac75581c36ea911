//! Classifier execution-time histogram snapshots
//!
//! The classifier times every invocation of itself into a per-CPU array of
//! power-of-two nanosecond buckets. The tracker task reads the array once
//! per tick, sums across CPUs, and publishes a cumulative snapshot; the
//! kernel counters are never reset, so consumers compute deltas.

use std::time::Duration;

use aya::maps::{MapData, PerCpuArray};
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use connectivity_common::{
    HISTOGRAM_BUCKETS, HISTOGRAM_SLOT_COUNT, HISTOGRAM_SLOT_SUM, MISC_SLOT_STATS_DROPPED,
};

use crate::error::{ExporterError, Result};

/// One reading of the latency histogram, summed across CPUs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistogramSnapshot {
    /// Per-bucket observation counts; bucket `i` covers `[2^i, 2^(i+1))`
    /// nanoseconds. Not cumulative.
    pub buckets: Vec<u64>,
    /// Sum of all observed durations in nanoseconds.
    pub sum: u64,
    /// Total number of observations.
    pub count: u64,
    /// Completed-connection increments the classifier had to drop because
    /// the stats ring was full.
    pub stats_dropped: u64,
}

impl HistogramSnapshot {
    /// Bucket counts accumulated from the smallest bucket upward, the shape
    /// Prometheus histograms expose.
    pub fn cumulative(&self) -> Vec<u64> {
        let mut total = 0u64;
        self.buckets
            .iter()
            .map(|&c| {
                total += c;
                total
            })
            .collect()
    }
}

/// Reads the per-CPU histogram and miscellaneous counter maps.
pub struct HistogramReader {
    histogram: PerCpuArray<MapData, u64>,
    misc: PerCpuArray<MapData, u64>,
}

impl HistogramReader {
    pub fn new(histogram: PerCpuArray<MapData, u64>, misc: PerCpuArray<MapData, u64>) -> Self {
        Self { histogram, misc }
    }

    /// Read a full snapshot. Each slot is read atomically per bucket and
    /// summed across CPUs; a read failure is fatal to the caller.
    pub fn read(&self) -> Result<HistogramSnapshot> {
        let mut buckets = Vec::with_capacity(HISTOGRAM_BUCKETS as usize);
        for slot in 0..HISTOGRAM_BUCKETS {
            buckets.push(self.read_slot(slot)?);
        }
        let sum = self.read_slot(HISTOGRAM_SLOT_SUM)?;
        let count = self.read_slot(HISTOGRAM_SLOT_COUNT)?;
        let stats_dropped = self
            .misc
            .get(&MISC_SLOT_STATS_DROPPED, 0)
            .map_err(ExporterError::HistogramRead)?
            .iter()
            .sum();
        Ok(HistogramSnapshot {
            buckets,
            sum,
            count,
            stats_dropped,
        })
    }

    fn read_slot(&self, slot: u32) -> Result<u64> {
        Ok(self
            .histogram
            .get(&slot, 0)
            .map_err(ExporterError::HistogramRead)?
            .iter()
            .sum())
    }
}

/// Periodically read the histogram and publish snapshots to the metrics
/// sink. Runs until shutdown; a read failure aborts the task (and with it
/// the process), since it indicates corrupted kernel state.
pub async fn track_execution_time(
    reader: HistogramReader,
    snapshots: mpsc::Sender<HistogramSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = reader.read()?;
                debug!("histogram snapshot: {} observations", snapshot.count);
                if snapshots.send(snapshot).await.is_err() {
                    // sink closed, we are shutting down
                    return Ok(());
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_accumulates_upward() {
        let snapshot = HistogramSnapshot {
            buckets: vec![1, 0, 2, 5],
            sum: 100,
            count: 8,
            stats_dropped: 0,
        };
        assert_eq!(snapshot.cumulative(), vec![1, 1, 3, 8]);
    }

    #[test]
    fn cumulative_is_pointwise_non_decreasing() {
        let snapshot = HistogramSnapshot {
            buckets: vec![3, 1, 4, 1, 5, 9, 2, 6],
            sum: 0,
            count: 31,
            stats_dropped: 0,
        };
        let cumulative = snapshot.cumulative();
        for pair in cumulative.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(*cumulative.last().unwrap(), snapshot.count);
    }
}
