//! Per-tick aggregation
//!
//! Once per second the aggregator drains connections older than the stats
//! ring and the oldest ring slot, folds both through per-SNI carry-over
//! state, and emits one [`Inc`] per observed triple. The ticker clock is
//! advanced only after every `Inc` for the tick has been emitted, so the
//! new clock value is the commit marker for the tick.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use aya::maps::{Array, HashMap as BpfHashMap, MapData};
use log::{debug, error, info};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};

use connectivity_common::{ConnState, StatsKey, StatsValue, TupleData, TupleKey, SECONDS_COUNT};

use crate::error::Result;
use crate::metrics::{ConnTriple, Inc, SinkEvent};

/// Aggregator-private state carried between ticks.
#[derive(Default)]
pub struct CarryOver {
    /// Last activity per SNI; the authority for which series are alive.
    snis: HashMap<String, Instant>,
    /// failed-second flag carried from the previous tick per triple, so a
    /// failure keeps counting through subsequent inactive seconds.
    previous_failed: HashMap<ConnTriple, bool>,
}

/// Everything a tick reads from the kernel tables, collected up front so a
/// map I/O failure abandons the tick before any state is mutated.
#[derive(Default)]
pub struct TickInputs {
    /// Connections whose first packet is more than `SECONDS_COUNT` ticks old.
    pub old_connections: Vec<(TupleKey, TupleData)>,
    /// Drained stats-slot counters: triple to (succeeded, failed).
    pub stats: HashMap<ConnTriple, (u64, u64)>,
}

/// The folding rule: combine one triple's stale tuples, drained stats-slot
/// counters, and carried failure flag into counter increments and the flag
/// for the next tick.
fn fold_triple(
    previous_failed: bool,
    stale: &[TupleData],
    succeeded_from_stats: u64,
    failed_from_stats: u64,
) -> (Inc, bool) {
    let mut inc = Inc::default();
    let mut active_failed = false;

    for tuple in stale {
        match tuple.state() {
            // A connection that got this far but aged out without
            // completing is a failure.
            ConnState::SynReceived | ConnState::SynackReceived => active_failed = true,
            // Aged out after the TLS handshake began with no recorded
            // close; counted as a success for this metric.
            ConnState::SniReceived => inc.successful += 1,
            ConnState::RstSentByServer => {
                inc.rejected += 1;
                active_failed = true;
            }
            ConnState::RstSentByClient => inc.rejected_by_client += 1,
            // FIN without both directions is ambiguous; New never got
            // anywhere. Neither credits nor penalizes.
            ConnState::FinSent | ConnState::New => {}
        }
    }

    inc.successful += succeeded_from_stats;
    inc.rejected += failed_from_stats;

    let active = !stale.is_empty() || succeeded_from_stats > 0 || failed_from_stats > 0;
    if failed_from_stats > 0 {
        active_failed = true;
    }

    // Carry a failure only through inactive seconds; a new active second
    // resets the carry unless it failed itself.
    let failed_second = (previous_failed && !active) || active_failed;

    if active {
        inc.active_seconds = 1;
    }
    if active_failed {
        inc.active_failed_seconds = 1;
    }
    if failed_second {
        inc.failed_seconds = 1;
    }

    (inc, failed_second)
}

/// Fold one tick's inputs through the carry-over state.
///
/// The triple union covers old connections, the drained stats slot, and
/// triples still carrying a failure from an earlier tick, so carried
/// failures keep emitting `failed_seconds` while inactive.
pub fn account_tick(
    carry: &mut CarryOver,
    inputs: &TickInputs,
    now: Instant,
) -> Vec<(ConnTriple, Inc)> {
    let mut triples: HashSet<ConnTriple> = HashSet::new();
    let mut stale: HashMap<ConnTriple, Vec<TupleData>> = HashMap::new();

    for (key, data) in &inputs.old_connections {
        let triple = ConnTriple {
            sni: data.sni_str().to_owned(),
            source_ip: key.source_ip(),
            dest_ip: key.dest_ip(),
        };
        triples.insert(triple.clone());
        stale.entry(triple).or_default().push(*data);
    }
    for triple in inputs.stats.keys() {
        triples.insert(triple.clone());
    }
    for (triple, carried) in &carry.previous_failed {
        if *carried {
            triples.insert(triple.clone());
        }
    }

    let mut out = Vec::with_capacity(triples.len());
    for triple in triples {
        let (succeeded, failed) = inputs.stats.get(&triple).copied().unwrap_or((0, 0));
        let previous = carry.previous_failed.get(&triple).copied().unwrap_or(false);
        let stale_tuples = stale.get(&triple).map(Vec::as_slice).unwrap_or(&[]);

        let (inc, failed_second) = fold_triple(previous, stale_tuples, succeeded, failed);

        carry.previous_failed.insert(triple.clone(), failed_second);
        // Activity refreshes the retention window; an inactive carried
        // triple must not keep its SNI alive forever.
        if inc.active_seconds > 0 {
            carry.snis.insert(triple.sni.clone(), now);
        } else {
            carry.snis.entry(triple.sni.clone()).or_insert(now);
        }

        out.push((triple, inc));
    }
    out
}

/// Remove SNIs idle for longer than the retention window, together with
/// their carried failure flags. Returns the expired names so the metrics
/// sink can forget the series.
pub fn expire_snis(carry: &mut CarryOver, now: Instant, retention: Duration) -> Vec<String> {
    let expired: Vec<String> = carry
        .snis
        .iter()
        .filter(|(_, last)| now.duration_since(**last) > retention)
        .map(|(sni, _)| sni.clone())
        .collect();
    for sni in &expired {
        carry.snis.remove(sni);
        carry.previous_failed.retain(|triple, _| triple.sni != *sni);
    }
    expired
}

/// Drives the per-tick procedure against the kernel tables.
pub struct Aggregator {
    connections: BpfHashMap<MapData, TupleKey, TupleData>,
    stats: BpfHashMap<MapData, StatsKey, StatsValue>,
    ticker: Array<MapData, u64>,
    tick: u64,
    carry: CarryOver,
    retention: Duration,
    events: mpsc::Sender<SinkEvent>,
}

impl Aggregator {
    pub fn new(
        connections: BpfHashMap<MapData, TupleKey, TupleData>,
        stats: BpfHashMap<MapData, StatsKey, StatsValue>,
        ticker: Array<MapData, u64>,
        retention: Duration,
        events: mpsc::Sender<SinkEvent>,
    ) -> Self {
        Self {
            connections,
            stats,
            ticker,
            tick: 0,
            carry: CarryOver::default(),
            retention,
            events,
        }
    }

    /// Run until shutdown. A failed tick is logged and retried: the ticker
    /// clock only advances on success, so the same logical second is
    /// re-attempted and carry-over state stays consistent.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_tick().await {
                        error!("tick {} abandoned: {e}", self.tick);
                    }
                }
                _ = shutdown.changed() => {
                    info!("aggregator stopping at tick {}", self.tick);
                    return;
                }
            }
        }
    }

    async fn process_tick(&mut self) -> Result<()> {
        // All fallible map I/O happens before any carry-over mutation.
        let inputs = self.collect_inputs()?;

        let incs = account_tick(&mut self.carry, &inputs, Instant::now());
        debug!("tick {}: {} triples", self.tick, incs.len());
        for (triple, inc) in incs {
            if self
                .events
                .send(SinkEvent::Inc { triple, inc })
                .await
                .is_err()
            {
                // sink gone, we are shutting down
                return Ok(());
            }
        }

        for sni in expire_snis(&mut self.carry, Instant::now(), self.retention) {
            info!("sni {sni:?} idle past retention, dropping its series");
            let _ = self.events.send(SinkEvent::ExpireSni(sni)).await;
        }

        // Commit marker: the new clock value becomes visible only after
        // every Inc for this tick has been emitted.
        let next = self.tick + 1;
        self.ticker.set(0, next, 0)?;
        self.tick = next;
        Ok(())
    }

    fn collect_inputs(&mut self) -> Result<TickInputs> {
        // Scan the connection table for entries older than the stats ring.
        let mut old_connections = Vec::new();
        for entry in self.connections.iter() {
            let (key, data) = entry?;
            if self.tick > data.tick_first_packet + SECONDS_COUNT {
                old_connections.push((key, data));
            }
        }
        for (key, data) in &old_connections {
            if data.sni_str().is_empty() {
                error!(
                    "connection drained without an SNI: {} -> {} in state {:?}",
                    key.source_ip(),
                    key.dest_ip(),
                    data.state()
                );
            }
            // Deletion races with the classifier are benign.
            let _ = self.connections.remove(key);
        }

        // Consume the oldest stats slot, emptying it.
        let slot = ((self.tick + 1) % SECONDS_COUNT) as u32;
        let mut stats: HashMap<ConnTriple, (u64, u64)> = HashMap::new();
        let mut drained = Vec::new();
        for entry in self.stats.iter() {
            let (key, value) = entry?;
            if key.slot != slot {
                continue;
            }
            let triple = ConnTriple {
                sni: key.sni_str().to_owned(),
                source_ip: Ipv4Addr::from(u32::from_be(key.src_ip)),
                dest_ip: Ipv4Addr::from(u32::from_be(key.dst_ip)),
            };
            let counters = stats.entry(triple).or_insert((0, 0));
            counters.0 += value.succeeded;
            counters.1 += value.failed;
            drained.push(key);
        }
        for key in &drained {
            let _ = self.stats.remove(key);
        }

        Ok(TickInputs {
            old_connections,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectivity_common::SNI_BUF_LEN;

    fn triple(sni: &str) -> ConnTriple {
        ConnTriple {
            sni: sni.to_owned(),
            source_ip: Ipv4Addr::new(10, 0, 0, 1),
            dest_ip: Ipv4Addr::new(192, 168, 1, 2),
        }
    }

    fn tuple_key() -> TupleKey {
        TupleKey {
            src_ip: u32::from(Ipv4Addr::new(10, 0, 0, 1)).to_be(),
            dst_ip: u32::from(Ipv4Addr::new(192, 168, 1, 2)).to_be(),
            src_port: 40000u16.to_be(),
            dst_port: 443u16.to_be(),
        }
    }

    fn tuple_data(state: ConnState, sni: &str) -> TupleData {
        let mut data = TupleData::zeroed();
        data.state = state as u32;
        assert!(sni.len() < SNI_BUF_LEN);
        data.sni[..sni.len()].copy_from_slice(sni.as_bytes());
        data
    }

    fn stats_inputs(sni: &str, succeeded: u64, failed: u64) -> TickInputs {
        let mut stats = HashMap::new();
        stats.insert(triple(sni), (succeeded, failed));
        TickInputs {
            old_connections: Vec::new(),
            stats,
        }
    }

    fn find<'a>(incs: &'a [(ConnTriple, Inc)], sni: &str) -> &'a Inc {
        &incs.iter().find(|(t, _)| t.sni == sni).unwrap().1
    }

    // Scenario: clean success. One completed handshake and teardown in the
    // drained slot.
    #[test]
    fn clean_success() {
        let mut carry = CarryOver::default();
        let incs = account_tick(&mut carry, &stats_inputs("a.test", 1, 0), Instant::now());
        assert_eq!(incs.len(), 1);
        let inc = find(&incs, "a.test");
        assert_eq!(inc.successful, 1);
        assert_eq!(inc.active_seconds, 1);
        assert_eq!(inc.active_failed_seconds, 0);
        assert_eq!(inc.failed_seconds, 0);
    }

    // Scenario: server reject.
    #[test]
    fn server_reject() {
        let mut carry = CarryOver::default();
        let incs = account_tick(&mut carry, &stats_inputs("b.test", 0, 1), Instant::now());
        let inc = find(&incs, "b.test");
        assert_eq!(inc.rejected, 1);
        assert_eq!(inc.active_seconds, 1);
        assert_eq!(inc.active_failed_seconds, 1);
        assert_eq!(inc.failed_seconds, 1);
    }

    // Scenario: stalled handshake. A SYN-only connection ages out with an
    // empty SNI and no counters incremented.
    #[test]
    fn stalled_handshake() {
        let mut carry = CarryOver::default();
        let inputs = TickInputs {
            old_connections: vec![(tuple_key(), tuple_data(ConnState::SynReceived, ""))],
            stats: HashMap::new(),
        };
        let incs = account_tick(&mut carry, &inputs, Instant::now());
        assert_eq!(incs.len(), 1);
        let inc = find(&incs, "");
        assert_eq!(inc.successful, 0);
        assert_eq!(inc.rejected, 0);
        assert_eq!(inc.active_failed_seconds, 1);
        assert_eq!(inc.failed_seconds, 1);
    }

    // Scenario: failure carry-over. The failed second keeps emitting while
    // the triple is inactive, without counting as active.
    #[test]
    fn failure_carries_through_inactive_seconds() {
        let mut carry = CarryOver::default();
        let now = Instant::now();

        let incs = account_tick(&mut carry, &stats_inputs("b.test", 0, 1), now);
        assert_eq!(find(&incs, "b.test").failed_seconds, 1);
        assert_eq!(find(&incs, "b.test").active_seconds, 1);

        for _ in 0..3 {
            let incs = account_tick(&mut carry, &TickInputs::default(), now);
            assert_eq!(incs.len(), 1);
            let inc = find(&incs, "b.test");
            assert_eq!(inc.failed_seconds, 1);
            assert_eq!(inc.active_seconds, 0);
            assert_eq!(inc.active_failed_seconds, 0);
        }
    }

    // Scenario: mixed traffic in one tick.
    #[test]
    fn mixed_traffic_same_tick() {
        let mut carry = CarryOver::default();
        let incs = account_tick(&mut carry, &stats_inputs("c.test", 1, 1), Instant::now());
        let inc = find(&incs, "c.test");
        assert_eq!(inc.successful, 1);
        assert_eq!(inc.rejected, 1);
        assert_eq!(inc.active_seconds, 1);
        assert_eq!(inc.active_failed_seconds, 1);
        assert_eq!(inc.failed_seconds, 1);
    }

    // No inputs and no carried failures: nothing is emitted.
    #[test]
    fn no_activity_emits_nothing() {
        let mut carry = CarryOver::default();
        assert!(account_tick(&mut carry, &TickInputs::default(), Instant::now()).is_empty());
    }

    // An active, non-failed second resets the carried failure.
    #[test]
    fn active_clean_second_resets_carry() {
        let (_, carried) = fold_triple(true, &[], 1, 0);
        assert!(!carried);

        let mut carry = CarryOver::default();
        account_tick(&mut carry, &stats_inputs("d.test", 0, 1), Instant::now());
        account_tick(&mut carry, &stats_inputs("d.test", 1, 0), Instant::now());
        // carry resolved: the next inactive tick emits nothing
        let incs = account_tick(&mut carry, &TickInputs::default(), Instant::now());
        assert!(incs.is_empty());
    }

    // An inactive second with a carried failure stays failed (carry law).
    #[test]
    fn carry_forward_law() {
        let (inc, carried) = fold_triple(true, &[], 0, 0);
        assert!(carried);
        assert_eq!(inc.failed_seconds, 1);
        assert_eq!(inc.active_seconds, 0);
    }

    // A connection that aged out after the handshake began is counted as
    // successful (documented decision).
    #[test]
    fn aged_sni_received_counts_as_success() {
        let (inc, carried) = fold_triple(false, &[tuple_data(ConnState::SniReceived, "a.test")], 0, 0);
        assert_eq!(inc.successful, 1);
        assert_eq!(inc.active_seconds, 1);
        assert_eq!(inc.active_failed_seconds, 0);
        assert!(!carried);
    }

    // Client aborts are counted from the connection table and do not fail
    // the second.
    #[test]
    fn client_rst_counts_without_failing_the_second() {
        let (inc, carried) =
            fold_triple(false, &[tuple_data(ConnState::RstSentByClient, "a.test")], 0, 0);
        assert_eq!(inc.rejected_by_client, 1);
        assert_eq!(inc.active_seconds, 1);
        assert_eq!(inc.failed_seconds, 0);
        assert!(!carried);
    }

    // A server RST still present in the table at drain time is counted.
    #[test]
    fn aged_server_rst_counts_as_rejected() {
        let (inc, _) =
            fold_triple(false, &[tuple_data(ConnState::RstSentByServer, "a.test")], 0, 0);
        assert_eq!(inc.rejected, 1);
        assert_eq!(inc.active_failed_seconds, 1);
        assert_eq!(inc.failed_seconds, 1);
    }

    // FIN-closed and never-started tuples contribute nothing.
    #[test]
    fn ambiguous_states_contribute_nothing() {
        let (inc, carried) = fold_triple(
            false,
            &[
                tuple_data(ConnState::FinSent, "a.test"),
                tuple_data(ConnState::New, "a.test"),
            ],
            0,
            0,
        );
        assert_eq!(inc.successful, 0);
        assert_eq!(inc.rejected, 0);
        assert_eq!(inc.rejected_by_client, 0);
        // tuples were present, so the second is active but not failed
        assert_eq!(inc.active_seconds, 1);
        assert_eq!(inc.failed_seconds, 0);
        assert!(!carried);
    }

    // The triple union merges both tables: stale tuples and drained stats
    // for the same triple fold into one Inc.
    #[test]
    fn union_merges_tables() {
        let mut carry = CarryOver::default();
        let mut inputs = stats_inputs("a.test", 2, 0);
        inputs
            .old_connections
            .push((tuple_key(), tuple_data(ConnState::SniReceived, "a.test")));
        let incs = account_tick(&mut carry, &inputs, Instant::now());
        assert_eq!(incs.len(), 1);
        let inc = find(&incs, "a.test");
        assert_eq!(inc.successful, 3);
        assert_eq!(inc.active_seconds, 1);
    }

    // Expiry removes idle SNIs and their carried flags; activity refreshes
    // the window.
    #[test]
    fn expiry_honors_retention_window() {
        let mut carry = CarryOver::default();
        let start = Instant::now();
        account_tick(&mut carry, &stats_inputs("a.test", 0, 1), start);

        let retention = Duration::from_secs(300);
        // not yet expired
        assert!(expire_snis(&mut carry, start + Duration::from_secs(299), retention).is_empty());
        // past the window
        let expired = expire_snis(&mut carry, start + Duration::from_secs(301), retention);
        assert_eq!(expired, vec!["a.test".to_owned()]);
        assert!(carry.previous_failed.is_empty());
        // carry is gone: the next tick emits nothing
        assert!(account_tick(&mut carry, &TickInputs::default(), start).is_empty());
    }

    // Carried-but-inactive ticks do not refresh the retention window, so a
    // carried failure cannot keep its series alive forever.
    #[test]
    fn inactive_carry_does_not_refresh_retention() {
        let mut carry = CarryOver::default();
        let start = Instant::now();
        account_tick(&mut carry, &stats_inputs("a.test", 0, 1), start);
        // inactive ticks, later wall-clock
        account_tick(
            &mut carry,
            &TickInputs::default(),
            start + Duration::from_secs(200),
        );
        let expired = expire_snis(
            &mut carry,
            start + Duration::from_secs(301),
            Duration::from_secs(300),
        );
        assert_eq!(expired, vec!["a.test".to_owned()]);
    }
}
