//! BPF map definitions for the connectivity classifier
//!
//! Defines the shared tables written by the classifier and drained by the
//! userspace aggregator, plus the per-CPU scratch slots used to keep large
//! structs off the 512-byte BPF stack.

use aya_ebpf::{
    bindings::BPF_F_NO_PREALLOC,
    macros::map,
    maps::{lpm_trie::LpmTrie, Array, HashMap, PerCpuArray},
};
use connectivity_common::{
    StatsKey, StatsValue, TupleData, TupleKey, HISTOGRAM_SLOTS, MAX_CIDRS, MAX_CONNECTIONS,
    MAX_PORTS, MAX_STATS_ENTRIES, MISC_SLOTS,
};

/// Destination CIDR allow-list, longest-prefix match on the big-endian
/// IPv4 address. Populated once by the loader at startup.
#[map]
pub static ALLOWED_CIDRS: LpmTrie<u32, u8> =
    LpmTrie::with_max_entries(MAX_CIDRS, BPF_F_NO_PREALLOC);

/// Destination port allow-list (host byte order keys).
#[map]
pub static ALLOWED_PORTS: HashMap<u16, u8> = HashMap::with_max_entries(MAX_PORTS, 0);

/// Connection table: 4-tuple key to per-connection state.
///
/// Written by the classifier on every accepted packet; the aggregator scans
/// it once per tick and deletes entries older than the stats ring.
#[map]
pub static CONNECTIONS: HashMap<TupleKey, TupleData> =
    HashMap::with_max_entries(MAX_CONNECTIONS, 0);

/// Rotating stats table, flattened: the ring slot lives inside the key.
///
/// The classifier writes completions into slot `tick % SECONDS_COUNT`; the
/// aggregator drains slot `(tick + 1) % SECONDS_COUNT`. The 20-second lag
/// guarantees the two never touch the same slot.
#[map]
pub static STATS: HashMap<StatsKey, StatsValue> =
    HashMap::with_max_entries(MAX_STATS_ENTRIES, 0);

/// Ticker clock: a single second counter, written by the aggregator at the
/// end of each tick and read here to stamp new connections. Torn reads are
/// acceptable (single writer, 20-second freshness margin).
#[map]
pub static TICKER: Array<u64> = Array::with_max_entries(1, 0);

/// Classifier execution-time histogram: 64 power-of-two nanosecond buckets
/// plus sum and count slots. Per-CPU, never reset; userspace sums across
/// CPUs and computes deltas.
#[map]
pub static HISTOGRAM: PerCpuArray<u64> = PerCpuArray::with_max_entries(HISTOGRAM_SLOTS, 0);

/// Miscellaneous per-CPU counters (dropped stats increments).
#[map]
pub static MISC_COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MISC_SLOTS, 0);

/// Scratch slot for building a connection entry without blowing the stack.
#[map]
pub static SCRATCH_TUPLE: PerCpuArray<TupleData> = PerCpuArray::with_max_entries(1, 0);

/// Scratch slot for building a stats ring key without blowing the stack.
#[map]
pub static SCRATCH_STATS_KEY: PerCpuArray<StatsKey> = PerCpuArray::with_max_entries(1, 0);
