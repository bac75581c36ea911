//! Shared constants for the connectivity probe
//!
//! These constants are used by both the kernel classifier and the userspace
//! aggregator to ensure consistency in map sizes, slot layout, and limits.

// ============================================================================
// Stats ring
// ============================================================================

/// Number of one-second slots in the rotating stats table.
///
/// The classifier writes completed connections into slot `tick % 20`; the
/// aggregator drains slot `(tick + 1) % 20`, i.e. the slot that is 20 seconds
/// old. The 20-second lag between writer and reader is the synchronization
/// mechanism; shortening the ring would race.
pub const SECONDS_COUNT: u64 = 20;

// ============================================================================
// SNI limits
// ============================================================================

/// Maximum number of SNI octets stored per connection (the DNS name limit).
pub const SNI_MAX_LEN: usize = 253;

/// Size of the null-padded SNI buffer carried in map keys and values.
///
/// One past `SNI_MAX_LEN`, rounded up so the enclosing structs have no tail
/// padding (uninitialized padding in a BPF hash key breaks lookups).
pub const SNI_BUF_LEN: usize = 256;

// ============================================================================
// BPF map sizes
// ============================================================================

/// Maximum number of concurrent connections to track.
/// On overflow, insertion silently fails and the connection is not tracked.
pub const MAX_CONNECTIONS: u32 = 131072;

/// Maximum number of (slot, src, dst, sni) entries across the whole stats
/// ring. On overflow the increment is dropped and a counter is bumped.
pub const MAX_STATS_ENTRIES: u32 = 65536;

/// Maximum number of destination CIDR allow-list entries.
pub const MAX_CIDRS: u32 = 1024;

/// Maximum number of destination port allow-list entries.
pub const MAX_PORTS: u32 = 1024;

// ============================================================================
// Latency histogram layout
// ============================================================================

/// Number of power-of-two nanosecond buckets. `floor(log2(ns))` is clamped
/// to the last bucket, so 64 buckets cover the full u64 range.
pub const HISTOGRAM_BUCKETS: u32 = 64;

/// Slot holding the running sum of observed nanoseconds.
pub const HISTOGRAM_SLOT_SUM: u32 = 64;

/// Slot holding the observation count.
pub const HISTOGRAM_SLOT_COUNT: u32 = 65;

/// Total slots in the histogram per-CPU array.
pub const HISTOGRAM_SLOTS: u32 = 66;

// ============================================================================
// Miscellaneous per-CPU counters
// ============================================================================

/// Completed-connection increments dropped because the stats ring was full.
pub const MISC_SLOT_STATS_DROPPED: u32 = 0;

/// Total slots in the miscellaneous counter per-CPU array.
pub const MISC_SLOTS: u32 = 1;

// ============================================================================
// Map names (as seen by the userspace loader)
// ============================================================================

pub const MAP_CONNECTIONS: &str = "CONNECTIONS";
pub const MAP_STATS: &str = "STATS";
pub const MAP_TICKER: &str = "TICKER";
pub const MAP_ALLOWED_CIDRS: &str = "ALLOWED_CIDRS";
pub const MAP_ALLOWED_PORTS: &str = "ALLOWED_PORTS";
pub const MAP_HISTOGRAM: &str = "HISTOGRAM";
pub const MAP_MISC_COUNTERS: &str = "MISC_COUNTERS";

// ============================================================================
// Tuple flag bits (TupleData::flags)
// ============================================================================

/// A FIN from the client side of the connection has been observed.
pub const FLAG_FIN_CLIENT: u32 = 1 << 0;

/// A FIN from the server side of the connection has been observed.
pub const FLAG_FIN_SERVER: u32 = 1 << 1;

/// An SNI was extracted from the ClientHello on this connection.
pub const FLAG_SNI_SEEN: u32 = 1 << 2;

/// The connection's clean close has already been credited to the stats ring.
pub const FLAG_COMPLETED: u32 = 1 << 3;
