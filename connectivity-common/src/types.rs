//! Data structures shared between kernel and userspace
//!
//! These structures must be `#[repr(C)]` to ensure consistent memory layout
//! between the eBPF classifier and the userspace aggregator.

use crate::constants::SNI_BUF_LEN;

/// Connection identity (4-tuple)
///
/// The key is stored in canonical orientation: `src` is the remote peer of
/// the connection and `dst` is the local service, so both directions of a
/// connection map to the same key. Addresses and ports are in network byte
/// order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TupleKey {
    /// Peer IPv4 address (network byte order)
    pub src_ip: u32,
    /// Local service IPv4 address (network byte order)
    pub dst_ip: u32,
    /// Peer port (network byte order)
    pub src_port: u16,
    /// Local service port (network byte order)
    pub dst_port: u16,
}

/// Classifier state of a tracked connection.
///
/// The discriminants are ordered so that the meaningful progression
/// `New → SynReceived → SynackReceived → SniReceived` is numerically
/// monotone; the classifier only advances along it. The reset and FIN
/// states may be entered from any prior state.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    New = 0,
    SynReceived = 1,
    SynackReceived = 2,
    SniReceived = 3,
    RstSentByServer = 4,
    RstSentByClient = 5,
    FinSent = 6,
}

impl ConnState {
    /// Decode a raw state value from a map entry. Unknown values collapse
    /// to `New`, which contributes nothing at drain time.
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => ConnState::SynReceived,
            2 => ConnState::SynackReceived,
            3 => ConnState::SniReceived,
            4 => ConnState::RstSentByServer,
            5 => ConnState::RstSentByClient,
            6 => ConnState::FinSent,
            _ => ConnState::New,
        }
    }
}

/// Per-connection state stored in the connection table.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TupleData {
    /// Ticker clock value when the first packet of this connection was
    /// observed. Written once on insertion, never updated.
    pub tick_first_packet: u64,
    /// Latest [`ConnState`] discriminant. Advanced with compare-and-swap.
    pub state: u32,
    /// FLAG_* bits (FIN direction tracking, SNI seen, completion credit).
    pub flags: u32,
    /// SNI from the first ClientHello, null-padded. Never rewritten once set.
    pub sni: [u8; SNI_BUF_LEN],
}

impl TupleData {
    pub const fn zeroed() -> Self {
        TupleData {
            tick_first_packet: 0,
            state: 0,
            flags: 0,
            sni: [0; SNI_BUF_LEN],
        }
    }
}

/// Key of the rotating stats table.
///
/// The outer ring of `SECONDS_COUNT` slots is flattened into a single hash
/// map by embedding the slot index in the key; an inner entry of slot `s`
/// is any key with `slot == s`. The aggregator drains a slot by removing
/// every key carrying its index.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatsKey {
    /// Ring slot, `tick % SECONDS_COUNT` at completion time.
    pub slot: u32,
    /// Peer IPv4 address (network byte order)
    pub src_ip: u32,
    /// Local service IPv4 address (network byte order)
    pub dst_ip: u32,
    /// Null-padded SNI
    pub sni: [u8; SNI_BUF_LEN],
}

/// Completed-connection counters for one stats ring entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsValue {
    /// Connections that terminated cleanly after the SNI was seen.
    pub succeeded: u64,
    /// Connections rejected by a server RST.
    pub failed: u64,
}

// Compile-time layout checks. The shared structs must have no tail padding:
// uninitialized padding bytes in a BPF hash key make logically equal keys
// hash differently.
const _: () = {
    assert!(core::mem::size_of::<TupleKey>() == 12);
    assert!(core::mem::size_of::<TupleData>() == 16 + SNI_BUF_LEN);
    assert!(core::mem::size_of::<StatsKey>() == 12 + SNI_BUF_LEN);
    assert!(core::mem::size_of::<StatsValue>() == 16);
};

#[cfg(feature = "userspace")]
mod pod_impls {
    use super::*;

    // SAFETY: all types are #[repr(C)], Copy, and contain only primitive or
    // fixed-length array fields.
    unsafe impl aya::Pod for TupleKey {}
    unsafe impl aya::Pod for TupleData {}
    unsafe impl aya::Pod for StatsKey {}
    unsafe impl aya::Pod for StatsValue {}
}

/// Userspace helper methods (requires the `userspace` feature).
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;
    use std::net::Ipv4Addr;

    /// Decode a null-padded SNI buffer into a string slice.
    fn sni_str(buf: &[u8; SNI_BUF_LEN]) -> &str {
        let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
        core::str::from_utf8(&buf[..len]).unwrap_or("")
    }

    impl TupleData {
        /// SNI extracted from the ClientHello, or the empty string.
        pub fn sni_str(&self) -> &str {
            sni_str(&self.sni)
        }

        /// Latest classifier state.
        pub fn state(&self) -> ConnState {
            ConnState::from_u32(self.state)
        }
    }

    impl StatsKey {
        pub fn sni_str(&self) -> &str {
            sni_str(&self.sni)
        }
    }

    impl TupleKey {
        /// Peer address as a standard library type.
        pub fn source_ip(&self) -> Ipv4Addr {
            Ipv4Addr::from(u32::from_be(self.src_ip))
        }

        /// Local service address as a standard library type.
        pub fn dest_ip(&self) -> Ipv4Addr {
            Ipv4Addr::from(u32::from_be(self.dst_ip))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_state_roundtrip() {
        for state in [
            ConnState::New,
            ConnState::SynReceived,
            ConnState::SynackReceived,
            ConnState::SniReceived,
            ConnState::RstSentByServer,
            ConnState::RstSentByClient,
            ConnState::FinSent,
        ] {
            assert_eq!(ConnState::from_u32(state as u32), state);
        }
    }

    #[test]
    fn conn_state_unknown_collapses_to_new() {
        assert_eq!(ConnState::from_u32(7), ConnState::New);
        assert_eq!(ConnState::from_u32(u32::MAX), ConnState::New);
    }

    #[test]
    fn handshake_progression_is_monotone() {
        assert!((ConnState::New as u32) < (ConnState::SynReceived as u32));
        assert!((ConnState::SynReceived as u32) < (ConnState::SynackReceived as u32));
        assert!((ConnState::SynackReceived as u32) < (ConnState::SniReceived as u32));
    }

    #[cfg(feature = "userspace")]
    #[test]
    fn sni_str_stops_at_null() {
        let mut data = TupleData::zeroed();
        data.sni[..6].copy_from_slice(b"a.test");
        assert_eq!(data.sni_str(), "a.test");

        let zeroed = TupleData::zeroed();
        assert_eq!(zeroed.sni_str(), "");
    }

    #[cfg(feature = "userspace")]
    #[test]
    fn tuple_key_ip_conversion() {
        let key = TupleKey {
            src_ip: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 1)).to_be(),
            dst_ip: u32::from(std::net::Ipv4Addr::new(192, 168, 1, 7)).to_be(),
            src_port: 443u16.to_be(),
            dst_port: 443u16.to_be(),
        };
        assert_eq!(key.source_ip(), std::net::Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(key.dest_ip(), std::net::Ipv4Addr::new(192, 168, 1, 7));
    }
}
