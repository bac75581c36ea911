//! Allow-list checks
//!
//! A packet is accepted for tracking only when the local-service side of the
//! frame matches both the destination CIDR trie and the destination port set
//! populated by the loader at startup.

use aya_ebpf::maps::lpm_trie::Key;

use crate::maps::{ALLOWED_CIDRS, ALLOWED_PORTS};

/// True when `ip` (network byte order) falls inside any allow-listed CIDR
/// and `port` (host byte order) is allow-listed.
#[inline(always)]
pub fn allowed_service(ip: u32, port: u16) -> bool {
    let key = Key::new(32, ip);
    if ALLOWED_CIDRS.get(&key).is_none() {
        return false;
    }
    // SAFETY: read-only lookup; the loader populates this map before attach.
    unsafe { ALLOWED_PORTS.get(&port).is_some() }
}
