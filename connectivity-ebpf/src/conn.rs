//! Connection state machine
//!
//! Applies the per-packet classification rules to the connection table and
//! records completed connections in the rotating stats table. Mutations on a
//! shared entry use BPF atomic operations so concurrent CPUs handling packets
//! of the same connection cannot lose updates.

use aya_ebpf::{bindings::BPF_NOEXIST, programs::SkBuffContext};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use connectivity_common::{
    ConnState, StatsValue, TupleData, TupleKey, FLAG_COMPLETED, FLAG_FIN_CLIENT, FLAG_FIN_SERVER,
    FLAG_SNI_SEEN, MISC_SLOT_STATS_DROPPED, SECONDS_COUNT, SNI_MAX_LEN,
};

use crate::maps::{CONNECTIONS, MISC_COUNTERS, SCRATCH_STATS_KEY, SCRATCH_TUPLE, STATS, TICKER};
use crate::tls;

/// Decoded TCP packet in canonical orientation.
pub struct PacketMeta {
    pub key: TupleKey,
    /// True when the frame travels from the peer towards the local service.
    pub from_client: bool,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
    pub fin: bool,
    pub payload_off: usize,
    pub payload_len: usize,
    pub payload_end: usize,
}

#[inline(always)]
fn current_tick() -> u64 {
    TICKER.get(0).copied().unwrap_or(0)
}

#[inline(always)]
fn state_atomic(data: *mut TupleData) -> &'static AtomicU32 {
    // SAFETY: `state` is a u32 inside BPF map memory, valid for the program
    // lifetime and only accessed through atomic operations.
    unsafe { &*(core::ptr::addr_of_mut!((*data).state) as *const AtomicU32) }
}

#[inline(always)]
fn flags_atomic(data: *mut TupleData) -> &'static AtomicU32 {
    // SAFETY: as above, for the `flags` field.
    unsafe { &*(core::ptr::addr_of_mut!((*data).flags) as *const AtomicU32) }
}

/// Advance the state along the monotone handshake progression. A value that
/// already reached `next` or beyond is left alone. The retry loop is bounded
/// for the verifier; contention on a single connection is at most one packet
/// per CPU.
#[inline(always)]
fn advance_state(data: *mut TupleData, next: ConnState) {
    let state = state_atomic(data);
    let target = next as u32;
    let mut current = state.load(Ordering::Relaxed);
    for _ in 0..4 {
        if current >= target {
            return;
        }
        match state.compare_exchange(current, target, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Unconditionally enter a reset or FIN state; returns the previous raw state.
#[inline(always)]
fn swap_state(data: *mut TupleData, next: ConnState) -> u32 {
    state_atomic(data).swap(next as u32, Ordering::Relaxed)
}

#[inline(always)]
fn bump_misc(slot: u32) {
    if let Some(counter) = MISC_COUNTERS.get_ptr_mut(slot) {
        // SAFETY: per-CPU entry, no concurrent access.
        unsafe { *counter += 1 };
    }
}

#[inline(always)]
fn add_stats_value(value: *mut StatsValue, succeeded: bool) {
    // SAFETY: counter fields live in BPF map memory shared across CPUs;
    // fetch_add keeps concurrent completions exact.
    unsafe {
        let field = if succeeded {
            core::ptr::addr_of_mut!((*value).succeeded)
        } else {
            core::ptr::addr_of_mut!((*value).failed)
        };
        (*(field as *const AtomicU64)).fetch_add(1, Ordering::Relaxed);
    }
}

/// Record a completed connection in the current stats slot.
///
/// The entry key carries `tick % SECONDS_COUNT`; the aggregator only drains
/// the slot 20 seconds behind, so this write never races the reader. A full
/// ring drops the increment and bumps the drop counter.
fn record_completion(key: &TupleKey, data: *mut TupleData, succeeded: bool) {
    let stats_key = match SCRATCH_STATS_KEY.get_ptr_mut(0) {
        Some(k) => k,
        None => return,
    };
    // SAFETY: per-CPU scratch slot; every field is overwritten here.
    unsafe {
        (*stats_key).slot = (current_tick() % SECONDS_COUNT) as u32;
        (*stats_key).src_ip = key.src_ip;
        (*stats_key).dst_ip = key.dst_ip;
        (*stats_key).sni = (*data).sni;
    }
    let stats_key = unsafe { &*stats_key };

    if let Some(value) = STATS.get_ptr_mut(stats_key) {
        add_stats_value(value, succeeded);
        return;
    }

    let initial = StatsValue {
        succeeded: if succeeded { 1 } else { 0 },
        failed: if succeeded { 0 } else { 1 },
    };
    if STATS.insert(stats_key, &initial, BPF_NOEXIST as u64).is_ok() {
        return;
    }
    // Either another CPU created the entry first or the ring is full.
    if let Some(value) = STATS.get_ptr_mut(stats_key) {
        add_stats_value(value, succeeded);
    } else {
        bump_misc(MISC_SLOT_STATS_DROPPED);
    }
}

/// Copy the host name out of the packet into the connection entry.
///
/// Returns false when the copy fails; the SNI then stays empty and the state
/// is left unchanged.
#[inline(always)]
fn store_sni(ctx: &SkBuffContext, data: *mut TupleData, name: &tls::ServerName) -> bool {
    let mut len = name.len;
    if len > SNI_MAX_LEN {
        len = SNI_MAX_LEN;
    }
    if len == 0 {
        return false;
    }
    // SAFETY: destination is map memory sized SNI_BUF_LEN > SNI_MAX_LEN;
    // len is bounded above.
    let dst = unsafe { &mut (*data).sni[..len] };
    ctx.load_bytes(name.offset, dst).is_ok()
}

/// Look up or create the connection entry and apply the classification rules
/// for one packet. Rule precedence: SYN, SYN+ACK, ClientHello payload,
/// server RST, client RST, FIN.
pub fn handle_packet(ctx: &SkBuffContext, meta: &PacketMeta) {
    let mut entry = CONNECTIONS.get_ptr_mut(&meta.key);
    if entry.is_none() {
        let scratch = match SCRATCH_TUPLE.get_ptr_mut(0) {
            Some(s) => s,
            None => return,
        };
        // SAFETY: per-CPU scratch slot, fully reinitialized before use.
        unsafe {
            *scratch = TupleData::zeroed();
            (*scratch).tick_first_packet = current_tick();
        }
        // BPF_NOEXIST keeps the first writer's entry when CPUs race on the
        // same new connection. A full table means the connection is simply
        // not tracked.
        let _ = CONNECTIONS.insert(&meta.key, unsafe { &*scratch }, BPF_NOEXIST as u64);
        entry = CONNECTIONS.get_ptr_mut(&meta.key);
    }
    let data = match entry {
        Some(d) => d,
        None => return,
    };

    if meta.syn && !meta.ack && meta.from_client {
        advance_state(data, ConnState::SynReceived);
        return;
    }
    if meta.syn && meta.ack && !meta.from_client {
        advance_state(data, ConnState::SynackReceived);
        return;
    }

    if meta.payload_len > 0
        && meta.from_client
        && state_atomic(data).load(Ordering::Relaxed) < ConnState::SniReceived as u32
    {
        if let Some(name) = tls::find_server_name(ctx, meta.payload_off, meta.payload_end) {
            if store_sni(ctx, data, &name) {
                flags_atomic(data).fetch_or(FLAG_SNI_SEEN, Ordering::Relaxed);
                advance_state(data, ConnState::SniReceived);
                return;
            }
        }
        // A ClientHello without a usable SNI leaves the state unchanged and
        // the recorded SNI empty; the aggregator logs such connections.
    }

    if meta.rst && !meta.from_client {
        let previous = swap_state(data, ConnState::RstSentByServer);
        if previous != ConnState::RstSentByServer as u32 {
            // Server reject: account it in the current slot, then drop the
            // tuple so the drain pass cannot count the connection a second
            // time. A failed delete is a benign race; the folding rule also
            // understands the RST state.
            record_completion(&meta.key, data, false);
            let _ = CONNECTIONS.remove(&meta.key);
        }
        return;
    }
    if meta.rst && meta.from_client {
        swap_state(data, ConnState::RstSentByClient);
        return;
    }

    if meta.fin {
        let direction = if meta.from_client {
            FLAG_FIN_CLIENT
        } else {
            FLAG_FIN_SERVER
        };
        let flags = flags_atomic(data).fetch_or(direction, Ordering::Relaxed) | direction;
        if flags & FLAG_FIN_CLIENT != 0
            && flags & FLAG_FIN_SERVER != 0
            && flags & FLAG_SNI_SEEN != 0
        {
            // Clean teardown after the TLS handshake began. Exactly one CPU
            // wins the completion flag and credits the success.
            let previous = flags_atomic(data).fetch_or(FLAG_COMPLETED, Ordering::Relaxed);
            if previous & FLAG_COMPLETED == 0 {
                record_completion(&meta.key, data, true);
            }
        }
        swap_state(data, ConnState::FinSent);
    }
}
