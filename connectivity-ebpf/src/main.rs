//! Connectivity classifier socket-filter program
//!
//! Attached to an AF_PACKET socket bound to the monitored interface, so it
//! observes both ingress and egress frames. For every TCP/IPv4 frame whose
//! local-service side matches the allow-lists it advances the connection
//! state machine and, when a connection completes, records the outcome in
//! the rotating stats table.
//!
//! # Processing flow
//! 1. Ethernet header parse, IPv4 only
//! 2. IPv4 header parse, TCP only, first fragment only
//! 3. Allow-list check decides the travel direction and the canonical key
//! 4. TCP flags and payload drive the state machine ([`conn`])
//! 5. The whole handler is self-timed into a per-CPU latency histogram
//!
//! The program never keeps packet bytes: the return value 0 truncates every
//! frame before it reaches the capture socket, which is never read anyway.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::bpf_ktime_get_ns, macros::socket_filter, programs::SkBuffContext,
};
use network_types::eth::{EthHdr, EtherType};
use network_types::ip::{IpProto, Ipv4Hdr};
use network_types::tcp::TcpHdr;

use connectivity_common::{
    TupleKey, HISTOGRAM_BUCKETS, HISTOGRAM_SLOT_COUNT, HISTOGRAM_SLOT_SUM,
};

mod conn;
mod filter;
mod maps;
mod tls;

use conn::PacketMeta;
use maps::HISTOGRAM;

#[socket_filter]
pub fn connectivity(ctx: SkBuffContext) -> i64 {
    let started = unsafe { bpf_ktime_get_ns() };
    let _ = try_connectivity(&ctx);
    let elapsed = unsafe { bpf_ktime_get_ns() }.saturating_sub(started);
    record_execution_time(elapsed);
    0
}

fn try_connectivity(ctx: &SkBuffContext) -> Result<(), ()> {
    let eth: EthHdr = ctx.load(0).map_err(|_| ())?;
    if eth.ether_type != EtherType::Ipv4 as u16 {
        return Ok(());
    }

    let ipv4: Ipv4Hdr = ctx.load(EthHdr::LEN).map_err(|_| ())?;
    if ipv4.proto != IpProto::Tcp {
        return Ok(());
    }
    let ihl = (ipv4.vihl & 0x0f) as usize;
    if !(5..=15).contains(&ihl) {
        return Ok(());
    }
    // Later fragments carry no TCP header; IP reassembly is out of scope.
    if u16::from_be_bytes(ipv4.frag_off) & 0x1fff != 0 {
        return Ok(());
    }
    let ip_hdr_len = ihl * 4;

    let tcp: TcpHdr = ctx.load(EthHdr::LEN + ip_hdr_len).map_err(|_| ())?;

    // Addresses and ports stay in network byte order inside the tuple key;
    // the allow-list lookups want the port in host order.
    let src_ip = u32::from_ne_bytes(ipv4.src_addr);
    let dst_ip = u32::from_ne_bytes(ipv4.dst_addr);
    let src_port = u16::from_ne_bytes(tcp.source);
    let dst_port = u16::from_ne_bytes(tcp.dest);

    // Canonical orientation: the allow-listed side of the frame is the local
    // service, the other side is the peer. Both directions of a connection
    // end up under the same key.
    let (key, from_client) = if filter::allowed_service(dst_ip, u16::from_be(dst_port)) {
        (
            TupleKey {
                src_ip,
                dst_ip,
                src_port,
                dst_port,
            },
            true,
        )
    } else if filter::allowed_service(src_ip, u16::from_be(src_port)) {
        (
            TupleKey {
                src_ip: dst_ip,
                dst_ip: src_ip,
                src_port: dst_port,
                dst_port: src_port,
            },
            false,
        )
    } else {
        return Ok(());
    };

    let tcp_hdr_len = (tcp.doff() as usize) * 4;
    if tcp_hdr_len < TcpHdr::LEN {
        return Ok(());
    }
    let payload_off = EthHdr::LEN + ip_hdr_len + tcp_hdr_len;
    let payload_end = EthHdr::LEN + u16::from_be_bytes(ipv4.tot_len) as usize;
    let payload_len = payload_end.saturating_sub(payload_off);

    let meta = PacketMeta {
        key,
        from_client,
        syn: tcp.syn() != 0,
        ack: tcp.ack() != 0,
        rst: tcp.rst() != 0,
        fin: tcp.fin() != 0,
        payload_off,
        payload_len,
        payload_end,
    };
    conn::handle_packet(ctx, &meta);
    Ok(())
}

/// Record the handler duration in the logarithmic self-measurement
/// histogram: bucket `floor(log2(ns))`, plus running sum and count.
#[inline(always)]
fn record_execution_time(elapsed_ns: u64) {
    let bucket = if elapsed_ns == 0 {
        0
    } else {
        63 - elapsed_ns.leading_zeros()
    };
    let bucket = if bucket >= HISTOGRAM_BUCKETS {
        HISTOGRAM_BUCKETS - 1
    } else {
        bucket
    };
    histogram_add(bucket, 1);
    histogram_add(HISTOGRAM_SLOT_SUM, elapsed_ns);
    histogram_add(HISTOGRAM_SLOT_COUNT, 1);
}

#[inline(always)]
fn histogram_add(slot: u32, amount: u64) {
    if let Some(counter) = HISTOGRAM.get_ptr_mut(slot) {
        // SAFETY: per-CPU entry, no concurrent access from other CPUs.
        unsafe { *counter += amount };
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic; the verifier rejects reachable panics.
    loop {}
}
