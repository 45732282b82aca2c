//! The Packet Dispatcher (C5, §4.5): the kernel packet-queue callback invoked for
//! every packet destined for a pool address. Parses the 5-tuple, runs the
//! reservation key-ladder, DNATs to the owning private host, and retires the
//! reservation exactly as `packet_in_circularpool` + `post_processing` do in the
//! original.
//!
//! The concrete packet queue (e.g. an in-kernel NFQUEUE) is out of scope — it is
//! represented here as the opaque [`NetworkSink`] trait (§6), the same way the
//! distillation treats it as an external collaborator. `on_packet` is the callback
//! body a real queue integration would invoke per datagram.

use rgw_core::types::{PROTO_SCTP, PROTO_TCP, PROTO_UDP};
use rgw_engine::Engine;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// One packet pulled off the kernel queue, carrying an opaque sink-assigned `id`
/// (e.g. an NFQUEUE packet id) alongside its raw bytes.
#[derive(Debug, Clone)]
pub struct PacketHandle {
    pub id: u64,
    pub payload: Vec<u8>,
}

impl PacketHandle {
    pub fn new(id: u64, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }
}

/// The kernel-queue verdict primitives (§6): every packet is eventually resolved
/// by exactly one of `accept`/`drop`/`dnat`; `set_mark` may be called beforehand
/// to tag the packet for firewall rules downstream.
pub trait NetworkSink: Send + Sync {
    fn accept(&self, packet: PacketHandle);
    fn drop(&self, packet: PacketHandle);
    fn set_mark(&self, packet: &PacketHandle, mark: u32);
    fn dnat(&self, packet: PacketHandle, new_dst_ip: Ipv4Addr);
}

#[derive(Debug, Clone, Copy)]
struct FiveTuple {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sport: u16,
    dport: u16,
    proto: u8,
}

/// Parse the 5-tuple out of a raw IPv4 payload (§4.5 step 1). Uses `etherparse`
/// for the truncation-safe IPv4 header read, then reads the source/destination
/// port directly off the first four bytes of the L4 payload — the layout TCP,
/// UDP and SCTP all share — rather than decoding each transport header in full,
/// since nothing past the ports is needed here. Any other protocol, or a payload
/// too short to hold a header, defaults `sport`/`dport` to `0` per the original.
fn parse_five_tuple(payload: &[u8]) -> Option<FiveTuple> {
    let header = etherparse::Ipv4HeaderSlice::from_slice(payload).ok()?;
    let proto: u8 = header.protocol().into();
    let header_len = header.slice().len();
    let l4 = payload.get(header_len..).unwrap_or(&[]);

    let (sport, dport) = match proto {
        PROTO_TCP | PROTO_UDP | PROTO_SCTP if l4.len() >= 4 => {
            (u16::from_be_bytes([l4[0], l4[1]]), u16::from_be_bytes([l4[2], l4[3]]))
        }
        _ => (0, 0),
    };

    Some(FiveTuple {
        src: header.source_addr(),
        dst: header.destination_addr(),
        sport,
        dport,
        proto,
    })
}

pub struct PacketDispatcher {
    engine: Arc<Mutex<Engine>>,
}

impl PacketDispatcher {
    pub fn new(engine: Arc<Mutex<Engine>>) -> Self {
        Self { engine }
    }

    /// The per-packet callback (§4.5). The only suspension point is the engine
    /// lock itself — no I/O and no upstream calls happen here — so packets on the
    /// same flow are processed strictly in arrival order.
    pub async fn on_packet(&self, packet: PacketHandle, sink: &dyn NetworkSink) {
        let Some(tuple) = parse_five_tuple(packet.payload_bytes()) else {
            debug!(id = packet.id, "dropping truncated or non-IP packet");
            sink.drop(packet);
            return;
        };

        let mut engine = self.engine.lock().await;
        let idx = engine.match_packet(tuple.dst, tuple.dport, tuple.src, tuple.sport, tuple.proto);
        let Some(idx) = idx else {
            drop(engine);
            debug!(dst = %tuple.dst, dport = tuple.dport, proto = tuple.proto, "no reservation matched, dropping packet");
            sink.drop(packet);
            return;
        };

        let Some(private_ip) = engine.reservations.get(idx).map(|r| r.private_ip) else {
            drop(engine);
            sink.drop(packet);
            return;
        };

        engine.post_process(idx, tuple.src, tuple.sport);
        drop(engine);

        sink.dnat(packet, private_ip);
    }
}
