//! Downstream resolution helpers: the carrier-grade sub-resolution query issued
//! against a host's own address (§4.4 step 6), and LAN-no-SOA forwarding to a
//! randomly-chosen upstream resolver (mirrors `dns_get_resolver`'s random pick).

use hickory_proto::op::Message;
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rand::seq::SliceRandom;
use rgw_core::error::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// The default per-record-type retransmission schedule (§4.4 "Timeouts"): one
/// attempt, blocking with no timeout.
pub const DEFAULT_SCHEDULE: &[f64] = &[0.0];

/// Send `query` unchanged to `upstream`, retrying once per entry of `schedule`
/// (seconds per try; `0.0` means block with no timeout on that try) until one
/// succeeds or the schedule is exhausted. Returns the raw response bytes with no
/// rewriting — callers that need the original query ID restored do so explicitly
/// (coalescing may have changed it).
pub async fn query_upstream(query: &Message, upstream: SocketAddr, schedule: &[f64]) -> Result<Vec<u8>> {
    let bind_addr: SocketAddr = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse().unwrap();
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| Error::ResolutionFailure(e.to_string()))?;
    socket
        .connect(upstream)
        .await
        .map_err(|e| Error::ResolutionFailure(e.to_string()))?;

    let wire = query.to_bytes().map_err(|e| Error::ProtocolError(e.to_string()))?;
    let schedule = if schedule.is_empty() { DEFAULT_SCHEDULE } else { schedule };
    let mut buf = vec![0u8; 4096];
    let last = schedule.len() - 1;

    for (attempt, &wait) in schedule.iter().enumerate() {
        socket.send(&wire).await.map_err(|e| Error::ResolutionFailure(e.to_string()))?;

        let result = if wait > 0.0 {
            timeout(Duration::from_secs_f64(wait), socket.recv(&mut buf))
                .await
                .map_err(|_| Error::ResolutionFailure(format!("timed out waiting for {upstream}")))
                .and_then(|r| r.map_err(|e| Error::ResolutionFailure(e.to_string())))
        } else {
            socket.recv(&mut buf).await.map_err(|e| Error::ResolutionFailure(e.to_string()))
        };

        match result {
            Ok(n) => return Ok(buf[..n].to_vec()),
            Err(e) if attempt == last => return Err(e),
            Err(_) => continue,
        }
    }
    unreachable!("the last schedule entry always returns")
}

/// Pick one upstream at random from a resolver pool, the same load-spreading
/// policy as the original's `dns_get_resolver(any=True)`.
pub fn pick_resolver(pool: &[SocketAddr]) -> Option<SocketAddr> {
    pool.choose(&mut rand::thread_rng()).copied()
}

/// Extract the first A record's address from a wire response, used by the
/// carrier-grade sub-resolution path to recover the downstream-assigned address.
pub fn first_a_record(wire: &[u8]) -> Option<Ipv4Addr> {
    let message = Message::from_bytes(wire).ok()?;
    message.answers().iter().find_map(|record| match record.record_type() {
        RecordType::A => match record.data() {
            Some(RData::A(addr)) => Some(addr.0),
            _ => None,
        },
        _ => None,
    })
}
