//! The engine: glues the host registry (C1), circular pool (C2) and reservation
//! table (C3) behind one lock so the DNS frontend (C4) and packet dispatcher (C5)
//! share a single, consistent view of allocation state (§5's single-writer model).
//!
//! This crate carries the cross-cutting business logic that both protocol-facing
//! crates need — admission control, overloading, the packet key-ladder, and the
//! post-processing/autobind step — rather than duplicating it in each. All of it is
//! lifted from the same handful of functions in the original: `_check_policyrgw`,
//! `_create_connectionentryrgw`, `_overload_connectionentryrgw`,
//! `_delete_connectionentryrgw`, `packet_in_circularpool` and
//! `ConnectionLegacy.post_processing`.

use rgw_core::error::{Error, Result};
use rgw_core::types::{Host, Reservation, ReservationKey, ServiceAttrs};
use rgw_pool::CircularPool;
use rgw_registry::HostRegistry;
use rgw_reservations::ReservationTable;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Global admission limit, mirrored from the original's RGW-wide `CIRCULARPOOL`
/// policy entry (§4.3 `max_reservations`-style policy, applied at the `RGW` axis
/// rather than per host).
pub struct Policy {
    pub global_max: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self { global_max: 0 }
    }
}

pub struct Engine {
    pub registry: HostRegistry,
    pub pool: CircularPool,
    /// The proxy-indirection pool (§4.4 step 4): addresses are allocated and
    /// released in the same breath, never held by a reservation. Same `CircularPool`
    /// type as the outbound pool — it's the same "finite list of addresses with a
    /// cursor" structure, just used for a one-shot draw instead of a lease.
    pub service_pool: CircularPool,
    pub reservations: ReservationTable,
    pub policy: Policy,
}

impl Engine {
    pub fn new(registry: HostRegistry, pool: CircularPool, service_pool: CircularPool, policy: Policy) -> Self {
        Self {
            registry,
            pool,
            service_pool,
            reservations: ReservationTable::new(),
            policy,
        }
    }

    /// `proxy_required` services (§4.4 step 4): draw an address from the service
    /// pool and release it immediately, without creating a reservation.
    pub fn proxy_address(&mut self) -> Result<Ipv4Addr> {
        let ip = self.service_pool.allocate().ok_or(Error::PoolExhausted)?;
        self.service_pool.release(ip);
        Ok(ip)
    }

    /// `_check_policyrgw`: sweep expired reservations, then verify neither the
    /// RGW-global nor the per-host admission limit would be exceeded. Exposed so
    /// callers can gate expensive work (e.g. a carrier-grade downstream
    /// resolution, §4.4 step 5) ahead of a call to `allocate` that would only
    /// reject it after the fact.
    pub fn check_policy(&mut self, host: &Host) -> bool {
        self.reservations.sweep_expired(&mut self.pool);

        if self.policy.global_max > 0 {
            let rgw_conns = self.reservations.stats(&ReservationKey::Rgw) as u32;
            if rgw_conns >= self.policy.global_max {
                warn!(limit = self.policy.global_max, "global reservation policy exceeded");
                return false;
            }
        }

        let host_conns = self.reservations.stats(&ReservationKey::Fqdn(host.fqdn.clone())) as u32;
        if host_conns >= host.max_reservations {
            warn!(fqdn = %host.fqdn, limit = host.max_reservations, "host reservation policy exceeded");
            return false;
        }
        true
    }

    /// `_overload_connectionentryrgw`: find an already-allocated outbound address
    /// whose existing reservations are all port/protocol-compatible with a new
    /// `(port, protocol)` service, per the three-clause predicate of §4.3/§9.
    fn find_overload_candidate(&self, port: u16, protocol: u8) -> Option<Ipv4Addr> {
        for ip in self.pool.get_allocated() {
            let mut blocked = false;
            for idx in self.reservations.lookup(&ReservationKey::PublicIp(ip)) {
                let Some(existing) = self.reservations.get(idx) else { continue };
                let (c_port, c_proto) = (existing.outbound_port, existing.protocol);
                let (d_port, d_proto) = (port, protocol);

                let both_wildcard = (c_port == 0 && c_proto == 0) || (d_port == 0 && d_proto == 0);
                let port_blocks = c_port == d_port && (c_proto == d_proto || c_proto == 0 || d_proto == 0);
                let proto_blocks = c_proto == d_proto && (c_port == 0 || d_port == 0);

                if both_wildcard || port_blocks || proto_blocks {
                    blocked = true;
                    break;
                }
            }
            if !blocked {
                return Some(ip);
            }
        }
        None
    }

    /// `_create_connectionentryrgw`: admit and reserve an outbound address for a
    /// resolved service, preferring to overload an existing address over drawing a
    /// fresh one from the pool. `dns_requestor` is the querying client's address,
    /// carried only for logging/diagnostics parity with the original.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate(
        &mut self,
        host: &Host,
        private_ip: Ipv4Addr,
        dns_requestor: Ipv4Addr,
        fqdn: &str,
        service: &ServiceAttrs,
    ) -> Result<Ipv4Addr> {
        if !self.check_policy(host) {
            return Err(Error::PoolExhausted);
        }

        let outbound_ip = match self.find_overload_candidate(service.port, service.protocol) {
            Some(ip) => {
                info!(%ip, %fqdn, "overloading existing outbound address");
                ip
            }
            None => {
                let ip = self.pool.allocate().ok_or(Error::PoolExhausted)?;
                info!(%ip, %fqdn, requestor = %dns_requestor, "allocated fresh outbound address");
                ip
            }
        };

        let reservation = Reservation::new(
            host.fqdn.clone(),
            private_ip,
            service.port,
            outbound_ip,
            service.port,
            service.protocol,
            fqdn,
            service.loose_packet,
            service.autobind,
            service.timeout,
        );

        match self.reservations.add(reservation) {
            Ok(_) => {
                debug!(%fqdn, %outbound_ip, "reservation created");
                Ok(outbound_ip)
            }
            Err(_rejected) => {
                // Duplicate 3-tuple key on a freshly allocated address shouldn't
                // normally happen (the overload check establishes compatibility),
                // but guard the one retry the original's allocator effectively gets
                // for free from `CircularPool.allocate()` cycling to a new address.
                // `outbound_ip` may have been an overloaded address still carrying
                // other live reservations (I3) — only release it back to the pool
                // if nothing else is indexed under it.
                if self.reservations.lookup(&ReservationKey::PublicIp(outbound_ip)).is_empty() {
                    self.pool.release(outbound_ip);
                }
                warn!(%fqdn, %outbound_ip, "reservation key collision, retrying once");
                let retry_ip = self.pool.allocate().ok_or(Error::PoolExhausted)?;
                let retry = Reservation::new(
                    host.fqdn.clone(),
                    private_ip,
                    service.port,
                    retry_ip,
                    service.port,
                    service.protocol,
                    fqdn,
                    service.loose_packet,
                    service.autobind,
                    service.timeout,
                );
                self.reservations.add(retry).map(|_| retry_ip).map_err(|_| Error::Conflict(fqdn.to_string()))
            }
        }
    }

    /// The packet key-ladder (§4.3, `packet_in_circularpool`): six ordered lookup
    /// attempts, most specific first, with an early drop-gate on the bare public IP.
    pub fn match_packet(
        &self,
        dst: Ipv4Addr,
        dport: u16,
        src: Ipv4Addr,
        sport: u16,
        proto: u8,
    ) -> Option<usize> {
        if !self.reservations.has(&ReservationKey::PublicIp(dst)) {
            return None;
        }

        let candidates = [
            ReservationKey::five_tuple(dst, dport, src, sport, proto),
            ReservationKey::three_tuple(dst, dport, proto),
            ReservationKey::three_tuple(dst, 0, 0),
            ReservationKey::three_tuple(dst, dport, 0),
            ReservationKey::three_tuple(dst, 0, proto),
        ];
        candidates.into_iter().find_map(|key| self.reservations.lookup_unique(&key))
    }

    /// `ConnectionLegacy.post_processing` + `_delete_connectionentryrgw`: consume a
    /// loose-packet token, autobind to the 5-tuple on first match, and remove the
    /// reservation (releasing its address) when no further packets are expected.
    pub fn post_process(&mut self, idx: usize, remote_ip: Ipv4Addr, remote_port: u16) {
        let Some(r) = self.reservations.get_mut(idx) else { return };

        let done = match r.loose_packet.cmp(&0) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Greater => {
                r.loose_packet -= 1;
                false
            }
            std::cmp::Ordering::Less => false,
        };

        if r.autobind && !r.autobind_done {
            info!(%r, "binding reservation to 5-tuple");
            r.remote = Some((remote_ip, remote_port));
            r.autobind_done = true;
            self.reservations.update_keys(idx);
        }

        if done {
            self.reservations.remove(idx, &mut self.pool);
        }
    }

    /// Remove every reservation belonging to a deregistered host (§4.1).
    pub fn purge_host(&mut self, host_fqdn: &str) -> usize {
        self.reservations.remove_all_for_host(host_fqdn, &mut self.pool)
    }

    pub fn sweep_expired(&mut self) -> usize {
        self.reservations.sweep_expired(&mut self.pool)
    }
}

/// Test-only helper timeout, kept short so `sweep_expired` assertions don't sleep long.
#[cfg(test)]
fn short_timeout() -> Duration {
    Duration::from_millis(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgw_core::types::ServiceAttrs;

    fn pool() -> CircularPool {
        CircularPool::new(vec!["100.64.0.10".parse().unwrap(), "100.64.0.11".parse().unwrap()])
    }

    fn host() -> Host {
        Host::new("h1.", "192.168.0.100".parse().unwrap(), 16)
    }

    fn service(port: u16, proto: u8) -> ServiceAttrs {
        ServiceAttrs {
            port,
            protocol: proto,
            proxy_required: false,
            carriergrade: false,
            loose_packet: 0,
            autobind: true,
            timeout: Duration::from_secs_f64(2.0),
        }
    }

    #[test]
    fn allocate_grants_fresh_address_s1() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let ip = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &service(2001, 17))
            .unwrap();
        assert!(eng.pool.is_allocated(ip));
    }

    #[test]
    fn allocate_overloads_compatible_service_s3() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let ip1 = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &service(2001, 17))
            .unwrap();
        // Different port/proto combination on the same host: compatible, should
        // overload the same address rather than draw a second one.
        let ip2 = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "tcp8080.h1.", &service(8080, 6))
            .unwrap();
        assert_eq!(ip1, ip2);
    }

    #[test]
    fn allocate_refuses_incompatible_overload_draws_new_address() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let ip1 = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "any.h1.", &service(0, 0))
            .unwrap();
        let ip2 = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &service(2001, 17))
            .unwrap();
        assert_ne!(ip1, ip2);
    }

    #[test]
    fn host_policy_limit_blocks_allocation() {
        let mut h = host();
        h.max_reservations = 1;
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        eng.allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "a.h1.", &service(1, 17)).unwrap();
        let err = eng.allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "b.h1.", &service(2, 17));
        assert!(matches!(err, Err(Error::PoolExhausted)));
    }

    #[test]
    fn match_packet_falls_through_key_ladder_s4() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let ip = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &service(2001, 17))
            .unwrap();

        let src: Ipv4Addr = "203.0.113.9".parse().unwrap();
        // No 5-tuple bound yet: falls through to the 3-tuple exact match.
        let idx = eng.match_packet(ip, 2001, src, 5000, 17).unwrap();
        assert_eq!(eng.reservations.get(idx).unwrap().outbound_port, 2001);
    }

    #[test]
    fn match_packet_drops_unreserved_ip() {
        let eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let dst: Ipv4Addr = "100.64.0.10".parse().unwrap();
        assert!(eng.match_packet(dst, 2001, "1.2.3.4".parse().unwrap(), 5000, 17).is_none());
    }

    #[test]
    fn post_process_autobinds_then_removes_on_next_packet() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let ip = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &service(2001, 17))
            .unwrap();
        let idx = eng.match_packet(ip, 2001, "203.0.113.9".parse().unwrap(), 5000, 17).unwrap();

        eng.post_process(idx, "203.0.113.9".parse().unwrap(), 5000);
        // loose_packet == 0 means "remove immediately" per the original's
        // post_processing contract.
        assert!(eng.reservations.get(idx).is_none());
        assert!(!eng.pool.is_allocated(ip));
    }

    #[test]
    fn post_process_honors_loose_packet_budget() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let mut svc = service(2001, 17);
        svc.loose_packet = 2;
        let ip = eng.allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &svc).unwrap();
        let idx = eng.match_packet(ip, 2001, "203.0.113.9".parse().unwrap(), 5000, 17).unwrap();

        eng.post_process(idx, "203.0.113.9".parse().unwrap(), 5000);
        assert!(eng.reservations.get(idx).is_some());
        assert_eq!(eng.reservations.get(idx).unwrap().loose_packet, 1);
    }

    #[test]
    fn purge_host_releases_all_its_reservations() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let ip = eng
            .allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &service(2001, 17))
            .unwrap();
        assert_eq!(eng.purge_host("h1."), 1);
        assert!(!eng.pool.is_allocated(ip));
    }

    #[test]
    fn sweep_expired_via_short_timeout() {
        let mut eng = Engine::new(HostRegistry::new(), pool(), pool(), Policy::default());
        let h = host();
        let mut svc = service(2001, 17);
        svc.timeout = short_timeout();
        let ip = eng.allocate(&h, h.ipv4, "203.0.113.1".parse().unwrap(), "udp2001.h1.", &svc).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(eng.sweep_expired(), 1);
        assert!(!eng.pool.is_allocated(ip));
    }
}
