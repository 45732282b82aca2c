//! The Reservation Table (C3, §4.3): a multi-indexed, short-lived set of pending
//! inbound reservations. Modeled as an arena of stable indices plus secondary
//! hash-indices, per §9's design note — a `Vec<Option<Reservation>>` for O(1)
//! removal-by-index without shifting, `HashMap<ReservationKey, HashSet<usize>>` for
//! the non-unique axes (`RGW`, per-host, per-public-ip), and
//! `HashMap<ReservationKey, usize>` for the unique 3-tuple/5-tuple axes.
//!
//! The pool-release hook (§4.3 `remove`) is performed here rather than via a
//! callback stored on the reservation (§9 "monkey-patched delete" redesign note):
//! callers pass the `CircularPool` in explicitly on `remove`/`sweep_expired` since
//! both structures are owned by the same single-threaded event loop and a stored
//! back-reference would need interior mutability for no benefit.

use rgw_core::types::{Reservation, ReservationKey};
use rgw_pool::CircularPool;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info};

pub struct ReservationTable {
    arena: Vec<Option<Reservation>>,
    unique: HashMap<ReservationKey, usize>,
    non_unique: HashMap<ReservationKey, HashSet<usize>>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            unique: HashMap::new(),
            non_unique: HashMap::new(),
        }
    }

    fn unique_key(r: &Reservation) -> ReservationKey {
        match r.remote {
            Some((remote_ip, remote_port)) => {
                ReservationKey::five_tuple(r.outbound_ip, r.outbound_port, remote_ip, remote_port, r.protocol)
            }
            None => ReservationKey::three_tuple(r.outbound_ip, r.outbound_port, r.protocol),
        }
    }

    /// Insert `r`, indexed under all keys derived from its current state.
    /// Rejects with `true` (duplicate) if the unique key already collides — callers
    /// implement the one-retry-with-a-fresh-IP policy of §7 on that signal.
    pub fn add(&mut self, r: Reservation) -> Result<usize, Reservation> {
        let key = Self::unique_key(&r);
        if self.unique.contains_key(&key) {
            return Err(r);
        }

        let idx = self.arena.len();
        let host_key = ReservationKey::Fqdn(r.host_fqdn.clone());
        let ip_key = ReservationKey::PublicIp(r.outbound_ip);

        self.unique.insert(key, idx);
        self.non_unique.entry(ReservationKey::Rgw).or_default().insert(idx);
        self.non_unique.entry(host_key).or_default().insert(idx);
        self.non_unique.entry(ip_key).or_default().insert(idx);

        debug!(%r, "reservation added");
        self.arena.push(Some(r));
        Ok(idx)
    }

    /// Remove the reservation at `idx` from every key it is indexed under, then
    /// release its outbound IP back to `pool` iff no reservation remains under
    /// `(RGW_PUBLIC_IP, outbound_ip)` — I3.
    pub fn remove(&mut self, idx: usize, pool: &mut CircularPool) -> Option<Reservation> {
        let r = self.arena.get_mut(idx)?.take()?;

        self.unique.remove(&Self::unique_key(&r));
        self.remove_from_non_unique(ReservationKey::Rgw, idx);
        self.remove_from_non_unique(ReservationKey::Fqdn(r.host_fqdn.clone()), idx);
        let ip_key = ReservationKey::PublicIp(r.outbound_ip);
        self.remove_from_non_unique(ip_key.clone(), idx);

        if !self.non_unique.get(&ip_key).is_some_and(|s| !s.is_empty()) {
            pool.release(r.outbound_ip);
            info!(outbound_ip = %r.outbound_ip, "released pool address, no reservations remain");
        }

        Some(r)
    }

    fn remove_from_non_unique(&mut self, key: ReservationKey, idx: usize) {
        if let Some(set) = self.non_unique.get_mut(&key) {
            set.remove(&idx);
            if set.is_empty() {
                self.non_unique.remove(&key);
            }
        }
    }

    /// Re-index after autobind: the 3-tuple unique key is replaced by the 5-tuple
    /// form now that `r.remote` is populated. Non-unique keys are untouched since
    /// they don't depend on the remote tuple.
    pub fn update_keys(&mut self, idx: usize) {
        let Some(r) = self.arena.get(idx).and_then(|o| o.as_ref()) else {
            return;
        };
        let old_key = ReservationKey::three_tuple(r.outbound_ip, r.outbound_port, r.protocol);
        let new_key = Self::unique_key(r);
        self.unique.remove(&old_key);
        self.unique.insert(new_key, idx);
    }

    pub fn get(&self, idx: usize) -> Option<&Reservation> {
        self.arena.get(idx).and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Reservation> {
        self.arena.get_mut(idx).and_then(|o| o.as_mut())
    }

    /// Unique-key lookup: returns the single reservation indexed under `key`, if
    /// any. Used by the packet key-ladder (§4.3) for the 3-tuple/5-tuple forms,
    /// including the wildcarded (port/proto == 0) variants.
    pub fn lookup_unique(&self, key: &ReservationKey) -> Option<usize> {
        self.unique.get(key).copied()
    }

    pub fn has(&self, key: &ReservationKey) -> bool {
        match key {
            ReservationKey::ThreeTuple(..) | ReservationKey::FiveTuple(..) => self.unique.contains_key(key),
            _ => self.non_unique.get(key).is_some_and(|s| !s.is_empty()),
        }
    }

    /// Non-unique lookup: all reservations indexed under `key` (`RGW`,
    /// per-host, or per-public-ip).
    pub fn lookup(&self, key: &ReservationKey) -> Vec<usize> {
        self.non_unique
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self, key: &ReservationKey) -> usize {
        match key {
            ReservationKey::ThreeTuple(..) | ReservationKey::FiveTuple(..) => {
                usize::from(self.unique.contains_key(key))
            }
            _ => self.non_unique.get(key).map(|s| s.len()).unwrap_or(0),
        }
    }

    /// Remove every reservation with `now > expires_at`. Lazily invoked at the
    /// start of any admission check (§4.3); it need not run on a timer.
    pub fn sweep_expired(&mut self, pool: &mut CircularPool) -> usize {
        let expired: Vec<usize> = self
            .arena
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().filter(|r| r.has_expired()).map(|_| idx))
            .collect();
        let n = expired.len();
        for idx in expired {
            self.remove(idx, pool);
        }
        if n > 0 {
            debug!(count = n, "swept expired reservations");
        }
        n
    }

    /// Remove all reservations owned by `host_fqdn`, e.g. on host deregistration
    /// (§4.1 `deregister`), releasing pool addresses as a side effect.
    pub fn remove_all_for_host(&mut self, host_fqdn: &str, pool: &mut CircularPool) -> usize {
        let idxs = self.lookup(&ReservationKey::Fqdn(host_fqdn.to_string()));
        let n = idxs.len();
        for idx in idxs {
            self.remove(idx, pool);
        }
        n
    }

    /// All outbound IPs currently carrying at least one reservation (I1).
    pub fn allocated_outbound_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.non_unique.keys().filter_map(|k| match k {
            ReservationKey::PublicIp(ip) => Some(*ip),
            _ => None,
        })
    }
}

impl Default for ReservationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn pool() -> CircularPool {
        CircularPool::new(vec!["100.64.0.10".parse().unwrap(), "100.64.0.11".parse().unwrap()])
    }

    fn reservation(outbound_ip: Ipv4Addr, port: u16, proto: u8, loose_packet: i32, autobind: bool) -> Reservation {
        Reservation::new(
            "h1.",
            "192.168.0.100".parse().unwrap(),
            port,
            outbound_ip,
            port,
            proto,
            "udp2001.h1.",
            loose_packet,
            autobind,
            Duration::from_secs_f64(2.0),
        )
    }

    #[test]
    fn add_and_lookup_3tuple() {
        let mut table = ReservationTable::new();
        let ip = "100.64.0.10".parse().unwrap();
        let idx = table.add(reservation(ip, 2001, 17, 0, true)).unwrap();

        let key = ReservationKey::three_tuple(ip, 2001, 17);
        assert_eq!(table.lookup_unique(&key), Some(idx));
        assert!(table.has(&ReservationKey::PublicIp(ip)));
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut table = ReservationTable::new();
        let ip = "100.64.0.10".parse().unwrap();
        table.add(reservation(ip, 2001, 17, 0, true)).unwrap();
        let err = table.add(reservation(ip, 2001, 17, 0, true));
        assert!(err.is_err());
    }

    #[test]
    fn remove_releases_pool_only_when_last_s1() {
        // S1: remove the only reservation on an outbound IP releases it.
        let mut table = ReservationTable::new();
        let mut pool = pool();
        let ip = pool.allocate().unwrap();
        let idx = table.add(reservation(ip, 2001, 17, 0, true)).unwrap();

        table.remove(idx, &mut pool);
        assert!(!pool.is_allocated(ip));
    }

    #[test]
    fn remove_keeps_pool_when_other_reservation_remains_s3() {
        // S3: two overlapping reservations on the same outbound IP; removing one
        // must not release the address while the other is live.
        let mut table = ReservationTable::new();
        let mut pool = pool();
        let ip = pool.allocate().unwrap();
        let idx1 = table.add(reservation(ip, 2001, 17, 0, true)).unwrap();
        let idx2 = table.add(reservation(ip, 2002, 17, 0, true)).unwrap();

        table.remove(idx1, &mut pool);
        assert!(pool.is_allocated(ip));
        table.remove(idx2, &mut pool);
        assert!(!pool.is_allocated(ip));
    }

    #[test]
    fn update_keys_rebinds_3tuple_to_5tuple_s2() {
        let mut table = ReservationTable::new();
        let ip = "100.64.0.10".parse().unwrap();
        let idx = table.add(reservation(ip, 2001, 17, 1, true)).unwrap();

        let old_key = ReservationKey::three_tuple(ip, 2001, 17);
        assert!(table.lookup_unique(&old_key).is_some());

        let remote_ip: Ipv4Addr = "203.0.113.7".parse().unwrap();
        table.get_mut(idx).unwrap().remote = Some((remote_ip, 40000));
        table.update_keys(idx);

        assert!(table.lookup_unique(&old_key).is_none());
        let new_key = ReservationKey::five_tuple(ip, 2001, remote_ip, 40000, 17);
        assert_eq!(table.lookup_unique(&new_key), Some(idx));

        // I4: a different (src, sport) no longer matches under the 5-tuple key.
        let other_key = ReservationKey::five_tuple(ip, 2001, "203.0.113.8".parse().unwrap(), 41000, 17);
        assert!(table.lookup_unique(&other_key).is_none());
    }

    #[test]
    fn sweep_expired_removes_and_releases() {
        let mut table = ReservationTable::new();
        let mut pool = pool();
        let ip = pool.allocate().unwrap();
        let mut r = reservation(ip, 2001, 17, 0, true);
        r.expires_at = r.created_at; // already expired
        table.add(r).unwrap();

        let n = table.sweep_expired(&mut pool);
        assert_eq!(n, 1);
        assert!(!pool.is_allocated(ip));
    }

    #[test]
    fn remove_all_for_host_releases_every_reservation() {
        let mut table = ReservationTable::new();
        let mut pool = pool();
        let ip1 = pool.allocate().unwrap();
        let ip2 = pool.allocate().unwrap();
        table.add(reservation(ip1, 2001, 17, 0, true)).unwrap();
        table.add(reservation(ip2, 2002, 6, 0, true)).unwrap();

        let n = table.remove_all_for_host("h1.", &mut pool);
        assert_eq!(n, 2);
        assert!(!pool.is_allocated(ip1));
        assert!(!pool.is_allocated(ip2));
    }
}
