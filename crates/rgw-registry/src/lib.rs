//! The Host Registry (C1, §4.1): a read-mostly table indexed by FQDN, by SFQDN, and
//! by carrier-grade-reachable FQDN. Mutated only by the registration front-end
//! (DHCP/DDNS, out of scope — §4.1 specifies only the contract the core consumes).

use rgw_core::error::{Error, Result};
use rgw_core::types::{ensure_fqdn, Host, ServiceAttrs};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// A carrier-grade host additionally publishes a canonical service definition that
/// answers for any name under a suffix, since the true target of each such name is
/// resolved downstream against the host itself (§4.4 step 6, §9 carrier-grade-FQDN
/// indexing).
pub struct HostRegistry {
    hosts: Vec<Host>,
    by_fqdn: HashMap<String, usize>,
    by_sfqdn: HashMap<String, usize>,
    /// (suffix, host index), sorted longest-suffix-first so the most specific
    /// carrier-grade domain wins, same idiom as a forward-zone table.
    carriergrade: Vec<(String, usize)>,
    carriergrade_services: HashMap<usize, ServiceAttrs>,
    removed: std::collections::HashSet<usize>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            hosts: Vec::new(),
            by_fqdn: HashMap::new(),
            by_sfqdn: HashMap::new(),
            carriergrade: Vec::new(),
            carriergrade_services: HashMap::new(),
            removed: std::collections::HashSet::new(),
        }
    }

    /// Provision a host with its full attribute set (config-driven, at startup).
    /// Idempotent on exact equality of FQDN; fails with `Conflict` otherwise — same
    /// contract as the DHCP-facing `register` (§4.1).
    pub fn provision(&mut self, host: Host) -> Result<()> {
        let fqdn = host.fqdn.clone();
        if let Some(&idx) = self.by_fqdn.get(&fqdn) {
            if self.hosts[idx].ipv4 != host.ipv4 {
                return Err(Error::Conflict(fqdn));
            }
            self.hosts[idx] = host;
            self.reindex(idx);
            return Ok(());
        }
        let idx = self.hosts.len();
        self.hosts.push(host);
        self.by_fqdn.insert(fqdn, idx);
        self.reindex(idx);
        Ok(())
    }

    /// Declare that any name under `suffix` resolves through `host_fqdn`'s
    /// carrier-grade sub-resolution, using `service` as the per-query attributes.
    pub fn set_carriergrade_domain(&mut self, host_fqdn: &str, suffix: &str, service: ServiceAttrs) -> Result<()> {
        let fqdn = ensure_fqdn(host_fqdn);
        let idx = *self
            .by_fqdn
            .get(&fqdn)
            .ok_or_else(|| Error::Config(format!("unknown host {fqdn}")))?;
        let suffix = ensure_fqdn(suffix);
        self.carriergrade.push((suffix, idx));
        self.carriergrade.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self.carriergrade_services.insert(idx, service);
        Ok(())
    }

    fn reindex(&mut self, idx: usize) {
        self.by_sfqdn.retain(|_, &mut v| v != idx);
        for (sfqdn, _) in self.hosts[idx].services.clone() {
            self.by_sfqdn.insert(sfqdn, idx);
        }
    }

    /// DHCP/DDNS lifecycle: insert or confirm a host's address (§4.1 `register`).
    /// Idempotent on exact equality; conflicts if the FQDN exists with a different
    /// address. Hosts created this way carry no services until a config reload adds
    /// them.
    pub fn register(&mut self, fqdn: &str, ipv4: Ipv4Addr) -> Result<()> {
        let fqdn = ensure_fqdn(fqdn);
        if let Some(&idx) = self.by_fqdn.get(&fqdn) {
            if self.hosts[idx].ipv4 != ipv4 {
                warn!(%fqdn, existing = %self.hosts[idx].ipv4, attempted = %ipv4, "register conflict");
                return Err(Error::Conflict(fqdn));
            }
            return Ok(());
        }
        let idx = self.hosts.len();
        debug!(%fqdn, %ipv4, "registering host");
        self.hosts.push(Host::new(fqdn.clone(), ipv4, 16));
        self.by_fqdn.insert(fqdn, idx);
        Ok(())
    }

    /// DHCP/DDNS lifecycle: remove a host (§4.1 `deregister`). Returns the removed
    /// host's FQDN so the caller (the engine) can purge its reservations and release
    /// pool addresses as a side effect — the registry itself holds no reference to
    /// the reservation table.
    pub fn deregister(&mut self, fqdn: &str) -> Option<String> {
        let fqdn = ensure_fqdn(fqdn);
        let idx = self.by_fqdn.remove(&fqdn)?;
        self.by_sfqdn.retain(|_, &mut v| v != idx);
        self.carriergrade.retain(|(_, i)| *i != idx);
        self.carriergrade_services.remove(&idx);
        // Leave a tombstone so existing indices stay valid; the slot is otherwise inert.
        self.hosts[idx].services.clear();
        self.removed.insert(idx);
        debug!(%fqdn, "deregistered host");
        Some(fqdn)
    }

    pub fn get_by_fqdn(&self, fqdn: &str) -> Option<&Host> {
        let fqdn = ensure_fqdn(fqdn);
        self.by_fqdn.get(&fqdn).map(|&idx| &self.hosts[idx])
    }

    pub fn is_zone_apex(&self, fqdn: &str) -> Option<&Host> {
        self.get_by_fqdn(fqdn)
    }

    /// Resolve an inbound SFQDN to its owning host and the service attributes it
    /// triggers (§4.4 step 1): exact SFQDN match first, then carrier-grade suffix
    /// match.
    pub fn resolve_sfqdn(&self, sfqdn: &str) -> Option<(&Host, ServiceAttrs)> {
        let sfqdn = ensure_fqdn(sfqdn);
        if let Some(&idx) = self.by_sfqdn.get(&sfqdn) {
            let host = &self.hosts[idx];
            if let Some(attrs) = host.service(&sfqdn) {
                return Some((host, attrs.clone()));
            }
        }
        for (suffix, idx) in &self.carriergrade {
            if sfqdn == *suffix || sfqdn.ends_with(&format!(".{suffix}")) {
                let service = self.carriergrade_services.get(idx)?;
                return Some((&self.hosts[*idx], service.clone()));
            }
        }
        None
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts
            .iter()
            .enumerate()
            .filter(move |(idx, _)| !self.removed.contains(idx))
            .map(|(_, h)| h)
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgw_core::types::ServiceAttrs;
    use std::time::Duration;

    fn udp_service(port: u16) -> ServiceAttrs {
        ServiceAttrs {
            port,
            protocol: 17,
            proxy_required: false,
            carriergrade: false,
            loose_packet: 0,
            autobind: true,
            timeout: Duration::from_secs_f64(2.0),
        }
    }

    #[test]
    fn provision_and_resolve_sfqdn() {
        let mut reg = HostRegistry::new();
        let host = Host::new("h1.", "192.168.0.100".parse().unwrap(), 16)
            .with_service("udp2001.h1.", udp_service(2001));
        reg.provision(host).unwrap();

        let (host, attrs) = reg.resolve_sfqdn("udp2001.h1.").unwrap();
        assert_eq!(host.fqdn, "h1.");
        assert_eq!(attrs.port, 2001);
    }

    #[test]
    fn provision_conflict_on_different_address() {
        let mut reg = HostRegistry::new();
        reg.provision(Host::new("h1.", "192.168.0.100".parse().unwrap(), 16)).unwrap();
        let err = reg.provision(Host::new("h1.", "192.168.0.101".parse().unwrap(), 16));
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[test]
    fn provision_idempotent_on_equal_address() {
        let mut reg = HostRegistry::new();
        reg.provision(Host::new("h1.", "192.168.0.100".parse().unwrap(), 16)).unwrap();
        reg.provision(Host::new("h1.", "192.168.0.100".parse().unwrap(), 16)).unwrap();
        assert!(reg.get_by_fqdn("h1.").is_some());
    }

    #[test]
    fn deregister_removes_host() {
        let mut reg = HostRegistry::new();
        reg.provision(Host::new("h1.", "192.168.0.100".parse().unwrap(), 16)).unwrap();
        assert!(reg.deregister("h1.").is_some());
        assert!(reg.get_by_fqdn("h1.").is_none());
    }

    #[test]
    fn carriergrade_suffix_matches_arbitrary_subnames() {
        let mut reg = HostRegistry::new();
        reg.provision(Host::new("cg1.", "10.0.0.1".parse().unwrap(), 16)).unwrap();
        let mut attrs = udp_service(0);
        attrs.carriergrade = true;
        reg.set_carriergrade_domain("cg1.", "cg1.", attrs).unwrap();

        let (host, service) = reg.resolve_sfqdn("anything.cg1.").unwrap();
        assert_eq!(host.fqdn, "cg1.");
        assert!(service.carriergrade);
    }

    #[test]
    fn register_ddns_contract() {
        let mut reg = HostRegistry::new();
        reg.register("h2.", "192.168.0.50".parse().unwrap()).unwrap();
        assert_eq!(reg.get_by_fqdn("h2.").unwrap().ipv4, "192.168.0.50".parse::<Ipv4Addr>().unwrap());

        // ttl=0 DDNS deregister
        assert!(reg.deregister("h2.").is_some());
        assert!(reg.get_by_fqdn("h2.").is_none());
    }
}
