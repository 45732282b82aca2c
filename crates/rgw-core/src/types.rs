use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// IP protocol numbers relevant to RGW; matches the `proto` field carried end to end
/// from the packet parser through to reservation lookup keys.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_SCTP: u8 = 132;

/// Attributes of one service binding (`{port, protocol, proxy_required, carriergrade,
/// loose_packet, autobind, timeout}`, §3).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAttrs {
    pub port: u16,
    pub protocol: u8,
    pub proxy_required: bool,
    pub carriergrade: bool,
    pub loose_packet: i32,
    pub autobind: bool,
    /// Reservation lifetime. Defaults to 2.0s (§3) when unset by the service entry.
    pub timeout: Duration,
}

impl Default for ServiceAttrs {
    fn default() -> Self {
        Self {
            port: 0,
            protocol: 0,
            proxy_required: false,
            carriergrade: false,
            loose_packet: 0,
            autobind: false,
            timeout: Duration::from_secs_f64(2.0),
        }
    }
}

/// A private endpoint (§3). Services are keyed by their SFQDN (e.g. `udp2001.host.`).
#[derive(Debug, Clone)]
pub struct Host {
    /// Canonical FQDN, fully-qualified with a trailing dot.
    pub fqdn: String,
    pub ipv4: Ipv4Addr,
    pub services: Vec<(String, ServiceAttrs)>,
    /// Downstream addresses a carrier-grade sub-resolution is permitted to return.
    pub carriergrade_whitelist: Vec<Ipv4Addr>,
    /// Per-host admission limit on concurrent reservations (CIRCULARPOOL.max).
    pub max_reservations: u32,
}

impl Host {
    pub fn new(fqdn: impl Into<String>, ipv4: Ipv4Addr, max_reservations: u32) -> Self {
        Self {
            fqdn: ensure_fqdn(&fqdn.into()),
            ipv4,
            services: Vec::new(),
            carriergrade_whitelist: Vec::new(),
            max_reservations,
        }
    }

    pub fn with_service(mut self, sfqdn: impl Into<String>, attrs: ServiceAttrs) -> Self {
        self.services.push((ensure_fqdn(&sfqdn.into()), attrs));
        self
    }

    pub fn with_carriergrade_whitelist(mut self, whitelist: Vec<Ipv4Addr>) -> Self {
        self.carriergrade_whitelist = whitelist;
        self
    }

    /// Look up a service by its exact SFQDN.
    pub fn service(&self, sfqdn: &str) -> Option<&ServiceAttrs> {
        let sfqdn = ensure_fqdn(sfqdn);
        self.services
            .iter()
            .find(|(name, _)| *name == sfqdn)
            .map(|(_, attrs)| attrs)
    }

    pub fn is_zone_apex(&self, fqdn: &str) -> bool {
        ensure_fqdn(fqdn) == self.fqdn
    }
}

pub fn ensure_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// A pending inbound flow (§3). Created by the DNS frontend, mutated only by the
/// packet dispatcher (binding / token consumption) and the reservation table
/// (expiration sweep).
#[derive(Debug, Clone)]
pub struct Reservation {
    pub host_fqdn: String,
    pub private_ip: Ipv4Addr,
    pub private_port: u16,
    pub outbound_ip: Ipv4Addr,
    pub outbound_port: u16,
    pub remote: Option<(Ipv4Addr, u16)>,
    pub protocol: u8,
    /// The SFQDN that triggered this reservation.
    pub fqdn: String,
    pub loose_packet: i32,
    pub autobind: bool,
    pub autobind_done: bool,
    pub timeout: Duration,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl Reservation {
    pub fn new(
        host_fqdn: impl Into<String>,
        private_ip: Ipv4Addr,
        private_port: u16,
        outbound_ip: Ipv4Addr,
        outbound_port: u16,
        protocol: u8,
        fqdn: impl Into<String>,
        loose_packet: i32,
        autobind: bool,
        timeout: Duration,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            host_fqdn: host_fqdn.into(),
            private_ip,
            private_port,
            outbound_ip,
            outbound_port,
            remote: None,
            protocol,
            fqdn: fqdn.into(),
            loose_packet,
            autobind,
            autobind_done: false,
            timeout,
            created_at,
            expires_at: created_at + timeout,
        }
    }

    pub fn has_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True while indexed under the 3-tuple form (no remote bound yet).
    pub fn is_bound(&self) -> bool {
        self.remote.is_some()
    }
}

impl std::fmt::Display for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}) [{}] {}:{} <- {}:{}",
            self.host_fqdn,
            self.protocol,
            self.private_ip,
            self.private_port,
            self.outbound_ip,
            self.outbound_port
        )?;
        if let Some((ip, port)) = self.remote {
            write!(f, " <=> {ip}:{port}")?;
        }
        write!(f, " ({:.3}s) | FQDN {}", self.timeout.as_secs_f64(), self.fqdn)?;
        if self.loose_packet != 0 {
            write!(f, " / bucket={}", self.loose_packet)?;
        }
        Ok(())
    }
}

/// Lookup keys on `ReservationTable` (§3). `RGW`, `(RGW_FQDN, ...)` and
/// `(RGW_PUBLIC_IP, ...)` are always non-unique. The 3-tuple/5-tuple forms are the
/// unique insertion keys; a wildcard service (port or protocol `0`) is inserted
/// under the literal zeroed key, and the packet key-ladder walks successively more
/// wildcarded key values through the same unique index rather than a separate
/// lookup path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReservationKey {
    Rgw,
    Fqdn(String),
    PublicIp(Ipv4Addr),
    ThreeTuple(Ipv4Addr, u16, u8),
    FiveTuple(Ipv4Addr, u16, Ipv4Addr, u16, u8),
}

impl ReservationKey {
    pub fn three_tuple(ip: Ipv4Addr, port: u16, proto: u8) -> Self {
        ReservationKey::ThreeTuple(ip, port, proto)
    }

    pub fn five_tuple(ip: Ipv4Addr, port: u16, remote_ip: Ipv4Addr, remote_port: u16, proto: u8) -> Self {
        ReservationKey::FiveTuple(ip, port, remote_ip, remote_port, proto)
    }
}
