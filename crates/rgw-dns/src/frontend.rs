//! Wire handling and dispatch matrix (§4.4). Two interfaces (LAN/WAN) crossed with
//! SOA-zone membership give four live combinations, plus two CES (customer-edge)
//! stubs the original reserves but never implements beyond an immediate drop
//! (§9 Open Question: CES handlers are unimplemented intentionally — no spec
//! operation describes their behavior, so they stay drop stubs here too).

use crate::coalesce::{ActiveQueries, QueryKey, Slot};
use crate::resolver::{first_a_record, pick_resolver, query_upstream};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rgw_core::config::Config;
use rgw_core::error::Error;
use rgw_core::types::{ensure_fqdn, ServiceAttrs};
use rgw_engine::Engine;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iface {
    Lan,
    Wan,
}

pub struct DnsFrontend {
    lan_listen: SocketAddr,
    wan_listen: SocketAddr,
    soa_zones: Vec<String>,
    resolvers: Vec<SocketAddr>,
    /// Per-try retransmission schedule for A-record sub-resolution (§4.4
    /// "Timeouts"); an absent `[dns.timeouts] a` entry defaults to one blocking
    /// attempt (`[0]`).
    a_schedule: Vec<f64>,
    engine: Arc<Mutex<Engine>>,
    active: Arc<ActiveQueries>,
}

impl DnsFrontend {
    pub fn new(config: &Config, engine: Arc<Mutex<Engine>>) -> anyhow::Result<Self> {
        let lan_listen = config.dns.lan_listen.parse()?;
        let wan_listen = config.dns.wan_listen.parse()?;
        let resolvers = config
            .dns
            .resolvers
            .iter()
            .map(|s| if s.contains(':') { s.parse() } else { format!("{s}:53").parse() })
            .filter_map(|r: Result<SocketAddr, _>| r.ok())
            .collect();
        let a_schedule = config.dns.timeouts.get("a").cloned().unwrap_or_else(|| vec![0.0]);

        Ok(Self {
            lan_listen,
            wan_listen,
            soa_zones: config.dns.soa_zones.clone(),
            resolvers,
            a_schedule,
            engine,
            active: Arc::new(ActiveQueries::new()),
        })
    }

    fn is_soa(&self, qname: &str) -> bool {
        let qname = ensure_fqdn(qname);
        self.soa_zones.iter().any(|z| qname == *z || qname.ends_with(&format!(".{z}")))
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let lan_udp = Arc::new(UdpSocket::bind(self.lan_listen).await?);
        let wan_udp = Arc::new(UdpSocket::bind(self.wan_listen).await?);
        let lan_tcp = TcpListener::bind(self.lan_listen).await?;
        let wan_tcp = TcpListener::bind(self.wan_listen).await?;
        info!(lan = %self.lan_listen, wan = %self.wan_listen, "DNS frontend listening (UDP+TCP)");

        let tcp_shutdown = shutdown.clone();
        let this_tcp = self.clone();
        let tcp_handle = tokio::spawn(async move { this_tcp.run_tcp_accept(lan_tcp, wan_tcp, tcp_shutdown).await });

        let mut lan_buf = vec![0u8; 4096];
        let mut wan_buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                result = lan_udp.recv_from(&mut lan_buf) => {
                    let (len, src) = result?;
                    let data = lan_buf[..len].to_vec();
                    let this = self.clone();
                    let sock = lan_udp.clone();
                    tokio::spawn(async move {
                        if let Some(resp) = this.handle_query(Iface::Lan, &data, src).await {
                            if let Err(e) = sock.send_to(&resp, src).await {
                                warn!("failed to send LAN UDP response to {src}: {e}");
                            }
                        }
                    });
                }
                result = wan_udp.recv_from(&mut wan_buf) => {
                    let (len, src) = result?;
                    let data = wan_buf[..len].to_vec();
                    let this = self.clone();
                    let sock = wan_udp.clone();
                    tokio::spawn(async move {
                        if let Some(resp) = this.handle_query(Iface::Wan, &data, src).await {
                            if let Err(e) = sock.send_to(&resp, src).await {
                                warn!("failed to send WAN UDP response to {src}: {e}");
                            }
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("DNS frontend shutting down");
                        break;
                    }
                }
            }
        }

        tcp_handle.abort();
        Ok(())
    }

    async fn run_tcp_accept(
        self: Arc<Self>,
        lan: TcpListener,
        wan: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                result = lan.accept() => {
                    if let Ok((stream, src)) = result {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_tcp(stream, Iface::Lan, src).await });
                    }
                }
                result = wan.accept() => {
                    if let Ok((stream, src)) = result {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_tcp(stream, Iface::Wan, src).await });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_tcp(&self, mut stream: TcpStream, iface: Iface, src: SocketAddr) {
        let msg_len = match stream.read_u16().await {
            Ok(n) => n as usize,
            Err(_) => return,
        };
        if msg_len == 0 || msg_len > 65535 {
            return;
        }
        let mut buf = vec![0u8; msg_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return;
        }

        if let Some(resp) = self.handle_query(iface, &buf, src).await {
            let len = resp.len() as u16;
            let _ = stream.write_all(&len.to_be_bytes()).await;
            let _ = stream.write_all(&resp).await;
            let _ = stream.flush().await;
        }
    }

    /// Route a raw wire message through the dispatch matrix; `None` means drop
    /// silently (no datagram sent at all), matching the original's behavior on
    /// resource exhaustion and the WAN-no-SOA/CES paths.
    pub async fn handle_query(&self, iface: Iface, data: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let request = Message::from_bytes(data).ok()?;

        if request.op_code() == OpCode::Update {
            return Some(self.handle_update(&request).await);
        }
        if request.op_code() != OpCode::Query {
            return Some(make_response(&request, ResponseCode::NotImp));
        }
        let queries = request.queries();
        if queries.is_empty() {
            return Some(make_response(&request, ResponseCode::FormErr));
        }

        let qname = queries[0].name().to_string();
        let qtype = queries[0].query_type();
        let soa = self.is_soa(&qname);
        debug!(iface = iface_label(iface), %qname, ?qtype, soa, "query");

        match (iface, soa) {
            (Iface::Lan, true) => self.rgw_soa(&request, &qname, qtype, None).await,
            (Iface::Wan, true) => self.rgw_soa(&request, &qname, qtype, Some(client.ip())).await,
            (Iface::Lan, false) => self.lan_nosoa(&request, &qname, qtype, client).await,
            (Iface::Wan, false) => None, // dns_process_rgw_wan_nosoa: always drop
        }
    }

    async fn handle_update(&self, request: &Message) -> Vec<u8> {
        let mut engine = self.engine.lock().await;
        for record in request.name_servers() {
            if record.record_type() != RecordType::A {
                continue;
            }
            let fqdn = record.name().to_string();
            let Some(RData::A(addr)) = record.data() else { continue };
            let ip: Ipv4Addr = addr.0;
            if record.ttl() != 0 {
                match engine.registry.register(&fqdn, ip) {
                    Ok(()) => info!(%fqdn, %ip, "DDNS register"),
                    Err(e) => warn!(%fqdn, %ip, %e, "DDNS register failed"),
                }
            } else if let Some(removed) = engine.registry.deregister(&fqdn) {
                let n = engine.purge_host(&removed);
                info!(%fqdn, reservations_purged = n, "DDNS deregister");
            }
        }
        make_response(request, ResponseCode::NoError)
    }

    /// `dns_process_rgw_{lan,wan}_soa`: resolve a name this gateway is
    /// authoritative for, either by direct LAN answer, carrier-grade downstream
    /// resolution, or circular-pool allocation on the WAN side.
    async fn rgw_soa(
        &self,
        request: &Message,
        fqdn: &str,
        qtype: RecordType,
        wan_client: Option<std::net::IpAddr>,
    ) -> Option<Vec<u8>> {
        let fqdn = ensure_fqdn(fqdn);
        let (service_match, zone_apex) = {
            let engine = self.engine.lock().await;
            let service_match = engine.registry.resolve_sfqdn(&fqdn).map(|(host, svc)| (host.fqdn.clone(), host.ipv4, svc));
            let zone_apex = if self.soa_zones.iter().any(|z| *z == fqdn) {
                engine.registry.is_zone_apex(&fqdn).map(|h| h.ipv4)
            } else {
                None
            };
            (service_match, zone_apex)
        };

        let (host_fqdn, host_ipv4, service) = match service_match {
            Some(found) => found,
            None => {
                // The NS address itself: always answered directly with its own A
                // record, independent of the query's actual qtype (§4.4, the
                // `fqdn in soa_list` branch of `dns_process_rgw_wan_soa`).
                if let Some(ipv4) = zone_apex {
                    return Some(make_response_answer_a(request, &fqdn, ipv4, 60));
                }
                return Some(make_response(request, ResponseCode::NXDomain));
            }
        };

        // PTR resolves to the owning host's FQDN, same as A's "direct" branches but
        // with no pool involvement at all (§6; `rdtype == 12` in `dns_process_rgw_*_soa`).
        if qtype == RecordType::PTR {
            return Some(make_response_answer_ptr(request, &fqdn, &host_fqdn, 30));
        }
        if qtype != RecordType::A {
            return Some(make_response(request, ResponseCode::NoError));
        }

        if service.proxy_required {
            let mut engine = self.engine.lock().await;
            return match engine.proxy_address() {
                Ok(ip) => Some(make_response_answer_a(request, &fqdn, ip, 0)),
                Err(e) => {
                    warn!(%fqdn, %e, "service pool exhausted, dropping query");
                    None
                }
            };
        }

        // Step 5: admission must be checked before carrier-grade sub-resolution
        // (step 6), not only inside the `allocate` call at its tail — otherwise an
        // already-exhausted host still pays for a live downstream round-trip before
        // being refused, leaking pool-state timing that `AdmissionDenied`'s silent
        // drop is meant to hide (§7).
        if wan_client.is_some() {
            let mut engine = self.engine.lock().await;
            let Some(host) = engine.registry.get_by_fqdn(&host_fqdn).cloned() else {
                return Some(make_response(request, ResponseCode::NXDomain));
            };
            if !engine.check_policy(&host) {
                debug!(%fqdn, "admission denied, dropping query");
                return None;
            }
        }

        if service.carriergrade {
            return self.resolve_carriergrade(request, &fqdn, &host_fqdn, host_ipv4, wan_client, &service).await;
        }

        match wan_client {
            // LAN side never allocates from the pool; it answers with the host's
            // own address directly (§4.4, the non-carrier-grade LAN-SOA branch).
            None => Some(make_response_answer_a(request, &fqdn, host_ipv4, 30)),
            Some(client_ip) => self.allocate_and_answer(request, &fqdn, &host_fqdn, host_ipv4, client_ip, &service).await,
        }
    }

    async fn allocate_and_answer(
        &self,
        request: &Message,
        fqdn: &str,
        host_fqdn: &str,
        private_ip: Ipv4Addr,
        client_ip: std::net::IpAddr,
        service: &ServiceAttrs,
    ) -> Option<Vec<u8>> {
        let std::net::IpAddr::V4(requestor) = client_ip else {
            return Some(make_response(request, ResponseCode::ServFail));
        };
        let mut engine = self.engine.lock().await;
        let host = engine.registry.get_by_fqdn(host_fqdn)?.clone();
        match engine.allocate(&host, private_ip, requestor, fqdn, service) {
            Ok(ip) => Some(make_response_answer_a(request, fqdn, ip, 0)),
            Err(e) => {
                warn!(%fqdn, %e, "failed to allocate outbound address, dropping query");
                None
            }
        }
    }

    async fn resolve_carriergrade(
        &self,
        request: &Message,
        fqdn: &str,
        host_fqdn: &str,
        host_ipv4: Ipv4Addr,
        wan_client: Option<std::net::IpAddr>,
        service: &ServiceAttrs,
    ) -> Option<Vec<u8>> {
        let mut cg_query = Message::new();
        cg_query.set_id(rand::random());
        cg_query.set_message_type(MessageType::Query);
        cg_query.set_op_code(OpCode::Query);
        cg_query.set_recursion_desired(true);
        if let Some(q) = request.queries().first() {
            cg_query.add_query(q.clone());
        }

        let upstream = SocketAddr::new(host_ipv4.into(), 53);
        let wire = match query_upstream(&cg_query, upstream, &self.a_schedule).await {
            Ok(w) => w,
            Err(e) => {
                warn!(%fqdn, %host_ipv4, %e, "carrier-grade resolution failed, dropping query");
                return None;
            }
        };

        let Some(resolved_ip) = first_a_record(&wire) else {
            warn!(%fqdn, %host_ipv4, "carrier-grade resolution returned no A record, dropping query");
            return None;
        };

        let whitelist = {
            let engine = self.engine.lock().await;
            engine.registry.get_by_fqdn(host_fqdn).map(|h| h.carriergrade_whitelist.clone()).unwrap_or_default()
        };
        if !whitelist.is_empty() && !whitelist.contains(&resolved_ip) {
            warn!(%fqdn, %resolved_ip, "carrier-grade address not in whitelist, dropping query");
            return None;
        }

        match wan_client {
            None => Some(make_response_answer_a(request, fqdn, resolved_ip, 30)),
            Some(std::net::IpAddr::V4(requestor)) => {
                let mut engine = self.engine.lock().await;
                let host = engine.registry.get_by_fqdn(host_fqdn)?.clone();
                match engine.allocate(&host, resolved_ip, requestor, fqdn, service) {
                    Ok(ip) => Some(make_response_answer_a(request, fqdn, ip, 0)),
                    Err(e) => {
                        warn!(%fqdn, %e, "failed to allocate for carrier-grade resolution, dropping query");
                        None
                    }
                }
            }
            Some(_) => None,
        }
    }

    /// `dns_process_rgw_lan_nosoa`: forward to an upstream resolver, coalescing
    /// concurrent identical in-flight questions.
    async fn lan_nosoa(&self, request: &Message, qname: &str, qtype: RecordType, client: SocketAddr) -> Option<Vec<u8>> {
        let Some(upstream) = pick_resolver(&self.resolvers) else {
            warn!("no upstream resolvers configured, answering SERVFAIL");
            return Some(make_response(request, ResponseCode::ServFail));
        };

        let key = QueryKey { id: request.id(), qname: qname.to_string(), qtype: u16::from(qtype), client };
        match self.active.join(key.clone()).await {
            Slot::Follow(rx) => {
                let wire = rx.await.ok()?;
                Some(rewrite_id((*wire).clone(), request.id()))
            }
            Slot::Lead => {
                let result = query_upstream(request, upstream, &self.a_schedule).await;
                let response = match result {
                    Ok(wire) => wire,
                    Err(Error::ResolutionFailure(_)) => make_response(request, ResponseCode::ServFail),
                    Err(_) => make_response(request, ResponseCode::Refused),
                };
                self.active.complete(&key, response.clone()).await;
                Some(response)
            }
        }
    }
}

fn iface_label(iface: Iface) -> &'static str {
    match iface {
        Iface::Lan => "lan",
        Iface::Wan => "wan",
    }
}

fn rewrite_id(mut wire: Vec<u8>, id: u16) -> Vec<u8> {
    if wire.len() >= 2 {
        wire[0..2].copy_from_slice(&id.to_be_bytes());
    }
    wire
}

/// Build a response shell, carrying the request's EDNS record (and whatever
/// options it holds — `ECS`, `ECI`, `ECID`, ...) through unchanged. EDNS is
/// transport metadata for layers above the gateway; the core never inspects it.
fn base_response(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_authoritative(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    if let Some(edns) = request.edns() {
        response.set_edns(edns.clone());
    }
    response
}

fn make_response(request: &Message, code: ResponseCode) -> Vec<u8> {
    let mut response = base_response(request);
    response.set_response_code(code);
    response.to_bytes().unwrap_or_default()
}

fn make_response_answer_a(request: &Message, fqdn: &str, addr: Ipv4Addr, ttl: u32) -> Vec<u8> {
    let mut response = base_response(request);
    response.set_response_code(ResponseCode::NoError);
    if let Ok(name) = Name::from_str(fqdn) {
        let record = Record::from_rdata(name, ttl, RData::A(addr.into()));
        response.add_answer(record);
    }
    response.to_bytes().unwrap_or_default()
}

/// PTR is supported, not passthrough (§6): answer with the owning host's FQDN as
/// PTR rdata, matching `rdtype == 12` in `dns_process_rgw_*_soa`.
fn make_response_answer_ptr(request: &Message, qname: &str, host_fqdn: &str, ttl: u32) -> Vec<u8> {
    let mut response = base_response(request);
    response.set_response_code(ResponseCode::NoError);
    if let (Ok(name), Ok(target)) = (Name::from_str(qname), Name::from_str(host_fqdn)) {
        let record = Record::from_rdata(name, ttl, RData::PTR(target));
        response.add_answer(record);
    }
    response.to_bytes().unwrap_or_default()
}
