//! The DHCP protocol engine.
//!
//! A single UDP listener consumes DHCPv4 packets, drives the address pool by
//! client MAC, consults the gateway health checker for the router option, and
//! records every handled packet in a bounded history ring.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Gateway, sanitize_hostname};
use crate::error::{Error, Result};
use crate::gateway::HealthChecker;
use crate::options::{DhcpOption, MessageType};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::pool::{AddressPool, Lease};
use crate::scanner::NetworkScanner;

const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;
const HISTORY_CAPACITY: usize = 1000;

/// One handled packet, kept in a bounded ring for the API.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub gateway: String,
    pub server_ip: String,
}

pub struct DhcpEngine {
    config: Arc<Config>,
    pool: Arc<AddressPool>,
    checker: Arc<HealthChecker>,
    scanner: Arc<NetworkScanner>,
    server_ip: Ipv4Addr,
    start_time: DateTime<Utc>,
    history: Mutex<VecDeque<HistoryRecord>>,
    cancel: CancellationToken,
}

impl DhcpEngine {
    /// Builds the pool, health checker and scanner for this config. Nothing
    /// is spawned until [`DhcpEngine::start_background_tasks`] /
    /// [`DhcpEngine::serve`].
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let pool = Arc::new(AddressPool::new(&config)?);
        let checker = Arc::new(HealthChecker::new(&config)?);
        let scanner = Arc::new(NetworkScanner::new(&config, Arc::clone(&pool)));
        let server_ip = detect_server_ip(&config);

        Ok(Self {
            config,
            pool,
            checker,
            scanner,
            server_ip,
            start_time: Utc::now(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn scanner(&self) -> &Arc<NetworkScanner> {
        &self.scanner
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Launches the health-check loop, the scanner loop and the pool sweeper
    /// on their own tasks, all tied to this engine's cancellation token.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let checker = Arc::clone(&self.checker);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move { checker.run(cancel).await });

        let scanner = Arc::clone(&self.scanner);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move { scanner.run(cancel).await });

        self.pool.start_cleanup_task(self.cancel.child_token());
    }

    /// Binds the UDP socket and serves packets until [`DhcpEngine::stop`].
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let socket = Arc::new(self.create_socket()?);
        info!(
            port = self.config.server.port,
            interface = %self.config.server.interface,
            server_ip = %self.server_ip,
            "DHCP engine listening"
        );

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("DHCP engine stopped");
                    return Ok(());
                }
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((size, source)) => {
                            let data = buffer[..size].to_vec();
                            let engine = Arc::clone(&self);
                            let socket = Arc::clone(&socket);
                            tokio::spawn(async move {
                                if let Err(err) = engine.handle_datagram(&data, source, &socket).await {
                                    warn!(%source, "error handling packet: {err}");
                                }
                            });
                        }
                        Err(err) => {
                            if self.cancel.is_cancelled() {
                                return Ok(());
                            }
                            error!("error receiving packet: {err}");
                        }
                    }
                }
            }
        }
    }

    /// Stops the listener and every background task. The socket closes at
    /// the next loop iteration; in-flight probes finish within their
    /// timeouts.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn create_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|err| Error::Socket(format!("failed to create socket: {err}")))?;

        socket
            .set_reuse_address(true)
            .map_err(|err| Error::Socket(format!("failed to set SO_REUSEADDR: {err}")))?;
        socket
            .set_broadcast(true)
            .map_err(|err| Error::Socket(format!("failed to set SO_BROADCAST: {err}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| Error::Socket(format!("failed to set non-blocking: {err}")))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.server.port);
        socket
            .bind(&bind_addr.into())
            .map_err(|err| Error::Socket(format!("failed to bind to {bind_addr}: {err}")))?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
            .map_err(|err| Error::Socket(format!("failed to convert to tokio socket: {err}")))
    }

    async fn handle_datagram(
        &self,
        data: &[u8],
        source: SocketAddr,
        socket: &UdpSocket,
    ) -> Result<()> {
        let packet = DhcpPacket::parse(data)?;

        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket("expected BOOTREQUEST".to_string()));
        }

        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::InvalidPacket("missing message type option".to_string()))?;

        info!("{message_type} from {} ({source})", packet.client_mac());

        if let Some(reply) = self.process(&packet, message_type).await {
            self.send_reply(&reply, &packet, socket).await?;
        }
        Ok(())
    }

    /// Dispatches one parsed packet and returns the reply, if any.
    pub async fn process(
        &self,
        packet: &DhcpPacket,
        message_type: MessageType,
    ) -> Option<DhcpPacket> {
        match message_type {
            MessageType::Discover => self.handle_discover(packet).await,
            MessageType::Request => self.handle_request(packet).await,
            MessageType::Release => {
                self.handle_release(packet).await;
                None
            }
            MessageType::Decline => {
                self.handle_decline(packet).await;
                None
            }
            MessageType::Inform => Some(self.handle_inform(packet).await),
            other => {
                warn!("ignoring {other} message");
                None
            }
        }
    }

    async fn handle_discover(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let mac = packet.client_mac();
        let hostname = packet.hostname().map(sanitize_hostname).unwrap_or_default();
        let requested = packet.requested_ip();

        let lease = match self.pool.request_ip(&mac, requested, &hostname).await {
            Ok(lease) => lease,
            Err(Error::PoolExhausted) => {
                warn!(%mac, "pool exhausted, no offer");
                return None;
            }
            Err(err) => {
                warn!(%mac, "discover failed: {err}");
                return None;
            }
        };

        let gateway = self.gateway_for(&lease).await;
        if let Some(gateway) = &gateway {
            self.pool.bind_gateway(&mac, gateway.ip).await;
        }
        let gateway_name = gateway.as_ref().map(|g| g.name.clone()).unwrap_or_default();
        self.add_history(lease.ip.to_string(), &mac, &hostname, "DISCOVER", &gateway_name)
            .await;

        info!(ip = %lease.ip, %mac, "OFFER");
        Some(self.build_reply(packet, MessageType::Offer, &lease, gateway.as_ref()))
    }

    async fn handle_request(&self, packet: &DhcpPacket) -> Option<DhcpPacket> {
        let mac = packet.client_mac();
        let hostname = packet.hostname().map(sanitize_hostname).unwrap_or_default();

        if let Some(server_id) = packet.server_identifier()
            && server_id != self.server_ip
        {
            if self.config.server.allow_any_server_ip {
                debug!(%mac, %server_id, "foreign server identifier accepted (allow_any_server_ip)");
            } else {
                info!(
                    %mac, %server_id,
                    "REQUEST is for a different server, dropping (enable allow_any_server_ip to accept)"
                );
                return None;
            }
        }

        let requested = packet.requested_ip().or_else(|| {
            (!packet.ciaddr.is_unspecified()).then_some(packet.ciaddr)
        });
        let Some(requested) = requested else {
            return Some(self.build_nak(packet, "no IP address in request"));
        };

        // An existing MAC-bound lease renews in place; the pool's IP wins
        // over whatever the client asked for.
        let lease = match self.pool.renew_by_mac(&mac, &hostname).await {
            Some(lease) => {
                if lease.ip != requested {
                    info!(
                        %mac, requested = %requested, assigned = %lease.ip,
                        "REQUEST for a different IP, answering with the assigned one"
                    );
                }
                lease
            }
            None => match self.pool.request_ip(&mac, Some(requested), &hostname).await {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(%mac, "request failed: {err}");
                    return Some(self.build_nak(packet, "no IP address available"));
                }
            },
        };

        let gateway = self.gateway_for(&lease).await;
        if let Some(gateway) = &gateway {
            self.pool.bind_gateway(&mac, gateway.ip).await;
        }
        let gateway_name = gateway.as_ref().map(|g| g.name.clone()).unwrap_or_default();
        self.add_history(lease.ip.to_string(), &mac, &hostname, "REQUEST", &gateway_name)
            .await;

        info!(ip = %lease.ip, %mac, "ACK");
        Some(self.build_reply(packet, MessageType::Ack, &lease, gateway.as_ref()))
    }

    async fn handle_release(&self, packet: &DhcpPacket) {
        let mac = packet.client_mac();
        let hostname = packet.hostname().map(sanitize_hostname).unwrap_or_default();

        self.add_history(packet.ciaddr.to_string(), &mac, &hostname, "RELEASE", "")
            .await;

        match self.pool.release_ip(&mac).await {
            Ok(()) => info!(%mac, ip = %packet.ciaddr, "RELEASE"),
            Err(err) => warn!(%mac, "release failed: {err}"),
        }
    }

    async fn handle_decline(&self, packet: &DhcpPacket) {
        let mac = packet.client_mac();
        let hostname = packet.hostname().map(sanitize_hostname).unwrap_or_default();
        let declined = packet.requested_ip();

        self.add_history(
            declined.map(|ip| ip.to_string()).unwrap_or_default(),
            &mac,
            &hostname,
            "DECLINE",
            "",
        )
        .await;

        let Some(declined) = declined else {
            warn!(%mac, "DECLINE without a requested IP");
            return;
        };

        if let Err(err) = self.pool.release_ip(&mac).await {
            debug!(%mac, "no lease to drop on decline: {err}");
        }
        self.pool.mark_conflict(declined).await;
        warn!(%mac, ip = %declined, "DECLINE, IP quarantined");
    }

    async fn handle_inform(&self, packet: &DhcpPacket) -> DhcpPacket {
        let mac = packet.client_mac();
        let hostname = packet.hostname().map(sanitize_hostname).unwrap_or_default();

        self.add_history(packet.ciaddr.to_string(), &mac, &hostname, "INFORM", "")
            .await;

        let gateway = match self.checker.pick("").await {
            Some(gateway) => Some(gateway),
            None => self.config.gateways.first().cloned(),
        };

        let mut options = vec![DhcpOption::ServerIdentifier(self.server_ip)];
        self.push_network_options(&mut options, gateway.as_ref());

        info!(%mac, "ACK (inform)");
        DhcpPacket::create_reply(
            packet,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            self.server_ip,
            options,
        )
    }

    /// Router selection: a static lease's named gateway wins, then the
    /// device's configured gateway association, then the default chain.
    /// The checker degrades gracefully, so `None` only means an empty
    /// gateway list.
    async fn gateway_for(&self, lease: &Lease) -> Option<Gateway> {
        let preferred = if lease.is_static && !lease.gateway_name.is_empty() {
            lease.gateway_name.clone()
        } else {
            self.config
                .find_device_by_mac(&lease.mac)
                .map(|device| device.gateway.clone())
                .unwrap_or_default()
        };

        match self.checker.pick(&preferred).await {
            Some(gateway) => Some(gateway),
            None => self.config.gateways.first().cloned(),
        }
    }

    fn build_reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        lease: &Lease,
        gateway: Option<&Gateway>,
    ) -> DhcpPacket {
        let mut options = vec![
            DhcpOption::ServerIdentifier(self.server_ip),
            DhcpOption::LeaseTime(lease.advertised_seconds()),
        ];
        self.push_network_options(&mut options, gateway);

        let lease_seconds = lease.advertised_seconds();
        let renewal = match self.config.network.renewal_time {
            0 => lease_seconds / 2,
            explicit => explicit,
        };
        let rebinding = match self.config.network.rebinding_time {
            0 => lease_seconds / 8 * 7,
            explicit => explicit,
        };
        options.push(DhcpOption::RenewalTime(renewal));
        options.push(DhcpOption::RebindingTime(rebinding));
        options.push(DhcpOption::BroadcastAddress(
            self.config.broadcast_address(self.server_ip),
        ));

        DhcpPacket::create_reply(request, message_type, lease.ip, self.server_ip, options)
    }

    fn push_network_options(&self, options: &mut Vec<DhcpOption>, gateway: Option<&Gateway>) {
        options.push(DhcpOption::SubnetMask(self.config.network.netmask));

        if let Some(gateway) = gateway {
            options.push(DhcpOption::Router(vec![gateway.ip]));
        }

        // Gateway-specific DNS first, then network-wide, first occurrence wins.
        let mut dns_servers: Vec<Ipv4Addr> = Vec::new();
        if let Some(gateway) = gateway {
            for server in &gateway.dns_servers {
                if !dns_servers.contains(server) {
                    dns_servers.push(*server);
                }
            }
        }
        for server in &self.config.network.dns_servers {
            if !dns_servers.contains(server) {
                dns_servers.push(*server);
            }
        }
        if !dns_servers.is_empty() {
            options.push(DhcpOption::DnsServer(dns_servers));
        }

        if !self.config.network.domain_name.is_empty() {
            options.push(DhcpOption::DomainName(self.config.network.domain_name.clone()));
        }
    }

    fn build_nak(&self, request: &DhcpPacket, message: &str) -> DhcpPacket {
        warn!(mac = %request.client_mac(), "NAK: {message}");
        DhcpPacket::create_reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            self.server_ip,
            vec![
                DhcpOption::ServerIdentifier(self.server_ip),
                DhcpOption::Message(message.to_string()),
            ],
        )
    }

    async fn send_reply(
        &self,
        reply: &DhcpPacket,
        request: &DhcpPacket,
        socket: &UdpSocket,
    ) -> Result<()> {
        let encoded = reply.encode();
        let is_nak = reply.message_type() == Some(MessageType::Nak);

        let destination = if !request.giaddr.is_unspecified() {
            SocketAddr::new(IpAddr::V4(request.giaddr), self.config.server.port)
        } else if is_nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
        } else {
            SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
        };

        socket.send_to(&encoded, destination).await?;
        Ok(())
    }

    async fn add_history(
        &self,
        ip: String,
        mac: &str,
        hostname: &str,
        action: &str,
        gateway: &str,
    ) {
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(HistoryRecord {
            ip,
            mac: mac.to_string(),
            hostname: hostname.to_string(),
            action: action.to_string(),
            timestamp: Utc::now(),
            gateway: gateway.to_string(),
            server_ip: self.server_ip.to_string(),
        });
    }

    /// Walks the ring newest-first, applying exact-match filters.
    pub async fn history(
        &self,
        limit: usize,
        mac_filter: Option<&str>,
        ip_filter: Option<&str>,
    ) -> Vec<HistoryRecord> {
        let history = self.history.lock().await;
        history
            .iter()
            .rev()
            .filter(|record| mac_filter.is_none_or(|mac| record.mac == mac))
            .filter(|record| ip_filter.is_none_or(|ip| record.ip == ip))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Detects the server's IPv4 on the configured interface, falling back to
/// the first configured gateway, then to a hard-coded last resort.
fn detect_server_ip(config: &Config) -> Ipv4Addr {
    if let Some(ip) = interface_ipv4(&config.server.interface) {
        info!(interface = %config.server.interface, %ip, "detected server IP");
        return ip;
    }

    if let Some(gateway) = config.gateways.first() {
        warn!(
            interface = %config.server.interface,
            fallback = %gateway.ip,
            "could not detect interface address, using first gateway IP"
        );
        return gateway.ip;
    }

    warn!("could not detect server IP, falling back to 192.168.1.1");
    Ipv4Addr::new(192, 168, 1, 1)
}

/// Reads the first IPv4 address of `interface` from `ip -j -4 addr show`.
fn interface_ipv4(interface: &str) -> Option<Ipv4Addr> {
    if interface.is_empty() {
        return None;
    }
    let output = std::process::Command::new("ip")
        .args(["-j", "-4", "addr", "show", "dev", interface])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    parsed
        .as_array()?
        .first()?
        .get("addr_info")?
        .as_array()?
        .first()?
        .get("local")?
        .as_str()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Binding;
    use crate::options::OptionCode;
    use crate::packet::{HLEN_ETHERNET, HTYPE_ETHERNET};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.interface = "test-iface-does-not-exist0".to_string();
        config.network.start_ip = Ipv4Addr::new(192, 168, 1, 100);
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 200);
        config.network.dns_servers = vec![Ipv4Addr::new(8, 8, 8, 8)];
        config.network.domain_name = "lan.local".to_string();
        config.gateways = vec![Gateway {
            name: "main".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 1),
            is_default: true,
            description: String::new(),
            dns_servers: Vec::new(),
        }];
        config
    }

    fn engine(config: Config) -> Arc<DhcpEngine> {
        Arc::new(DhcpEngine::new(Arc::new(config)).unwrap())
    }

    fn request_packet(
        message_type: MessageType,
        mac: [u8; 6],
        options: Vec<DhcpOption>,
    ) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);

        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0x1234_5678,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }

    fn find_router(reply: &DhcpPacket) -> Option<Ipv4Addr> {
        reply.options.iter().find_map(|option| match option {
            DhcpOption::Router(routers) => routers.first().copied(),
            _ => None,
        })
    }

    fn find_lease_time(reply: &DhcpPacket) -> Option<u32> {
        reply.options.iter().find_map(|option| match option {
            DhcpOption::LeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    fn find_nak_message(reply: &DhcpPacket) -> Option<&str> {
        reply.options.iter().find_map(|option| match option {
            DhcpOption::Message(text) => Some(text.as_str()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_fresh_allocation_flow() {
        let engine = engine(test_config());
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

        let discover = request_packet(MessageType::Discover, mac, vec![]);
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 100));

        let request = request_packet(
            MessageType::Request,
            mac,
            vec![DhcpOption::RequestedIpAddress(offer.yiaddr)],
        );
        let ack = engine.process(&request, MessageType::Request).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(ack.server_identifier(), Some(engine.server_ip()));
        assert_eq!(find_router(&ack), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(find_lease_time(&ack), Some(86400));
        assert!(
            ack.options
                .iter()
                .any(|option| matches!(option, DhcpOption::SubnetMask(_)))
        );
    }

    #[tokio::test]
    async fn test_renewal_returns_same_ip() {
        let engine = engine(test_config());
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

        let discover = request_packet(MessageType::Discover, mac, vec![]);
        let first = engine.process(&discover, MessageType::Discover).await.unwrap();
        let second = engine.process(&discover, MessageType::Discover).await.unwrap();

        assert_eq!(first.yiaddr, second.yiaddr);
    }

    #[tokio::test]
    async fn test_static_reservation_overrides_requested_ip() {
        let mut config = test_config();
        config.bindings.push(Binding {
            alias: "web".to_string(),
            mac: "aa:bb:cc:dd:ee:10".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 150),
            gateway: String::new(),
            hostname: String::new(),
        });
        let engine = engine(config);

        let discover = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x10],
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 177))],
        );
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();

        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 150));
        assert_eq!(find_lease_time(&offer), Some(365 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_decline_quarantines_ip() {
        let engine = engine(test_config());

        let victim = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];
        let discover = request_packet(MessageType::Discover, victim, vec![]);
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();
        let declined_ip = offer.yiaddr;

        let decline = request_packet(
            MessageType::Decline,
            victim,
            vec![DhcpOption::RequestedIpAddress(declined_ip)],
        );
        assert!(engine.process(&decline, MessageType::Decline).await.is_none());
        assert!(engine.pool().is_conflict(declined_ip).await);

        let next = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x03],
            vec![],
        );
        let next_offer = engine.process(&next, MessageType::Discover).await.unwrap();
        assert_ne!(next_offer.yiaddr, declined_ip);
    }

    #[tokio::test]
    async fn test_wrong_server_request_dropped() {
        let engine = engine(test_config());

        let request = request_packet(
            MessageType::Request,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x05],
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 100)),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            ],
        );
        assert!(engine.process(&request, MessageType::Request).await.is_none());
    }

    #[tokio::test]
    async fn test_allow_any_server_ip() {
        let mut config = test_config();
        config.server.allow_any_server_ip = true;
        let engine = engine(config);

        let request = request_packet(
            MessageType::Request,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x05],
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 100)),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            ],
        );
        let reply = engine.process(&request, MessageType::Request).await.unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Ack));
    }

    #[tokio::test]
    async fn test_pool_full_naks_request() {
        let mut config = test_config();
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 100);
        let engine = engine(config);

        let discover = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01],
            vec![],
        );
        engine.process(&discover, MessageType::Discover).await.unwrap();

        let request = request_packet(
            MessageType::Request,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02],
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 100))],
        );
        let reply = engine.process(&request, MessageType::Request).await.unwrap();

        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(find_nak_message(&reply).unwrap().contains("no IP"));
    }

    #[tokio::test]
    async fn test_pool_full_discover_is_silent() {
        let mut config = test_config();
        config.network.end_ip = Ipv4Addr::new(192, 168, 1, 100);
        let engine = engine(config);

        let first = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01],
            vec![],
        );
        engine.process(&first, MessageType::Discover).await.unwrap();

        let second = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02],
            vec![],
        );
        assert!(engine.process(&second, MessageType::Discover).await.is_none());
    }

    #[tokio::test]
    async fn test_request_with_mismatched_ip_keeps_pool_ip() {
        let engine = engine(test_config());
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

        let discover = request_packet(MessageType::Discover, mac, vec![]);
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();

        let request = request_packet(
            MessageType::Request,
            mac,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 199))],
        );
        let ack = engine.process(&request, MessageType::Request).await.unwrap();

        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let engine = engine(test_config());
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

        let discover = request_packet(MessageType::Discover, mac, vec![]);
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();

        let mut release = request_packet(MessageType::Release, mac, vec![]);
        release.ciaddr = offer.yiaddr;
        assert!(engine.process(&release, MessageType::Release).await.is_none());

        assert!(engine.pool().get_lease(offer.yiaddr).await.is_none());
    }

    #[tokio::test]
    async fn test_inform_carries_options_without_assignment() {
        let engine = engine(test_config());
        let mut inform = request_packet(
            MessageType::Inform,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x07],
            vec![],
        );
        inform.ciaddr = Ipv4Addr::new(192, 168, 1, 50);

        let ack = engine.process(&inform, MessageType::Inform).await.unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(find_router(&ack), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(
            ack.options
                .iter()
                .any(|option| matches!(option, DhcpOption::DnsServer(_)))
        );
    }

    #[tokio::test]
    async fn test_dns_merge_prefers_gateway_servers() {
        let mut config = test_config();
        config.gateways[0].dns_servers =
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];
        let engine = engine(config);

        let discover = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01],
            vec![],
        );
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();

        let dns = offer
            .options
            .iter()
            .find_map(|option| match option {
                DhcpOption::DnsServer(servers) => Some(servers.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            dns,
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
        );
    }

    #[tokio::test]
    async fn test_device_gateway_association() {
        let mut config = test_config();
        config.gateways.push(Gateway {
            name: "vpn".to_string(),
            ip: Ipv4Addr::new(192, 168, 1, 2),
            is_default: false,
            description: String::new(),
            dns_servers: Vec::new(),
        });
        config.devices.push(crate::config::Device {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            gateway: "vpn".to_string(),
            ..crate::config::Device::default()
        });
        let engine = engine(config);

        let discover = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01],
            vec![],
        );
        let offer = engine.process(&discover, MessageType::Discover).await.unwrap();
        assert_eq!(find_router(&offer), Some(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[tokio::test]
    async fn test_history_recording_and_filters() {
        let engine = engine(test_config());

        for index in 1..=3u8 {
            let discover = request_packet(
                MessageType::Discover,
                [0xaa, 0xbb, 0xcc, 0xdd, 0xee, index],
                vec![],
            );
            engine.process(&discover, MessageType::Discover).await;
        }

        let all = engine.history(10, None, None).await;
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].mac, "aa:bb:cc:dd:ee:03");
        assert_eq!(all[0].action, "DISCOVER");
        assert_eq!(all[0].gateway, "main");

        let filtered = engine.history(10, Some("aa:bb:cc:dd:ee:02"), None).await;
        assert_eq!(filtered.len(), 1);

        let by_ip = engine.history(10, None, Some("192.168.1.100")).await;
        assert_eq!(by_ip.len(), 1);
        assert_eq!(by_ip[0].mac, "aa:bb:cc:dd:ee:01");

        let limited = engine.history(2, None, None).await;
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_server_ip_falls_back_to_first_gateway() {
        let engine = engine(test_config());
        assert_eq!(engine.server_ip(), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[tokio::test]
    async fn test_server_ip_last_resort() {
        let mut config = test_config();
        config.gateways.clear();
        let engine = engine(config);
        assert_eq!(engine.server_ip(), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_reply_padding_constant() {
        let packet = request_packet(
            MessageType::Discover,
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01],
            vec![],
        );
        let encoded = packet.encode();
        assert!(encoded.len() >= 300);
        assert_eq!(encoded[encoded.len() - 1], 0);
        assert!(encoded.contains(&(OptionCode::End as u8)));
    }
}
