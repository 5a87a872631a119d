//! SSDP (Simple Service Discovery Protocol) client and server.
//!
//! The client binds a UDP socket to the SSDP multicast group, issues M-SEARCH bursts
//! and decodes NOTIFY/search-response datagrams into [`DeviceNotificationInfo`]. The
//! server periodically announces a device with a jittered burst-then-steady schedule
//! and answers matching M-SEARCH requests.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::SsdpError,
    http_parser::{Mode, ParseOutcome, Parser},
    urn::URN,
};

pub const SSDP_IP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;
pub const SSDP_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(SSDP_IP_ADDR, SSDP_PORT));

const SEARCH_RETRANSMIT_COUNT: usize = 5;
const CLIENT_MULTICAST_TTL: u32 = 4;
const SERVER_MULTICAST_TTL: u32 = 2;
const DEFAULT_CACHE_CONTROL_SECS: u32 = 1800;
const ANNOUNCE_BURST_COUNT: usize = 3;
const ANNOUNCE_BURST_JITTER_MIN_MS: u64 = 50;
const ANNOUNCE_BURST_JITTER_MAX_MS: u64 = 200;

/// Binds and configures a UDP socket for SSDP multicast traffic: reuse-address,
/// joined to [`SSDP_IP_ADDR`], with the given outgoing TTL.
fn bind_ssdp_socket(bind_addr: SocketAddr, ttl: u32) -> Result<std::net::UdpSocket, SsdpError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(SsdpError::Bind)?;
    socket.set_reuse_address(true).map_err(SsdpError::Bind)?;
    #[cfg(target_os = "linux")]
    socket.set_reuse_port(true).ok();
    socket.bind(&bind_addr.into()).map_err(SsdpError::Bind)?;
    socket.set_broadcast(true).map_err(SsdpError::Bind)?;
    socket
        .join_multicast_v4(&SSDP_IP_ADDR, &Ipv4Addr::UNSPECIFIED)
        .map_err(SsdpError::JoinMulticast)?;
    socket.set_multicast_ttl_v4(ttl).map_err(SsdpError::Bind)?;
    socket.set_nonblocking(true).map_err(SsdpError::Bind)?;
    Ok(socket.into())
}

/// Resolves the local outbound IPv4 address by "connecting" a UDP socket to a public
/// address without sending anything; the kernel picks the route and we read it back.
pub async fn resolve_local_addr() -> Result<std::net::IpAddr, SsdpError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(SsdpError::Bind)?;
    socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 80))
        .await
        .map_err(SsdpError::Bind)?;
    let addr = socket.local_addr().map_err(SsdpError::Bind)?;
    Ok(addr.ip())
}

/// `uuid:<guid>[::<type>]`, as carried in the `USN` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usn {
    pub device_id: Uuid,
    pub type_suffix: Option<String>,
}

impl Usn {
    pub fn device_usn(device_id: Uuid) -> Self {
        Self {
            device_id,
            type_suffix: None,
        }
    }

    pub fn with_type(device_id: Uuid, type_suffix: impl Into<String>) -> Self {
        Self {
            device_id,
            type_suffix: Some(type_suffix.into()),
        }
    }
}

impl std::fmt::Display for Usn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.type_suffix {
            Some(suffix) => write!(f, "uuid:{}::{}", self.device_id, suffix),
            None => write!(f, "uuid:{}", self.device_id),
        }
    }
}

impl std::str::FromStr for Usn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("uuid:")
            .ok_or_else(|| anyhow::anyhow!("USN missing uuid: prefix"))?;
        match rest.split_once("::") {
            Some((uuid_part, type_part)) => Ok(Self {
                device_id: uuid_part.parse()?,
                type_suffix: Some(type_part.to_string()),
            }),
            None => Ok(Self {
                device_id: rest.parse()?,
                type_suffix: None,
            }),
        }
    }
}

/// Parses a strict `max-age=<digits>` `CACHE-CONTROL` value. Any deviation — different
/// casing of the directive, a sign, a decimal point, trailing garbage — is rejected.
pub fn parse_cache_control(value: &str) -> anyhow::Result<u32> {
    let digits = value
        .strip_prefix("max-age=")
        .ok_or_else(|| anyhow::anyhow!("expected max-age=<n>, got {value:?}"))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!("max-age value is not an unsigned integer: {digits:?}");
    }
    digits
        .parse::<u32>()
        .map_err(|e| anyhow::anyhow!("max-age overflow: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Alive,
    ByeBye,
}

/// Decoded SSDP notification or search response.
#[derive(Debug, Clone)]
pub struct DeviceNotificationInfo {
    pub device_id: Uuid,
    pub device_type: String,
    pub location: Option<String>,
    pub expiration_time: Option<u32>,
    pub notification: Notification,
}

/// Parses one self-contained SSDP datagram (NOTIFY or M-SEARCH response) into a
/// [`DeviceNotificationInfo`]. Request-mode M-SEARCH datagrams are rejected here;
/// the server side parses those separately since it cares about different fields.
pub fn parse_client_datagram(datagram: &[u8]) -> anyhow::Result<DeviceNotificationInfo> {
    let mut parser = Parser::new(Mode::Both);
    let ParseOutcome::HeadersComplete { headers, .. } = parser.feed(datagram)? else {
        anyhow::bail!("datagram did not contain a complete header block");
    };

    let usn: Usn = headers
        .header("usn")
        .ok_or_else(|| anyhow::anyhow!("missing USN header"))?
        .parse()?;
    let location = headers.header("location").map(|s| s.to_string());
    let expiration_time = headers
        .header("cache-control")
        .map(parse_cache_control)
        .transpose()?;

    let (notification, device_type) = if headers.is_request() {
        let nts = headers
            .header("nts")
            .ok_or_else(|| anyhow::anyhow!("missing NTS header"))?;
        let notification = match nts {
            "ssdp:alive" => Notification::Alive,
            "ssdp:byebye" => Notification::ByeBye,
            other => anyhow::bail!("unrecognised NTS value: {other}"),
        };
        let nt = headers
            .header("nt")
            .ok_or_else(|| anyhow::anyhow!("missing NT header"))?
            .to_string();
        (notification, nt)
    } else {
        anyhow::ensure!(headers.status == Some(200), "search response status was not 200");
        let st = headers
            .header("st")
            .ok_or_else(|| anyhow::anyhow!("missing ST header"))?
            .to_string();
        (Notification::Alive, st)
    };

    Ok(DeviceNotificationInfo {
        device_id: usn.device_id,
        device_type,
        location,
        expiration_time,
        notification,
    })
}

fn compose_msearch(target: &str, mx: u64) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST:{SSDP_IP_ADDR}:{SSDP_PORT}\r\nMAN:\"ssdp:discover\"\r\nMX:{mx}\r\nST:{target}\r\n\r\n"
    )
}

/// SSDP client: binds an ephemeral UDP socket on the multicast group and can issue
/// searches and decode incoming NOTIFY/search-response traffic.
pub struct SsdpClient {
    socket: Arc<UdpSocket>,
}

impl SsdpClient {
    pub async fn bind() -> Result<Self, SsdpError> {
        let std_socket = bind_ssdp_socket(
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            CLIENT_MULTICAST_TTL,
        )?;
        let socket = UdpSocket::from_std(std_socket).map_err(SsdpError::Bind)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Sends `M-SEARCH` five times to absorb UDP loss; fire-and-forget.
    pub async fn search(&self, target: &str, mx: u64) -> Result<(), SsdpError> {
        let msg = compose_msearch(target, mx);
        for _ in 0..SEARCH_RETRANSMIT_COUNT {
            self.socket
                .send_to(msg.as_bytes(), SSDP_ADDR)
                .await
                .map_err(SsdpError::Send)?;
        }
        Ok(())
    }

    /// Runs the receive loop until `cancellation` fires, invoking `on_notification` for
    /// every datagram that decodes successfully; malformed datagrams are dropped with a
    /// warning. Callbacks are invoked in arrival order, inline on this task.
    pub async fn run(
        &self,
        cancellation: CancellationToken,
        mut on_notification: impl FnMut(DeviceNotificationInfo, SocketAddr),
    ) {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                recv = self.socket.recv_from(&mut buf) => {
                    let (n, src) = match recv {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!("ssdp client recv failed: {err}");
                            continue;
                        }
                    };
                    match parse_client_datagram(&buf[..n]) {
                        Ok(info) => on_notification(info, src),
                        Err(err) => tracing::warn!("dropping malformed ssdp datagram from {src}: {err}"),
                    }
                }
            }
        }
    }
}

/// Static description of a device this process advertises over SSDP.
#[derive(Debug, Clone)]
pub struct AdvertisedDevice {
    pub udn: Uuid,
    pub device_urn: URN,
    pub services: Vec<URN>,
    pub location: String,
    pub server_header: String,
    pub cache_control_secs: u32,
}

impl AdvertisedDevice {
    pub fn new(udn: Uuid, device_urn: URN, services: Vec<URN>, location: String) -> Self {
        Self {
            udn,
            device_urn,
            services,
            location,
            server_header: format!(
                "{}/0 UPnP/1.0 upnp-rt/{}",
                std::env::consts::OS,
                env!("CARGO_PKG_VERSION")
            ),
            cache_control_secs: DEFAULT_CACHE_CONTROL_SECS,
        }
    }
}

/// One `(NT, USN)` pair destined for either an alive-announce or a search response.
#[derive(Debug, Clone)]
struct AnnounceEntry {
    nt: String,
    usn: Usn,
}

fn announce_entries(device: &AdvertisedDevice) -> Vec<AnnounceEntry> {
    let mut entries = vec![
        AnnounceEntry {
            nt: "upnp:rootdevice".to_string(),
            usn: Usn::with_type(device.udn, "upnp:rootdevice"),
        },
        AnnounceEntry {
            nt: format!("uuid:{}", device.udn),
            usn: Usn::device_usn(device.udn),
        },
        AnnounceEntry {
            nt: device.device_urn.to_string(),
            usn: Usn::with_type(device.udn, device.device_urn.to_string()),
        },
    ];
    for service in &device.services {
        entries.push(AnnounceEntry {
            nt: service.to_string(),
            usn: Usn::with_type(device.udn, service.to_string()),
        });
    }
    entries
}

fn format_notify_alive(entry: &AnnounceEntry, device: &AdvertisedDevice) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\nHOST:{SSDP_IP_ADDR}:{SSDP_PORT}\r\nCACHE-CONTROL:max-age={}\r\nLOCATION:{}\r\nNT:{}\r\nNTS:ssdp:alive\r\nSERVER:{}\r\nUSN:{}\r\n\r\n",
        device.cache_control_secs, device.location, entry.nt, device.server_header, entry.usn
    )
}

fn format_notify_byebye(entry: &AnnounceEntry) -> String {
    format!(
        "NOTIFY * HTTP/1.1\r\nHOST:{SSDP_IP_ADDR}:{SSDP_PORT}\r\nNT:{}\r\nNTS:ssdp:byebye\r\nUSN:{}\r\n\r\n",
        entry.nt, entry.usn
    )
}

fn format_search_response(entry: &AnnounceEntry, device: &AdvertisedDevice) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nCACHE-CONTROL:max-age={}\r\nEXT:\r\nLOCATION:{}\r\nSERVER:{}\r\nST:{}\r\nUSN:{}\r\n\r\n",
        device.cache_control_secs, device.location, device.server_header, entry.nt, entry.usn
    )
}

/// Runs the SSDP server for `device` until `cancellation` fires: announces on a
/// jittered burst-then-steady schedule, answers M-SEARCH requests, and sends byebye
/// on shutdown.
pub struct SsdpServer {
    socket: Arc<UdpSocket>,
    device: AdvertisedDevice,
}

impl SsdpServer {
    pub async fn bind(device: AdvertisedDevice) -> Result<Self, SsdpError> {
        let std_socket = bind_ssdp_socket(
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), SSDP_PORT),
            SERVER_MULTICAST_TTL,
        )?;
        let socket = UdpSocket::from_std(std_socket).map_err(SsdpError::Bind)?;
        Ok(Self {
            socket: Arc::new(socket),
            device,
        })
    }

    async fn send_announce_set(&self) {
        for entry in announce_entries(&self.device) {
            let msg = format_notify_alive(&entry, &self.device);
            if let Err(err) = self.socket.send_to(msg.as_bytes(), SSDP_ADDR).await {
                tracing::warn!("failed to send ssdp alive announce: {err}");
            }
        }
    }

    async fn send_byebye_set(&self) {
        for entry in announce_entries(&self.device) {
            let msg = format_notify_byebye(&entry);
            if let Err(err) = self.socket.send_to(msg.as_bytes(), SSDP_ADDR).await {
                tracing::warn!("failed to send ssdp byebye announce: {err}");
            }
        }
    }

    /// Drives announce scheduling and M-SEARCH answering until cancelled, then sends
    /// byebye once, best-effort.
    pub async fn run(&self, cancellation: CancellationToken, advertise_interval: Duration) {
        self.send_announce_set().await;
        for _ in 0..ANNOUNCE_BURST_COUNT {
            let jitter = rand::rng()
                .random_range(ANNOUNCE_BURST_JITTER_MIN_MS..=ANNOUNCE_BURST_JITTER_MAX_MS);
            tokio::select! {
                _ = cancellation.cancelled() => {
                    self.send_byebye_set().await;
                    return;
                }
                _ = tokio::time::sleep(Duration::from_millis(jitter)) => {
                    self.send_announce_set().await;
                }
            }
        }

        let mut interval = tokio::time::interval(advertise_interval);
        interval.tick().await; // first tick fires immediately; already announced above
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    self.send_byebye_set().await;
                    return;
                }
                _ = interval.tick() => {
                    self.send_announce_set().await;
                }
                recv = self.socket.recv_from(&mut buf) => {
                    let Ok((n, src)) = recv else { continue };
                    self.handle_datagram(&buf[..n], src).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let mut parser = Parser::new(Mode::Request);
        let Ok(ParseOutcome::HeadersComplete { headers, .. }) = parser.feed(datagram) else {
            return;
        };
        if headers.method.as_deref() != Some("M-SEARCH") {
            return;
        }
        if headers.header("man") != Some("\"ssdp:discover\"") {
            return;
        }
        let Some(st) = headers.header("st") else {
            return;
        };
        let delay = match headers.header("mx").and_then(|v| v.parse::<u64>().ok()) {
            Some(mx) => {
                let bound = mx.clamp(1, 120);
                Duration::from_secs(rand::rng().random_range(0..=bound))
            }
            None => Duration::ZERO,
        };

        let Some(responses) = self.match_search_target(st) else {
            return;
        };

        let socket = self.socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for msg in responses {
                let _ = socket.send_to(msg.as_bytes(), src).await;
            }
        });
    }

    fn match_search_target(&self, st: &str) -> Option<Vec<String>> {
        let entries = announce_entries(&self.device);
        if st == "ssdp:all" {
            return Some(
                entries
                    .iter()
                    .map(|e| format_search_response(e, &self.device))
                    .collect(),
            );
        }
        if st == "upnp:rootdevice" {
            let entry = entries.iter().find(|e| e.nt == "upnp:rootdevice")?;
            return Some(vec![format_search_response(entry, &self.device)]);
        }
        let udn_nt = format!("uuid:{}", self.device.udn);
        if st == udn_nt {
            let entry = entries.iter().find(|e| e.nt == udn_nt)?;
            return Some(vec![format_search_response(entry, &self.device)]);
        }
        if let Ok(requested) = st.parse::<URN>() {
            if let Some(kind) = requested.device_type() {
                if Some(kind) == self.device.device_urn.device_type()
                    && requested.version <= self.device.device_urn.version
                {
                    let rewritten = self.device.device_urn.with_version(requested.version);
                    let entry = AnnounceEntry {
                        nt: rewritten.to_string(),
                        usn: Usn::with_type(self.device.udn, rewritten.to_string()),
                    };
                    return Some(vec![format_search_response(&entry, &self.device)]);
                }
                return None;
            }
            if let Some(kind) = requested.service_type() {
                let matching = self
                    .device
                    .services
                    .iter()
                    .find(|s| s.service_type() == Some(kind) && requested.version <= s.version)?;
                let rewritten = matching.with_version(requested.version);
                let entry = AnnounceEntry {
                    nt: rewritten.to_string(),
                    usn: Usn::with_type(self.device.udn, rewritten.to_string()),
                };
                return Some(vec![format_search_response(&entry, &self.device)]);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urn::{DeviceType, ServiceType};

    const NOTIFY_ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
HOST:239.255.255.250:1900\r\n\
CACHE-CONTROL:max-age=60\r\n\
LOCATION:http://192.168.1.1:5000/rootDesc.xml\r\n\
NT:urn:schemas-upnp-org:device:WANDevice:1\r\n\
NTS:ssdp:alive\r\n\
USN:uuid:a37351c5-8521-4c24-a43e-5c353b9982a9::urn:schemas-upnp-org:device:WANDevice:1\r\n\
\r\n";

    #[test]
    fn parses_canonical_notify_alive() {
        let info = parse_client_datagram(NOTIFY_ALIVE.as_bytes()).unwrap();
        assert_eq!(
            info.device_id,
            Uuid::parse_str("a37351c5-8521-4c24-a43e-5c353b9982a9").unwrap()
        );
        assert_eq!(info.device_type, "urn:schemas-upnp-org:device:WANDevice:1");
        assert_eq!(info.expiration_time, Some(60));
        assert_eq!(info.notification, Notification::Alive);
        assert_eq!(
            info.location.as_deref(),
            Some("http://192.168.1.1:5000/rootDesc.xml")
        );
    }

    #[test]
    fn cache_control_parser_is_strict() {
        assert_eq!(parse_cache_control("max-age=60").unwrap(), 60);
        assert!(parse_cache_control("Max-age=0").is_err());
        assert!(parse_cache_control("max-age=five").is_err());
        assert!(parse_cache_control("max-age=5.5").is_err());
        assert!(parse_cache_control("max-age=-0").is_err());
        assert!(parse_cache_control("").is_err());
        assert!(parse_cache_control("max-age=99999999999999999999").is_err());
    }

    #[test]
    fn usn_parses_with_and_without_type_suffix() {
        let uuid = Uuid::new_v4();
        let with_type: Usn = format!("uuid:{uuid}::urn:schemas-upnp-org:service:ContentDirectory:1")
            .parse()
            .unwrap();
        assert_eq!(with_type.device_id, uuid);
        assert_eq!(
            with_type.type_suffix.as_deref(),
            Some("urn:schemas-upnp-org:service:ContentDirectory:1")
        );

        let without_type: Usn = format!("uuid:{uuid}").parse().unwrap();
        assert_eq!(without_type.device_id, uuid);
        assert_eq!(without_type.type_suffix, None);
    }

    #[tokio::test]
    async fn server_answers_matching_service_search_at_lower_version() {
        let udn = Uuid::parse_str("55076f6e-6b79-1d65-a4eb-00089be34072").unwrap();
        let device = AdvertisedDevice::new(
            udn,
            URN::device(DeviceType::MediaRenderer, 2),
            vec![
                URN::service(ServiceType::ConnectionManager, 1),
                URN::service(ServiceType::RenderingControl, 2),
            ],
            "http://127.0.0.1:0/rootdesc.xml".to_string(),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder = SsdpServer {
            socket: Arc::new(socket),
            device: device.clone(),
        };
        let responses = responder
            .match_search_target("urn:schemas-upnp-org:service:RenderingControl:1")
            .expect("should match rendering control at requested version 1");
        assert_eq!(responses.len(), 1);
        assert!(responses[0].contains(&udn.to_string()));
        assert!(responses[0].contains("RenderingControl:1"));
    }

    #[tokio::test]
    async fn server_rejects_search_for_newer_version_than_advertised() {
        let udn = Uuid::new_v4();
        let device = AdvertisedDevice::new(
            udn,
            URN::device(DeviceType::MediaServer, 1),
            vec![URN::service(ServiceType::ContentDirectory, 1)],
            "http://127.0.0.1:0/rootdesc.xml".to_string(),
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder = SsdpServer {
            socket: Arc::new(socket),
            device,
        };
        assert!(responder
            .match_search_target("urn:schemas-upnp-org:service:ContentDirectory:2")
            .is_none());
    }
}
