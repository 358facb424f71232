//! Embedded DHCPv4 responder for the guest subnet.
//!
//! Listens on the host-side veth for BOOTP-encapsulated
//! DISCOVER/REQUEST broadcasts, leases addresses from
//! `[first_host, gateway)`, and reports every acknowledged lease on the
//! IP-update channel so the supervisor can record the address and
//! retarget forwarder rules.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::subnet::Ipv4Cidr;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// One acknowledged lease, sent supervisor-ward. The channel is
/// rendezvous-sized: a slow consumer pauses the responder, and DHCP
/// clients retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpUpdate {
    pub mac: String,
    pub ip: Ipv4Addr,
}

pub fn update_channel() -> (mpsc::Sender<IpUpdate>, mpsc::Receiver<IpUpdate>) {
    mpsc::channel(1)
}

pub mod wire {
    //! BOOTP frame codec: fixed 236-byte header, magic cookie, then
    //! TLV options.

    use super::*;
    use anyhow::{bail, Context};

    const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
    const BOOTREQUEST: u8 = 1;
    const BOOTREPLY: u8 = 2;

    const OPT_SUBNET_MASK: u8 = 1;
    const OPT_ROUTER: u8 = 3;
    const OPT_DNS: u8 = 6;
    const OPT_REQUESTED_IP: u8 = 50;
    const OPT_LEASE_TIME: u8 = 51;
    const OPT_MESSAGE_TYPE: u8 = 53;
    const OPT_SERVER_ID: u8 = 54;
    const OPT_END: u8 = 255;
    const OPT_PAD: u8 = 0;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MessageType {
        Discover,
        Offer,
        Request,
        Decline,
        Ack,
        Nak,
        Release,
        Inform,
    }

    impl MessageType {
        fn from_u8(v: u8) -> Option<Self> {
            Some(match v {
                1 => MessageType::Discover,
                2 => MessageType::Offer,
                3 => MessageType::Request,
                4 => MessageType::Decline,
                5 => MessageType::Ack,
                6 => MessageType::Nak,
                7 => MessageType::Release,
                8 => MessageType::Inform,
                _ => return None,
            })
        }

        fn as_u8(self) -> u8 {
            match self {
                MessageType::Discover => 1,
                MessageType::Offer => 2,
                MessageType::Request => 3,
                MessageType::Decline => 4,
                MessageType::Ack => 5,
                MessageType::Nak => 6,
                MessageType::Release => 7,
                MessageType::Inform => 8,
            }
        }
    }

    /// The parts of a client request the responder acts on.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BootRequest {
        pub xid: u32,
        pub mac: [u8; 6],
        pub message_type: MessageType,
        pub requested_ip: Option<Ipv4Addr>,
    }

    pub fn parse(buf: &[u8]) -> anyhow::Result<BootRequest> {
        if buf.len() < 240 {
            bail!("frame too short ({} bytes)", buf.len());
        }
        if buf[0] != BOOTREQUEST {
            bail!("not a BOOTREQUEST (op={})", buf[0]);
        }
        if buf[1] != 1 || buf[2] != 6 {
            bail!("unsupported hardware type/length ({}/{})", buf[1], buf[2]);
        }
        if buf[236..240] != MAGIC_COOKIE {
            bail!("missing DHCP magic cookie");
        }

        let xid = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let mac: [u8; 6] = buf[28..34].try_into().unwrap();

        let mut message_type = None;
        let mut requested_ip = None;
        let mut i = 240;
        while i < buf.len() {
            let code = buf[i];
            if code == OPT_PAD {
                i += 1;
                continue;
            }
            if code == OPT_END {
                break;
            }
            let len = *buf.get(i + 1).context("truncated option header")? as usize;
            let data = buf
                .get(i + 2..i + 2 + len)
                .context("truncated option data")?;
            match code {
                OPT_MESSAGE_TYPE if len == 1 => message_type = MessageType::from_u8(data[0]),
                OPT_REQUESTED_IP if len == 4 => {
                    requested_ip = Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
                }
                _ => {}
            }
            i += 2 + len;
        }

        Ok(BootRequest {
            xid,
            mac,
            message_type: message_type.context("no message type option")?,
            requested_ip,
        })
    }

    /// Server-side reply parameters.
    #[derive(Debug, Clone)]
    pub struct BootReply {
        pub xid: u32,
        pub mac: [u8; 6],
        pub message_type: MessageType,
        pub your_ip: Ipv4Addr,
        pub server_ip: Ipv4Addr,
        pub subnet_mask: Ipv4Addr,
        pub dns_servers: Vec<Ipv4Addr>,
        pub lease_secs: u32,
    }

    pub fn encode(reply: &BootReply) -> Vec<u8> {
        let mut buf = vec![0u8; 240];
        buf[0] = BOOTREPLY;
        buf[1] = 1; // ethernet
        buf[2] = 6; // MAC length
        buf[4..8].copy_from_slice(&reply.xid.to_be_bytes());
        // Broadcast flag: the client does not have an address yet.
        buf[10] = 0x80;
        buf[16..20].copy_from_slice(&reply.your_ip.octets());
        buf[20..24].copy_from_slice(&reply.server_ip.octets());
        buf[28..34].copy_from_slice(&reply.mac);
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);

        buf.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, reply.message_type.as_u8()]);
        buf.extend_from_slice(&[OPT_SERVER_ID, 4]);
        buf.extend_from_slice(&reply.server_ip.octets());

        if reply.message_type != MessageType::Nak {
            buf.extend_from_slice(&[OPT_LEASE_TIME, 4]);
            buf.extend_from_slice(&reply.lease_secs.to_be_bytes());
            buf.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
            buf.extend_from_slice(&reply.subnet_mask.octets());
            buf.extend_from_slice(&[OPT_ROUTER, 4]);
            buf.extend_from_slice(&reply.server_ip.octets());
            if !reply.dns_servers.is_empty() {
                buf.extend_from_slice(&[OPT_DNS, (reply.dns_servers.len() * 4) as u8]);
                for dns in &reply.dns_servers {
                    buf.extend_from_slice(&dns.octets());
                }
            }
        }

        buf.push(OPT_END);
        buf
    }
}

use wire::{BootReply, BootRequest, MessageType};

#[derive(Debug, Clone)]
struct Lease {
    ip: Ipv4Addr,
    expires_at: DateTime<Utc>,
}

/// MAC → IP assignments, reclaimed lazily at allocation time.
pub struct LeaseTable {
    subnet: Ipv4Cidr,
    ttl: chrono::Duration,
    leases: HashMap<[u8; 6], Lease>,
}

impl LeaseTable {
    pub fn new(subnet: Ipv4Cidr, ttl: Duration) -> Self {
        LeaseTable {
            subnet,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
            leases: HashMap::new(),
        }
    }

    /// Deterministic MAC→IP: a live lease renews in place; otherwise the
    /// lowest free address of `[first_host, gateway)` is assigned.
    pub fn allocate(&mut self, mac: [u8; 6], now: DateTime<Utc>) -> Option<Ipv4Addr> {
        if let Some(lease) = self.leases.get_mut(&mac) {
            if lease.expires_at > now {
                lease.expires_at = now + self.ttl;
                return Some(lease.ip);
            }
        }

        // Reclaim expired leases before scanning for a free address.
        self.leases.retain(|_, l| l.expires_at > now);

        let used: HashSet<Ipv4Addr> = self.leases.values().map(|l| l.ip).collect();
        let ip = self.subnet.pool().find(|ip| !used.contains(ip))?;
        self.leases.insert(
            mac,
            Lease {
                ip,
                expires_at: now + self.ttl,
            },
        );
        Some(ip)
    }

    pub fn lookup(&self, mac: [u8; 6]) -> Option<Ipv4Addr> {
        self.leases.get(&mac).map(|l| l.ip)
    }
}

fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub struct DhcpServer {
    socket: UdpSocket,
    table: LeaseTable,
    subnet: Ipv4Cidr,
    name_servers: Vec<Ipv4Addr>,
    lease_secs: u32,
    updates: mpsc::Sender<IpUpdate>,
}

impl DhcpServer {
    /// Bind UDP/67, broadcast-capable, restricted to the host-side veth.
    pub async fn bind(
        ifname: &str,
        subnet: Ipv4Cidr,
        name_servers: Vec<Ipv4Addr>,
        lease_ttl: Duration,
        updates: mpsc::Sender<IpUpdate>,
    ) -> Result<Self> {
        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", SERVER_PORT))
            .map_err(|e| Error::upstream("bind DHCP socket", e))?;
        std_socket
            .set_broadcast(true)
            .map_err(|e| Error::upstream("enable SO_BROADCAST", e))?;
        bind_to_device(&std_socket, ifname)?;
        std_socket
            .set_nonblocking(true)
            .map_err(|e| Error::upstream("set DHCP socket non-blocking", e))?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| Error::upstream("register DHCP socket", e))?;

        Ok(DhcpServer {
            socket,
            table: LeaseTable::new(subnet, lease_ttl),
            subnet,
            name_servers,
            lease_secs: lease_ttl.as_secs().min(u32::MAX as u64) as u32,
            updates,
        })
    }

    /// Serve forever. Malformed frames and send failures are logged and
    /// skipped; a lease ACK blocks until the supervisor absorbs the
    /// update event.
    pub async fn run(mut self) {
        let mut buf = [0u8; 1500];
        loop {
            let len = match self.socket.recv_from(&mut buf).await {
                Ok((len, _peer)) => len,
                Err(e) => {
                    warn!(error = %e, "DHCP recv failed");
                    continue;
                }
            };

            let Some((reply, update)) = self.respond(&buf[..len], Utc::now()) else {
                continue;
            };

            if let Err(e) = self
                .socket
                .send_to(&reply, (Ipv4Addr::BROADCAST, CLIENT_PORT))
                .await
            {
                warn!(error = %e, "DHCP send failed");
                continue;
            }

            if let Some(update) = update {
                if self.updates.send(update).await.is_err() {
                    warn!("IP-update channel closed; dropping lease event");
                }
            }
        }
    }

    /// Pure request handling: returns the encoded reply and, for an ACK,
    /// the lease event to publish.
    fn respond(&mut self, frame: &[u8], now: DateTime<Utc>) -> Option<(Vec<u8>, Option<IpUpdate>)> {
        let req = match wire::parse(frame) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "ignoring malformed DHCP frame");
                return None;
            }
        };

        match req.message_type {
            MessageType::Discover => {
                let ip = match self.table.allocate(req.mac, now) {
                    Some(ip) => ip,
                    None => {
                        warn!(mac = %format_mac(req.mac), "DHCP pool exhausted");
                        return None;
                    }
                };
                debug!(mac = %format_mac(req.mac), %ip, "DHCPOFFER");
                Some((self.reply(&req, MessageType::Offer, ip), None))
            }
            MessageType::Request => {
                let ip = match self.table.allocate(req.mac, now) {
                    Some(ip) => ip,
                    None => {
                        warn!(mac = %format_mac(req.mac), "DHCP pool exhausted");
                        return None;
                    }
                };
                // A client requesting an address we did not offer gets a NAK
                // and will restart discovery.
                if let Some(requested) = req.requested_ip {
                    if requested != ip {
                        debug!(mac = %format_mac(req.mac), %requested, assigned = %ip, "DHCPNAK");
                        return Some((
                            self.reply(&req, MessageType::Nak, Ipv4Addr::UNSPECIFIED),
                            None,
                        ));
                    }
                }
                debug!(mac = %format_mac(req.mac), %ip, "DHCPACK");
                let update = IpUpdate {
                    mac: format_mac(req.mac),
                    ip,
                };
                Some((self.reply(&req, MessageType::Ack, ip), Some(update)))
            }
            other => {
                debug!(message_type = ?other, "ignoring DHCP message");
                None
            }
        }
    }

    fn reply(&self, req: &BootRequest, message_type: MessageType, your_ip: Ipv4Addr) -> Vec<u8> {
        wire::encode(&BootReply {
            xid: req.xid,
            mac: req.mac,
            message_type,
            your_ip,
            server_ip: self.subnet.gateway(),
            subnet_mask: self.subnet.netmask(),
            dns_servers: self.name_servers.clone(),
            lease_secs: self.lease_secs,
        })
    }
}

fn bind_to_device(socket: &std::net::UdpSocket, ifname: &str) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            ifname.as_ptr() as *const libc::c_void,
            ifname.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::upstream(
            format!("bind DHCP socket to {ifname}"),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}
