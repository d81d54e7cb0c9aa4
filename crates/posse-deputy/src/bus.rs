//! UDP multicast transport for the posse message channels.
//!
//! Every datagram is one JSON envelope: `{"channel": .., "payload": ..}`.
//! Subscriptions are a channel-name filter applied on receive; decoding
//! is typed per channel, so subscribers only ever see well-formed
//! payloads. Datagrams that fail to parse are dropped with a trace log.
//!
//! The socket is bound with address reuse and multicast loopback so
//! several agents on one host share a group; a sender therefore also
//! receives its own datagrams on subscribed channels and must be
//! prepared to recognize them (the discovery nonce exists for this).

use posse_common::{
    DeputyInfoMsg, DiscoverMsg, OrdersMsg, OutputMsg, DISCOVER_CHANNEL, INFO_CHANNEL,
    ORDERS_CHANNEL, OUTPUT_CHANNEL,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::str::FromStr;
use thiserror::Error;

/// Default bus: host-local multicast (ttl 0 keeps datagrams on the
/// machine; raise it to span a LAN).
pub const DEFAULT_BUS_URL: &str = "udpm://239.255.76.67:7667?ttl=0";

const MAX_DATAGRAM: usize = 65507;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid bus url [{url}]: {reason}")]
    Url { url: String, reason: String },

    #[error("bus socket: {0}")]
    Socket(#[from] std::io::Error),

    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("payload of {size} bytes exceeds the datagram limit")]
    Oversize { size: usize },
}

impl From<BusError> for posse_common::Error {
    fn from(e: BusError) -> Self {
        posse_common::Error::Bus(e.to_string())
    }
}

/// Parsed `udpm://ADDR:PORT[?ttl=N]` bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusUrl {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
}

impl Default for BusUrl {
    fn default() -> Self {
        DEFAULT_BUS_URL.parse().expect("default bus url parses")
    }
}

impl FromStr for BusUrl {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, BusError> {
        let err = |reason: &str| BusError::Url {
            url: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = s.strip_prefix("udpm://").ok_or_else(|| err("expected udpm:// scheme"))?;
        let (hostport, query) = match rest.split_once('?') {
            Some((hp, q)) => (hp, Some(q)),
            None => (rest, None),
        };
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| err("expected ADDR:PORT"))?;
        let addr: Ipv4Addr = host.parse().map_err(|_| err("bad IPv4 address"))?;
        let port: u16 = port.parse().map_err(|_| err("bad port"))?;

        let mut ttl = 0;
        if let Some(query) = query {
            for param in query.split('&') {
                match param.split_once('=') {
                    Some(("ttl", value)) => {
                        ttl = value.parse().map_err(|_| err("bad ttl"))?;
                    }
                    _ => return Err(err("unknown query parameter")),
                }
            }
        }
        Ok(BusUrl { addr, port, ttl })
    }
}

impl std::fmt::Display for BusUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "udpm://{}:{}?ttl={}", self.addr, self.port, self.ttl)
    }
}

/// A typed message received from the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Discover(DiscoverMsg),
    Info(DeputyInfoMsg),
    Orders(OrdersMsg),
    Output(OutputMsg),
}

#[derive(Serialize)]
struct EnvelopeOut<'a, T: Serialize> {
    channel: &'a str,
    payload: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    channel: String,
    payload: serde_json::Value,
}

/// Connection to the multicast bus.
pub struct Bus {
    socket: UdpSocket,
    dest: SocketAddr,
    subscriptions: HashSet<String>,
}

impl Bus {
    /// Bind and join the multicast group.
    pub fn open(url: &BusUrl) -> Result<Self, BusError> {
        let socket = open_socket(url)?;
        socket.set_nonblocking(true)?;
        Ok(Bus {
            socket,
            dest: SocketAddr::V4(SocketAddrV4::new(url.addr, url.port)),
            subscriptions: HashSet::new(),
        })
    }

    /// The socket fd, for event-loop read registration.
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn subscribe(&mut self, channel: &str) {
        self.subscriptions.insert(channel.to_string());
    }

    pub fn unsubscribe(&mut self, channel: &str) {
        self.subscriptions.remove(channel);
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    /// Serialize and send one message on `channel`.
    pub fn publish<T: Serialize>(&self, channel: &str, payload: &T) -> Result<(), BusError> {
        let bytes = serde_json::to_vec(&EnvelopeOut { channel, payload })?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(BusError::Oversize { size: bytes.len() });
        }
        self.socket.send_to(&bytes, self.dest)?;
        Ok(())
    }

    /// Drain every pending datagram and decode the subscribed ones.
    pub fn handle(&mut self) -> Vec<BusEvent> {
        let mut events = Vec::new();
        let mut buf = [0u8; 65536];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _src)) => {
                    if let Some(event) = self.decode(&buf[..len]) {
                        events.push(event);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "bus receive failed");
                    break;
                }
            }
        }
        events
    }

    fn decode(&self, bytes: &[u8]) -> Option<BusEvent> {
        let envelope: EnvelopeIn = match serde_json::from_slice(bytes) {
            Ok(env) => env,
            Err(e) => {
                tracing::trace!(error = %e, "dropping undecodable datagram");
                return None;
            }
        };
        if !self.subscriptions.contains(&envelope.channel) {
            return None;
        }
        let payload = envelope.payload;
        let decoded = match envelope.channel.as_str() {
            DISCOVER_CHANNEL => serde_json::from_value(payload).map(BusEvent::Discover),
            INFO_CHANNEL => serde_json::from_value(payload).map(BusEvent::Info),
            ORDERS_CHANNEL => serde_json::from_value(payload).map(BusEvent::Orders),
            OUTPUT_CHANNEL => serde_json::from_value(payload).map(BusEvent::Output),
            _ => return None,
        };
        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::trace!(channel = %envelope.channel, error = %e,
                    "dropping malformed payload");
                None
            }
        }
    }
}

/// Raw socket setup: SO_REUSEADDR + SO_REUSEPORT so several agents on
/// one host share the port, multicast membership with loopback enabled.
#[cfg(unix)]
fn open_socket(url: &BusUrl) -> Result<UdpSocket, BusError> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // Tear the fd down on any failure below.
        let fail = |fd: RawFd| -> BusError {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            err.into()
        };

        let one: libc::c_int = 1;
        let one_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            one_len,
        ) != 0
        {
            return Err(fail(fd));
        }
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const libc::c_void,
            one_len,
        ) != 0
        {
            return Err(fail(fd));
        }

        let mut bind_addr: libc::sockaddr_in = std::mem::zeroed();
        bind_addr.sin_family = libc::AF_INET as libc::sa_family_t;
        bind_addr.sin_port = url.port.to_be();
        bind_addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        if libc::bind(
            fd,
            &bind_addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            return Err(fail(fd));
        }

        if url.addr.is_multicast() {
            // ttl 0 means host-local: pin membership and egress to the
            // loopback interface so no multicast route is needed.
            let interface = if url.ttl == 0 {
                u32::from(Ipv4Addr::LOCALHOST).to_be()
            } else {
                libc::INADDR_ANY.to_be()
            };
            let mreq = libc::ip_mreq {
                imr_multiaddr: libc::in_addr {
                    s_addr: u32::from(url.addr).to_be(),
                },
                imr_interface: libc::in_addr { s_addr: interface },
            };
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_ADD_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
            ) != 0
            {
                return Err(fail(fd));
            }

            let egress = libc::in_addr { s_addr: interface };
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_IF,
                &egress as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
            ) != 0
            {
                return Err(fail(fd));
            }

            let loop_on: libc::c_uchar = 1;
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_LOOP,
                &loop_on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_uchar>() as libc::socklen_t,
            ) != 0
            {
                return Err(fail(fd));
            }

            let ttl = url.ttl.min(255) as libc::c_uchar;
            if libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_TTL,
                &ttl as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_uchar>() as libc::socklen_t,
            ) != 0
            {
                return Err(fail(fd));
            }
        }

        Ok(UdpSocket::from_raw_fd(fd))
    }
}
