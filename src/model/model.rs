//! Message types exchanged by the SOCKS front-end and the tunnel.
//!
//! ```text
//! socks client      front-end         tunnel server       service
//!   |                 |                    |                  |
//!   |---------------->|                    |                  |
//!   |MethodCandidates |                    |                  |
//!   |<----------------|                    |                  |
//!   |  MethodSelection|                    |                  |
//!   |---------------->|                    |                  |
//!   |ConnectRequest   |                    |                  |
//!   |                 |------------------->|                  |
//!   |                 |ClientHello (once)  |                  |
//!   |                 |<-------------------|                  |
//!   |                 |   ServerHello      |                  |
//!   |                 |------------------->|                  |
//!   |                 |StreamRequest       |                  |
//!   |                 |<-------------------|                  |
//!   |                 |    StreamResponse  |                  |
//!   |<----------------|                    |                  |
//!   |     ConnectReply|                    |                  |
//!   .                 .                    .                  .
//!   | - - - - - - - ->| - - - - - - - - - >| - - - - - - - - >|
//!   |                      [[ Relay ]]                        |
//!   |<- - - - - - - - |< - - - - - - - - - |< - - - - - - - - |
//! ```
//!
use std::fmt;
use std::net::ToSocketAddrs;
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;
use std::time::Duration;

use derive_more::{Display, From, Into};
use serde::*;

use super::error::Error;

pub const DEFAULT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion(5);

/// Version byte leading every `ClientHello`.
pub const TUNNEL_PROTOCOL_VERSION: u8 = 1;

/// Deadline for the peer to open its control stream.
pub const PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for outbound dials performed by the tunnel server.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Version of SOCKS
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Into, From, Display)]
pub struct ProtocolVersion(u8);

/// Authentication Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum Method {
    /// No Authentication
    NoAuth,
    /// GSSAPI
    GssApi,
    /// Authenticate with a username / password
    UserPass,
    /// IANA assigned method
    IANAMethod(u8),
    /// Reserved for private method
    Private(u8),
    /// No acceptable method
    NoMethods,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MethodCandidates {
    pub version: ProtocolVersion,
    pub method: Vec<Method>,
}

impl MethodCandidates {
    pub fn new(method: &[Method]) -> Self {
        Self {
            version: DEFAULT_PROTOCOL_VERSION,
            method: method.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MethodSelection {
    pub version: ProtocolVersion,
    pub method: Method,
}

/// RFC1929 username/password sub-negotiation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPassStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

/// ip address and port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    IpAddr(IpAddr, u16),
    Domain(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Address::*;
        match self {
            IpAddr(addr, port) => write!(f, "{}", SocketAddr::new(*addr, *port)),
            Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl Address {
    /// Split `host:port` (or `[v6]:port`) into an address.
    ///
    /// A host which parses as a literal ip address always yields `Address::IpAddr`,
    /// so a domain is never derived from an ip.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let invalid = || Error::invalid_address(s);
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            (host, rest.strip_prefix(':').ok_or_else(invalid)?)
        } else {
            let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self::with_port(host, port))
    }

    fn with_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::IpAddr(ip, port),
            Err(_) => Address::Domain(host.to_owned(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IpAddr(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            Address::IpAddr(..) => None,
            Address::Domain(domain, _) => Some(domain),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::IpAddr(ip, _) => Some(*ip),
            Address::Domain(..) => None,
        }
    }

    /// Same port, another host.
    pub fn with_host(&self, host: &str) -> Self {
        Self::with_port(host, self.port())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::IpAddr(addr.ip(), addr.port())
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Address::IpAddr((*addr.ip()).into(), addr.port())
    }
}

impl From<SocketAddrV6> for Address {
    fn from(addr: SocketAddrV6) -> Self {
        Address::IpAddr((*addr.ip()).into(), addr.port())
    }
}

impl FromStr for Address {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl ToSocketAddrs for Address {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        use Address::*;
        match self {
            IpAddr(ipaddr, port) => Ok(vec![SocketAddr::new(*ipaddr, *port)].into_iter()),
            Domain(domain, port) => Ok((domain.as_str(), *port).to_socket_addrs()?),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectRequest {
    pub version: ProtocolVersion,
    pub command: Command,
    pub connect_to: Address,
}

impl ConnectRequest {
    pub fn connect_to<A>(addr: A) -> Self
    where
        Address: From<A>,
    {
        Self {
            version: DEFAULT_PROTOCOL_VERSION,
            command: Command::Connect,
            connect_to: addr.into(),
        }
    }

    pub fn udp_associate<A>(addr: A) -> Self
    where
        Address: From<A>,
    {
        Self {
            version: DEFAULT_PROTOCOL_VERSION,
            command: Command::UdpAssociate,
            connect_to: addr.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum ConnectError {
    /// general server failure
    ServerFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddrTypeNotSupported,
}

impl std::error::Error for ConnectError {}

pub type ConnectResult = std::result::Result<(), ConnectError>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectReply {
    pub version: ProtocolVersion,
    pub connect_result: ConnectResult,
    pub server_addr: Address,
}

impl ConnectReply {
    /// Replies always advertise `0.0.0.0:0` as the bound address.
    pub fn new(connect_result: ConnectResult) -> Self {
        Self {
            version: DEFAULT_PROTOCOL_VERSION,
            connect_result,
            server_addr: Address::IpAddr(Ipv4Addr::UNSPECIFIED.into(), 0),
        }
    }
}

/// Transmission rate in bytes per second, seen from the sender of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rate {
    pub send_bps: u64,
    pub recv_bps: u64,
}

impl Rate {
    pub fn new(send_bps: u64, recv_bps: u64) -> Self {
        Self { send_bps, recv_bps }
    }

    /// Turn a rate requested by a client into the server's own send/receive rate.
    ///
    /// The server sends at most what the client can receive and receives at most
    /// what the client sends, each direction further capped by `ceiling`.
    pub fn negotiate(&self, ceiling: &RateCeiling) -> Result<Rate, Error> {
        if self.send_bps == 0 || self.recv_bps == 0 {
            return Err(Error::InvalidRate { rate: *self });
        }
        let cap = |bps: u64, limit: Option<u64>| match limit {
            Some(limit) if limit > 0 => bps.min(limit),
            _ => bps,
        };
        Ok(Rate {
            send_bps: cap(self.recv_bps, ceiling.send_bps),
            recv_bps: cap(self.send_bps, ceiling.recv_bps),
        })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "send {} B/s, recv {} B/s", self.send_bps, self.recv_bps)
    }
}

/// Server side upper bound of rates. `None` (or `0`) means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateCeiling {
    #[serde(default)]
    pub send_bps: Option<u64>,
    #[serde(default)]
    pub recv_bps: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub rate: Rate,
    pub auth: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub ok: bool,
    pub rate: Rate,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub udp: bool,
    pub address: String,
}

impl StreamRequest {
    pub fn tcp<S: Into<String>>(address: S) -> Self {
        Self {
            udp: false,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamResponse {
    pub ok: bool,
    pub message: String,
}

impl StreamResponse {
    pub fn accepted() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    pub fn rejected<S: Into<String>>(message: S) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Application error code attached to a closed transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CloseCode {
    #[display(fmt = "generic")]
    Generic,
    #[display(fmt = "protocol")]
    Protocol,
    #[display(fmt = "auth")]
    Auth,
    #[display(fmt = "unknown({})", _0)]
    Other(u16),
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Generic => 0,
            CloseCode::Protocol => 1,
            CloseCode::Auth => 2,
            CloseCode::Other(c) => *c,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            0 => CloseCode::Generic,
            1 => CloseCode::Protocol,
            2 => CloseCode::Auth,
            c => CloseCode::Other(c),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_address() {
        assert_eq!(
            Address::parse("example.com:80").unwrap(),
            Address::Domain("example.com".to_owned(), 80)
        );
        assert_eq!(
            Address::parse("10.0.0.5:443").unwrap(),
            Address::IpAddr("10.0.0.5".parse().unwrap(), 443)
        );
        assert_eq!(
            Address::parse("[::1]:8080").unwrap(),
            Address::IpAddr("::1".parse().unwrap(), 8080)
        );
        for invalid in &["example.com", "::1:80", ":80", "example.com:http", "[::1]80"] {
            assert!(
                matches!(Address::parse(invalid), Err(Error::InvalidAddress { .. })),
                "{}",
                invalid
            );
        }
    }

    #[test]
    fn display_address() {
        assert_eq!(
            Address::parse("[::1]:8080").unwrap().to_string(),
            "[::1]:8080"
        );
        assert_eq!(
            Address::Domain("example.com".into(), 80).to_string(),
            "example.com:80"
        );
    }

    #[test]
    fn hijack_preserves_port() {
        let addr = Address::parse("internal.example.com:443").unwrap();
        let hijacked = addr.with_host("10.0.0.5");
        assert_eq!(hijacked.to_string(), "10.0.0.5:443");
        assert_eq!(hijacked.ip(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(
            addr.with_host("mirror.example.com"),
            Address::Domain("mirror.example.com".into(), 443)
        );
    }

    #[test]
    fn negotiate_rate() {
        let unbounded = RateCeiling::default();
        // client send 100, client recv 200
        let req = Rate::new(100, 200);
        assert_eq!(req.negotiate(&unbounded).unwrap(), Rate::new(200, 100));

        let ceiling = RateCeiling {
            send_bps: Some(150),
            recv_bps: Some(50),
        };
        assert_eq!(req.negotiate(&ceiling).unwrap(), Rate::new(150, 50));

        let loose = RateCeiling {
            send_bps: Some(1000),
            recv_bps: Some(0),
        };
        assert_eq!(req.negotiate(&loose).unwrap(), Rate::new(200, 100));

        for rate in &[Rate::new(0, 1), Rate::new(1, 0), Rate::new(0, 0)] {
            assert!(matches!(
                rate.negotiate(&ceiling),
                Err(Error::InvalidRate { .. })
            ));
        }
    }

    #[test]
    fn negotiate_is_independent_per_direction() {
        let ceilings = [None, Some(0), Some(1), Some(64), Some(u64::MAX)];
        for &send in &[1u64, 7, 64, 1 << 40] {
            for &recv in &[1u64, 9, 64, 1 << 33] {
                for &cs in &ceilings {
                    for &cr in &ceilings {
                        let ceiling = RateCeiling {
                            send_bps: cs,
                            recv_bps: cr,
                        };
                        let got = Rate::new(send, recv).negotiate(&ceiling).unwrap();
                        let lim = |v: u64, c: Option<u64>| match c {
                            Some(c) if c > 0 => v.min(c),
                            _ => v,
                        };
                        assert_eq!(got.send_bps, lim(recv, cs));
                        assert_eq!(got.recv_bps, lim(send, cr));
                    }
                }
            }
        }
    }

    #[test]
    fn close_code() {
        for code in 0..5u16 {
            assert_eq!(CloseCode::from(code).code(), code);
        }
        assert_eq!(CloseCode::from(2), CloseCode::Auth);
    }
}
