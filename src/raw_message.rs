//! RFC1928/RFC1929 SOCKS5 raw message types
//!
//! Each structure corresponds to a SOCKS5 packet layout.
use std::convert::{TryFrom, TryInto};
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::model;

pub const RESERVED: u8 = 0x00;

/// Version of the username/password sub-negotiation
pub const USER_PASS_VERSION: u8 = 0x01;

pub use model::ProtocolVersion;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("try from u8({value:#X}) error to {to}")]
pub struct TryFromU8Error {
    /// source value
    value: u8,
    /// target type
    to: &'static str,
}

impl TryFromU8Error {
    fn new(value: u8, to: &'static str) -> Self {
        Self { value, to }
    }
}

/// Section 6. Replies > Reply field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResponseCode {
    Success = 0x00,
    Failure = 0x01,
    RuleFailure = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

impl ResponseCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = TryFromU8Error;
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use ResponseCode::*;
        Ok(match code {
            0 => Success,
            1 => Failure,
            2 => RuleFailure,
            3 => NetworkUnreachable,
            4 => HostUnreachable,
            5 => ConnectionRefused,
            6 => TtlExpired,
            7 => CommandNotSupported,
            8 => AddrTypeNotSupported,
            c => return Err(TryFromU8Error::new(c, "ResponseCode")),
        })
    }
}

impl From<model::ConnectResult> for ResponseCode {
    fn from(res: model::ConnectResult) -> Self {
        use model::ConnectError::*;
        match res {
            Ok(()) => ResponseCode::Success,
            Err(ServerFailure) => ResponseCode::Failure,
            Err(ConnectionNotAllowed) => ResponseCode::RuleFailure,
            Err(NetworkUnreachable) => ResponseCode::NetworkUnreachable,
            Err(HostUnreachable) => ResponseCode::HostUnreachable,
            Err(ConnectionRefused) => ResponseCode::ConnectionRefused,
            Err(TtlExpired) => ResponseCode::TtlExpired,
            Err(CommandNotSupported) => ResponseCode::CommandNotSupported,
            Err(AddrTypeNotSupported) => ResponseCode::AddrTypeNotSupported,
        }
    }
}

impl From<ResponseCode> for model::ConnectResult {
    fn from(res: ResponseCode) -> Self {
        use model::ConnectError as CErr;
        use ResponseCode::*;
        match res {
            Success => Ok(()),
            Failure => Err(CErr::ServerFailure),
            RuleFailure => Err(CErr::ConnectionNotAllowed),
            NetworkUnreachable => Err(CErr::NetworkUnreachable),
            HostUnreachable => Err(CErr::HostUnreachable),
            ConnectionRefused => Err(CErr::ConnectionRefused),
            TtlExpired => Err(CErr::TtlExpired),
            CommandNotSupported => Err(CErr::CommandNotSupported),
            AddrTypeNotSupported => Err(CErr::AddrTypeNotSupported),
        }
    }
}

/// Client Authentication Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthMethod(u8);

impl AuthMethod {
    pub fn code(&self) -> u8 {
        self.0
    }
}

impl From<u8> for AuthMethod {
    fn from(code: u8) -> Self {
        AuthMethod(code)
    }
}

impl From<AuthMethod> for model::Method {
    fn from(method: AuthMethod) -> Self {
        use model::Method::*;
        match method.0 {
            0x00 => NoAuth,
            0x01 => GssApi,
            0x02 => UserPass,
            c @ 0x03..=0x7F => IANAMethod(c),
            c @ 0x80..=0xFE => Private(c),
            0xFF => NoMethods,
        }
    }
}

impl From<model::Method> for AuthMethod {
    fn from(method: model::Method) -> Self {
        use model::Method::*;
        AuthMethod(match method {
            NoAuth => 0x00,
            GssApi => 0x01,
            UserPass => 0x02,
            IANAMethod(c) | Private(c) => c,
            NoMethods => 0xFF,
        })
    }
}

/// ATYP
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddrType {
    V4 = 0x01,
    Domain = 0x03,
    V6 = 0x04,
}

impl TryFrom<u8> for AddrType {
    type Error = TryFromU8Error;
    fn try_from(n: u8) -> Result<AddrType, Self::Error> {
        match n {
            1 => Ok(AddrType::V4),
            3 => Ok(AddrType::Domain),
            4 => Ok(AddrType::V6),
            _ => Err(TryFromU8Error::new(n, "AddrType")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Addr {
    IpAddr(IpAddr),
    Domain(Vec<u8>),
}

/// SOCK5 CMD Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SockCommand {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x3,
}

impl From<SockCommand> for model::Command {
    fn from(cmd: SockCommand) -> Self {
        match cmd {
            SockCommand::Connect => model::Command::Connect,
            SockCommand::Bind => model::Command::Bind,
            SockCommand::UdpAssociate => model::Command::UdpAssociate,
        }
    }
}

impl From<model::Command> for SockCommand {
    fn from(cmd: model::Command) -> Self {
        match cmd {
            model::Command::Connect => SockCommand::Connect,
            model::Command::Bind => SockCommand::Bind,
            model::Command::UdpAssociate => SockCommand::UdpAssociate,
        }
    }
}

impl TryFrom<u8> for SockCommand {
    type Error = TryFromU8Error;
    fn try_from(n: u8) -> Result<SockCommand, Self::Error> {
        match n {
            1 => Ok(SockCommand::Connect),
            2 => Ok(SockCommand::Bind),
            3 => Ok(SockCommand::UdpAssociate),
            _ => Err(TryFromU8Error::new(n, "SockCommand")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCandidates {
    pub ver: ProtocolVersion,
    pub methods: Vec<AuthMethod>,
}

impl From<MethodCandidates> for model::MethodCandidates {
    fn from(candidates: MethodCandidates) -> Self {
        model::MethodCandidates {
            version: candidates.ver,
            method: candidates.methods.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<model::MethodCandidates> for MethodCandidates {
    fn from(candidates: model::MethodCandidates) -> Self {
        MethodCandidates {
            ver: candidates.version,
            methods: candidates.method.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelection {
    pub ver: ProtocolVersion,
    pub method: AuthMethod,
}

impl From<model::MethodSelection> for MethodSelection {
    fn from(select: model::MethodSelection) -> Self {
        MethodSelection {
            ver: select.version,
            method: select.method.into(),
        }
    }
}

impl From<MethodSelection> for model::MethodSelection {
    fn from(select: MethodSelection) -> Self {
        model::MethodSelection {
            version: select.ver,
            method: select.method.into(),
        }
    }
}

/// RFC1929 username/password request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub ver: u8,
    pub uname: Vec<u8>,
    pub passwd: Vec<u8>,
}

impl From<UserPassRequest> for model::UserPassRequest {
    fn from(req: UserPassRequest) -> Self {
        model::UserPassRequest {
            username: String::from_utf8_lossy(&req.uname).into_owned(),
            password: String::from_utf8_lossy(&req.passwd).into_owned(),
        }
    }
}

impl From<model::UserPassStatus> for u8 {
    fn from(status: model::UserPassStatus) -> Self {
        match status {
            model::UserPassStatus::Success => 0x00,
            model::UserPassStatus::Failure => 0x01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub ver: ProtocolVersion,
    pub cmd: SockCommand,
    pub rsv: u8,
    pub atyp: AddrType,
    pub dst_addr: Addr,
    pub dst_port: u16,
}

/// aux for impl TryFrom to model::Address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrTriple {
    atyp: AddrType,
    addr: Addr,
    port: u16,
}

impl AddrTriple {
    pub fn new(atyp: AddrType, addr: Addr, port: u16) -> Self {
        Self { atyp, addr, port }
    }
}

impl From<model::Address> for AddrTriple {
    fn from(addr: model::Address) -> Self {
        use model::Address as A;
        match addr {
            A::IpAddr(ip @ IpAddr::V4(_), port) => Self::new(AddrType::V4, Addr::IpAddr(ip), port),
            A::IpAddr(ip @ IpAddr::V6(_), port) => Self::new(AddrType::V6, Addr::IpAddr(ip), port),
            A::Domain(domain, port) => {
                Self::new(AddrType::Domain, Addr::Domain(domain.into_bytes()), port)
            }
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("try_from address({atyp:?}, {addr:?}, {port})")]
pub struct TryFromAddress {
    atyp: AddrType,
    addr: Addr,
    port: u16,
}

impl From<TryFromAddress> for model::Error {
    fn from(err: TryFromAddress) -> Self {
        model::Error::message_fmt(format_args!("{}", err))
    }
}

impl From<TryFromU8Error> for model::Error {
    fn from(err: TryFromU8Error) -> Self {
        model::Error::message_fmt(format_args!("{}", err))
    }
}

impl TryFrom<AddrTriple> for model::Address {
    type Error = TryFromAddress;

    fn try_from(addr: AddrTriple) -> Result<Self, Self::Error> {
        use AddrType::*;
        let AddrTriple { atyp, addr, port } = addr;
        match (atyp, addr) {
            (V4, Addr::IpAddr(addr @ IpAddr::V4(_))) => Ok(model::Address::IpAddr(addr, port)),
            (V6, Addr::IpAddr(addr @ IpAddr::V6(_))) => Ok(model::Address::IpAddr(addr, port)),
            (Domain, Addr::Domain(domain)) => Ok(model::Address::Domain(
                String::from_utf8_lossy(&domain).to_string(),
                port,
            )),
            (atyp, addr) => Err(TryFromAddress { atyp, addr, port }),
        }
    }
}

impl TryFrom<ConnectRequest> for model::ConnectRequest {
    type Error = TryFromAddress;
    fn try_from(req: ConnectRequest) -> Result<Self, Self::Error> {
        let dst = AddrTriple::new(req.atyp, req.dst_addr, req.dst_port).try_into()?;
        Ok(model::ConnectRequest {
            version: req.ver,
            command: req.cmd.into(),
            connect_to: dst,
        })
    }
}

impl From<model::ConnectRequest> for ConnectRequest {
    fn from(req: model::ConnectRequest) -> Self {
        let AddrTriple { atyp, addr, port } = req.connect_to.into();
        ConnectRequest {
            ver: req.version,
            cmd: req.command.into(),
            rsv: RESERVED,
            atyp,
            dst_addr: addr,
            dst_port: port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub ver: ProtocolVersion,
    pub rep: ResponseCode,
    pub rsv: u8,
    pub atyp: AddrType,
    pub bnd_addr: Addr,
    pub bnd_port: u16,
}

impl TryFrom<ConnectReply> for model::ConnectReply {
    type Error = TryFromAddress;
    fn try_from(rep: ConnectReply) -> Result<Self, Self::Error> {
        Ok(model::ConnectReply {
            version: rep.ver,
            connect_result: rep.rep.into(),
            server_addr: AddrTriple::new(rep.atyp, rep.bnd_addr, rep.bnd_port).try_into()?,
        })
    }
}

impl From<model::ConnectReply> for ConnectReply {
    fn from(rep: model::ConnectReply) -> Self {
        let AddrTriple { atyp, addr, port } = rep.server_addr.into();
        ConnectReply {
            ver: rep.version,
            rep: rep.connect_result.into(),
            rsv: RESERVED,
            atyp,
            bnd_addr: addr,
            bnd_port: port,
        }
    }
}
