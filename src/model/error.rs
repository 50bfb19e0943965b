use std::fmt;
use std::io;
use std::sync;

use crate::model::*;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("poisoned error: {}", _0)]
    Poisoned(String),
    #[error("disconnected channel error: {}", name)]
    Disconnected { name: String },
    #[error("message format error: {}", message)]
    MessageFormat { message: String },
    #[error("authentication error: no acceptable method")]
    NoAcceptableMethod,
    #[error("authentication error: invalid username or password")]
    UnrecognizedUsernamePassword,
    #[error("command not supported: {:?}", cmd)]
    CommandNotSupported { cmd: Command },
    #[error("unknown command: {}", code)]
    UnknownCommand { code: u8 },
    #[error("invalid address: {}", addr)]
    InvalidAddress { addr: String },
    #[error("address already in use: {}", addr)]
    AddressAlreadInUse { addr: SocketAddr },
    #[error("address not available: {}", addr)]
    AddressNotAvailable { addr: SocketAddr },
    /// rejected by external server
    #[error("connection refused: {}", addr)]
    ConnectionRefused { addr: Address },
    #[error("unsupported tunnel protocol version: {}", version)]
    UnsupportedVersion { version: u8 },
    #[error("invalid rate from client: {}", rate)]
    InvalidRate { rate: Rate },
    #[error("auth rejected: {}", message)]
    AuthRejected { message: String },
    #[error("request rejected: {}", message)]
    StreamRejected { message: String },
    #[error("session closed: {}: {}", code, reason)]
    SessionClosed { code: CloseCode, reason: String },
    #[error("timed out waiting for {}", what)]
    Timeout { what: String },
    #[error("relay idle timeout")]
    IdleTimeout,
    /// rejected by the acl
    #[error("blocked by ACL: {}", addr)]
    Blocked { addr: Address },
    #[error("unknown action {}", code)]
    UnknownAction { code: u8 },
    #[error("obfuscation key must not be empty")]
    EmptyObfsKey,
}

impl Error {
    pub fn disconnected<S: Into<String>>(name: S) -> Self {
        Self::Disconnected { name: name.into() }
    }

    pub fn message_fmt(message: fmt::Arguments) -> Self {
        Self::MessageFormat {
            message: message.to_string(),
        }
    }

    pub fn command_not_supported(cmd: Command) -> Self {
        Self::CommandNotSupported { cmd }
    }

    pub fn invalid_address<S: Into<String>>(addr: S) -> Self {
        Self::InvalidAddress { addr: addr.into() }
    }

    pub fn connection_refused(addr: Address) -> Self {
        Self::ConnectionRefused { addr }
    }

    pub fn session_closed<S: Into<String>>(code: CloseCode, reason: S) -> Self {
        Self::SessionClosed {
            code,
            reason: reason.into(),
        }
    }

    pub fn timeout<S: Into<String>>(what: S) -> Self {
        Self::Timeout { what: what.into() }
    }

    /// SOCKS reply code reported to the client for a failed request
    pub fn cerr(&self) -> ConnectError {
        use ConnectError as CErr;
        use Error::*;
        match self {
            CommandNotSupported { .. } | UnknownCommand { .. } => CErr::CommandNotSupported,
            NoAcceptableMethod | UnrecognizedUsernamePassword => CErr::ConnectionNotAllowed,
            UnknownAction { .. } => CErr::ServerFailure,
            // dial failures and blocked requests are reported alike
            Io(_)
            | InvalidAddress { .. }
            | ConnectionRefused { .. }
            | StreamRejected { .. }
            | SessionClosed { .. }
            | AuthRejected { .. }
            | Timeout { .. }
            | Blocked { .. } => CErr::HostUnreachable,
            _ => CErr::ServerFailure,
        }
    }

    /// Whether the error is a protocol violation by the peer.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::MessageFormat { .. }
                | Error::UnsupportedVersion { .. }
                | Error::InvalidRate { .. }
                | Error::CommandNotSupported { .. }
        )
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(error: sync::PoisonError<T>) -> Self {
        Error::Poisoned(error.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::Timeout { .. } | Error::IdleTimeout => {
                io::Error::new(io::ErrorKind::TimedOut, err.to_string())
            }
            err => io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }
}
