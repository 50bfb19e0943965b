use thiserror::Error;

use crate::model;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("not supported error: {0}")]
    NotSupported(String),
    #[error("not allowed error: {0}")]
    NotAllowed(String),
    #[error("address error: {0}")]
    Address(model::Error),
    #[error(transparent)]
    Protocol(model::Error),
}

impl Error {
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Error::InvalidConfig(message.into())
    }
}

impl From<model::Error> for Error {
    fn from(err: model::Error) -> Self {
        use model::Error as M;
        match err {
            M::Io(io_err) => Error::Io(io_err),
            M::AuthRejected { ref message } => Error::Auth(message.clone()),
            M::UnrecognizedUsernamePassword => Error::Auth(err.to_string()),
            M::NoAcceptableMethod | M::CommandNotSupported { .. } => {
                Error::NotSupported(err.to_string())
            }
            M::Blocked { .. } => Error::NotAllowed(err.to_string()),
            M::EmptyObfsKey => Error::InvalidConfig(err.to_string()),
            M::AddressAlreadInUse { .. }
            | M::AddressNotAvailable { .. }
            | M::InvalidAddress { .. } => Error::Address(err),
            err => Error::Protocol(err),
        }
    }
}
