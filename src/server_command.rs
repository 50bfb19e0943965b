//! Server control command
use std::fmt;
use std::net::SocketAddr;

use crate::session::SessionId;

pub enum ServerCommand<C> {
    /// stop accepting, interrupt and join every session
    Terminate,
    /// accepted connection and client address
    Connect(C, SocketAddr),
    /// sent by a session thread on exit
    Disconnect(SessionId),
}

impl<C> fmt::Debug for ServerCommand<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ServerCommand::*;
        match self {
            Terminate => write!(f, "Terminate"),
            Connect(_, addr) => write!(f, "Connect(_, {})", addr),
            Disconnect(id) => write!(f, "Disconnect({})", id),
        }
    }
}
