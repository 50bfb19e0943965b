use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;

use log::*;

use crate::byte_stream::ByteStream;
use crate::model::Error;
use crate::server_command::ServerCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u32);

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Tears a live connection down from another thread.
pub struct Interrupter(Box<dyn Fn() -> Result<(), Error> + Send>);

impl Interrupter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Result<(), Error> + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub fn interrupt(&self) -> Result<(), Error> {
        (self.0)()
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Interrupter")
    }
}

/// Accepted connection owned by a session thread.
pub trait Connection: Send + 'static {
    fn interrupter(&self) -> Result<Interrupter, Error>;
}

impl Connection for TcpStream {
    fn interrupter(&self) -> Result<Interrupter, Error> {
        let tcp = self.try_clone()?;
        Ok(Interrupter::new(move || tcp.close()))
    }
}

/// Serves one accepted connection until it ends.
pub trait SessionHandler<C>: Send + Sync + 'static {
    fn handle(self: Arc<Self>, id: SessionId, conn: C, addr: SocketAddr) -> Result<(), Error>;
}

#[derive(Debug)]
pub struct SessionHandle {
    /// client address
    addr: SocketAddr,
    /// thread serving the session
    handle: thread::JoinHandle<Result<(), Error>>,
    interrupter: Interrupter,
}

impl SessionHandle {
    pub fn new(
        addr: SocketAddr,
        handle: thread::JoinHandle<Result<(), Error>>,
        interrupter: Interrupter,
    ) -> Self {
        Self {
            addr,
            handle,
            interrupter,
        }
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) -> Result<(), Error> {
        trace!("stop session: {}", self.addr);
        self.interrupter.interrupt()
    }

    pub fn join(self) -> thread::Result<Result<(), Error>> {
        trace!("join session: {}", self.addr);
        self.handle.join()
    }
}

/// Sends `Disconnect` to the server loop when the session thread ends.
#[derive(Debug)]
pub struct DisconnectGuard<C> {
    id: SessionId,
    tx: mpsc::Sender<ServerCommand<C>>,
}

impl<C> DisconnectGuard<C> {
    pub fn new(id: SessionId, tx: mpsc::Sender<ServerCommand<C>>) -> Self {
        Self { id, tx }
    }
}

impl<C> Drop for DisconnectGuard<C> {
    fn drop(&mut self) {
        debug!("DisconnectGuard: {}", self.id);
        // the server loop may already be gone
        self.tx.send(ServerCommand::Disconnect(self.id)).ok();
    }
}
