use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::{
    mpsc::{self, Receiver, Sender, SyncSender},
    Arc, Mutex,
};
use std::thread;

use log::*;
use rand::prelude::*;

use crate::acceptor::{Binder, TcpBinder};
use crate::config::{ClientConfig, ServerConfig};
use crate::connector::TcpConnector;
use crate::error::Error;
use crate::mux::{MuxBinder, MuxSession};
use crate::server_command::ServerCommand;
use crate::session::{Connection, DisconnectGuard, SessionHandle, SessionHandler, SessionId};
use crate::socks_session::SocksHandler;
use crate::thread::spawn_thread;
use crate::tunnel_session::TunnelHandler;

/// Accepts connections on `addr` and serves each one on its own thread.
pub struct Server<B: Binder, H> {
    addr: SocketAddr,
    tx_cmd: Sender<ServerCommand<B::Conn>>,
    rx_cmd: Receiver<ServerCommand<B::Conn>>,
    /// bind server address
    binder: B,
    /// send termination message to the acceptor
    tx_acceptor_done: SyncSender<()>,
    handler: Arc<H>,
    session: HashMap<SessionId, SessionHandle>,
    /// random context for generating SessionIds
    id_rng: StdRng,
}

/// Tunnel server: every accepted connection is a multiplexed session.
pub type TunnelServer = Server<MuxBinder, TunnelHandler<TcpConnector>>;

/// SOCKS5 front-end relaying through a tunnel server.
pub type SocksServer = Server<TcpBinder, SocksHandler<TcpConnector>>;

impl TunnelServer {
    pub fn new(
        config: &ServerConfig,
    ) -> Result<(Self, Sender<ServerCommand<MuxSession>>), Error> {
        let (tx_done, rx_done) = mpsc::sync_channel(1);
        let binder = MuxBinder::new(
            TcpBinder::new(None, Arc::new(Mutex::new(rx_done)), config.accept_timeout),
            config.obfuscator()?,
        );
        let handler = TunnelHandler::from_config(config)?;
        Ok(Server::with_binder(
            config.server_addr(),
            binder,
            tx_done,
            handler,
        ))
    }
}

impl SocksServer {
    /// Fails when the tunnel server rejects the handshake.
    pub fn new(config: &ClientConfig) -> Result<(Self, Sender<ServerCommand<TcpStream>>), Error> {
        let (tx_done, rx_done) = mpsc::sync_channel(1);
        let binder = TcpBinder::new(None, Arc::new(Mutex::new(rx_done)), config.accept_timeout);
        let handler = SocksHandler::from_config(config)?;
        Ok(Server::with_binder(config.listen, binder, tx_done, handler))
    }
}

/// spawn a thread send accepted connections to `tx`
fn spawn_acceptor<C>(
    acceptor: impl Iterator<Item = (C, SocketAddr)> + Send + 'static,
    tx: Sender<ServerCommand<C>>,
) -> Result<thread::JoinHandle<()>, Error>
where
    C: Send + 'static,
{
    use ServerCommand::*;
    let th = spawn_thread("acceptor", move || {
        for (conn, addr) in acceptor {
            if tx.send(Connect(conn, addr)).is_err() {
                info!("disconnected ServerCommand chan");
                break;
            }
        }
    })?;
    Ok(th)
}

impl<B, H> Server<B, H>
where
    B: Binder,
    B::Conn: Connection,
    H: SessionHandler<B::Conn>,
{
    pub fn with_binder(
        addr: SocketAddr,
        binder: B,
        tx_acceptor_done: SyncSender<()>,
        handler: H,
    ) -> (Self, Sender<ServerCommand<B::Conn>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                addr,
                tx_cmd: tx.clone(),
                rx_cmd: rx,
                binder,
                tx_acceptor_done,
                handler: Arc::new(handler),
                session: HashMap::new(),
                id_rng: StdRng::from_entropy(),
            },
            tx,
        )
    }

    fn next_session_id(&mut self) -> SessionId {
        loop {
            let next_candidate = self.id_rng.next_u32().into();
            if self.session.contains_key(&next_candidate) {
                continue;
            }
            debug!("next session id is issued: {}", next_candidate);
            return next_candidate;
        }
    }

    /// spawn a thread running the handler on `conn`
    fn spawn_session(&mut self, conn: B::Conn, addr: SocketAddr) -> Result<(), Error> {
        let id = self.next_session_id();
        let interrupter = conn.interrupter()?;
        let handler = self.handler.clone();
        let guard = DisconnectGuard::new(id, self.tx_cmd.clone());
        let th = spawn_thread(format!("session-{}", id.0), move || {
            let _guard = guard;
            handler.handle(id, conn, addr)
        })?;
        self.session
            .insert(id, SessionHandle::new(addr, th, interrupter));
        Ok(())
    }

    pub fn serve(&mut self) -> Result<(), Error> {
        let acceptor = self.binder.bind(self.addr)?;
        let accept_th = spawn_acceptor(acceptor, self.tx_cmd.clone())?;

        while let Ok(cmd) = self.rx_cmd.recv() {
            use ServerCommand::*;
            info!("cmd: {:?}", cmd);
            match cmd {
                Terminate => {
                    trace!("stopping accept thread...");
                    self.tx_acceptor_done.send(()).ok();
                    trace!("stopping session threads...");
                    self.session.iter().for_each(|(_, ss)| {
                        ss.stop().ok();
                    });

                    self.session.drain().for_each(|(_, ss)| {
                        ss.join().ok();
                    });
                    trace!("session threads are stopped");
                    accept_th.join().ok();
                    trace!("accept thread is stopped");
                    break;
                }
                Connect(conn, addr) => {
                    if let Err(err) = self.spawn_session(conn, addr) {
                        error!("session start error: {}: {}", addr, err);
                    }
                }
                Disconnect(id) => {
                    if let Some(session) = self.session.remove(&id) {
                        let addr = session.client_addr();
                        match session.join() {
                            Ok(Ok(())) => info!("session is stopped: {}: {}", id, addr),
                            Ok(Err(err)) => {
                                error!("session error: {}: {}: {}", id, addr, err);
                                trace!("session error: {}: {:?}", id, err);
                            }
                            Err(err) => error!("session panic: {}: {:?}", id, err),
                        }
                    } else {
                        debug!("session not found: {}", id);
                    }
                }
            }
        }
        info!("server shutdown");
        Ok(())
    }
}
