//! Server side of a tunnel session.
//!
//! The first stream a client opens is the control stream carrying the
//! `ClientHello`/`ServerHello` exchange. Every later stream starts with a
//! `StreamRequest` and gets a `StreamResponse` before the relay begins.
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::*;

use crate::acl::AclLookup;
use crate::auth_service::TunnelAuthService;
use crate::byte_stream::ByteStream;
use crate::config::ServerConfig;
use crate::connector::{Connector, TcpConnector};
use crate::dispatch::{self, Dispatcher, Outbound};
use crate::model::{
    Address, CloseCode, Error, RateCeiling, ServerHello, StreamResponse, TunnelStream,
    PROTOCOL_TIMEOUT,
};
use crate::observer::{LogObserver, RequestInfo, RequestObserver};
use crate::relay;
use crate::rw_socks_stream::ReadWriteStream;
use crate::session::{SessionHandler, SessionId};
use crate::thread::spawn_thread;
use crate::transport::{CongestionFactory, TransportSession};

/// Outcome of the control stream exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Handshake {
    Accepted(Vec<u8>),
    Rejected(String),
}

/// The tunnel server has no upstream proxy: `Proxy` dials directly.
struct ServerOutbound<'a, C>(&'a C);

impl<'a, C: Connector> Outbound for ServerOutbound<'a, C> {
    type Stream = C::B;
    fn direct(&self, addr: &Address) -> Result<C::B, Error> {
        self.0.connect_byte_stream(addr).map(|(strm, _)| strm)
    }
    fn proxy(&self, addr: &Address) -> Result<C::B, Error> {
        self.direct(addr)
    }
}

/// Message sent back in a rejecting `StreamResponse`.
fn reject_message(err: &Error) -> String {
    match err {
        Error::Blocked { .. } => "blocked by ACL".to_owned(),
        Error::UnknownAction { .. } => "ACL error".to_owned(),
        err => err.to_string(),
    }
}

pub struct TunnelHandler<C> {
    ceiling: RateCeiling,
    congestion: Arc<dyn CongestionFactory>,
    auth: Arc<dyn TunnelAuthService>,
    dispatcher: Dispatcher,
    observer: Arc<dyn RequestObserver>,
    connector: C,
    idle_timeout: Option<Duration>,
    /// deadline for the control stream to open and say hello
    handshake_timeout: Duration,
}

impl<C: fmt::Debug> fmt::Debug for TunnelHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TunnelHandler")
            .field("ceiling", &self.ceiling)
            .field("congestion", &self.congestion)
            .field("dispatcher", &self.dispatcher)
            .field("connector", &self.connector)
            .field("idle_timeout", &self.idle_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TunnelHandler<TcpConnector> {
    pub fn from_config(config: &ServerConfig) -> Result<Self, crate::error::Error> {
        Ok(Self::new(
            config.rate_ceiling,
            config.congestion.factory(),
            config.auth_service(),
            config.acl()?,
            Arc::new(LogObserver),
            TcpConnector::new(None, config.dial_timeout),
        )
        .set_idle_timeout(config.idle_timeout))
    }
}

impl<C> TunnelHandler<C>
where
    C: Connector + 'static,
{
    pub fn new(
        ceiling: RateCeiling,
        congestion: Arc<dyn CongestionFactory>,
        auth: Arc<dyn TunnelAuthService>,
        acl: Arc<dyn AclLookup>,
        observer: Arc<dyn RequestObserver>,
        connector: C,
    ) -> Self {
        Self {
            ceiling,
            congestion,
            auth,
            dispatcher: Dispatcher::server(acl),
            observer,
            connector,
            idle_timeout: None,
            handshake_timeout: PROTOCOL_TIMEOUT,
        }
    }

    pub fn set_idle_timeout(mut self, dur: Option<Duration>) -> Self {
        self.idle_timeout = dur;
        self
    }

    pub fn set_handshake_timeout(mut self, dur: Duration) -> Self {
        self.handshake_timeout = dur;
        self
    }

    fn handshake<S: TransportSession>(
        &self,
        session: &S,
        control: S::Stream,
    ) -> Result<Handshake, Error> {
        // a silent client must not hold the session open
        control.set_timeout(Some(self.handshake_timeout))?;
        let mut strm = ReadWriteStream::new(control);
        let hello = strm.recv_client_hello()?;
        // zero rates are rejected before the client is authenticated
        let rate = hello.rate.negotiate(&self.ceiling)?;
        let (ok, message) =
            self.auth
                .authenticate(session.remote_addr(), &hello.auth, rate.send_bps, rate.recv_bps);
        strm.send_server_hello(&ServerHello {
            ok,
            rate,
            message: message.clone(),
        })?;
        if !ok {
            return Ok(Handshake::Rejected(message));
        }
        session.set_congestion_control(self.congestion.make(rate.send_bps))?;
        info!("client connected: {}: {}", session.remote_addr(), rate);
        Ok(Handshake::Accepted(hello.auth))
    }

    /// One stream of an established session.
    fn handle_stream<S: ByteStream + 'static>(&self, peer: SocketAddr, token: Arc<[u8]>, strm: S) {
        let mut rw = ReadWriteStream::new(strm);
        let req = match rw.recv_stream_request() {
            Ok(req) => req,
            Err(err) => {
                debug!("stream request error: {}: {}", peer, err);
                return;
            }
        };
        if req.udp {
            info!("udp request is not supported: {}: {}", peer, req.address);
            return;
        }
        let info = RequestInfo {
            peer,
            token: Some(token),
            address: req.address,
        };
        let result = self.handle_tcp(&info, rw);
        self.observer.finished(&info, result.as_ref().err());
    }

    fn handle_tcp<S: ByteStream>(
        &self,
        info: &RequestInfo,
        mut rw: ReadWriteStream<S>,
    ) -> Result<(), Error> {
        let target = match Address::parse(&info.address) {
            Ok(target) => target,
            Err(err) => {
                rw.send_stream_response(&StreamResponse::rejected("invalid address"))
                    .ok();
                return Err(err);
            }
        };
        let decision = self.dispatcher.decide(&target);
        self.observer.request(info, &decision);

        let conn = match dispatch::execute(&decision, &target, &ServerOutbound(&self.connector)) {
            Ok(conn) => conn,
            Err(err) => {
                debug!("dispatch error: {}: {}", info, err);
                rw.send_stream_response(&StreamResponse::rejected(reject_message(&err)))
                    .ok();
                return Err(err);
            }
        };
        rw.send_stream_response(&StreamResponse::accepted())?;
        let strm = rw.into_inner();
        relay::relay(&strm, &conn, self.idle_timeout)
    }
}

impl<C, S> SessionHandler<S> for TunnelHandler<C>
where
    C: Connector + 'static,
    S: TransportSession,
{
    fn handle(self: Arc<Self>, id: SessionId, session: S, addr: SocketAddr) -> Result<(), Error> {
        debug!("tunnel session: {}: {}", id, addr);
        let handshake = session
            .accept_stream(Some(self.handshake_timeout))
            .and_then(|control| self.handshake(&session, control));
        let token: Arc<[u8]> = match handshake {
            Ok(Handshake::Accepted(token)) => token.into(),
            Ok(Handshake::Rejected(message)) => {
                info!("client rejected: {}: {}", addr, message);
                session.close_with_error(CloseCode::Auth, "auth error");
                return Err(Error::AuthRejected { message });
            }
            Err(err) => {
                session.close_with_error(CloseCode::Protocol, "protocol error");
                return Err(err);
            }
        };

        loop {
            let strm = match session.accept_stream(None) {
                Ok(strm) => strm,
                Err(err) => {
                    debug!("accept stream: {}: {}", addr, err);
                    break;
                }
            };
            let handler = self.clone();
            let token = token.clone();
            if let Err(err) = spawn_thread(format!("stream-{}", id.0), move || {
                handler.handle_stream(addr, token, strm)
            }) {
                error!("spawn stream thread: {}", err);
            }
        }
        session.close_with_error(CloseCode::Generic, "");
        info!("client disconnected: {}", addr);
        Ok(())
    }
}
