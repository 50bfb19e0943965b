//! SOCKS5 front-end: CONNECT requests are routed by the ACL, either dialed
//! from here or relayed through the tunnel.
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;

use crate::acl::{AclDecision, AclLookup};
use crate::auth_service::AuthService;
use crate::byte_stream::{BoxedStream, ByteStream};
use crate::config::ClientConfig;
use crate::connector::{Connector, TcpConnector};
use crate::dispatch::{self, Dispatcher, Outbound};
use crate::model::{
    Address, Command, ConnectReply, Error, Method, MethodSelection, SocksStream,
    DEFAULT_PROTOCOL_VERSION,
};
use crate::mux::MuxDialer;
use crate::observer::{LogObserver, RequestInfo, RequestObserver};
use crate::relay;
use crate::rw_socks_stream::ReadWriteStream;
use crate::session::{SessionHandler, SessionId};
use crate::tunnel_client::{StreamDialer, TunnelClient};

/// `Direct` dials from this host, `Proxy` through the tunnel.
struct FrontEndOutbound<'a, C> {
    connector: &'a C,
    tunnel: &'a dyn StreamDialer,
}

impl<'a, C: Connector> Outbound for FrontEndOutbound<'a, C> {
    type Stream = BoxedStream;
    fn direct(&self, addr: &Address) -> Result<BoxedStream, Error> {
        let (strm, _) = self.connector.connect_byte_stream(addr)?;
        Ok(Box::new(strm))
    }
    fn proxy(&self, addr: &Address) -> Result<BoxedStream, Error> {
        self.tunnel.dial_tcp(addr)
    }
}

/// Bounds a whole exchange instead of each read.
///
/// Every read gets whatever is left of the deadline as its timeout.
struct Deadline<'a, S> {
    strm: &'a mut S,
    at: Option<Instant>,
}

impl<'a, S: ByteStream> Deadline<'a, S> {
    fn new(strm: &'a mut S, timeout: Option<Duration>) -> Self {
        Self {
            strm,
            at: timeout.map(|dur| Instant::now() + dur),
        }
    }
}

impl<'a, S: ByteStream> io::Read for Deadline<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(at) = self.at {
            let left = at.saturating_duration_since(Instant::now());
            if left == Duration::ZERO {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "socks negotiation timed out",
                ));
            }
            self.strm.set_timeout(Some(left))?;
        }
        self.strm.read(buf)
    }
}

impl<'a, S: ByteStream> io::Write for Deadline<'a, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.strm.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.strm.flush()
    }
}

pub struct SocksHandler<C> {
    auth: Arc<dyn AuthService>,
    dispatcher: Dispatcher,
    observer: Arc<dyn RequestObserver>,
    connector: C,
    tunnel: Arc<dyn StreamDialer>,
    /// negotiation deadline and relay idle timeout
    timeout: Option<Duration>,
}

impl<C: fmt::Debug> fmt::Debug for SocksHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SocksHandler")
            .field("method", &self.auth.method())
            .field("dispatcher", &self.dispatcher)
            .field("connector", &self.connector)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SocksHandler<TcpConnector> {
    /// Connects to the tunnel server right away.
    pub fn from_config(config: &ClientConfig) -> Result<Self, crate::error::Error> {
        let dialer = MuxDialer::new(
            config.server_addr()?,
            config.obfuscator()?,
            config.dial_timeout,
        );
        let tunnel = TunnelClient::connect(
            dialer,
            config.rate,
            config.auth.clone().unwrap_or_default().into_bytes(),
            config.congestion.factory(),
        )?;
        Ok(Self::new(
            config.auth_service(),
            config.acl()?,
            Arc::new(LogObserver),
            TcpConnector::new(None, config.dial_timeout),
            Arc::new(tunnel),
            config.tcp_timeout,
        ))
    }
}

impl<C: Connector> SocksHandler<C> {
    pub fn new(
        auth: Arc<dyn AuthService>,
        acl: Arc<dyn AclLookup>,
        observer: Arc<dyn RequestObserver>,
        connector: C,
        tunnel: Arc<dyn StreamDialer>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            auth,
            dispatcher: Dispatcher::front_end(acl),
            observer,
            connector,
            tunnel,
            timeout,
        }
    }

    fn make_session<S: ByteStream>(&self, src_addr: SocketAddr, mut src_conn: S) -> Result<(), Error> {
        let mut socks = ReadWriteStream::new(Deadline::new(&mut src_conn, self.timeout));

        let select = negotiate_auth_method(&*self.auth, &mut socks)?;
        debug!("auth method: {:?}", select);

        let req = match socks.recv_connect_request() {
            Ok(req) => req,
            Err(err @ Error::UnknownCommand { .. }) => {
                socks
                    .send_connect_reply(ConnectReply::new(Err(err.cerr())))
                    .ok();
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        debug!("connect request: {:?}", req);
        if req.command != Command::Connect {
            socks
                .send_connect_reply(ConnectReply::new(Err(
                    Error::command_not_supported(req.command).cerr()
                )))
                .ok();
            return Err(Error::command_not_supported(req.command));
        }

        let info = RequestInfo {
            peer: src_addr,
            token: None,
            address: req.connect_to.to_string(),
        };
        let decision = self.dispatcher.decide(&req.connect_to);
        self.observer.request(&info, &decision);
        let result = self.serve_request(&mut src_conn, &req.connect_to, &decision);
        self.observer.finished(&info, result.as_ref().err());
        result
    }

    fn serve_request<S: ByteStream>(
        &self,
        src_conn: &mut S,
        target: &Address,
        decision: &AclDecision,
    ) -> Result<(), Error> {
        let outbound = FrontEndOutbound {
            connector: &self.connector,
            tunnel: &*self.tunnel,
        };
        let dst_conn = match dispatch::execute(decision, target, &outbound) {
            Ok(conn) => {
                info!("connected: {}: {}", target, decision);
                ReadWriteStream::new(&mut *src_conn).send_connect_reply(ConnectReply::new(Ok(())))?;
                conn
            }
            Err(err) => {
                error!("command error: {}", err);
                trace!("command error: {:?}", err);
                ReadWriteStream::new(&mut *src_conn)
                    .send_connect_reply(ConnectReply::new(Err(err.cerr())))
                    .ok();
                return Err(err);
            }
        };
        relay::relay(&*src_conn, &dst_conn, self.timeout)
    }
}

impl<C, S> SessionHandler<S> for SocksHandler<C>
where
    C: Connector + 'static,
    S: ByteStream + 'static,
{
    fn handle(self: Arc<Self>, id: SessionId, conn: S, addr: SocketAddr) -> Result<(), Error> {
        debug!("socks session: {}: {}", id, addr);
        self.make_session(addr, conn)
    }
}

/// Offer the configured method whatever the client proposed.
///
/// A client without the method first sees "no acceptable methods" followed by
/// the real selection; clients which carry on regardless are served.
fn negotiate_auth_method<T: SocksStream>(
    auth: &dyn AuthService,
    socks: &mut T,
) -> Result<MethodSelection, Error> {
    let candidates = socks.recv_method_candidates()?;
    trace!("candidates: {:?}", candidates);

    let method_sel = MethodSelection {
        version: DEFAULT_PROTOCOL_VERSION,
        method: auth.method(),
    };
    if !candidates.method.contains(&method_sel.method) {
        debug!("no acceptable method in {:?}", candidates.method);
        socks.send_method_selection(MethodSelection {
            version: DEFAULT_PROTOCOL_VERSION,
            method: Method::NoMethods,
        })?;
    }
    socks.send_method_selection(method_sel)?;
    auth.authorize(socks)?;
    Ok(method_sel)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::acl::{Action, FixedAction, NoAcl};
    use crate::auth_service::{self, NoAuthService};
    use crate::byte_stream::test::BufferStream;
    use crate::byte_stream::{ReadHalf, WriteHalf};
    use crate::connector::test::BufferConnector;
    use crate::model::{ConnectError, ConnectRequest, MethodCandidates};
    use crate::observer::test::{Event, RecordingObserver};
    use crate::rw_socks_stream as socks;
    use std::io::{self, Read, Write};
    use std::iter::FromIterator;
    use std::str::FromStr;
    use std::sync::Mutex;

    /// hands out one prepared stream per destination
    #[derive(Default)]
    struct FakeTunnel {
        strms: Mutex<Vec<(Address, BufferStream)>>,
        dialed: Mutex<Vec<Address>>,
    }

    impl StreamDialer for FakeTunnel {
        fn dial_tcp(&self, addr: &Address) -> Result<BoxedStream, Error> {
            self.dialed.lock().unwrap().push(addr.clone());
            self.strms
                .lock()
                .unwrap()
                .iter()
                .find(|(a, _)| a == addr)
                .map(|(_, strm)| Box::new(strm.clone()) as BoxedStream)
                .ok_or_else(|| Error::StreamRejected {
                    message: "unreachable".into(),
                })
        }
    }

    type TestConnector = BufferConnector<BufferStream>;

    struct Fixture {
        handler: SocksHandler<TestConnector>,
        connector: TestConnector,
        tunnel: Arc<FakeTunnel>,
        observer: Arc<RecordingObserver>,
    }

    fn fixture(
        auth: Arc<dyn AuthService>,
        acl: Arc<dyn AclLookup>,
        connector: TestConnector,
        tunnel: FakeTunnel,
    ) -> Fixture {
        let tunnel = Arc::new(tunnel);
        let observer = Arc::new(RecordingObserver::default());
        Fixture {
            handler: SocksHandler::new(
                auth,
                acl,
                observer.clone(),
                connector.clone(),
                tunnel.clone(),
                None,
            ),
            connector,
            tunnel,
            observer,
        }
    }

    fn client_input(methods: &[Method], req: ConnectRequest, payload: &[u8]) -> (BufferStream, u64) {
        let mut cursor = io::Cursor::new(vec![]);
        socks::test::write_method_candidates(&mut cursor, MethodCandidates::new(methods)).unwrap();
        socks::test::write_connect_request(&mut cursor, req).unwrap();
        let pos = cursor.position();
        cursor.write_all(payload).unwrap();
        (
            BufferStream::with_buffer(cursor.into_inner().into(), vec![].into()),
            pos,
        )
    }

    fn peer() -> SocketAddr {
        "192.168.1.2:33333".parse().unwrap()
    }

    fn vec_from_read<T: io::Read>(mut reader: T) -> Vec<u8> {
        let mut buff = vec![];
        reader.read_to_end(&mut buff).unwrap();
        buff
    }

    #[test]
    fn proxy_by_default() {
        let connect_to = Address::Domain("example.com".into(), 5123);
        let remote = BufferStream::with_buffer(b"from remote".to_vec().into(), vec![].into());
        let tunnel = FakeTunnel::default();
        tunnel
            .strms
            .lock()
            .unwrap()
            .push((connect_to.clone(), remote.clone()));
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(NoAcl),
            TestConnector::from_iter(vec![]),
            tunnel,
        );
        let (src, pos) = client_input(
            &[Method::NoAuth],
            ConnectRequest::connect_to(connect_to.clone()),
            b"from client",
        );
        fx.handler.make_session(peer(), src.clone()).unwrap();

        src.wr_buff().set_position(0);
        assert_eq!(
            socks::test::read_method_selection(&mut *src.wr_buff()).unwrap(),
            MethodSelection {
                version: DEFAULT_PROTOCOL_VERSION,
                method: Method::NoAuth
            }
        );
        assert_eq!(
            socks::test::read_connect_reply(&mut *src.wr_buff()).unwrap(),
            ConnectReply::new(Ok(()))
        );
        // client <-- target
        assert_eq!(vec_from_read(&mut *src.wr_buff()), b"from remote");
        // client --> target
        let mut rd_buff = src.rd_buff();
        rd_buff.set_position(pos);
        assert_eq!(vec_from_read(&mut *rd_buff), remote.written());
        assert_eq!(remote.written(), b"from client");

        assert_eq!(*fx.tunnel.dialed.lock().unwrap(), vec![connect_to]);
        assert!(fx.connector.dialed().is_empty());
        let events = fx.observer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Event::Request(info, d)
            if info.token.is_none() && d.action == Action::Proxy));
        assert!(matches!(&events[1], Event::Finished(_, None)));
    }

    #[test]
    fn direct_dial() {
        let connect_to = Address::from_str("192.168.0.1:5123").unwrap();
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(FixedAction(Action::Direct)),
            TestConnector::from_iter(vec![(
                connect_to.clone(),
                Ok(BufferStream::with_buffer(b"hi".to_vec().into(), vec![].into())),
            )]),
            FakeTunnel::default(),
        );
        let (src, _) = client_input(
            &[Method::NoAuth],
            ConnectRequest::connect_to(connect_to.clone()),
            b"",
        );
        fx.handler.make_session(peer(), src.clone()).unwrap();
        assert_eq!(fx.connector.dialed(), vec![connect_to]);
        assert!(fx.tunnel.dialed.lock().unwrap().is_empty());
        assert!(src.written().ends_with(b"hi"));
    }

    #[test]
    fn blocked_never_dials() {
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(FixedAction(Action::Block)),
            TestConnector::from_iter(vec![]),
            FakeTunnel::default(),
        );
        let (src, _) = client_input(
            &[Method::NoAuth],
            ConnectRequest::connect_to(Address::Domain("ads.example.com".into(), 80)),
            b"",
        );
        assert!(matches!(
            fx.handler.make_session(peer(), src.clone()),
            Err(Error::Blocked { .. })
        ));
        src.wr_buff().set_position(2);
        assert_eq!(
            socks::test::read_connect_reply(&mut *src.wr_buff()).unwrap(),
            ConnectReply::new(Err(ConnectError::HostUnreachable))
        );
        assert!(fx.connector.dialed().is_empty());
        assert!(fx.tunnel.dialed.lock().unwrap().is_empty());
        let events = fx.observer.events();
        assert!(matches!(&events[1], Event::Finished(_, Some(_))));
    }

    #[test]
    fn unknown_action_is_server_failure() {
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(FixedAction(Action::Unknown(42))),
            TestConnector::from_iter(vec![]),
            FakeTunnel::default(),
        );
        let (src, _) = client_input(
            &[Method::NoAuth],
            ConnectRequest::connect_to(Address::from_str("10.0.0.1:80").unwrap()),
            b"",
        );
        assert!(fx.handler.make_session(peer(), src.clone()).is_err());
        src.wr_buff().set_position(2);
        assert_eq!(
            socks::test::read_connect_reply(&mut *src.wr_buff()).unwrap(),
            ConnectReply::new(Err(ConnectError::ServerFailure))
        );
    }

    #[test]
    fn command_not_supported() {
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(NoAcl),
            TestConnector::from_iter(vec![]),
            FakeTunnel::default(),
        );
        // udp is not supported
        let (src, _) = client_input(
            &[Method::NoAuth],
            ConnectRequest::udp_associate(Address::from_str("192.168.0.1:5123").unwrap()),
            b"",
        );
        assert!(matches!(
            fx.handler.make_session(peer(), src.clone()),
            Err(Error::CommandNotSupported {
                cmd: Command::UdpAssociate
            })
        ));
        src.wr_buff().set_position(2);
        assert_eq!(
            socks::test::read_connect_reply(&mut *src.wr_buff()).unwrap(),
            ConnectReply::new(Err(ConnectError::CommandNotSupported))
        );
        assert!(fx.observer.events().is_empty());
    }

    #[test]
    fn unknown_command_is_answered() {
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(NoAcl),
            TestConnector::from_iter(vec![]),
            FakeTunnel::default(),
        );
        // command 0x09 does not exist
        let src = BufferStream::with_buffer(
            vec![5, 1, 0, 5, 9, 0, 1, 1, 2, 3, 4, 0, 80].into(),
            vec![].into(),
        );
        assert!(matches!(
            fx.handler.make_session(peer(), src.clone()),
            Err(Error::UnknownCommand { code: 9 })
        ));
        let written = src.wr_buff().get_ref().clone();
        assert_eq!(&written[..2], &[5, 0]);
        assert_eq!(&written[2..4], &[5, 7]);
        src.wr_buff().set_position(2);
        assert_eq!(
            socks::test::read_connect_reply(&mut *src.wr_buff()).unwrap(),
            ConnectReply::new(Err(ConnectError::CommandNotSupported))
        );
        assert!(fx.observer.events().is_empty());
    }

    /// Hands out one byte per read, each after a pause.
    #[derive(Debug, Clone)]
    struct Trickle {
        inner: BufferStream,
        pause: Duration,
    }

    impl io::Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(self.pause);
            let len = buf.len().min(1);
            self.inner.read(&mut buf[..len])
        }
    }

    impl io::Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl ByteStream for Trickle {
        fn split(&self) -> Result<(ReadHalf, WriteHalf), Error> {
            self.inner.split()
        }

        fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn slow_negotiation_hits_deadline() {
        let connect_to = Address::from_str("192.168.0.1:5123").unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let handler = SocksHandler::new(
            Arc::new(NoAuthService::new()),
            Arc::new(NoAcl),
            observer.clone(),
            TestConnector::from_iter(vec![]),
            Arc::new(FakeTunnel::default()),
            Some(Duration::from_millis(300)),
        );
        let (src, _) = client_input(&[Method::NoAuth], ConnectRequest::connect_to(connect_to), b"");
        // every single read is quick, the negotiation as a whole is not
        let slow = Trickle {
            inner: src.clone(),
            pause: Duration::from_millis(50),
        };
        let started = Instant::now();
        match handler.make_session(peer(), slow) {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(observer.events().is_empty());
    }

    #[test]
    fn method_mismatch_continues() {
        let connect_to = Address::from_str("192.168.0.1:5123").unwrap();
        let fx = fixture(
            Arc::new(NoAuthService::new()),
            Arc::new(FixedAction(Action::Direct)),
            TestConnector::from_iter(vec![(connect_to.clone(), Ok(BufferStream::new()))]),
            FakeTunnel::default(),
        );
        let (src, _) = client_input(
            &[Method::UserPass],
            ConnectRequest::connect_to(connect_to),
            b"",
        );
        fx.handler.make_session(peer(), src.clone()).unwrap();
        assert_eq!(&src.written()[..4], &[5, 0xff, 5, 0]);
    }

    #[test]
    fn user_pass_required() {
        let connect_to = Address::from_str("192.168.0.1:5123").unwrap();
        let auth = Arc::new(auth_service::single_user("alice".into(), "s3cret".into()));
        let input = |pass: &str| {
            let mut cursor = io::Cursor::new(vec![]);
            socks::test::write_method_candidates(
                &mut cursor,
                MethodCandidates::new(&[Method::NoAuth, Method::UserPass]),
            )
            .unwrap();
            socks::test::write_user_pass(&mut cursor, "alice", pass).unwrap();
            socks::test::write_connect_request(
                &mut cursor,
                ConnectRequest::connect_to(connect_to.clone()),
            )
            .unwrap();
            BufferStream::with_buffer(cursor.into_inner().into(), vec![].into())
        };
        let fx = fixture(
            auth,
            Arc::new(FixedAction(Action::Direct)),
            TestConnector::from_iter(vec![(connect_to.clone(), Ok(BufferStream::new()))]),
            FakeTunnel::default(),
        );

        let src = input("s3cret");
        fx.handler.make_session(peer(), src.clone()).unwrap();
        // method selection, auth status, then the reply
        assert_eq!(&src.written()[..5], &[5, 2, 1, 0, 5]);

        let src = input("guess");
        assert!(matches!(
            fx.handler.make_session(peer(), src.clone()),
            Err(Error::UnrecognizedUsernamePassword)
        ));
        assert_eq!(src.written().len(), 4);
        assert_eq!(fx.connector.dialed().len(), 1);
    }
}
