use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{
    mpsc::{self, Receiver},
    Arc, Mutex,
};
use std::time::Duration;

use log::*;

use crate::model::Error;
use crate::tcp_listener_ext::*;

pub struct TcpAcceptor {
    listener: TcpListener,
    rw_timeout: Option<Duration>,
    /// receive termination message
    rx: Arc<Mutex<Receiver<()>>>,
    /// timeout for accept
    accept_timeout: Option<Duration>,
}

impl TcpAcceptor {
    fn new(
        listener: TcpListener,
        rw_timeout: Option<Duration>,
        rx: Arc<Mutex<Receiver<()>>>,
        accept_timeout: Option<Duration>,
    ) -> Self {
        Self {
            listener,
            rw_timeout,
            rx,
            accept_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept_timeout(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener
            .accept_timeout(self.accept_timeout)
            .and_then(|(tcp, addr)| {
                tcp.set_read_timeout(self.rw_timeout)?;
                tcp.set_write_timeout(self.rw_timeout)?;
                Ok((tcp, addr))
            })
    }
}

fn check_message(rx: &Arc<Mutex<Receiver<()>>>) -> Result<bool, Error> {
    use mpsc::TryRecvError;
    match rx.lock()?.try_recv() {
        Ok(()) => Ok(true),
        Err(TryRecvError::Empty) => Ok(false),
        Err(TryRecvError::Disconnected) => Err(Error::disconnected("acceptor")),
    }
}

macro_rules! check_done {
    ($rx:expr) => {
        match check_message($rx) {
            Ok(true) => return None,
            Ok(false) => {}
            Err(_) => return None,
        }
    };
}

impl Iterator for TcpAcceptor {
    type Item = (TcpStream, SocketAddr);
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            check_done!(&self.rx);
            match self.accept_timeout() {
                Ok(x) => return Some(x),
                Err(err)
                    if err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("accept error: {}", err);
                    trace!("accept error: {:?}", err);
                    return None;
                }
            }
        }
    }
}

/// Listens on an address and yields accepted connections.
pub trait Binder {
    type Conn: Send + 'static;
    type Iter: Iterator<Item = (Self::Conn, SocketAddr)> + Send + 'static;
    fn bind(&self, addr: SocketAddr) -> Result<Self::Iter, Error>;
}

pub struct TcpBinder {
    rw_timeout: Option<Duration>,
    /// receiver for Acceptor termination message
    rx: Arc<Mutex<Receiver<()>>>,
    accept_timeout: Option<Duration>,
}

impl TcpBinder {
    pub fn new(
        rw_timeout: Option<Duration>,
        rx: Arc<Mutex<Receiver<()>>>,
        accept_timeout: Option<Duration>,
    ) -> Self {
        Self {
            rw_timeout,
            rx,
            accept_timeout,
        }
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<TcpAcceptor, Error> {
        let tcp = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        tcp.set_reuse_address(true)
            .map_err(|err| addr_error(err, addr))?;
        tcp.bind(&addr.into())
            .map_err(|err| addr_error(err, addr))?;

        // `backlog` is passed to listen(2) as is.
        // Too small a value makes clients fail to connect(2) under load,
        // so it is sized like the `net.core.somaxconn` kernel parameter.
        tcp.listen(256)?;
        info!("listening on {}", addr);

        Ok(TcpAcceptor::new(
            tcp.into(),
            self.rw_timeout,
            self.rx.clone(),
            self.accept_timeout,
        ))
    }
}

impl Binder for TcpBinder {
    type Conn = TcpStream;
    type Iter = TcpAcceptor;
    fn bind(&self, addr: SocketAddr) -> Result<Self::Iter, Error> {
        TcpBinder::bind(self, addr)
    }
}

fn addr_error(io_err: io::Error, addr: SocketAddr) -> Error {
    match io_err.kind() {
        io::ErrorKind::AddrInUse => Error::AddressAlreadInUse { addr },
        io::ErrorKind::AddrNotAvailable => Error::AddressNotAvailable { addr },
        _ => Error::Io(io_err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    fn binder() -> (TcpBinder, mpsc::SyncSender<()>) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            TcpBinder::new(
                None,
                Arc::new(Mutex::new(rx)),
                Some(Duration::from_millis(100)),
            ),
            tx,
        )
    }

    #[test]
    fn address_in_use() {
        let (binder, _tx) = binder();
        let acceptor = binder.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        // SO_REUSEADDR does not allow two listeners on one port
        assert!(matches!(
            binder.bind(addr),
            Err(Error::AddressAlreadInUse { .. })
        ));
    }

    #[test]
    fn stop_accepting() {
        let (binder, tx) = binder();
        let mut acceptor = binder.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_strm, peer) = acceptor.next().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        let th = thread::spawn(move || acceptor.next().is_none());
        tx.send(()).unwrap();
        assert!(th.join().unwrap());
    }
}
