use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::*;

use crate::byte_stream::ByteStream;
use crate::model::{Address, Error, DIAL_TIMEOUT};

/// Dials destinations from this process.
pub trait Connector: Send + Sync {
    type B: ByteStream + 'static;
    fn connect_byte_stream(&self, addr: &Address) -> Result<(Self::B, SocketAddr), Error>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    rw_timeout: Option<Duration>,
    dial_timeout: Duration,
}

impl TcpConnector {
    pub fn new(rw_timeout: Option<Duration>, dial_timeout: Duration) -> Self {
        Self {
            rw_timeout,
            dial_timeout,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(None, DIAL_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    type B = TcpStream;
    fn connect_byte_stream(&self, addr: &Address) -> Result<(Self::B, SocketAddr), Error> {
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, self.dial_timeout) {
                Ok(strm) => {
                    strm.set_read_timeout(self.rw_timeout)?;
                    strm.set_write_timeout(self.rw_timeout)?;
                    debug!("connected: {}: {}", addr, sock_addr);
                    return Ok((strm, sock_addr));
                }
                Err(err) => {
                    trace!("connect error: {}: {}", sock_addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => conn_error(err, addr),
            None => Error::invalid_address(addr.to_string()),
        })
    }
}

fn conn_error(io_err: io::Error, addr: &Address) -> Error {
    match io_err.kind() {
        io::ErrorKind::ConnectionRefused => Error::connection_refused(addr.clone()),
        _ => Error::Io(io_err),
    }
}
