use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::model::Error;

/// Datagram oriented connection.
///
/// Message boundaries are preserved by `send_to`/`recv_from`.
pub trait PktStream: Send {
    fn send_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error>;
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error>;
    fn local_addr(&self) -> Result<SocketAddr, Error>;
    fn set_timeout(&self, _dur: Option<Duration>) -> Result<(), Error> {
        Ok(())
    }
}

impl PktStream for UdpSocket {
    fn send_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        let size = UdpSocket::send_to(self, pkt, addr)?;
        if size != pkt.len() {
            return Err(Error::message_fmt(format_args!(
                "truncated datagram: {} != {}",
                size,
                pkt.len()
            )));
        }
        Ok(size)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        Ok(UdpSocket::recv_from(self, buf)?)
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(UdpSocket::local_addr(self)?)
    }

    fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.set_read_timeout(dur)?;
        self.set_write_timeout(dur)?;
        Ok(())
    }
}
