//! Tunnel preambles on top of `ReadWriteStream`.
//!
//! ```text
//! ClientHello    : version:u8 send_bps:u64 recv_bps:u64 auth_len:u16 auth
//! ServerHello    : ok:u8 send_bps:u64 recv_bps:u64 msg_len:u16 msg
//! StreamRequest  : udp:u8 addr_len:u16 addr
//! StreamResponse : ok:u8 msg_len:u16 msg
//! ```
//!
//! Integers are big endian. Each record is written with a single write.
use std::io;

use log::*;

use crate::model::{
    ClientHello, Error, Rate, ServerHello, StreamRequest, StreamResponse, TunnelStream,
    TUNNEL_PROTOCOL_VERSION,
};
use crate::rw_socks_stream::{ReadSocksExt, ReadWriteStream, WriteSocksExt};

trait ReadTunnelExt {
    fn read_u64(&mut self) -> Result<u64, Error>;
    fn read_bool(&mut self) -> Result<bool, Error>;
    fn read_rate(&mut self) -> Result<Rate, Error>;
    fn read_blob(&mut self) -> Result<Vec<u8>, Error>;
    fn read_text(&mut self) -> Result<String, Error>;
}

trait WriteTunnelExt {
    fn write_u64(&mut self, v: u64) -> Result<(), Error>;
    fn write_bool(&mut self, v: bool) -> Result<(), Error>;
    fn write_rate(&mut self, rate: &Rate) -> Result<(), Error>;
    fn write_blob(&mut self, v: &[u8]) -> Result<(), Error>;
}

impl<T: io::Read> ReadTunnelExt for T {
    fn read_u64(&mut self) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_bool(&mut self) -> Result<bool, Error> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::message_fmt(format_args!("invalid bool: {}", v))),
        }
    }

    fn read_rate(&mut self) -> Result<Rate, Error> {
        let send_bps = self.read_u64()?;
        let recv_bps = self.read_u64()?;
        Ok(Rate::new(send_bps, recv_bps))
    }

    /// length (2 bytes) prefixed bytes
    fn read_blob(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_text(&mut self) -> Result<String, Error> {
        Ok(String::from_utf8_lossy(&self.read_blob()?).into_owned())
    }
}

impl<T: io::Write> WriteTunnelExt for T {
    fn write_u64(&mut self, v: u64) -> Result<(), Error> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_bool(&mut self, v: bool) -> Result<(), Error> {
        self.write_u8(v as u8)
    }

    fn write_rate(&mut self, rate: &Rate) -> Result<(), Error> {
        self.write_u64(rate.send_bps)?;
        self.write_u64(rate.recv_bps)
    }

    fn write_blob(&mut self, v: &[u8]) -> Result<(), Error> {
        if v.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too long for a tunnel field: {} bytes", v.len()),
            )
            .into());
        }
        self.write_u16(v.len() as u16)?;
        self.write_all(v)?;
        Ok(())
    }
}

/// encode a record into memory, then send it at once
fn send_record<W, F>(strm: &mut W, f: F) -> Result<(), Error>
where
    W: io::Write,
    F: FnOnce(&mut Vec<u8>) -> Result<(), Error>,
{
    let mut buf = Vec::with_capacity(64);
    f(&mut buf)?;
    strm.write_all(&buf)?;
    strm.flush()?;
    Ok(())
}

impl<T> TunnelStream for ReadWriteStream<T>
where
    T: io::Read + io::Write,
{
    fn recv_client_hello(&mut self) -> Result<ClientHello, Error> {
        trace!("recv_client_hello");
        let strm = self.get_mut();
        let version = strm.read_u8()?;
        if version != TUNNEL_PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }
        let rate = strm.read_rate()?;
        let auth = strm.read_blob()?;
        Ok(ClientHello { rate, auth })
    }

    fn send_client_hello(&mut self, hello: &ClientHello) -> Result<(), Error> {
        trace!("send_client_hello: {}", hello.rate);
        send_record(self.get_mut(), |buf| {
            buf.write_u8(TUNNEL_PROTOCOL_VERSION)?;
            buf.write_rate(&hello.rate)?;
            buf.write_blob(&hello.auth)
        })
    }

    fn recv_server_hello(&mut self) -> Result<ServerHello, Error> {
        trace!("recv_server_hello");
        let strm = self.get_mut();
        let ok = strm.read_bool()?;
        let rate = strm.read_rate()?;
        let message = strm.read_text()?;
        Ok(ServerHello { ok, rate, message })
    }

    fn send_server_hello(&mut self, hello: &ServerHello) -> Result<(), Error> {
        trace!("send_server_hello: {:?}", hello);
        send_record(self.get_mut(), |buf| {
            buf.write_bool(hello.ok)?;
            buf.write_rate(&hello.rate)?;
            buf.write_blob(hello.message.as_bytes())
        })
    }

    fn recv_stream_request(&mut self) -> Result<StreamRequest, Error> {
        trace!("recv_stream_request");
        let strm = self.get_mut();
        let udp = strm.read_bool()?;
        let address = strm.read_text()?;
        Ok(StreamRequest { udp, address })
    }

    fn send_stream_request(&mut self, req: &StreamRequest) -> Result<(), Error> {
        trace!("send_stream_request: {:?}", req);
        send_record(self.get_mut(), |buf| {
            buf.write_bool(req.udp)?;
            buf.write_blob(req.address.as_bytes())
        })
    }

    fn recv_stream_response(&mut self) -> Result<StreamResponse, Error> {
        trace!("recv_stream_response");
        let strm = self.get_mut();
        let ok = strm.read_bool()?;
        let message = strm.read_text()?;
        Ok(StreamResponse { ok, message })
    }

    fn send_stream_response(&mut self, resp: &StreamResponse) -> Result<(), Error> {
        trace!("send_stream_response: {:?}", resp);
        send_record(self.get_mut(), |buf| {
            buf.write_bool(resp.ok)?;
            buf.write_blob(resp.message.as_bytes())
        })
    }
}
