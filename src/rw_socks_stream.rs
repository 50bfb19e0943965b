use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::io;
use std::slice;

use log::*;

use crate::model;
use crate::model::{Error, SocksStream};
use crate::raw_message::{self as raw, *};

pub(crate) trait ReadSocksExt {
    fn read_u8(&mut self) -> Result<u8, Error>;
    fn read_u16(&mut self) -> Result<u16, Error>;
    fn read_rsv(&mut self) -> Result<u8, Error>;
    fn read_version(&mut self) -> Result<ProtocolVersion, Error>;
    fn read_bytes(&mut self) -> Result<Vec<u8>, Error>;
    fn read_cmd(&mut self) -> Result<SockCommand, Error>;
    fn read_atyp(&mut self) -> Result<AddrType, Error>;
    fn read_addr(&mut self, atyp: AddrType) -> Result<Addr, Error>;
}

pub(crate) trait WriteSocksExt {
    fn write_u8(&mut self, v: u8) -> Result<(), Error>;
    fn write_u16(&mut self, v: u16) -> Result<(), Error>;
    fn write_bytes(&mut self, v: &[u8]) -> Result<(), Error>;
    fn write_atyp(&mut self, atyp: AddrType) -> Result<(), Error>;
    fn write_addr(&mut self, addr: &Addr) -> Result<(), Error>;
}

impl<T> ReadSocksExt for T
where
    T: io::Read,
{
    fn read_u8(&mut self) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_rsv(&mut self) -> Result<u8, Error> {
        let rsv = self.read_u8()?;
        if rsv != RESERVED {
            Err(Error::message_fmt(format_args!(
                "value of rsv is not 0({})",
                rsv
            )))
        } else {
            Ok(rsv)
        }
    }

    fn read_version(&mut self) -> Result<ProtocolVersion, Error> {
        Ok(self.read_u8()?.into())
    }

    /// length (1 byte) prefixed bytes
    fn read_bytes(&mut self) -> Result<Vec<u8>, Error> {
        let len = self.read_u8()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_cmd(&mut self) -> Result<SockCommand, Error> {
        let code = self.read_u8()?;
        SockCommand::try_from(code).map_err(|_| Error::UnknownCommand { code })
    }

    fn read_atyp(&mut self) -> Result<AddrType, Error> {
        Ok(AddrType::try_from(self.read_u8()?)?)
    }

    fn read_addr(&mut self, atyp: AddrType) -> Result<Addr, Error> {
        match atyp {
            AddrType::V4 => {
                let mut buf = [0u8; 4];
                self.read_exact(&mut buf)?;
                Ok(Addr::IpAddr(Ipv4Addr::from(buf).into()))
            }
            AddrType::Domain => Ok(Addr::Domain(self.read_bytes()?)),
            AddrType::V6 => {
                let mut buf = [0u8; 16];
                self.read_exact(&mut buf)?;
                Ok(Addr::IpAddr(Ipv6Addr::from(buf).into()))
            }
        }
    }
}

impl<T> WriteSocksExt for T
where
    T: io::Write,
{
    fn write_u8(&mut self, v: u8) -> Result<(), Error> {
        self.write_all(slice::from_ref(&v))?;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<(), Error> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, v: &[u8]) -> Result<(), Error> {
        if v.len() > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too long for a socks field: {} bytes", v.len()),
            )
            .into());
        }
        self.write_u8(v.len() as u8)?;
        self.write_all(v)?;
        Ok(())
    }

    fn write_atyp(&mut self, atyp: AddrType) -> Result<(), Error> {
        self.write_u8(atyp as u8)
    }

    fn write_addr(&mut self, addr: &Addr) -> Result<(), Error> {
        match addr {
            Addr::IpAddr(IpAddr::V4(addr)) => self.write_all(&addr.octets())?,
            Addr::IpAddr(IpAddr::V6(addr)) => self.write_all(&addr.octets())?,
            Addr::Domain(domain) => self.write_bytes(domain)?,
        }
        Ok(())
    }
}

/// Wrapper of Read/Write stream
/// for impl SocksStream.
pub struct ReadWriteStream<T> {
    strm: T,
}

impl<T: fmt::Debug> fmt::Debug for ReadWriteStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ReadWriteStream({:?})", self.strm)
    }
}

impl<T> ReadWriteStream<T>
where
    T: io::Read + io::Write,
{
    pub fn new(strm: T) -> Self {
        Self { strm }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.strm
    }

    pub fn into_inner(self) -> T {
        self.strm
    }
}

impl<T> SocksStream for ReadWriteStream<T>
where
    T: io::Read + io::Write,
{
    fn recv_method_candidates(&mut self) -> Result<model::MethodCandidates, Error> {
        trace!("recv_method_candidates");
        let ver = self.strm.read_version()?;
        let methods = self.strm.read_bytes()?;
        Ok(raw::MethodCandidates {
            ver,
            methods: methods.into_iter().map(Into::into).collect(),
        }
        .into())
    }

    fn send_method_selection(
        &mut self,
        method_selection: model::MethodSelection,
    ) -> Result<(), Error> {
        trace!("send_method_selection: {:?}", method_selection);
        let method_selection: raw::MethodSelection = method_selection.into();
        self.strm.write_all(&[
            method_selection.ver.into(),
            method_selection.method.code(),
        ])?;
        Ok(())
    }

    fn recv_user_pass(&mut self) -> Result<model::UserPassRequest, Error> {
        trace!("recv_user_pass");
        let ver = self.strm.read_u8()?;
        if ver != USER_PASS_VERSION {
            return Err(Error::message_fmt(format_args!(
                "unsupported username/password version: {}",
                ver
            )));
        }
        let uname = self.strm.read_bytes()?;
        let passwd = self.strm.read_bytes()?;
        Ok(raw::UserPassRequest { ver, uname, passwd }.into())
    }

    fn send_user_pass_status(&mut self, status: model::UserPassStatus) -> Result<(), Error> {
        trace!("send_user_pass_status: {:?}", status);
        self.strm.write_all(&[USER_PASS_VERSION, status.into()])?;
        Ok(())
    }

    fn recv_connect_request(&mut self) -> Result<model::ConnectRequest, Error> {
        trace!("recv_connect_request");
        let ver = self.strm.read_version()?;
        let cmd = self.strm.read_cmd()?;
        let rsv = self.strm.read_rsv()?;
        let atyp = self.strm.read_atyp()?;
        let dst_addr = self.strm.read_addr(atyp)?;
        let dst_port = self.strm.read_u16()?;
        Ok(raw::ConnectRequest {
            ver,
            cmd,
            rsv,
            atyp,
            dst_addr,
            dst_port,
        }
        .try_into()?)
    }

    fn send_connect_reply(&mut self, connect_reply: model::ConnectReply) -> Result<(), Error> {
        trace!("send_connect_reply: {:?}", connect_reply);
        let connect_reply: raw::ConnectReply = connect_reply.into();
        // whole reply goes out with a single write
        let mut cur = io::Cursor::new(Vec::with_capacity(32));
        cur.write_u8(connect_reply.ver.into())?;
        cur.write_u8(connect_reply.rep.code())?;
        cur.write_u8(connect_reply.rsv)?;
        cur.write_atyp(connect_reply.atyp)?;
        cur.write_addr(&connect_reply.bnd_addr)?;
        cur.write_u16(connect_reply.bnd_port)?;
        self.strm.write_all(cur.get_ref())?;
        Ok(())
    }
}
