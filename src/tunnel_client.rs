//! Client side of a tunnel session.
use std::fmt;
use std::sync::{Arc, Mutex};

use log::*;

use crate::byte_stream::{BoxedStream, ByteStream};
use crate::model::{
    Address, ClientHello, CloseCode, Error, Rate, StreamRequest, TunnelStream, PROTOCOL_TIMEOUT,
};
use crate::rw_socks_stream::ReadWriteStream;
use crate::transport::{CongestionFactory, SessionDialer, TransportSession};

/// Opens relayed TCP streams to a destination.
pub trait StreamDialer: Send + Sync {
    fn dial_tcp(&self, addr: &Address) -> Result<BoxedStream, Error>;
}

/// Keeps one authenticated session to the tunnel server.
pub struct TunnelClient<D: SessionDialer> {
    dialer: D,
    rate: Rate,
    auth: Vec<u8>,
    congestion: Arc<dyn CongestionFactory>,
    session: Mutex<Option<D::Session>>,
}

impl<D: SessionDialer + fmt::Debug> fmt::Debug for TunnelClient<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TunnelClient")
            .field("dialer", &self.dialer)
            .field("rate", &self.rate)
            .finish()
    }
}

impl<D: SessionDialer> TunnelClient<D> {
    /// The session is established on first use.
    pub fn new(dialer: D, rate: Rate, auth: Vec<u8>, congestion: Arc<dyn CongestionFactory>) -> Self {
        Self {
            dialer,
            rate,
            auth,
            congestion,
            session: Mutex::new(None),
        }
    }

    /// Establish the session right away, failing on a rejected handshake.
    pub fn connect(
        dialer: D,
        rate: Rate,
        auth: Vec<u8>,
        congestion: Arc<dyn CongestionFactory>,
    ) -> Result<Self, Error> {
        let client = Self::new(dialer, rate, auth, congestion);
        let session = client.establish()?;
        *client.session.lock()? = Some(session);
        Ok(client)
    }

    fn establish(&self) -> Result<D::Session, Error> {
        let session = self.dialer.dial()?;
        match self.handshake(&session) {
            Ok(()) => Ok(session),
            Err(err) => {
                let code = match err {
                    Error::AuthRejected { .. } => CloseCode::Generic,
                    _ => CloseCode::Protocol,
                };
                session.close_with_error(code, "");
                Err(err)
            }
        }
    }

    fn handshake(&self, session: &D::Session) -> Result<(), Error> {
        let control = session.open_stream()?;
        control.set_timeout(Some(PROTOCOL_TIMEOUT))?;
        let mut control = ReadWriteStream::new(control);
        control.send_client_hello(&ClientHello {
            rate: self.rate,
            auth: self.auth.clone(),
        })?;
        let hello = control.recv_server_hello()?;
        if !hello.ok {
            return Err(Error::AuthRejected {
                message: hello.message,
            });
        }
        // the server receives at most this much from us
        session.set_congestion_control(self.congestion.make(hello.rate.recv_bps))?;
        info!(
            "connected to tunnel server {}: {}: {}",
            session.remote_addr(),
            hello.rate,
            hello.message
        );
        Ok(())
    }

    /// A fresh stream, re-establishing the session once if it has been closed.
    fn open_stream(&self) -> Result<<D::Session as TransportSession>::Stream, Error> {
        let mut session = self.session.lock()?;
        if let Some(current) = session.as_ref() {
            if !current.is_closed() {
                match current.open_stream() {
                    Ok(strm) => return Ok(strm),
                    Err(err) => debug!("open stream: {}", err),
                }
            }
            info!("tunnel session is closed, reconnecting");
        }
        let fresh = self.establish()?;
        let strm = fresh.open_stream()?;
        *session = Some(fresh);
        Ok(strm)
    }

    pub fn dial_tcp(&self, addr: &Address) -> Result<<D::Session as TransportSession>::Stream, Error> {
        let mut strm = ReadWriteStream::new(self.open_stream()?);
        strm.send_stream_request(&StreamRequest::tcp(addr.to_string()))?;
        let resp = strm.recv_stream_response()?;
        if !resp.ok {
            return Err(Error::StreamRejected {
                message: resp.message,
            });
        }
        trace!("tunnel stream: {}", addr);
        Ok(strm.into_inner())
    }
}

impl<D: SessionDialer> StreamDialer for TunnelClient<D> {
    fn dial_tcp(&self, addr: &Address) -> Result<BoxedStream, Error> {
        TunnelClient::dial_tcp(self, addr).map(|strm| Box::new(strm) as BoxedStream)
    }
}

impl<D: SessionDialer> Drop for TunnelClient<D> {
    fn drop(&mut self) {
        let session = match self.session.get_mut() {
            Ok(session) => session.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(session) = session {
            session.close_with_error(CloseCode::Generic, "");
        }
    }
}
