//! Reference `TransportSession` multiplexing streams over one reliable connection.
//!
//! ```text
//! +------+-----------+--------+-----------------+
//! | kind | stream_id |  len   |     payload     |
//! |  u8  |  u32 (BE) | u16(BE)|   len bytes     |
//! +------+-----------+--------+-----------------+
//! ```
//!
//! * `Open`  announces a new stream id
//! * `Data`  carries at most `MAX_PAYLOAD` bytes
//! * `Fin`   no more data from the sender on this stream
//! * `Close` tears the session down, payload is `code:u16` followed by the reason
//!
//! Streams opened by the client have odd ids, those opened by the server even ids.
//! A single reader thread feeds per stream buffers. Whole frames are written
//! under one lock, so concurrent streams never interleave inside a frame.
//! There is no per stream flow control: receive buffers grow without bound.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::acceptor::{Binder, TcpAcceptor, TcpBinder};
use crate::byte_stream::{BoxedStream, ByteStream, ReadHalf, WriteHalf};
use crate::model::{Address, CloseCode, Error};
use crate::obfs::{ObfsStream, Obfuscator};
use crate::session::{Connection, Interrupter};
use crate::thread::spawn_thread;
use crate::transport::{CongestionControl, SessionDialer, TransportSession, Unpaced};

pub const MAX_PAYLOAD: usize = 16 * 1024;
const HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Open = 0,
    Data = 1,
    Fin = 2,
    Close = 3,
}

impl FrameKind {
    fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(FrameKind::Open),
            1 => Some(FrameKind::Data),
            2 => Some(FrameKind::Fin),
            3 => Some(FrameKind::Close),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct StreamBuf {
    data: VecDeque<u8>,
    /// peer sent `Fin`
    remote_fin: bool,
    /// closed on this side, reads return end of stream
    local_closed: bool,
    read_timeout: Option<Duration>,
}

#[derive(Debug)]
struct State {
    streams: HashMap<u32, StreamBuf>,
    accept_queue: VecDeque<u32>,
    next_id: u32,
    closed: Option<(CloseCode, String)>,
}

struct Shared {
    remote_addr: SocketAddr,
    state: Mutex<State>,
    cond: Condvar,
    writer: Mutex<WriteHalf>,
    cc: Mutex<Box<dyn CongestionControl>>,
    conn: Mutex<BoxedStream>,
}

/// One multiplexed session, either side.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MuxSession({})", self.shared.remote_addr)
    }
}

impl MuxSession {
    /// Take over `conn` and start demultiplexing it.
    ///
    /// * `client`
    ///    Whether this side dialed the connection. Decides the parity of opened stream ids.
    pub fn new(conn: BoxedStream, remote_addr: SocketAddr, client: bool) -> Result<Self, Error> {
        // frames must never be cut by a read timeout
        conn.set_timeout(None)?;
        let (rd, wr) = conn.split()?;
        let shared = Arc::new(Shared {
            remote_addr,
            state: Mutex::new(State {
                streams: HashMap::new(),
                accept_queue: VecDeque::new(),
                next_id: if client { 1 } else { 2 },
                closed: None,
            }),
            cond: Condvar::new(),
            writer: Mutex::new(wr),
            cc: Mutex::new(Box::new(Unpaced)),
            conn: Mutex::new(conn),
        });
        let session = MuxSession { shared };
        {
            let session = session.clone();
            spawn_thread(format!("mux-{}", remote_addr), move || {
                session.read_loop(rd)
            })?;
        }
        Ok(session)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, Error> {
        Ok(self.shared.state.lock()?)
    }

    fn read_loop(&self, mut rd: ReadHalf) {
        let (code, reason) = match self.read_frames(&mut rd) {
            Ok((code, reason)) => (code, reason),
            Err(err) if err.is_protocol() => (CloseCode::Protocol, err.to_string()),
            Err(err) => (CloseCode::Generic, format!("connection lost: {}", err)),
        };
        debug!("mux session {} closed: {}: {}", self.shared.remote_addr, code, reason);
        self.mark_closed(code, reason);
        self.close_conn();
    }

    /// read frames until the peer closes the session
    fn read_frames(&self, rd: &mut ReadHalf) -> Result<(CloseCode, String), Error> {
        let mut header = [0u8; HEADER_LEN];
        loop {
            rd.read_exact(&mut header)?;
            let kind = header[0];
            let id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
            let len = u16::from_be_bytes([header[5], header[6]]) as usize;
            let mut payload = vec![0u8; len];
            rd.read_exact(&mut payload)?;

            let kind = FrameKind::from_u8(kind)
                .ok_or_else(|| Error::message_fmt(format_args!("unknown frame kind: {}", kind)))?;
            trace!("frame: {:?} {} ({} bytes)", kind, id, len);
            let mut state = self.state()?;
            match kind {
                FrameKind::Open => {
                    state.streams.insert(id, StreamBuf::default());
                    state.accept_queue.push_back(id);
                }
                FrameKind::Data => {
                    if let Some(strm) = state.streams.get_mut(&id) {
                        if !strm.local_closed {
                            strm.data.extend(payload);
                        }
                    }
                }
                FrameKind::Fin => {
                    if let Some(strm) = state.streams.get_mut(&id) {
                        strm.remote_fin = true;
                    }
                }
                FrameKind::Close => {
                    if payload.len() < 2 {
                        return Err(Error::message_fmt(format_args!("short close frame")));
                    }
                    let code = u16::from_be_bytes([payload[0], payload[1]]).into();
                    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
                    return Ok((code, reason));
                }
            }
            self.shared.cond.notify_all();
        }
    }

    fn mark_closed(&self, code: CloseCode, reason: String) -> bool {
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let first = state.closed.is_none();
        if first {
            state.closed = Some((code, reason));
        }
        self.shared.cond.notify_all();
        first
    }

    fn close_conn(&self) {
        if let Ok(conn) = self.shared.conn.lock() {
            if let Err(err) = conn.close() {
                debug!("close error: {}", err);
            }
        }
    }

    fn closed_error(state: &State) -> Option<Error> {
        state
            .closed
            .as_ref()
            .map(|(code, reason)| Error::session_closed(*code, reason.clone()))
    }

    fn send_frame(&self, kind: FrameKind, id: u32, payload: &[u8]) -> Result<(), Error> {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.push(kind as u8);
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        let result = match self.shared.writer.lock() {
            Ok(mut wr) => wr
                .write_all(&frame)
                .and_then(|_| wr.flush())
                .map_err(Error::from),
            Err(err) => Err(Error::Poisoned(err.to_string())),
        };
        if let Err(err) = result {
            self.mark_closed(CloseCode::Generic, format!("write error: {}", err));
            self.close_conn();
            return Err(err);
        }
        Ok(())
    }

    fn stream(&self, id: u32) -> MuxStream {
        MuxStream {
            id,
            session: self.clone(),
        }
    }

    /// Data frame for stream `id`, paced by the congestion controller.
    fn send_data(&self, id: u32, buf: &[u8]) -> io::Result<usize> {
        {
            let state = self.state()?;
            if let Some(err) = Self::closed_error(&state) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, err.to_string()));
            }
            match state.streams.get(&id) {
                Some(strm) if !strm.local_closed => {}
                _ => return Err(io::ErrorKind::BrokenPipe.into()),
            }
        }
        let size = buf.len().min(MAX_PAYLOAD);
        let delay = self.shared.cc.lock().map_err(Error::from)?.on_send(size);
        if delay > Duration::ZERO {
            thread::sleep(delay);
        }
        self.send_frame(FrameKind::Data, id, &buf[..size])?;
        Ok(size)
    }

    fn recv_data(&self, id: u32, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state()?;
        let deadline = state
            .streams
            .get(&id)
            .and_then(|strm| strm.read_timeout)
            .map(|dur| Instant::now() + dur);
        loop {
            let closed = Self::closed_error(&state);
            let strm = match state.streams.get_mut(&id) {
                Some(strm) => strm,
                None => return Ok(0),
            };
            if !strm.data.is_empty() {
                let size = buf.len().min(strm.data.len());
                for (dst, src) in buf.iter_mut().zip(strm.data.drain(..size)) {
                    *dst = src;
                }
                return Ok(size);
            }
            if buf.is_empty() || strm.remote_fin || strm.local_closed {
                return Ok(0);
            }
            if let Some(err) = closed {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, err.to_string()));
            }
            state = match deadline {
                None => self.shared.cond.wait(state).map_err(Error::from)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    self.shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .map_err(Error::from)?
                        .0
                }
            };
        }
    }

    /// Stop reading and writing stream `id`, telling the peer.
    fn close_stream(&self, id: u32) -> Result<(), Error> {
        let send_fin = {
            let mut state = self.state()?;
            let send_fin = match state.streams.get_mut(&id) {
                Some(strm) if !strm.local_closed => {
                    strm.local_closed = true;
                    strm.data.clear();
                    true
                }
                _ => false,
            };
            state.streams.remove(&id);
            self.shared.cond.notify_all();
            send_fin && state.closed.is_none()
        };
        if send_fin {
            self.send_frame(FrameKind::Fin, id, &[])?;
        }
        Ok(())
    }
}

impl TransportSession for MuxSession {
    type Stream = MuxStream;

    fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr
    }

    fn accept_stream(&self, timeout: Option<Duration>) -> Result<MuxStream, Error> {
        let deadline = timeout.map(|dur| Instant::now() + dur);
        let mut state = self.state()?;
        loop {
            if let Some(id) = state.accept_queue.pop_front() {
                trace!("accepted stream: {}", id);
                return Ok(self.stream(id));
            }
            if let Some(err) = Self::closed_error(&state) {
                return Err(err);
            }
            state = match deadline {
                None => self.shared.cond.wait(state)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::timeout("stream"));
                    }
                    self.shared.cond.wait_timeout(state, deadline - now)?.0
                }
            };
        }
    }

    fn open_stream(&self) -> Result<MuxStream, Error> {
        let id = {
            let mut state = self.state()?;
            if let Some(err) = Self::closed_error(&state) {
                return Err(err);
            }
            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(2);
            state.streams.insert(id, StreamBuf::default());
            id
        };
        trace!("open stream: {}", id);
        self.send_frame(FrameKind::Open, id, &[])?;
        Ok(self.stream(id))
    }

    fn set_congestion_control(&self, cc: Box<dyn CongestionControl>) -> Result<(), Error> {
        debug!("congestion control: {:?}", cc);
        *self.shared.cc.lock()? = cc;
        Ok(())
    }

    fn close_with_error(&self, code: CloseCode, reason: &str) {
        if self.mark_closed(code, reason.to_owned()) {
            let mut payload = code.code().to_be_bytes().to_vec();
            let reason = reason.as_bytes();
            payload.extend_from_slice(&reason[..reason.len().min(MAX_PAYLOAD - 2)]);
            // best effort, the peer may be gone already
            self.send_frame(FrameKind::Close, 0, &payload).ok();
            self.close_conn();
        }
    }

    fn is_closed(&self) -> bool {
        self.state().map(|s| s.closed.is_some()).unwrap_or(true)
    }
}

impl Connection for MuxSession {
    fn interrupter(&self) -> Result<Interrupter, Error> {
        let session = self.clone();
        Ok(Interrupter::new(move || {
            session.close_with_error(CloseCode::Generic, "server shutdown");
            Ok(())
        }))
    }
}

/// Logical stream of a `MuxSession`. Dropping it closes the stream.
pub struct MuxStream {
    id: u32,
    session: MuxSession,
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MuxStream({}, {})", self.session.shared.remote_addr, self.id)
    }
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Read for MuxStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.session.recv_data(self.id, buf)
    }
}

impl Write for MuxStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session.send_data(self.id, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteStream for MuxStream {
    fn split(&self) -> Result<(ReadHalf, WriteHalf), Error> {
        let half = || MuxHalf {
            id: self.id,
            session: self.session.clone(),
        };
        Ok((Box::new(half()), Box::new(half())))
    }

    fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        if let Some(strm) = self.session.state()?.streams.get_mut(&self.id) {
            strm.read_timeout = dur;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.session.close_stream(self.id)
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if let Err(err) = self.session.close_stream(self.id) {
            trace!("close stream {}: {}", self.id, err);
        }
    }
}

/// Read or write half of a `MuxStream`. Dropping it leaves the stream open.
struct MuxHalf {
    id: u32,
    session: MuxSession,
}

impl Read for MuxHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.session.recv_data(self.id, buf)
    }
}

impl Write for MuxHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.session.send_data(self.id, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wrap a raw connection with the obfuscator when one is configured.
fn wrap(tcp: TcpStream, obfs: &Option<Arc<dyn Obfuscator>>) -> BoxedStream {
    if let Err(err) = tcp.set_nodelay(true) {
        debug!("set_nodelay: {}", err);
    }
    match obfs {
        Some(obfs) => Box::new(ObfsStream::new(tcp, obfs.clone())),
        None => Box::new(tcp),
    }
}

/// Binds a TCP listener whose connections become server side `MuxSession`s.
pub struct MuxBinder {
    tcp: TcpBinder,
    obfs: Option<Arc<dyn Obfuscator>>,
}

impl MuxBinder {
    pub fn new(tcp: TcpBinder, obfs: Option<Arc<dyn Obfuscator>>) -> Self {
        Self { tcp, obfs }
    }
}

pub struct MuxAcceptor {
    tcp: TcpAcceptor,
    obfs: Option<Arc<dyn Obfuscator>>,
}

impl Iterator for MuxAcceptor {
    type Item = (MuxSession, SocketAddr);
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (tcp, addr) = self.tcp.next()?;
            match MuxSession::new(wrap(tcp, &self.obfs), addr, false) {
                Ok(session) => return Some((session, addr)),
                Err(err) => error!("mux session error: {}: {}", addr, err),
            }
        }
    }
}

impl Binder for MuxBinder {
    type Conn = MuxSession;
    type Iter = MuxAcceptor;
    fn bind(&self, addr: SocketAddr) -> Result<Self::Iter, Error> {
        Ok(MuxAcceptor {
            tcp: self.tcp.bind(addr)?,
            obfs: self.obfs.clone(),
        })
    }
}

/// Dials client side `MuxSession`s to a tunnel server.
#[derive(Clone)]
pub struct MuxDialer {
    server: Address,
    obfs: Option<Arc<dyn Obfuscator>>,
    timeout: Duration,
}

impl fmt::Debug for MuxDialer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MuxDialer({}, obfs: {:?})", self.server, self.obfs)
    }
}

impl MuxDialer {
    pub fn new(server: Address, obfs: Option<Arc<dyn Obfuscator>>, timeout: Duration) -> Self {
        Self {
            server,
            obfs,
            timeout,
        }
    }
}

impl SessionDialer for MuxDialer {
    type Session = MuxSession;
    fn dial(&self) -> Result<MuxSession, Error> {
        let mut last_err = None;
        for addr in self.server.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(tcp) => {
                    debug!("dialed tunnel server: {}", addr);
                    return MuxSession::new(wrap(tcp, &self.obfs), addr, true);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .map(Error::from)
            .unwrap_or_else(|| Error::invalid_address(self.server.to_string())))
    }
}
