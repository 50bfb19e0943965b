//! Length preserving obfuscation of transport traffic.
//!
//! The wrappers only alter byte contents. Datagram boundaries, addresses and
//! stream ordering are passed through untouched.
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::byte_stream::{ByteStream, ReadHalf, WriteHalf};
use crate::model::Error;
use crate::pkt_stream::PktStream;

/// Reversible transform of raw transport bytes.
///
/// `offset` is the position of `buf[0]` within its datagram or stream.
pub trait Obfuscator: fmt::Debug + Send + Sync {
    fn obfuscate(&self, buf: &mut [u8], offset: u64);
    fn deobfuscate(&self, buf: &mut [u8], offset: u64);
}

/// Repeating key XOR.
#[derive(Clone)]
pub struct XorObfuscator {
    key: Vec<u8>,
}

impl XorObfuscator {
    pub fn new<K: AsRef<[u8]>>(key: K) -> Result<Self, Error> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(Error::EmptyObfsKey);
        }
        Ok(Self { key: key.to_vec() })
    }

    fn apply(&self, buf: &mut [u8], offset: u64) {
        let len = self.key.len() as u64;
        let mut idx = (offset % len) as usize;
        for b in buf.iter_mut() {
            *b ^= self.key[idx];
            idx += 1;
            if idx == self.key.len() {
                idx = 0;
            }
        }
    }
}

// never print the key
impl fmt::Debug for XorObfuscator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "XorObfuscator(<{} bytes>)", self.key.len())
    }
}

impl Obfuscator for XorObfuscator {
    fn obfuscate(&self, buf: &mut [u8], offset: u64) {
        self.apply(buf, offset)
    }

    fn deobfuscate(&self, buf: &mut [u8], offset: u64) {
        self.apply(buf, offset)
    }
}

/// Packet connection whose datagrams are obfuscated one by one.
///
/// Nothing in this crate carries sessions over datagrams: the server and the
/// front-end both run over TCP. This wrapper is for callers plugging in
/// their own packet transport, e.g. a [`UdpSocket`](std::net::UdpSocket).
/// Each datagram is obfuscated from keystream offset `0`.
#[derive(Debug)]
pub struct ObfsPktStream<P> {
    inner: P,
    obfs: Arc<dyn Obfuscator>,
}

impl<P: PktStream> ObfsPktStream<P> {
    pub fn new(inner: P, obfs: Arc<dyn Obfuscator>) -> Self {
        Self { inner, obfs }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: PktStream> PktStream for ObfsPktStream<P> {
    fn send_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        let mut scratch = pkt.to_vec();
        self.obfs.obfuscate(&mut scratch, 0);
        self.inner.send_to(&scratch, addr)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        let (size, addr) = self.inner.recv_from(buf)?;
        self.obfs.deobfuscate(&mut buf[..size], 0);
        Ok((size, addr))
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.inner.local_addr()
    }

    fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.inner.set_timeout(dur)
    }
}

#[derive(Debug)]
struct ObfsReader<R> {
    inner: R,
    obfs: Arc<dyn Obfuscator>,
    pos: u64,
}

impl<R: io::Read> io::Read for ObfsReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.inner.read(buf)?;
        self.obfs.deobfuscate(&mut buf[..size], self.pos);
        self.pos += size as u64;
        Ok(size)
    }
}

#[derive(Debug)]
struct ObfsWriter<W> {
    inner: W,
    obfs: Arc<dyn Obfuscator>,
    pos: u64,
    scratch: Vec<u8>,
}

impl<W: io::Write> io::Write for ObfsWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.obfs.obfuscate(&mut self.scratch, self.pos);
        // a short write leaves the tail to be transformed again at the new position
        let size = self.inner.write(&self.scratch)?;
        self.pos += size as u64;
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Byte stream obfuscated by its absolute position in each direction.
///
/// Once split, the halves carry on from the current positions and the
/// original should no longer be read or written.
#[derive(Debug)]
pub struct ObfsStream<S> {
    inner: S,
    obfs: Arc<dyn Obfuscator>,
    rd_pos: u64,
    wr_pos: u64,
}

impl<S: ByteStream> ObfsStream<S> {
    pub fn new(inner: S, obfs: Arc<dyn Obfuscator>) -> Self {
        Self {
            inner,
            obfs,
            rd_pos: 0,
            wr_pos: 0,
        }
    }
}

impl<S: ByteStream> io::Read for ObfsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.inner.read(buf)?;
        self.obfs.deobfuscate(&mut buf[..size], self.rd_pos);
        self.rd_pos += size as u64;
        Ok(size)
    }
}

impl<S: ByteStream> io::Write for ObfsStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut scratch = buf.to_vec();
        self.obfs.obfuscate(&mut scratch, self.wr_pos);
        let size = self.inner.write(&scratch)?;
        self.wr_pos += size as u64;
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: ByteStream> ByteStream for ObfsStream<S> {
    fn split(&self) -> Result<(ReadHalf, WriteHalf), Error> {
        let (rd, wr) = self.inner.split()?;
        let rd = ObfsReader {
            inner: rd,
            obfs: self.obfs.clone(),
            pos: self.rd_pos,
        };
        let wr = ObfsWriter {
            inner: wr,
            obfs: self.obfs.clone(),
            pos: self.wr_pos,
            scratch: vec![],
        };
        Ok((Box::new(rd), Box::new(wr)))
    }

    fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.inner.set_timeout(dur)
    }

    fn close(&self) -> Result<(), Error> {
        self.inner.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::byte_stream::test::BufferStream;
    use std::io::{Read, Write};
    use std::net::UdpSocket;

    fn obfs() -> Arc<dyn Obfuscator> {
        Arc::new(XorObfuscator::new("opensesame").unwrap())
    }

    #[test]
    fn empty_key() {
        assert!(matches!(XorObfuscator::new(""), Err(Error::EmptyObfsKey)));
    }

    #[test]
    fn chunking_does_not_matter() {
        let obfs = obfs();
        let plain: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let mut whole = plain.clone();
        obfs.obfuscate(&mut whole, 0);
        assert_ne!(whole, plain);

        let mut chunked = plain.clone();
        let mut pos = 0;
        for chunk in chunked.chunks_mut(7) {
            obfs.obfuscate(chunk, pos);
            pos += chunk.len() as u64;
        }
        assert_eq!(whole, chunked);

        obfs.deobfuscate(&mut whole, 0);
        assert_eq!(whole, plain);
    }

    #[test]
    fn datagrams_keep_boundaries() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rx_addr = rx.local_addr().unwrap();
        let tx = ObfsPktStream::new(UdpSocket::bind("127.0.0.1:0").unwrap(), obfs());
        let rx = ObfsPktStream::new(rx, obfs());

        tx.send_to(b"hello", rx_addr).unwrap();
        tx.send_to(b"hysteria", rx_addr).unwrap();
        let mut buf = [0u8; 64];
        let (size, from) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"hello");
        assert_eq!(from, tx.local_addr().unwrap());
        let (size, _) = rx.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], b"hysteria");

        // a plain receiver only sees the transformed bytes
        let raw_addr = raw.local_addr().unwrap();
        tx.send_to(b"hello", raw_addr).unwrap();
        let (size, _) = raw.recv_from(&mut buf).unwrap();
        assert_eq!(size, 5);
        assert_ne!(&buf[..size], b"hello");
    }

    #[test]
    fn stream_positions_survive_split() {
        let wire = BufferStream::new();
        let mut strm = ObfsStream::new(wire.clone(), obfs());
        strm.write_all(b"first ").unwrap();
        let (_, mut wr) = strm.split().unwrap();
        wr.write_all(b"second").unwrap();

        let sent = wire.written();
        assert_ne!(&sent[..], &b"first second"[..]);

        let mut peer = ObfsStream::new(
            BufferStream::with_buffer(sent.into(), vec![].into()),
            obfs(),
        );
        let mut head = [0u8; 3];
        peer.read_exact(&mut head).unwrap();
        let (mut rd, _) = peer.split().unwrap();
        let mut rest = vec![];
        rd.read_to_end(&mut rest).unwrap();
        assert_eq!(&head, b"fir");
        assert_eq!(&rest[..], &b"st second"[..]);
    }
}
