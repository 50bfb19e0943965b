use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::ops::Deref;
use std::time::Duration;

use crate::model::Error;

pub type ReadHalf = Box<dyn io::Read + Send>;
pub type WriteHalf = Box<dyn io::Write + Send>;

/// read/write operations on byte stream
pub trait ByteStream: fmt::Debug + io::Read + io::Write + Send {
    /// independent read and write halves of the same stream
    fn split(&self) -> Result<(ReadHalf, WriteHalf), Error>;

    /// Timeout applied to each read and write. `None` blocks indefinitely.
    fn set_timeout(&self, _dur: Option<Duration>) -> Result<(), Error> {
        Ok(())
    }

    /// Tear down both directions, unblocking pending reads of split halves.
    fn close(&self) -> Result<(), Error>;
}

/// byte stream on tcp connection
impl ByteStream for TcpStream {
    fn split(&self) -> Result<(ReadHalf, WriteHalf), Error> {
        let rd = self.try_clone()?;
        let wr = self.try_clone()?;
        Ok((Box::new(rd), Box::new(wr)))
    }

    fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.set_read_timeout(dur)?;
        self.set_write_timeout(dur)?;
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }
}

/// Boxed stream
impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn split(&self) -> Result<(ReadHalf, WriteHalf), Error> {
        self.deref().split()
    }

    fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.deref().set_timeout(dur)
    }

    fn close(&self) -> Result<(), Error> {
        self.deref().close()
    }
}

pub type BoxedStream = Box<dyn ByteStream>;
