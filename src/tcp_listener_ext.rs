use std::convert::TryInto;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

pub trait TcpListenerExt {
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<(TcpStream, SocketAddr)>;
}

impl TcpListenerExt for TcpListener {
    /// accept(2) with timeout
    ///
    /// * `timeout`
    ///   Timeout for _accept_. If the value is `None`, wait connection indefinitely.
    ///   Expiry is reported as `io::ErrorKind::TimedOut`.
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<(TcpStream, SocketAddr)> {
        let mut fds = [PollFd::new(self.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, timeout_millis(timeout)?)?;
        if ready == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "poll accept"));
        }
        self.accept()
    }
}

/// poll(2) timeout in milliseconds, `-1` blocks indefinitely
fn timeout_millis(timeout: Option<Duration>) -> io::Result<i32> {
    match timeout {
        None => Ok(-1),
        Some(dur) => dur.as_millis().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("timeout convert error: {:?}", dur),
            )
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_millis(None).unwrap(), -1);
        assert_eq!(
            timeout_millis(Some(Duration::from_millis(1500))).unwrap(),
            1500
        );
        assert!(timeout_millis(Some(Duration::from_secs(u64::MAX))).is_err());
    }

    #[test]
    fn accept_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let started = Instant::now();
        let err = listener
            .accept_timeout(Some(Duration::from_millis(200)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn accept_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_strm, addr) = listener
            .accept_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(addr, client.local_addr().unwrap());
    }
}
