//! Multiplexed transport consumed by the tunnel.
//!
//! A transport session carries many independent byte streams between one
//! client and one server. The tunnel only relies on the traits below, so any
//! reliable multiplexed transport can back it. `crate::mux` provides one
//! over a plain TCP connection.
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::byte_stream::ByteStream;
use crate::model::{CloseCode, Error};

/// Pacing strategy of a session's outgoing traffic.
pub trait CongestionControl: fmt::Debug + Send {
    /// Delay to wait before `bytes` may leave.
    fn on_send(&mut self, bytes: usize) -> Duration;
}

/// Makes a congestion controller for a negotiated send rate (bytes/sec).
pub trait CongestionFactory: fmt::Debug + Send + Sync {
    fn make(&self, send_bps: u64) -> Box<dyn CongestionControl>;
}

/// Leave pacing to the transport's own default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportDefault;

impl CongestionFactory for TransportDefault {
    fn make(&self, _send_bps: u64) -> Box<dyn CongestionControl> {
        Box::new(Unpaced)
    }
}

/// Never delays.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unpaced;

impl CongestionControl for Unpaced {
    fn on_send(&mut self, _bytes: usize) -> Duration {
        Duration::ZERO
    }
}

/// Builds `FixedRate` controllers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedRateFactory;

impl CongestionFactory for FixedRateFactory {
    fn make(&self, send_bps: u64) -> Box<dyn CongestionControl> {
        Box::new(FixedRate::new(send_bps))
    }
}

const MIN_BURST: f64 = 64.0 * 1024.0;

/// Token bucket holding a quarter second of traffic (at least 64 KiB).
#[derive(Debug)]
pub struct FixedRate {
    bps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl FixedRate {
    pub fn new(send_bps: u64) -> Self {
        let bps = send_bps as f64;
        let burst = (bps / 4.0).max(MIN_BURST);
        Self {
            bps,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }
}

impl CongestionControl for FixedRate {
    fn on_send(&mut self, bytes: usize) -> Duration {
        if self.bps <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * self.bps;
        self.last = now;
        self.tokens = (self.tokens + refill).min(self.burst) - bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.bps)
        }
    }
}

/// Handle to one multiplexed transport session.
///
/// Clones refer to the same session.
pub trait TransportSession: fmt::Debug + Clone + Send + Sync + 'static {
    type Stream: ByteStream + 'static;

    fn remote_addr(&self) -> SocketAddr;

    /// Wait for the peer to open a stream. `None` waits until the session closes.
    fn accept_stream(&self, timeout: Option<Duration>) -> Result<Self::Stream, Error>;

    fn open_stream(&self) -> Result<Self::Stream, Error>;

    fn set_congestion_control(&self, cc: Box<dyn CongestionControl>) -> Result<(), Error>;

    /// Close the session and every stream in it, telling the peer why.
    fn close_with_error(&self, code: CloseCode, reason: &str);

    fn is_closed(&self) -> bool;
}

/// Establishes transport sessions to a tunnel server.
pub trait SessionDialer: Send + Sync {
    type Session: TransportSession;
    fn dial(&self) -> Result<Self::Session, Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unpaced() {
        let mut cc = TransportDefault.make(1);
        assert_eq!(cc.on_send(1 << 30), Duration::ZERO);
    }

    #[test]
    fn fixed_rate_paces_after_burst() {
        // 1 MB/s: burst is 256 KB
        let mut cc = FixedRate::new(1_000_000);
        assert_eq!(cc.on_send(200_000), Duration::ZERO);
        let delay = cc.on_send(100_000);
        assert!(delay > Duration::from_millis(30), "{:?}", delay);
        assert!(delay < Duration::from_millis(60), "{:?}", delay);
    }

    #[test]
    fn fixed_rate_small_rate_has_min_burst() {
        let mut cc = FixedRate::new(1000);
        assert_eq!(cc.on_send(64 * 1024), Duration::ZERO);
        assert!(cc.on_send(1000) >= Duration::from_millis(900));
    }
}
