//! Per-request hooks.
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use log::*;

use crate::acl::AclDecision;
use crate::model::Error;

/// What is known about a request when the hooks fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub peer: SocketAddr,
    /// auth token of the tunnel session; `None` at the SOCKS front-end
    pub token: Option<Arc<[u8]>>,
    /// destination as requested by the client
    pub address: String,
}

/// `request` fires once the decision is known, before it is acted on.
/// `finished` fires exactly once per request afterwards.
pub trait RequestObserver: Send + Sync {
    fn request(&self, info: &RequestInfo, decision: &AclDecision);
    fn finished(&self, info: &RequestInfo, err: Option<&Error>);
}

/// Writes requests into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl RequestObserver for LogObserver {
    fn request(&self, info: &RequestInfo, decision: &AclDecision) {
        info!("request: {}: {}", info, decision);
    }

    fn finished(&self, info: &RequestInfo, err: Option<&Error>) {
        match err {
            None => info!("closed: {}", info),
            Some(Error::IdleTimeout) => info!("closed: {}: idle timeout", info),
            Some(err) => warn!("closed: {}: {}", info, err),
        }
    }
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.peer, self.address)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Request(RequestInfo, AclDecision),
        /// error message if any
        Finished(RequestInfo, Option<String>),
    }

    #[derive(Debug, Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl RequestObserver for RecordingObserver {
        fn request(&self, info: &RequestInfo, decision: &AclDecision) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Request(info.clone(), decision.clone()));
        }

        fn finished(&self, info: &RequestInfo, err: Option<&Error>) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Finished(info.clone(), err.map(|e| e.to_string())));
        }
    }
}
