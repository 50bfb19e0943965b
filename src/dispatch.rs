//! Turn an ACL decision into an outbound connection.
use std::fmt;
use std::sync::Arc;

use log::*;

use crate::acl::{AclDecision, AclLookup, Action};
use crate::model::{Address, Error};

/// The two ways of reaching a destination.
pub trait Outbound {
    type Stream;
    fn direct(&self, addr: &Address) -> Result<Self::Stream, Error>;
    fn proxy(&self, addr: &Address) -> Result<Self::Stream, Error>;
}

/// Consults an ACL and falls back to a per-side default action.
#[derive(Clone)]
pub struct Dispatcher {
    acl: Arc<dyn AclLookup>,
    default: Action,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dispatcher({:?}, default: {})", self.acl, self.default)
    }
}

impl Dispatcher {
    pub fn new(acl: Arc<dyn AclLookup>, default: Action) -> Self {
        Self { acl, default }
    }

    /// Unmatched destinations are dialed directly.
    pub fn server(acl: Arc<dyn AclLookup>) -> Self {
        Self::new(acl, Action::Direct)
    }

    /// Unmatched destinations go through the tunnel.
    pub fn front_end(acl: Arc<dyn AclLookup>) -> Self {
        Self::new(acl, Action::Proxy)
    }

    pub fn decide(&self, addr: &Address) -> AclDecision {
        let decision = self
            .acl
            .lookup(addr.domain(), addr.ip())
            .unwrap_or_else(|| self.default.into());
        debug!("acl: {} -> {}", addr, decision);
        decision
    }
}

/// Perform `decision` for `target`.
///
/// `Block` and unknown actions fail without touching `outbound`.
pub fn execute<O: Outbound>(
    decision: &AclDecision,
    target: &Address,
    outbound: &O,
) -> Result<O::Stream, Error> {
    match decision.action {
        Action::Direct => outbound.direct(target),
        Action::Proxy => outbound.proxy(target),
        Action::Block => Err(Error::Blocked {
            addr: target.clone(),
        }),
        Action::Hijack => {
            if decision.argument.is_empty() {
                return Err(Error::invalid_address(format!("hijack of {}", target)));
            }
            let hijacked = target.with_host(&decision.argument);
            info!("hijack: {} -> {}", target, hijacked);
            outbound.direct(&hijacked)
        }
        Action::Unknown(code) => Err(Error::UnknownAction { code }),
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::acl::{FixedAction, NoAcl};
    use std::sync::Mutex;

    /// remembers every dial
    #[derive(Debug, Default)]
    pub struct RecordingOutbound {
        pub dialed: Mutex<Vec<(Action, Address)>>,
    }

    impl RecordingOutbound {
        pub fn dialed(&self) -> Vec<(Action, Address)> {
            self.dialed.lock().unwrap().clone()
        }
    }

    impl Outbound for RecordingOutbound {
        type Stream = Address;
        fn direct(&self, addr: &Address) -> Result<Address, Error> {
            self.dialed
                .lock()
                .unwrap()
                .push((Action::Direct, addr.clone()));
            Ok(addr.clone())
        }
        fn proxy(&self, addr: &Address) -> Result<Address, Error> {
            self.dialed
                .lock()
                .unwrap()
                .push((Action::Proxy, addr.clone()));
            Ok(addr.clone())
        }
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn defaults_per_side() {
        let target = addr("example.com:443");
        assert_eq!(
            Dispatcher::server(Arc::new(NoAcl)).decide(&target).action,
            Action::Direct
        );
        assert_eq!(
            Dispatcher::front_end(Arc::new(NoAcl)).decide(&target).action,
            Action::Proxy
        );
        assert_eq!(
            Dispatcher::front_end(Arc::new(FixedAction(Action::Block)))
                .decide(&target)
                .action,
            Action::Block
        );
    }

    #[test]
    fn direct_and_proxy() {
        let outbound = RecordingOutbound::default();
        let target = addr("1.2.3.4:80");
        execute(&Action::Direct.into(), &target, &outbound).unwrap();
        execute(&Action::Proxy.into(), &target, &outbound).unwrap();
        assert_eq!(
            outbound.dialed(),
            vec![(Action::Direct, target.clone()), (Action::Proxy, target)]
        );
    }

    #[test]
    fn hijack_keeps_port() {
        let outbound = RecordingOutbound::default();
        let decision = AclDecision::new(Action::Hijack, "10.0.0.5");
        let stream = execute(&decision, &addr("internal.example.com:443"), &outbound).unwrap();
        assert_eq!(stream, addr("10.0.0.5:443"));
        assert_eq!(outbound.dialed(), vec![(Action::Direct, addr("10.0.0.5:443"))]);
    }

    #[test]
    fn block_and_unknown_never_dial() {
        let outbound = RecordingOutbound::default();
        let target = addr("ads.example.com:80");
        assert!(matches!(
            execute(&Action::Block.into(), &target, &outbound),
            Err(Error::Blocked { .. })
        ));
        assert!(matches!(
            execute(&Action::Unknown(7).into(), &target, &outbound),
            Err(Error::UnknownAction { code: 7 })
        ));
        assert!(execute(&AclDecision::new(Action::Hijack, ""), &target, &outbound).is_err());
        assert!(outbound.dialed().is_empty());
    }
}
