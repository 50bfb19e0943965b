use std::fmt;
use std::net::SocketAddr;

use log::*;

use crate::model::{Error, Method, SocksStream, UserPassStatus};

/// SOCKS authentication offered by the front-end.
pub trait AuthService: Send + Sync {
    /// the one method offered to every client
    fn method(&self) -> Method;

    /// sub-negotiation for `method()` after it has been selected
    fn authorize(&self, socks: &mut dyn SocksStream) -> Result<(), Error>;
}

/// `NoAuth` method compeller
#[derive(Debug, Clone, Default)]
pub struct NoAuthService;

impl NoAuthService {
    pub fn new() -> Self {
        Self
    }
}

impl AuthService for NoAuthService {
    fn method(&self) -> Method {
        Method::NoAuth
    }

    fn authorize(&self, _socks: &mut dyn SocksStream) -> Result<(), Error> {
        // pass through without any authentication
        Ok(())
    }
}

/// RFC1929 username/password checked by a callback.
pub struct UserPassService<F> {
    check: F,
}

impl<F> fmt::Debug for UserPassService<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UserPassService")
    }
}

impl<F> UserPassService<F>
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

/// Accept exactly one username/password pair.
pub fn single_user(
    username: String,
    password: String,
) -> UserPassService<impl Fn(&str, &str) -> bool + Send + Sync> {
    UserPassService::new(move |user: &str, pass: &str| user == username && pass == password)
}

impl<F> AuthService for UserPassService<F>
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn method(&self) -> Method {
        Method::UserPass
    }

    fn authorize(&self, socks: &mut dyn SocksStream) -> Result<(), Error> {
        let req = socks.recv_user_pass()?;
        if (self.check)(&req.username, &req.password) {
            socks.send_user_pass_status(UserPassStatus::Success)?;
            Ok(())
        } else {
            info!("socks auth failed: {}", req.username);
            socks.send_user_pass_status(UserPassStatus::Failure)?;
            Err(Error::UnrecognizedUsernamePassword)
        }
    }
}

/// Judges the auth token carried by a `ClientHello`.
pub trait TunnelAuthService: Send + Sync {
    /// Returns the verdict and a human readable message for the client.
    ///
    /// `send_bps` / `recv_bps` are the negotiated rates seen from the server.
    fn authenticate(
        &self,
        peer: SocketAddr,
        token: &[u8],
        send_bps: u64,
        recv_bps: u64,
    ) -> (bool, String);
}

/// Let every client in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TunnelAuthService for AcceptAll {
    fn authenticate(&self, _peer: SocketAddr, _token: &[u8], _send: u64, _recv: u64) -> (bool, String) {
        (true, "Welcome".to_owned())
    }
}

/// Compare the token with a shared password.
#[derive(Clone)]
pub struct PasswordAuth {
    password: Vec<u8>,
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PasswordAuth(..)")
    }
}

impl PasswordAuth {
    pub fn new<P: Into<Vec<u8>>>(password: P) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl TunnelAuthService for PasswordAuth {
    fn authenticate(&self, peer: SocketAddr, token: &[u8], _send: u64, _recv: u64) -> (bool, String) {
        if token == self.password.as_slice() {
            (true, "Welcome".to_owned())
        } else {
            debug!("wrong password from {}", peer);
            (false, "Wrong password".to_owned())
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::byte_stream::test::BufferStream;
    use crate::rw_socks_stream::{self as socks, ReadWriteStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// counts how often it was asked
    #[derive(Debug, Default)]
    pub struct CountingAuth {
        pub calls: AtomicUsize,
    }

    impl CountingAuth {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TunnelAuthService for CountingAuth {
        fn authenticate(&self, _p: SocketAddr, _t: &[u8], _s: u64, _r: u64) -> (bool, String) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (true, "counted".to_owned())
        }
    }

    fn user_pass_stream(user: &str, pass: &str) -> BufferStream {
        let mut buff = vec![];
        socks::test::write_user_pass(&mut buff, user, pass).unwrap();
        BufferStream::with_buffer(buff.into(), vec![].into())
    }

    #[test]
    fn user_pass() {
        let service = single_user("alice".into(), "s3cret".into());
        assert_eq!(service.method(), Method::UserPass);

        let strm = user_pass_stream("alice", "s3cret");
        service
            .authorize(&mut ReadWriteStream::new(strm.clone()))
            .unwrap();
        // version 1, status 0
        assert_eq!(strm.written(), vec![1, 0]);

        let strm = user_pass_stream("alice", "guess");
        assert!(matches!(
            service.authorize(&mut ReadWriteStream::new(strm.clone())),
            Err(Error::UnrecognizedUsernamePassword)
        ));
        assert_eq!(strm.written()[0], 1);
        assert_ne!(strm.written()[1], 0);
    }

    #[test]
    fn password() {
        let peer = "127.0.0.1:1".parse().unwrap();
        let auth = PasswordAuth::new("secret");
        assert_eq!(
            auth.authenticate(peer, b"secret", 1, 1),
            (true, "Welcome".to_owned())
        );
        assert_eq!(
            auth.authenticate(peer, b"nope", 1, 1),
            (false, "Wrong password".to_owned())
        );
        assert!(AcceptAll.authenticate(peer, b"", 1, 1).0);
    }
}
