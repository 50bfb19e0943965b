use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::*;
use serde::*;

use crate::acl::{AclEngine, AclLookup, NoAcl};
use crate::auth_service::{self, AcceptAll, AuthService, NoAuthService, PasswordAuth, TunnelAuthService};
use crate::error::Error;
use crate::model::{Address, IpAddr, Ipv4Addr, Rate, RateCeiling, SocketAddr, DIAL_TIMEOUT};
use crate::obfs::{Obfuscator, XorObfuscator};
use crate::transport::{CongestionFactory, FixedRateFactory, TransportDefault};

/// Congestion control attached after a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Congestion {
    /// whatever the transport does by itself
    Default,
    /// pace sends at the negotiated rate
    FixedRate,
}

impl Default for Congestion {
    fn default() -> Self {
        Congestion::Default
    }
}

impl Congestion {
    pub fn factory(&self) -> Arc<dyn CongestionFactory> {
        match self {
            Congestion::Default => Arc::new(TransportDefault),
            Congestion::FixedRate => Arc::new(FixedRateFactory),
        }
    }
}

mod secs {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `0` disables the timeout
mod opt_secs {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs))
    }
}

fn load_acl(path: &Option<PathBuf>) -> Result<Arc<dyn AclLookup>, Error> {
    match path {
        Some(path) => Ok(Arc::new(AclEngine::with_file(path)?)),
        None => Ok(Arc::new(NoAcl)),
    }
}

fn load_obfs(key: &Option<String>) -> Result<Option<Arc<dyn Obfuscator>>, Error> {
    match key {
        Some(key) => Ok(Some(Arc::new(XorObfuscator::new(key)?))),
        None => Ok(None),
    }
}

/// Tunnel server settings.
///
/// ```yaml
/// listen: 0.0.0.0:36712
/// rate_ceiling:
///   send_bps: 12500000
///   recv_bps: 12500000
/// password: secret
/// obfs: some key
/// acl: /etc/tunnelkeeper/acl.yml
/// congestion: FixedRate
/// idle_timeout: 300
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub rate_ceiling: RateCeiling,
    /// clients must present this token
    pub password: Option<String>,
    pub obfs: Option<String>,
    /// ACL rule file
    pub acl: Option<PathBuf>,
    pub congestion: Congestion,
    /// relay idle timeout in seconds
    #[serde(deserialize_with = "opt_secs::deserialize")]
    pub idle_timeout: Option<Duration>,
    #[serde(deserialize_with = "opt_secs::deserialize")]
    pub accept_timeout: Option<Duration>,
    #[serde(deserialize_with = "secs::deserialize")]
    pub dial_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 36712),
            rate_ceiling: RateCeiling::default(),
            password: None,
            obfs: None,
            acl: None,
            congestion: Congestion::Default,
            idle_timeout: None,
            accept_timeout: Some(Duration::from_secs(3)),
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn new(server_ip: IpAddr, server_port: u16) -> Self {
        Self {
            listen: SocketAddr::new(server_ip, server_port),
            ..Self::default()
        }
    }

    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref())?;
        let config: ServerConfig = serde_yaml::from_reader(file)?;
        debug!("server config: {:?}", config);
        Ok(config)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn acl(&self) -> Result<Arc<dyn AclLookup>, Error> {
        load_acl(&self.acl)
    }

    pub fn obfuscator(&self) -> Result<Option<Arc<dyn Obfuscator>>, Error> {
        load_obfs(&self.obfs)
    }

    pub fn auth_service(&self) -> Arc<dyn TunnelAuthService> {
        match &self.password {
            Some(password) => Arc::new(PasswordAuth::new(password.as_bytes())),
            None => Arc::new(AcceptAll),
        }
    }

    pub fn set_server_addr(&mut self, addr: SocketAddr) -> &mut Self {
        self.listen = addr;
        self
    }

    pub fn set_rate_ceiling(&mut self, ceiling: RateCeiling) -> &mut Self {
        self.rate_ceiling = ceiling;
        self
    }

    pub fn set_password<S: Into<String>>(&mut self, password: Option<S>) -> &mut Self {
        self.password = password.map(Into::into);
        self
    }

    pub fn set_obfs<S: Into<String>>(&mut self, key: Option<S>) -> &mut Self {
        self.obfs = key.map(Into::into);
        self
    }

    pub fn set_acl(&mut self, path: Option<PathBuf>) -> &mut Self {
        self.acl = path;
        self
    }

    pub fn set_congestion(&mut self, congestion: Congestion) -> &mut Self {
        self.congestion = congestion;
        self
    }

    pub fn set_idle_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.idle_timeout = dur;
        self
    }

    pub fn set_accept_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.accept_timeout = dur;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SocksUser {
    pub username: String,
    pub password: String,
}

/// SOCKS front-end and tunnel client settings.
///
/// ```yaml
/// listen: 127.0.0.1:1080
/// server: tunnel.example.com:36712
/// rate:
///   send_bps: 2500000
///   recv_bps: 12500000
/// auth: secret
/// socks_user:
///   username: alice
///   password: s3cret
/// tcp_timeout: 300
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// SOCKS5 listen address
    pub listen: SocketAddr,
    /// tunnel server, `host:port`
    pub server: String,
    /// requested rate, seen from the client
    pub rate: Rate,
    /// token presented to the tunnel server
    pub auth: Option<String>,
    pub obfs: Option<String>,
    pub acl: Option<PathBuf>,
    pub socks_user: Option<SocksUser>,
    pub congestion: Congestion,
    /// SOCKS negotiation and relay idle timeout in seconds
    #[serde(deserialize_with = "opt_secs::deserialize")]
    pub tcp_timeout: Option<Duration>,
    #[serde(deserialize_with = "opt_secs::deserialize")]
    pub accept_timeout: Option<Duration>,
    #[serde(deserialize_with = "secs::deserialize")]
    pub dial_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            listen: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1080),
            server: "127.0.0.1:36712".to_owned(),
            // 100 Mbps each way
            rate: Rate::new(12_500_000, 12_500_000),
            auth: None,
            obfs: None,
            acl: None,
            socks_user: None,
            congestion: Congestion::Default,
            tcp_timeout: Some(Duration::from_secs(300)),
            accept_timeout: Some(Duration::from_secs(3)),
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn new<S: Into<String>>(listen: SocketAddr, server: S) -> Self {
        Self {
            listen,
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref())?;
        let config: ClientConfig = serde_yaml::from_reader(file)?;
        debug!("client config: {:?}", config);
        Ok(config)
    }

    pub fn server_addr(&self) -> Result<Address, Error> {
        Address::parse(&self.server)
            .map_err(|err| Error::invalid_config(format!("server: {}", err)))
    }

    pub fn acl(&self) -> Result<Arc<dyn AclLookup>, Error> {
        load_acl(&self.acl)
    }

    pub fn obfuscator(&self) -> Result<Option<Arc<dyn Obfuscator>>, Error> {
        load_obfs(&self.obfs)
    }

    pub fn auth_service(&self) -> Arc<dyn AuthService> {
        match &self.socks_user {
            Some(user) => Arc::new(auth_service::single_user(
                user.username.clone(),
                user.password.clone(),
            )),
            None => Arc::new(NoAuthService::new()),
        }
    }

    pub fn set_server<S: Into<String>>(&mut self, server: S) -> &mut Self {
        self.server = server.into();
        self
    }

    pub fn set_rate(&mut self, rate: Rate) -> &mut Self {
        self.rate = rate;
        self
    }

    pub fn set_auth<S: Into<String>>(&mut self, auth: Option<S>) -> &mut Self {
        self.auth = auth.map(Into::into);
        self
    }

    pub fn set_obfs<S: Into<String>>(&mut self, key: Option<S>) -> &mut Self {
        self.obfs = key.map(Into::into);
        self
    }

    pub fn set_acl(&mut self, path: Option<PathBuf>) -> &mut Self {
        self.acl = path;
        self
    }

    pub fn set_socks_user(&mut self, user: Option<SocksUser>) -> &mut Self {
        self.socks_user = user;
        self
    }

    pub fn set_congestion(&mut self, congestion: Congestion) -> &mut Self {
        self.congestion = congestion;
        self
    }

    pub fn set_tcp_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.tcp_timeout = dur;
        self
    }

    pub fn set_accept_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.accept_timeout = dur;
        self
    }
}
