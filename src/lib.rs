//! This crate provides a library for constructing a rate-negotiated tunneling proxy.
//!
//! # Feature
//!
//! A deployment has two halves.
//!
//! * The tunnel server accepts multiplexed sessions, authenticates them and
//!   relays each stream to the destination it names.
//! * The SOCKS5 front-end runs near the user, accepts `CONNECT` requests and
//!   forwards them through one shared session to the tunnel server.
//!
//! ## Authentication
//!
//! The tunnel handshake carries an opaque token checked by the server
//! (a shared password when configured).
//! The SOCKS5 front-end accepts `X'00'` (`NO AUTHENTICATION REQUIRED`) or
//! `X'02'` (`USERNAME/PASSWORD`) when a user is configured.
//!
//! ## Command
//!
//! Only `CONNECT` command is supported.
//! UDP relaying is not supported.
//!
//! ## Rate negotiation
//!
//! The client announces the bandwidth it wants in each direction.
//! The server clamps it to its ceiling and pacing follows the result.
//!
//! ## ACL
//!
//! Both sides consult an optional ACL deciding, per destination, whether a
//! request is dialed directly, proxied, blocked or hijacked to another host.
//! Without a match the server dials directly and the front-end proxies.
//!
//! ## Obfuscation
//!
//! With a shared key every byte on the wire between the two halves is XORed
//! with a keystream, hiding the protocol from casual inspection.
//! `ObfsPktStream` applies the same keystream to datagram transports, which
//! the bundled server and front-end do not use.
//!
//! # Usage
//!
//! ## Server
//!
//! Here is a minimum server example.
//!
//! ```rust
//! use std::{time::Duration, thread};
//! use tunnelkeeper::*;
//! let mut config = ServerConfig::new("127.0.0.1".parse().unwrap(), 36713);
//! config.set_password(Some("secret"));
//! let (mut server, tx) = TunnelServer::new(&config).unwrap();
//! let th = thread::spawn(move || server.serve());
//! thread::sleep(Duration::from_secs(1));
//! tx.send(ServerCommand::Terminate).unwrap();
//! th.join().unwrap().unwrap();
//! ```
//!
//! ## ACL
//!
//! Rules are matched in order, the first match wins.
//!
//! ```rust
//! use tunnelkeeper::acl::*;
//! use regex::Regex;
//! let mut acl = AclEngine::default();
//! acl.push(AclRule::new(
//!     Action::Block,
//!     "",
//!     RulePattern::Specif(Regex::new(r"\A(.+\.)?ads\.example\.com\z").unwrap().into()),
//! ))
//! .set_fallback(Some(Action::Proxy));
//! let decision = acl.lookup(Some("ads.example.com"), None).unwrap();
//! assert_eq!(decision.action, Action::Block);
//! ```

pub mod acceptor;
pub mod acl;
mod auth_service;
mod byte_stream;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod error;
pub mod model;
mod mux;
mod obfs;
pub mod observer;
mod pkt_stream;
mod raw_message;
mod relay;
mod rw_socks_stream;
mod rw_tunnel_stream;
pub mod server;
pub mod server_command;
mod session;
mod socks_session;
mod tcp_listener_ext;
mod test;
mod thread;
mod transport;
mod tunnel_client;
mod tunnel_session;

pub use auth_service::{
    single_user, AcceptAll, AuthService, NoAuthService, PasswordAuth, TunnelAuthService,
    UserPassService,
};
pub use byte_stream::{BoxedStream, ByteStream};
pub use config::*;
pub use model::model::*;
pub use mux::{MuxBinder, MuxDialer, MuxSession, MuxStream};
pub use obfs::{ObfsPktStream, ObfsStream, Obfuscator, XorObfuscator};
pub use pkt_stream::PktStream;
pub use server::*;
pub use server_command::*;
pub use session::{Connection, Interrupter, SessionHandler, SessionId};
pub use socks_session::SocksHandler;
pub use transport::{
    CongestionControl, CongestionFactory, FixedRate, FixedRateFactory, SessionDialer,
    TransportDefault, TransportSession,
};
pub use tunnel_client::{StreamDialer, TunnelClient};
pub use tunnel_session::TunnelHandler;
