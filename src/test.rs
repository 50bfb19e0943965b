#![cfg(test)]
//! Both halves over loopback, driven by a real SOCKS5 client.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use socks::*;

use crate::config::{ClientConfig, ServerConfig, SocksUser};
use crate::error::Error;
use crate::server::{SocksServer, TunnelServer};
use crate::server_command::ServerCommand;

fn free_port() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for strm in listener.incoming() {
            let mut strm = strm.unwrap();
            thread::spawn(move || {
                let mut rd = strm.try_clone().unwrap();
                io::copy(&mut rd, &mut strm).ok();
            });
        }
    });
    addr
}

fn wait_listening(addr: SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(addr).is_err() {
        assert!(Instant::now() < deadline, "{} is not listening", addr);
        thread::sleep(Duration::from_millis(50));
    }
}

struct Running<C> {
    tx: Sender<ServerCommand<C>>,
    th: JoinHandle<Result<(), Error>>,
}

impl<C> Running<C> {
    fn stop(self) {
        self.tx.send(ServerCommand::Terminate).unwrap();
        self.th.join().unwrap().unwrap();
    }
}

fn start_tunnel_server(password: &str) -> (SocketAddr, Running<crate::mux::MuxSession>) {
    let addr = free_port();
    let mut config = ServerConfig::new(addr.ip(), addr.port());
    config.set_password(Some(password)).set_obfs(Some("e2e key"));
    let (mut server, tx) = TunnelServer::new(&config).unwrap();
    let th = thread::spawn(move || server.serve());
    (addr, Running { tx, th })
}

fn client_config(tunnel: SocketAddr, auth: &str) -> ClientConfig {
    let acl = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("acl.example.yml");
    let mut config = ClientConfig::new(free_port(), tunnel.to_string());
    config
        .set_auth(Some(auth))
        .set_obfs(Some("e2e key"))
        .set_acl(Some(acl));
    config
}

/// retries while the tunnel server is still coming up
fn start_socks_server(config: &ClientConfig) -> Result<Running<TcpStream>, Error> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let (mut server, tx) = loop {
        match SocksServer::new(config) {
            Ok(server) => break server,
            Err(Error::Io(err)) if Instant::now() < deadline => {
                println!("retry: {}", err);
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(err),
        }
    };
    let th = thread::spawn(move || server.serve());
    wait_listening(config.listen);
    Ok(Running { tx, th })
}

fn echo_through<S: Read + Write>(mut conn: S, msg: &[u8]) -> Vec<u8> {
    conn.write_all(msg).unwrap();
    conn.flush().unwrap();
    let mut buf = vec![0; msg.len()];
    conn.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn relay_through_tunnel() {
    let echo = echo_server();
    let (tunnel, tunnel_server) = start_tunnel_server("secret");
    let config = client_config(tunnel, "secret");
    let front_end = start_socks_server(&config).unwrap();

    // by domain name, proxied and resolved at the tunnel server
    let conn = Socks5Stream::connect(
        config.listen,
        TargetAddr::Domain("localhost".to_owned(), echo.port()),
    )
    .unwrap();
    assert_eq!(echo_through(conn, b"hello tunnel"), b"hello tunnel");

    // by ip address
    let conn = Socks5Stream::connect(config.listen, echo).unwrap();
    assert_eq!(echo_through(conn, b"again"), b"again");

    front_end.stop();
    tunnel_server.stop();
}

#[test]
fn blocked_by_acl() {
    let (tunnel, tunnel_server) = start_tunnel_server("secret");
    let config = client_config(tunnel, "secret");
    let front_end = start_socks_server(&config).unwrap();

    let res = Socks5Stream::connect(
        config.listen,
        TargetAddr::Domain("ads.example.com".to_owned(), 80),
    );
    assert!(res.is_err());

    front_end.stop();
    tunnel_server.stop();
}

#[test]
fn wrong_tunnel_password() {
    let (tunnel, tunnel_server) = start_tunnel_server("secret");
    let config = client_config(tunnel, "guess");
    match start_socks_server(&config) {
        Err(Error::Auth(message)) => assert_eq!(message, "Wrong password"),
        Err(err) => panic!("unexpected error: {}", err),
        Ok(front_end) => {
            front_end.stop();
            panic!("front-end started with a wrong password");
        }
    }
    tunnel_server.stop();
}

#[test]
fn socks_user_pass() {
    let echo = echo_server();
    let (tunnel, tunnel_server) = start_tunnel_server("secret");
    let mut config = client_config(tunnel, "secret");
    config.set_socks_user(Some(SocksUser {
        username: "alice".into(),
        password: "s3cret".into(),
    }));
    let front_end = start_socks_server(&config).unwrap();

    let conn = Socks5Stream::connect_with_password(config.listen, echo, "alice", "s3cret").unwrap();
    assert_eq!(echo_through(conn, b"authorized"), b"authorized");

    assert!(Socks5Stream::connect_with_password(config.listen, echo, "alice", "guess").is_err());

    front_end.stop();
    tunnel_server.stop();
}
