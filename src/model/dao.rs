use super::error::Error;
use super::model::*;

/// SOCKS5 messages read/written by the front-end
pub trait SocksStream {
    fn recv_method_candidates(&mut self) -> Result<MethodCandidates, Error>;
    fn send_method_selection(&mut self, method: MethodSelection) -> Result<(), Error>;
    fn recv_user_pass(&mut self) -> Result<UserPassRequest, Error>;
    fn send_user_pass_status(&mut self, status: UserPassStatus) -> Result<(), Error>;
    fn recv_connect_request(&mut self) -> Result<ConnectRequest, Error>;
    fn send_connect_reply(&mut self, reply: ConnectReply) -> Result<(), Error>;
}

/// Preambles exchanged on tunnel streams.
///
/// Both directions are provided since the same codec serves the client and the server.
pub trait TunnelStream {
    fn recv_client_hello(&mut self) -> Result<ClientHello, Error>;
    fn send_client_hello(&mut self, hello: &ClientHello) -> Result<(), Error>;
    fn recv_server_hello(&mut self) -> Result<ServerHello, Error>;
    fn send_server_hello(&mut self, hello: &ServerHello) -> Result<(), Error>;
    fn recv_stream_request(&mut self) -> Result<StreamRequest, Error>;
    fn send_stream_request(&mut self, req: &StreamRequest) -> Result<(), Error>;
    fn recv_stream_response(&mut self) -> Result<StreamResponse, Error>;
    fn send_stream_response(&mut self, resp: &StreamResponse) -> Result<(), Error>;
}
