// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use hickory_proto::xfer::Protocol;
use hickory_server::ServerFuture;
use hickory_server::authority::MessageRequest;
use hickory_server::server::Request;
use tracing::{info, warn};

use crate::dns::handler::Handler;
use crate::dns::message::{error_reply, first_question, ip_record, is_record_type, reply_to};
use crate::dns::name_util::canonical;
use crate::dns::{Error, StaticServer, Transport};
use crate::socket::{DefaultSocketFactory, SocketFactory};

const TTL: u32 = 5;
const TCP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A short-hand helper for constructing a [Name].
pub fn n<S: AsRef<str>>(name: S) -> Name {
    Name::from_utf8(name).unwrap()
}

/// Creates an A record for the name and IP.
pub fn a(name: Name, addr: Ipv4Addr) -> Record {
    Record::from_rdata(name, TTL, RData::A(A(addr)))
}

/// Creates an AAAA record for the name and IP.
pub fn aaaa(name: Name, addr: Ipv6Addr) -> Record {
    Record::from_rdata(name, TTL, RData::AAAA(AAAA(addr)))
}

/// Creates a CNAME record for the given canonical name.
pub fn cname(name: Name, canonical_name: Name) -> Record {
    Record::from_rdata(name, TTL, RData::CNAME(CNAME(canonical_name)))
}

/// Constructs a new [Message] of type [MessageType::Query];
pub fn new_message(name: Name, rr_type: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(123);
    msg.set_message_type(MessageType::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, rr_type));
    msg
}

/// Converts the given [Message] into a server-side [Request] with dummy values for
/// the client IP and protocol.
pub fn server_request(msg: &Message, client_addr: SocketAddr, protocol: Protocol) -> Request {
    let wire_bytes = msg.to_vec().unwrap();
    let msg_request = MessageRequest::from_bytes(&wire_bytes).unwrap();
    Request::new(msg_request, client_addr, protocol)
}

/// Creates a A-record [Request] for the given name.
pub fn a_request(name: Name, client_addr: SocketAddr, protocol: Protocol) -> Request {
    server_request(&new_message(name, RecordType::A), client_addr, protocol)
}

/// Creates a AAAA-record [Request] for the given name.
pub fn aaaa_request(name: Name, client_addr: SocketAddr, protocol: Protocol) -> Request {
    server_request(&new_message(name, RecordType::AAAA), client_addr, protocol)
}

/// Helper for parsing a [SocketAddr] string.
pub fn socket_addr<S: AsRef<str>>(socket_addr: S) -> SocketAddr {
    socket_addr.as_ref().parse().unwrap()
}

/// Helper for parsing a [IpAddr] string.
pub fn ip<S: AsRef<str>>(addr: S) -> IpAddr {
    addr.as_ref().parse().unwrap()
}

/// Helper for parsing a [Ipv4Addr] string.
pub fn ipv4<S: AsRef<str>>(addr: S) -> Ipv4Addr {
    addr.as_ref().parse().unwrap()
}

/// Helper for parsing a [Ipv6Addr] string.
pub fn ipv6<S: AsRef<str>>(addr: S) -> Ipv6Addr {
    addr.as_ref().parse().unwrap()
}

/// How a scripted upstream behaves.
#[derive(Clone, Default)]
struct Script {
    answers: HashMap<Name, Vec<IpAddr>>,
    code: Option<ResponseCode>,
    delay: Option<Duration>,
    hang: bool,
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<SocketAddr, Script>,
    calls: HashMap<SocketAddr, usize>,
}

/// A [Transport] with scripted upstreams. Unscripted upstreams refuse the connection, and a
/// scripted upstream replies NXDOMAIN for names it has no answer for.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(self, server: SocketAddr, f: impl FnOnce(&mut Script)) -> Self {
        f(self
            .state
            .lock()
            .unwrap()
            .scripts
            .entry(server)
            .or_default());
        self
    }

    /// Answers queries for the name with the addresses of the queried family.
    pub fn answer(self, server: SocketAddr, name: &str, ips: &[&str]) -> Self {
        let ips: Vec<IpAddr> = ips.iter().map(|s| ip(s)).collect();
        self.script(server, |s| {
            s.answers.insert(canonical(&n(name)), ips);
        })
    }

    /// Replies to every query with an empty response carrying the code.
    pub fn respond(self, server: SocketAddr, code: ResponseCode) -> Self {
        self.script(server, |s| s.code = Some(code))
    }

    /// Never replies.
    pub fn hang(self, server: SocketAddr) -> Self {
        self.script(server, |s| s.hang = true)
    }

    /// Waits before replying.
    pub fn delay(self, server: SocketAddr, delay: Duration) -> Self {
        self.script(server, |s| s.delay = Some(delay))
    }

    /// How many exchanges were started with the server.
    pub fn calls(&self, server: SocketAddr) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&server)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn exchange(
        &self,
        server: SocketAddr,
        request: &Message,
        _is_tcp: bool,
    ) -> Result<Message, Error> {
        let script = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(server).or_default() += 1;
            state.scripts.get(&server).cloned()
        };
        let Some(script) = script else {
            return Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()));
        };
        if script.hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = script.code {
            return Ok(error_reply(request, code));
        }

        let question = first_question(request)?;
        let Some(ips) = script.answers.get(&canonical(question.name())) else {
            return Ok(error_reply(request, ResponseCode::NXDomain));
        };
        let mut reply = reply_to(request);
        for addr in ips
            .iter()
            .filter(|addr| is_record_type(addr, question.query_type()))
        {
            reply.add_answer(ip_record(question.name().clone(), *addr, TTL));
        }
        Ok(reply)
    }
}

/// A [StaticServer] listening on localhost UDP and TCP sockets.
pub struct TestDnsServer {
    tcp: SocketAddr,
    udp: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl TestDnsServer {
    pub fn tcp_address(&self) -> SocketAddr {
        self.tcp
    }

    pub fn udp_address(&self) -> SocketAddr {
        self.udp
    }
}

impl Drop for TestDnsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// run_dns serves the records over real sockets, so transports can be tested end to end.
pub async fn run_dns(records: StaticServer) -> anyhow::Result<TestDnsServer> {
    let factory = DefaultSocketFactory;
    let local = socket_addr("127.0.0.1:0");

    let mut server = ServerFuture::new(Handler::new(Arc::new(records)));
    let tcp_listener = factory.tcp_bind(local)?;
    let tcp = tcp_listener.local_addr()?;
    server.register_listener(tcp_listener, TCP_REQUEST_TIMEOUT);
    let udp_socket = factory.udp_bind(local)?;
    let udp = udp_socket.local_addr()?;
    server.register_socket(udp_socket);
    info!(%tcp, %udp, "started test dns server");

    let task = tokio::spawn(async move {
        if let Err(e) = server.block_until_done().await {
            warn!("test dns server stopped: {e}");
        }
    });
    Ok(TestDnsServer { tcp, udp, task })
}
