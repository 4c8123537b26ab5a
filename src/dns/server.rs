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

use hickory_proto::op::Message;
use tracing::event;

use crate::dns::{
    ConcurrentServer, DohServer, Error, FakeDnsServer, InternalDns, SerialServer, StaticServer,
};

/// Answers DNS queries.
///
/// The request is answered as a whole: the returned message is a complete response carrying the
/// request's id and questions. A negative answer such as NXDOMAIN is a successful return.
#[async_trait::async_trait]
pub trait DnsServer: Send + Sync {
    async fn handle_query(&self, request: &Message, is_tcp: bool) -> Result<Message, Error>;

    /// Starts any background work of the server. Calling it more than once has no effect.
    fn start(&self) {}

    /// Stops any background work of the server. Safe to call without a prior start.
    fn close(&self) {}
}

/// The closed set of server strategies, selected from configuration.
pub enum Server {
    Static(StaticServer),
    Serial(SerialServer),
    Concurrent(ConcurrentServer),
    Doh(DohServer),
    Fake(FakeDnsServer),
    Internal(InternalDns),
}

impl Server {
    pub fn strategy(&self) -> &'static str {
        match self {
            Server::Static(_) => "static",
            Server::Serial(_) => "serial",
            Server::Concurrent(_) => "concurrent",
            Server::Doh(_) => "doh",
            Server::Fake(_) => "fake",
            Server::Internal(_) => "internal",
        }
    }

    fn inner(&self) -> &dyn DnsServer {
        match self {
            Server::Static(s) => s,
            Server::Serial(s) => s,
            Server::Concurrent(s) => s,
            Server::Doh(s) => s,
            Server::Fake(s) => s,
            Server::Internal(s) => s,
        }
    }
}

#[async_trait::async_trait]
impl DnsServer for Server {
    async fn handle_query(&self, request: &Message, is_tcp: bool) -> Result<Message, Error> {
        self.inner().handle_query(request, is_tcp).await
    }

    fn start(&self) {
        self.inner().start()
    }

    fn close(&self) {
        self.inner().close()
    }
}

impl From<StaticServer> for Server {
    fn from(s: StaticServer) -> Self {
        Server::Static(s)
    }
}

impl From<SerialServer> for Server {
    fn from(s: SerialServer) -> Self {
        Server::Serial(s)
    }
}

impl From<ConcurrentServer> for Server {
    fn from(s: ConcurrentServer) -> Self {
        Server::Concurrent(s)
    }
}

impl From<DohServer> for Server {
    fn from(s: DohServer) -> Self {
        Server::Doh(s)
    }
}

impl From<FakeDnsServer> for Server {
    fn from(s: FakeDnsServer) -> Self {
        Server::Fake(s)
    }
}

impl From<InternalDns> for Server {
    fn from(s: InternalDns) -> Self {
        Server::Internal(s)
    }
}

/// Emits one access log event for a handled query.
pub(crate) fn access_log(request: &Message, strategy: &str, result: &str, answers: usize) {
    let query = request.queries().first();
    event!(
        target: "dns",
        parent: None,
        tracing::Level::DEBUG,

        strategy = strategy,
        query = query.map(|q| q.query_type().to_string()),
        domain = query.map(|q| q.name().to_string()),

        result = result,
        answers = answers,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticRecord;
    use crate::dns::message::addresses;
    use crate::test_helpers::dns::{ip, n, new_message};
    use hickory_proto::rr::RecordType;

    #[tokio::test]
    async fn delegates_to_variant() {
        let server = Server::from(StaticServer::new([(
            n("www.example.com"),
            StaticRecord::Ips(vec![ip("1.2.3.4")]),
        )]));
        assert_eq!("static", server.strategy());
        server.start();

        let req = new_message(n("www.example.com."), RecordType::A);
        let resp = server.handle_query(&req, false).await.unwrap();
        assert_eq!(vec![ip("1.2.3.4")], addresses(&resp));
        server.close();
    }
}
