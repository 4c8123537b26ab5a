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

use std::net::SocketAddr;

use hickory_proto::op::Message;
use tracing::{debug, instrument};

use crate::dns::Error;
use crate::dns::forwarder::{Forwarder, query_info, usable};
use crate::dns::message::rebind;
use crate::dns::server::{DnsServer, access_log};

const STRATEGY: &str = "serial";

/// Tries the upstream servers one after another, in order, until one answers.
pub struct SerialServer {
    servers: Vec<SocketAddr>,
    forwarder: Forwarder,
}

impl SerialServer {
    pub fn new(servers: Vec<SocketAddr>, forwarder: Forwarder) -> Result<Self, Error> {
        if servers.is_empty() {
            return Err(Error::NoUpstreams);
        }
        Ok(Self { servers, forwarder })
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }
}

#[async_trait::async_trait]
impl DnsServer for SerialServer {
    #[instrument(
        level = "debug",
        skip_all,
        fields(
            strategy = STRATEGY,
            query = ?request.queries().first().map(|q| q.query_type()),
            name = ?request.queries().first().map(|q| q.name().to_string()),
        ),
    )]
    async fn handle_query(&self, request: &Message, is_tcp: bool) -> Result<Message, Error> {
        let info = query_info(request, is_tcp, STRATEGY)?;
        if let Some(cached) = self.forwarder.lookup_cached(request, info) {
            access_log(request, STRATEGY, "cached", cached.answers().len());
            return Ok(cached);
        }

        let mut last_error = Error::NoUpstreams;
        for server in &self.servers {
            let result = self
                .forwarder
                .forward(*server, request, is_tcp, info)
                .await
                .and_then(|response| usable(*server, response));
            match result {
                Ok(response) => {
                    self.forwarder.store(&response);
                    access_log(request, STRATEGY, "forwarded", response.answers().len());
                    return Ok(rebind(request, response));
                }
                Err(e) => {
                    debug!(%server, "trying next upstream");
                    last_error = e;
                }
            }
        }

        access_log(request, STRATEGY, &format!("failed ({last_error})"), 0);
        Err(Error::UpstreamFailed(Box::new(last_error)))
    }

    fn start(&self) {
        if let Some(cache) = self.forwarder.cache() {
            cache.start();
        }
    }

    fn close(&self) {
        if let Some(cache) = self.forwarder.cache() {
            cache.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;

    use super::*;
    use crate::dns::AnswerCache;
    use crate::dns::message::addresses;
    use crate::test_helpers::dns::{MockTransport, ip, n, new_message, socket_addr};

    fn upstreams() -> Vec<SocketAddr> {
        vec![
            socket_addr("10.0.0.1:53"),
            socket_addr("10.0.0.2:53"),
            socket_addr("10.0.0.3:53"),
        ]
    }

    #[test]
    fn requires_upstreams() {
        let forwarder = Forwarder::new(Arc::new(MockTransport::new()));
        assert!(matches!(
            SerialServer::new(vec![], forwarder),
            Err(Error::NoUpstreams)
        ));
    }

    #[tokio::test]
    async fn first_answer_wins() {
        let (s1, s2, s3) = (upstreams()[0], upstreams()[1], upstreams()[2]);
        let transport = MockTransport::new()
            .answer(s1, "www.example.com.", &["1.1.1.1"])
            .answer(s2, "www.example.com.", &["2.2.2.2"]);
        let server =
            SerialServer::new(upstreams(), Forwarder::new(Arc::new(transport.clone()))).unwrap();

        let req = new_message(n("www.example.com."), RecordType::A);
        let resp = server.handle_query(&req, false).await.unwrap();
        assert_eq!(req.id(), resp.id());
        assert_eq!(vec![ip("1.1.1.1")], addresses(&resp));
        assert_eq!(1, transport.calls(s1));
        assert_eq!(0, transport.calls(s2));
        assert_eq!(0, transport.calls(s3));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_in_order() {
        let (s1, s2, s3) = (upstreams()[0], upstreams()[1], upstreams()[2]);
        let transport = MockTransport::new()
            .hang(s1)
            .respond(s2, ResponseCode::ServFail)
            .answer(s3, "www.example.com.", &["3.3.3.3"]);
        let forwarder =
            Forwarder::new(Arc::new(transport.clone())).with_timeout(Duration::from_secs(1));
        let server = SerialServer::new(upstreams(), forwarder).unwrap();

        let req = new_message(n("www.example.com."), RecordType::A);
        let resp = server.handle_query(&req, true).await.unwrap();
        assert_eq!(vec![ip("3.3.3.3")], addresses(&resp));
        assert_eq!(1, transport.calls(s1));
        assert_eq!(1, transport.calls(s2));
        assert_eq!(1, transport.calls(s3));
    }

    #[tokio::test]
    async fn nxdomain_is_an_answer() {
        let (s1, s2) = (upstreams()[0], upstreams()[1]);
        let transport = MockTransport::new().respond(s1, ResponseCode::NXDomain);
        let server =
            SerialServer::new(upstreams(), Forwarder::new(Arc::new(transport.clone()))).unwrap();

        let req = new_message(n("nope.example.com."), RecordType::A);
        let resp = server.handle_query(&req, false).await.unwrap();
        assert_eq!(ResponseCode::NXDomain, resp.response_code());
        assert_eq!(0, transport.calls(s2));
    }

    #[tokio::test]
    async fn all_upstreams_fail() {
        let transport = MockTransport::new();
        let server =
            SerialServer::new(upstreams(), Forwarder::new(Arc::new(transport.clone()))).unwrap();

        let req = new_message(n("www.example.com."), RecordType::A);
        let err = server.handle_query(&req, false).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamFailed(_)), "{err}");
        for s in upstreams() {
            assert_eq!(1, transport.calls(s));
        }
    }

    #[tokio::test]
    async fn answers_from_cache() {
        let s1 = upstreams()[0];
        let transport = MockTransport::new().answer(s1, "www.example.com.", &["1.1.1.1"]);
        let cache = Arc::new(AnswerCache::new());
        let server = SerialServer::new(
            upstreams(),
            Forwarder::new(Arc::new(transport.clone())).with_cache(cache.clone()),
        )
        .unwrap();
        server.start();

        let req = new_message(n("www.example.com."), RecordType::A);
        server.handle_query(&req, false).await.unwrap();
        let resp = server.handle_query(&req, false).await.unwrap();
        assert_eq!(vec![ip("1.1.1.1")], addresses(&resp));
        assert_eq!(1, transport.calls(s1));
        server.close();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_query_leaves_cache_untouched() {
        let (s1, s2) = (upstreams()[0], upstreams()[1]);
        let transport = Arc::new(
            MockTransport::new()
                .answer(s1, "www.example.com.", &["1.1.1.1"])
                .hang(s2),
        );
        let cache = Arc::new(AnswerCache::new());
        let warm = SerialServer::new(
            vec![s1],
            Forwarder::new(transport.clone()).with_cache(cache.clone()),
        )
        .unwrap();
        let hung = SerialServer::new(
            vec![s2],
            Forwarder::new(transport.clone()).with_cache(cache.clone()),
        )
        .unwrap();

        let req = new_message(n("www.example.com."), RecordType::A);
        warm.handle_query(&req, false).await.unwrap();
        let before = addresses(&cache.get(&req.queries()[0]).unwrap());

        // The caller gives up before the upstream answers.
        let other = new_message(n("other.example.com."), RecordType::A);
        let dropped =
            tokio::time::timeout(Duration::from_millis(10), hung.handle_query(&other, false)).await;
        assert!(dropped.is_err());
        assert_eq!(1, transport.calls(s2));

        assert_eq!(before, addresses(&cache.get(&req.queries()[0]).unwrap()));
        assert!(cache.get(&other.queries()[0]).is_none());
        assert_eq!(1, cache.len());
    }
}
