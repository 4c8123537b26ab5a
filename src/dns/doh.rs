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

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsOption};
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use ipnet::IpNet;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::dns::forwarder::{DEFAULT_TIMEOUT, query_info, usable};
use crate::dns::message::rebind;
use crate::dns::metrics::{
    CacheHit, DnsRequest, ForwardedDuration, ForwardedFailure, ForwardedRequest, Metrics,
};
use crate::dns::server::{DnsServer, access_log};
use crate::dns::{AnswerCache, Error};
use crate::metrics::{DeferRecorder, IncrementRecorder, Recorder};

pub const DNS_MESSAGE: &str = "application/dns-message";

const STRATEGY: &str = "doh";

/// Source prefix announced in the client subnet option for IPv4 clients.
const ECS_PREFIX_V4: u8 = 24;
/// Source prefix announced in the client subnet option for IPv6 clients.
const ECS_PREFIX_V6: u8 = 56;

/// Default EDNS payload size advertised when the request carries no EDNS record.
const EDNS_PAYLOAD: u16 = 1232;

/// Performs the HTTP exchange of a DNS-over-HTTPS query. Callers inject their own implementation
/// to route the request through a proxy.
#[async_trait::async_trait]
pub trait HttpHandler: Send + Sync {
    /// POSTs the body and returns the response body of a successful response.
    async fn post(&self, uri: &Uri, content_type: &str, body: Bytes) -> Result<Bytes, Error>;
}

/// An [HttpHandler] that connects directly, trusting the platform's root certificates.
#[derive(Clone)]
pub struct HyperHttpHandler {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperHttpHandler {
    pub fn new() -> Result<Self, Error> {
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl HttpHandler for HyperHttpHandler {
    async fn post(&self, uri: &Uri, content_type: &str, body: Bytes) -> Result<Bytes, Error> {
        let req = Request::post(uri.clone())
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, content_type)
            .body(Full::new(body))
            .map_err(|e| Error::Http(Box::new(e)))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Http(Box::new(e)))?;
        if !resp.status().is_success() {
            return Err(Error::HttpStatus(resp.status()));
        }
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Http(Box::new(e)))?;
        Ok(body.to_bytes())
    }
}

/// Resolves queries over DNS-over-HTTPS (RFC 8484) using the POST method.
pub struct DohServer {
    url: Uri,
    handler: Arc<dyn HttpHandler>,
    client_ip: Option<IpAddr>,
    timeout: Duration,
    cache: Option<Arc<AnswerCache>>,
    metrics: Arc<Metrics>,
}

impl DohServer {
    pub fn new(url: Uri, handler: Arc<dyn HttpHandler>) -> Self {
        Self {
            url,
            handler,
            client_ip: None,
            timeout: DEFAULT_TIMEOUT,
            cache: None,
            metrics: Default::default(),
        }
    }

    /// Announces the address in an EDNS client subnet option, so the upstream can pick answers
    /// close to the client.
    pub fn with_client_ip(mut self, client_ip: IpAddr) -> Self {
        self.client_ip = Some(client_ip);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, cache: Arc<AnswerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// Encodes the request as sent over HTTP: id zero, plus the client subnet when configured.
    pub fn pack(&self, request: &Message) -> Result<Bytes, Error> {
        let mut msg = request.clone();
        msg.set_id(0);
        if let Some(client_ip) = self.client_ip {
            let mut edns = msg.extensions().clone().unwrap_or_else(|| {
                let mut edns = Edns::new();
                edns.set_max_payload(EDNS_PAYLOAD);
                edns
            });
            edns.options_mut()
                .insert(EdnsOption::Subnet(client_subnet(client_ip)));
            msg.set_edns(edns);
        }
        Ok(Bytes::from(msg.to_vec()?))
    }

    async fn exchange(&self, request: &Message) -> Result<Message, Error> {
        let body = self.pack(request)?;
        let resp = tokio::time::timeout(
            self.timeout,
            self.handler.post(&self.url, DNS_MESSAGE, body),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(self.url.to_string())))?;
        Ok(Message::from_vec(&resp)?)
    }
}

fn client_subnet(addr: IpAddr) -> ClientSubnet {
    let prefix = match addr {
        IpAddr::V4(_) => ECS_PREFIX_V4,
        IpAddr::V6(_) => ECS_PREFIX_V6,
    };
    // Host bits past the announced prefix must not leak.
    let network = IpNet::new(addr, prefix)
        .map(|net| net.network())
        .unwrap_or(addr);
    ClientSubnet::new(network, prefix, 0)
}

#[async_trait::async_trait]
impl DnsServer for DohServer {
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
        self.metrics.increment(&DnsRequest(info));
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(info.query)) {
            self.metrics.increment(&CacheHit(info));
            access_log(request, STRATEGY, "cached", cached.answers().len());
            return Ok(rebind(request, cached));
        }

        self.metrics.increment(&ForwardedRequest(info));
        let start = Instant::now();
        let _duration = self
            .metrics
            .defer_record(|metrics| metrics.record(&ForwardedDuration(info), start.elapsed()));

        let result = self
            .exchange(request)
            .await
            .and_then(|response| usable(&self.url, response));
        match result {
            Ok(response) => {
                debug!(rcode=%response.response_code(), "doh answered");
                if let Some(cache) = &self.cache {
                    cache.set(&response);
                }
                access_log(request, STRATEGY, "forwarded", response.answers().len());
                Ok(rebind(request, response))
            }
            Err(e) => {
                warn!(url=%self.url, err=%e, "doh query failed");
                self.metrics.increment(&ForwardedFailure(info));
                access_log(request, STRATEGY, &format!("failed ({e})"), 0);
                Err(Error::UpstreamFailed(Box::new(e)))
            }
        }
    }

    fn start(&self) {
        if let Some(cache) = &self.cache {
            cache.start();
        }
    }

    fn close(&self) {
        if let Some(cache) = &self.cache {
            cache.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::RecordType;
    use hickory_proto::rr::rdata::opt::EdnsCode;

    use crate::dns::message::{addresses, error_reply, reply_to};
    use crate::test_helpers::dns::{a, ip, ipv4, n, new_message};

    /// Answers every query with a fixed address, remembering what it was sent.
    #[derive(Default)]
    struct FakeHttp {
        sent: Mutex<Vec<(String, String, Message)>>,
        status: Option<http::StatusCode>,
        rcode: Option<ResponseCode>,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl HttpHandler for FakeHttp {
        async fn post(&self, uri: &Uri, content_type: &str, body: Bytes) -> Result<Bytes, Error> {
            if let Some(status) = self.status {
                return Err(Error::HttpStatus(status));
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            let req = Message::from_vec(&body)?;
            self.sent
                .lock()
                .unwrap()
                .push((uri.to_string(), content_type.to_string(), req.clone()));
            if let Some(code) = self.rcode {
                return Ok(Bytes::from(error_reply(&req, code).to_vec()?));
            }
            let mut reply = reply_to(&req);
            reply.add_answer(a(req.queries()[0].name().clone(), ipv4("9.9.9.9")));
            Ok(Bytes::from(reply.to_vec()?))
        }
    }

    fn url() -> Uri {
        Uri::from_static("https://dns.example.com/dns-query")
    }

    #[tokio::test]
    async fn posts_wire_message() {
        let http = Arc::new(FakeHttp::default());
        let server = DohServer::new(url(), http.clone());

        let req = new_message(n("www.example.com."), RecordType::A);
        let resp = server.handle_query(&req, false).await.unwrap();
        assert_eq!(req.id(), resp.id());
        assert_eq!(vec![ip("9.9.9.9")], addresses(&resp));

        let sent = http.sent.lock().unwrap();
        assert_eq!(1, sent.len());
        let (uri, content_type, msg) = &sent[0];
        assert_eq!("https://dns.example.com/dns-query", uri);
        assert_eq!(DNS_MESSAGE, content_type);
        assert_eq!(0, msg.id());
        assert_eq!(req.queries(), msg.queries());
        assert!(msg.extensions().is_none());
    }

    #[tokio::test]
    async fn attaches_client_subnet() {
        let http = Arc::new(FakeHttp::default());
        let server = DohServer::new(url(), http.clone()).with_client_ip(ip("1.2.3.4"));

        let req = new_message(n("www.example.com."), RecordType::A);
        server.handle_query(&req, false).await.unwrap();

        let sent = http.sent.lock().unwrap();
        let edns = sent[0].2.extensions().as_ref().unwrap();
        assert!(edns.option(EdnsCode::Subnet).is_some());
    }

    #[test]
    fn client_subnet_masks_host_bits() {
        assert_eq!(
            ClientSubnet::new(ip("1.2.3.0"), 24, 0),
            client_subnet(ip("1.2.3.4"))
        );
        assert_eq!(
            ClientSubnet::new(ip("2001:db8:1:200::"), 56, 0),
            client_subnet(ip("2001:db8:1:2ff::1"))
        );
    }

    #[tokio::test]
    async fn http_failure() {
        let http = Arc::new(FakeHttp {
            status: Some(http::StatusCode::BAD_GATEWAY),
            ..Default::default()
        });
        let server = DohServer::new(url(), http);
        let req = new_message(n("www.example.com."), RecordType::A);
        assert!(matches!(
            server.handle_query(&req, false).await,
            Err(Error::UpstreamFailed(e)) if matches!(*e, Error::HttpStatus(_))
        ));
    }

    #[tokio::test]
    async fn answers_from_cache() {
        let http = Arc::new(FakeHttp::default());
        let server =
            DohServer::new(url(), http.clone()).with_cache(Arc::new(AnswerCache::new()));

        let req = new_message(n("www.example.com."), RecordType::A);
        server.handle_query(&req, false).await.unwrap();
        let resp = server.handle_query(&req, false).await.unwrap();
        assert_eq!(vec![ip("9.9.9.9")], addresses(&resp));
        assert_eq!(1, http.sent.lock().unwrap().len());
    }

    #[tokio::test]
    async fn server_failure_is_not_cached() {
        let http = Arc::new(FakeHttp {
            rcode: Some(ResponseCode::ServFail),
            ..Default::default()
        });
        let cache = Arc::new(AnswerCache::new());
        let server = DohServer::new(url(), http.clone()).with_cache(cache.clone());

        let req = new_message(n("www.example.com."), RecordType::A);
        assert!(matches!(
            server.handle_query(&req, false).await,
            Err(Error::UpstreamFailed(e))
                if matches!(*e, Error::UpstreamResponse(_, ResponseCode::ServFail))
        ));
        assert!(cache.is_empty());

        // The next query goes upstream again.
        assert!(server.handle_query(&req, false).await.is_err());
        assert_eq!(2, http.sent.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_query_leaves_cache_untouched() {
        let cache = Arc::new(AnswerCache::new());
        let warm = DohServer::new(url(), Arc::new(FakeHttp::default())).with_cache(cache.clone());
        let hung = DohServer::new(
            url(),
            Arc::new(FakeHttp {
                hang: true,
                ..Default::default()
            }),
        )
        .with_cache(cache.clone());

        let req = new_message(n("www.example.com."), RecordType::A);
        warm.handle_query(&req, false).await.unwrap();
        let before = addresses(&cache.get(&req.queries()[0]).unwrap());

        let other = new_message(n("other.example.com."), RecordType::A);
        let dropped =
            tokio::time::timeout(Duration::from_millis(10), hung.handle_query(&other, false)).await;
        assert!(dropped.is_err());

        assert_eq!(before, addresses(&cache.get(&req.queries()[0]).unwrap()));
        assert!(cache.get(&other.queries()[0]).is_none());
        assert_eq!(1, cache.len());
    }
}
