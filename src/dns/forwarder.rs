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

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dns::metrics::{
    CacheHit, DnsRequest, ForwardedDuration, ForwardedFailure, ForwardedRequest, Metrics,
    QueryInfo,
};
use crate::dns::message::{first_question, rebind};
use crate::dns::{AnswerCache, Error, Transport};
use crate::metrics::{DeferRecorder, IncrementRecorder, Recorder};

/// Default per-attempt timeout for upstream queries.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The upstream plumbing shared by the forwarding strategies: an optional answer cache in front
/// of a transport, with per-attempt timeouts and metrics.
#[derive(Clone)]
pub struct Forwarder {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    cache: Option<Arc<AnswerCache>>,
    metrics: Arc<Metrics>,
}

impl Forwarder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_TIMEOUT,
            cache: None,
            metrics: Default::default(),
        }
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

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cache(&self) -> Option<&Arc<AnswerCache>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Counts the request and answers it from the cache when possible.
    pub fn lookup_cached(&self, request: &Message, info: QueryInfo<'_>) -> Option<Message> {
        self.metrics.increment(&DnsRequest(info));
        let cached = self.cache.as_ref()?.get(info.query)?;
        self.metrics.increment(&CacheHit(info));
        debug!(query=%info.query.name(), "answered from cache");
        Some(rebind(request, cached))
    }

    /// Stores a complete upstream response.
    pub fn store(&self, response: &Message) {
        if let Some(cache) = &self.cache {
            cache.set(response);
        }
    }

    /// Sends the request to one upstream server, bounded by the per-attempt timeout.
    pub async fn forward(
        &self,
        server: SocketAddr,
        request: &Message,
        is_tcp: bool,
        info: QueryInfo<'_>,
    ) -> Result<Message, Error> {
        self.metrics.increment(&ForwardedRequest(info));
        let start = Instant::now();
        let _duration = self
            .metrics
            .defer_record(|metrics| metrics.record(&ForwardedDuration(info), start.elapsed()));

        let result = tokio::time::timeout(
            self.timeout,
            self.transport.exchange(server, request, is_tcp),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout(server.to_string())));
        if let Err(e) = &result {
            warn!(%server, err=%e, "upstream query failed");
            self.metrics.increment(&ForwardedFailure(info));
        }
        result
    }
}

/// Whether an upstream response may be returned to the client. Server failures and refusals
/// are treated like a failed attempt so that another upstream gets a chance, and are never
/// cached.
pub fn usable(upstream: impl Display, response: Message) -> Result<Message, Error> {
    match response.response_code() {
        code @ (ResponseCode::ServFail | ResponseCode::Refused) => {
            Err(Error::UpstreamResponse(upstream.to_string(), code))
        }
        _ => Ok(response),
    }
}

/// Builds the metric labels for a request, failing when it has no question.
pub fn query_info<'a>(
    request: &'a Message,
    is_tcp: bool,
    strategy: &'static str,
) -> Result<QueryInfo<'a>, Error> {
    Ok(QueryInfo {
        query: first_question(request)?,
        is_tcp,
        strategy,
    })
}
