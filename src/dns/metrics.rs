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

use hickory_proto::op::Query;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use std::time::Duration;

use crate::metrics::{DefaultedUnknown, DeferRecorder, Recorder, sub_registry};

pub struct Metrics {
    pub requests: Family<DnsLabels, Counter>,
    pub cache_hits: Family<DnsLabels, Counter>,
    pub forwarded_requests: Family<DnsLabels, Counter>,
    pub forwarded_failures: Family<DnsLabels, Counter>,
    pub forwarded_duration: Family<DnsLabels, Histogram>,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let registry = sub_registry(registry);

        let requests = Family::default();
        registry.register(
            "dns_requests",
            "Total number of DNS requests handled",
            requests.clone(),
        );

        let cache_hits = Family::default();
        registry.register(
            "dns_cache_hits",
            "Total number of DNS requests answered from the answer cache",
            cache_hits.clone(),
        );

        let forwarded_requests = Family::default();
        registry.register(
            "dns_upstream_requests",
            "Total number of DNS requests forwarded to upstream",
            forwarded_requests.clone(),
        );

        let forwarded_failures = Family::default();
        registry.register(
            "dns_upstream_failures",
            "Total number of DNS requests that failed to forward upstream",
            forwarded_failures.clone(),
        );

        let forwarded_duration = Family::<DnsLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(vec![0.001f64, 0.005, 0.01, 0.1, 1.0, 5.0].into_iter())
        });
        registry.register_with_unit(
            "dns_upstream_request_duration",
            "Total time in seconds taken to get a DNS response from upstream",
            Unit::Seconds,
            forwarded_duration.clone(),
        );

        Self {
            requests,
            cache_hits,
            forwarded_requests,
            forwarded_failures,
            forwarded_duration,
        }
    }
}

impl Default for Metrics {
    /// Metrics registered nowhere, for servers whose owner does not export them.
    fn default() -> Self {
        let mut registry = Registry::default();
        Metrics::new(&mut registry)
    }
}

impl DeferRecorder for Metrics {}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct DnsLabels {
    request_query_type: String,
    request_protocol: String,
    strategy: DefaultedUnknown<String>,
}

impl DnsLabels {
    pub fn new(query: &Query, is_tcp: bool) -> Self {
        Self {
            request_query_type: query.query_type().to_string().to_lowercase(),
            request_protocol: if is_tcp { "tcp" } else { "udp" }.to_string(),
            strategy: Default::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy = strategy.to_string().into();
        self
    }
}

/// Identifies the query an event is recorded for.
#[derive(Clone, Copy)]
pub struct QueryInfo<'a> {
    pub query: &'a Query,
    pub is_tcp: bool,
    pub strategy: &'static str,
}

impl From<&QueryInfo<'_>> for DnsLabels {
    fn from(value: &QueryInfo<'_>) -> Self {
        Self::new(value.query, value.is_tcp).with_strategy(value.strategy)
    }
}

#[derive(Clone)]
pub struct DnsRequest<'a>(pub QueryInfo<'a>);

impl Recorder<DnsRequest<'_>, u64> for Metrics {
    fn record(&self, reason: &DnsRequest, count: u64) {
        self.requests
            .get_or_create(&DnsLabels::from(&reason.0))
            .inc_by(count);
    }
}

#[derive(Clone)]
pub struct CacheHit<'a>(pub QueryInfo<'a>);

impl Recorder<CacheHit<'_>, u64> for Metrics {
    fn record(&self, reason: &CacheHit, count: u64) {
        self.cache_hits
            .get_or_create(&DnsLabels::from(&reason.0))
            .inc_by(count);
    }
}

#[derive(Clone)]
pub struct ForwardedRequest<'a>(pub QueryInfo<'a>);

impl Recorder<ForwardedRequest<'_>, u64> for Metrics {
    fn record(&self, reason: &ForwardedRequest, count: u64) {
        self.forwarded_requests
            .get_or_create(&DnsLabels::from(&reason.0))
            .inc_by(count);
    }
}

#[derive(Clone)]
pub struct ForwardedFailure<'a>(pub QueryInfo<'a>);

impl Recorder<ForwardedFailure<'_>, u64> for Metrics {
    fn record(&self, reason: &ForwardedFailure, count: u64) {
        self.forwarded_failures
            .get_or_create(&DnsLabels::from(&reason.0))
            .inc_by(count);
    }
}

#[derive(Clone)]
pub struct ForwardedDuration<'a>(pub QueryInfo<'a>);

impl Recorder<ForwardedDuration<'_>, Duration> for Metrics {
    fn record(&self, reason: &ForwardedDuration, duration: Duration) {
        self.forwarded_duration
            .get_or_create(&DnsLabels::from(&reason.0))
            .observe(duration.as_secs_f64());
    }
}
