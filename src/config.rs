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

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};

use hickory_resolver::system_conf::read_system_conf;
use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, info};

use crate::dns::forwarder::DEFAULT_TIMEOUT;
use crate::dns::name_util::to_fqdn;
use crate::dns::{
    self, AnswerCache, ConcurrentServer, DohServer, FakeDnsServer, FakeIpPoolSet, Forwarder,
    HttpHandler, HyperHttpHandler, InternalDns, Metrics, ReverseResolutionCache, SerialServer,
    Server, SocketTransport, StaticRecord, StaticServer, Transport,
};
use crate::socket::to_canonical;

const CONFIG_PATH: &str = "DNSCORE_CONFIG";
const UPSTREAM_TIMEOUT: &str = "DNSCORE_UPSTREAM_TIMEOUT";
const REVERSE_CACHE_SIZE: &str = "DNSCORE_REVERSE_CACHE_SIZE";

pub const DEFAULT_REVERSE_CACHE_SIZE: usize = 4096;
const DEFAULT_DNS_PORT: u16 = 53;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("failed to read config file {0}: {1}")]
    File(PathBuf, #[source] io::Error),
    #[error("error parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid static record for {0}: {1}")]
    StaticRecord(String, String),
    #[error("invalid upstream server {0}")]
    Upstream(String),
    #[error("invalid upstream configuration: {0}")]
    UpstreamConfig(String),
    #[error("failed to read system resolver configuration: {0}")]
    SystemConf(String),
    #[error(transparent)]
    Dns(#[from] dns::Error),
}

/// HumanDuration wraps a Duration to parse values such as "5s" or "1m30s" from env vars.
struct HumanDuration(Duration);

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s).map(HumanDuration)
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

/// The DNS configuration of a proxy.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Hosts-file style records, served before anything else.
    #[serde(default)]
    pub static_records: Vec<StaticRecordConfig>,
    #[serde(default)]
    pub fake_ip_pools: Vec<FakeIpPoolConfig>,
    /// Answer A and AAAA queries with fake addresses instead of asking an upstream.
    #[serde(default)]
    pub fake_dns: bool,
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    /// Whether upstream answers are cached for their TTL.
    #[serde(default = "default_true")]
    pub answer_cache: bool,
    #[serde(default)]
    pub reverse_cache: ReverseCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            static_records: Vec::new(),
            fake_ip_pools: Vec::new(),
            fake_dns: false,
            upstream: None,
            answer_cache: true,
            reverse_cache: ReverseCacheConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A static record maps a domain either to literal addresses or to another domain.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StaticRecordConfig {
    pub domain: String,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub proxied_domain: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FakeIpPoolConfig {
    pub cidr: String,
    pub lru_size: usize,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Serial,
    Concurrent,
    Doh,
    /// Serial over the nameservers of the system resolver configuration.
    System,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub strategy: Strategy,
    /// Upstream addresses, as "ip" or "ip:port".
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default, deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub doh_url: Option<String>,
    /// Client address announced to DNS-over-HTTPS upstreams.
    #[serde(default)]
    pub client_ip: Option<IpAddr>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReverseCacheConfig {
    #[serde(default = "default_reverse_cache_size")]
    pub capacity: usize,
    /// Skip bindings whose TTL passed when reading.
    #[serde(default)]
    pub filter_expired: bool,
}

impl Default for ReverseCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_REVERSE_CACHE_SIZE,
            filter_expired: false,
        }
    }
}

fn default_reverse_cache_size() -> usize {
    DEFAULT_REVERSE_CACHE_SIZE
}

/// Loads the configuration from the file named by `DNSCORE_CONFIG`, if any, and applies env
/// var overrides.
pub fn parse_config() -> Result<Config, Error> {
    let cfg = match parse::<PathBuf>(CONFIG_PATH)? {
        Some(path) => {
            let contents = fs::read_to_string(&path).map_err(|e| Error::File(path.clone(), e))?;
            debug!(path=%path.display(), "loaded dns configuration");
            from_yaml(&contents)?
        }
        None => Config::default(),
    };
    apply_env(cfg)
}

pub fn from_yaml(contents: &str) -> Result<Config, Error> {
    Ok(serde_yaml::from_str(contents)?)
}

fn apply_env(mut cfg: Config) -> Result<Config, Error> {
    if let Some(timeout) = parse::<HumanDuration>(UPSTREAM_TIMEOUT)? {
        if let Some(upstream) = cfg.upstream.as_mut() {
            upstream.timeout = Some(timeout.0);
        }
    }
    cfg.reverse_cache.capacity = parse_default(REVERSE_CACHE_SIZE, cfg.reverse_cache.capacity)?;
    Ok(cfg)
}

/// Parses "ip" or "ip:port", defaulting to port 53.
fn parse_server(server: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(to_canonical(addr));
    }
    server
        .parse::<IpAddr>()
        .map(|ip| to_canonical(SocketAddr::new(ip, DEFAULT_DNS_PORT)))
        .map_err(|_| Error::Upstream(server.to_string()))
}

/// The DNS components built from a [Config].
pub struct Dns {
    pub server: Arc<Server>,
    pub fake_ip_pools: Arc<FakeIpPoolSet>,
    pub reverse_cache: Arc<ReverseResolutionCache>,
    pub answer_cache: Option<Arc<AnswerCache>>,
}

/// Outbound seams used when building upstream strategies.
#[derive(Clone)]
pub struct Outbound {
    pub transport: Arc<dyn Transport>,
    /// Created on demand when a DNS-over-HTTPS upstream is configured.
    pub http: Option<Arc<dyn HttpHandler>>,
    pub metrics: Arc<Metrics>,
}

impl Default for Outbound {
    fn default() -> Self {
        Self {
            transport: Arc::new(SocketTransport::default()),
            http: None,
            metrics: Default::default(),
        }
    }
}

impl Config {
    /// Validates the configuration and builds the server it describes with default transports.
    pub fn build(&self) -> Result<Dns, Error> {
        self.build_with(Outbound::default())
    }

    /// Validates the configuration and builds the server it describes.
    ///
    /// The primary server is the fake server when `fake_dns` is set, otherwise the upstream
    /// strategy. Static records are served in front of it; with nothing else configured they
    /// are served alone.
    pub fn build_with(&self, outbound: Outbound) -> Result<Dns, Error> {
        let static_records = self.static_server()?;
        let fake_ip_pools = Arc::new(FakeIpPoolSet::from_ranges(
            self.fake_ip_pools
                .iter()
                .map(|p| (p.cidr.as_str(), p.lru_size)),
        )?);
        let reverse_cache = Arc::new(
            ReverseResolutionCache::new(self.reverse_cache.capacity)?
                .with_expiry_filter(self.reverse_cache.filter_expired),
        );

        // Only upstream strategies consult the answer cache.
        let (primary, answer_cache) = if self.fake_dns {
            if fake_ip_pools.pools().is_empty() {
                return Err(Error::UpstreamConfig(
                    "fake dns requires at least one fake ip pool".to_string(),
                ));
            }
            let fake = Server::Fake(FakeDnsServer::new(fake_ip_pools.clone()));
            (Some(fake), None)
        } else {
            match &self.upstream {
                Some(upstream) => {
                    let cache = self.answer_cache.then(|| Arc::new(AnswerCache::new()));
                    (Some(upstream.build(cache.clone(), &outbound)?), cache)
                }
                None => (None, None),
            }
        };

        let server = match primary {
            Some(primary) if static_records.is_empty() => primary,
            Some(primary) => Server::Internal(InternalDns::new(static_records, Arc::new(primary))),
            None if !static_records.is_empty() => Server::Static(static_records),
            None => {
                return Err(Error::UpstreamConfig(
                    "no upstream, fake dns or static records configured".to_string(),
                ));
            }
        };
        info!(
            strategy = server.strategy(),
            static_records = self.static_records.len(),
            fake_ip_pools = fake_ip_pools.pools().len(),
            "built dns server"
        );

        Ok(Dns {
            server: Arc::new(server),
            fake_ip_pools,
            reverse_cache,
            answer_cache,
        })
    }

    fn static_server(&self) -> Result<StaticServer, Error> {
        let records = self
            .static_records
            .iter()
            .map(|r| {
                let name = to_fqdn(&r.domain)?;
                let record = match (&r.proxied_domain, r.ips.is_empty()) {
                    (Some(alias), true) => StaticRecord::Alias(to_fqdn(alias)?),
                    (None, false) => StaticRecord::Ips(r.ips.clone()),
                    (Some(_), false) => {
                        return Err(Error::StaticRecord(
                            r.domain.clone(),
                            "ips and proxied_domain are exclusive".to_string(),
                        ));
                    }
                    (None, true) => {
                        return Err(Error::StaticRecord(
                            r.domain.clone(),
                            "one of ips or proxied_domain is required".to_string(),
                        ));
                    }
                };
                Ok((name, record))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(StaticServer::new(records))
    }
}

impl UpstreamConfig {
    fn build(
        &self,
        cache: Option<Arc<AnswerCache>>,
        outbound: &Outbound,
    ) -> Result<Server, Error> {
        if self.strategy == Strategy::Doh {
            return self.build_doh(cache, outbound);
        }

        let (servers, timeout) = match self.strategy {
            Strategy::System => system_servers()?,
            _ => (
                self.servers
                    .iter()
                    .map(|s| parse_server(s))
                    .collect::<Result<Vec<_>, _>>()?,
                None,
            ),
        };
        let timeout = self.timeout.or(timeout).unwrap_or(DEFAULT_TIMEOUT);

        let mut forwarder = Forwarder::new(outbound.transport.clone())
            .with_timeout(timeout)
            .with_metrics(outbound.metrics.clone());
        if let Some(cache) = cache {
            forwarder = forwarder.with_cache(cache);
        }

        Ok(match self.strategy {
            Strategy::Concurrent => Server::Concurrent(ConcurrentServer::new(servers, forwarder)?),
            _ => Server::Serial(SerialServer::new(servers, forwarder)?),
        })
    }

    fn build_doh(
        &self,
        cache: Option<Arc<AnswerCache>>,
        outbound: &Outbound,
    ) -> Result<Server, Error> {
        let url = self
            .doh_url
            .as_deref()
            .ok_or_else(|| Error::UpstreamConfig("doh requires doh_url".to_string()))?;
        let url: http::Uri = url
            .parse()
            .map_err(|_| Error::UpstreamConfig(format!("invalid doh_url {url}")))?;
        let http: Arc<dyn HttpHandler> = match &outbound.http {
            Some(http) => http.clone(),
            None => Arc::new(HyperHttpHandler::new()?),
        };

        let mut server = DohServer::new(url, http)
            .with_timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .with_metrics(outbound.metrics.clone());
        if let Some(client_ip) = self.client_ip {
            server = server.with_client_ip(client_ip);
        }
        if let Some(cache) = cache {
            server = server.with_cache(cache);
        }
        Ok(Server::Doh(server))
    }
}

/// Reads the nameservers and timeout of the system resolver configuration.
fn system_servers() -> Result<(Vec<SocketAddr>, Option<Duration>), Error> {
    let (cfg, opts) = read_system_conf().map_err(|e| Error::SystemConf(e.to_string()))?;
    let servers = cfg
        .name_servers()
        .iter()
        .map(|ns| to_canonical(ns.socket_addr))
        .unique()
        .collect_vec();
    debug!(?servers, "using system nameservers");
    Ok((servers, Some(opts.timeout)))
}
