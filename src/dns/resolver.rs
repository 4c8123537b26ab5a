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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::{debug, instrument, trace};

use crate::dns::message::{addresses, is_record_type, query, rebind};
use crate::dns::name_util::{canonical, to_fqdn};
use crate::dns::server::DnsServer;
use crate::dns::{Error, StaticServer};

/// How many CNAME hops a lookup follows before giving up on an answer without addresses.
const MAX_CNAME_DEPTH: usize = 8;

/// Application level name resolution. Domains must already be in their ASCII-compatible form.
///
/// A name that does not exist resolves to no addresses; errors are reserved for failures to
/// get any answer at all.
#[async_trait::async_trait]
pub trait Resolver: Sync + Send {
    /// Resolves both address families, IPv4 first.
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>, Error>;

    async fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, Error>;

    async fn lookup_ipv6(&self, domain: &str) -> Result<Vec<Ipv6Addr>, Error>;
}

/// A [Resolver] over [DnsServer]s. Servers are asked in order; the next one is only consulted
/// when the previous one failed to answer.
#[derive(Clone)]
pub struct DnsServerToResolver {
    servers: Vec<Arc<dyn DnsServer>>,
}

impl DnsServerToResolver {
    pub fn new(servers: Vec<Arc<dyn DnsServer>>) -> Self {
        Self { servers }
    }

    #[instrument(level = "debug", skip(self))]
    async fn lookup(&self, domain: &str, record_type: RecordType) -> Result<Vec<IpAddr>, Error> {
        let mut name = to_fqdn(domain)?;
        for _ in 0..MAX_CNAME_DEPTH {
            let Some(response) = self.exchange(name.clone(), record_type).await? else {
                return Ok(Vec::new());
            };
            let addrs: Vec<IpAddr> = addresses(&response)
                .into_iter()
                .filter(|addr| is_record_type(addr, record_type))
                .collect();
            if !addrs.is_empty() {
                return Ok(addrs);
            }
            match alias_of(&response, &name) {
                Some(target) => {
                    trace!(from=%name, to=%target, "following alias");
                    name = target;
                }
                None => return Ok(Vec::new()),
            }
        }
        debug!(%domain, "alias chain too long");
        Ok(Vec::new())
    }

    /// Returns the first answer any server gives, or `None` for a name that does not exist.
    async fn exchange(&self, name: Name, record_type: RecordType) -> Result<Option<Message>, Error> {
        let request = query(name.clone(), record_type);
        let mut last_error = Error::NoUpstreams;
        for server in &self.servers {
            match server.handle_query(&request, false).await {
                Ok(response) => match response.response_code() {
                    ResponseCode::NoError => return Ok(Some(response)),
                    ResponseCode::NXDomain => return Ok(None),
                    code => last_error = Error::UpstreamResponse(name.to_string(), code),
                },
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

/// The target of a CNAME for the name that the response carries no further records for.
fn alias_of(response: &Message, name: &Name) -> Option<Name> {
    let name = canonical(name);
    response.answers().iter().find_map(|record| match record.data() {
        RData::CNAME(target) if canonical(record.name()) == name => Some(target.0.clone()),
        _ => None,
    })
}

#[async_trait::async_trait]
impl Resolver for DnsServerToResolver {
    async fn lookup_ip(&self, domain: &str) -> Result<Vec<IpAddr>, Error> {
        let (v4, v6) = tokio::join!(
            self.lookup(domain, RecordType::A),
            self.lookup(domain, RecordType::AAAA)
        );
        match (v4, v6) {
            (Err(e), Err(_)) => Err(e),
            (v4, v6) => Ok(v4
                .unwrap_or_default()
                .into_iter()
                .chain(v6.unwrap_or_default())
                .collect()),
        }
    }

    async fn lookup_ipv4(&self, domain: &str) -> Result<Vec<Ipv4Addr>, Error> {
        let addrs = self.lookup(domain, RecordType::A).await?;
        Ok(addrs
            .into_iter()
            .filter_map(|addr| match addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }

    async fn lookup_ipv6(&self, domain: &str) -> Result<Vec<Ipv6Addr>, Error> {
        let addrs = self.lookup(domain, RecordType::AAAA).await?;
        Ok(addrs
            .into_iter()
            .filter_map(|addr| match addr {
                IpAddr::V6(v6) => Some(v6),
                IpAddr::V4(_) => None,
            })
            .collect())
    }
}

/// Serves static records first and sends everything else to the fallback.
///
/// A static alias is resolved through the fallback, and the reply carries both the CNAME and
/// the fallback's answer for the alias.
pub struct InternalDns {
    static_records: StaticServer,
    fallback: Arc<dyn DnsServer>,
}

impl InternalDns {
    pub fn new(static_records: StaticServer, fallback: Arc<dyn DnsServer>) -> Self {
        Self {
            static_records,
            fallback,
        }
    }
}

#[async_trait::async_trait]
impl DnsServer for InternalDns {
    async fn handle_query(&self, request: &Message, is_tcp: bool) -> Result<Message, Error> {
        let Some(reply) = self.static_records.reply_for(request) else {
            return self.fallback.handle_query(request, is_tcp).await;
        };
        let Some(question) = request.queries().first() else {
            return Ok(reply);
        };
        let record_type = question.query_type();
        let target = match alias_of(&reply, question.name()) {
            Some(target) if record_type != RecordType::CNAME => target,
            _ => return Ok(reply),
        };

        trace!(alias=%target, "resolving static alias");
        let mut alias_request = query(target, record_type);
        alias_request.set_id(request.id());
        let resolved = self.fallback.handle_query(&alias_request, is_tcp).await?;

        let mut combined = rebind(request, reply);
        combined.set_response_code(resolved.response_code());
        for record in resolved.answers() {
            combined.add_answer(record.clone());
        }
        Ok(combined)
    }

    fn start(&self) {
        self.fallback.start()
    }

    fn close(&self) {
        self.fallback.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::error_reply;
    use crate::dns::{Forwarder, SerialServer, StaticRecord};
    use crate::test_helpers::dns::{MockTransport, ip, ipv4, ipv6, n, new_message, socket_addr};

    fn static_server() -> StaticServer {
        StaticServer::new([
            (
                n("dual.example.com"),
                StaticRecord::Ips(vec![ip("1.2.3.4"), ip("2001:db8::1")]),
            ),
            (n("alias.example.com"), StaticRecord::Alias(n("dual.example.com"))),
            (n("proxied.example.com"), StaticRecord::Alias(n("www.upstream.com"))),
        ])
    }

    /// Fails every query.
    struct Broken;

    #[async_trait::async_trait]
    impl DnsServer for Broken {
        async fn handle_query(&self, request: &Message, _: bool) -> Result<Message, Error> {
            Ok(error_reply(request, ResponseCode::ServFail))
        }
    }

    fn upstream() -> Arc<dyn DnsServer> {
        let server = socket_addr("10.0.0.1:53");
        let transport = MockTransport::new()
            .answer(server, "www.upstream.com.", &["5.6.7.8", "2001:db8::5"]);
        Arc::new(SerialServer::new(vec![server], Forwarder::new(Arc::new(transport))).unwrap())
    }

    #[tokio::test]
    async fn lookups_by_family() {
        let resolver = DnsServerToResolver::new(vec![Arc::new(static_server())]);
        assert_eq!(
            vec![ipv4("1.2.3.4")],
            resolver.lookup_ipv4("dual.example.com").await.unwrap()
        );
        assert_eq!(
            vec![ipv6("2001:db8::1")],
            resolver.lookup_ipv6("dual.example.com").await.unwrap()
        );
        assert_eq!(
            vec![ip("1.2.3.4"), ip("2001:db8::1")],
            resolver.lookup_ip("dual.example.com").await.unwrap()
        );
    }

    #[tokio::test]
    async fn nxdomain_resolves_to_nothing() {
        let resolver = DnsServerToResolver::new(vec![Arc::new(static_server())]);
        assert!(resolver.lookup_ip("nope.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn follows_aliases() {
        let resolver = DnsServerToResolver::new(vec![Arc::new(static_server())]);
        assert_eq!(
            vec![ipv4("1.2.3.4")],
            resolver.lookup_ipv4("alias.example.com").await.unwrap()
        );
    }

    #[tokio::test]
    async fn falls_through_failing_servers() {
        let resolver = DnsServerToResolver::new(vec![Arc::new(Broken), Arc::new(static_server())]);
        assert_eq!(
            vec![ipv4("1.2.3.4")],
            resolver.lookup_ipv4("dual.example.com").await.unwrap()
        );

        let resolver = DnsServerToResolver::new(vec![Arc::new(Broken)]);
        assert!(matches!(
            resolver.lookup_ip("dual.example.com").await,
            Err(Error::UpstreamResponse(_, ResponseCode::ServFail))
        ));
    }

    #[tokio::test]
    async fn invalid_domain() {
        let resolver = DnsServerToResolver::new(vec![Arc::new(static_server())]);
        let domain = format!("{}.com", "a".repeat(64));
        assert!(matches!(
            resolver.lookup_ipv4(&domain).await,
            Err(Error::InvalidName(..))
        ));
    }

    #[tokio::test]
    async fn internal_dns_prefers_static_records() {
        let dns = InternalDns::new(static_server(), upstream());

        let req = new_message(n("dual.example.com."), RecordType::A);
        let resp = dns.handle_query(&req, false).await.unwrap();
        assert_eq!(vec![ip("1.2.3.4")], addresses(&resp));

        let req = new_message(n("www.upstream.com."), RecordType::A);
        let resp = dns.handle_query(&req, false).await.unwrap();
        assert_eq!(vec![ip("5.6.7.8")], addresses(&resp));
    }

    #[tokio::test]
    async fn internal_dns_resolves_alias_through_fallback() {
        let dns = InternalDns::new(static_server(), upstream());

        let req = new_message(n("proxied.example.com."), RecordType::AAAA);
        let resp = dns.handle_query(&req, false).await.unwrap();
        assert_eq!(req.id(), resp.id());
        assert_eq!(req.queries(), resp.queries());
        assert_eq!(RecordType::CNAME, resp.answers()[0].record_type());
        assert_eq!(vec![ip("2001:db8::5")], addresses(&resp));

        // A CNAME query gets the alias itself.
        let req = new_message(n("proxied.example.com."), RecordType::CNAME);
        let resp = dns.handle_query(&req, false).await.unwrap();
        assert_eq!(1, resp.answers().len());
    }

    #[tokio::test]
    async fn resolver_over_internal_dns() {
        let dns: Arc<dyn DnsServer> = Arc::new(InternalDns::new(static_server(), upstream()));
        let resolver = DnsServerToResolver::new(vec![dns]);
        assert_eq!(
            vec![ip("5.6.7.8"), ip("2001:db8::5")],
            resolver.lookup_ip("proxied.example.com").await.unwrap()
        );
        assert!(
            resolver
                .lookup_ip("missing.example.com")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
