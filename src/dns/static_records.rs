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
use std::net::IpAddr;

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::Name;
use tracing::{instrument, trace};

use crate::dns::Error;
use crate::dns::message::{
    cname_record, error_reply, first_question, ip_record, is_record_type, reply_to,
};
use crate::dns::name_util::canonical;
use crate::dns::server::{DnsServer, access_log};

/// TTL of synthesized records.
pub const STATIC_TTL: u32 = 60;

/// What a static domain resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StaticRecord {
    /// Literal addresses, served as A and AAAA records.
    Ips(Vec<IpAddr>),
    /// Another domain, served as a CNAME that the caller resolves elsewhere.
    Alias(Name),
}

/// Serves a fixed table of records, hosts-file style. Names match exactly, ignoring case.
#[derive(Clone, Debug, Default)]
pub struct StaticServer {
    records: HashMap<Name, StaticRecord>,
}

impl StaticServer {
    pub fn new(records: impl IntoIterator<Item = (Name, StaticRecord)>) -> Self {
        let records = records
            .into_iter()
            .map(|(name, record)| {
                let record = match record {
                    StaticRecord::Alias(alias) => StaticRecord::Alias(canonical(&alias)),
                    ips => ips,
                };
                (canonical(&name), record)
            })
            .collect();
        Self { records }
    }

    /// Creates a server that only holds literal addresses.
    pub fn from_ips(ips: HashMap<Name, Vec<IpAddr>>) -> Self {
        Self::new(
            ips.into_iter()
                .map(|(name, ips)| (name, StaticRecord::Ips(ips))),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Answers the request from the table. Returns `None` when the queried name is unknown.
    ///
    /// A known name queried for a type it has no records of gets an empty successful reply.
    pub fn reply_for(&self, request: &Message) -> Option<Message> {
        let question = request.queries().first()?;
        let name = question.name();
        let record = self.records.get(&canonical(name))?;

        let mut reply = reply_to(request);
        reply.set_authoritative(true);
        match record {
            StaticRecord::Alias(alias) => {
                reply.add_answer(cname_record(name.clone(), alias.clone(), STATIC_TTL));
            }
            StaticRecord::Ips(ips) => {
                let record_type = question.query_type();
                for addr in ips.iter().filter(|addr| is_record_type(addr, record_type)) {
                    reply.add_answer(ip_record(name.clone(), *addr, STATIC_TTL));
                }
            }
        }
        trace!(%name, answers=reply.answers().len(), "static record matched");
        Some(reply)
    }
}

#[async_trait::async_trait]
impl DnsServer for StaticServer {
    #[instrument(level = "debug", skip_all, fields(strategy = "static"))]
    async fn handle_query(&self, request: &Message, _is_tcp: bool) -> Result<Message, Error> {
        first_question(request)?;
        match self.reply_for(request) {
            Some(reply) => {
                access_log(request, "static", "success", reply.answers().len());
                Ok(reply)
            }
            None => {
                access_log(request, "static", "not found", 0);
                Ok(error_reply(request, ResponseCode::NXDomain))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::addresses;
    use crate::test_helpers::dns::{ip, n, new_message};
    use hickory_proto::rr::{RData, RecordType};

    fn server() -> StaticServer {
        StaticServer::new([
            (n("www.apple.com"), StaticRecord::Ips(vec![ip("127.0.0.1")])),
            (
                n("www.ipv6.com"),
                StaticRecord::Ips(vec![ip("2001:4860:4860::8888")]),
            ),
            (n("www.baidu.com"), StaticRecord::Alias(n("baidu.com"))),
        ])
    }

    #[test]
    fn answers_from_table() {
        let s = server();

        let req = new_message(n("www.apple.com."), RecordType::A);
        let reply = s.reply_for(&req).unwrap();
        assert_eq!(req.id(), reply.id());
        assert_eq!(1, reply.answers().len());
        assert_eq!(vec![ip("127.0.0.1")], addresses(&reply));

        let req = new_message(n("www.ipv6.com."), RecordType::AAAA);
        let reply = s.reply_for(&req).unwrap();
        assert_eq!(1, reply.answers().len());
        assert_eq!(RecordType::AAAA, reply.answers()[0].record_type());
        assert_eq!(vec![ip("2001:4860:4860::8888")], addresses(&reply));

        let req = new_message(n("www.baidu.com."), RecordType::CNAME);
        let reply = s.reply_for(&req).unwrap();
        assert_eq!(1, reply.answers().len());
        match reply.answers()[0].data() {
            RData::CNAME(target) => assert_eq!(n("baidu.com."), target.0),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn match_is_case_insensitive() {
        let req = new_message(n("WWW.Apple.COM."), RecordType::A);
        let reply = server().reply_for(&req).unwrap();
        assert_eq!(vec![ip("127.0.0.1")], addresses(&reply));
    }

    #[test]
    fn alias_answers_any_type() {
        let req = new_message(n("www.baidu.com."), RecordType::A);
        let reply = server().reply_for(&req).unwrap();
        assert_eq!(RecordType::CNAME, reply.answers()[0].record_type());
    }

    #[test]
    fn known_name_other_family() {
        let req = new_message(n("www.apple.com."), RecordType::AAAA);
        let reply = server().reply_for(&req).unwrap();
        assert_eq!(ResponseCode::NoError, reply.response_code());
        assert!(reply.answers().is_empty());

        let req = new_message(n("www.apple.com."), RecordType::MX);
        assert!(server().reply_for(&req).unwrap().answers().is_empty());
    }

    #[test]
    fn unknown_name() {
        let req = new_message(n("www.google.com."), RecordType::A);
        assert!(server().reply_for(&req).is_none());
        assert!(server().reply_for(&Message::new()).is_none());
    }

    #[tokio::test]
    async fn handle_query_miss_is_nxdomain() {
        let req = new_message(n("www.google.com."), RecordType::A);
        let reply = server().handle_query(&req, false).await.unwrap();
        assert_eq!(ResponseCode::NXDomain, reply.response_code());
        assert_eq!(req.id(), reply.id());

        assert!(matches!(
            server().handle_query(&Message::new(), false).await,
            Err(Error::NoQuestion)
        ));
    }
}
