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

use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::instrument;

use crate::dns::message::{first_question, ip_record, reply_to};
use crate::dns::name_util::strip_fqdn;
use crate::dns::server::{DnsServer, access_log};
use crate::dns::{Error, FakeIpPoolSet};

/// TTL of fake answers. Kept short so clients come back and keep the binding recent.
pub const FAKE_TTL: u32 = 1;

const STRATEGY: &str = "fake";

/// Answers A and AAAA queries with addresses allocated from the fake pools.
pub struct FakeDnsServer {
    pools: Arc<FakeIpPoolSet>,
}

impl FakeDnsServer {
    pub fn new(pools: Arc<FakeIpPoolSet>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &Arc<FakeIpPoolSet> {
        &self.pools
    }
}

#[async_trait::async_trait]
impl DnsServer for FakeDnsServer {
    #[instrument(level = "debug", skip_all, fields(strategy = STRATEGY))]
    async fn handle_query(&self, request: &Message, _is_tcp: bool) -> Result<Message, Error> {
        let question = first_question(request)?;
        let pool = match question.query_type() {
            RecordType::A => self.pools.ipv4(),
            RecordType::AAAA => self.pools.ipv6(),
            other => {
                access_log(request, STRATEGY, "unsupported query type", 0);
                return Err(Error::UnsupportedQueryType(other));
            }
        };

        let mut reply = reply_to(request);
        // No pool for the family: the name exists, it just has no records of this type.
        if let Some(addr) =
            pool.and_then(|p| p.get_fake_ip_for_domain(&strip_fqdn(question.name()), true))
        {
            reply.add_answer(ip_record(question.name().clone(), addr, FAKE_TTL));
        }
        access_log(request, STRATEGY, "success", reply.answers().len());
        Ok(reply)
    }
}
