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

use futures::FutureExt;
use futures::future::select_ok;
use hickory_proto::op::Message;
use tracing::{debug, instrument};

use crate::dns::Error;
use crate::dns::forwarder::{Forwarder, query_info, usable};
use crate::dns::message::rebind;
use crate::dns::server::{DnsServer, access_log};

const STRATEGY: &str = "concurrent";

/// Sends the query to every upstream at once and returns the first usable answer. The
/// remaining attempts are dropped as soon as one succeeds.
pub struct ConcurrentServer {
    servers: Vec<SocketAddr>,
    forwarder: Forwarder,
}

impl ConcurrentServer {
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
impl DnsServer for ConcurrentServer {
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

        let attempts = self.servers.iter().map(|server| {
            let server = *server;
            self.forwarder
                .forward(server, request, is_tcp, info)
                .map(move |result| {
                    result
                        .and_then(|response| usable(server, response))
                        .map(|response| (server, response))
                })
                .boxed()
        });

        match select_ok(attempts).await {
            Ok(((server, response), pending)) => {
                debug!(%server, cancelled=pending.len(), "upstream answered first");
                drop(pending);
                self.forwarder.store(&response);
                access_log(request, STRATEGY, "forwarded", response.answers().len());
                Ok(rebind(request, response))
            }
            Err(e) => {
                access_log(request, STRATEGY, &format!("failed ({e})"), 0);
                Err(Error::UpstreamFailed(Box::new(e)))
            }
        }
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
