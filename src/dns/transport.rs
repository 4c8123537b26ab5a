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
use std::sync::Arc;

use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::dns::Error;
use crate::socket::{self, DefaultSocketFactory, SocketFactory};

/// Largest message accepted over UDP.
const MAX_UDP_SIZE: usize = 4096;

/// Exchanges a single query with an upstream server. Timeouts are applied by the caller.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(
        &self,
        server: SocketAddr,
        request: &Message,
        is_tcp: bool,
    ) -> Result<Message, Error>;
}

/// A [Transport] over plain UDP and TCP sockets. UDP answers that come back truncated are
/// retried over TCP.
#[derive(Clone)]
pub struct SocketTransport {
    factory: Arc<dyn SocketFactory + Send + Sync>,
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new(Arc::new(DefaultSocketFactory))
    }
}

impl SocketTransport {
    pub fn new(factory: Arc<dyn SocketFactory + Send + Sync>) -> Self {
        Self { factory }
    }

    async fn exchange_udp(&self, server: SocketAddr, request: &Message) -> Result<Message, Error> {
        let sock = socket::udp_for(self.factory.as_ref(), server)?;
        sock.connect(server).await?;
        sock.send(&request.to_vec()?).await?;

        let mut buf = vec![0u8; MAX_UDP_SIZE];
        loop {
            let len = sock.recv(&mut buf).await?;
            let response = Message::from_vec(&buf[..len])?;
            if response.id() == request.id() {
                return Ok(response);
            }
            // A late answer to an earlier query or a spoofing attempt; keep waiting.
            debug!(%server, id=response.id(), expected=request.id(), "dropping response with unexpected id");
        }
    }

    async fn exchange_tcp(&self, server: SocketAddr, request: &Message) -> Result<Message, Error> {
        let mut stream = socket::connect(self.factory.as_ref(), server).await?;

        let bytes = request.to_vec()?;
        let len = u16::try_from(bytes.len()).map_err(|e| Error::Generic(Box::new(e)))?;
        let mut framed = Vec::with_capacity(bytes.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&bytes);
        stream.write_all(&framed).await?;

        let len = stream.read_u16().await?;
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;
        let response = Message::from_vec(&buf)?;
        if response.id() != request.id() {
            return Err(Error::MismatchedId(server));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    async fn exchange(
        &self,
        server: SocketAddr,
        request: &Message,
        is_tcp: bool,
    ) -> Result<Message, Error> {
        if is_tcp {
            return self.exchange_tcp(server, request).await;
        }
        let response = self.exchange_udp(server, request).await?;
        if response.truncated() {
            trace!(%server, "truncated response, retrying over tcp");
            return self.exchange_tcp(server, request).await;
        }
        Ok(response)
    }
}
