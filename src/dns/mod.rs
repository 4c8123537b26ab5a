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

use std::io;
use std::net::SocketAddr;

use hickory_proto::ProtoError;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;

pub mod cache;
pub mod concurrent;
pub mod doh;
pub mod fake;
pub mod fakeip;
pub mod forwarder;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod name_util;
pub mod resolver;
pub mod reverse;
pub mod serial;
pub mod server;
pub mod static_records;
pub mod transport;

pub use cache::AnswerCache;
pub use concurrent::ConcurrentServer;
pub use doh::{DohServer, HttpHandler, HyperHttpHandler};
pub use fake::FakeDnsServer;
pub use fakeip::{FakeIpPool, FakeIpPoolSet};
pub use forwarder::Forwarder;
pub use metrics::Metrics;
pub use resolver::{DnsServerToResolver, InternalDns, Resolver};
pub use reverse::ReverseResolutionCache;
pub use serial::SerialServer;
pub use server::{DnsServer, Server};
pub use static_records::{StaticRecord, StaticServer};
pub use transport::{SocketTransport, Transport};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid cidr {0}: {1}")]
    InvalidCidr(String, ipnet::AddrParseError),

    #[error("invalid pool capacity {0}, must be greater than zero")]
    InvalidCapacity(usize),

    #[error("invalid domain name {0}: {1}")]
    InvalidName(String, #[source] ProtoError),

    #[error("message has no question")]
    NoQuestion,

    #[error("unsupported query type: {0}")]
    UnsupportedQueryType(RecordType),

    #[error("no upstream servers configured")]
    NoUpstreams,

    #[error("query to {0} timed out")]
    Timeout(String),

    #[error("{0}: upstream replied with {1}")]
    UpstreamResponse(String, ResponseCode),

    #[error("all upstream servers failed, last error: {0}")]
    UpstreamFailed(Box<Error>),

    #[error("mismatched response id from {0}")]
    MismatchedId(SocketAddr),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("dns protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("http failed: {0}")]
    Http(Box<dyn std::error::Error + Send + Sync>),

    #[error("http status: {0}")]
    HttpStatus(http::StatusCode),

    #[error("{0}")]
    Generic(Box<dyn std::error::Error + Send + Sync>),
}
