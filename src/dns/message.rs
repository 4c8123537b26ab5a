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

//! Helpers for building and inspecting [Message]s. Wire encoding itself is left to
//! `hickory_proto`; this module only deals with the in-memory representation.

use std::net::IpAddr;

use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};

use crate::dns::Error;

/// Builds a query [Message] for the given name and record type.
pub fn query(name: Name, record_type: RecordType) -> Message {
    let mut query = Query::query(name, record_type);
    query.set_query_class(DNSClass::IN);

    let mut msg = Message::new();
    msg.set_id(rand::random::<u16>())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(query);
    msg
}

/// Creates an empty response to the request, carrying over its id and questions.
pub fn reply_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_header(Header::response_from_request(request.header()))
        .set_recursion_available(true)
        .add_queries(request.queries().to_vec());
    reply
}

/// Creates a response to the request with the given code and no records.
pub fn error_reply(request: &Message, code: ResponseCode) -> Message {
    let mut reply = reply_to(request);
    reply.set_response_code(code);
    reply
}

/// Re-targets a cached or upstream response at the request, so the client sees its own id.
pub fn rebind(request: &Message, mut response: Message) -> Message {
    response.set_id(request.id());
    response
}

/// Returns the first question of the message, which is the only one servers act on.
pub fn first_question(msg: &Message) -> Result<&Query, Error> {
    msg.queries().first().ok_or(Error::NoQuestion)
}

/// Whether this is a successful answer that carries at least one record.
pub fn has_answers(msg: &Message) -> bool {
    msg.response_code() == ResponseCode::NoError && !msg.answers().is_empty()
}

/// Collects the addresses of all A and AAAA answers in the message.
pub fn addresses(msg: &Message) -> Vec<IpAddr> {
    msg.answers().iter().filter_map(record_address).collect()
}

/// Returns the address carried by an A or AAAA record.
pub fn record_address(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

pub fn is_record_type(addr: &IpAddr, record_type: RecordType) -> bool {
    match addr {
        IpAddr::V4(_) => record_type == RecordType::A,
        IpAddr::V6(_) => record_type == RecordType::AAAA,
    }
}

pub fn to_record(name: Name, ttl: u32, rdata: RData) -> Record {
    Record::from_rdata(name, ttl, rdata)
}

pub fn cname_record(name: Name, canonical_name: Name, ttl: u32) -> Record {
    to_record(name, ttl, RData::CNAME(CNAME(canonical_name)))
}

pub fn ip_record(name: Name, addr: IpAddr, ttl: u32) -> Record {
    match addr {
        IpAddr::V4(addr) => to_record(name, ttl, RData::A(A(addr))),
        IpAddr::V6(addr) => to_record(name, ttl, RData::AAAA(AAAA(addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::dns::{a, aaaa, cname, ipv4, ipv6, n, new_message};

    #[test]
    fn reply_carries_request_identity() {
        let req = new_message(n("www.example.com."), RecordType::A);
        let reply = reply_to(&req);
        assert_eq!(req.id(), reply.id());
        assert_eq!(MessageType::Response, reply.message_type());
        assert_eq!(req.queries(), reply.queries());
        assert!(reply.answers().is_empty());

        let reply = error_reply(&req, ResponseCode::NXDomain);
        assert_eq!(ResponseCode::NXDomain, reply.response_code());
    }

    #[test]
    fn addresses_skip_non_ip_records() {
        let req = new_message(n("www.example.com."), RecordType::A);
        let mut reply = reply_to(&req);
        reply.add_answer(cname(n("www.example.com."), n("example.com.")));
        reply.add_answer(a(n("example.com."), ipv4("1.2.3.4")));
        reply.add_answer(aaaa(n("example.com."), ipv6("2001:db8::1")));

        assert_eq!(
            vec![
                IpAddr::V4(ipv4("1.2.3.4")),
                IpAddr::V6(ipv6("2001:db8::1"))
            ],
            addresses(&reply)
        );
        assert!(has_answers(&reply));
    }

    #[test]
    fn no_question() {
        let msg = Message::new();
        assert!(matches!(first_question(&msg), Err(Error::NoQuestion)));
    }
}
