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

use hickory_proto::op::{Edns, Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, Record};
use hickory_proto::xfer::Protocol;
use hickory_server::authority::{MessageResponse, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tracing::{debug, error, warn};

use crate::dns::Error;
use crate::dns::message::query;
use crate::dns::server::DnsServer;

/// A Hickory [RequestHandler] that serves requests with a [DnsServer], so any strategy can sit
/// behind a UDP/TCP listener.
pub struct Handler {
    server: Arc<dyn DnsServer>,
}

impl Handler {
    /// Creates a new request handler for the server.
    pub fn new(server: Arc<dyn DnsServer>) -> Self {
        Self { server }
    }

    async fn lookup<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let Ok(info) = request.request_info() else {
            return send_error(request, response_handle, ResponseCode::FormErr).await;
        };
        let mut msg = query(
            Name::from(info.query.name().clone()),
            info.query.query_type(),
        );
        msg.set_id(request.id())
            .set_recursion_desired(request.header().recursion_desired());
        if let Some(edns) = request.edns() {
            msg.set_edns(edns.clone());
        }

        let is_tcp = request.protocol() == Protocol::Tcp;
        match self.server.handle_query(&msg, is_tcp).await {
            Ok(answer) => send_answer(request, response_handle, answer).await,
            Err(e) => {
                debug!(err=%e, "query failed");
                send_error(request, response_handle, error_code(&e)).await
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match request.message_type() {
            MessageType::Query => match request.op_code() {
                OpCode::Query => self.lookup(request, response_handle).await,
                _ => {
                    warn!("unimplemented op_code: {:?}", request.op_code());
                    send_error(request, response_handle, ResponseCode::NotImp).await
                }
            },
            MessageType::Response => {
                warn!("got a response as a request from id: {}", request.id());
                send_error(request, response_handle, ResponseCode::FormErr).await
            }
        }
    }
}

/// Maps a failed query to the response code the client sees.
fn error_code(e: &Error) -> ResponseCode {
    match e {
        Error::UnsupportedQueryType(_) => ResponseCode::NotImp,
        Error::NoQuestion | Error::InvalidName(..) => ResponseCode::FormErr,
        _ => ResponseCode::ServFail,
    }
}

async fn send_answer<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    answer: Message,
) -> ResponseInfo {
    let mut response_header = Header::response_from_request(request.header());
    response_header.set_authoritative(answer.authoritative());
    response_header.set_recursion_available(true);
    response_header.set_response_code(answer.response_code());

    // Create the response builder.
    let mut builder = MessageResponseBuilder::from_message_request(request);

    // Set EDNS if supplied in the request.
    if let Some(edns) = response_edns(request) {
        builder.edns(edns);
    }

    let response = builder.build(
        response_header,
        answer.answers().iter(),
        answer.name_servers().iter(),
        None.iter(),
        answer.additionals().iter(),
    );

    send_response(response, response_handle).await
}

/// Sends an error response back to the client.
async fn send_error<R: ResponseHandler>(
    request: &Request,
    response_handle: R,
    code: ResponseCode,
) -> ResponseInfo {
    let response =
        MessageResponseBuilder::from_message_request(request).error_msg(request.header(), code);

    send_response(response, response_handle).await
}

/// Sends the response to the [ResponseHandler] and handles any errors.
async fn send_response<'a, R: ResponseHandler>(
    response: MessageResponse<
        '_,
        'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
        impl Iterator<Item = &'a Record> + Send + 'a,
    >,
    mut response_handle: R,
) -> ResponseInfo {
    let result = response_handle.send_response(response).await;

    match result {
        Err(e) => {
            error!("request error: {}", e);
            let mut header = Header::new();
            header.set_response_code(ResponseCode::ServFail);
            header.into()
        }
        Ok(info) => info,
    }
}

/// Creates an appropriate response [Edns], if one was available in the request.
fn response_edns(request: &Request) -> Option<Edns> {
    if let Some(req_edns) = request.edns() {
        let mut resp_edns: Edns = Edns::new();
        resp_edns.set_max_payload(req_edns.max_payload().max(512));
        resp_edns.set_version(req_edns.version());
        resp_edns.set_dnssec_ok(req_edns.flags().dnssec_ok);

        Some(resp_edns)
    } else {
        None
    }
}
