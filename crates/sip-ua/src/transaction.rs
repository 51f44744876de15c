// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Egress seam and server-transaction state mirror.
//!
//! The real RFC 3261 §17 transaction machines live in the host stack; the
//! core only needs two things from that layer. Outbound, a place to hand
//! fully built messages: [`OutboundSink`]. Inbound, enough server-transaction
//! state to enforce the in-dialog gatekeeper rules (a second INVITE while the
//! previous one is Proceeding, an UPDATE while one is Trying/Proceeding):
//! since the core itself sends every response, it can mirror that state
//! locally in [`ServerTransaction`].

use bytes::Bytes;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::sync::Arc;

use sip_msg::{reason_phrase_for, Header, Headers, Method, Request, Response, StatusLine};

use crate::request::{branch_of, generate_branch};

/// Where built messages go. The host wires this to its transaction layer.
///
/// Implementations must not call back into the core synchronously; inbound
/// traffic is delivered through the
/// [`UserAgent`](crate::agent::UserAgent) receive methods instead.
pub trait OutboundSink: Send + Sync {
    fn send_request(&self, req: Request);
    fn send_response(&self, resp: Response);
}

/// Mirrored server transaction state (RFC 3261 §17.2, collapsed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTxState {
    Trying,
    Proceeding,
    Completed,
}

/// Local mirror of a server transaction.
///
/// Created per incoming request; state advances as the core replies through
/// it. INVITE transactions start in Proceeding, everything else in Trying.
#[derive(Debug)]
pub struct ServerTransaction {
    pub branch: SmolStr,
    pub request: Request,
    state: Mutex<ServerTxState>,
    to_tag: Mutex<Option<SmolStr>>,
}

impl PartialEq for ServerTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.branch == other.branch
            && self.request == other.request
            && *self.state.lock() == *other.state.lock()
            && *self.to_tag.lock() == *other.to_tag.lock()
    }
}

impl ServerTransaction {
    pub fn new(request: Request) -> Arc<Self> {
        let branch = branch_of(&request).unwrap_or_else(generate_branch);
        let state = if request.start.method == Method::Invite {
            ServerTxState::Proceeding
        } else {
            ServerTxState::Trying
        };
        Arc::new(Self {
            branch,
            request,
            state: Mutex::new(state),
            to_tag: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ServerTxState {
        *self.state.lock()
    }

    /// True while no final response has been sent.
    pub fn is_pending(&self) -> bool {
        !matches!(self.state(), ServerTxState::Completed)
    }

    /// Pins the To tag used on every response of this transaction.
    pub fn set_to_tag(&self, tag: SmolStr) {
        *self.to_tag.lock() = Some(tag);
    }

    /// Builds and sends a response to the mirrored request.
    ///
    /// Returns the response that went out. The reason phrase defaults per
    /// status code; `body` is a (content-type, payload) pair.
    pub fn reply(
        &self,
        sink: &dyn OutboundSink,
        code: u16,
        reason: Option<&str>,
        extra_headers: &[Header],
        body: Option<(&str, &str)>,
    ) -> Response {
        let to_tag = self.to_tag.lock().clone();
        let mut resp = response_for(&self.request, code, reason, to_tag.as_deref());
        for header in extra_headers {
            resp.headers.push(header.name.clone(), header.value.clone());
        }
        if let Some((content_type, payload)) = body {
            crate::request::set_response_body(&mut resp, content_type, payload);
        }

        {
            let mut state = self.state.lock();
            *state = if code < 200 {
                ServerTxState::Proceeding
            } else {
                ServerTxState::Completed
            };
        }

        sink.send_response(resp.clone());
        resp
    }

    /// Re-sends a previously built response (2xx retransmission path).
    pub fn retransmit(&self, sink: &dyn OutboundSink, resp: &Response) {
        sink.send_response(resp.clone());
    }
}

/// Builds a response from a request, copying the headers RFC 3261 §8.2.6
/// requires and optionally stamping a To tag.
pub fn response_for(
    request: &Request,
    code: u16,
    reason: Option<&str>,
    to_tag: Option<&str>,
) -> Response {
    let reason = match reason {
        Some(reason) => SmolStr::new(reason),
        None => SmolStr::new(reason_phrase_for(code)),
    };

    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push(SmolStr::new("Via"), via.clone());
    }
    if let Some(from) = request.headers.get("From") {
        headers.push(SmolStr::new("From"), from.clone());
    }
    if let Some(to) = request.headers.get("To") {
        let value = match to_tag {
            Some(tag) if sip_msg::extract_tag(to).is_none() => {
                SmolStr::new(format!("{};tag={}", to, tag))
            }
            _ => to.clone(),
        };
        headers.push(SmolStr::new("To"), value);
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        headers.push(SmolStr::new("Call-ID"), call_id.clone());
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.push(SmolStr::new("CSeq"), cseq.clone());
    }
    // Record-Route is echoed on dialog-forming responses.
    if (101..300).contains(&code) {
        for rr in request.headers.get_all("Record-Route") {
            headers.push(SmolStr::new("Record-Route"), rr.clone());
        }
    }
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Response::new(StatusLine::new(code, reason), headers, Bytes::new())
}

/// One-off reply for requests that never get a transaction mirror
/// (unmatched CANCEL, stray in-dialog requests).
pub fn reply_statelessly(
    sink: &dyn OutboundSink,
    request: &Request,
    code: u16,
    extra_headers: &[Header],
) {
    let mut resp = response_for(request, code, None, None);
    for header in extra_headers {
        resp.headers.push(header.name.clone(), header.value.clone());
    }
    sink.send_response(resp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use sip_msg::{RequestLine, SipUri};

    #[derive(Default)]
    struct VecSink {
        responses: PlMutex<Vec<Response>>,
    }

    impl OutboundSink for VecSink {
        fn send_request(&self, _req: Request) {}
        fn send_response(&self, resp: Response) {
            self.responses.lock().push(resp);
        }
    }

    fn sample_request(method: Method) -> Request {
        let mut headers = Headers::new();
        headers.push("Via".into(), "SIP/2.0/UDP host;branch=z9hG4bKabc".into());
        headers.push("From".into(), "<sip:alice@example.com>;tag=f1".into());
        headers.push("To".into(), "<sip:bob@example.com>".into());
        headers.push("Call-ID".into(), "c1@example.com".into());
        headers.push("CSeq".into(), format!("1 {}", method.as_str()).into());
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn invite_tx_starts_proceeding() {
        let tx = ServerTransaction::new(sample_request(Method::Invite));
        assert_eq!(tx.state(), ServerTxState::Proceeding);
        assert!(tx.is_pending());
    }

    #[test]
    fn non_invite_tx_starts_trying() {
        let tx = ServerTransaction::new(sample_request(Method::Update));
        assert_eq!(tx.state(), ServerTxState::Trying);
    }

    #[test]
    fn reply_advances_state_and_sends() {
        let sink = VecSink::default();
        let tx = ServerTransaction::new(sample_request(Method::Invite));

        tx.reply(&sink, 180, None, &[], None);
        assert_eq!(tx.state(), ServerTxState::Proceeding);

        tx.reply(&sink, 200, None, &[], None);
        assert_eq!(tx.state(), ServerTxState::Completed);
        assert!(!tx.is_pending());

        let responses = sink.responses.lock();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].code(), 180);
        assert_eq!(responses[0].start.reason.as_str(), "Ringing");
        assert_eq!(responses[1].code(), 200);
    }

    #[test]
    fn reply_stamps_pinned_to_tag() {
        let sink = VecSink::default();
        let tx = ServerTransaction::new(sample_request(Method::Invite));
        tx.set_to_tag("uas-1".into());

        let resp = tx.reply(&sink, 180, None, &[], None);
        let to = resp.headers.get("To").unwrap();
        assert_eq!(sip_msg::extract_tag(to).as_deref(), Some("uas-1"));
    }

    #[test]
    fn response_copies_mandatory_headers() {
        let req = sample_request(Method::Invite);
        let resp = response_for(&req, 200, None, Some("t1"));

        assert_eq!(
            resp.headers.get("Via").map(|v| v.as_str()),
            Some("SIP/2.0/UDP host;branch=z9hG4bKabc")
        );
        assert_eq!(resp.headers.get("Call-ID").map(|v| v.as_str()), Some("c1@example.com"));
        assert_eq!(resp.headers.get("CSeq").map(|v| v.as_str()), Some("1 INVITE"));
        assert_eq!(resp.start.reason.as_str(), "OK");
    }

    #[test]
    fn existing_to_tag_is_kept() {
        let mut req = sample_request(Method::Bye);
        req.headers.set("To".into(), "<sip:bob@example.com>;tag=orig".into());
        let resp = response_for(&req, 200, None, Some("other"));
        let to = resp.headers.get("To").unwrap();
        assert_eq!(sip_msg::extract_tag(to).as_deref(), Some("orig"));
    }
}
