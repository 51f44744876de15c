// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Message builders for exercising the UA core in tests.
//!
//! The helpers here play the *peer's* side: responses are derived from the
//! actual request the core sent (echoing Via/branch, CSeq, Call-ID), and
//! in-dialog requests are assembled from explicit tags the scenario tracks.
//!
//! # Example
//! ```
//! use sip_ua_testkit::build_invite;
//! let invite = build_invite("sip:bob@example.com", "z9hG4bKtest1", "call-1", "from-1");
//! assert_eq!(invite.start.method.as_str(), "INVITE");
//! ```

use bytes::Bytes;
use sip_msg::{
    extract_tag, Headers, Method, Request, RequestLine, Response, SipUri, StatusLine,
};
use smol_str::SmolStr;

/// A minimal but plausible SDP body.
pub const SAMPLE_SDP: &str = "v=0\r\no=- 0 0 IN IP4 192.0.2.1\r\ns=-\r\nc=IN IP4 192.0.2.1\r\nt=0 0\r\nm=audio 49170 RTP/AVP 0\r\n";

/// Constructs an out-of-dialog INVITE arriving from a remote peer.
pub fn build_invite(uri: &str, branch: &str, call_id: &str, from_tag: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP client.example.com:5060;branch={}",
            branch
        )),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new(format!("<sip:alice@example.com>;tag={}", from_tag)),
    );
    headers.push(SmolStr::new("To"), SmolStr::new("<sip:bob@example.com>"));
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id.to_owned()));
    headers.push(SmolStr::new("CSeq"), SmolStr::new("1 INVITE"));
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(
        SmolStr::new("Contact"),
        SmolStr::new("<sip:alice@client.example.com:5060>"),
    );
    headers.push(
        SmolStr::new("Content-Type"),
        SmolStr::new("application/sdp"),
    );
    headers.push(
        SmolStr::new("Content-Length"),
        SmolStr::new(SAMPLE_SDP.len().to_string()),
    );

    Request::new(
        RequestLine::new(Method::Invite, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::from(SAMPLE_SDP.as_bytes().to_vec()),
    )
}

/// Constructs an out-of-dialog MESSAGE arriving from a remote peer.
pub fn build_message(uri: &str, branch: &str, call_id: &str, body: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP client.example.com:5060;branch={}",
            branch
        )),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new("<sip:alice@example.com>;tag=msg1"),
    );
    headers.push(SmolStr::new("To"), SmolStr::new("<sip:bob@example.com>"));
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id.to_owned()));
    headers.push(SmolStr::new("CSeq"), SmolStr::new("1 MESSAGE"));
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(SmolStr::new("Content-Type"), SmolStr::new("text/plain"));
    headers.push(
        SmolStr::new("Content-Length"),
        SmolStr::new(body.len().to_string()),
    );

    Request::new(
        RequestLine::new(Method::Message, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::from(body.as_bytes().to_vec()),
    )
}

/// Constructs an out-of-dialog REFER arriving from a remote peer.
pub fn build_refer(uri: &str, branch: &str, call_id: &str, refer_to: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP client.example.com:5060;branch={}",
            branch
        )),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new(format!("<sip:alice@example.com>;tag=ref-{}", call_id)),
    );
    headers.push(SmolStr::new("To"), SmolStr::new("<sip:bob@example.com>"));
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id.to_owned()));
    headers.push(SmolStr::new("CSeq"), SmolStr::new("1 REFER"));
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(
        SmolStr::new("Contact"),
        SmolStr::new("<sip:alice@client.example.com:5060>"),
    );
    headers.push(SmolStr::new("Refer-To"), SmolStr::new(refer_to.to_owned()));
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Request::new(
        RequestLine::new(Method::Refer, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
}

/// Builds a response to `req`, echoing Via, From, To, Call-ID, and CSeq.
/// `to_tag` is appended when the request's To had none; `with_contact` adds
/// a Contact; `sdp` attaches an SDP body.
pub fn respond_to(
    req: &Request,
    code: u16,
    reason: &str,
    to_tag: Option<&str>,
    with_contact: bool,
    sdp: Option<&str>,
) -> Response {
    let mut headers = Headers::new();
    for via in req.headers.get_all("Via") {
        headers.push(SmolStr::new("Via"), via.clone());
    }
    if let Some(from) = req.headers.get("From") {
        headers.push(SmolStr::new("From"), from.clone());
    }
    if let Some(to) = req.headers.get("To") {
        let value = match to_tag {
            Some(tag) if extract_tag(to).is_none() => {
                SmolStr::new(format!("{};tag={}", to, tag))
            }
            _ => to.clone(),
        };
        headers.push(SmolStr::new("To"), value);
    }
    if let Some(call_id) = req.headers.get("Call-ID") {
        headers.push(SmolStr::new("Call-ID"), call_id.clone());
    }
    if let Some(cseq) = req.headers.get("CSeq") {
        headers.push(SmolStr::new("CSeq"), cseq.clone());
    }
    if with_contact {
        headers.push(
            SmolStr::new("Contact"),
            SmolStr::new("<sip:peer@server.example.com:5060>"),
        );
    }

    let body = match sdp {
        Some(sdp) => {
            headers.push(
                SmolStr::new("Content-Type"),
                SmolStr::new("application/sdp"),
            );
            headers.push(
                SmolStr::new("Content-Length"),
                SmolStr::new(sdp.len().to_string()),
            );
            Bytes::from(sdp.as_bytes().to_vec())
        }
        None => {
            headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));
            Bytes::new()
        }
    };

    Response::new(
        StatusLine::new(code, SmolStr::new(reason)),
        headers,
        body,
    )
}

/// Builds an in-dialog request from the remote peer's perspective.
/// `local_tag`/`remote_tag` are *our* tags: the request's From carries the
/// remote tag and its To carries ours.
#[allow(clippy::too_many_arguments)]
pub fn build_in_dialog_request(
    method: Method,
    uri: &str,
    branch: &str,
    call_id: &str,
    our_tag: &str,
    their_tag: &str,
    cseq: u32,
    body: Option<(&str, &str)>,
) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP client.example.com:5060;branch={}",
            branch
        )),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new(format!("<sip:alice@example.com>;tag={}", their_tag)),
    );
    headers.push(
        SmolStr::new("To"),
        SmolStr::new(format!("<sip:bob@example.com>;tag={}", our_tag)),
    );
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id.to_owned()));
    headers.push(
        SmolStr::new("CSeq"),
        SmolStr::new(format!("{} {}", cseq, method.as_str())),
    );
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(
        SmolStr::new("Contact"),
        SmolStr::new("<sip:alice@client.example.com:5060>"),
    );

    let payload = match body {
        Some((content_type, payload)) => {
            headers.push(
                SmolStr::new("Content-Type"),
                SmolStr::new(content_type.to_owned()),
            );
            headers.push(
                SmolStr::new("Content-Length"),
                SmolStr::new(payload.len().to_string()),
            );
            Bytes::from(payload.as_bytes().to_vec())
        }
        None => {
            headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));
            Bytes::new()
        }
    };

    Request::new(
        RequestLine::new(method, SipUri::parse(uri).unwrap()),
        headers,
        payload,
    )
}

/// Builds the NOTIFY a REFER notifier sends. `our_tag` is the tag we used in
/// the REFER's From; `their_tag` becomes the remote tag of the subscription
/// dialog.
pub fn build_refer_notify(
    branch: &str,
    call_id: &str,
    our_tag: &str,
    their_tag: &str,
    cseq: u32,
    subscription_state: &str,
    sipfrag: &str,
) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!(
            "SIP/2.0/UDP notifier.example.com:5060;branch={}",
            branch
        )),
    );
    headers.push(
        SmolStr::new("From"),
        SmolStr::new(format!("<sip:bob@example.com>;tag={}", their_tag)),
    );
    headers.push(
        SmolStr::new("To"),
        SmolStr::new(format!("<sip:alice@example.com>;tag={}", our_tag)),
    );
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id.to_owned()));
    headers.push(
        SmolStr::new("CSeq"),
        SmolStr::new(format!("{} NOTIFY", cseq)),
    );
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(
        SmolStr::new("Contact"),
        SmolStr::new("<sip:bob@notifier.example.com:5060>"),
    );
    headers.push(SmolStr::new("Event"), SmolStr::new("refer"));
    headers.push(
        SmolStr::new("Subscription-State"),
        SmolStr::new(subscription_state.to_owned()),
    );
    headers.push(
        SmolStr::new("Content-Type"),
        SmolStr::new("message/sipfrag"),
    );
    headers.push(
        SmolStr::new("Content-Length"),
        SmolStr::new(sipfrag.len().to_string()),
    );

    Request::new(
        RequestLine::new(
            Method::Notify,
            SipUri::parse("sip:alice@client.example.com").unwrap(),
        ),
        headers,
        Bytes::from(sipfrag.as_bytes().to_vec()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_is_well_formed() {
        let invite = build_invite("sip:bob@example.com", "z9hG4bK1", "c1", "f1");
        assert_eq!(invite.cseq_number(), Some(1));
        assert!(invite.has_body());
        assert_eq!(
            extract_tag(invite.headers.get("From").unwrap()).as_deref(),
            Some("f1")
        );
        assert!(extract_tag(invite.headers.get("To").unwrap()).is_none());
    }

    #[test]
    fn respond_echoes_request_identity() {
        let invite = build_invite("sip:bob@example.com", "z9hG4bK1", "c1", "f1");
        let resp = respond_to(&invite, 180, "Ringing", Some("t1"), true, None);

        assert_eq!(resp.start.code, 180);
        assert_eq!(resp.headers.get("Call-ID"), invite.headers.get("Call-ID"));
        assert_eq!(resp.headers.get("CSeq"), invite.headers.get("CSeq"));
        assert_eq!(
            extract_tag(resp.headers.get("To").unwrap()).as_deref(),
            Some("t1")
        );
    }

    #[test]
    fn in_dialog_request_swaps_tags() {
        let bye = build_in_dialog_request(
            Method::Bye,
            "sip:bob@example.com",
            "z9hG4bK2",
            "c1",
            "ours",
            "theirs",
            2,
            None,
        );
        assert_eq!(
            extract_tag(bye.headers.get("To").unwrap()).as_deref(),
            Some("ours")
        );
        assert_eq!(
            extract_tag(bye.headers.get("From").unwrap()).as_deref(),
            Some("theirs")
        );
    }

    #[test]
    fn notify_carries_sipfrag() {
        let notify = build_refer_notify(
            "z9hG4bK3",
            "c2",
            "ours",
            "theirs",
            1,
            "active;expires=180",
            "SIP/2.0 100 Trying\r\n",
        );
        assert_eq!(notify.headers.get("Event").map(|v| v.as_str()), Some("refer"));
        assert!(notify.has_body());
    }
}
