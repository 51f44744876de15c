// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request construction helpers shared by the session, refer, and one-shot
//! layers. The Via transport/address part is a placeholder the host transport
//! rewrites; the branch is real and is how the core correlates responses.

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use sip_msg::{
    format_name_addr, Header, Headers, Method, Request, RequestLine, Response, SipUri,
};

use crate::config::UaConfig;

/// Methods advertised in Allow headers.
pub const ALLOWED_METHODS: &str =
    "INVITE, ACK, BYE, CANCEL, UPDATE, INFO, MESSAGE, REFER, NOTIFY, SUBSCRIBE, OPTIONS";

/// Generates an RFC 3261 magic-cookie branch identifier.
pub fn generate_branch() -> SmolStr {
    SmolStr::new(format!("z9hG4bK{}", random_token(16)))
}

/// Generates a From/To tag.
pub fn generate_tag() -> SmolStr {
    random_token(10)
}

/// Generates a Call-ID.
pub fn generate_call_id() -> SmolStr {
    SmolStr::new(format!("{}@siphon.invalid", random_token(22)))
}

fn random_token(len: usize) -> SmolStr {
    let mut rng = rand::thread_rng();
    let token: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    SmolStr::new(token)
}

/// Extracts the branch parameter from a message's top Via.
pub fn branch_of_headers(headers: &Headers) -> Option<SmolStr> {
    let via = headers.get("Via")?;
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(SmolStr::new(value))
        } else {
            None
        }
    })
}

/// Extracts the branch parameter from a request's top Via.
pub fn branch_of(req: &Request) -> Option<SmolStr> {
    branch_of_headers(&req.headers)
}

/// Extracts the branch parameter from a response's top Via.
pub fn response_branch(resp: &Response) -> Option<SmolStr> {
    branch_of_headers(&resp.headers)
}

/// Builds an out-of-dialog request skeleton: Via (placeholder host, fresh
/// branch), From/To, Call-ID, CSeq, Max-Forwards, Allow, Content-Length.
pub fn out_of_dialog_request(
    method: Method,
    target: &SipUri,
    from_value: SmolStr,
    to_value: SmolStr,
    call_id: SmolStr,
    cseq: u32,
    extra_headers: &[Header],
) -> Request {
    let mut headers = Headers::new();

    let branch = generate_branch();
    headers.push(
        SmolStr::new("Via"),
        SmolStr::new(format!("SIP/2.0/UDP placeholder;branch={}", branch)),
    );
    headers.push(SmolStr::new("From"), from_value);
    headers.push(SmolStr::new("To"), to_value);
    headers.push(SmolStr::new("Call-ID"), call_id);
    headers.push(
        SmolStr::new("CSeq"),
        SmolStr::new(format!("{} {}", cseq, method.as_str())),
    );
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    headers.push(SmolStr::new("Allow"), SmolStr::new(ALLOWED_METHODS));

    for header in extra_headers {
        headers.push(header.name.clone(), header.value.clone());
    }

    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Request::new(RequestLine::new(method, target.clone()), headers, Bytes::new())
}

/// Formats the local From value for out-of-dialog requests, honoring the
/// anonymous flag.
pub fn local_from_value(config: &UaConfig, tag: &str, anonymous: bool) -> SmolStr {
    if anonymous {
        let uri = SipUri::parse("sip:anonymous@anonymous.invalid").expect("static URI");
        format_name_addr(Some("Anonymous"), &uri, Some(tag))
    } else {
        format_name_addr(config.display_name.as_deref(), &config.uri, Some(tag))
    }
}

/// Formats the Contact value for outgoing requests and responses.
pub fn contact_value(config: &UaConfig) -> SmolStr {
    SmolStr::new(format!("<{}>", config.contact))
}

/// Attaches a body, replacing Content-Type and Content-Length.
pub fn set_body(req: &mut Request, content_type: &str, body: &str) {
    req.headers
        .set(SmolStr::new("Content-Type"), SmolStr::new(content_type));
    req.headers.set(
        SmolStr::new("Content-Length"),
        SmolStr::new(body.len().to_string()),
    );
    req.body = Bytes::from(body.as_bytes().to_vec());
}

/// Attaches a body to a response, replacing Content-Type and Content-Length.
pub fn set_response_body(resp: &mut Response, content_type: &str, body: &str) {
    resp.headers
        .set(SmolStr::new("Content-Type"), SmolStr::new(content_type));
    resp.headers.set(
        SmolStr::new("Content-Length"),
        SmolStr::new(body.len().to_string()),
    );
    resp.body = Bytes::from(body.as_bytes().to_vec());
}

/// Builds the CANCEL for a previously sent INVITE (RFC 3261 §9.1): same
/// Request-URI, branch, From, To, Call-ID, and CSeq number.
pub fn cancel_for(invite: &Request, reason: Option<&str>) -> Request {
    let mut headers = Headers::new();

    if let Some(via) = invite.headers.get("Via") {
        headers.push(SmolStr::new("Via"), via.clone());
    }
    if let Some(from) = invite.headers.get("From") {
        headers.push(SmolStr::new("From"), from.clone());
    }
    if let Some(to) = invite.headers.get("To") {
        headers.push(SmolStr::new("To"), to.clone());
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        headers.push(SmolStr::new("Call-ID"), call_id.clone());
    }
    if let Some(cseq) = invite.cseq_number() {
        headers.push(
            SmolStr::new("CSeq"),
            SmolStr::new(format!("{} CANCEL", cseq)),
        );
    }
    for route in invite.headers.get_all("Route") {
        headers.push(SmolStr::new("Route"), route.clone());
    }
    headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
    if let Some(reason) = reason {
        headers.push(SmolStr::new("Reason"), SmolStr::new(reason));
    }
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Request::new(
        RequestLine::new(Method::Cancel, invite.start.uri.clone()),
        headers,
        Bytes::new(),
    )
}

/// Parses an Allow header value into methods.
pub fn parse_allow(value: &str) -> Vec<Method> {
    value
        .split(',')
        .map(|token| Method::from_token(token.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_branch_has_magic_cookie() {
        let branch = generate_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert!(branch.len() > "z9hG4bK".len());
    }

    #[test]
    fn skeleton_carries_branch_and_cseq() {
        let target = SipUri::parse("sip:bob@example.com").unwrap();
        let req = out_of_dialog_request(
            Method::Message,
            &target,
            "<sip:alice@example.com>;tag=t1".into(),
            "<sip:bob@example.com>".into(),
            "c1".into(),
            7,
            &[],
        );
        assert_eq!(req.headers.get("CSeq").map(|v| v.as_str()), Some("7 MESSAGE"));
        assert!(branch_of(&req).unwrap().starts_with("z9hG4bK"));
        assert_eq!(req.headers.get("Content-Length").map(|v| v.as_str()), Some("0"));
    }

    #[test]
    fn cancel_reuses_invite_identity() {
        let target = SipUri::parse("sip:bob@example.com").unwrap();
        let invite = out_of_dialog_request(
            Method::Invite,
            &target,
            "<sip:alice@example.com>;tag=t1".into(),
            "<sip:bob@example.com>".into(),
            "c1".into(),
            3,
            &[],
        );
        let cancel = cancel_for(&invite, Some("SIP;cause=486;text=\"Busy Here\""));

        assert_eq!(cancel.start.method, Method::Cancel);
        assert_eq!(cancel.headers.get("CSeq").map(|v| v.as_str()), Some("3 CANCEL"));
        assert_eq!(branch_of(&cancel), branch_of(&invite));
        assert!(cancel.headers.get("Reason").is_some());
    }

    #[test]
    fn body_attachment_sets_length() {
        let target = SipUri::parse("sip:bob@example.com").unwrap();
        let mut req = out_of_dialog_request(
            Method::Invite,
            &target,
            "<sip:a@h>;tag=1".into(),
            "<sip:b@h>".into(),
            "c1".into(),
            1,
            &[],
        );
        set_body(&mut req, "application/sdp", "v=0\r\n");
        assert_eq!(req.headers.get("Content-Type").map(|v| v.as_str()), Some("application/sdp"));
        assert_eq!(req.headers.get("Content-Length").map(|v| v.as_str()), Some("5"));
        assert_eq!(req.headers.count("Content-Length"), 1);
    }

    #[test]
    fn allow_parsing() {
        let methods = parse_allow("INVITE, ACK, BYE,UPDATE");
        assert!(methods.contains(&Method::Update));
        assert!(methods.contains(&Method::Invite));
        assert_eq!(methods.len(), 4);
    }

    #[test]
    fn anonymous_from_masks_identity() {
        let config = UaConfig::new(
            SipUri::parse("sip:alice@example.com").unwrap(),
            SipUri::parse("sip:alice@10.0.0.1:5060").unwrap(),
        );
        let from = local_from_value(&config, "t1", true);
        assert!(from.contains("anonymous.invalid"));
        assert!(!from.contains("alice@example.com"));
    }
}
