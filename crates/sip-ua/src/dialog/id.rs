// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

use sip_msg::{extract_tag, Request, Response};

/// Unique dialog identifier: Call-ID plus local and remote tags
/// (RFC 3261 §12). Ordered by its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Dialog id from a response we received as UAC: From tag is ours.
    pub fn uac_from_response(resp: &Response) -> Option<Self> {
        let call_id = resp.headers.get("Call-ID")?.clone();
        let local_tag = extract_tag(resp.headers.get("From")?)?;
        let remote_tag = extract_tag(resp.headers.get("To")?)?;
        Some(Self::new(call_id, local_tag, remote_tag))
    }

    /// Dialog id for an incoming in-dialog request: To tag is ours.
    pub fn from_incoming_request(req: &Request) -> Option<Self> {
        let call_id = req.headers.get("Call-ID")?.clone();
        let local_tag = extract_tag(req.headers.get("To")?)?;
        let remote_tag = extract_tag(req.headers.get("From")?)?;
        Some(Self::new(call_id, local_tag, remote_tag))
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

impl PartialOrd for DialogId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DialogId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_msg::{Headers, Method, RequestLine, SipUri, StatusLine};

    fn response(call_id: &str, from_tag: &str, to_tag: Option<&str>) -> Response {
        let mut headers = Headers::new();
        headers.push("Call-ID".into(), call_id.into());
        headers.push(
            "From".into(),
            format!("<sip:a@h>;tag={}", from_tag).into(),
        );
        let to = match to_tag {
            Some(tag) => format!("<sip:b@h>;tag={}", tag),
            None => "<sip:b@h>".to_owned(),
        };
        headers.push("To".into(), to.into());
        Response::new(StatusLine::new(200, "OK".into()), headers, Bytes::new())
    }

    #[test]
    fn uac_id_uses_from_as_local() {
        let id = DialogId::uac_from_response(&response("c1", "lf", Some("rt"))).unwrap();
        assert_eq!(id.local_tag.as_str(), "lf");
        assert_eq!(id.remote_tag.as_str(), "rt");
    }

    #[test]
    fn missing_to_tag_means_no_id() {
        assert!(DialogId::uac_from_response(&response("c1", "lf", None)).is_none());
    }

    #[test]
    fn incoming_request_swaps_perspective() {
        let mut headers = Headers::new();
        headers.push("Call-ID".into(), "c1".into());
        headers.push("From".into(), "<sip:a@h>;tag=their".into());
        headers.push("To".into(), "<sip:b@h>;tag=ours".into());
        let req = Request::new(
            RequestLine::new(Method::Bye, SipUri::parse("sip:b@h").unwrap()),
            headers,
            Bytes::new(),
        );

        let id = DialogId::from_incoming_request(&req).unwrap();
        assert_eq!(id.local_tag.as_str(), "ours");
        assert_eq!(id.remote_tag.as_str(), "their");
    }

    #[test]
    fn ordering_follows_string_form() {
        let a = DialogId::new("c1", "a", "b");
        let b = DialogId::new("c1", "b", "a");
        assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        assert_eq!(a.to_string(), "c1ab");
    }
}
