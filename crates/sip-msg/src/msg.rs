// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri};

/// SIP protocol version. Only SIP/2.0 exists in the wild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SipVersion {
    #[default]
    V2,
}

impl std::fmt::Display for SipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SIP/2.0")
    }
}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
    pub version: SipVersion,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SipVersion::V2,
        }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: SipVersion,
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    pub fn new(code: u16, reason: SmolStr) -> Self {
        Self {
            version: SipVersion::V2,
            code,
            reason,
        }
    }

    /// Returns true if this is a provisional response (1xx).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a final response (>= 200).
    pub fn is_final(&self) -> bool {
        self.code >= 200
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Builds a request from its components.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.start.method
    }

    /// Returns the parsed CSeq sequence number, if present and well formed.
    pub fn cseq_number(&self) -> Option<u32> {
        cseq_number(&self.headers)
    }

    /// Returns true if the message carries a body.
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Builds a response from its components.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code
    }

    /// Returns the method token carried in the CSeq header, if any.
    pub fn cseq_method(&self) -> Option<Method> {
        cseq_method(&self.headers)
    }

    /// Returns the parsed CSeq sequence number, if present and well formed.
    pub fn cseq_number(&self) -> Option<u32> {
        cseq_number(&self.headers)
    }

    /// Returns true if the message carries a body.
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}

/// Either a SIP request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    /// Returns the headers regardless of message kind.
    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => &req.headers,
            Self::Response(resp) => &resp.headers,
        }
    }

    /// Returns a reference to the request if this is one.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Self::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Returns a reference to the response if this is one.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Self::Response(resp) => Some(resp),
            _ => None,
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        Self::Response(resp)
    }
}

/// Parses the sequence number out of a CSeq header value (`"314 INVITE"`).
fn cseq_number(headers: &Headers) -> Option<u32> {
    headers.get("CSeq")?.split_whitespace().next()?.parse().ok()
}

/// Parses the method token out of a CSeq header value.
fn cseq_method(headers: &Headers) -> Option<Method> {
    headers
        .get("CSeq")?
        .split_whitespace()
        .nth(1)
        .map(Method::from_token)
}

/// Returns the default reason phrase for the status codes the core emits.
pub fn reason_phrase_for(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        403 => "Forbidden",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Server Internal Error",
        603 => "Decline",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_cseq(value: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("CSeq".into(), value.into());
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn cseq_parsing() {
        let req = request_with_cseq("314 INVITE");
        assert_eq!(req.cseq_number(), Some(314));
    }

    #[test]
    fn malformed_cseq_is_none() {
        assert_eq!(request_with_cseq("banana INVITE").cseq_number(), None);
        assert_eq!(request_with_cseq("").cseq_number(), None);
    }

    #[test]
    fn response_cseq_method() {
        let mut headers = Headers::new();
        headers.push("CSeq".into(), "2 NOTIFY".into());
        let resp = Response::new(StatusLine::new(200, "OK".into()), headers, Bytes::new());
        assert_eq!(resp.cseq_method(), Some(Method::Notify));
        assert_eq!(resp.cseq_number(), Some(2));
    }

    #[test]
    fn status_line_predicates() {
        assert!(StatusLine::new(180, "Ringing".into()).is_provisional());
        assert!(StatusLine::new(200, "OK".into()).is_success());
        assert!(StatusLine::new(487, "Request Terminated".into()).is_final());
        assert!(!StatusLine::new(100, "Trying".into()).is_final());
    }

    #[test]
    fn reason_phrases_for_emitted_codes() {
        for code in [100, 180, 200, 202, 400, 403, 405, 415, 480, 481, 487, 488, 489, 491, 500, 603]
        {
            assert!(!reason_phrase_for(code).is_empty(), "missing phrase for {code}");
        }
        assert_eq!(reason_phrase_for(599), "");
    }
}
