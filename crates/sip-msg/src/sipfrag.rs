// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `message/sipfrag` bodies (RFC 3420), as carried by REFER NOTIFYs.
//!
//! The fragment is kept parsed (status code + reason phrase) for its whole
//! life inside the core and only rendered to wire form at send time. Parsing
//! accepts a bare status line and tolerates trailing header lines, which is
//! the shape RFC 3515 notifiers actually produce.

use smol_str::SmolStr;

use crate::msg::reason_phrase_for;

/// MIME type of REFER notification bodies.
pub const SIPFRAG_CONTENT_TYPE: &str = "message/sipfrag";

/// A parsed status-line fragment: `SIP/2.0 <code> <reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipFrag {
    pub code: u16,
    pub reason: SmolStr,
}

impl SipFrag {
    /// Builds a fragment, filling the default reason phrase when one is not
    /// supplied.
    pub fn new(code: u16, reason: Option<&str>) -> Self {
        let reason = match reason {
            Some(reason) => SmolStr::new(reason),
            None => SmolStr::new(reason_phrase_for(code)),
        };
        Self { code, reason }
    }

    /// Parses the first line of a sipfrag body. Returns `None` when the body
    /// does not start with a SIP/2.0 status line or the code is out of range.
    pub fn parse(body: &str) -> Option<Self> {
        let line = body.lines().next()?.trim();
        let rest = line
            .strip_prefix("SIP/2.0 ")
            .or_else(|| line.strip_prefix("sip/2.0 "))?;
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason.trim()),
            None => (rest, ""),
        };
        let code: u16 = code.trim().parse().ok()?;
        if !(100..700).contains(&code) {
            return None;
        }
        Some(Self {
            code,
            reason: SmolStr::new(reason),
        })
    }

    /// Returns true for a provisional (1xx) fragment.
    pub fn is_provisional(&self) -> bool {
        self.code < 200
    }

    /// Returns true for a success (2xx) fragment.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

impl std::fmt::Display for SipFrag {
    /// Renders the wire form, CRLF terminated.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.code, self.reason)
    }
}
