// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `Reason` header (RFC 3326), as attached to CANCEL and BYE.

use smol_str::SmolStr;

/// A `Reason` header value: `SIP;cause=408;text="Session Timer"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonHeader {
    pub protocol: SmolStr,
    pub cause: Option<u16>,
    pub text: Option<SmolStr>,
}

impl ReasonHeader {
    /// Builds a SIP-protocol reason from a status code and its phrase.
    pub fn sip(cause: u16, text: &str) -> Self {
        Self {
            protocol: SmolStr::new("SIP"),
            cause: Some(cause),
            text: Some(SmolStr::new(text)),
        }
    }

    /// Parses a header value. The protocol token is mandatory.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let protocol = segments.next()?.trim();
        if protocol.is_empty() {
            return None;
        }
        let mut cause = None;
        let mut text = None;
        for segment in segments {
            let mut split = segment.splitn(2, '=');
            let name = split.next()?.trim();
            let param_value = split.next().map(str::trim);
            if name.eq_ignore_ascii_case("cause") {
                cause = param_value.and_then(|v| v.parse().ok());
            } else if name.eq_ignore_ascii_case("text") {
                text = param_value.map(|v| SmolStr::new(v.trim_matches('"')));
            }
        }
        Some(Self {
            protocol: SmolStr::new(protocol),
            cause,
            text,
        })
    }
}

impl std::fmt::Display for ReasonHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.protocol)?;
        if let Some(cause) = self.cause {
            write!(f, ";cause={}", cause)?;
        }
        if let Some(text) = &self.text {
            write!(f, ";text=\"{}\"", text)?;
        }
        Ok(())
    }
}
