// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The `Target-Dialog` header (RFC 4538).
//!
//! Identifies the dialog in whose context an out-of-dialog request (typically
//! REFER) should be interpreted. Requests carrying it must also carry
//! `Require: tdialog`.

use smol_str::SmolStr;

/// RFC 4538 option tag.
pub const TDIALOG: &str = "tdialog";

/// A `Target-Dialog` header value:
/// `<call-id>;local-tag=<tag>;remote-tag=<tag>`.
///
/// The tags are from the *sender's* point of view; the receiver swaps them
/// when looking its own dialog up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDialog {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl TargetDialog {
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

    /// Parses a header value. Both tag parameters are required.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let call_id = segments.next()?.trim();
        if call_id.is_empty() {
            return None;
        }
        let mut local_tag = None;
        let mut remote_tag = None;
        for segment in segments {
            let mut split = segment.splitn(2, '=');
            let name = split.next()?.trim();
            let param_value = split.next()?.trim();
            if name.eq_ignore_ascii_case("local-tag") {
                local_tag = Some(SmolStr::new(param_value));
            } else if name.eq_ignore_ascii_case("remote-tag") {
                remote_tag = Some(SmolStr::new(param_value));
            }
        }
        Some(Self {
            call_id: SmolStr::new(call_id),
            local_tag: local_tag?,
            remote_tag: remote_tag?,
        })
    }
}

impl std::fmt::Display for TargetDialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{};local-tag={};remote-tag={}",
            self.call_id, self.local_tag, self.remote_tag
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format() {
        let td = TargetDialog::parse("abc@host;local-tag=l1;remote-tag=r1").unwrap();
        assert_eq!(td.call_id.as_str(), "abc@host");
        assert_eq!(td.local_tag.as_str(), "l1");
        assert_eq!(td.remote_tag.as_str(), "r1");
        assert_eq!(td.to_string(), "abc@host;local-tag=l1;remote-tag=r1");
    }

    #[test]
    fn missing_tags_rejected() {
        assert!(TargetDialog::parse("abc@host;local-tag=l1").is_none());
        assert!(TargetDialog::parse("abc@host").is_none());
        assert!(TargetDialog::parse("").is_none());
    }
}
