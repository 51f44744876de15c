// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Value-level helpers for name-addr headers (From, To, Contact, Refer-To).

use smol_str::SmolStr;

use crate::uri::SipUri;

/// Extracts the `tag` parameter from a From/To header value.
pub fn extract_tag(value: &str) -> Option<SmolStr> {
    // Parameters follow the addr-spec; skip anything inside angle brackets so
    // URI parameters are not mistaken for header parameters.
    let after_addr = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    after_addr.split(';').find_map(|segment| {
        let trimmed = segment.trim();
        if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case("tag=") {
            Some(SmolStr::new(trimmed[4..].trim()))
        } else {
            None
        }
    })
}

/// Extracts the URI out of a name-addr or addr-spec header value.
///
/// Handles both `"Bob" <sip:bob@host>;tag=x` and bare `sip:bob@host;tag=x`
/// forms. In the bare form, parameters belong to the header, not the URI.
pub fn name_addr_uri(value: &str) -> Option<SipUri> {
    let trimmed = value.trim();
    if let Some(start) = trimmed.find('<') {
        let end = trimmed[start + 1..].find('>')?;
        SipUri::parse(&trimmed[start + 1..start + 1 + end])
    } else {
        SipUri::parse(trimmed.split(';').next()?)
    }
}

/// Extracts the display name of a name-addr value, unquoting when needed.
pub fn name_addr_display(value: &str) -> Option<SmolStr> {
    let trimmed = value.trim();
    let bracket = trimmed.find('<')?;
    let display = trimmed[..bracket].trim();
    if display.is_empty() {
        return None;
    }
    let display = display.trim_matches('"').trim();
    if display.is_empty() {
        None
    } else {
        Some(SmolStr::new(display))
    }
}

/// Formats a name-addr value with an optional display name and tag parameter.
pub fn format_name_addr(display: Option<&str>, uri: &SipUri, tag: Option<&str>) -> SmolStr {
    let mut out = String::new();
    if let Some(display) = display {
        out.push('"');
        out.push_str(display);
        out.push_str("\" ");
    }
    out.push('<');
    out.push_str(&uri.to_string());
    out.push('>');
    if let Some(tag) = tag {
        out.push_str(";tag=");
        out.push_str(tag);
    }
    SmolStr::new(out)
}

/// Splits a comma-separated header value into elements, respecting quoted
/// strings and angle brackets.
pub fn split_header_values(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut angle_depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' => angle_depth = angle_depth.saturating_add(1),
            '>' => angle_depth = angle_depth.saturating_sub(1),
            ',' if !in_quotes && angle_depth == 0 => {
                let part = raw[start..idx].trim();
                if !part.is_empty() {
                    parts.push(part);
                }
                start = idx + 1;
            }
            _ => {}
        }
    }

    let part = raw[start..].trim();
    if !part.is_empty() {
        parts.push(part);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_extraction_variants() {
        assert_eq!(
            extract_tag("<sip:user@host>;tag=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_tag("\"Bob\" <sip:bob@host>;other=1;tag=xyz").as_deref(),
            Some("xyz")
        );
        assert_eq!(extract_tag("<sip:user@host>"), None);
    }

    #[test]
    fn uri_params_are_not_tags() {
        // tag inside the brackets is a URI parameter, not the dialog tag
        assert_eq!(extract_tag("<sip:user@host;tag=inner>"), None);
    }

    #[test]
    fn uri_extraction() {
        let uri = name_addr_uri("\"Bob\" <sip:bob@example.com:5060>;tag=1").unwrap();
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.port, Some(5060));

        let bare = name_addr_uri("sip:carol@example.com;tag=2").unwrap();
        assert_eq!(bare.user.as_deref(), Some("carol"));
        assert!(bare.params.is_empty());
    }

    #[test]
    fn display_name_extraction() {
        assert_eq!(
            name_addr_display("\"Bob Smith\" <sip:bob@h>").as_deref(),
            Some("Bob Smith")
        );
        assert_eq!(
            name_addr_display("Anonymous <sip:anonymous@anonymous.invalid>").as_deref(),
            Some("Anonymous")
        );
        assert_eq!(name_addr_display("<sip:bob@h>"), None);
        assert_eq!(name_addr_display("sip:bob@h"), None);
    }

    #[test]
    fn format_round_trips_through_extractors() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        let value = format_name_addr(Some("Alice"), &uri, Some("t-99"));
        assert_eq!(extract_tag(&value).as_deref(), Some("t-99"));
        assert_eq!(name_addr_uri(&value).unwrap(), uri);
        assert_eq!(name_addr_display(&value).as_deref(), Some("Alice"));
    }

    #[test]
    fn split_respects_quotes_and_brackets() {
        let parts = split_header_values("\"a,b\" <sip:p1>;lr, <sip:p2>");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "\"a,b\" <sip:p1>;lr");
        assert_eq!(parts[1], "<sip:p2>");
    }
}
