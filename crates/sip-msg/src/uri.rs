// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal sip:/sips: URI type.
//!
//! The core never normalizes or resolves URIs; it only needs to carry them
//! between headers, compare them, and read the scheme/host parts. The full
//! grammar belongs to the host's parser.

use smol_str::SmolStr;

/// A sip: or sips: URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    /// URI parameters in declaration order, e.g. `lr`, `transport=tcp`.
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl SipUri {
    /// Parses a sip:/sips: URI string. Returns `None` for other schemes or
    /// malformed input.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (sips, rest) = if let Some(rest) = strip_scheme(input, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_scheme(input, "sip:") {
            (false, rest)
        } else {
            return None;
        };

        // Headers component is not supported; reject rather than misparse.
        let rest = rest.split('?').next()?;

        let (userinfo, hostpart) = match rest.find('@') {
            Some(idx) => (Some(&rest[..idx]), &rest[idx + 1..]),
            None => (None, rest),
        };

        let user = match userinfo {
            Some(info) => {
                // Drop any password component.
                let user = info.split(':').next()?;
                if user.is_empty() {
                    return None;
                }
                Some(SmolStr::new(user))
            }
            None => None,
        };

        let mut segments = hostpart.split(';');
        let authority = segments.next()?;
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                (h, Some(p.parse::<u16>().ok()?))
            }
            _ => (authority, None),
        };
        if host.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        for segment in segments {
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, value)) => {
                    params.push((SmolStr::new(name.trim()), Some(SmolStr::new(value.trim()))))
                }
                None => params.push((SmolStr::new(segment.trim()), None)),
            }
        }

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    /// Returns the scheme token of this URI.
    pub fn scheme(&self) -> &'static str {
        if self.sips {
            "sips"
        } else {
            "sip"
        }
    }

    /// Returns the value of a URI parameter, if set.
    pub fn param(&self, name: &str) -> Option<&SmolStr> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_ref())
    }

    /// Returns a copy of this URI with every parameter removed, suitable for
    /// use as an AOR-style identity.
    pub fn without_params(&self) -> Self {
        Self {
            params: Vec::new(),
            ..self.clone()
        }
    }
}

fn strip_scheme<'a>(input: &'a str, scheme: &str) -> Option<&'a str> {
    if input.len() >= scheme.len() && input[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&input[scheme.len()..])
    } else {
        None
    }
}

impl std::fmt::Display for SipUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_uri() {
        let uri = SipUri::parse("sip:alice@example.com").unwrap();
        assert!(!uri.sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.port, None);
    }

    #[test]
    fn parses_port_and_params() {
        let uri = SipUri::parse("sips:bob@host.example.com:5061;transport=tls;lr").unwrap();
        assert!(uri.sips);
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.param("transport").map(|v| v.as_str()), Some("tls"));
        assert!(uri.params.iter().any(|(n, v)| n == "lr" && v.is_none()));
    }

    #[test]
    fn parses_hostonly_uri() {
        let uri = SipUri::parse("sip:proxy.example.com").unwrap();
        assert!(uri.user.is_none());
        assert_eq!(uri.host.as_str(), "proxy.example.com");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(SipUri::parse("tel:+15551234567").is_none());
        assert!(SipUri::parse("mailto:x@y").is_none());
        assert!(SipUri::parse("").is_none());
    }

    #[test]
    fn display_round_trip() {
        for text in [
            "sip:alice@example.com",
            "sips:bob@host.example.com:5061;transport=tls;lr",
            "sip:proxy.example.com:5060",
        ] {
            let uri = SipUri::parse(text).unwrap();
            assert_eq!(uri.to_string(), text);
        }
    }

    #[test]
    fn password_is_dropped() {
        let uri = SipUri::parse("sip:alice:secret@example.com").unwrap();
        assert_eq!(uri.user.as_deref(), Some("alice"));
    }

    #[test]
    fn without_params_strips_everything() {
        let uri = SipUri::parse("sip:alice@example.com;transport=tcp").unwrap();
        assert!(uri.without_params().params.is_empty());
    }
}
