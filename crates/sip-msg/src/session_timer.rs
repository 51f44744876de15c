// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Session-Expires` and `Min-SE` header values (RFC 4028).

use smol_str::SmolStr;

/// Which side refreshes the session (RFC 4028 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefresherRole {
    Uac,
    Uas,
}

impl RefresherRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefresherRole::Uac => "uac",
            RefresherRole::Uas => "uas",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("uac") {
            Some(RefresherRole::Uac)
        } else if token.eq_ignore_ascii_case("uas") {
            Some(RefresherRole::Uas)
        } else {
            None
        }
    }
}

/// The `Session-Expires` header: interval in seconds plus an optional
/// refresher parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpires {
    pub interval: u32,
    pub refresher: Option<RefresherRole>,
}

impl SessionExpires {
    pub fn new(interval: u32, refresher: Option<RefresherRole>) -> Self {
        Self {
            interval,
            refresher,
        }
    }

    /// Parses a header value such as `1800;refresher=uac`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let interval = segments.next()?.trim().parse().ok()?;
        let mut refresher = None;
        for segment in segments {
            let mut split = segment.splitn(2, '=');
            let name = split.next()?.trim();
            if name.eq_ignore_ascii_case("refresher") {
                refresher = RefresherRole::from_token(split.next()?.trim());
            }
        }
        Some(Self {
            interval,
            refresher,
        })
    }
}

impl std::fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.interval)?;
        if let Some(refresher) = self.refresher {
            write!(f, ";refresher={}", refresher.as_str())?;
        }
        Ok(())
    }
}

/// The `Min-SE` header: the minimum session interval a UA will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinSessionExpires {
    pub interval: u32,
}

impl MinSessionExpires {
    pub fn parse(value: &str) -> Option<Self> {
        // Min-SE allows generic parameters; only the delta-seconds matter here.
        let interval = value.split(';').next()?.trim().parse().ok()?;
        Some(Self { interval })
    }
}

impl std::fmt::Display for MinSessionExpires {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.interval)
    }
}

/// Formats a `Session-Expires` value for emission.
pub fn format_session_expires(interval: u32, refresher: Option<RefresherRole>) -> SmolStr {
    SmolStr::new(SessionExpires::new(interval, refresher).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_plain_interval() {
        let se = SessionExpires::parse("1800").unwrap();
        assert_eq!(se.interval, 1800);
        assert_eq!(se.refresher, None);
    }

    #[test]
    fn parses_refresher_param() {
        let se = SessionExpires::parse("90;refresher=uas").unwrap();
        assert_eq!(se.interval, 90);
        assert_eq!(se.refresher, Some(RefresherRole::Uas));

        let se = SessionExpires::parse("120 ; refresher=UAC").unwrap();
        assert_eq!(se.refresher, Some(RefresherRole::Uac));
    }

    #[test]
    fn unknown_refresher_is_dropped() {
        let se = SessionExpires::parse("1800;refresher=proxy").unwrap();
        assert_eq!(se.refresher, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(SessionExpires::parse("soon").is_none());
        assert!(SessionExpires::parse("").is_none());
    }

    #[test]
    fn min_se_ignores_params() {
        assert_eq!(MinSessionExpires::parse("90;x=y").unwrap().interval, 90);
    }

    proptest! {
        #[test]
        fn display_parse_round_trip(interval in 0u32..=86_400, refresher in 0u8..3) {
            let refresher = match refresher {
                0 => None,
                1 => Some(RefresherRole::Uac),
                _ => Some(RefresherRole::Uas),
            };
            let se = SessionExpires::new(interval, refresher);
            let parsed = SessionExpires::parse(&se.to_string()).unwrap();
            prop_assert_eq!(parsed, se);
        }
    }
}
