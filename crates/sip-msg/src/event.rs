// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `Event` and `Subscription-State` header values (RFC 6665).

use smol_str::SmolStr;

/// The `Event` header: package name plus the optional `id` parameter used to
/// tell concurrent in-dialog subscriptions apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub package: SmolStr,
    pub id: Option<SmolStr>,
}

impl EventHeader {
    pub fn new(package: impl Into<SmolStr>, id: Option<SmolStr>) -> Self {
        Self {
            package: package.into(),
            id,
        }
    }

    /// Parses a header value such as `refer;id=93809824`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let package = segments.next()?.trim();
        if package.is_empty() {
            return None;
        }
        let mut id = None;
        for segment in segments {
            let mut split = segment.splitn(2, '=');
            let name = split.next()?.trim();
            if name.eq_ignore_ascii_case("id") {
                id = Some(SmolStr::new(split.next()?.trim()));
            }
        }
        Some(Self {
            package: SmolStr::new(package),
            id,
        })
    }
}

impl std::fmt::Display for EventHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.package)?;
        if let Some(id) = &self.id {
            write!(f, ";id={}", id)?;
        }
        Ok(())
    }
}

/// Subscription lifecycle states carried by `Subscription-State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Terminated,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Pending => "pending",
            SubscriptionState::Active => "active",
            SubscriptionState::Terminated => "terminated",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("pending") {
            Some(SubscriptionState::Pending)
        } else if token.eq_ignore_ascii_case("active") {
            Some(SubscriptionState::Active)
        } else if token.eq_ignore_ascii_case("terminated") {
            Some(SubscriptionState::Terminated)
        } else {
            None
        }
    }
}

/// The `Subscription-State` header with its `expires` and `reason` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateHeader {
    pub state: SubscriptionState,
    pub expires: Option<u32>,
    pub reason: Option<SmolStr>,
}

impl SubscriptionStateHeader {
    /// Parses a header value such as `active;expires=180` or
    /// `terminated;reason=noresource`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let state = SubscriptionState::from_token(segments.next()?.trim())?;
        let mut expires = None;
        let mut reason = None;
        for segment in segments {
            let mut split = segment.splitn(2, '=');
            let name = split.next()?.trim();
            let param_value = split.next().map(str::trim);
            if name.eq_ignore_ascii_case("expires") {
                expires = param_value.and_then(|v| v.parse().ok());
            } else if name.eq_ignore_ascii_case("reason") {
                reason = param_value.map(SmolStr::new);
            }
        }
        Some(Self {
            state,
            expires,
            reason,
        })
    }

    /// Formats an `active;expires=N` value.
    pub fn active(expires: u32) -> SmolStr {
        SmolStr::new(format!("active;expires={}", expires))
    }

    /// Formats a `terminated;reason=X` value.
    pub fn terminated(reason: &str) -> SmolStr {
        SmolStr::new(format!("terminated;reason={}", reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_parse_and_format() {
        let event = EventHeader::parse("refer").unwrap();
        assert_eq!(event.package.as_str(), "refer");
        assert_eq!(event.id, None);

        let event = EventHeader::parse("refer;id=4711").unwrap();
        assert_eq!(event.id.as_deref(), Some("4711"));
        assert_eq!(event.to_string(), "refer;id=4711");
    }

    #[test]
    fn event_rejects_empty() {
        assert!(EventHeader::parse("").is_none());
        assert!(EventHeader::parse(";id=1").is_none());
    }

    #[test]
    fn subscription_state_active() {
        let state = SubscriptionStateHeader::parse("active;expires=180").unwrap();
        assert_eq!(state.state, SubscriptionState::Active);
        assert_eq!(state.expires, Some(180));
        assert_eq!(state.reason, None);
    }

    #[test]
    fn subscription_state_terminated() {
        let state = SubscriptionStateHeader::parse("terminated;reason=noresource").unwrap();
        assert_eq!(state.state, SubscriptionState::Terminated);
        assert_eq!(state.reason.as_deref(), Some("noresource"));
    }

    #[test]
    fn subscription_state_unknown_token() {
        assert!(SubscriptionStateHeader::parse("suspended").is_none());
    }

    #[test]
    fn formatting_helpers() {
        assert_eq!(SubscriptionStateHeader::active(42).as_str(), "active;expires=42");
        assert_eq!(
            SubscriptionStateHeader::terminated("rejected").as_str(),
            "terminated;reason=rejected"
        );
    }
}
