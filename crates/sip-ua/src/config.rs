// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User-agent configuration.

use std::time::Duration;

use sip_msg::SipUri;

/// RFC 4028 default session interval (seconds).
pub const DEFAULT_SESSION_EXPIRES: u32 = 1800;
/// RFC 4028 default minimum session interval (seconds).
pub const DEFAULT_MIN_SESSION_EXPIRES: u32 = 90;
/// RFC 3515 default REFER subscription lifetime (seconds).
pub const DEFAULT_REFER_EXPIRES: u32 = 180;

/// Static configuration for a [`UserAgent`](crate::agent::UserAgent).
#[derive(Debug, Clone)]
pub struct UaConfig {
    /// Our identity, used in From headers.
    pub uri: SipUri,
    /// Our reachable contact, used in Contact headers.
    pub contact: SipUri,
    /// Optional display name for From headers.
    pub display_name: Option<String>,
    /// How long an unanswered incoming call rings before we reply 480.
    pub no_answer_timeout: Duration,
    /// Whether RFC 4028 session timers are offered and honored.
    pub session_timers: bool,
    /// Session-Expires interval offered on INVITE/UPDATE (seconds).
    pub session_expires: u32,
    /// Min-SE floor (seconds).
    pub min_session_expires: u32,
    /// Default lifetime of incoming REFER subscriptions (seconds).
    pub refer_expires: u32,
}

impl UaConfig {
    pub fn new(uri: SipUri, contact: SipUri) -> Self {
        Self {
            uri,
            contact,
            display_name: None,
            no_answer_timeout: Duration::from_secs(60),
            session_timers: true,
            session_expires: DEFAULT_SESSION_EXPIRES,
            min_session_expires: DEFAULT_MIN_SESSION_EXPIRES,
            refer_expires: DEFAULT_REFER_EXPIRES,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_no_answer_timeout(mut self, timeout: Duration) -> Self {
        self.no_answer_timeout = timeout;
        self
    }

    pub fn without_session_timers(mut self) -> Self {
        self.session_timers = false;
        self
    }
}
