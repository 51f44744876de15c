// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-dialog RFC 4028 session-timer sub-state.
//!
//! Header processing runs on every 2xx to INVITE or UPDATE, sent or
//! received. The refresher-role defaulting differs between the two
//! directions, which is why the request and response paths are separate.

use std::time::Duration;

use sip_msg::{Headers, MinSessionExpires, RefresherRole, SessionExpires};

use crate::timer::TimerToken;

/// Floor below which a remote-refresher expiry is never armed (seconds).
const EXPIRY_GUARD_SECS: u32 = 32;

/// RFC 4028 state carried by a dialog.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTimerState {
    /// Whether session timers are in use at all for this dialog.
    pub enabled: bool,
    /// Interval offered on outgoing INVITE/UPDATE (seconds).
    pub default_interval: u32,
    /// Negotiated interval; `None` disables refresh.
    pub interval: Option<u32>,
    /// Highest Min-SE seen so far (seconds).
    pub min_interval: u32,
    /// True when the local side is the refresher.
    pub local_refresher: bool,
    /// Armed refresh/expiry timer, if any.
    pub timer: Option<TimerToken>,
}

impl SessionTimerState {
    pub fn new(enabled: bool, default_interval: u32, min_interval: u32) -> Self {
        Self {
            enabled,
            default_interval,
            interval: None,
            min_interval,
            local_refresher: false,
            timer: None,
        }
    }

    /// Disabled placeholder used before a dialog is wired to a config.
    pub fn disabled() -> Self {
        Self::new(false, 0, 0)
    }

    /// Interval to advertise in an outgoing Session-Expires header.
    pub fn offer_interval(&self) -> u32 {
        self.interval.unwrap_or(self.default_interval)
    }

    /// Processes the headers of a 2xx-accepted request (we are the UAS).
    ///
    /// Refresher defaulting: `refresher=uas` makes us the refresher,
    /// `refresher=uac` makes the peer the refresher, omission leaves the
    /// refresh duty with us.
    pub fn process_request(&mut self, headers: &Headers) {
        if !self.enabled {
            return;
        }
        self.adopt_min_se(headers);
        let Some(se) = parse_session_expires(headers) else {
            self.interval = None;
            return;
        };
        self.interval = Some(se.interval);
        self.local_refresher = match se.refresher {
            Some(RefresherRole::Uas) => true,
            Some(RefresherRole::Uac) => false,
            None => true,
        };
    }

    /// Processes the headers of a received 2xx response (we are the UAC).
    /// The refresher parameter is required; we refresh iff it names the UAC.
    pub fn process_response(&mut self, headers: &Headers) {
        if !self.enabled {
            return;
        }
        self.adopt_min_se(headers);
        let Some(se) = parse_session_expires(headers) else {
            self.interval = None;
            return;
        };
        self.interval = Some(se.interval);
        self.local_refresher = se.refresher == Some(RefresherRole::Uac);
    }

    fn adopt_min_se(&mut self, headers: &Headers) {
        if let Some(min_se) = headers.get("Min-SE").and_then(|v| MinSessionExpires::parse(v)) {
            if min_se.interval > self.min_interval {
                self.min_interval = min_se.interval;
            }
        }
    }

    /// Delay until the armed action should fire: at `interval/2` for a local
    /// refresher, at `interval - max(interval/3, 32)` for a remote one.
    /// `None` when refresh is disabled.
    pub fn schedule_delay(&self) -> Option<Duration> {
        let interval = self.interval?;
        if !self.enabled {
            return None;
        }
        let secs = if self.local_refresher {
            interval / 2
        } else {
            interval
                .saturating_sub((interval / 3).max(EXPIRY_GUARD_SECS))
                .max(1)
        };
        Some(Duration::from_secs(u64::from(secs)))
    }
}

fn parse_session_expires(headers: &Headers) -> Option<SessionExpires> {
    headers
        .get("Session-Expires")
        .and_then(|v| SessionExpires::parse(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(session_expires: Option<&str>, min_se: Option<&str>) -> Headers {
        let mut headers = Headers::new();
        if let Some(se) = session_expires {
            headers.push("Session-Expires".into(), se.into());
        }
        if let Some(min) = min_se {
            headers.push("Min-SE".into(), min.into());
        }
        headers
    }

    fn state() -> SessionTimerState {
        SessionTimerState::new(true, 1800, 90)
    }

    #[test]
    fn absent_session_expires_disables_refresh() {
        let mut st = state();
        st.interval = Some(1800);
        st.process_response(&headers(None, None));
        assert_eq!(st.interval, None);
        assert_eq!(st.schedule_delay(), None);
    }

    #[test]
    fn min_se_only_moves_upward() {
        let mut st = state();
        st.process_request(&headers(Some("1800"), Some("120")));
        assert_eq!(st.min_interval, 120);
        st.process_request(&headers(Some("1800"), Some("100")));
        assert_eq!(st.min_interval, 120);
    }

    #[test]
    fn request_refresher_defaulting() {
        let mut st = state();
        st.process_request(&headers(Some("1800"), None));
        assert!(st.local_refresher, "omitted refresher leaves duty local");

        st.process_request(&headers(Some("1800;refresher=uac"), None));
        assert!(!st.local_refresher);

        st.process_request(&headers(Some("1800;refresher=uas"), None));
        assert!(st.local_refresher);
    }

    #[test]
    fn response_refresher_requires_uac_token() {
        let mut st = state();
        st.process_response(&headers(Some("1800;refresher=uac"), None));
        assert!(st.local_refresher);

        st.process_response(&headers(Some("1800;refresher=uas"), None));
        assert!(!st.local_refresher);
    }

    #[test]
    fn local_refresher_fires_at_half_interval() {
        let mut st = state();
        st.process_response(&headers(Some("1800;refresher=uac"), None));
        assert_eq!(st.schedule_delay(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn remote_refresher_expiry_margin() {
        let mut st = state();
        st.process_response(&headers(Some("1800;refresher=uas"), None));
        // 1800 - max(600, 32) = 1200
        assert_eq!(st.schedule_delay(), Some(Duration::from_secs(1200)));

        st.process_response(&headers(Some("90;refresher=uas"), None));
        // 90 - max(30, 32) = 58
        assert_eq!(st.schedule_delay(), Some(Duration::from_secs(58)));
    }

    #[test]
    fn disabled_state_never_schedules() {
        let mut st = SessionTimerState::disabled();
        st.process_request(&headers(Some("1800"), None));
        assert_eq!(st.interval, None);
        assert_eq!(st.schedule_delay(), None);
    }
}
