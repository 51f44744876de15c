// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! DTMF over in-dialog INFO (`application/dtmf-relay`).

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use sip_msg::Method;

use crate::agent::PendingClient;
use crate::error::Error;
use crate::events::{Originator, SessionEvent};
use crate::request::{branch_of, set_body};

use super::{Session, SessionState};

/// Tone duration bounds and defaults (milliseconds).
pub(crate) const MIN_DURATION: u32 = 70;
pub(crate) const MAX_DURATION: u32 = 6000;
pub(crate) const DEFAULT_DURATION: u32 = 100;
pub(crate) const MIN_INTER_TONE_GAP: u32 = 50;
pub(crate) const DEFAULT_INTER_TONE_GAP: u32 = 500;
/// A `,` in the tone string pauses this long.
pub(crate) const COMMA_PAUSE: u32 = 2000;

/// Options for [`Session::send_dtmf`].
#[derive(Debug, Clone, Default)]
pub struct DtmfOptions {
    /// Tone duration in ms, clamped to `[70, 6000]`, default 100.
    pub duration: Option<u32>,
    /// Gap between tones in ms, floored at 50, default 500.
    pub inter_tone_gap: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct DtmfQueue {
    queue: VecDeque<char>,
    sending: bool,
    duration: u32,
    gap: u32,
}

impl DtmfQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            sending: false,
            duration: DEFAULT_DURATION,
            gap: DEFAULT_INTER_TONE_GAP,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        self.sending = false;
    }
}

/// Parses a `application/dtmf-relay` body: `Signal=5\r\nDuration=160`.
pub(crate) fn parse_dtmf_relay(body: &str) -> Option<(char, u32)> {
    let mut tone = None;
    let mut duration = DEFAULT_DURATION;
    for line in body.lines() {
        let mut split = line.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("Signal") {
            let c = value.chars().next()?.to_ascii_uppercase();
            if is_valid_tone(c) {
                tone = Some(c);
            }
        } else if name.eq_ignore_ascii_case("Duration") {
            if let Ok(parsed) = value.parse() {
                duration = parsed;
            }
        }
    }
    tone.map(|t| (t, duration))
}

fn is_valid_tone(c: char) -> bool {
    matches!(c, '0'..='9' | 'A'..='D' | '#' | '*')
}

impl Session {
    /// Queues DTMF tones for sending. Tones append to an in-flight queue;
    /// a failed tone abandons whatever is left.
    pub fn send_dtmf(&self, tones: &str, options: DtmfOptions) -> Result<(), Error> {
        if tones.is_empty() {
            return Err(Error::InvalidArgument("empty tone string".into()));
        }
        let normalized: Vec<char> = tones.chars().map(|c| c.to_ascii_uppercase()).collect();
        for c in &normalized {
            if !is_valid_tone(*c) && *c != ',' {
                return Err(Error::InvalidArgument(format!("invalid DTMF tone '{}'", c)));
            }
        }

        let kick = {
            let mut data = self.data();
            if !matches!(
                data.state,
                SessionState::Confirmed | SessionState::WaitingForAck
            ) {
                return Err(Error::invalid_state("send_dtmf", data.state.as_str()));
            }
            data.dtmf.duration = options
                .duration
                .unwrap_or(DEFAULT_DURATION)
                .clamp(MIN_DURATION, MAX_DURATION);
            data.dtmf.gap = options
                .inter_tone_gap
                .unwrap_or(DEFAULT_INTER_TONE_GAP)
                .max(MIN_INTER_TONE_GAP);
            data.dtmf.queue.extend(normalized);
            let kick = !data.dtmf.sending;
            data.dtmf.sending = true;
            kick
        };
        if kick {
            self.dtmf_send_next();
        }
        Ok(())
    }

    fn dtmf_send_next(&self) {
        let step = {
            let mut data = self.data();
            if !matches!(
                data.state,
                SessionState::Confirmed | SessionState::WaitingForAck
            ) {
                data.dtmf.clear();
                return;
            }
            match data.dtmf.queue.pop_front() {
                None => {
                    data.dtmf.sending = false;
                    return;
                }
                Some(',') => None,
                Some(tone) => Some((tone, data.dtmf.duration, data.dtmf.gap)),
            }
        };

        match step {
            None => {
                // Comma: wait, send nothing.
                let session = self.clone();
                let token = self.core().timers.schedule(
                    Duration::from_millis(u64::from(COMMA_PAUSE)),
                    move || session.dtmf_send_next(),
                );
                self.data().timers.dtmf = Some(token);
            }
            Some((tone, duration, gap)) => {
                let info = self.with_dialog(|dialog| {
                    let mut info = dialog.create_request(Method::Info, &[]);
                    let body = format!("Signal={}\r\nDuration={}\r\n", tone, duration);
                    set_body(&mut info, "application/dtmf-relay", &body);
                    info
                });
                let Some(info) = info else {
                    self.data().dtmf.clear();
                    return;
                };
                if let Some(branch) = branch_of(&info) {
                    self.core()
                        .pending
                        .insert(branch, PendingClient::Info(self.clone()));
                }
                self.core().sink.send_request(info);
                self.emit(SessionEvent::NewDtmf {
                    originator: Originator::Local,
                    tone,
                    duration,
                });

                let session = self.clone();
                let token = self.core().timers.schedule(
                    Duration::from_millis(u64::from(duration + gap)),
                    move || session.dtmf_send_next(),
                );
                self.data().timers.dtmf = Some(token);
            }
        }
    }

    /// INFO response handling: any failure abandons the queue.
    pub(crate) fn on_info_response(&self, code: u16) {
        if code >= 300 {
            debug!(session = %self.id(), code, "DTMF INFO failed, dropping queue");
            self.abandon_dtmf();
        }
    }

    pub(crate) fn abandon_dtmf(&self) {
        let mut data = self.data();
        let core = self.core().clone();
        core.timers.clear(&mut data.timers.dtmf);
        data.dtmf.clear();
    }
}
