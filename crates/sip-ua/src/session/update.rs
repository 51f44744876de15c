// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! UPDATE sub-transactions (RFC 3311).
//!
//! Bodyless UPDATEs are the session-timer refresh vehicle and are accepted
//! automatically in both directions. An UPDATE carrying an offer needs the
//! application's consent.

use std::sync::Arc;

use tracing::{debug, info};

use sip_msg::{Method, Request, Response};

use crate::agent::PendingClient;
use crate::cause::Cause;
use crate::error::Error;
use crate::events::{Originator, SessionEvent};
use crate::request::{branch_of, set_body};
use crate::transaction::ServerTransaction;

use super::{session_expires_reply_header, RenegotiateOptions, Session, SessionState};

/// UPDATE machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Null,
    Sent,
    Received,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub(crate) struct UpdateTx {
    pub(crate) state: UpdateState,
}

impl Session {
    /// Sends an UPDATE. Allowed while Confirmed or WaitingForAck; one at a
    /// time. A `None` SDP sends a bodyless (refresh) UPDATE.
    pub async fn update(&self, options: RenegotiateOptions) -> Result<(), Error> {
        {
            let data = self.data();
            if !matches!(
                data.state,
                SessionState::Confirmed | SessionState::WaitingForAck
            ) {
                return Err(Error::invalid_state("update", data.state.as_str()));
            }
            if data
                .update
                .as_ref()
                .is_some_and(|u| u.state == UpdateState::Sent)
            {
                return Err(Error::RequestPending);
            }
        }

        let mut extra = vec![self.contact_header()];
        extra.extend(options.extra_headers);
        let request = self
            .with_dialog(|dialog| {
                let mut req = dialog.create_request(Method::Update, &extra);
                if let Some(sdp) = &options.sdp {
                    set_body(&mut req, "application/sdp", sdp);
                }
                req
            })
            .ok_or(Error::invalid_state("update", "no dialog"))?;

        self.data().update = Some(UpdateTx {
            state: UpdateState::Sent,
        });
        if let Some(branch) = branch_of(&request) {
            self.core()
                .pending
                .insert(branch, PendingClient::Update(self.clone()));
        }
        debug!(session = %self.id(), "sending UPDATE");
        self.core().sink.send_request(request);
        Ok(())
    }

    /// Bodyless refresh UPDATE driven by the session timer.
    pub(crate) fn send_refresh_update(&self) -> Result<(), Error> {
        {
            let data = self.data();
            if data
                .update
                .as_ref()
                .is_some_and(|u| u.state == UpdateState::Sent)
            {
                return Err(Error::RequestPending);
            }
        }
        let extra = vec![self.contact_header()];
        let request = self
            .with_dialog(|dialog| dialog.create_request(Method::Update, &extra))
            .ok_or(Error::invalid_state("update", "no dialog"))?;

        self.data().update = Some(UpdateTx {
            state: UpdateState::Sent,
        });
        if let Some(branch) = branch_of(&request) {
            self.core()
                .pending
                .insert(branch, PendingClient::Update(self.clone()));
        }
        debug!(session = %self.id(), "sending refresh UPDATE");
        self.core().sink.send_request(request);
        Ok(())
    }

    pub(crate) fn on_update_response(&self, resp: Response) {
        let code = resp.start.code;
        if code < 200 {
            return;
        }
        {
            let mut data = self.data();
            if let Some(update) = data.update.as_mut() {
                update.state = if code < 300 {
                    UpdateState::Succeeded
                } else {
                    UpdateState::Failed
                };
            }
        }
        if (200..300).contains(&code) {
            // RFC 4028: a 2xx to UPDATE re-runs session timer processing.
            self.with_dialog(|dialog| dialog.session_timer.process_response(&resp.headers));
            if let Some(dialog_id) = self.data().dialog.clone() {
                self.core().arm_session_timer(&dialog_id);
            }
        } else if code == 408 || code == 481 {
            self.finish(
                Some(resp.clone().into()),
                false,
                Originator::System,
                Cause::from_status(code),
            );
        } else {
            debug!(session = %self.id(), code, "UPDATE rejected");
        }
    }

    /// Gate-accepted incoming UPDATE.
    pub(crate) fn on_incoming_update(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        if !req.has_body() {
            // Session-timer refresh: auto-accept.
            let mut extra = vec![self.contact_header()];
            self.with_dialog(|dialog| {
                dialog.session_timer.process_request(&req.headers);
                if let Some(header) = session_expires_reply_header(dialog) {
                    extra.push(header);
                }
            });
            server_tx.reply(self.core().sink.as_ref(), 200, None, &extra, None);
            if let Some(dialog_id) = self.data().dialog.clone() {
                self.core().arm_session_timer(&dialog_id);
            }
            debug!(session = %self.id(), "refresh UPDATE auto-accepted");
            return;
        }

        let is_sdp = req
            .headers
            .get("Content-Type")
            .map(|ct| ct.as_str().to_ascii_lowercase().starts_with("application/sdp"))
            .unwrap_or(false);
        if !is_sdp {
            server_tx.reply(self.core().sink.as_ref(), 415, None, &[], None);
            return;
        }

        if self.subscriber_count() == 0 {
            // An offer-carrying UPDATE needs explicit acceptance.
            server_tx.reply(self.core().sink.as_ref(), 488, None, &[], None);
            return;
        }

        self.data().pending_update_tx = Some(server_tx);
        self.emit(SessionEvent::Update {
            originator: Originator::Remote,
            request: req,
        });
    }

    /// Accepts the pending offer-carrying UPDATE, answering via the media
    /// handler (or the supplied SDP).
    pub async fn accept_update(&self, options: RenegotiateOptions) -> Result<(), Error> {
        let server_tx = self
            .data()
            .pending_update_tx
            .clone()
            .ok_or(Error::invalid_state("accept_update", "no pending UPDATE"))?;
        let offer = String::from_utf8_lossy(&server_tx.request.body).into_owned();

        let sdp = match options.sdp {
            Some(sdp) => sdp,
            None => {
                let media = self
                    .data()
                    .media
                    .clone()
                    .ok_or(Error::invalid_state("accept_update", "no media handler"))?;
                match media.process_offer(&offer).await {
                    Ok(sdp) => sdp,
                    Err(err) => {
                        server_tx.reply(self.core().sink.as_ref(), 488, None, &[], None);
                        self.data().pending_update_tx = None;
                        return Err(Error::Media(err));
                    }
                }
            }
        };

        let mut extra = vec![self.contact_header()];
        self.with_dialog(|dialog| {
            dialog.session_timer.process_request(&server_tx.request.headers);
            if let Some(header) = session_expires_reply_header(dialog) {
                extra.push(header);
            }
        });
        extra.extend(options.extra_headers);

        server_tx.reply(
            self.core().sink.as_ref(),
            200,
            None,
            &extra,
            Some(("application/sdp", &sdp)),
        );
        self.data().pending_update_tx = None;
        if let Some(dialog_id) = self.data().dialog.clone() {
            self.core().arm_session_timer(&dialog_id);
        }
        info!(session = %self.id(), "UPDATE accepted");
        Ok(())
    }

    /// Rejects the pending offer-carrying UPDATE (default 488).
    pub fn reject_update(&self, status_code: Option<u16>) -> Result<(), Error> {
        let status = status_code.unwrap_or(488);
        if !(300..700).contains(&status) {
            return Err(Error::InvalidStatus(status));
        }
        let server_tx = self
            .data()
            .pending_update_tx
            .take()
            .ok_or(Error::invalid_state("reject_update", "no pending UPDATE"))?;
        server_tx.reply(self.core().sink.as_ref(), status, None, &[], None);
        info!(session = %self.id(), status, "UPDATE rejected");
        Ok(())
    }
}
