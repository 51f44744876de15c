// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Re-INVITE sub-transactions.
//!
//! An ephemeral machine reusing the full INVITE state space, attached to a
//! confirmed session and its dialog. At most one re-INVITE is active per
//! session in either direction; conflicting incoming ones get 491, and a
//! second outgoing attempt is refused locally.

use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;
use tracing::{debug, info, warn};

use sip_msg::{Header, Method, ReasonHeader, Request, Response};

use crate::agent::PendingClient;
use crate::cause::Cause;
use crate::error::Error;
use crate::events::{Originator, SessionEvent};
use crate::request::{branch_of, set_body};
use crate::timer::{TimerService, TimerToken, T1, T2, TIMER_64T1};
use crate::transaction::ServerTransaction;

use super::{session_expires_reply_header, Direction, RenegotiateOptions, Session, SessionState};

/// Re-INVITE machine states (the INVITE state space).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinviteState {
    Null,
    InviteSent,
    Received1xx,
    InviteReceived,
    WaitingForAnswer,
    WaitingForAck,
    Confirmed,
    Canceled,
    Terminated,
}

#[derive(Debug)]
pub(crate) struct ReinviteTx {
    pub(crate) direction: Direction,
    pub(crate) state: ReinviteState,
    pub(crate) request: Request,
    pub(crate) server_tx: Option<Arc<ServerTransaction>>,
    pub(crate) last_2xx: Option<Response>,
    pub(crate) retrans_interval: Duration,
    pub(crate) retrans: Option<TimerToken>,
    pub(crate) ack_wait: Option<TimerToken>,
    pub(crate) provisional: Option<TimerToken>,
    /// Bodyless re-INVITE: our 200 carried the offer, the ACK answers.
    pub(crate) answer_in_ack: bool,
}

impl ReinviteTx {
    fn outgoing(request: Request) -> Self {
        Self {
            direction: Direction::Outgoing,
            state: ReinviteState::InviteSent,
            request,
            server_tx: None,
            last_2xx: None,
            retrans_interval: T1,
            retrans: None,
            ack_wait: None,
            provisional: None,
            answer_in_ack: false,
        }
    }

    fn incoming(request: Request, server_tx: Arc<ServerTransaction>) -> Self {
        Self {
            direction: Direction::Incoming,
            state: ReinviteState::InviteReceived,
            request,
            server_tx: Some(server_tx),
            last_2xx: None,
            retrans_interval: T1,
            retrans: None,
            ack_wait: None,
            provisional: None,
            answer_in_ack: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ReinviteState::Confirmed | ReinviteState::Canceled | ReinviteState::Terminated
        )
    }

    pub(crate) fn server_branch(&self) -> Option<SmolStr> {
        self.server_tx.as_ref().map(|tx| tx.branch.clone())
    }

    pub(crate) fn cancel_timers(&mut self, timers: &TimerService) {
        timers.clear(&mut self.retrans);
        timers.clear(&mut self.ack_wait);
        timers.clear(&mut self.provisional);
    }
}

impl Session {
    /// Sends a re-INVITE on the confirmed dialog. Permitted only from
    /// Confirmed, and only once any prior re-INVITE has finished.
    pub async fn reinvite(&self, options: RenegotiateOptions) -> Result<(), Error> {
        {
            let data = self.data();
            if data.state != SessionState::Confirmed {
                return Err(Error::invalid_state("reinvite", data.state.as_str()));
            }
            if data.reinvite.as_ref().is_some_and(|r| !r.is_finished()) {
                return Err(Error::RequestPending);
            }
        }

        let offer = match options.sdp {
            Some(sdp) => sdp,
            None => {
                let media = self
                    .data()
                    .media
                    .clone()
                    .ok_or(Error::invalid_state("reinvite", "no media handler"))?;
                media.create_offer().await.map_err(Error::Media)?
            }
        };

        let mut extra = vec![self.contact_header()];
        extra.extend(options.extra_headers);
        let request = {
            let request = self.with_dialog(|dialog| {
                let mut req = dialog.create_request(Method::Invite, &extra);
                set_body(&mut req, "application/sdp", &offer);
                req
            });
            request.ok_or(Error::invalid_state("reinvite", "no dialog"))?
        };

        {
            let mut data = self.data();
            if data.state != SessionState::Confirmed {
                return Err(Error::invalid_state("reinvite", data.state.as_str()));
            }
            if data.reinvite.as_ref().is_some_and(|r| !r.is_finished()) {
                return Err(Error::RequestPending);
            }
            data.reinvite = Some(ReinviteTx::outgoing(request.clone()));
        }

        if let Some(branch) = branch_of(&request) {
            self.core()
                .pending
                .insert(branch, PendingClient::Reinvite(self.clone()));
        }
        info!(session = %self.id(), "sending re-INVITE");
        self.core().sink.send_request(request);
        Ok(())
    }

    pub(crate) async fn on_reinvite_response(&self, resp: Response) {
        let code = resp.start.code;
        let step = {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return;
            };
            if reinvite.direction != Direction::Outgoing || reinvite.is_finished() {
                return;
            }
            if code < 200 {
                reinvite.state = ReinviteState::Received1xx;
                return;
            }
            if (200..300).contains(&code) {
                reinvite.state = ReinviteState::Confirmed;
                Some(reinvite.request.cseq_number())
            } else {
                reinvite.state = ReinviteState::Terminated;
                None
            }
        };

        match step {
            Some(invite_cseq) => {
                // ACK for the re-INVITE's 2xx reuses the re-INVITE CSeq even
                // if other in-dialog requests advanced the counter meanwhile.
                let ack = self.with_dialog(|dialog| {
                    let mut ack = dialog.create_request(Method::Ack, &[]);
                    if let Some(cseq) = invite_cseq {
                        ack.headers
                            .set(SmolStr::new("CSeq"), SmolStr::new(format!("{} ACK", cseq)));
                    }
                    dialog.session_timer.process_response(&resp.headers);
                    ack
                });
                if let Some(ack) = ack {
                    self.core().sink.send_request(ack);
                }
                if resp.has_body() {
                    let media = self.data().media.clone();
                    if let Some(media) = media {
                        let answer = String::from_utf8_lossy(&resp.body).into_owned();
                        if let Err(err) = media.process_answer(&answer).await {
                            warn!(session = %self.id(), %err, "re-INVITE answer rejected");
                        }
                    }
                }
                if let Some(dialog_id) = self.data().dialog.clone() {
                    self.core().arm_session_timer(&dialog_id);
                }
                debug!(session = %self.id(), "re-INVITE confirmed");
            }
            None => {
                debug!(session = %self.id(), code, "re-INVITE rejected");
                // 408/481 mean the dialog itself is dead (RFC 3261 §12.2.1.2).
                if code == 408 || code == 481 {
                    self.finish(
                        Some(resp.clone().into()),
                        false,
                        Originator::System,
                        Cause::from_status(code),
                    );
                }
            }
        }
    }

    /// Gate-accepted incoming INVITE on an established session.
    pub(crate) fn on_incoming_reinvite(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        {
            let mut data = self.data();
            let busy = data.state != SessionState::Confirmed
                || data.reinvite.as_ref().is_some_and(|r| !r.is_finished());
            if busy {
                drop(data);
                server_tx.reply(self.core().sink.as_ref(), 491, None, &[], None);
                return;
            }
            if req.has_body() {
                let is_sdp = req
                    .headers
                    .get("Content-Type")
                    .map(|ct| ct.as_str().to_ascii_lowercase().starts_with("application/sdp"))
                    .unwrap_or(false);
                if !is_sdp {
                    drop(data);
                    server_tx.reply(self.core().sink.as_ref(), 415, None, &[], None);
                    return;
                }
            }
            data.reinvite = Some(ReinviteTx::incoming(req.clone(), server_tx.clone()));
        }
        self.core()
            .invite_branches
            .insert(server_tx.branch.clone(), self.id());

        if self.subscriber_count() == 0 {
            // Nobody will ever answer the event.
            self.reject_reinvite(Some(488)).ok();
            return;
        }

        // Provisional 180 goes out at +1s unless the application already
        // accepted or rejected.
        let session = self.clone();
        let token = self
            .core()
            .timers
            .schedule(Duration::from_secs(1), move || {
                session.reinvite_provisional();
            });
        self.data()
            .reinvite
            .as_mut()
            .expect("just inserted")
            .provisional = Some(token);

        self.emit(SessionEvent::Reinvite {
            originator: Originator::Remote,
            request: req,
        });
    }

    fn reinvite_provisional(&self) {
        let tx = {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return;
            };
            if reinvite.direction != Direction::Incoming
                || reinvite.state != ReinviteState::InviteReceived
            {
                return;
            }
            reinvite.state = ReinviteState::WaitingForAnswer;
            reinvite.server_tx.clone()
        };
        if let Some(tx) = tx {
            tx.reply(self.core().sink.as_ref(), 180, None, &[], None);
        }
    }

    /// Accepts the pending incoming re-INVITE, answering its offer (or, for
    /// a bodyless one, offering and expecting the answer in the ACK).
    pub async fn accept_reinvite(&self, options: RenegotiateOptions) -> Result<(), Error> {
        let (server_tx, offer, invite_req) = {
            let data = self.data();
            let Some(reinvite) = data.reinvite.as_ref() else {
                return Err(Error::invalid_state("accept_reinvite", "no re-INVITE"));
            };
            if reinvite.direction != Direction::Incoming
                || !matches!(
                    reinvite.state,
                    ReinviteState::InviteReceived | ReinviteState::WaitingForAnswer
                )
            {
                return Err(Error::invalid_state("accept_reinvite", "not pending"));
            }
            let tx = reinvite.server_tx.clone().expect("incoming has a tx");
            let offer = reinvite
                .request
                .has_body()
                .then(|| String::from_utf8_lossy(&reinvite.request.body).into_owned());
            (tx, offer, reinvite.request.clone())
        };

        let bodyless = offer.is_none();
        let sdp = match options.sdp {
            Some(sdp) => sdp,
            None => {
                let media = self
                    .data()
                    .media
                    .clone()
                    .ok_or(Error::invalid_state("accept_reinvite", "no media handler"))?;
                let result = match &offer {
                    Some(offer) => media.process_offer(offer).await,
                    None => media.create_offer().await,
                };
                match result {
                    Ok(sdp) => sdp,
                    Err(err) => {
                        server_tx.reply(self.core().sink.as_ref(), 488, None, &[], None);
                        if let Some(reinvite) = self.data().reinvite.as_mut() {
                            reinvite.state = ReinviteState::Terminated;
                        }
                        return Err(Error::Media(err));
                    }
                }
            }
        };

        let mut extra = vec![self.contact_header()];
        extra.extend(options.extra_headers);
        self.with_dialog(|dialog| {
            dialog.session_timer.process_request(&invite_req.headers);
            if let Some(header) = session_expires_reply_header(dialog) {
                extra.push(header);
            }
        });

        let resp = server_tx.reply(
            self.core().sink.as_ref(),
            200,
            None,
            &extra,
            Some(("application/sdp", &sdp)),
        );

        {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return Err(Error::invalid_state("accept_reinvite", "gone"));
            };
            let core = self.core();
            core.timers.clear(&mut reinvite.provisional);
            reinvite.answer_in_ack = bodyless;
            reinvite.last_2xx = Some(resp);
            reinvite.retrans_interval = T1;
            reinvite.state = ReinviteState::WaitingForAck;
        }
        self.arm_reinvite_retransmit(T1);
        self.arm_reinvite_ack_wait();
        if let Some(dialog_id) = self.data().dialog.clone() {
            self.core().arm_session_timer(&dialog_id);
        }
        info!(session = %self.id(), "re-INVITE accepted");
        Ok(())
    }

    /// Rejects the pending incoming re-INVITE; the session itself stays
    /// confirmed. Status defaults to 488 and must be final.
    pub fn reject_reinvite(&self, status_code: Option<u16>) -> Result<(), Error> {
        let status = status_code.unwrap_or(488);
        if !(300..700).contains(&status) {
            return Err(Error::InvalidStatus(status));
        }
        let tx = {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return Err(Error::invalid_state("reject_reinvite", "no re-INVITE"));
            };
            if reinvite.direction != Direction::Incoming || reinvite.is_finished() {
                return Err(Error::invalid_state("reject_reinvite", "not pending"));
            }
            let core = self.core();
            core.timers.clear(&mut reinvite.provisional);
            reinvite.state = ReinviteState::Terminated;
            reinvite.server_tx.clone()
        };
        if let Some(tx) = tx {
            tx.reply(self.core().sink.as_ref(), status, None, &[], None);
        }
        info!(session = %self.id(), status, "re-INVITE rejected");
        Ok(())
    }

    pub(crate) async fn on_reinvite_ack(&self, req: Request) {
        let (expect_answer, media) = {
            let mut data = self.data();
            let expect_answer;
            {
                let Some(reinvite) = data.reinvite.as_mut() else {
                    return;
                };
                if reinvite.direction != Direction::Incoming
                    || reinvite.state != ReinviteState::WaitingForAck
                {
                    return;
                }
                let core = self.core();
                core.timers.clear(&mut reinvite.retrans);
                core.timers.clear(&mut reinvite.ack_wait);
                reinvite.state = ReinviteState::Confirmed;
                expect_answer = reinvite.answer_in_ack;
            }
            (expect_answer, data.media.clone())
        };
        if expect_answer && req.has_body() {
            if let Some(media) = media {
                let answer = String::from_utf8_lossy(&req.body).into_owned();
                if let Err(err) = media.process_answer(&answer).await {
                    warn!(session = %self.id(), %err, "re-INVITE ACK answer rejected");
                    self.send_bye_for_bad_ack();
                    return;
                }
            }
        }
        debug!(session = %self.id(), "re-INVITE ACK received");
    }

    fn send_bye_for_bad_ack(&self) {
        self.send_bye_public(ReasonHeader::sip(488, "Not Acceptable Here"));
        self.finish(
            None,
            false,
            Originator::System,
            Cause::BadMediaDescription,
        );
    }

    fn send_bye_public(&self, reason: ReasonHeader) {
        let header = Header {
            name: SmolStr::new("Reason"),
            value: SmolStr::new(reason.to_string()),
        };
        let bye = self.with_dialog(|dialog| dialog.create_request(Method::Bye, &[header]));
        if let Some(bye) = bye {
            if let Some(branch) = branch_of(&bye) {
                self.core()
                    .pending
                    .insert(branch, PendingClient::Bye(self.clone()));
            }
            self.core().sink.send_request(bye);
        }
    }

    /// CANCEL arrived for the pending incoming re-INVITE: 487 it and reap
    /// the modification; the session is untouched.
    pub(crate) fn cancel_incoming_reinvite(&self) {
        let tx = {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return;
            };
            if reinvite.direction != Direction::Incoming || reinvite.is_finished() {
                return;
            }
            let core = self.core();
            core.timers.clear(&mut reinvite.provisional);
            reinvite.state = ReinviteState::Canceled;
            reinvite.server_tx.clone()
        };
        if let Some(tx) = tx {
            tx.reply(self.core().sink.as_ref(), 487, None, &[], None);
        }
        debug!(session = %self.id(), "incoming re-INVITE canceled");
    }

    fn arm_reinvite_retransmit(&self, delay: Duration) {
        let session = self.clone();
        let token = self.core().timers.schedule(delay, move || {
            session.on_reinvite_retransmit();
        });
        if let Some(reinvite) = self.data().reinvite.as_mut() {
            reinvite.retrans = Some(token);
        }
    }

    fn on_reinvite_retransmit(&self) {
        let (resp, tx, next) = {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return;
            };
            if reinvite.state != ReinviteState::WaitingForAck {
                return;
            }
            let next = (reinvite.retrans_interval * 2).min(T2);
            reinvite.retrans_interval = next;
            (reinvite.last_2xx.clone(), reinvite.server_tx.clone(), next)
        };
        if let (Some(resp), Some(tx)) = (resp, tx) {
            tx.retransmit(self.core().sink.as_ref(), &resp);
        }
        self.arm_reinvite_retransmit(next);
    }

    fn arm_reinvite_ack_wait(&self) {
        let session = self.clone();
        let token = self.core().timers.schedule(TIMER_64T1, move || {
            session.on_reinvite_ack_timeout();
        });
        if let Some(reinvite) = self.data().reinvite.as_mut() {
            reinvite.ack_wait = Some(token);
        }
    }

    fn on_reinvite_ack_timeout(&self) {
        {
            let mut data = self.data();
            let Some(reinvite) = data.reinvite.as_mut() else {
                return;
            };
            if reinvite.state != ReinviteState::WaitingForAck {
                return;
            }
            let core = self.core();
            core.timers.clear(&mut reinvite.retrans);
            reinvite.state = ReinviteState::Terminated;
        }
        warn!(session = %self.id(), "no ACK for re-INVITE 200");
        self.send_bye_public(ReasonHeader::sip(408, "No ACK"));
        self.finish(None, false, Originator::Remote, Cause::NoAck);
    }
}
