// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! INVITE session lifecycle (RFC 3261 §13–§17).
//!
//! A session holds at most one confirmed dialog plus any number of early
//! dialogs from forked provisionals, owns the re-INVITE and UPDATE
//! sub-transactions, and exclusively owns its media handler. All state lives
//! behind one mutex; timer callbacks re-check state at fire time.

mod dtmf;
mod reinvite;
mod update;

pub use dtmf::DtmfOptions;
pub use reinvite::ReinviteState;
pub use update::UpdateState;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use sip_msg::{extract_tag, Header, Method, ReasonHeader, Request, Response, SipUri};

use crate::agent::{AgentCore, PendingClient};
use crate::cause::Cause;
use crate::dialog::{Dialog, DialogId, DialogOwner, DialogState};
use crate::error::Error;
use crate::events::{Emitter, Originator, SessionEvent};
use crate::media::MediaHandler;
use crate::refer::Refer;
use crate::request::{
    self, branch_of, cancel_for, contact_value, local_from_value, out_of_dialog_request,
    parse_allow, set_body,
};
use crate::timer::{TimerToken, T1, T2, TIMER_64T1};
use crate::transaction::{OutboundSink, ServerTransaction};

use dtmf::DtmfQueue;
use reinvite::ReinviteTx;
use update::UpdateTx;

/// Stable session key: Call-ID plus the local From tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(SmolStr);

impl SessionId {
    pub fn new(raw: impl Into<SmolStr>) -> Self {
        Self(raw.into())
    }

    pub fn from_parts(call_id: &str, from_tag: &str) -> Self {
        Self(SmolStr::new(format!("{}{}", call_id, from_tag)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Null,
    /// Transient: building the first request or routing the incoming one.
    Creating,
    InviteSent,
    Received1xx,
    InviteReceived,
    WaitingForAnswer,
    WaitingForAck,
    Confirmed,
    Canceled,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Null => "null",
            SessionState::Creating => "creating",
            SessionState::InviteSent => "invite-sent",
            SessionState::Received1xx => "1xx-received",
            SessionState::InviteReceived => "invite-received",
            SessionState::WaitingForAnswer => "waiting-for-answer",
            SessionState::WaitingForAck => "waiting-for-ack",
            SessionState::Confirmed => "confirmed",
            SessionState::Canceled => "canceled",
            SessionState::Terminated => "terminated",
        }
    }
}

/// Call direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Options for [`UserAgent::call`](crate::agent::UserAgent::call).
pub struct CallOptions {
    pub media_handler: Arc<dyn MediaHandler>,
    pub extra_headers: Vec<Header>,
    pub anonymous: bool,
    /// RFC 3261 §13.3.1.1 Expires value (seconds).
    pub expires: Option<u32>,
}

impl CallOptions {
    pub fn new(media_handler: Arc<dyn MediaHandler>) -> Self {
        Self {
            media_handler,
            extra_headers: Vec::new(),
            anonymous: false,
            expires: None,
        }
    }
}

/// Options for [`Session::answer`].
pub struct AnswerOptions {
    pub media_handler: Arc<dyn MediaHandler>,
    /// Pre-built answer SDP; when absent the media handler produces one.
    pub sdp: Option<String>,
    pub extra_headers: Vec<Header>,
}

impl AnswerOptions {
    pub fn new(media_handler: Arc<dyn MediaHandler>) -> Self {
        Self {
            media_handler,
            sdp: None,
            extra_headers: Vec::new(),
        }
    }
}

/// Options for [`Session::terminate`].
#[derive(Default)]
pub struct TerminateOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub extra_headers: Vec<Header>,
    /// Body for the outgoing BYE, as (content-type, payload).
    pub body: Option<(String, String)>,
}

/// Options for [`Session::reinvite`] / [`Session::update`] and for answering
/// incoming modifications.
#[derive(Default)]
pub struct RenegotiateOptions {
    /// Offer (or answer) SDP; when absent the media handler produces one.
    pub sdp: Option<String>,
    pub extra_headers: Vec<Header>,
}

/// Handle to a session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    core: Arc<AgentCore>,
    direction: Direction,
    events: Emitter<SessionEvent>,
    state: Mutex<SessionData>,
}

struct SessionTimerSlots {
    no_answer: Option<TimerToken>,
    expires: Option<TimerToken>,
    retrans_2xx: Option<TimerToken>,
    ack_wait: Option<TimerToken>,
    dtmf: Option<TimerToken>,
}

impl SessionTimerSlots {
    fn new() -> Self {
        Self {
            no_answer: None,
            expires: None,
            retrans_2xx: None,
            ack_wait: None,
            dtmf: None,
        }
    }
}

pub(crate) struct SessionData {
    state: SessionState,
    call_id: SmolStr,
    local_tag: SmolStr,
    local_identity: SmolStr,
    remote_identity: SmolStr,
    dialog: Option<DialogId>,
    early_dialogs: Vec<DialogId>,
    /// UAC: the INVITE we sent. UAS: the INVITE we received.
    invite_request: Option<Request>,
    invite_branch: Option<SmolStr>,
    invite_server_tx: Option<Arc<ServerTransaction>>,
    media: Option<Arc<dyn MediaHandler>>,
    remote_offer: Option<String>,
    /// UAS late-offer: our 200 carried the offer, the ACK brings the answer.
    answer_in_ack: bool,
    last_2xx: Option<Response>,
    retrans_interval: Duration,
    ack: Option<Request>,
    reinvite: Option<ReinviteTx>,
    update: Option<UpdateTx>,
    pending_update_tx: Option<Arc<ServerTransaction>>,
    is_canceled: bool,
    cancel_reason: Option<SmolStr>,
    cancel_sent: bool,
    received_100: bool,
    anonymous: bool,
    allowed: Option<Vec<Method>>,
    timers: SessionTimerSlots,
    dtmf: DtmfQueue,
    refers: Vec<Refer>,
    finished: bool,
}

impl SessionData {
    fn new(call_id: SmolStr, local_tag: SmolStr, anonymous: bool) -> Self {
        Self {
            state: SessionState::Null,
            call_id,
            local_tag,
            local_identity: SmolStr::default(),
            remote_identity: SmolStr::default(),
            dialog: None,
            early_dialogs: Vec::new(),
            invite_request: None,
            invite_branch: None,
            invite_server_tx: None,
            media: None,
            remote_offer: None,
            answer_in_ack: false,
            last_2xx: None,
            retrans_interval: T1,
            ack: None,
            reinvite: None,
            update: None,
            pending_update_tx: None,
            is_canceled: false,
            cancel_reason: None,
            cancel_sent: false,
            received_100: false,
            anonymous,
            allowed: None,
            timers: SessionTimerSlots::new(),
            dtmf: DtmfQueue::new(),
            refers: Vec::new(),
            finished: false,
        }
    }
}

impl Session {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Builds and sends the initial INVITE. Fails with a typed error before
    /// anything goes on the wire; after that, failures travel as events.
    pub(crate) async fn connect(
        core: Arc<AgentCore>,
        target: SipUri,
        options: CallOptions,
    ) -> Result<Session, Error> {
        let call_id = request::generate_call_id();
        let local_tag = request::generate_tag();
        let id = SessionId::from_parts(&call_id, &local_tag);

        let session = Session {
            inner: Arc::new(SessionInner {
                id: id.clone(),
                core: core.clone(),
                direction: Direction::Outgoing,
                events: Emitter::new(),
                state: Mutex::new(SessionData::new(call_id.clone(), local_tag.clone(), options.anonymous)),
            }),
        };
        {
            let mut data = session.data();
            data.state = SessionState::Creating;
            data.media = Some(options.media_handler.clone());
            data.local_identity = local_from_value(&core.config, &local_tag, options.anonymous);
            data.remote_identity = SmolStr::new(format!("<{}>", target));
        }

        let offer = match options.media_handler.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                session.data().state = SessionState::Terminated;
                return Err(Error::Media(err));
            }
        };

        let mut extra = vec![
            Header {
                name: SmolStr::new("Contact"),
                value: contact_value(&core.config),
            },
            Header {
                name: SmolStr::new("Supported"),
                value: SmolStr::new("timer"),
            },
        ];
        if core.config.session_timers {
            extra.push(Header {
                name: SmolStr::new("Session-Expires"),
                value: SmolStr::new(core.config.session_expires.to_string()),
            });
            if core.config.min_session_expires > 90 {
                extra.push(Header {
                    name: SmolStr::new("Min-SE"),
                    value: SmolStr::new(core.config.min_session_expires.to_string()),
                });
            }
        }
        if let Some(expires) = options.expires {
            extra.push(Header {
                name: SmolStr::new("Expires"),
                value: SmolStr::new(expires.to_string()),
            });
        }
        extra.extend(options.extra_headers);

        let from_value = local_from_value(&core.config, &local_tag, options.anonymous);
        let to_value = SmolStr::new(format!("<{}>", target));
        let mut invite = out_of_dialog_request(
            Method::Invite,
            &target,
            from_value,
            to_value,
            call_id.clone(),
            1,
            &extra,
        );
        set_body(&mut invite, "application/sdp", &offer);
        let branch = branch_of(&invite).expect("generated Via always carries a branch");

        {
            let mut data = session.data();
            data.invite_request = Some(invite.clone());
            data.invite_branch = Some(branch.clone());
            data.state = SessionState::InviteSent;
        }

        core.sessions.insert(id.clone(), session.clone());
        core.pending
            .insert(branch, PendingClient::Invite(session.clone()));
        core.emit_new_session(Originator::Local, session.clone(), invite.clone());

        if let Some(expires) = options.expires {
            session.arm_expires_timer(Duration::from_secs(u64::from(expires)));
        }

        info!(session = %id, target = %invite.start.uri, "outgoing INVITE");
        core.sink.send_request(invite);
        Ok(session)
    }

    /// Builds a session for an incoming INVITE. Replies 100, validates, and
    /// moves through InviteReceived into WaitingForAnswer (180 sent, timers
    /// armed). Returns `None` when the INVITE was rejected outright.
    pub(crate) fn init_incoming(
        core: Arc<AgentCore>,
        req: Request,
        server_tx: Arc<ServerTransaction>,
    ) -> Option<Session> {
        let call_id = req.headers.get("Call-ID")?.clone();
        let Some(from_tag) = req.headers.get("From").and_then(|v| extract_tag(v)) else {
            server_tx.reply(core.sink.as_ref(), 400, None, &[], None);
            return None;
        };
        let local_tag = request::generate_tag();
        server_tx.set_to_tag(local_tag.clone());

        server_tx.reply(core.sink.as_ref(), 100, None, &[], None);

        // Body checks before any state exists.
        if req.has_body() {
            let sdp_body = req
                .headers
                .get("Content-Type")
                .map(|ct| ct.as_str().to_ascii_lowercase().starts_with("application/sdp"))
                .unwrap_or(false);
            if !sdp_body {
                server_tx.reply(core.sink.as_ref(), 415, None, &[], None);
                return None;
            }
        }

        let id = SessionId::from_parts(&call_id, &from_tag);
        let session = Session {
            inner: Arc::new(SessionInner {
                id: id.clone(),
                core: core.clone(),
                direction: Direction::Incoming,
                events: Emitter::new(),
                state: Mutex::new(SessionData::new(call_id.clone(), local_tag.clone(), false)),
            }),
        };

        let dialog = match Dialog::new_uas(
            &req,
            local_tag.clone(),
            DialogOwner::Session(id.clone()),
            DialogState::Early,
        ) {
            Ok(mut dialog) => {
                dialog.session_timer = core.new_session_timer_state();
                dialog
            }
            Err(err) => {
                debug!(session = %id, %err, "incoming INVITE cannot form a dialog");
                server_tx.reply(core.sink.as_ref(), 500, None, &[], None);
                return None;
            }
        };
        let dialog_id = dialog.id.clone();
        core.dialogs.insert(dialog);

        let expires = req
            .headers
            .get("Expires")
            .and_then(|v| v.parse::<u64>().ok());

        {
            let mut data = session.data();
            data.state = SessionState::InviteReceived;
            data.dialog = Some(dialog_id);
            data.local_identity = req.headers.get("To").cloned().unwrap_or_default();
            data.remote_identity = req.headers.get("From").cloned().unwrap_or_default();
            data.remote_offer = req
                .has_body()
                .then(|| String::from_utf8_lossy(&req.body).into_owned());
            if let Some(allow) = req.headers.get("Allow") {
                data.allowed = Some(parse_allow(allow));
            }
            data.invite_request = Some(req.clone());
            data.invite_branch = Some(server_tx.branch.clone());
            data.invite_server_tx = Some(server_tx.clone());
        }

        core.sessions.insert(id.clone(), session.clone());
        core.invite_branches
            .insert(server_tx.branch.clone(), id.clone());
        core.emit_new_session(Originator::Remote, session.clone(), req.clone());

        // Media is handed over at answer(); reaching here is the media-ready
        // transition for the UAS side.
        {
            let mut data = session.data();
            data.state = SessionState::WaitingForAnswer;
        }
        let contact = Header {
            name: SmolStr::new("Contact"),
            value: contact_value(&core.config),
        };
        server_tx.reply(core.sink.as_ref(), 180, None, &[contact], None);
        session.emit(SessionEvent::Progress {
            originator: Originator::Local,
            response: None,
        });

        session.arm_no_answer_timer(core.config.no_answer_timeout);
        if let Some(secs) = expires {
            session.arm_uas_expires_timer(Duration::from_secs(secs));
        }

        info!(session = %id, "incoming INVITE ringing");
        Some(session)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> SessionId {
        self.inner.id.clone()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> SessionState {
        self.data().state
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self.state(),
            SessionState::WaitingForAck | SessionState::Confirmed
        )
    }

    /// Subscribes to this session's events.
    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The confirmed dialog id, once established.
    pub fn dialog_id(&self) -> Option<DialogId> {
        self.data().dialog.clone()
    }

    /// True when the peer advertised the method in Allow. Unknown (no Allow
    /// seen) counts as allowed.
    pub fn remote_allows(&self, method: &Method) -> bool {
        match &self.data().allowed {
            Some(allowed) => allowed.contains(method),
            None => true,
        }
    }

    pub(crate) fn data(&self) -> parking_lot::MutexGuard<'_, SessionData> {
        self.inner.state.lock()
    }

    pub(crate) fn core(&self) -> &Arc<AgentCore> {
        &self.inner.core
    }

    fn sink(&self) -> &dyn OutboundSink {
        self.inner.core.sink.as_ref()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    // ------------------------------------------------------------------
    // Answering (UAS)
    // ------------------------------------------------------------------

    /// Accepts an incoming call: replies 200 with the answer SDP, starts the
    /// 2xx retransmission ladder and the ACK wait.
    pub async fn answer(&self, options: AnswerOptions) -> Result<(), Error> {
        let (server_tx, remote_offer) = {
            let mut data = self.data();
            if data.state != SessionState::WaitingForAnswer {
                return Err(Error::invalid_state("answer", data.state.as_str()));
            }
            data.media = Some(options.media_handler.clone());
            let tx = data
                .invite_server_tx
                .clone()
                .ok_or(Error::invalid_state("answer", "no transaction"))?;
            (tx, data.remote_offer.clone())
        };

        let sdp = match options.sdp {
            Some(sdp) => sdp,
            None => {
                let result = match &remote_offer {
                    Some(offer) => options.media_handler.process_offer(offer).await,
                    // Late offer: our 200 carries it, the ACK answers.
                    None => options.media_handler.create_offer().await,
                };
                match result {
                    Ok(sdp) => sdp,
                    Err(err) => {
                        self.fail_answer(&server_tx, &err);
                        return Err(Error::Media(err));
                    }
                }
            }
        };

        let core = self.core().clone();
        let mut extra = vec![Header {
            name: SmolStr::new("Contact"),
            value: contact_value(&core.config),
        }];

        {
            let mut data = self.data();
            if data.state != SessionState::WaitingForAnswer {
                return Err(Error::invalid_state("answer", data.state.as_str()));
            }
            core.timers.clear(&mut data.timers.no_answer);
            core.timers.clear(&mut data.timers.expires);
            data.answer_in_ack = remote_offer.is_none();

            if let Some(dialog_id) = data.dialog.clone() {
                if let Some(dialog) = core.dialogs.get(&dialog_id) {
                    let mut dialog = dialog.lock();
                    if let Some(invite) = &data.invite_request {
                        dialog.session_timer.process_request(&invite.headers);
                    }
                    dialog.confirm();
                    if let Some(header) = session_expires_reply_header(&dialog) {
                        extra.push(header);
                    }
                }
            }
        }
        extra.extend(options.extra_headers);

        let resp = server_tx.reply(
            self.sink(),
            200,
            None,
            &extra,
            Some(("application/sdp", &sdp)),
        );

        {
            let mut data = self.data();
            data.last_2xx = Some(resp);
            data.retrans_interval = T1;
            data.state = SessionState::WaitingForAck;
        }
        self.arm_2xx_retransmit(T1);
        self.arm_ack_wait();
        if let Some(dialog_id) = self.data().dialog.clone() {
            self.core().arm_session_timer(&dialog_id);
        }

        self.emit(SessionEvent::Started {
            originator: Originator::Local,
            response: None,
        });
        info!(session = %self.inner.id, "call answered");
        Ok(())
    }

    fn fail_answer(&self, server_tx: &Arc<ServerTransaction>, err: &crate::media::MediaError) {
        warn!(session = %self.inner.id, %err, "answer failed in media handler");
        server_tx.reply(self.sink(), 480, None, &[], None);
        self.finish(None, true, Originator::Local, err.cause());
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Ends the session from whatever state it is in. Idempotent once the
    /// session is Canceled or Terminated.
    pub fn terminate(&self, options: TerminateOptions) -> Result<(), Error> {
        let state = self.data().state;
        match state {
            SessionState::Canceled | SessionState::Terminated => Ok(()),
            SessionState::Null | SessionState::Creating => {
                self.finish(None, true, Originator::Local, Cause::Canceled);
                Ok(())
            }
            SessionState::InviteSent | SessionState::Received1xx => {
                let status = options.status_code.unwrap_or(487);
                if !(300..700).contains(&status) {
                    return Err(Error::InvalidStatus(status));
                }
                let reason_text = options
                    .reason_phrase
                    .unwrap_or_else(|| sip_msg::reason_phrase_for(status).to_owned());
                let reason = SmolStr::new(ReasonHeader::sip(status, &reason_text).to_string());

                let may_cancel = {
                    let mut data = self.data();
                    data.is_canceled = true;
                    data.cancel_reason = Some(reason);
                    data.state = SessionState::Canceled;
                    let core = self.core();
                    core.timers.clear(&mut data.timers.expires);
                    core.timers.clear(&mut data.timers.no_answer);
                    // CANCEL may only chase the INVITE once a provisional
                    // response arrived (RFC 3261 §9.1).
                    data.received_100 || state == SessionState::Received1xx
                };
                if may_cancel {
                    self.send_cancel();
                }
                self.emit_terminal(true, Originator::Local, None, Cause::Canceled);
                Ok(())
            }
            SessionState::InviteReceived | SessionState::WaitingForAnswer => {
                let status = options.status_code.unwrap_or(480);
                if !(300..700).contains(&status) {
                    return Err(Error::InvalidStatus(status));
                }
                let server_tx = self.data().invite_server_tx.clone();
                if let Some(tx) = server_tx {
                    tx.reply(
                        self.sink(),
                        status,
                        options.reason_phrase.as_deref(),
                        &options.extra_headers,
                        None,
                    );
                }
                self.finish(None, true, Originator::Local, Cause::Rejected);
                Ok(())
            }
            SessionState::WaitingForAck | SessionState::Confirmed => {
                self.send_bye(&options.extra_headers, options.body.as_ref(), None);
                self.finish(None, false, Originator::Local, Cause::Bye);
                Ok(())
            }
        }
    }

    /// Sends CANCEL for the pending INVITE exactly once.
    fn send_cancel(&self) {
        let cancel = {
            let mut data = self.data();
            if data.cancel_sent {
                return;
            }
            data.cancel_sent = true;
            let Some(invite) = &data.invite_request else {
                return;
            };
            cancel_for(invite, data.cancel_reason.as_deref())
        };
        if let Some(branch) = branch_of(&cancel) {
            self.core()
                .pending
                .insert(branch, PendingClient::Cancel(self.clone()));
        }
        debug!(session = %self.inner.id, "sending CANCEL");
        self.sink().send_request(cancel);
    }

    /// Builds and sends a BYE on the confirmed dialog.
    fn send_bye(
        &self,
        extra_headers: &[Header],
        body: Option<&(String, String)>,
        reason: Option<ReasonHeader>,
    ) {
        let bye = {
            let data = self.data();
            let Some(dialog_id) = data.dialog.clone() else {
                return;
            };
            drop(data);
            let Some(dialog) = self.core().dialogs.get(&dialog_id) else {
                return;
            };
            let mut headers: Vec<Header> = extra_headers.to_vec();
            if let Some(reason) = reason {
                headers.push(Header {
                    name: SmolStr::new("Reason"),
                    value: SmolStr::new(reason.to_string()),
                });
            }
            let mut bye = dialog.lock().create_request(Method::Bye, &headers);
            if let Some((content_type, payload)) = body {
                set_body(&mut bye, content_type, payload);
            }
            bye
        };
        if let Some(branch) = branch_of(&bye) {
            self.core()
                .pending
                .insert(branch, PendingClient::Bye(self.clone()));
        }
        debug!(session = %self.inner.id, "sending BYE");
        self.sink().send_request(bye);
    }

    /// Moves to Terminated, emits the terminal event, and releases every
    /// resource the session holds.
    pub(crate) fn finish(
        &self,
        message: Option<sip_msg::SipMessage>,
        failed: bool,
        originator: Originator,
        cause: Cause,
    ) {
        self.emit_terminal(failed, originator, message, cause);
        self.teardown();
    }

    fn emit_terminal(
        &self,
        failed: bool,
        originator: Originator,
        message: Option<sip_msg::SipMessage>,
        cause: Cause,
    ) {
        {
            let mut data = self.data();
            if data.finished {
                return;
            }
            data.finished = true;
        }
        if failed {
            self.emit(SessionEvent::Failed {
                originator,
                message,
                cause,
            });
        } else {
            self.emit(SessionEvent::Ended {
                originator,
                message,
                cause,
            });
        }
    }

    /// Cancels timers, terminates dialogs, closes media and in-dialog refers,
    /// and unregisters the session. Safe to call more than once.
    pub(crate) fn teardown(&self) {
        let core = self.core().clone();
        let (dialogs, media, refers, branches) = {
            let mut data = self.data();
            data.state = SessionState::Terminated;

            core.timers.clear(&mut data.timers.no_answer);
            core.timers.clear(&mut data.timers.expires);
            core.timers.clear(&mut data.timers.retrans_2xx);
            core.timers.clear(&mut data.timers.ack_wait);
            core.timers.clear(&mut data.timers.dtmf);
            data.dtmf.clear();
            if let Some(reinvite) = data.reinvite.as_mut() {
                reinvite.cancel_timers(&core.timers);
            }

            let mut dialogs = data.early_dialogs.drain(..).collect::<Vec<_>>();
            if let Some(dialog) = data.dialog.take() {
                dialogs.push(dialog);
            }
            let refers: Vec<Refer> = data.refers.drain(..).collect();
            let mut branches = Vec::new();
            if let Some(branch) = data.invite_branch.take() {
                branches.push(branch);
            }
            if let Some(branch) = data.reinvite.as_ref().and_then(|r| r.server_branch()) {
                branches.push(branch);
            }
            data.invite_server_tx = None;
            (dialogs, data.media.take(), refers, branches)
        };

        for refer in refers {
            refer.on_session_terminated();
        }
        // Sessions go before their dialogs.
        for dialog_id in dialogs {
            core.terminate_dialog(&dialog_id);
        }
        if let Some(media) = media {
            media.close();
        }
        for branch in &branches {
            core.pending.remove(branch);
            core.invite_branches.remove(branch);
        }
        core.sessions.remove(&self.inner.id);
    }

    // ------------------------------------------------------------------
    // UAC response handling
    // ------------------------------------------------------------------

    pub(crate) async fn on_invite_response(&self, resp: Response) {
        if let Some(allow) = resp.headers.get("Allow") {
            self.data().allowed = Some(parse_allow(allow));
        }

        let code = resp.start.code;
        let state = self.data().state;
        match state {
            SessionState::Canceled => self.on_response_while_canceled(resp).await,
            SessionState::InviteSent | SessionState::Received1xx => {
                if code == 100 {
                    self.data().received_100 = true;
                    if self.data().is_canceled {
                        self.send_cancel();
                    }
                } else if code < 200 {
                    self.on_provisional(resp);
                } else if code < 300 {
                    self.on_initial_2xx(resp).await;
                } else {
                    let cause = Cause::from_status(code);
                    self.finish(
                        Some(resp.clone().into()),
                        true,
                        Originator::Remote,
                        cause,
                    );
                }
            }
            SessionState::Confirmed => {
                if (200..300).contains(&code) {
                    self.on_2xx_while_confirmed(resp);
                }
            }
            _ => debug!(session = %self.inner.id, code, "INVITE response ignored"),
        }
    }

    fn on_provisional(&self, resp: Response) {
        let to_tag = resp.headers.get("To").and_then(|v| extract_tag(v));
        {
            let mut data = self.data();
            data.received_100 = true;
            if to_tag.is_some() {
                data.state = SessionState::Received1xx;
            }
        }

        // An early dialog forms only when the provisional carries both a To
        // tag and a Contact.
        if to_tag.is_some() && resp.headers.get("Contact").is_some() {
            match Dialog::new_uac(&resp, DialogOwner::Session(self.inner.id.clone())) {
                Ok(mut dialog) => {
                    let dialog_id = dialog.id.clone();
                    let data = self.data();
                    if !data.early_dialogs.contains(&dialog_id)
                        && data.dialog.as_ref() != Some(&dialog_id)
                    {
                        dialog.session_timer = self.core().new_session_timer_state();
                        drop(data);
                        self.core().dialogs.insert(dialog);
                        self.data().early_dialogs.push(dialog_id);
                    }
                }
                Err(err) => {
                    debug!(session = %self.inner.id, %err, "early dialog not created")
                }
            }
        }

        if self.data().is_canceled {
            self.send_cancel();
            return;
        }

        self.emit(SessionEvent::Progress {
            originator: Originator::Remote,
            response: Some(resp),
        });
    }

    async fn on_initial_2xx(&self, resp: Response) {
        let Some(dialog_id) = DialogId::uac_from_response(&resp) else {
            warn!(session = %self.inner.id, "2xx without To tag");
            self.finish(
                Some(resp.clone().into()),
                true,
                Originator::Remote,
                Cause::InternalError,
            );
            return;
        };

        if !resp.has_body() {
            self.accept_and_terminate(&resp, 400, "Missing session description");
            self.finish(
                Some(resp.clone().into()),
                true,
                Originator::Remote,
                Cause::BadMediaDescription,
            );
            return;
        }

        let mut dialog = match Dialog::new_uac(&resp, DialogOwner::Session(self.inner.id.clone())) {
            Ok(dialog) => dialog,
            Err(err) => {
                warn!(session = %self.inner.id, %err, "2xx cannot form a dialog");
                self.finish(
                    Some(resp.clone().into()),
                    true,
                    Originator::Remote,
                    Cause::InternalError,
                );
                return;
            }
        };
        dialog.session_timer = self.core().new_session_timer_state();
        dialog.session_timer.process_response(&resp.headers);

        let media = self.data().media.clone();
        let answer = String::from_utf8_lossy(&resp.body).into_owned();
        if let Some(media) = media {
            if let Err(err) = media.process_answer(&answer).await {
                warn!(session = %self.inner.id, %err, "remote answer rejected");
                self.accept_and_terminate(&resp, 488, "Not Acceptable Here");
                self.finish(
                    Some(resp.clone().into()),
                    true,
                    Originator::Remote,
                    Cause::BadMediaDescription,
                );
                return;
            }
        }

        // The media await may have lost a race with termination.
        {
            let data = self.data();
            if matches!(data.state, SessionState::Terminated | SessionState::Canceled) {
                drop(data);
                self.accept_and_terminate(&resp, 487, "Request Terminated");
                return;
            }
        }

        let handle = self.core().dialogs.insert(dialog);
        let ack = {
            let mut dialog = handle.lock();
            dialog.confirm();
            dialog.create_request(Method::Ack, &[])
        };

        {
            let mut data = self.data();
            data.early_dialogs.retain(|id| *id != dialog_id);
            data.dialog = Some(dialog_id.clone());
            data.ack = Some(ack.clone());
            data.state = SessionState::Confirmed;
        }

        self.sink().send_request(ack);
        self.core().arm_session_timer(&dialog_id);
        self.emit(SessionEvent::Started {
            originator: Originator::Remote,
            response: Some(resp),
        });
        info!(session = %self.inner.id, dialog = %dialog_id, "session confirmed");
    }

    /// 2xx landing on a confirmed session: dialog-id match means the peer
    /// retransmitted (re-ACK); anything else is a late fork to absorb.
    fn on_2xx_while_confirmed(&self, resp: Response) {
        let Some(dialog_id) = DialogId::uac_from_response(&resp) else {
            return;
        };
        let (matches, ack) = {
            let data = self.data();
            (
                data.dialog.as_ref() == Some(&dialog_id),
                data.ack.clone(),
            )
        };
        if matches {
            if let Some(ack) = ack {
                debug!(session = %self.inner.id, "2xx retransmission, re-sending ACK");
                self.sink().send_request(ack);
            }
        } else {
            info!(session = %self.inner.id, fork = %dialog_id, "absorbing forked 2xx");
            self.accept_and_terminate(&resp, 487, "Request Terminated");
        }
    }

    async fn on_response_while_canceled(&self, resp: Response) {
        let code = resp.start.code;
        if code < 200 {
            self.send_cancel();
        } else if code < 300 {
            // CANCEL raced the 2xx: accept the dialog and kill it quietly.
            self.accept_and_terminate(&resp, 487, "Request Terminated");
            self.teardown();
        } else {
            self.teardown();
        }
    }

    /// ACKs then BYEs a 2xx on a dialog this session will not use, per
    /// RFC 3261 §15: forked 2xx, post-cancel 2xx, unusable 2xx.
    fn accept_and_terminate(&self, resp: &Response, cause_code: u16, cause_text: &str) {
        let Ok(mut dialog) =
            Dialog::new_uac(resp, DialogOwner::Session(self.inner.id.clone()))
        else {
            warn!(session = %self.inner.id, "cannot ACK 2xx without Contact");
            return;
        };
        let ack = dialog.create_request(Method::Ack, &[]);
        let reason = Header {
            name: SmolStr::new("Reason"),
            value: SmolStr::new(ReasonHeader::sip(cause_code, cause_text).to_string()),
        };
        let bye = dialog.create_request(Method::Bye, &[reason]);
        self.sink().send_request(ack);
        self.sink().send_request(bye);
    }

    // ------------------------------------------------------------------
    // UAS request handling (gate-accepted, in-dialog)
    // ------------------------------------------------------------------

    pub(crate) async fn on_in_dialog_request(
        &self,
        req: Request,
        server_tx: Option<Arc<ServerTransaction>>,
    ) {
        match req.start.method.clone() {
            Method::Ack => self.on_ack(req).await,
            Method::Bye => {
                if let Some(tx) = server_tx {
                    self.on_bye(req, tx);
                }
            }
            Method::Info => {
                if let Some(tx) = server_tx {
                    self.on_info(req, tx);
                }
            }
            Method::Invite => {
                if let Some(tx) = server_tx {
                    self.on_incoming_reinvite(req, tx);
                }
            }
            Method::Update => {
                if let Some(tx) = server_tx {
                    self.on_incoming_update(req, tx);
                }
            }
            Method::Refer => {
                if let Some(tx) = server_tx {
                    self.on_incoming_refer(req, tx);
                }
            }
            Method::Notify => {
                if let Some(tx) = server_tx {
                    self.on_refer_notify(req, tx);
                }
            }
            Method::Subscribe => {
                if let Some(tx) = server_tx {
                    self.on_refer_subscribe(req, tx);
                }
            }
            other => {
                if let Some(tx) = server_tx {
                    debug!(session = %self.inner.id, method = %other, "in-dialog method not handled");
                    tx.reply(self.sink(), 405, None, &[], None);
                }
            }
        }
    }

    async fn on_ack(&self, req: Request) {
        let state = self.data().state;
        if state == SessionState::WaitingForAck {
            let (expect_answer, media) = {
                let mut data = self.data();
                let core = self.core();
                core.timers.clear(&mut data.timers.retrans_2xx);
                core.timers.clear(&mut data.timers.ack_wait);
                data.state = SessionState::Confirmed;
                (data.answer_in_ack, data.media.clone())
            };
            if expect_answer {
                if let (Some(media), true) = (media, req.has_body()) {
                    let answer = String::from_utf8_lossy(&req.body).into_owned();
                    if let Err(err) = media.process_answer(&answer).await {
                        warn!(session = %self.inner.id, %err, "answer in ACK rejected");
                        self.send_bye(
                            &[],
                            None,
                            Some(ReasonHeader::sip(488, "Not Acceptable Here")),
                        );
                        self.finish(
                            Some(req.into()),
                            false,
                            Originator::Remote,
                            Cause::BadMediaDescription,
                        );
                        return;
                    }
                }
            }
            info!(session = %self.inner.id, "ACK received, session confirmed");
        } else if self.data().reinvite.is_some() {
            self.on_reinvite_ack(req).await;
        }
    }

    fn on_bye(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        let state = self.data().state;
        if matches!(
            state,
            SessionState::Confirmed | SessionState::WaitingForAck
        ) {
            server_tx.reply(self.sink(), 200, None, &[], None);
            self.finish(
                Some(req.into()),
                false,
                Originator::Remote,
                Cause::Bye,
            );
        } else {
            server_tx.reply(self.sink(), 403, None, &[], None);
        }
    }

    fn on_info(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        let content_type = req
            .headers
            .get("Content-Type")
            .map(|v| v.as_str().to_ascii_lowercase());
        match content_type.as_deref() {
            Some(ct) if ct.starts_with("application/dtmf-relay") => {
                let body = String::from_utf8_lossy(&req.body).into_owned();
                if let Some((tone, duration)) = dtmf::parse_dtmf_relay(&body) {
                    server_tx.reply(self.sink(), 200, None, &[], None);
                    self.emit(SessionEvent::NewDtmf {
                        originator: Originator::Remote,
                        tone,
                        duration,
                    });
                } else {
                    server_tx.reply(self.sink(), 400, None, &[], None);
                }
            }
            None => {
                server_tx.reply(self.sink(), 200, None, &[], None);
            }
            Some(_) => {
                server_tx.reply(self.sink(), 415, None, &[], None);
            }
        }
    }

    /// CANCEL matched to this session's INVITE (or re-INVITE) branch.
    pub(crate) fn on_cancel(&self, req: Request, cancel_tx: Arc<ServerTransaction>) {
        let branch = cancel_tx.branch.clone();
        // The CANCEL gets its own 200 regardless of what it cancels.
        cancel_tx.reply(self.sink(), 200, None, &[], None);

        let reinvite_branch = {
            let data = self.data();
            data.reinvite
                .as_ref()
                .and_then(|r| r.server_branch())
                .filter(|b| *b == branch)
        };
        if reinvite_branch.is_some() {
            self.cancel_incoming_reinvite();
            return;
        }

        let state = self.data().state;
        if matches!(
            state,
            SessionState::InviteReceived | SessionState::WaitingForAnswer
        ) {
            if let Some(invite_tx) = self.data().invite_server_tx.clone() {
                invite_tx.reply(self.sink(), 487, None, &[], None);
            }
            {
                let mut data = self.data();
                data.state = SessionState::Canceled;
                data.is_canceled = true;
            }
            self.finish(
                Some(req.into()),
                true,
                Originator::Remote,
                Cause::Canceled,
            );
        }
    }

    // ------------------------------------------------------------------
    // In-dialog REFER plumbing (delegates to the refer module)
    // ------------------------------------------------------------------

    fn on_incoming_refer(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        if self.data().state != SessionState::Confirmed {
            server_tx.reply(self.sink(), 403, None, &[], None);
            return;
        }
        match Refer::init_in_dialog_incoming(self, &req, &server_tx) {
            Some(refer) => {
                self.data().refers.push(refer.clone());
                self.core().emit_new_refer(
                    Originator::Remote,
                    refer,
                    Some(req),
                );
            }
            None => debug!(session = %self.inner.id, "in-dialog REFER rejected"),
        }
    }

    fn on_refer_notify(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        let Some(event) = req
            .headers
            .get("Event")
            .and_then(|v| sip_msg::EventHeader::parse(v))
        else {
            server_tx.reply(self.sink(), 400, None, &[], None);
            return;
        };
        if !event.package.eq_ignore_ascii_case("refer") {
            server_tx.reply(self.sink(), 489, None, &[], None);
            return;
        }
        let refer = {
            let data = self.data();
            data.refers
                .iter()
                .find(|r| r.event_id() == event.id)
                .cloned()
        };
        match refer {
            Some(refer) => refer.on_notify(req, server_tx),
            None => {
                server_tx.reply(self.sink(), 481, None, &[], None);
            }
        }
    }

    fn on_refer_subscribe(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        let event = req
            .headers
            .get("Event")
            .and_then(|v| sip_msg::EventHeader::parse(v));
        let refer = match &event {
            Some(event) if event.package.eq_ignore_ascii_case("refer") => {
                let data = self.data();
                data.refers
                    .iter()
                    .find(|r| r.event_id() == event.id)
                    .cloned()
            }
            _ => None,
        };
        match refer {
            Some(refer) => refer.on_subscribe(req, server_tx),
            None => {
                server_tx.reply(self.sink(), 481, None, &[], None);
            }
        }
    }

    /// Starts an in-dialog REFER (call transfer) on this session's dialog.
    pub fn refer(&self, refer_to: &str, extra_headers: Vec<Header>) -> Result<Refer, Error> {
        if self.data().state != SessionState::Confirmed {
            return Err(Error::invalid_state("refer", self.data().state.as_str()));
        }
        let refer = Refer::send_in_dialog(self, refer_to, extra_headers)?;
        self.data().refers.push(refer.clone());
        self.core()
            .emit_new_refer(Originator::Local, refer.clone(), None);
        Ok(refer)
    }

    pub(crate) fn drop_refer(&self, refer_id: &crate::refer::ReferId) {
        self.data().refers.retain(|r| r.id() != *refer_id);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn arm_no_answer_timer(&self, timeout: Duration) {
        let session = self.clone();
        let token = self.core().timers.schedule(timeout, move || {
            session.on_no_answer();
        });
        self.data().timers.no_answer = Some(token);
    }

    fn on_no_answer(&self) {
        let state = self.data().state;
        if state != SessionState::WaitingForAnswer {
            return;
        }
        if let Some(tx) = self.data().invite_server_tx.clone() {
            tx.reply(self.sink(), 480, None, &[], None);
        }
        info!(session = %self.inner.id, "no answer from application");
        self.finish(None, true, Originator::Local, Cause::NoAnswer);
    }

    fn arm_uas_expires_timer(&self, timeout: Duration) {
        let session = self.clone();
        let token = self.core().timers.schedule(timeout, move || {
            session.on_uas_expires();
        });
        self.data().timers.expires = Some(token);
    }

    fn on_uas_expires(&self) {
        let state = self.data().state;
        if !matches!(
            state,
            SessionState::InviteReceived | SessionState::WaitingForAnswer
        ) {
            return;
        }
        if let Some(tx) = self.data().invite_server_tx.clone() {
            tx.reply(self.sink(), 487, None, &[], None);
        }
        self.finish(None, true, Originator::System, Cause::Expires);
    }

    fn arm_expires_timer(&self, timeout: Duration) {
        let session = self.clone();
        let token = self.core().timers.schedule(timeout, move || {
            session.on_uac_expires();
        });
        self.data().timers.expires = Some(token);
    }

    fn on_uac_expires(&self) {
        let state = self.data().state;
        if !matches!(
            state,
            SessionState::InviteSent | SessionState::Received1xx
        ) {
            return;
        }
        info!(session = %self.inner.id, "INVITE expired without final answer");
        {
            let mut data = self.data();
            data.is_canceled = true;
            data.cancel_reason =
                Some(SmolStr::new(ReasonHeader::sip(487, "Expires").to_string()));
            let may_cancel = data.received_100 || state == SessionState::Received1xx;
            data.state = SessionState::Canceled;
            drop(data);
            if may_cancel {
                self.send_cancel();
            }
        }
        self.emit_terminal(true, Originator::System, None, Cause::Expires);
    }

    pub(crate) fn arm_2xx_retransmit(&self, delay: Duration) {
        let session = self.clone();
        let token = self.core().timers.schedule(delay, move || {
            session.on_2xx_retransmit();
        });
        self.data().timers.retrans_2xx = Some(token);
    }

    /// RFC 3261 §13.3.1.4: the TU retransmits the 200 every T1 doubling to
    /// T2, forever, until the ACK (or Timer H) stops it.
    fn on_2xx_retransmit(&self) {
        let (resp, tx, next) = {
            let mut data = self.data();
            if data.state != SessionState::WaitingForAck {
                return;
            }
            let next = (data.retrans_interval * 2).min(T2);
            data.retrans_interval = next;
            (
                data.last_2xx.clone(),
                data.invite_server_tx.clone(),
                next,
            )
        };
        if let (Some(resp), Some(tx)) = (resp, tx) {
            tx.retransmit(self.sink(), &resp);
        }
        self.arm_2xx_retransmit(next);
    }

    pub(crate) fn arm_ack_wait(&self) {
        let session = self.clone();
        let token = self.core().timers.schedule(TIMER_64T1, move || {
            session.on_ack_timeout();
        });
        self.data().timers.ack_wait = Some(token);
    }

    fn on_ack_timeout(&self) {
        {
            let mut data = self.data();
            if data.state != SessionState::WaitingForAck {
                return;
            }
            let core = self.core();
            core.timers.clear(&mut data.timers.retrans_2xx);
        }
        warn!(session = %self.inner.id, "no ACK for our 200");
        self.send_bye(&[], None, Some(ReasonHeader::sip(408, "No ACK")));
        self.finish(None, false, Originator::Remote, Cause::NoAck);
    }

    // ------------------------------------------------------------------
    // Session timer owner callbacks
    // ------------------------------------------------------------------

    /// Local-refresher fire: refresh via UPDATE when the peer allows it,
    /// re-INVITE otherwise.
    pub(crate) fn on_session_refresh(&self) {
        if self.data().state != SessionState::Confirmed {
            return;
        }
        self.emit(SessionEvent::Refresh {
            originator: Originator::System,
        });
        if self.remote_allows(&Method::Update) {
            if let Err(err) = self.send_refresh_update() {
                debug!(session = %self.inner.id, %err, "refresh UPDATE not sent");
            }
        } else {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(err) = session.reinvite(RenegotiateOptions::default()).await {
                    debug!(session = %session.inner.id, %err, "refresh re-INVITE not sent");
                }
            });
        }
    }

    /// Remote-refresher expiry: the peer failed to refresh in time.
    pub(crate) fn on_session_expired(&self) {
        if !matches!(
            self.data().state,
            SessionState::Confirmed | SessionState::WaitingForAck
        ) {
            return;
        }
        info!(session = %self.inner.id, "session timer expired");
        self.send_bye(&[], None, Some(ReasonHeader::sip(408, "Session Timer")));
        self.finish(None, false, Originator::System, Cause::SessionTimer);
    }

    // ------------------------------------------------------------------
    // Transport/transaction failures
    // ------------------------------------------------------------------

    pub(crate) fn on_transport_error(&self) {
        let established = self.is_established();
        self.finish(
            None,
            !established,
            Originator::System,
            Cause::ConnectionError,
        );
    }

    pub(crate) fn on_request_timeout(&self) {
        let established = self.is_established();
        self.finish(
            None,
            !established,
            Originator::System,
            Cause::RequestTimeout,
        );
    }

    // ------------------------------------------------------------------
    // Shared helpers for the sub-transaction modules
    // ------------------------------------------------------------------

    /// Runs `f` against this session's confirmed dialog.
    pub(crate) fn with_dialog<R>(&self, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        let dialog_id = self.data().dialog.clone()?;
        let dialog = self.core().dialogs.get(&dialog_id)?;
        let mut dialog = dialog.lock();
        Some(f(&mut dialog))
    }

    pub(crate) fn contact_header(&self) -> Header {
        Header {
            name: SmolStr::new("Contact"),
            value: contact_value(&self.core().config),
        }
    }

    /// The local party's name-addr value (From on outgoing, To on incoming).
    pub fn local_identity(&self) -> SmolStr {
        self.data().local_identity.clone()
    }

    /// The remote party's name-addr value.
    pub fn remote_identity(&self) -> SmolStr {
        self.data().remote_identity.clone()
    }
}

/// Session-Expires header for a 2xx we send (RFC 4028 §9 requires the
/// refresher parameter on responses). The token names transaction roles:
/// replying makes us the transaction UAS, so a local refresher is `uas` and
/// a remote one `uac` regardless of who created the dialog.
pub(crate) fn session_expires_reply_header(dialog: &Dialog) -> Option<Header> {
    if !dialog.session_timer.enabled {
        return None;
    }
    let interval = dialog.session_timer.interval?;
    let refresher = if dialog.session_timer.local_refresher {
        "uas"
    } else {
        "uac"
    };
    Some(Header {
        name: SmolStr::new("Session-Expires"),
        value: SmolStr::new(format!("{};refresher={}", interval, refresher)),
    })
}
