// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User-agent façade: owns the registries, routes every incoming request and
//! response to the entity that owns it, and emits the top-level events.
//!
//! Inbound flow: host transaction layer → [`UserAgent::receive_request`] /
//! [`UserAgent::receive_response`] → dialog gatekeeper → owner. Outbound
//! flow: entity builds a request → [`OutboundSink`] → host.

use std::sync::Arc;

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use sip_msg::{extract_tag, Header, Method, Request, Response, SipUri};

use crate::config::UaConfig;
use crate::dialog::{DialogId, DialogOwner, DialogRegistry, SessionTimerState};
use crate::error::Error;
use crate::events::{Emitter, Originator, UaEvent};
use crate::message::{Message, MessageOptions};
use crate::refer::{Refer, ReferId, ReferOptions};
use crate::request::{response_branch, ALLOWED_METHODS};
use crate::session::{CallOptions, Session, SessionId};
use crate::timer::TimerService;
use crate::transaction::{reply_statelessly, OutboundSink, ServerTransaction};

/// Client transactions the core is waiting on, keyed by Via branch.
#[derive(Clone)]
pub(crate) enum PendingClient {
    Invite(Session),
    Reinvite(Session),
    Update(Session),
    Bye(Session),
    Info(Session),
    Cancel(Session),
    ReferRequest(Refer),
    Notify(Refer),
    Message(Message),
}

/// Shared state behind every entity. Entities hold an `Arc` to this and
/// unregister themselves on termination.
pub(crate) struct AgentCore {
    pub(crate) config: UaConfig,
    pub(crate) sink: Arc<dyn OutboundSink>,
    pub(crate) timers: TimerService,
    pub(crate) dialogs: DialogRegistry,
    pub(crate) sessions: DashMap<SessionId, Session>,
    pub(crate) refers: DashMap<ReferId, Refer>,
    pub(crate) pending: DashMap<SmolStr, PendingClient>,
    /// INVITE server transaction branches, for CANCEL routing.
    pub(crate) invite_branches: DashMap<SmolStr, SessionId>,
    pub(crate) events: Emitter<UaEvent>,
}

impl AgentCore {
    pub(crate) fn new_session_timer_state(&self) -> SessionTimerState {
        SessionTimerState::new(
            self.config.session_timers,
            self.config.session_expires,
            self.config.min_session_expires,
        )
    }

    /// Removes a dialog from the registry and disarms its session timer.
    pub(crate) fn terminate_dialog(&self, dialog_id: &DialogId) {
        if let Some(dialog) = self.dialogs.remove(dialog_id) {
            let mut dialog = dialog.lock();
            if let Some(token) = dialog.session_timer.timer.take() {
                self.timers.cancel(token);
            }
        }
    }

    /// (Re)arms the RFC 4028 timer for a dialog from its current sub-state.
    pub(crate) fn arm_session_timer(self: &Arc<Self>, dialog_id: &DialogId) {
        let Some(dialog) = self.dialogs.get(dialog_id) else {
            return;
        };
        let delay = {
            let mut dialog = dialog.lock();
            if let Some(token) = dialog.session_timer.timer.take() {
                self.timers.cancel(token);
            }
            dialog.session_timer.schedule_delay()
        };
        let Some(delay) = delay else {
            return;
        };
        let core = self.clone();
        let fired_id = dialog_id.clone();
        let token = self.timers.schedule(delay, move || {
            core.session_timer_fired(&fired_id);
        });
        dialog.lock().session_timer.timer = Some(token);
    }

    fn session_timer_fired(self: &Arc<Self>, dialog_id: &DialogId) {
        let Some(dialog) = self.dialogs.get(dialog_id) else {
            return;
        };
        let (owner, local_refresher) = {
            let mut dialog = dialog.lock();
            dialog.session_timer.timer = None;
            (dialog.owner.clone(), dialog.session_timer.local_refresher)
        };
        let DialogOwner::Session(session_id) = owner else {
            return;
        };
        let Some(session) = self.sessions.get(&session_id).map(|s| s.clone()) else {
            return;
        };
        if local_refresher {
            session.on_session_refresh();
        } else {
            session.on_session_expired();
        }
    }

    pub(crate) fn emit_new_session(
        &self,
        originator: Originator,
        session: Session,
        request: Request,
    ) {
        self.events.emit(UaEvent::NewSession {
            originator,
            session,
            request,
        });
    }

    pub(crate) fn emit_new_message(
        &self,
        originator: Originator,
        message: Message,
        request: Request,
    ) {
        self.events.emit(UaEvent::NewMessage {
            originator,
            message,
            request,
        });
    }

    pub(crate) fn emit_new_refer(
        &self,
        originator: Originator,
        refer: Refer,
        request: Option<Request>,
    ) {
        self.events.emit(UaEvent::NewRefer {
            originator,
            refer,
            request,
        });
    }
}

/// The user-agent façade.
#[derive(Clone)]
pub struct UserAgent {
    core: Arc<AgentCore>,
}

impl UserAgent {
    pub fn new(config: UaConfig, sink: Arc<dyn OutboundSink>) -> Self {
        Self {
            core: Arc::new(AgentCore {
                config,
                sink,
                timers: TimerService::new(),
                dialogs: DialogRegistry::new(),
                sessions: DashMap::new(),
                refers: DashMap::new(),
                pending: DashMap::new(),
                invite_branches: DashMap::new(),
                events: Emitter::new(),
            }),
        }
    }

    /// Subscribes to top-level events (`NewSession`, `NewMessage`,
    /// `NewRefer`).
    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<UaEvent> {
        self.core.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Outbound API
    // ------------------------------------------------------------------

    /// Starts an outgoing call.
    pub async fn call(&self, target: &str, options: CallOptions) -> Result<Session, Error> {
        let uri =
            SipUri::parse(target).ok_or_else(|| Error::InvalidTarget(target.to_owned()))?;
        Session::connect(self.core.clone(), uri, options).await
    }

    /// Sends a one-shot MESSAGE.
    pub fn send_message(
        &self,
        target: &str,
        body: &str,
        options: MessageOptions,
    ) -> Result<Message, Error> {
        let uri =
            SipUri::parse(target).ok_or_else(|| Error::InvalidTarget(target.to_owned()))?;
        Ok(Message::send(self.core.clone(), uri, body, options))
    }

    /// Sends an out-of-dialog REFER with its implicit subscription.
    pub fn refer(
        &self,
        target: &str,
        refer_to: &str,
        options: ReferOptions,
    ) -> Result<Refer, Error> {
        let target_uri =
            SipUri::parse(target).ok_or_else(|| Error::InvalidTarget(target.to_owned()))?;
        let refer_to_uri = sip_msg::name_addr_uri(refer_to)
            .or_else(|| SipUri::parse(refer_to))
            .ok_or_else(|| Error::InvalidTarget(refer_to.to_owned()))?;
        let refer =
            Refer::send_out_of_dialog(self.core.clone(), target_uri, refer_to_uri, options)?;
        self.core
            .emit_new_refer(Originator::Local, refer.clone(), None);
        Ok(refer)
    }

    // ------------------------------------------------------------------
    // Inbound entry points
    // ------------------------------------------------------------------

    /// Hands an incoming request to its owner.
    pub async fn receive_request(&self, req: Request) {
        let method = req.start.method.clone();
        debug!(method = %method, "incoming request");
        if method == Method::Cancel {
            self.route_cancel(req);
            return;
        }

        let in_dialog = req
            .headers
            .get("To")
            .and_then(|v| extract_tag(v))
            .is_some();
        if in_dialog {
            self.route_in_dialog(req).await;
        } else {
            self.route_out_of_dialog(req).await;
        }
    }

    /// Hands an incoming response to the client transaction owner, matched
    /// by the Via branch the core generated.
    pub async fn receive_response(&self, resp: Response) {
        let Some(branch) = response_branch(&resp) else {
            debug!("response without Via branch dropped");
            return;
        };
        let Some(client) = self.core.pending.get(&branch).map(|e| e.value().clone()) else {
            debug!(branch = %branch, code = resp.start.code, "response matches no client transaction");
            return;
        };
        let is_final = resp.start.code >= 200;
        // The INVITE entry stays for 2xx retransmissions and late forks;
        // everything else completes on the final response.
        if is_final && !matches!(client, PendingClient::Invite(_)) {
            self.core.pending.remove(&branch);
        }

        match client {
            PendingClient::Invite(session) => session.on_invite_response(resp).await,
            PendingClient::Reinvite(session) => session.on_reinvite_response(resp).await,
            PendingClient::Update(session) => session.on_update_response(resp),
            PendingClient::Bye(_) => {}
            PendingClient::Info(session) => session.on_info_response(resp.start.code),
            PendingClient::Cancel(_) => {}
            PendingClient::ReferRequest(refer) => refer.on_refer_response(resp),
            PendingClient::Notify(refer) => refer.on_notify_response(resp),
            PendingClient::Message(message) => message.on_response(resp),
        }
    }

    /// The host's non-INVITE (or INVITE) client transaction timed out.
    pub fn request_timeout(&self, branch: &str) {
        let Some((_, client)) = self.core.pending.remove(branch) else {
            return;
        };
        warn!(branch, "request timeout");
        match client {
            PendingClient::Invite(session)
            | PendingClient::Reinvite(session)
            | PendingClient::Update(session) => session.on_request_timeout(),
            PendingClient::Bye(session) => session.teardown(),
            PendingClient::Info(session) => session.abandon_dtmf(),
            PendingClient::Cancel(_) => {}
            PendingClient::ReferRequest(refer) | PendingClient::Notify(refer) => {
                refer.on_request_timeout()
            }
            PendingClient::Message(message) => message.on_request_timeout(),
        }
    }

    /// The transport failed underneath an outstanding request.
    pub fn transport_error(&self, branch: &str) {
        let Some((_, client)) = self.core.pending.remove(branch) else {
            return;
        };
        warn!(branch, "transport error");
        match client {
            PendingClient::Invite(session)
            | PendingClient::Reinvite(session)
            | PendingClient::Update(session) => session.on_transport_error(),
            PendingClient::Bye(session) => session.teardown(),
            PendingClient::Info(session) => session.abandon_dtmf(),
            PendingClient::Cancel(_) => {}
            PendingClient::ReferRequest(refer) | PendingClient::Notify(refer) => {
                refer.on_transport_error()
            }
            PendingClient::Message(message) => message.on_transport_error(),
        }
    }

    // ------------------------------------------------------------------
    // Routing internals
    // ------------------------------------------------------------------

    fn route_cancel(&self, req: Request) {
        let branch = crate::request::branch_of(&req);
        let session = branch
            .as_ref()
            .and_then(|b| self.core.invite_branches.get(b))
            .and_then(|entry| self.core.sessions.get(entry.value()).map(|s| s.clone()));
        match session {
            Some(session) => {
                let cancel_tx = ServerTransaction::new(req.clone());
                session.on_cancel(req, cancel_tx);
            }
            None => {
                debug!("CANCEL matches no INVITE transaction");
                reply_statelessly(self.core.sink.as_ref(), &req, 481, &[]);
            }
        }
    }

    async fn route_in_dialog(&self, req: Request) {
        let method = req.start.method.clone();
        let Some(dialog) = self.core.dialogs.find_for_request(&req) else {
            if method == Method::Ack {
                debug!("ACK matches no dialog, dropped");
            } else if method == Method::Notify {
                self.route_orphan_notify(req);
            } else {
                reply_statelessly(self.core.sink.as_ref(), &req, 481, &[]);
            }
            return;
        };

        let server_tx =
            (method != Method::Ack).then(|| ServerTransaction::new(req.clone()));
        let verdict = dialog.lock().check_in_dialog_request(
            &req,
            server_tx.as_ref(),
            self.core.sink.as_ref(),
        );
        if verdict == crate::dialog::GateVerdict::Rejected {
            return;
        }
        let owner = dialog.lock().owner.clone();

        match owner {
            DialogOwner::Session(session_id) => {
                let Some(session) = self.core.sessions.get(&session_id).map(|s| s.clone())
                else {
                    if let Some(tx) = server_tx {
                        tx.reply(self.core.sink.as_ref(), 481, None, &[], None);
                    }
                    return;
                };
                session.on_in_dialog_request(req, server_tx).await;
            }
            DialogOwner::Refer(refer_id) => {
                let Some(refer) = self.core.refers.get(&refer_id).map(|r| r.clone()) else {
                    if let Some(tx) = server_tx {
                        tx.reply(self.core.sink.as_ref(), 481, None, &[], None);
                    }
                    return;
                };
                match (method, server_tx) {
                    (Method::Notify, Some(tx)) => refer.on_notify(req, tx),
                    (Method::Subscribe, Some(tx)) => refer.on_subscribe(req, tx),
                    (_, Some(tx)) => {
                        tx.reply(self.core.sink.as_ref(), 405, None, &[allow_header()], None);
                    }
                    (_, None) => {}
                }
            }
        }
    }

    /// NOTIFY carrying a To tag but matching no dialog: the dialog-forming
    /// first NOTIFY of an outgoing REFER, or garbage.
    fn route_orphan_notify(&self, req: Request) {
        let call_id = req.headers.get("Call-ID").cloned().unwrap_or_default();
        let to_tag = req
            .headers
            .get("To")
            .and_then(|v| extract_tag(v))
            .unwrap_or_default();
        let refer = self
            .core
            .refers
            .iter()
            .find(|entry| entry.value().matches_first_notify(&call_id, &to_tag))
            .map(|entry| entry.value().clone());
        match refer {
            Some(refer) => {
                let tx = ServerTransaction::new(req.clone());
                refer.on_first_notify(req, tx);
            }
            None => reply_statelessly(self.core.sink.as_ref(), &req, 481, &[]),
        }
    }

    async fn route_out_of_dialog(&self, req: Request) {
        let method = req.start.method.clone();
        match method {
            Method::Invite => {
                let server_tx = ServerTransaction::new(req.clone());
                Session::init_incoming(self.core.clone(), req, server_tx);
            }
            Method::Message => {
                let server_tx = ServerTransaction::new(req.clone());
                let message = Message::incoming(self.core.clone(), server_tx.clone());
                let auto_reply = self.core.events.subscriber_count() == 0;
                self.core
                    .emit_new_message(Originator::Remote, message.clone(), req);
                if auto_reply && server_tx.is_pending() {
                    server_tx.reply(self.core.sink.as_ref(), 200, None, &[], None);
                    message.mark_replied();
                }
            }
            Method::Refer => {
                let server_tx = ServerTransaction::new(req.clone());
                if let Some(refer) =
                    Refer::init_incoming(self.core.clone(), req.clone(), server_tx)
                {
                    self.core
                        .emit_new_refer(Originator::Remote, refer, Some(req));
                }
            }
            Method::Notify => {
                reply_statelessly(self.core.sink.as_ref(), &req, 481, &[]);
            }
            Method::Ack => {
                debug!("stray out-of-dialog ACK dropped");
            }
            other => {
                debug!(method = %other, "unsupported out-of-dialog method");
                reply_statelessly(self.core.sink.as_ref(), &req, 405, &[allow_header()]);
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection & shutdown
    // ------------------------------------------------------------------

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    pub fn dialog_count(&self) -> usize {
        self.core.dialogs.len()
    }

    pub fn refer_count(&self) -> usize {
        self.core.refers.len()
    }

    pub fn find_session(&self, id: &SessionId) -> Option<Session> {
        self.core.sessions.get(id).map(|s| s.clone())
    }

    /// Terminates every live entity and cancels every timer.
    pub fn close(&self) {
        info!("closing user agent");
        let sessions: Vec<Session> = self
            .core
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            let _ = session.terminate(Default::default());
        }
        let refers: Vec<Refer> = self
            .core
            .refers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for refer in refers {
            refer.close();
        }
        self.core.pending.clear();
        self.core.timers.cancel_all();
    }
}

fn allow_header() -> Header {
    Header {
        name: SmolStr::new("Allow"),
        value: SmolStr::new(ALLOWED_METHODS),
    }
}
