// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REFER with its implicit subscription (RFC 3515, RFC 4488) and the NOTIFY
//! traffic that reports transfer progress as `message/sipfrag`.
//!
//! Two flavors share this type. An *out-of-dialog* refer owns its dialog:
//! outgoing, the dialog is formed by the first NOTIFY; incoming, by our 202.
//! An *in-dialog* refer borrows its session's dialog and must never
//! terminate it; concurrent in-dialog refers are told apart by the
//! `Event: refer;id=<cseq>` parameter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sip_msg::{
    EventHeader, Header, Method, Request, Response, SipFrag, SipUri, SubscriptionState,
    SubscriptionStateHeader, TargetDialog,
};

use crate::agent::{AgentCore, PendingClient};
use crate::cause::Cause;
use crate::dialog::{Dialog, DialogId, DialogOwner, DialogState};
use crate::error::Error;
use crate::events::{Emitter, NotifyKind, Originator, ReferEvent};
use crate::request::{
    branch_of, contact_value, generate_call_id, generate_tag, local_from_value,
    out_of_dialog_request, set_body,
};
use crate::session::{CallOptions, Direction, Session, SessionId};
use crate::timer::{TimerToken, T4, TIMER_64T1};
use crate::transaction::ServerTransaction;

/// Stable refer key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferId(SmolStr);

impl ReferId {
    pub fn new(raw: impl Into<SmolStr>) -> Self {
        Self(raw.into())
    }

    fn from_parts(call_id: &str, tag: &str, event_id: Option<&str>) -> Self {
        match event_id {
            Some(id) => Self(SmolStr::new(format!("{}{}refer{}", call_id, tag, id))),
            None => Self(SmolStr::new(format!("{}{}", call_id, tag))),
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for ReferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for sending a REFER.
#[derive(Default)]
pub struct ReferOptions {
    pub extra_headers: Vec<Header>,
    /// Session whose dialog a Target-Dialog header should name. Forces
    /// `Require: tdialog`.
    pub target_session: Option<Session>,
}

/// Options for [`Refer::notify`].
#[derive(Default)]
pub struct NotifyOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    /// Raw sipfrag body override.
    pub body: Option<String>,
    pub final_notify: bool,
    /// Subscription-State reason on the final NOTIFY (default `noresource`).
    pub terminate_reason: Option<String>,
    pub extra_headers: Vec<Header>,
}

/// Handle to a refer subscription. Cheap to clone.
#[derive(Clone)]
pub struct Refer {
    inner: Arc<ReferInner>,
}

struct ReferInner {
    id: ReferId,
    core: Arc<AgentCore>,
    direction: Direction,
    in_dialog: bool,
    owner_session: Option<SessionId>,
    events: Emitter<ReferEvent>,
    state: Mutex<ReferData>,
}

struct ReferData {
    subscription: SubscriptionState,
    dialog: Option<DialogId>,
    owns_dialog: bool,
    event_id: Option<SmolStr>,
    refer_request: Option<Request>,
    last_notify: Option<SipFrag>,
    notify_wait: Option<TimerToken>,
    expiry: Option<TimerToken>,
    expires_secs: u32,
    deadline: Option<Instant>,
    target_session: Option<SessionId>,
    closed: bool,
}

impl ReferData {
    fn new(expires_secs: u32) -> Self {
        Self {
            subscription: SubscriptionState::Pending,
            dialog: None,
            owns_dialog: false,
            event_id: None,
            refer_request: None,
            last_notify: None,
            notify_wait: None,
            expiry: None,
            expires_secs,
            deadline: None,
            target_session: None,
            closed: false,
        }
    }
}

impl Refer {
    // ------------------------------------------------------------------
    // Outgoing, out-of-dialog
    // ------------------------------------------------------------------

    /// Sends an out-of-dialog REFER. The implicit subscription stays pending
    /// until the 2xx; the dialog is formed by the first NOTIFY.
    pub(crate) fn send_out_of_dialog(
        core: Arc<AgentCore>,
        target: SipUri,
        refer_to: SipUri,
        options: ReferOptions,
    ) -> Result<Refer, Error> {
        let call_id = generate_call_id();
        let local_tag = generate_tag();
        let id = ReferId::from_parts(&call_id, &local_tag, None);

        let mut extra = vec![
            Header {
                name: SmolStr::new("Refer-To"),
                value: SmolStr::new(format!("<{}>", refer_to)),
            },
            Header {
                name: SmolStr::new("Contact"),
                value: contact_value(&core.config),
            },
        ];
        if let Some(session) = &options.target_session {
            let Some(dialog_id) = session.dialog_id() else {
                return Err(Error::invalid_state("refer", "target session has no dialog"));
            };
            let td = TargetDialog::new(
                dialog_id.call_id.clone(),
                dialog_id.local_tag.clone(),
                dialog_id.remote_tag.clone(),
            );
            extra.push(Header {
                name: SmolStr::new("Target-Dialog"),
                value: SmolStr::new(td.to_string()),
            });
            extra.push(Header {
                name: SmolStr::new("Require"),
                value: SmolStr::new(sip_msg::target_dialog::TDIALOG),
            });
        }
        extra.extend(options.extra_headers);

        let from_value = local_from_value(&core.config, &local_tag, false);
        let to_value = SmolStr::new(format!("<{}>", target));
        let request = out_of_dialog_request(
            Method::Refer,
            &target,
            from_value,
            to_value,
            call_id.clone(),
            1,
            &extra,
        );

        let refer = Refer {
            inner: Arc::new(ReferInner {
                id: id.clone(),
                core: core.clone(),
                direction: Direction::Outgoing,
                in_dialog: false,
                owner_session: None,
                events: Emitter::new(),
                state: Mutex::new(ReferData::new(core.config.refer_expires)),
            }),
        };
        {
            let mut data = refer.data();
            data.refer_request = Some(request.clone());
            data.target_session = options.target_session.map(|s| s.id());
        }

        core.refers.insert(id.clone(), refer.clone());
        if let Some(branch) = branch_of(&request) {
            core.pending
                .insert(branch, PendingClient::ReferRequest(refer.clone()));
        }
        info!(refer = %id, target = %request.start.uri, "outgoing REFER");
        core.sink.send_request(request);
        Ok(refer)
    }

    /// Starts an in-dialog REFER on the owner session's dialog.
    pub(crate) fn send_in_dialog(
        session: &Session,
        refer_to: &str,
        extra_headers: Vec<Header>,
    ) -> Result<Refer, Error> {
        let refer_to_uri = sip_msg::name_addr_uri(refer_to)
            .or_else(|| SipUri::parse(refer_to))
            .ok_or_else(|| Error::InvalidTarget(refer_to.to_owned()))?;

        let core = session.core().clone();
        let mut extra = vec![
            Header {
                name: SmolStr::new("Refer-To"),
                value: SmolStr::new(format!("<{}>", refer_to_uri)),
            },
            session.contact_header(),
        ];
        extra.extend(extra_headers);

        let request = session
            .with_dialog(|dialog| dialog.create_request(Method::Refer, &extra))
            .ok_or(Error::invalid_state("refer", "no dialog"))?;
        let cseq = request.cseq_number().unwrap_or_default().to_string();

        let dialog_id = session.dialog_id();
        let id = ReferId::from_parts(
            request.headers.get("Call-ID").map(|v| v.as_str()).unwrap_or_default(),
            dialog_id
                .as_ref()
                .map(|d| d.local_tag.as_str())
                .unwrap_or_default(),
            Some(&cseq),
        );

        let refer = Refer {
            inner: Arc::new(ReferInner {
                id: id.clone(),
                core: core.clone(),
                direction: Direction::Outgoing,
                in_dialog: true,
                owner_session: Some(session.id()),
                events: Emitter::new(),
                state: Mutex::new(ReferData::new(core.config.refer_expires)),
            }),
        };
        {
            let mut data = refer.data();
            data.refer_request = Some(request.clone());
            data.dialog = dialog_id;
            data.owns_dialog = false;
            data.event_id = Some(SmolStr::new(cseq));
        }

        core.refers.insert(id.clone(), refer.clone());
        if let Some(branch) = branch_of(&request) {
            core.pending
                .insert(branch, PendingClient::ReferRequest(refer.clone()));
        }
        info!(refer = %id, "in-dialog REFER");
        core.sink.send_request(request);
        Ok(refer)
    }

    pub(crate) fn on_refer_response(&self, resp: Response) {
        let code = resp.start.code;
        if code < 200 {
            return;
        }
        if (200..300).contains(&code) {
            if self.data().closed {
                return;
            }
            info!(refer = %self.inner.id, "REFER accepted");
            self.emit(ReferEvent::Accepted { response: resp });
            // Timer F guards the arrival of the first NOTIFY.
            let refer = self.clone();
            let token = self.core().timers.schedule(TIMER_64T1, move || {
                refer.on_notify_timeout();
            });
            self.data().notify_wait = Some(token);
        } else {
            debug!(refer = %self.inner.id, code, "REFER rejected");
            self.emit(ReferEvent::Failed {
                originator: Originator::Remote,
                message: Some(resp.into()),
                cause: Cause::from_status(code),
            });
            self.close_internal(false);
        }
    }

    /// Timer F fired with no NOTIFY at all: synthesize a `100 Trying` final
    /// notify so listeners see a terminal event, then close.
    fn on_notify_timeout(&self) {
        {
            let data = self.data();
            if data.closed || data.dialog.is_some() {
                return;
            }
        }
        warn!(refer = %self.inner.id, "no NOTIFY after accepted REFER");
        let frag = SipFrag::new(100, None);
        self.data().last_notify = Some(frag.clone());
        self.emit(ReferEvent::Notify {
            originator: Originator::System,
            kind: NotifyKind::Progress,
            frag,
            request: None,
            final_notify: true,
        });
        self.close_internal(false);
    }

    /// First NOTIFY of an out-of-dialog refer: forms the dialog
    /// (remote tag = the NOTIFY's From tag), then processes normally.
    pub(crate) fn on_first_notify(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        if self.data().dialog.is_none() {
            let local_tag = sip_msg::extract_tag(
                req.headers.get("To").map(|v| v.as_str()).unwrap_or(""),
            )
            .unwrap_or_else(generate_tag);
            match Dialog::new_uas(
                &req,
                local_tag,
                DialogOwner::Refer(self.inner.id.clone()),
                DialogState::Confirmed,
            ) {
                Ok(dialog) => {
                    let dialog_id = dialog.id.clone();
                    self.core().dialogs.insert(dialog);
                    let mut data = self.data();
                    data.dialog = Some(dialog_id);
                    data.owns_dialog = true;
                    let core = self.core().clone();
                    core.timers.clear(&mut data.notify_wait);
                }
                Err(err) => {
                    debug!(refer = %self.inner.id, %err, "NOTIFY cannot form dialog");
                    server_tx.reply(self.core().sink.as_ref(), 400, None, &[], None);
                    return;
                }
            }
        }
        self.on_notify(req, server_tx);
    }

    /// Common NOTIFY reception (RFC 3515 §2.4.4 plus RFC 6665 framing).
    pub(crate) fn on_notify(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        if self.data().closed {
            server_tx.reply(self.core().sink.as_ref(), 481, None, &[], None);
            return;
        }

        let Some(event) = req.headers.get("Event").and_then(|v| EventHeader::parse(v)) else {
            server_tx.reply(self.core().sink.as_ref(), 400, None, &[], None);
            return;
        };
        if !event.package.eq_ignore_ascii_case("refer") {
            server_tx.reply(self.core().sink.as_ref(), 489, None, &[], None);
            return;
        }
        if self.inner.in_dialog && event.id != self.data().event_id {
            server_tx.reply(self.core().sink.as_ref(), 481, None, &[], None);
            return;
        }

        let Some(sub_state) = req
            .headers
            .get("Subscription-State")
            .and_then(|v| SubscriptionStateHeader::parse(v))
        else {
            server_tx.reply(self.core().sink.as_ref(), 400, None, &[], None);
            return;
        };

        let frag = if req.has_body() {
            let sipfrag_type = req
                .headers
                .get("Content-Type")
                .map(|ct| ct.as_str().to_ascii_lowercase().starts_with("message/sipfrag"))
                .unwrap_or(false);
            if !sipfrag_type {
                server_tx.reply(self.core().sink.as_ref(), 415, None, &[], None);
                return;
            }
            let body = String::from_utf8_lossy(&req.body).into_owned();
            match SipFrag::parse(&body) {
                Some(frag) => Some(frag),
                None => {
                    server_tx.reply(self.core().sink.as_ref(), 400, None, &[], None);
                    return;
                }
            }
        } else {
            None
        };

        // A subscription nobody listens to is useless: decline and detach.
        if self.subscriber_count() == 0 && self.inner.direction == Direction::Outgoing {
            debug!(refer = %self.inner.id, "no notify listeners, declining");
            server_tx.reply(self.core().sink.as_ref(), 603, None, &[], None);
            self.unsubscribe();
            self.close_internal(true);
            return;
        }

        server_tx.reply(self.core().sink.as_ref(), 200, None, &[], None);

        let terminated = sub_state.state == SubscriptionState::Terminated;
        {
            let mut data = self.data();
            data.subscription = sub_state.state;
            if let Some(frag) = &frag {
                data.last_notify = Some(frag.clone());
            }
        }

        if let Some(frag) = frag {
            self.emit(ReferEvent::Notify {
                originator: Originator::Remote,
                kind: NotifyKind::from_status(frag.code),
                frag,
                request: Some(req),
                final_notify: terminated,
            });
        }

        if terminated {
            self.close_internal(false);
        } else {
            let expires = sub_state.expires.unwrap_or(self.data().expires_secs);
            self.arm_expiry(Duration::from_secs(u64::from(expires)) + T4);
        }
    }

    /// Sends `SUBSCRIBE;Expires=0` on the subscription's dialog.
    fn unsubscribe(&self) {
        let event_value = self.event_header_value();
        let request = self.with_dialog(|dialog| {
            dialog.create_request(
                Method::Subscribe,
                &[
                    Header {
                        name: SmolStr::new("Event"),
                        value: event_value.clone(),
                    },
                    Header {
                        name: SmolStr::new("Expires"),
                        value: SmolStr::new("0"),
                    },
                ],
            )
        });
        if let Some(request) = request {
            self.core().sink.send_request(request);
        }
    }

    // ------------------------------------------------------------------
    // Incoming (we are the notifier)
    // ------------------------------------------------------------------

    /// Accepts an incoming out-of-dialog REFER: 202, subscription Active,
    /// initial `100 Trying` NOTIFY.
    pub(crate) fn init_incoming(
        core: Arc<AgentCore>,
        req: Request,
        server_tx: Arc<ServerTransaction>,
    ) -> Option<Refer> {
        if req.headers.count("Refer-To") != 1 {
            server_tx.reply(core.sink.as_ref(), 400, None, &[], None);
            return None;
        }
        // REFER implies the refer package; a contradictory Event is a bad one.
        if let Some(event) = req.headers.get("Event").and_then(|v| EventHeader::parse(v)) {
            if !event.package.eq_ignore_ascii_case("refer") {
                server_tx.reply(core.sink.as_ref(), 489, None, &[], None);
                return None;
            }
        }

        // RFC 4538: resolve and sanity-check the named dialog.
        let mut target_session = None;
        if let Some(raw) = req.headers.get("Target-Dialog") {
            let Some(td) = TargetDialog::parse(raw) else {
                server_tx.reply(core.sink.as_ref(), 400, None, &[], None);
                return None;
            };
            let Some(dialog) = core.dialogs.find_target_dialog(&td) else {
                server_tx.reply(core.sink.as_ref(), 481, None, &[], None);
                return None;
            };
            let owner = dialog.lock().owner.clone();
            match owner {
                DialogOwner::Session(session_id) => target_session = Some(session_id),
                DialogOwner::Refer(_) => {
                    server_tx.reply(core.sink.as_ref(), 481, None, &[], None);
                    return None;
                }
            }
        }

        let call_id = req.headers.get("Call-ID")?.clone();
        let remote_tag = req.headers.get("From").and_then(|v| sip_msg::extract_tag(v))?;
        let local_tag = generate_tag();
        server_tx.set_to_tag(local_tag.clone());
        let id = ReferId::from_parts(&call_id, &remote_tag, None);

        let refer = Refer {
            inner: Arc::new(ReferInner {
                id: id.clone(),
                core: core.clone(),
                direction: Direction::Incoming,
                in_dialog: false,
                owner_session: None,
                events: Emitter::new(),
                state: Mutex::new(ReferData::new(core.config.refer_expires)),
            }),
        };

        let dialog = match Dialog::new_uas(
            &req,
            local_tag,
            DialogOwner::Refer(id.clone()),
            DialogState::Confirmed,
        ) {
            Ok(dialog) => dialog,
            Err(err) => {
                debug!(refer = %id, %err, "REFER cannot form dialog");
                server_tx.reply(core.sink.as_ref(), 400, None, &[], None);
                return None;
            }
        };
        let dialog_id = dialog.id.clone();
        core.dialogs.insert(dialog);

        let expires = core.config.refer_expires;
        {
            let mut data = refer.data();
            data.dialog = Some(dialog_id);
            data.owns_dialog = true;
            data.refer_request = Some(req.clone());
            data.subscription = SubscriptionState::Active;
            data.deadline = Some(Instant::now() + Duration::from_secs(u64::from(expires)));
            data.target_session = target_session;
        }
        core.refers.insert(id.clone(), refer.clone());

        let contact = Header {
            name: SmolStr::new("Contact"),
            value: contact_value(&core.config),
        };
        server_tx.reply(core.sink.as_ref(), 202, None, &[contact], None);
        refer.send_notify_frag(SipFrag::new(100, None), false, None);
        refer.arm_expiry(Duration::from_secs(u64::from(expires)));

        info!(refer = %id, "incoming REFER accepted");
        Some(refer)
    }

    /// Accepts an incoming in-dialog REFER on the session's dialog.
    pub(crate) fn init_in_dialog_incoming(
        session: &Session,
        req: &Request,
        server_tx: &Arc<ServerTransaction>,
    ) -> Option<Refer> {
        let core = session.core().clone();
        if req.headers.count("Refer-To") != 1 {
            server_tx.reply(core.sink.as_ref(), 400, None, &[], None);
            return None;
        }
        let dialog_id = session.dialog_id()?;
        let event_id = SmolStr::new(req.cseq_number().unwrap_or_default().to_string());
        let id = ReferId::from_parts(&dialog_id.call_id, &dialog_id.local_tag, Some(&event_id));

        let refer = Refer {
            inner: Arc::new(ReferInner {
                id: id.clone(),
                core: core.clone(),
                direction: Direction::Incoming,
                in_dialog: true,
                owner_session: Some(session.id()),
                events: Emitter::new(),
                state: Mutex::new(ReferData::new(core.config.refer_expires)),
            }),
        };
        let expires = core.config.refer_expires;
        {
            let mut data = refer.data();
            data.dialog = Some(dialog_id);
            data.owns_dialog = false;
            data.event_id = Some(event_id);
            data.refer_request = Some(req.clone());
            data.subscription = SubscriptionState::Active;
            data.deadline = Some(Instant::now() + Duration::from_secs(u64::from(expires)));
        }
        core.refers.insert(id.clone(), refer.clone());

        let contact = session.contact_header();
        server_tx.reply(core.sink.as_ref(), 202, None, &[contact], None);
        refer.send_notify_frag(SipFrag::new(100, None), false, None);
        refer.arm_expiry(Duration::from_secs(u64::from(expires)));

        info!(refer = %id, "incoming in-dialog REFER accepted");
        Some(refer)
    }

    /// Calls the refer-to target and wires the new session's progress,
    /// started, and failed events into automatic NOTIFYs. `started` and
    /// `failed` also close the subscription.
    pub async fn call(&self, options: CallOptions) -> Result<Session, Error> {
        if self.inner.direction != Direction::Incoming {
            return Err(Error::invalid_state("call", "outgoing refer"));
        }
        if self.data().closed {
            return Err(Error::invalid_state("call", "closed"));
        }
        let refer_to = {
            let data = self.data();
            data.refer_request
                .as_ref()
                .and_then(|req| req.headers.get("Refer-To").cloned())
                .ok_or(Error::MissingHeader("Refer-To"))?
        };
        let uri = sip_msg::name_addr_uri(&refer_to)
            .ok_or_else(|| Error::InvalidTarget(refer_to.to_string()))?;

        let session = Session::connect(self.core().clone(), uri, options).await?;

        let refer = self.clone();
        let mut events = session.events();
        tokio::spawn(async move {
            use crate::events::SessionEvent;
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Progress { response, .. } => {
                        let code = response.map(|r| r.start.code).unwrap_or(180).max(100);
                        refer.send_notify_frag(SipFrag::new(code, None), false, None);
                    }
                    SessionEvent::Started { .. } => {
                        refer.send_notify_frag(SipFrag::new(200, None), true, None);
                        refer.close_internal(false);
                        break;
                    }
                    SessionEvent::Failed { message, .. } => {
                        let code = message
                            .as_ref()
                            .and_then(|m| m.as_response())
                            .map(|r| r.start.code)
                            .unwrap_or(487);
                        refer.send_notify_frag(SipFrag::new(code, None), true, None);
                        refer.close_internal(false);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(session)
    }

    /// Application-driven NOTIFY. Ignored unless the subscription is Active.
    pub fn notify(&self, options: NotifyOptions) -> Result<(), Error> {
        if self.inner.direction != Direction::Incoming {
            return Err(Error::invalid_state("notify", "outgoing refer"));
        }
        {
            let data = self.data();
            if data.closed || data.subscription != SubscriptionState::Active {
                debug!(refer = %self.inner.id, "notify ignored, subscription not active");
                return Ok(());
            }
        }
        let code = options.status_code.unwrap_or(200);
        if !(100..700).contains(&code) {
            return Err(Error::InvalidStatus(code));
        }
        let frag = match &options.body {
            Some(body) => {
                SipFrag::parse(body).ok_or_else(|| Error::InvalidArgument("not a sipfrag".into()))?
            }
            None => SipFrag::new(code, options.reason_phrase.as_deref()),
        };
        self.send_notify_frag(
            frag,
            options.final_notify,
            options.terminate_reason.as_deref(),
        );
        if options.final_notify {
            self.close_internal(false);
        }
        Ok(())
    }

    /// Builds and sends one NOTIFY with a sipfrag body on the subscription's
    /// dialog. Final notifies flip the subscription to Terminated.
    fn send_notify_frag(&self, frag: SipFrag, final_notify: bool, terminate_reason: Option<&str>) {
        let state_value = if final_notify {
            let reason = terminate_reason.unwrap_or("noresource");
            self.data().subscription = SubscriptionState::Terminated;
            SubscriptionStateHeader::terminated(reason)
        } else {
            let remaining = self.remaining_secs();
            SubscriptionStateHeader::active(remaining)
        };
        let event_value = self.event_header_value();

        let request = self.with_dialog(|dialog| {
            let mut req = dialog.create_request(
                Method::Notify,
                &[
                    Header {
                        name: SmolStr::new("Event"),
                        value: event_value.clone(),
                    },
                    Header {
                        name: SmolStr::new("Subscription-State"),
                        value: state_value.clone(),
                    },
                    Header {
                        name: SmolStr::new("Contact"),
                        value: contact_value(&self.core().config),
                    },
                ],
            );
            set_body(&mut req, "message/sipfrag", &frag.to_string());
            req
        });
        let Some(request) = request else {
            return;
        };
        self.data().last_notify = Some(frag);
        if let Some(branch) = branch_of(&request) {
            self.core()
                .pending
                .insert(branch, PendingClient::Notify(self.clone()));
        }
        self.core().sink.send_request(request);
    }

    /// Incoming SUBSCRIBE on the subscription's dialog (RFC 6665 refresh or
    /// unsubscribe).
    pub(crate) fn on_subscribe(&self, req: Request, server_tx: Arc<ServerTransaction>) {
        if self.data().closed || self.data().subscription == SubscriptionState::Terminated {
            server_tx.reply(self.core().sink.as_ref(), 481, None, &[], None);
            return;
        }
        let expires = req.headers.get("Expires").and_then(|v| v.parse::<u32>().ok());
        let granted = match expires {
            Some(0) => {
                let header = Header {
                    name: SmolStr::new("Expires"),
                    value: SmolStr::new("0"),
                };
                server_tx.reply(self.core().sink.as_ref(), 200, None, &[header], None);
                let frag = self.data().last_notify.clone().unwrap_or_else(|| SipFrag::new(200, None));
                self.send_notify_frag(frag, true, None);
                self.close_internal(false);
                return;
            }
            Some(secs) => secs,
            None => self.core().config.refer_expires,
        };
        {
            let mut data = self.data();
            data.expires_secs = granted;
            data.deadline = Some(Instant::now() + Duration::from_secs(u64::from(granted)));
        }
        let header = Header {
            name: SmolStr::new("Expires"),
            value: SmolStr::new(granted.to_string()),
        };
        server_tx.reply(self.core().sink.as_ref(), 200, None, &[header], None);
        self.arm_expiry(Duration::from_secs(u64::from(granted)));
        debug!(refer = %self.inner.id, granted, "subscription refreshed");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn id(&self) -> ReferId {
        self.inner.id.clone()
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.data().subscription
    }

    /// The session named by the REFER's Target-Dialog header, if any.
    pub fn target_session(&self) -> Option<SessionId> {
        self.data().target_session.clone()
    }

    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<ReferEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn event_id(&self) -> Option<SmolStr> {
        self.data().event_id.clone()
    }

    fn event_header_value(&self) -> SmolStr {
        match self.data().event_id.as_ref() {
            Some(id) => SmolStr::new(format!("refer;id={}", id)),
            None => SmolStr::new("refer"),
        }
    }

    /// Closes the subscription. An active incoming subscription first sends
    /// a terminating NOTIFY; an active outgoing one synthesizes a final
    /// notify event for its listeners.
    pub fn close(&self) {
        let (closed, active) = {
            let data = self.data();
            (data.closed, data.subscription == SubscriptionState::Active)
        };
        if closed {
            return;
        }
        match self.inner.direction {
            Direction::Incoming if active => {
                let frag = self
                    .data()
                    .last_notify
                    .clone()
                    .unwrap_or_else(|| SipFrag::new(200, None));
                self.send_notify_frag(frag, true, None);
            }
            Direction::Outgoing if active => {
                let frag = self
                    .data()
                    .last_notify
                    .clone()
                    .unwrap_or_else(|| SipFrag::new(100, None));
                self.emit(ReferEvent::Notify {
                    originator: Originator::Local,
                    kind: NotifyKind::from_status(frag.code),
                    frag,
                    request: None,
                    final_notify: true,
                });
            }
            _ => {}
        }
        self.close_internal(false);
    }

    /// Tears state down. Terminated is absorbing: nothing transitions out.
    pub(crate) fn close_internal(&self, _already_replied: bool) {
        let (dialog, owns_dialog) = {
            let mut data = self.data();
            if data.closed {
                return;
            }
            data.closed = true;
            data.subscription = SubscriptionState::Terminated;
            let core = self.core().clone();
            core.timers.clear(&mut data.notify_wait);
            core.timers.clear(&mut data.expiry);
            (data.dialog.take(), data.owns_dialog)
        };
        if owns_dialog {
            if let Some(dialog_id) = dialog {
                self.core().terminate_dialog(&dialog_id);
            }
        }
        if let Some(session_id) = &self.inner.owner_session {
            if let Some(session) = self.core().sessions.get(session_id) {
                session.drop_refer(&self.inner.id);
            }
        }
        self.core().refers.remove(&self.inner.id);
        debug!(refer = %self.inner.id, "refer closed");
    }

    /// The owning session is going away; the dialog will die with it.
    pub(crate) fn on_session_terminated(&self) {
        let active = {
            let data = self.data();
            !data.closed && data.subscription == SubscriptionState::Active
        };
        if active && self.inner.direction == Direction::Incoming {
            let frag = self
                .data()
                .last_notify
                .clone()
                .unwrap_or_else(|| SipFrag::new(487, None));
            self.send_notify_frag(frag, true, None);
        }
        self.close_internal(false);
    }

    // ------------------------------------------------------------------
    // Failure plumbing
    // ------------------------------------------------------------------

    pub(crate) fn on_notify_response(&self, resp: Response) {
        let code = resp.start.code;
        if code >= 300 {
            debug!(refer = %self.inner.id, code, "NOTIFY rejected, closing subscription");
            self.close_internal(false);
        }
    }

    pub(crate) fn on_request_timeout(&self) {
        self.emit(ReferEvent::Failed {
            originator: Originator::System,
            message: None,
            cause: Cause::RequestTimeout,
        });
        self.close_internal(false);
    }

    pub(crate) fn on_transport_error(&self) {
        self.emit(ReferEvent::Failed {
            originator: Originator::System,
            message: None,
            cause: Cause::ConnectionError,
        });
        self.close_internal(false);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn data(&self) -> parking_lot::MutexGuard<'_, ReferData> {
        self.inner.state.lock()
    }

    fn core(&self) -> &Arc<AgentCore> {
        &self.inner.core
    }

    fn emit(&self, event: ReferEvent) {
        self.inner.events.emit(event);
    }

    fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    fn with_dialog<R>(&self, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        let dialog_id = self.data().dialog.clone()?;
        let dialog = self.core().dialogs.get(&dialog_id)?;
        let mut dialog = dialog.lock();
        Some(f(&mut dialog))
    }

    fn remaining_secs(&self) -> u32 {
        let data = self.data();
        match data.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    (deadline - now).as_secs() as u32
                } else {
                    0
                }
            }
            None => data.expires_secs,
        }
    }

    fn arm_expiry(&self, delay: Duration) {
        let refer = self.clone();
        let core = self.core().clone();
        let mut data = self.data();
        core.timers.clear(&mut data.expiry);
        let token = core.timers.schedule(delay, move || {
            refer.on_subscription_expired();
        });
        data.expiry = Some(token);
    }

    fn on_subscription_expired(&self) {
        let active = {
            let data = self.data();
            !data.closed
        };
        if !active {
            return;
        }
        info!(refer = %self.inner.id, "subscription expired");
        match self.inner.direction {
            Direction::Incoming => {
                let frag = self
                    .data()
                    .last_notify
                    .clone()
                    .unwrap_or_else(|| SipFrag::new(200, None));
                self.send_notify_frag(frag, true, Some("timeout"));
            }
            Direction::Outgoing => {
                self.emit(ReferEvent::Failed {
                    originator: Originator::System,
                    message: None,
                    cause: Cause::Expires,
                });
            }
        }
        self.close_internal(false);
    }

    /// Whether this refer is still waiting for its dialog-forming NOTIFY and
    /// matches the given request identity.
    pub(crate) fn matches_first_notify(&self, call_id: &str, to_tag: &str) -> bool {
        let data = self.data();
        if data.closed || data.dialog.is_some() || self.inner.direction != Direction::Outgoing {
            return false;
        }
        data.refer_request
            .as_ref()
            .map(|req| {
                let same_call = req
                    .headers
                    .get("Call-ID")
                    .map(|v| v.as_str() == call_id)
                    .unwrap_or(false);
                let our_tag = req
                    .headers
                    .get("From")
                    .and_then(|v| sip_msg::extract_tag(v))
                    .map(|tag| tag.as_str() == to_tag)
                    .unwrap_or(false);
                same_call && our_tag
            })
            .unwrap_or(false)
    }
}
