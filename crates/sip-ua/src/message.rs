// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One-shot out-of-dialog MESSAGE: a transient object around a single
//! client or server transaction. No dialog ever forms.

use std::sync::Arc;

use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, info};

use sip_msg::{Header, Method, Request, Response, SipUri};

use crate::agent::{AgentCore, PendingClient};
use crate::cause::Cause;
use crate::error::Error;
use crate::events::{Emitter, MessageEvent, Originator};
use crate::request::{
    branch_of, generate_call_id, generate_tag, local_from_value, out_of_dialog_request, set_body,
};
use crate::session::Direction;
use crate::transaction::ServerTransaction;

/// Options for [`UserAgent::send_message`](crate::agent::UserAgent::send_message).
pub struct MessageOptions {
    pub content_type: String,
    pub extra_headers: Vec<Header>,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            content_type: "text/plain".to_owned(),
            extra_headers: Vec::new(),
        }
    }
}

/// Options for answering an incoming MESSAGE.
#[derive(Default)]
pub struct ReplyOptions {
    pub status_code: Option<u16>,
    pub reason_phrase: Option<String>,
    pub extra_headers: Vec<Header>,
}

/// Handle to a one-shot MESSAGE, either direction. Cheap to clone.
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").finish_non_exhaustive()
    }
}

struct MessageInner {
    core: Arc<AgentCore>,
    direction: Direction,
    events: Emitter<MessageEvent>,
    state: Mutex<MessageData>,
}

struct MessageData {
    request: Option<Request>,
    server_tx: Option<Arc<ServerTransaction>>,
    branch: Option<SmolStr>,
    replied: bool,
    done: bool,
}

impl Message {
    /// Builds and sends an outgoing MESSAGE, registering it for response
    /// routing.
    pub(crate) fn send(
        core: Arc<AgentCore>,
        target: SipUri,
        body: &str,
        options: MessageOptions,
    ) -> Message {
        let call_id = generate_call_id();
        let local_tag = generate_tag();
        let from_value = local_from_value(&core.config, &local_tag, false);
        let to_value = SmolStr::new(format!("<{}>", target));

        let mut request = out_of_dialog_request(
            Method::Message,
            &target,
            from_value,
            to_value,
            call_id,
            1,
            &options.extra_headers,
        );
        set_body(&mut request, &options.content_type, body);
        let branch = branch_of(&request);

        let message = Message {
            inner: Arc::new(MessageInner {
                core: core.clone(),
                direction: Direction::Outgoing,
                events: Emitter::new(),
                state: Mutex::new(MessageData {
                    request: Some(request.clone()),
                    server_tx: None,
                    branch: branch.clone(),
                    replied: false,
                    done: false,
                }),
            }),
        };

        if let Some(branch) = branch {
            core.pending
                .insert(branch, PendingClient::Message(message.clone()));
        }
        core.emit_new_message(Originator::Local, message.clone(), request.clone());
        info!(target = %request.start.uri, "outgoing MESSAGE");
        core.sink.send_request(request);
        message
    }

    /// Wraps an incoming MESSAGE. The agent auto-replies 200 only when the
    /// application has no listeners; otherwise `accept`/`reject` decide,
    /// guarded by the mirrored transaction still being unanswered.
    pub(crate) fn incoming(core: Arc<AgentCore>, server_tx: Arc<ServerTransaction>) -> Message {
        Message {
            inner: Arc::new(MessageInner {
                core,
                direction: Direction::Incoming,
                events: Emitter::new(),
                state: Mutex::new(MessageData {
                    request: Some(server_tx.request.clone()),
                    server_tx: Some(server_tx),
                    branch: None,
                    replied: false,
                    done: false,
                }),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The request this entity was created from or for.
    pub fn request(&self) -> Option<Request> {
        self.inner.state.lock().request.clone()
    }

    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<MessageEvent> {
        self.inner.events.subscribe()
    }

    /// Accepts an incoming MESSAGE with a 2xx.
    pub fn accept(&self, options: ReplyOptions) -> Result<(), Error> {
        let status = options.status_code.unwrap_or(200);
        if !(200..300).contains(&status) {
            return Err(Error::InvalidStatus(status));
        }
        self.reply(status, options)
    }

    /// Rejects an incoming MESSAGE with a 3xx–6xx.
    pub fn reject(&self, options: ReplyOptions) -> Result<(), Error> {
        let status = options.status_code.unwrap_or(480);
        if !(300..700).contains(&status) {
            return Err(Error::InvalidStatus(status));
        }
        self.reply(status, options)
    }

    fn reply(&self, status: u16, options: ReplyOptions) -> Result<(), Error> {
        if self.inner.direction != Direction::Incoming {
            return Err(Error::invalid_state("reply", "outgoing message"));
        }
        let server_tx = {
            let mut data = self.inner.state.lock();
            if data.replied {
                return Err(Error::AlreadyReplied);
            }
            let Some(tx) = data.server_tx.clone() else {
                return Err(Error::invalid_state("reply", "no transaction"));
            };
            if !tx.is_pending() {
                data.replied = true;
                return Err(Error::AlreadyReplied);
            }
            data.replied = true;
            tx
        };
        server_tx.reply(
            self.inner.core.sink.as_ref(),
            status,
            options.reason_phrase.as_deref(),
            &options.extra_headers,
            None,
        );
        Ok(())
    }

    /// Marks an incoming MESSAGE as auto-replied by the agent.
    pub(crate) fn mark_replied(&self) {
        self.inner.state.lock().replied = true;
    }

    pub(crate) fn on_response(&self, resp: Response) {
        let code = resp.start.code;
        if code < 200 {
            // Provisionals are ignored for MESSAGE.
            return;
        }
        {
            let mut data = self.inner.state.lock();
            if data.done {
                return;
            }
            data.done = true;
            if let Some(branch) = data.branch.take() {
                self.inner.core.pending.remove(&branch);
            }
        }
        if (200..300).contains(&code) {
            self.inner.events.emit(MessageEvent::Succeeded {
                originator: Originator::Remote,
                response: resp,
            });
        } else {
            debug!(code, "MESSAGE failed");
            self.inner.events.emit(MessageEvent::Failed {
                originator: Originator::Remote,
                message: Some(resp.into()),
                cause: Cause::from_status(code),
            });
        }
    }

    pub(crate) fn on_request_timeout(&self) {
        self.fail_system(Cause::RequestTimeout);
    }

    pub(crate) fn on_transport_error(&self) {
        self.fail_system(Cause::ConnectionError);
    }

    fn fail_system(&self, cause: Cause) {
        {
            let mut data = self.inner.state.lock();
            if data.done {
                return;
            }
            data.done = true;
            if let Some(branch) = data.branch.take() {
                self.inner.core.pending.remove(&branch);
            }
        }
        self.inner.events.emit(MessageEvent::Failed {
            originator: Originator::System,
            message: None,
            cause,
        });
    }
}
