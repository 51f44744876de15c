// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-entity event streams.
//!
//! Every entity owns an [`Emitter`] that fans events out to any number of
//! subscriber channels. Payloads are tagged unions with explicit variants;
//! each carries the [`Originator`] that caused it.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use sip_msg::{Request, Response, SipFrag, SipMessage};

use crate::cause::Cause;
use crate::message::Message;
use crate::refer::Refer;
use crate::session::Session;

/// Which party caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Originator {
    Local,
    Remote,
    System,
}

impl Originator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Originator::Local => "local",
            Originator::Remote => "remote",
            Originator::System => "system",
        }
    }
}

/// Multi-subscriber event fan-out.
pub struct Emitter<E> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<E>>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new subscription channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Delivers an event to every live subscriber, pruning closed ones.
    pub fn emit(&self, event: E) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Events emitted by a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A provisional response was sent or received.
    Progress {
        originator: Originator,
        response: Option<Response>,
    },
    /// The call is up: the UAC received its 2xx, or the UAS sent one.
    Started {
        originator: Originator,
        response: Option<Response>,
    },
    /// An established session ended.
    Ended {
        originator: Originator,
        message: Option<SipMessage>,
        cause: Cause,
    },
    /// A session failed before establishing.
    Failed {
        originator: Originator,
        message: Option<SipMessage>,
        cause: Cause,
    },
    /// A DTMF tone was sent or received via INFO.
    NewDtmf {
        originator: Originator,
        tone: char,
        duration: u32,
    },
    /// The peer wants to modify the session; answer with
    /// [`Session::accept_reinvite`](crate::session::Session::accept_reinvite)
    /// or [`Session::reject_reinvite`](crate::session::Session::reject_reinvite).
    Reinvite {
        originator: Originator,
        request: Request,
    },
    /// The peer sent an UPDATE with a body; answer with
    /// [`Session::accept_update`](crate::session::Session::accept_update)
    /// or [`Session::reject_update`](crate::session::Session::reject_update).
    Update {
        originator: Originator,
        request: Request,
    },
    /// The session timer asked the local side to refresh.
    Refresh { originator: Originator },
}

/// How a REFER NOTIFY's sipfrag status maps onto session progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// sipfrag status < 200
    Progress,
    /// sipfrag status 2xx
    Started,
    /// sipfrag status >= 300
    Failed,
}

impl NotifyKind {
    pub fn from_status(code: u16) -> Self {
        if code < 200 {
            NotifyKind::Progress
        } else if code < 300 {
            NotifyKind::Started
        } else {
            NotifyKind::Failed
        }
    }
}

/// Events emitted by a [`Refer`](crate::refer::Refer).
#[derive(Debug, Clone)]
pub enum ReferEvent {
    /// The peer accepted the REFER with a 2xx.
    Accepted { response: Response },
    /// The REFER failed or the subscription broke down.
    Failed {
        originator: Originator,
        message: Option<SipMessage>,
        cause: Cause,
    },
    /// A NOTIFY arrived (or was synthesized) for the subscription.
    Notify {
        originator: Originator,
        kind: NotifyKind,
        frag: SipFrag,
        request: Option<Request>,
        final_notify: bool,
    },
}

/// Events emitted by a one-shot [`Message`](crate::message::Message).
#[derive(Debug, Clone)]
pub enum MessageEvent {
    Succeeded {
        originator: Originator,
        response: Response,
    },
    Failed {
        originator: Originator,
        message: Option<SipMessage>,
        cause: Cause,
    },
}

/// Top-level events emitted by the [`UserAgent`](crate::agent::UserAgent).
///
/// Each variant fires exactly once per entity, before any of the entity's
/// own events.
#[derive(Clone)]
pub enum UaEvent {
    NewSession {
        originator: Originator,
        session: Session,
        request: Request,
    },
    NewMessage {
        originator: Originator,
        message: Message,
        request: Request,
    },
    NewRefer {
        originator: Originator,
        refer: Refer,
        request: Option<Request>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_fans_out_to_all_subscribers() {
        let emitter: Emitter<u32> = Emitter::new();
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(7);
        assert_eq!(rx1.recv().await, Some(7));
        assert_eq!(rx2.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let emitter: Emitter<u32> = Emitter::new();
        let rx = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 1);

        drop(rx);
        assert_eq!(emitter.subscriber_count(), 0);

        // Emitting with no subscribers is fine.
        emitter.emit(1);
    }

    #[test]
    fn notify_kind_mapping() {
        assert_eq!(NotifyKind::from_status(100), NotifyKind::Progress);
        assert_eq!(NotifyKind::from_status(180), NotifyKind::Progress);
        assert_eq!(NotifyKind::from_status(200), NotifyKind::Started);
        assert_eq!(NotifyKind::from_status(299), NotifyKind::Started);
        assert_eq!(NotifyKind::from_status(300), NotifyKind::Failed);
        assert_eq!(NotifyKind::from_status(603), NotifyKind::Failed);
    }
}
