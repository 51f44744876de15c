// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP user-agent signaling core.
//!
//! The state-machine layer of a SIP UA: the RFC 3261 §12 dialog, the INVITE
//! session lifecycle with re-INVITE/UPDATE sub-transactions and RFC 4028
//! session timers, REFER with its implicit subscription (RFC 3515/4488), and
//! one-shot MESSAGE. Parsing, the §17 transaction machines, transport,
//! registration, and media internals are the host's job; this crate consumes
//! structured [`sip_msg`] messages and talks back through two seams:
//!
//! - [`OutboundSink`]: where built requests and responses go.
//! - [`MediaHandler`]: the per-session SDP collaborator.
//!
//! Inbound traffic enters through [`UserAgent::receive_request`],
//! [`UserAgent::receive_response`], [`UserAgent::request_timeout`], and
//! [`UserAgent::transport_error`].
//!
//! Everything runs on a single logical scheduler: entity state sits behind
//! per-entity mutexes, timer callbacks re-check state at fire time, and no
//! two handlers of the same entity ever interleave.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use sip_ua::{CallOptions, UaConfig, UserAgent};
//! # use sip_msg::{Request, Response, SipUri};
//! # struct Stack;
//! # impl sip_ua::OutboundSink for Stack {
//! #     fn send_request(&self, _req: Request) {}
//! #     fn send_response(&self, _resp: Response) {}
//! # }
//! # struct Media;
//! # #[async_trait::async_trait]
//! # impl sip_ua::MediaHandler for Media {
//! #     async fn create_offer(&self) -> Result<String, sip_ua::MediaError> { Ok(String::new()) }
//! #     async fn process_offer(&self, _o: &str) -> Result<String, sip_ua::MediaError> { Ok(String::new()) }
//! #     async fn process_answer(&self, _a: &str) -> Result<(), sip_ua::MediaError> { Ok(()) }
//! #     fn close(&self) {}
//! # }
//! # async fn run() {
//! let config = UaConfig::new(
//!     SipUri::parse("sip:alice@example.com").unwrap(),
//!     SipUri::parse("sip:alice@10.0.0.1:5060").unwrap(),
//! );
//! let ua = UserAgent::new(config, Arc::new(Stack));
//! let session = ua
//!     .call("sip:bob@example.com", CallOptions::new(Arc::new(Media)))
//!     .await
//!     .unwrap();
//! let mut events = session.events();
//! # }
//! ```

pub mod agent;
pub mod cause;
pub mod config;
pub mod dialog;
pub mod error;
pub mod events;
pub mod media;
pub mod message;
pub mod refer;
pub mod request;
pub mod session;
pub mod timer;
pub mod transaction;

pub use agent::UserAgent;
pub use cause::Cause;
pub use config::UaConfig;
pub use dialog::{Dialog, DialogId, DialogRegistry, DialogRole, DialogState};
pub use error::Error;
pub use events::{
    MessageEvent, NotifyKind, Originator, ReferEvent, SessionEvent, UaEvent,
};
pub use media::{MediaError, MediaHandler};
pub use message::{Message, MessageOptions, ReplyOptions};
pub use refer::{NotifyOptions, Refer, ReferId, ReferOptions};
pub use session::{
    AnswerOptions, CallOptions, Direction, DtmfOptions, RenegotiateOptions, Session, SessionId,
    SessionState, TerminateOptions,
};
pub use timer::{TimerService, TimerToken};
pub use transaction::{OutboundSink, ServerTransaction, ServerTxState};
