// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Structured SIP message model consumed by the user-agent core.
//!
//! This crate models *already parsed* SIP traffic: the wire grammar lives in
//! the host's parser, which hands the core [`Request`] and [`Response`]
//! values. What this crate does own is the value-level reading and writing of
//! the headers the core interprets semantically:
//!
//! - name-addr values (From/To/Contact/Refer-To) via [`addr`]
//! - `Session-Expires` / `Min-SE` (RFC 4028) via [`SessionExpires`]
//! - `Event` / `Subscription-State` (RFC 6665) via [`EventHeader`]
//! - `Reason` (RFC 3326) via [`ReasonHeader`]
//! - `Target-Dialog` (RFC 4538) via [`TargetDialog`]
//! - `message/sipfrag` bodies (RFC 3420) via [`SipFrag`]
//!
//! # Example
//! ```
//! use sip_msg::{Method, Request, RequestLine, Headers, SipUri};
//! use bytes::Bytes;
//!
//! let mut headers = Headers::new();
//! headers.push("To".into(), "<sip:bob@example.com>".into());
//! let req = Request::new(
//!     RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
//!     headers,
//!     Bytes::new(),
//! );
//! assert_eq!(req.start.method.as_str(), "INVITE");
//! ```

pub mod addr;
pub mod event;
pub mod headers;
pub mod method;
pub mod msg;
pub mod reason;
pub mod session_timer;
pub mod sipfrag;
pub mod target_dialog;
pub mod uri;

pub use addr::{extract_tag, format_name_addr, name_addr_display, name_addr_uri};
pub use event::{EventHeader, SubscriptionState, SubscriptionStateHeader};
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    reason_phrase_for, Request, RequestLine, Response, SipMessage, SipVersion, StatusLine,
};
pub use reason::ReasonHeader;
pub use session_timer::{MinSessionExpires, RefresherRole, SessionExpires};
pub use sipfrag::SipFrag;
pub use target_dialog::TargetDialog;
pub use uri::SipUri;
