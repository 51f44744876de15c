// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed errors returned from API call sites.
//!
//! These cover local programming errors only: bad arguments and operations
//! attempted in the wrong state. They carry no protocol side effects and no
//! events are emitted on their paths. Protocol and system failures travel
//! through the event stream instead.

use crate::media::MediaError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation is not legal in the entity's current state.
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// A target or Refer-To URI could not be parsed as a SIP URI.
    InvalidTarget(String),
    /// A status code outside the range the operation permits.
    InvalidStatus(u16),
    /// A malformed argument, e.g. an unknown DTMF tone character.
    InvalidArgument(String),
    /// A header the operation requires is missing from the message.
    MissingHeader(&'static str),
    /// The incoming request was already answered.
    AlreadyReplied,
    /// A re-INVITE or UPDATE is still in progress on this session.
    RequestPending,
    /// The media handler refused or failed.
    Media(MediaError),
}

impl Error {
    pub(crate) fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Error::InvalidState { operation, state }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidState { operation, state } => {
                write!(f, "{} not allowed in state {}", operation, state)
            }
            Error::InvalidTarget(target) => write!(f, "invalid target URI: {}", target),
            Error::InvalidStatus(code) => write!(f, "invalid status code: {}", code),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::MissingHeader(name) => write!(f, "missing {} header", name),
            Error::AlreadyReplied => write!(f, "request already replied"),
            Error::RequestPending => write!(f, "another session modification is in progress"),
            Error::Media(err) => write!(f, "media handler error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

impl From<MediaError> for Error {
    fn from(err: MediaError) -> Self {
        Error::Media(err)
    }
}
