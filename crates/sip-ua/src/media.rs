// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Media-handler collaborator seam.
//!
//! Each session exclusively owns one handler. The core never looks inside
//! SDP; it shuttles offer/answer strings between the wire and the handler and
//! maps handler failures onto causes.

use async_trait::async_trait;

use crate::cause::Cause;

/// Why the media handler could not produce or apply a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user refused capture-device access.
    AccessDenied,
    /// The remote description was unusable.
    BadDescription(String),
    /// Anything else that broke inside the media stack.
    Failed(String),
}

impl MediaError {
    pub(crate) fn cause(&self) -> Cause {
        match self {
            MediaError::AccessDenied => Cause::UserDeniedMediaAccess,
            MediaError::BadDescription(_) => Cause::BadMediaDescription,
            MediaError::Failed(_) => Cause::WebrtcError,
        }
    }
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::AccessDenied => write!(f, "user denied media access"),
            MediaError::BadDescription(msg) => write!(f, "bad media description: {}", msg),
            MediaError::Failed(msg) => write!(f, "media failure: {}", msg),
        }
    }
}

impl std::error::Error for MediaError {}

/// The session's media collaborator.
///
/// Implementations wrap whatever produces and consumes SDP: a
/// PeerConnection, a media server leg, or a canned-SDP test double.
#[async_trait]
pub trait MediaHandler: Send + Sync {
    /// Produces a local offer for an initial INVITE or re-INVITE.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Applies a remote offer and produces the local answer.
    async fn process_offer(&self, offer: &str) -> Result<String, MediaError>;

    /// Applies the remote answer to a previously created offer.
    async fn process_answer(&self, answer: &str) -> Result<(), MediaError>;

    /// Releases media resources. Idempotent.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_to_cause_mapping() {
        assert_eq!(MediaError::AccessDenied.cause(), Cause::UserDeniedMediaAccess);
        assert_eq!(
            MediaError::BadDescription("no codecs".into()).cause(),
            Cause::BadMediaDescription
        );
        assert_eq!(MediaError::Failed("ice".into()).cause(), Cause::WebrtcError);
    }
}
