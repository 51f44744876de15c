// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog state: route set, sequence numbers, remote target,
//! session-timer sub-state, the in-dialog request builder, and the
//! gatekeeper every in-dialog request passes before its owner sees it.

pub mod id;
pub mod registry;
pub mod session_timer;

pub use id::DialogId;
pub use registry::{DialogRef, DialogRegistry};
pub use session_timer::SessionTimerState;

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use smol_str::SmolStr;

use sip_msg::{
    extract_tag, format_name_addr, name_addr_uri, Header, Headers, Method, Request, RequestLine,
    Response, SipUri,
};

use crate::error::Error;
use crate::refer::ReferId;
use crate::request::{generate_branch, ALLOWED_METHODS};
use crate::session::SessionId;
use crate::transaction::{OutboundSink, ServerTransaction, ServerTxState};

/// Dialog state. Early → Confirmed is the only legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

/// Which role created the dialog; decides which incoming tag is local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// Non-owning back-reference to the entity the dialog belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogOwner {
    Session(SessionId),
    Refer(ReferId),
}

/// Outcome of the in-dialog gatekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateVerdict {
    Accepted,
    Rejected,
}

/// A single end-to-end SIP relationship (RFC 3261 §12).
#[derive(Debug, PartialEq)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub role: DialogRole,
    pub owner: DialogOwner,
    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    /// URI from the peer's Contact; replaced on target refresh.
    pub remote_target: SipUri,
    /// Record-Route values, reversed for UAC, emitted verbatim as Route.
    pub route_set: Vec<SmolStr>,
    /// Lazily seeded local CSeq. CANCEL and ACK reuse it; others increment.
    local_seqnum: Option<u32>,
    /// Highest CSeq seen from the peer.
    remote_seqnum: Option<u32>,
    /// Most recent INVITE server transaction, for the one-modifier rule.
    pub last_invite_tx: Option<Arc<ServerTransaction>>,
    /// Most recent UPDATE server transaction, for RFC 3311 §5.2.
    pub last_update_tx: Option<Arc<ServerTransaction>>,
    pub session_timer: SessionTimerState,
}

impl Dialog {
    /// Creates a UAC dialog from a dialog-forming response
    /// (RFC 3261 §12.1.2). Requires Contact and both tags.
    pub fn new_uac(resp: &Response, owner: DialogOwner) -> Result<Self, Error> {
        let id = DialogId::uac_from_response(resp).ok_or(Error::MissingHeader("To tag"))?;
        let contact = resp
            .headers
            .get("Contact")
            .and_then(|v| name_addr_uri(v))
            .ok_or(Error::MissingHeader("Contact"))?;
        let local_uri = resp
            .headers
            .get("From")
            .and_then(|v| name_addr_uri(v))
            .ok_or(Error::MissingHeader("From"))?;
        let remote_uri = resp
            .headers
            .get("To")
            .and_then(|v| name_addr_uri(v))
            .ok_or(Error::MissingHeader("To"))?;

        let mut route_set: Vec<SmolStr> =
            resp.headers.get_all("Record-Route").cloned().collect();
        route_set.reverse();

        let state = if resp.start.code < 200 {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };

        Ok(Self {
            id,
            state,
            role: DialogRole::Uac,
            owner,
            local_uri,
            remote_uri,
            remote_target: contact,
            route_set,
            // ACK and CANCEL must reuse the INVITE's sequence number.
            local_seqnum: resp.cseq_number(),
            remote_seqnum: None,
            last_invite_tx: None,
            last_update_tx: None,
            session_timer: SessionTimerState::disabled(),
        })
    }

    /// Creates a UAS dialog from an accepted dialog-forming request
    /// (RFC 3261 §12.1.1). `local_tag` is the To tag we will answer with.
    pub fn new_uas(
        req: &Request,
        local_tag: SmolStr,
        owner: DialogOwner,
        state: DialogState,
    ) -> Result<Self, Error> {
        let call_id = req
            .headers
            .get("Call-ID")
            .cloned()
            .ok_or(Error::MissingHeader("Call-ID"))?;
        let remote_tag =
            extract_tag(req.headers.get("From").ok_or(Error::MissingHeader("From"))?)
                .ok_or(Error::MissingHeader("From tag"))?;
        let contact = req
            .headers
            .get("Contact")
            .and_then(|v| name_addr_uri(v))
            .ok_or(Error::MissingHeader("Contact"))?;
        let local_uri = req
            .headers
            .get("To")
            .and_then(|v| name_addr_uri(v))
            .ok_or(Error::MissingHeader("To"))?;
        let remote_uri = req
            .headers
            .get("From")
            .and_then(|v| name_addr_uri(v))
            .ok_or(Error::MissingHeader("From"))?;

        let route_set: Vec<SmolStr> = req.headers.get_all("Record-Route").cloned().collect();

        Ok(Self {
            id: DialogId::new(call_id, local_tag, remote_tag),
            state,
            role: DialogRole::Uas,
            owner,
            local_uri,
            remote_uri,
            remote_target: contact,
            route_set,
            local_seqnum: None,
            remote_seqnum: req.cseq_number(),
            last_invite_tx: None,
            last_update_tx: None,
            session_timer: SessionTimerState::disabled(),
        })
    }

    /// Promotes an early dialog.
    pub fn confirm(&mut self) {
        self.state = DialogState::Confirmed;
    }

    pub fn remote_seqnum(&self) -> Option<u32> {
        self.remote_seqnum
    }

    /// Builds an in-dialog request (RFC 3261 §12.2.1.1).
    pub fn create_request(&mut self, method: Method, extra_headers: &[Header]) -> Request {
        let seqnum = match self.local_seqnum {
            Some(current) => current,
            None => {
                let seeded = rand::thread_rng().gen_range(0..10_000);
                self.local_seqnum = Some(seeded);
                seeded
            }
        };
        let cseq = if matches!(method, Method::Cancel | Method::Ack) {
            seqnum
        } else {
            let next = seqnum + 1;
            self.local_seqnum = Some(next);
            next
        };

        let mut headers = Headers::new();
        headers.push(
            SmolStr::new("Via"),
            SmolStr::new(format!(
                "SIP/2.0/UDP placeholder;branch={}",
                generate_branch()
            )),
        );
        headers.push(
            SmolStr::new("From"),
            format_name_addr(None, &self.local_uri, Some(&self.id.local_tag)),
        );
        headers.push(
            SmolStr::new("To"),
            format_name_addr(None, &self.remote_uri, Some(&self.id.remote_tag)),
        );
        headers.push(SmolStr::new("Call-ID"), self.id.call_id.clone());
        headers.push(
            SmolStr::new("CSeq"),
            SmolStr::new(format!("{} {}", cseq, method.as_str())),
        );
        for route in &self.route_set {
            headers.push(SmolStr::new("Route"), route.clone());
        }
        headers.push(SmolStr::new("Max-Forwards"), SmolStr::new("70"));
        headers.push(SmolStr::new("Allow"), SmolStr::new(ALLOWED_METHODS));

        if matches!(method, Method::Invite | Method::Update) && self.session_timer.enabled {
            headers.push(SmolStr::new("Supported"), SmolStr::new("timer"));
            headers.push(
                SmolStr::new("Session-Expires"),
                SmolStr::new(self.session_timer.offer_interval().to_string()),
            );
            if self.session_timer.min_interval > 90 {
                headers.push(
                    SmolStr::new("Min-SE"),
                    SmolStr::new(self.session_timer.min_interval.to_string()),
                );
            }
        }

        for header in extra_headers {
            headers.push(header.name.clone(), header.value.clone());
        }
        headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

        Request::new(
            RequestLine::new(method, self.remote_target.clone()),
            headers,
            Bytes::new(),
        )
    }

    /// Gatekeeper for incoming in-dialog requests. A rejected request has
    /// already been replied to (never for ACK) and must not reach the owner.
    pub fn check_in_dialog_request(
        &mut self,
        req: &Request,
        server_tx: Option<&Arc<ServerTransaction>>,
        sink: &dyn OutboundSink,
    ) -> GateVerdict {
        let method = req.start.method.clone();
        let is_ack = method == Method::Ack;

        let Some(cseq) = req.cseq_number() else {
            if !is_ack {
                if let Some(tx) = server_tx {
                    tx.reply(sink, 400, None, &[], None);
                }
            }
            return GateVerdict::Rejected;
        };

        match self.remote_seqnum {
            None => self.remote_seqnum = Some(cseq),
            Some(current) if cseq < current => {
                if !is_ack {
                    if let Some(tx) = server_tx {
                        tx.reply(sink, 500, None, &[], None);
                    }
                }
                return GateVerdict::Rejected;
            }
            Some(current) if cseq > current => self.remote_seqnum = Some(cseq),
            Some(_) => {}
        }

        match &method {
            Method::Invite => {
                let pending = self
                    .last_invite_tx
                    .as_ref()
                    .is_some_and(|tx| tx.state() == ServerTxState::Proceeding);
                if pending {
                    self.reply_retry_later(server_tx, sink);
                    return GateVerdict::Rejected;
                }
                self.last_invite_tx = server_tx.cloned();
            }
            Method::Update => {
                let pending = self.last_update_tx.as_ref().is_some_and(|tx| {
                    matches!(tx.state(), ServerTxState::Trying | ServerTxState::Proceeding)
                });
                if pending {
                    self.reply_retry_later(server_tx, sink);
                    return GateVerdict::Rejected;
                }
                self.last_update_tx = server_tx.cloned();
            }
            _ => {}
        }

        if method.is_target_refresh() {
            if let Some(contact) = req.headers.get("Contact").and_then(|v| name_addr_uri(v)) {
                self.remote_target = contact;
            }
        }

        GateVerdict::Accepted
    }

    fn reply_retry_later(
        &self,
        server_tx: Option<&Arc<ServerTransaction>>,
        sink: &dyn OutboundSink,
    ) {
        if let Some(tx) = server_tx {
            let retry_after = rand::thread_rng().gen_range(1..=10);
            let header = Header {
                name: SmolStr::new("Retry-After"),
                value: SmolStr::new(retry_after.to_string()),
            };
            tx.reply(sink, 500, None, &[header], None);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        id: DialogId,
        role: DialogRole,
        state: DialogState,
        owner: DialogOwner,
        local_uri: SipUri,
        remote_uri: SipUri,
        remote_target: SipUri,
    ) -> Self {
        Self {
            id,
            state,
            role,
            owner,
            local_uri,
            remote_uri,
            remote_target,
            route_set: Vec::new(),
            local_seqnum: None,
            remote_seqnum: None,
            last_invite_tx: None,
            last_update_tx: None,
            session_timer: SessionTimerState::disabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct VecSink {
        requests: Mutex<Vec<Request>>,
        responses: Mutex<Vec<Response>>,
    }

    impl OutboundSink for VecSink {
        fn send_request(&self, req: Request) {
            self.requests.lock().push(req);
        }
        fn send_response(&self, resp: Response) {
            self.responses.lock().push(resp);
        }
    }

    fn invite_request(cseq: u32, from_tag: &str, to_tag: Option<&str>) -> Request {
        in_dialog_request(Method::Invite, cseq, from_tag, to_tag)
    }

    fn in_dialog_request(
        method: Method,
        cseq: u32,
        from_tag: &str,
        to_tag: Option<&str>,
    ) -> Request {
        let mut headers = Headers::new();
        headers.push("Via".into(), format!("SIP/2.0/UDP h;branch=z9hG4bKb{}", cseq).into());
        headers.push("Call-ID".into(), "c1".into());
        headers.push("From".into(), format!("<sip:a@h>;tag={}", from_tag).into());
        let to = match to_tag {
            Some(tag) => format!("<sip:b@h>;tag={}", tag),
            None => "<sip:b@h>".to_owned(),
        };
        headers.push("To".into(), to.into());
        headers.push("CSeq".into(), format!("{} {}", cseq, method.as_str()).into());
        headers.push("Contact".into(), "<sip:a@client.h>".into());
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:b@h").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn response_200(req: &Request, to_tag: &str, record_routes: &[&str]) -> Response {
        let mut headers = Headers::new();
        for header in req.headers.iter() {
            if header.name.eq_ignore_ascii_case("To") {
                headers.push("To".into(), format!("{};tag={}", header.value, to_tag).into());
            } else {
                headers.push(header.name.clone(), header.value.clone());
            }
        }
        for rr in record_routes {
            headers.push("Record-Route".into(), (*rr).into());
        }
        headers.push("Contact".into(), "<sip:b@server.h>".into());
        Response::new(
            sip_msg::StatusLine::new(200, "OK".into()),
            headers,
            Bytes::new(),
        )
    }

    fn uas_dialog() -> Dialog {
        let invite = invite_request(10, "caller", None);
        Dialog::new_uas(
            &invite,
            "callee".into(),
            DialogOwner::Session(SessionId::new("s1")),
            DialogState::Early,
        )
        .unwrap()
    }

    #[test]
    fn uac_dialog_from_2xx() {
        let invite = invite_request(4, "caller", None);
        let resp = response_200(&invite, "callee", &["<sip:p1;lr>", "<sip:p2;lr>"]);
        let dialog = Dialog::new_uac(&resp, DialogOwner::Session(SessionId::new("s1"))).unwrap();

        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.id.local_tag.as_str(), "caller");
        assert_eq!(dialog.id.remote_tag.as_str(), "callee");
        assert_eq!(dialog.remote_target.host.as_str(), "server.h");
        // Record-Route reversed for the UAC.
        assert_eq!(
            dialog.route_set.iter().map(|v| v.as_str()).collect::<Vec<_>>(),
            vec!["<sip:p2;lr>", "<sip:p1;lr>"]
        );
    }

    #[test]
    fn uac_dialog_requires_contact() {
        let invite = invite_request(4, "caller", None);
        let mut resp = response_200(&invite, "callee", &[]);
        resp.headers.remove_all("Contact");
        assert_eq!(
            Dialog::new_uac(&resp, DialogOwner::Session(SessionId::new("s1"))),
            Err(Error::MissingHeader("Contact"))
        );
    }

    #[test]
    fn ack_and_cancel_reuse_invite_cseq() {
        let invite = invite_request(7, "caller", None);
        let resp = response_200(&invite, "callee", &[]);
        let mut dialog =
            Dialog::new_uac(&resp, DialogOwner::Session(SessionId::new("s1"))).unwrap();

        let ack = dialog.create_request(Method::Ack, &[]);
        assert_eq!(ack.headers.get("CSeq").map(|v| v.as_str()), Some("7 ACK"));

        let bye = dialog.create_request(Method::Bye, &[]);
        assert_eq!(bye.headers.get("CSeq").map(|v| v.as_str()), Some("8 BYE"));
    }

    #[test]
    fn lazily_seeded_cseq_is_in_range() {
        let mut dialog = uas_dialog();
        let notify = dialog.create_request(Method::Notify, &[]);
        let cseq = notify.cseq_number().unwrap();
        assert!(cseq < 10_001, "seeded cseq {} out of range", cseq);
    }

    #[test]
    fn request_uri_is_remote_target_and_routes_follow() {
        let invite = invite_request(4, "caller", None);
        let resp = response_200(&invite, "callee", &["<sip:p1;lr>"]);
        let mut dialog =
            Dialog::new_uac(&resp, DialogOwner::Session(SessionId::new("s1"))).unwrap();

        let bye = dialog.create_request(Method::Bye, &[]);
        assert_eq!(bye.start.uri.host.as_str(), "server.h");
        assert_eq!(bye.headers.get("Route").map(|v| v.as_str()), Some("<sip:p1;lr>"));
        assert_eq!(
            sip_msg::extract_tag(bye.headers.get("To").unwrap()).as_deref(),
            Some("callee")
        );
    }

    #[test]
    fn gate_adopts_first_cseq() {
        let mut dialog = uas_dialog();
        // new_uas seeded remote_seqnum from the INVITE (10).
        assert_eq!(dialog.remote_seqnum(), Some(10));

        let sink = VecSink::default();
        let bye = in_dialog_request(Method::Bye, 11, "caller", Some("callee"));
        let tx = ServerTransaction::new(bye.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&bye, Some(&tx), &sink),
            GateVerdict::Accepted
        );
        assert_eq!(dialog.remote_seqnum(), Some(11));
    }

    #[test]
    fn gate_rejects_lower_cseq_with_500() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();

        let stale = in_dialog_request(Method::Bye, 5, "caller", Some("callee"));
        let tx = ServerTransaction::new(stale.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&stale, Some(&tx), &sink),
            GateVerdict::Rejected
        );
        let responses = sink.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].code(), 500);
    }

    #[test]
    fn gate_never_replies_to_stale_ack() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();

        let ack = in_dialog_request(Method::Ack, 5, "caller", Some("callee"));
        assert_eq!(
            dialog.check_in_dialog_request(&ack, None, &sink),
            GateVerdict::Rejected
        );
        assert!(sink.responses.lock().is_empty());
    }

    #[test]
    fn gate_equal_cseq_passes_without_advancing() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();
        let retrans = in_dialog_request(Method::Info, 10, "caller", Some("callee"));
        let tx = ServerTransaction::new(retrans.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&retrans, Some(&tx), &sink),
            GateVerdict::Accepted
        );
        assert_eq!(dialog.remote_seqnum(), Some(10));
    }

    #[test]
    fn second_invite_while_proceeding_gets_500_retry_after() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();

        let reinvite1 = invite_request(11, "caller", Some("callee"));
        let tx1 = ServerTransaction::new(reinvite1.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&reinvite1, Some(&tx1), &sink),
            GateVerdict::Accepted
        );

        // tx1 is Proceeding (no final response yet): next INVITE bounces.
        let reinvite2 = invite_request(12, "caller", Some("callee"));
        let tx2 = ServerTransaction::new(reinvite2.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&reinvite2, Some(&tx2), &sink),
            GateVerdict::Rejected
        );

        let responses = sink.responses.lock();
        assert_eq!(responses.last().unwrap().code(), 500);
        let retry_after: u32 = responses
            .last()
            .unwrap()
            .headers
            .get("Retry-After")
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=10).contains(&retry_after));
    }

    #[test]
    fn invite_after_completed_tx_is_accepted() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();

        let reinvite1 = invite_request(11, "caller", Some("callee"));
        let tx1 = ServerTransaction::new(reinvite1.clone());
        dialog.check_in_dialog_request(&reinvite1, Some(&tx1), &sink);
        tx1.reply(&sink, 200, None, &[], None);

        let reinvite2 = invite_request(12, "caller", Some("callee"));
        let tx2 = ServerTransaction::new(reinvite2.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&reinvite2, Some(&tx2), &sink),
            GateVerdict::Accepted
        );
    }

    #[test]
    fn pending_update_gets_500_retry_after() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();

        let update1 = in_dialog_request(Method::Update, 11, "caller", Some("callee"));
        let tx1 = ServerTransaction::new(update1.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&update1, Some(&tx1), &sink),
            GateVerdict::Accepted
        );

        let update2 = in_dialog_request(Method::Update, 12, "caller", Some("callee"));
        let tx2 = ServerTransaction::new(update2.clone());
        assert_eq!(
            dialog.check_in_dialog_request(&update2, Some(&tx2), &sink),
            GateVerdict::Rejected
        );
        assert_eq!(sink.responses.lock().last().unwrap().code(), 500);
    }

    #[test]
    fn target_refresh_replaces_remote_target() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();
        let original = dialog.remote_target.clone();

        let mut reinvite = invite_request(11, "caller", Some("callee"));
        reinvite
            .headers
            .set("Contact".into(), "<sip:a@elsewhere.h>".into());
        let tx = ServerTransaction::new(reinvite.clone());
        dialog.check_in_dialog_request(&reinvite, Some(&tx), &sink);

        assert_ne!(dialog.remote_target, original);
        assert_eq!(dialog.remote_target.host.as_str(), "elsewhere.h");
    }

    #[test]
    fn non_refresh_methods_keep_target() {
        let mut dialog = uas_dialog();
        let sink = VecSink::default();
        let original = dialog.remote_target.clone();

        let bye = in_dialog_request(Method::Bye, 11, "caller", Some("callee"));
        let tx = ServerTransaction::new(bye.clone());
        dialog.check_in_dialog_request(&bye, Some(&tx), &sink);
        assert_eq!(dialog.remote_target, original);
    }

    #[test]
    fn session_expires_emitted_on_invite_and_update_only() {
        let invite = invite_request(4, "caller", None);
        let resp = response_200(&invite, "callee", &[]);
        let mut dialog =
            Dialog::new_uac(&resp, DialogOwner::Session(SessionId::new("s1"))).unwrap();
        dialog.session_timer = SessionTimerState::new(true, 1800, 90);

        let update = dialog.create_request(Method::Update, &[]);
        assert_eq!(
            update.headers.get("Session-Expires").map(|v| v.as_str()),
            Some("1800")
        );
        assert_eq!(update.headers.get("Supported").map(|v| v.as_str()), Some("timer"));
        assert!(update.headers.get("Min-SE").is_none());

        let bye = dialog.create_request(Method::Bye, &[]);
        assert!(bye.headers.get("Session-Expires").is_none());
    }
}
