// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! REFER subscription scenarios: outgoing with NOTIFY progress, the
//! no-NOTIFY timeout, incoming REFER as notifier, SUBSCRIBE refresh and
//! unsubscribe, and the refer-to-call bridge.

mod common;

use std::time::Duration;

use common::{drain, new_ua, MockMedia};
use sip_msg::{extract_tag, Method, SubscriptionState};
use sip_ua::{
    CallOptions, Cause, NotifyKind, NotifyOptions, Originator, ReferEvent, ReferOptions, UaEvent,
};
use sip_ua_testkit::{
    build_in_dialog_request, build_refer, build_refer_notify, respond_to, SAMPLE_SDP,
};

#[tokio::test(start_paused = true)]
async fn outgoing_refer_with_notifications() {
    let (ua, sink) = new_ua();
    let refer = ua
        .refer(
            "sip:bob@example.com",
            "sip:carol@example.com",
            ReferOptions::default(),
        )
        .unwrap();
    let mut events = refer.events();

    let refer_req = sink.last_request();
    assert_eq!(refer_req.start.method, Method::Refer);
    assert_eq!(
        refer_req.headers.get("Refer-To").map(|v| v.as_str()),
        Some("<sip:carol@example.com>")
    );
    let our_tag = extract_tag(refer_req.headers.get("From").unwrap()).unwrap();
    let call_id = refer_req.headers.get("Call-ID").unwrap().to_string();

    // 202: accepted, subscription waiting on its first NOTIFY.
    ua.receive_response(respond_to(&refer_req, 202, "Accepted", Some("bob1"), false, None))
        .await;
    assert!(matches!(
        drain(&mut events).as_slice(),
        [ReferEvent::Accepted { .. }]
    ));

    // First NOTIFY forms the dialog and reports progress.
    ua.receive_request(build_refer_notify(
        "z9hG4bKn1",
        &call_id,
        &our_tag,
        "bob1",
        1,
        "active;expires=180",
        "SIP/2.0 100 Trying\r\n",
    ))
    .await;
    assert_eq!(ua.dialog_count(), 1);
    assert_eq!(sink.responses_with_code(200).len(), 1);
    let first = drain(&mut events);
    assert!(matches!(
        first.as_slice(),
        [ReferEvent::Notify {
            kind: NotifyKind::Progress,
            final_notify: false,
            ..
        }]
    ));

    // Terminating NOTIFY: started, final, closed.
    ua.receive_request(build_refer_notify(
        "z9hG4bKn2",
        &call_id,
        &our_tag,
        "bob1",
        2,
        "terminated;reason=noresource",
        "SIP/2.0 200 OK\r\n",
    ))
    .await;
    assert_eq!(sink.responses_with_code(200).len(), 2);
    let second = drain(&mut events);
    assert!(matches!(
        second.as_slice(),
        [ReferEvent::Notify {
            kind: NotifyKind::Started,
            final_notify: true,
            ..
        }]
    ));

    assert_eq!(refer.subscription_state(), SubscriptionState::Terminated);
    assert_eq!(ua.refer_count(), 0);
    assert_eq!(ua.dialog_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_refer_fails() {
    let (ua, sink) = new_ua();
    let refer = ua
        .refer(
            "sip:bob@example.com",
            "sip:carol@example.com",
            ReferOptions::default(),
        )
        .unwrap();
    let mut events = refer.events();
    let refer_req = sink.last_request();

    ua.receive_response(respond_to(&refer_req, 603, "Decline", Some("bob1"), false, None))
        .await;
    assert!(matches!(
        drain(&mut events).as_slice(),
        [ReferEvent::Failed {
            originator: Originator::Remote,
            cause: Cause::Rejected,
            ..
        }]
    ));
    assert_eq!(ua.refer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_notify_synthesizes_final_and_closes() {
    let (ua, sink) = new_ua();
    let refer = ua
        .refer(
            "sip:bob@example.com",
            "sip:carol@example.com",
            ReferOptions::default(),
        )
        .unwrap();
    let mut events = refer.events();
    let refer_req = sink.last_request();

    ua.receive_response(respond_to(&refer_req, 202, "Accepted", Some("bob1"), false, None))
        .await;
    drain(&mut events);

    // Timer F runs out with no NOTIFY at all.
    tokio::time::sleep(Duration::from_secs(33)).await;
    let synthesized = drain(&mut events);
    assert!(matches!(
        synthesized.as_slice(),
        [ReferEvent::Notify {
            originator: Originator::System,
            kind: NotifyKind::Progress,
            final_notify: true,
            ..
        }]
    ));
    assert_eq!(ua.refer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unwatched_subscription_is_declined() {
    let (ua, sink) = new_ua();
    let refer = ua
        .refer(
            "sip:bob@example.com",
            "sip:carol@example.com",
            ReferOptions::default(),
        )
        .unwrap();
    // No events() subscription: nobody is watching the NOTIFYs.
    let refer_req = sink.last_request();
    let our_tag = extract_tag(refer_req.headers.get("From").unwrap()).unwrap();
    let call_id = refer_req.headers.get("Call-ID").unwrap().to_string();

    ua.receive_response(respond_to(&refer_req, 202, "Accepted", Some("bob1"), false, None))
        .await;
    ua.receive_request(build_refer_notify(
        "z9hG4bKn3",
        &call_id,
        &our_tag,
        "bob1",
        1,
        "active;expires=180",
        "SIP/2.0 100 Trying\r\n",
    ))
    .await;

    assert_eq!(sink.responses_with_code(603).len(), 1);
    let unsubscribes = sink.requests_with_method(&Method::Subscribe);
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(
        unsubscribes[0].headers.get("Expires").map(|v| v.as_str()),
        Some("0")
    );
    assert_eq!(ua.refer_count(), 0);
    drop(refer);
}

#[tokio::test(start_paused = true)]
async fn incoming_refer_notifies_progress() {
    let (ua, sink) = new_ua();
    let mut ua_events = ua.events();

    ua.receive_request(build_refer(
        "sip:bob@example.com",
        "z9hG4bKr1",
        "refer-in-1",
        "<sip:carol@example.com>",
    ))
    .await;

    let refer = match drain(&mut ua_events).as_slice() {
        [UaEvent::NewRefer {
            originator: Originator::Remote,
            refer,
            ..
        }] => refer.clone(),
        other => panic!("expected NewRefer, got {} events", other.len()),
    };
    assert_eq!(refer.subscription_state(), SubscriptionState::Active);

    // 202 plus the initial 100 Trying NOTIFY.
    assert_eq!(sink.responses_with_code(202).len(), 1);
    let notifies = sink.requests_with_method(&Method::Notify);
    assert_eq!(notifies.len(), 1);
    assert_eq!(
        notifies[0].headers.get("Event").map(|v| v.as_str()),
        Some("refer")
    );
    assert!(notifies[0]
        .headers
        .get("Subscription-State")
        .unwrap()
        .starts_with("active;expires="));
    assert!(String::from_utf8_lossy(&notifies[0].body).starts_with("SIP/2.0 100 Trying"));

    // Application-driven progress, then the final notify.
    refer
        .notify(NotifyOptions {
            status_code: Some(180),
            ..Default::default()
        })
        .unwrap();
    let notifies = sink.requests_with_method(&Method::Notify);
    assert_eq!(notifies.len(), 2);
    assert!(String::from_utf8_lossy(&notifies[1].body).starts_with("SIP/2.0 180"));

    refer
        .notify(NotifyOptions {
            status_code: Some(200),
            final_notify: true,
            ..Default::default()
        })
        .unwrap();
    let notifies = sink.requests_with_method(&Method::Notify);
    assert_eq!(notifies.len(), 3);
    assert_eq!(
        notifies[2]
            .headers
            .get("Subscription-State")
            .map(|v| v.as_str()),
        Some("terminated;reason=noresource")
    );
    assert_eq!(refer.subscription_state(), SubscriptionState::Terminated);
    assert_eq!(ua.refer_count(), 0);

    // Terminated is absorbing: further notifies are ignored.
    refer.notify(NotifyOptions::default()).unwrap();
    assert_eq!(sink.requests_with_method(&Method::Notify).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn subscribe_with_expires_zero_closes() {
    let (ua, sink) = new_ua();
    let mut ua_events = ua.events();

    ua.receive_request(build_refer(
        "sip:bob@example.com",
        "z9hG4bKr2",
        "refer-in-2",
        "<sip:carol@example.com>",
    ))
    .await;
    let refer = match drain(&mut ua_events).as_slice() {
        [UaEvent::NewRefer { refer, .. }] => refer.clone(),
        _ => panic!("expected NewRefer"),
    };
    let our_tag = extract_tag(
        sink.responses_with_code(202)[0].headers.get("To").unwrap(),
    )
    .unwrap();

    let mut unsubscribe = build_in_dialog_request(
        Method::Subscribe,
        "sip:bob@192.0.2.9:5060",
        "z9hG4bKr2sub",
        "refer-in-2",
        &our_tag,
        "ref-refer-in-2",
        2,
        None,
    );
    unsubscribe.headers.push("Event".into(), "refer".into());
    unsubscribe.headers.push("Expires".into(), "0".into());
    ua.receive_request(unsubscribe).await;

    // 200 with Expires: 0, a terminating NOTIFY, and teardown.
    let ok = sink.responses_with_code(200);
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].headers.get("Expires").map(|v| v.as_str()), Some("0"));
    let notifies = sink.requests_with_method(&Method::Notify);
    assert_eq!(notifies.len(), 2);
    assert!(notifies[1]
        .headers
        .get("Subscription-State")
        .unwrap()
        .starts_with("terminated"));
    assert_eq!(refer.subscription_state(), SubscriptionState::Terminated);
    assert_eq!(ua.refer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribe_refresh_extends_subscription() {
    let (ua, sink) = new_ua();
    let mut ua_events = ua.events();
    ua.receive_request(build_refer(
        "sip:bob@example.com",
        "z9hG4bKr3",
        "refer-in-3",
        "<sip:carol@example.com>",
    ))
    .await;
    let refer = match drain(&mut ua_events).as_slice() {
        [UaEvent::NewRefer { refer, .. }] => refer.clone(),
        _ => panic!("expected NewRefer"),
    };
    let our_tag = extract_tag(
        sink.responses_with_code(202)[0].headers.get("To").unwrap(),
    )
    .unwrap();

    let mut refresh = build_in_dialog_request(
        Method::Subscribe,
        "sip:bob@192.0.2.9:5060",
        "z9hG4bKr3sub",
        "refer-in-3",
        &our_tag,
        "ref-refer-in-3",
        2,
        None,
    );
    refresh.headers.push("Event".into(), "refer".into());
    refresh.headers.push("Expires".into(), "600".into());
    ua.receive_request(refresh).await;

    let ok = sink.responses_with_code(200);
    assert_eq!(ok.len(), 1);
    assert_eq!(ok[0].headers.get("Expires").map(|v| v.as_str()), Some("600"));
    assert_eq!(refer.subscription_state(), SubscriptionState::Active);
}

#[tokio::test(start_paused = true)]
async fn refer_call_bridges_session_progress_to_notifies() {
    let (ua, sink) = new_ua();
    let mut ua_events = ua.events();
    ua.receive_request(build_refer(
        "sip:bob@example.com",
        "z9hG4bKr4",
        "refer-in-4",
        "<sip:carol@example.com>",
    ))
    .await;
    let refer = match drain(&mut ua_events).as_slice() {
        [UaEvent::NewRefer { refer, .. }] => refer.clone(),
        _ => panic!("expected NewRefer"),
    };

    let session = refer.call(CallOptions::new(MockMedia::handler())).await.unwrap();
    let invites = sink.requests_with_method(&Method::Invite);
    assert_eq!(invites.len(), 1);
    assert_eq!(invites[0].start.uri.host.as_str(), "example.com");
    assert_eq!(invites[0].start.uri.user.as_deref(), Some("carol"));

    // Progress on the referred call turns into a NOTIFY.
    ua.receive_response(respond_to(&invites[0], 180, "Ringing", Some("c1"), true, None))
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let notifies = sink.requests_with_method(&Method::Notify);
    assert_eq!(notifies.len(), 2, "initial NOTIFY plus ringing NOTIFY");
    assert!(String::from_utf8_lossy(&notifies[1].body).starts_with("SIP/2.0 180"));

    // Answer closes the subscription with a 200 final notify.
    ua.receive_response(respond_to(
        &invites[0],
        200,
        "OK",
        Some("c1"),
        true,
        Some(SAMPLE_SDP),
    ))
    .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let notifies = sink.requests_with_method(&Method::Notify);
    assert_eq!(notifies.len(), 3);
    assert!(String::from_utf8_lossy(&notifies[2].body).starts_with("SIP/2.0 200"));
    assert!(notifies[2]
        .headers
        .get("Subscription-State")
        .unwrap()
        .starts_with("terminated"));
    assert_eq!(refer.subscription_state(), SubscriptionState::Terminated);
    assert!(session.is_established());
}
