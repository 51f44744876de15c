// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared harness: a capturing outbound sink and a canned-SDP media handler.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sip_msg::{Method, Request, Response, SipUri};
use sip_ua::{MediaError, MediaHandler, OutboundSink, UaConfig, UserAgent};

pub const LOCAL_SDP: &str = "v=0\r\no=- 1 1 IN IP4 192.0.2.9\r\ns=-\r\nc=IN IP4 192.0.2.9\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n";

/// Records everything the core hands to the transaction layer.
#[derive(Default)]
pub struct CaptureSink {
    requests: Mutex<Vec<Request>>,
    responses: Mutex<Vec<Response>>,
}

impl OutboundSink for CaptureSink {
    fn send_request(&self, req: Request) {
        self.requests.lock().push(req);
    }
    fn send_response(&self, resp: Response) {
        self.responses.lock().push(resp);
    }
}

impl CaptureSink {
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().clone()
    }

    pub fn last_request(&self) -> Request {
        self.requests.lock().last().expect("no request sent").clone()
    }

    pub fn requests_with_method(&self, method: &Method) -> Vec<Request> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.start.method == *method)
            .cloned()
            .collect()
    }

    pub fn responses_with_code(&self, code: u16) -> Vec<Response> {
        self.responses
            .lock()
            .iter()
            .filter(|r| r.start.code == code)
            .cloned()
            .collect()
    }
}

/// Media handler returning canned SDP, optionally failing on demand.
#[derive(Default)]
pub struct MockMedia {
    pub fail_offer: bool,
    pub fail_answer: bool,
    pub closed: AtomicBool,
}

impl MockMedia {
    pub fn handler() -> Arc<dyn MediaHandler> {
        Arc::new(MockMedia::default())
    }
}

#[async_trait]
impl MediaHandler for MockMedia {
    async fn create_offer(&self) -> Result<String, MediaError> {
        if self.fail_offer {
            Err(MediaError::AccessDenied)
        } else {
            Ok(LOCAL_SDP.to_owned())
        }
    }

    async fn process_offer(&self, _offer: &str) -> Result<String, MediaError> {
        if self.fail_offer {
            Err(MediaError::AccessDenied)
        } else {
            Ok(LOCAL_SDP.to_owned())
        }
    }

    async fn process_answer(&self, _answer: &str) -> Result<(), MediaError> {
        if self.fail_answer {
            Err(MediaError::BadDescription("rejected by test".into()))
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub fn test_config() -> UaConfig {
    UaConfig::new(
        SipUri::parse("sip:bob@example.com").unwrap(),
        SipUri::parse("sip:bob@192.0.2.9:5060").unwrap(),
    )
}

pub fn new_ua() -> (UserAgent, Arc<CaptureSink>) {
    let sink = Arc::new(CaptureSink::default());
    let ua = UserAgent::new(test_config(), sink.clone());
    (ua, sink)
}

pub fn new_ua_with_config(config: UaConfig) -> (UserAgent, Arc<CaptureSink>) {
    let sink = Arc::new(CaptureSink::default());
    let ua = UserAgent::new(config, sink.clone());
    (ua, sink)
}

/// Drains every event currently queued on an unbounded receiver.
pub fn drain<E>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
