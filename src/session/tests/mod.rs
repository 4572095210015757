mod test_signaling;

use super::{Body, Session, SessionOption};
use crate::transaction::{
    IncomingRequest, ReplyCommand, ReplyCommandReceiver, ReplyHandle, TransactionEvent,
    TransactionEventReceiver, TransactionLayer,
};
use crate::Result;
use async_trait::async_trait;
use rsip::{Header, Method, StatusCode};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Captures outbound requests and feeds each one a scripted event stream.
/// A request with no script stays pending forever, its channel held open.
pub(crate) struct MockTransactionLayer {
    sent: Mutex<Vec<rsip::Request>>,
    scripts: Mutex<Vec<Vec<TransactionEvent>>>,
    senders: Mutex<Vec<UnboundedSender<TransactionEvent>>>,
}

impl MockTransactionLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransactionLayer {
            sent: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, events: Vec<TransactionEvent>) {
        self.scripts.lock().unwrap().push(events);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<rsip::Request> {
        self.sent.lock().unwrap().clone()
    }

    /// Delivers an event to the most recently sent request's driver.
    pub fn complete(&self, event: TransactionEvent) {
        if let Some(tx) = self.senders.lock().unwrap().last() {
            tx.send(event).ok();
        }
    }
}

/// Yields to the runtime until the mock has seen `count` sends. The
/// request driver runs on a spawned task, so dispatch returning does not
/// mean the request went out yet.
pub(crate) async fn wait_for_sends(transaction: &MockTransactionLayer, count: usize) {
    for _ in 0..32 {
        if transaction.sent_count() >= count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("request was not sent");
}

#[async_trait]
impl TransactionLayer for MockTransactionLayer {
    async fn send_request(&self, request: rsip::Request) -> Result<TransactionEventReceiver> {
        self.sent.lock().unwrap().push(request);
        let (tx, rx) = unbounded_channel();
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            }
        };
        for event in events {
            tx.send(event).ok();
        }
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }
}

pub(crate) fn uri(s: &str) -> rsip::Uri {
    rsip::Uri::try_from(s).expect("valid uri")
}

pub(crate) fn sdp(label: &str) -> Body {
    Body::new("application/sdp", format!("v=0\r\ns={}\r\n", label).into_bytes())
}

pub(crate) fn response(status: StatusCode, body: Option<&Body>) -> rsip::Response {
    let mut headers: Vec<Header> = Vec::new();
    let content = match body {
        Some(body) => {
            headers.push(Header::ContentType(body.content_type.clone().into()));
            body.content.clone()
        }
        None => Vec::new(),
    };
    rsip::Response {
        status_code: status,
        headers: headers.into(),
        version: rsip::Version::V2,
        body: content,
    }
}

pub(crate) fn final_ok(body: Option<&Body>) -> Vec<TransactionEvent> {
    vec![TransactionEvent::Final(response(StatusCode::OK, body))]
}

pub(crate) fn in_dialog_request(method: Method, cseq: u32, body: Option<&Body>) -> rsip::Request {
    let mut headers: Vec<Header> = vec![
        Header::CallId("test-call".to_string().into()),
        Header::From("<sip:bob@example.com>;tag=bob-tag".to_string().into()),
        Header::To("<sip:alice@example.com>;tag=alice-tag".to_string().into()),
        Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: method.clone(),
            }
            .into(),
        ),
        Header::MaxForwards(70.into()),
    ];
    let content = match body {
        Some(body) => {
            headers.push(Header::ContentType(body.content_type.clone().into()));
            body.content.clone()
        }
        None => Vec::new(),
    };
    rsip::Request {
        method,
        uri: uri("sip:alice@example.com"),
        headers: headers.into(),
        version: rsip::Version::V2,
        body: content,
    }
}

pub(crate) fn incoming(
    method: Method,
    cseq: u32,
    body: Option<&Body>,
) -> (IncomingRequest, ReplyCommandReceiver) {
    let (reply, rx) = ReplyHandle::new();
    (
        IncomingRequest {
            request: in_dialog_request(method, cseq, body),
            reply,
        },
        rx,
    )
}

pub(crate) fn reply_status(rx: &mut ReplyCommandReceiver) -> StatusCode {
    match rx.try_recv().expect("a reply must have been sent") {
        ReplyCommand::Respond { status, .. } => status,
    }
}

pub(crate) fn uac_session(transaction: Arc<MockTransactionLayer>, offer: Option<Body>) -> Session {
    Session::new_uac(
        transaction,
        SessionOption {
            call_id: "test-call".to_string(),
            local_tag: "alice-tag".to_string(),
            local_uri: uri("sip:alice@example.com"),
            remote_uri: uri("sip:bob@example.com"),
            contact: Some(uri("sip:alice@127.0.0.1:5060")),
            ..Default::default()
        },
        offer,
    )
    .expect("session")
}

/// A UAC session driven through the plain establishment flow: offer in
/// the INVITE, 180, answer in the 2xx, empty ACK.
pub(crate) fn confirmed_uac(transaction: Arc<MockTransactionLayer>) -> Session {
    let session = uac_session(transaction, Some(sdp("offer-1")));
    session
        .provisional(StatusCode::Ringing, None, None)
        .expect("provisional");
    session
        .establish(Some("bob-tag"), None, Some(sdp("answer-1")))
        .expect("establish");
    session.ack(None).expect("ack");
    session
}
