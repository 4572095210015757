use crate::Result;
use async_trait::async_trait;
use rsip::StatusCode;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Which side of the dialog this user agent is on.
///
/// The role decides tag orientation (From/To) for outgoing requests and which
/// side of an establishment event counts as locally originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Uac,
    Uas,
}

/// Events surfaced by the transaction layer for one dispatched request.
///
/// The transaction layer guarantees zero or more `Provisional` events
/// followed by exactly one terminal event (`Final`, `Timeout` or
/// `TransportError`) per request. Retransmission and timer handling live
/// below this boundary.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Provisional(rsip::Response),
    Final(rsip::Response),
    Timeout,
    TransportError(String),
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;

/// The transaction layer collaborator consumed by the session layer.
///
/// `send_request` hands a fully built in-dialog request to the transaction
/// layer and returns the event channel for its outcome. An `Err` return
/// means the request never left the host; no state may have been committed
/// by the caller.
#[async_trait]
pub trait TransactionLayer: Send + Sync {
    async fn send_request(&self, request: rsip::Request) -> Result<TransactionEventReceiver>;
}

pub type ReplyCommandSender = mpsc::Sender<ReplyCommand>;
pub type ReplyCommandReceiver = mpsc::Receiver<ReplyCommand>;

#[derive(Debug)]
pub enum ReplyCommand {
    Respond {
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    },
}

/// Reply path for one incoming in-dialog request.
///
/// The transaction layer creates the receiving end when it delivers an
/// [`IncomingRequest`]; the session (or its delegate) must produce exactly
/// one final response through this handle.
#[derive(Clone, Debug)]
pub struct ReplyHandle {
    sender: ReplyCommandSender,
}

impl ReplyHandle {
    pub fn new() -> (Self, ReplyCommandReceiver) {
        let (tx, rx) = mpsc::channel(4);
        (Self { sender: tx }, rx)
    }

    pub async fn reply(&self, status: StatusCode) -> Result<()> {
        self.respond(status, None, None).await
    }

    pub async fn respond(
        &self,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        self.sender
            .send(ReplyCommand::Respond {
                status,
                headers,
                body,
            })
            .await?;
        Ok(())
    }
}

/// An incoming in-dialog request routed to a session by the owner.
#[derive(Debug)]
pub struct IncomingRequest {
    pub request: rsip::Request,
    pub reply: ReplyHandle,
}
