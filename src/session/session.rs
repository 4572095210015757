use super::{
    delegate::{Disposition, ReinviteDisposition, SessionDelegate},
    requests::ReinviteGuard,
    signaling::{Originator, Signaling, SignalingState},
    Body, SessionId,
};
use crate::{
    transaction::{IncomingRequest, ReplyHandle, Role, TransactionLayer},
    Error, Result,
};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, StatusCode, StatusCodeKind};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// SIP Session State
///
/// Lifecycle of one dialog as seen by the session layer (RFC 3261
/// section 13):
///
/// * `Initial` - session created, establishing INVITE not yet answered
/// * `Early` - a provisional (1xx) response was sent or received
/// * `AckWait` - a 2xx final response was sent or received, dialog
///   established, waiting for the ACK handshake
/// * `Confirmed` - the ACK was sent or received
/// * `Terminated` - the dialog ended; absorbing, no transition leaves it
#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Initial,
    Early,
    AckWait,
    Confirmed,
    Terminated(TerminatedReason),
}

#[derive(Clone, Debug, PartialEq)]
pub enum TerminatedReason {
    UacBye,
    UasBye,
    Rejected(StatusCode),
    Timeout,
    TransportError,
    Disposed,
}

impl SessionState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SessionState::Confirmed)
    }
    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Terminated(_))
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Initial => write!(f, "Initial"),
            SessionState::Early => write!(f, "Early"),
            SessionState::AckWait => write!(f, "AckWait"),
            SessionState::Confirmed => write!(f, "Confirmed"),
            SessionState::Terminated(reason) => write!(f, "Terminated({:?})", reason),
        }
    }
}

/// The last reliable provisional seen on the establishing INVITE
/// (RFC 3262). Needed to build the RAck header for PRACK and to drop
/// stale or retransmitted RSeq values.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReliableProvisional {
    pub rseq: u32,
    pub carried_offer: bool,
}

pub(crate) enum Negotiated {
    Offer,
    Answer,
}

/// Internal session state shared by the cloneable [`Session`] handles.
///
/// Holds the immutable identity fields, the two state machines, sequence
/// numbers, the re-INVITE guard and the collaborator references. Mutated
/// only by the dispatcher and by collaborator delivered events; callers
/// serialize their own calls into one session.
pub struct SessionInner {
    pub role: Role,
    pub cancel_token: CancellationToken,

    pub(crate) id: Mutex<SessionId>,
    pub(crate) local_uri: rsip::Uri,
    pub(crate) remote_uri: rsip::Uri,
    pub(crate) remote_target: Mutex<rsip::Uri>,
    pub(crate) local_contact: Option<rsip::Uri>,

    pub(crate) state: Mutex<SessionState>,
    pub(crate) signaling: Mutex<Signaling>,

    pub(crate) local_seq: AtomicU32,
    pub(crate) remote_seq: AtomicU32,
    // CSeq of the establishing INVITE, used for the RAck header
    pub(crate) invite_cseq: u32,

    pub(crate) reliable: Mutex<Option<ReliableProvisional>>,
    // set once a REFER is exchanged; gates outgoing NOTIFY (RFC 3515)
    pub(crate) refer_active: AtomicBool,
    pub(crate) reinvite_guard: ReinviteGuard,

    pub(crate) delegate: Option<Arc<dyn SessionDelegate>>,
    pub(crate) transaction: Arc<dyn TransactionLayer>,
}

pub(crate) type SessionInnerRef = Arc<SessionInner>;

/// Identity and addressing for a new session.
pub struct SessionOption {
    pub call_id: String,
    pub local_tag: String,
    pub local_uri: rsip::Uri,
    pub remote_uri: rsip::Uri,
    pub contact: Option<rsip::Uri>,
    /// CSeq of the establishing INVITE.
    pub invite_cseq: u32,
    pub delegate: Option<Arc<dyn SessionDelegate>>,
}

impl Default for SessionOption {
    fn default() -> Self {
        SessionOption {
            call_id: String::new(),
            local_tag: String::new(),
            local_uri: rsip::Uri::default(),
            remote_uri: rsip::Uri::default(),
            contact: None,
            invite_cseq: 1,
            delegate: None,
        }
    }
}

/// One negotiated real-time session between two user agents.
///
/// A `Session` is created when an outbound INVITE is initiated
/// ([`Session::new_uac`]) or an inbound INVITE is accepted for processing
/// ([`Session::new_uas`]). The owner drives the establishing INVITE
/// transaction and surfaces its events through [`provisional`],
/// [`establish`], [`ack`] and [`establishment_failed`]; once confirmed, in
/// dialog requests are dispatched through the methods in
/// [`requests`](super::requests).
///
/// `Session` is cheap to clone; clones share the same dialog state.
///
/// [`provisional`]: Session::provisional
/// [`establish`]: Session::establish
/// [`ack`]: Session::ack
/// [`establishment_failed`]: Session::establishment_failed
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: SessionInnerRef,
}

impl Session {
    /// Create a UAC session for an outbound INVITE. The INVITE's offer, if
    /// any, moves the signaling machine to `HaveLocalOffer`.
    pub fn new_uac(
        transaction: Arc<dyn TransactionLayer>,
        option: SessionOption,
        offer: Option<Body>,
    ) -> Result<Session> {
        Self::new(transaction, option, Role::Uac, String::new(), offer)
    }

    /// Create a UAS session for an inbound INVITE. The INVITE's offer, if
    /// any, moves the signaling machine to `HaveRemoteOffer`.
    pub fn new_uas(
        transaction: Arc<dyn TransactionLayer>,
        option: SessionOption,
        remote_tag: impl Into<String>,
        offer: Option<Body>,
    ) -> Result<Session> {
        Self::new(transaction, option, Role::Uas, remote_tag.into(), offer)
    }

    fn new(
        transaction: Arc<dyn TransactionLayer>,
        option: SessionOption,
        role: Role,
        remote_tag: String,
        offer: Option<Body>,
    ) -> Result<Session> {
        let mut signaling = Signaling::default();
        if let Some(body) = offer {
            let originator = match role {
                Role::Uac => Originator::Local,
                Role::Uas => Originator::Remote,
            };
            signaling.apply_offer(originator, body)?;
        }

        let id = SessionId {
            call_id: option.call_id,
            local_tag: option.local_tag,
            remote_tag,
        };

        let inner = SessionInner {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id),
            local_uri: option.local_uri,
            remote_uri: option.remote_uri.clone(),
            remote_target: Mutex::new(option.remote_uri),
            local_contact: option.contact,
            state: Mutex::new(SessionState::Initial),
            signaling: Mutex::new(signaling),
            local_seq: AtomicU32::new(option.invite_cseq),
            remote_seq: AtomicU32::new(match role {
                Role::Uac => 0,
                Role::Uas => option.invite_cseq,
            }),
            invite_cseq: option.invite_cseq,
            reliable: Mutex::new(None),
            refer_active: AtomicBool::new(false),
            reinvite_guard: ReinviteGuard::default(),
            delegate: option.delegate,
            transaction,
        };

        Ok(Session {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id.lock().unwrap().clone()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn local_uri(&self) -> &rsip::Uri {
        &self.inner.local_uri
    }

    pub fn remote_uri(&self) -> &rsip::Uri {
        &self.inner.remote_uri
    }

    pub fn remote_target(&self) -> rsip::Uri {
        self.inner.remote_target.lock().unwrap().clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.inner.signaling.lock().unwrap().state()
    }

    /// The outstanding or last negotiated offer. `None` iff the signaling
    /// state is `Initial` or `Closed`.
    pub fn offer(&self) -> Option<Body> {
        self.inner.signaling.lock().unwrap().offer().cloned()
    }

    /// The negotiated answer. `None` unless the signaling state is `Stable`.
    pub fn answer(&self) -> Option<Body> {
        self.inner.signaling.lock().unwrap().answer().cloned()
    }

    pub fn is_confirmed(&self) -> bool {
        self.inner.is_confirmed()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// Update the remote target after a target refresh request (re-INVITE,
    /// UPDATE). A pure overwrite, legal while the session is not terminated.
    pub fn set_remote_target(&self, uri: rsip::Uri) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }
        *self.inner.remote_target.lock().unwrap() = uri;
        Ok(())
    }

    /// A provisional (1xx) response to the establishing INVITE was sent
    /// (UAS) or received (UAC).
    ///
    /// A body is an answer when an offer from this side is open, otherwise
    /// a new offer to be answered by PRACK (RFC 3262 patterns 3 and 4).
    /// `rseq` marks the provisional as reliable; stale RSeq values are
    /// dropped.
    pub fn provisional(
        &self,
        status: StatusCode,
        body: Option<Body>,
        rseq: Option<u32>,
    ) -> Result<()> {
        if self.inner.is_terminated() {
            warn!(id = %self.id(), "ignoring provisional on terminated session");
            return Ok(());
        }
        if status.kind() != StatusCodeKind::Provisional {
            return Err(Error::ProtocolViolation(format!(
                "{} is not a provisional response",
                status
            )));
        }
        match *self.inner.state.lock().unwrap() {
            SessionState::Initial | SessionState::Early => {}
            ref state => {
                warn!(id = %self.id(), state = %state, "ignoring provisional");
                return Ok(());
            }
        }

        if let Some(rseq) = rseq {
            let reliable = self.inner.reliable.lock().unwrap();
            if let Some(prior) = reliable.as_ref() {
                if prior.rseq >= rseq {
                    debug!(id = %self.id(), rseq, "dropping stale reliable provisional");
                    return Ok(());
                }
            }
        }

        let mut carried_offer = false;
        if let Some(body) = body {
            let origin = self.inner.response_origin();
            carried_offer = matches!(self.inner.apply_body(origin, body)?, Negotiated::Offer);
        }

        if let Some(rseq) = rseq {
            *self.inner.reliable.lock().unwrap() = Some(ReliableProvisional {
                rseq,
                carried_offer,
            });
        }

        self.inner.transition(SessionState::Early);
        Ok(())
    }

    /// A 2xx final response to the establishing INVITE was sent (UAS) or
    /// received (UAC): the dialog is established and waits for the ACK.
    ///
    /// Assigns the remote tag (one time), refreshes the remote target, and
    /// applies the body as answer or offer per the open signaling state.
    pub fn establish(
        &self,
        remote_tag: Option<&str>,
        remote_target: Option<rsip::Uri>,
        body: Option<Body>,
    ) -> Result<()> {
        if self.inner.is_terminated() {
            warn!(id = %self.id(), "ignoring 2xx on terminated session");
            return Ok(());
        }
        match *self.inner.state.lock().unwrap() {
            SessionState::Initial | SessionState::Early => {}
            ref state => {
                warn!(id = %self.id(), state = %state, "ignoring retransmitted 2xx");
                return Ok(());
            }
        }

        if let Some(tag) = remote_tag {
            self.inner.set_remote_tag(tag);
        }
        if let Some(target) = remote_target {
            *self.inner.remote_target.lock().unwrap() = target;
        }
        if let Some(body) = body {
            self.inner.apply_body(self.inner.response_origin(), body)?;
        }
        // provisional phase is over
        self.inner.reliable.lock().unwrap().take();

        self.inner.transition(SessionState::AckWait);
        Ok(())
    }

    /// The ACK for the 2xx was sent (UAC) or received (UAS). A body is the
    /// answer to an offer carried by the 2xx (RFC 6337 pattern 2).
    pub fn ack(&self, body: Option<Body>) -> Result<()> {
        match *self.inner.state.lock().unwrap() {
            SessionState::AckWait => {}
            ref state => {
                warn!(id = %self.id(), state = %state, "ignoring ack");
                return Ok(());
            }
        }
        if let Some(body) = body {
            let origin = match self.inner.role {
                Role::Uac => Originator::Local,
                Role::Uas => Originator::Remote,
            };
            self.inner.apply_body(origin, body)?;
        }
        self.inner.transition(SessionState::Confirmed);
        Ok(())
    }

    /// A non-2xx final response terminated the establishing INVITE.
    pub fn establishment_failed(&self, status: StatusCode) -> Result<()> {
        match status.kind() {
            StatusCodeKind::Provisional | StatusCodeKind::Successful => {
                return Err(Error::ProtocolViolation(format!(
                    "{} does not terminate an early dialog",
                    status
                )));
            }
            _ => {}
        }
        match *self.inner.state.lock().unwrap() {
            SessionState::Initial | SessionState::Early => {}
            ref state => {
                warn!(id = %self.id(), state = %state, "ignoring late establishment failure");
                return Ok(());
            }
        }
        self.inner.terminate(TerminatedReason::Rejected(status));
        Ok(())
    }

    /// The establishing INVITE ended without a final response (transaction
    /// timeout or transport failure). Terminates any non-terminal session;
    /// the peer may never have seen the request, so nothing is assumed
    /// about its state.
    pub fn establishment_error(&self, error: &Error) {
        if self.inner.is_terminated() {
            return;
        }
        warn!(id = %self.id(), error = %error, "establishment failed without a final response");
        let reason = match error {
            Error::TransactionTimeout => TerminatedReason::Timeout,
            _ => TerminatedReason::TransportError,
        };
        self.inner.terminate(reason);
    }

    /// Submit the local answer to a remote offer (inbound INVITE or
    /// incoming re-INVITE), completing the offer/answer round at `Stable`.
    pub fn answer_offer(&self, body: Body) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }
        self.inner
            .signaling
            .lock()
            .unwrap()
            .apply_answer(Originator::Local, body)?;
        self.inner.notify_signaling();
        Ok(())
    }

    /// Destroy the session: immediate transition to `Terminated`, every
    /// outstanding request handle fails with a disposal error. Idempotent,
    /// never blocks.
    pub fn dispose(&self) {
        if self.inner.is_terminated() {
            return;
        }
        debug!(id = %self.id(), "disposing session");
        self.inner.cancel_token.cancel();
        self.inner.terminate(TerminatedReason::Disposed);
    }

    /// Handle an incoming in-dialog request routed to this session.
    ///
    /// Validates the remote CSeq, dispatches by method, and guarantees one
    /// final response through the request's reply handle. Without a
    /// delegate, method specific defaults apply: BYE and INFO/NOTIFY are
    /// accepted, REFER is accepted (opening the implied subscription), a
    /// re-INVITE offer is rejected with 488, unknown methods with 405.
    pub async fn receive(&self, incoming: IncomingRequest) -> Result<()> {
        let IncomingRequest { request, reply } = incoming;
        debug!(
            id = %self.id(),
            method = %request.method,
            state = %self.session_state(),
            "received in-dialog request"
        );

        if self.inner.is_terminated() {
            reply
                .reply(StatusCode::CallTransactionDoesNotExist)
                .await?;
            return Ok(());
        }

        let cseq = request.cseq_header()?.seq()?;
        let remote_seq = self.inner.remote_seq.load(Ordering::Relaxed);
        if remote_seq > 0 && cseq < remote_seq {
            debug!(id = %self.id(), remote_seq, cseq, "received old request");
            reply.reply(StatusCode::ServerInternalError).await?;
            return Ok(());
        }
        self.inner
            .remote_seq
            .compare_exchange(remote_seq, cseq, Ordering::Relaxed, Ordering::Relaxed)
            .ok();

        match request.method.clone() {
            Method::Bye => self.handle_bye(request, reply).await,
            Method::Invite => self.handle_reinvite(request, reply).await,
            Method::Info => self.handle_info(request, reply).await,
            Method::Notify => self.handle_notify(request, reply).await,
            Method::Refer => self.handle_refer(request, reply).await,
            Method::PRack => self.handle_prack(request, reply).await,
            _ => {
                debug!(id = %self.id(), method = %request.method, "unsupported request method");
                reply.reply(StatusCode::MethodNotAllowed).await?;
                Ok(())
            }
        }
    }

    async fn handle_bye(&self, request: rsip::Request, reply: ReplyHandle) -> Result<()> {
        debug!(id = %self.id(), "received bye");
        let reason = match self.inner.role {
            Role::Uac => TerminatedReason::UasBye,
            Role::Uas => TerminatedReason::UacBye,
        };
        self.inner.terminate(reason);
        reply.reply(StatusCode::OK).await?;
        if let Some(delegate) = &self.inner.delegate {
            delegate.on_bye(&request);
        }
        Ok(())
    }

    async fn handle_reinvite(&self, request: rsip::Request, reply: ReplyHandle) -> Result<()> {
        debug!(id = %self.id(), "received reinvite");
        if !self.inner.is_confirmed() || self.inner.reinvite_guard.is_busy() {
            reply.reply(StatusCode::RequestPending).await?;
            return Ok(());
        }
        let Some(offer) = body_from_request(&request) else {
            reply.reply(StatusCode::NotAcceptableHere).await?;
            return Ok(());
        };
        let disposition = match &self.inner.delegate {
            Some(delegate) => delegate.on_reinvite(&offer, &request),
            None => ReinviteDisposition::Reject(StatusCode::NotAcceptableHere),
        };
        match disposition {
            ReinviteDisposition::Answer(answer) => {
                {
                    let mut signaling = self.inner.signaling.lock().unwrap();
                    if let Err(e) = signaling
                        .apply_offer(Originator::Remote, offer)
                        .and_then(|_| signaling.apply_answer(Originator::Local, answer.clone()))
                    {
                        drop(signaling);
                        warn!(id = %self.id(), error = %e, "rejecting reinvite offer");
                        reply.reply(StatusCode::RequestPending).await?;
                        return Ok(());
                    }
                }
                self.inner.notify_signaling();
                // re-INVITE is a target refresh request
                if let Some(contact) = contact_uri(&request) {
                    *self.inner.remote_target.lock().unwrap() = contact;
                }
                reply
                    .respond(
                        StatusCode::OK,
                        Some(vec![Header::ContentType(
                            answer.content_type.clone().into(),
                        )]),
                        Some(answer.content.clone()),
                    )
                    .await?;
            }
            ReinviteDisposition::Reject(status) => {
                reply.reply(status).await?;
            }
        }
        Ok(())
    }

    async fn handle_info(&self, request: rsip::Request, reply: ReplyHandle) -> Result<()> {
        debug!(id = %self.id(), "received info");
        let disposition = match &self.inner.delegate {
            Some(delegate) => delegate.on_info(&request),
            None => Disposition::Accept,
        };
        match disposition {
            Disposition::Accept => reply.reply(StatusCode::OK).await,
            Disposition::Reject(status) => reply.reply(status).await,
        }
    }

    async fn handle_notify(&self, request: rsip::Request, reply: ReplyHandle) -> Result<()> {
        debug!(id = %self.id(), "received notify");
        let disposition = match &self.inner.delegate {
            Some(delegate) => delegate.on_notify(&request),
            None => Disposition::Accept,
        };
        match disposition {
            Disposition::Accept => reply.reply(StatusCode::OK).await,
            Disposition::Reject(status) => reply.reply(status).await,
        }
    }

    async fn handle_refer(&self, request: rsip::Request, reply: ReplyHandle) -> Result<()> {
        debug!(id = %self.id(), "received refer");
        let disposition = match &self.inner.delegate {
            Some(delegate) => delegate.on_refer(&request),
            None => Disposition::Accept,
        };
        match disposition {
            Disposition::Accept => {
                // accepting a REFER opens the implied subscription
                self.inner.refer_active.store(true, Ordering::Relaxed);
                reply.reply(StatusCode::Accepted).await
            }
            Disposition::Reject(status) => reply.reply(status).await,
        }
    }

    async fn handle_prack(&self, request: rsip::Request, reply: ReplyHandle) -> Result<()> {
        debug!(id = %self.id(), "received prack");
        // a PRACK only acknowledges an unacknowledged reliable provisional;
        // anything else must not touch the signaling machine (RFC 3262)
        let reliable = *self.inner.reliable.lock().unwrap();
        let Some(reliable) = reliable else {
            debug!(id = %self.id(), "prack without a reliable provisional on record");
            reply
                .reply(StatusCode::CallTransactionDoesNotExist)
                .await?;
            return Ok(());
        };
        if let Some(body) = body_from_request(&request) {
            if !reliable.carried_offer {
                warn!(id = %self.id(), "rejecting prack answer, provisional carried no offer");
                reply.reply(StatusCode::NotAcceptableHere).await?;
                return Ok(());
            }
            // answer to the offer we sent in the reliable provisional
            let applied = self
                .inner
                .signaling
                .lock()
                .unwrap()
                .apply_answer(Originator::Remote, body);
            match applied {
                Ok(()) => self.inner.notify_signaling(),
                Err(e) => {
                    warn!(id = %self.id(), error = %e, "rejecting prack answer");
                    reply.reply(StatusCode::NotAcceptableHere).await?;
                    return Ok(());
                }
            }
        }
        self.inner.reliable.lock().unwrap().take();
        reply.reply(StatusCode::OK).await
    }
}

impl SessionInner {
    pub(crate) fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().is_terminated()
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.id.lock().unwrap().clone()
    }

    pub(crate) fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed);
        self.local_seq.load(Ordering::Relaxed)
    }

    /// Which side originated a body carried by a response to the
    /// establishing INVITE: remote for a UAC (we receive responses), local
    /// for a UAS (we send them).
    pub(crate) fn response_origin(&self) -> Originator {
        match self.role {
            Role::Uac => Originator::Remote,
            Role::Uas => Originator::Local,
        }
    }

    /// One-time remote tag assignment. Assigning a different tag twice is a
    /// programming contract violation.
    pub(crate) fn set_remote_tag(&self, tag: &str) {
        let mut id = self.id.lock().unwrap();
        if id.remote_tag.is_empty() {
            id.remote_tag = tag.to_string();
        } else if id.remote_tag != tag {
            debug_assert!(false, "remote tag assigned twice: {} -> {}", id.remote_tag, tag);
            warn!(id = %id, tag, "ignoring conflicting remote tag");
        }
    }

    /// Apply a body as answer or offer depending on the open signaling
    /// state. An open offer makes the body its answer; `Initial`/`Stable`
    /// makes it a new offer.
    pub(crate) fn apply_body(&self, origin: Originator, body: Body) -> Result<Negotiated> {
        let negotiated = {
            let mut signaling = self.signaling.lock().unwrap();
            match signaling.state() {
                SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                    signaling.apply_answer(origin, body)?;
                    Negotiated::Answer
                }
                SignalingState::Initial | SignalingState::Stable => {
                    signaling.apply_offer(origin, body)?;
                    Negotiated::Offer
                }
                SignalingState::Closed => {
                    return Err(Error::ProtocolViolation(
                        "signaling closed".to_string(),
                    ))
                }
            }
        };
        self.notify_signaling();
        Ok(negotiated)
    }

    pub(crate) fn notify_signaling(&self) {
        if let Some(delegate) = &self.delegate {
            delegate.on_signaling_state(self.signaling.lock().unwrap().state());
        }
    }

    pub(crate) fn transition(&self, next: SessionState) {
        {
            let mut state = self.state.lock().unwrap();
            match (&*state, &next) {
                (SessionState::Terminated(_), _) => {
                    warn!(
                        id = %self.session_id(),
                        target = %next,
                        "session already terminated, ignoring transition"
                    );
                    return;
                }
                (SessionState::Confirmed, SessionState::AckWait) => {
                    warn!(target = %next, "session already confirmed, ignoring transition");
                    return;
                }
                _ => {}
            }
            if *state == next {
                return;
            }
            debug!(id = %self.session_id(), from = %state, to = %next, "transitioning state");
            *state = next.clone();
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_session_state(&next);
        }
    }

    /// Terminate the dialog: close the signaling machine and commit the
    /// absorbing `Terminated` state.
    pub(crate) fn terminate(&self, reason: TerminatedReason) {
        let closed = {
            let mut signaling = self.signaling.lock().unwrap();
            if signaling.is_closed() {
                false
            } else {
                signaling.close();
                true
            }
        };
        if closed {
            self.notify_signaling();
        }
        self.transition(SessionState::Terminated(reason));
    }

    /// Build an in-dialog request the dialog identity prescribes: fresh
    /// CSeq, Call-ID, tagged From/To, Contact, targeted at the current
    /// remote target.
    pub(crate) fn make_request(
        &self,
        method: Method,
        extra_headers: Vec<Header>,
        body: Option<&Body>,
    ) -> Result<rsip::Request> {
        let cseq = self.increment_local_seq();
        let id = self.session_id();

        let mut headers = extra_headers;
        headers.push(Header::CallId(id.call_id.clone().into()));
        headers.push(Header::From(
            name_addr(&self.local_uri, &id.local_tag).into(),
        ));
        headers.push(Header::To(
            name_addr(&self.remote_uri, &id.remote_tag).into(),
        ));
        headers.push(Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: method.clone(),
            }
            .into(),
        ));
        if let Some(contact) = &self.local_contact {
            headers.push(rsip::typed::Contact::from(contact.clone()).into());
        }
        headers.push(Header::MaxForwards(70.into()));
        if let Some(body) = body {
            headers.push(Header::ContentType(body.content_type.clone().into()));
        }
        headers.push(Header::ContentLength(
            body.map_or(0u32, |b| b.content.len() as u32).into(),
        ));

        Ok(rsip::Request {
            method,
            uri: self.remote_target.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.map(|b| b.content.clone()).unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }
}

fn name_addr(uri: &rsip::Uri, tag: &str) -> String {
    if tag.is_empty() {
        format!("<{}>", uri)
    } else {
        format!("<{}>;tag={}", uri, tag)
    }
}

pub(crate) fn body_from_request(request: &rsip::Request) -> Option<Body> {
    if request.body.is_empty() {
        return None;
    }
    Some(Body::new(
        content_type(request.headers.iter()),
        request.body.clone(),
    ))
}

pub(crate) fn body_from_response(response: &rsip::Response) -> Option<Body> {
    if response.body.is_empty() {
        return None;
    }
    Some(Body::new(
        content_type(response.headers.iter()),
        response.body.clone(),
    ))
}

fn content_type<'a>(headers: impl Iterator<Item = &'a Header>) -> String {
    for header in headers {
        if let Header::ContentType(ct) = header {
            return ct.value().to_string();
        }
    }
    "application/sdp".to_string()
}

fn contact_uri(request: &rsip::Request) -> Option<rsip::Uri> {
    request
        .contact_header()
        .ok()
        .and_then(|c| c.clone().typed().ok())
        .map(|c| c.uri)
}
