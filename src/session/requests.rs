use super::{
    delegate::RequestDelegate,
    session::{body_from_response, Session, SessionInnerRef, TerminatedReason},
    signaling::Originator,
    Body,
};
use crate::{
    transaction::{Role, TransactionEvent},
    Error, Result,
};
use rsip::{Header, Method, StatusCode, StatusCodeKind};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Per-request knobs for the in-dialog dispatchers.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub extra_headers: Vec<Header>,
    pub body: Option<Body>,
}

/// Pending outcome of a dispatched in-dialog request.
///
/// Returned synchronously by the dispatch methods; [`wait`](Self::wait)
/// resolves with the final 2xx response or the failure. Dropping the
/// handle does not cancel the request.
#[derive(Debug)]
pub struct RequestHandle {
    pub method: Method,
    pub cseq: u32,
    pub(crate) done: oneshot::Receiver<Result<rsip::Response>>,
}

impl RequestHandle {
    pub async fn wait(self) -> Result<rsip::Response> {
        self.done.await.unwrap_or(Err(Error::Disposed))
    }
}

/// Serializes re-INVITEs: only one may be in flight per session, in
/// either direction (RFC 3261 section 14).
#[derive(Default)]
pub(crate) struct ReinviteGuard {
    busy: AtomicBool,
}

impl ReinviteGuard {
    pub(crate) fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// What to do to the session when a dispatched request reaches its final
/// outcome.
#[derive(Clone, Copy)]
enum TerminalEffect {
    None,
    Bye,
    Reinvite,
    Refer,
    Prack { answered: bool },
}

impl Session {
    /// Send a BYE terminating the session.
    ///
    /// Legal from any non-terminal state. The session terminates when the
    /// transaction completes, whether the peer answered 2xx or not; a dead
    /// peer must not keep a session alive.
    pub fn bye(
        &self,
        delegate: Option<Arc<dyn RequestDelegate>>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        self.ensure_active()?;
        let request =
            self.inner
                .make_request(Method::Bye, options.extra_headers, options.body.as_ref())?;
        self.dispatch(request, delegate, TerminalEffect::Bye)
    }

    /// Send an INFO request (RFC 6086) with an application payload.
    pub fn info(
        &self,
        delegate: Option<Arc<dyn RequestDelegate>>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        self.ensure_active()?;
        self.ensure_confirmed(Method::Info)?;
        let request =
            self.inner
                .make_request(Method::Info, options.extra_headers, options.body.as_ref())?;
        self.dispatch(request, delegate, TerminalEffect::None)
    }

    /// Send a re-INVITE renegotiating the session (RFC 3261 section 14).
    ///
    /// The offer in `options.body` is mandatory and is applied to the
    /// signaling machine before the request leaves. At most one re-INVITE
    /// may be in flight; a second attempt fails with
    /// [`Error::RequestPending`] and sends nothing. On any failure the
    /// signaling machine rolls back to its pre-offer state.
    pub fn invite(
        &self,
        delegate: Option<Arc<dyn RequestDelegate>>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        self.ensure_active()?;
        self.ensure_confirmed(Method::Invite)?;
        let offer = options.body.clone().ok_or_else(|| {
            Error::ProtocolViolation("re-INVITE requires an offer body".to_string())
        })?;
        if !self.inner.reinvite_guard.try_acquire() {
            return Err(Error::RequestPending);
        }
        {
            let mut signaling = self.inner.signaling.lock().unwrap();
            if let Err(e) = signaling.apply_offer(Originator::Local, offer.clone()) {
                drop(signaling);
                self.inner.reinvite_guard.release();
                return Err(e);
            }
        }
        self.inner.notify_signaling();

        let request = match self
            .inner
            .make_request(Method::Invite, options.extra_headers, Some(&offer))
        {
            Ok(request) => request,
            Err(e) => {
                rollback_signaling(&self.inner);
                self.inner.reinvite_guard.release();
                return Err(e);
            }
        };
        self.dispatch(request, delegate, TerminalEffect::Reinvite)
    }

    /// Send a NOTIFY inside the subscription implied by a REFER
    /// (RFC 3515). Fails unless a REFER was exchanged on this session.
    pub fn notify(
        &self,
        delegate: Option<Arc<dyn RequestDelegate>>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        self.ensure_active()?;
        self.ensure_confirmed(Method::Notify)?;
        if !self.inner.refer_active.load(Ordering::Relaxed) {
            return Err(Error::ProtocolViolation(
                "NOTIFY without a REFER implied subscription".to_string(),
            ));
        }
        let request = self.inner.make_request(
            Method::Notify,
            options.extra_headers,
            options.body.as_ref(),
        )?;
        self.dispatch(request, delegate, TerminalEffect::None)
    }

    /// Report transfer progress to the referrer: a NOTIFY carrying a
    /// `message/sipfrag` status line (RFC 3515 section 2.4.5).
    pub fn notify_refer(
        &self,
        status: StatusCode,
        subscription_state: &str,
    ) -> Result<RequestHandle> {
        let extra_headers = vec![
            Header::Other("Event".to_string(), "refer".to_string()),
            Header::Other("Subscription-State".to_string(), subscription_state.to_string()),
        ];
        let sipfrag = format!("SIP/2.0 {} {:?}", u16::from(status.clone()), status);
        let body = Body::new("message/sipfrag", sipfrag.into_bytes());
        self.notify(
            None,
            RequestOptions {
                extra_headers,
                body: Some(body),
            },
        )
    }

    /// Acknowledge a reliable provisional response (RFC 3262).
    ///
    /// UAC only, while the session is `Early` with an unacknowledged
    /// reliable provisional on record. A body answers the offer carried by
    /// that provisional and is applied before the request leaves; a failed
    /// PRACK rolls the answer back.
    pub fn prack(
        &self,
        delegate: Option<Arc<dyn RequestDelegate>>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        self.ensure_active()?;
        if self.inner.role != Role::Uac {
            return Err(Error::ProtocolViolation(
                "PRACK is sent by the caller".to_string(),
            ));
        }
        match self.session_state() {
            super::session::SessionState::Early => {}
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "PRACK not legal in session state {}",
                    state
                )));
            }
        }
        let reliable = self
            .inner
            .reliable
            .lock()
            .unwrap()
            .ok_or_else(|| {
                Error::ProtocolViolation("no reliable provisional to acknowledge".to_string())
            })?;

        let mut headers = options.extra_headers;
        headers.push(Header::Other(
            "RAck".to_string(),
            format!("{} {} {}", reliable.rseq, self.inner.invite_cseq, Method::Invite),
        ));

        let answered = match options.body.clone() {
            Some(body) => {
                if !reliable.carried_offer {
                    return Err(Error::ProtocolViolation(
                        "PRACK answer without an offer in the reliable provisional".to_string(),
                    ));
                }
                self.inner
                    .signaling
                    .lock()
                    .unwrap()
                    .apply_answer(Originator::Local, body)?;
                self.inner.notify_signaling();
                true
            }
            None => false,
        };

        let request = match self
            .inner
            .make_request(Method::PRack, headers, options.body.as_ref())
        {
            Ok(request) => request,
            Err(e) => {
                if answered {
                    rollback_signaling(&self.inner);
                }
                return Err(e);
            }
        };
        self.dispatch(request, delegate, TerminalEffect::Prack { answered })
    }

    /// Ask the peer to initiate a call to `refer_to` (blind transfer,
    /// RFC 3515). A 2xx acceptance opens the implied subscription, after
    /// which [`notify`](Self::notify) becomes legal.
    pub fn refer(
        &self,
        refer_to: rsip::Uri,
        delegate: Option<Arc<dyn RequestDelegate>>,
        options: RequestOptions,
    ) -> Result<RequestHandle> {
        self.ensure_active()?;
        self.ensure_confirmed(Method::Refer)?;
        let mut headers = options.extra_headers;
        headers.push(Header::Other(
            "Refer-To".to_string(),
            format!("<{}>", refer_to),
        ));
        let request = self
            .inner
            .make_request(Method::Refer, headers, options.body.as_ref())?;
        self.dispatch(request, delegate, TerminalEffect::Refer)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.inner.is_terminated() {
            return Err(Error::Terminated);
        }
        Ok(())
    }

    fn ensure_confirmed(&self, method: Method) -> Result<()> {
        if !self.inner.is_confirmed() {
            return Err(Error::ProtocolViolation(format!(
                "{} not legal in session state {}",
                method,
                self.session_state()
            )));
        }
        Ok(())
    }

    fn dispatch(
        &self,
        request: rsip::Request,
        delegate: Option<Arc<dyn RequestDelegate>>,
        effect: TerminalEffect,
    ) -> Result<RequestHandle> {
        let method = request.method.clone();
        let cseq = self.inner.local_seq.load(Ordering::Relaxed);
        debug!(id = %self.id(), method = %method, cseq, "dispatching in-dialog request");
        let (done, rx) = oneshot::channel();
        tokio::spawn(run_request(
            self.inner.clone(),
            request,
            delegate,
            effect,
            done,
        ));
        Ok(RequestHandle {
            method,
            cseq,
            done: rx,
        })
    }
}

/// Drive one dispatched request to its final outcome, then apply the
/// terminal effect atomically with resolving the handle.
async fn run_request(
    inner: SessionInnerRef,
    request: rsip::Request,
    delegate: Option<Arc<dyn RequestDelegate>>,
    effect: TerminalEffect,
    done: oneshot::Sender<Result<rsip::Response>>,
) {
    let method = request.method.clone();
    let mut events = match inner.transaction.send_request(request).await {
        Ok(events) => events,
        Err(e) => {
            resolve_failure(&inner, &method, effect, delegate.as_deref(), e, done);
            return;
        }
    };

    loop {
        let event = tokio::select! {
            _ = inner.cancel_token.cancelled() => {
                resolve_failure(&inner, &method, effect, delegate.as_deref(), Error::Disposed, done);
                return;
            }
            event = events.recv() => event,
        };
        match event {
            Some(TransactionEvent::Provisional(response)) => {
                if let Some(delegate) = &delegate {
                    delegate.on_provisional(&response);
                }
            }
            Some(TransactionEvent::Final(response)) => {
                if response.status_code.kind() == StatusCodeKind::Successful {
                    resolve_success(&inner, &method, effect, delegate.as_deref(), response, done);
                } else {
                    debug!(
                        id = %inner.session_id(),
                        method = %method,
                        status = %response.status_code,
                        "request rejected"
                    );
                    if let Some(delegate) = &delegate {
                        delegate.on_reject(&response);
                    }
                    let error = Error::RequestFailed {
                        status: response.status_code.clone(),
                        retry_after: retry_after_hint(&response),
                    };
                    apply_failure_effect(&inner, effect);
                    done.send(Err(error)).ok();
                }
                return;
            }
            Some(TransactionEvent::Timeout) => {
                resolve_failure(
                    &inner,
                    &method,
                    effect,
                    delegate.as_deref(),
                    Error::TransactionTimeout,
                    done,
                );
                return;
            }
            Some(TransactionEvent::TransportError(reason)) => {
                resolve_failure(
                    &inner,
                    &method,
                    effect,
                    delegate.as_deref(),
                    Error::TransportFailure(reason),
                    done,
                );
                return;
            }
            None => {
                resolve_failure(
                    &inner,
                    &method,
                    effect,
                    delegate.as_deref(),
                    Error::TransportFailure("transaction event channel closed".to_string()),
                    done,
                );
                return;
            }
        }
    }
}

fn resolve_success(
    inner: &SessionInnerRef,
    method: &Method,
    effect: TerminalEffect,
    delegate: Option<&dyn RequestDelegate>,
    response: rsip::Response,
    done: oneshot::Sender<Result<rsip::Response>>,
) {
    match effect {
        TerminalEffect::Bye => {
            inner.terminate(bye_reason(inner));
        }
        TerminalEffect::Reinvite => {
            match body_from_response(&response) {
                Some(answer) => {
                    let applied = inner
                        .signaling
                        .lock()
                        .unwrap()
                        .apply_answer(Originator::Remote, answer);
                    match applied {
                        Ok(()) => inner.notify_signaling(),
                        Err(e) => {
                            rollback_signaling(inner);
                            inner.reinvite_guard.release();
                            if let Some(delegate) = delegate {
                                delegate.on_failure(&e);
                            }
                            done.send(Err(e)).ok();
                            return;
                        }
                    }
                }
                None => {
                    warn!(id = %inner.session_id(), "2xx to re-INVITE without an answer body");
                    rollback_signaling(inner);
                    inner.reinvite_guard.release();
                    let error = Error::ProtocolViolation(
                        "2xx response to re-INVITE without an answer body".to_string(),
                    );
                    if let Some(delegate) = delegate {
                        delegate.on_failure(&error);
                    }
                    done.send(Err(error)).ok();
                    return;
                }
            }
            inner.reinvite_guard.release();
        }
        TerminalEffect::Refer => {
            // the peer accepted; the implied subscription is open
            inner.refer_active.store(true, Ordering::Relaxed);
        }
        TerminalEffect::Prack { .. } => {
            inner.reliable.lock().unwrap().take();
        }
        TerminalEffect::None => {}
    }
    debug!(
        id = %inner.session_id(),
        method = %method,
        status = %response.status_code,
        "request accepted"
    );
    if let Some(delegate) = delegate {
        delegate.on_accept(&response);
    }
    done.send(Ok(response)).ok();
}

fn resolve_failure(
    inner: &SessionInnerRef,
    method: &Method,
    effect: TerminalEffect,
    delegate: Option<&dyn RequestDelegate>,
    error: Error,
    done: oneshot::Sender<Result<rsip::Response>>,
) {
    debug!(
        id = %inner.session_id(),
        method = %method,
        error = %error,
        "request failed"
    );
    if let Some(delegate) = delegate {
        delegate.on_failure(&error);
    }
    apply_failure_effect(inner, effect);
    done.send(Err(error)).ok();
}

fn apply_failure_effect(inner: &SessionInnerRef, effect: TerminalEffect) {
    match effect {
        TerminalEffect::Bye => {
            // the dialog ends even when the peer never answered the BYE
            inner.terminate(bye_reason(inner));
        }
        TerminalEffect::Reinvite => {
            rollback_signaling(inner);
            inner.reinvite_guard.release();
        }
        TerminalEffect::Prack { answered } => {
            if answered {
                rollback_signaling(inner);
            }
        }
        TerminalEffect::Refer | TerminalEffect::None => {}
    }
}

fn bye_reason(inner: &SessionInnerRef) -> TerminatedReason {
    match inner.role {
        Role::Uac => TerminatedReason::UacBye,
        Role::Uas => TerminatedReason::UasBye,
    }
}

fn rollback_signaling(inner: &SessionInnerRef) {
    inner.signaling.lock().unwrap().rollback();
    inner.notify_signaling();
}

fn retry_after_hint(response: &rsip::Response) -> Option<u32> {
    response.headers.iter().find_map(|header| match header {
        Header::Other(name, value) if name.eq_ignore_ascii_case("Retry-After") => value
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok(),
        _ => None,
    })
}
