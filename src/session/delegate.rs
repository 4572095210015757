use super::{session::SessionState, signaling::SignalingState, Body};
use crate::Error;
use rsip::StatusCode;

/// How the session should answer a non-negotiating incoming request
/// (INFO, NOTIFY, REFER).
#[derive(Debug, Clone)]
pub enum Disposition {
    Accept,
    Reject(StatusCode),
}

/// How the session should answer an incoming re-INVITE offer.
///
/// `Answer` commits the local answer to the signaling machine and replies
/// 200 with it; `Reject` replies with the given status and leaves the
/// signaling machine untouched.
#[derive(Debug, Clone)]
pub enum ReinviteDisposition {
    Answer(Body),
    Reject(StatusCode),
}

/// Observer registered by the owning application on one session.
///
/// Every method has a default so a session with no delegate (or a delegate
/// that only cares about some notifications) is always safe: lifecycle and
/// signaling notifications default to no-ops, incoming request hooks default
/// to the method specific auto-handling policy.
pub trait SessionDelegate: Send + Sync {
    /// The session state machine committed a transition.
    fn on_session_state(&self, _state: &SessionState) {}

    /// The signaling state machine committed a transition.
    fn on_signaling_state(&self, _state: SignalingState) {}

    /// An incoming BYE terminated the session. The 200 reply and the state
    /// transition have already happened; this is a pure notification.
    fn on_bye(&self, _request: &rsip::Request) {}

    /// An incoming re-INVITE carried a new offer. Returning `Answer`
    /// completes the offer/answer round and accepts the request. Without a
    /// delegate the session rejects with 488 Not Acceptable Here.
    fn on_reinvite(&self, _offer: &Body, _request: &rsip::Request) -> ReinviteDisposition {
        ReinviteDisposition::Reject(StatusCode::NotAcceptableHere)
    }

    /// An incoming INFO was received. Defaults to accepting with 200.
    fn on_info(&self, _request: &rsip::Request) -> Disposition {
        Disposition::Accept
    }

    /// An incoming NOTIFY (REFER progress) was received.
    fn on_notify(&self, _request: &rsip::Request) -> Disposition {
        Disposition::Accept
    }

    /// An incoming REFER was received. Accepting it opens the REFER implied
    /// subscription, making outgoing NOTIFY legal on this session.
    fn on_refer(&self, _request: &rsip::Request) -> Disposition {
        Disposition::Accept
    }
}

/// Observer for one dispatched request, passed per call to the dispatcher.
///
/// All methods default to no-ops; the request outcome always also reaches
/// the caller through the request handle.
pub trait RequestDelegate: Send + Sync {
    /// A provisional (1xx) response arrived.
    fn on_provisional(&self, _response: &rsip::Response) {}

    /// A 2xx final response arrived; the handle is about to resolve.
    fn on_accept(&self, _response: &rsip::Response) {}

    /// A non-2xx final response arrived; the handle is about to fail.
    fn on_reject(&self, _response: &rsip::Response) {}

    /// The request failed without a response (timeout, transport failure,
    /// disposal).
    fn on_failure(&self, _error: &Error) {}
}
