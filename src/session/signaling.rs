use super::Body;
use crate::{Error, Result};
use tracing::debug;

/// Offer/Answer State
///
/// Tracks the progress of one offer/answer exchange per RFC 3264, following
/// the SIP usage patterns of RFC 6337 section 2.2. Pure state, no I/O.
///
/// An offer may only be issued from `Initial` or `Stable`; the answer is
/// always issued by the side that did not send the offer. `Closed` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Initial,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Initial => write!(f, "Initial"),
            SignalingState::HaveLocalOffer => write!(f, "HaveLocalOffer"),
            SignalingState::HaveRemoteOffer => write!(f, "HaveRemoteOffer"),
            SignalingState::Stable => write!(f, "Stable"),
            SignalingState::Closed => write!(f, "Closed"),
        }
    }
}

/// Which side of the dialog an offer or answer originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Originator {
    Local,
    Remote,
}

#[derive(Clone)]
struct Checkpoint {
    state: SignalingState,
    offer: Option<Body>,
    answer: Option<Body>,
}

/// The offer/answer state machine for one dialog.
///
/// Invariants, enforced at every observable point:
/// - `offer` is `Some` iff the state is not `Initial` and not `Closed`
/// - `answer` is `Some` iff the state is `Stable`
/// - an illegal submission leaves every field untouched
#[derive(Clone)]
pub struct Signaling {
    state: SignalingState,
    offer: Option<Body>,
    answer: Option<Body>,
    // snapshot taken before each accepted offer/answer, restored by rollback()
    checkpoint: Option<Checkpoint>,
}

impl Default for Signaling {
    fn default() -> Self {
        Signaling {
            state: SignalingState::Initial,
            offer: None,
            answer: None,
            checkpoint: None,
        }
    }
}

impl Signaling {
    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// The outstanding or last negotiated offer. `None` iff the state is
    /// `Initial` or `Closed`.
    pub fn offer(&self) -> Option<&Body> {
        self.offer.as_ref()
    }

    /// The negotiated answer. `None` unless the state is `Stable`.
    pub fn answer(&self) -> Option<&Body> {
        self.answer.as_ref()
    }

    pub fn is_stable(&self) -> bool {
        self.state == SignalingState::Stable
    }

    pub fn is_closed(&self) -> bool {
        self.state == SignalingState::Closed
    }

    /// Submit a new offer. Legal only from `Initial` or `Stable`.
    pub fn apply_offer(&mut self, originator: Originator, body: Body) -> Result<()> {
        match self.state {
            SignalingState::Initial | SignalingState::Stable => {}
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "offer not legal in signaling state {}",
                    state
                )))
            }
        }
        self.checkpoint = Some(Checkpoint {
            state: self.state,
            offer: self.offer.clone(),
            answer: self.answer.clone(),
        });
        self.state = match originator {
            Originator::Local => SignalingState::HaveLocalOffer,
            Originator::Remote => SignalingState::HaveRemoteOffer,
        };
        self.offer = Some(body);
        self.answer = None;
        debug!(state = %self.state, "signaling offer accepted");
        Ok(())
    }

    /// Submit the answer to the outstanding offer. Legal only from the side
    /// that did not send the offer.
    pub fn apply_answer(&mut self, originator: Originator, body: Body) -> Result<()> {
        match (self.state, originator) {
            (SignalingState::HaveLocalOffer, Originator::Remote)
            | (SignalingState::HaveRemoteOffer, Originator::Local) => {}
            (state, _) => {
                return Err(Error::ProtocolViolation(format!(
                    "{:?} answer not legal in signaling state {}",
                    originator, state
                )))
            }
        }
        self.checkpoint = Some(Checkpoint {
            state: self.state,
            offer: self.offer.clone(),
            answer: self.answer.clone(),
        });
        self.state = SignalingState::Stable;
        self.answer = Some(body);
        debug!(state = %self.state, "signaling answer accepted");
        Ok(())
    }

    /// Undo the last accepted offer or answer, restoring the prior
    /// consistent state. Used when a dispatched offer is rejected or its
    /// transaction fails: the prior stable answer comes back rather than
    /// leaving a dangling offer.
    pub fn rollback(&mut self) {
        if let Some(cp) = self.checkpoint.take() {
            debug!(from = %self.state, to = %cp.state, "signaling rollback");
            self.state = cp.state;
            self.offer = cp.offer;
            self.answer = cp.answer;
        }
    }

    /// Close the machine when the dialog terminates. Terminal; every
    /// subsequent submission is rejected.
    pub fn close(&mut self) {
        self.state = SignalingState::Closed;
        self.offer = None;
        self.answer = None;
        self.checkpoint = None;
    }
}
