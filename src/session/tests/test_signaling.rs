use super::sdp;
use crate::session::signaling::{Originator, Signaling, SignalingState};
use crate::Error;

#[test]
fn test_offer_answer_round() -> crate::Result<()> {
    let mut signaling = Signaling::default();
    assert_eq!(signaling.state(), SignalingState::Initial);
    assert!(signaling.offer().is_none());
    assert!(signaling.answer().is_none());

    signaling.apply_offer(Originator::Local, sdp("o1"))?;
    assert_eq!(signaling.state(), SignalingState::HaveLocalOffer);
    assert_eq!(signaling.offer(), Some(&sdp("o1")));
    assert!(signaling.answer().is_none());

    signaling.apply_answer(Originator::Remote, sdp("a1"))?;
    assert_eq!(signaling.state(), SignalingState::Stable);
    assert_eq!(signaling.offer(), Some(&sdp("o1")));
    assert_eq!(signaling.answer(), Some(&sdp("a1")));
    Ok(())
}

#[test]
fn test_renegotiation_replaces_offer_and_clears_answer() -> crate::Result<()> {
    let mut signaling = Signaling::default();
    signaling.apply_offer(Originator::Remote, sdp("o1"))?;
    signaling.apply_answer(Originator::Local, sdp("a1"))?;

    signaling.apply_offer(Originator::Local, sdp("o2"))?;
    assert_eq!(signaling.state(), SignalingState::HaveLocalOffer);
    assert_eq!(signaling.offer(), Some(&sdp("o2")));
    assert!(signaling.answer().is_none());

    signaling.apply_answer(Originator::Remote, sdp("a2"))?;
    assert_eq!(signaling.answer(), Some(&sdp("a2")));
    Ok(())
}

#[test]
fn test_glare_offer_is_rejected_without_mutation() -> crate::Result<()> {
    let mut signaling = Signaling::default();
    signaling.apply_offer(Originator::Local, sdp("o1"))?;

    let err = signaling
        .apply_offer(Originator::Remote, sdp("o2"))
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    assert_eq!(signaling.state(), SignalingState::HaveLocalOffer);
    assert_eq!(signaling.offer(), Some(&sdp("o1")));
    Ok(())
}

#[test]
fn test_answer_from_offering_side_is_rejected() -> crate::Result<()> {
    let mut signaling = Signaling::default();
    signaling.apply_offer(Originator::Local, sdp("o1"))?;

    let err = signaling
        .apply_answer(Originator::Local, sdp("a1"))
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    assert_eq!(signaling.state(), SignalingState::HaveLocalOffer);
    assert!(signaling.answer().is_none());
    Ok(())
}

#[test]
fn test_answer_without_offer_is_rejected() {
    let mut signaling = Signaling::default();
    let err = signaling
        .apply_answer(Originator::Remote, sdp("a1"))
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
    assert_eq!(signaling.state(), SignalingState::Initial);
}

#[test]
fn test_rollback_restores_previous_negotiation() -> crate::Result<()> {
    let mut signaling = Signaling::default();
    signaling.apply_offer(Originator::Local, sdp("o1"))?;
    signaling.apply_answer(Originator::Remote, sdp("a1"))?;

    signaling.apply_offer(Originator::Local, sdp("o2"))?;
    signaling.rollback();

    assert_eq!(signaling.state(), SignalingState::Stable);
    assert_eq!(signaling.offer(), Some(&sdp("o1")));
    assert_eq!(signaling.answer(), Some(&sdp("a1")));
    Ok(())
}

#[test]
fn test_close_is_terminal() -> crate::Result<()> {
    let mut signaling = Signaling::default();
    signaling.apply_offer(Originator::Local, sdp("o1"))?;
    signaling.close();

    assert_eq!(signaling.state(), SignalingState::Closed);
    assert!(signaling.offer().is_none());
    assert!(signaling.answer().is_none());

    assert!(signaling.apply_offer(Originator::Local, sdp("o2")).is_err());

    // rollback must not reopen a closed machine
    signaling.rollback();
    assert_eq!(signaling.state(), SignalingState::Closed);
    Ok(())
}
