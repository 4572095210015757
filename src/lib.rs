//! A SIP session layer.
//!
//! One [`Session`](session::Session) per negotiated dialog, tracking the
//! dialog lifecycle (RFC 3261) and the offer/answer exchange
//! (RFC 3264/6337), dispatching in-dialog requests (BYE, INFO, re-INVITE,
//! NOTIFY, PRACK, REFER) through a transaction layer collaborator.

pub mod error;
pub mod session;
pub mod transaction;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
