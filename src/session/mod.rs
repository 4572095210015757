use crate::{transaction::Role, Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod delegate;
pub mod requests;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod tests;

pub use delegate::{Disposition, ReinviteDisposition, RequestDelegate, SessionDelegate};
pub use requests::{RequestHandle, RequestOptions};
pub use session::{Session, SessionOption, SessionState, TerminatedReason};
pub use signaling::{Originator, SignalingState};

/// SIP Session Identifier
///
/// Uniquely identifies one dialog. Per RFC 3261 a dialog is identified by
/// the Call-ID and the two tags; the id is only a full dialog id once both
/// tags are assigned.
///
/// # Notes
///
/// - During early dialog establishment `remote_tag` may be empty
/// - Once both tags are assigned the id is stable for the dialog lifetime
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl SessionId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        SessionId {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: String::new(),
        }
    }

    /// True once both tags are assigned, i.e. the session is a full dialog.
    pub fn is_established(&self) -> bool {
        !self.local_tag.is_empty() && !self.remote_tag.is_empty()
    }

    /// Derive a SessionId from an in-dialog request, role deciding which tag
    /// is local. For a UAC the from-tag is local; for a UAS the to-tag is.
    pub fn from_request(role: Role, request: &rsip::Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();

        let from_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::SipMessage("from tag not found".to_string())),
        };
        let to_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => "".to_string(),
        };

        let (local_tag, remote_tag) = match role {
            Role::Uac => (from_tag, to_tag),
            Role::Uas => (to_tag, from_tag),
        };

        Ok(SessionId {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.remote_tag.is_empty() {
            write!(f, "{}-{}", self.call_id, self.local_tag)
        } else {
            write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
        }
    }
}

/// Opaque content container used as offer/answer payload and as
/// INFO/NOTIFY/REFER payload. The session layer never interprets the
/// payload, only its presence and the offer/answer role it plays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Body {
    pub content_type: String,
    pub content: Vec<u8>,
}

impl Body {
    pub fn new(content_type: impl Into<String>, content: Vec<u8>) -> Self {
        Body {
            content_type: content_type.into(),
            content,
        }
    }
}
