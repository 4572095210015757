/// Session layer error taxonomy.
///
/// Precondition violations (`RequestPending`, `ProtocolViolation`,
/// `Terminated`) are reported synchronously before any network effect.
/// In-flight failures (`RequestFailed`, `TransactionTimeout`,
/// `TransportFailure`, `Disposed`) are reported through the request handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A non-2xx final response was received for a dispatched request.
    RequestFailed {
        status: rsip::StatusCode,
        retry_after: Option<u32>,
    },
    /// A session modifying request was attempted while one was outstanding.
    RequestPending,
    /// An offer/answer or lifecycle transition was attempted outside its
    /// legal state.
    ProtocolViolation(String),
    /// The transaction layer gave up waiting for a final response.
    TransactionTimeout,
    /// The transport below the transaction layer failed.
    TransportFailure(String),
    /// The session was disposed while the request was in flight.
    Disposed,
    /// The session is terminated; no further requests may be dispatched.
    Terminated,
    /// A SIP message could not be built or interpreted.
    SipMessage(String),
    /// An internal channel was closed unexpectedly.
    Channel(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::RequestFailed {
                status,
                retry_after,
            } => match retry_after {
                Some(secs) => write!(f, "request failed: {} (retry after {}s)", status, secs),
                None => write!(f, "request failed: {}", status),
            },
            Error::RequestPending => write!(f, "a session modifying request is already pending"),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Error::TransactionTimeout => write!(f, "transaction timeout"),
            Error::TransportFailure(msg) => write!(f, "transport failure: {}", msg),
            Error::Disposed => write!(f, "session disposed"),
            Error::Terminated => write!(f, "session terminated"),
            Error::SipMessage(msg) => write!(f, "sip message error: {}", msg),
            Error::Channel(msg) => write!(f, "channel error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessage(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel(e.to_string())
    }
}
