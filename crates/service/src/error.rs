use std::io;

use codec::Psn;

/// Which side of the disconnect handshake ran out of patience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectRole {
    Initiator,
    Responder,
}

/// Everything that can end a session (or refuse to start one).
///
/// No variant is recoverable: the worker logs the error, unwinds its
/// resources in reverse order and releases its registry slot. The
/// process itself stays up for every variant except
/// [`SessionError::RdmaDeviceUnavailable`], which is raised once at
/// startup before the listener exists.
#[derive(Debug)]
pub enum SessionError {
    TlsHandshakeFailed(io::Error),
    TlsIoFailed(io::Error),
    PeerClosedUnexpectedly,
    /// The peer announced the same PSN this side generated. With honest
    /// endpoints the probability is about 2^-23, so this is an integrity
    /// check rather than a protocol step.
    PsnCollision(Psn),
    PsnOutOfRange(u32),
    RdmaDeviceUnavailable,
    RdmaResourceFailure(verbs::Error),
    QpTransitionFailed {
        from: &'static str,
        to: &'static str,
        errno: i32,
    },
    CompletionFailed(&'static str),
    DisconnectTimeout(DisconnectRole),
    /// Admission refused for lack of a free slot. Raised before any
    /// session state exists; the TLS connection is simply closed.
    CapacityExceeded,
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::PeerClosedUnexpectedly,
            _ => Self::TlsIoFailed(e),
        }
    }
}

impl From<codec::Error> for SessionError {
    fn from(e: codec::Error) -> Self {
        match e {
            codec::Error::PsnOutOfRange(value) => Self::PsnOutOfRange(value),
            codec::Error::ShortBuffer => Self::PeerClosedUnexpectedly,
        }
    }
}

impl From<verbs::Error> for SessionError {
    fn from(e: verbs::Error) -> Self {
        match e {
            verbs::Error::DeviceUnavailable => Self::RdmaDeviceUnavailable,
            verbs::Error::TransitionFailed { from, to, errno } => {
                Self::QpTransitionFailed { from, to, errno }
            }
            other => Self::RdmaResourceFailure(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_eof_becomes_peer_closed() {
        let e = SessionError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(e, SessionError::PeerClosedUnexpectedly));

        let e = SessionError::from(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(e, SessionError::TlsIoFailed(_)));
    }

    #[test]
    fn qp_transition_keeps_edge_labels() {
        let e = SessionError::from(verbs::Error::TransitionFailed {
            from: "INIT",
            to: "RTR",
            errno: 22,
        });

        assert!(matches!(
            e,
            SessionError::QpTransitionFailed {
                from: "INIT",
                to: "RTR",
                errno: 22,
            }
        ));
    }
}
