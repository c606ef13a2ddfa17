//! The graceful-disconnect state machine.
//!
//! A three-way handshake over the TLS channel that carried the
//! establishment records:
//!
//! ```text
//! initiator                      responder
//!     | -------- REQ --------------> |  (drain, arm 3 s timer)
//!     | <------- ACK --------------- |
//!     | -------- FIN --------------> |  (tear down)
//!     | (linger 100 ms, tear down)
//! ```
//!
//! Either side may initiate. Both sides carry a timer so a vanished or
//! wedged peer can never hold a registry slot hostage: the initiator
//! forces teardown when no ACK arrives within its window, the responder
//! when no FIN does. Teardown itself (destroying the session resources,
//! closing the channel, releasing the slot) belongs to the caller and is
//! idempotent; these functions only run the wire exchange and report how
//! it went.

use std::thread::sleep;
use std::time::Duration;

use codec::Sentinel;

use crate::channel::{ControlChannel, SentinelReader, send_sentinel};
use crate::error::{DisconnectRole, SessionError};

/// Timer windows for the handshake. The defaults match the protocol;
/// tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectTimers {
    /// How long the initiator waits for ACK after REQ.
    pub req_ack: Duration,
    /// How long the responder waits for FIN after ACK.
    pub ack_fin: Duration,
    /// Grace period after FIN for the peer's teardown to flush.
    pub fin_linger: Duration,
}

impl Default for DisconnectTimers {
    fn default() -> Self {
        Self {
            req_ack: Duration::from_secs(5),
            ack_fin: Duration::from_secs(3),
            fin_linger: Duration::from_millis(100),
        }
    }
}

/// How the handshake ended. Teardown happens either way; `Forced` only
/// records that the peer never completed its half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Graceful,
    Forced,
}

/// Runs the initiator half: REQ, wait for ACK, FIN.
///
/// The caller must already have drained its RDMA queues; nothing may be
/// posted after this sends REQ.
pub fn initiate<C: ControlChannel>(
    chan: &mut C,
    timers: &DisconnectTimers,
) -> DisconnectOutcome {
    if let Err(e) = send_sentinel(chan, Sentinel::Req) {
        log::warn!("disconnect: sending REQ failed: {}", e);
        return DisconnectOutcome::Forced;
    }

    let mut reader = SentinelReader::default();
    match reader.wait(chan, timers.req_ack) {
        Ok(Some(Sentinel::Ack)) => {}
        Ok(Some(other)) => {
            log::warn!("disconnect: expected ACK, got {:?}", other);
            return DisconnectOutcome::Forced;
        }
        Ok(None) => {
            log::warn!(
                "disconnect: {}",
                SessionError::DisconnectTimeout(DisconnectRole::Initiator),
            );
            return DisconnectOutcome::Forced;
        }
        Err(e) => {
            log::warn!("disconnect: waiting for ACK failed: {}", e);
            return DisconnectOutcome::Forced;
        }
    }

    if let Err(e) = send_sentinel(chan, Sentinel::Fin) {
        log::warn!("disconnect: sending FIN failed: {}", e);
        return DisconnectOutcome::Forced;
    }

    // Give the peer's teardown a moment to flush before the channel
    // goes away underneath it.
    sleep(timers.fin_linger);
    DisconnectOutcome::Graceful
}

/// Runs the responder half after REQ has been observed (either on the
/// TLS channel or as an in-band RDMA payload): ACK, wait for FIN.
///
/// The caller must have flushed pending sends before calling.
pub fn respond<C: ControlChannel>(
    chan: &mut C,
    timers: &DisconnectTimers,
) -> DisconnectOutcome {
    if let Err(e) = send_sentinel(chan, Sentinel::Ack) {
        log::warn!("disconnect: sending ACK failed: {}", e);
        return DisconnectOutcome::Forced;
    }

    let mut reader = SentinelReader::default();
    match reader.wait(chan, timers.ack_fin) {
        Ok(Some(Sentinel::Fin)) => DisconnectOutcome::Graceful,
        Ok(Some(other)) => {
            log::warn!("disconnect: expected FIN, got {:?}", other);
            DisconnectOutcome::Forced
        }
        Ok(None) => {
            log::warn!(
                "disconnect: {}",
                SessionError::DisconnectTimeout(DisconnectRole::Responder),
            );
            DisconnectOutcome::Forced
        }
        Err(e) => {
            log::warn!("disconnect: waiting for FIN failed: {}", e);
            DisconnectOutcome::Forced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::channel::testing::pair;

    fn fast_timers() -> DisconnectTimers {
        DisconnectTimers {
            req_ack: Duration::from_millis(300),
            ack_fin: Duration::from_millis(200),
            fin_linger: Duration::from_millis(5),
        }
    }

    #[test]
    fn three_way_handshake_completes() {
        let (mut a, mut b) = pair();
        let timers = fast_timers();

        let responder = thread::spawn(move || {
            // Consume REQ the way the message loop would, then answer.
            let mut reader = SentinelReader::default();
            let req = reader.wait(&mut b, Duration::from_secs(2)).unwrap();
            assert_eq!(req, Some(Sentinel::Req));
            respond(&mut b, &fast_timers())
        });

        assert_eq!(initiate(&mut a, &timers), DisconnectOutcome::Graceful);
        assert_eq!(responder.join().unwrap(), DisconnectOutcome::Graceful);
    }

    #[test]
    fn initiator_forces_teardown_without_ack() {
        let (mut a, _b) = pair();

        // The peer never answers; the REQ->ACK timer must fire and the
        // outcome is a forced teardown, not an error.
        let timers = fast_timers();
        assert_eq!(initiate(&mut a, &timers), DisconnectOutcome::Forced);
    }

    #[test]
    fn responder_forces_teardown_without_fin() {
        let (mut a, mut b) = pair();
        let timers = fast_timers();

        // Swallow the ACK and never send FIN.
        let silent_initiator = thread::spawn(move || {
            let mut reader = SentinelReader::default();
            let ack = reader.wait(&mut a, Duration::from_secs(2)).unwrap();
            assert_eq!(ack, Some(Sentinel::Ack));
            // Keep the channel open past the responder's timer.
            thread::sleep(Duration::from_millis(400));
        });

        assert_eq!(respond(&mut b, &timers), DisconnectOutcome::Forced);
        silent_initiator.join().unwrap();
    }

    #[test]
    fn vanished_peer_forces_teardown() {
        let (mut a, b) = pair();
        drop(b);

        let timers = fast_timers();
        assert_eq!(initiate(&mut a, &timers), DisconnectOutcome::Forced);
    }
}
