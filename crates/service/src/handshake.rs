//! The connection-establishment state machine.
//!
//! Both sides walk the same eleven labels:
//!
//! ```text
//! NEW -> TLS_READY -> PSN_SENT -> PSN_RECVD -> RESOURCES_READY
//!     -> PARAMS_SENT -> PARAMS_RECVD -> QP_INIT -> QP_RTR -> QP_RTS
//!     -> OPEN
//! ```
//!
//! Each state is a struct and each transition a method that consumes it,
//! so the compiler enforces the ordering invariants: `rq_psn` cannot be
//! programmed before the peer's PSN arrived, `sq_psn` cannot be armed
//! before the local PSN was committed to the TLS stream, and the first
//! receive is posted before the session is handed to the message loop.
//! There are no retries; any failed transition is terminal and the
//! partially built resources unwind in reverse order when the state is
//! dropped.
//!
//! The machine starts after the TLS handshake (the `NEW -> TLS_READY`
//! edge belongs to the listener, which owns the socket), and either side
//! may announce its PSN first because TLS delivers the interleaved
//! records reliably in both directions.

use std::sync::Arc;

use codec::{ParamsRecord, Psn};
use verbs::{Context, Gid, RemoteEndpoint};

use crate::channel::{
    ControlChannel, recv_params, recv_psn, send_params, send_psn,
};
use crate::error::SessionError;
use crate::resources::{ResourceOptions, SessionResources};

/// Work-request id for receives posted into the receive region.
pub const RECV_WR_ID: u64 = 1;
/// Work-request id for echo sends from the send region.
pub const SEND_WR_ID: u64 = 2;

/// PSN announced on the TLS channel; the local PSN is committed.
pub struct PsnSent {
    local: Psn,
}

impl PsnSent {
    /// TLS_READY -> PSN_SENT. The caller chooses the PSN so tests can
    /// rig collisions; production callers pass [`crate::psn::generate`].
    pub fn announce<C: ControlChannel>(
        chan: &mut C,
        local: Psn,
    ) -> Result<Self, SessionError> {
        send_psn(chan, local)?;
        log::debug!("handshake: state=PSN_SENT, local_psn={}", local);
        Ok(Self { local })
    }

    /// PSN_SENT -> PSN_RECVD. Rejects out-of-range values (the codec
    /// layer) and the astronomically unlikely equal-PSN case, which can
    /// only really mean a reflection of our own record.
    pub fn recv_peer<C: ControlChannel>(
        self,
        chan: &mut C,
    ) -> Result<PsnExchanged, SessionError> {
        let remote = recv_psn(chan)?;
        if remote == self.local {
            return Err(SessionError::PsnCollision(remote));
        }

        log::debug!("handshake: state=PSN_RECVD, remote_psn={}", remote);
        Ok(PsnExchanged {
            local: self.local,
            remote,
        })
    }
}

/// Both PSNs known; nothing RDMA exists yet.
pub struct PsnExchanged {
    local: Psn,
    remote: Psn,
}

impl PsnExchanged {
    pub fn local(&self) -> Psn {
        self.local
    }

    pub fn remote(&self) -> Psn {
        self.remote
    }

    /// PSN_RECVD -> RESOURCES_READY. Builds the per-session verb
    /// objects against the shared device context.
    pub fn build_resources(
        self,
        ctx: &Arc<Context>,
        opts: &ResourceOptions,
    ) -> Result<ResourcesReady, SessionError> {
        let res = SessionResources::create(ctx, opts)?;
        log::debug!(
            "handshake: state=RESOURCES_READY, qp_num={}",
            res.qp.qp_num(),
        );

        Ok(ResourcesReady {
            local: self.local,
            remote: self.remote,
            res,
            opts: *opts,
        })
    }
}

pub struct ResourcesReady {
    local: Psn,
    remote: Psn,
    res: SessionResources,
    opts: ResourceOptions,
}

impl ResourcesReady {
    /// RESOURCES_READY -> PARAMS_SENT. Writing the parameter record
    /// flushes the local PSN to the peer a second time; from here on the
    /// peer has everything it needs to reach RTS.
    pub fn send_params<C: ControlChannel>(
        self,
        chan: &mut C,
    ) -> Result<ParamsSent, SessionError> {
        let params = self.res.local_params(self.local);
        send_params(chan, &params)?;
        log::debug!(
            "handshake: state=PARAMS_SENT, qp_num={}, lid={}",
            params.qp_num,
            params.lid,
        );

        Ok(ParamsSent {
            local: self.local,
            remote: self.remote,
            res: self.res,
            opts: self.opts,
        })
    }
}

pub struct ParamsSent {
    local: Psn,
    remote: Psn,
    res: SessionResources,
    opts: ResourceOptions,
}

impl ParamsSent {
    /// PARAMS_SENT -> PARAMS_RECVD.
    pub fn recv_params<C: ControlChannel>(
        self,
        chan: &mut C,
    ) -> Result<ParamsExchanged, SessionError> {
        let remote_params = recv_params(chan)?;

        // The record carries the peer PSN again for redundancy; the
        // first announcement is authoritative.
        if remote_params.psn != self.remote {
            log::warn!(
                "handshake: params psn differs from announcement: {} != {}",
                remote_params.psn,
                self.remote,
            );
        }

        log::debug!(
            "handshake: state=PARAMS_RECVD, remote_qp_num={}, remote_lid={}",
            remote_params.qp_num,
            remote_params.lid,
        );

        Ok(ParamsExchanged {
            local: self.local,
            remote: self.remote,
            res: self.res,
            opts: self.opts,
            remote_params,
        })
    }
}

pub struct ParamsExchanged {
    local: Psn,
    remote: Psn,
    res: SessionResources,
    opts: ResourceOptions,
    remote_params: ParamsRecord,
}

impl ParamsExchanged {
    /// PARAMS_RECVD -> QP_INIT.
    pub fn into_init(self) -> Result<QpInit, SessionError> {
        self.res.qp.modify_to_init()?;
        log::debug!("handshake: state=QP_INIT");

        Ok(QpInit {
            local: self.local,
            remote: self.remote,
            res: self.res,
            opts: self.opts,
            remote_params: self.remote_params,
        })
    }
}

pub struct QpInit {
    local: Psn,
    remote: Psn,
    res: SessionResources,
    opts: ResourceOptions,
    remote_params: ParamsRecord,
}

impl QpInit {
    /// QP_INIT -> QP_RTR: the peer's PSN becomes our receive PSN.
    pub fn into_rtr(self) -> Result<QpRtr, SessionError> {
        let endpoint = RemoteEndpoint {
            qp_num: self.remote_params.qp_num,
            lid: self.remote_params.lid,
            gid: Gid::from(self.remote_params.gid),
        };

        self.res
            .qp
            .modify_to_rtr(&endpoint, self.remote.value(), &self.opts.rtr)?;
        log::debug!("handshake: state=QP_RTR, rq_psn={}", self.remote);

        Ok(QpRtr {
            local: self.local,
            remote: self.remote,
            res: self.res,
            opts: self.opts,
            endpoint,
        })
    }
}

pub struct QpRtr {
    local: Psn,
    remote: Psn,
    res: SessionResources,
    opts: ResourceOptions,
    endpoint: RemoteEndpoint,
}

impl QpRtr {
    /// QP_RTR -> QP_RTS: our PSN becomes the send PSN.
    pub fn into_rts(self) -> Result<QpRts, SessionError> {
        self.res.qp.modify_to_rts(self.local.value(), &self.opts.rts)?;
        log::debug!("handshake: state=QP_RTS, sq_psn={}", self.local);

        Ok(QpRts {
            local: self.local,
            remote: self.remote,
            res: self.res,
            endpoint: self.endpoint,
        })
    }
}

pub struct QpRts {
    local: Psn,
    remote: Psn,
    res: SessionResources,
    endpoint: RemoteEndpoint,
}

impl QpRts {
    /// QP_RTS -> OPEN: posts the first receive so the peer can send
    /// immediately, then hands the session to the message loop.
    pub fn open(self) -> Result<Established, SessionError> {
        self.res.qp.post_recv(&self.res.recv_mr, RECV_WR_ID)?;
        log::debug!("handshake: state=OPEN");

        Ok(Established {
            local_psn: self.local,
            remote_psn: self.remote,
            endpoint: self.endpoint,
            res: self.res,
        })
    }
}

/// An open session: queue pair in RTS, one receive posted.
pub struct Established {
    pub local_psn: Psn,
    pub remote_psn: Psn,
    pub endpoint: RemoteEndpoint,
    pub res: SessionResources,
}

/// Drives the whole chain from PSN announcement to `OPEN`. Both sides
/// call this with their freshly generated PSN after their TLS handshake
/// completes.
pub fn establish<C: ControlChannel>(
    chan: &mut C,
    ctx: &Arc<Context>,
    opts: &ResourceOptions,
    local_psn: Psn,
) -> Result<Established, SessionError> {
    PsnSent::announce(chan, local_psn)?
        .recv_peer(chan)?
        .build_resources(ctx, opts)?
        .send_params(chan)?
        .recv_params(chan)?
        .into_init()?
        .into_rtr()?
        .into_rts()?
        .open()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::channel::testing::pair;

    #[test]
    fn psn_exchange_both_directions() {
        let (mut a, mut b) = pair();

        let psn_a = Psn::new(0x2807d5).unwrap();
        let psn_b = Psn::new(0x9f8541).unwrap();

        let sent_a = PsnSent::announce(&mut a, psn_a).unwrap();
        let sent_b = PsnSent::announce(&mut b, psn_b).unwrap();

        let got_a = sent_a.recv_peer(&mut a).unwrap();
        let got_b = sent_b.recv_peer(&mut b).unwrap();

        assert_eq!(got_a.local, psn_a);
        assert_eq!(got_a.remote, psn_b);
        assert_eq!(got_b.local, psn_b);
        assert_eq!(got_b.remote, psn_a);
    }

    #[test]
    fn identical_psns_collide() {
        let (mut a, mut b) = pair();

        // A rigged generator returning the same draw on both sides.
        let psn = Psn::new(0x00abcd).unwrap();

        let sent_a = PsnSent::announce(&mut a, psn).unwrap();
        let _sent_b = PsnSent::announce(&mut b, psn).unwrap();

        assert!(matches!(
            sent_a.recv_peer(&mut a),
            Err(SessionError::PsnCollision(got)) if got == psn
        ));
    }

    #[test]
    fn oversize_peer_psn_is_rejected() {
        let (mut a, mut b) = pair();

        // 2^24 exactly: one past the top of the range.
        a.write_all(&[0x00, 0x00, 0x00, 0x01]).unwrap();

        let sent = PsnSent::announce(&mut b, Psn::new(5).unwrap()).unwrap();
        assert!(matches!(
            sent.recv_peer(&mut b),
            Err(SessionError::PsnOutOfRange(v)) if v == 1 << 24
        ));
    }

    #[test]
    fn vanished_peer_fails_the_exchange() {
        let (a, mut b) = pair();

        let sent = PsnSent::announce(&mut b, Psn::new(5).unwrap()).unwrap();
        drop(a);

        assert!(matches!(
            sent.recv_peer(&mut b),
            Err(SessionError::PeerClosedUnexpectedly)
        ));
    }
}
