//! Per-session RDMA resources.

use std::sync::Arc;

use codec::{ParamsRecord, Psn};
use verbs::mr::Access;
use verbs::{Context, Cq, Mr, Pd, Qp, QpCaps, RtrAttrs, RtsAttrs};

use crate::error::SessionError;

/// Sizing and tuning knobs for one session's resources.
#[derive(Debug, Clone, Copy)]
pub struct ResourceOptions {
    /// Completion queue depth, which also bounds outstanding work
    /// requests per queue.
    pub cq_depth: u32,
    /// Size of each pinned buffer in bytes.
    pub buffer_size: usize,
    pub rtr: RtrAttrs,
    pub rts: RtsAttrs,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            cq_depth: 10,
            buffer_size: 4096,
            rtr: RtrAttrs::default(),
            rts: RtsAttrs::default(),
        }
    }
}

/// One admitted client's verb objects.
///
/// Created in strict order (protection domain, completion queues, queue
/// pair, registered buffers) and destroyed in reverse: the field order
/// here is the destruction order, and every child also holds its parent
/// alive through an `Arc`, so a half-built bundle unwinds correctly from
/// any point. The shared device context is never closed from here.
pub struct SessionResources {
    pub send_mr: Mr,
    pub recv_mr: Mr,
    pub qp: Qp,
    pub recv_cq: Arc<Cq>,
    pub send_cq: Arc<Cq>,
    pub pd: Arc<Pd>,
}

impl SessionResources {
    pub fn create(
        ctx: &Arc<Context>,
        opts: &ResourceOptions,
    ) -> Result<Self, SessionError> {
        let pd = Arc::new(Pd::alloc(ctx)?);
        let send_cq = Arc::new(Cq::new(ctx, opts.cq_depth)?);
        let recv_cq = Arc::new(Cq::new(ctx, opts.cq_depth)?);

        let caps = QpCaps {
            max_send_wr: opts.cq_depth,
            max_recv_wr: opts.cq_depth,
            ..QpCaps::default()
        };
        let qp = Qp::new(&pd, &send_cq, &recv_cq, caps)?;

        // The receive region also accepts inbound RDMA writes; the send
        // region is local-only.
        let send_mr = Mr::alloc(&pd, opts.buffer_size, Access::LocalWrite)?;
        let recv_mr = Mr::alloc(&pd, opts.buffer_size, Access::LocalRemoteWrite)?;

        Ok(Self {
            send_mr,
            recv_mr,
            qp,
            recv_cq,
            send_cq,
            pd,
        })
    }

    /// The parameter record describing this endpoint, as the peer needs
    /// to see it: our queue pair number, our port addressing, and the
    /// PSN we already announced.
    pub fn local_params(&self, local_psn: Psn) -> ParamsRecord {
        let ctx = self.pd.context();

        ParamsRecord {
            qp_num: self.qp.qp_num(),
            lid: ctx.lid(),
            gid: *ctx.gid().as_bytes(),
            psn: local_psn,
        }
    }
}
