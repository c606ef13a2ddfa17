use std::io;
use std::mem;
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::{Cq, Error, Gid, Mr, Pd, Result, check_errno};

/// Queue pair capacity limits.
///
/// The defaults size both queues to the maximum number of outstanding
/// work requests a session keeps in flight. Inline data is not used.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 10,
            max_recv_wr: 10,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// The peer addressing data learned out of band: which queue pair to
/// target and how to reach its port.
#[derive(Debug, Clone, Copy)]
pub struct RemoteEndpoint {
    pub qp_num: u32,
    pub lid: u16,
    pub gid: Gid,
}

/// Tunables for the INIT -> RTR transition.
#[derive(Debug, Clone, Copy)]
pub struct RtrAttrs {
    /// Path MTU in bytes; must be one of the verbs enumeration values.
    pub path_mtu: u32,
    pub min_rnr_timer: u8,
    pub max_dest_rd_atomic: u8,
}

impl Default for RtrAttrs {
    fn default() -> Self {
        Self {
            path_mtu: 1024,
            min_rnr_timer: 12,
            max_dest_rd_atomic: 1,
        }
    }
}

/// Tunables for the RTR -> RTS transition. The retry counters and
/// timeout are conventional values, not derived from measurement.
#[derive(Debug, Clone, Copy)]
pub struct RtsAttrs {
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

impl Default for RtsAttrs {
    fn default() -> Self {
        Self {
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
        }
    }
}

fn mtu_value(bytes: u32) -> Result<u32> {
    Ok(match bytes {
        256 => ibv_mtu::IBV_MTU_256,
        512 => ibv_mtu::IBV_MTU_512,
        1024 => ibv_mtu::IBV_MTU_1024,
        2048 => ibv_mtu::IBV_MTU_2048,
        4096 => ibv_mtu::IBV_MTU_4096,
        other => return Err(Error::InvalidMtu(other)),
    })
}

/// A reliable-connected queue pair whose state transitions are driven
/// explicitly by the caller.
///
/// Connection managers hide the INIT/RTR/RTS traversal and pick packet
/// sequence numbers themselves; this type exposes the transitions so the
/// PSNs injected at RTR (`rq_psn`) and RTS (`sq_psn`) are exactly the
/// ones the secure source generated and the TLS channel carried.
pub struct Qp {
    qp: NonNull<ibv_qp>,
    pd: Arc<Pd>,
    _send_cq: Arc<Cq>,
    _recv_cq: Arc<Cq>,
}

unsafe impl Send for Qp {}
unsafe impl Sync for Qp {}

impl Qp {
    pub fn new(
        pd: &Arc<Pd>,
        send_cq: &Arc<Cq>,
        recv_cq: &Arc<Cq>,
        caps: QpCaps,
    ) -> Result<Self> {
        let mut init_attr = ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: send_cq.as_raw(),
            recv_cq: recv_cq.as_raw(),
            srq: ptr::null_mut(),
            cap: ibv_qp_cap {
                max_send_wr: caps.max_send_wr,
                max_recv_wr: caps.max_recv_wr,
                max_send_sge: caps.max_send_sge,
                max_recv_sge: caps.max_recv_sge,
                max_inline_data: caps.max_inline_data,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 1,
        };

        let qp = NonNull::new(unsafe { ibv_create_qp(pd.as_raw(), &mut init_attr) })
            .ok_or(Error::ResourceFailed {
                what: "queue pair",
                source: io::Error::last_os_error(),
            })?;

        Ok(Self {
            qp,
            pd: pd.clone(),
            _send_cq: send_cq.clone(),
            _recv_cq: recv_cq.clone(),
        })
    }

    /// The queue pair number the peer must target.
    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.qp.as_ptr()).qp_num }
    }

    /// RESET -> INIT: binds the queue pair to the port with partition
    /// key index zero and grants local write plus remote write and read.
    pub fn modify_to_init(&self) -> Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = self.pd.context().port_num();
        attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
            .0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;

        check_errno(
            unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, mask.0 as i32) },
            |errno| Error::TransitionFailed {
                from: "RESET",
                to: "INIT",
                errno,
            },
        )
    }

    /// INIT -> RTR: points the receive side at the peer's queue pair
    /// with the peer-announced PSN as `rq_psn`.
    ///
    /// Addressing comes from the exchanged endpoint record: a non-zero
    /// peer GID selects global routing (the RoCE case, also valid across
    /// InfiniBand subnets), a zero GID falls back to LID addressing.
    pub fn modify_to_rtr(
        &self,
        remote: &RemoteEndpoint,
        rq_psn: u32,
        attrs: &RtrAttrs,
    ) -> Result<()> {
        let ctx = self.pd.context();

        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = mtu_value(attrs.path_mtu)?;
        attr.dest_qp_num = remote.qp_num;
        attr.rq_psn = rq_psn;
        attr.max_dest_rd_atomic = attrs.max_dest_rd_atomic;
        attr.min_rnr_timer = attrs.min_rnr_timer;

        attr.ah_attr.dlid = remote.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = ctx.port_num();

        if !remote.gid.is_zero() {
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid = remote.gid.into();
            attr.ah_attr.grh.flow_label = 0;
            attr.ah_attr.grh.sgid_index = ctx.gid_index();
            attr.ah_attr.grh.hop_limit = 0xff;
            attr.ah_attr.grh.traffic_class = 0;
        }

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        check_errno(
            unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, mask.0 as i32) },
            |errno| Error::TransitionFailed {
                from: "INIT",
                to: "RTR",
                errno,
            },
        )
    }

    /// RTR -> RTS: arms the send side with the locally generated PSN as
    /// `sq_psn`.
    pub fn modify_to_rts(&self, sq_psn: u32, attrs: &RtsAttrs) -> Result<()> {
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = sq_psn;
        attr.timeout = attrs.timeout;
        attr.retry_cnt = attrs.retry_cnt;
        attr.rnr_retry = attrs.rnr_retry;
        attr.max_rd_atomic = attrs.max_rd_atomic;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

        check_errno(
            unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, mask.0 as i32) },
            |errno| Error::TransitionFailed {
                from: "RTR",
                to: "RTS",
                errno,
            },
        )
    }

    /// Posts a receive work request covering the whole region.
    pub fn post_recv(&self, mr: &Mr, wr_id: u64) -> Result<()> {
        let mut sge = ibv_sge {
            addr: mr.addr(),
            length: mr.len() as u32,
            lkey: mr.lkey(),
        };

        let mut wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        check_errno(
            unsafe { ibv_post_recv(self.qp.as_ptr(), &mut wr, &mut bad_wr) },
            |errno| Error::PostFailed {
                what: "receive work request",
                errno,
            },
        )
    }

    /// Posts a signaled send of the first `len` bytes of the region.
    pub fn post_send(&self, mr: &Mr, len: usize, wr_id: u64) -> Result<()> {
        if len > mr.len() {
            return Err(Error::PostFailed {
                what: "send length larger than region",
                errno: libc::EMSGSIZE,
            });
        }

        let mut sge = ibv_sge {
            addr: mr.addr(),
            length: len as u32,
            lkey: mr.lkey(),
        };

        let mut wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        let mut bad_wr = ptr::null_mut();
        check_errno(
            unsafe { ibv_post_send(self.qp.as_ptr(), &mut wr, &mut bad_wr) },
            |errno| Error::PostFailed {
                what: "send work request",
                errno,
            },
        )
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
    }
}
