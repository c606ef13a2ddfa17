//! ## Safe libibverbs layer
//!
//! A thin ownership layer over the `rdma-sys` FFI, shaped around the one
//! use this server has for it: reliable-connected queue pairs whose
//! state transitions are driven by hand so the packet sequence numbers
//! can be chosen by the caller instead of a connection manager.
//!
//! The device context is opened once per process and shared; everything
//! else (protection domain, completion queues, queue pair, memory
//! regions) is per-session and unwinds in reverse creation order through
//! `Drop`. Child objects hold an `Arc` to their parent, so a partially
//! built session can be dropped at any point without ordering bugs and
//! without ever touching the shared context.
//!
//! There is deliberately no librdmacm here: addressing parameters travel
//! out of band, so connection-manager resolution (and its event channel)
//! has nothing to do.

pub mod context;
pub mod cq;
pub mod gid;
pub mod mr;
pub mod pd;
pub mod qp;

pub use context::Context;
pub use cq::{Cq, Wc};
pub use gid::Gid;
pub use mr::Mr;
pub use pd::Pd;
pub use qp::{Qp, QpCaps, RemoteEndpoint, RtrAttrs, RtsAttrs};

use std::io;

#[derive(Debug)]
pub enum Error {
    /// No RDMA device is present. Raised once at process startup, never
    /// per session.
    DeviceUnavailable,
    /// A device or port query failed after the device was opened.
    DeviceQueryFailed { call: &'static str, errno: i32 },
    /// Creation of a per-session verb object (PD, CQ, QP, MR) failed.
    ResourceFailed {
        what: &'static str,
        source: io::Error,
    },
    /// `ibv_modify_qp` refused a state transition.
    TransitionFailed {
        from: &'static str,
        to: &'static str,
        errno: i32,
    },
    /// Posting a work request was rejected.
    PostFailed { what: &'static str, errno: i32 },
    /// Polling a completion queue failed outright.
    PollFailed { errno: i32 },
    /// A path MTU value outside the set the fabric understands.
    InvalidMtu(u32),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps the `c_int` convention of the verbs API (0 on success, errno
/// otherwise) onto `Result`.
pub(crate) fn check_errno(
    ret: i32,
    map: impl FnOnce(i32) -> Error,
) -> Result<()> {
    if ret == 0 { Ok(()) } else { Err(map(ret)) }
}
