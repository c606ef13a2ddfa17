use std::ffi::CStr;
use std::io;
use std::mem;
use std::ptr;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::{Context, Error, Result};

/// A completion queue.
pub struct Cq {
    cq: NonNull<ibv_cq>,
    depth: i32,
    _ctx: Arc<Context>,
}

unsafe impl Send for Cq {}
unsafe impl Sync for Cq {}

impl Cq {
    /// Creates a completion queue sized for at least `depth` outstanding
    /// work requests.
    pub fn new(ctx: &Arc<Context>, depth: u32) -> Result<Self> {
        let cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })
        .ok_or(Error::ResourceFailed {
            what: "completion queue",
            source: io::Error::last_os_error(),
        })?;

        Ok(Self {
            cq,
            depth: depth as i32,
            _ctx: ctx.clone(),
        })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    /// Polls up to `wc.len()` completions without blocking. Returns the
    /// number of entries filled in; zero means the queue was empty.
    pub fn poll(&self, wc: &mut [Wc]) -> Result<usize> {
        let n = unsafe {
            ibv_poll_cq(
                self.cq.as_ptr(),
                wc.len() as i32,
                wc.as_mut_ptr() as *mut ibv_wc,
            )
        };

        if n < 0 {
            return Err(Error::PollFailed { errno: -n });
        }

        Ok(n as usize)
    }

    /// Polls a single completion. `None` when the queue is empty.
    pub fn poll_one(&self) -> Result<Option<Wc>> {
        let mut wc = [Wc::default()];
        let n = self.poll(&mut wc)?;
        let [w] = wc;
        Ok(match n {
            0 => None,
            _ => Some(w),
        })
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
    }
}

/// A work completion record.
///
/// Same layout as `ibv_wc`, so a slice of these can be handed straight
/// to the poll call.
#[repr(transparent)]
pub struct Wc(ibv_wc);

impl Default for Wc {
    fn default() -> Self {
        Self(unsafe { mem::zeroed::<ibv_wc>() })
    }
}

impl Wc {
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    pub fn byte_len(&self) -> usize {
        self.0.byte_len as usize
    }

    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    pub fn status(&self) -> u32 {
        self.0.status
    }

    /// Human-readable completion status, for log records.
    pub fn status_str(&self) -> &'static str {
        unsafe {
            CStr::from_ptr(ibv_wc_status_str(self.0.status))
                .to_str()
                .unwrap_or("unknown")
        }
    }
}

impl std::fmt::Debug for Wc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status_str())
            .field("byte_len", &self.byte_len())
            .finish()
    }
}
