use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::{Context, Error, Result};

/// A protection domain, the first per-session object created and the
/// last destroyed. Holding the shared context alive through an `Arc`
/// guarantees the device cannot close underneath it.
pub struct Pd {
    pd: NonNull<ibv_pd>,
    ctx: Arc<Context>,
}

unsafe impl Send for Pd {}
unsafe impl Sync for Pd {}

impl Pd {
    pub fn alloc(ctx: &Arc<Context>) -> Result<Self> {
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_raw()) }).ok_or(
            Error::ResourceFailed {
                what: "protection domain",
                source: io::Error::last_os_error(),
            },
        )?;

        Ok(Self {
            pd,
            ctx: ctx.clone(),
        })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Drop for Pd {
    fn drop(&mut self) {
        unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
    }
}
