use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_sys::*;

use crate::{Error, Pd, Result};

/// Access rights requested when registering a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Local write only: enough for a send buffer.
    LocalWrite,
    /// Local and remote write: a receive buffer that can also accept an
    /// inbound RDMA write.
    LocalRemoteWrite,
}

impl Access {
    fn as_flags(self) -> ibv_access_flags {
        match self {
            Self::LocalWrite => ibv_access_flags::IBV_ACCESS_LOCAL_WRITE,
            Self::LocalRemoteWrite => {
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            }
        }
    }
}

/// A registered memory region over a page-aligned pinned buffer the
/// region owns.
///
/// Deregistration happens before the buffer is freed and before the
/// protection domain can be deallocated, all through `Drop` order.
pub struct Mr {
    mr: NonNull<ibv_mr>,
    buf: NonNull<u8>,
    layout: Layout,
    pd: Arc<Pd>,
}

unsafe impl Send for Mr {}
unsafe impl Sync for Mr {}

impl Mr {
    const ALIGN: usize = 4096;

    /// Allocates a zeroed page-aligned buffer of `len` bytes and
    /// registers it with the given access rights.
    pub fn alloc(pd: &Arc<Pd>, len: usize, access: Access) -> Result<Self> {
        let layout = Layout::from_size_align(len, Self::ALIGN).map_err(|_| {
            Error::ResourceFailed {
                what: "buffer layout",
                source: io::Error::from(io::ErrorKind::InvalidInput),
            }
        })?;

        let buf = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(
            Error::ResourceFailed {
                what: "pinned buffer",
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            },
        )?;

        let mr = unsafe {
            ibv_reg_mr(
                pd.as_raw(),
                buf.as_ptr() as *mut _,
                len,
                access.as_flags().0 as i32,
            )
        };

        let Some(mr) = NonNull::new(mr) else {
            let source = io::Error::last_os_error();
            unsafe { alloc::dealloc(buf.as_ptr(), layout) };
            return Err(Error::ResourceFailed {
                what: "memory region",
                source,
            });
        };

        Ok(Self {
            mr,
            buf,
            layout,
            pd: pd.clone(),
        })
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    pub fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn pd(&self) -> &Arc<Pd> {
        &self.pd
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf.as_ptr(), self.len()) }
    }

    /// Mutable view of the pinned buffer.
    ///
    /// The caller must not hand this out while a work request that
    /// references the region is outstanding.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buf.as_ptr(), self.len()) }
    }

    /// Copies `payload` into the front of the buffer, the usual staging
    /// step before posting a send.
    pub fn fill(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.len() {
            return Err(Error::PostFailed {
                what: "payload larger than region",
                errno: libc::EMSGSIZE,
            });
        }

        self.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        Ok(())
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        unsafe {
            ibv_dereg_mr(self.mr.as_ptr());
            alloc::dealloc(self.buf.as_ptr(), self.layout);
        }
    }
}
