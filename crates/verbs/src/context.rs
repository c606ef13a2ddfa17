use std::ffi::CStr;
use std::mem;
use std::ptr::NonNull;

use rdma_sys::*;

use crate::{Error, Gid, Result, check_errno};

/// The process-wide device context.
///
/// Opened once before the listener starts accepting and shared by every
/// session through an `Arc`; workers only ever read it. Opening the
/// device per client would repeat the kernel registration cost for each
/// session, so the single shared handle is a hard requirement, not an
/// optimization.
pub struct Context {
    ctx: NonNull<ibv_context>,
    device_name: String,
    port_num: u8,
    gid_index: u8,
    lid: u16,
    gid: Gid,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Opens the first available RDMA device and queries the given port.
    ///
    /// Fails with [`Error::DeviceUnavailable`] when the fabric offers no
    /// device at all; the process is expected to stop at startup rather
    /// than admit sessions it can never serve.
    pub fn open(port_num: u8, gid_index: u8) -> Result<Self> {
        let mut num_devices = 0i32;
        let list = unsafe { ibv_get_device_list(&mut num_devices) };
        if list.is_null() || num_devices == 0 {
            if !list.is_null() {
                unsafe { ibv_free_device_list(list) };
            }

            return Err(Error::DeviceUnavailable);
        }

        let device = unsafe { *list };
        let device_name = unsafe {
            CStr::from_ptr(ibv_get_device_name(device))
                .to_string_lossy()
                .into_owned()
        };

        let ctx = unsafe { ibv_open_device(device) };
        unsafe { ibv_free_device_list(list) };

        let ctx = NonNull::new(ctx).ok_or(Error::DeviceUnavailable)?;

        let mut port_attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        if let Err(e) = check_errno(
            unsafe { ___ibv_query_port(ctx.as_ptr(), port_num, &mut port_attr) },
            |errno| Error::DeviceQueryFailed {
                call: "ibv_query_port",
                errno,
            },
        ) {
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(e);
        }

        let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
        if let Err(e) = check_errno(
            unsafe {
                ibv_query_gid(ctx.as_ptr(), port_num, gid_index as i32, &mut gid)
            },
            |errno| Error::DeviceQueryFailed {
                call: "ibv_query_gid",
                errno,
            },
        ) {
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(e);
        }

        let this = Self {
            ctx,
            device_name,
            port_num,
            gid_index,
            lid: port_attr.lid,
            gid: Gid::from(gid),
        };

        log::info!(
            "rdma device opened: name={}, port={}, lid={}, gid_index={}",
            this.device_name,
            this.port_num,
            this.lid,
            this.gid_index,
        );

        Ok(this)
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    pub fn gid_index(&self) -> u8 {
        self.gid_index
    }

    /// The port LID, for InfiniBand link-layer addressing. Zero on
    /// RoCE fabrics.
    pub fn lid(&self) -> u16 {
        self.lid
    }

    /// The port GID at the configured index, for RoCE and global
    /// routing.
    pub fn gid(&self) -> Gid {
        self.gid
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { ibv_close_device(self.ctx.as_ptr()) };
        log::debug!("rdma device closed: name={}", self.device_name);
    }
}
