use std::mem;

use rdma_sys::ibv_gid;

/// A 128-bit port GID.
///
/// Stored and transmitted as a raw 16-byte octet string in network
/// order; no endianness conversion is ever applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// An all-zero GID means the port carries no routable global
    /// address, which on InfiniBand fabrics selects LID addressing.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<ibv_gid> for Gid {
    fn from(gid: ibv_gid) -> Self {
        Self(unsafe { gid.raw })
    }
}

impl From<Gid> for ibv_gid {
    fn from(gid: Gid) -> Self {
        let mut raw = unsafe { mem::zeroed::<ibv_gid>() };
        raw.raw = gid.0;
        raw
    }
}

impl From<[u8; 16]> for Gid {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}
