use crate::{Error, Psn};

use bytes::{Buf, BufMut};

/// The PSN announcement, sent once right after the TLS handshake.
///
/// Four bytes, little-endian. The upper byte is always zero on the wire
/// because the value is 24-bit; decoding rejects anything outside the
/// non-zero 24-bit range before it can reach a queue pair attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsnRecord {
    pub psn: Psn,
}

impl PsnRecord {
    pub const SIZE: usize = 4;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.psn.value());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::ShortBuffer);
        }

        Ok(Self {
            psn: Psn::new(buf.get_u32_le())?,
        })
    }
}

/// The connection-parameter record, sent once per direction after the
/// PSN exchange.
///
/// Carries everything the peer needs to address this endpoint's queue
/// pair out of band: the queue pair number, the port LID for the
/// InfiniBand link layer, the port GID for RoCE or global routing, and
/// the already-announced local PSN once more for redundancy. The GID is
/// a raw 16-byte octet string and is transmitted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamsRecord {
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
    pub psn: Psn,
}

impl ParamsRecord {
    pub const SIZE: usize = 26;

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.qp_num);
        buf.put_u16_le(self.lid);
        buf.put_slice(&self.gid);
        buf.put_u32_le(self.psn.value());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::SIZE {
            return Err(Error::ShortBuffer);
        }

        let qp_num = buf.get_u32_le();
        let lid = buf.get_u16_le();

        let mut gid = [0u8; 16];
        buf.copy_to_slice(&mut gid);

        Ok(Self {
            qp_num,
            lid,
            gid,
            psn: Psn::new(buf.get_u32_le())?,
        })
    }
}
