use std::fmt;

use bitvec::{field::BitField, prelude as bv};
use paste::paste;

use crate::type_alias::*;

macro_rules! impl_accessor {
    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr, $setter:tt, $getter:tt) => {
        #[inline(always)]
        pub fn $setter(&mut self, val: $field_ty) {
            self.bits[$lsb..=$msb].store_le::<$integral_ty>(val as $integral_ty);
        }

        #[inline(always)]
        pub fn $getter(&self) -> $field_ty {
            self.bits[$lsb..=$msb].load_le::<$integral_ty>().into()
        }
    };

    ($field:ident, $field_ty:ty, $integral_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $integral_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };

    ($field:ident, $field_ty:ty, $lsb:expr, $msb:expr) => {
        paste! {
            impl_accessor!(
                $field,
                $field_ty,
                $field_ty,
                $lsb,
                $msb,
                [< set_ $field >],
                $field
            );
        }
    };
}

/// Datapath packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PktType {
    /// Request data.
    Req = 0,

    /// Response data.
    Resp = 1,
}

impl From<u8> for PktType {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Req,
            _ => Self::Resp,
        }
    }
}

/// Datapath packet header, 8 bytes, placed right before application data.
///
/// Byte-granular storage, so it can be read from any alignment.
///
/// # Layout
///
/// | Lsb | Msb |     Name     |
/// | --: | --: | ------------ |
/// |   0 |   7 | req_type     |
/// |   8 |  23 | data_len     |
/// |  24 |  39 | dst_sess_num |
/// |  40 |  40 | pkt_type     |
/// |  41 |  63 | req_idx      |
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct PacketHeader {
    bits: bv::BitArr!(for 64, in u8),
}

impl PacketHeader {
    impl_accessor!(req_type, ReqType, 0, 7);
    impl_accessor!(data_len, u32, 8, 23);
    impl_accessor!(dst_sess_num, SessNum, 24, 39);
    impl_accessor!(pkt_type, PktType, u8, 40, 40);
    impl_accessor!(req_idx, ReqIdx, 41, 63);

    pub fn new(
        req_type: ReqType,
        data_len: u32,
        dst_sess_num: SessNum,
        pkt_type: PktType,
        req_idx: ReqIdx,
    ) -> Self {
        let mut this = Self::default();
        this.set_req_type(req_type);
        this.set_data_len(data_len);
        this.set_dst_sess_num(dst_sess_num);
        this.set_pkt_type(pkt_type);
        this.set_req_idx(req_idx);
        this
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("req_type", &self.req_type())
            .field("data_len", &self.data_len())
            .field("dst_sess_num", &self.dst_sess_num())
            .field("pkt_type", &self.pkt_type())
            .field("req_idx", &self.req_idx())
            .finish()
    }
}

impl Default for PacketHeader {
    fn default() -> Self {
        Self {
            bits: bv::BitArray::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn layout() {
        assert_eq!(mem::size_of::<PacketHeader>(), 8);
        assert_eq!(mem::align_of::<PacketHeader>(), 1);
    }

    #[test]
    fn field_roundtrip() {
        let hdr = PacketHeader::new(42, 4095, 0x1234, PktType::Resp, (1 << 23) - 1);
        assert_eq!(hdr.req_type(), 42);
        assert_eq!(hdr.data_len(), 4095);
        assert_eq!(hdr.dst_sess_num(), 0x1234);
        assert_eq!(hdr.pkt_type(), PktType::Resp);
        assert_eq!(hdr.req_idx(), (1 << 23) - 1);
    }
}
