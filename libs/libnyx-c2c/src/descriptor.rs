//! Export descriptors
//!
//! A 64-bit token naming one exported object and the node allowed to import
//! it. The exporter packs the *peer's* identity into the token, so the
//! importer can check that the value was meant for it without asking the
//! exporter anything.
//!
//! ```text
//!  63            32 31  28 27  24 23  20 19  16 15  12  11  10       0
//! +----------------+------+------+------+------+------+----+----------+
//! |     magic      |board | soc  |cntrlr|  ep  | rsvd |type|    id    |
//! +----------------+------+------+------+------+------+----+----------+
//! ```

use crate::config::{NodeIdentity, MAX_ID_FIELD};
use crate::error::{C2cError, Result};

/// Fixed tag in the upper word ("C2CX")
pub const DESC_MAGIC: u32 = 0x4332_4358;

/// Object ids fit in 11 bits
pub const MAX_EXPORT_ID: u32 = 1 << 11;

const MAGIC_SHIFT: u32 = 32;
const BOARD_SHIFT: u32 = 28;
const SOC_SHIFT: u32 = 24;
const CNTRLR_SHIFT: u32 = 20;
const EP_SHIFT: u32 = 16;
const TYPE_SHIFT: u32 = 11;
const NIBBLE: u64 = 0xF;
const ID_MASK: u64 = (MAX_EXPORT_ID - 1) as u64;

/// What kind of object an export refers to
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportType {
    /// Memory buffer
    Mem = 0,
    /// Sync object (fence)
    Sync = 1,
}

/// Decoded descriptor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorFields {
    pub board_id: u8,
    pub soc_id: u8,
    pub cntrlr_id: u8,
    pub endpoint: u8,
    pub export_type: ExportType,
    pub id: u32,
}

/// Bit-packed export token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExportDescriptor(u64);

impl ExportDescriptor {
    /// Pack a descriptor addressed to `peer`
    pub fn encode(
        peer: NodeIdentity,
        endpoint: u8,
        export_type: ExportType,
        id: u32,
    ) -> Result<Self> {
        if peer.board_id > MAX_ID_FIELD
            || peer.soc_id > MAX_ID_FIELD
            || peer.cntrlr_id > MAX_ID_FIELD
            || endpoint > MAX_ID_FIELD
        {
            return Err(C2cError::InvalidArgument(format!(
                "descriptor identity out of range: {peer:?} ep {endpoint}"
            )));
        }
        if id >= MAX_EXPORT_ID {
            return Err(C2cError::InvalidArgument(format!("export id {id} out of range")));
        }

        let raw = (u64::from(DESC_MAGIC) << MAGIC_SHIFT)
            | (u64::from(peer.board_id) << BOARD_SHIFT)
            | (u64::from(peer.soc_id) << SOC_SHIFT)
            | (u64::from(peer.cntrlr_id) << CNTRLR_SHIFT)
            | (u64::from(endpoint) << EP_SHIFT)
            | ((export_type as u64) << TYPE_SHIFT)
            | u64::from(id);
        Ok(Self(raw))
    }

    /// Wrap a value received from userspace or the peer; no checks
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn magic(self) -> u32 {
        (self.0 >> MAGIC_SHIFT) as u32
    }

    pub fn export_type(self) -> ExportType {
        if (self.0 >> TYPE_SHIFT) & 1 == 0 {
            ExportType::Mem
        } else {
            ExportType::Sync
        }
    }

    pub fn id(self) -> u32 {
        (self.0 & ID_MASK) as u32
    }

    pub fn decode(self) -> DescriptorFields {
        DescriptorFields {
            board_id: ((self.0 >> BOARD_SHIFT) & NIBBLE) as u8,
            soc_id: ((self.0 >> SOC_SHIFT) & NIBBLE) as u8,
            cntrlr_id: ((self.0 >> CNTRLR_SHIFT) & NIBBLE) as u8,
            endpoint: ((self.0 >> EP_SHIFT) & NIBBLE) as u8,
            export_type: self.export_type(),
            id: self.id(),
        }
    }

    /// Check the token is well formed and addressed to this node and endpoint
    pub fn validate(self, local: NodeIdentity, endpoint: u8) -> Result<()> {
        if self.magic() != DESC_MAGIC {
            return Err(C2cError::PermissionDenied(format!(
                "descriptor {:#018x}: bad magic",
                self.0
            )));
        }
        let f = self.decode();
        if f.board_id != local.board_id
            || f.soc_id != local.soc_id
            || f.cntrlr_id != local.cntrlr_id
            || f.endpoint != endpoint
        {
            return Err(C2cError::PermissionDenied(format!(
                "descriptor {:#018x} not addressed to this endpoint",
                self.0
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for ExportDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PEER: NodeIdentity = NodeIdentity { board_id: 2, soc_id: 1, cntrlr_id: 3 };

    #[test]
    fn test_layout() {
        let desc = ExportDescriptor::encode(PEER, 5, ExportType::Sync, 0x7FF).unwrap();
        assert_eq!(desc.raw(), 0x4332_4358_2135_0FFF);
        assert_eq!(desc.export_type(), ExportType::Sync);
        assert_eq!(desc.id(), 0x7FF);
    }

    #[test]
    fn test_validate_local_identity() {
        let desc = ExportDescriptor::encode(PEER, 5, ExportType::Mem, 9).unwrap();
        desc.validate(PEER, 5).unwrap();
        assert!(desc.validate(PEER, 4).is_err());
        let other = NodeIdentity { soc_id: 0, ..PEER };
        assert!(matches!(desc.validate(other, 5), Err(C2cError::PermissionDenied(_))));
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(ExportDescriptor::encode(PEER, 5, ExportType::Mem, MAX_EXPORT_ID).is_err());
        assert!(ExportDescriptor::encode(PEER, 16, ExportType::Mem, 1).is_err());
        let wide = NodeIdentity { board_id: 16, ..PEER };
        assert!(ExportDescriptor::encode(wide, 0, ExportType::Mem, 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            board in 0u8..16, soc in 0u8..16, cntrlr in 0u8..16, ep in 0u8..16,
            sync in any::<bool>(), id in 0u32..MAX_EXPORT_ID,
        ) {
            let peer = NodeIdentity { board_id: board, soc_id: soc, cntrlr_id: cntrlr };
            let ty = if sync { ExportType::Sync } else { ExportType::Mem };
            let desc = ExportDescriptor::encode(peer, ep, ty, id).unwrap();
            let expected = DescriptorFields {
                board_id: board,
                soc_id: soc,
                cntrlr_id: cntrlr,
                endpoint: ep,
                export_type: ty,
                id,
            };
            prop_assert_eq!(desc.decode(), expected);
            prop_assert!(desc.validate(peer, ep).is_ok());
        }

        #[test]
        fn prop_magic_bit_flip_fails(bit in 32u32..64, id in 0u32..MAX_EXPORT_ID) {
            let desc = ExportDescriptor::encode(PEER, 1, ExportType::Mem, id).unwrap();
            let flipped = ExportDescriptor::from_raw(desc.raw() ^ (1u64 << bit));
            prop_assert!(flipped.validate(PEER, 1).is_err());
        }
    }
}
