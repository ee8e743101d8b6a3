//! Control message wire format
//!
//! Every message occupies one 64-byte frame of little-endian words. Word 0
//! carries the message type in its low 32 bits; the payload follows.

use crate::descriptor::ExportDescriptor;
use crate::error::{C2cError, Result};
use crate::link::LinkStatus;

/// Bytes per frame on the wire
pub const FRAME_SIZE: usize = 64;
/// Words per frame
pub const FRAME_WORDS: usize = FRAME_SIZE / 8;

/// One frame as it sits in the fifo
pub type Frame = [u64; FRAME_WORDS];

/// Message type tags
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid = 0,
    Bootstrap = 1,
    Link = 2,
    Register = 3,
    Unregister = 4,
    EdmaDescReturn = 5,
}

impl MessageType {
    /// Number of tags, including `Invalid`
    pub const COUNT: usize = 6;

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Invalid),
            1 => Some(Self::Bootstrap),
            2 => Some(Self::Link),
            3 => Some(Self::Register),
            4 => Some(Self::Unregister),
            5 => Some(Self::EdmaDescReturn),
            _ => None,
        }
    }
}

/// CPU class of the peer SoC, learned from the bootstrap message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCpu {
    /// Remote fences are signalled with DMA writes
    Arm64 = 0,
    /// Remote fences are signalled with CPU writes through the aperture
    X86_64 = 1,
}

impl PeerCpu {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Arm64),
            1 => Some(Self::X86_64),
            _ => None,
        }
    }

    /// Whether a DMA write into the peer's fence shim signals it
    pub fn signals_fences_by_dma(self) -> bool {
        matches!(self, Self::Arm64)
    }
}

/// Placement of one exported object, as carried by register/unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    pub desc: ExportDescriptor,
    pub iova: u64,
    pub size: u64,
    pub offset: u64,
}

/// Control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Root port to endpoint: channel memory location and CPU class
    Bootstrap { iova: u64, peer_cpu: PeerCpu },
    /// Link status change on the sender's side
    Link { status: LinkStatus },
    /// Exporter announces an object the receiver may import
    Register(ObjectRecord),
    /// Importer hands back one unit of export reference
    Unregister(ObjectRecord),
    /// Return of an eDMA descriptor ring
    EdmaDescReturn { iova: u64 },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Bootstrap { .. } => MessageType::Bootstrap,
            Self::Link { .. } => MessageType::Link,
            Self::Register(_) => MessageType::Register,
            Self::Unregister(_) => MessageType::Unregister,
            Self::EdmaDescReturn { .. } => MessageType::EdmaDescReturn,
        }
    }

    /// Serialize into a frame
    pub fn encode(&self) -> Frame {
        let mut frame = [0u64; FRAME_WORDS];
        frame[0] = self.message_type() as u64;
        match *self {
            Self::Bootstrap { iova, peer_cpu } => {
                frame[1] = iova;
                frame[2] = peer_cpu as u64;
            }
            Self::Link { status } => frame[1] = status as u64,
            Self::Register(rec) | Self::Unregister(rec) => {
                frame[1] = rec.desc.raw();
                frame[2] = rec.iova;
                frame[3] = rec.size;
                frame[4] = rec.offset;
            }
            Self::EdmaDescReturn { iova } => frame[1] = iova,
        }
        frame
    }

    /// Parse a frame read from the fifo
    pub fn decode(frame: &Frame) -> Result<Self> {
        let raw_type = frame[0] as u32;
        let ty = MessageType::from_u32(raw_type)
            .ok_or_else(|| C2cError::InvalidArgument(format!("unknown message type {raw_type}")))?;

        let record = || ObjectRecord {
            desc: ExportDescriptor::from_raw(frame[1]),
            iova: frame[2],
            size: frame[3],
            offset: frame[4],
        };

        match ty {
            MessageType::Invalid => Err(C2cError::InvalidArgument("invalid message type".into())),
            MessageType::Bootstrap => {
                let peer_cpu = PeerCpu::from_raw(frame[2]).ok_or_else(|| {
                    C2cError::InvalidArgument(format!("unknown peer cpu {}", frame[2]))
                })?;
                Ok(Self::Bootstrap { iova: frame[1], peer_cpu })
            }
            MessageType::Link => {
                let status = LinkStatus::from_raw(frame[1]).ok_or_else(|| {
                    C2cError::InvalidArgument(format!("unknown link status {}", frame[1]))
                })?;
                Ok(Self::Link { status })
            }
            MessageType::Register => Ok(Self::Register(record())),
            MessageType::Unregister => Ok(Self::Unregister(record())),
            MessageType::EdmaDescReturn => Ok(Self::EdmaDescReturn { iova: frame[1] }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_frame_layout() {
        let rec = ObjectRecord {
            desc: ExportDescriptor::from_raw(0xAB),
            iova: 0x8000_1000,
            size: 0x2000,
            offset: 0x1000,
        };
        let frame = Message::Register(rec).encode();
        assert_eq!(frame[..5], [3, 0xAB, 0x8000_1000, 0x2000, 0x1000]);
        assert_eq!(Message::decode(&frame).unwrap(), Message::Register(rec));
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(Message::decode(&[0; FRAME_WORDS]).is_err());

        let mut frame = [0; FRAME_WORDS];
        frame[0] = 42;
        assert!(Message::decode(&frame).is_err());

        let mut frame = Message::Link { status: LinkStatus::Up }.encode();
        frame[1] = 7;
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_peer_cpu_fence_path() {
        assert!(PeerCpu::Arm64.signals_fences_by_dma());
        assert!(!PeerCpu::X86_64.signals_fences_by_dma());
    }
}
