//! # Hardware Abstraction Traits
//!
//! The PCIe window, the eDMA engine, doorbells and fences belong to other
//! drivers. This module describes exactly what the chip-to-chip core needs
//! from each of them, so the core can be driven by real hardware or by the
//! loopback implementations in [`crate::loopback`].
//!
//! ## Testing Strategy
//!
//! Tests and `tetherd` pair two nodes through a `LoopbackFabric`; DMA can
//! complete immediately or be held by the test to exercise in-flight races.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::channel::FifoRegion;
use crate::copy::InFlight;
use crate::error::{C2cError, Result};
use crate::registry::{MemSource, Prot};

/// Cross-node notification primitive (a syncpoint shim in hardware)
pub trait Doorbell: Send + Sync {
    /// Signal whoever waits on this doorbell; never sleeps
    fn ring(&self);

    /// Resolve after the next ring, or immediately if one is pending
    fn wait(&self) -> BoxFuture<'_, ()>;
}

/// What a window mapping points at
#[derive(Clone)]
pub enum Backing {
    /// Physical memory of a pinned buffer or fence shim
    Phys(u64),
    /// A receive fifo
    Fifo(Arc<FifoRegion>),
    /// A doorbell the peer rings through its aperture
    Doorbell(Arc<dyn Doorbell>),
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Phys(addr) => write!(f, "Phys({addr:#x})"),
            Self::Fifo(fifo) => write!(f, "Fifo({} frames)", fifo.nframes()),
            Self::Doorbell(_) => f.write_str("Doorbell"),
        }
    }
}

/// Placement of a device-managed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMapping {
    pub iova: u64,
    pub size: u64,
}

/// Address-space broker for the local PCIe window and the peer aperture
pub trait PcieClient: Send + Sync {
    /// Make `backing` visible at `iova` in the local window
    fn map(&self, iova: u64, size: u64, backing: Backing, prot: Prot) -> Result<()>;

    /// Tear down a mapping made with [`PcieClient::map`]
    fn unmap(&self, iova: u64, size: u64) -> Result<()>;

    /// Map a buffer through the DMA device's own address space
    fn attach(&self, source: &MemSource, prot: Prot) -> Result<DeviceMapping>;

    fn detach(&self, mapping: DeviceMapping) -> Result<()>;

    /// Aperture address of `offset` in the peer's window
    fn peer_aperture(&self, offset: u64, size: u64) -> Result<u64>;

    /// CPU view of the peer's receive fifo at `offset`
    fn peer_fifo(&self, offset: u64) -> Result<Arc<FifoRegion>>;

    /// The peer's doorbell at `offset`
    fn peer_doorbell(&self, offset: u64) -> Result<Arc<dyn Doorbell>>;

    /// Uncached read through the aperture, used to flush posted writes
    fn peer_read_u32(&self, aperture: u64) -> Result<u32>;

    /// CPU write through the aperture
    fn peer_write_u64(&self, aperture: u64, value: u64) -> Result<()>;
}

/// Local fence (syncpoint) operations
pub trait FenceOps: Send + Sync {
    /// Increment the fence once, releasing its waiters
    fn increment(&self, fence_id: u32);
}

/// One eDMA descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDesc {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
}

/// Outcome reported by the DMA engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaStatus {
    Success,
    Failed,
}

/// Asynchronous DMA engine
///
/// On acceptance the engine owns the transfer and must eventually call
/// [`InFlight::complete`], from any thread. On rejection it hands the
/// transfer back untouched.
pub trait DmaEngine: Send + Sync {
    fn submit(&self, transfer: InFlight) -> std::result::Result<(), (C2cError, InFlight)>;
}
