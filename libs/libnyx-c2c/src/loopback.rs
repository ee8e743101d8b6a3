//! # Loopback collaborators
//!
//! In-process stand-ins for the PCIe window, doorbells, fences and the eDMA
//! engine. A [`LoopbackFabric`] joins two [`LoopbackPort`]s so that what one
//! node maps into its window is what the other reaches through its aperture.
//!
//! Used by the integration tests and by `tetherd`'s self-test.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use spin::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::channel::FifoRegion;
use crate::copy::InFlight;
use crate::error::{C2cError, Result};
use crate::registry::{MemSource, Prot};
use crate::traits::{
    Backing, DeviceMapping, DmaDesc, DmaEngine, DmaStatus, Doorbell, FenceOps, PcieClient,
};
use crate::page_align;

/// Where each port sees its peer's window
const APERTURE_BASE: u64 = 0x40_0000_0000;
/// Start of the simulated DMA device address space
const DEVICE_IOVA_BASE: u64 = 0x1_0000_0000;

/// Doorbell backed by a [`Notify`]; a ring with no waiter is remembered
#[derive(Default)]
pub struct NotifyDoorbell {
    notify: Notify,
    rings: AtomicU64,
}

impl NotifyDoorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times this doorbell has been rung
    pub fn rings(&self) -> u64 {
        self.rings.load(Ordering::Relaxed)
    }
}

impl Doorbell for NotifyDoorbell {
    fn ring(&self) {
        self.rings.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }

    fn wait(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.notify.notified())
    }
}

struct Mapping {
    size: u64,
    backing: Backing,
}

/// One node's PCIe window
struct Window {
    base: u64,
    size: u64,
    /// Keyed by offset from `base`
    mappings: Mutex<BTreeMap<u64, Mapping>>,
    /// Words written through the peer's aperture, keyed by physical address
    memory: Mutex<HashMap<u64, u64>>,
}

impl Window {
    fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            mappings: Mutex::new(BTreeMap::new()),
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Backing and offset inside it for a window offset
    fn resolve(&self, offset: u64) -> Option<(Backing, u64)> {
        let mappings = self.mappings.lock();
        let (start, mapping) = mappings.range(..=offset).next_back()?;
        (offset < start + mapping.size).then(|| (mapping.backing.clone(), offset - start))
    }
}

/// Two windows wired back to back
pub struct LoopbackFabric;

impl LoopbackFabric {
    /// Ports for node A and node B, both windows at `base` of `size` bytes
    pub fn pair(base: u64, size: u64) -> (Arc<LoopbackPort>, Arc<LoopbackPort>) {
        let a = Arc::new(Window::new(base, size));
        let b = Arc::new(Window::new(base, size));
        (
            Arc::new(LoopbackPort::new(a.clone(), b.clone())),
            Arc::new(LoopbackPort::new(b, a)),
        )
    }
}

/// Address-space broker for one side of a [`LoopbackFabric`]
pub struct LoopbackPort {
    own: Arc<Window>,
    peer: Arc<Window>,
    next_device_iova: AtomicU64,
    attached: Mutex<HashMap<u64, DeviceMapping>>,
}

impl LoopbackPort {
    fn new(own: Arc<Window>, peer: Arc<Window>) -> Self {
        Self {
            own,
            peer,
            next_device_iova: AtomicU64::new(DEVICE_IOVA_BASE),
            attached: Mutex::new(HashMap::new()),
        }
    }

    /// Word the peer last wrote at `phys` in our memory
    pub fn read_phys(&self, phys: u64) -> Option<u64> {
        self.own.memory.lock().get(&phys).copied()
    }

    /// Live mappings in our window
    pub fn mapping_count(&self) -> usize {
        self.own.mappings.lock().len()
    }

    /// Live device-managed mappings
    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }

    fn peer_offset(&self, aperture: u64) -> Result<u64> {
        aperture
            .checked_sub(APERTURE_BASE)
            .filter(|off| *off < self.peer.size)
            .ok_or_else(|| {
                C2cError::InvalidArgument(format!("aperture {aperture:#x} outside peer window"))
            })
    }

    fn peer_phys(&self, aperture: u64) -> Result<u64> {
        let offset = self.peer_offset(aperture)?;
        match self.peer.resolve(offset) {
            Some((Backing::Phys(phys), inner)) => Ok(phys + inner),
            _ => Err(C2cError::NotFound(format!("no memory behind aperture {aperture:#x}"))),
        }
    }
}

impl PcieClient for LoopbackPort {
    fn map(&self, iova: u64, size: u64, backing: Backing, _prot: Prot) -> Result<()> {
        let offset = iova
            .checked_sub(self.own.base)
            .filter(|off| size > 0 && off.checked_add(size).is_some_and(|end| end <= self.own.size))
            .ok_or_else(|| {
                C2cError::InvalidArgument(format!("iova {iova:#x}+{size:#x} outside window"))
            })?;

        let mut mappings = self.own.mappings.lock();
        let overlaps = mappings
            .range(..offset + size)
            .next_back()
            .is_some_and(|(start, m)| start + m.size > offset);
        if overlaps {
            return Err(C2cError::Busy(format!("iova {iova:#x} already mapped")));
        }
        mappings.insert(offset, Mapping { size, backing });
        Ok(())
    }

    fn unmap(&self, iova: u64, size: u64) -> Result<()> {
        let offset = iova.wrapping_sub(self.own.base);
        let mut mappings = self.own.mappings.lock();
        match mappings.get(&offset) {
            Some(m) if m.size == size => {
                mappings.remove(&offset);
                Ok(())
            }
            _ => Err(C2cError::NotFound(format!("no mapping at {iova:#x}+{size:#x}"))),
        }
    }

    fn attach(&self, source: &MemSource, _prot: Prot) -> Result<DeviceMapping> {
        let size = page_align(source.size)?;
        let iova = self
            .next_device_iova
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| next.checked_add(size))
            .map_err(|_| C2cError::ResourceExhausted("device address space"))?;
        let mapping = DeviceMapping { iova, size };
        self.attached.lock().insert(iova, mapping);
        Ok(mapping)
    }

    fn detach(&self, mapping: DeviceMapping) -> Result<()> {
        self.attached
            .lock()
            .remove(&mapping.iova)
            .map(|_| ())
            .ok_or_else(|| C2cError::NotFound(format!("device mapping {:#x}", mapping.iova)))
    }

    fn peer_aperture(&self, offset: u64, size: u64) -> Result<u64> {
        if offset.checked_add(size).is_none_or(|end| end > self.peer.size) {
            return Err(C2cError::InvalidArgument(format!("peer range {offset:#x}+{size:#x}")));
        }
        Ok(APERTURE_BASE + offset)
    }

    fn peer_fifo(&self, offset: u64) -> Result<Arc<FifoRegion>> {
        match self.peer.resolve(offset) {
            Some((Backing::Fifo(fifo), 0)) => Ok(fifo),
            _ => Err(C2cError::TryAgain(format!("peer fifo at {offset:#x} not mapped yet"))),
        }
    }

    fn peer_doorbell(&self, offset: u64) -> Result<Arc<dyn Doorbell>> {
        match self.peer.resolve(offset) {
            Some((Backing::Doorbell(bell), 0)) => Ok(bell),
            _ => Err(C2cError::TryAgain(format!("peer doorbell at {offset:#x} not mapped yet"))),
        }
    }

    fn peer_read_u32(&self, aperture: u64) -> Result<u32> {
        let phys = self.peer_phys(aperture)?;
        Ok(self.peer.memory.lock().get(&phys).copied().unwrap_or(0) as u32)
    }

    fn peer_write_u64(&self, aperture: u64, value: u64) -> Result<()> {
        let phys = self.peer_phys(aperture)?;
        self.peer.memory.lock().insert(phys, value);
        Ok(())
    }
}

/// Fence counters
#[derive(Default)]
pub struct CounterFences {
    values: Mutex<HashMap<u32, u64>>,
}

impl CounterFences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, fence_id: u32) -> u64 {
        self.values.lock().get(&fence_id).copied().unwrap_or(0)
    }
}

impl FenceOps for CounterFences {
    fn increment(&self, fence_id: u32) {
        *self.values.lock().entry(fence_id).or_insert(0) += 1;
    }
}

/// DMA engine that holds transfers until told to complete them
#[derive(Default)]
pub struct ManualDma {
    queue: Mutex<VecDeque<InFlight>>,
    history: Mutex<Vec<Vec<DmaDesc>>>,
    reject_next: AtomicBool,
}

impl ManualDma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next submit
    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::Release);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Descriptor lists of every accepted submit, oldest first
    pub fn history(&self) -> Vec<Vec<DmaDesc>> {
        self.history.lock().clone()
    }

    /// Complete the oldest transfer; false if none is queued
    pub fn complete_next(&self, status: DmaStatus) -> bool {
        // Pop first so completion runs without the queue lock held.
        let next = self.queue.lock().pop_front();
        match next {
            Some(transfer) => {
                transfer.complete(status);
                true
            }
            None => false,
        }
    }

    pub fn complete_all(&self, status: DmaStatus) -> usize {
        let mut n = 0;
        while self.complete_next(status) {
            n += 1;
        }
        n
    }
}

impl DmaEngine for ManualDma {
    fn submit(&self, transfer: InFlight) -> std::result::Result<(), (C2cError, InFlight)> {
        if self.reject_next.swap(false, Ordering::AcqRel) {
            return Err((C2cError::Dma("transfer rejected".into()), transfer));
        }
        self.history.lock().push(transfer.descriptors().to_vec());
        self.queue.lock().push_back(transfer);
        Ok(())
    }
}

/// DMA engine that completes every transfer successfully on a worker thread
pub struct ImmediateDma {
    queue: mpsc::UnboundedSender<InFlight>,
    transfers: AtomicU64,
}

impl ImmediateDma {
    pub fn new() -> Result<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<InFlight>();
        // Completion arrives from another context, as an interrupt would.
        std::thread::Builder::new().name("c2c-edma".into()).spawn(move || {
            while let Some(transfer) = rx.blocking_recv() {
                transfer.complete(DmaStatus::Success);
            }
        })?;
        Ok(Self { queue, transfers: AtomicU64::new(0) })
    }

    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }
}

impl DmaEngine for ImmediateDma {
    fn submit(&self, transfer: InFlight) -> std::result::Result<(), (C2cError, InFlight)> {
        self.queue
            .send(transfer)
            .map_err(|mpsc::error::SendError(t)| {
                (C2cError::Dma("completion worker gone".into()), t)
            })?;
        self.transfers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn test_ports_see_each_other() {
        let (a, b) = LoopbackFabric::pair(0x8000_0000, 0x10_0000);
        let fifo = Arc::new(FifoRegion::new(4, 64).unwrap());
        a.map(0x8000_2000, PAGE_SIZE, Backing::Fifo(fifo.clone()), Prot::READ | Prot::WRITE)
            .unwrap();

        let seen = b.peer_fifo(0x2000).unwrap();
        assert!(Arc::ptr_eq(&seen, &fifo));
        assert!(matches!(b.peer_fifo(0x3000), Err(C2cError::TryAgain(_))));
        assert!(matches!(a.peer_fifo(0x2000), Err(C2cError::TryAgain(_))));
    }

    #[test]
    fn test_overlapping_map_rejected() {
        let (a, _b) = LoopbackFabric::pair(0x8000_0000, 0x10_0000);
        a.map(0x8000_0000, 0x2000, Backing::Phys(0x10), Prot::READ).unwrap();
        assert!(a.map(0x8000_1000, 0x1000, Backing::Phys(0x20), Prot::READ).is_err());
        a.unmap(0x8000_0000, 0x2000).unwrap();
        assert_eq!(a.mapping_count(), 0);
    }

    #[test]
    fn test_aperture_writes_land_in_peer_memory() {
        let (a, b) = LoopbackFabric::pair(0x8000_0000, 0x10_0000);
        b.map(0x8000_4000, PAGE_SIZE, Backing::Phys(0xF000_0000), Prot::WRITE).unwrap();

        let aperture = a.peer_aperture(0x4000, 8).unwrap();
        a.peer_write_u64(aperture + 8, 42).unwrap();
        assert_eq!(b.read_phys(0xF000_0008), Some(42));
        assert_eq!(a.peer_read_u32(aperture + 8).unwrap(), 42);
        assert!(a.peer_write_u64(APERTURE_BASE + 0x9000, 1).is_err());
    }

    #[test]
    fn test_doorbell_remembers_ring() {
        let bell = NotifyDoorbell::new();
        bell.ring();
        futures::executor::block_on(bell.wait());
        assert_eq!(bell.rings(), 1);
    }
}
