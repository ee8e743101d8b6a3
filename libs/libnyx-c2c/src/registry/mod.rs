//! # Object registry
//!
//! Maps local buffers and fences into the PCIe window and tracks objects the
//! peer exported to us.
//!
//! ## Lifetime
//!
//! Every object carries one reference per application map, one per
//! outstanding export and one per in-flight copy request. An object whose
//! application maps are all gone but which still holds references is marked
//! for deletion; it is unpinned and its id freed only when the last
//! reference drops.
//!
//! ```text
//! Unmapped ──map──▶ Mapped(refcount ≥ 1) ──unmap (last map)──▶ MarkedForDeletion
//!     ▲                    │                                        │
//!     └──── refcount = 0 ──┴──────────── putref (last ref) ─────────┘
//! ```
//!
//! ## Locking
//!
//! One lock per object type. Locks cover id-table mutation only; pinning and
//! unpinning call into the window broker with no lock held.

mod pin;
mod remote;
mod table;

use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

use crate::channel::ObjectRecord;
use crate::context::SharedChannelContext;
use crate::descriptor::ExportType;
use crate::error::{C2cError, Result};

use pin::PinRecord;
use table::{IdTable, MappedObject};

/// Memory objects mapped at once
pub const MAX_MEM_OBJECTS: u32 = 1024;
/// Sync objects mapped at once
pub const MAX_SYNC_OBJECTS: u32 = 1024;
/// Peer exports tracked at once
pub const MAX_IMPORT_OBJECTS: u32 = 1024;

/// Ids start at 1 so that 0 never names an object
const FIRST_ID: u32 = 1;

bitflags! {
    /// Access the peer or DMA engine gets to a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjType {
    Mem,
    Sync,
    Import,
}

impl From<ExportType> for ObjType {
    fn from(ty: ExportType) -> Self {
        match ty {
            ExportType::Mem => Self::Mem,
            ExportType::Sync => Self::Sync,
        }
    }
}

/// Registry-wide object name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjKey {
    pub ty: ObjType,
    pub id: u32,
}

impl ObjKey {
    pub const fn new(ty: ObjType, id: u32) -> Self {
        Self { ty, id }
    }
}

/// Who provides the mapping for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Management {
    /// Placed in the PCIe window by this registry
    Client,
    /// Mapped by the DMA device itself
    Device,
}

/// A buffer handed in by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSource {
    /// Stable identity of the underlying buffer
    pub identity: u64,
    pub phys: u64,
    pub size: u64,
}

/// A fence handed in by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSource {
    pub fence_id: u32,
    /// Physical address of the fence shim
    pub phys: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MemParams {
    pub source: MemSource,
    pub mngd: Management,
    pub prot: Prot,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncParams {
    pub source: SyncSource,
    /// Pinned fences are reachable by the peer
    pub pin: bool,
    pub mngd: Management,
    pub prot: Prot,
}

/// What to map
#[derive(Debug, Clone, Copy)]
pub enum MapRequest {
    Mem(MemParams),
    Sync(SyncParams),
    Import(crate::descriptor::ExportDescriptor),
}

/// Placement of a mapped object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjAttributes {
    pub key: ObjKey,
    pub iova: u64,
    pub size: u64,
    /// Offset from the window base; the peer reaches the object here
    pub offset: u64,
    pub fence_id: Option<u32>,
}

/// Object counts per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub mem_objects: usize,
    pub sync_objects: usize,
    pub imports: usize,
}

#[derive(Debug)]
struct MemEntry {
    source: MemSource,
    mngd: Management,
    prot: Prot,
    pin: PinRecord,
    /// Exports the peer has not yet unregistered
    exports: u32,
}

impl MemEntry {
    fn attrs(&self, id: u32) -> ObjAttributes {
        ObjAttributes {
            key: ObjKey::new(ObjType::Mem, id),
            iova: self.pin.iova,
            size: self.source.size,
            offset: self.pin.offset,
            fence_id: None,
        }
    }
}

#[derive(Debug)]
struct SyncEntry {
    source: SyncSource,
    pinned: bool,
    mngd: Management,
    prot: Prot,
    pin: PinRecord,
    exports: u32,
}

impl SyncEntry {
    fn attrs(&self, id: u32) -> ObjAttributes {
        ObjAttributes {
            key: ObjKey::new(ObjType::Sync, id),
            iova: self.pin.iova,
            size: self.source.size,
            offset: self.pin.offset,
            fence_id: Some(self.source.fence_id),
        }
    }
}

#[derive(Debug)]
struct ImportEntry {
    record: ObjectRecord,
    nr_export: u32,
    nr_import: u32,
    /// Copy requests holding this import
    busy: u32,
    /// Unmapped import units whose unregister waits for `busy` to drain
    deferred: u32,
}

impl ImportEntry {
    fn attrs(&self, id: u32) -> ObjAttributes {
        ObjAttributes {
            key: ObjKey::new(ObjType::Import, id),
            iova: self.record.iova,
            size: self.record.size,
            offset: self.record.offset,
            fence_id: None,
        }
    }
}

type Table<P> = Mutex<IdTable<MappedObject<P>>>;

/// Object registry for one endpoint
pub struct Registry {
    ctx: Arc<SharedChannelContext>,
    mem: Table<MemEntry>,
    sync: Table<SyncEntry>,
    import: Table<ImportEntry>,
}

impl Registry {
    pub fn new(ctx: &Arc<SharedChannelContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx: ctx.clone(),
            mem: Mutex::new(IdTable::new(FIRST_ID, FIRST_ID + MAX_MEM_OBJECTS)),
            sync: Mutex::new(IdTable::new(FIRST_ID, FIRST_ID + MAX_SYNC_OBJECTS)),
            import: Mutex::new(IdTable::new(FIRST_ID, FIRST_ID + MAX_IMPORT_OBJECTS)),
        })
    }

    /// Map an object, or take another reference on an existing mapping
    pub fn map(&self, request: MapRequest) -> Result<ObjAttributes> {
        match request {
            MapRequest::Mem(params) => self.map_mem(params),
            MapRequest::Sync(params) => self.map_sync(params),
            MapRequest::Import(desc) => self.map_import(desc),
        }
    }

    /// Drop one application map
    pub fn unmap(&self, key: ObjKey) -> Result<()> {
        match key.ty {
            ObjType::Mem => {
                if let Some(entry) = drop_ref(&self.mem, key, true, |_| Ok(()))? {
                    self.destroy_mem(key.id, entry);
                }
                Ok(())
            }
            ObjType::Sync => {
                if let Some(entry) = drop_ref(&self.sync, key, true, |_| Ok(()))? {
                    self.destroy_sync(key.id, entry);
                }
                Ok(())
            }
            ObjType::Import => self.unmap_import(key),
        }
    }

    /// Take a reference that keeps the object alive across a transfer
    pub fn getref(&self, key: ObjKey) -> Result<()> {
        match key.ty {
            ObjType::Mem => take_ref(&self.mem, key),
            ObjType::Sync => take_ref(&self.sync, key),
            ObjType::Import => self.hold_import(key),
        }
    }

    /// Release a reference taken with [`Registry::getref`]
    pub fn putref(&self, key: ObjKey) -> Result<()> {
        match key.ty {
            ObjType::Mem => {
                if let Some(entry) = drop_ref(&self.mem, key, false, |_| Ok(()))? {
                    self.destroy_mem(key.id, entry);
                }
            }
            ObjType::Sync => {
                if let Some(entry) = drop_ref(&self.sync, key, false, |_| Ok(()))? {
                    self.destroy_sync(key.id, entry);
                }
            }
            ObjType::Import => self.put_import(key)?,
        }
        Ok(())
    }

    /// Current placement of a live object
    pub fn attrs(&self, key: ObjKey) -> Result<ObjAttributes> {
        let attrs = match key.ty {
            ObjType::Mem => self.mem.lock().get(key.id).map(|o| o.payload.attrs(o.id)),
            ObjType::Sync => self.sync.lock().get(key.id).map(|o| o.payload.attrs(o.id)),
            ObjType::Import => self.import.lock().get(key.id).map(|o| o.payload.attrs(o.id)),
        };
        attrs.ok_or_else(|| bad_handle(key))
    }

    /// Reference count, or `None` once the object is destroyed
    pub fn refcount(&self, key: ObjKey) -> Option<u32> {
        self.inspect(key, |refcount, _| refcount)
    }

    /// Whether every application map is gone while references remain
    pub fn is_marked_for_deletion(&self, key: ObjKey) -> Result<bool> {
        self.inspect(key, |_, marked| marked).ok_or_else(|| bad_handle(key))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            mem_objects: self.mem.lock().len(),
            sync_objects: self.sync.lock().len(),
            imports: self.import.lock().len(),
        }
    }

    /// Release every object irrespective of reference counts
    ///
    /// Imports still held send one unregister per outstanding export unit so
    /// the peer can reclaim its side.
    pub fn deinit(&self) {
        self.remove_callbacks();

        let mem = self.mem.lock().take_all();
        for obj in mem {
            self.destroy_mem(obj.id, obj.payload);
        }
        let sync = self.sync.lock().take_all();
        for obj in sync {
            self.destroy_sync(obj.id, obj.payload);
        }
        let imports = self.import.lock().take_all();
        for obj in imports {
            // Copy holds are not export units.
            let units = obj.refcount.saturating_sub(obj.payload.busy);
            self.release_import_units(&obj.payload.record, units);
        }
    }

    fn inspect<R>(&self, key: ObjKey, f: impl FnOnce(u32, bool) -> R) -> Option<R> {
        match key.ty {
            ObjType::Mem => {
                self.mem.lock().get(key.id).map(|o| f(o.refcount, o.marked_for_deletion))
            }
            ObjType::Sync => {
                self.sync.lock().get(key.id).map(|o| f(o.refcount, o.marked_for_deletion))
            }
            ObjType::Import => {
                self.import.lock().get(key.id).map(|o| f(o.refcount, o.marked_for_deletion))
            }
        }
    }

    fn map_mem(&self, params: MemParams) -> Result<ObjAttributes> {
        if params.source.size == 0 || params.prot.is_empty() {
            return Err(C2cError::InvalidArgument(format!("memory map of {:?}", params.source)));
        }
        if let Some(attrs) = self.adopt_mem(&params)? {
            return Ok(attrs);
        }

        let pin = match params.mngd {
            Management::Client => {
                pin::pin_window(&self.ctx, params.source.phys, params.source.size, params.prot)?
            }
            Management::Device => pin::pin_device(&self.ctx, &params.source, params.prot)?,
        };

        let mut table = self.mem.lock();
        // Someone mapped the same buffer while we were pinning.
        if let Some(obj) = table.find_mut(|o| o.payload.source.identity == params.source.identity) {
            let adopted = check_mem_mode(&obj.payload, &params).map(|()| {
                obj.adopt();
                obj.payload.attrs(obj.id)
            });
            drop(table);
            pin::unpin(&self.ctx, pin);
            return adopted;
        }

        let entry = MemEntry {
            source: params.source,
            mngd: params.mngd,
            prot: params.prot,
            pin,
            exports: 0,
        };
        let mut attrs = entry.attrs(0);
        match table.insert_with(|id| MappedObject::new(id, entry)) {
            Ok(id) => {
                attrs.key.id = id;
                tracing::debug!(
                    id,
                    iova = format_args!("{:#x}", attrs.iova),
                    size = attrs.size,
                    "mem object mapped"
                );
                Ok(attrs)
            }
            Err(e) => {
                drop(table);
                pin::unpin(&self.ctx, pin);
                Err(e)
            }
        }
    }

    fn adopt_mem(&self, params: &MemParams) -> Result<Option<ObjAttributes>> {
        let mut table = self.mem.lock();
        let identity = params.source.identity;
        let Some(obj) = table.find_mut(|o| o.payload.source.identity == identity) else {
            return Ok(None);
        };
        check_mem_mode(&obj.payload, params)?;
        obj.adopt();
        tracing::trace!(id = obj.id, refcount = obj.refcount, "mem object re-mapped");
        Ok(Some(obj.payload.attrs(obj.id)))
    }

    fn map_sync(&self, params: SyncParams) -> Result<ObjAttributes> {
        if params.pin && params.mngd == Management::Device {
            return Err(C2cError::InvalidArgument("pinned sync objects are client managed".into()));
        }
        if let Some(attrs) = self.adopt_sync(&params)? {
            return Ok(attrs);
        }

        let pin = if params.pin {
            pin::pin_window(&self.ctx, params.source.phys, params.source.size, params.prot)?
        } else {
            PinRecord::UNPINNED
        };

        let mut table = self.sync.lock();
        if let Some(obj) = table.find_mut(|o| o.payload.source.fence_id == params.source.fence_id) {
            let adopted = check_sync_mode(&obj.payload, &params).map(|()| {
                obj.adopt();
                obj.payload.attrs(obj.id)
            });
            drop(table);
            pin::unpin(&self.ctx, pin);
            return adopted;
        }

        let entry = SyncEntry {
            source: params.source,
            pinned: params.pin,
            mngd: params.mngd,
            prot: params.prot,
            pin,
            exports: 0,
        };
        let mut attrs = entry.attrs(0);
        match table.insert_with(|id| MappedObject::new(id, entry)) {
            Ok(id) => {
                attrs.key.id = id;
                tracing::debug!(
                    id,
                    fence = params.source.fence_id,
                    pinned = params.pin,
                    "sync object mapped"
                );
                Ok(attrs)
            }
            Err(e) => {
                drop(table);
                pin::unpin(&self.ctx, pin);
                Err(e)
            }
        }
    }

    fn adopt_sync(&self, params: &SyncParams) -> Result<Option<ObjAttributes>> {
        let mut table = self.sync.lock();
        let fence_id = params.source.fence_id;
        let Some(obj) = table.find_mut(|o| o.payload.source.fence_id == fence_id) else {
            return Ok(None);
        };
        check_sync_mode(&obj.payload, params)?;
        obj.adopt();
        Ok(Some(obj.payload.attrs(obj.id)))
    }

    fn destroy_mem(&self, id: u32, entry: MemEntry) {
        if entry.exports > 0 {
            tracing::debug!(
                id,
                exports = entry.exports,
                "mem object released with exports outstanding"
            );
        }
        pin::unpin(&self.ctx, entry.pin);
        tracing::debug!(id, "mem object destroyed");
    }

    fn destroy_sync(&self, id: u32, entry: SyncEntry) {
        pin::unpin(&self.ctx, entry.pin);
        tracing::debug!(id, pinned = entry.pinned, "sync object destroyed");
    }
}

fn check_mem_mode(existing: &MemEntry, params: &MemParams) -> Result<()> {
    if existing.mngd != params.mngd || existing.prot != params.prot {
        return Err(C2cError::Conflict(format!(
            "buffer {:#x} mapped as {:?}/{:?}, requested {:?}/{:?}",
            params.source.identity, existing.mngd, existing.prot, params.mngd, params.prot
        )));
    }
    Ok(())
}

fn check_sync_mode(existing: &SyncEntry, params: &SyncParams) -> Result<()> {
    if existing.pinned != params.pin
        || existing.mngd != params.mngd
        || existing.prot != params.prot
    {
        return Err(C2cError::Conflict(format!(
            "fence {} already mapped with a different mode",
            params.source.fence_id
        )));
    }
    Ok(())
}

fn bad_handle(key: ObjKey) -> C2cError {
    C2cError::BadHandle(format!("{:?} object {}", key.ty, key.id))
}

fn take_ref<P>(table: &Table<P>, key: ObjKey) -> Result<()> {
    let mut table = table.lock();
    let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
    obj.refcount += 1;
    Ok(())
}

/// Drop one reference; returns the payload once the last one is gone
///
/// `unmap` also retires one application map. `check` runs under the table
/// lock before anything changes and may veto the release.
fn drop_ref<P>(
    table: &Table<P>,
    key: ObjKey,
    unmap: bool,
    check: impl FnOnce(&mut P) -> Result<()>,
) -> Result<Option<P>> {
    let mut table = table.lock();
    let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
    if unmap && obj.live == 0 {
        return Err(C2cError::InvalidArgument(format!(
            "{:?} object {} is not mapped",
            key.ty, key.id
        )));
    }
    check(&mut obj.payload)?;

    if unmap {
        obj.live -= 1;
    }
    obj.refcount -= 1;
    if obj.refcount == 0 {
        return Ok(table.remove(key.id).map(|o| o.payload));
    }
    if obj.live == 0 && !obj.marked_for_deletion {
        obj.marked_for_deletion = true;
        tracing::debug!(ty = ?key.ty, id = key.id, refcount = obj.refcount, "marked for deletion");
    }
    Ok(None)
}
