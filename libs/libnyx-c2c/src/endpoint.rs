//! # Endpoint
//!
//! The application-facing surface of one endpoint: opaque handles over
//! registry objects, export/import through the control channel, and copy
//! submission.
//!
//! A handle always names one application map. Importing the same
//! descriptor twice yields two handles, each consuming one export unit.

use std::collections::HashMap;
use std::sync::Arc;

use spin::Mutex;

use crate::channel::{Message, ObjectRecord};
use crate::config::DriverMode;
use crate::context::SharedChannelContext;
use crate::copy::{CopyCompletion, CopyEngine, CopyLimits, PendingCopy, RemoteSignal, POOL_EMPTY};
use crate::descriptor::{ExportDescriptor, ExportType};
use crate::error::{C2cError, Result};
use crate::registry::{
    Management, MapRequest, MemParams, MemSource, ObjAttributes, ObjKey, Prot, Registry,
    SyncParams, SyncSource,
};
use crate::traits::DmaDesc;

/// Handles open at once per endpoint
pub const MAX_HANDLES: usize = 4096;

/// Width of a DMA fence write
const FENCE_WRITE_LEN: u64 = 4;

/// Opaque reference to one mapped object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Role an application object plays in copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// Local buffer read by the DMA engine
    SourceMem,
    /// Local buffer the peer writes into; exportable
    TargetMem,
    /// Fence signalled on this node when a copy completes
    LocalSync,
    /// Fence the peer signals; exportable
    RemoteSync,
    /// Object the peer exported to us
    Import,
}

/// Backing for [`Endpoint::map`]
#[derive(Debug, Clone, Copy)]
pub enum ObjectSource {
    Mem(MemSource),
    Sync(SyncSource),
}

/// One contiguous copy from a source buffer into an imported buffer
///
/// `offset` applies to both sides.
#[derive(Debug, Clone, Copy)]
pub struct FlushRange {
    pub src: Handle,
    pub dst: Handle,
    pub offset: u64,
    pub size: u64,
}

/// Fence the peer exported, and the value to post to it
#[derive(Debug, Clone, Copy)]
pub struct RemoteFence {
    pub handle: Handle,
    pub value: u64,
}

/// Arguments to [`Endpoint::submit_copy`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyArgs<'a> {
    pub flush_ranges: &'a [FlushRange],
    pub local_fences: &'a [Handle],
    pub remote_fences: &'a [RemoteFence],
}

#[derive(Debug, Clone, Copy)]
struct StreamObject {
    kind: ObjKind,
    attrs: ObjAttributes,
    /// Peer's export type, for imports
    import_type: Option<ExportType>,
    /// Where this node reaches the object through the PCIe aperture
    aperture: u64,
}

impl StreamObject {
    fn key(&self) -> ObjKey {
        self.attrs.key
    }
}

struct HandleTable {
    objects: HashMap<u32, StreamObject>,
    next: u32,
}

impl HandleTable {
    fn insert(&mut self, obj: StreamObject) -> Result<Handle> {
        if self.objects.len() >= MAX_HANDLES {
            return Err(C2cError::ResourceExhausted("endpoint handles"));
        }
        // Skip 0 and any value still in use after wrap-around.
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next != 0 && !self.objects.contains_key(&self.next) {
                break;
            }
        }
        self.objects.insert(self.next, obj);
        Ok(Handle(self.next))
    }

    fn lookup(&self, handle: Handle, kind: ObjKind) -> Result<&StreamObject> {
        let obj = self
            .objects
            .get(&handle.0)
            .ok_or_else(|| C2cError::BadHandle(format!("handle {} is not open", handle.0)))?;
        if obj.kind != kind {
            return Err(C2cError::BadHandle(format!(
                "handle {} is {:?}, expected {kind:?}",
                handle.0, obj.kind
            )));
        }
        Ok(obj)
    }

    fn lookup_import(&self, handle: Handle, ty: ExportType) -> Result<&StreamObject> {
        let obj = self.lookup(handle, ObjKind::Import)?;
        if obj.import_type != Some(ty) {
            return Err(C2cError::BadHandle(format!(
                "handle {} is not an imported {ty:?} object",
                handle.0
            )));
        }
        Ok(obj)
    }
}

/// One endpoint's application surface
pub struct Endpoint {
    ctx: Arc<SharedChannelContext>,
    registry: Arc<Registry>,
    engine: CopyEngine,
    handles: Mutex<HandleTable>,
}

impl Endpoint {
    pub fn new(ctx: &Arc<SharedChannelContext>, registry: &Arc<Registry>) -> Self {
        Self {
            ctx: ctx.clone(),
            registry: registry.clone(),
            engine: CopyEngine::new(ctx, registry),
            handles: Mutex::new(HandleTable { objects: HashMap::new(), next: 0 }),
        }
    }

    pub fn engine(&self) -> &CopyEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Map a local buffer or fence for use in copies
    pub fn map(&self, kind: ObjKind, source: ObjectSource) -> Result<Handle> {
        let request = match (kind, source) {
            (ObjKind::SourceMem, ObjectSource::Mem(source)) => {
                MapRequest::Mem(MemParams { source, mngd: Management::Device, prot: Prot::READ })
            }
            (ObjKind::TargetMem, ObjectSource::Mem(source)) => {
                MapRequest::Mem(MemParams { source, mngd: Management::Client, prot: Prot::WRITE })
            }
            (ObjKind::LocalSync, ObjectSource::Sync(source)) => MapRequest::Sync(SyncParams {
                source,
                pin: false,
                mngd: Management::Client,
                prot: Prot::READ,
            }),
            (ObjKind::RemoteSync, ObjectSource::Sync(source)) => MapRequest::Sync(SyncParams {
                source,
                pin: true,
                mngd: Management::Client,
                prot: Prot::WRITE,
            }),
            (ObjKind::Import, _) => {
                return Err(C2cError::InvalidArgument(
                    "imports are created with Endpoint::import".into(),
                ))
            }
            (kind, source) => {
                return Err(C2cError::InvalidArgument(format!(
                    "{kind:?} cannot be backed by {source:?}"
                )))
            }
        };

        let attrs = self.registry.map(request)?;
        let obj = StreamObject { kind, attrs, import_type: None, aperture: 0 };
        self.insert_or_unmap(obj)
    }

    /// Close a handle, dropping its map
    pub fn free(&self, handle: Handle) -> Result<()> {
        let obj = self
            .handles
            .lock()
            .objects
            .remove(&handle.0)
            .ok_or_else(|| C2cError::BadHandle(format!("handle {} is not open", handle.0)))?;
        self.registry.unmap(obj.key())
    }

    /// Export a target buffer or remote fence to the peer
    pub fn export(&self, handle: Handle) -> Result<ExportDescriptor> {
        let (key, export_type) = {
            let handles = self.handles.lock();
            let obj = handles
                .objects
                .get(&handle.0)
                .ok_or_else(|| C2cError::BadHandle(format!("handle {} is not open", handle.0)))?;
            let export_type = match obj.kind {
                ObjKind::TargetMem => ExportType::Mem,
                ObjKind::RemoteSync => ExportType::Sync,
                kind => {
                    return Err(C2cError::InvalidArgument(format!(
                        "{kind:?} objects cannot be exported"
                    )))
                }
            };
            (obj.key(), export_type)
        };

        let config = &self.ctx.config;
        let desc = ExportDescriptor::encode(config.peer, config.endpoint.id, export_type, key.id)?;
        self.ctx.link.ensure_up()?;

        let attrs = self.registry.export_ref(key)?;
        let record =
            ObjectRecord { desc, iova: attrs.iova, size: attrs.size, offset: attrs.offset };
        if let Err(e) = self.ctx.channel.send(&Message::Register(record)) {
            if let Err(release) = self.registry.release_export(key) {
                tracing::error!(%desc, error = %release, "failed to undo export");
            }
            return Err(e);
        }
        tracing::debug!(%desc, "exported");
        Ok(desc)
    }

    /// Import an object the peer exported
    ///
    /// `TryAgain` means the peer's register message has not arrived yet.
    pub fn import(&self, desc: ExportDescriptor) -> Result<Handle> {
        desc.validate(self.ctx.config.local, self.ctx.config.endpoint.id)?;
        let attrs = self.registry.map(MapRequest::Import(desc))?;

        let aperture = match self.ctx.pcie.peer_aperture(attrs.offset, attrs.size) {
            Ok(aperture) => aperture,
            Err(e) => {
                if let Err(unmap) = self.registry.unmap(attrs.key) {
                    tracing::warn!(%desc, error = %unmap, "failed to drop import");
                }
                return Err(e);
            }
        };
        let import_type = Some(desc.export_type());
        let obj = StreamObject { kind: ObjKind::Import, attrs, import_type, aperture };
        self.insert_or_unmap(obj)
    }

    /// Placement of the object behind `handle`
    pub fn attributes(&self, handle: Handle) -> Result<ObjAttributes> {
        self.handles
            .lock()
            .objects
            .get(&handle.0)
            .map(|obj| obj.attrs)
            .ok_or_else(|| C2cError::BadHandle(format!("handle {} is not open", handle.0)))
    }

    /// Size the copy-request pool; allowed once
    pub fn set_limits(&self, limits: CopyLimits) -> Result<()> {
        self.engine.set_limits(limits)
    }

    /// Submit one batch of flush ranges and fence signals
    ///
    /// Nothing is queued unless every argument checks out. Returns
    /// `WouldBlock` when every pre-allocated request is in flight.
    pub fn submit_copy(&self, args: &CopyArgs<'_>) -> Result<CopyCompletion> {
        self.validate_copy(args)?;
        let mut pending = self.engine.acquire()?;
        self.fill(&mut pending, args)?;
        self.engine.launch(pending)
    }

    /// [`Endpoint::submit_copy`], waiting for a free request instead of
    /// failing with `WouldBlock`
    pub async fn submit_copy_wait(&self, args: &CopyArgs<'_>) -> Result<CopyCompletion> {
        loop {
            match self.submit_copy(args) {
                Err(C2cError::WouldBlock(reason)) if reason == POOL_EMPTY => {
                    self.engine.wait_for_request().await
                }
                other => return other,
            }
        }
    }

    /// Free every open handle
    pub fn close(&self) {
        let objects: Vec<StreamObject> =
            self.handles.lock().objects.drain().map(|(_, obj)| obj).collect();
        for obj in objects {
            if let Err(e) = self.registry.unmap(obj.key()) {
                tracing::warn!(key = ?obj.key(), error = %e, "unmap on close failed");
            }
        }
    }

    fn insert_or_unmap(&self, obj: StreamObject) -> Result<Handle> {
        let inserted = self.handles.lock().insert(obj);
        if inserted.is_err() {
            if let Err(e) = self.registry.unmap(obj.key()) {
                tracing::warn!(key = ?obj.key(), error = %e, "failed to drop unhandled map");
            }
        }
        inserted
    }

    fn validate_copy(&self, args: &CopyArgs<'_>) -> Result<()> {
        self.ctx.link.ensure_up()?;
        let limits = self
            .engine
            .limits()
            .ok_or_else(|| C2cError::InvalidArgument("copy limits not set".into()))?;

        let nflush = args.flush_ranges.len();
        if nflush == 0 || nflush > limits.max_flush_ranges as usize {
            return Err(C2cError::InvalidArgument(format!(
                "{nflush} flush ranges, need 1..={}",
                limits.max_flush_ranges
            )));
        }
        let nfences = args.local_fences.len() + args.remote_fences.len();
        if nfences > limits.max_post_fences as usize {
            return Err(C2cError::InvalidArgument(format!(
                "{nfences} fences, at most {}",
                limits.max_post_fences
            )));
        }

        let handles = self.handles.lock();
        for range in args.flush_ranges {
            let src = self.usable(handles.lookup(range.src, ObjKind::SourceMem)?)?;
            let dst = self.usable(handles.lookup_import(range.dst, ExportType::Mem)?)?;
            check_range(range, src.attrs.size)?;
            check_range(range, dst.attrs.size)?;
        }
        for &fence in args.local_fences {
            self.usable(handles.lookup(fence, ObjKind::LocalSync)?)?;
        }
        for fence in args.remote_fences {
            self.usable(handles.lookup_import(fence.handle, ExportType::Sync)?)?;
        }
        Ok(())
    }

    /// The registry still holds `obj` and it is not on its way out
    fn usable<'a>(&self, obj: &'a StreamObject) -> Result<&'a StreamObject> {
        if self.registry.is_marked_for_deletion(obj.key())? {
            return Err(C2cError::BadHandle(format!(
                "{:?} object {} is being deleted",
                obj.kind,
                obj.key().id
            )));
        }
        Ok(obj)
    }

    fn fill(&self, pending: &mut PendingCopy, args: &CopyArgs<'_>) -> Result<()> {
        let by_dma = self.ctx.peer_cpu().signals_fences_by_dma();
        let mode = self.ctx.config.driver_mode;
        let handles = self.handles.lock();

        let mut last_src = 0;
        for range in args.flush_ranges {
            let src = handles.lookup(range.src, ObjKind::SourceMem)?;
            let dst = handles.lookup_import(range.dst, ExportType::Mem)?;
            pending.hold(src.key())?;
            pending.hold(dst.key())?;

            last_src = src.attrs.iova + range.offset;
            let dst_addr = remote_base(mode, dst) + range.offset;
            pending.push_desc(DmaDesc { src: last_src, dst: dst_addr, len: range.size });
            if !by_dma {
                pending.push_remote_target(dst.aperture);
            }
        }

        for &fence in args.local_fences {
            let obj = handles.lookup(fence, ObjKind::LocalSync)?;
            pending.hold(obj.key())?;
            if let Some(fence_id) = obj.attrs.fence_id {
                pending.push_local_fence(fence_id);
            }
        }

        for fence in args.remote_fences {
            let obj = handles.lookup_import(fence.handle, ExportType::Sync)?;
            pending.hold(obj.key())?;
            if by_dma {
                // The write itself is the signal; any readable source will do.
                let dst = remote_base(mode, obj);
                pending.push_desc(DmaDesc { src: last_src, dst, len: FENCE_WRITE_LEN });
            } else {
                let signal = RemoteSignal { aperture: obj.aperture, value: fence.value };
                pending.push_remote_signal(signal);
            }
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

/// Address the DMA engine writes to for an imported object
fn remote_base(mode: DriverMode, obj: &StreamObject) -> u64 {
    match mode {
        DriverMode::RootPort => obj.aperture,
        DriverMode::Endpoint => obj.attrs.iova,
    }
}

fn check_range(range: &FlushRange, object_size: u64) -> Result<()> {
    if range.size == 0 || range.size % 4 != 0 || range.offset % 4 != 0 {
        return Err(C2cError::InvalidArgument(format!(
            "flush range {:#x}+{:#x} must be non-empty and 4-byte aligned",
            range.offset, range.size
        )));
    }
    match range.offset.checked_add(range.size) {
        Some(end) if end <= object_size => Ok(()),
        _ => Err(C2cError::InvalidArgument(format!(
            "flush range {:#x}+{:#x} exceeds object of {object_size:#x} bytes",
            range.offset, range.size
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(offset: u64, size: u64) -> FlushRange {
        FlushRange { src: Handle(1), dst: Handle(2), offset, size }
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(&range(0, 0x1000), 0x1000).is_ok());
        assert!(check_range(&range(0x800, 0x800), 0x1000).is_ok());
        assert!(check_range(&range(0x800, 0x804), 0x1000).is_err());
        assert!(check_range(&range(0, 0), 0x1000).is_err());
        assert!(check_range(&range(2, 4), 0x1000).is_err());
        assert!(check_range(&range(0, 6), 0x1000).is_err());
        assert!(check_range(&range(u64::MAX - 3, 4), u64::MAX).is_err());
    }

    #[test]
    fn test_handle_table_skips_live_ids() {
        let attrs = ObjAttributes {
            key: ObjKey::new(crate::registry::ObjType::Mem, 1),
            iova: 0,
            size: 0,
            offset: 0,
            fence_id: None,
        };
        let obj = StreamObject { kind: ObjKind::SourceMem, attrs, import_type: None, aperture: 0 };
        let mut table = HandleTable { objects: HashMap::new(), next: u32::MAX - 1 };

        let a = table.insert(obj).unwrap();
        let b = table.insert(obj).unwrap();
        assert_eq!(a.raw(), u32::MAX);
        assert_eq!(b.raw(), 1);
        assert!(table.lookup(a, ObjKind::SourceMem).is_ok());
        assert!(matches!(table.lookup(a, ObjKind::TargetMem), Err(C2cError::BadHandle(_))));
        assert!(matches!(table.lookup(Handle(7), ObjKind::SourceMem), Err(C2cError::BadHandle(_))));
    }
}
