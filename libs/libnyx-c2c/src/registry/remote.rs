//! Cross-node export accounting
//!
//! Everything whose correctness depends on the peer lives here: incoming
//! register/unregister messages, the import counters they feed, and the
//! export references the peer holds on our objects. A misbehaving peer can
//! only produce logged protocol errors; it can never drive a local count
//! below what it was given.

use std::sync::{Arc, Weak};

use crate::channel::{Message, MessageType, ObjectRecord};
use crate::descriptor::ExportDescriptor;
use crate::error::{C2cError, Result};

use super::table::{IdTable, MappedObject};
use super::{bad_handle, drop_ref, ImportEntry, ObjAttributes, ObjKey, ObjType, Registry};

impl Registry {
    /// Route register/unregister messages from the channel into this registry
    pub fn install_callbacks(self: &Arc<Self>) -> Result<()> {
        let channel = &self.ctx.channel;

        let weak: Weak<Self> = Arc::downgrade(self);
        channel.register_callback(
            MessageType::Register,
            Arc::new(move |msg: &Message| {
                if let (Some(registry), Message::Register(record)) = (weak.upgrade(), msg) {
                    if let Err(e) = registry.on_register(record) {
                        tracing::warn!(desc = %record.desc, error = %e, "register rejected");
                    }
                }
            }),
        )?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let installed = channel.register_callback(
            MessageType::Unregister,
            Arc::new(move |msg: &Message| {
                if let (Some(registry), Message::Unregister(record)) = (weak.upgrade(), msg) {
                    if let Err(e) = registry.on_unregister(record) {
                        tracing::warn!(desc = %record.desc, error = %e, "unregister rejected");
                    }
                }
            }),
        );
        if let Err(e) = installed {
            if let Err(undo) = channel.unregister_callback(MessageType::Register) {
                tracing::warn!(error = %undo, "register callback left installed");
            }
            return Err(e);
        }
        Ok(())
    }

    pub(super) fn remove_callbacks(&self) {
        for ty in [MessageType::Register, MessageType::Unregister] {
            if let Err(e) = self.ctx.channel.unregister_callback(ty) {
                tracing::warn!(?ty, error = %e, "callback removal failed");
            }
        }
    }

    /// Take the reference the peer will hold once it learns about `key`
    ///
    /// Released by the peer's unregister, or by [`Registry::release_export`]
    /// if the register message never leaves this node.
    pub fn export_ref(&self, key: ObjKey) -> Result<ObjAttributes> {
        match key.ty {
            ObjType::Mem => {
                let mut table = self.mem.lock();
                let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
                obj.refcount += 1;
                obj.payload.exports += 1;
                Ok(obj.payload.attrs(obj.id))
            }
            ObjType::Sync => {
                let mut table = self.sync.lock();
                let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
                obj.refcount += 1;
                obj.payload.exports += 1;
                Ok(obj.payload.attrs(obj.id))
            }
            ObjType::Import => {
                Err(C2cError::InvalidArgument("imports cannot be re-exported".into()))
            }
        }
    }

    /// Return one export reference
    pub fn release_export(&self, key: ObjKey) -> Result<()> {
        let take_export = |exports: &mut u32| {
            if *exports == 0 {
                return Err(C2cError::PermissionDenied(format!(
                    "{:?} object {} has no outstanding export",
                    key.ty, key.id
                )));
            }
            *exports -= 1;
            Ok(())
        };
        match key.ty {
            ObjType::Mem => {
                let released = drop_ref(&self.mem, key, false, |e| take_export(&mut e.exports))?;
                if let Some(entry) = released {
                    self.destroy_mem(key.id, entry);
                }
            }
            ObjType::Sync => {
                let released = drop_ref(&self.sync, key, false, |e| take_export(&mut e.exports))?;
                if let Some(entry) = released {
                    self.destroy_sync(key.id, entry);
                }
            }
            ObjType::Import => {
                return Err(C2cError::InvalidArgument("imports carry no export reference".into()))
            }
        }
        Ok(())
    }

    /// The peer announced an object we may import
    pub fn on_register(&self, record: &ObjectRecord) -> Result<()> {
        record.desc.validate(self.ctx.config.local, self.ctx.config.endpoint.id)?;

        let mut table = self.import.lock();
        if let Some(obj) = table.find_mut(|o| o.payload.record.desc == record.desc) {
            let known = &obj.payload.record;
            if known.iova != record.iova
                || known.size != record.size
                || known.offset != record.offset
            {
                return Err(C2cError::PermissionDenied(format!(
                    "re-registration of {} with different placement",
                    record.desc
                )));
            }
            obj.payload.nr_export += 1;
            obj.refcount += 1;
            tracing::debug!(
                desc = %record.desc,
                nr_export = obj.payload.nr_export,
                "registered again"
            );
            return Ok(());
        }

        let entry =
            ImportEntry { record: *record, nr_export: 1, nr_import: 0, busy: 0, deferred: 0 };
        let id = table.insert_with(|id| MappedObject { live: 0, ..MappedObject::new(id, entry) })?;
        tracing::debug!(desc = %record.desc, id, "registered");
        Ok(())
    }

    /// The peer gave back one import of an object we exported
    pub fn on_unregister(&self, record: &ObjectRecord) -> Result<()> {
        // Our exports carry the peer's identity.
        record.desc.validate(self.ctx.config.peer, self.ctx.config.endpoint.id)?;
        let key = ObjKey::new(record.desc.export_type().into(), record.desc.id());
        self.release_export(key)?;
        tracing::debug!(desc = %record.desc, "unregistered");
        Ok(())
    }

    pub(super) fn map_import(&self, desc: ExportDescriptor) -> Result<ObjAttributes> {
        let mut table = self.import.lock();
        let Some(obj) = table.find_mut(|o| o.payload.record.desc == desc) else {
            return Err(C2cError::TryAgain(format!("{desc} not registered yet")));
        };

        let reg = &mut obj.payload;
        if reg.nr_import > reg.nr_export {
            tracing::error!(
                %desc,
                nr_import = reg.nr_import,
                nr_export = reg.nr_export,
                "import count exceeds exports"
            );
            return Err(C2cError::Corruption(format!("{desc}: more imports than exports")));
        }
        if reg.nr_import == reg.nr_export {
            return Err(C2cError::PermissionDenied(format!(
                "{desc} exported {} times, all imported",
                reg.nr_export
            )));
        }
        reg.nr_import += 1;
        obj.live += 1;
        obj.marked_for_deletion = false;
        tracing::debug!(%desc, id = obj.id, nr_import = obj.payload.nr_import, "imported");
        Ok(obj.payload.attrs(obj.id))
    }

    /// Drop one import and hand the matching export unit back to the peer
    ///
    /// While a copy still writes through the import the unit stays with us;
    /// the copy's last [`Registry::putref`] returns it.
    pub(super) fn unmap_import(&self, key: ObjKey) -> Result<()> {
        let record = {
            let mut table = self.import.lock();
            let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
            if obj.live == 0 {
                return Err(C2cError::InvalidArgument(format!("import {} is not mapped", key.id)));
            }
            obj.live -= 1;
            if obj.payload.busy > 0 {
                obj.payload.deferred += 1;
                if obj.live == 0 {
                    obj.marked_for_deletion = true;
                }
                tracing::debug!(
                    id = key.id,
                    busy = obj.payload.busy,
                    "import unmapped, unregister deferred"
                );
                return Ok(());
            }
            return_units(&mut table, key.id, 1)
        };
        if let Some(record) = record {
            self.release_import_units(&record, 1);
        }
        Ok(())
    }

    /// Hold an import for the life of a copy
    pub(super) fn hold_import(&self, key: ObjKey) -> Result<()> {
        let mut table = self.import.lock();
        let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
        obj.refcount += 1;
        obj.payload.busy += 1;
        Ok(())
    }

    /// Release a copy's hold; the last one returns any deferred units
    pub(super) fn put_import(&self, key: ObjKey) -> Result<()> {
        let (record, units) = {
            let mut table = self.import.lock();
            let obj = table.get_mut(key.id).ok_or_else(|| bad_handle(key))?;
            if obj.payload.busy == 0 {
                return Err(C2cError::InvalidArgument(format!(
                    "import {} has no copy hold",
                    key.id
                )));
            }
            obj.payload.busy -= 1;
            obj.refcount -= 1;
            let units = match obj.payload.busy {
                0 => std::mem::take(&mut obj.payload.deferred),
                _ => 0,
            };
            if units == 0 && obj.refcount > 0 {
                return Ok(());
            }
            (return_units(&mut table, key.id, units), units)
        };
        if let Some(record) = record {
            tracing::debug!(id = key.id, units, "import released");
            self.release_import_units(&record, units);
        }
        Ok(())
    }

    pub(super) fn release_import_units(&self, record: &ObjectRecord, units: u32) {
        for _ in 0..units {
            if let Err(e) = self.ctx.channel.send(&Message::Unregister(*record)) {
                tracing::error!(desc = %record.desc, error = %e, "failed to send unregister");
                return;
            }
        }
    }
}

/// Give back `units` export units of an import; removes the entry once
/// nothing holds it and returns the record to unregister with
fn return_units(
    table: &mut IdTable<MappedObject<ImportEntry>>,
    id: u32,
    units: u32,
) -> Option<ObjectRecord> {
    let obj = table.get_mut(id)?;
    obj.refcount = obj.refcount.saturating_sub(units);
    let record = obj.payload.record;
    if obj.refcount == 0 {
        table.remove(id);
    } else if obj.live == 0 && !obj.marked_for_deletion {
        obj.marked_for_deletion = true;
        tracing::debug!(id, refcount = obj.refcount, "import marked for deletion");
    }
    Some(record)
}
