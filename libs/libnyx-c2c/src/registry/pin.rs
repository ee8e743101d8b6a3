//! Placing objects where the DMA engine and the peer can reach them

use crate::context::SharedChannelContext;
use crate::error::Result;
use crate::iova::IovaBlock;
use crate::traits::{Backing, DeviceMapping};
use crate::page_align;

use super::{MemSource, Prot};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Placement {
    /// Reserved in the PCIe window and mapped there
    Window(IovaBlock),
    /// Mapped through the DMA device; not peer visible
    Device(DeviceMapping),
    /// Local fence that nobody outside this node touches
    Unpinned,
}

/// Where a pinned object lives
#[derive(Debug, Clone, Copy)]
pub(crate) struct PinRecord {
    pub iova: u64,
    pub offset: u64,
    pub placement: Placement,
}

impl PinRecord {
    pub const UNPINNED: Self = Self { iova: 0, offset: 0, placement: Placement::Unpinned };
}

/// Reserve window space for `size` bytes at `phys` and map it
pub(crate) fn pin_window(
    ctx: &SharedChannelContext,
    phys: u64,
    size: u64,
    prot: Prot,
) -> Result<PinRecord> {
    let aligned = page_align(size)?;
    let reservation = ctx.iova.reserve(aligned)?;
    if let Err(e) = ctx.pcie.map(reservation.iova, aligned, Backing::Phys(phys), prot) {
        if let Err(release) = ctx.iova.release(reservation.block) {
            tracing::error!(
                iova = format_args!("{:#x}", reservation.iova),
                error = %release,
                "iova release failed"
            );
        }
        return Err(e);
    }
    Ok(PinRecord {
        iova: reservation.iova,
        offset: reservation.offset,
        placement: Placement::Window(reservation.block),
    })
}

/// Map a buffer through the DMA device
pub(crate) fn pin_device(
    ctx: &SharedChannelContext,
    source: &MemSource,
    prot: Prot,
) -> Result<PinRecord> {
    let mapping = ctx.pcie.attach(source, prot)?;
    Ok(PinRecord { iova: mapping.iova, offset: 0, placement: Placement::Device(mapping) })
}

/// Undo a pin; failures are logged, the object is gone either way
pub(crate) fn unpin(ctx: &SharedChannelContext, pin: PinRecord) {
    match pin.placement {
        Placement::Window(block) => {
            if let Err(e) = ctx.pcie.unmap(block.address(), block.size()) {
                tracing::warn!(
                    iova = format_args!("{:#x}", pin.iova),
                    error = %e,
                    "window unmap failed"
                );
            }
            if let Err(e) = ctx.iova.release(block) {
                tracing::error!(
                    iova = format_args!("{:#x}", pin.iova),
                    error = %e,
                    "iova release failed"
                );
            }
        }
        Placement::Device(mapping) => {
            if let Err(e) = ctx.pcie.detach(mapping) {
                tracing::warn!(
                    iova = format_args!("{:#x}", pin.iova),
                    error = %e,
                    "device detach failed"
                );
            }
        }
        Placement::Unpinned => {}
    }
}
