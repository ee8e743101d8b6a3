//! Pre-sized copy requests and their free pool

use tokio::sync::oneshot;

use super::{CopyLimits, CopyStatus};
use crate::registry::ObjKey;
use crate::traits::DmaDesc;

/// Fence the CPU writes through the aperture once data has landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemoteSignal {
    pub aperture: u64,
    pub value: u64,
}

/// One batch of DMA work plus everything its completion must do
///
/// Every vector is sized from the limits when the pool is built and only
/// ever cleared, so filling a request never allocates.
#[derive(Debug)]
pub struct CopyRequest {
    /// Registry references held for the lifetime of the transfer
    pub(crate) held: Vec<ObjKey>,
    pub(crate) descs: Vec<DmaDesc>,
    /// Local fence ids to increment
    pub(crate) local_fences: Vec<u32>,
    /// CPU-signalled remote fences
    pub(crate) remote_fences: Vec<RemoteSignal>,
    /// Apertures of destination buffers, read back before CPU fence writes
    pub(crate) remote_targets: Vec<u64>,
    pub(crate) completion: Option<oneshot::Sender<CopyStatus>>,
}

impl CopyRequest {
    pub(crate) fn with_limits(limits: &CopyLimits) -> Self {
        let flush = limits.max_flush_ranges as usize;
        let fences = limits.max_post_fences as usize;
        Self {
            held: Vec::with_capacity(2 * flush + fences),
            descs: Vec::with_capacity(flush + fences),
            local_fences: Vec::with_capacity(fences),
            remote_fences: Vec::with_capacity(fences),
            remote_targets: Vec::with_capacity(flush),
            completion: None,
        }
    }

    /// Remember a reference unless the same object is already held
    pub(crate) fn hold(&mut self, key: ObjKey) -> bool {
        if self.held.contains(&key) {
            return false;
        }
        self.held.push(key);
        true
    }

    pub(crate) fn reset(&mut self) {
        self.held.clear();
        self.descs.clear();
        self.local_fences.clear();
        self.remote_fences.clear();
        self.remote_targets.clear();
        self.completion = None;
    }

    /// Descriptors handed to the DMA engine
    pub fn descriptors(&self) -> &[DmaDesc] {
        &self.descs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ObjType;

    #[test]
    fn test_capacity_from_limits() {
        let limits = CopyLimits { max_copy_requests: 1, max_flush_ranges: 4, max_post_fences: 2 };
        let req = CopyRequest::with_limits(&limits);
        assert!(req.held.capacity() >= 10);
        assert!(req.descs.capacity() >= 6);
    }

    #[test]
    fn test_hold_dedupes() {
        let limits = CopyLimits { max_copy_requests: 1, max_flush_ranges: 1, max_post_fences: 1 };
        let mut req = CopyRequest::with_limits(&limits);
        let key = ObjKey::new(ObjType::Mem, 3);
        assert!(req.hold(key));
        assert!(!req.hold(key));
        assert!(req.hold(ObjKey::new(ObjType::Import, 3)));
        req.reset();
        assert!(req.held.is_empty());
    }
}
