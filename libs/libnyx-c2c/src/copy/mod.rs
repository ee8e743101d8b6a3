//! # Copy-request engine
//!
//! Batches flush ranges and fence signals into DMA transfers over registered
//! objects.
//!
//! ## Request lifecycle
//!
//! ```text
//!  pool ──acquire──▶ PendingCopy ──launch──▶ InFlight ──complete──▶ pool
//!                       │  (refs taken,          │ (DMA engine owns it)
//!                       │   descs built)         │
//!                       └──── drop: unwind ──────┘
//! ```
//!
//! A `PendingCopy` that is dropped before launch returns every reference it
//! took and goes back to the pool, so a failed submit leaves nothing behind.
//! Completion signals fences, releases references, returns the request and
//! resolves the [`CopyCompletion`] handed out at launch.

mod request;

pub use request::CopyRequest;
pub(crate) use request::RemoteSignal;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spin::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::context::SharedChannelContext;
use crate::error::{C2cError, Result};
use crate::registry::{ObjKey, Registry};
use crate::traits::{DmaDesc, DmaStatus};

/// Reason reported when the pool is empty
pub(crate) const POOL_EMPTY: &str = "copy request pool";

/// Sizing of the request pool, fixed once per endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyLimits {
    pub max_copy_requests: u32,
    pub max_flush_ranges: u32,
    pub max_post_fences: u32,
}

impl CopyLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_copy_requests == 0 || self.max_flush_ranges == 0 || self.max_post_fences == 0 {
            return Err(C2cError::InvalidArgument(format!(
                "copy limits must be non-zero: {self:?}"
            )));
        }
        Ok(())
    }
}

/// How a submitted copy ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// Data landed and every fence was signalled
    Completed,
    /// The DMA engine reported an error; fences were not signalled
    Failed,
    /// The DMA engine dropped the transfer without completing it
    Abandoned,
}

/// Resolves when the DMA completion for one submit has run
#[derive(Debug)]
pub struct CopyCompletion {
    rx: oneshot::Receiver<CopyStatus>,
}

impl Future for CopyCompletion {
    type Output = CopyStatus;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CopyStatus> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(CopyStatus::Abandoned))
    }
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub outstanding: usize,
    pub available: usize,
}

struct EngineShared {
    ctx: Arc<SharedChannelContext>,
    registry: Arc<Registry>,
    limits: Mutex<Option<CopyLimits>>,
    pool: Mutex<Vec<Box<CopyRequest>>>,
    outstanding: AtomicUsize,
    drained: Notify,
    pool_released: Notify,
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Copy-request engine for one endpoint
pub struct CopyEngine {
    shared: Arc<EngineShared>,
}

impl CopyEngine {
    pub fn new(ctx: &Arc<SharedChannelContext>, registry: &Arc<Registry>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                ctx: ctx.clone(),
                registry: registry.clone(),
                limits: Mutex::new(None),
                pool: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                drained: Notify::new(),
                pool_released: Notify::new(),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Size the pool; allowed once
    pub fn set_limits(&self, limits: CopyLimits) -> Result<()> {
        limits.validate()?;
        let mut slot = self.shared.limits.lock();
        if let Some(existing) = *slot {
            return Err(C2cError::Busy(format!("copy limits already set to {existing:?}")));
        }
        let mut pool = self.shared.pool.lock();
        pool.reserve_exact(limits.max_copy_requests as usize);
        for _ in 0..limits.max_copy_requests {
            pool.push(Box::new(CopyRequest::with_limits(&limits)));
        }
        *slot = Some(limits);
        tracing::debug!(?limits, "copy limits set");
        Ok(())
    }

    pub fn limits(&self) -> Option<CopyLimits> {
        *self.shared.limits.lock()
    }

    /// Take a request from the pool; `WouldBlock` when none is free
    pub fn acquire(&self) -> Result<PendingCopy> {
        if self.limits().is_none() {
            return Err(C2cError::InvalidArgument("copy limits not set".into()));
        }
        let req = self.shared.pool.lock().pop().ok_or(C2cError::WouldBlock(POOL_EMPTY))?;
        Ok(PendingCopy { req: Some(req), engine: self.shared.clone() })
    }

    /// Hand a filled request to the DMA engine
    pub fn launch(&self, mut pending: PendingCopy) -> Result<CopyCompletion> {
        let Some(mut req) = pending.req.take() else {
            return Err(C2cError::InvalidArgument("copy request already launched".into()));
        };
        let (tx, rx) = oneshot::channel();
        req.completion = Some(tx);
        let ndesc = req.descs.len();

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let transfer = InFlight { req: Some(req), engine: self.shared.clone() };
        match self.shared.ctx.dma.submit(transfer) {
            Ok(()) => {
                self.shared.submitted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(ndesc, "copy submitted");
                Ok(CopyCompletion { rx })
            }
            Err((e, mut transfer)) => {
                tracing::warn!(error = %e, "dma engine rejected copy");
                if let Some(req) = transfer.req.take() {
                    self.shared.recycle(req);
                }
                self.shared.transfer_done();
                Err(e)
            }
        }
    }

    /// Resolve once a request may have returned to the pool
    pub async fn wait_for_request(&self) {
        self.shared.pool_released.notified().await;
    }

    /// Transfers submitted and not yet completed
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Wait for every in-flight transfer, giving up after `timeout`
    ///
    /// There is no way to cancel a transfer, so a timeout is only logged.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let wait = async {
            loop {
                let notified = shared.drained.notified();
                if shared.outstanding.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(
                    outstanding = shared.outstanding.load(Ordering::Acquire),
                    ?timeout,
                    "copy requests still in flight after drain timeout"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        let s = &self.shared;
        EngineStats {
            submitted: s.submitted.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            failed: s.failed.load(Ordering::Relaxed),
            outstanding: s.outstanding.load(Ordering::Acquire),
            available: s.pool.lock().len(),
        }
    }
}

impl EngineShared {
    /// Drop held references and put the request back
    fn recycle(&self, mut req: Box<CopyRequest>) {
        for key in req.held.drain(..) {
            if let Err(e) = self.registry.putref(key) {
                tracing::error!(?key, error = %e, "failed to release copy reference");
            }
        }
        req.reset();
        self.pool.lock().push(req);
        self.pool_released.notify_one();
    }

    fn transfer_done(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    fn signal_fences(&self, req: &CopyRequest) {
        // Read back each destination so posted writes land before the
        // consumer is released. Targets are only queued for CPU-signalled peers.
        for &aperture in &req.remote_targets {
            if let Err(e) = self.ctx.pcie.peer_read_u32(aperture) {
                tracing::warn!(
                    aperture = format_args!("{aperture:#x}"),
                    error = %e,
                    "coherence read failed"
                );
            }
        }
        for signal in &req.remote_fences {
            if let Err(e) = self.ctx.pcie.peer_write_u64(signal.aperture, signal.value) {
                tracing::warn!(
                    aperture = format_args!("{:#x}", signal.aperture),
                    error = %e,
                    "remote fence write failed"
                );
            }
        }
        for &fence in &req.local_fences {
            self.ctx.fences.increment(fence);
        }
    }

    fn finish(&self, mut req: Box<CopyRequest>, status: CopyStatus) {
        let completion = req.completion.take();
        self.recycle(req);
        self.transfer_done();
        match status {
            CopyStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            CopyStatus::Failed | CopyStatus::Abandoned => {
                self.failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        if let Some(tx) = completion {
            // The submitter may have stopped listening.
            let _ = tx.send(status);
        }
    }
}

/// A request taken from the pool and being filled
///
/// Dropping it releases every reference taken so far and returns the
/// request to the pool.
pub struct PendingCopy {
    req: Option<Box<CopyRequest>>,
    engine: Arc<EngineShared>,
}

impl PendingCopy {
    /// Take a registry reference on `key` for the life of the transfer
    pub(crate) fn hold(&mut self, key: ObjKey) -> Result<()> {
        let Some(req) = self.req.as_mut() else {
            return Err(C2cError::InvalidArgument("copy request already launched".into()));
        };
        if req.hold(key) {
            if let Err(e) = self.engine.registry.getref(key) {
                req.held.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn push_desc(&mut self, desc: DmaDesc) {
        if let Some(req) = self.req.as_mut() {
            req.descs.push(desc);
        }
    }

    pub(crate) fn push_local_fence(&mut self, fence_id: u32) {
        if let Some(req) = self.req.as_mut() {
            req.local_fences.push(fence_id);
        }
    }

    pub(crate) fn push_remote_signal(&mut self, signal: RemoteSignal) {
        if let Some(req) = self.req.as_mut() {
            req.remote_fences.push(signal);
        }
    }

    pub(crate) fn push_remote_target(&mut self, aperture: u64) {
        if let Some(req) = self.req.as_mut() {
            req.remote_targets.push(aperture);
        }
    }

    pub fn descriptors(&self) -> &[DmaDesc] {
        match &self.req {
            Some(req) => req.descriptors(),
            None => &[],
        }
    }
}

impl Drop for PendingCopy {
    fn drop(&mut self) {
        if let Some(req) = self.req.take() {
            self.engine.recycle(req);
        }
    }
}

/// A transfer owned by the DMA engine
pub struct InFlight {
    req: Option<Box<CopyRequest>>,
    engine: Arc<EngineShared>,
}

impl InFlight {
    pub fn descriptors(&self) -> &[DmaDesc] {
        match &self.req {
            Some(req) => req.descriptors(),
            None => &[],
        }
    }

    /// Completion callback; safe to call from any thread
    pub fn complete(mut self, status: DmaStatus) {
        let Some(req) = self.req.take() else {
            return;
        };
        let outcome = match status {
            DmaStatus::Success => {
                self.engine.signal_fences(&req);
                CopyStatus::Completed
            }
            DmaStatus::Failed => {
                tracing::warn!(ndesc = req.descs.len(), "dma transfer failed");
                CopyStatus::Failed
            }
        };
        self.engine.finish(req, outcome);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(req) = self.req.take() {
            tracing::warn!("dma engine dropped a transfer without completing it");
            self.engine.finish(req, CopyStatus::Abandoned);
        }
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight").field("descs", &self.descriptors()).finish()
    }
}
