//! PCIe link status and link-event fan-out

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use spin::Mutex;
use tokio::sync::watch;

use crate::error::{C2cError, Result};

/// Maximum concurrent link-event subscribers
pub const MAX_LINK_USERS: usize = 16;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down = 0,
    Up = 1,
}

impl LinkStatus {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Down),
            1 => Some(Self::Up),
            _ => None,
        }
    }
}

/// Called on every status change, from the thread that made the change
pub type LinkCallback = Arc<dyn Fn(LinkStatus) + Send + Sync>;

/// Subscription token returned by [`LinkState::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEventId(usize);

/// Shared link status
pub struct LinkState {
    status: AtomicU8,
    watch: watch::Sender<LinkStatus>,
    users: Mutex<Vec<Option<LinkCallback>>>,
}

impl LinkState {
    /// New state, link down
    pub fn new() -> Self {
        let (watch, _) = watch::channel(LinkStatus::Down);
        Self {
            status: AtomicU8::new(LinkStatus::Down as u8),
            watch,
            users: Mutex::new(vec![None; MAX_LINK_USERS]),
        }
    }

    pub fn status(&self) -> LinkStatus {
        match self.status.load(Ordering::Acquire) {
            1 => LinkStatus::Up,
            _ => LinkStatus::Down,
        }
    }

    pub fn is_up(&self) -> bool {
        self.status() == LinkStatus::Up
    }

    /// Fail with `LinkDown` unless the link is up
    pub fn ensure_up(&self) -> Result<()> {
        if self.is_up() {
            Ok(())
        } else {
            Err(C2cError::LinkDown)
        }
    }

    /// Record a new status and notify subscribers
    pub fn change_status(&self, status: LinkStatus) {
        let prev = self.status.swap(status as u8, Ordering::AcqRel);
        if prev == status as u8 {
            return;
        }
        tracing::info!(?status, "link status changed");
        self.watch.send_replace(status);

        // Run callbacks outside the table lock; they may re-enter.
        let users: Vec<LinkCallback> = self.users.lock().iter().flatten().cloned().collect();
        for cb in users {
            cb(status);
        }
    }

    /// Subscribe to link events
    pub fn register(&self, cb: LinkCallback) -> Result<LinkEventId> {
        let mut users = self.users.lock();
        let slot = users
            .iter()
            .position(Option::is_none)
            .ok_or(C2cError::ResourceExhausted("link event users"))?;
        users[slot] = Some(cb);
        Ok(LinkEventId(slot))
    }

    pub fn unregister(&self, id: LinkEventId) -> Result<()> {
        let mut users = self.users.lock();
        match users.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(C2cError::NotFound(format!("link event user {}", id.0))),
        }
    }

    /// Resolve once the link is up
    pub async fn wait_up(&self) {
        let mut rx = self.watch.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|s| *s == LinkStatus::Up).await;
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callbacks_fire_on_change_only() {
        let link = LinkState::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        link.register(Arc::new(move |_: LinkStatus| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        link.change_status(LinkStatus::Up);
        link.change_status(LinkStatus::Up);
        link.change_status(LinkStatus::Down);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(matches!(link.ensure_up(), Err(C2cError::LinkDown)));
    }

    #[test]
    fn test_user_table_bounded() {
        let link = LinkState::new();
        let ids: Vec<_> = (0..MAX_LINK_USERS)
            .map(|_| link.register(Arc::new(|_: LinkStatus| {})).unwrap())
            .collect();
        assert!(link.register(Arc::new(|_: LinkStatus| {})).is_err());
        link.unregister(ids[3]).unwrap();
        assert!(link.unregister(ids[3]).is_err());
        assert!(link.register(Arc::new(|_: LinkStatus| {})).is_ok());
    }

    #[tokio::test]
    async fn test_wait_up() {
        let link = Arc::new(LinkState::new());
        let l = link.clone();
        let waiter = tokio::spawn(async move { l.wait_up().await });
        tokio::task::yield_now().await;
        link.change_status(LinkStatus::Up);
        waiter.await.unwrap();
    }
}
