//! # Control channel
//!
//! Reliable, ordered messaging between the two nodes.
//!
//! Each node owns one receive fifo in its own window. Sending is a direct
//! write into the *peer's* receive fifo through the PCIe aperture, followed
//! by a ring of the peer's doorbell; there is no local send buffer.
//!
//! ## Capacity accounting
//!
//! The sender compares its own `wr_count` with the `rd_count` the peer last
//! published into our region. That value can be stale: the receiver never
//! acknowledges explicitly, so a sender may report `WouldBlock` while the
//! peer has in fact drained frames it has not yet published. This is an
//! accepted approximation; it is conservative and never loses a frame.
//!
//! ## Receive path
//!
//! One dedicated thread per channel parks on the local doorbell, drains
//! every pending frame into the callback registered for its type, then
//! publishes its read progress to the peer.

mod fifo;
mod message;

pub use fifo::FifoRegion;
pub use message::{Frame, Message, MessageType, ObjectRecord, PeerCpu, FRAME_SIZE, FRAME_WORDS};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use spin::{Mutex, RwLock};

use crate::error::{C2cError, Result};
use crate::link::LinkState;
use crate::traits::Doorbell;

/// Handler for one message type, run on the receive thread
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Everything a channel is stitched from
pub struct ChannelParams {
    pub name: String,
    /// Our receive fifo
    pub recv: Arc<FifoRegion>,
    /// The peer's receive fifo, reached through the aperture
    pub send: Arc<FifoRegion>,
    /// Rung by the peer when it has written to `recv`
    pub doorbell: Arc<dyn Doorbell>,
    /// Rung by us after writing to `send`
    pub peer_doorbell: Arc<dyn Doorbell>,
    pub link: Arc<LinkState>,
}

struct TxState {
    wr_count: u32,
    wr_pos: u32,
}

struct Shared {
    name: String,
    recv: Arc<FifoRegion>,
    send: Arc<FifoRegion>,
    doorbell: Arc<dyn Doorbell>,
    peer_doorbell: Arc<dyn Doorbell>,
    link: Arc<LinkState>,
    tx: Mutex<TxState>,
    // Receive side: only the receive thread advances these.
    rd_count: AtomicU32,
    rd_pos: AtomicU32,
    callbacks: RwLock<Vec<Option<MessageCallback>>>,
    stop: AtomicBool,
    fault: AtomicBool,
}

/// One control channel endpoint
pub struct CommChannel {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CommChannel {
    pub fn new(params: ChannelParams) -> Result<Self> {
        if params.recv.nframes() != params.send.nframes() {
            return Err(C2cError::InvalidArgument(format!(
                "fifo geometry mismatch: local {} frames, peer {} frames",
                params.recv.nframes(),
                params.send.nframes()
            )));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                name: params.name,
                recv: params.recv,
                send: params.send,
                doorbell: params.doorbell,
                peer_doorbell: params.peer_doorbell,
                link: params.link,
                tx: Mutex::new(TxState { wr_count: 0, wr_pos: 0 }),
                rd_count: AtomicU32::new(0),
                rd_pos: AtomicU32::new(0),
                callbacks: RwLock::new(vec![None; MessageType::COUNT]),
                stop: AtomicBool::new(false),
                fault: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the receive thread
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(C2cError::Busy(format!("channel {} already started", self.shared.name)));
        }
        self.shared.stop.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("c2c-rx-{}", shared.name))
            .spawn(move || shared.receive_loop())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Stop and join the receive thread
    pub fn stop(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        // Wake the thread so it observes the stop flag.
        self.shared.doorbell.ring();
        if handle.join().is_err() {
            tracing::error!(channel = %self.shared.name, "receive thread panicked");
        }
    }

    /// Install the handler for `ty`
    pub fn register_callback(&self, ty: MessageType, cb: MessageCallback) -> Result<()> {
        if ty == MessageType::Invalid {
            return Err(C2cError::InvalidArgument("callback for invalid message type".into()));
        }
        let mut callbacks = self.shared.callbacks.write();
        let slot = &mut callbacks[ty as usize];
        if slot.is_some() {
            return Err(C2cError::Busy(format!("{ty:?} callback already registered")));
        }
        *slot = Some(cb);
        Ok(())
    }

    pub fn unregister_callback(&self, ty: MessageType) -> Result<()> {
        let mut callbacks = self.shared.callbacks.write();
        match callbacks.get_mut(ty as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(C2cError::NotFound(format!("{ty:?} callback"))),
        }
    }

    /// Send a message; requires the link to be up
    ///
    /// Never sleeps: a full fifo is reported as `WouldBlock`.
    pub fn send(&self, msg: &Message) -> Result<()> {
        if let Message::Bootstrap { .. } = msg {
            return Err(C2cError::InvalidArgument("bootstrap goes through send_bootstrap".into()));
        }
        self.shared.link.ensure_up()?;
        self.shared.send_frame(msg)
    }

    /// Bring-up handshake; sent before the link is declared up
    pub fn send_bootstrap(&self, iova: u64, peer_cpu: PeerCpu) -> Result<()> {
        self.shared.send_frame(&Message::Bootstrap { iova, peer_cpu })
    }

    /// Teardown path; sent regardless of link state
    pub fn send_edma_desc_return(&self, iova: u64) -> Result<()> {
        self.shared.send_frame(&Message::EdmaDescReturn { iova })
    }

    /// Drain pending frames on the calling thread
    ///
    /// The receive thread does this on every doorbell; calling it directly
    /// is only meaningful for a channel that was never started.
    pub fn poll(&self) -> Result<usize> {
        self.shared.drain()
    }

    /// Frames written by the peer and not yet consumed
    pub fn pending(&self) -> u32 {
        self.shared.recv.wr_count().wrapping_sub(self.shared.rd_count.load(Ordering::Relaxed))
    }

    /// Fails once receive-side corruption has been observed
    pub fn health(&self) -> Result<()> {
        if self.shared.fault.load(Ordering::Acquire) {
            Err(C2cError::Corruption(format!("channel {} receive fifo", self.shared.name)))
        } else {
            Ok(())
        }
    }
}

impl Drop for CommChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn send_frame(&self, msg: &Message) -> Result<()> {
        let frame = msg.encode();
        let mut tx = self.tx.lock();

        let nframes = self.send.nframes();
        let peer_to_read = tx.wr_count.wrapping_sub(self.recv.rd_count());
        if peer_to_read > nframes {
            tracing::error!(
                channel = %self.name,
                wr_count = tx.wr_count,
                peer_to_read,
                "send fifo counters exceed capacity"
            );
            return Err(C2cError::Corruption(format!(
                "channel {}: {peer_to_read} frames outstanding in a {nframes}-frame fifo",
                self.name
            )));
        }
        if peer_to_read == nframes {
            return Err(C2cError::WouldBlock("control channel full"));
        }

        self.send.write_frame(tx.wr_pos, &frame);
        tx.wr_count = tx.wr_count.wrapping_add(1);
        self.send.publish_wr_count(tx.wr_count);
        self.peer_doorbell.ring();

        tx.wr_pos += 1;
        if tx.wr_pos == nframes {
            tx.wr_pos = 0;
        }
        tracing::trace!(
            channel = %self.name,
            ty = ?msg.message_type(),
            wr_count = tx.wr_count,
            "sent"
        );
        Ok(())
    }

    fn receive_loop(&self) {
        tracing::debug!(channel = %self.name, "receive thread started");
        loop {
            futures::executor::block_on(self.doorbell.wait());
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            if let Err(e) = self.drain() {
                tracing::error!(channel = %self.name, error = %e, "receive drain stopped");
            }
        }
        tracing::debug!(channel = %self.name, "receive thread exiting");
    }

    fn drain(&self) -> Result<usize> {
        let nframes = self.recv.nframes();
        let mut delivered = 0;

        loop {
            let rd_count = self.rd_count.load(Ordering::Relaxed);
            let to_read = self.recv.wr_count().wrapping_sub(rd_count);
            if to_read == 0 {
                return Ok(delivered);
            }
            if to_read > nframes {
                self.fault.store(true, Ordering::Release);
                return Err(C2cError::Corruption(format!(
                    "channel {}: {to_read} frames pending in a {nframes}-frame fifo",
                    self.name
                )));
            }

            let pos = self.rd_pos.load(Ordering::Relaxed);
            let frame = self.recv.read_frame(pos);
            self.dispatch(&frame);

            let next_pos = if pos + 1 == nframes { 0 } else { pos + 1 };
            self.rd_pos.store(next_pos, Ordering::Relaxed);
            let rd_count = rd_count.wrapping_add(1);
            self.rd_count.store(rd_count, Ordering::Relaxed);
            // The peer learns about freed capacity on its next send.
            self.send.publish_rd_count(rd_count);
            delivered += 1;
        }
    }

    fn dispatch(&self, frame: &Frame) {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(channel = %self.name, error = %e, "dropping undecodable frame");
                return;
            }
        };
        let cb = self.callbacks.read()[msg.message_type() as usize].clone();
        match cb {
            Some(cb) => cb(&msg),
            None => tracing::debug!(
                channel = %self.name,
                ty = ?msg.message_type(),
                "no callback registered"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkStatus;
    use crate::loopback::NotifyDoorbell;

    fn pair(nframes: u32) -> (CommChannel, CommChannel) {
        let link = Arc::new(LinkState::new());
        link.change_status(LinkStatus::Up);
        let fifo_a = Arc::new(FifoRegion::new(nframes, FRAME_SIZE as u32).unwrap());
        let fifo_b = Arc::new(FifoRegion::new(nframes, FRAME_SIZE as u32).unwrap());
        let bell_a: Arc<dyn Doorbell> = Arc::new(NotifyDoorbell::new());
        let bell_b: Arc<dyn Doorbell> = Arc::new(NotifyDoorbell::new());
        let a = CommChannel::new(ChannelParams {
            name: "a".into(),
            recv: fifo_a.clone(),
            send: fifo_b.clone(),
            doorbell: bell_a.clone(),
            peer_doorbell: bell_b.clone(),
            link: link.clone(),
        })
        .unwrap();
        let b = CommChannel::new(ChannelParams {
            name: "b".into(),
            recv: fifo_b,
            send: fifo_a,
            doorbell: bell_b,
            peer_doorbell: bell_a,
            link,
        })
        .unwrap();
        (a, b)
    }

    fn record(n: u64) -> ObjectRecord {
        ObjectRecord { desc: crate::ExportDescriptor::from_raw(n), iova: n, size: 4, offset: 0 }
    }

    #[test]
    fn test_full_fifo_would_block() {
        let (a, b) = pair(2);
        a.send(&Message::Register(record(1))).unwrap();
        a.send(&Message::Register(record(2))).unwrap();
        assert!(matches!(a.send(&Message::Register(record(3))), Err(C2cError::WouldBlock(_))));
        assert_eq!(b.pending(), 2);

        // Draining publishes rd_count, freeing room on the next send.
        assert_eq!(b.poll().unwrap(), 2);
        a.send(&Message::Register(record(3))).unwrap();
        assert_eq!(b.pending(), 1);
    }

    #[test]
    fn test_blocked_send_leaves_counters() {
        let (a, b) = pair(4);
        for n in 0..4 {
            a.send(&Message::Register(record(n))).unwrap();
        }
        let counters = |ch: &CommChannel| {
            let s = &ch.shared;
            let tx = s.tx.lock();
            let send = (s.send.wr_count(), s.send.rd_count());
            let recv = (s.recv.wr_count(), s.recv.rd_count());
            (tx.wr_count, tx.wr_pos, send, recv)
        };
        let before = (counters(&a), counters(&b), b.pending());

        for _ in 0..3 {
            assert!(matches!(a.send(&Message::Register(record(9))), Err(C2cError::WouldBlock(_))));
        }
        assert_eq!((counters(&a), counters(&b), b.pending()), before);
        assert_eq!(b.pending(), 4);
    }

    #[test]
    fn test_bootstrap_only_through_dedicated_path() {
        let (a, _b) = pair(4);
        let msg = Message::Bootstrap { iova: 0, peer_cpu: PeerCpu::Arm64 };
        assert!(a.send(&msg).is_err());
        a.send_bootstrap(0x1000, PeerCpu::X86_64).unwrap();
    }

    #[test]
    fn test_callback_slot_busy() {
        let (a, _b) = pair(4);
        a.register_callback(MessageType::Register, Arc::new(|_: &Message| {})).unwrap();
        assert!(matches!(
            a.register_callback(MessageType::Register, Arc::new(|_: &Message| {})),
            Err(C2cError::Busy(_))
        ));
        a.unregister_callback(MessageType::Register).unwrap();
        assert!(a.unregister_callback(MessageType::Register).is_err());
        assert!(a.register_callback(MessageType::Invalid, Arc::new(|_: &Message| {})).is_err());
    }

    #[test]
    fn test_link_down_rejects_send() {
        let (a, _b) = pair(4);
        a.shared.link.change_status(LinkStatus::Down);
        assert!(matches!(a.send(&Message::Register(record(1))), Err(C2cError::LinkDown)));
        a.send_edma_desc_return(0x2000).unwrap();
    }

    #[test]
    fn test_corrupt_counters_detected() {
        let (a, b) = pair(4);
        // Peer claims more frames than the fifo holds.
        b.shared.recv.publish_wr_count(9);
        assert!(matches!(b.poll(), Err(C2cError::Corruption(_))));
        assert!(b.health().is_err());

        a.shared.recv.publish_rd_count(u32::MAX - 6);
        assert!(matches!(a.send(&Message::Register(record(1))), Err(C2cError::Corruption(_))));
    }
}
