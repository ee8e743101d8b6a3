//! # Node assembly
//!
//! A node is one side of the link: an IOVA window, a control channel to the
//! peer, an object registry and one endpoint. Bring-up is split in two so
//! both sides can place their receive fifos before either looks for the
//! other's.
//!
//! ```text
//!  Node::prepare ──▶ PreparedNode ──connect──▶ Node ──shutdown──▶ (released)
//!   skip area,          (fifo and            channel started,
//!   fifo, doorbell       doorbell mapped)    registry, endpoint
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::channel::{
    ChannelParams, CommChannel, FifoRegion, Message, MessageType, PeerCpu, FRAME_SIZE,
};
use crate::config::{C2cConfig, DriverMode};
use crate::endpoint::Endpoint;
use crate::error::{C2cError, Result};
use crate::iova::{IovaManager, Reservation};
use crate::link::{LinkState, LinkStatus};
use crate::registry::{Prot, Registry};
use crate::traits::{Backing, DmaEngine, Doorbell, FenceOps, PcieClient};
use crate::PAGE_SIZE;

/// State every part of a node shares
pub struct SharedChannelContext {
    pub config: C2cConfig,
    pub iova: IovaManager,
    pub pcie: Arc<dyn PcieClient>,
    pub dma: Arc<dyn DmaEngine>,
    pub fences: Arc<dyn FenceOps>,
    pub link: Arc<LinkState>,
    pub channel: CommChannel,
    peer_cpu: AtomicU8,
}

impl SharedChannelContext {
    /// Peer CPU class; Arm64 until the bootstrap message says otherwise
    pub fn peer_cpu(&self) -> PeerCpu {
        PeerCpu::from_raw(self.peer_cpu.load(Ordering::Acquire).into()).unwrap_or(PeerCpu::Arm64)
    }

    pub fn set_peer_cpu(&self, cpu: PeerCpu) {
        self.peer_cpu.store(cpu as u8, Ordering::Release);
    }
}

/// Platform collaborators a node runs on
pub struct NodeResources {
    pub pcie: Arc<dyn PcieClient>,
    pub dma: Arc<dyn DmaEngine>,
    pub fences: Arc<dyn FenceOps>,
    /// Rung by the peer when it writes to our fifo
    pub doorbell: Arc<dyn Doorbell>,
    /// What this node reports in its bootstrap message
    pub local_cpu: PeerCpu,
}

/// Window placement owned by a node
struct Placement {
    skip: Option<Reservation>,
    fifo: Reservation,
    fifo_size: u64,
    bell: Reservation,
}

impl Placement {
    fn release(self, iova: &IovaManager, pcie: &dyn PcieClient) {
        if let Err(e) = pcie.unmap(self.bell.iova, PAGE_SIZE) {
            tracing::warn!(error = %e, "doorbell unmap failed");
        }
        if let Err(e) = pcie.unmap(self.fifo.iova, self.fifo_size) {
            tracing::warn!(error = %e, "fifo unmap failed");
        }
        let blocks = [Some(self.bell.block), Some(self.fifo.block), self.skip.map(|s| s.block)];
        for block in blocks.into_iter().flatten() {
            if let Err(e) = iova.release(block) {
                tracing::warn!(error = %e, "window release failed");
            }
        }
    }
}

/// A node whose own fifo and doorbell are mapped, waiting for the peer's
pub struct PreparedNode {
    config: C2cConfig,
    res: NodeResources,
    iova: IovaManager,
    recv: Arc<FifoRegion>,
    placement: Placement,
}

/// One running side of the link
pub struct Node {
    ctx: Arc<SharedChannelContext>,
    registry: Arc<Registry>,
    endpoint: Endpoint,
    placement: Option<Placement>,
    local_cpu: PeerCpu,
}

impl Node {
    /// Carve the window and map our receive fifo and doorbell
    pub fn prepare(config: C2cConfig, res: NodeResources) -> Result<PreparedNode> {
        config.validate()?;
        let iova =
            IovaManager::new(config.endpoint.name.clone(), config.iova.base, config.iova.size)?;

        let skip = match config.iova.skip {
            0 => None,
            size => Some(iova.reserve(size)?),
        };

        let fifo_size = config.channel.region_size();
        let recv = Arc::new(FifoRegion::new(config.channel.nframes, config.channel.frame_size)?);
        let fifo = iova.reserve(fifo_size)?;
        res.pcie.map(fifo.iova, fifo_size, Backing::Fifo(recv.clone()), Prot::READ | Prot::WRITE)?;

        let bell = iova.reserve(PAGE_SIZE).and_then(|bell| {
            let backing = Backing::Doorbell(res.doorbell.clone());
            res.pcie.map(bell.iova, PAGE_SIZE, backing, Prot::WRITE)?;
            Ok(bell)
        });
        let bell = match bell {
            Ok(bell) => bell,
            Err(e) => {
                if let Err(unmap) = res.pcie.unmap(fifo.iova, fifo_size) {
                    tracing::warn!(error = %unmap, "fifo unmap failed");
                }
                return Err(e);
            }
        };

        tracing::debug!(
            node = %config.endpoint.name,
            fifo = format_args!("{:#x}", fifo.iova),
            doorbell = format_args!("{:#x}", bell.iova),
            "window prepared"
        );
        let placement = Placement { skip, fifo, fifo_size, bell };
        Ok(PreparedNode { config, res, iova, recv, placement })
    }

    pub fn context(&self) -> &Arc<SharedChannelContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn link(&self) -> &Arc<LinkState> {
        &self.ctx.link
    }

    /// The PCIe link came up on this side
    ///
    /// Tells the peer, and on a root port starts the bootstrap exchange.
    pub fn link_up(&self) -> Result<()> {
        self.ctx.link.change_status(LinkStatus::Up);
        self.ctx.channel.send(&Message::Link { status: LinkStatus::Up })?;
        if self.ctx.config.driver_mode == DriverMode::RootPort {
            self.send_bootstrap()?;
        }
        Ok(())
    }

    /// The PCIe link is going down on this side
    pub fn link_down(&self) {
        if let Err(e) = self.ctx.channel.send(&Message::Link { status: LinkStatus::Down }) {
            tracing::debug!(error = %e, "peer not told about link down");
        }
        self.ctx.link.change_status(LinkStatus::Down);
    }

    fn send_bootstrap(&self) -> Result<()> {
        let iova = self.placement.as_ref().map_or(0, |p| p.fifo.iova);
        self.ctx.channel.send_bootstrap(iova, self.local_cpu)
    }

    /// Wait for in-flight copies, then release everything this node holds
    pub async fn shutdown(mut self) {
        let timeout = Duration::from_millis(self.ctx.config.engine.drain_timeout_ms);
        if !self.endpoint.engine().drain(timeout).await {
            tracing::error!(
                node = %self.ctx.config.endpoint.name,
                "shutting down with copies in flight"
            );
        }
        self.endpoint.close();
        self.registry.deinit();
        self.teardown();
        tracing::info!(node = %self.ctx.config.endpoint.name, "node shut down");
    }

    fn teardown(&mut self) {
        let channel = &self.ctx.channel;
        for ty in [MessageType::Link, MessageType::Bootstrap] {
            // Absent when connect failed before installing them.
            if let Err(e) = channel.unregister_callback(ty) {
                tracing::debug!(?ty, error = %e, "callback not removed");
            }
        }
        channel.stop();
        if let Some(placement) = self.placement.take() {
            placement.release(&self.ctx.iova, self.ctx.pcie.as_ref());
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl PreparedNode {
    /// Reach the peer's fifo and doorbell and start the node
    ///
    /// Fails with `TryAgain` while the peer has not prepared its window; the
    /// local placement is released on any failure.
    pub fn connect(self) -> Result<Node> {
        let PreparedNode { config, res, iova, recv, placement } = self;
        match Self::assemble(config, &res, iova, recv, &placement) {
            Ok((ctx, registry)) => Self::start(ctx, registry, placement, res.local_cpu),
            Err((e, iova)) => {
                placement.release(&iova, res.pcie.as_ref());
                Err(e)
            }
        }
    }

    fn assemble(
        config: C2cConfig,
        res: &NodeResources,
        iova: IovaManager,
        recv: Arc<FifoRegion>,
        placement: &Placement,
    ) -> std::result::Result<(Arc<SharedChannelContext>, Arc<Registry>), (C2cError, IovaManager)> {
        let peer = res
            .pcie
            .peer_fifo(placement.fifo.offset)
            .and_then(|fifo| Ok((fifo, res.pcie.peer_doorbell(placement.bell.offset)?)));
        let (send, peer_doorbell) = match peer {
            Ok(peer) => peer,
            Err(e) => return Err((e, iova)),
        };

        let link = Arc::new(LinkState::new());
        let channel = match CommChannel::new(ChannelParams {
            name: config.endpoint.name.clone(),
            recv,
            send,
            doorbell: res.doorbell.clone(),
            peer_doorbell,
            link: link.clone(),
        }) {
            Ok(channel) => channel,
            Err(e) => return Err((e, iova)),
        };

        let ctx = Arc::new(SharedChannelContext {
            config,
            iova,
            pcie: res.pcie.clone(),
            dma: res.dma.clone(),
            fences: res.fences.clone(),
            link,
            channel,
            peer_cpu: AtomicU8::new(PeerCpu::Arm64 as u8),
        });
        let registry = Registry::new(&ctx);
        Ok((ctx, registry))
    }

    fn start(
        ctx: Arc<SharedChannelContext>,
        registry: Arc<Registry>,
        placement: Placement,
        local_cpu: PeerCpu,
    ) -> Result<Node> {
        let fifo_iova = placement.fifo.iova;
        let endpoint = Endpoint::new(&ctx, &registry);
        // From here on Node's Drop unwinds whatever was set up.
        let node = Node { ctx, registry, endpoint, placement: Some(placement), local_cpu };

        node.registry.install_callbacks()?;
        install_link_callbacks(&node.ctx, fifo_iova, local_cpu)?;
        node.ctx.channel.start()?;
        if let Some(limits) = node.ctx.config.engine.limits {
            node.endpoint.set_limits(limits)?;
        }
        tracing::info!(
            node = %node.ctx.config.endpoint.name,
            mode = ?node.ctx.config.driver_mode,
            frames = node.ctx.config.channel.nframes,
            frame_size = FRAME_SIZE,
            "node up"
        );
        Ok(node)
    }
}

/// Follow the peer's link messages, and answer a root port's bootstrap
fn install_link_callbacks(
    ctx: &Arc<SharedChannelContext>,
    fifo_iova: u64,
    local_cpu: PeerCpu,
) -> Result<()> {
    let weak: Weak<SharedChannelContext> = Arc::downgrade(ctx);
    ctx.channel.register_callback(
        MessageType::Link,
        Arc::new(move |msg: &Message| {
            if let (Some(ctx), Message::Link { status }) = (weak.upgrade(), msg) {
                ctx.link.change_status(*status);
            }
        }),
    )?;

    let weak: Weak<SharedChannelContext> = Arc::downgrade(ctx);
    ctx.channel.register_callback(
        MessageType::Bootstrap,
        Arc::new(move |msg: &Message| {
            let (Some(ctx), Message::Bootstrap { iova, peer_cpu }) = (weak.upgrade(), msg) else {
                return;
            };
            tracing::info!(peer_fifo = format_args!("{iova:#x}"), ?peer_cpu, "bootstrap received");
            ctx.set_peer_cpu(*peer_cpu);
            if ctx.config.driver_mode == DriverMode::Endpoint {
                if let Err(e) = ctx.channel.send_bootstrap(fifo_iova, local_cpu) {
                    tracing::warn!(error = %e, "bootstrap reply failed");
                }
            }
        }),
    )
}
