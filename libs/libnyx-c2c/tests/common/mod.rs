//! Two loopback nodes joined back to back

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use libnyx_c2c::config::{ChannelConfig, EndpointConfig, IovaConfig};
use libnyx_c2c::loopback::{CounterFences, LoopbackFabric, LoopbackPort, ManualDma, NotifyDoorbell};
use libnyx_c2c::traits::DmaEngine;
use libnyx_c2c::{
    C2cConfig, C2cError, CopyLimits, DriverMode, Node, NodeIdentity, NodeResources, PeerCpu,
};

pub const WINDOW_BASE: u64 = 0x8000_0000;
pub const WINDOW_SIZE: u64 = 4 << 20;

pub const LIMITS: CopyLimits =
    CopyLimits { max_copy_requests: 4, max_flush_ranges: 4, max_post_fences: 4 };

pub const NODE_A: NodeIdentity = NodeIdentity { board_id: 0, soc_id: 0, cntrlr_id: 0 };
pub const NODE_B: NodeIdentity = NodeIdentity { board_id: 0, soc_id: 1, cntrlr_id: 0 };

pub struct Side {
    pub node: Node,
    pub port: Arc<LoopbackPort>,
    pub fences: Arc<CounterFences>,
}

/// `a` is the root port, `b` the endpoint; each runs on its own [`ManualDma`]
pub struct Pair {
    pub a: Side,
    pub b: Side,
    pub dma: Arc<ManualDma>,
    pub dma_b: Arc<ManualDma>,
}

pub fn config(name: &str, local: NodeIdentity, peer: NodeIdentity, mode: DriverMode) -> C2cConfig {
    let mut config = C2cConfig {
        local,
        peer,
        endpoint: EndpointConfig { id: 0, name: name.into() },
        driver_mode: mode,
        iova: IovaConfig { base: WINDOW_BASE, size: WINDOW_SIZE, skip: 0x2_0000 },
        channel: ChannelConfig { nframes: 16, frame_size: 64 },
        ..C2cConfig::default()
    };
    config.engine.limits = Some(LIMITS);
    config.engine.drain_timeout_ms = 1000;
    config
}

/// Bring up both nodes and the link
pub async fn pair_on(
    dma_a: Arc<dyn DmaEngine>,
    dma_b: Arc<dyn DmaEngine>,
    cpu_a: PeerCpu,
    cpu_b: PeerCpu,
) -> (Side, Side) {
    let (port_a, port_b) = LoopbackFabric::pair(WINDOW_BASE, WINDOW_SIZE);
    let fences_a = Arc::new(CounterFences::new());
    let fences_b = Arc::new(CounterFences::new());

    let prepared_a = Node::prepare(
        config("a", NODE_A, NODE_B, DriverMode::RootPort),
        NodeResources {
            pcie: port_a.clone(),
            dma: dma_a,
            fences: fences_a.clone(),
            doorbell: Arc::new(NotifyDoorbell::new()),
            local_cpu: cpu_a,
        },
    )
    .unwrap();
    let prepared_b = Node::prepare(
        config("b", NODE_B, NODE_A, DriverMode::Endpoint),
        NodeResources {
            pcie: port_b.clone(),
            dma: dma_b,
            fences: fences_b.clone(),
            doorbell: Arc::new(NotifyDoorbell::new()),
            local_cpu: cpu_b,
        },
    )
    .unwrap();

    let a = prepared_a.connect().unwrap();
    let b = prepared_b.connect().unwrap();
    a.link_up().unwrap();
    within(b.link().wait_up()).await;
    eventually(|| a.context().peer_cpu() == cpu_b && b.context().peer_cpu() == cpu_a).await;

    (
        Side { node: a, port: port_a, fences: fences_a },
        Side { node: b, port: port_b, fences: fences_b },
    )
}

pub async fn pair() -> Pair {
    pair_with_cpu(PeerCpu::Arm64).await
}

/// Pair whose endpoint side reports `cpu_b`
pub async fn pair_with_cpu(cpu_b: PeerCpu) -> Pair {
    let dma = Arc::new(ManualDma::new());
    let dma_b = Arc::new(ManualDma::new());
    let (a, b) = pair_on(dma.clone(), dma_b.clone(), PeerCpu::Arm64, cpu_b).await;
    Pair { a, b, dma, dma_b }
}

/// Await `fut`, failing the test after a second
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), fut).await.expect("timed out")
}

/// Poll `cond` until it holds, failing the test after a second
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
}

/// Retry `op` while it reports `TryAgain`
pub async fn retry<T>(mut op: impl FnMut() -> libnyx_c2c::Result<T>) -> libnyx_c2c::Result<T> {
    within(async {
        loop {
            match op() {
                Err(C2cError::TryAgain(_)) => tokio::time::sleep(Duration::from_millis(1)).await,
                other => return other,
            }
        }
    })
    .await
}
