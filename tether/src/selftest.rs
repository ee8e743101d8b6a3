//! Loopback self-test
//!
//! Pairs the configured node with a mirror-image peer over a loopback
//! fabric, then exports a buffer and a fence from the peer and streams
//! copies into them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use libnyx_c2c::loopback::{CounterFences, ImmediateDma, LoopbackFabric, NotifyDoorbell};
use libnyx_c2c::prelude::*;
use libnyx_c2c::traits::PcieClient;
use libnyx_c2c::{C2cError, PeerCpu};
use tracing::{debug, info};

const LINK_TIMEOUT: Duration = Duration::from_secs(2);
const SELFTEST_LIMITS: CopyLimits =
    CopyLimits { max_copy_requests: 16, max_flush_ranges: 4, max_post_fences: 4 };

const BUFFER_SIZE: u64 = 0x1_0000;
const LOCAL_FENCE: u32 = 1;
const REMOTE_FENCE: u32 = 2;
const REMOTE_FENCE_PHYS: u64 = 0xF000_0000;

/// Outcome of a self-test run
#[derive(Debug)]
pub struct Report {
    pub copies: u32,
    pub local_fence: u64,
    pub remote_fence: u64,
    pub elapsed: Duration,
}

/// Configuration of the mirror-image node
fn peer_config(config: &C2cConfig) -> C2cConfig {
    let mut peer = config.clone();
    peer.local = config.peer;
    peer.peer = config.local;
    peer.endpoint.name = format!("{}-peer", config.endpoint.name);
    peer.driver_mode = match config.driver_mode {
        DriverMode::RootPort => DriverMode::Endpoint,
        DriverMode::Endpoint => DriverMode::RootPort,
    };
    peer
}

fn resources(
    pcie: Arc<dyn PcieClient>,
    fences: Arc<CounterFences>,
    cpu: PeerCpu,
) -> Result<NodeResources> {
    Ok(NodeResources {
        pcie,
        dma: Arc::new(ImmediateDma::new()?),
        fences,
        doorbell: Arc::new(NotifyDoorbell::new()),
        local_cpu: cpu,
    })
}

/// Retry while the peer's register message is still in flight
async fn import(node: &Node, desc: ExportDescriptor) -> Result<Handle> {
    let deadline = Instant::now() + LINK_TIMEOUT;
    loop {
        match node.endpoint().import(desc) {
            Err(C2cError::TryAgain(_)) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            other => return other.with_context(|| format!("importing {desc}")),
        }
    }
}

pub async fn run(mut config: C2cConfig, iterations: u32) -> Result<Report> {
    if config.engine.limits.is_none() {
        config.engine.limits = Some(SELFTEST_LIMITS);
    }
    let peer_cfg = peer_config(&config);

    let (port, peer_port) = LoopbackFabric::pair(config.iova.base, config.iova.size);
    let fences = Arc::new(CounterFences::new());
    let peer_fences = Arc::new(CounterFences::new());

    // An x86 peer makes the local node signal remote fences with CPU writes,
    // which the loopback fabric records.
    let local = Node::prepare(config, resources(port.clone(), fences.clone(), PeerCpu::Arm64)?)?;
    let peer_resources = resources(peer_port.clone(), peer_fences, PeerCpu::X86_64)?;
    let remote = Node::prepare(peer_cfg, peer_resources)?;
    let local = local.connect()?;
    let remote = remote.connect()?;

    local.link_up()?;
    tokio::time::timeout(LINK_TIMEOUT, remote.link().wait_up())
        .await
        .context("peer never saw the link come up")?;
    let deadline = Instant::now() + LINK_TIMEOUT;
    while local.context().peer_cpu() != PeerCpu::X86_64 {
        if Instant::now() >= deadline {
            bail!("no bootstrap reply from peer");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    info!("link up");

    // Peer side: a buffer to copy into and a fence to signal.
    let target = remote.endpoint().map(
        ObjKind::TargetMem,
        ObjectSource::Mem(MemSource { identity: 1, phys: 0xE000_0000, size: BUFFER_SIZE }),
    )?;
    let fence = remote.endpoint().map(
        ObjKind::RemoteSync,
        ObjectSource::Sync(SyncSource { fence_id: REMOTE_FENCE, phys: REMOTE_FENCE_PHYS, size: 8 }),
    )?;
    let target_desc = remote.endpoint().export(target)?;
    let fence_desc = remote.endpoint().export(fence)?;
    debug!(%target_desc, %fence_desc, "exported");

    // Local side: the source buffer, our own fence and the imports.
    let ep = local.endpoint();
    let src = ep.map(
        ObjKind::SourceMem,
        ObjectSource::Mem(MemSource { identity: 2, phys: 0xD000_0000, size: BUFFER_SIZE }),
    )?;
    let done_fence = ep.map(
        ObjKind::LocalSync,
        ObjectSource::Sync(SyncSource { fence_id: LOCAL_FENCE, phys: 0, size: 8 }),
    )?;
    let dst = import(&local, target_desc).await?;
    let remote_fence = import(&local, fence_desc).await?;

    let started = Instant::now();
    let chunk = BUFFER_SIZE / 4;
    for i in 0..iterations {
        let offset = (u64::from(i) % 4) * chunk;
        let ranges = [FlushRange { src, dst, offset, size: chunk }];
        let completion = ep
            .submit_copy_wait(&CopyArgs {
                flush_ranges: &ranges,
                local_fences: &[done_fence],
                remote_fences: &[RemoteFence { handle: remote_fence, value: u64::from(i) + 1 }],
            })
            .await?;
        let status = completion.await;
        if status != CopyStatus::Completed {
            bail!("copy {i} ended {status:?}");
        }
    }
    let elapsed = started.elapsed();

    let report = Report {
        copies: iterations,
        local_fence: fences.value(LOCAL_FENCE),
        remote_fence: peer_port.read_phys(REMOTE_FENCE_PHYS).unwrap_or(0),
        elapsed,
    };
    if report.local_fence != u64::from(iterations) || report.remote_fence != u64::from(iterations) {
        bail!(
            "fences at local {} remote {} after {iterations} copies",
            report.local_fence,
            report.remote_fence
        );
    }

    local.shutdown().await;
    remote.shutdown().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_config_mirrors() {
        let config = C2cConfig::default();
        let peer = peer_config(&config);
        assert_eq!(peer.local, config.peer);
        assert_eq!(peer.peer, config.local);
        assert_eq!(peer.driver_mode, DriverMode::Endpoint);
        assert!(peer.validate().is_ok());
    }

    #[tokio::test]
    async fn test_selftest_runs() {
        let report = run(C2cConfig::default(), 8).await.unwrap();
        assert_eq!(report.copies, 8);
        assert_eq!(report.local_fence, 8);
        assert_eq!(report.remote_fence, 8);
    }
}
