//! Export/import lifecycle between two loopback nodes

mod common;

use std::sync::Arc;

use libnyx_c2c::descriptor::ExportType;
use libnyx_c2c::loopback::{CounterFences, LoopbackFabric, ManualDma, NotifyDoorbell};
use libnyx_c2c::registry::Prot;
use libnyx_c2c::traits::{Backing, PcieClient};
use libnyx_c2c::{
    C2cError, DriverMode, ExportDescriptor, MemSource, Node, NodeIdentity, NodeResources, ObjKey,
    ObjKind, ObjType, ObjectSource, PeerCpu, SyncSource, PAGE_SIZE,
};

use common::{
    config, eventually, pair, pair_with_cpu, retry, NODE_A, NODE_B, WINDOW_BASE, WINDOW_SIZE,
};

fn target(identity: u64) -> ObjectSource {
    let phys = 0x9000_0000 + identity * 0x10_0000;
    ObjectSource::Mem(MemSource { identity, phys, size: 0x2000 })
}

#[tokio::test]
async fn test_export_import_unmap_cycle() {
    let p = pair().await;
    let (a, b) = (&p.a.node, &p.b.node);
    let baseline = p.b.port.mapping_count();

    let h = b.endpoint().map(ObjKind::TargetMem, target(1)).unwrap();
    let key = b.endpoint().attributes(h).unwrap().key;
    assert_eq!(p.b.port.mapping_count(), baseline + 1);

    let desc = b.endpoint().export(h).unwrap();
    assert_eq!(desc.export_type(), ExportType::Mem);
    assert_eq!(b.registry().refcount(key), Some(2));

    let imported = retry(|| a.endpoint().import(desc)).await.unwrap();
    let attrs = a.endpoint().attributes(imported).unwrap();
    assert_eq!(attrs.size, 0x2000);
    assert_eq!(attrs.offset, b.endpoint().attributes(h).unwrap().offset);
    assert_eq!(a.registry().stats().imports, 1);

    a.endpoint().free(imported).unwrap();
    assert_eq!(a.registry().stats().imports, 0);
    eventually(|| b.registry().refcount(key) == Some(1)).await;

    b.endpoint().free(h).unwrap();
    assert_eq!(b.registry().refcount(key), None);
    assert_eq!(p.b.port.mapping_count(), baseline);
}

#[tokio::test]
async fn test_each_import_needs_an_export() {
    let p = pair().await;
    let (a, b) = (&p.a.node, &p.b.node);

    let h = b.endpoint().map(ObjKind::TargetMem, target(2)).unwrap();
    let desc = b.endpoint().export(h).unwrap();
    let first = retry(|| a.endpoint().import(desc)).await.unwrap();
    assert!(matches!(a.endpoint().import(desc), Err(C2cError::PermissionDenied(_))));

    assert_eq!(b.endpoint().export(h).unwrap(), desc);
    let second = retry(|| match a.endpoint().import(desc) {
        Err(C2cError::PermissionDenied(_)) => {
            Err(C2cError::TryAgain("second register in flight".into()))
        }
        other => other,
    })
    .await
    .unwrap();
    assert_ne!(first, second);

    let key = b.endpoint().attributes(h).unwrap().key;
    assert_eq!(b.registry().refcount(key), Some(3));
    a.endpoint().free(first).unwrap();
    a.endpoint().free(second).unwrap();
    eventually(|| b.registry().refcount(key) == Some(1)).await;
}

#[tokio::test]
async fn test_import_before_register_is_retryable() {
    let p = pair().await;
    let config = &p.a.node.context().config;
    let desc =
        ExportDescriptor::encode(config.local, config.endpoint.id, ExportType::Mem, 9).unwrap();
    let err = p.a.node.endpoint().import(desc).unwrap_err();
    assert!(matches!(err, C2cError::TryAgain(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_import_rejects_foreign_descriptor() {
    let p = pair().await;
    let stranger = NodeIdentity { board_id: 0, soc_id: 5, cntrlr_id: 0 };
    let desc = ExportDescriptor::encode(stranger, 0, ExportType::Mem, 1).unwrap();
    assert!(matches!(p.a.node.endpoint().import(desc), Err(C2cError::PermissionDenied(_))));
    assert!(matches!(
        p.a.node.endpoint().import(ExportDescriptor::from_raw(0x1234)),
        Err(C2cError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn test_only_targets_and_remote_fences_export() {
    let p = pair().await;
    let ep = p.b.node.endpoint();

    let src = ep.map(ObjKind::SourceMem, target(3)).unwrap();
    assert!(matches!(ep.export(src), Err(C2cError::InvalidArgument(_))));

    let fence = ep
        .map(
            ObjKind::RemoteSync,
            ObjectSource::Sync(SyncSource { fence_id: 4, phys: 0xA000_0000, size: 8 }),
        )
        .unwrap();
    assert_eq!(ep.export(fence).unwrap().export_type(), ExportType::Sync);

    let fence_source = ObjectSource::Sync(SyncSource { fence_id: 1, phys: 0, size: 8 });
    assert!(matches!(ep.map(ObjKind::TargetMem, fence_source), Err(C2cError::InvalidArgument(_))));
    assert!(matches!(ep.free(src), Ok(())));
    assert!(matches!(ep.free(src), Err(C2cError::BadHandle(_))));
}

#[tokio::test]
async fn test_mapping_same_buffer_twice_shares_object() {
    let p = pair().await;
    let ep = p.b.node.endpoint();
    let first = ep.map(ObjKind::TargetMem, target(4)).unwrap();
    let second = ep.map(ObjKind::TargetMem, target(4)).unwrap();
    let key = ep.attributes(first).unwrap().key;
    assert_eq!(ep.attributes(second).unwrap().key, key);
    assert_eq!(p.b.node.registry().refcount(key), Some(2));

    // Same buffer, other access mode.
    assert!(matches!(ep.map(ObjKind::SourceMem, target(4)), Err(C2cError::Conflict(_))));

    let pinned = p.b.port.mapping_count();
    ep.free(first).unwrap();
    assert_eq!(p.b.node.registry().refcount(key), Some(1));
    assert_eq!(p.b.port.mapping_count(), pinned);
    ep.free(second).unwrap();
    assert_eq!(p.b.node.registry().refcount(key), None);
    assert_eq!(p.b.port.mapping_count(), pinned - 1);
}

#[tokio::test]
async fn test_oversized_map_is_rejected() {
    let p = pair().await;
    let ep = p.b.node.endpoint();
    let huge = |identity| {
        ObjectSource::Mem(MemSource { identity, phys: 0x9000_0000, size: u64::MAX - 10 })
    };
    let pinned = p.b.port.mapping_count();

    assert!(matches!(ep.map(ObjKind::SourceMem, huge(20)), Err(C2cError::InvalidArgument(_))));
    assert!(matches!(ep.map(ObjKind::TargetMem, huge(21)), Err(C2cError::InvalidArgument(_))));
    assert_eq!(p.b.port.mapping_count(), pinned);
    assert_eq!(p.b.port.attached_count(), 0);
    assert_eq!(p.b.node.registry().stats().mem_objects, 0);
}

#[tokio::test]
async fn test_export_outlives_local_free() {
    let p = pair().await;
    let (a, b) = (&p.a.node, &p.b.node);

    let h = b.endpoint().map(ObjKind::TargetMem, target(5)).unwrap();
    let key = b.endpoint().attributes(h).unwrap().key;
    let desc = b.endpoint().export(h).unwrap();
    let imported = retry(|| a.endpoint().import(desc)).await.unwrap();

    b.endpoint().free(h).unwrap();
    assert_eq!(b.registry().refcount(key), Some(1));
    assert!(b.registry().is_marked_for_deletion(key).unwrap());

    a.endpoint().free(imported).unwrap();
    eventually(|| b.registry().refcount(key).is_none()).await;
}

#[tokio::test]
async fn test_export_needs_link() {
    let p = pair().await;
    let b = &p.b.node;
    let h = b.endpoint().map(ObjKind::TargetMem, target(6)).unwrap();
    let key = b.endpoint().attributes(h).unwrap().key;

    p.a.node.link_down();
    eventually(|| !b.link().is_up()).await;
    assert!(matches!(b.endpoint().export(h), Err(C2cError::LinkDown)));
    assert_eq!(b.registry().refcount(key), Some(1));
}

#[tokio::test]
async fn test_shutdown_returns_unimported_exports() {
    let p = pair().await;
    let b = &p.b.node;
    let h = b.endpoint().map(ObjKind::TargetMem, target(7)).unwrap();
    let key = b.endpoint().attributes(h).unwrap().key;
    b.endpoint().export(h).unwrap();
    b.endpoint().export(h).unwrap();
    // Both registers folded into one import entry holding two export units.
    let import = ObjKey::new(ObjType::Import, 1);
    eventually(|| p.a.node.registry().refcount(import) == Some(2)).await;
    assert_eq!(b.registry().refcount(key), Some(3));

    let common::Pair { a, b, .. } = p;
    a.node.shutdown().await;
    eventually(|| b.node.registry().refcount(key) == Some(1)).await;
    assert_eq!(a.port.mapping_count(), 0);
}

#[tokio::test]
async fn test_bootstrap_reports_cpu_class() {
    let p = pair_with_cpu(PeerCpu::X86_64).await;
    assert_eq!(p.a.node.context().peer_cpu(), PeerCpu::X86_64);
    assert_eq!(p.b.node.context().peer_cpu(), PeerCpu::Arm64);
}

#[tokio::test]
async fn test_prepare_unwinds_fifo_when_doorbell_map_fails() {
    let (port, _peer) = LoopbackFabric::pair(WINDOW_BASE, WINDOW_SIZE);
    let cfg = config("a", NODE_A, NODE_B, DriverMode::RootPort);
    // Doorbell page follows the skip area and the one-page fifo.
    let bell = WINDOW_BASE + cfg.iova.skip + cfg.channel.region_size();
    port.map(bell, PAGE_SIZE, Backing::Phys(0xF000_0000), Prot::WRITE).unwrap();

    let prepared = Node::prepare(
        cfg,
        NodeResources {
            pcie: port.clone(),
            dma: Arc::new(ManualDma::new()),
            fences: Arc::new(CounterFences::new()),
            doorbell: Arc::new(NotifyDoorbell::new()),
            local_cpu: PeerCpu::Arm64,
        },
    );
    assert!(matches!(prepared, Err(C2cError::Busy(_))));
    assert_eq!(port.mapping_count(), 1);
}
