//! # libnyx-c2c - Chip-to-Chip Shared Memory
//!
//! Lets two SoCs joined by a PCIe link share buffers and fences and move
//! data between them with the eDMA engine.
//!
//! ## Features
//!
//! - **IOVA window** - Best-fit allocator over the PCIe window
//! - **Control channel** - Ordered frame fifos with doorbell notification
//! - **Export registry** - Reference-counted objects shared with the peer
//! - **Copy engine** - Pre-allocated DMA requests with fence signalling
//!
//! ## Quick Start
//!
//! ```no_run
//! use libnyx_c2c::prelude::*;
//!
//! # async fn run(
//! #     cfg_a: C2cConfig,
//! #     cfg_b: C2cConfig,
//! #     res_a: NodeResources,
//! #     res_b: NodeResources,
//! # ) -> Result<()> {
//! // Each side names the other as its peer.
//! let a = Node::prepare(cfg_a, res_a)?;
//! let b = Node::prepare(cfg_b, res_b)?;
//! let (a, b) = (a.connect()?, b.connect()?);
//! a.link_up()?;
//!
//! let target = b.endpoint().map(ObjKind::TargetMem, ObjectSource::Mem(MemSource {
//!     identity: 1,
//!     phys: 0x9000_0000,
//!     size: 0x1000,
//! }))?;
//! let desc = b.endpoint().export(target)?;
//! let _imported = a.endpoint().import(desc)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Everything returns [`Result`]. [`C2cError::class`] groups errors for
//! callers that only care whether to retry:
//!
//! ```no_run
//! # use libnyx_c2c::{C2cError, ExportDescriptor};
//! # fn import(desc: ExportDescriptor) -> libnyx_c2c::Result<()> { Ok(()) }
//! # let desc = ExportDescriptor::from_raw(0);
//! match import(desc) {
//!     Err(e) if e.is_retryable() => { /* register not seen yet */ }
//!     Err(e) => eprintln!("import failed: {e}"),
//!     Ok(()) => {}
//! }
//! ```

// Core modules
pub mod channel;
pub mod config;
pub mod context;
pub mod copy;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod iova;
pub mod link;
pub mod loopback;
pub mod registry;
pub mod traits;

/// Granularity of window mappings
pub const PAGE_SIZE: u64 = 4096;

/// Round `size` up to whole pages, or `InvalidArgument` if that overflows
pub fn page_align(size: u64) -> Result<u64> {
    size.checked_next_multiple_of(PAGE_SIZE).ok_or_else(|| {
        C2cError::InvalidArgument(format!("size {size:#x} overflows page alignment"))
    })
}

// Re-export commonly used types at the crate root
pub use channel::{CommChannel, Message, MessageType, PeerCpu};
pub use config::{load_config, C2cConfig, DriverMode, NodeIdentity};
pub use context::{Node, NodeResources, PreparedNode, SharedChannelContext};
pub use copy::{CopyCompletion, CopyEngine, CopyLimits, CopyStatus};
pub use descriptor::{ExportDescriptor, ExportType};
pub use endpoint::{CopyArgs, Endpoint, FlushRange, Handle, ObjKind, ObjectSource, RemoteFence};
pub use error::{C2cError, ErrorClass, Result};
pub use iova::IovaManager;
pub use link::{LinkState, LinkStatus};
pub use registry::{MemSource, ObjKey, ObjType, Registry, SyncSource};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{C2cConfig, DriverMode};
    pub use crate::context::{Node, NodeResources};
    pub use crate::copy::{CopyLimits, CopyStatus};
    pub use crate::endpoint::{CopyArgs, FlushRange, Handle, ObjKind, ObjectSource, RemoteFence};
    pub use crate::error::{C2cError, Result};
    pub use crate::registry::{MemSource, SyncSource};
    pub use crate::ExportDescriptor;
}
