//! IOVA window allocator
//!
//! Best-fit allocator over the fixed PCIe-visible window. Every byte of the
//! window sits in exactly one block, either on the free list or on the
//! reserved list. Free blocks are kept in address order so that a release
//! coalesces with both neighbours in a single pass.
//!
//! Block counts stay in the low thousands, so both lists are plain vectors
//! and every operation is a linear scan under one lock.

use spin::Mutex;

use crate::error::{C2cError, Result};

/// A contiguous range of the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaBlock {
    address: u64,
    size: u64,
}

impl IovaBlock {
    /// First address of the block
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Length in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    fn end(&self) -> u64 {
        self.address + self.size
    }
}

/// Result of a successful reserve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Address the peer sees through the window
    pub iova: u64,
    /// Offset of `iova` from the window base
    pub offset: u64,
    /// Token handed back to [`IovaManager::release`]
    pub block: IovaBlock,
}

/// Occupancy snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IovaStats {
    pub free_bytes: u64,
    pub reserved_bytes: u64,
    pub free_blocks: usize,
    pub reserved_blocks: usize,
    pub largest_free: u64,
}

struct Lists {
    /// Sorted by address, never adjacent after a release
    free: Vec<IovaBlock>,
    reserved: Vec<IovaBlock>,
}

/// Allocator for one PCIe window
pub struct IovaManager {
    name: String,
    base: u64,
    size: u64,
    lists: Mutex<Lists>,
}

impl IovaManager {
    /// Create an allocator whose single free block spans `[base, base + size)`
    pub fn new(name: impl Into<String>, base: u64, size: u64) -> Result<Self> {
        if size == 0 || base.checked_add(size).is_none() {
            return Err(C2cError::InvalidArgument(format!(
                "iova window base {base:#x} size {size:#x}"
            )));
        }
        let name = name.into();
        tracing::debug!(%name, base = format_args!("{base:#x}"), size, "iova window created");
        Ok(Self {
            name,
            base,
            size,
            lists: Mutex::new(Lists {
                free: vec![IovaBlock { address: base, size }],
                reserved: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reserve `size` bytes from the smallest free block that holds them
    pub fn reserve(&self, size: u64) -> Result<Reservation> {
        if size == 0 {
            return Err(C2cError::InvalidArgument("zero-sized iova reservation".into()));
        }

        let mut lists = self.lists.lock();
        let best = lists
            .free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| b.size)
            .map(|(i, _)| i);

        let Some(index) = best else {
            tracing::warn!(name = %self.name, size, "no iova block fits");
            return Err(C2cError::ResourceExhausted("iova window"));
        };

        let block = if lists.free[index].size == size {
            lists.free.remove(index)
        } else {
            // Split: the low part is handed out, the remainder shrinks in place.
            let free = &mut lists.free[index];
            let low = IovaBlock { address: free.address, size };
            free.address += size;
            free.size -= size;
            low
        };
        lists.reserved.push(block);

        tracing::trace!(
            name = %self.name,
            iova = format_args!("{:#x}", block.address),
            size,
            "iova reserved"
        );
        Ok(Reservation { iova: block.address, offset: block.address - self.base, block })
    }

    /// Return a reserved block, merging it with adjacent free blocks
    pub fn release(&self, block: IovaBlock) -> Result<()> {
        let mut lists = self.lists.lock();

        let Some(pos) = lists.reserved.iter().position(|b| *b == block) else {
            return Err(C2cError::NotFound(format!(
                "iova block {:#x}+{:#x} is not reserved",
                block.address, block.size
            )));
        };
        lists.reserved.swap_remove(pos);

        let free = &mut lists.free;
        let mut i = 0;
        while i < free.len() && free[i].address < block.address {
            i += 1;
        }

        if i == free.len() {
            // Past every free block
            match free.last_mut() {
                Some(last) if last.end() == block.address => last.size += block.size,
                _ => free.push(block),
            }
        } else {
            let joins_prev = i > 0 && free[i - 1].end() == block.address;
            let joins_next = block.end() == free[i].address;
            match (joins_prev, joins_next) {
                (true, true) => {
                    let next = free.remove(i);
                    free[i - 1].size += block.size + next.size;
                }
                (true, false) => free[i - 1].size += block.size,
                (false, true) => {
                    free[i].address = block.address;
                    free[i].size += block.size;
                }
                (false, false) => free.insert(i, block),
            }
        }

        tracing::trace!(
            name = %self.name,
            iova = format_args!("{:#x}", block.address),
            size = block.size,
            "iova released"
        );
        Ok(())
    }

    /// Current occupancy
    pub fn stats(&self) -> IovaStats {
        let lists = self.lists.lock();
        IovaStats {
            free_bytes: lists.free.iter().map(|b| b.size).sum(),
            reserved_bytes: lists.reserved.iter().map(|b| b.size).sum(),
            free_blocks: lists.free.len(),
            reserved_blocks: lists.reserved.len(),
            largest_free: lists.free.iter().map(|b| b.size).max().unwrap_or(0),
        }
    }

    /// Whether free and reserved blocks tile the window with no gap or overlap
    #[cfg(test)]
    fn is_partitioned(&self) -> bool {
        let lists = self.lists.lock();
        let mut all: Vec<IovaBlock> =
            lists.free.iter().chain(lists.reserved.iter()).copied().collect();
        all.sort_by_key(|b| b.address);
        let mut cursor = self.base;
        for b in &all {
            if b.address != cursor || b.size == 0 {
                return false;
            }
            cursor = b.end();
        }
        cursor == self.base + self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: u64 = 0x1000_0000;

    #[test]
    fn test_split_takes_low_part() {
        let iova = IovaManager::new("test", BASE, 0x10000).unwrap();
        let r = iova.reserve(0x1000).unwrap();
        assert_eq!(r.iova, BASE);
        assert_eq!(r.offset, 0);

        let r2 = iova.reserve(0x2000).unwrap();
        assert_eq!(r2.iova, BASE + 0x1000);
        assert_eq!(r2.offset, 0x1000);

        let stats = iova.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 0x10000 - 0x3000);
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let iova = IovaManager::new("test", BASE, 0x10000).unwrap();
        let a = iova.reserve(0x4000).unwrap();
        let _b = iova.reserve(0x1000).unwrap();
        let c = iova.reserve(0x1000).unwrap();
        let _d = iova.reserve(0x1000).unwrap();

        // Holes: 0x4000 at BASE, 0x1000 at c, tail of 0x9000.
        iova.release(a.block).unwrap();
        iova.release(c.block).unwrap();

        let r = iova.reserve(0x1000).unwrap();
        assert_eq!(r.iova, c.iova);
        let r = iova.reserve(0x3000).unwrap();
        assert_eq!(r.iova, a.iova);
    }

    #[test]
    fn test_exhaustion() {
        let iova = IovaManager::new("test", BASE, 0x2000).unwrap();
        iova.reserve(0x2000).unwrap();
        assert!(matches!(iova.reserve(1), Err(C2cError::ResourceExhausted(_))));
    }

    #[test]
    fn test_release_coalesces_both_sides() {
        let iova = IovaManager::new("test", BASE, 0x3000).unwrap();
        let a = iova.reserve(0x1000).unwrap();
        let b = iova.reserve(0x1000).unwrap();
        let c = iova.reserve(0x1000).unwrap();

        iova.release(a.block).unwrap();
        iova.release(c.block).unwrap();
        assert_eq!(iova.stats().free_blocks, 2);

        iova.release(b.block).unwrap();
        let stats = iova.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free, 0x3000);
    }

    #[test]
    fn test_release_past_all_free_blocks() {
        let iova = IovaManager::new("test", BASE, 0x2000).unwrap();
        let a = iova.reserve(0x1000).unwrap();
        let b = iova.reserve(0x1000).unwrap();
        iova.release(a.block).unwrap();
        // b lies after the only free block and touches it
        iova.release(b.block).unwrap();
        assert_eq!(iova.stats().free_blocks, 1);
        assert!(iova.is_partitioned());
    }

    #[test]
    fn test_double_release_rejected() {
        let iova = IovaManager::new("test", BASE, 0x2000).unwrap();
        let a = iova.reserve(0x1000).unwrap();
        iova.release(a.block).unwrap();
        assert!(matches!(iova.release(a.block), Err(C2cError::NotFound(_))));
        assert!(iova.is_partitioned());
    }

    #[test]
    fn test_zero_sized() {
        assert!(IovaManager::new("test", BASE, 0).is_err());
        let iova = IovaManager::new("test", BASE, 0x1000).unwrap();
        assert!(iova.reserve(0).is_err());
    }

    proptest! {
        #[test]
        fn prop_blocks_partition_window(
            sizes in prop::collection::vec(1u64..0x4000, 1..64),
            release_order in prop::collection::vec(any::<prop::sample::Index>(), 64),
        ) {
            let window = 0x40000;
            let iova = IovaManager::new("prop", BASE, window).unwrap();
            let mut held = Vec::new();

            for (i, size) in sizes.iter().enumerate() {
                if let Ok(r) = iova.reserve(*size) {
                    held.push(r.block);
                }
                // Interleave some releases with the reservations
                if i % 3 == 2 && !held.is_empty() {
                    let victim = release_order[i].index(held.len());
                    iova.release(held.swap_remove(victim)).unwrap();
                }
                let stats = iova.stats();
                prop_assert_eq!(stats.free_bytes + stats.reserved_bytes, window);
                prop_assert!(iova.is_partitioned());
            }

            let mut n = 0;
            while !held.is_empty() {
                let victim = release_order[n % release_order.len()].index(held.len());
                iova.release(held.swap_remove(victim)).unwrap();
                prop_assert!(iova.is_partitioned());
                n += 1;
            }

            let stats = iova.stats();
            prop_assert_eq!(stats.free_blocks, 1);
            prop_assert_eq!(stats.largest_free, window);
            prop_assert_eq!(stats.reserved_blocks, 0);
        }
    }
}
