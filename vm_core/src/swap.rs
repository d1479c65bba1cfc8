//! Swap Area: a fixed-size, page-granular region of a block device backing
//! evicted anonymous pages.
//!
//! The bitmap is word-packed (one bit per slot, set = free), the same
//! layout this codebase's physical frame allocator already uses for its own
//! bitmap (`kernel/src/memory/frame.rs`'s `FrameAllocator::bitmap`).
//!
//! Swap provides no locking of its own: operations here are serialized by
//! the caller, in practice the Frame Table's `frame_lock` held across the
//! whole eviction sequence.

use crate::hal::BlockDevice;
use crate::{fatal, log_debug, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use alloc::vec;
use alloc::vec::Vec;

/// Index of a single page-sized slot on the swap device.
pub type SwapSlot = u32;

/// Fixed array of page-sized slots on a block device.
pub struct Swap<D: BlockDevice> {
    device: D,
    available: Vec<u64>,
    slot_count: usize,
}

impl<D: BlockDevice> Swap<D> {
    /// Acquire the designated swap device and size the availability bitmap
    /// from it. Must be called exactly once; fails fatally if the device is
    /// absent.
    pub fn init(device: Option<D>) -> Self {
        let device = match device {
            Some(d) => d,
            None => fatal!("swap: designated block device is absent"),
        };
        let slot_count = device.size_in_sectors() / SECTORS_PER_PAGE;
        let words = slot_count.div_ceil(64);
        Swap {
            device,
            available: vec![u64::MAX; words],
            slot_count,
        }
    }

    /// Number of page-sized slots this swap area manages.
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn is_free(&self, slot: usize) -> bool {
        self.available[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    fn set_free(&mut self, slot: usize, free: bool) {
        if free {
            self.available[slot / 64] |= 1u64 << (slot % 64);
        } else {
            self.available[slot / 64] &= !(1u64 << (slot % 64));
        }
    }

    /// Write `page` into the first free slot, marking it used. Fatal if
    /// swap is full.
    pub fn swap_out(&mut self, page: &[u8; PAGE_SIZE]) -> SwapSlot {
        let slot = (0..self.slot_count)
            .find(|&s| self.is_free(s))
            .unwrap_or_else(|| fatal!("swap: no free slot -- swap is full"));

        let base = slot * SECTORS_PER_PAGE;
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device.write(base + i, &sector);
        }
        self.set_free(slot, false);
        log_debug!("[SWAP] wrote page -> slot {}", slot);
        slot as SwapSlot
    }

    /// Read a slot's contents back into `page`. The slot is released by the
    /// act of reading it back — an evicted page is re-read at most once.
    /// Fatal on a double-swap-in or use-after-free.
    pub fn swap_in(&mut self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) {
        let slot = slot as usize;
        if slot >= self.slot_count || self.is_free(slot) {
            fatal!("swap: invalid read of unassigned slot {}", slot);
        }
        let base = slot * SECTORS_PER_PAGE;
        for i in 0..SECTORS_PER_PAGE {
            let mut sector = [0u8; SECTOR_SIZE];
            self.device.read(base + i, &mut sector);
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        self.set_free(slot, true);
        log_debug!("[SWAP] read slot {} -> page, slot released", slot);
    }

    /// Release a slot without reading it back. Used when destroying an SPTE
    /// whose status is `ON_SWAP`.
    pub fn free(&mut self, slot: SwapSlot) {
        let slot = slot as usize;
        if slot >= self.slot_count || self.is_free(slot) {
            fatal!("swap: invalid free of unassigned slot {}", slot);
        }
        self.set_free(slot, true);
        log_debug!("[SWAP] freed slot {} without reading it back", slot);
    }
}
