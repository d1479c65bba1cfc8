//! External collaborator interfaces (the physical page allocator, the
//! hardware page directory, the swap block device, and the file system).
//! This crate only consumes these; the embedding kernel implements them.

use crate::{Kpage, Upage, SECTOR_SIZE};

/// Allocation flags, passed opaquely through to the user pool.
pub type AllocFlags = u32;

/// Request a frame from the pool reserved for user pages.
pub const PAL_USER: AllocFlags = 1 << 0;

/// The physical page allocator ("user pool").
///
/// Must not clear the accessed/dirty bits of a frame it hands back — a
/// frame that was just evicted and immediately reused still carries
/// whatever bits the hardware last set on it.
pub trait UserPool {
    /// Allocate one page-aligned frame, or `None` if the pool is empty.
    fn alloc(&self, flags: AllocFlags) -> Option<Kpage>;
    /// Return a frame previously obtained from `alloc`.
    fn free(&self, kpage: Kpage);
}

/// The hardware page directory: the architectural mapping from user virtual
/// address to kernel virtual address, with accessed/dirty bits.
///
/// `is_dirty`/`set_dirty` take a raw address rather than a typed one because
/// the CPU may record the dirty bit against either the user or kernel alias
/// of the same frame, depending on which alias the write went through.
pub trait PageDirectory: Clone {
    /// Install `upage -> kpage`, with the given writability. Returns false
    /// if the page table could not be extended to hold the mapping.
    fn set_page(&self, upage: Upage, kpage: Kpage, writable: bool) -> bool;
    /// Remove any mapping for `upage`.
    fn clear_page(&self, upage: Upage);
    fn is_accessed(&self, upage: Upage) -> bool;
    fn set_accessed(&self, upage: Upage, value: bool);
    fn is_dirty(&self, addr: usize) -> bool;
    fn set_dirty(&self, addr: usize, value: bool);
}

/// The block device holding swap.
pub trait BlockDevice {
    /// Total addressable sectors on the device.
    fn size_in_sectors(&self) -> usize;
    fn read(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]);
    fn write(&self, sector: usize, buf: &[u8; SECTOR_SIZE]);
}

/// A file handle as exposed by the file system, for file-backed pages.
pub trait VmFile {
    /// Seek to an absolute byte offset.
    fn seek(&self, offset: u64);
    /// Read up to `buf.len()` bytes from the current position. Returns the
    /// number of bytes actually read (may be short on EOF).
    fn read(&self, buf: &mut [u8]) -> usize;
}

/// Bundles the four collaborator types this crate is generic over, so the
/// rest of the crate takes one type parameter instead of four.
pub trait Platform {
    type PageDir: PageDirectory;
    type Pool: UserPool;
    type Device: BlockDevice;
    type File: VmFile;
}
