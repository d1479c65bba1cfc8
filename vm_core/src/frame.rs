//! Frame Table: the process-wide registry of every physical frame
//! currently backing a user page. Owns allocation, pinning, and the clock
//! algorithm used to pick an eviction victim when the pool is empty.
//!
//! A single lock (`Inner`'s `spin::Mutex`) serializes every mutation of the
//! table and every pin/unpin/evict step, including the swap write performed
//! during eviction.

use crate::hal::{AllocFlags, BlockDevice, Platform, PageDirectory, UserPool};
use crate::page::Process;
use crate::swap::{Swap, SwapSlot};
use crate::{fatal, log_debug, Kpage, Upage, PAGE_SIZE};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

struct Fte<P: Platform> {
    upage: Upage,
    owner: Arc<Process<P>>,
    pinned: bool,
}

struct Inner<P: Platform> {
    map: BTreeMap<usize, Fte<P>>,
    /// Insertion-ordered, conceptually circular; `clock_hand` is the index
    /// the next eviction scan resumes from.
    order: Vec<usize>,
    clock_hand: usize,
    swap: Swap<P::Device>,
}

/// The frame table plus the user pool it draws fresh frames from.
pub struct FrameTable<P: Platform> {
    inner: Mutex<Inner<P>>,
    pool: P::Pool,
}

impl<P: Platform> FrameTable<P> {
    pub fn new(pool: P::Pool, swap_device: Option<P::Device>) -> Self {
        FrameTable {
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                order: Vec::new(),
                clock_hand: 0,
                swap: Swap::init(swap_device),
            }),
            pool,
        }
    }

    /// Allocate a frame for `upage` on behalf of `owner`. Evicts a victim if
    /// the pool is empty; panics if eviction itself cannot free anything.
    /// The returned frame is pinned — the caller must unpin it once the
    /// frame is fully populated and mapped.
    pub fn allocate(&self, flags: AllocFlags, upage: Upage, owner: &Arc<Process<P>>) -> Kpage {
        let mut inner = self.inner.lock();
        let kpage = match self.pool.alloc(flags) {
            Some(k) => k,
            None => Self::evict_and_allocate(&mut inner, &self.pool, flags),
        };
        inner.map.insert(
            kpage.addr(),
            Fte {
                upage,
                owner: owner.clone(),
                pinned: true,
            },
        );
        inner.order.push(kpage.addr());
        kpage
    }

    /// Remove the frame table entry for `kpage` and return the underlying
    /// frame to the pool.
    pub fn free(&self, kpage: Kpage) {
        let mut inner = self.inner.lock();
        Self::remove(&mut inner, kpage.addr(), true, &self.pool);
    }

    /// Remove the frame table entry for `kpage` without returning the frame
    /// to the pool — the caller has already decided to repurpose or has
    /// already released the physical frame itself.
    pub fn remove_entry(&self, kpage: Kpage) {
        let mut inner = self.inner.lock();
        Self::remove(&mut inner, kpage.addr(), false, &self.pool);
    }

    fn remove(inner: &mut Inner<P>, addr: usize, free_phys: bool, pool: &P::Pool) {
        if inner.map.remove(&addr).is_none() {
            fatal!("frame table: freeing an unregistered frame {:#x}", addr);
        }
        if let Some(pos) = inner.order.iter().position(|&a| a == addr) {
            inner.order.remove(pos);
            if inner.order.is_empty() {
                inner.clock_hand = 0;
            } else if inner.clock_hand > pos {
                // the removed element preceded the hand: everything after it
                // shifted down by one.
                inner.clock_hand -= 1;
            } else {
                // the hand itself pointed at (or before) the removed slot:
                // after the shift it now names what was the successor.
                inner.clock_hand %= inner.order.len();
            }
        }
        if free_phys {
            pool.free(Kpage(addr));
        }
    }

    pub fn pin(&self, kpage: Kpage) {
        self.set_pinned(kpage, true);
    }

    pub fn unpin(&self, kpage: Kpage) {
        self.set_pinned(kpage, false);
    }

    fn set_pinned(&self, kpage: Kpage, pinned: bool) {
        let mut inner = self.inner.lock();
        match inner.map.get_mut(&kpage.addr()) {
            Some(fte) => fte.pinned = pinned,
            None => fatal!("frame table: pin/unpin of a frame that isn't registered: {:#x}", kpage.addr()),
        }
    }

    /// Read a swap slot back into `kpage`, serialized by the same lock that
    /// guards eviction's swap writes (§ swap provides no locking of its
    /// own).
    pub fn swap_in(&self, slot: SwapSlot, kpage: Kpage) {
        let mut inner = self.inner.lock();
        let bytes = unsafe { kpage_bytes_mut(kpage) };
        inner.swap.swap_in(slot, bytes);
    }

    /// Release a swap slot without reading it back, used by SPT teardown.
    pub fn free_swap_slot(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        inner.swap.free(slot);
    }

    /// Evict a victim, write it to swap, and allocate a fresh frame from the
    /// pool. Must be called with `inner`'s lock already held.
    fn evict_and_allocate(inner: &mut Inner<P>, pool: &P::Pool, flags: AllocFlags) -> Kpage {
        let victim_addr = Self::pick_victim(inner);
        let fte = inner
            .map
            .get(&victim_addr)
            .expect("frame listed in the eviction order but missing from the map");
        let upage = fte.upage;
        let owner = fte.owner.clone();

        // Tear down the hardware mapping: further access to `upage` faults.
        owner.page_dir.clear_page(upage);

        // The hardware may have recorded "dirty" against either alias.
        let dirty = owner.page_dir.is_dirty(upage.addr()) || owner.page_dir.is_dirty(victim_addr);

        let bytes = unsafe { kpage_bytes_mut(Kpage(victim_addr)) };
        let slot = inner.swap.swap_out(bytes);

        owner.spt.set_swap(upage, slot);
        owner.spt.set_dirty(upage, dirty);

        log_debug!(
            "[FRAME] evicted upage={:#x} kpage={:#x} dirty={} -> slot {}",
            upage.addr(),
            victim_addr,
            dirty,
            slot
        );

        Self::remove(inner, victim_addr, true, pool);

        pool.alloc(flags)
            .unwrap_or_else(|| fatal!("evict_and_allocate: pool allocation failed after eviction"))
    }

    /// Clock-algorithm scan: skip pinned frames, give accessed frames a
    /// second chance by clearing their accessed bit, and pick the first
    /// unpinned, unaccessed frame found. Bounded at `2 * |frames|`
    /// iterations; exhausting the bound means every frame is pinned or
    /// perpetually accessed, which is a caller bug.
    ///
    /// Each candidate's accessed bit is checked against *its own* owner's
    /// page directory (not the evicting thread's), since eviction can and
    /// does cross process boundaries here.
    fn pick_victim(inner: &mut Inner<P>) -> usize {
        let n = inner.order.len();
        if n == 0 {
            fatal!("frame table: empty, cannot evict -- there must be a leak somewhere");
        }
        let bound = 2 * n;
        for _ in 0..bound {
            if inner.clock_hand >= inner.order.len() {
                inner.clock_hand = 0;
            }
            let addr = inner.order[inner.clock_hand];
            inner.clock_hand = (inner.clock_hand + 1) % inner.order.len();

            let fte = inner
                .map
                .get(&addr)
                .expect("frame listed in the eviction order but missing from the map");
            if fte.pinned {
                continue;
            }
            if fte.owner.page_dir.is_accessed(fte.upage) {
                fte.owner.page_dir.set_accessed(fte.upage, false);
                continue;
            }
            return addr;
        }
        fatal!("frame table: cannot evict any frame -- not enough memory");
    }
}

/// Reinterpret a frame's contents as a page-sized byte buffer.
///
/// # Safety
/// `kpage` must be a live, page-aligned kernel virtual address backing a
/// full `PAGE_SIZE` region of readable and writable memory for the
/// duration of the borrow.
pub unsafe fn kpage_bytes_mut(kpage: Kpage) -> &'static mut [u8; PAGE_SIZE] {
    unsafe { &mut *(kpage.addr() as *mut [u8; PAGE_SIZE]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::VmFile;
    use crate::page::Process;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::cell::RefCell;
    use std::collections::BTreeMap as StdMap;

    struct TestPool {
        layout: Layout,
        frames: RefCell<Vec<*mut u8>>,
        cap: usize,
    }

    impl TestPool {
        fn new(cap: usize) -> Self {
            TestPool {
                layout: Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap(),
                frames: RefCell::new(Vec::new()),
                cap,
            }
        }
    }

    impl UserPool for TestPool {
        fn alloc(&self, _flags: AllocFlags) -> Option<Kpage> {
            let mut frames = self.frames.borrow_mut();
            if frames.len() >= self.cap {
                return None;
            }
            let ptr = unsafe { alloc_zeroed(self.layout) };
            frames.push(ptr);
            Some(Kpage(ptr as usize))
        }

        fn free(&self, kpage: Kpage) {
            let mut frames = self.frames.borrow_mut();
            frames.retain(|&p| p as usize != kpage.addr());
            unsafe { dealloc(kpage.addr() as *mut u8, self.layout) };
        }
    }

    #[derive(Default)]
    struct DirState {
        mapped: StdMap<usize, (usize, bool)>, // upage -> (kpage, writable)
        accessed: StdMap<usize, bool>,
        dirty: StdMap<usize, bool>,
    }

    #[derive(Clone)]
    struct TestDir {
        state: std::rc::Rc<RefCell<DirState>>,
    }

    impl TestDir {
        fn new() -> Self {
            TestDir {
                state: std::rc::Rc::new(RefCell::new(DirState::default())),
            }
        }
    }

    impl PageDirectory for TestDir {
        fn set_page(&self, upage: Upage, kpage: Kpage, writable: bool) -> bool {
            self.state.borrow_mut().mapped.insert(upage.addr(), (kpage.addr(), writable));
            true
        }
        fn clear_page(&self, upage: Upage) {
            self.state.borrow_mut().mapped.remove(&upage.addr());
        }
        fn is_accessed(&self, upage: Upage) -> bool {
            *self.state.borrow().accessed.get(&upage.addr()).unwrap_or(&false)
        }
        fn set_accessed(&self, upage: Upage, value: bool) {
            self.state.borrow_mut().accessed.insert(upage.addr(), value);
        }
        fn is_dirty(&self, addr: usize) -> bool {
            *self.state.borrow().dirty.get(&addr).unwrap_or(&false)
        }
        fn set_dirty(&self, addr: usize, value: bool) {
            self.state.borrow_mut().dirty.insert(addr, value);
        }
    }

    struct NullFile;
    impl VmFile for NullFile {
        fn seek(&self, _offset: u64) {}
        fn read(&self, _buf: &mut [u8]) -> usize {
            0
        }
    }

    struct TestDisk {
        sectors: RefCell<Vec<[u8; crate::SECTOR_SIZE]>>,
    }
    impl TestDisk {
        fn with_pages(n: usize) -> Self {
            TestDisk {
                sectors: RefCell::new(vec![[0u8; crate::SECTOR_SIZE]; n * crate::SECTORS_PER_PAGE]),
            }
        }
    }
    impl BlockDevice for TestDisk {
        fn size_in_sectors(&self) -> usize {
            self.sectors.borrow().len()
        }
        fn read(&self, sector: usize, buf: &mut [u8; crate::SECTOR_SIZE]) {
            buf.copy_from_slice(&self.sectors.borrow()[sector]);
        }
        fn write(&self, sector: usize, buf: &[u8; crate::SECTOR_SIZE]) {
            self.sectors.borrow_mut()[sector] = *buf;
        }
    }

    struct TestPlatform;
    impl Platform for TestPlatform {
        type PageDir = TestDir;
        type Pool = TestPool;
        type Device = TestDisk;
        type File = NullFile;
    }

    fn process(dir: TestDir) -> Arc<Process<TestPlatform>> {
        Process::new(dir)
    }

    #[test]
    fn allocate_returns_pinned_distinct_frames() {
        let table = FrameTable::<TestPlatform>::new(TestPool::new(4), Some(TestDisk::with_pages(4)));
        let owner = process(TestDir::new());
        let a = table.allocate(0, Upage(0x1000), &owner);
        let b = table.allocate(0, Upage(0x2000), &owner);
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "not enough memory")]
    fn eviction_panics_when_every_frame_is_pinned() {
        let table = FrameTable::<TestPlatform>::new(TestPool::new(1), Some(TestDisk::with_pages(4)));
        let owner = process(TestDir::new());
        // the pool has capacity 1 and the sole frame stays pinned (as
        // `allocate` always hands back pinned frames) -- the next
        // allocation has nothing unpinned to evict.
        let _a = table.allocate(0, Upage(0x1000), &owner);
        let _b = table.allocate(0, Upage(0x2000), &owner);
    }

    #[test]
    fn pinning_protects_a_frame_from_eviction() {
        let table = FrameTable::<TestPlatform>::new(TestPool::new(2), Some(TestDisk::with_pages(4)));
        let owner = process(TestDir::new());

        let a = table.allocate(0, Upage(0x1000), &owner);
        owner.spt.install_frame(Upage(0x1000), a);
        table.unpin(a);

        let b = table.allocate(0, Upage(0x2000), &owner);
        owner.spt.install_frame(Upage(0x2000), b);
        table.pin(b); // already pinned by allocate, but be explicit

        // pool is full (2/2); the next allocate must evict `a`, not `b`.
        let c = table.allocate(0, Upage(0x3000), &owner);
        owner.spt.install_frame(Upage(0x3000), c);
        table.unpin(c);

        // `a`'s spt entry should have moved to ON_SWAP, `b` should still be resident.
        assert!(!owner.spt.has_frame(Upage(0x1000)));
        assert!(owner.spt.has_frame(Upage(0x2000)));
    }

    #[test]
    fn second_chance_clears_accessed_before_evicting() {
        let table = FrameTable::<TestPlatform>::new(TestPool::new(2), Some(TestDisk::with_pages(4)));
        let owner = process(TestDir::new());

        let a = table.allocate(0, Upage(0x1000), &owner);
        owner.spt.install_frame(Upage(0x1000), a);
        owner.page_dir.set_accessed(Upage(0x1000), true);
        table.unpin(a);

        let b = table.allocate(0, Upage(0x2000), &owner);
        owner.spt.install_frame(Upage(0x2000), b);
        owner.page_dir.set_accessed(Upage(0x2000), true);
        table.unpin(b);

        // both accessed: the clock sweep must clear each once (second
        // chance) before a third allocation can evict one of them.
        let c = table.allocate(0, Upage(0x3000), &owner);
        owner.spt.install_frame(Upage(0x3000), c);
        table.unpin(c);

        let a_evicted = !owner.spt.has_frame(Upage(0x1000));
        let b_evicted = !owner.spt.has_frame(Upage(0x2000));
        assert!(a_evicted ^ b_evicted, "exactly one of the two accessed frames should have been evicted");
    }
}
