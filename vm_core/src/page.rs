//! Supplemental Page Table: per-process bookkeeping for every virtual page a
//! process knows about, whether or not it currently has a physical frame,
//! and the page-fault orchestration (`Process::load_page`) built on top of
//! it.

use crate::frame::FrameTable;
use crate::hal::{Platform, PageDirectory, VmFile, PAL_USER};
use crate::swap::SwapSlot;
use crate::{fatal, Kpage, Upage, PAGE_SIZE};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// Where a virtual page's data currently lives, and what's needed to bring
/// it into a frame if it doesn't have one.
pub enum PageStatus<F> {
    /// Resident; `Kpage` is the frame currently mapped for it.
    OnFrame(Kpage),
    /// Evicted to swap.
    OnSwap(SwapSlot),
    /// Not yet loaded; backed by a range of an open file.
    FromFilesys {
        file: Arc<F>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
    /// Not yet loaded; a fresh all-zero page (stack growth, BSS).
    AllZero,
}

struct Spte<F> {
    status: PageStatus<F>,
    dirty: bool,
}

/// A process's directory of virtual pages, keyed by page-aligned user
/// address.
///
/// Guarded by its own lock distinct from the frame table's: the two are
/// always taken in the order frame-table-then-SPT during eviction, and a
/// process's own fault handler always releases its SPT lock before calling
/// into the frame table, so the two never deadlock against each other.
pub struct Spt<F> {
    entries: Mutex<BTreeMap<usize, Spte<F>>>,
}

impl<F> Spt<F> {
    pub fn new() -> Self {
        Spt {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fatal if `upage` is already tracked: only ever called during initial
    /// load or stack growth, where a duplicate indicates a caller bug.
    pub fn install_filesys(
        &self,
        upage: Upage,
        file: Arc<F>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) {
        debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage.addr()) {
            fatal!("spt: install_filesys duplicate entry for {:#x}", upage.addr());
        }
        entries.insert(
            upage.addr(),
            Spte {
                status: PageStatus::FromFilesys {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                    writable,
                },
                dirty: false,
            },
        );
    }

    /// Fatal if `upage` is already tracked, for the same reason as
    /// `install_filesys`.
    pub fn install_zeropage(&self, upage: Upage) {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage.addr()) {
            fatal!("spt: install_zeropage duplicate entry for {:#x}", upage.addr());
        }
        entries.insert(
            upage.addr(),
            Spte {
                status: PageStatus::AllZero,
                dirty: false,
            },
        );
    }

    /// Establish a fresh `ON_FRAME` entry for `upage`. Returns `false`
    /// without modifying anything if an entry already exists -- unlike
    /// `install_filesys`/`install_zeropage`, a duplicate here is an
    /// expected race (another thread's fault handler won), not a bug.
    pub fn install_frame(&self, upage: Upage, kpage: Kpage) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&upage.addr()) {
            return false;
        }
        entries.insert(
            upage.addr(),
            Spte {
                status: PageStatus::OnFrame(kpage),
                dirty: false,
            },
        );
        true
    }

    /// Commit a fault resolution: an existing entry (previously `ALL_ZERO`,
    /// `ON_SWAP`, or `FROM_FILESYS`) transitions to `ON_FRAME`. Distinct
    /// from `install_frame`, which is the fresh-entry installation
    /// operation -- this is `load_page`'s internal bookkeeping step.
    fn transition_to_frame(&self, upage: Upage, kpage: Kpage) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&upage.addr()) {
            Some(spte) => spte.status = PageStatus::OnFrame(kpage),
            None => fatal!("spt: load_page commit on a vanished entry {:#x}", upage.addr()),
        }
    }

    /// Record that `upage` was evicted to `slot`. Called by the frame table
    /// during eviction, across process boundaries.
    pub fn set_swap(&self, upage: Upage, slot: SwapSlot) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&upage.addr()) {
            Some(spte) => spte.status = PageStatus::OnSwap(slot),
            None => fatal!("spt: set_swap on an untracked page {:#x}", upage.addr()),
        }
    }

    /// OR the sticky dirty bit for `upage`. Never cleared once set, except
    /// by `destroy` dropping the entry entirely. Fatal if the SPTE is
    /// absent.
    pub fn set_dirty(&self, upage: Upage, dirty: bool) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&upage.addr()) {
            Some(spte) => spte.dirty |= dirty,
            None => fatal!("spt: set_dirty on an untracked page {:#x}", upage.addr()),
        }
    }

    /// Current value of the sticky dirty bit. Used by callers (and tests)
    /// that want to observe it without reaching into eviction internals.
    pub fn is_dirty(&self, upage: Upage) -> bool {
        self.entries.lock().get(&upage.addr()).map(|s| s.dirty).unwrap_or(false)
    }

    pub fn has_entry(&self, upage: Upage) -> bool {
        self.entries.lock().contains_key(&upage.addr())
    }

    /// True only while the page is resident (used by tests to observe
    /// eviction).
    pub fn has_frame(&self, upage: Upage) -> bool {
        matches!(
            self.entries.lock().get(&upage.addr()),
            Some(Spte { status: PageStatus::OnFrame(_), .. })
        )
    }

    fn remove(&self, upage: Upage) -> Option<Spte<F>> {
        self.entries.lock().remove(&upage.addr())
    }
}

impl<F> Default for Spt<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a fault needs in order to populate a fresh frame, extracted from the
/// SPT entry before the SPT lock is released.
enum Source<F> {
    Zero,
    Swap(SwapSlot),
    Filesys {
        file: Arc<F>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

/// A process's page directory and supplemental page table, bundled so every
/// frame table entry can reach both through one owner handle — this is what
/// lets eviction consult the *victim's* page directory instead of the
/// evicting thread's.
pub struct Process<P: Platform> {
    pub page_dir: P::PageDir,
    pub spt: Spt<P::File>,
}

impl<P: Platform> Process<P> {
    pub fn new(page_dir: P::PageDir) -> Arc<Self> {
        Arc::new(Process {
            page_dir,
            spt: Spt::new(),
        })
    }

    /// Resolve a page fault on `upage`. Installs a hardware mapping and
    /// returns `true` on success. Returns `false` if `upage` has no SPT
    /// entry at all (an access outside any known mapping: the caller above
    /// this layer decides whether that's a segfault or a stack-growth
    /// candidate), or if a file-backed page short-reads, or if the page
    /// directory can't be extended to hold the mapping -- all three are
    /// the recoverable conditions named by the fault path's contract, not
    /// bugs.
    pub fn load_page(self: &Arc<Self>, frame_table: &FrameTable<P>, upage: Upage) -> bool {
        let (source, writable) = {
            let mut entries = self.spt.entries.lock();
            let spte = match entries.get_mut(&upage.addr()) {
                Some(s) => s,
                None => return false,
            };
            match &spte.status {
                PageStatus::OnFrame(_) => return true,
                PageStatus::AllZero => (Source::Zero, true),
                PageStatus::OnSwap(slot) => (Source::Swap(*slot), true),
                PageStatus::FromFilesys {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                    writable,
                } => (
                    Source::Filesys {
                        file: file.clone(),
                        offset: *offset,
                        read_bytes: *read_bytes,
                        zero_bytes: *zero_bytes,
                    },
                    *writable,
                ),
            }
            // lock dropped at the end of this block -- `frame_table.allocate`
            // below may trigger eviction, which can need this very SPT's
            // lock for a different page.
        };

        let kpage = frame_table.allocate(PAL_USER, upage, self);

        let bytes = unsafe { crate::frame::kpage_bytes_mut(kpage) };
        match source {
            Source::Zero => bytes.fill(0),
            Source::Swap(slot) => frame_table.swap_in(slot, kpage),
            Source::Filesys {
                file,
                offset,
                read_bytes,
                zero_bytes,
            } => {
                file.seek(offset);
                let got = file.read(&mut bytes[..read_bytes]);
                if got < read_bytes {
                    frame_table.free(kpage);
                    return false;
                }
                bytes[read_bytes..read_bytes + zero_bytes].fill(0);
            }
        }

        if !self.page_dir.set_page(upage, kpage, writable) {
            frame_table.free(kpage);
            return false;
        }
        // The mapping is fresh, but the pool does not clear a reused
        // frame's accessed/dirty bits (see `UserPool`'s contract), so any
        // stale dirty history from a prior occupant lives on the kernel
        // alias, not the just-installed upage PTE. Eviction's aggregated
        // dirty check consults both aliases, so both must start clean.
        self.page_dir.set_dirty(upage.addr(), false);
        self.page_dir.set_dirty(kpage.addr(), false);
        self.spt.transition_to_frame(upage, kpage);
        frame_table.unpin(kpage);
        true
    }

    /// Pin `upage`'s frame. A no-op if `upage` has no SPT entry at all
    /// (covers addresses in the stack-growth region). Fatal if the entry
    /// exists but isn't resident -- callers must `load_page` first if the
    /// page may not be resident.
    pub fn pin_page(&self, frame_table: &FrameTable<P>, upage: Upage) {
        let entries = self.spt.entries.lock();
        match entries.get(&upage.addr()) {
            None => {}
            Some(Spte { status: PageStatus::OnFrame(kpage), .. }) => {
                let kpage = *kpage;
                drop(entries);
                frame_table.pin(kpage);
            }
            Some(_) => fatal!("pin_page: {:#x} is not resident", upage.addr()),
        }
    }

    /// Fatal if `upage` isn't resident.
    pub fn unpin_page(&self, frame_table: &FrameTable<P>, upage: Upage) {
        let entries = self.spt.entries.lock();
        match entries.get(&upage.addr()) {
            Some(Spte { status: PageStatus::OnFrame(kpage), .. }) => {
                let kpage = *kpage;
                drop(entries);
                frame_table.unpin(kpage);
            }
            _ => fatal!("unpin_page: {:#x} is not resident", upage.addr()),
        }
    }

    /// Tear down one page: unmap it, reclaim its frame or swap slot, and
    /// drop its SPT entry. Called once per page as the process exits.
    ///
    /// An `ON_FRAME` entry drops its frame-table record via `remove_entry`,
    /// not `free` — the physical frame is *not* returned to the pool here.
    /// For a currently-mapped user frame, that release belongs to the
    /// hardware page-directory destructor the caller runs; calling `free`
    /// here as well would hand the same frame back to the pool twice.
    pub fn destroy_page(&self, frame_table: &FrameTable<P>, upage: Upage) {
        self.page_dir.clear_page(upage);
        if let Some(spte) = self.spt.remove(upage) {
            match spte.status {
                PageStatus::OnFrame(kpage) => frame_table.remove_entry(kpage),
                PageStatus::OnSwap(slot) => frame_table.free_swap_slot(slot),
                PageStatus::FromFilesys { .. } | PageStatus::AllZero => {}
            }
        }
    }

    /// Tear down every page this process still has an entry for.
    pub fn destroy(&self, frame_table: &FrameTable<P>) {
        let upages: alloc::vec::Vec<usize> = self.spt.entries.lock().keys().copied().collect();
        for addr in upages {
            self.destroy_page(frame_table, Upage(addr));
        }
    }
}
