//! Sub-page allocation of executable memory.
//!
//! Detours need many tiny blocks (8-byte indirection cells, 16-byte jump stubs, relocated entry
//! code) and some of them must sit within ±2 GiB of a given address. Mapping a page per block
//! would waste address space, so [`PagedMemoryAllocator`] carves blocks out of whole pages, keeps
//! a sorted, coalescing free list per page, and returns a page to the OS once it is empty.
//!
//! How pages are obtained is up to a [`PageBackend`]; the allocator itself never touches the
//! memory it manages.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use crate::{
    platform::system::{
        Allocation, AllocationRequest, MemoryAllocator, PositionedAllocationRequest,
    },
    Error, Result,
};

/// Source of whole pages for a [`PagedMemoryAllocator`].
pub trait PageBackend: Send + Sync + 'static {
    /// Size of one page; a power of two.
    fn page_size(&self) -> usize;

    /// Maps a fresh page anywhere.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`] if the OS refuses.
    fn map_page(&self, executable: bool) -> Result<usize>;

    /// Maps a fresh page exactly at `address` without replacing an existing mapping.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`] if the address is taken or the OS refuses.
    fn map_page_at(&self, address: usize, executable: bool) -> Result<usize>;

    /// `true` if anything is mapped at the page starting at `address`.
    fn is_page_mapped(&self, address: usize) -> bool;

    /// Unmaps a page previously returned by this backend.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the OS refuses.
    fn unmap_page(&self, address: usize) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

#[derive(Debug)]
struct Page {
    base: usize,
    size: usize,
    executable: bool,
    // sorted by offset, no empty or adjacent blocks
    free: Mutex<Vec<FreeBlock>>,
}

impl Page {
    fn new(base: usize, size: usize, executable: bool) -> Self {
        Page {
            base,
            size,
            executable,
            free: Mutex::new(vec![FreeBlock { offset: 0, size }]),
        }
    }

    fn try_allocate(&self, size: usize, align: usize) -> Result<Option<usize>> {
        let mut free = lock!(self.free);

        let mut found = None;
        for (index, block) in free.iter().enumerate() {
            let misalignment = (self.base + block.offset) % align;
            let fix = if misalignment == 0 {
                0
            } else {
                align - misalignment
            };
            if block.size >= fix + size {
                found = Some((index, fix));
                break;
            }
        }

        let Some((index, fix)) = found else {
            return Ok(None);
        };

        let block = free[index];
        let offset = block.offset + fix;
        free[index] = FreeBlock {
            offset: offset + size,
            size: block.size - fix - size,
        };
        if fix != 0 {
            free.insert(
                index,
                FreeBlock {
                    offset: block.offset,
                    size: fix,
                },
            );
        }
        normalize(&mut free);

        Ok(Some(offset))
    }

    /// Returns a block, reporting whether the page is now completely free.
    fn free(&self, offset: usize, size: usize) -> Result<bool> {
        let mut free = lock!(self.free);
        let position = free.partition_point(|block| block.offset < offset);
        free.insert(position, FreeBlock { offset, size });
        normalize(&mut free);

        Ok(free.len() == 1 && free[0].offset == 0 && free[0].size == self.size)
    }

    fn is_empty(&self) -> Result<bool> {
        let free = lock!(self.free);
        Ok(free.len() == 1 && free[0].offset == 0 && free[0].size == self.size)
    }
}

fn normalize(free: &mut Vec<FreeBlock>) {
    free.retain(|block| block.size > 0);

    let mut index = 0;
    while index + 1 < free.len() {
        if free[index].offset + free[index].size == free[index + 1].offset {
            free[index].size += free[index + 1].size;
            free.remove(index + 1);
        } else {
            index += 1;
        }
    }
}

trait PageOwner: Send + Sync {
    fn release_page(&self, page: &Arc<Page>);
}

/// A block handed out by a [`PagedMemoryAllocator`]. Returned to its page on drop.
pub struct PageAllocation {
    page: Arc<Page>,
    owner: Arc<dyn PageOwner>,
    offset: usize,
    size: usize,
}

impl fmt::Debug for PageAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocation")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size)
            .field("executable", &self.page.executable)
            .finish()
    }
}

impl Allocation for PageAllocation {
    fn base(&self) -> usize {
        self.page.base + self.offset
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_executable(&self) -> bool {
        self.page.executable
    }
}

impl Drop for PageAllocation {
    fn drop(&mut self) {
        match self.page.free(self.offset, self.size) {
            Ok(true) => self.owner.release_page(&self.page),
            Ok(false) => {}
            Err(error) => log::error!(
                "Could not return {} bytes at {:#x}: {}",
                self.size,
                self.page.base + self.offset,
                error
            ),
        }
    }
}

struct PagedInner<B: PageBackend> {
    backend: B,
    page_size: usize,
    // sorted by base address
    pages: Mutex<Vec<Arc<Page>>>,
}

impl<B: PageBackend> PagedInner<B> {
    fn round_down(&self, address: usize) -> usize {
        address & !(self.page_size - 1)
    }

    fn insert_page(pages: &mut Vec<Arc<Page>>, page: Arc<Page>) {
        let position = pages.partition_point(|existing| existing.base < page.base);
        pages.insert(position, page);
    }
}

impl<B: PageBackend> PageOwner for PagedInner<B> {
    fn release_page(&self, page: &Arc<Page>) {
        let Ok(mut pages) = self.pages.lock() else {
            log::error!("Allocator page list poisoned, leaking page {:#x}", page.base);
            return;
        };

        // an allocation may have landed on the page since it became empty
        if !matches!(page.is_empty(), Ok(true)) {
            return;
        }
        let Some(position) = pages.iter().position(|p| Arc::ptr_eq(p, page)) else {
            return;
        };
        pages.remove(position);
        drop(pages);

        log::trace!("Releasing empty page {:#x}", page.base);
        if let Err(error) = self.backend.unmap_page(page.base) {
            log::error!("Could not deallocate page {:#x}: {}", page.base, error);
        }
    }
}

/// An allocator handing out sub-page blocks from pages supplied by a [`PageBackend`].
pub struct PagedMemoryAllocator<B: PageBackend> {
    inner: Arc<PagedInner<B>>,
}

impl<B: PageBackend> PagedMemoryAllocator<B> {
    /// Creates an allocator drawing pages from `backend`.
    pub fn new(backend: B) -> Self {
        let page_size = backend.page_size();
        PagedMemoryAllocator {
            inner: Arc::new(PagedInner {
                backend,
                page_size,
                pages: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The page backend.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Rounds `address` down to the start of its page.
    #[must_use]
    pub fn round_down_to_page(&self, address: usize) -> usize {
        self.inner.round_down(address)
    }

    /// Number of pages currently held.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the page list is poisoned.
    pub fn page_count(&self) -> Result<usize> {
        Ok(lock!(self.inner.pages).len())
    }

    fn make_allocation(&self, page: &Arc<Page>, offset: usize, size: usize) -> Box<dyn Allocation> {
        Box::new(PageAllocation {
            page: page.clone(),
            owner: self.inner.clone(),
            offset,
            size,
        })
    }

    fn validate(&self, request: &AllocationRequest) -> Result<()> {
        if request.size == 0 {
            return Err(Error::InvalidArgument("Allocation size is zero".to_string()));
        }
        if request.alignment == 0 || !request.alignment.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "Alignment {} is not a power of two",
                request.alignment
            )));
        }
        if request.size > self.inner.page_size {
            return Err(Error::Allocation(format!(
                "Single allocations cannot be larger than a page ({} > {})",
                request.size, self.inner.page_size
            )));
        }
        Ok(())
    }

    fn try_with_page(
        &self,
        page: &Arc<Page>,
        request: &PositionedAllocationRequest,
    ) -> Result<Option<Box<dyn Allocation>>> {
        if page.executable != request.request.executable
            || page.base < request.low
            || page.base > request.high
        {
            return Ok(None);
        }

        let Some(offset) = page.try_allocate(request.request.size, request.request.alignment)?
        else {
            return Ok(None);
        };
        let base = page.base + offset;
        if base < request.low || base + request.request.size > request.high {
            // the page list is locked by the caller, so the page stays even if it is empty now
            page.free(offset, request.request.size)?;
            return Ok(None);
        }
        Ok(Some(self.make_allocation(page, offset, request.request.size)))
    }

    /// Finds the unmapped page closest to `target_page` within the page bounds, alternating
    /// upward and downward.
    fn find_free_page(&self, target_page: usize, low_page: usize, high_page: usize) -> Option<usize> {
        let page_size = self.inner.page_size;
        let mut high = Some(target_page);
        let mut low = target_page.checked_sub(page_size);

        loop {
            let high_candidate = high.filter(|page| *page <= high_page);
            let low_candidate = low.filter(|page| *page >= low_page);
            if high_candidate.is_none() && low_candidate.is_none() {
                return None;
            }

            if let Some(page) = high_candidate {
                if !self.inner.backend.is_page_mapped(page) {
                    return Some(page);
                }
                high = page.checked_add(page_size);
            }
            if let Some(page) = low_candidate {
                if !self.inner.backend.is_page_mapped(page) {
                    return Some(page);
                }
                low = page.checked_sub(page_size);
            }
        }
    }
}

impl<B: PageBackend> MemoryAllocator for PagedMemoryAllocator<B> {
    fn max_size(&self) -> usize {
        self.inner.page_size
    }

    fn allocate(&self, request: AllocationRequest) -> Result<Box<dyn Allocation>> {
        self.validate(&request)?;

        let mut pages = lock!(self.inner.pages);
        for page in pages.iter() {
            if page.executable != request.executable {
                continue;
            }
            if let Some(offset) = page.try_allocate(request.size, request.alignment)? {
                return Ok(self.make_allocation(page, offset, request.size));
            }
        }

        let base = self.inner.backend.map_page(request.executable)?;
        let page = Arc::new(Page::new(base, self.inner.page_size, request.executable));
        log::trace!("Mapped new page {:#x} (executable: {})", base, request.executable);
        PagedInner::<B>::insert_page(&mut pages, page.clone());

        let Some(offset) = page.try_allocate(request.size, request.alignment)? else {
            return Err(Error::Allocation(format!(
                "Fresh page could not satisfy {} bytes aligned to {}",
                request.size, request.alignment
            )));
        };
        Ok(self.make_allocation(&page, offset, request.size))
    }

    fn allocate_in_range(
        &self,
        request: PositionedAllocationRequest,
    ) -> Result<Box<dyn Allocation>> {
        if request.target < request.low || request.target > request.high {
            return Err(Error::InvalidArgument(format!(
                "Target {:#x} not within [{:#x}, {:#x}]",
                request.target, request.low, request.high
            )));
        }
        self.validate(&request.request)?;

        let page_size = self.inner.page_size;
        let low_page = self
            .inner
            .round_down(request.low.saturating_add(page_size - 1));
        let high_page = self.inner.round_down(request.high);
        let target_page = self.inner.round_down(request.target);

        let mut pages = lock!(self.inner.pages);

        // existing pages, nearest to the target first
        let mut candidates: Vec<&Arc<Page>> = pages
            .iter()
            .filter(|page| page.base >= low_page && page.base <= high_page)
            .collect();
        candidates.sort_by_key(|page| page.base.abs_diff(request.target));
        for page in candidates {
            if let Some(allocation) = self.try_with_page(page, &request)? {
                return Ok(allocation);
            }
        }

        let Some(free_page) = self.find_free_page(target_page, low_page, high_page) else {
            return Err(Error::Allocation(format!(
                "No free page within [{:#x}, {:#x}]",
                request.low, request.high
            )));
        };

        let base = self
            .inner
            .backend
            .map_page_at(free_page, request.request.executable)?;
        let page = Arc::new(Page::new(base, page_size, request.request.executable));
        log::trace!(
            "Mapped new page {:#x} near {:#x} (executable: {})",
            base,
            request.target,
            request.request.executable
        );
        PagedInner::<B>::insert_page(&mut pages, page.clone());
        drop(pages);

        match self.try_with_page(&page, &request)? {
            Some(allocation) => Ok(allocation),
            None => {
                self.inner.release_page(&page);
                Err(Error::Allocation(format!(
                    "Page {:#x} could not satisfy the request within [{:#x}, {:#x}]",
                    base, request.low, request.high
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    const PAGE: usize = 0x1000;

    /// Hands out fake addresses; nothing is ever dereferenced.
    #[derive(Default)]
    struct FakeBackend {
        mapped: Mutex<BTreeSet<usize>>,
        next: Mutex<usize>,
    }

    impl FakeBackend {
        fn with_mapped(pages: &[usize]) -> Self {
            FakeBackend {
                mapped: Mutex::new(pages.iter().copied().collect()),
                next: Mutex::new(0x7000_0000),
            }
        }
    }

    impl PageBackend for FakeBackend {
        fn page_size(&self) -> usize {
            PAGE
        }

        fn map_page(&self, _executable: bool) -> Result<usize> {
            let mut next = self.next.lock().unwrap();
            *next += PAGE;
            self.mapped.lock().unwrap().insert(*next);
            Ok(*next)
        }

        fn map_page_at(&self, address: usize, _executable: bool) -> Result<usize> {
            if !self.mapped.lock().unwrap().insert(address) {
                return Err(Error::Allocation("taken".to_string()));
            }
            Ok(address)
        }

        fn is_page_mapped(&self, address: usize) -> bool {
            self.mapped.lock().unwrap().contains(&address)
        }

        fn unmap_page(&self, address: usize) -> Result<()> {
            self.mapped.lock().unwrap().remove(&address);
            Ok(())
        }
    }

    #[test]
    fn blocks_share_a_page() {
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[]));
        let a = allocator.allocate(AllocationRequest::new(16)).unwrap();
        let b = allocator.allocate(AllocationRequest::new(16)).unwrap();

        assert_eq!(allocator.page_count().unwrap(), 1);
        assert_eq!(b.base(), a.base() + 16);
    }

    #[test]
    fn alignment_is_honoured() {
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[]));
        let _a = allocator.allocate(AllocationRequest::new(3)).unwrap();
        let b = allocator
            .allocate(AllocationRequest::new(8).with_alignment(64))
            .unwrap();
        assert_eq!(b.base() % 64, 0);

        // the gap before the aligned block is still usable
        let c = allocator
            .allocate(AllocationRequest::new(4).with_alignment(1))
            .unwrap();
        assert!(c.base() < b.base());
    }

    #[test]
    fn freed_blocks_coalesce_and_release_page() {
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[]));
        let a = allocator.allocate(AllocationRequest::new(PAGE / 2)).unwrap();
        let b = allocator.allocate(AllocationRequest::new(PAGE / 2)).unwrap();
        let page = a.base();
        assert!(allocator.backend().is_page_mapped(page));

        drop(a);
        assert_eq!(allocator.page_count().unwrap(), 1);
        drop(b);
        assert_eq!(allocator.page_count().unwrap(), 0);
        assert!(!allocator.backend().is_page_mapped(page));
    }

    #[test]
    fn executable_and_data_pages_are_separate() {
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[]));
        let code = allocator
            .allocate(AllocationRequest::new(16).executable())
            .unwrap();
        let data = allocator.allocate(AllocationRequest::new(16)).unwrap();

        assert!(code.is_executable());
        assert!(!data.is_executable());
        assert_eq!(allocator.page_count().unwrap(), 2);
    }

    #[test]
    fn oversized_requests_are_rejected() {
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[]));
        assert!(matches!(
            allocator.allocate(AllocationRequest::new(PAGE + 1)),
            Err(Error::Allocation(_))
        ));
        assert!(allocator.allocate(AllocationRequest::new(0)).is_err());
    }

    #[test]
    fn positioned_allocation_picks_nearest_free_page() {
        let target = 0x1000_0000;
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[
            target,
            target + PAGE,
        ]));

        let allocation = allocator
            .allocate_in_range(PositionedAllocationRequest {
                target: target + 0x10,
                low: target - 0x10_0000,
                high: target + 0x10_0000,
                request: AllocationRequest::new(8),
            })
            .unwrap();
        assert_eq!(allocation.base(), target - PAGE);

        // the page now exists and is reused for the next nearby request
        let next = allocator
            .allocate_in_range(PositionedAllocationRequest {
                target,
                low: target - 0x10_0000,
                high: target + 0x10_0000,
                request: AllocationRequest::new(8),
            })
            .unwrap();
        assert_eq!(next.base(), allocation.base() + 8);
    }

    #[test]
    fn positioned_allocation_fails_outside_bounds() {
        let target = 0x1000_0000;
        let allocator = PagedMemoryAllocator::new(FakeBackend::with_mapped(&[target]));

        let result = allocator.allocate_in_range(PositionedAllocationRequest {
            target,
            low: target,
            high: target + PAGE - 1,
            request: AllocationRequest::new(8),
        });
        assert!(matches!(result, Err(Error::Allocation(_))));

        let result = allocator.allocate_in_range(PositionedAllocationRequest {
            target: target - 1,
            low: target,
            high: target + PAGE,
            request: AllocationRequest::new(8),
        });
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
