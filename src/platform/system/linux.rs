//! The Linux system provider.
//!
//! Executable memory comes from anonymous `mmap` pages, protection changes go through
//! `mprotect`, and everything that needs to know about the existing address space (module list,
//! readable ranges, the protection a patched page had before) reads `/proc/self/maps`.

use std::{
    fs,
    io,
    path::PathBuf,
    sync::Mutex,
};

use crate::{
    platform::{
        abi::Abi,
        features::SystemFeature,
        system::{
            LoadedModule, MemoryAllocator, MemoryProtection, OsKind, PageBackend,
            PagedMemoryAllocator, PatchTargetKind, ReadableMemory, System,
        },
    },
    Error, Result,
};

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First address of the mapping
    pub start: usize,
    /// One past the last address of the mapping
    pub end: usize,
    /// Current access permissions
    pub protection: MemoryProtection,
    /// Whether the mapping is private (copy-on-write)
    pub private: bool,
    /// Backing file, for file mappings
    pub path: Option<PathBuf>,
}

impl MemoryRegion {
    fn parse(line: &str) -> Option<MemoryRegion> {
        let mut columns = line.split_ascii_whitespace();
        let range = columns.next()?;
        let perms = columns.next()?.as_bytes();
        // offset, device, inode
        let path = columns.nth(3).filter(|path| path.starts_with('/'));

        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if perms.len() < 4 {
            return None;
        }

        let mut protection = MemoryProtection::empty();
        protection.set(MemoryProtection::READ, perms[0] == b'r');
        protection.set(MemoryProtection::WRITE, perms[1] == b'w');
        protection.set(MemoryProtection::EXECUTE, perms[2] == b'x');

        Some(MemoryRegion {
            start,
            end,
            protection,
            private: perms[3] == b'p',
            path: path.map(PathBuf::from),
        })
    }

    /// `true` if `address` lies within the region.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address < self.end
    }
}

/// Regions of `/proc/self/maps` read once, answering readability queries without rereading.
#[derive(Debug, Clone, Default)]
pub struct MemoryMapSnapshot {
    regions: Vec<MemoryRegion>,
}

impl MemoryMapSnapshot {
    /// Reads the current memory map.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if `/proc/self/maps` cannot be read.
    pub fn capture() -> Result<Self> {
        Ok(MemoryMapSnapshot {
            regions: read_memory_map()?,
        })
    }

    /// The captured regions, sorted by address.
    #[must_use]
    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

impl ReadableMemory for MemoryMapSnapshot {
    fn readable_length(&self, start: usize, guess: usize) -> usize {
        let mut known = 0;
        let mut cursor = start;
        while known < guess {
            let Some(region) = self.regions.iter().find(|region| region.contains(cursor)) else {
                break;
            };
            if !region.protection.contains(MemoryProtection::READ) {
                break;
            }
            known += region.end - cursor;
            cursor = region.end;
        }
        known
    }
}

/// Reads and parses `/proc/self/maps`. Regions are sorted by address.
///
/// # Errors
/// Returns [`Error::Io`] if the file cannot be read.
pub fn read_memory_map() -> Result<Vec<MemoryRegion>> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    Ok(maps.lines().filter_map(MemoryRegion::parse).collect())
}

fn to_prot(protection: MemoryProtection) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(MemoryProtection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(MemoryProtection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(MemoryProtection::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn query_page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(0x1000)
}

/// Pages from anonymous private mappings.
#[derive(Debug)]
pub struct MmapBackend {
    page_size: usize,
}

impl MmapBackend {
    /// Creates a backend using the system page size.
    #[must_use]
    pub fn new() -> Self {
        MmapBackend {
            page_size: query_page_size(),
        }
    }

    fn prot(executable: bool) -> libc::c_int {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        if executable {
            prot | libc::PROT_EXEC
        } else {
            prot
        }
    }
}

impl Default for MmapBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBackend for MmapBackend {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_page(&self, executable: bool) -> Result<usize> {
        // SAFETY: a fresh anonymous mapping does not alias anything
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.page_size,
                Self::prot(executable),
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Allocation(format!(
                "mmap failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(ptr as usize)
    }

    fn map_page_at(&self, address: usize, executable: bool) -> Result<usize> {
        // SAFETY: MAP_FIXED_NOREPLACE never replaces an existing mapping
        let ptr = unsafe {
            libc::mmap(
                address as *mut libc::c_void,
                self.page_size,
                Self::prot(executable),
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Allocation(format!(
                "mmap at {:#x} failed: {}",
                address,
                io::Error::last_os_error()
            )));
        }
        if ptr as usize != address {
            // kernels without MAP_FIXED_NOREPLACE treat the address as a hint
            // SAFETY: the mapping was just created by us
            unsafe { libc::munmap(ptr, self.page_size) };
            return Err(Error::Allocation(format!(
                "mmap placed page at {:#x} instead of {:#x}",
                ptr as usize, address
            )));
        }
        Ok(address)
    }

    fn is_page_mapped(&self, address: usize) -> bool {
        let mut residency = 0u8;
        // SAFETY: mincore only inspects the mapping and writes one byte for one page
        let result =
            unsafe { libc::mincore(address as *mut libc::c_void, 1, &mut residency) };
        if result == 0 {
            return true;
        }

        match io::Error::last_os_error().raw_os_error() {
            Some(libc::ENOMEM) => false,
            _ => read_memory_map()
                .map(|regions| regions.iter().any(|region| region.contains(address)))
                .unwrap_or(true),
        }
    }

    fn unmap_page(&self, address: usize) -> Result<()> {
        // SAFETY: the page was mapped by this backend and holds no live allocations
        if unsafe { libc::munmap(address as *mut libc::c_void, self.page_size) } != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// The Linux system provider.
pub struct LinuxSystem {
    page_size: usize,
    allocator: PagedMemoryAllocator<MmapBackend>,
    // serialises protection changes so a patch never restores a page another patch widened
    patch_lock: Mutex<()>,
}

impl LinuxSystem {
    /// Creates the provider.
    #[must_use]
    pub fn new() -> Self {
        let backend = MmapBackend::new();
        LinuxSystem {
            page_size: backend.page_size(),
            allocator: PagedMemoryAllocator::new(backend),
            patch_lock: Mutex::new(()),
        }
    }

    fn round_to_pages(&self, address: usize, len: usize) -> (usize, usize) {
        let start = address & !(self.page_size - 1);
        let end = (address + len.max(1)).next_multiple_of(self.page_size);
        (start, end - start)
    }

    unsafe fn protect(&self, address: usize, len: usize, protection: MemoryProtection) -> Result<()> {
        if libc::mprotect(address as *mut libc::c_void, len, to_prot(protection)) != 0 {
            return Err(Error::Protection {
                address,
                len,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// The current protection of every mapped region overlapping the page range.
    fn original_protections(&self, start: usize, len: usize) -> Result<Vec<(usize, usize, MemoryProtection)>> {
        let end = start + len;
        let mut protections = Vec::new();
        for region in read_memory_map()? {
            if region.end <= start || region.start >= end {
                continue;
            }
            let from = region.start.max(start);
            let to = region.end.min(end);
            protections.push((from, to - from, region.protection));
        }

        let covered: usize = protections.iter().map(|(_, len, _)| len).sum();
        if covered != len {
            return Err(Error::Protection {
                address: start,
                len,
                source: io::Error::new(io::ErrorKind::NotFound, "range is not fully mapped"),
            });
        }
        Ok(protections)
    }
}

impl Default for LinuxSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for LinuxSystem {
    fn kind(&self) -> OsKind {
        OsKind::Linux
    }

    fn features(&self) -> SystemFeature {
        SystemFeature::RWX_PAGES | SystemFeature::RX_PAGES
    }

    fn default_abi(&self) -> Option<Abi> {
        if cfg!(target_arch = "x86_64") {
            Some(Abi::system_v_amd64())
        } else {
            None
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn memory_allocator(&self) -> &dyn MemoryAllocator {
        &self.allocator
    }

    fn enumerate_loaded_modules(&self) -> Result<Vec<LoadedModule>> {
        let mut modules: Vec<LoadedModule> = Vec::new();
        for region in read_memory_map()? {
            let Some(path) = region.path else {
                continue;
            };

            match modules.iter_mut().find(|module| module.path == path) {
                Some(module) => {
                    let end = (module.base + module.size).max(region.end);
                    module.base = module.base.min(region.start);
                    module.size = end - module.base;
                }
                None => modules.push(LoadedModule {
                    path,
                    base: region.start,
                    size: region.end - region.start,
                }),
            }
        }
        Ok(modules)
    }

    fn readable_length(&self, start: usize, guess: usize) -> usize {
        self.readable_memory().readable_length(start, guess)
    }

    fn readable_memory(&self) -> Box<dyn ReadableMemory + '_> {
        match MemoryMapSnapshot::capture() {
            Ok(snapshot) => Box::new(snapshot),
            Err(e) => {
                log::debug!("Cannot read the memory map, treating memory as unreadable: {e}");
                Box::new(MemoryMapSnapshot::default())
            }
        }
    }

    unsafe fn change_protection(
        &self,
        address: usize,
        len: usize,
        protection: MemoryProtection,
    ) -> Result<()> {
        let (start, len) = self.round_to_pages(address, len);
        let _guard = lock!(self.patch_lock);
        self.protect(start, len, protection)
    }

    unsafe fn patch_data(
        &self,
        kind: PatchTargetKind,
        target: usize,
        data: &[u8],
        backup: Option<&mut [u8]>,
    ) -> Result<()> {
        let (start, len) = self.round_to_pages(target, data.len());
        let _guard = lock!(self.patch_lock);

        let original = self.original_protections(start, len)?;
        let writable = match kind {
            PatchTargetKind::Executable => MemoryProtection::READ_WRITE_EXECUTE,
            PatchTargetKind::ReadOnly => MemoryProtection::READ_WRITE,
        };
        self.protect(start, len, writable)?;

        let destination = target as *mut u8;
        if let Some(backup) = backup {
            let count = backup.len().min(data.len());
            std::ptr::copy_nonoverlapping(destination, backup.as_mut_ptr(), count);
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), destination, data.len());

        for (address, len, protection) in original {
            if protection != writable {
                self.protect(address, len, protection)?;
            }
        }

        log::trace!("Patched {} bytes at {:#x}", data.len(), target);
        Ok(())
    }
}
