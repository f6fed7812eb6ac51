//! Operating system providers.
//!
//! A [`System`] owns everything that touches the address space: executable memory allocation,
//! page protection, patching code with backup capture, module enumeration and probing how much
//! memory is readable at an address.
//!
//! # Key Components
//!
//! - [`System`] - The provider interface
//! - [`MemoryAllocator`] / [`Allocation`] - Executable memory handed out to detours and stubs
//! - [`PagedMemoryAllocator`] - Sub-page allocator shared by the concrete providers
//! - [`ReadableMemory`] - Repeated readability queries against one look at the address space
//! - [`LinuxSystem`] - The Linux provider

mod paged;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{read_memory_map, LinuxSystem, MemoryMapSnapshot, MemoryRegion, MmapBackend};
pub use paged::{PageAllocation, PageBackend, PagedMemoryAllocator};

use std::{fmt, path::PathBuf};

use bitflags::bitflags;
use strum::{Display, EnumIter};

use crate::{
    platform::{abi::Abi, features::SystemFeature},
    Result,
};

/// Operating systems with a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum OsKind {
    /// Linux
    Linux,
    /// macOS
    MacOS,
    /// Windows
    Windows,
    /// Anything else
    Unknown,
}

impl OsKind {
    /// The operating system this crate was compiled for.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            OsKind::Linux
        } else if cfg!(target_os = "macos") {
            OsKind::MacOS
        } else if cfg!(target_os = "windows") {
            OsKind::Windows
        } else {
            OsKind::Unknown
        }
    }
}

bitflags! {
    /// Page access permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryProtection: u32 {
        /// Readable
        const READ = 0b001;
        /// Writable
        const WRITE = 0b010;
        /// Executable
        const EXECUTE = 0b100;

        /// Read and write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Read, write and execute
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// What kind of memory a patch targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum PatchTargetKind {
    /// Code; stays executable while being written
    Executable,
    /// Data that is normally read-only
    ReadOnly,
}

/// A module (executable or shared object) mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    /// Path of the backing file
    pub path: PathBuf,
    /// Lowest mapped address
    pub base: usize,
    /// Distance from `base` to the end of the highest mapping
    pub size: usize,
}

/// A request for a block of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Number of bytes
    pub size: usize,
    /// Required alignment of the block start
    pub alignment: usize,
    /// Whether the memory must be executable
    pub executable: bool,
}

impl AllocationRequest {
    /// A request for `size` bytes aligned to 8, not executable.
    #[must_use]
    pub fn new(size: usize) -> Self {
        AllocationRequest {
            size,
            alignment: 8,
            executable: false,
        }
    }

    /// Changes the alignment.
    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Marks the request as executable.
    #[must_use]
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

/// A request for memory placed as close as possible to `target`, within `[low, high]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionedAllocationRequest {
    /// Preferred address
    pub target: usize,
    /// Lowest acceptable address
    pub low: usize,
    /// Highest acceptable address
    pub high: usize,
    /// Size and kind of the block
    pub request: AllocationRequest,
}

/// A block of memory handed out by a [`MemoryAllocator`]. Dropping it returns the memory.
pub trait Allocation: Send + Sync + fmt::Debug {
    /// Start address of the block.
    fn base(&self) -> usize;

    /// Size of the block in bytes.
    fn size(&self) -> usize;

    /// Whether the block is executable.
    fn is_executable(&self) -> bool;

    /// Copies `data` into the block at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] if the write does not fit the block.
    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len()).map_or(true, |end| end > self.size()) {
            return Err(crate::Error::InvalidArgument(format!(
                "Write of {} bytes at offset {} exceeds allocation of {} bytes",
                data.len(),
                offset,
                self.size()
            )));
        }

        // SAFETY: the block is owned by this allocation, writable, and the range was checked
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.base() + offset) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }
}

/// Allocator for small blocks of (executable) memory.
pub trait MemoryAllocator: Send + Sync {
    /// The largest single allocation supported.
    fn max_size(&self) -> usize;

    /// Allocates a block anywhere.
    ///
    /// # Errors
    /// Returns [`crate::Error::Allocation`] if no memory could be obtained.
    fn allocate(&self, request: AllocationRequest) -> Result<Box<dyn Allocation>>;

    /// Allocates a block within a range, preferring addresses close to the target.
    ///
    /// # Errors
    /// Returns [`crate::Error::Allocation`] if no memory in range is available; callers usually
    /// fall back to an encoding that does not need a nearby block.
    fn allocate_in_range(&self, request: PositionedAllocationRequest)
        -> Result<Box<dyn Allocation>>;
}

/// Readable memory as seen by [`System::readable_memory`].
pub trait ReadableMemory {
    /// See [`System::readable_length`].
    fn readable_length(&self, start: usize, guess: usize) -> usize;
}

impl<F: Fn(usize, usize) -> usize> ReadableMemory for F {
    fn readable_length(&self, start: usize, guess: usize) -> usize {
        self(start, guess)
    }
}

/// An operating system provider.
pub trait System: Send + Sync {
    /// The operating system this provider targets.
    fn kind(&self) -> OsKind;

    /// Optional capabilities.
    fn features(&self) -> SystemFeature;

    /// The platform calling convention, if the system defines one for this architecture.
    fn default_abi(&self) -> Option<Abi>;

    /// Size of a memory page.
    fn page_size(&self) -> usize;

    /// The allocator for stubs and detour cells.
    fn memory_allocator(&self) -> &dyn MemoryAllocator;

    /// Lists the modules mapped into the process.
    ///
    /// # Errors
    /// Returns [`crate::Error::Io`] if the process memory map cannot be read.
    fn enumerate_loaded_modules(&self) -> Result<Vec<LoadedModule>>;

    /// Number of contiguous readable bytes at `start`, probing at most until `guess` bytes are
    /// known readable. Returns 0 if `start` itself is not readable.
    fn readable_length(&self, start: usize, guess: usize) -> usize;

    /// Answers [`System::readable_length`] from one look at the address space, for callers
    /// that ask repeatedly. Memory mapped or unmapped afterwards is misreported.
    ///
    /// Defaults to asking [`System::readable_length`] every time.
    fn readable_memory(&self) -> Box<dyn ReadableMemory + '_> {
        Box::new(move |start: usize, guess: usize| self.readable_length(start, guess))
    }

    /// Changes the protection of the pages covering `[address, address + len)`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Protection`] if the OS rejects the change.
    ///
    /// # Safety
    /// Removing access from memory that is in use makes later accesses fault.
    unsafe fn change_protection(
        &self,
        address: usize,
        len: usize,
        protection: MemoryProtection,
    ) -> Result<()>;

    /// Writes `data` to `target`, copying the bytes it replaces into `backup` first.
    ///
    /// Page permissions are widened for the write and restored afterwards.
    ///
    /// # Errors
    /// Returns [`crate::Error::Protection`] if permissions cannot be changed.
    ///
    /// # Safety
    /// `target` must point to `data.len()` bytes of mapped memory that no other thread executes
    /// in a torn state while it is rewritten.
    unsafe fn patch_data(
        &self,
        kind: PatchTargetKind,
        target: usize,
        data: &[u8],
        backup: Option<&mut [u8]>,
    ) -> Result<()>;
}
