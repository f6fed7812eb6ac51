//! Architecture providers.
//!
//! An [`Architecture`] knows how to encode an unconditional transfer from one code address to
//! another, how to retarget or grow such a patch, which compiler-generated stubs a method's entry
//! point may lead through, and how to build the small executable helpers the detour layer needs
//! (jump stubs, special entry stubs and relocated alternate entry points).
//!
//! # Key Components
//!
//! - [`Architecture`] - The provider interface
//! - [`NativeDetourInfo`] / [`DetourKind`] - A computed patch and its encoding
//! - [`JumpStub`] - An indirect jump whose target can be swapped with one atomic store
//! - [`X86_64Architecture`] - The x86_64 provider

mod alt_entry;
mod x86_64;

pub use alt_entry::AltEntryFactory;
pub use x86_64::X86_64Architecture;

use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use strum::{Display, EnumIter};

use crate::{
    pattern::BytePatternCollection,
    platform::{features::ArchitectureFeature, system::Allocation},
    Error, Result,
};

/// Instruction set architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum ArchitectureKind {
    /// 32-bit x86
    X86,
    /// x86_64 / AMD64
    X86_64,
    /// 32-bit ARM
    Arm,
    /// AArch64
    Arm64,
    /// Anything else
    Unknown,
}

impl ArchitectureKind {
    /// The architecture this crate was compiled for.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            ArchitectureKind::X86_64
        } else if cfg!(target_arch = "x86") {
            ArchitectureKind::X86
        } else if cfg!(target_arch = "arm") {
            ArchitectureKind::Arm
        } else if cfg!(target_arch = "aarch64") {
            ArchitectureKind::Arm64
        } else {
            ArchitectureKind::Unknown
        }
    }
}

/// The encoding of a native detour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum DetourKind {
    /// `jmp rel32`
    Rel32,
    /// `jmp [rip + rel32]` through a nearby pointer cell
    Rel32Ind64,
    /// `jmp [rip + 0]` followed by the absolute target
    Abs64,
}

impl DetourKind {
    /// Number of bytes the encoding overwrites at the source.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            DetourKind::Rel32 => 5,
            DetourKind::Rel32Ind64 => 6,
            DetourKind::Abs64 => 14,
        }
    }
}

/// A computed detour: where it goes, how it is encoded, and the out-of-line memory it needs.
pub struct NativeDetourInfo {
    from: usize,
    to: usize,
    kind: DetourKind,
    cell: Option<Box<dyn Allocation>>,
}

impl NativeDetourInfo {
    pub(crate) fn new(
        from: usize,
        to: usize,
        kind: DetourKind,
        cell: Option<Box<dyn Allocation>>,
    ) -> Self {
        NativeDetourInfo {
            from,
            to,
            kind,
            cell,
        }
    }

    /// The patched address.
    #[must_use]
    pub fn from(&self) -> usize {
        self.from
    }

    /// The target.
    #[must_use]
    pub fn to(&self) -> usize {
        self.to
    }

    /// The encoding.
    #[must_use]
    pub fn kind(&self) -> DetourKind {
        self.kind
    }

    /// Number of bytes overwritten at [`NativeDetourInfo::from`].
    #[must_use]
    pub fn size(&self) -> usize {
        self.kind.size()
    }

    /// Address of the pointer cell, for indirect encodings.
    #[must_use]
    pub fn cell_address(&self) -> Option<usize> {
        self.cell.as_ref().map(|cell| cell.base())
    }

    pub(crate) fn cell(&self) -> Option<&dyn Allocation> {
        self.cell.as_deref()
    }

    pub(crate) fn set_to(&mut self, to: usize) {
        self.to = to;
    }
}

impl fmt::Debug for NativeDetourInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDetourInfo")
            .field("from", &format_args!("{:#x}", self.from))
            .field("to", &format_args!("{:#x}", self.to))
            .field("kind", &self.kind)
            .field("cell", &self.cell_address().map(|cell| format!("{cell:#x}")))
            .finish()
    }
}

/// What a retarget requires of the caller.
#[derive(Debug)]
pub enum Retarget {
    /// The existing patch now leads to the new target; nothing to write at the source
    InPlace,
    /// The source must be repatched with the bytes of this new detour, which replaces the old one
    Repatch(NativeDetourInfo),
}

/// A small executable stub that jumps through a pointer cell. Retargeting is one atomic store,
/// so threads executing the stub never see a torn target.
pub struct JumpStub {
    allocation: Box<dyn Allocation>,
    cell_offset: usize,
}

impl JumpStub {
    /// Writes `code` into `allocation` and stores `target` in the cell at `cell_offset`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the cell is misaligned or does not fit.
    pub fn new(
        allocation: Box<dyn Allocation>,
        code: &[u8],
        cell_offset: usize,
        target: usize,
    ) -> Result<Self> {
        let cell = allocation.base() + cell_offset;
        if cell % std::mem::align_of::<usize>() != 0
            || cell_offset + std::mem::size_of::<usize>() > allocation.size()
        {
            return Err(Error::InvalidArgument(format!(
                "Jump stub cell at offset {cell_offset} is misaligned or out of bounds"
            )));
        }

        allocation.write(0, code)?;
        let stub = JumpStub {
            allocation,
            cell_offset,
        };
        stub.retarget(target);
        Ok(stub)
    }

    /// Address to jump or call to.
    #[must_use]
    pub fn entry(&self) -> usize {
        self.allocation.base()
    }

    /// Current target.
    #[must_use]
    pub fn target(&self) -> usize {
        // SAFETY: the cell was checked to be aligned and inside the allocation
        unsafe { load_cell(self.allocation.base() + self.cell_offset) }
    }

    /// Points the stub at `target`.
    pub fn retarget(&self, target: usize) {
        // SAFETY: the cell was checked to be aligned and inside the allocation
        unsafe { store_cell(self.allocation.base() + self.cell_offset, target) };
    }
}

impl fmt::Debug for JumpStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JumpStub")
            .field("entry", &format_args!("{:#x}", self.entry()))
            .field("target", &format_args!("{:#x}", self.target()))
            .finish()
    }
}

/// Atomically stores a pointer into an aligned cell.
///
/// # Safety
/// `cell` must be a live, writable, pointer-aligned address.
pub(crate) unsafe fn store_cell(cell: usize, value: usize) {
    (*(cell as *const AtomicUsize)).store(value, Ordering::SeqCst);
}

/// Atomically loads a pointer from an aligned cell.
///
/// # Safety
/// `cell` must be a live, readable, pointer-aligned address.
pub(crate) unsafe fn load_cell(cell: usize) -> usize {
    (*(cell as *const AtomicUsize)).load(Ordering::SeqCst)
}

/// An instruction set provider.
pub trait Architecture: Send + Sync {
    /// The instruction set this provider targets.
    fn kind(&self) -> ArchitectureKind;

    /// Optional capabilities.
    fn features(&self) -> ArchitectureFeature;

    /// Patterns of the stubs a method entry point may lead through before its real body.
    fn known_method_thunks(&self) -> &BytePatternCollection;

    /// Chooses the smallest encoding that redirects `from` to `to` within `max_size` bytes
    /// (unbounded if `None`), allocating an out-of-line cell if the encoding needs one.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for `from == to`.
    ///
    /// # Safety
    /// `from` must point to readable code; the bytes just past the smallest encoding are
    /// inspected.
    unsafe fn compute_detour_info(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<NativeDetourInfo>;

    /// Produces the bytes to write at the source of `info`, and initialises its cell.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if an indirect encoding has no cell or a displacement no
    /// longer fits.
    fn detour_bytes(&self, info: &NativeDetourInfo) -> Result<Vec<u8>>;

    /// Redirects an existing detour to `to`.
    ///
    /// Encodings that can reach `to` are updated in place (the cell of an indirect detour is
    /// rewritten, `info` is updated). Otherwise a new detour is computed with `max_size` as the
    /// size hint and returned for the caller to patch.
    ///
    /// # Errors
    /// Propagates failures from [`Architecture::compute_detour_info`].
    ///
    /// # Safety
    /// Same as [`Architecture::compute_detour_info`] for the source of `info`.
    unsafe fn retarget(
        &self,
        info: &mut NativeDetourInfo,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<Retarget>;

    /// Builds an alternate entry point for the code at `entry`: a relocated copy of the
    /// instructions covering at least `min_length` bytes followed by a jump back past them.
    ///
    /// # Errors
    /// Returns [`Error::FeatureNotSupported`] unless the provider has
    /// [`ArchitectureFeature::CREATE_ALT_ENTRY_POINT`], and [`Error::Encoding`] if the code
    /// cannot be relocated.
    ///
    /// # Safety
    /// `entry` must point to decodable code that is not being patched concurrently.
    unsafe fn create_alt_entry(
        &self,
        entry: usize,
        min_length: usize,
    ) -> Result<Box<dyn Allocation>> {
        let _ = (entry, min_length);
        Err(Error::FeatureNotSupported("alternate entry points"))
    }

    /// Builds a stub that loads `argument` into the first scratch register and jumps to `target`.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`] if no executable memory is available.
    fn create_special_entry_stub(&self, target: usize, argument: usize)
        -> Result<Box<dyn Allocation>>;

    /// Builds a retargetable [`JumpStub`] leading to `target`.
    ///
    /// # Errors
    /// Returns [`Error::Allocation`] if no executable memory is available.
    fn create_jump_stub(&self, target: usize) -> Result<JumpStub>;
}
