//! Interpretation of addresses captured by byte patterns.
//!
//! A [`crate::pattern::BytePattern`] captures raw address bytes out of a code stub. On its own
//! that value is meaningless: it may be an absolute pointer, a displacement relative to some
//! instruction, a pointer to a cell that holds the real pointer, or a marker that the stub is a
//! runtime fixup thunk which must be compiled before it leads anywhere. [`AddressKind`] names
//! those shapes and [`AddressMeaning`] turns a captured value into a usable target address.

use std::fmt;

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// The shape of an address captured from machine code.
    ///
    /// Relative 32-bit is the all-clear value and available as [`AddressKind::REL32`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AddressKind: u32 {
        /// The address is absolute rather than relative
        const ABSOLUTE = 0b0001;
        /// The address is 64 bits wide rather than 32
        const IS_64BIT = 0b0010;
        /// The stub is a runtime fixup thunk; the method needs compiling before the target is valid
        const PRECODE_FIXUP = 0b0100;
        /// The computed address points at a pointer-sized cell holding the real target
        const INDIRECT = 0b1000;

        /// 64-bit relative displacement
        const REL64 = Self::IS_64BIT.bits();
        /// 32-bit absolute address
        const ABS32 = Self::ABSOLUTE.bits();
        /// 64-bit absolute address
        const ABS64 = Self::ABSOLUTE.bits() | Self::IS_64BIT.bits();
        /// Fixup thunk with a 32-bit relative displacement
        const PRECODE_FIXUP_REL32 = Self::PRECODE_FIXUP.bits();
        /// Fixup thunk with a 64-bit relative displacement
        const PRECODE_FIXUP_REL64 = Self::PRECODE_FIXUP.bits() | Self::IS_64BIT.bits();
        /// Fixup thunk with a 32-bit absolute address
        const PRECODE_FIXUP_ABS32 = Self::PRECODE_FIXUP.bits() | Self::ABSOLUTE.bits();
        /// Fixup thunk with a 64-bit absolute address
        const PRECODE_FIXUP_ABS64 = Self::PRECODE_FIXUP.bits() | Self::ABS64.bits();
    }
}

impl AddressKind {
    /// 32-bit relative displacement.
    pub const REL32: AddressKind = AddressKind::empty();

    /// Validates a raw kind value, rejecting unknown bits.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `raw` carries bits outside the four known fields.
    pub fn from_raw(raw: u32) -> Result<Self> {
        AddressKind::from_bits(raw).ok_or_else(|| malformed_error!("Invalid address kind {:#x}", raw))
    }

    /// `true` for displacements.
    #[must_use]
    pub fn is_relative(self) -> bool {
        !self.contains(AddressKind::ABSOLUTE)
    }

    /// `true` for absolute addresses.
    #[must_use]
    pub fn is_absolute(self) -> bool {
        self.contains(AddressKind::ABSOLUTE)
    }

    /// `true` if the address is 32 bits wide.
    #[must_use]
    pub fn is_32bit(self) -> bool {
        !self.contains(AddressKind::IS_64BIT)
    }

    /// `true` if the address is 64 bits wide.
    #[must_use]
    pub fn is_64bit(self) -> bool {
        self.contains(AddressKind::IS_64BIT)
    }

    /// `true` if the matched stub is a fixup thunk.
    #[must_use]
    pub fn is_precode_fixup(self) -> bool {
        self.contains(AddressKind::PRECODE_FIXUP)
    }

    /// `true` if the target must be read through a pointer cell.
    #[must_use]
    pub fn is_indirect(self) -> bool {
        self.contains(AddressKind::INDIRECT)
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.is_precode_fixup() { "PrecodeFixupThunk" } else { "" },
            if self.is_relative() { "Rel" } else { "Abs" },
            if self.is_32bit() { "32" } else { "64" },
            if self.is_indirect() { "Indirect" } else { "" }
        )
    }
}

/// How a captured address is turned into a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressMeaning {
    kind: AddressKind,
    relative_to_offset: usize,
}

impl AddressMeaning {
    /// Creates the meaning of an absolute address.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `kind` is relative; relative kinds need an offset,
    /// see [`AddressMeaning::relative`].
    pub fn absolute(kind: AddressKind) -> Result<Self> {
        if !kind.is_absolute() {
            return Err(malformed_error!(
                "Address kind {} is relative, an offset is required",
                kind
            ));
        }

        Ok(AddressMeaning {
            kind,
            relative_to_offset: 0,
        })
    }

    /// Creates the meaning of a displacement, measured from `relative_to_offset` bytes past the
    /// start of the match.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `kind` is absolute or the offset is negative.
    pub fn relative(kind: AddressKind, relative_to_offset: i32) -> Result<Self> {
        if !kind.is_relative() {
            return Err(malformed_error!(
                "Address kind {} is absolute, it cannot have an offset",
                kind
            ));
        }
        let Ok(relative_to_offset) = usize::try_from(relative_to_offset) else {
            return Err(malformed_error!(
                "Relative address offset must be positive, got {}",
                relative_to_offset
            ));
        };

        Ok(AddressMeaning {
            kind,
            relative_to_offset,
        })
    }

    /// The kind of address this meaning interprets.
    #[must_use]
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Offset from the start of the match that displacements are measured from.
    #[must_use]
    pub fn relative_to_offset(&self) -> usize {
        self.relative_to_offset
    }

    /// Computes the target described by `address`, captured from a match that began `offset`
    /// bytes past `base`. Indirect kinds are read through without touching memory.
    ///
    /// This is the address of the pointer cell for indirect kinds; see
    /// [`AddressMeaning::process_address`] to also follow it.
    #[must_use]
    pub fn compute_target(&self, base: usize, offset: usize, address: u64) -> usize {
        if self.kind.is_absolute() {
            return address as usize;
        }

        let displacement = if self.kind.is_32bit() {
            i64::from(address as u32 as i32)
        } else {
            address as i64
        };
        let anchor = base
            .wrapping_add(offset)
            .wrapping_add(self.relative_to_offset);
        anchor.wrapping_add(displacement as isize as usize)
    }

    /// Computes the final target described by `address`, following the pointer cell for indirect
    /// kinds.
    ///
    /// # Safety
    /// For indirect kinds the computed cell address is dereferenced; the caller must guarantee
    /// that the captured stub really refers to a readable, pointer-sized cell.
    #[must_use]
    pub unsafe fn process_address(&self, base: usize, offset: usize, address: u64) -> usize {
        let target = self.compute_target(base, offset, address);
        if self.kind.is_indirect() {
            std::ptr::read_unaligned(target as *const usize)
        } else {
            target
        }
    }
}
