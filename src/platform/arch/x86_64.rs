use std::sync::Arc;

use crate::{
    pattern::{
        AddressKind, AddressMeaning, BytePattern, BytePatternCollection, ADDRESS, ANY, B_ADDRESS,
        B_ANY,
    },
    platform::{
        arch::{
            store_cell, AltEntryFactory, Architecture, ArchitectureKind, DetourKind, JumpStub,
            NativeDetourInfo, Retarget,
        },
        features::ArchitectureFeature,
        system::{Allocation, AllocationRequest, PositionedAllocationRequest, System},
    },
    Error, Result,
};

/// `pop rdi`; a rel32 jump followed by this byte looks like a runtime thunk
const POP_RDI: u8 = 0x5f;

const JMP_REL32: u8 = 0xe9;
const JMP_INDIRECT: [u8; 2] = [0xff, 0x25];

const JUMP_STUB: [u8; 8] = [0xff, 0x25, 0x02, 0x00, 0x00, 0x00, 0xcc, 0xcc];
const JUMP_STUB_CELL: usize = 8;

const SPECIAL_ENTRY_STUB: [u8; 23] = [
    0x48, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mov rax, argument
    0x49, 0xba, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mov r10, target
    0x41, 0xff, 0xe2, // jmp r10
];
const SPECIAL_ENTRY_ARGUMENT: usize = 2;
const SPECIAL_ENTRY_TARGET: usize = 12;

/// The x86_64 provider.
pub struct X86_64Architecture {
    system: Arc<dyn System>,
    thunks: BytePatternCollection,
    alt_entry: AltEntryFactory,
}

impl X86_64Architecture {
    /// Creates the provider, allocating through `system`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the built-in thunk table fails to build.
    pub fn new(system: Arc<dyn System>) -> Result<Self> {
        Ok(X86_64Architecture {
            alt_entry: AltEntryFactory::new(system.clone(), 64),
            thunks: known_method_thunks()?,
            system,
        })
    }

    fn allocate_cell_near(&self, from: usize) -> Result<Box<dyn Allocation>> {
        let anchor = from.wrapping_add(DetourKind::Rel32Ind64.size());
        let reach = 1usize << 31;
        let request = PositionedAllocationRequest {
            target: anchor,
            low: anchor.saturating_sub(reach),
            high: anchor.saturating_add(reach - 1),
            request: AllocationRequest::new(std::mem::size_of::<usize>()),
        };
        self.system.memory_allocator().allocate_in_range(request)
    }
}

/// Displacement of `to` from the end of an instruction of `len` bytes at `from`, if it fits.
fn rel32(from: usize, len: usize, to: usize) -> Option<i32> {
    let next = from as i128 + len as i128;
    i32::try_from(to as i128 - next).ok()
}

impl Architecture for X86_64Architecture {
    fn kind(&self) -> ArchitectureKind {
        ArchitectureKind::X86_64
    }

    fn features(&self) -> ArchitectureFeature {
        ArchitectureFeature::IMMEDIATE64 | ArchitectureFeature::CREATE_ALT_ENTRY_POINT
    }

    fn known_method_thunks(&self) -> &BytePatternCollection {
        &self.thunks
    }

    unsafe fn compute_detour_info(
        &self,
        from: usize,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<NativeDetourInfo> {
        if from == to {
            return Err(Error::InvalidArgument(format!(
                "Cannot detour {from:#x} to itself"
            )));
        }
        let max_size = max_size.unwrap_or(usize::MAX);

        if max_size >= DetourKind::Rel32.size()
            && rel32(from, DetourKind::Rel32.size(), to).is_some()
            && std::ptr::read_volatile((from + DetourKind::Rel32.size()) as *const u8) != POP_RDI
        {
            return Ok(NativeDetourInfo::new(from, to, DetourKind::Rel32, None));
        }

        if max_size >= DetourKind::Rel32Ind64.size() {
            match self.allocate_cell_near(from) {
                Ok(cell) => {
                    return Ok(NativeDetourInfo::new(
                        from,
                        to,
                        DetourKind::Rel32Ind64,
                        Some(cell),
                    ))
                }
                Err(error) => log::debug!("No pointer cell near {:#x}: {}", from, error),
            }
        }

        if max_size < DetourKind::Abs64.size() {
            log::warn!(
                "No detour encoding fits in {} bytes at {:#x}; using Abs64",
                max_size,
                from
            );
        }
        Ok(NativeDetourInfo::new(from, to, DetourKind::Abs64, None))
    }

    fn detour_bytes(&self, info: &NativeDetourInfo) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(info.size());
        match info.kind() {
            DetourKind::Rel32 => {
                let Some(displacement) = rel32(info.from(), info.size(), info.to()) else {
                    return Err(Error::InvalidState(format!(
                        "{:#x} is out of rel32 range of {:#x}",
                        info.to(),
                        info.from()
                    )));
                };
                bytes.push(JMP_REL32);
                bytes.extend_from_slice(&displacement.to_le_bytes());
            }
            DetourKind::Rel32Ind64 => {
                let Some(cell) = info.cell() else {
                    return Err(Error::InvalidState(
                        "Rel32Ind64 detour without a pointer cell".to_string(),
                    ));
                };
                let Some(displacement) = rel32(info.from(), info.size(), cell.base()) else {
                    return Err(Error::InvalidState(format!(
                        "Pointer cell {:#x} is out of rel32 range of {:#x}",
                        cell.base(),
                        info.from()
                    )));
                };
                // SAFETY: the cell is a live, pointer-sized and pointer-aligned allocation
                unsafe { store_cell(cell.base(), info.to()) };
                bytes.extend_from_slice(&JMP_INDIRECT);
                bytes.extend_from_slice(&displacement.to_le_bytes());
            }
            DetourKind::Abs64 => {
                bytes.extend_from_slice(&JMP_INDIRECT);
                bytes.extend_from_slice(&0i32.to_le_bytes());
                bytes.extend_from_slice(&(info.to() as u64).to_le_bytes());
            }
        }
        Ok(bytes)
    }

    unsafe fn retarget(
        &self,
        info: &mut NativeDetourInfo,
        to: usize,
        max_size: Option<usize>,
    ) -> Result<Retarget> {
        match info.kind() {
            DetourKind::Rel32Ind64 => {
                if let Some(cell) = info.cell() {
                    store_cell(cell.base(), to);
                    info.set_to(to);
                    return Ok(Retarget::InPlace);
                }
            }
            DetourKind::Rel32 => {
                if rel32(info.from(), info.size(), to).is_some() {
                    return Ok(Retarget::Repatch(NativeDetourInfo::new(
                        info.from(),
                        to,
                        DetourKind::Rel32,
                        None,
                    )));
                }
            }
            DetourKind::Abs64 => {
                return Ok(Retarget::Repatch(NativeDetourInfo::new(
                    info.from(),
                    to,
                    DetourKind::Abs64,
                    None,
                )));
            }
        }

        Ok(Retarget::Repatch(
            self.compute_detour_info(info.from(), to, max_size)?,
        ))
    }

    unsafe fn create_alt_entry(
        &self,
        entry: usize,
        min_length: usize,
    ) -> Result<Box<dyn Allocation>> {
        self.alt_entry.create(entry, min_length)
    }

    fn create_special_entry_stub(
        &self,
        target: usize,
        argument: usize,
    ) -> Result<Box<dyn Allocation>> {
        let mut stub = SPECIAL_ENTRY_STUB;
        stub[SPECIAL_ENTRY_ARGUMENT..SPECIAL_ENTRY_ARGUMENT + 8]
            .copy_from_slice(&(argument as u64).to_le_bytes());
        stub[SPECIAL_ENTRY_TARGET..SPECIAL_ENTRY_TARGET + 8]
            .copy_from_slice(&(target as u64).to_le_bytes());

        let allocation = self.system.memory_allocator().allocate(
            AllocationRequest::new(stub.len())
                .with_alignment(1)
                .executable(),
        )?;
        allocation.write(0, &stub)?;
        Ok(allocation)
    }

    fn create_jump_stub(&self, target: usize) -> Result<JumpStub> {
        let allocation = self.system.memory_allocator().allocate(
            AllocationRequest::new(JUMP_STUB.len() + std::mem::size_of::<usize>())
                .with_alignment(16)
                .executable(),
        )?;
        JumpStub::new(allocation, &JUMP_STUB, JUMP_STUB_CELL, target)
    }
}

/// Stubs that the managed runtimes on x86_64 put in front of method bodies.
fn known_method_thunks() -> Result<BytePatternCollection> {
    const AN: u16 = ANY;
    const AD: u16 = ADDRESS;
    const BN: u8 = B_ANY;
    const BD: u8 = B_ADDRESS;

    let abs64 = AddressMeaning::absolute(AddressKind::ABS64)?;
    let rel32 = |offset| AddressMeaning::relative(AddressKind::REL32, offset);
    let rel32_indirect =
        |offset| AddressMeaning::relative(AddressKind::REL32 | AddressKind::INDIRECT, offset);
    let fixup_rel32 = |offset| AddressMeaning::relative(AddressKind::PRECODE_FIXUP_REL32, offset);

    let mut patterns = vec![
        // remoting stub: test rcx, rcx; je; mov rax, [rcx]; mov r10, imm64; cmp rax, r10; je;
        // mov rax, {target}
        BytePattern::new(
            abs64,
            true,
            &[
                0x48, 0x85, 0xc9, 0x74, AN, 0x48, 0x8b, 0x01, 0x49, AN, AN, AN, AN, AN, AN, AN, AN,
                AN, 0x49, 0x3b, 0xc2, 0x74, AN, 0x48, 0xb8, AD, AD, AD, AD, AD, AD, AD, AD,
            ],
        )?,
        // jmp {rel32}; pop rdi
        BytePattern::new(rel32(5)?, true, &[0xe9, AD, AD, AD, AD, 0x5f])?,
        // jump stubs and generic context stubs: mov rax, {target}; jmp rax
        BytePattern::new(
            abs64,
            false,
            &[0x48, 0xb8, AD, AD, AD, AD, AD, AD, AD, AD, 0xff, 0xe0],
        )?,
        // tiering counter: mov r?, imm64; dec word [r?]; jne {rel32}
        BytePattern::from_mask(
            rel32(19)?,
            false,
            &[
                0xf0, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xf0, 0xff, 0xff, 0, 0, 0, 0,
            ],
            &[
                0x40, 0xb8, BN, BN, BN, BN, BN, BN, BN, BN, 0x66, 0xff, 0x00, 0x0f, 0x85, BD, BD,
                BD, BD,
            ],
        )?,
        // tiering counter, absolute: mov r?, imm64; dec word [r?]; jz; mov rax, {target}; jmp rax
        BytePattern::from_mask(
            abs64,
            false,
            &[
                0xf0, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xf0, 0xff, 0, 0xff, 0xff, 0, 0, 0,
                0, 0, 0, 0, 0, 0xff, 0xff,
            ],
            &[
                0x40, 0xb8, BN, BN, BN, BN, BN, BN, BN, BN, 0x66, 0xff, 0x00, 0x74, BN, 0x48, 0xb8,
                BD, BD, BD, BD, BD, BD, BD, BD, 0xff, 0xe0,
            ],
        )?,
        // fixup precode: call {fixup thunk}; pop rsi
        BytePattern::new(fixup_rel32(5)?, true, &[0xe8, AD, AD, AD, AD, 0x5e])?,
        // fixup precode, older runtimes: call {fixup thunk}; int3
        BytePattern::new(fixup_rel32(5)?, true, &[0xe8, AD, AD, AD, AD, 0xcc])?,
    ];

    // FixupPrecode and call counting stubs, with their data page 0x1000 and 0x4000 bytes away
    for page in [0x10u8, 0x40] {
        let hi = page - 0x10 + 0x0f;

        // jmp [rip + data]; mov r10, [rip + data]; jmp [rip + data]
        patterns.push(BytePattern::from_mask(
            rel32_indirect(6)?,
            true,
            &[
                0xff, 0xff, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
                0xff, 0xff, 0xff,
            ],
            &[
                0xff, 0x25, BD, BD, BD, BD, 0x4c, 0x8b, 0x15, 0xfb, hi, 0x00, 0x00, 0xff, 0x25,
                0xfd, hi, 0x00, 0x00,
            ],
        )?);

        // the same precode entered past its first jump: mov r10, [rip + data]; jmp [rip + data]
        patterns.push(BytePattern::from_mask(
            AddressMeaning::relative(
                AddressKind::PRECODE_FIXUP_REL32 | AddressKind::INDIRECT,
                13,
            )?,
            true,
            &[
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0,
            ],
            &[
                0x4c, 0x8b, 0x15, 0xfb, hi, 0x00, 0x00, 0xff, 0x25, BD, BD, BD, BD,
            ],
        )?);

        // call counting: mov rax, [rip + data]; dec word [rax]; je +6; jmp [rip + data];
        // jmp [rip + data]
        patterns.push(BytePattern::from_mask(
            rel32_indirect(18)?,
            true,
            &[
                0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
                0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            ],
            &[
                0x48, 0x8b, 0x05, 0xf9, hi, 0x00, 0x00, 0x66, 0xff, 0x08, 0x74, 0x06, 0xff, 0x25,
                BD, BD, BD, BD, 0xff, 0x25, 0xf8, hi, 0x00, 0x00,
            ],
        )?);
    }

    Ok(BytePatternCollection::new(patterns))
}
