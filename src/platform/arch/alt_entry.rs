//! Relocated alternate entry points.
//!
//! Patching the start of a method destroys the instructions the patch overwrites. To still be
//! able to run the original code, those instructions are decoded, re-encoded at a new address
//! with their relative operands fixed up, and followed by a jump back to the first untouched
//! instruction.

use std::sync::Arc;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, Encoder, Instruction,
    InstructionBlock, MemoryOperand, Mnemonic, Register,
};

use crate::{
    platform::system::{Allocation, AllocationRequest, PositionedAllocationRequest, System},
    Error, Result,
};

/// Longest x86 instruction.
const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Attempts at finding an allocation the relocated code fits in.
const MAX_ENCODE_ATTEMPTS: usize = 4;

/// Builds alternate entry points with the iced block encoder.
pub struct AltEntryFactory {
    system: Arc<dyn System>,
    bitness: u32,
}

impl AltEntryFactory {
    /// Creates a factory for `bitness`-bit code allocating through `system`.
    pub fn new(system: Arc<dyn System>, bitness: u32) -> Self {
        AltEntryFactory { system, bitness }
    }

    /// Relocates the instructions covering the first `min_length` bytes at `entry`.
    ///
    /// # Errors
    /// Returns [`Error::Encoding`] if the code cannot be decoded or re-encoded, and
    /// [`Error::Allocation`] if no executable memory is available.
    ///
    /// # Safety
    /// `entry` must point to code that stays unmodified for the duration of the call.
    pub unsafe fn create(&self, entry: usize, min_length: usize) -> Result<Box<dyn Allocation>> {
        let guess = min_length + MAX_INSTRUCTION_LENGTH;
        let readable = self.system.readable_length(entry, guess).min(guess);
        if readable < min_length {
            return Err(Error::Encoding(format!(
                "Only {readable} of {min_length} bytes readable at {entry:#x}"
            )));
        }

        let code = std::slice::from_raw_parts(entry as *const u8, readable);
        let (instructions, uses_ip_relative) = self.relocatable(code, entry, min_length)?;

        let mut estimate = min_length + 5;
        for _ in 0..MAX_ENCODE_ATTEMPTS {
            let request = AllocationRequest::new(estimate).with_alignment(1).executable();
            let allocation = if uses_ip_relative {
                let reach = 1usize << 31;
                self.system
                    .memory_allocator()
                    .allocate_in_range(PositionedAllocationRequest {
                        target: entry,
                        low: entry.saturating_sub(reach),
                        high: entry.saturating_add(reach - 1),
                        request,
                    })?
            } else {
                self.system.memory_allocator().allocate(request)?
            };

            let encoded = BlockEncoder::encode(
                self.bitness,
                InstructionBlock::new(&instructions, allocation.base() as u64),
                BlockEncoderOptions::NONE,
            )
            .map_err(|error| Error::Encoding(format!("Block encoding failed: {error}")))?;

            if encoded.code_buffer.len() <= allocation.size() {
                allocation.write(0, &encoded.code_buffer)?;
                log::debug!(
                    "Alternate entry for {:#x} at {:#x} ({} bytes)",
                    entry,
                    allocation.base(),
                    encoded.code_buffer.len()
                );
                return Ok(allocation);
            }
            estimate = encoded.code_buffer.len();
        }

        Err(Error::Encoding(format!(
            "Relocated code for {entry:#x} did not settle on a size"
        )))
    }

    /// Decodes the instructions to relocate and appends the transfer back to the original code.
    fn relocatable(
        &self,
        code: &[u8],
        entry: usize,
        min_length: usize,
    ) -> Result<(Vec<Instruction>, bool)> {
        let mut decoder = Decoder::with_ip(
            self.bitness,
            code,
            entry as u64,
            DecoderOptions::NO_INVALID_CHECK | DecoderOptions::AMD,
        );

        let mut instructions = Vec::new();
        while decoder.position() < min_length {
            if !decoder.can_decode() {
                return Err(Error::Encoding(format!(
                    "Ran out of code decoding {entry:#x}"
                )));
            }
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return Err(Error::Encoding(format!(
                    "Invalid instruction at {:#x}",
                    instruction.ip()
                )));
            }
            instructions.push(instruction);
        }
        let uses_ip_relative = instructions
            .iter()
            .any(Instruction::is_ip_rel_memory_operand);

        match instructions.last() {
            Some(last) if last.mnemonic() == Mnemonic::Call => {
                let last = *last;
                instructions.pop();
                instructions.extend(self.call_as_jump(&last)?);
            }
            _ => {
                let back = Instruction::with_branch(Code::Jmp_rel32_64, decoder.ip())
                    .map_err(|error| Error::Encoding(error.to_string()))?;
                instructions.push(back);
            }
        }

        Ok((instructions, uses_ip_relative))
    }

    /// Rewrites a trailing call into `push [return address cell]; jmp target` plus the cell, so
    /// the callee returns straight into the original code.
    fn call_as_jump(&self, call: &Instruction) -> Result<[Instruction; 3]> {
        let encoding = |error: iced_x86::IcedError| Error::Encoding(error.to_string());
        let mut encoder = Encoder::new(self.bitness);

        let mut jump = *call;
        jump.set_code(match call.code() {
            Code::Call_rel32_64 => Code::Jmp_rel32_64,
            Code::Call_rm64 => Code::Jmp_rm64,
            Code::Call_m1664 => Code::Jmp_m1664,
            other => {
                return Err(Error::Encoding(format!(
                    "Unrecognized call opcode {other:?}"
                )))
            }
        });
        jump.set_len(encoder.encode(&jump, jump.ip()).map_err(encoding)?);

        let return_address = call.next_ip();
        let mut push = Instruction::with1(
            Code::Push_rm64,
            MemoryOperand::with_base_displ(Register::RIP, jump.next_ip() as i64),
        )
        .map_err(encoding)?;
        push.set_len(encoder.encode(&push, jump.ip()).map_err(encoding)?);
        push.set_ip(jump.ip());
        jump.set_ip(jump.ip() + push.len() as u64);

        let mut cell = Instruction::with_declare_qword_1(return_address);
        cell.set_ip(jump.next_ip());
        push.set_memory_displacement64(cell.ip());

        Ok([push, jump, cell])
    }
}
