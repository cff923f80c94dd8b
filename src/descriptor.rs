//! Static, per-opcode metadata a target publishes once and never mutates.
//!
//! `RegisterAllocator` and `ResolveUnallocated` don't know what an opcode
//! *does*; they only consult its descriptor to know which operand slots
//! are read, written, or both, and what physical registers a slot is
//! restricted to.

use crate::isa::registers::AllowSet;
use crate::isa::Opcode;
use crate::mi::{AddressingMode, Category};
use smallvec::SmallVec;

/// Which way data flows through one operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
    ReadWrite,
}

/// Description of one operand slot of an instruction.
#[derive(Debug, Clone)]
pub struct OperandDependency {
    pub access: AccessDirection,
    /// Registers this slot may be assigned to; empty means "any register
    /// of the operand's size".
    pub allow_set: AllowSet,
}

/// A condition-code flag an opcode may read or write. `Dynamic` marks a
/// dependency determined at runtime by a condition-code operand rather
/// than fixed per opcode (used by conditional branches, whose condition is
/// carried in the instruction rather than implied by the opcode alone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Zero,
    Carry,
    Sign,
    Overflow,
    Dynamic,
}

/// Static metadata for one opcode, shared process-wide.
#[derive(Debug, Clone)]
pub struct InstructionDescriptor {
    pub category: Category,
    pub addressing: AddressingMode,
    pub cycles: u16,
    pub bytes: u16,
    pub prefix_bytes: u8,
    pub operands: SmallVec<[OperandDependency; 4]>,
    pub affected_flags: SmallVec<[Flag; 4]>,
    pub dependent_flags: SmallVec<[Flag; 4]>,
}

impl InstructionDescriptor {
    /// Number of slots that are purely write (these correspond to a
    /// `MachineInstruction`'s `result`, not its `operands` list).
    fn write_only_slots(&self) -> usize {
        self.operands
            .iter()
            .filter(|d| matches!(d.access, AccessDirection::Write))
            .count()
    }

    /// Does an emitted instruction's operand count and access pattern
    /// match this descriptor? `result_present` and `operand_count`
    /// describe a `MachineInstruction`'s `result`/`operands` split.
    pub fn matches_operand_count(&self, result_present: bool, operand_count: usize) -> bool {
        let write_only = self.write_only_slots();
        let expects_result = write_only > 0;
        if expects_result != result_present {
            return false;
        }
        self.operands.len() - write_only == operand_count
    }
}

/// Process-wide, read-only lookup from opcode to its descriptor.
pub trait InstructionDescriptorTable: Sync {
    fn descriptor(&self, opcode: Opcode) -> &InstructionDescriptor;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(writes: usize, reads: usize) -> InstructionDescriptor {
        let mut operands = SmallVec::new();
        for _ in 0..writes {
            operands.push(OperandDependency {
                access: AccessDirection::Write,
                allow_set: &[],
            });
        }
        for _ in 0..reads {
            operands.push(OperandDependency {
                access: AccessDirection::Read,
                allow_set: &[],
            });
        }
        InstructionDescriptor {
            category: Category::Arithmetic,
            addressing: AddressingMode::IMPLICIT,
            cycles: 4,
            bytes: 1,
            prefix_bytes: 0,
            operands,
            affected_flags: SmallVec::new(),
            dependent_flags: SmallVec::new(),
        }
    }

    #[test]
    fn operand_count_must_match() {
        let d = descriptor(1, 2);
        assert!(d.matches_operand_count(true, 2));
        assert!(!d.matches_operand_count(true, 3));
    }

    #[test]
    fn result_presence_must_match_write_slots() {
        let d = descriptor(0, 2);
        assert!(!d.matches_operand_count(true, 2));
        assert!(d.matches_operand_count(false, 2));
    }
}
