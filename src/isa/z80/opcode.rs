//! The target's machine-opcode set.
//!
//! Encoding and textual mnemonics are an assembler's concern, out of scope
//! here; this enum exists purely so `MachineInstruction` and
//! `InstructionDescriptorTable` have something concrete to index by.

use std::fmt;

/// One machine opcode of the exemplar target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Load an 8-bit or 16-bit immediate into a register.
    LoadImmediate,
    /// Load from `[base + offset]` into a register.
    Load,
    /// Store a register to `[base + offset]`.
    Store,
    /// Load from `[base + index*elem_size]` into a register.
    LoadIndexed,
    /// Compute `base + offset` into a register (no memory access).
    LoadStackAddress,
    /// Store a sequence of already-evaluated values starting at an address.
    StoreSequential,
    /// Copy one register to another.
    Move,
    Add,
    Sub,
    /// Clear the carry flag ahead of a 16-bit subtract-with-carry.
    ClearCarry,
    /// 16-bit subtract with carry.
    SubtractWithCarry,
    And,
    Or,
    Xor,
    Not,
    Neg,
    ShiftLeft,
    ShiftRight,
    /// Compare two operands and set flags; no result VR.
    Compare,
    /// Unconditional jump to `targets[0]`.
    Jump,
    /// Branch to `targets[0]` if the last comparison/flag test holds,
    /// fall through to `targets[1]` otherwise.
    BranchIf {
        condition: Condition,
    },
    Call,
    Return,
    Prologue,
    Epilogue,
}

/// A condition-code test a conditional branch reads from the flag
/// register. Signedness follows a two's-complement convention throughout:
/// `Less`/`Greater` compare as signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Zero,
    NotZero,
    Carry,
    NoCarry,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
