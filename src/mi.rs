//! Target-independent shape of one emitted machine instruction.

use crate::cfg::BlockId;
use crate::isa::Opcode;
use crate::sir::Symbol;
use crate::vreg::Vr;
use bitflags::bitflags;
use smallvec::SmallVec;

/// Coarse classification of an opcode, used by liveness and the allocator
/// to reason about an instruction without a target-specific switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Load,
    Store,
    Move,
    Arithmetic,
    Bitwise,
    Branch,
    Subroutine,
    Stack,
    Interrupt,
    Other,
}

bitflags! {
    /// Addressing modes an operand may use. An instruction typically has
    /// exactly one bit set, but indexed-with-displacement shapes can carry
    /// two.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddressingMode: u8 {
        const IMMEDIATE = 1 << 0;
        const DIRECT    = 1 << 1;
        const INDIRECT  = 1 << 2;
        const INDEXED   = 1 << 3;
        const RELATIVE  = 1 << 4;
        const IMPLICIT  = 1 << 5;
    }
}

/// Static cost of one instruction, for a later scheduling pass to consume;
/// this crate only records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cost {
    pub cycles: u16,
    pub bytes: u16,
}

/// One machine instruction over virtual registers.
#[derive(Debug, Clone)]
pub struct MachineInstruction {
    pub opcode: Opcode,
    pub result: Option<Vr>,
    pub operands: SmallVec<[Vr; 4]>,
    pub category: Category,
    pub addressing: AddressingMode,
    /// Target blocks for control-flow transfer, in canonical order:
    /// `[0]` = taken, `[1]` = fall-through for a conditional branch;
    /// exactly one entry for an unconditional jump.
    pub targets: SmallVec<[BlockId; 2]>,
    /// A literal value encoded directly in the instruction rather than
    /// carried by an operand VR: the loaded constant of `LoadImmediate`, or
    /// the byte displacement of an indexed/offset memory access.
    pub immediate: Option<i64>,
    /// The callee of a `Call`, by name; `None` for every other opcode.
    pub callee: Option<Symbol>,
    pub cost: Cost,
}

impl MachineInstruction {
    /// Every VR this instruction reads or writes, result first.
    pub fn all_vrs(&self) -> impl Iterator<Item = Vr> + '_ {
        self.result.into_iter().chain(self.operands.iter().copied())
    }

    pub fn is_branch(&self) -> bool {
        matches!(self.category, Category::Branch)
    }
}

/// Builder used by `InstructionSelector` implementations so call sites
/// don't repeat the same struct literal with mostly-default fields.
#[derive(Debug, Clone)]
pub struct MachineInstructionBuilder {
    mi: MachineInstruction,
}

impl MachineInstructionBuilder {
    pub fn new(opcode: Opcode, category: Category) -> Self {
        MachineInstructionBuilder {
            mi: MachineInstruction {
                opcode,
                result: None,
                operands: SmallVec::new(),
                category,
                addressing: AddressingMode::empty(),
                targets: SmallVec::new(),
                immediate: None,
                callee: None,
                cost: Cost::default(),
            },
        }
    }

    pub fn result(mut self, vr: Vr) -> Self {
        self.mi.result = Some(vr);
        self
    }

    pub fn operand(mut self, vr: Vr) -> Self {
        self.mi.operands.push(vr);
        self
    }

    pub fn operands(mut self, vrs: impl IntoIterator<Item = Vr>) -> Self {
        self.mi.operands.extend(vrs);
        self
    }

    pub fn addressing(mut self, mode: AddressingMode) -> Self {
        self.mi.addressing = mode;
        self
    }

    pub fn target(mut self, block: BlockId) -> Self {
        self.mi.targets.push(block);
        self
    }

    pub fn cost(mut self, cycles: u16, bytes: u16) -> Self {
        self.mi.cost = Cost { cycles, bytes };
        self
    }

    pub fn immediate(mut self, value: i64) -> Self {
        self.mi.immediate = Some(value);
        self
    }

    pub fn callee(mut self, name: Symbol) -> Self {
        self.mi.callee = Some(name);
        self
    }

    pub fn build(self) -> MachineInstruction {
        self.mi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Opcode;
    use cranelift_entity::EntityRef;

    #[test]
    fn all_vrs_yields_result_before_operands() {
        let a = Vr::new(0);
        let b = Vr::new(1);
        let c = Vr::new(2);
        let mi = MachineInstructionBuilder::new(Opcode::Add, Category::Arithmetic)
            .result(a)
            .operand(b)
            .operand(c)
            .build();
        let vrs: Vec<_> = mi.all_vrs().collect();
        assert_eq!(vrs, vec![a, b, c]);
    }

    #[test]
    fn builder_defaults_to_no_targets() {
        let mi = MachineInstructionBuilder::new(Opcode::Move, Category::Move).build();
        assert!(mi.targets.is_empty());
        assert!(!mi.is_branch());
    }
}
