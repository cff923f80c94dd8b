//! The exemplar target: an 8-bit accumulator-centric, Z80-class ISA with
//! register pairs, flag-based branches and a stack-growing-down calling
//! convention.
//!
//! This module wires the pieces §4.4/§4.5 ask every concrete target for:
//! [`Z80CallConv`] (parameter/return placement), [`Z80Descriptors`] (static
//! per-opcode metadata), [`Z80Factory`] (move/spill/reload synthesis) and
//! [`selector::Z80Selector`] (the actual lowering). [`Z80Isa`] bundles them
//! behind [`crate::isa::TargetIsa`].

pub mod opcode;
pub mod registers;
pub mod selector;

use crate::descriptor::{
    AccessDirection, Flag, InstructionDescriptor, InstructionDescriptorTable, OperandDependency,
};
use crate::isa::registers::{RegRef, RegisterTable, Size};
use crate::isa::{CallingConvention, InstructionFactory, ParamLocation, TargetIsa};
use crate::mi::{AddressingMode, Category, MachineInstruction, MachineInstructionBuilder};
use crate::vreg::{Vr, VirtualRegisterAllocator};
use opcode::Opcode;
use smallvec::smallvec;
use std::collections::HashMap;
use std::sync::OnceLock;

/// §4.4's exemplar policy: first three 16-bit parameters in `BC`, `DE`,
/// `HL`; 8-bit parameters ride the low component of the same pairs; further
/// parameters live on the stack past the return address.
pub struct Z80CallConv;

pub static CALL_CONV: Z80CallConv = Z80CallConv;

impl CallingConvention for Z80CallConv {
    fn parameter_location(&self, index: usize, size: Size) -> ParamLocation {
        if index < registers::GENERAL_PAIRS.len() {
            let pair = registers::GENERAL_PAIRS[index];
            match size {
                Size::Bit16 => ParamLocation::Register(pair),
                Size::Bit8 => ParamLocation::Register(pair.components[0]),
            }
        } else {
            ParamLocation::Stack(2 + 2 * (index as u32 - registers::GENERAL_PAIRS.len() as u32))
        }
    }

    fn return_register(&self, size: Size) -> RegRef {
        match size {
            Size::Bit8 => &registers::A,
            Size::Bit16 => &registers::HL,
        }
    }

    fn caller_saved(&self) -> &'static [RegRef] {
        registers::ALL
    }

    fn callee_saved(&self) -> &'static [RegRef] {
        &[]
    }

    fn stack_alignment(&self) -> u32 {
        1
    }

    fn stack_grows_down(&self) -> bool {
        true
    }
}

/// A simplified, discriminant-only key over [`Opcode`] so the descriptor
/// table doesn't need one entry per `BranchIf` condition: every condition
/// shares the same operand shape.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum DescKind {
    LoadImmediate,
    Load,
    Store,
    LoadIndexed,
    LoadStackAddress,
    StoreSequential,
    Move,
    Add,
    Sub,
    ClearCarry,
    SubtractWithCarry,
    And,
    Or,
    Xor,
    Not,
    Neg,
    ShiftLeft,
    ShiftRight,
    Compare,
    Jump,
    BranchIf,
    Call,
    Return,
    Prologue,
    Epilogue,
}

impl From<Opcode> for DescKind {
    fn from(op: Opcode) -> Self {
        match op {
            Opcode::LoadImmediate => DescKind::LoadImmediate,
            Opcode::Load => DescKind::Load,
            Opcode::Store => DescKind::Store,
            Opcode::LoadIndexed => DescKind::LoadIndexed,
            Opcode::LoadStackAddress => DescKind::LoadStackAddress,
            Opcode::StoreSequential => DescKind::StoreSequential,
            Opcode::Move => DescKind::Move,
            Opcode::Add => DescKind::Add,
            Opcode::Sub => DescKind::Sub,
            Opcode::ClearCarry => DescKind::ClearCarry,
            Opcode::SubtractWithCarry => DescKind::SubtractWithCarry,
            Opcode::And => DescKind::And,
            Opcode::Or => DescKind::Or,
            Opcode::Xor => DescKind::Xor,
            Opcode::Not => DescKind::Not,
            Opcode::Neg => DescKind::Neg,
            Opcode::ShiftLeft => DescKind::ShiftLeft,
            Opcode::ShiftRight => DescKind::ShiftRight,
            Opcode::Compare => DescKind::Compare,
            Opcode::Jump => DescKind::Jump,
            Opcode::BranchIf { .. } => DescKind::BranchIf,
            Opcode::Call => DescKind::Call,
            Opcode::Return => DescKind::Return,
            Opcode::Prologue => DescKind::Prologue,
            Opcode::Epilogue => DescKind::Epilogue,
        }
    }
}

fn rw(access: AccessDirection) -> OperandDependency {
    OperandDependency {
        access,
        allow_set: &[],
    }
}

fn accumulator_binop_descriptor() -> InstructionDescriptor {
    InstructionDescriptor {
        category: Category::Arithmetic,
        addressing: AddressingMode::IMPLICIT,
        cycles: 4,
        bytes: 1,
        prefix_bytes: 0,
        operands: smallvec![rw(AccessDirection::ReadWrite), rw(AccessDirection::Read)],
        affected_flags: smallvec![Flag::Zero, Flag::Carry, Flag::Sign, Flag::Overflow],
        dependent_flags: smallvec![],
    }
}

fn build_descriptors() -> HashMap<DescKind, InstructionDescriptor> {
    use AccessDirection::{Read, ReadWrite, Write};
    use DescKind::*;

    let mut table = HashMap::new();

    table.insert(
        LoadImmediate,
        InstructionDescriptor {
            category: Category::Load,
            addressing: AddressingMode::IMMEDIATE,
            cycles: 7,
            bytes: 2,
            prefix_bytes: 0,
            operands: smallvec![rw(Write)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        Load,
        InstructionDescriptor {
            category: Category::Load,
            addressing: AddressingMode::INDIRECT | AddressingMode::INDEXED,
            cycles: 19,
            bytes: 3,
            prefix_bytes: 1,
            operands: smallvec![rw(Write), rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        Store,
        InstructionDescriptor {
            category: Category::Store,
            addressing: AddressingMode::INDIRECT | AddressingMode::INDEXED,
            cycles: 19,
            bytes: 3,
            prefix_bytes: 1,
            operands: smallvec![rw(Read), rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        LoadIndexed,
        InstructionDescriptor {
            category: Category::Load,
            addressing: AddressingMode::INDEXED,
            cycles: 19,
            bytes: 3,
            prefix_bytes: 1,
            operands: smallvec![rw(Write), rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        LoadStackAddress,
        InstructionDescriptor {
            category: Category::Load,
            addressing: AddressingMode::INDEXED,
            cycles: 15,
            bytes: 3,
            prefix_bytes: 1,
            operands: smallvec![rw(Write), rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        // Arity varies with the number of values stored; the verifier skips
        // the operand-count check for this one opcode (see `pipeline`).
        StoreSequential,
        InstructionDescriptor {
            category: Category::Store,
            addressing: AddressingMode::INDEXED,
            cycles: 19,
            bytes: 3,
            prefix_bytes: 1,
            operands: smallvec![rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        Move,
        InstructionDescriptor {
            category: Category::Move,
            addressing: AddressingMode::IMPLICIT,
            cycles: 4,
            bytes: 1,
            prefix_bytes: 0,
            operands: smallvec![rw(Write), rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(Add, accumulator_binop_descriptor());
    table.insert(Sub, accumulator_binop_descriptor());
    table.insert(And, accumulator_binop_descriptor());
    table.insert(Or, accumulator_binop_descriptor());
    table.insert(Xor, accumulator_binop_descriptor());
    table.insert(
        ClearCarry,
        InstructionDescriptor {
            category: Category::Bitwise,
            addressing: AddressingMode::IMPLICIT,
            cycles: 4,
            bytes: 1,
            prefix_bytes: 0,
            operands: smallvec![],
            affected_flags: smallvec![Flag::Carry, Flag::Zero, Flag::Sign],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        SubtractWithCarry,
        InstructionDescriptor {
            category: Category::Arithmetic,
            addressing: AddressingMode::IMPLICIT,
            cycles: 15,
            bytes: 2,
            prefix_bytes: 1,
            operands: smallvec![rw(ReadWrite), rw(Read)],
            affected_flags: smallvec![Flag::Zero, Flag::Carry, Flag::Sign, Flag::Overflow],
            dependent_flags: smallvec![Flag::Carry],
        },
    );
    table.insert(
        Not,
        InstructionDescriptor {
            category: Category::Bitwise,
            addressing: AddressingMode::IMPLICIT,
            cycles: 4,
            bytes: 1,
            prefix_bytes: 0,
            operands: smallvec![rw(ReadWrite)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        Neg,
        InstructionDescriptor {
            category: Category::Arithmetic,
            addressing: AddressingMode::IMPLICIT,
            cycles: 8,
            bytes: 2,
            prefix_bytes: 1,
            operands: smallvec![rw(ReadWrite)],
            affected_flags: smallvec![Flag::Zero, Flag::Carry, Flag::Sign, Flag::Overflow],
            dependent_flags: smallvec![],
        },
    );
    let shift_descriptor = InstructionDescriptor {
        category: Category::Bitwise,
        addressing: AddressingMode::IMPLICIT,
        cycles: 8,
        bytes: 2,
        prefix_bytes: 1,
        operands: smallvec![rw(ReadWrite)],
        affected_flags: smallvec![Flag::Zero, Flag::Carry, Flag::Sign],
        dependent_flags: smallvec![],
    };
    table.insert(ShiftLeft, shift_descriptor.clone());
    table.insert(ShiftRight, shift_descriptor);
    table.insert(
        Compare,
        InstructionDescriptor {
            category: Category::Other,
            addressing: AddressingMode::IMPLICIT,
            cycles: 4,
            bytes: 1,
            prefix_bytes: 0,
            operands: smallvec![rw(Read), rw(Read)],
            affected_flags: smallvec![Flag::Zero, Flag::Carry, Flag::Sign, Flag::Overflow],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        Jump,
        InstructionDescriptor {
            category: Category::Branch,
            addressing: AddressingMode::DIRECT,
            cycles: 10,
            bytes: 3,
            prefix_bytes: 0,
            operands: smallvec![],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        BranchIf,
        InstructionDescriptor {
            category: Category::Branch,
            addressing: AddressingMode::RELATIVE,
            cycles: 12,
            bytes: 2,
            prefix_bytes: 0,
            operands: smallvec![],
            affected_flags: smallvec![],
            dependent_flags: smallvec![Flag::Dynamic],
        },
    );
    table.insert(
        Call,
        InstructionDescriptor {
            category: Category::Subroutine,
            addressing: AddressingMode::DIRECT,
            cycles: 17,
            bytes: 3,
            prefix_bytes: 0,
            // Variable arity (one slot per moved argument register); the
            // verifier skips the operand-count check for this opcode too.
            operands: smallvec![rw(Read)],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    table.insert(
        Return,
        InstructionDescriptor {
            category: Category::Subroutine,
            addressing: AddressingMode::IMPLICIT,
            cycles: 10,
            bytes: 1,
            prefix_bytes: 0,
            operands: smallvec![],
            affected_flags: smallvec![],
            dependent_flags: smallvec![],
        },
    );
    let prologue_descriptor = InstructionDescriptor {
        category: Category::Stack,
        addressing: AddressingMode::IMPLICIT,
        cycles: 14,
        bytes: 4,
        prefix_bytes: 0,
        operands: smallvec![],
        affected_flags: smallvec![],
        dependent_flags: smallvec![],
    };
    table.insert(Prologue, prologue_descriptor.clone());
    table.insert(Epilogue, prologue_descriptor);

    table
}

/// Process-wide, lazily-built descriptor table for the exemplar target.
pub struct Z80Descriptors;

pub static DESCRIPTORS: Z80Descriptors = Z80Descriptors;

static DESCRIPTOR_TABLE: OnceLock<HashMap<DescKind, InstructionDescriptor>> = OnceLock::new();

impl InstructionDescriptorTable for Z80Descriptors {
    fn descriptor(&self, opcode: Opcode) -> &InstructionDescriptor {
        DESCRIPTOR_TABLE
            .get_or_init(build_descriptors)
            .get(&DescKind::from(opcode))
            .expect("every opcode has a descriptor")
    }
}

/// Synthesises the move/spill/reload sequences `ResolveUnallocated` needs,
/// all addressed relative to the frame pointer `IX`.
pub struct Z80Factory;

pub static FACTORY: Z80Factory = Z80Factory;

impl InstructionFactory for Z80Factory {
    fn make_move(&self, dst: Vr, src: Vr) -> MachineInstruction {
        MachineInstructionBuilder::new(Opcode::Move, Category::Move)
            .result(dst)
            .operand(src)
            .addressing(AddressingMode::IMPLICIT)
            .cost(4, 1)
            .build()
    }

    fn make_spill(&self, value: Vr, offset: u32, size_bytes: u32) -> MachineInstruction {
        MachineInstructionBuilder::new(Opcode::Store, Category::Store)
            .operand(value)
            .addressing(AddressingMode::INDEXED)
            .immediate(offset as i64)
            .cost(if size_bytes <= 1 { 19 } else { 20 }, 3)
            .build()
    }

    fn make_reload(&self, dst: Vr, offset: u32, size_bytes: u32) -> MachineInstruction {
        MachineInstructionBuilder::new(Opcode::Load, Category::Load)
            .result(dst)
            .addressing(AddressingMode::INDEXED)
            .immediate(offset as i64)
            .cost(if size_bytes <= 1 { 19 } else { 20 }, 3)
            .build()
    }
}

/// The exemplar target machine: its registers, calling convention,
/// descriptors, factory and selector, bundled behind [`TargetIsa`].
pub struct Z80Isa;

pub static Z80: Z80Isa = Z80Isa;

impl TargetIsa for Z80Isa {
    fn registers(&self) -> &'static RegisterTable {
        &registers::TABLE
    }

    fn calling_convention(&self) -> &'static dyn CallingConvention {
        &CALL_CONV
    }

    fn descriptors(&self) -> &'static dyn InstructionDescriptorTable {
        &DESCRIPTORS
    }

    fn factory(&self) -> &'static dyn InstructionFactory {
        &FACTORY
    }

    fn selector<'a>(
        &self,
        vrs: &'a mut VirtualRegisterAllocator,
    ) -> Box<dyn crate::select::InstructionSelector + 'a> {
        Box::new(selector::Z80Selector::new(vrs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::registers::Size;

    #[test]
    fn first_three_params_ride_general_pairs() {
        assert!(matches!(
            CALL_CONV.parameter_location(0, Size::Bit16),
            ParamLocation::Register(r) if std::ptr::eq(r, &registers::BC)
        ));
        assert!(matches!(
            CALL_CONV.parameter_location(2, Size::Bit8),
            ParamLocation::Register(r) if std::ptr::eq(r, &registers::L)
        ));
    }

    #[test]
    fn fourth_param_spills_to_the_stack_past_the_return_address() {
        assert!(matches!(
            CALL_CONV.parameter_location(3, Size::Bit16),
            ParamLocation::Stack(2)
        ));
        assert!(matches!(
            CALL_CONV.parameter_location(4, Size::Bit16),
            ParamLocation::Stack(4)
        ));
    }

    #[test]
    fn return_register_matches_size() {
        assert!(std::ptr::eq(CALL_CONV.return_register(Size::Bit8), &registers::A));
        assert!(std::ptr::eq(CALL_CONV.return_register(Size::Bit16), &registers::HL));
    }

    #[test]
    fn descriptor_lookup_ignores_branch_condition() {
        use opcode::Condition;
        let a = DESCRIPTORS.descriptor(Opcode::BranchIf {
            condition: Condition::Zero,
        });
        let b = DESCRIPTORS.descriptor(Opcode::BranchIf {
            condition: Condition::Carry,
        });
        assert_eq!(a.cycles, b.cycles);
    }
}
