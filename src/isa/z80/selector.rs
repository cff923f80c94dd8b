//! Concrete `InstructionSelector` for the exemplar target.
//!
//! The guiding rule throughout: 8-bit arithmetic and bitwise ops are
//! accumulator-bound (operand loaded into `A`, opcode, result copied out to
//! a fresh candidate); 16-bit arithmetic uses the `HL`/`DE` pair contract;
//! anything the target has no native opcode for (multiply, divide, a
//! variable-count shift, 16-bit bitwise ops) is lowered as a call to a
//! named runtime helper under the same `HL`/`DE`-in, `HL`-out contract (or
//! the 8-bit analogue `A`/`E`-in, `A`-out).

use super::opcode::{Condition, Opcode};
use super::{registers, CALL_CONV, DESCRIPTORS};
use crate::cfg::{BlockId, Cfg};
use crate::descriptor::InstructionDescriptorTable;
use crate::error::CodegenResult;
use crate::isa::registers::{AllowSet, RegRef, RegisterTable, Size};
use crate::isa::{CallingConvention, ParamLocation};
use crate::mi::{AddressingMode, Category, MachineInstructionBuilder};
use crate::sir::{BinOp, ConstValue, Symbol};
use crate::vreg::{Vr, VirtualRegisterAllocator, VrKind};
use cranelift_entity::EntityRef;

/// The general-purpose 8-bit registers a size-unconstrained 8-bit result
/// may land in.
static GENERAL_8: &[RegRef] = &[
    &registers::B,
    &registers::C,
    &registers::D,
    &registers::E,
    &registers::H,
    &registers::L,
    &registers::A,
];

fn allow_set_for(size: Size) -> AllowSet {
    match size {
        Size::Bit8 => GENERAL_8,
        Size::Bit16 => registers::GENERAL_PAIRS,
    }
}

fn condition_for(op: BinOp) -> Condition {
    match op {
        BinOp::Eq => Condition::Zero,
        BinOp::Ne => Condition::NotZero,
        BinOp::Lt => Condition::Less,
        BinOp::Le => Condition::LessEqual,
        BinOp::Gt => Condition::Greater,
        BinOp::Ge => Condition::GreaterEqual,
        _ => unreachable!("condition_for called with a non-comparison BinOp"),
    }
}

pub struct Z80Selector<'a> {
    current_block: BlockId,
    vrs: &'a mut VirtualRegisterAllocator,
}

impl<'a> Z80Selector<'a> {
    pub fn new(vrs: &'a mut VirtualRegisterAllocator) -> Self {
        Z80Selector {
            // Overwritten by `set_current_block` before any instruction is
            // emitted; the driver never emits into block 0 without calling
            // it first.
            current_block: BlockId::new(0),
            vrs,
        }
    }

    fn emit(&mut self, cfg: &mut Cfg, mi: crate::mi::MachineInstruction) {
        cfg.block_mut(self.current_block).instructions.push(mi);
    }

    fn accumulator_binop(&mut self, cfg: &mut Cfg, opcode: Opcode, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        let acc = self.vrs.allocate_fixed(None, &registers::A);
        self.mov(cfg, acc, lhs)?;
        let mi = MachineInstructionBuilder::new(opcode, Category::Arithmetic)
            .result(acc)
            .operand(acc)
            .operand(rhs)
            .addressing(AddressingMode::IMPLICIT)
            .cost(4, 1)
            .build();
        self.emit(cfg, mi);
        let result = self.vrs.allocate(GENERAL_8);
        self.mov(cfg, result, acc)?;
        Ok(result)
    }

    fn pair_add(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        let hl = self.vrs.allocate_fixed(None, &registers::HL);
        self.mov(cfg, hl, lhs)?;
        let de = self.vrs.allocate_fixed(None, &registers::DE);
        self.mov(cfg, de, rhs)?;
        let mi = MachineInstructionBuilder::new(Opcode::Add, Category::Arithmetic)
            .result(hl)
            .operand(hl)
            .operand(de)
            .addressing(AddressingMode::IMPLICIT)
            .cost(11, 1)
            .build();
        self.emit(cfg, mi);
        let result = self.vrs.allocate(registers::GENERAL_PAIRS);
        self.mov(cfg, result, hl)?;
        Ok(result)
    }

    /// The target has no 16-bit subtract; `lhs - rhs` is `SBC HL, DE` with
    /// the carry explicitly cleared first.
    fn pair_subtract(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        let hl = self.vrs.allocate_fixed(None, &registers::HL);
        self.mov(cfg, hl, lhs)?;
        let de = self.vrs.allocate_fixed(None, &registers::DE);
        self.mov(cfg, de, rhs)?;
        let clear = MachineInstructionBuilder::new(Opcode::ClearCarry, Category::Bitwise)
            .addressing(AddressingMode::IMPLICIT)
            .cost(4, 1)
            .build();
        self.emit(cfg, clear);
        let mi = MachineInstructionBuilder::new(Opcode::SubtractWithCarry, Category::Arithmetic)
            .result(hl)
            .operand(hl)
            .operand(de)
            .addressing(AddressingMode::IMPLICIT)
            .cost(15, 2)
            .build();
        self.emit(cfg, mi);
        let result = self.vrs.allocate(registers::GENERAL_PAIRS);
        self.mov(cfg, result, hl)?;
        Ok(result)
    }

    /// Call a two-operand runtime helper under the `lhs`/`rhs`-in,
    /// result-out register contract for `size` (`A`/`E`/`A` at 8 bits,
    /// `HL`/`DE`/`HL` at 16).
    fn call_runtime2(&mut self, cfg: &mut Cfg, name: &str, lhs: Vr, rhs: Vr, size: Size) -> CodegenResult<Vr> {
        let (lhs_reg, rhs_reg): (RegRef, RegRef) = match size {
            Size::Bit8 => (&registers::A, &registers::E),
            Size::Bit16 => (&registers::HL, &registers::DE),
        };
        let lhs_fixed = self.vrs.allocate_fixed(None, lhs_reg);
        self.mov(cfg, lhs_fixed, lhs)?;
        let rhs_fixed = self.vrs.allocate_fixed(None, rhs_reg);
        self.mov(cfg, rhs_fixed, rhs)?;
        let result_reg = self.vrs.allocate_fixed(None, lhs_reg);
        let mi = MachineInstructionBuilder::new(Opcode::Call, Category::Subroutine)
            .result(result_reg)
            .operand(lhs_fixed)
            .operand(rhs_fixed)
            .addressing(AddressingMode::DIRECT)
            .callee(Symbol::new(name))
            .cost(17, 3)
            .build();
        self.emit(cfg, mi);
        let result = self.vrs.allocate(allow_set_for(size));
        self.mov(cfg, result, result_reg)?;
        Ok(result)
    }

    fn call_runtime1(&mut self, cfg: &mut Cfg, name: &str, operand: Vr, size: Size) -> CodegenResult<Vr> {
        let reg: RegRef = match size {
            Size::Bit8 => &registers::A,
            Size::Bit16 => &registers::HL,
        };
        let fixed = self.vrs.allocate_fixed(None, reg);
        self.mov(cfg, fixed, operand)?;
        let result_reg = self.vrs.allocate_fixed(None, reg);
        let mi = MachineInstructionBuilder::new(Opcode::Call, Category::Subroutine)
            .result(result_reg)
            .operand(fixed)
            .addressing(AddressingMode::DIRECT)
            .callee(Symbol::new(name))
            .cost(17, 3)
            .build();
        self.emit(cfg, mi);
        let result = self.vrs.allocate(allow_set_for(size));
        self.mov(cfg, result, result_reg)?;
        Ok(result)
    }

    /// `rhs` by a known-at-selection-time immediate count lowers to that
    /// many native single-bit shifts; anything else (a variable count) has
    /// no native form and goes through a runtime helper.
    fn shift(
        &mut self,
        cfg: &mut Cfg,
        native_opcode: Opcode,
        helper8: &str,
        helper16: &str,
        lhs: Vr,
        rhs: Vr,
    ) -> CodegenResult<Vr> {
        let rhs_kind = self.vrs.get(rhs).kind.clone();
        if let VrKind::Immediate { value } = rhs_kind {
            let size = self.vrs.get(lhs).size;
            let reg: RegRef = match size {
                Size::Bit8 => &registers::A,
                Size::Bit16 => &registers::HL,
            };
            let working = self.vrs.allocate_fixed(None, reg);
            self.mov(cfg, working, lhs)?;
            for _ in 0..value.max(0) {
                let mi = MachineInstructionBuilder::new(native_opcode, Category::Bitwise)
                    .result(working)
                    .operand(working)
                    .addressing(AddressingMode::IMPLICIT)
                    .cost(8, 2)
                    .build();
                self.emit(cfg, mi);
            }
            let result = self.vrs.allocate(allow_set_for(size));
            self.mov(cfg, result, working)?;
            return Ok(result);
        }
        let size = self.vrs.get(lhs).size;
        let helper = match size {
            Size::Bit8 => helper8,
            Size::Bit16 => helper16,
        };
        self.call_runtime2(cfg, helper, lhs, rhs, size)
    }
}

impl<'a> crate::select::InstructionSelector for Z80Selector<'a> {
    fn set_current_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    fn current_block(&self) -> BlockId {
        self.current_block
    }

    fn calling_convention(&self) -> &'static dyn CallingConvention {
        &CALL_CONV
    }

    fn target_registers(&self) -> &'static RegisterTable {
        &registers::TABLE
    }

    fn descriptors(&self) -> &'static dyn InstructionDescriptorTable {
        &DESCRIPTORS
    }

    fn vrs(&mut self) -> &mut VirtualRegisterAllocator {
        self.vrs
    }

    fn add(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(lhs).size {
            Size::Bit8 => self.accumulator_binop(cfg, Opcode::Add, lhs, rhs),
            Size::Bit16 => self.pair_add(cfg, lhs, rhs),
        }
    }

    fn sub(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(lhs).size {
            Size::Bit8 => self.accumulator_binop(cfg, Opcode::Sub, lhs, rhs),
            Size::Bit16 => self.pair_subtract(cfg, lhs, rhs),
        }
    }

    fn mul(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        let size = self.vrs.get(lhs).size;
        let name = match size {
            Size::Bit8 => "__mul8",
            Size::Bit16 => "__mul16",
        };
        self.call_runtime2(cfg, name, lhs, rhs, size)
    }

    fn div(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        let size = self.vrs.get(lhs).size;
        let name = match size {
            Size::Bit8 => "__div8",
            Size::Bit16 => "__div16",
        };
        self.call_runtime2(cfg, name, lhs, rhs, size)
    }

    fn neg(&mut self, cfg: &mut Cfg, operand: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(operand).size {
            Size::Bit8 => {
                let acc = self.vrs.allocate_fixed(None, &registers::A);
                self.mov(cfg, acc, operand)?;
                let mi = MachineInstructionBuilder::new(Opcode::Neg, Category::Arithmetic)
                    .result(acc)
                    .operand(acc)
                    .addressing(AddressingMode::IMPLICIT)
                    .cost(8, 2)
                    .build();
                self.emit(cfg, mi);
                let result = self.vrs.allocate(GENERAL_8);
                self.mov(cfg, result, acc)?;
                Ok(result)
            }
            Size::Bit16 => {
                let zero = self.load_constant(cfg, ConstValue::I16(0))?;
                self.pair_subtract(cfg, zero, operand)
            }
        }
    }

    fn bit_and(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(lhs).size {
            Size::Bit8 => self.accumulator_binop(cfg, Opcode::And, lhs, rhs),
            Size::Bit16 => self.call_runtime2(cfg, "__and16", lhs, rhs, Size::Bit16),
        }
    }

    fn bit_or(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(lhs).size {
            Size::Bit8 => self.accumulator_binop(cfg, Opcode::Or, lhs, rhs),
            Size::Bit16 => self.call_runtime2(cfg, "__or16", lhs, rhs, Size::Bit16),
        }
    }

    fn bit_xor(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(lhs).size {
            Size::Bit8 => self.accumulator_binop(cfg, Opcode::Xor, lhs, rhs),
            Size::Bit16 => self.call_runtime2(cfg, "__xor16", lhs, rhs, Size::Bit16),
        }
    }

    fn bit_not(&mut self, cfg: &mut Cfg, operand: Vr) -> CodegenResult<Vr> {
        match self.vrs.get(operand).size {
            Size::Bit8 => {
                let acc = self.vrs.allocate_fixed(None, &registers::A);
                self.mov(cfg, acc, operand)?;
                let mi = MachineInstructionBuilder::new(Opcode::Not, Category::Bitwise)
                    .result(acc)
                    .operand(acc)
                    .addressing(AddressingMode::IMPLICIT)
                    .cost(4, 1)
                    .build();
                self.emit(cfg, mi);
                let result = self.vrs.allocate(GENERAL_8);
                self.mov(cfg, result, acc)?;
                Ok(result)
            }
            Size::Bit16 => self.call_runtime1(cfg, "__not16", operand, Size::Bit16),
        }
    }

    fn shl(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        self.shift(cfg, Opcode::ShiftLeft, "__shl8", "__shl16", lhs, rhs)
    }

    fn shr(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        self.shift(cfg, Opcode::ShiftRight, "__shr8", "__shr16", lhs, rhs)
    }

    fn compare_branch(
        &mut self,
        cfg: &mut Cfg,
        op: BinOp,
        lhs: Vr,
        rhs: Vr,
        taken: BlockId,
        fall_through: BlockId,
    ) -> CodegenResult<()> {
        let compare = MachineInstructionBuilder::new(Opcode::Compare, Category::Other)
            .operand(lhs)
            .operand(rhs)
            .addressing(AddressingMode::IMPLICIT)
            .cost(4, 1)
            .build();
        self.emit(cfg, compare);
        let branch = MachineInstructionBuilder::new(
            Opcode::BranchIf {
                condition: condition_for(op),
            },
            Category::Branch,
        )
        .target(taken)
        .target(fall_through)
        .addressing(AddressingMode::RELATIVE)
        .cost(12, 2)
        .build();
        self.emit(cfg, branch);
        Ok(())
    }

    /// Synthesise a 0/1 boolean the same way the target-agnostic driver
    /// synthesises one for `&&`/`||` in value mode: branch to one of two
    /// fresh blocks, load the matching constant in each, merge.
    fn compare_value(&mut self, cfg: &mut Cfg, op: BinOp, lhs: Vr, rhs: Vr) -> CodegenResult<Vr> {
        let true_block = cfg.add_block(crate::cfg::LabelKind::Unreachable);
        let false_block = cfg.add_block(crate::cfg::LabelKind::Unreachable);
        let merge_block = cfg.add_block(crate::cfg::LabelKind::Unreachable);
        cfg.add_edge(self.current_block, true_block);
        cfg.add_edge(self.current_block, false_block);
        cfg.add_edge(true_block, merge_block);
        cfg.add_edge(false_block, merge_block);

        self.compare_branch(cfg, op, lhs, rhs, true_block, false_block)?;

        let result = self.vrs.allocate(&[]);
        self.current_block = true_block;
        let one = self.load_constant(cfg, ConstValue::I8(1))?;
        self.mov(cfg, result, one)?;
        self.jump(cfg, merge_block);

        self.current_block = false_block;
        let zero = self.load_constant(cfg, ConstValue::I8(0))?;
        self.mov(cfg, result, zero)?;
        self.jump(cfg, merge_block);

        self.current_block = merge_block;
        Ok(result)
    }

    fn load(&mut self, cfg: &mut Cfg, base: Vr, offset: u32, size: Size) -> CodegenResult<Vr> {
        let result = self.vrs.allocate(allow_set_for(size));
        let mi = MachineInstructionBuilder::new(Opcode::Load, Category::Load)
            .result(result)
            .operand(base)
            .addressing(AddressingMode::INDIRECT | AddressingMode::INDEXED)
            .immediate(offset as i64)
            .cost(19, 3)
            .build();
        self.emit(cfg, mi);
        Ok(result)
    }

    fn store(&mut self, cfg: &mut Cfg, base: Vr, value: Vr, offset: u32, _size: Size) -> CodegenResult<()> {
        let mi = MachineInstructionBuilder::new(Opcode::Store, Category::Store)
            .operand(base)
            .operand(value)
            .addressing(AddressingMode::INDIRECT | AddressingMode::INDEXED)
            .immediate(offset as i64)
            .cost(19, 3)
            .build();
        self.emit(cfg, mi);
        Ok(())
    }

    fn load_indexed(
        &mut self,
        cfg: &mut Cfg,
        base: Vr,
        index: Vr,
        elem_size: u32,
        size: Size,
    ) -> CodegenResult<Vr> {
        let result = self.vrs.allocate(allow_set_for(size));
        let mi = MachineInstructionBuilder::new(Opcode::LoadIndexed, Category::Load)
            .result(result)
            .operand(base)
            .operand(index)
            .addressing(AddressingMode::INDEXED)
            .immediate(elem_size as i64)
            .cost(19, 3)
            .build();
        self.emit(cfg, mi);
        Ok(result)
    }

    fn load_constant(&mut self, cfg: &mut Cfg, value: ConstValue) -> CodegenResult<Vr> {
        let (size, raw): (Size, i64) = match value {
            ConstValue::Bool(b) => (Size::Bit8, b as i64),
            ConstValue::I8(v) => (Size::Bit8, v as i64),
            ConstValue::I16(v) => (Size::Bit16, v as i64),
        };
        let result = self.vrs.allocate(allow_set_for(size));
        let mi = MachineInstructionBuilder::new(Opcode::LoadImmediate, Category::Load)
            .result(result)
            .addressing(AddressingMode::IMMEDIATE)
            .immediate(raw)
            .cost(7, 2)
            .build();
        self.emit(cfg, mi);
        Ok(result)
    }

    fn load_stack_address(&mut self, cfg: &mut Cfg, offset: u32) -> CodegenResult<Vr> {
        let ix = self.vrs.allocate_fixed(None, &registers::IX);
        let result = self.vrs.allocate(registers::GENERAL_PAIRS);
        let mi = MachineInstructionBuilder::new(Opcode::LoadStackAddress, Category::Load)
            .result(result)
            .operand(ix)
            .addressing(AddressingMode::INDEXED)
            .immediate(offset as i64)
            .cost(15, 3)
            .build();
        self.emit(cfg, mi);
        Ok(result)
    }

    fn store_sequential(&mut self, cfg: &mut Cfg, base: Vr, values: &[Vr], elem_size: u32) -> CodegenResult<()> {
        let mut builder = MachineInstructionBuilder::new(Opcode::StoreSequential, Category::Store)
            .operand(base)
            .addressing(AddressingMode::INDEXED)
            .immediate(elem_size as i64)
            .cost(19, 3);
        for value in values {
            builder = builder.operand(*value);
        }
        self.emit(cfg, builder.build());
        Ok(())
    }

    fn load_symbol(&mut self, cfg: &mut Cfg, offset: u32, size: Size) -> CodegenResult<Vr> {
        let ix = self.vrs.allocate_fixed(None, &registers::IX);
        self.load(cfg, ix, offset, size)
    }

    fn store_symbol(&mut self, cfg: &mut Cfg, offset: u32, value: Vr, size: Size) -> CodegenResult<()> {
        let ix = self.vrs.allocate_fixed(None, &registers::IX);
        self.store(cfg, ix, value, offset, size)
    }

    fn mov(&mut self, cfg: &mut Cfg, target: Vr, source: Vr) -> CodegenResult<()> {
        if target == source {
            return Ok(());
        }
        let mi = MachineInstructionBuilder::new(Opcode::Move, Category::Move)
            .result(target)
            .operand(source)
            .addressing(AddressingMode::IMPLICIT)
            .cost(4, 1)
            .build();
        self.emit(cfg, mi);
        Ok(())
    }

    fn jump(&mut self, cfg: &mut Cfg, target: BlockId) {
        let mi = MachineInstructionBuilder::new(Opcode::Jump, Category::Branch)
            .target(target)
            .addressing(AddressingMode::DIRECT)
            .cost(10, 3)
            .build();
        self.emit(cfg, mi);
    }

    fn call(
        &mut self,
        cfg: &mut Cfg,
        callee: &Symbol,
        args: &[Vr],
        return_size: Option<Size>,
    ) -> CodegenResult<Option<Vr>> {
        let mut operand_vrs = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let size = self.vrs.get(*arg).size;
            match CALL_CONV.parameter_location(i, size) {
                ParamLocation::Register(reg) => {
                    let dest = self.vrs.allocate_fixed(None, reg);
                    self.mov(cfg, dest, *arg)?;
                    operand_vrs.push(dest);
                }
                ParamLocation::Stack(offset) => {
                    let sp = self.vrs.allocate_fixed(None, &registers::SP);
                    self.store(cfg, sp, *arg, offset, size)?;
                }
            }
        }

        let result_vr = return_size.map(|size| {
            let reg = CALL_CONV.return_register(size);
            self.vrs.allocate_fixed(None, reg)
        });

        let mut builder = MachineInstructionBuilder::new(Opcode::Call, Category::Subroutine)
            .addressing(AddressingMode::DIRECT)
            .callee(callee.clone())
            .cost(17, 3);
        if let Some(result_vr) = result_vr {
            builder = builder.result(result_vr);
        }
        for vr in &operand_vrs {
            builder = builder.operand(*vr);
        }
        self.emit(cfg, builder.build());

        match result_vr {
            Some(reg_vr) => {
                let size = self.vrs.get(reg_vr).size;
                let out = self.vrs.allocate(allow_set_for(size));
                self.mov(cfg, out, reg_vr)?;
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    fn emit_return(&mut self, cfg: &mut Cfg, value: Option<Vr>) {
        let mut builder = MachineInstructionBuilder::new(Opcode::Return, Category::Subroutine)
            .addressing(AddressingMode::IMPLICIT)
            .cost(10, 1);
        if let Some(value) = value {
            builder = builder.operand(value);
        }
        self.emit(cfg, builder.build());
    }

    fn prologue(&mut self, cfg: &mut Cfg, frame_size: u32) {
        let mi = MachineInstructionBuilder::new(Opcode::Prologue, Category::Stack)
            .addressing(AddressingMode::IMPLICIT)
            .immediate(frame_size as i64)
            .cost(14, 4)
            .build();
        self.emit(cfg, mi);
    }

    fn epilogue(&mut self, cfg: &mut Cfg, frame_size: u32) {
        let mi = MachineInstructionBuilder::new(Opcode::Epilogue, Category::Stack)
            .addressing(AddressingMode::IMPLICIT)
            .immediate(frame_size as i64)
            .cost(14, 2)
            .build();
        self.emit(cfg, mi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::InstructionSelector;

    fn fresh_cfg() -> Cfg {
        Cfg::new(crate::sir::FunctionDecl {
            name: Symbol::new("f"),
            params: vec![],
            return_ty: None,
            body: crate::sir::Block::new(vec![]),
        })
    }

    #[test]
    fn eight_bit_add_reads_accumulator_and_frees_a_fresh_result() {
        let mut vrs = VirtualRegisterAllocator::new();
        let lhs = vrs.allocate(GENERAL_8);
        let rhs = vrs.allocate(GENERAL_8);
        let mut cfg = fresh_cfg();
        let mut selector = Z80Selector::new(&mut vrs);
        selector.set_current_block(cfg.entry);
        let result = selector.add(&mut cfg, lhs, rhs).unwrap();
        assert_ne!(result, lhs);
        assert_ne!(result, rhs);
        let instructions = &cfg.block(cfg.entry).instructions;
        assert!(instructions.iter().any(|mi| mi.opcode == Opcode::Add));
    }

    #[test]
    fn sixteen_bit_sub_clears_carry_before_subtract_with_carry() {
        let mut vrs = VirtualRegisterAllocator::new();
        let lhs = vrs.allocate(registers::GENERAL_PAIRS);
        let rhs = vrs.allocate(registers::GENERAL_PAIRS);
        let mut cfg = fresh_cfg();
        let mut selector = Z80Selector::new(&mut vrs);
        selector.set_current_block(cfg.entry);
        selector.sub(&mut cfg, lhs, rhs).unwrap();
        let ops: Vec<Opcode> = cfg.block(cfg.entry).instructions.iter().map(|mi| mi.opcode).collect();
        let clear = ops.iter().position(|o| *o == Opcode::ClearCarry).unwrap();
        let sbc = ops.iter().position(|o| *o == Opcode::SubtractWithCarry).unwrap();
        assert!(clear < sbc);
    }

    #[test]
    fn multiply_lowers_to_a_named_runtime_call() {
        let mut vrs = VirtualRegisterAllocator::new();
        let lhs = vrs.allocate(registers::GENERAL_PAIRS);
        let rhs = vrs.allocate(registers::GENERAL_PAIRS);
        let mut cfg = fresh_cfg();
        let mut selector = Z80Selector::new(&mut vrs);
        selector.set_current_block(cfg.entry);
        selector.mul(&mut cfg, lhs, rhs).unwrap();
        let call = cfg
            .block(cfg.entry)
            .instructions
            .iter()
            .find(|mi| mi.opcode == Opcode::Call)
            .unwrap();
        assert_eq!(call.callee.as_ref().unwrap().as_str(), "__mul16");
    }

    #[test]
    fn shift_by_an_immediate_count_unrolls_to_native_shifts() {
        let mut vrs = VirtualRegisterAllocator::new();
        let lhs = vrs.allocate(GENERAL_8);
        let rhs = vrs.allocate_immediate(3, Size::Bit8);
        let mut cfg = fresh_cfg();
        let mut selector = Z80Selector::new(&mut vrs);
        selector.set_current_block(cfg.entry);
        selector.shl(&mut cfg, lhs, rhs).unwrap();
        let shifts = cfg
            .block(cfg.entry)
            .instructions
            .iter()
            .filter(|mi| mi.opcode == Opcode::ShiftLeft)
            .count();
        assert_eq!(shifts, 3);
    }

    #[test]
    fn compare_value_merges_through_a_fresh_block() {
        let mut vrs = VirtualRegisterAllocator::new();
        let lhs = vrs.allocate(GENERAL_8);
        let rhs = vrs.allocate(GENERAL_8);
        let mut cfg = fresh_cfg();
        let before = cfg.len();
        let mut selector = Z80Selector::new(&mut vrs);
        selector.set_current_block(cfg.entry);
        selector.compare_value(&mut cfg, BinOp::Lt, lhs, rhs).unwrap();
        assert_eq!(cfg.len(), before + 3);
    }
}
