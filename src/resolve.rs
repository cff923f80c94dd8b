//! `ResolveUnallocated`: the pass that runs after `RegisterAllocator` and
//! gives every operand VR still left `Candidate` a concrete location,
//! either a register freed up by a short-lived move or a frame slot.
//!
//! Result VRs never reach this pass `Candidate`: `RegisterAllocator` turns
//! an uncolourable result into a fatal `AllocationFailure` instead.

use crate::cfg::{BlockId, Cfg};
use crate::isa::registers::{RegRef, RegisterTable, Size};
use crate::isa::InstructionFactory;
use crate::liveness::{per_instruction_liveness, LivenessInfo, VrSet};
use crate::mi::MachineInstruction;
use crate::vreg::{Vr, VirtualRegisterAllocator, VrKind};
use cranelift_entity::EntityRef;
use std::collections::BTreeSet;

/// Walk every block's machine instructions, replacing any operand still
/// `Candidate` with either a freshly allocated register (via an inserted
/// move) or a frame slot (via an inserted spill/reload pair).
///
/// `liveness` must be the analysis computed before `RegisterAllocator` ran:
/// allocation only changes a VR's `kind`, never the instruction stream's
/// shape, so the original per-block `LiveOut` sets are still exactly right.
pub fn resolve_unallocated(
    cfg: &mut Cfg,
    liveness: &LivenessInfo,
    vrs: &mut VirtualRegisterAllocator,
    registers: &'static RegisterTable,
    factory: &'static dyn InstructionFactory,
) {
    let block_ids: Vec<BlockId> = cfg.block_ids().collect();
    for block_id in block_ids {
        let live_out_of_block = liveness.live_out(block_id).clone();
        let instructions = cfg.block(block_id).instructions.clone();
        let per_instr = per_instruction_liveness(&instructions, &live_out_of_block, vrs);

        let mut rebuilt = Vec::with_capacity(instructions.len());
        for (instr, (live_in, _live_out)) in instructions.into_iter().zip(per_instr.into_iter()) {
            resolve_instruction(
                &mut cfg.frame,
                instr,
                &live_in,
                vrs,
                registers,
                factory,
                &mut rebuilt,
            );
        }
        cfg.block_mut(block_id).instructions = rebuilt;
    }
}

fn resolve_instruction(
    frame: &mut crate::frame::FrameLayout,
    mut instr: MachineInstruction,
    live_in: &VrSet,
    vrs: &mut VirtualRegisterAllocator,
    registers: &'static RegisterTable,
    factory: &'static dyn InstructionFactory,
    out: &mut Vec<MachineInstruction>,
) {
    for idx in 0..instr.operands.len() {
        let operand = instr.operands[idx];
        if !vrs.get(operand).is_candidate() {
            continue;
        }
        let size = vrs.get(operand).size;
        let used = live_registers_at(live_in, operand, vrs, registers);

        let swap = registers.of_size(size).find(|reg| !used.contains(reg));
        let replacement = match swap {
            Some(reg) => {
                let fresh = vrs.allocate_fixed(None, reg);
                out.push(factory.make_move(fresh, operand));
                fresh
            }
            None => spill_and_reload(frame, operand, size, vrs, registers, factory, out),
        };
        instr.operands[idx] = replacement;
    }
    out.push(instr);
}

/// Every physical register (alias-expanded) already occupied by some other
/// VR live at this instruction.
fn live_registers_at(
    live_in: &VrSet,
    exclude: Vr,
    vrs: &VirtualRegisterAllocator,
    registers: &'static RegisterTable,
) -> Vec<RegRef> {
    let mut used = Vec::new();
    for &vr in live_in {
        if vr == exclude {
            continue;
        }
        if let Some(reg) = vrs.get(vr).assigned_register() {
            used.extend(registers.aliases_of(reg));
        }
    }
    used
}

/// No free register was found for `operand`. Give it a permanent frame slot
/// and route every use through a reload into a scratch register.
///
/// An operand-only `Candidate` (one that never appears as any instruction's
/// result, e.g. an uninitialised local) has no prior instruction that put
/// its value in a register, so there is nothing to genuinely spill on first
/// use: the first encounter allocates a scratch register and spills that
/// placeholder, establishing the frame slot, before reloading from it like
/// every later encounter does.
fn spill_and_reload(
    frame: &mut crate::frame::FrameLayout,
    operand: Vr,
    size: Size,
    vrs: &mut VirtualRegisterAllocator,
    registers: &'static RegisterTable,
    factory: &'static dyn InstructionFactory,
    out: &mut Vec<MachineInstruction>,
) -> Vr {
    let size_bytes = size.bytes();
    let offset = match vrs.get(operand).kind {
        VrKind::StackLocation { offset } => offset,
        _ => {
            let offset = frame.reserve_anonymous(size_bytes);
            let scratch = registers
                .of_size(size)
                .next()
                .expect("target has at least one register of every size it allocates candidates in");
            let placeholder = vrs.allocate_fixed(None, scratch);
            out.push(factory.make_spill(placeholder, offset, size_bytes));
            vrs.get_mut(operand).kind = VrKind::StackLocation { offset };
            offset
        }
    };
    let scratch = registers
        .of_size(size)
        .next()
        .expect("target has at least one register of every size it allocates candidates in");
    let reload_target = vrs.allocate_fixed(None, scratch);
    out.push(factory.make_reload(reload_target, offset, size_bytes));
    reload_target
}

/// Scan the final instruction stream and report every VR that appears as
/// neither a result nor an operand anywhere — dead after resolution, most
/// often a `Candidate` that a swap or spill fully replaced.
pub fn dead_vrs(cfg: &Cfg, vrs: &VirtualRegisterAllocator) -> BTreeSet<Vr> {
    let mut used = BTreeSet::new();
    for block in cfg.blocks_in_order() {
        for instr in &block.instructions {
            used.extend(instr.all_vrs());
        }
    }
    (0..vrs.len())
        .map(Vr::new)
        .filter(|vr| !used.contains(vr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::LabelKind;
    use crate::isa::z80::registers as z80;
    use crate::isa::z80::FACTORY;
    use crate::isa::Opcode;
    use crate::mi::{Category, MachineInstructionBuilder};
    use crate::sir::{Block, FunctionDecl, Symbol};

    fn function() -> FunctionDecl {
        FunctionDecl {
            name: Symbol::new("f"),
            params: vec![],
            return_ty: None,
            body: Block::new(vec![]),
        }
    }

    #[test]
    fn a_candidate_operand_left_uncoloured_is_swapped_into_a_free_register() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let used = vrs.allocate_fixed(None, &z80::A);
        let operand = vrs.allocate(&[&z80::A]);
        let block = cfg.add_block(LabelKind::FunctionStart);
        cfg.add_edge(cfg.entry, block);
        cfg.add_edge(block, cfg.exit);
        cfg.block_mut(block).instructions.push(
            MachineInstructionBuilder::new(Opcode::Return, Category::Subroutine)
                .operand(used)
                .operand(operand)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        resolve_unallocated(&mut cfg, &liveness, &mut vrs, &z80::TABLE, &FACTORY);

        let instrs = &cfg.block(block).instructions;
        assert_eq!(instrs.len(), 2, "a move should be inserted ahead of the use");
        assert_eq!(instrs[0].opcode, Opcode::Move);
        let replaced = instrs[1].operands[1];
        assert!(vrs.get(replaced).is_allocated());
    }

    #[test]
    fn exhausting_every_register_falls_back_to_a_spill_reload_pair() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        // Occupy every 8-bit register so the operand below has nowhere to
        // swap into.
        let occupants: Vec<Vr> = z80::TABLE
            .of_size(Size::Bit8)
            .map(|reg| vrs.allocate_fixed(None, reg))
            .collect();
        let operand = vrs.allocate(&[&z80::A]);
        let block = cfg.add_block(LabelKind::FunctionStart);
        cfg.add_edge(cfg.entry, block);
        cfg.add_edge(block, cfg.exit);
        let mut builder = MachineInstructionBuilder::new(Opcode::Return, Category::Subroutine);
        for &occupant in &occupants {
            builder = builder.operand(occupant);
        }
        builder = builder.operand(operand);
        cfg.block_mut(block).instructions.push(builder.build());

        let liveness = LivenessInfo::compute(&cfg, &vrs);
        resolve_unallocated(&mut cfg, &liveness, &mut vrs, &z80::TABLE, &FACTORY);

        let instrs = &cfg.block(block).instructions;
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Store));
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Load));
        assert!(cfg.frame.frame_size() > 0);
    }

    #[test]
    fn dead_vrs_reports_a_swapped_out_candidate() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let used = vrs.allocate_fixed(None, &z80::A);
        let operand = vrs.allocate(&[&z80::A]);
        let block = cfg.add_block(LabelKind::FunctionStart);
        cfg.add_edge(cfg.entry, block);
        cfg.add_edge(block, cfg.exit);
        cfg.block_mut(block).instructions.push(
            MachineInstructionBuilder::new(Opcode::Return, Category::Subroutine)
                .operand(used)
                .operand(operand)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        resolve_unallocated(&mut cfg, &liveness, &mut vrs, &z80::TABLE, &FACTORY);
        assert!(dead_vrs(&cfg, &vrs).contains(&operand));
    }
}
