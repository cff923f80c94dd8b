//! Structural self-checks over an already-lowered `Cfg`, gated behind
//! `pipeline::Options::enable_verifier` so a release embedder doesn't pay
//! for them. Each function here re-checks one cluster of the invariants
//! and testable properties spec'd for the pipeline; a violation is reported
//! as `MalformedSir` since it always indicates an upstream programming
//! error, never a condition a well-formed SIR can trigger at runtime.

use crate::cfg::{Cfg, LabelKind};
use crate::descriptor::InstructionDescriptorTable;
use crate::error::{CodegenError, CodegenResult};
use crate::isa::Opcode;
use crate::vreg::{VirtualRegisterAllocator, VrKind};

fn malformed(cfg: &Cfg, detail: impl Into<String>) -> CodegenError {
    CodegenError::MalformedSir {
        function: cfg.function_name.clone(),
        detail: detail.into(),
    }
}

/// Predecessor/successor coherence, a single Entry/Exit block each, and
/// unreachable blocks carrying no machine instructions.
pub fn verify_cfg_shape(cfg: &Cfg) -> CodegenResult<()> {
    for block in cfg.blocks_in_order() {
        for &succ in &block.successors {
            if !cfg.block(succ).predecessors.contains(&block.id) {
                return Err(malformed(
                    cfg,
                    format!(
                        "block {:?} lists {:?} as a successor, but {:?} does not list it back as a predecessor",
                        block.id, succ, succ
                    ),
                ));
            }
        }
        for &pred in &block.predecessors {
            if !cfg.block(pred).successors.contains(&block.id) {
                return Err(malformed(
                    cfg,
                    format!(
                        "block {:?} lists {:?} as a predecessor, but {:?} does not list it back as a successor",
                        block.id, pred, pred
                    ),
                ));
            }
        }
    }

    if !cfg.block(cfg.entry).predecessors.is_empty() {
        return Err(malformed(cfg, "entry block has predecessors"));
    }
    if !cfg.block(cfg.exit).successors.is_empty() {
        return Err(malformed(cfg, "exit block has successors"));
    }

    let entries = cfg
        .blocks_in_order()
        .filter(|b| b.label == LabelKind::Entry)
        .count();
    let exits = cfg
        .blocks_in_order()
        .filter(|b| b.label == LabelKind::Exit)
        .count();
    if entries != 1 || exits != 1 {
        return Err(malformed(
            cfg,
            format!("expected exactly one entry and one exit block, found {entries} and {exits}"),
        ));
    }

    for block in cfg.blocks_in_order() {
        if !block.is_reachable() && !block.instructions.is_empty() {
            return Err(malformed(
                cfg,
                format!("unreachable block {:?} carries machine instructions", block.id),
            ));
        }
    }

    Ok(())
}

/// Post-allocation/resolution checks: every result VR is allocated, every
/// allocated VR respects its allow-set and size, and an emitted
/// instruction's operand shape matches its target descriptor.
pub fn verify_allocation(
    cfg: &Cfg,
    vrs: &VirtualRegisterAllocator,
    descriptors: &dyn InstructionDescriptorTable,
) -> CodegenResult<()> {
    for block in cfg.blocks_in_order() {
        for instr in &block.instructions {
            if let Some(result) = instr.result {
                if !vrs.get(result).is_allocated() {
                    return Err(malformed(
                        cfg,
                        format!(
                            "result vr {:?} of {:?} was never allocated a register",
                            result, instr.opcode
                        ),
                    ));
                }
            }

            for &vr in instr.operands.iter().chain(instr.result.iter()) {
                let register = vrs.get(vr);
                if let VrKind::Allocated { reg } = &register.kind {
                    if reg.size != register.size {
                        return Err(malformed(
                            cfg,
                            format!("vr {vr:?} was allocated to a register of the wrong size"),
                        ));
                    }
                    let allow_set = register.allow_set();
                    if !allow_set.is_empty() && !allow_set.iter().any(|r| std::ptr::eq(*r, *reg)) {
                        return Err(malformed(
                            cfg,
                            format!("vr {vr:?} was allocated outside its allow-set"),
                        ));
                    }
                }
            }

            // `StoreSequential` and `Call` are the two deliberately
            // variable-arity opcodes; every other opcode's emitted operand
            // shape must match its static descriptor exactly.
            if !matches!(instr.opcode, Opcode::StoreSequential | Opcode::Call) {
                let descriptor = descriptors.descriptor(instr.opcode);
                if !descriptor.matches_operand_count(instr.result.is_some(), instr.operands.len()) {
                    return Err(malformed(
                        cfg,
                        format!("{:?} operand shape does not match its descriptor", instr.opcode),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::LabelKind;
    use crate::isa::z80::registers as z80;
    use crate::isa::z80::DESCRIPTORS;
    use crate::mi::{Category, MachineInstructionBuilder};
    use crate::sir::{Block, FunctionDecl, Symbol};
    use crate::vreg::VirtualRegisterAllocator;

    fn function() -> FunctionDecl {
        FunctionDecl {
            name: Symbol::new("f"),
            params: vec![],
            return_ty: None,
            body: Block::new(vec![]),
        }
    }

    #[test]
    fn a_fresh_cfg_passes_shape_verification() {
        let cfg = Cfg::new(function());
        assert!(verify_cfg_shape(&cfg).is_ok());
    }

    #[test]
    fn a_one_sided_edge_is_rejected() {
        let mut cfg = Cfg::new(function());
        let block = cfg.add_block(LabelKind::FunctionStart);
        cfg.block_mut(cfg.entry).successors.insert(block);
        assert!(verify_cfg_shape(&cfg).is_err());
    }

    #[test]
    fn an_unallocated_result_is_rejected() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let result = vrs.allocate(&[&z80::A]);
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(crate::isa::Opcode::LoadImmediate, Category::Load)
                .result(result)
                .build(),
        );
        assert!(verify_allocation(&cfg, &vrs, &DESCRIPTORS).is_err());
    }

    #[test]
    fn an_allocated_instruction_with_matching_descriptor_passes() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let result = vrs.allocate_fixed(None, &z80::A);
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(crate::isa::Opcode::LoadImmediate, Category::Load)
                .result(result)
                .immediate(1)
                .build(),
        );
        assert!(verify_allocation(&cfg, &vrs, &DESCRIPTORS).is_ok());
    }
}
