//! The interference graph `RegisterAllocator` colors: an undirected graph
//! over virtual register ids, built from per-instruction liveness in the
//! classic Chaitin formulation — every VR an instruction defines interferes
//! with every VR live immediately after that instruction, except the VR(s)
//! that same instruction also defines.

use crate::cfg::Cfg;
use crate::liveness::{per_instruction_liveness, LivenessInfo};
use crate::vreg::{Vr, VirtualRegisterAllocator, VrKind};
use std::collections::{BTreeMap, BTreeSet};

fn participates(vrs: &VirtualRegisterAllocator, vr: Vr) -> bool {
    !matches!(
        vrs.get(vr).kind,
        VrKind::Immediate { .. } | VrKind::StackHome { .. }
    )
}

/// An undirected graph over the VRs that actually need a physical register.
#[derive(Debug, Default)]
pub struct InterferenceGraph {
    nodes: BTreeSet<Vr>,
    edges: BTreeMap<Vr, BTreeSet<Vr>>,
}

impl InterferenceGraph {
    /// Build the graph for one already-selected CFG.
    ///
    /// A `MachineInstruction` carries at most one result, so "every VR this
    /// instruction defines" is simply its `result`; the "except those also
    /// defined by the same instruction" clause of the classic formulation is
    /// therefore vacuous here and doesn't need separate bookkeeping.
    pub fn build(cfg: &Cfg, liveness: &LivenessInfo, vrs: &VirtualRegisterAllocator) -> Self {
        let mut graph = InterferenceGraph::default();
        for block in cfg.blocks_in_order() {
            let per_instr =
                per_instruction_liveness(&block.instructions, liveness.live_out(block.id), vrs);
            for (instr, (_live_in, live_out)) in block.instructions.iter().zip(per_instr.iter()) {
                for vr in instr.all_vrs() {
                    if participates(vrs, vr) {
                        graph.add_node(vr);
                    }
                }
                if let Some(result) = instr.result {
                    if participates(vrs, result) {
                        for &other in live_out {
                            if other != result {
                                graph.add_edge(result, other);
                            }
                        }
                    }
                }
            }
        }
        graph
    }

    fn add_node(&mut self, vr: Vr) {
        self.nodes.insert(vr);
        self.edges.entry(vr).or_default();
    }

    /// Add an undirected edge. A VR never interferes with itself; the call
    /// is a no-op in that case.
    pub fn add_edge(&mut self, a: Vr, b: Vr) {
        if a == b {
            return;
        }
        self.add_node(a);
        self.add_node(b);
        self.edges.get_mut(&a).unwrap().insert(b);
        self.edges.get_mut(&b).unwrap().insert(a);
    }

    pub fn nodes(&self) -> impl Iterator<Item = Vr> + '_ {
        self.nodes.iter().copied()
    }

    pub fn neighbors(&self, vr: Vr) -> impl Iterator<Item = Vr> + '_ {
        self.edges.get(&vr).into_iter().flatten().copied()
    }

    pub fn degree(&self, vr: Vr) -> usize {
        self.edges.get(&vr).map_or(0, |s| s.len())
    }

    pub fn interferes(&self, a: Vr, b: Vr) -> bool {
        self.edges.get(&a).is_some_and(|s| s.contains(&b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::LabelKind;
    use crate::isa::z80::registers as z80;
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
    fn two_values_simultaneously_live_interfere() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let a = vrs.allocate(&[&z80::A]);
        let b = vrs.allocate(&[&z80::A]);
        let c = vrs.allocate(&[&z80::A]);
        let block = cfg.add_block(LabelKind::FunctionStart);
        cfg.add_edge(cfg.entry, block);
        cfg.add_edge(block, cfg.exit);
        let instructions = &mut cfg.block_mut(block).instructions;
        instructions.push(
            MachineInstructionBuilder::new(Opcode::LoadImmediate, Category::Load)
                .result(a)
                .build(),
        );
        instructions.push(
            MachineInstructionBuilder::new(Opcode::LoadImmediate, Category::Load)
                .result(b)
                .build(),
        );
        instructions.push(
            MachineInstructionBuilder::new(Opcode::Add, Category::Arithmetic)
                .result(c)
                .operand(a)
                .operand(b)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        let graph = InterferenceGraph::build(&cfg, &liveness, &vrs);
        assert!(graph.interferes(a, b));
        assert!(!graph.interferes(a, c), "a is dead once Add consumes it");
    }

    #[test]
    fn a_vr_never_interferes_with_itself() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let a = vrs.allocate(&[&z80::A]);
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(Opcode::LoadImmediate, Category::Load)
                .result(a)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        let graph = InterferenceGraph::build(&cfg, &liveness, &vrs);
        assert_eq!(graph.degree(a), 0);
    }
}
