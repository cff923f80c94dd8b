//! Backward dataflow over a `Cfg`'s already-selected instructions: per-block
//! Use/Def/LiveIn/LiveOut sets of virtual registers, plus a finer-grained
//! per-instruction split that `InterferenceGraph` and `ResolveUnallocated`
//! both need.
//!
//! `Immediate` and `StackHome` VRs never participate: an immediate carries
//! no register to keep alive, and a stack-home is permanently backed by its
//! frame slot rather than a register a later instruction could clobber.

use crate::cfg::{BlockId, Cfg};
use crate::mi::MachineInstruction;
use crate::vreg::{Vr, VirtualRegisterAllocator, VrKind};
use cranelift_entity::SecondaryMap;
use std::collections::{BTreeSet, HashMap};

/// A set of VR ids. `BTreeSet` keeps iteration order (and therefore any
/// diagnostic built from it) deterministic across runs.
pub type VrSet = BTreeSet<Vr>;

fn participates(vrs: &VirtualRegisterAllocator, vr: Vr) -> bool {
    !matches!(
        vrs.get(vr).kind,
        VrKind::Immediate { .. } | VrKind::StackHome { .. }
    )
}

/// Per-block Use/Def/LiveIn/LiveOut, computed to a fixed point.
pub struct LivenessInfo {
    use_: SecondaryMap<BlockId, VrSet>,
    def: SecondaryMap<BlockId, VrSet>,
    live_in: SecondaryMap<BlockId, VrSet>,
    live_out: SecondaryMap<BlockId, VrSet>,
}

impl LivenessInfo {
    /// Run the analysis over every block of `cfg`.
    ///
    /// `Use[b]` is read-before-written-in-`b`; `Def[b]` is written-in-`b`.
    /// `LiveOut[b]` is the union of successors' `LiveIn`; `LiveIn[b]` is
    /// `Use[b] ∪ (LiveOut[b] \ Def[b])`. Both sets only grow monotonically
    /// during iteration, so the loop below is guaranteed to reach a fixed
    /// point.
    pub fn compute(cfg: &Cfg, vrs: &VirtualRegisterAllocator) -> LivenessInfo {
        let mut use_: SecondaryMap<BlockId, VrSet> = SecondaryMap::new();
        let mut def: SecondaryMap<BlockId, VrSet> = SecondaryMap::new();
        let order: Vec<BlockId> = cfg.block_ids().collect();

        for &id in &order {
            let (u, d) = use_def(&cfg.block(id).instructions, vrs);
            use_[id] = u;
            def[id] = d;
        }

        let mut live_in: SecondaryMap<BlockId, VrSet> = SecondaryMap::new();
        let mut live_out: SecondaryMap<BlockId, VrSet> = SecondaryMap::new();
        for &id in &order {
            live_in[id] = VrSet::new();
            live_out[id] = VrSet::new();
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &id in order.iter().rev() {
                let block = cfg.block(id);
                let mut new_out = VrSet::new();
                for &succ in &block.successors {
                    new_out.extend(live_in[succ].iter().copied());
                }
                if new_out != live_out[id] {
                    live_out[id] = new_out;
                    changed = true;
                }

                let mut new_in = use_[id].clone();
                for vr in live_out[id].difference(&def[id]) {
                    new_in.insert(*vr);
                }
                if new_in != live_in[id] {
                    live_in[id] = new_in;
                    changed = true;
                }
            }
        }

        LivenessInfo {
            use_,
            def,
            live_in,
            live_out,
        }
    }

    pub fn use_of(&self, block: BlockId) -> &VrSet {
        &self.use_[block]
    }

    pub fn def_of(&self, block: BlockId) -> &VrSet {
        &self.def[block]
    }

    pub fn live_in(&self, block: BlockId) -> &VrSet {
        &self.live_in[block]
    }

    pub fn live_out(&self, block: BlockId) -> &VrSet {
        &self.live_out[block]
    }

    pub fn is_live_at(&self, vr: Vr, block: BlockId) -> bool {
        self.live_in[block].contains(&vr)
    }

    pub fn is_live_out_of(&self, vr: Vr, block: BlockId) -> bool {
        self.live_out[block].contains(&vr)
    }

    /// Per-VR list of blocks it is live in (as LiveIn, LiveOut, or a local
    /// Def), in block insertion order.
    pub fn live_ranges(&self) -> HashMap<Vr, Vec<BlockId>> {
        let mut ranges: HashMap<Vr, Vec<BlockId>> = HashMap::new();
        for id in self.use_.keys() {
            let mut present: VrSet = self.live_in[id].clone();
            present.extend(self.live_out[id].iter().copied());
            present.extend(self.def[id].iter().copied());
            for vr in present {
                ranges.entry(vr).or_default().push(id);
            }
        }
        ranges
    }
}

fn use_def(instructions: &[MachineInstruction], vrs: &VirtualRegisterAllocator) -> (VrSet, VrSet) {
    let mut use_ = VrSet::new();
    let mut def = VrSet::new();
    for instr in instructions {
        for &operand in &instr.operands {
            if participates(vrs, operand) && !def.contains(&operand) {
                use_.insert(operand);
            }
        }
        if let Some(result) = instr.result {
            if participates(vrs, result) {
                def.insert(result);
            }
        }
    }
    (use_, def)
}

/// Per-instruction `(live_in, live_out)` pairs for one block's instruction
/// stream, computed by a single backward pass seeded with the block's
/// `LiveOut`. Finer-grained than `LivenessInfo`'s per-block sets: shared by
/// `InterferenceGraph` construction (which needs `live_out` of the
/// instruction defining a VR) and `ResolveUnallocated` (which needs
/// `live_in` of the instruction reading an unallocated operand).
pub fn per_instruction_liveness(
    instructions: &[MachineInstruction],
    block_live_out: &VrSet,
    vrs: &VirtualRegisterAllocator,
) -> Vec<(VrSet, VrSet)> {
    let mut result = vec![(VrSet::new(), VrSet::new()); instructions.len()];
    let mut live = block_live_out.clone();
    for (i, instr) in instructions.iter().enumerate().rev() {
        let live_out = live.clone();
        if let Some(result_vr) = instr.result {
            if participates(vrs, result_vr) {
                live.remove(&result_vr);
            }
        }
        for &operand in &instr.operands {
            if participates(vrs, operand) {
                live.insert(operand);
            }
        }
        result[i] = (live.clone(), live_out);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn a_value_used_only_locally_does_not_escape_its_block() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let a = vrs.allocate(&[&z80::A]);
        let b = vrs.allocate(&[&z80::A]);
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(Opcode::LoadImmediate, Category::Load)
                .result(a)
                .build(),
        );
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(Opcode::Move, Category::Move)
                .result(b)
                .operand(a)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        assert!(liveness.use_of(cfg.entry).is_empty());
        assert!(liveness.live_out(cfg.entry).is_empty());
    }

    #[test]
    fn a_value_defined_upstream_and_used_downstream_is_live_across_the_edge() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let v = vrs.allocate(&[&z80::A]);
        let mid = cfg.add_block(crate::cfg::LabelKind::FunctionStart);
        cfg.add_edge(cfg.entry, mid);
        cfg.add_edge(mid, cfg.exit);
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(Opcode::LoadImmediate, Category::Load)
                .result(v)
                .build(),
        );
        cfg.block_mut(mid).instructions.push(
            MachineInstructionBuilder::new(Opcode::Return, Category::Subroutine)
                .operand(v)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        assert!(liveness.is_live_out_of(v, cfg.entry));
        assert!(liveness.is_live_at(v, mid));
    }

    #[test]
    fn immediates_never_appear_in_use_or_def() {
        let mut cfg = Cfg::new(function());
        let mut vrs = VirtualRegisterAllocator::new();
        let imm = vrs.allocate_immediate(3, crate::isa::registers::Size::Bit8);
        let dst = vrs.allocate(&[&z80::A]);
        cfg.block_mut(cfg.entry).instructions.push(
            MachineInstructionBuilder::new(Opcode::Add, Category::Arithmetic)
                .result(dst)
                .operand(dst)
                .operand(imm)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        assert!(!liveness.def_of(cfg.entry).contains(&imm));
        assert!(!liveness.use_of(cfg.entry).contains(&imm));
    }
}
