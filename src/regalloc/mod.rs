//! Two-phase Chaitin-style graph-coloring register allocator.
//!
//! Phase 1 (simplify) repeatedly removes a VR from the interference graph
//! and pushes it onto a stack, preferring a VR whose degree in the
//! remaining subgraph is already below its colour budget; when none
//! qualifies, a VR is pushed anyway as an optimistic potential spill.
//! Phase 2 (select) pops the stack — the reverse of push order — assigning
//! each VR the first register in its allow-set (or its size class) not
//! already taken by an already-coloured neighbour's alias closure. A result
//! VR that cannot be coloured is a fatal `AllocationFailure`; an operand VR
//! that cannot be coloured is left `Candidate` for `ResolveUnallocated`.

use crate::cfg::Cfg;
use crate::error::{CodegenError, CodegenResult};
use crate::interference::InterferenceGraph;
use crate::isa::registers::{RegRef, RegisterTable};
use crate::sir::Symbol;
use crate::vreg::{Vr, VirtualRegisterAllocator, VrKind};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Drives the two phases over one function's interference graph.
pub struct RegisterAllocator {
    registers: &'static RegisterTable,
}

impl RegisterAllocator {
    pub fn new(registers: &'static RegisterTable) -> Self {
        RegisterAllocator { registers }
    }

    /// Colour every `Candidate` VR mentioned in `graph`, mutating `vrs` in
    /// place. `function` is only used to name a fatal `AllocationFailure`.
    pub fn run(
        &self,
        cfg: &Cfg,
        graph: &InterferenceGraph,
        vrs: &mut VirtualRegisterAllocator,
        function: &Symbol,
    ) -> CodegenResult<()> {
        let results = result_vrs(cfg);

        let mut colors: HashMap<Vr, RegRef> = HashMap::new();
        for vr in graph.nodes() {
            if let Some(reg) = vrs.get(vr).assigned_register() {
                colors.insert(vr, reg);
            }
        }

        let candidates: BTreeSet<Vr> = graph
            .nodes()
            .filter(|&vr| vrs.get(vr).is_candidate())
            .collect();

        let stack = self.simplify(graph, vrs, &candidates, &results);
        self.select(graph, vrs, &mut colors, &results, stack, function)
    }

    /// Phase 1: repeatedly pick a VR to remove from the working subgraph,
    /// preferring operands below their colour budget, then any VR below
    /// budget, then the highest-degree operand (or, if none remain, the
    /// highest-degree result) as an optimistic spill candidate.
    fn simplify(
        &self,
        graph: &InterferenceGraph,
        vrs: &VirtualRegisterAllocator,
        candidates: &BTreeSet<Vr>,
        results: &BTreeSet<Vr>,
    ) -> Vec<Vr> {
        let mut remaining: BTreeSet<Vr> = candidates.clone();
        let mut stack = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let pick = self
                .find_below_budget(graph, vrs, &remaining, |vr| !results.contains(vr))
                .or_else(|| self.find_below_budget(graph, vrs, &remaining, |_| true))
                .or_else(|| self.find_spill_candidate(graph, &remaining, results));
            let vr = pick.expect("remaining is non-empty, so one of the three rules must fire");
            stack.push(vr);
            remaining.remove(&vr);
        }

        stack
    }

    fn find_below_budget(
        &self,
        graph: &InterferenceGraph,
        vrs: &VirtualRegisterAllocator,
        remaining: &BTreeSet<Vr>,
        filter: impl Fn(&Vr) -> bool,
    ) -> Option<Vr> {
        remaining
            .iter()
            .copied()
            .filter(|vr| filter(vr))
            .find(|&vr| {
                let degree = graph.neighbors(vr).filter(|n| remaining.contains(n)).count();
                degree < self.colour_budget(vrs, vr)
            })
    }

    fn find_spill_candidate(
        &self,
        graph: &InterferenceGraph,
        remaining: &BTreeSet<Vr>,
        results: &BTreeSet<Vr>,
    ) -> Option<Vr> {
        let degree_of = |vr: Vr| graph.neighbors(vr).filter(|n| remaining.contains(n)).count();
        let best = |pool: Box<dyn Iterator<Item = Vr> + '_>| {
            pool.max_by_key(|&vr| (degree_of(vr), std::cmp::Reverse(vr)))
        };
        let operands = Box::new(remaining.iter().copied().filter(|vr| !results.contains(vr)));
        best(operands).or_else(|| best(Box::new(remaining.iter().copied())))
    }

    /// The number of registers a VR could plausibly be assigned: the size
    /// of its allow-set if restricted, otherwise every register of its size
    /// in the target.
    fn colour_budget(&self, vrs: &VirtualRegisterAllocator, vr: Vr) -> usize {
        let register = vrs.get(vr);
        let allow_set = register.allow_set();
        if allow_set.is_empty() {
            self.registers.of_size(register.size).count()
        } else {
            allow_set.len()
        }
    }

    /// Phase 2: pop the stack (the reverse of push order) and assign each
    /// VR the first free register honouring its allow-set, size, and the
    /// alias closure of its already-coloured neighbours.
    fn select(
        &self,
        graph: &InterferenceGraph,
        vrs: &mut VirtualRegisterAllocator,
        colors: &mut HashMap<Vr, RegRef>,
        results: &BTreeSet<Vr>,
        mut stack: Vec<Vr>,
        function: &Symbol,
    ) -> CodegenResult<()> {
        while let Some(vr) = stack.pop() {
            let used: HashSet<RegRef> = graph
                .neighbors(vr)
                .filter_map(|n| colors.get(&n))
                .flat_map(|&reg| self.registers.aliases_of(reg))
                .collect();

            let register = vrs.get(vr);
            let size = register.size;
            let allow_set = register.allow_set();
            let chosen = if allow_set.is_empty() {
                self.registers.of_size(size).find(|r| !used.contains(r))
            } else {
                allow_set.iter().copied().find(|r| !used.contains(r))
            };

            match chosen {
                Some(reg) => {
                    colors.insert(vr, reg);
                    vrs.get_mut(vr).kind = VrKind::Allocated { reg };
                }
                None if results.contains(&vr) => {
                    return Err(CodegenError::AllocationFailure {
                        function: function.clone(),
                    });
                }
                None => {
                    // Operand VRs that fail to colour stay `Candidate`;
                    // `ResolveUnallocated` gives them a register or a frame
                    // slot after this pass.
                }
            }
        }
        Ok(())
    }
}

fn result_vrs(cfg: &Cfg) -> BTreeSet<Vr> {
    let mut results = BTreeSet::new();
    for block in cfg.blocks_in_order() {
        for instr in &block.instructions {
            if let Some(result) = instr.result {
                results.insert(result);
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::LabelKind;
    use crate::isa::z80::registers as z80;
    use crate::isa::Opcode;
    use crate::liveness::LivenessInfo;
    use crate::mi::{Category, MachineInstructionBuilder};
    use crate::sir::{Block, FunctionDecl};

    fn function(name: &str) -> FunctionDecl {
        FunctionDecl {
            name: Symbol::new(name),
            params: vec![],
            return_ty: None,
            body: Block::new(vec![]),
        }
    }

    #[test]
    fn two_simultaneously_live_8_bit_candidates_get_distinct_registers() {
        let mut cfg = Cfg::new(function("f"));
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
        let allocator = RegisterAllocator::new(&z80::TABLE);
        allocator
            .run(&cfg, &graph, &mut vrs, &Symbol::new("f"))
            .unwrap();

        assert!(vrs.get(a).is_allocated());
        assert!(vrs.get(b).is_allocated());
        assert!(vrs.get(c).is_allocated());
        assert_ne!(
            vrs.get(a).assigned_register(),
            vrs.get(b).assigned_register()
        );
    }

    #[test]
    fn a_result_forced_to_collide_with_a_live_neighbour_fails_fatally() {
        let mut cfg = Cfg::new(function("f"));
        let mut vrs = VirtualRegisterAllocator::new();
        // Both VRs restricted to the lone accumulator register and forced
        // to interfere: no colouring exists, and `c` is a result, so this
        // must be a hard `AllocationFailure`, not a deferred `Candidate`.
        let a = vrs.allocate(&[&z80::A]);
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
            MachineInstructionBuilder::new(Opcode::Not, Category::Bitwise)
                .result(c)
                .operand(a)
                .build(),
        );
        instructions.push(
            MachineInstructionBuilder::new(Opcode::Return, Category::Subroutine)
                .operand(a)
                .operand(c)
                .build(),
        );
        let liveness = LivenessInfo::compute(&cfg, &vrs);
        let graph = InterferenceGraph::build(&cfg, &liveness, &vrs);
        let allocator = RegisterAllocator::new(&z80::TABLE);
        let err = allocator
            .run(&cfg, &graph, &mut vrs, &Symbol::new("f"))
            .unwrap_err();
        assert_eq!(
            err,
            CodegenError::AllocationFailure {
                function: Symbol::new("f")
            }
        );
    }
}
