//! End-to-end orchestration: a SIR `CompilationUnit` in, one allocated
//! `Cfg` per function out.
//!
//! Each function flows through the full pipeline — `CFGBuilder` →
//! `InstructionSelector` → `LivenessAnalysis` → `InterferenceGraph` →
//! `RegisterAllocator` → `ResolveUnallocated` — before the next function's
//! selection begins, so only one function's `VirtualRegisterAllocator` and
//! `FrameLayout` are ever live at a time.

use crate::cfgbuild;
use crate::error::CodegenResult;
use crate::interference::InterferenceGraph;
use crate::isa::TargetIsa;
use crate::liveness::LivenessInfo;
use crate::regalloc::RegisterAllocator;
use crate::resolve;
use crate::select;
use crate::sir::{CompilationUnit, FunctionDecl};
use crate::verify;
use crate::vreg::VirtualRegisterAllocator;
use crate::cfg::Cfg;
use log::debug;

/// Toggles for the pipeline driver, independent of the SIR content being
/// compiled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Re-run the structural self-checks of `verify` after selection and
    /// after allocation/resolution. Off by default: a release embedder that
    /// trusts its own SIR and target pays nothing for them.
    pub enable_verifier: bool,
}

/// Drives one target machine's selector and allocator over a whole
/// compilation unit.
pub struct Backend<'isa> {
    isa: &'isa dyn TargetIsa,
    options: Options,
}

impl<'isa> Backend<'isa> {
    pub fn new(isa: &'isa dyn TargetIsa, options: Options) -> Self {
        Backend { isa, options }
    }

    /// Compile every function in `unit`, in declaration order.
    pub fn compile(&self, unit: &CompilationUnit) -> CodegenResult<Vec<Cfg>> {
        let mut cfgs = Vec::with_capacity(unit.functions.len());
        for function in &unit.functions {
            cfgs.push(self.compile_function(function)?);
        }
        Ok(cfgs)
    }

    fn compile_function(&self, function: &FunctionDecl) -> CodegenResult<Cfg> {
        let mut vrs = VirtualRegisterAllocator::new();
        let mut cfg = cfgbuild::build_cfg(function.clone());
        debug!(
            "built cfg for `{}`: {} blocks",
            function.name,
            cfg.len()
        );

        {
            let mut selector = self.isa.selector(&mut vrs);
            select::select_function(&mut cfg, selector.as_mut())?;
        }
        if self.options.enable_verifier {
            verify::verify_cfg_shape(&cfg)?;
        }

        let liveness = LivenessInfo::compute(&cfg, &vrs);
        let graph = InterferenceGraph::build(&cfg, &liveness, &vrs);
        debug!(
            "`{}`: {} virtual registers over {} interference edges",
            function.name,
            vrs.len(),
            graph.nodes().map(|vr| graph.degree(vr)).sum::<usize>() / 2
        );

        let allocator = RegisterAllocator::new(self.isa.registers());
        allocator.run(&cfg, &graph, &mut vrs, &function.name)?;

        resolve::resolve_unallocated(
            &mut cfg,
            &liveness,
            &mut vrs,
            self.isa.registers(),
            self.isa.factory(),
        );

        let dead = resolve::dead_vrs(&cfg, &vrs);
        if !dead.is_empty() {
            debug!("`{}`: {} virtual registers dead after resolution", function.name, dead.len());
        }

        if self.options.enable_verifier {
            verify::verify_cfg_shape(&cfg)?;
            verify::verify_allocation(&cfg, &vrs, self.isa.descriptors())?;
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::z80::Z80;
    use crate::sir::{Block, Param, Symbol, Type};
    use cranelift_entity::EntityRef;

    fn unit_with_one_trivial_function() -> CompilationUnit {
        CompilationUnit {
            functions: vec![FunctionDecl {
                name: Symbol::new("identity"),
                params: vec![Param {
                    name: Symbol::new("x"),
                    ty: Type::I8,
                }],
                return_ty: Some(Type::I8),
                body: Block::new(vec![crate::sir::Stmt::Return(Some(crate::sir::Expr {
                    id: crate::sir::ExprId::new(0),
                    ty: Type::I8,
                    kind: crate::sir::ExprKind::Symbol(Symbol::new("x")),
                }))]),
            }],
        }
    }

    #[test]
    fn a_trivial_function_compiles_with_the_verifier_on() {
        let unit = unit_with_one_trivial_function();
        let backend = Backend::new(
            &Z80,
            Options {
                enable_verifier: true,
            },
        );
        let cfgs = backend.compile(&unit).unwrap();
        assert_eq!(cfgs.len(), 1);
        assert!(cfgs[0].len() >= 2);
    }
}
