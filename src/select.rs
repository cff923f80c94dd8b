//! Target-agnostic instruction-selection driver and the target contract it
//! drives.
//!
//! `InstructionSelector` is the capability bundle a concrete target
//! implements (the "HOW" of lowering one arithmetic/memory/control-flow
//! operation into that target's opcodes). `SelectInstructions` is the
//! generic walk over every CFG that calls into it in the right order,
//! threads `ExprContext` through short-circuit evaluation, and maintains
//! the value-mode expression cache — none of that logic is target-specific.

use crate::cfg::{BlockId, Cfg, ConditionMarker, LabelKind};
use crate::descriptor::InstructionDescriptorTable;
use crate::error::{CodegenError, CodegenResult};
use crate::isa::registers::{RegisterTable, Size};
use crate::isa::{CallingConvention, ParamLocation};
use crate::sir::{
    BinOp, CompilationUnit, ConstValue, Expr, ExprId, ExprKind, FieldInit, Stmt, Symbol, Type,
    UnOp,
};
use crate::vreg::{Vr, VirtualRegisterAllocator};
use cranelift_entity::EntityRef;
use std::collections::HashMap;

/// Whether an expression is being lowered for its boolean control-flow
/// effect or for its materialised value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Value,
    Branch,
}

/// Context threaded through expression lowering.
#[derive(Debug, Clone)]
pub struct ExprContext {
    pub mode: Mode,
    pub true_block: Option<BlockId>,
    pub false_block: Option<BlockId>,
    /// Set only while evaluating the initializer of a named variable, so
    /// an array initializer nested inside it knows which symbol's frame
    /// slot to allocate under.
    pub target_symbol: Option<Symbol>,
}

impl ExprContext {
    pub fn value() -> Self {
        ExprContext {
            mode: Mode::Value,
            true_block: None,
            false_block: None,
            target_symbol: None,
        }
    }

    pub fn branch(true_block: BlockId, false_block: BlockId) -> Self {
        ExprContext {
            mode: Mode::Branch,
            true_block: Some(true_block),
            false_block: Some(false_block),
            target_symbol: None,
        }
    }

    pub fn with_target_symbol(mut self, symbol: Symbol) -> Self {
        self.target_symbol = Some(symbol);
        self
    }

    /// The same branch context with its taken/not-taken blocks swapped,
    /// used to lower `!a` by flipping what "true" means to `a`.
    fn swapped(&self) -> Self {
        ExprContext {
            mode: self.mode,
            true_block: self.false_block,
            false_block: self.true_block,
            target_symbol: self.target_symbol.clone(),
        }
    }

    /// A value-mode context that drops any branch targets but keeps the
    /// target symbol (used when recursing into a value-mode sub-expression
    /// from within a branch-mode evaluation, e.g. the operands of a
    /// comparison).
    fn as_value(&self) -> Self {
        ExprContext {
            mode: Mode::Value,
            true_block: None,
            false_block: None,
            target_symbol: self.target_symbol.clone(),
        }
    }
}

/// Target-specific lowering of SIR expressions and statements to machine
/// instructions over virtual registers. Every method emits into the
/// selector's current block of `cfg`.
pub trait InstructionSelector {
    fn set_current_block(&mut self, block: BlockId);
    fn current_block(&self) -> BlockId;
    fn calling_convention(&self) -> &'static dyn CallingConvention;
    fn target_registers(&self) -> &'static RegisterTable;
    fn descriptors(&self) -> &'static dyn InstructionDescriptorTable;
    fn vrs(&mut self) -> &mut VirtualRegisterAllocator;

    // Arithmetic
    fn add(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn sub(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn mul(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn div(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn neg(&mut self, cfg: &mut Cfg, operand: Vr) -> CodegenResult<Vr>;

    // Bitwise
    fn bit_and(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn bit_or(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn bit_xor(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn bit_not(&mut self, cfg: &mut Cfg, operand: Vr) -> CodegenResult<Vr>;
    fn shl(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;
    fn shr(&mut self, cfg: &mut Cfg, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;

    /// Branch-mode comparison: emit a compare-and-branch pair to
    /// `taken`/`fall_through`.
    fn compare_branch(
        &mut self,
        cfg: &mut Cfg,
        op: BinOp,
        lhs: Vr,
        rhs: Vr,
        taken: BlockId,
        fall_through: BlockId,
    ) -> CodegenResult<()>;

    /// Value-mode comparison: synthesise a 0/1 boolean VR.
    fn compare_value(&mut self, cfg: &mut Cfg, op: BinOp, lhs: Vr, rhs: Vr) -> CodegenResult<Vr>;

    // Memory
    fn load(&mut self, cfg: &mut Cfg, base: Vr, offset: u32, size: Size) -> CodegenResult<Vr>;
    fn store(
        &mut self,
        cfg: &mut Cfg,
        base: Vr,
        value: Vr,
        offset: u32,
        size: Size,
    ) -> CodegenResult<()>;
    fn load_indexed(
        &mut self,
        cfg: &mut Cfg,
        base: Vr,
        index: Vr,
        elem_size: u32,
        size: Size,
    ) -> CodegenResult<Vr>;
    fn load_constant(&mut self, cfg: &mut Cfg, value: ConstValue) -> CodegenResult<Vr>;
    fn load_stack_address(&mut self, cfg: &mut Cfg, offset: u32) -> CodegenResult<Vr>;
    fn store_sequential(
        &mut self,
        cfg: &mut Cfg,
        base: Vr,
        values: &[Vr],
        elem_size: u32,
    ) -> CodegenResult<()>;

    // Variables: direct frame-slot access for symbols that live in memory
    // rather than in a persistent VR (arrays, struct locals).
    fn load_symbol(&mut self, cfg: &mut Cfg, offset: u32, size: Size) -> CodegenResult<Vr>;
    fn store_symbol(
        &mut self,
        cfg: &mut Cfg,
        offset: u32,
        value: Vr,
        size: Size,
    ) -> CodegenResult<()>;
    fn mov(&mut self, cfg: &mut Cfg, target: Vr, source: Vr) -> CodegenResult<()>;

    // Control flow
    fn jump(&mut self, cfg: &mut Cfg, target: BlockId);
    fn call(
        &mut self,
        cfg: &mut Cfg,
        callee: &Symbol,
        args: &[Vr],
        return_size: Option<Size>,
    ) -> CodegenResult<Option<Vr>>;
    fn emit_return(&mut self, cfg: &mut Cfg, value: Option<Vr>);

    // Function frame
    fn prologue(&mut self, cfg: &mut Cfg, frame_size: u32);
    fn epilogue(&mut self, cfg: &mut Cfg, frame_size: u32);
}

/// Whether a symbol denotes a scalar bound to a persistent VR, or an
/// aggregate backed by a frame slot that must be loaded/stored through
/// memory on every access.
#[derive(Clone)]
enum Binding {
    Scalar(Vr),
    Memory { offset: u32, size_bytes: u32 },
}

/// Per-function state the driver threads through statement and expression
/// lowering: variable bindings and the value-mode expression cache.
struct FunctionScope {
    bindings: HashMap<Symbol, Binding>,
    value_cache: HashMap<ExprId, Vr>,
}

impl FunctionScope {
    fn new() -> Self {
        FunctionScope {
            bindings: HashMap::new(),
            value_cache: HashMap::new(),
        }
    }
}

fn type_size(ty: &Type) -> Size {
    if ty.is_byte_sized() {
        Size::Bit8
    } else {
        Size::Bit16
    }
}

/// Lower every function in `unit` into a fresh CFG using `selector`.
/// Returns one CFG per function, in declaration order.
pub fn select_instructions<S: InstructionSelector>(
    unit: &CompilationUnit,
    selector: &mut S,
) -> CodegenResult<Vec<Cfg>> {
    let mut cfgs = Vec::with_capacity(unit.functions.len());
    for function in &unit.functions {
        let mut cfg = crate::cfgbuild::build_cfg(function.clone());
        lower_function(&mut cfg, selector)?;
        cfgs.push(cfg);
    }
    Ok(cfgs)
}

/// Lower one already-built CFG's SIR statements into machine instructions,
/// threading parameter bindings, the value-mode expression cache and the
/// prologue/epilogue through `selector`. Used directly by [`crate::pipeline`]
/// so each function can flow through liveness/allocation/resolution before
/// the next function's selection begins; [`select_instructions`] is the
/// simpler whole-unit entry point that also builds the CFGs.
pub fn select_function<S: InstructionSelector>(cfg: &mut Cfg, selector: &mut S) -> CodegenResult<()> {
    let mut scope = FunctionScope::new();
    let declaration = cfg.declaration.clone();

    for (index, param) in declaration.params.iter().enumerate() {
        let size = type_size(&param.ty);
        match selector.calling_convention().parameter_location(index, size) {
            ParamLocation::Register(reg) => {
                let vr = selector.vrs().allocate_fixed(Some(param.name.as_str()), reg);
                scope.bindings.insert(param.name.clone(), Binding::Scalar(vr));
            }
            ParamLocation::Stack(offset) => {
                let vr = selector
                    .vrs()
                    .allocate_on_stack(param.name.as_str(), size, offset);
                scope.bindings.insert(param.name.clone(), Binding::Scalar(vr));
            }
        }
    }

    let block_ids: Vec<BlockId> = cfg.block_ids().collect();
    for block_id in block_ids {
        if block_id == cfg.entry || block_id == cfg.exit {
            continue;
        }
        if !cfg.block(block_id).is_reachable() {
            continue;
        }
        selector.set_current_block(block_id);
        lower_block(cfg, selector, &mut scope, block_id, &declaration.name)?;
    }

    if !cfg.frame.is_empty() {
        let frame_size = cfg.frame.frame_size();
        selector.set_current_block(cfg.entry);
        selector.prologue(cfg, frame_size);
        selector.set_current_block(cfg.exit);
        selector.epilogue(cfg, frame_size);
    }

    Ok(())
}

fn lower_block<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    block_id: BlockId,
    function_name: &Symbol,
) -> CodegenResult<()> {
    let statements = cfg.block(block_id).statements.clone();
    for stmt in &statements {
        lower_stmt(cfg, selector, scope, stmt, function_name)?;
    }

    if cfg.block(block_id).is_terminated_by_return() {
        return Ok(());
    }

    let marker = cfg.block(block_id).terminator.clone();
    match marker {
        Some(ConditionMarker::Condition(cond, taken)) => {
            lower_condition(cfg, selector, scope, block_id, &cond, taken, function_name)?;
        }
        Some(ConditionMarker::Select(scrutinee, arms, fall_through)) => {
            lower_select(
                cfg,
                selector,
                scope,
                block_id,
                &scrutinee,
                &arms,
                fall_through,
                function_name,
            )?;
        }
        None => {
            let successors: Vec<BlockId> =
                cfg.block(block_id).successors.iter().copied().collect();
            if let Some(only) = successors.first() {
                selector.jump(cfg, *only);
            }
        }
    }
    Ok(())
}

fn lower_stmt<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    stmt: &Stmt,
    function_name: &Symbol,
) -> CodegenResult<()> {
    match stmt {
        Stmt::VarDecl(decl) => {
            let size = type_size(&decl.ty);
            if matches!(decl.ty, Type::Array(_, _) | Type::Struct(_)) {
                let slot = cfg.frame.add_slot(&decl.name, decl.ty.size_bytes());
                scope.bindings.insert(
                    decl.name.clone(),
                    Binding::Memory {
                        offset: slot.offset,
                        size_bytes: slot.size,
                    },
                );
                if let Some(init) = &decl.init {
                    let ctx = ExprContext::value().with_target_symbol(decl.name.clone());
                    lower_expr(cfg, selector, scope, init, ctx, function_name)?;
                }
            } else {
                let vr = selector.vrs().allocate_named(decl.name.as_str(), &[]);
                scope.bindings.insert(decl.name.clone(), Binding::Scalar(vr));
                if let Some(init) = &decl.init {
                    let value = lower_expr(
                        cfg,
                        selector,
                        scope,
                        init,
                        ExprContext::value(),
                        function_name,
                    )?
                    .ok_or_else(|| malformed(function_name, "variable initializer produced no value"))?;
                    selector.mov(cfg, vr, value)?;
                }
            }
            let _ = size;
            Ok(())
        }
        Stmt::Assign { target, value } => {
            let rhs = lower_expr(
                cfg,
                selector,
                scope,
                value,
                ExprContext::value(),
                function_name,
            )?
            .ok_or_else(|| malformed(function_name, "assignment value produced no value"))?;
            assign_to(cfg, selector, scope, target, rhs, function_name)
        }
        Stmt::ExprStmt(expr) => {
            lower_expr(cfg, selector, scope, expr, ExprContext::value(), function_name)?;
            Ok(())
        }
        Stmt::If { .. } | Stmt::For { .. } | Stmt::Select { .. } => {
            // Control-flow statements are consumed entirely by `cfgbuild`,
            // which records their condition on the block as a
            // `ConditionMarker` and lowers their branches into separate
            // blocks; they never appear in a block's plain statement list.
            unreachable!("control-flow statements are lowered via ConditionMarker")
        }
        Stmt::Return(value) => {
            let value = match value {
                Some(expr) => {
                    let return_size = cfg
                        .declaration
                        .return_ty
                        .as_ref()
                        .map(type_size)
                        .unwrap_or(Size::Bit8);
                    let vr = lower_expr(
                        cfg,
                        selector,
                        scope,
                        expr,
                        ExprContext::value(),
                        function_name,
                    )?
                    .ok_or_else(|| malformed(function_name, "return value produced no value"))?;
                    let return_reg = selector.calling_convention().return_register(return_size);
                    let dest = selector.vrs().allocate_fixed(None, return_reg);
                    selector.mov(cfg, dest, vr)?;
                    Some(dest)
                }
                None => None,
            };
            selector.emit_return(cfg, value);
            Ok(())
        }
    }
}

fn lower_condition<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    block_id: BlockId,
    cond: &Expr,
    taken: BlockId,
    function_name: &Symbol,
) -> CodegenResult<()> {
    let fall_through = cfg
        .block(block_id)
        .successors
        .iter()
        .copied()
        .find(|&s| s != taken)
        .unwrap_or(taken);
    let ctx = ExprContext::branch(taken, fall_through);
    lower_expr(cfg, selector, scope, cond, ctx, function_name)?;
    Ok(())
}

/// Lower a `select` terminator as a chain of equality tests against each
/// case value in turn; taken = that case's own block (as `cfgbuild` wired
/// it), fall-through = the next test's synthetic block, or `fall_through`
/// once every case has been tried and missed.
fn lower_select<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    block_id: BlockId,
    scrutinee: &Expr,
    arms: &[(Expr, BlockId)],
    fall_through: BlockId,
    function_name: &Symbol,
) -> CodegenResult<()> {
    let scrutinee_vr =
        lower_expr(cfg, selector, scope, scrutinee, ExprContext::value(), function_name)?
            .ok_or_else(|| malformed(function_name, "select scrutinee produced no value"))?;
    let mut current = block_id;
    for (value, taken) in arms {
        let case_vr =
            lower_expr(cfg, selector, scope, value, ExprContext::value(), function_name)?
                .ok_or_else(|| malformed(function_name, "select case value produced no value"))?;
        let next = cfg.add_block(LabelKind::Unreachable);
        cfg.add_edge(current, *taken);
        cfg.add_edge(current, next);
        selector.compare_branch(cfg, BinOp::Eq, scrutinee_vr, case_vr, *taken, next)?;
        selector.set_current_block(next);
        current = next;
    }
    cfg.add_edge(current, fall_through);
    selector.jump(cfg, fall_through);
    Ok(())
}

fn assign_to<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    target: &Expr,
    value: Vr,
    function_name: &Symbol,
) -> CodegenResult<()> {
    match &target.kind {
        ExprKind::Symbol(symbol) => match scope.bindings.get(symbol).cloned() {
            Some(Binding::Scalar(vr)) => selector.mov(cfg, vr, value),
            Some(Binding::Memory { offset, .. }) => {
                selector.store_symbol(cfg, offset, value, type_size(&target.ty))
            }
            None => Err(CodegenError::UndefinedSymbol {
                function: function_name.clone(),
                symbol: symbol.clone(),
            }),
        },
        ExprKind::Member { base, offset, size, .. } => {
            let base_vr = lower_expr(cfg, selector, scope, base, ExprContext::value(), function_name)?
                .ok_or_else(|| malformed(function_name, "member assignment base produced no value"))?;
            let sz = if *size <= 1 { Size::Bit8 } else { Size::Bit16 };
            selector.store(cfg, base_vr, value, *offset, sz)
        }
        ExprKind::Subscript { base, index, elem_size } => {
            let base_vr = lower_expr(cfg, selector, scope, base, ExprContext::value(), function_name)?
                .ok_or_else(|| malformed(function_name, "subscript assignment base produced no value"))?;
            let index_vr =
                lower_expr(cfg, selector, scope, index, ExprContext::value(), function_name)?
                    .ok_or_else(|| malformed(function_name, "subscript assignment index produced no value"))?;
            let offset_vr = selector.load_indexed(cfg, base_vr, index_vr, *elem_size, Size::Bit16)?;
            let sz = if *elem_size <= 1 { Size::Bit8 } else { Size::Bit16 };
            selector.store(cfg, offset_vr, value, 0, sz)
        }
        _ => Err(malformed(function_name, "assignment target is not an lvalue")),
    }
}

fn malformed(function: &Symbol, detail: &str) -> CodegenError {
    CodegenError::MalformedSir {
        function: function.clone(),
        detail: detail.to_string(),
    }
}

/// Lower one expression under `ctx`, returning its VR in value mode (or
/// `None` in branch mode, where the effect is entirely the emitted control
/// flow).
fn lower_expr<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    expr: &Expr,
    ctx: ExprContext,
    function_name: &Symbol,
) -> CodegenResult<Option<Vr>> {
    if ctx.mode == Mode::Value {
        if let Some(vr) = scope.value_cache.get(&expr.id) {
            return Ok(Some(*vr));
        }
    }

    match &expr.kind {
        ExprKind::Const(value) => {
            let vr = selector.load_constant(cfg, *value)?;
            if ctx.mode == Mode::Branch {
                emit_truthiness_branch(cfg, selector, vr, &ctx)?;
                Ok(None)
            } else {
                cache_and_return(scope, ctx, expr.id, vr)
            }
        }
        ExprKind::Symbol(symbol) => {
            let vr = match scope.bindings.get(symbol).cloned() {
                Some(Binding::Scalar(vr)) => vr,
                Some(Binding::Memory { offset, size_bytes }) => {
                    let size = if size_bytes <= 1 { Size::Bit8 } else { Size::Bit16 };
                    selector.load_symbol(cfg, offset, size)?
                }
                None => {
                    return Err(CodegenError::UndefinedSymbol {
                        function: function_name.clone(),
                        symbol: symbol.clone(),
                    })
                }
            };
            if ctx.mode == Mode::Branch {
                emit_truthiness_branch(cfg, selector, vr, &ctx)?;
                Ok(None)
            } else {
                cache_and_return(scope, ctx, expr.id, vr)
            }
        }
        ExprKind::Unary { op, operand } => {
            lower_unary(cfg, selector, scope, expr.id, *op, operand, ctx, function_name)
        }
        ExprKind::Binary { op, lhs, rhs } if op.is_logical() => {
            lower_logical(cfg, selector, scope, *op, lhs, rhs, ctx, function_name)
        }
        ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
            lower_comparison(cfg, selector, scope, *op, lhs, rhs, ctx, function_name)
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lhs_vr = lower_expr(cfg, selector, scope, lhs, ctx.as_value(), function_name)?
                .ok_or_else(|| malformed(function_name, "binary lhs produced no value"))?;
            let rhs_vr = lower_expr(cfg, selector, scope, rhs, ctx.as_value(), function_name)?
                .ok_or_else(|| malformed(function_name, "binary rhs produced no value"))?;
            let result = match op {
                BinOp::Add => selector.add(cfg, lhs_vr, rhs_vr)?,
                BinOp::Sub => selector.sub(cfg, lhs_vr, rhs_vr)?,
                BinOp::Mul => selector.mul(cfg, lhs_vr, rhs_vr)?,
                BinOp::Div => selector.div(cfg, lhs_vr, rhs_vr)?,
                BinOp::And => selector.bit_and(cfg, lhs_vr, rhs_vr)?,
                BinOp::Or => selector.bit_or(cfg, lhs_vr, rhs_vr)?,
                BinOp::Xor => selector.bit_xor(cfg, lhs_vr, rhs_vr)?,
                BinOp::Shl => selector.shl(cfg, lhs_vr, rhs_vr)?,
                BinOp::Shr => selector.shr(cfg, lhs_vr, rhs_vr)?,
                BinOp::LogicalAnd | BinOp::LogicalOr => unreachable!("handled above"),
                _ => unreachable!("comparisons handled above"),
            };
            if ctx.mode == Mode::Branch {
                emit_truthiness_branch(cfg, selector, result, &ctx)?;
                Ok(None)
            } else {
                cache_and_return(scope, ctx, expr.id, result)
            }
        }
        ExprKind::Call { callee, args } => {
            let mut arg_vrs = Vec::with_capacity(args.len());
            for (i, arg) in args.iter().enumerate() {
                let synthetic = Symbol::new(&format!("{}$arg{}", callee.as_str(), i));
                let arg_ctx = ExprContext::value().with_target_symbol(synthetic);
                let vr = lower_expr(cfg, selector, scope, arg, arg_ctx, function_name)?
                    .ok_or_else(|| malformed(function_name, "call argument produced no value"))?;
                arg_vrs.push(vr);
            }
            let return_size = if expr.ty == Type::Void { None } else { Some(type_size(&expr.ty)) };
            let result = selector.call(cfg, callee, &arg_vrs, return_size)?;
            match result {
                Some(vr) if ctx.mode == Mode::Value => cache_and_return(scope, ctx, expr.id, vr),
                Some(vr) => {
                    emit_truthiness_branch(cfg, selector, vr, &ctx)?;
                    Ok(None)
                }
                None => Ok(None),
            }
        }
        ExprKind::Member { base, offset, size, .. } => {
            let base_vr = lower_expr(cfg, selector, scope, base, ctx.as_value(), function_name)?
                .ok_or_else(|| malformed(function_name, "member base produced no value"))?;
            let sz = if *size <= 1 { Size::Bit8 } else { Size::Bit16 };
            let vr = selector.load(cfg, base_vr, *offset, sz)?;
            if ctx.mode == Mode::Branch {
                emit_truthiness_branch(cfg, selector, vr, &ctx)?;
                Ok(None)
            } else {
                cache_and_return(scope, ctx, expr.id, vr)
            }
        }
        ExprKind::Subscript { base, index, elem_size } => {
            let base_vr = lower_expr(cfg, selector, scope, base, ctx.as_value(), function_name)?
                .ok_or_else(|| malformed(function_name, "subscript base produced no value"))?;
            let index_vr = lower_expr(cfg, selector, scope, index, ctx.as_value(), function_name)?
                .ok_or_else(|| malformed(function_name, "subscript index produced no value"))?;
            let sz = if *elem_size <= 1 { Size::Bit8 } else { Size::Bit16 };
            let vr = selector.load_indexed(cfg, base_vr, index_vr, *elem_size, sz)?;
            if ctx.mode == Mode::Branch {
                emit_truthiness_branch(cfg, selector, vr, &ctx)?;
                Ok(None)
            } else {
                cache_and_return(scope, ctx, expr.id, vr)
            }
        }
        ExprKind::StructInit { fields, .. } => {
            // Each struct initializer materializes into its own frame slot,
            // named after its target symbol when one is in scope (a `let`
            // binding or an inherited call-argument symbol) and otherwise
            // after its own expression id, so two struct locals never
            // collide on the same offset the way a hardcoded offset 0 would.
            let symbol = ctx
                .target_symbol
                .clone()
                .unwrap_or_else(|| Symbol::new(&format!("$struct{}", expr.id.index())));
            let slot = cfg.frame.add_slot(&symbol, expr.ty.size_bytes());
            let addr = selector.load_stack_address(cfg, slot.offset)?;
            for FieldInit { offset, value, .. } in fields {
                let field_vr =
                    lower_expr(cfg, selector, scope, value, ExprContext::value(), function_name)?
                        .ok_or_else(|| malformed(function_name, "struct field produced no value"))?;
                let sz = type_size(&value.ty);
                selector.store(cfg, addr, field_vr, *offset, sz)?;
            }
            cache_and_return(scope, ctx, expr.id, addr)
        }
        ExprKind::ArrayInit { elements, .. } => {
            let symbol = ctx
                .target_symbol
                .clone()
                .ok_or_else(|| CodegenError::MissingContext {
                    function: function_name.clone(),
                })?;
            if !matches!(expr.ty, Type::Array(_, _)) {
                return Err(CodegenError::TypeMismatch {
                    function: function_name.clone(),
                });
            }
            let slot = cfg.frame.add_slot(&symbol, expr.ty.size_bytes());
            let addr = selector.load_stack_address(cfg, slot.offset)?;
            let mut values = Vec::with_capacity(elements.len());
            for element in elements {
                let elem_ctx = ExprContext::value();
                let vr = lower_expr(cfg, selector, scope, element, elem_ctx, function_name)?
                    .ok_or_else(|| malformed(function_name, "array element produced no value"))?;
                values.push(vr);
            }
            let elem_size = expr.ty.size_bytes() / elements.len().max(1) as u32;
            selector.store_sequential(cfg, addr, &values, elem_size)?;
            cache_and_return(scope, ctx, expr.id, addr)
        }
    }
}

fn lower_unary<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    expr_id: ExprId,
    op: UnOp,
    operand: &Expr,
    ctx: ExprContext,
    function_name: &Symbol,
) -> CodegenResult<Option<Vr>> {
    if op == UnOp::LogicalNot {
        return match ctx.mode {
            Mode::Branch => lower_expr(cfg, selector, scope, operand, ctx.swapped(), function_name),
            Mode::Value => {
                let vr = lower_expr(cfg, selector, scope, operand, ExprContext::value(), function_name)?
                    .ok_or_else(|| malformed(function_name, "logical-not operand produced no value"))?;
                let zero = selector.load_constant(cfg, ConstValue::I8(0))?;
                let result = selector.compare_value(cfg, BinOp::Eq, vr, zero)?;
                cache_and_return(scope, ctx, expr_id, result)
            }
        };
    }
    let vr = lower_expr(cfg, selector, scope, operand, ctx.as_value(), function_name)?
        .ok_or_else(|| malformed(function_name, "unary operand produced no value"))?;
    let result = match op {
        UnOp::Neg => selector.neg(cfg, vr)?,
        UnOp::Not => selector.bit_not(cfg, vr)?,
        UnOp::LogicalNot => unreachable!("handled above"),
    };
    if ctx.mode == Mode::Branch {
        emit_truthiness_branch(cfg, selector, result, &ctx)?;
        Ok(None)
    } else {
        cache_and_return(scope, ctx, expr_id, result)
    }
}

/// Short-circuit lowering of `&&`/`||`. Branch mode threads the
/// taken/not-taken targets through the left operand so the right operand
/// is only reached when it matters; value mode just needs both operands'
/// values with no sharing.
fn lower_logical<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: ExprContext,
    function_name: &Symbol,
) -> CodegenResult<Option<Vr>> {
    match ctx.mode {
        Mode::Branch => {
            let true_block = ctx.true_block.unwrap();
            let false_block = ctx.false_block.unwrap();
            let rhs_block = cfg.add_block(LabelKind::Unreachable);
            cfg.add_edge(selector.current_block(), rhs_block);
            let lhs_ctx = match op {
                BinOp::LogicalAnd => ExprContext::branch(rhs_block, false_block),
                BinOp::LogicalOr => ExprContext::branch(true_block, rhs_block),
                _ => unreachable!(),
            };
            lower_expr(cfg, selector, scope, lhs, lhs_ctx, function_name)?;
            selector.set_current_block(rhs_block);
            let rhs_ctx = ExprContext::branch(true_block, false_block);
            lower_expr(cfg, selector, scope, rhs, rhs_ctx, function_name)?;
            Ok(None)
        }
        Mode::Value => {
            let true_block = cfg.add_block(LabelKind::Unreachable);
            let false_block = cfg.add_block(LabelKind::Unreachable);
            let merge_block = cfg.add_block(LabelKind::Unreachable);
            cfg.add_edge(selector.current_block(), true_block);
            cfg.add_edge(selector.current_block(), false_block);
            cfg.add_edge(true_block, merge_block);
            cfg.add_edge(false_block, merge_block);

            let branch_ctx = ExprContext::branch(true_block, false_block);
            lower_logical(cfg, selector, scope, op, lhs, rhs, branch_ctx, function_name)?;

            let result = selector.vrs().allocate(&[]);
            selector.set_current_block(true_block);
            let one = selector.load_constant(cfg, ConstValue::I8(1))?;
            selector.mov(cfg, result, one)?;
            selector.jump(cfg, merge_block);

            selector.set_current_block(false_block);
            let zero = selector.load_constant(cfg, ConstValue::I8(0))?;
            selector.mov(cfg, result, zero)?;
            selector.jump(cfg, merge_block);

            selector.set_current_block(merge_block);
            Ok(Some(result))
        }
    }
}

fn lower_comparison<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    scope: &mut FunctionScope,
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: ExprContext,
    function_name: &Symbol,
) -> CodegenResult<Option<Vr>> {
    let lhs_vr = lower_expr(cfg, selector, scope, lhs, ctx.as_value(), function_name)?
        .ok_or_else(|| malformed(function_name, "comparison lhs produced no value"))?;
    let rhs_vr = lower_expr(cfg, selector, scope, rhs, ctx.as_value(), function_name)?
        .ok_or_else(|| malformed(function_name, "comparison rhs produced no value"))?;
    match ctx.mode {
        Mode::Branch => {
            selector.compare_branch(
                cfg,
                op,
                lhs_vr,
                rhs_vr,
                ctx.true_block.unwrap(),
                ctx.false_block.unwrap(),
            )?;
            Ok(None)
        }
        Mode::Value => {
            let result = selector.compare_value(cfg, op, lhs_vr, rhs_vr)?;
            Ok(Some(result))
        }
    }
}

fn emit_truthiness_branch<S: InstructionSelector>(
    cfg: &mut Cfg,
    selector: &mut S,
    vr: Vr,
    ctx: &ExprContext,
) -> CodegenResult<()> {
    let zero = selector.load_constant(cfg, ConstValue::I8(0))?;
    selector.compare_branch(
        cfg,
        BinOp::Ne,
        vr,
        zero,
        ctx.true_block.unwrap(),
        ctx.false_block.unwrap(),
    )
}

fn cache_and_return(
    scope: &mut FunctionScope,
    ctx: ExprContext,
    expr_id: ExprId,
    vr: Vr,
) -> CodegenResult<Option<Vr>> {
    if ctx.mode == Mode::Value {
        scope.value_cache.insert(expr_id, vr);
    }
    Ok(Some(vr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_context_carries_both_targets() {
        let ctx = ExprContext::branch(BlockId::new(1), BlockId::new(2));
        assert_eq!(ctx.mode, Mode::Branch);
        assert_eq!(ctx.true_block, Some(BlockId::new(1)));
        assert_eq!(ctx.false_block, Some(BlockId::new(2)));
    }

    #[test]
    fn swapped_exchanges_true_and_false() {
        let ctx = ExprContext::branch(BlockId::new(1), BlockId::new(2));
        let swapped = ctx.swapped();
        assert_eq!(swapped.true_block, Some(BlockId::new(2)));
        assert_eq!(swapped.false_block, Some(BlockId::new(1)));
    }

    #[test]
    fn as_value_drops_branch_targets_but_keeps_symbol() {
        let ctx = ExprContext::branch(BlockId::new(1), BlockId::new(2))
            .with_target_symbol(Symbol::new("arr"));
        let value_ctx = ctx.as_value();
        assert_eq!(value_ctx.mode, Mode::Value);
        assert!(value_ctx.true_block.is_none());
        assert_eq!(value_ctx.target_symbol.as_ref().unwrap().as_str(), "arr");
    }
}
