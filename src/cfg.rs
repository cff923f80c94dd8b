//! The control-flow graph produced by `CFGBuilder` and populated in place
//! by instruction selection.

use crate::frame::FrameLayout;
use crate::mi::MachineInstruction;
use crate::sir::{Expr, FunctionDecl, Stmt, Symbol};
use cranelift_entity::{entity_impl, EntityRef, PrimaryMap};
use std::collections::BTreeSet;

/// The condition a block's terminator evaluates, set aside from its plain
/// statement list so instruction selection can emit the right branch shape
/// without re-walking the original structured tree.
#[derive(Debug, Clone)]
pub enum ConditionMarker {
    /// An `if`, `elsif`, or `for` condition: evaluate in branch mode,
    /// branching to `taken` on true and falling through to the block's
    /// other successor otherwise. `taken` is recorded explicitly by
    /// `cfgbuild` rather than derived from successor-set order, since
    /// `BlockId` allocation order doesn't always match source order (the
    /// merge block of an `if` with no `else`, for instance, is allocated
    /// before its `then` block).
    Condition(Expr, BlockId),
    /// A `select` scrutinee together with each case's value paired with the
    /// block `cfgbuild` already wired it to, and the block to fall through
    /// to once every case has been tested and missed (the `else` block if
    /// one exists, otherwise the merge block directly). Pairing values with
    /// blocks here, rather than re-deriving the pairing from successor-set
    /// order in selection, is what keeps a `select` with no `else` from
    /// wiring its first case to the merge block instead of its own body.
    Select(Expr, Vec<(Expr, BlockId)>, BlockId),
}

/// An opaque reference to a `BasicBlock`, stable within one CFG.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// What role a block plays in the structured SIR it was built from. Carries
/// a disambiguator (the id of the block that controls the construct) so
/// every label is unique within the CFG even when a function has several
/// `if` statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelKind {
    Entry,
    Exit,
    FunctionStart,
    IfThen(u32),
    IfElse(u32),
    IfMerge(u32),
    ElsifCond(u32),
    ElsifThen(u32),
    ForCond(u32),
    ForBody(u32),
    ForInc(u32),
    ForExit(u32),
    SelectCase(u32),
    SelectElse(u32),
    SelectMerge(u32),
    Unreachable,
}

impl LabelKind {
    /// Textual label, globally unique within one CFG given its
    /// disambiguator.
    pub fn as_label(&self) -> String {
        match self {
            LabelKind::Entry => "entry".to_string(),
            LabelKind::Exit => "exit".to_string(),
            LabelKind::FunctionStart => "function-start".to_string(),
            LabelKind::IfThen(d) => format!("if.then.{d}"),
            LabelKind::IfElse(d) => format!("if.else.{d}"),
            LabelKind::IfMerge(d) => format!("if.merge.{d}"),
            LabelKind::ElsifCond(d) => format!("elsif.cond.{d}"),
            LabelKind::ElsifThen(d) => format!("elsif.then.{d}"),
            LabelKind::ForCond(d) => format!("for.cond.{d}"),
            LabelKind::ForBody(d) => format!("for.body.{d}"),
            LabelKind::ForInc(d) => format!("for.inc.{d}"),
            LabelKind::ForExit(d) => format!("for.exit.{d}"),
            LabelKind::SelectCase(d) => format!("select.case.{d}"),
            LabelKind::SelectElse(d) => format!("select.else.{d}"),
            LabelKind::SelectMerge(d) => format!("select.merge.{d}"),
            LabelKind::Unreachable => "unreachable".to_string(),
        }
    }
}

/// A maximal straight-line sequence of statements with a single entry and
/// single exit.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub label: LabelKind,
    /// Plain (non-control-flow) SIR statements attached at build time, in
    /// source order: variable declarations, assignments, expression
    /// statements, and a trailing `return` if the block ends in one.
    pub statements: Vec<Stmt>,
    /// The condition this block's terminator evaluates, if it ends in a
    /// branch rather than a `return` or a plain fall-through.
    pub terminator: Option<ConditionMarker>,
    /// Machine instructions produced by selection, in emission order.
    pub instructions: Vec<MachineInstruction>,
    pub successors: BTreeSet<BlockId>,
    pub predecessors: BTreeSet<BlockId>,
}

impl BasicBlock {
    fn new(id: BlockId, label: LabelKind) -> Self {
        BasicBlock {
            id,
            label,
            statements: Vec::new(),
            terminator: None,
            instructions: Vec::new(),
            successors: BTreeSet::new(),
            predecessors: BTreeSet::new(),
        }
    }

    /// Has this block's last statement already returned? Only such blocks
    /// are exempt from receiving a synthetic merge/fall-through edge.
    pub fn is_terminated_by_return(&self) -> bool {
        matches!(self.statements.last(), Some(Stmt::Return(_)))
    }

    /// Is this block reachable, i.e. does it have at least one predecessor
    /// or is it the function-start block?
    pub fn is_reachable(&self) -> bool {
        !self.predecessors.is_empty() || matches!(self.label, LabelKind::FunctionStart)
    }
}

/// One function's control-flow graph.
pub struct Cfg {
    pub function_name: Symbol,
    pub declaration: FunctionDecl,
    pub frame: FrameLayout,
    blocks: PrimaryMap<BlockId, BasicBlock>,
    pub entry: BlockId,
    pub exit: BlockId,
    /// Insertion order of all blocks; iteration elsewhere over "all blocks"
    /// must use this order, not map iteration order, to keep allocation
    /// deterministic.
    order: Vec<BlockId>,
}

impl Cfg {
    /// Create a CFG with just its reserved, empty Entry and Exit blocks.
    pub fn new(declaration: FunctionDecl) -> Self {
        let mut blocks = PrimaryMap::new();
        let entry = blocks.push(BasicBlock::new(BlockId::new(0), LabelKind::Entry));
        let exit_id = BlockId::new(1);
        let exit = blocks.push(BasicBlock::new(exit_id, LabelKind::Exit));
        Cfg {
            function_name: declaration.name.clone(),
            declaration,
            frame: FrameLayout::new(),
            blocks,
            entry,
            exit,
            order: vec![entry, exit_id],
        }
    }

    /// Allocate a fresh block with `label`, recorded at the end of the
    /// insertion order.
    pub fn add_block(&mut self, label: LabelKind) -> BlockId {
        let id = self.blocks.next_key();
        self.blocks.push(BasicBlock::new(id, label));
        self.order.push(id);
        id
    }

    /// Record a directed edge, keeping both endpoints' sets consistent.
    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from].successors.insert(to);
        self.blocks[to].predecessors.insert(from);
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id]
    }

    /// All blocks in insertion order (entry first, exit anywhere).
    pub fn blocks_in_order(&self) -> impl Iterator<Item = &BasicBlock> {
        self.order.iter().map(move |id| &self.blocks[*id])
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sir::{Block, Type};

    fn empty_function() -> FunctionDecl {
        FunctionDecl {
            name: Symbol::new("main"),
            params: vec![],
            return_ty: None,
            body: Block::new(vec![]),
        }
    }

    #[test]
    fn fresh_cfg_has_entry_and_exit_only() {
        let cfg = Cfg::new(empty_function());
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.block(cfg.entry).label, LabelKind::Entry);
        assert_eq!(cfg.block(cfg.exit).label, LabelKind::Exit);
        assert!(cfg.block(cfg.entry).predecessors.is_empty());
        assert!(cfg.block(cfg.exit).successors.is_empty());
    }

    #[test]
    fn add_edge_is_mutually_consistent() {
        let mut cfg = Cfg::new(empty_function());
        let start = cfg.add_block(LabelKind::FunctionStart);
        cfg.add_edge(cfg.entry, start);
        assert!(cfg.block(cfg.entry).successors.contains(&start));
        assert!(cfg.block(start).predecessors.contains(&cfg.entry));
    }

    #[test]
    fn unreturn_ed_block_is_not_terminated() {
        let cfg = Cfg::new(empty_function());
        assert!(!cfg.block(cfg.entry).is_terminated_by_return());
    }

    #[test]
    fn type_size_bytes_used_by_frame_layout() {
        assert_eq!(Type::I16.size_bytes(), 2);
    }
}
