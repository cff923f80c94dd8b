//! Builds a `Cfg` from one SIR function by a single recursive walk over its
//! structured body.

use crate::cfg::{BlockId, Cfg, ConditionMarker, LabelKind};
use crate::sir::{Block, FunctionDecl, Stmt};
use cranelift_entity::EntityRef;

/// Build a CFG for `function`, with reserved empty Entry/Exit blocks and
/// one labelled block per structured sub-construct.
pub fn build_cfg(function: FunctionDecl) -> Cfg {
    let mut cfg = Cfg::new(function.clone());
    let start = cfg.add_block(LabelKind::FunctionStart);
    cfg.add_edge(cfg.entry, start);

    let body = function.body.clone();
    let end = walk_block(&mut cfg, start, &body);
    if !cfg.block(end).is_terminated_by_return() {
        let exit = cfg.exit;
        cfg.add_edge(end, exit);
    }
    cfg
}

/// Walk `block`'s statements starting from `current`, appending plain
/// statements verbatim and splitting on control flow. Returns the block
/// that execution falls out of (which may already be return-terminated).
fn walk_block(cfg: &mut Cfg, mut current: BlockId, block: &Block) -> BlockId {
    for stmt in &block.0 {
        current = walk_stmt(cfg, current, stmt);
        if cfg.block(current).is_terminated_by_return() {
            break;
        }
    }
    current
}

fn walk_stmt(cfg: &mut Cfg, current: BlockId, stmt: &Stmt) -> BlockId {
    match stmt {
        Stmt::VarDecl(_) | Stmt::Assign { .. } | Stmt::ExprStmt(_) | Stmt::Return(_) => {
            cfg.block_mut(current).statements.push(stmt.clone());
            current
        }
        Stmt::If {
            cond,
            then_branch,
            elsifs,
            else_branch,
        } => walk_if(cfg, current, cond, then_branch, elsifs, else_branch),
        Stmt::For { header, body } => walk_for(cfg, current, header, body),
        Stmt::Select {
            scrutinee,
            cases,
            else_branch,
        } => walk_select(cfg, current, scrutinee, cases, else_branch),
    }
}

fn disambiguator(id: BlockId) -> u32 {
    id.index() as u32
}

fn walk_if(
    cfg: &mut Cfg,
    current: BlockId,
    cond: &crate::sir::Expr,
    then_branch: &Block,
    elsifs: &[(crate::sir::Expr, Block)],
    else_branch: &Option<Block>,
) -> BlockId {
    let disambig = disambiguator(current);
    let merge = cfg.add_block(LabelKind::IfMerge(disambig));

    let then_block = cfg.add_block(LabelKind::IfThen(disambig));
    cfg.add_edge(current, then_block);
    cfg.block_mut(current).terminator = Some(ConditionMarker::Condition(cond.clone(), then_block));
    let then_end = walk_block(cfg, then_block, then_branch);
    if !cfg.block(then_end).is_terminated_by_return() {
        cfg.add_edge(then_end, merge);
    }

    let mut prev_cond_block = current;
    for (econd, ebody) in elsifs {
        let cond_disambig = disambiguator(prev_cond_block);
        let cond_block = cfg.add_block(LabelKind::ElsifCond(cond_disambig));
        cfg.add_edge(prev_cond_block, cond_block);

        let branch_disambig = disambiguator(cond_block);
        let branch_block = cfg.add_block(LabelKind::ElsifThen(branch_disambig));
        cfg.add_edge(cond_block, branch_block);
        cfg.block_mut(cond_block).terminator =
            Some(ConditionMarker::Condition(econd.clone(), branch_block));

        let branch_end = walk_block(cfg, branch_block, ebody);
        if !cfg.block(branch_end).is_terminated_by_return() {
            cfg.add_edge(branch_end, merge);
        }
        prev_cond_block = cond_block;
    }

    match else_branch {
        Some(else_body) => {
            let else_disambig = disambiguator(prev_cond_block);
            let else_block = cfg.add_block(LabelKind::IfElse(else_disambig));
            cfg.add_edge(prev_cond_block, else_block);
            let else_end = walk_block(cfg, else_block, else_body);
            if !cfg.block(else_end).is_terminated_by_return() {
                cfg.add_edge(else_end, merge);
            }
        }
        None => {
            cfg.add_edge(prev_cond_block, merge);
        }
    }

    merge
}

fn walk_for(cfg: &mut Cfg, current: BlockId, header: &crate::sir::ForHeader, body: &Block) -> BlockId {
    let mut current = current;
    if let Some(init) = &header.init {
        current = walk_stmt(cfg, current, init);
    }

    let disambig = disambiguator(current);
    let cond_block = cfg.add_block(LabelKind::ForCond(disambig));
    cfg.add_edge(current, cond_block);

    let body_block = cfg.add_block(LabelKind::ForBody(disambig));
    let exit_block = cfg.add_block(LabelKind::ForExit(disambig));
    cfg.add_edge(cond_block, body_block);
    cfg.add_edge(cond_block, exit_block);

    if let Some(cond) = &header.cond {
        cfg.block_mut(cond_block).terminator =
            Some(ConditionMarker::Condition(cond.clone(), body_block));
    }

    let body_end = walk_block(cfg, body_block, body);
    if !cfg.block(body_end).is_terminated_by_return() {
        let inc_block = cfg.add_block(LabelKind::ForInc(disambig));
        cfg.add_edge(body_end, inc_block);
        if let Some(inc) = &header.inc {
            walk_stmt(cfg, inc_block, inc);
        }
        cfg.add_edge(inc_block, cond_block);
    }

    exit_block
}

fn walk_select(
    cfg: &mut Cfg,
    current: BlockId,
    scrutinee: &crate::sir::Expr,
    cases: &[crate::sir::SelectCase],
    else_branch: &Option<Block>,
) -> BlockId {
    let disambig = disambiguator(current);
    let merge = cfg.add_block(LabelKind::SelectMerge(disambig));

    let mut arms = Vec::with_capacity(cases.len());
    for (i, case) in cases.iter().enumerate() {
        let case_block = cfg.add_block(LabelKind::SelectCase(disambig * 100 + i as u32));
        cfg.add_edge(current, case_block);
        let case_end = walk_block(cfg, case_block, &case.body);
        if !cfg.block(case_end).is_terminated_by_return() {
            cfg.add_edge(case_end, merge);
        }
        arms.push((case.value.clone(), case_block));
    }

    let fall_through = match else_branch {
        Some(else_body) => {
            let else_block = cfg.add_block(LabelKind::SelectElse(disambig));
            cfg.add_edge(current, else_block);
            let else_end = walk_block(cfg, else_block, else_body);
            if !cfg.block(else_end).is_terminated_by_return() {
                cfg.add_edge(else_end, merge);
            }
            else_block
        }
        None => {
            cfg.add_edge(current, merge);
            merge
        }
    };

    cfg.block_mut(current).terminator =
        Some(ConditionMarker::Select(scrutinee.clone(), arms, fall_through));
    merge
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sir::{Symbol, Type};

    fn function(body: Vec<Stmt>) -> FunctionDecl {
        FunctionDecl {
            name: Symbol::new("main"),
            params: vec![],
            return_ty: None,
            body: Block::new(body),
        }
    }

    #[test]
    fn empty_function_has_three_blocks_in_a_line() {
        let cfg = build_cfg(function(vec![]));
        assert_eq!(cfg.len(), 3);
        let start = *cfg.block(cfg.entry).successors.iter().next().unwrap();
        assert_eq!(cfg.block(start).label, LabelKind::FunctionStart);
        assert!(cfg.block(start).successors.contains(&cfg.exit));
        assert!(cfg.block(cfg.entry).instructions.is_empty());
        assert!(cfg.block(cfg.exit).instructions.is_empty());
    }

    #[test]
    fn straight_line_keeps_one_block() {
        use crate::sir::{ConstValue, Expr, ExprKind, VarDecl};
        use cranelift_entity::EntityRef;

        let mk = |n: u32, v: i8| Expr {
            id: crate::sir::ExprId::new(n as usize),
            ty: Type::I8,
            kind: ExprKind::Const(ConstValue::I8(v)),
        };
        let body = vec![
            Stmt::VarDecl(VarDecl {
                name: Symbol::new("x"),
                ty: Type::I8,
                init: Some(mk(0, 5)),
            }),
            Stmt::VarDecl(VarDecl {
                name: Symbol::new("y"),
                ty: Type::I8,
                init: Some(mk(1, 10)),
            }),
        ];
        let cfg = build_cfg(function(body));
        assert_eq!(cfg.len(), 3);
        let start = *cfg.block(cfg.entry).successors.iter().next().unwrap();
        assert_eq!(cfg.block(start).statements.len(), 2);
    }

    #[test]
    fn if_else_produces_then_else_merge() {
        use crate::sir::{ConstValue, Expr, ExprKind};
        use cranelift_entity::EntityRef;

        let cond = Expr {
            id: crate::sir::ExprId::new(0),
            ty: Type::Bool,
            kind: ExprKind::Const(ConstValue::Bool(true)),
        };
        let body = vec![Stmt::If {
            cond,
            then_branch: Block::new(vec![]),
            elsifs: vec![],
            else_branch: Some(Block::new(vec![])),
        }];
        let cfg = build_cfg(function(body));
        // entry, start, then, else, merge, exit
        assert_eq!(cfg.len(), 6);
        let start = *cfg.block(cfg.entry).successors.iter().next().unwrap();
        assert_eq!(cfg.block(start).successors.len(), 2);
    }

    #[test]
    fn return_in_branch_skips_merge_fallthrough() {
        use crate::sir::{ConstValue, Expr, ExprKind};
        use cranelift_entity::EntityRef;

        let cond = Expr {
            id: crate::sir::ExprId::new(0),
            ty: Type::Bool,
            kind: ExprKind::Const(ConstValue::Bool(true)),
        };
        let ret_val = Expr {
            id: crate::sir::ExprId::new(1),
            ty: Type::I8,
            kind: ExprKind::Const(ConstValue::I8(42)),
        };
        let body = vec![Stmt::If {
            cond,
            then_branch: Block::new(vec![Stmt::Return(Some(ret_val))]),
            elsifs: vec![],
            else_branch: None,
        }];
        let cfg = build_cfg(function(body));
        let start = *cfg.block(cfg.entry).successors.iter().next().unwrap();
        let then_block = *cfg
            .block(start)
            .successors
            .iter()
            .find(|id| matches!(cfg.block(**id).label, LabelKind::IfThen(_)))
            .unwrap();
        assert!(cfg.block(then_block).is_terminated_by_return());
        assert!(cfg.block(then_block).successors.contains(&cfg.exit));
        assert_eq!(cfg.block(then_block).successors.len(), 1);
    }

    #[test]
    fn counted_loop_has_back_edge_from_inc_to_cond() {
        use crate::sir::ForHeader;

        let body = vec![Stmt::For {
            header: ForHeader {
                init: None,
                cond: None,
                inc: None,
            },
            body: Block::new(vec![]),
        }];
        let cfg = build_cfg(function(body));
        let start = *cfg.block(cfg.entry).successors.iter().next().unwrap();
        let cond_block = *cfg
            .block(start)
            .successors
            .iter()
            .find(|id| matches!(cfg.block(**id).label, LabelKind::ForCond(_)))
            .unwrap();
        assert_eq!(cfg.block(cond_block).successors.len(), 2);
        let inc_block = *cfg
            .block_ids()
            .find(|id| matches!(cfg.block(*id).label, LabelKind::ForInc(_)))
            .unwrap();
        assert!(cfg.block(inc_block).successors.contains(&cond_block));
        assert!(cfg.block(cond_block).predecessors.contains(&inc_block));
    }
}
