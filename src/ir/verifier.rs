//! # IR Verifier
//!
//! Structural and SSA invariant checks, run after construction and after
//! every optimisation pass. A failure here is an internal error: the
//! diagnostic names the offending function, block and instruction.
//!
//! Checks performed per function:
//!
//! 1. every block ends in exactly one terminator, with none elsewhere;
//! 2. every block is reachable from the entry and every non-entry block has
//!    at least one predecessor;
//! 3. users sets are exactly bidirectional with operands;
//! 4. operands obey dominance — a parameter, a definition in a dominating
//!    block (or earlier in the same block), or, inside a phi, a definition
//!    dominating the end of the matching predecessor;
//! 5. phis appear only at block start, with exactly one incoming per CFG
//!    predecessor;
//! 6. call arity and argument types match the callee signature (one level of
//!    pointer indirection for indirect calls);
//! 7. operand types match the opcode signature, and no `bitcast` changes
//!    integer width.

use std::collections::HashMap;

use super::dom::DomTree;
use super::function::Function;
use super::instruction::{BlockId, Callee, CastOp, InstKind, ValueId};
use super::module::{FuncId, Module};
use super::types::TypeKind;
use crate::error::{BasaltError, Result};

/// Verify every function of `module`.
pub fn verify_module(module: &Module) -> Result<()> {
    for f in module.func_ids() {
        verify_function(module, f)?;
    }
    Ok(())
}

/// Verify a single function.
pub fn verify_function(module: &Module, id: FuncId) -> Result<()> {
    let func = module.function(id);
    let name = module.func_name(id).to_string();
    let fail = |msg: String| -> Result<()> {
        Err(BasaltError::VerifierError(format!("fn @{}: {}", name, msg)))
    };

    if func.flags.is_extern {
        if func.block_order().is_empty() {
            return Ok(());
        }
        return fail("extern function has a body".to_string());
    }
    if func.entry().is_none() {
        return fail("function has no entry block".to_string());
    }

    // Block structure: one terminator, at the end.
    for &b in func.block_order() {
        let insts = func.block_insts(b);
        if insts.is_empty() {
            return fail(format!("block {} is empty", b));
        }
        for (i, &v) in insts.iter().enumerate() {
            let is_last = i + 1 == insts.len();
            let kind = func.kind(v);
            if kind.is_terminator() != is_last {
                if is_last {
                    return fail(format!("block {} does not end in a terminator", b));
                }
                return fail(format!("terminator {} in the middle of block {}", v, b));
            }
            if matches!(kind, InstKind::Phi { .. }) && !is_phi_position(func, b, i) {
                return fail(format!("{} is a phi not at the start of block {}", v, b));
            }
            if func.inst(v).block != Some(b) {
                return fail(format!("{} has a stale block back-reference", v));
            }
        }
    }

    // Reachability and predecessor presence.
    let dom = DomTree::compute(func);
    for &b in func.block_order() {
        if !dom.is_reachable(b) {
            return fail(format!("block {} is unreachable from the entry", b));
        }
        if Some(b) != func.entry() && func.predecessors(b).is_empty() {
            return fail(format!("non-entry block {} has no predecessors", b));
        }
    }

    // Intra-block positions for the same-block dominance case.
    let mut position: HashMap<ValueId, (BlockId, usize)> = HashMap::new();
    for &b in func.block_order() {
        for (i, &v) in func.block_insts(b).iter().enumerate() {
            position.insert(v, (b, i));
        }
    }

    // Users sets are bidirectional.
    for v in func.inst_ids() {
        for op in func.kind(v).operands() {
            if !func.users(op).contains(&v) {
                return fail(format!("{} uses {} but is not in its users set", v, op));
            }
        }
        for &u in func.users(v) {
            if !func.kind(u).operands().contains(&v) {
                return fail(format!("{} lists user {} which does not use it", v, u));
            }
        }
    }

    // Dominance and phi well-formedness, then type discipline.
    for &b in func.block_order() {
        for &v in func.block_insts(b) {
            check_operand_dominance(func, &dom, &position, b, v).map_err(|m| {
                BasaltError::VerifierError(format!("fn @{}: {}", name, m))
            })?;
            check_types(module, func, v).map_err(|m| {
                BasaltError::VerifierError(format!("fn @{}: {}", name, m))
            })?;
        }
    }

    Ok(())
}

fn is_phi_position(func: &Function, b: BlockId, idx: usize) -> bool {
    func.block_insts(b)
        .iter()
        .take(idx)
        .all(|&v| matches!(func.kind(v), InstKind::Phi { .. }))
}

fn check_operand_dominance(
    func: &Function,
    dom: &DomTree,
    position: &HashMap<ValueId, (BlockId, usize)>,
    block: BlockId,
    v: ValueId,
) -> std::result::Result<(), String> {
    let kind = func.kind(v);

    if let InstKind::Phi { incoming } = kind {
        let mut preds = func.predecessors(block);
        preds.sort();
        let mut named: Vec<BlockId> = incoming.iter().map(|(b, _)| *b).collect();
        named.sort();
        if preds != named {
            return Err(format!(
                "phi {} incoming blocks do not match the predecessors of {}",
                v, block
            ));
        }
        for (pred, val) in incoming {
            if matches!(func.kind(*val), InstKind::Parameter { .. }) {
                continue;
            }
            // The value must dominate the end of the matching predecessor.
            let (def_block, _) = position
                .get(val)
                .ok_or_else(|| format!("phi {} references detached value {}", v, val))?;
            if !dom.dominates(*def_block, *pred) {
                return Err(format!(
                    "phi {} operand {} does not dominate the end of predecessor {}",
                    v, val, pred
                ));
            }
        }
        return Ok(());
    }

    for op in kind.operands() {
        if matches!(func.kind(op), InstKind::Parameter { .. }) {
            continue;
        }
        let (def_block, def_idx) = position
            .get(&op)
            .ok_or_else(|| format!("{} references detached value {}", v, op))?;
        if *def_block == block {
            let use_idx = func
                .position_in_block(v)
                .ok_or_else(|| format!("{} is not in a block", v))?;
            if *def_idx >= use_idx {
                return Err(format!("{} is used by {} before its definition", op, v));
            }
        } else if !dom.dominates(*def_block, block) {
            return Err(format!(
                "definition of {} in {} does not dominate its use {} in {}",
                op, def_block, v, block
            ));
        }
    }
    Ok(())
}

fn check_types(
    module: &Module,
    func: &Function,
    v: ValueId,
) -> std::result::Result<(), String> {
    let types = &module.types;
    let kind = func.kind(v);
    let ty = func.ty(v);
    match kind {
        InstKind::Immediate { .. } => {
            if !types.is_integer(ty) && !types.is_bool(ty) {
                return Err(format!("immediate {} has non-integer type", v));
            }
        }
        InstKind::Binary { op, lhs, rhs } => {
            let lt = func.ty(*lhs);
            if lt != func.ty(*rhs) || lt != ty {
                return Err(format!("{} {} has mismatched operand types", op, v));
            }
            if !types.is_integer(ty) && !types.is_bool(ty) {
                return Err(format!("{} {} applied to non-integer type", op, v));
            }
        }
        InstKind::Not { value } => {
            if func.ty(*value) != ty {
                return Err(format!("not {} changes type", v));
            }
        }
        InstKind::Cmp { op, lhs, rhs } => {
            if func.ty(*lhs) != func.ty(*rhs) {
                return Err(format!("{} {} compares different types", op, v));
            }
            if !types.is_bool(ty) {
                return Err(format!("{} {} does not produce bool", op, v));
            }
        }
        InstKind::Cast { op, value } => {
            let from = func.ty(*value);
            check_cast(module, *op, from, ty, v)?;
        }
        InstKind::Load { addr } => {
            let at = func.ty(*addr);
            match types.pointee(at) {
                Some(p) if p == ty => {}
                Some(_) => return Err(format!("load {} type differs from pointee", v)),
                None => return Err(format!("load {} address is not a pointer", v)),
            }
        }
        InstKind::Store { value, addr } => {
            let at = func.ty(*addr);
            match types.pointee(at) {
                Some(p) if p == func.ty(*value) => {}
                Some(_) => return Err(format!("store {} value differs from pointee", v)),
                None => return Err(format!("store {} address is not a pointer", v)),
            }
        }
        InstKind::CondBranch { cond, .. } => {
            if !types.is_bool(func.ty(*cond)) {
                return Err(format!("branch condition of {} is not bool", v));
            }
        }
        InstKind::Return { value } => match value {
            Some(rv) => {
                if func.ty(*rv) != func.ret_ty {
                    return Err(format!("return {} does not match the return type", v));
                }
            }
            None => {
                if !types.is_void(func.ret_ty) {
                    return Err(format!("return {} misses a value", v));
                }
            }
        },
        InstKind::Phi { incoming } => {
            for (_, val) in incoming {
                if func.ty(*val) != ty {
                    return Err(format!("phi {} has mixed incoming types", v));
                }
            }
        }
        InstKind::Call { callee, args, .. } => {
            let (param_tys, ret, variadic) = match callee {
                Callee::Direct(f) => {
                    let callee_fn = module.function(*f);
                    let params: Vec<_> =
                        callee_fn.params().iter().map(|&p| callee_fn.ty(p)).collect();
                    (params, callee_fn.ret_ty, false)
                }
                Callee::Indirect(target) => {
                    let tt = func.ty(*target);
                    let pointee = types
                        .pointee(tt)
                        .ok_or_else(|| format!("call {} target is not a pointer", v))?;
                    match types.kind(pointee) {
                        TypeKind::Function {
                            ret,
                            params,
                            variadic,
                            ..
                        } => (params.clone(), *ret, *variadic),
                        _ => {
                            return Err(format!(
                                "call {} target does not point to a function",
                                v
                            ))
                        }
                    }
                }
            };
            if args.len() < param_tys.len() || (!variadic && args.len() != param_tys.len()) {
                return Err(format!(
                    "call {} passes {} arguments, callee expects {}",
                    v,
                    args.len(),
                    param_tys.len()
                ));
            }
            for (i, (&a, &pt)) in args.iter().zip(param_tys.iter()).enumerate() {
                if func.ty(a) != pt {
                    return Err(format!("call {} argument {} has the wrong type", v, i));
                }
            }
            if ret != ty {
                return Err(format!("call {} result type differs from callee", v));
            }
        }
        InstKind::StaticRef { global } => {
            if global.index() >= module.global_ids().count() {
                return Err(format!("static reference {} to a foreign symbol", v));
            }
        }
        InstKind::FuncRef { func: f } => {
            if f.index() >= module.function_count() {
                return Err(format!("function reference {} to a foreign symbol", v));
            }
        }
        InstKind::Alloca { .. }
        | InstKind::Branch { .. }
        | InstKind::Unreachable
        | InstKind::Parameter { .. } => {}
        InstKind::Placeholder => {
            return Err(format!("placeholder {} linked into a block", v));
        }
    }
    Ok(())
}

fn check_cast(
    module: &Module,
    op: CastOp,
    from: super::types::TypeId,
    to: super::types::TypeId,
    v: ValueId,
) -> std::result::Result<(), String> {
    let types = &module.types;
    let int_width = |t| types.int_bits(t).map(u64::from);
    match op {
        CastOp::ZExt | CastOp::SExt => match (int_width(from), int_width(to)) {
            (Some(f), Some(t)) if t > f => Ok(()),
            _ => Err(format!("{} {} must widen an integer", op, v)),
        },
        CastOp::Trunc => match (int_width(from), int_width(to)) {
            (Some(f), Some(t)) if t < f => Ok(()),
            _ => Err(format!("trunc {} must narrow an integer", v)),
        },
        CastOp::Bitcast => {
            // Width changes through bitcast are rejected; extension and
            // truncation must be explicit.
            match (int_width(from), int_width(to)) {
                (Some(f), Some(t)) if f != t => {
                    Err(format!("bitcast {} changes integer width", v))
                }
                _ => Ok(()),
            }
        }
        CastOp::IntToPtr => {
            if types.is_integer(from) && types.is_pointer(to) {
                Ok(())
            } else {
                Err(format!("inttoptr {} has the wrong operand types", v))
            }
        }
        CastOp::PtrToInt => {
            if types.is_pointer(from) && types.is_integer(to) {
                Ok(())
            } else {
                Err(format!("ptrtoint {} has the wrong operand types", v))
            }
        }
    }
}
