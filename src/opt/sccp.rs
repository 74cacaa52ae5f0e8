//! Sparse conditional constant propagation.
//!
//! Optimistic lattice evaluation over SSA: values start unknown, are lowered
//! to constants where every reaching operand is constant, and hit bottom
//! otherwise. Blocks only become executable when a branch can actually reach
//! them, so code guarded by a constant condition folds away entirely. After
//! the fixpoint, constant values are rewritten to immediates, constant
//! conditional branches become unconditional, and stranded blocks are
//! deleted.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::dce::{collapse_trivial_phis, remove_unreachable_blocks};
use super::Pass;
use crate::ir::instruction::{BinaryOp, BlockId, CastOp, CmpOp, InstKind, ValueId};
use crate::ir::module::{FuncId, Module};
use crate::ir::types::TypeId;

#[derive(Default)]
pub struct SparseConditionalConstants;

impl Pass for SparseConditionalConstants {
    fn name(&self) -> &'static str {
        "sccp"
    }

    fn description(&self) -> &'static str {
        "Propagates constants over SSA and folds constant branches"
    }

    fn run(&mut self, module: &mut Module) -> Result<bool, String> {
        let mut changed = false;
        let ids: Vec<FuncId> = module.func_ids().collect();
        for id in ids {
            if module.function(id).flags.is_extern {
                continue;
            }
            changed |= run_function(module, id);
        }
        Ok(changed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lattice {
    /// Not yet seen along any executable path.
    Top,
    Const(i64),
    /// Known to vary at run time.
    Bottom,
}

fn meet(a: Lattice, b: Lattice) -> Lattice {
    match (a, b) {
        (Lattice::Top, x) | (x, Lattice::Top) => x,
        (Lattice::Const(x), Lattice::Const(y)) if x == y => Lattice::Const(x),
        _ => Lattice::Bottom,
    }
}

struct Solver<'a> {
    module: &'a Module,
    func: FuncId,
    values: HashMap<ValueId, Lattice>,
    executable: HashSet<BlockId>,
    block_worklist: VecDeque<BlockId>,
    ssa_worklist: VecDeque<ValueId>,
}

impl<'a> Solver<'a> {
    fn solve(module: &'a Module, func: FuncId) -> Self {
        let mut solver = Self {
            module,
            func,
            values: HashMap::new(),
            executable: HashSet::new(),
            block_worklist: VecDeque::new(),
            ssa_worklist: VecDeque::new(),
        };
        let f = module.function(func);
        for &p in f.params() {
            solver.values.insert(p, Lattice::Bottom);
        }
        if let Some(entry) = f.entry() {
            solver.mark_executable(entry);
        }
        solver.run_to_fixpoint();
        solver
    }

    fn lattice(&self, v: ValueId) -> Lattice {
        self.values.get(&v).copied().unwrap_or(Lattice::Top)
    }

    fn mark_executable(&mut self, b: BlockId) {
        if self.executable.insert(b) {
            self.block_worklist.push_back(b);
        } else {
            // Re-entering an executable block only needs its phis revisited.
            let f = self.module.function(self.func);
            for &v in f.block_insts(b) {
                if matches!(f.kind(v), InstKind::Phi { .. }) {
                    self.ssa_worklist.push_back(v);
                } else {
                    break;
                }
            }
        }
    }

    fn run_to_fixpoint(&mut self) {
        let f = self.module.function(self.func);
        loop {
            if let Some(b) = self.block_worklist.pop_front() {
                for &v in f.block_insts(b) {
                    self.visit(v);
                }
                continue;
            }
            if let Some(v) = self.ssa_worklist.pop_front() {
                let Some(b) = f.inst(v).block else { continue };
                if self.executable.contains(&b) {
                    self.visit(v);
                }
                continue;
            }
            break;
        }
    }

    fn visit(&mut self, v: ValueId) {
        let f = self.module.function(self.func);
        let kind = f.kind(v).clone();

        // Terminators steer block executability instead of producing values.
        match &kind {
            InstKind::Branch { target } => {
                self.mark_executable(*target);
                return;
            }
            InstKind::CondBranch {
                cond,
                then_dest,
                else_dest,
            } => {
                match self.lattice(*cond) {
                    Lattice::Top => {}
                    Lattice::Const(c) => {
                        let taken = if c != 0 { *then_dest } else { *else_dest };
                        self.mark_executable(taken);
                    }
                    Lattice::Bottom => {
                        self.mark_executable(*then_dest);
                        self.mark_executable(*else_dest);
                    }
                }
                return;
            }
            InstKind::Return { .. } | InstKind::Unreachable => return,
            _ => {}
        }

        let new = self.evaluate(&kind, f.ty(v));
        let old = self.lattice(v);
        if new != old {
            self.values.insert(v, new);
            for &u in f.users(v) {
                self.ssa_worklist.push_back(u);
            }
        }
    }

    fn evaluate(&self, kind: &InstKind, ty: TypeId) -> Lattice {
        let types = &self.module.types;
        let width = |t: TypeId| -> u8 {
            if types.is_bool(t) {
                1
            } else {
                types.int_bits(t).unwrap_or(64)
            }
        };
        match kind {
            InstKind::Immediate { value } => Lattice::Const(*value),
            InstKind::Binary { op, lhs, rhs } => {
                match (self.lattice(*lhs), self.lattice(*rhs)) {
                    (Lattice::Bottom, _) | (_, Lattice::Bottom) => Lattice::Bottom,
                    (Lattice::Top, _) | (_, Lattice::Top) => Lattice::Top,
                    (Lattice::Const(a), Lattice::Const(b)) => {
                        let signed = types.int_signed(ty).unwrap_or(false);
                        match fold_binary(*op, a, b, width(ty), signed) {
                            Some(v) => Lattice::Const(v),
                            None => Lattice::Bottom,
                        }
                    }
                }
            }
            InstKind::Not { value } => match self.lattice(*value) {
                Lattice::Const(a) => Lattice::Const(mask_to(!a, width(ty))),
                other => other,
            },
            InstKind::Cmp { op, lhs, rhs } => {
                let f = self.module.function(self.func);
                let operand_ty = f.ty(*lhs);
                match (self.lattice(*lhs), self.lattice(*rhs)) {
                    (Lattice::Bottom, _) | (_, Lattice::Bottom) => Lattice::Bottom,
                    (Lattice::Top, _) | (_, Lattice::Top) => Lattice::Top,
                    (Lattice::Const(a), Lattice::Const(b)) => {
                        Lattice::Const(fold_cmp(*op, a, b, width(operand_ty)) as i64)
                    }
                }
            }
            InstKind::Cast { op, value } => {
                let f = self.module.function(self.func);
                let from_bits = width(f.ty(*value));
                match (op, self.lattice(*value)) {
                    (_, Lattice::Top) => Lattice::Top,
                    (_, Lattice::Bottom) => Lattice::Bottom,
                    (CastOp::ZExt, Lattice::Const(a)) => {
                        Lattice::Const(mask_to(a, from_bits))
                    }
                    (CastOp::SExt, Lattice::Const(a)) => {
                        Lattice::Const(sign_extend(a, from_bits))
                    }
                    (CastOp::Trunc, Lattice::Const(a)) => {
                        Lattice::Const(mask_to(a, width(ty)))
                    }
                    (CastOp::Bitcast, Lattice::Const(a)) => Lattice::Const(a),
                    // Pointer-integer conversions are not folded.
                    (CastOp::IntToPtr | CastOp::PtrToInt, Lattice::Const(_)) => Lattice::Bottom,
                }
            }
            InstKind::Phi { incoming } => {
                let mut acc = Lattice::Top;
                for (pred, value) in incoming {
                    if !self.executable.contains(pred) {
                        continue;
                    }
                    acc = meet(acc, self.lattice(*value));
                }
                acc
            }
            // Loads, calls, allocas, symbol addresses and parameters vary.
            _ => Lattice::Bottom,
        }
    }
}

fn run_function(module: &mut Module, id: FuncId) -> bool {
    let solver = Solver::solve(module, id);
    let constants: Vec<(ValueId, i64)> = {
        let f = module.function(id);
        f.inst_ids()
            .filter(|&v| f.inst(v).block.is_some())
            .filter_map(|v| match solver.lattice(v) {
                Lattice::Const(c) if !matches!(f.kind(v), InstKind::Immediate { .. }) => {
                    Some((v, c))
                }
                _ => None,
            })
            .collect()
    };
    let folded_branches: Vec<(ValueId, BlockId, BlockId)> = {
        let f = module.function(id);
        f.block_order()
            .iter()
            .filter_map(|&b| f.terminator(b))
            .filter_map(|t| match f.kind(t) {
                InstKind::CondBranch {
                    cond,
                    then_dest,
                    else_dest,
                } => match solver.lattice(*cond) {
                    Lattice::Const(c) => {
                        let taken = if c != 0 { *then_dest } else { *else_dest };
                        let dead = if c != 0 { *else_dest } else { *then_dest };
                        Some((t, taken, dead))
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect()
    };
    drop(solver);

    let mut changed = false;
    let func = module.function_mut(id);

    for (v, c) in constants {
        func.replace_kind(v, InstKind::Immediate { value: c });
        changed = true;
    }

    for (term, taken, dead) in folded_branches {
        let Some(this_block) = func.inst(term).block else { continue };
        debug!("folding constant branch in {}", this_block);
        func.replace_kind(term, InstKind::Branch { target: taken });
        if dead != taken {
            // The untaken successor loses this predecessor edge.
            let phis: Vec<ValueId> = func
                .block_insts(dead)
                .iter()
                .copied()
                .filter(|&v| matches!(func.kind(v), InstKind::Phi { .. }))
                .collect();
            for phi in phis {
                if let InstKind::Phi { incoming } = func.kind(phi) {
                    let filtered: Vec<_> = incoming
                        .iter()
                        .copied()
                        .filter(|(pred, _)| *pred != this_block)
                        .collect();
                    func.replace_kind(phi, InstKind::Phi { incoming: filtered });
                }
            }
        }
        changed = true;
    }

    if changed {
        remove_unreachable_blocks(func);
        collapse_trivial_phis(func);
    }
    changed
}

// --- Constant folding helpers ---

fn mask_to(value: i64, bits: u8) -> i64 {
    if bits >= 64 {
        value
    } else {
        value & ((1i64 << bits) - 1)
    }
}

fn sign_extend(value: i64, bits: u8) -> i64 {
    if bits >= 64 {
        value
    } else {
        let shift = 64 - bits as u32;
        (value << shift) >> shift
    }
}

fn fold_binary(op: BinaryOp, lhs: i64, rhs: i64, bits: u8, signed: bool) -> Option<i64> {
    let (a, b) = if signed {
        (sign_extend(lhs, bits), sign_extend(rhs, bits))
    } else {
        (mask_to(lhs, bits), mask_to(rhs, bits))
    };
    let raw = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::UDiv => {
            let (ua, ub) = (mask_to(lhs, bits) as u64, mask_to(rhs, bits) as u64);
            if ub == 0 {
                return None;
            }
            (ua / ub) as i64
        }
        BinaryOp::SDiv => {
            if b == 0 || (a == i64::MIN && b == -1) {
                return None;
            }
            a.wrapping_div(b)
        }
        BinaryOp::URem => {
            let (ua, ub) = (mask_to(lhs, bits) as u64, mask_to(rhs, bits) as u64);
            if ub == 0 {
                return None;
            }
            (ua % ub) as i64
        }
        BinaryOp::SRem => {
            if b == 0 || (a == i64::MIN && b == -1) {
                return None;
            }
            a.wrapping_rem(b)
        }
        BinaryOp::Shl => {
            let amt = mask_to(rhs, bits) as u64;
            if amt >= bits as u64 {
                return None;
            }
            a.wrapping_shl(amt as u32)
        }
        BinaryOp::LShr => {
            let amt = mask_to(rhs, bits) as u64;
            if amt >= bits as u64 {
                return None;
            }
            ((mask_to(lhs, bits) as u64) >> amt) as i64
        }
        BinaryOp::AShr => {
            let amt = mask_to(rhs, bits) as u64;
            if amt >= bits as u64 {
                return None;
            }
            sign_extend(lhs, bits) >> amt
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
    };
    Some(mask_to(raw, bits))
}

fn fold_cmp(op: CmpOp, lhs: i64, rhs: i64, bits: u8) -> bool {
    let (sa, sb) = (sign_extend(lhs, bits), sign_extend(rhs, bits));
    let (ua, ub) = (mask_to(lhs, bits) as u64, mask_to(rhs, bits) as u64);
    match op {
        CmpOp::Eq => ua == ub,
        CmpOp::Ne => ua != ub,
        CmpOp::ULt => ua < ub,
        CmpOp::ULe => ua <= ub,
        CmpOp::UGt => ua > ub,
        CmpOp::UGe => ua >= ub,
        CmpOp::SLt => sa < sb,
        CmpOp::SLe => sa <= sb,
        CmpOp::SGt => sa > sb,
        CmpOp::SGe => sa >= sb,
    }
}
