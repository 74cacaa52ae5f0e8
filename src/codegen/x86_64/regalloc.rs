//! Graph-colouring register allocation.
//!
//! Classical Chaitin/Briggs over the selected x86_64 MIR:
//!
//! 1. liveness by iterative backward dataflow;
//! 2. interference graph with virtual-virtual edges and forbidden physical
//!    colours (the ABI pre-colours argument registers, the accumulator pair
//!    around divisions, and every caller-saved register across calls);
//! 3. simplify/spill/select with the pool size as the colour bound;
//! 4. spilled values get a frame slot with a reload before every use and a
//!    store after every def, then the allocator reruns.
//!
//! Running on fully physical code is a no-op, so allocation is idempotent.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::{BasaltError, Result};
use crate::mir::FrameSlot;
use crate::target::TargetDescription;

use super::abi;
use super::{Addr, Gpr, Inst, Operand, Reg, Size, X64Function};

/// Allocate every virtual register in `func` to a physical register.
pub fn allocate_function(func: &mut X64Function, target: &TargetDescription) -> Result<()> {
    if func.is_fully_allocated() {
        return Ok(());
    }
    let pool = abi::allocatable(target, func.conv);
    let callee_saved = abi::callee_saved(target, func.conv);

    const MAX_ROUNDS: usize = 8;
    for round in 0..MAX_ROUNDS {
        let graph = build_interference(func, target);
        match color(&graph, &pool) {
            Coloring::Complete(assignment) => {
                apply(func, &assignment);
                let mut saved: Vec<Gpr> = assignment
                    .values()
                    .copied()
                    .filter(|g| callee_saved.contains(g))
                    .collect();
                saved.sort();
                saved.dedup();
                func.saved_regs = saved;
                debug!(
                    "allocated {} in {} round(s), {} callee-saved in use",
                    func.name,
                    round + 1,
                    func.saved_regs.len()
                );
                return Ok(());
            }
            Coloring::Spills(nodes) => {
                debug!("spilling {} values in {}", nodes.len(), func.name);
                spill(func, &nodes);
            }
        }
    }
    Err(BasaltError::CodegenError(format!(
        "register allocation did not converge for {}",
        func.name
    )))
}

/// Definitions and uses of one instruction, ABI effects included.
fn defs_uses(
    inst: &Inst,
    func: &X64Function,
    target: &TargetDescription,
) -> (Vec<Reg>, Vec<Reg>) {
    let mut defs = Vec::new();
    let mut uses = Vec::new();
    let base_of = |a: &Addr, uses: &mut Vec<Reg>| {
        if let Addr::Base { base, .. } = a {
            uses.push(*base);
        }
    };
    match inst {
        Inst::Mov { dst, src, .. } => {
            defs.push(*dst);
            if let Operand::Reg(r) = src {
                uses.push(*r);
            }
        }
        Inst::MovAbs { dst, .. } => defs.push(*dst),
        Inst::Load { dst, addr, .. } => {
            defs.push(*dst);
            base_of(addr, &mut uses);
        }
        Inst::StoreReg { src, addr, .. } => {
            uses.push(*src);
            base_of(addr, &mut uses);
        }
        Inst::StoreImm { addr, .. } => base_of(addr, &mut uses),
        Inst::Movzx { dst, src, .. } | Inst::Movsx { dst, src, .. } => {
            defs.push(*dst);
            uses.push(*src);
        }
        Inst::Alu { dst, src, .. } | Inst::Imul { dst, src, .. } => {
            defs.push(*dst);
            uses.push(*dst);
            if let Operand::Reg(r) = src {
                uses.push(*r);
            }
        }
        Inst::Cqo { .. } => {
            defs.push(Reg::Phys(Gpr::Rdx));
            uses.push(Reg::Phys(Gpr::Rax));
        }
        Inst::Idiv { divisor, .. } | Inst::Div { divisor, .. } => {
            defs.push(Reg::Phys(Gpr::Rax));
            defs.push(Reg::Phys(Gpr::Rdx));
            uses.push(Reg::Phys(Gpr::Rax));
            uses.push(Reg::Phys(Gpr::Rdx));
            uses.push(*divisor);
        }
        Inst::Shift { dst, amount, .. } => {
            defs.push(*dst);
            uses.push(*dst);
            if amount.is_none() {
                uses.push(Reg::Phys(Gpr::Rcx));
            }
        }
        Inst::Not { dst, .. } | Inst::Neg { dst, .. } => {
            defs.push(*dst);
            uses.push(*dst);
        }
        Inst::Cmp { lhs, rhs, .. } => {
            uses.push(*lhs);
            if let Operand::Reg(r) = rhs {
                uses.push(*r);
            }
        }
        Inst::Test { lhs, rhs, .. } => {
            uses.push(*lhs);
            uses.push(*rhs);
        }
        Inst::Setcc { dst, .. } => defs.push(*dst),
        Inst::Lea { dst, addr } => {
            defs.push(*dst);
            base_of(addr, &mut uses);
        }
        Inst::Call { dest, uses: args } => {
            if let super::CallDest::Reg(r) = dest {
                uses.push(*r);
            }
            for g in args {
                uses.push(Reg::Phys(*g));
            }
            for g in abi::caller_saved(target, func.conv) {
                defs.push(Reg::Phys(g));
            }
        }
        Inst::TailJmp { dest, uses: args } => {
            if let super::CallDest::Reg(r) = dest {
                uses.push(*r);
            }
            for g in args {
                uses.push(Reg::Phys(*g));
            }
        }
        Inst::Push { src } => uses.push(*src),
        Inst::Pop { dst } => defs.push(*dst),
        Inst::Ret => {
            if func.returns_value {
                uses.push(Reg::Phys(Gpr::Rax));
            }
        }
        Inst::Jmp { .. } | Inst::Jcc { .. } | Inst::AdjustSp { .. } | Inst::Ud2 => {}
    }
    let tracked = |r: &Reg| !matches!(r, Reg::Phys(Gpr::Rsp) | Reg::Phys(Gpr::Rbp));
    defs.retain(tracked);
    uses.retain(tracked);
    (defs, uses)
}

struct Interference {
    /// Virtual-virtual adjacency.
    adj: HashMap<u32, HashSet<u32>>,
    /// Physical colours each virtual register may not take.
    forbidden: HashMap<u32, HashSet<Gpr>>,
}

fn build_interference(func: &X64Function, target: &TargetDescription) -> Interference {
    // Block-level liveness first.
    let index: HashMap<&str, usize> = func
        .blocks
        .iter()
        .enumerate()
        .map(|(i, (l, _))| (l.as_str(), i))
        .collect();
    let n = func.blocks.len();
    let mut live_in: Vec<HashSet<Reg>> = vec![HashSet::new(); n];
    let mut live_out: Vec<HashSet<Reg>> = vec![HashSet::new(); n];

    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..n).rev() {
            let mut out: HashSet<Reg> = HashSet::new();
            for succ in X64Function::successors(&func.blocks[b].1) {
                if let Some(&s) = index.get(succ) {
                    out.extend(live_in[s].iter().copied());
                }
            }
            let mut live = out.clone();
            for inst in func.blocks[b].1.iter().rev() {
                let (defs, uses) = defs_uses(inst, func, target);
                for d in &defs {
                    live.remove(d);
                }
                for u in uses {
                    live.insert(u);
                }
            }
            if out != live_out[b] || live != live_in[b] {
                changed = true;
                live_out[b] = out;
                live_in[b] = live;
            }
        }
    }

    // Interference edges from a backward walk of each block.
    let mut graph = Interference {
        adj: HashMap::new(),
        forbidden: HashMap::new(),
    };
    let mut edge = |graph: &mut Interference, a: Reg, b: Reg| {
        if a == b {
            return;
        }
        match (a, b) {
            (Reg::Virtual(x), Reg::Virtual(y)) => {
                graph.adj.entry(x).or_default().insert(y);
                graph.adj.entry(y).or_default().insert(x);
            }
            (Reg::Virtual(x), Reg::Phys(g)) | (Reg::Phys(g), Reg::Virtual(x)) => {
                graph.forbidden.entry(x).or_default().insert(g);
            }
            (Reg::Phys(_), Reg::Phys(_)) => {}
        }
    };

    for (b, (_, insts)) in func.blocks.iter().enumerate() {
        let mut live = live_out[b].clone();
        for inst in insts.iter().rev() {
            let (defs, uses) = defs_uses(inst, func, target);
            // A plain register move does not make its source and target
            // interfere through this instruction.
            let move_src = match inst {
                Inst::Mov {
                    src: Operand::Reg(s),
                    ..
                } => Some(*s),
                _ => None,
            };
            for d in &defs {
                for l in &live {
                    if Some(*l) == move_src {
                        continue;
                    }
                    edge(&mut graph, *d, *l);
                }
                for other in &defs {
                    edge(&mut graph, *d, *other);
                }
                // Every touched virtual register becomes a node even when
                // nothing is simultaneously live.
                if let Reg::Virtual(v) = d {
                    graph.adj.entry(*v).or_default();
                }
            }
            for d in &defs {
                live.remove(d);
            }
            for u in uses {
                if let Reg::Virtual(v) = u {
                    graph.adj.entry(v).or_default();
                }
                live.insert(u);
            }
        }
    }
    graph
}

enum Coloring {
    Complete(HashMap<u32, Gpr>),
    Spills(Vec<u32>),
}

fn color(graph: &Interference, pool: &[Gpr]) -> Coloring {
    let k = pool.len();
    let mut degree: HashMap<u32, usize> =
        graph.adj.iter().map(|(&v, n)| (v, n.len())).collect();
    let mut removed: HashSet<u32> = HashSet::new();
    let mut stack: Vec<u32> = Vec::new();

    while removed.len() < graph.adj.len() {
        // Prefer a trivially colourable node; otherwise push the widest
        // node and hope a colour is free when it pops (optimistic spill).
        let pick = degree
            .iter()
            .filter(|(v, _)| !removed.contains(*v))
            .min_by_key(|&(&v, &d)| (d >= k, d, v))
            .map(|(&v, _)| v);
        let Some(node) = pick else { break };
        removed.insert(node);
        stack.push(node);
        for n in &graph.adj[&node] {
            if let Some(d) = degree.get_mut(n) {
                *d = d.saturating_sub(1);
            }
        }
    }

    let mut assignment: HashMap<u32, Gpr> = HashMap::new();
    let mut spills = Vec::new();
    while let Some(node) = stack.pop() {
        let mut taken: HashSet<Gpr> = graph
            .forbidden
            .get(&node)
            .cloned()
            .unwrap_or_default();
        for n in &graph.adj[&node] {
            if let Some(c) = assignment.get(n) {
                taken.insert(*c);
            }
        }
        match pool.iter().find(|g| !taken.contains(g)) {
            Some(&g) => {
                assignment.insert(node, g);
            }
            None => spills.push(node),
        }
    }
    if spills.is_empty() {
        Coloring::Complete(assignment)
    } else {
        Coloring::Spills(spills)
    }
}

fn apply(func: &mut X64Function, assignment: &HashMap<u32, Gpr>) {
    for (_, insts) in &mut func.blocks {
        for inst in insts {
            inst.for_each_reg_mut(|r| {
                if let Reg::Virtual(v) = r {
                    if let Some(&g) = assignment.get(v) {
                        *r = Reg::Phys(g);
                    }
                }
            });
        }
    }
}

/// Give each spilled value a frame slot, reloading before uses and storing
/// after defs through fresh short-lived registers.
fn spill(func: &mut X64Function, nodes: &[u32]) {
    let mut next = max_vreg(func) + 1;
    let mut slots: HashMap<u32, u32> = HashMap::new();
    for &v in nodes {
        func.frame.push(FrameSlot { size: 8, align: 8 });
        slots.insert(v, (func.frame.len() - 1) as u32);
    }

    for (_, insts) in &mut func.blocks {
        let mut rewritten: Vec<Inst> = Vec::with_capacity(insts.len());
        for mut inst in insts.drain(..) {
            let mut mentions: Vec<u32> = Vec::new();
            inst.for_each_reg(|r| {
                if let Reg::Virtual(v) = r {
                    if slots.contains_key(v) && !mentions.contains(v) {
                        mentions.push(*v);
                    }
                }
            });
            if mentions.is_empty() {
                rewritten.push(inst);
                continue;
            }
            let mut reloads = Vec::new();
            let mut stores = Vec::new();
            for v in mentions {
                let slot = slots[&v];
                let tmp = Reg::Virtual(next);
                next += 1;
                inst.for_each_reg_mut(|r| {
                    if *r == Reg::Virtual(v) {
                        *r = tmp;
                    }
                });
                reloads.push(Inst::Load {
                    size: Size::Q,
                    dst: tmp,
                    addr: Addr::Frame { slot, offset: 0 },
                });
                stores.push(Inst::StoreReg {
                    size: Size::Q,
                    src: tmp,
                    addr: Addr::Frame { slot, offset: 0 },
                });
            }
            rewritten.extend(reloads);
            rewritten.push(inst);
            rewritten.extend(stores);
        }
        *insts = rewritten;
    }
}

fn max_vreg(func: &X64Function) -> u32 {
    let mut max = 0;
    for (_, insts) in &func.blocks {
        for inst in insts {
            inst.for_each_reg(|r| {
                if let Reg::Virtual(v) = r {
                    max = max.max(*v);
                }
            });
        }
    }
    max
}
