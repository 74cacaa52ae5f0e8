//! Dominator computation.
//!
//! Iterative dominance on the reverse postorder of the CFG, plus dominance
//! frontiers. Used by the verifier for the SSA dominance invariant and by
//! alloca promotion for phi placement.

use std::collections::HashMap;

use super::function::Function;
use super::instruction::BlockId;

/// Dominator tree of one function.
#[derive(Debug)]
pub struct DomTree {
    /// Blocks in reverse postorder; unreachable blocks are absent.
    rpo: Vec<BlockId>,
    rpo_index: HashMap<BlockId, usize>,
    /// Immediate dominator per reachable block; the entry maps to itself.
    idom: HashMap<BlockId, BlockId>,
}

impl DomTree {
    /// Compute dominators for `func`. Unreachable blocks get no entry.
    pub fn compute(func: &Function) -> Self {
        let entry = match func.entry() {
            Some(e) => e,
            None => {
                return Self {
                    rpo: Vec::new(),
                    rpo_index: HashMap::new(),
                    idom: HashMap::new(),
                }
            }
        };

        // Depth-first postorder, then reverse.
        let mut postorder = Vec::new();
        let mut visited: Vec<bool> = vec![false; func.block_order().len().max(entry.index() + 1)];
        let mut grow = |v: &mut Vec<bool>, i: usize| {
            if i >= v.len() {
                v.resize(i + 1, false);
            }
        };
        // Iterative DFS with an explicit stack of (block, next-successor).
        let mut stack: Vec<(BlockId, usize)> = Vec::new();
        grow(&mut visited, entry.index());
        visited[entry.index()] = true;
        stack.push((entry, 0));
        while let Some((b, i)) = stack.pop() {
            let succs = func.successors(b);
            if i < succs.len() {
                stack.push((b, i + 1));
                let s = succs[i];
                grow(&mut visited, s.index());
                if !visited[s.index()] {
                    visited[s.index()] = true;
                    stack.push((s, 0));
                }
            } else {
                postorder.push(b);
            }
        }
        let rpo: Vec<BlockId> = postorder.into_iter().rev().collect();
        let rpo_index: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        // Iterate to a fixpoint (Cooper/Harvey/Kennedy).
        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        idom.insert(entry, entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let preds: Vec<BlockId> = func
                    .predecessors(b)
                    .into_iter()
                    .filter(|p| idom.contains_key(p))
                    .collect();
                let mut new_idom = match preds.first() {
                    Some(&p) => p,
                    None => continue,
                };
                for &p in preds.iter().skip(1) {
                    new_idom = Self::intersect(&idom, &rpo_index, p, new_idom);
                }
                if idom.get(&b) != Some(&new_idom) {
                    idom.insert(b, new_idom);
                    changed = true;
                }
            }
        }

        Self {
            rpo,
            rpo_index,
            idom,
        }
    }

    fn intersect(
        idom: &HashMap<BlockId, BlockId>,
        rpo_index: &HashMap<BlockId, usize>,
        mut a: BlockId,
        mut b: BlockId,
    ) -> BlockId {
        while a != b {
            while rpo_index[&a] > rpo_index[&b] {
                a = idom[&a];
            }
            while rpo_index[&b] > rpo_index[&a] {
                b = idom[&b];
            }
        }
        a
    }

    /// Whether `b` is reachable from the entry.
    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.rpo_index.contains_key(&b)
    }

    /// Reachable blocks in reverse postorder.
    pub fn reverse_postorder(&self) -> &[BlockId] {
        &self.rpo
    }

    /// Immediate dominator of `b`; `None` for the entry and for unreachable
    /// blocks.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        let d = *self.idom.get(&b)?;
        if d == b {
            None
        } else {
            Some(d)
        }
    }

    /// Whether `a` dominates `b`. Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(d) => cur = d,
                None => return false,
            }
        }
    }

    /// Dominance frontier of every reachable block.
    pub fn frontiers(&self, func: &Function) -> HashMap<BlockId, Vec<BlockId>> {
        let mut df: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for &b in &self.rpo {
            let preds = func.predecessors(b);
            if preds.len() < 2 {
                continue;
            }
            let Some(b_idom) = self.idom.get(&b).copied() else {
                continue;
            };
            for p in preds {
                if !self.is_reachable(p) {
                    continue;
                }
                let mut runner = p;
                while runner != b_idom {
                    let entry = df.entry(runner).or_default();
                    if !entry.contains(&b) {
                        entry.push(b);
                    }
                    match self.idom(runner) {
                        Some(d) => runner = d,
                        None => break,
                    }
                }
            }
        }
        df
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{InstData, InstKind};
    use crate::ir::intern::StringInterner;
    use crate::ir::types::TypeTable;
    use crate::target::CallConv;

    /// Diamond: b0 -> {b1, b2} -> b3.
    fn diamond() -> (Function, [BlockId; 4]) {
        let mut pool = StringInterner::new();
        let mut types = TypeTable::new();
        let name = pool.intern("f");
        let void = types.void();
        let boolean = types.bool_ty();
        let mut f = Function::new(name, void, CallConv::SysV);
        let b0 = f.create_block();
        let b1 = f.create_block();
        let b2 = f.create_block();
        let b3 = f.create_block();
        let c = f.push_inst(b0, InstData::new(InstKind::Immediate { value: 1 }, boolean));
        f.push_inst(
            b0,
            InstData::new(
                InstKind::CondBranch {
                    cond: c,
                    then_dest: b1,
                    else_dest: b2,
                },
                void,
            ),
        );
        f.push_inst(b1, InstData::new(InstKind::Branch { target: b3 }, void));
        f.push_inst(b2, InstData::new(InstKind::Branch { target: b3 }, void));
        f.push_inst(b3, InstData::new(InstKind::Return { value: None }, void));
        (f, [b0, b1, b2, b3])
    }

    #[test]
    fn test_diamond_idoms() {
        let (f, [b0, b1, b2, b3]) = diamond();
        let dom = DomTree::compute(&f);
        assert_eq!(dom.idom(b0), None);
        assert_eq!(dom.idom(b1), Some(b0));
        assert_eq!(dom.idom(b2), Some(b0));
        assert_eq!(dom.idom(b3), Some(b0));
        assert!(dom.dominates(b0, b3));
        assert!(!dom.dominates(b1, b3));
        assert!(dom.dominates(b3, b3));
    }

    #[test]
    fn test_diamond_frontiers() {
        let (f, [_b0, b1, b2, b3]) = diamond();
        let dom = DomTree::compute(&f);
        let df = dom.frontiers(&f);
        assert_eq!(df.get(&b1), Some(&vec![b3]));
        assert_eq!(df.get(&b2), Some(&vec![b3]));
        assert!(df.get(&b3).is_none());
    }

    #[test]
    fn test_unreachable_block() {
        let (mut f, [b0, ..]) = diamond();
        let dead = f.create_block();
        let void = f.ty(f.block_insts(b0)[1]);
        f.push_inst(dead, InstData::new(InstKind::Return { value: None }, void));
        let dom = DomTree::compute(&f);
        assert!(!dom.is_reachable(dead));
        assert!(dom.is_reachable(b0));
    }
}
