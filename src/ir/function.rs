//! Function and basic-block representation.
//!
//! A [`Function`] owns two dense arenas: one for instructions and one for
//! basic blocks. Everything else in the compiler refers to them through
//! [`ValueId`] and [`BlockId`] handles; there are no pointers between IR
//! nodes. Freed instruction slots are tombstoned and recycled through a free
//! list, so handles stay valid for the lifetime of the function.
//!
//! All operand mutation goes through the helpers here (`push_inst`,
//! `replace_kind`, `replace_all_uses`, `remove_inst`, ...), which keep the
//! users sets of the affected instructions consistent in both directions.
//! Direct mutation of operands is not reachable from outside this module.

use super::instruction::{BlockId, InstData, InstKind, SourceLoc, ValueId};
use super::intern::Symbol;
use super::types::TypeId;
use crate::target::CallConv;

/// Function attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FunctionFlags {
    /// Declared but defined elsewhere; has no body.
    pub is_extern: bool,
    /// Exported from the object (global binding).
    pub is_global: bool,
    /// Inlining of calls to this function is mandatory.
    pub forceinline: bool,
    /// The function never returns to its caller.
    pub noreturn: bool,
}

/// A basic block: an ordered list of instruction handles. The last
/// instruction of a closed block is its terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockData {
    insts: Vec<ValueId>,
}

/// An IR function.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Symbol,
    pub ret_ty: TypeId,
    pub conv: CallConv,
    pub flags: FunctionFlags,
    params: Vec<ValueId>,
    insts: Vec<InstData>,
    blocks: Vec<BlockData>,
    order: Vec<BlockId>,
    free: Vec<ValueId>,
}

impl Function {
    pub fn new(name: Symbol, ret_ty: TypeId, conv: CallConv) -> Self {
        Self {
            name,
            ret_ty,
            conv,
            flags: FunctionFlags::default(),
            params: Vec::new(),
            insts: Vec::new(),
            blocks: Vec::new(),
            order: Vec::new(),
            free: Vec::new(),
        }
    }

    // --- Parameters ---

    /// Append a formal parameter of the given type.
    ///
    /// Parameters are instructions that live outside any block; they are
    /// tied to the function's ABI and cannot be removed.
    pub fn add_param(&mut self, ty: TypeId) -> ValueId {
        let index = self.params.len() as u32;
        let v = self.alloc_slot(InstData::new(InstKind::Parameter { index }, ty));
        self.params.push(v);
        v
    }

    pub fn params(&self) -> &[ValueId] {
        &self.params
    }

    // --- Blocks ---

    /// Create a new block at the end of the block order. The first block
    /// created becomes the entry block.
    pub fn create_block(&mut self) -> BlockId {
        let b = BlockId::new(self.blocks.len());
        self.blocks.push(BlockData::default());
        self.order.push(b);
        b
    }

    /// Create a new block placed immediately after `after` in block order.
    pub fn create_block_after(&mut self, after: BlockId) -> BlockId {
        let b = BlockId::new(self.blocks.len());
        self.blocks.push(BlockData::default());
        let pos = self
            .order
            .iter()
            .position(|&o| o == after)
            .map(|p| p + 1)
            .unwrap_or(self.order.len());
        self.order.insert(pos, b);
        b
    }

    /// Remove `b` from the block order. Its instructions must already have
    /// been removed. The slot itself is not recycled.
    pub(crate) fn unlink_block(&mut self, b: BlockId) {
        self.order.retain(|&o| o != b);
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.order.first().copied()
    }

    /// Blocks in layout order.
    pub fn block_order(&self) -> &[BlockId] {
        &self.order
    }

    pub fn block_insts(&self, b: BlockId) -> &[ValueId] {
        &self.blocks[b.index()].insts
    }

    /// The terminator of `b`, if the block is closed.
    pub fn terminator(&self, b: BlockId) -> Option<ValueId> {
        let last = *self.blocks[b.index()].insts.last()?;
        if self.inst(last).kind.is_terminator() {
            Some(last)
        } else {
            None
        }
    }

    /// True iff `b` ends in a terminator.
    pub fn closes_block(&self, b: BlockId) -> bool {
        self.terminator(b).is_some()
    }

    /// CFG successors of `b`.
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b)
            .map(|t| self.inst(t).kind.block_targets())
            .unwrap_or_default()
    }

    /// CFG predecessors of `b`, in block order. Duplicate edges (a
    /// conditional branch with both arms on `b`) are reported once.
    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        let mut preds = Vec::new();
        for &p in &self.order {
            if self.successors(p).contains(&b) {
                preds.push(p);
            }
        }
        preds
    }

    // --- Instruction access ---

    pub fn inst(&self, v: ValueId) -> &InstData {
        &self.insts[v.index()]
    }

    pub fn kind(&self, v: ValueId) -> &InstKind {
        &self.insts[v.index()].kind
    }

    pub fn ty(&self, v: ValueId) -> TypeId {
        self.insts[v.index()].ty
    }

    pub fn users(&self, v: ValueId) -> &indexmap::IndexSet<ValueId> {
        &self.insts[v.index()].users
    }

    pub fn loc(&self, v: ValueId) -> Option<SourceLoc> {
        self.insts[v.index()].loc
    }

    pub fn set_loc(&mut self, v: ValueId, loc: SourceLoc) {
        self.insts[v.index()].loc = Some(loc);
    }

    /// Arena length, including parameters and tombstoned slots. Dense
    /// mapping tables (the inliner's) are sized by this.
    pub fn insts_len(&self) -> usize {
        self.insts.len()
    }

    /// Handles of all live instructions, parameters included.
    pub fn inst_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.insts
            .iter()
            .enumerate()
            .filter(|(_, d)| !matches!(d.kind, InstKind::Placeholder))
            .map(|(i, _)| ValueId::new(i))
    }

    /// Number of instructions in blocks. Parameters are not counted.
    pub fn count_instructions(&self) -> usize {
        self.order.iter().map(|b| self.blocks[b.index()].insts.len()).sum()
    }

    /// Position of `v` within its block.
    pub fn position_in_block(&self, v: ValueId) -> Option<usize> {
        let b = self.inst(v).block?;
        self.blocks[b.index()].insts.iter().position(|&i| i == v)
    }

    // --- Construction and mutation ---

    fn alloc_slot(&mut self, data: InstData) -> ValueId {
        if let Some(v) = self.free.pop() {
            self.insts[v.index()] = data;
            v
        } else {
            let v = ValueId::new(self.insts.len());
            self.insts.push(data);
            v
        }
    }

    /// Create an instruction at the end of `b`, registering it as a user of
    /// each of its operands.
    pub fn push_inst(&mut self, b: BlockId, data: InstData) -> ValueId {
        let v = self.alloc_slot(data);
        self.insts[v.index()].block = Some(b);
        self.attach_uses(v);
        self.blocks[b.index()].insts.push(v);
        v
    }

    /// Create an instruction at position `idx` of `b` (used to place phis at
    /// block start).
    pub fn insert_inst_at(&mut self, b: BlockId, idx: usize, data: InstData) -> ValueId {
        let v = self.alloc_slot(data);
        self.insts[v.index()].block = Some(b);
        self.attach_uses(v);
        self.blocks[b.index()].insts.insert(idx, v);
        v
    }

    /// Reserve a detached placeholder slot of the given result type. Used to
    /// build skeletons whose operands refer to slots filled in later.
    pub fn reserve_inst(&mut self, ty: TypeId) -> ValueId {
        self.alloc_slot(InstData::new(InstKind::Placeholder, ty))
    }

    /// Overwrite a placeholder's kind without touching users sets. The
    /// caller must pair this with [`Function::attach_uses`] once every
    /// operand slot has been filled.
    pub(crate) fn fill_placeholder(&mut self, v: ValueId, kind: InstKind) {
        debug_assert!(matches!(self.insts[v.index()].kind, InstKind::Placeholder));
        self.insts[v.index()].kind = kind;
    }

    /// Register `v` as a user of each of its operands.
    pub(crate) fn attach_uses(&mut self, v: ValueId) {
        let ops = self.insts[v.index()].kind.operands();
        for op in ops {
            self.insts[op.index()].users.insert(v);
        }
    }

    /// Unregister `v` from the users set of each of its operands.
    pub(crate) fn detach_uses(&mut self, v: ValueId) {
        let ops = self.insts[v.index()].kind.operands();
        for op in ops {
            self.insts[op.index()].users.shift_remove(&v);
        }
    }

    /// Append an already-allocated, detached instruction to the end of `b`.
    pub(crate) fn attach_to_block_end(&mut self, b: BlockId, v: ValueId) {
        self.insts[v.index()].block = Some(b);
        self.blocks[b.index()].insts.push(v);
    }

    /// Replace the kind of `v`, re-registering operand uses on both sides.
    /// The result type is unchanged.
    pub fn replace_kind(&mut self, v: ValueId, kind: InstKind) {
        self.detach_uses(v);
        self.insts[v.index()].kind = kind;
        self.attach_uses(v);
    }

    /// Replace every use of `old` with `new` (RAUW). Afterwards `old` has no
    /// users; block references are unaffected.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let users: Vec<ValueId> = self.insts[old.index()].users.iter().copied().collect();
        for u in users {
            self.insts[u.index()].kind.for_each_operand_mut(|op| {
                if *op == old {
                    *op = new;
                }
            });
            self.insts[new.index()].users.insert(u);
        }
        self.insts[old.index()].users.clear();
    }

    /// Rewrite block references of `v` (branch targets, phi predecessors).
    pub(crate) fn map_blocks(&mut self, v: ValueId, mut f: impl FnMut(BlockId) -> BlockId) {
        self.insts[v.index()].kind.for_each_block_mut(|b| *b = f(*b));
    }

    /// Append an incoming edge to a phi, registering the use.
    pub fn add_phi_incoming(&mut self, phi: ValueId, pred: BlockId, value: ValueId) {
        if let InstKind::Phi { incoming } = &mut self.insts[phi.index()].kind {
            incoming.push((pred, value));
            self.insts[value.index()].users.insert(phi);
        }
    }

    /// Set the tail flag of a call. Operands are unchanged, so the users
    /// sets need no adjustment.
    pub fn mark_tail_call(&mut self, v: ValueId) {
        if let InstKind::Call { tail, .. } = &mut self.insts[v.index()].kind {
            *tail = true;
        }
    }

    /// Remove `v` from its block without freeing its slot.
    pub(crate) fn unlink_from_block(&mut self, v: ValueId) {
        if let Some(b) = self.insts[v.index()].block.take() {
            self.blocks[b.index()].insts.retain(|&i| i != v);
        }
    }

    /// Detach and truncate the instructions of `b` starting at `from`,
    /// returning them in order. Their block field is cleared; operand and
    /// user links are untouched.
    pub(crate) fn split_block_insts(&mut self, b: BlockId, from: usize) -> Vec<ValueId> {
        let tail: Vec<ValueId> = self.blocks[b.index()].insts.split_off(from);
        for &v in &tail {
            self.insts[v.index()].block = None;
        }
        tail
    }

    /// Delete an instruction. It must have no remaining users and must not
    /// be a parameter; parameters are tied to the function's ABI and go
    /// through [`Function::remove_params`] instead.
    pub fn remove_inst(&mut self, v: ValueId) {
        assert!(
            self.insts[v.index()].users.is_empty(),
            "removing {} which still has users",
            v
        );
        assert!(
            !matches!(self.insts[v.index()].kind, InstKind::Parameter { .. }),
            "parameters are removed through remove_params"
        );
        self.detach_uses(v);
        self.unlink_from_block(v);
        self.insts[v.index()].kind = InstKind::Placeholder;
        self.insts[v.index()].loc = None;
        self.free.push(v);
    }

    /// Delete the whole parameter list.
    ///
    /// Parameter instructions carry positional indices, so individual
    /// removal would renumber the ABI under every other parameter; they are
    /// only deleted together, when a signature is being rebuilt or a body
    /// torn down. Every parameter must already be unused.
    pub fn remove_params(&mut self) {
        for &p in &self.params {
            assert!(
                self.insts[p.index()].users.is_empty(),
                "removing parameter {} which still has users",
                p
            );
        }
        for p in std::mem::take(&mut self.params) {
            self.insts[p.index()].kind = InstKind::Placeholder;
            self.insts[p.index()].loc = None;
            self.free.push(p);
        }
    }

    /// Delete a detached instruction regardless of remaining users, clearing
    /// them. Only for discarding whole unreachable regions where the users
    /// are being discarded too.
    pub(crate) fn force_remove_detached(&mut self, v: ValueId) {
        debug_assert!(self.insts[v.index()].block.is_none());
        self.detach_uses(v);
        self.insts[v.index()].users.clear();
        self.insts[v.index()].kind = InstKind::Placeholder;
        self.insts[v.index()].loc = None;
        self.free.push(v);
    }

    /// Release a reserved placeholder that was never filled.
    pub(crate) fn release_placeholder(&mut self, v: ValueId) {
        debug_assert!(matches!(self.insts[v.index()].kind, InstKind::Placeholder));
        debug_assert!(self.insts[v.index()].users.is_empty());
        self.free.push(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::BinaryOp;
    use crate::ir::intern::StringInterner;
    use crate::ir::types::TypeTable;

    fn test_func() -> (Function, TypeTable) {
        let mut pool = StringInterner::new();
        let mut types = TypeTable::new();
        let name = pool.intern("f");
        let i32t = types.int(32, true);
        (Function::new(name, i32t, CallConv::SysV), types)
    }

    #[test]
    fn test_params_are_instructions() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let p0 = f.add_param(i32t);
        let p1 = f.add_param(i32t);
        assert_eq!(f.params(), &[p0, p1]);
        assert!(matches!(f.kind(p0), InstKind::Parameter { index: 0 }));
        assert!(matches!(f.kind(p1), InstKind::Parameter { index: 1 }));
        assert!(f.inst(p0).block.is_none());
    }

    #[test]
    fn test_users_bidirectional() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let b = f.create_block();
        let a = f.push_inst(b, InstData::new(InstKind::Immediate { value: 1 }, i32t));
        let c = f.push_inst(b, InstData::new(InstKind::Immediate { value: 2 }, i32t));
        let add = f.push_inst(
            b,
            InstData::new(
                InstKind::Binary {
                    op: BinaryOp::Add,
                    lhs: a,
                    rhs: c,
                },
                i32t,
            ),
        );
        assert!(f.users(a).contains(&add));
        assert!(f.users(c).contains(&add));
        assert!(f.users(add).is_empty());
    }

    #[test]
    fn test_rauw() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let b = f.create_block();
        let a = f.push_inst(b, InstData::new(InstKind::Immediate { value: 1 }, i32t));
        let c = f.push_inst(b, InstData::new(InstKind::Immediate { value: 2 }, i32t));
        let add = f.push_inst(
            b,
            InstData::new(
                InstKind::Binary {
                    op: BinaryOp::Add,
                    lhs: a,
                    rhs: a,
                },
                i32t,
            ),
        );
        f.replace_all_uses(a, c);
        assert!(f.users(a).is_empty());
        assert!(f.users(c).contains(&add));
        match f.kind(add) {
            InstKind::Binary { lhs, rhs, .. } => {
                assert_eq!(*lhs, c);
                assert_eq!(*rhs, c);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_remove_recycles_slot() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let b = f.create_block();
        let a = f.push_inst(b, InstData::new(InstKind::Immediate { value: 1 }, i32t));
        let len = f.insts_len();
        f.remove_inst(a);
        assert!(matches!(f.kind(a), InstKind::Placeholder));
        assert!(f.block_insts(b).is_empty());
        let c = f.push_inst(b, InstData::new(InstKind::Immediate { value: 3 }, i32t));
        assert_eq!(c, a);
        assert_eq!(f.insts_len(), len);
    }

    #[test]
    #[should_panic(expected = "remove_params")]
    fn test_remove_inst_rejects_parameter() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let p = f.add_param(i32t);
        f.remove_inst(p);
    }

    #[test]
    fn test_remove_params_recycles_slots() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let p0 = f.add_param(i32t);
        let p1 = f.add_param(i32t);
        f.remove_params();
        assert!(f.params().is_empty());
        assert!(matches!(f.kind(p0), InstKind::Placeholder));
        assert!(matches!(f.kind(p1), InstKind::Placeholder));
        // The freed slots are reused by later instructions.
        let b = f.create_block();
        let v = f.push_inst(b, InstData::new(InstKind::Immediate { value: 5 }, i32t));
        assert!(v == p0 || v == p1);
    }

    #[test]
    #[should_panic(expected = "still has users")]
    fn test_remove_params_with_live_uses_panics() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let p = f.add_param(i32t);
        let b = f.create_block();
        f.push_inst(b, InstData::new(InstKind::Not { value: p }, i32t));
        f.remove_params();
    }

    #[test]
    #[should_panic(expected = "still has users")]
    fn test_remove_with_users_panics() {
        let (mut f, mut types) = test_func();
        let i32t = types.int(32, true);
        let b = f.create_block();
        let a = f.push_inst(b, InstData::new(InstKind::Immediate { value: 1 }, i32t));
        let _n = f.push_inst(b, InstData::new(InstKind::Not { value: a }, i32t));
        f.remove_inst(a);
    }

    #[test]
    fn test_block_order_and_preds() {
        let (mut f, mut types) = test_func();
        let b0 = f.create_block();
        let b2 = f.create_block();
        let b1 = f.create_block_after(b0);
        assert_eq!(f.block_order(), &[b0, b1, b2]);
        assert_eq!(f.entry(), Some(b0));

        let cond = f.push_inst(
            b0,
            InstData::new(InstKind::Immediate { value: 1 }, types.bool_ty()),
        );
        f.push_inst(
            b0,
            InstData::new(
                InstKind::CondBranch {
                    cond,
                    then_dest: b1,
                    else_dest: b2,
                },
                types.void(),
            ),
        );
        assert!(f.closes_block(b0));
        assert_eq!(f.successors(b0), vec![b1, b2]);
        assert_eq!(f.predecessors(b1), vec![b0]);
        assert_eq!(f.predecessors(b2), vec![b0]);
    }
}
