//! Function inlining.
//!
//! Replaces direct calls with a copy of the callee body while preserving SSA
//! form. The interesting parts are the decision policy and the cycle guard:
//!
//! - indirect calls and calls to extern functions are never inlined;
//! - a call to a `forceinline` callee, or any call when the threshold is
//!   zero, must be inlined;
//! - otherwise a callee is inlined iff its instruction count (parameters
//!   excluded) does not exceed the threshold;
//! - a direct self-recursive call is inlined only in tail position; a
//!   non-tail self call is first offered to tail conversion;
//! - every inlined call records which inlining created it. Before inlining
//!   `C -> F` the ancestry of `C` is walked, and if any ancestor already
//!   inlined `F` the call is refused ("infinite loop detected"), which
//!   bounds mutual-recursion unrolling. The history and the refusal set
//!   live as long as the pass object, so once a fixpoint is reached a
//!   further run makes no additional change.
//!
//! Body transplantation allocates one placeholder slot per copied
//! instruction, so a dense table keyed by the callee's instruction ids
//! translates every operand in a single pass; parameter slots in that table
//! are overwritten with the call arguments, so no copies are made for them.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use super::tail_call::tail_position_calls;
use super::Pass;
use crate::ir::function::Function;
use crate::ir::instruction::{BlockId, Callee, InstData, InstKind, ValueId};
use crate::ir::module::{FuncId, Module};

pub struct Inline {
    /// Maximum callee size for optional inlining; zero makes every
    /// decision mandatory.
    threshold: u32,
    /// Refusing a mandatory inline is an error instead of a warning.
    strict: bool,
    /// Trace of performed inlinings, kept for the lifetime of the pass so
    /// repeated invocations converge instead of re-unrolling recursion.
    history: Vec<HistoryEntry>,
    /// Which history entry created each surviving inlined call site.
    origin: HashMap<(FuncId, ValueId), usize>,
    /// Refused call sites; never retried by this pass.
    not_inlinable: HashSet<(FuncId, ValueId)>,
}

impl Inline {
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            threshold,
            strict: false,
            history: Vec::new(),
            origin: HashMap::new(),
            not_inlinable: HashSet::new(),
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

impl Default for Inline {
    fn default() -> Self {
        Self::with_threshold(40)
    }
}

impl Pass for Inline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn description(&self) -> &'static str {
        "Replaces direct calls with the callee body, guarding against cycles"
    }

    fn run(&mut self, module: &mut Module) -> Result<bool, String> {
        let mut changed = false;
        let ids: Vec<FuncId> = module.func_ids().collect();
        for id in ids {
            if module.function(id).flags.is_extern {
                continue;
            }
            changed |= self.inline_into(module, id)?;
        }
        Ok(changed)
    }
}

/// One performed inlining: which function was inlined, and the history
/// entry of the inlining that produced the call site (if any).
struct HistoryEntry {
    callee: FuncId,
    parent: Option<usize>,
}

impl Inline {
    fn inline_into(&mut self, module: &mut Module, caller: FuncId) -> Result<bool, String> {
        let mut changed = false;

        loop {
            let Some((call, callee_id, tail)) =
                next_candidate(module, caller, &self.not_inlinable)
            else {
                break;
            };

            let callee_fn = module.function(callee_id);
            let mandatory = callee_fn.flags.forceinline || self.threshold == 0;
            let size = callee_fn.count_instructions();

            if !mandatory && size as u32 > self.threshold {
                self.not_inlinable.insert((caller, call));
                continue;
            }

            // The callee entry merges into the caller's block, so it must
            // not be a branch target itself.
            let entry_has_preds = match callee_fn.entry() {
                Some(e) => !callee_fn.predecessors(e).is_empty(),
                None => true,
            };
            if entry_has_preds {
                self.refuse(module, caller, call, mandatory, "callee entry is a branch target")?;
                self.not_inlinable.insert((caller, call));
                continue;
            }

            // Direct self-recursion: only a tail call can be absorbed
            // (one unrolling; the history check stops the chain).
            let mut tail = tail;
            if callee_id == caller && !tail {
                if tail_position_calls(module, caller).contains(&call) {
                    module.function_mut(caller).mark_tail_call(call);
                    tail = true;
                } else {
                    self.refuse(
                        module,
                        caller,
                        call,
                        mandatory,
                        "non-tail self-recursive call",
                    )?;
                    self.not_inlinable.insert((caller, call));
                    continue;
                }
            }

            // Walk the ancestry of this call site; meeting the callee again
            // means the expansion would never terminate.
            let mut ancestor = self.origin.get(&(caller, call)).copied();
            let mut cycle = false;
            while let Some(idx) = ancestor {
                if self.history[idx].callee == callee_id {
                    cycle = true;
                    break;
                }
                ancestor = self.history[idx].parent;
            }
            if cycle {
                self.refuse(module, caller, call, mandatory, "infinite loop detected")?;
                self.not_inlinable.insert((caller, call));
                continue;
            }

            self.history.push(HistoryEntry {
                callee: callee_id,
                parent: self.origin.get(&(caller, call)).copied(),
            });
            let hidx = self.history.len() - 1;
            debug!(
                "inlining @{} into @{}",
                module.func_name(callee_id),
                module.func_name(caller)
            );

            let callee_copy = module.function(callee_id).clone();
            transplant(
                module.function_mut(caller),
                &callee_copy,
                caller,
                call,
                tail,
                hidx,
                &mut self.origin,
            );
            changed = true;
        }
        Ok(changed)
    }

    fn refuse(
        &self,
        module: &Module,
        caller: FuncId,
        call: ValueId,
        mandatory: bool,
        reason: &str,
    ) -> Result<(), String> {
        if mandatory {
            let loc = module
                .function(caller)
                .loc(call)
                .map(|l| format!(" at line {}", l.line))
                .unwrap_or_default();
            let msg = format!(
                "cannot inline call in @{}{}: {}",
                module.func_name(caller),
                loc,
                reason
            );
            if self.strict {
                return Err(msg);
            }
            warn!("{}", msg);
        }
        Ok(())
    }
}

/// Next direct call to a defined function that has not been refused.
fn next_candidate(
    module: &Module,
    caller: FuncId,
    not_inlinable: &HashSet<(FuncId, ValueId)>,
) -> Option<(ValueId, FuncId, bool)> {
    let func = module.function(caller);
    for &b in func.block_order() {
        for &v in func.block_insts(b) {
            if not_inlinable.contains(&(caller, v)) {
                continue;
            }
            if let InstKind::Call {
                callee: Callee::Direct(f),
                tail,
                ..
            } = func.kind(v)
            {
                if module.function(*f).flags.is_extern {
                    continue;
                }
                return Some((v, *f, *tail));
            }
        }
    }
    None
}

/// Copy the body of `callee` over the call `c` in `f`, preserving SSA.
fn transplant(
    f: &mut Function,
    callee: &Function,
    caller: FuncId,
    c: ValueId,
    is_tail: bool,
    hidx: usize,
    origin: &mut HashMap<(FuncId, ValueId), usize>,
) {
    let b = f.inst(c).block.expect("call is not attached to a block");
    let pos = f
        .position_in_block(c)
        .expect("call is not in its block's instruction list");
    let args: Vec<ValueId> = match f.kind(c) {
        InstKind::Call { args, .. } => args.clone(),
        _ => unreachable!("transplant target is not a call"),
    };

    // A body that does nothing but return folds into value substitution
    // without touching the caller's blocks.
    if callee.count_instructions() == 1 {
        let entry = callee.entry().expect("callee has no entry");
        if let InstKind::Return { value } = callee.kind(callee.block_insts(entry)[0]) {
            match value {
                None => {
                    origin.remove(&(caller, c));
                    f.remove_inst(c);
                    return;
                }
                Some(rv) => {
                    if let InstKind::Parameter { index } = callee.kind(*rv) {
                        let replacement = args[*index as usize];
                        f.replace_all_uses(c, replacement);
                        origin.remove(&(caller, c));
                        f.remove_inst(c);
                        return;
                    }
                }
            }
        }
    }

    // Split the caller block at the call; the detached tail is reattached
    // to whichever block ends the inlined body.
    let after = f.split_block_insts(b, pos + 1);
    f.unlink_from_block(c);

    // Skeleton: a placeholder per copied instruction, a block per callee
    // block (the entry maps onto the call's own block), and a dense table
    // translating callee ids. Parameter slots alias the call arguments.
    let callee_entry = callee.entry().expect("callee has no entry");
    let mut value_map: Vec<Option<ValueId>> = vec![None; callee.insts_len()];
    for (i, &p) in callee.params().iter().enumerate() {
        value_map[p.index()] = Some(args[i]);
    }
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    block_map.insert(callee_entry, b);
    let mut prev = b;
    for &cb in callee.block_order() {
        if cb == callee_entry {
            continue;
        }
        let nb = f.create_block_after(prev);
        block_map.insert(cb, nb);
        prev = nb;
    }
    for &cb in callee.block_order() {
        for &cv in callee.block_insts(cb) {
            value_map[cv.index()] = Some(f.reserve_inst(callee.ty(cv)));
        }
    }
    let mapped = |table: &Vec<Option<ValueId>>, v: ValueId| -> ValueId {
        table[v.index()].expect("callee value missing from the mapping table")
    };

    // Copy every instruction except returns, translating operands and block
    // references through the tables. Nested calls join the history.
    let mut copied: Vec<ValueId> = Vec::new();
    let mut returns: Vec<(BlockId, Option<ValueId>, ValueId)> = Vec::new();
    for &cb in callee.block_order() {
        let nb = block_map[&cb];
        for &cv in callee.block_insts(cb) {
            let slot = mapped(&value_map, cv);
            let kind = callee.kind(cv).clone();
            if let InstKind::Return { value } = &kind {
                let ret_val = value.map(|rv| mapped(&value_map, rv));
                returns.push((nb, ret_val, slot));
                continue;
            }
            let mut new_kind = kind;
            new_kind.for_each_operand_mut(|op| *op = mapped(&value_map, *op));
            new_kind.for_each_block_mut(|blk| *blk = block_map[blk]);
            let is_call = matches!(new_kind, InstKind::Call { .. });
            f.fill_placeholder(slot, new_kind);
            if let Some(loc) = callee.loc(cv) {
                f.set_loc(slot, loc);
            }
            f.attach_to_block_end(nb, slot);
            copied.push(slot);
            if is_call {
                origin.insert((caller, slot), hidx);
            }
        }
    }

    // Return handling decides what replaces the call's value and where the
    // split-off tail of the caller block reattaches.
    let last_inlined = block_map[callee
        .block_order()
        .last()
        .expect("callee has no blocks")];

    if is_tail {
        // Inlined returns stay returns; everything after the call in the
        // caller block is discarded, with its uses unmarked.
        for (nb, ret_val, slot) in returns {
            f.fill_placeholder(slot, InstKind::Return { value: ret_val });
            f.attach_to_block_end(nb, slot);
            copied.push(slot);
        }
        for &slot in &copied {
            f.attach_uses(slot);
        }
        discard_detached(f, b, &after);
        origin.remove(&(caller, c));
        f.force_remove_detached(c);
        return;
    }

    let single_trailing = returns.len() == 1 && returns[0].0 == last_inlined;
    let (replacement, cont_block) = if single_trailing {
        let (nb, ret_val, slot) = returns[0];
        f.release_placeholder(slot);
        (ret_val, nb)
    } else if returns.is_empty() {
        // The callee never returns; the caller's tail is unreachable.
        for &slot in &copied {
            f.attach_uses(slot);
        }
        discard_detached(f, b, &after);
        origin.remove(&(caller, c));
        f.force_remove_detached(c);
        return;
    } else {
        // Dedicated return block joining every return site, with a phi
        // collecting the returned values when there are any.
        let ret_block = f.create_block_after(last_inlined);
        let has_value = returns.iter().any(|(_, v, _)| v.is_some());
        let phi = if has_value {
            Some(f.insert_inst_at(
                ret_block,
                0,
                InstData::new(InstKind::Phi { incoming: vec![] }, callee.ret_ty),
            ))
        } else {
            None
        };
        for (nb, ret_val, slot) in returns {
            f.fill_placeholder(slot, InstKind::Branch { target: ret_block });
            f.attach_to_block_end(nb, slot);
            copied.push(slot);
            if let (Some(p), Some(v)) = (phi, ret_val) {
                f.add_phi_incoming(p, nb, v);
            }
        }
        (phi, ret_block)
    };

    // Rebuild the use lists of every copied instruction.
    for &slot in &copied {
        f.attach_uses(slot);
    }

    // The call's value is now the synthesised return value.
    if let Some(r) = replacement {
        f.replace_all_uses(c, r);
    }
    origin.remove(&(caller, c));
    f.remove_inst(c);

    // Reattach the caller's tail after the inlined body. The original
    // terminator moved with it, so successor phis must be repointed.
    for &v in &after {
        f.attach_to_block_end(cont_block, v);
    }
    if cont_block != b {
        for succ in f.successors(cont_block) {
            repoint_phi_preds(f, succ, b, cont_block);
        }
    }
}

/// Discard the detached instructions `after` the call, unhooking the phi
/// edges their old terminator fed.
fn discard_detached(f: &mut Function, old_block: BlockId, after: &[ValueId]) {
    let mut old_targets: Vec<BlockId> = Vec::new();
    for &v in after {
        old_targets.extend(f.kind(v).block_targets());
    }
    for target in old_targets {
        remove_phi_pred(f, target, old_block);
    }
    for &v in after.iter().rev() {
        f.force_remove_detached(v);
    }
}

fn repoint_phi_preds(f: &mut Function, block: BlockId, old_pred: BlockId, new_pred: BlockId) {
    let phis: Vec<ValueId> = f
        .block_insts(block)
        .iter()
        .copied()
        .filter(|&v| matches!(f.kind(v), InstKind::Phi { .. }))
        .collect();
    for phi in phis {
        f.map_blocks(phi, |b| if b == old_pred { new_pred } else { b });
    }
}

fn remove_phi_pred(f: &mut Function, block: BlockId, pred: BlockId) {
    let phis: Vec<ValueId> = f
        .block_insts(block)
        .iter()
        .copied()
        .filter(|&v| matches!(f.kind(v), InstKind::Phi { .. }))
        .collect();
    for phi in phis {
        if let InstKind::Phi { incoming } = f.kind(phi) {
            let filtered: Vec<_> = incoming
                .iter()
                .copied()
                .filter(|(p, _)| *p != pred)
                .collect();
            if filtered.len() != incoming.len() {
                f.replace_kind(phi, InstKind::Phi { incoming: filtered });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::printer::print_function;
    use crate::ir::verifier::verify_module;
    use crate::opt::DeadCodeElimination;
    use crate::parser::parse_module;

    fn run_inline(module: &mut Module, threshold: u32) -> bool {
        let mut pass = Inline::with_threshold(threshold);
        pass.run(module).unwrap()
    }

    #[test]
    fn test_single_return_collapses_to_value() {
        let input = r#"
            fn @f() -> i32 {
            entry:
              %v = imm.i32 42
              ret.i32 %v
            }

            fn @g() -> i32 {
            entry:
              %c = call @f()
              ret.i32 %c
            }
        "#;
        let mut module = parse_module(input).unwrap();
        assert!(run_inline(&mut module, 40));
        verify_module(&module).unwrap();
        let g = module.func_id("g").unwrap();
        let text = print_function(&module, g);
        assert!(!text.contains("call"));
        assert!(text.contains("imm.i32 42"));
        // No return block was introduced.
        assert_eq!(module.function(g).block_order().len(), 1);
    }

    #[test]
    fn test_forwarding_callee_substitutes_argument() {
        let input = r#"
            fn @id(i32 %x) -> i32 {
            entry:
              ret.i32 %x
            }

            fn @g(i32 %y) -> i32 {
            entry:
              %c = call @id(%y)
              ret.i32 %c
            }
        "#;
        let mut module = parse_module(input).unwrap();
        assert!(run_inline(&mut module, 40));
        verify_module(&module).unwrap();
        let g = module.func_id("g").unwrap();
        assert_eq!(
            print_function(&module, g),
            "fn @g(i32 %0) -> i32 {\nb0:\n  ret.i32 %0\n}\n"
        );
    }

    #[test]
    fn test_multi_return_builds_phi() {
        let input = r#"
            fn @f(i32 %x) -> i32 {
            entry:
              %zero = imm.i32 0
              %c = ne.i32 %x, %zero
              br %c, then, else
            then:
              %one = imm.i32 1
              ret.i32 %one
            else:
              %two = imm.i32 2
              ret.i32 %two
            }

            fn @g() -> i32 {
            entry:
              %arg = imm.i32 0
              %c = call @f(%arg)
              ret.i32 %c
            }
        "#;
        let mut module = parse_module(input).unwrap();
        assert!(run_inline(&mut module, 40));
        verify_module(&module).unwrap();
        let g = module.func_id("g").unwrap();
        let text = print_function(&module, g);
        assert!(!text.contains("call"));
        assert!(text.contains("phi.i32"));
        // entry, then-copy, else-copy and the return block.
        assert_eq!(module.function(g).block_order().len(), 4);
    }

    #[test]
    fn test_mutual_recursion_detects_cycle() {
        let input = r#"
            fn @even(i32 %n) -> i32 {
            entry:
              %r = call @odd(%n)
              ret.i32 %r
            }

            fn @odd(i32 %n) -> i32 {
            entry:
              %r = call @even(%n)
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        // Threshold 0 makes inlining mandatory; strict mode surfaces the
        // refusal once the chain closes on itself.
        let mut pass = Inline::with_threshold(0).strict();
        let err = pass.run(&mut module).unwrap_err();
        assert!(err.contains("infinite loop detected"), "got: {}", err);
    }

    #[test]
    fn test_mutual_recursion_permissive_leaves_call() {
        let input = r#"
            fn @even(i32 %n) -> i32 {
            entry:
              %r = call @odd(%n)
              ret.i32 %r
            }

            fn @odd(i32 %n) -> i32 {
            entry:
              %r = call @even(%n)
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let changed = run_inline(&mut module, 0);
        assert!(changed);
        verify_module(&module).unwrap();
        // The refused call is still there.
        let even = module.func_id("even").unwrap();
        let text = print_function(&module, even);
        assert!(text.contains("call"));
    }

    #[test]
    fn test_self_recursive_non_tail_is_skipped() {
        let input = r#"
            fn @fact(i32 %n) -> i32 {
            entry:
              %one = imm.i32 1
              %c = sle.i32 %n, %one
              br %c, base, rec
            base:
              ret.i32 %one
            rec:
              %m = sub.i32 %n, %one
              %r = call @fact(%m)
              %p = mul.i32 %n, %r
              ret.i32 %p
            }
        "#;
        let mut module = parse_module(input).unwrap();
        // The recursive call is not in tail position and cannot become one.
        assert!(!run_inline(&mut module, 40));
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_threshold_refuses_large_callee() {
        let input = r#"
            fn @big(i32 %x) -> i32 {
            entry:
              %a = add.i32 %x, 1
              %b = add.i32 %a, 2
              %c = add.i32 %b, 3
              %d = add.i32 %c, 4
              ret.i32 %d
            }

            fn @g(i32 %x) -> i32 {
            entry:
              %r = call @big(%x)
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        // Nine instructions in @big (literal immediates included); a
        // threshold below that refuses, a larger one accepts.
        assert!(!run_inline(&mut module, 3));
        assert!(run_inline(&mut module, 40));
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_inline_is_idempotent_at_fixpoint() {
        let input = r#"
            fn @f() -> i32 {
            entry:
              %v = imm.i32 7
              ret.i32 %v
            }

            fn @g() -> i32 {
            entry:
              %c = call @f()
              ret.i32 %c
            }
        "#;
        let mut module = parse_module(input).unwrap();
        assert!(run_inline(&mut module, 40));
        assert!(!run_inline(&mut module, 40));
    }

    #[test]
    fn test_code_after_call_survives() {
        let input = r#"
            fn @f(i32 %x) -> i32 {
            entry:
              %zero = imm.i32 0
              %c = ne.i32 %x, %zero
              br %c, then, else
            then:
              %one = imm.i32 1
              ret.i32 %one
            else:
              %two = imm.i32 2
              ret.i32 %two
            }

            fn @g(i32 %x) -> i32 {
            entry:
              %c = call @f(%x)
              %r = add.i32 %c, %c
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        assert!(run_inline(&mut module, 40));
        verify_module(&module).unwrap();
        let g = module.func_id("g").unwrap();
        let text = print_function(&module, g);
        // The add now consumes the phi of the two returns.
        assert!(text.contains("add.i32"));
        assert!(text.contains("phi.i32"));

        let mut dce = DeadCodeElimination;
        let _ = dce.run(&mut module).unwrap();
        verify_module(&module).unwrap();
    }
}
