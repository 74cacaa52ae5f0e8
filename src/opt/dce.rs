//! Dead code elimination.
//!
//! Two sweeps to a fixpoint per function: blocks that became unreachable are
//! deleted (with their phi edges), then instructions with no users and no
//! side effects are removed. Single-incoming phis left behind by edge
//! removal collapse to their value.

use log::debug;

use super::Pass;
use crate::ir::dom::DomTree;
use crate::ir::function::Function;
use crate::ir::instruction::{BlockId, InstKind, ValueId};
use crate::ir::module::{FuncId, Module};

#[derive(Default)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn description(&self) -> &'static str {
        "Removes unreachable blocks and unused side-effect-free instructions"
    }

    fn run(&mut self, module: &mut Module) -> Result<bool, String> {
        let mut changed = false;
        let ids: Vec<FuncId> = module.func_ids().collect();
        for id in ids {
            if module.function(id).flags.is_extern {
                continue;
            }
            changed |= run_function(module.function_mut(id));
        }
        Ok(changed)
    }
}

fn run_function(func: &mut Function) -> bool {
    let mut changed = remove_unreachable_blocks(func);
    changed |= collapse_trivial_phis(func);

    // Fixpoint removal of unused pure instructions.
    loop {
        let dead: Vec<ValueId> = func
            .inst_ids()
            .filter(|&v| {
                func.inst(v).block.is_some()
                    && func.users(v).is_empty()
                    && !func.kind(v).has_side_effects()
            })
            .collect();
        if dead.is_empty() {
            break;
        }
        for v in dead {
            func.remove_inst(v);
        }
        changed = true;
    }
    changed
}

/// Delete every block not reachable from the entry, fixing up the phis of
/// surviving successors. Shared with constant propagation, which folds
/// branches and strands their untaken arms.
pub(crate) fn remove_unreachable_blocks(func: &mut Function) -> bool {
    let dom = DomTree::compute(func);
    let dead: Vec<BlockId> = func
        .block_order()
        .iter()
        .copied()
        .filter(|&b| !dom.is_reachable(b))
        .collect();
    if dead.is_empty() {
        return false;
    }
    debug!("removing {} unreachable blocks", dead.len());

    // Drop phi edges that flow in from dead blocks.
    for &b in &func.block_order().to_vec() {
        if dead.contains(&b) {
            continue;
        }
        let phis: Vec<ValueId> = func
            .block_insts(b)
            .iter()
            .copied()
            .filter(|&v| matches!(func.kind(v), InstKind::Phi { .. }))
            .collect();
        for phi in phis {
            if let InstKind::Phi { incoming } = func.kind(phi) {
                let filtered: Vec<_> = incoming
                    .iter()
                    .copied()
                    .filter(|(pred, _)| !dead.contains(pred))
                    .collect();
                if filtered.len() != incoming.len() {
                    func.replace_kind(phi, InstKind::Phi { incoming: filtered });
                }
            }
        }
    }

    // Detach and discard the bodies of the dead blocks.
    for &b in &dead {
        let insts = func.split_block_insts(b, 0);
        for &v in insts.iter().rev() {
            func.force_remove_detached(v);
        }
        func.unlink_block(b);
    }
    true
}

/// Replace `phi [(p, v)]` with `v`.
pub(crate) fn collapse_trivial_phis(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let mut collapsed = false;
        for b in func.block_order().to_vec() {
            let phis: Vec<ValueId> = func
                .block_insts(b)
                .iter()
                .copied()
                .filter(|&v| matches!(func.kind(v), InstKind::Phi { .. }))
                .collect();
            for phi in phis {
                let single = match func.kind(phi) {
                    InstKind::Phi { incoming } if incoming.len() == 1 => Some(incoming[0].1),
                    _ => None,
                };
                if let Some(value) = single {
                    if value == phi {
                        continue;
                    }
                    func.replace_all_uses(phi, value);
                    func.remove_inst(phi);
                    collapsed = true;
                    changed = true;
                }
            }
        }
        if !collapsed {
            break;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verifier::verify_module;
    use crate::parser::parse_module;

    #[test]
    fn test_removes_unused_arithmetic() {
        let input = r#"
            fn @f(i32 %x) -> i32 {
            entry:
              %dead = add.i32 %x, 1
              %dead2 = mul.i32 %dead, 2
              ret.i32 %x
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = DeadCodeElimination;
        assert!(pass.run(&mut module).unwrap());
        verify_module(&module).unwrap();
        let f = module.func_id("f").unwrap();
        let func = module.function(f);
        // Only the return remains.
        assert_eq!(func.count_instructions(), 1);
    }

    #[test]
    fn test_keeps_side_effects() {
        let input = r#"
            fn @g(*i32 %p, i32 %v) -> void {
            entry:
              store.i32 %v, %p
              ret.void
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = DeadCodeElimination;
        assert!(!pass.run(&mut module).unwrap());
        let f = module.func_id("g").unwrap();
        assert_eq!(module.function(f).count_instructions(), 2);
    }

    #[test]
    fn test_idempotent() {
        let input = r#"
            fn @f(i32 %x) -> i32 {
            entry:
              %dead = add.i32 %x, 1
              ret.i32 %x
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = DeadCodeElimination;
        assert!(pass.run(&mut module).unwrap());
        assert!(!pass.run(&mut module).unwrap());
    }
}
