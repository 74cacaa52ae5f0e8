//! Common subexpression elimination.
//!
//! Block-local value numbering: within one block, two pure instructions with
//! identical opcode, operands and type collapse into the first. Memory reads
//! are never merged; cross-block redundancy is left to the other passes.

use std::collections::HashMap;

use super::Pass;
use crate::ir::function::Function;
use crate::ir::instruction::{InstKind, ValueId};
use crate::ir::module::{FuncId, Module};
use crate::ir::types::TypeId;

#[derive(Default)]
pub struct CommonSubexpressionElimination;

impl Pass for CommonSubexpressionElimination {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn description(&self) -> &'static str {
        "Merges repeated pure computations within a block"
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

fn is_pure_candidate(kind: &InstKind) -> bool {
    matches!(
        kind,
        InstKind::Immediate { .. }
            | InstKind::StaticRef { .. }
            | InstKind::FuncRef { .. }
            | InstKind::Binary { .. }
            | InstKind::Not { .. }
            | InstKind::Cmp { .. }
            | InstKind::Cast { .. }
    )
}

fn run_function(func: &mut Function) -> bool {
    let mut changed = false;
    for b in func.block_order().to_vec() {
        let mut seen: HashMap<(InstKind, TypeId), ValueId> = HashMap::new();
        for v in func.block_insts(b).to_vec() {
            let kind = func.kind(v);
            if !is_pure_candidate(kind) {
                continue;
            }
            let key = (kind.clone(), func.ty(v));
            match seen.get(&key) {
                Some(&prev) => {
                    func.replace_all_uses(v, prev);
                    func.remove_inst(v);
                    changed = true;
                }
                None => {
                    seen.insert(key, v);
                }
            }
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
    fn test_merges_repeated_add() {
        let input = r#"
            fn @f(i32 %x, i32 %y) -> i32 {
            entry:
              %a = add.i32 %x, %y
              %b = add.i32 %x, %y
              %c = mul.i32 %a, %b
              ret.i32 %c
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = CommonSubexpressionElimination;
        assert!(pass.run(&mut module).unwrap());
        verify_module(&module).unwrap();
        let f = module.func_id("f").unwrap();
        // One add, one mul, one return.
        assert_eq!(module.function(f).count_instructions(), 3);
    }

    #[test]
    fn test_does_not_merge_loads() {
        let input = r#"
            fn @f(*i32 %p) -> i32 {
            entry:
              %a = load.i32 %p
              %b = load.i32 %p
              %c = add.i32 %a, %b
              ret.i32 %c
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = CommonSubexpressionElimination;
        assert!(!pass.run(&mut module).unwrap());
    }

    #[test]
    fn test_scoped_to_block() {
        let input = r#"
            fn @f(bool %c, i32 %x) -> i32 {
            entry:
              %a = add.i32 %x, 1
              br %c, t, e
            t:
              %b = add.i32 %x, 1
              ret.i32 %b
            e:
              ret.i32 %a
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = CommonSubexpressionElimination;
        // The repeated add sits in a different block and is kept.
        // (Only the synthesised literal immediates may merge per block.)
        let _ = pass.run(&mut module).unwrap();
        verify_module(&module).unwrap();
        let f = module.func_id("f").unwrap();
        let func = module.function(f);
        let adds = func
            .inst_ids()
            .filter(|&v| matches!(func.kind(v), InstKind::Binary { .. }))
            .count();
        assert_eq!(adds, 2);
    }
}
