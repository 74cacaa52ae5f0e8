//! Tail-call marking.
//!
//! A call immediately followed by a return of its value (or by a bare
//! return when the result is unused) is flagged as a tail call, provided
//! caller and callee agree on calling convention. The backend turns flagged
//! calls into jumps, and the inliner relies on the flag for self-recursion.

use super::Pass;
use crate::ir::instruction::{Callee, InstKind, ValueId};
use crate::ir::module::{FuncId, Module};
use crate::ir::types::TypeKind;

#[derive(Default)]
pub struct TailCallMarking;

impl Pass for TailCallMarking {
    fn name(&self) -> &'static str {
        "tail-call-marking"
    }

    fn description(&self) -> &'static str {
        "Flags calls in tail position for jump lowering"
    }

    fn run(&mut self, module: &mut Module) -> Result<bool, String> {
        let mut changed = false;
        let ids: Vec<FuncId> = module.func_ids().collect();
        for id in ids {
            if module.function(id).flags.is_extern {
                continue;
            }
            for call in tail_position_calls(module, id) {
                module.function_mut(id).mark_tail_call(call);
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Calls of `id` that sit in tail position but are not yet flagged.
pub(crate) fn tail_position_calls(module: &Module, id: FuncId) -> Vec<ValueId> {
    let func = module.function(id);
    let mut out = Vec::new();
    for &b in func.block_order() {
        let insts = func.block_insts(b);
        if insts.len() < 2 {
            continue;
        }
        let call = insts[insts.len() - 2];
        let ret = insts[insts.len() - 1];
        let InstKind::Call { callee, tail, .. } = func.kind(call) else {
            continue;
        };
        if *tail {
            continue;
        }
        // The callee must use the caller's convention for a jump hand-off.
        let callee_conv = match callee {
            Callee::Direct(f) => module.function(*f).conv,
            Callee::Indirect(target) => {
                let tt = func.ty(*target);
                match module.types.pointee(tt).map(|p| module.types.kind(p)) {
                    Some(TypeKind::Function { conv, .. }) => *conv,
                    _ => continue,
                }
            }
        };
        if callee_conv != func.conv {
            continue;
        }
        match func.kind(ret) {
            InstKind::Return { value: Some(rv) } => {
                // The return must forward exactly the call result, and the
                // call may have no other user.
                if *rv == call && func.users(call).len() == 1 {
                    out.push(call);
                }
            }
            InstKind::Return { value: None } => {
                if func.users(call).is_empty() {
                    out.push(call);
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn test_marks_value_forwarding_call() {
        let input = r#"
            fn @callee(i32 %x) -> i32 {
            entry:
              ret.i32 %x
            }

            fn @caller(i32 %x) -> i32 {
            entry:
              %r = call @callee(%x)
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = TailCallMarking;
        assert!(pass.run(&mut module).unwrap());
        let f = module.func_id("caller").unwrap();
        let func = module.function(f);
        let entry = func.entry().unwrap();
        let call = func.block_insts(entry)[0];
        assert!(matches!(func.kind(call), InstKind::Call { tail: true, .. }));
        // Already marked; a second run changes nothing.
        assert!(!pass.run(&mut module).unwrap());
    }

    #[test]
    fn test_skips_call_with_intervening_use() {
        let input = r#"
            fn @callee(i32 %x) -> i32 {
            entry:
              ret.i32 %x
            }

            fn @caller(i32 %x) -> i32 {
            entry:
              %r = call @callee(%x)
              %s = add.i32 %r, 1
              ret.i32 %s
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = TailCallMarking;
        assert!(!pass.run(&mut module).unwrap());
    }
}
