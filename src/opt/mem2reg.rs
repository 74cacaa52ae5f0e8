//! Promotion of stack slots to SSA values.
//!
//! An alloca whose address never escapes — every use is a direct load or
//! store — is rewritten into SSA form: phis are placed on the iterated
//! dominance frontier of the stores, loads are replaced by the reaching
//! definition, and the alloca disappears. Loads with no reaching store
//! become a zero immediate.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use super::Pass;
use crate::ir::dom::DomTree;
use crate::ir::instruction::{BlockId, InstData, InstKind, ValueId};
use crate::ir::module::{FuncId, Module};
use crate::ir::types::TypeId;

#[derive(Default)]
pub struct PromoteAllocas;

impl Pass for PromoteAllocas {
    fn name(&self) -> &'static str {
        "promote-allocas"
    }

    fn description(&self) -> &'static str {
        "Rewrites non-escaping stack slots into SSA values with phis"
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

fn run_function(module: &mut Module, id: FuncId) -> bool {
    let candidates = promotable_allocas(module, id);
    if candidates.is_empty() {
        return false;
    }
    debug!(
        "promoting {} allocas in @{}",
        candidates.len(),
        module.func_name(id)
    );

    let dom = DomTree::compute(module.function(id));
    let frontiers = dom.frontiers(module.function(id));

    // Phi placement on the iterated dominance frontier of each store block.
    // phis[(block, alloca)] is the value joining that slot in that block.
    let mut phis: HashMap<(BlockId, ValueId), ValueId> = HashMap::new();
    for &(alloca, elem_ty) in &candidates {
        let mut work: VecDeque<BlockId> = {
            let func = module.function(id);
            func.users(alloca)
                .iter()
                .filter(|&&u| matches!(func.kind(u), InstKind::Store { .. }))
                .filter_map(|&u| func.inst(u).block)
                .collect()
        };
        let mut placed: HashSet<BlockId> = HashSet::new();
        let mut seen: HashSet<BlockId> = work.iter().copied().collect();
        while let Some(b) = work.pop_front() {
            for &df in frontiers.get(&b).map(|v| v.as_slice()).unwrap_or(&[]) {
                if placed.insert(df) {
                    let phi = module.function_mut(id).insert_inst_at(
                        df,
                        0,
                        InstData::new(InstKind::Phi { incoming: vec![] }, elem_ty),
                    );
                    phis.insert((df, alloca), phi);
                    if seen.insert(df) {
                        work.push_back(df);
                    }
                }
            }
        }
    }

    // Renaming walk over the dominator tree.
    let children = dom_children(&dom);
    let entry = match module.function(id).entry() {
        Some(e) => e,
        None => return false,
    };
    let alloca_tys: HashMap<ValueId, TypeId> = candidates.iter().copied().collect();
    let mut defs: HashMap<ValueId, ValueId> = HashMap::new();
    rename_block(
        module, id, entry, &children, &phis, &alloca_tys, &mut defs,
    );

    // The slots are now unreferenced apart from dead stores removed above.
    for (alloca, _) in candidates {
        let func = module.function_mut(id);
        if func.users(alloca).is_empty() {
            func.remove_inst(alloca);
        }
    }
    true
}

/// Allocas of scalar type whose every use is a direct load or store address.
fn promotable_allocas(module: &Module, id: FuncId) -> Vec<(ValueId, TypeId)> {
    let func = module.function(id);
    let types = &module.types;
    func.inst_ids()
        .filter(|&v| func.inst(v).block.is_some())
        .filter_map(|v| match func.kind(v) {
            InstKind::Alloca { allocated } => Some((v, *allocated)),
            _ => None,
        })
        .filter(|&(_, elem)| types.is_integer(elem) || types.is_bool(elem))
        .filter(|&(v, _)| {
            func.users(v).iter().all(|&u| match func.kind(u) {
                InstKind::Load { addr } => *addr == v,
                InstKind::Store { addr, value } => *addr == v && *value != v,
                _ => false,
            })
        })
        .collect()
}

fn dom_children(dom: &DomTree) -> HashMap<BlockId, Vec<BlockId>> {
    let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for &b in dom.reverse_postorder() {
        if let Some(parent) = dom.idom(b) {
            children.entry(parent).or_default().push(b);
        }
    }
    children
}

#[allow(clippy::too_many_arguments)]
fn rename_block(
    module: &mut Module,
    id: FuncId,
    block: BlockId,
    children: &HashMap<BlockId, Vec<BlockId>>,
    phis: &HashMap<(BlockId, ValueId), ValueId>,
    alloca_tys: &HashMap<ValueId, TypeId>,
    defs: &mut HashMap<ValueId, ValueId>,
) {
    let saved = defs.clone();

    // Placed phis are the incoming definitions of this block.
    for (&(b, alloca), &phi) in phis {
        if b == block {
            defs.insert(alloca, phi);
        }
    }

    for v in module.function(id).block_insts(block).to_vec() {
        let func = module.function_mut(id);
        match func.kind(v).clone() {
            InstKind::Load { addr } if alloca_tys.contains_key(&addr) => {
                match defs.get(&addr) {
                    Some(&def) => {
                        func.replace_all_uses(v, def);
                        func.remove_inst(v);
                    }
                    None => {
                        // Read before any write: defined as zero.
                        func.replace_kind(v, InstKind::Immediate { value: 0 });
                        defs.insert(addr, v);
                    }
                }
            }
            InstKind::Store { value, addr } if alloca_tys.contains_key(&addr) => {
                defs.insert(addr, value);
                func.remove_inst(v);
            }
            _ => {}
        }
    }

    // Feed the phis of the CFG successors.
    for succ in module.function(id).successors(block) {
        for (&alloca, &elem_ty) in alloca_tys {
            let Some(&phi) = phis.get(&(succ, alloca)) else {
                continue;
            };
            let def = match defs.get(&alloca) {
                Some(&d) => d,
                None => {
                    // No definition reaches this edge; feed a zero placed
                    // before the terminator so it dominates the edge.
                    let func = module.function_mut(id);
                    let at = func.block_insts(block).len().saturating_sub(1);
                    let zero = func.insert_inst_at(
                        block,
                        at,
                        InstData::new(InstKind::Immediate { value: 0 }, elem_ty),
                    );
                    defs.insert(alloca, zero);
                    zero
                }
            };
            module.function_mut(id).add_phi_incoming(phi, block, def);
        }
    }

    for &child in children.get(&block).map(|v| v.as_slice()).unwrap_or(&[]) {
        rename_block(module, id, child, children, phis, alloca_tys, defs);
    }

    *defs = saved;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::printer::print_function;
    use crate::ir::verifier::verify_module;
    use crate::parser::parse_module;

    #[test]
    fn test_promotes_local_scalar() {
        let input = r#"
            fn @f() -> i32 {
            entry:
              %slot = alloca i32
              %v = imm.i32 11
              store.i32 %v, %slot
              %r = load.i32 %slot
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = PromoteAllocas;
        assert!(pass.run(&mut module).unwrap());
        verify_module(&module).unwrap();
        let f = module.func_id("f").unwrap();
        let text = print_function(&module, f);
        assert!(!text.contains("alloca"));
        assert!(!text.contains("load"));
        assert!(text.contains("ret.i32"));
    }

    #[test]
    fn test_places_phi_at_join() {
        let input = r#"
            fn @f(bool %c) -> i32 {
            entry:
              %slot = alloca i32
              %a = imm.i32 1
              store.i32 %a, %slot
              br %c, t, join
            t:
              %b = imm.i32 2
              store.i32 %b, %slot
              jmp join
            join:
              %r = load.i32 %slot
              ret.i32 %r
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = PromoteAllocas;
        assert!(pass.run(&mut module).unwrap());
        verify_module(&module).unwrap();
        let f = module.func_id("f").unwrap();
        let text = print_function(&module, f);
        assert!(!text.contains("alloca"));
        assert!(text.contains("phi.i32"));
    }

    #[test]
    fn test_escaping_alloca_kept() {
        let input = r#"
            extern fn @sink(*i32) -> void

            fn @f() -> void {
            entry:
              %slot = alloca i32
              call @sink(%slot)
              ret.void
            }
        "#;
        let mut module = parse_module(input).unwrap();
        let mut pass = PromoteAllocas;
        assert!(!pass.run(&mut module).unwrap());
        let f = module.func_id("f").unwrap();
        let text = print_function(&module, f);
        assert!(text.contains("alloca"));
    }
}
