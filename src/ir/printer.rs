//! Textual IR output.
//!
//! Prints a module in the stable format the parser reads back. Values are
//! renumbered per function (parameters first, then block order), so printed
//! IR is independent of arena history; blocks are labelled `b0`, `b1`, ... in
//! layout order with `b0` the entry.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::function::Function;
use super::instruction::{BlockId, Callee, InstKind, ValueId};
use super::module::{FuncId, GlobalInit, Module};

/// Print a whole module.
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for g in module.global_ids() {
        let data = module.global(g);
        let ty = module.types.display(data.ty);
        if data.is_external {
            let _ = writeln!(out, "extern global @{}: {}", module.global_name(g), ty);
            continue;
        }
        match &data.init {
            None => {
                let _ = writeln!(out, "global @{}: {}", module.global_name(g), ty);
            }
            Some(GlobalInit::Int(v)) => {
                let _ = writeln!(out, "global @{}: {} = {}", module.global_name(g), ty, v);
            }
            Some(GlobalInit::Bytes(bytes)) => {
                let _ = writeln!(
                    out,
                    "global @{}: {} = \"{}\"",
                    module.global_name(g),
                    ty,
                    escape_bytes(bytes)
                );
            }
        }
    }
    if module.global_ids().count() > 0 {
        out.push('\n');
    }

    let mut first = true;
    for f in module.func_ids() {
        if !first {
            out.push('\n');
        }
        first = false;
        out.push_str(&print_function(module, f));
    }
    out
}

/// Print one function (or an extern declaration).
pub fn print_function(module: &Module, id: FuncId) -> String {
    let func = module.function(id);
    let mut out = String::new();

    if func.flags.is_extern {
        let _ = write!(out, "extern fn @{}(", module.func_name(id));
        for (i, &p) in func.params().iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&module.types.display(func.ty(p)));
        }
        let _ = writeln!(out, ") -> {}", module.types.display(func.ret_ty));
        return out;
    }

    let names = number_values(module, func);
    let labels = number_blocks(func);

    if !func.flags.is_global {
        out.push_str("local ");
    }
    let _ = write!(out, "fn @{}(", module.func_name(id));
    for (i, &p) in func.params().iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{} %{}", module.types.display(func.ty(p)), names[&p]);
    }
    let _ = write!(out, ") -> {}", module.types.display(func.ret_ty));
    if func.flags.forceinline {
        out.push_str(" inline");
    }
    if func.flags.noreturn {
        out.push_str(" noreturn");
    }
    out.push_str(" {\n");

    for &b in func.block_order() {
        let _ = writeln!(out, "{}:", labels[&b]);
        for &v in func.block_insts(b) {
            let _ = writeln!(out, "  {}", print_inst(module, func, v, &names, &labels));
        }
    }
    out.push_str("}\n");
    out
}

fn number_values(module: &Module, func: &Function) -> HashMap<ValueId, u32> {
    // Only value-producing instructions get names; void results are never
    // operands, so numbering stays stable across print/parse round-trips.
    let mut names = HashMap::new();
    let mut next = 0u32;
    for &p in func.params() {
        names.insert(p, next);
        next += 1;
    }
    for &b in func.block_order() {
        for &v in func.block_insts(b) {
            if module.types.is_void(func.ty(v)) {
                continue;
            }
            names.insert(v, next);
            next += 1;
        }
    }
    names
}

fn number_blocks(func: &Function) -> HashMap<BlockId, String> {
    func.block_order()
        .iter()
        .enumerate()
        .map(|(i, &b)| (b, format!("b{}", i)))
        .collect()
}

fn print_inst(
    module: &Module,
    func: &Function,
    v: ValueId,
    names: &HashMap<ValueId, u32>,
    labels: &HashMap<BlockId, String>,
) -> String {
    let val = |x: &ValueId| format!("%{}", names[x]);
    let ty = |t| module.types.display(t);
    match func.kind(v) {
        InstKind::Immediate { value } => {
            format!("%{} = imm.{} {}", names[&v], ty(func.ty(v)), value)
        }
        InstKind::StaticRef { global } => {
            format!("%{} = addr @{}", names[&v], module.global_name(*global))
        }
        InstKind::FuncRef { func: f } => {
            format!("%{} = fnaddr @{}", names[&v], module.func_name(*f))
        }
        InstKind::Alloca { allocated } => {
            format!("%{} = alloca {}", names[&v], ty(*allocated))
        }
        InstKind::Load { addr } => {
            format!("%{} = load.{} {}", names[&v], ty(func.ty(v)), val(addr))
        }
        InstKind::Store { value, addr } => {
            format!("store.{} {}, {}", ty(func.ty(*value)), val(value), val(addr))
        }
        InstKind::Binary { op, lhs, rhs } => format!(
            "%{} = {}.{} {}, {}",
            names[&v],
            op,
            ty(func.ty(v)),
            val(lhs),
            val(rhs)
        ),
        InstKind::Not { value } => {
            format!("%{} = not.{} {}", names[&v], ty(func.ty(v)), val(value))
        }
        InstKind::Cmp { op, lhs, rhs } => format!(
            "%{} = {}.{} {}, {}",
            names[&v],
            op,
            ty(func.ty(*lhs)),
            val(lhs),
            val(rhs)
        ),
        InstKind::Cast { op, value } => format!(
            "%{} = {}.{} {}",
            names[&v],
            op,
            ty(func.ty(v)),
            val(value)
        ),
        InstKind::Branch { target } => format!("jmp {}", labels[target]),
        InstKind::CondBranch {
            cond,
            then_dest,
            else_dest,
        } => format!(
            "br {}, {}, {}",
            val(cond),
            labels[then_dest],
            labels[else_dest]
        ),
        InstKind::Return { value } => match value {
            Some(rv) => format!("ret.{} {}", ty(func.ty(*rv)), val(rv)),
            None => "ret.void".to_string(),
        },
        InstKind::Unreachable => "unreachable".to_string(),
        InstKind::Phi { incoming } => {
            let mut s = format!("%{} = phi.{} ", names[&v], ty(func.ty(v)));
            for (i, (b, x)) in incoming.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                let _ = write!(s, "[{}, {}]", val(x), labels[b]);
            }
            s
        }
        InstKind::Call { callee, args, tail } => {
            let mut s = String::new();
            if !module.types.is_void(func.ty(v)) {
                let _ = write!(s, "%{} = ", names[&v]);
            }
            let mnemonic = match (callee, *tail) {
                (Callee::Direct(_), false) => "call",
                (Callee::Direct(_), true) => "tailcall",
                (Callee::Indirect(_), false) => "icall",
                (Callee::Indirect(_), true) => "tailicall",
            };
            match callee {
                Callee::Direct(f) => {
                    let _ = write!(s, "{} @{}(", mnemonic, module.func_name(*f));
                }
                Callee::Indirect(t) => {
                    let _ = write!(s, "{} {}(", mnemonic, val(t));
                }
            }
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    s.push_str(", ");
                }
                s.push_str(&val(a));
            }
            s.push(')');
            s
        }
        InstKind::Parameter { .. } | InstKind::Placeholder => {
            // Parameters print in the signature; placeholders never sit in
            // blocks.
            String::new()
        }
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut s = String::new();
    for &b in bytes {
        match b {
            b'"' => s.push_str("\\22"),
            b'\\' => s.push_str("\\5c"),
            0x20..=0x7e => s.push(b as char),
            _ => {
                let _ = write!(s, "\\{:02x}", b);
            }
        }
    }
    s
}
