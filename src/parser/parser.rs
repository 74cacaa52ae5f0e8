//! Line-oriented parser for the textual IR format.
//!
//! Two passes: the first collects every function signature and global so
//! forward references resolve, the second builds function bodies through the
//! IR builder. Source line numbers are attached to every instruction.

use std::collections::HashMap;

use crate::error::{BasaltError, Result};
use crate::ir::builder::IrBuilder;
use crate::ir::instruction::{BinaryOp, BlockId, CastOp, CmpOp, InstKind, ValueId};
use crate::ir::module::{FuncId, GlobalInit, Module};
use crate::ir::types::{TypeId, TypeKind};
use crate::target::{CallConv, TargetDescription};

/// Parse a textual IR module.
pub fn parse_module(input: &str) -> Result<Module> {
    let mut module = Module::new("module");
    let target = TargetDescription::default();

    let lines: Vec<(usize, &str)> = input
        .lines()
        .enumerate()
        .map(|(i, raw)| {
            let no_comment = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            (i + 1, no_comment.trim())
        })
        .filter(|(_, l)| !l.is_empty())
        .collect();

    // Pass 1: declarations. Function bodies are collected for pass 2.
    struct PendingBody<'a> {
        func: FuncId,
        param_names: Vec<String>,
        lines: Vec<(usize, &'a str)>,
    }
    let mut bodies: Vec<PendingBody> = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let (line_no, line) = lines[i];
        let err = |msg: String| BasaltError::ParsingError(format!("line {}: {}", line_no, msg));

        if line.starts_with("extern global ") {
            parse_global(&mut module, &target, &line["extern global ".len()..], true)
                .map_err(|e| err(e))?;
            i += 1;
        } else if line.starts_with("global ") {
            parse_global(&mut module, &target, &line["global ".len()..], false)
                .map_err(|e| err(e))?;
            i += 1;
        } else if line.starts_with("extern fn ") {
            let (name, params, ret, _attrs, has_body) =
                parse_signature(&mut module, &target, &line["extern fn ".len()..])
                    .map_err(|e| err(e))?;
            if has_body {
                return Err(err("extern function cannot have a body".to_string()));
            }
            let f = module.declare_function(&name, ret, target.conv);
            module.function_mut(f).flags.is_extern = true;
            for (ty, _) in params {
                module.function_mut(f).add_param(ty);
            }
            i += 1;
        } else if line.starts_with("fn ") || line.starts_with("local fn ") {
            let local = line.starts_with("local fn ");
            let rest = if local {
                &line["local fn ".len()..]
            } else {
                &line["fn ".len()..]
            };
            let (name, params, ret, attrs, has_body) =
                parse_signature(&mut module, &target, rest).map_err(|e| err(e))?;
            if !has_body {
                return Err(err(format!("function @{} has no body", name)));
            }
            let f = module.declare_function(&name, ret, target.conv);
            if !module.function(f).block_order().is_empty() {
                return Err(err(format!("duplicate definition of @{}", name)));
            }
            {
                let func = module.function_mut(f);
                func.flags.is_global = !local;
                func.flags.forceinline = attrs.contains(&"inline");
                func.flags.noreturn = attrs.contains(&"noreturn");
            }
            let mut param_names = Vec::new();
            for (ty, pname) in params {
                module.function_mut(f).add_param(ty);
                param_names.push(pname.ok_or_else(|| {
                    err("defined function parameters need names".to_string())
                })?);
            }

            // Collect the body up to the closing brace.
            let mut body = Vec::new();
            i += 1;
            loop {
                if i >= lines.len() {
                    return Err(err(format!("unterminated body of @{}", name)));
                }
                let (ln, l) = lines[i];
                i += 1;
                if l == "}" {
                    break;
                }
                body.push((ln, l));
            }
            bodies.push(PendingBody {
                func: f,
                param_names,
                lines: body,
            });
        } else {
            return Err(err(format!("unexpected top-level input: '{}'", line)));
        }
    }

    // Pass 2: bodies.
    for body in bodies {
        parse_body(&mut module, body.func, &body.param_names, &body.lines)?;
    }

    Ok(module)
}

type Attrs = Vec<&'static str>;

/// Parse `@name(params) -> ret [attrs] [{]`, returning whether a body opens.
fn parse_signature(
    module: &mut Module,
    target: &TargetDescription,
    s: &str,
) -> std::result::Result<(String, Vec<(TypeId, Option<String>)>, TypeId, Attrs, bool), String> {
    let s = s.trim();
    let rest = s
        .strip_prefix('@')
        .ok_or_else(|| "expected '@' before function name".to_string())?;
    let open = rest
        .find('(')
        .ok_or_else(|| "expected '(' after function name".to_string())?;
    let name = rest[..open].trim().to_string();
    if name.is_empty() {
        return Err("empty function name".to_string());
    }
    let close = rest
        .rfind(')')
        .ok_or_else(|| "expected ')' after parameters".to_string())?;
    let params_str = &rest[open + 1..close];
    let mut params = Vec::new();
    for part in split_top_commas(params_str) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (ty, remainder) = parse_type_prefix(module, target, part)?;
        let remainder = remainder.trim();
        if remainder.is_empty() {
            params.push((ty, None));
        } else {
            let pname = remainder
                .strip_prefix('%')
                .ok_or_else(|| format!("expected parameter name, got '{}'", remainder))?;
            params.push((ty, Some(pname.to_string())));
        }
    }

    let after = rest[close + 1..].trim();
    let after = after
        .strip_prefix("->")
        .ok_or_else(|| "expected '->' after parameter list".to_string())?
        .trim();
    let (ret, mut tail) = parse_type_prefix(module, target, after)?;
    let mut attrs = Vec::new();
    let mut has_body = false;
    loop {
        tail = tail.trim_start();
        if tail.is_empty() {
            break;
        }
        if let Some(r) = tail.strip_prefix("inline") {
            attrs.push("inline");
            tail = r;
        } else if let Some(r) = tail.strip_prefix("noreturn") {
            attrs.push("noreturn");
            tail = r;
        } else if tail == "{" {
            has_body = true;
            break;
        } else {
            return Err(format!("unexpected trailing input '{}'", tail));
        }
    }
    Ok((name, params, ret, attrs, has_body))
}

/// Parse `@name: TYPE [= init]`.
fn parse_global(
    module: &mut Module,
    target: &TargetDescription,
    s: &str,
    external: bool,
) -> std::result::Result<(), String> {
    let s = s.trim();
    let rest = s
        .strip_prefix('@')
        .ok_or_else(|| "expected '@' before global name".to_string())?;
    let colon = rest
        .find(':')
        .ok_or_else(|| "expected ':' after global name".to_string())?;
    let name = rest[..colon].trim().to_string();
    let after = rest[colon + 1..].trim();

    let (init_str, ty_str) = match find_top_eq(after) {
        Some(pos) => (Some(after[pos + 1..].trim()), after[..pos].trim()),
        None => (None, after),
    };
    let ty = parse_type_full(module, target, ty_str)?;

    if external {
        if init_str.is_some() {
            return Err("external global cannot be initialised".to_string());
        }
        module.declare_external_global(&name, ty);
        return Ok(());
    }

    let init = match init_str {
        None => None,
        Some(text) => {
            if text.starts_with('"') {
                let inner = text
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .ok_or_else(|| "unterminated string initialiser".to_string())?;
                Some(GlobalInit::Bytes(unescape_bytes(inner)?))
            } else {
                let v: i64 = text
                    .parse()
                    .map_err(|_| format!("bad integer initialiser '{}'", text))?;
                Some(GlobalInit::Int(v))
            }
        }
    };
    module.define_global(&name, ty, init);
    Ok(())
}

/// State while parsing one function body.
struct BodyCtx<'m> {
    builder: IrBuilder<'m>,
    names: HashMap<String, ValueId>,
    labels: HashMap<String, BlockId>,
    pending_phis: Vec<(ValueId, TypeId, Vec<(String, String)>, usize)>,
}

fn parse_body(
    module: &mut Module,
    func: FuncId,
    param_names: &[String],
    lines: &[(usize, &str)],
) -> Result<()> {
    let target = TargetDescription::default();
    let func_label = module.func_name(func).to_string();

    let mut ctx = BodyCtx {
        builder: IrBuilder::new(&mut *module, func),
        names: HashMap::new(),
        labels: HashMap::new(),
        pending_phis: Vec::new(),
    };
    for (i, name) in param_names.iter().enumerate() {
        let p = ctx.builder.module().function(func).params()[i];
        ctx.names.insert(name.clone(), p);
    }

    // Pre-create blocks in order of appearance so branches resolve forward.
    let mut label_order = Vec::new();
    for &(ln, line) in lines {
        if let Some(label) = line.strip_suffix(':') {
            let label = label.trim();
            if is_ident(label) {
                if ctx.labels.contains_key(label) {
                    return Err(BasaltError::ParsingError(format!(
                        "line {}: duplicate block label '{}'",
                        ln, label
                    )));
                }
                let b = ctx.builder.create_block();
                ctx.labels.insert(label.to_string(), b);
                label_order.push(label.to_string());
            }
        }
    }
    if label_order.is_empty() {
        return Err(BasaltError::ParsingError(format!(
            "function @{} has no blocks",
            func_label
        )));
    }

    for &(ln, line) in lines {
        if let Some(label) = line.strip_suffix(':') {
            let label = label.trim();
            if is_ident(label) {
                let b = ctx.labels[label];
                ctx.builder.set_block(b);
                continue;
            }
        }
        ctx.builder.set_loc(ln as u32, 1);
        parse_inst(&mut ctx, &target, line, ln)
            .map_err(|m| BasaltError::ParsingError(format!("line {}: {}", ln, m)))?;
    }

    // Resolve phi operands that referred forward.
    let pending = std::mem::take(&mut ctx.pending_phis);
    let names = ctx.names;
    let labels = ctx.labels;
    for (phi, _ty, pairs, ln) in pending {
        let mut incoming = Vec::new();
        for (value_name, label) in pairs {
            let v = *names.get(&value_name).ok_or_else(|| {
                BasaltError::ParsingError(format!(
                    "line {}: unknown value %{} in phi",
                    ln, value_name
                ))
            })?;
            let b = *labels.get(&label).ok_or_else(|| {
                BasaltError::ParsingError(format!("line {}: unknown label '{}' in phi", ln, label))
            })?;
            incoming.push((b, v));
        }
        module.function_mut(func).replace_kind(phi, InstKind::Phi { incoming });
    }

    // Friendly terminator diagnostics before the verifier runs.
    for label in &label_order {
        let b = labels[label];
        if !module.function(func).closes_block(b) {
            return Err(BasaltError::ParsingError(format!(
                "block '{}' of @{} must end with a terminator instruction",
                label, func_label
            )));
        }
    }

    Ok(())
}

fn parse_inst(
    ctx: &mut BodyCtx<'_>,
    target: &TargetDescription,
    line: &str,
    ln: usize,
) -> std::result::Result<(), String> {
    // `%name = rhs` or a bare rhs for void-producing instructions.
    let (result, rhs) = match line.strip_prefix('%') {
        Some(rest) => match rest.find('=') {
            Some(eq) => {
                let name = rest[..eq].trim().to_string();
                (Some(name), rest[eq + 1..].trim())
            }
            None => return Err(format!("expected '=' in '{}'", line)),
        },
        None => (None, line),
    };

    let mnemonic = rhs.split_whitespace().next().unwrap_or("");
    let rest = rhs[mnemonic.len()..].trim();
    let (op, suffix) = match mnemonic.find('.') {
        Some(dot) => (&mnemonic[..dot], &mnemonic[dot + 1..]),
        None => (mnemonic, ""),
    };

    let produced = match op {
        "imm" => {
            let ty = type_of(ctx, target, suffix)?;
            let value = parse_int(rest)?;
            Some(ctx.builder.emit_imm(value, ty).map_err(stringify)?)
        }
        "addr" => {
            let name = rest
                .strip_prefix('@')
                .ok_or_else(|| format!("expected '@global' after addr, got '{}'", rest))?;
            let g = ctx
                .builder
                .module()
                .global_id(name)
                .ok_or_else(|| format!("unknown global @{}", name))?;
            Some(ctx.builder.emit_static_ref(g).map_err(stringify)?)
        }
        "fnaddr" => {
            let name = rest
                .strip_prefix('@')
                .ok_or_else(|| format!("expected '@function' after fnaddr, got '{}'", rest))?;
            let f = ctx
                .builder
                .module()
                .func_id(name)
                .ok_or_else(|| format!("unknown function @{}", name))?;
            Some(ctx.builder.emit_func_ref(f).map_err(stringify)?)
        }
        "alloca" => {
            let ty = type_of(ctx, target, rest)?;
            Some(ctx.builder.emit_alloca(ty).map_err(stringify)?)
        }
        "load" => {
            let ty = type_of(ctx, target, suffix)?;
            let addr = named_value(ctx, rest)?;
            let loaded = ctx.builder.emit_load(addr).map_err(stringify)?;
            let fid = ctx.builder.func_id();
            if ctx.builder.module().function(fid).ty(loaded) != ty {
                return Err("load type does not match the pointee".to_string());
            }
            Some(loaded)
        }
        "store" => {
            let ty = type_of(ctx, target, suffix)?;
            let parts = split_top_commas(rest);
            if parts.len() != 2 {
                return Err("store takes a value and an address".to_string());
            }
            let value = resolve_operand(ctx, parts[0].trim(), ty)?;
            let addr = named_value(ctx, parts[1].trim())?;
            ctx.builder.emit_store(value, addr).map_err(stringify)?;
            None
        }
        "add" | "sub" | "mul" | "udiv" | "sdiv" | "urem" | "srem" | "shl" | "lshr" | "ashr"
        | "and" | "or" | "xor" => {
            let ty = type_of(ctx, target, suffix)?;
            let (a, b) = two_operands(ctx, rest, ty)?;
            let bin = binary_op(op);
            Some(ctx.builder.emit_binary(bin, a, b).map_err(stringify)?)
        }
        "not" => {
            let ty = type_of(ctx, target, suffix)?;
            let v = resolve_operand(ctx, rest, ty)?;
            Some(ctx.builder.emit_not(v).map_err(stringify)?)
        }
        "eq" | "ne" | "ult" | "ule" | "ugt" | "uge" | "slt" | "sle" | "sgt" | "sge" => {
            let ty = type_of(ctx, target, suffix)?;
            let (a, b) = two_operands(ctx, rest, ty)?;
            let cmp = cmp_op(op);
            Some(ctx.builder.emit_cmp(cmp, a, b).map_err(stringify)?)
        }
        "zext" | "sext" | "trunc" | "bitcast" | "inttoptr" | "ptrtoint" => {
            let to = type_of(ctx, target, suffix)?;
            let v = named_value(ctx, rest)?;
            let cast = cast_op(op);
            Some(ctx.builder.emit_cast(cast, v, to).map_err(stringify)?)
        }
        "jmp" => {
            let b = label_of(ctx, rest)?;
            ctx.builder.emit_branch(b).map_err(stringify)?;
            None
        }
        "br" => {
            let parts = split_top_commas(rest);
            if parts.len() != 3 {
                return Err("br takes a condition and two labels".to_string());
            }
            let cond = named_value(ctx, parts[0].trim())?;
            let t = label_of(ctx, parts[1].trim())?;
            let e = label_of(ctx, parts[2].trim())?;
            ctx.builder.emit_cond_branch(cond, t, e).map_err(stringify)?;
            None
        }
        "ret" => {
            if suffix == "void" {
                ctx.builder.emit_return(None).map_err(stringify)?;
            } else {
                let ty = type_of(ctx, target, suffix)?;
                let v = resolve_operand(ctx, rest, ty)?;
                ctx.builder.emit_return(Some(v)).map_err(stringify)?;
            }
            None
        }
        "unreachable" => {
            ctx.builder.emit_unreachable().map_err(stringify)?;
            None
        }
        "phi" => {
            let ty = type_of(ctx, target, suffix)?;
            let pairs = parse_phi_pairs(rest)?;
            let phi = ctx.builder.emit_phi(ty, Vec::new()).map_err(stringify)?;
            ctx.pending_phis.push((phi, ty, pairs, ln));
            Some(phi)
        }
        "call" | "tailcall" => {
            let v = parse_direct_call(ctx, rest, op == "tailcall")?;
            if call_is_void(ctx, v) {
                None
            } else {
                Some(v)
            }
        }
        "icall" | "tailicall" => {
            let v = parse_indirect_call(ctx, rest, op == "tailicall")?;
            if call_is_void(ctx, v) {
                None
            } else {
                Some(v)
            }
        }
        other => return Err(format!("unknown instruction '{}'", other)),
    };

    match (result, produced) {
        (Some(name), Some(v)) => {
            if ctx.names.insert(name.clone(), v).is_some() {
                return Err(format!("value %{} defined twice", name));
            }
            Ok(())
        }
        (None, None) => Ok(()),
        (None, Some(_)) => Err("instruction result must be bound to a name".to_string()),
        (Some(_), None) => Err("this instruction produces no value".to_string()),
    }
}

fn call_is_void(ctx: &mut BodyCtx<'_>, v: ValueId) -> bool {
    let fid = ctx.builder.func_id();
    let module = ctx.builder.module();
    let ty = module.function(fid).ty(v);
    module.types.is_void(ty)
}

fn parse_direct_call(
    ctx: &mut BodyCtx<'_>,
    rest: &str,
    tail: bool,
) -> std::result::Result<ValueId, String> {
    let rest = rest.trim();
    let body = rest
        .strip_prefix('@')
        .ok_or_else(|| format!("expected '@function(...)', got '{}'", rest))?;
    let open = body
        .find('(')
        .ok_or_else(|| "expected '(' in call".to_string())?;
    let name = body[..open].trim();
    let args_str = body[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| "expected ')' closing the call".to_string())?;
    let callee = ctx
        .builder
        .module()
        .func_id(name)
        .ok_or_else(|| format!("unknown function @{}", name))?;
    let param_tys: Vec<TypeId> = {
        let module = ctx.builder.module();
        let f = module.function(callee);
        f.params().iter().map(|&p| f.ty(p)).collect()
    };
    let args = parse_call_args(ctx, args_str, &param_tys)?;
    let v = ctx.builder.emit_call(callee, args).map_err(stringify)?;
    if tail {
        let func = ctx.builder.func_id();
        ctx.builder.module().function_mut(func).mark_tail_call(v);
    }
    Ok(v)
}

fn parse_indirect_call(
    ctx: &mut BodyCtx<'_>,
    rest: &str,
    tail: bool,
) -> std::result::Result<ValueId, String> {
    let rest = rest.trim();
    let open = rest
        .find('(')
        .ok_or_else(|| "expected '(' in indirect call".to_string())?;
    let target = named_value(ctx, rest[..open].trim())?;
    let args_str = rest[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| "expected ')' closing the call".to_string())?;
    let param_tys: Vec<TypeId> = {
        let func_id = ctx.builder.func_id();
        let module = ctx.builder.module();
        let f = module.function(func_id);
        let pointee = module
            .types
            .pointee(f.ty(target))
            .ok_or_else(|| "indirect call target is not a pointer".to_string())?;
        match module.types.kind(pointee) {
            TypeKind::Function { params, .. } => params.clone(),
            _ => return Err("indirect call target does not point to a function".to_string()),
        }
    };
    let args = parse_call_args(ctx, args_str, &param_tys)?;
    let v = ctx
        .builder
        .emit_call_indirect(target, args)
        .map_err(stringify)?;
    if tail {
        let func = ctx.builder.func_id();
        ctx.builder.module().function_mut(func).mark_tail_call(v);
    }
    Ok(v)
}

fn parse_call_args(
    ctx: &mut BodyCtx<'_>,
    args_str: &str,
    param_tys: &[TypeId],
) -> std::result::Result<Vec<ValueId>, String> {
    let parts: Vec<&str> = split_top_commas(args_str)
        .into_iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != param_tys.len() {
        return Err(format!(
            "call passes {} arguments, callee expects {}",
            parts.len(),
            param_tys.len()
        ));
    }
    let mut args = Vec::new();
    for (part, &ty) in parts.iter().zip(param_tys) {
        args.push(resolve_operand(ctx, part, ty)?);
    }
    Ok(args)
}

fn parse_phi_pairs(rest: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    for part in split_top_commas(rest) {
        let part = part.trim();
        let inner = part
            .strip_prefix('[')
            .and_then(|p| p.strip_suffix(']'))
            .ok_or_else(|| format!("expected '[value, label]' in phi, got '{}'", part))?;
        let comma = inner
            .find(',')
            .ok_or_else(|| "expected ',' inside phi pair".to_string())?;
        let value = inner[..comma].trim();
        let label = inner[comma + 1..].trim();
        let value = value
            .strip_prefix('%')
            .ok_or_else(|| "phi operands must be named values".to_string())?;
        pairs.push((value.to_string(), label.to_string()));
    }
    Ok(pairs)
}

// --- Small helpers ---

fn stringify(e: BasaltError) -> String {
    e.to_string()
}

fn binary_op(op: &str) -> BinaryOp {
    match op {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "mul" => BinaryOp::Mul,
        "udiv" => BinaryOp::UDiv,
        "sdiv" => BinaryOp::SDiv,
        "urem" => BinaryOp::URem,
        "srem" => BinaryOp::SRem,
        "shl" => BinaryOp::Shl,
        "lshr" => BinaryOp::LShr,
        "ashr" => BinaryOp::AShr,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        _ => BinaryOp::Xor,
    }
}

fn cmp_op(op: &str) -> CmpOp {
    match op {
        "eq" => CmpOp::Eq,
        "ne" => CmpOp::Ne,
        "ult" => CmpOp::ULt,
        "ule" => CmpOp::ULe,
        "ugt" => CmpOp::UGt,
        "uge" => CmpOp::UGe,
        "slt" => CmpOp::SLt,
        "sle" => CmpOp::SLe,
        "sgt" => CmpOp::SGt,
        _ => CmpOp::SGe,
    }
}

fn cast_op(op: &str) -> CastOp {
    match op {
        "zext" => CastOp::ZExt,
        "sext" => CastOp::SExt,
        "trunc" => CastOp::Trunc,
        "bitcast" => CastOp::Bitcast,
        "inttoptr" => CastOp::IntToPtr,
        _ => CastOp::PtrToInt,
    }
}

fn type_of(
    ctx: &mut BodyCtx<'_>,
    target: &TargetDescription,
    s: &str,
) -> std::result::Result<TypeId, String> {
    parse_type_full(ctx.builder.module(), target, s)
}

fn label_of(ctx: &BodyCtx<'_>, s: &str) -> std::result::Result<BlockId, String> {
    ctx.labels
        .get(s)
        .copied()
        .ok_or_else(|| format!("unknown label '{}'", s))
}

fn named_value(ctx: &BodyCtx<'_>, s: &str) -> std::result::Result<ValueId, String> {
    let name = s
        .strip_prefix('%')
        .ok_or_else(|| format!("expected a value, got '{}'", s))?;
    ctx.names
        .get(name)
        .copied()
        .ok_or_else(|| format!("unknown value %{}", name))
}

/// A `%value`, or a literal that synthesises an immediate of `ty`.
fn resolve_operand(
    ctx: &mut BodyCtx<'_>,
    s: &str,
    ty: TypeId,
) -> std::result::Result<ValueId, String> {
    if s.starts_with('%') {
        return named_value(ctx, s);
    }
    if s == "true" {
        let b = ctx.builder.module().types.bool_ty();
        return ctx.builder.emit_imm(1, b).map_err(stringify);
    }
    if s == "false" {
        let b = ctx.builder.module().types.bool_ty();
        return ctx.builder.emit_imm(0, b).map_err(stringify);
    }
    let value = parse_int(s)?;
    ctx.builder.emit_imm(value, ty).map_err(stringify)
}

fn two_operands(
    ctx: &mut BodyCtx<'_>,
    rest: &str,
    ty: TypeId,
) -> std::result::Result<(ValueId, ValueId), String> {
    let parts = split_top_commas(rest);
    if parts.len() != 2 {
        return Err(format!("expected two operands in '{}'", rest));
    }
    let a = resolve_operand(ctx, parts[0].trim(), ty)?;
    let b = resolve_operand(ctx, parts[1].trim(), ty)?;
    Ok((a, b))
}

fn parse_int(s: &str) -> std::result::Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|_| format!("bad integer literal '{}'", s))
}

fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Split on commas that are not nested inside brackets or braces.
fn split_top_commas(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Position of a top-level `=` (outside brackets), if any.
fn find_top_eq(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_type_full(
    module: &mut Module,
    target: &TargetDescription,
    s: &str,
) -> std::result::Result<TypeId, String> {
    let (ty, rest) = parse_type_prefix(module, target, s)?;
    if !rest.trim().is_empty() {
        return Err(format!("trailing input after type: '{}'", rest.trim()));
    }
    Ok(ty)
}

/// Parse one type at the start of `s`, returning the remainder.
fn parse_type_prefix<'a>(
    module: &mut Module,
    target: &TargetDescription,
    s: &'a str,
) -> std::result::Result<(TypeId, &'a str), String> {
    let s = s.trim_start();
    if let Some(rest) = s.strip_prefix('*') {
        let (pointee, rest) = parse_type_prefix(module, target, rest)?;
        return Ok((module.types.pointer(pointee), rest));
    }
    if let Some(rest) = s.strip_prefix('[') {
        let x = rest
            .find(" x ")
            .ok_or_else(|| "expected '[N x T]' array syntax".to_string())?;
        let len: u64 = rest[..x]
            .trim()
            .parse()
            .map_err(|_| format!("bad array length '{}'", rest[..x].trim()))?;
        let (element, rest) = parse_type_prefix(module, target, &rest[x + 3..])?;
        let rest = rest.trim_start();
        let rest = rest
            .strip_prefix(']')
            .ok_or_else(|| "expected ']' closing array type".to_string())?;
        return Ok((module.types.array(element, len), rest));
    }
    if let Some(mut rest) = s.strip_prefix('{') {
        let mut fields = Vec::new();
        loop {
            rest = rest.trim_start();
            if let Some(r) = rest.strip_prefix('}') {
                return Ok((module.types.struct_type(None, fields, target), r));
            }
            let (field, r) = parse_type_prefix(module, target, rest)?;
            fields.push(field);
            rest = r.trim_start();
            if let Some(r) = rest.strip_prefix(',') {
                rest = r;
            }
        }
    }

    let end = s
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(s.len());
    let word = &s[..end];
    let rest = &s[end..];
    match word {
        "void" => Ok((module.types.void(), rest)),
        "bool" => Ok((module.types.bool_ty(), rest)),
        _ => {
            let (signed, bits_str) = if let Some(b) = word.strip_prefix('i') {
                (true, b)
            } else if let Some(b) = word.strip_prefix('u') {
                (false, b)
            } else {
                return Err(format!("unknown type '{}'", word));
            };
            let bits: u8 = bits_str
                .parse()
                .map_err(|_| format!("unknown type '{}'", word))?;
            if bits == 0 || bits > 64 {
                return Err(format!("unsupported integer width {}", bits));
            }
            Ok((module.types.int(bits, signed), rest))
        }
    }
}

fn unescape_bytes(s: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| "truncated escape in string".to_string())?;
            let v = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("bad escape '\\{}'", hex))?;
            out.push(v);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}
