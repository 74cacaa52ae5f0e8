//! Instruction selection.
//!
//! A pattern table rewrites machine IR into x86_64 MIR. Patterns are
//! ordered by specificity — fused compare-and-branch first, single
//! instructions after — and the selector walks each block forward, taking
//! the first (longest) pattern that matches at the current root. A node no
//! pattern accepts is an internal error: by the time selection runs, phis
//! are gone and every generic instruction has a target form.

use log::trace;

use crate::error::{BasaltError, Result};
use crate::mir::{
    self, Address, CallTarget, Convert, Instruction, IntBinOp, IntCmpOp, MirType, Operand as MOp,
    Register as MReg,
};
use crate::target::{CallConv, TargetDescription};

use super::abi;
use super::{Addr, AluOp, CallDest, Cc, Gpr, Inst, Operand, Reg, ShiftOp, Size, X64Function};

/// Select one function. `is_global` controls symbol binding at emission.
pub fn select_function(
    func: &mir::Function,
    is_global: bool,
    target: &TargetDescription,
) -> Result<X64Function> {
    let mut ctx = SelCtx {
        next_vreg: func.max_vreg_id() + 1,
        conv: func.sig.conv,
        target,
    };

    let mut out = X64Function {
        name: func.sig.name.clone(),
        conv: func.sig.conv,
        is_global,
        blocks: Vec::new(),
        frame: func.frame.clone(),
        returns_value: func.sig.ret_ty.is_some(),
        saved_regs: Vec::new(),
        frame_size: 0,
    };

    // The entry block receives the incoming arguments.
    let mut first = true;
    for block in &func.blocks {
        let mut insts = Vec::new();
        if first {
            lower_incoming_args(&mut ctx, &mut insts, func);
            first = false;
        }
        let body = &block.instructions;
        let mut i = 0;
        while i < body.len() {
            let mut matched = None;
            for (name, pattern) in PATTERNS {
                if let Some(consumed) = pattern(&mut ctx, &mut insts, body, i)? {
                    trace!("pattern {} matched in {}", name, block.label);
                    matched = Some(consumed);
                    break;
                }
            }
            match matched {
                Some(consumed) => i += consumed,
                None => {
                    return Err(BasaltError::CodegenError(format!(
                        "no selection pattern matches '{}' in {}",
                        body[i], func.sig.name
                    )))
                }
            }
        }
        out.blocks.push((block.label.clone(), insts));
    }
    Ok(out)
}

struct SelCtx<'a> {
    next_vreg: u32,
    conv: CallConv,
    target: &'a TargetDescription,
}

impl SelCtx<'_> {
    fn fresh(&mut self) -> Reg {
        let r = Reg::Virtual(self.next_vreg);
        self.next_vreg += 1;
        r
    }
}

type Pattern = fn(&mut SelCtx, &mut Vec<Inst>, &[Instruction], usize) -> Result<Option<usize>>;

/// Ordered by specificity; ties break on table position.
const PATTERNS: &[(&str, Pattern)] = &[
    ("cmp-branch", sel_cmp_branch),
    ("int-binary", sel_int_binary),
    ("int-cmp", sel_int_cmp),
    ("copy", sel_copy),
    ("not", sel_not),
    ("convert", sel_convert),
    ("load", sel_load),
    ("store", sel_store),
    ("lea", sel_lea),
    ("jmp", sel_jmp),
    ("br", sel_br),
    ("call", sel_call),
    ("tailcall", sel_tailcall),
    ("ret", sel_ret),
    ("unreachable", sel_unreachable),
];

fn reg(r: &MReg) -> Reg {
    match r {
        MReg::Virtual(v) => Reg::Virtual(v.id),
        MReg::Physical(name) => match Gpr::from_name(name) {
            Some(g) => Reg::Phys(g),
            None => Reg::Virtual(u32::MAX),
        },
    }
}

fn operand(o: &MOp) -> Operand {
    match o {
        MOp::Register(r) => Operand::Reg(reg(r)),
        MOp::Immediate(i) => Operand::Imm(*i),
    }
}

fn addr(a: &Address) -> Addr {
    match a {
        Address::Frame { slot, offset } => Addr::Frame {
            slot: *slot,
            offset: *offset,
        },
        Address::Base { base, offset } => Addr::Base {
            base: reg(base),
            offset: *offset,
        },
        Address::Global { name, offset } => Addr::Rip {
            symbol: name.clone(),
            offset: *offset,
        },
    }
}

fn fits_i32(v: i64) -> bool {
    v >= i32::MIN as i64 && v <= i32::MAX as i64
}

/// Get an operand into register form, materialising large immediates.
fn force_reg(ctx: &mut SelCtx, out: &mut Vec<Inst>, size: Size, o: Operand) -> Reg {
    match o {
        Operand::Reg(r) => r,
        Operand::Imm(i) => {
            let r = ctx.fresh();
            emit_imm(out, size, r, i);
            r
        }
    }
}

fn emit_imm(out: &mut Vec<Inst>, size: Size, dst: Reg, imm: i64) {
    if fits_i32(imm) {
        // Writing the 32-bit register clears the upper half, which is what
        // narrow values want anyway.
        let size = if size > Size::L { size } else { Size::L };
        out.push(Inst::Mov {
            size,
            dst,
            src: Operand::Imm(imm),
        });
    } else {
        out.push(Inst::MovAbs { dst, imm });
    }
}

/// Source operand for an ALU/cmp right-hand side: immediates must fit the
/// 32-bit field, larger ones go through a scratch register.
fn alu_src(ctx: &mut SelCtx, out: &mut Vec<Inst>, size: Size, o: Operand) -> Operand {
    match o {
        Operand::Imm(i) if !fits_i32(i) => Operand::Reg(force_reg(ctx, out, size, o)),
        other => other,
    }
}

fn cc_of(op: IntCmpOp) -> Cc {
    match op {
        IntCmpOp::Eq => Cc::E,
        IntCmpOp::Ne => Cc::Ne,
        IntCmpOp::ULt => Cc::B,
        IntCmpOp::ULe => Cc::Be,
        IntCmpOp::UGt => Cc::A,
        IntCmpOp::UGe => Cc::Ae,
        IntCmpOp::SLt => Cc::L,
        IntCmpOp::SLe => Cc::Le,
        IntCmpOp::SGt => Cc::G,
        IntCmpOp::SGe => Cc::Ge,
    }
}

/// Bind the ABI argument registers and stack homes to the parameter vregs.
fn lower_incoming_args(ctx: &mut SelCtx, out: &mut Vec<Inst>, func: &mir::Function) {
    let arg_regs = abi::arg_registers(ctx.target, ctx.conv);
    let shadow = ctx.target.shadow_space(ctx.conv) as i32;
    let mut stack_offset = 16 + shadow; // above saved rbp and return address
    for (i, p) in func.sig.params.iter().enumerate() {
        let dst = reg(&p.reg);
        let size = Size::from_mir(p.ty);
        if i < arg_regs.len() {
            out.push(Inst::Mov {
                size: size.max(Size::L),
                dst,
                src: Operand::Reg(Reg::Phys(arg_regs[i])),
            });
        } else {
            out.push(Inst::Load {
                size,
                dst,
                addr: Addr::Base {
                    base: Reg::Phys(Gpr::Rbp),
                    offset: stack_offset,
                },
            });
            stack_offset += 8;
        }
    }
}

// --- Patterns ---

/// `cmp` whose flag feeds the immediately following branch: compare once,
/// branch on the condition directly.
fn sel_cmp_branch(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::IntCmp {
        op,
        ty,
        dst,
        lhs,
        rhs,
    } = &body[i]
    else {
        return Ok(None);
    };
    let Some(Instruction::Br {
        cond,
        true_target,
        false_target,
    }) = body.get(i + 1)
    else {
        return Ok(None);
    };
    if cond != dst {
        return Ok(None);
    }
    let size = Size::from_mir(*ty);
    let l = force_reg(ctx, out, size, operand(lhs));
    let r = alu_src(ctx, out, size, operand(rhs));
    let cc = cc_of(*op);
    out.push(Inst::Cmp {
        size,
        lhs: l,
        rhs: r,
    });
    // The flag value itself stays materialised; later uses are rare and the
    // setcc costs nothing when dead.
    out.push(Inst::Setcc {
        cc,
        dst: reg(dst),
    });
    out.push(Inst::Jcc {
        cc,
        target: true_target.clone(),
    });
    out.push(Inst::Jmp {
        target: false_target.clone(),
    });
    Ok(Some(2))
}

fn sel_int_binary(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::IntBinary {
        op,
        ty,
        dst,
        lhs,
        rhs,
    } = &body[i]
    else {
        return Ok(None);
    };
    let size = Size::from_mir(*ty);
    let dst = reg(dst);
    let l = operand(lhs);
    let r = operand(rhs);

    match op {
        IntBinOp::Add | IntBinOp::Sub | IntBinOp::And | IntBinOp::Or | IntBinOp::Xor => {
            let alu = match op {
                IntBinOp::Add => AluOp::Add,
                IntBinOp::Sub => AluOp::Sub,
                IntBinOp::And => AluOp::And,
                IntBinOp::Or => AluOp::Or,
                _ => AluOp::Xor,
            };
            // Two-address form reads dst; route through a scratch when the
            // right operand aliases it.
            if r == Operand::Reg(dst) {
                let t = ctx.fresh();
                emit_move(out, size, t, l);
                let src = alu_src(ctx, out, size, r);
                out.push(Inst::Alu {
                    op: alu,
                    size,
                    dst: t,
                    src,
                });
                out.push(Inst::Mov {
                    size,
                    dst,
                    src: Operand::Reg(t),
                });
            } else {
                emit_move(out, size, dst, l);
                let src = alu_src(ctx, out, size, r);
                out.push(Inst::Alu {
                    op: alu,
                    size,
                    dst,
                    src,
                });
            }
        }
        IntBinOp::Mul => {
            // imul has no byte form; low bits at dword width are identical.
            let size = size.max(Size::L);
            if r == Operand::Reg(dst) {
                let t = ctx.fresh();
                emit_move(out, size, t, l);
                let src = alu_src(ctx, out, size, r);
                out.push(Inst::Imul {
                    size,
                    dst: t,
                    src,
                });
                out.push(Inst::Mov {
                    size,
                    dst,
                    src: Operand::Reg(t),
                });
            } else {
                emit_move(out, size, dst, l);
                let src = alu_src(ctx, out, size, r);
                out.push(Inst::Imul { size, dst, src });
            }
        }
        IntBinOp::UDiv | IntBinOp::SDiv | IntBinOp::URem | IntBinOp::SRem => {
            let signed = matches!(op, IntBinOp::SDiv | IntBinOp::SRem);
            let wsize = size.max(Size::L);
            // Dividend in the accumulator, widened to at least 32 bits.
            widen_into(out, Reg::Phys(Gpr::Rax), l, size, wsize, signed);
            let divisor = ctx.fresh();
            widen_into(out, divisor, r, size, wsize, signed);
            if signed {
                out.push(Inst::Cqo { size: wsize });
                out.push(Inst::Idiv {
                    size: wsize,
                    divisor,
                });
            } else {
                out.push(Inst::Mov {
                    size: Size::L,
                    dst: Reg::Phys(Gpr::Rdx),
                    src: Operand::Imm(0),
                });
                out.push(Inst::Div {
                    size: wsize,
                    divisor,
                });
            }
            let result = if matches!(op, IntBinOp::UDiv | IntBinOp::SDiv) {
                Gpr::Rax
            } else {
                Gpr::Rdx
            };
            out.push(Inst::Mov {
                size: wsize,
                dst,
                src: Operand::Reg(Reg::Phys(result)),
            });
        }
        IntBinOp::Shl | IntBinOp::LShr | IntBinOp::AShr => {
            let shift = match op {
                IntBinOp::Shl => ShiftOp::Shl,
                IntBinOp::LShr => ShiftOp::Shr,
                _ => ShiftOp::Sar,
            };
            emit_move(out, size, dst, l);
            match r {
                Operand::Imm(n) => out.push(Inst::Shift {
                    op: shift,
                    size,
                    dst,
                    amount: Some((n as u64 % (size.bytes() * 8)) as u8),
                }),
                Operand::Reg(amount) => {
                    out.push(Inst::Mov {
                        size: Size::B,
                        dst: Reg::Phys(Gpr::Rcx),
                        src: Operand::Reg(amount),
                    });
                    out.push(Inst::Shift {
                        op: shift,
                        size,
                        dst,
                        amount: None,
                    });
                }
            }
        }
    }
    Ok(Some(1))
}

fn emit_move(out: &mut Vec<Inst>, size: Size, dst: Reg, src: Operand) {
    match src {
        Operand::Reg(r) if r == dst => {}
        Operand::Reg(r) => out.push(Inst::Mov {
            size,
            dst,
            src: Operand::Reg(r),
        }),
        Operand::Imm(i) => emit_imm(out, size, dst, i),
    }
}

/// Move `src` into `dst` extended from `from` to `to` width.
fn widen_into(
    out: &mut Vec<Inst>,
    dst: Reg,
    src: Operand,
    from: Size,
    to: Size,
    signed: bool,
) {
    match src {
        Operand::Imm(i) => emit_imm(out, to, dst, i),
        Operand::Reg(r) => {
            if from == to {
                emit_move(out, to, dst, src);
            } else if signed {
                out.push(Inst::Movsx { from, dst, src: r });
            } else {
                out.push(Inst::Movzx { from, dst, src: r });
            }
        }
    }
}

fn sel_int_cmp(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::IntCmp {
        op,
        ty,
        dst,
        lhs,
        rhs,
    } = &body[i]
    else {
        return Ok(None);
    };
    let size = Size::from_mir(*ty);
    let l = force_reg(ctx, out, size, operand(lhs));
    let r = alu_src(ctx, out, size, operand(rhs));
    out.push(Inst::Cmp {
        size,
        lhs: l,
        rhs: r,
    });
    out.push(Inst::Setcc {
        cc: cc_of(*op),
        dst: reg(dst),
    });
    Ok(Some(1))
}

fn sel_copy(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Copy { ty, dst, src } = &body[i] else {
        return Ok(None);
    };
    emit_move(out, Size::from_mir(*ty), reg(dst), operand(src));
    Ok(Some(1))
}

fn sel_not(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Not { ty, dst, src } = &body[i] else {
        return Ok(None);
    };
    let size = Size::from_mir(*ty);
    let dst = reg(dst);
    emit_move(out, size, dst, operand(src));
    out.push(Inst::Not { size, dst });
    Ok(Some(1))
}

fn sel_convert(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::ConvertOp {
        kind,
        from,
        to,
        dst,
        src,
    } = &body[i]
    else {
        return Ok(None);
    };
    let from_size = Size::from_mir(*from);
    let to_size = Size::from_mir(*to);
    let dst = reg(dst);
    match (kind, operand(src)) {
        (_, Operand::Imm(v)) => emit_imm(out, to_size, dst, v),
        (Convert::ZExt, Operand::Reg(r)) => {
            if from_size == Size::L {
                // A 32-bit move zero-extends by itself.
                out.push(Inst::Mov {
                    size: Size::L,
                    dst,
                    src: Operand::Reg(r),
                });
            } else {
                out.push(Inst::Movzx {
                    from: from_size,
                    dst,
                    src: r,
                });
            }
        }
        (Convert::SExt, Operand::Reg(r)) => out.push(Inst::Movsx {
            from: from_size,
            dst,
            src: r,
        }),
        (Convert::Trunc, Operand::Reg(r)) => out.push(Inst::Mov {
            size: to_size,
            dst,
            src: Operand::Reg(r),
        }),
    }
    let _ = ctx;
    Ok(Some(1))
}

fn sel_load(
    _ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Load { ty, dst, addr: a } = &body[i] else {
        return Ok(None);
    };
    out.push(Inst::Load {
        size: Size::from_mir(*ty),
        dst: reg(dst),
        addr: addr(a),
    });
    Ok(Some(1))
}

fn sel_store(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Store { ty, src, addr: a } = &body[i] else {
        return Ok(None);
    };
    let size = Size::from_mir(*ty);
    match operand(src) {
        Operand::Reg(r) => out.push(Inst::StoreReg {
            size,
            src: r,
            addr: addr(a),
        }),
        Operand::Imm(v) if fits_i32(v) => out.push(Inst::StoreImm {
            size,
            imm: v as i32,
            addr: addr(a),
        }),
        imm => {
            let r = force_reg(ctx, out, size, imm);
            out.push(Inst::StoreReg {
                size,
                src: r,
                addr: addr(a),
            });
        }
    }
    Ok(Some(1))
}

fn sel_lea(
    _ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Lea { dst, addr: a } = &body[i] else {
        return Ok(None);
    };
    out.push(Inst::Lea {
        dst: reg(dst),
        addr: addr(a),
    });
    Ok(Some(1))
}

fn sel_jmp(
    _ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Jmp { target } = &body[i] else {
        return Ok(None);
    };
    out.push(Inst::Jmp {
        target: target.clone(),
    });
    Ok(Some(1))
}

fn sel_br(
    _ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Br {
        cond,
        true_target,
        false_target,
    } = &body[i]
    else {
        return Ok(None);
    };
    let c = reg(cond);
    out.push(Inst::Test {
        size: Size::B,
        lhs: c,
        rhs: c,
    });
    out.push(Inst::Jcc {
        cc: Cc::Ne,
        target: true_target.clone(),
    });
    out.push(Inst::Jmp {
        target: false_target.clone(),
    });
    Ok(Some(1))
}

/// Argument staging shared by calls and tail hand-offs. Returns the used
/// argument registers and the stack bytes to release after the call.
fn stage_args(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    args: &[(MirType, MOp)],
    conv: CallConv,
) -> (Vec<Gpr>, i32) {
    let arg_regs = abi::arg_registers(ctx.target, conv);
    let shadow = ctx.target.shadow_space(conv) as i32;
    let nstack = args.len().saturating_sub(arg_regs.len()) as i32;
    let pad = if (8 * nstack + shadow) % 16 == 8 { 8 } else { 0 };

    if pad > 0 {
        out.push(Inst::AdjustSp { bytes: -pad });
    }
    // Stack arguments go on in reverse so the first lands lowest.
    for (ty, a) in args.iter().skip(arg_regs.len()).rev() {
        let size = Size::from_mir(*ty);
        let r = force_reg(ctx, out, size.max(Size::L), operand(a));
        out.push(Inst::Push { src: r });
    }
    if shadow > 0 {
        out.push(Inst::AdjustSp { bytes: -shadow });
    }

    let mut used = Vec::new();
    for (i, (ty, a)) in args.iter().take(arg_regs.len()).enumerate() {
        let size = Size::from_mir(*ty).max(Size::L);
        emit_move(out, size, Reg::Phys(arg_regs[i]), operand(a));
        used.push(arg_regs[i]);
    }
    (used, 8 * nstack + shadow + pad)
}

fn call_dest(target: &CallTarget) -> CallDest {
    match target {
        CallTarget::Sym(s) => CallDest::Sym(s.clone()),
        CallTarget::Reg(r) => CallDest::Reg(reg(r)),
    }
}

fn sel_call(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Call {
        target,
        args,
        ret,
        conv,
    } = &body[i]
    else {
        return Ok(None);
    };
    let dest = call_dest(target);
    let (uses, cleanup) = stage_args(ctx, out, args, *conv);
    out.push(Inst::Call { dest, uses });
    if cleanup > 0 {
        out.push(Inst::AdjustSp { bytes: cleanup });
    }
    if let Some((ty, dst)) = ret {
        out.push(Inst::Mov {
            size: Size::from_mir(*ty).max(Size::L),
            dst: reg(dst),
            src: Operand::Reg(Reg::Phys(abi::return_register())),
        });
    }
    Ok(Some(1))
}

fn sel_tailcall(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::TailCall { target, args, conv } = &body[i] else {
        return Ok(None);
    };
    let arg_regs = abi::arg_registers(ctx.target, *conv);
    let dest = call_dest(target);
    if args.len() > arg_regs.len() {
        // Stack arguments cannot reuse the caller frame; fall back to an
        // ordinary call followed by a return of its result.
        let (uses, cleanup) = stage_args(ctx, out, args, *conv);
        out.push(Inst::Call { dest, uses });
        if cleanup > 0 {
            out.push(Inst::AdjustSp { bytes: cleanup });
        }
        out.push(Inst::Ret);
        return Ok(Some(1));
    }
    let mut used = Vec::new();
    for (idx, (ty, a)) in args.iter().enumerate() {
        let size = Size::from_mir(*ty).max(Size::L);
        emit_move(out, size, Reg::Phys(arg_regs[idx]), operand(a));
        used.push(arg_regs[idx]);
    }
    out.push(Inst::TailJmp { dest, uses: used });
    Ok(Some(1))
}

fn sel_ret(
    ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Ret { value } = &body[i] else {
        return Ok(None);
    };
    if let Some((ty, v)) = value {
        let size = Size::from_mir(*ty).max(Size::L);
        emit_move(out, size, Reg::Phys(abi::return_register()), operand(v));
    }
    out.push(Inst::Ret);
    Ok(Some(1))
}

fn sel_unreachable(
    _ctx: &mut SelCtx,
    out: &mut Vec<Inst>,
    body: &[Instruction],
    i: usize,
) -> Result<Option<usize>> {
    let Instruction::Unreachable = &body[i] else {
        return Ok(None);
    };
    out.push(Inst::Ud2);
    Ok(Some(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verifier::verify_module;
    use crate::mir::lower::{eliminate_phis, lower_module};
    use crate::parser::parse_module;

    fn select(text: &str, name: &str) -> X64Function {
        let module = parse_module(text).unwrap();
        verify_module(&module).unwrap();
        let target = TargetDescription::default();
        let mir = lower_module(&module, &target).unwrap();
        let mut func = mir.functions.get(name).unwrap().clone();
        eliminate_phis(&mut func);
        select_function(&func, true, &target).unwrap()
    }

    #[test]
    fn test_selects_add() {
        let f = select(
            r#"
            fn @f(i32 %a, i32 %b) -> i32 {
            entry:
              %s = add.i32 %a, %b
              ret.i32 %s
            }
        "#,
            "f",
        );
        let insts = &f.blocks[0].1;
        assert!(insts
            .iter()
            .any(|i| matches!(i, Inst::Alu { op: AluOp::Add, .. })));
        assert!(matches!(insts.last(), Some(Inst::Ret)));
    }

    #[test]
    fn test_fuses_compare_and_branch() {
        let f = select(
            r#"
            fn @f(i32 %a, i32 %b) -> i32 {
            entry:
              %c = slt.i32 %a, %b
              br %c, t, e
            t:
              ret.i32 %a
            e:
              ret.i32 %b
            }
        "#,
            "f",
        );
        let insts = &f.blocks[0].1;
        // Fused: cmp + setcc + jl + jmp, no test instruction.
        assert!(insts.iter().any(|i| matches!(i, Inst::Cmp { .. })));
        assert!(insts
            .iter()
            .any(|i| matches!(i, Inst::Jcc { cc: Cc::L, .. })));
        assert!(!insts.iter().any(|i| matches!(i, Inst::Test { .. })));
    }

    #[test]
    fn test_division_uses_accumulator() {
        let f = select(
            r#"
            fn @f(i64 %a, i64 %b) -> i64 {
            entry:
              %q = sdiv.i64 %a, %b
              ret.i64 %q
            }
        "#,
            "f",
        );
        let insts = &f.blocks[0].1;
        assert!(insts.iter().any(|i| matches!(i, Inst::Cqo { .. })));
        assert!(insts.iter().any(|i| matches!(i, Inst::Idiv { .. })));
    }

    #[test]
    fn test_call_stages_argument_registers() {
        let f = select(
            r#"
            fn @g(i64 %x, i64 %y) -> i64 {
            entry:
              %s = add.i64 %x, %y
              ret.i64 %s
            }

            fn @f() -> i64 {
            entry:
              %r = call @g(1, 2)
              ret.i64 %r
            }
        "#,
            "f",
        );
        let insts = &f.blocks[0].1;
        let call = insts
            .iter()
            .find_map(|i| match i {
                Inst::Call { uses, .. } => Some(uses.clone()),
                _ => None,
            })
            .expect("call not selected");
        assert_eq!(call, vec![Gpr::Rdi, Gpr::Rsi]);
    }

    #[test]
    fn test_large_immediate_materialised() {
        let f = select(
            r#"
            fn @f(i64 %x) -> i64 {
            entry:
              %r = add.i64 %x, 81985529216486895
              ret.i64 %r
            }
        "#,
            "f",
        );
        let insts = &f.blocks[0].1;
        assert!(insts.iter().any(|i| matches!(i, Inst::MovAbs { .. })));
    }

    #[test]
    fn test_unmatched_phi_is_internal_error() {
        let module = parse_module(
            r#"
            fn @f(bool %c) -> i32 {
            entry:
              br %c, a, b
            a:
              %x = imm.i32 1
              jmp join
            b:
              %y = imm.i32 2
              jmp join
            join:
              %p = phi.i32 [%x, a], [%y, b]
              ret.i32 %p
            }
        "#,
        )
        .unwrap();
        let target = TargetDescription::default();
        let mir = lower_module(&module, &target).unwrap();
        let func = mir.functions.get("f").unwrap();
        // Selection without phi elimination must refuse.
        let err = select_function(func, true, &target).unwrap_err();
        assert!(err.to_string().contains("no selection pattern"));
    }
}
