//! Lowering from SSA IR to machine IR.
//!
//! Every value-producing instruction becomes a virtual register; allocas
//! become frame-slot reservations whose address is taken with `lea`;
//! immediates fold into operands. Block structure and phis are retained;
//! [`eliminate_phis`] rewrites the phis into parallel copies on the incoming
//! edges before instruction selection.

use std::collections::HashMap;

use log::debug;

use crate::error::{BasaltError, Result};
use crate::ir;
use crate::ir::instruction::{BinaryOp, Callee, CastOp, CmpOp, InstKind, ValueId};
use crate::ir::module::{FuncId, GlobalInit};
use crate::ir::types::TypeId;
use crate::target::TargetDescription;

use super::function::{Block, DataDef, Function, Module, Parameter, Signature};
use super::instruction::{
    Address, CallTarget, Convert, Instruction, IntBinOp, IntCmpOp, Operand,
};
use super::register::{Register, VirtualReg, VirtualRegAllocator};
use super::types::MirType;

/// Lower a verified IR module.
pub fn lower_module(module: &ir::Module, target: &TargetDescription) -> Result<Module> {
    let mut out = Module::new(module.name.clone());

    for g in module.global_ids() {
        let data = module.global(g);
        if data.is_external {
            continue;
        }
        let size = module.types.size_of(data.ty, target).max(1);
        let align = module.types.align_of(data.ty, target).max(1);
        let bytes = match &data.init {
            None => None,
            Some(GlobalInit::Int(v)) => {
                let mut b = v.to_le_bytes()[..size.min(8) as usize].to_vec();
                b.resize(size as usize, 0);
                Some(b)
            }
            Some(GlobalInit::Bytes(raw)) => {
                let mut b = raw.clone();
                b.resize(size as usize, 0);
                Some(b)
            }
        };
        out.data.push(DataDef {
            name: module.global_name(g).to_string(),
            size,
            align,
            bytes,
        });
    }

    for f in module.func_ids() {
        if module.function(f).flags.is_extern {
            continue;
        }
        let func = lower_function(module, f, target)?;
        out.add_function(func);
    }
    Ok(out)
}

/// Map an IR type onto its register shape.
fn mir_type(module: &ir::Module, ty: TypeId) -> MirType {
    let types = &module.types;
    if types.is_bool(ty) {
        return MirType::I1;
    }
    if types.is_pointer(ty) {
        return MirType::Ptr;
    }
    match types.int_bits(ty) {
        Some(bits) if bits <= 8 => MirType::I8,
        Some(bits) if bits <= 16 => MirType::I16,
        Some(bits) if bits <= 32 => MirType::I32,
        Some(_) => MirType::I64,
        // Aggregates are only manipulated through pointers.
        None => MirType::Ptr,
    }
}

struct LowerCtx<'a> {
    module: &'a ir::Module,
    func: &'a ir::Function,
    vregs: VirtualRegAllocator,
    regs: HashMap<ValueId, Register>,
    labels: HashMap<ir::BlockId, String>,
}

impl<'a> LowerCtx<'a> {
    fn reg(&mut self, v: ValueId) -> Register {
        if let Some(&r) = self.regs.get(&v) {
            return r;
        }
        let r: Register = self.vregs.allocate().into();
        self.regs.insert(v, r);
        r
    }

    /// Operand for a value use: immediates fold inline.
    fn operand(&mut self, v: ValueId) -> Operand {
        match self.func.kind(v) {
            InstKind::Immediate { value } => Operand::Immediate(*value),
            _ => Operand::Register(self.reg(v)),
        }
    }

    fn ty_of(&self, v: ValueId) -> MirType {
        mir_type(self.module, self.func.ty(v))
    }

    fn label(&self, b: ir::BlockId) -> String {
        self.labels[&b].clone()
    }

    /// Force a value into a register, copying immediates.
    fn force_reg(&mut self, v: ValueId, block: &mut Block) -> Register {
        match self.operand(v) {
            Operand::Register(r) => r,
            imm => {
                let r: Register = self.vregs.allocate().into();
                block.push(Instruction::Copy {
                    ty: self.ty_of(v),
                    dst: r,
                    src: imm,
                });
                r
            }
        }
    }
}

fn lower_function(module: &ir::Module, id: FuncId, target: &TargetDescription) -> Result<Function> {
    let func = module.function(id);
    let name = module.func_name(id);
    debug!("lowering @{}", name);

    let mut ctx = LowerCtx {
        module,
        func,
        vregs: VirtualRegAllocator::new(),
        regs: HashMap::new(),
        labels: HashMap::new(),
    };
    for (i, &b) in func.block_order().iter().enumerate() {
        ctx.labels.insert(b, format!("bb{}", i));
    }

    let mut sig = Signature::new(name, func.conv);
    if !module.types.is_void(func.ret_ty) {
        sig.ret_ty = Some(mir_type(module, func.ret_ty));
    }
    for &p in func.params() {
        let reg = ctx.reg(p);
        sig.params.push(Parameter {
            reg,
            ty: ctx.ty_of(p),
        });
    }

    let mut out = Function::new(sig);

    for &b in func.block_order() {
        let mut block = Block::new(ctx.label(b));
        let insts = func.block_insts(b);
        let mut skip_next = false;
        for (idx, &v) in insts.iter().enumerate() {
            if skip_next {
                skip_next = false;
                continue;
            }
            match func.kind(v).clone() {
                InstKind::Immediate { .. } => {
                    // Folded into the operands of its users. A constant with
                    // no users vanishes here.
                }
                InstKind::Alloca { allocated } => {
                    let size = module.types.size_of(allocated, target).max(1);
                    let align = module.types.align_of(allocated, target).max(1);
                    let slot = out.add_frame_slot(size, align);
                    let dst = ctx.reg(v);
                    block.push(Instruction::Lea {
                        dst,
                        addr: Address::Frame { slot, offset: 0 },
                    });
                }
                InstKind::StaticRef { global } => {
                    let dst = ctx.reg(v);
                    block.push(Instruction::Lea {
                        dst,
                        addr: Address::Global {
                            name: module.global_name(global).to_string(),
                            offset: 0,
                        },
                    });
                }
                InstKind::FuncRef { func: f } => {
                    let dst = ctx.reg(v);
                    block.push(Instruction::Lea {
                        dst,
                        addr: Address::Global {
                            name: module.func_name(f).to_string(),
                            offset: 0,
                        },
                    });
                }
                InstKind::Load { addr } => {
                    let base = ctx.force_reg(addr, &mut block);
                    let dst = ctx.reg(v);
                    block.push(Instruction::Load {
                        ty: ctx.ty_of(v),
                        dst,
                        addr: Address::Base { base, offset: 0 },
                    });
                }
                InstKind::Store { value, addr } => {
                    let src = ctx.operand(value);
                    let base = ctx.force_reg(addr, &mut block);
                    block.push(Instruction::Store {
                        ty: ctx.ty_of(value),
                        src,
                        addr: Address::Base { base, offset: 0 },
                    });
                }
                InstKind::Binary { op, lhs, rhs } => {
                    let l = ctx.operand(lhs);
                    let r = ctx.operand(rhs);
                    let dst = ctx.reg(v);
                    block.push(Instruction::IntBinary {
                        op: int_bin_op(op),
                        ty: ctx.ty_of(v),
                        dst,
                        lhs: l,
                        rhs: r,
                    });
                }
                InstKind::Not { value } => {
                    let src = ctx.operand(value);
                    let dst = ctx.reg(v);
                    block.push(Instruction::Not {
                        ty: ctx.ty_of(v),
                        dst,
                        src,
                    });
                }
                InstKind::Cmp { op, lhs, rhs } => {
                    let l = ctx.operand(lhs);
                    let r = ctx.operand(rhs);
                    let dst = ctx.reg(v);
                    block.push(Instruction::IntCmp {
                        op: int_cmp_op(op),
                        ty: ctx.ty_of(lhs),
                        dst,
                        lhs: l,
                        rhs: r,
                    });
                }
                InstKind::Cast { op, value } => {
                    let src = ctx.operand(value);
                    let from = ctx.ty_of(value);
                    let to = ctx.ty_of(v);
                    let dst = ctx.reg(v);
                    match op {
                        CastOp::ZExt => block.push(Instruction::ConvertOp {
                            kind: Convert::ZExt,
                            from,
                            to,
                            dst,
                            src,
                        }),
                        CastOp::SExt => block.push(Instruction::ConvertOp {
                            kind: Convert::SExt,
                            from,
                            to,
                            dst,
                            src,
                        }),
                        CastOp::Trunc => block.push(Instruction::ConvertOp {
                            kind: Convert::Trunc,
                            from,
                            to,
                            dst,
                            src,
                        }),
                        // Representation-preserving casts are plain moves.
                        CastOp::Bitcast | CastOp::IntToPtr | CastOp::PtrToInt => {
                            block.push(Instruction::Copy { ty: to, dst, src })
                        }
                    }
                }
                InstKind::Branch { target } => {
                    block.push(Instruction::Jmp {
                        target: ctx.label(target),
                    });
                }
                InstKind::CondBranch {
                    cond,
                    then_dest,
                    else_dest,
                } => {
                    let c = ctx.force_reg(cond, &mut block);
                    block.push(Instruction::Br {
                        cond: c,
                        true_target: ctx.label(then_dest),
                        false_target: ctx.label(else_dest),
                    });
                }
                InstKind::Return { value } => {
                    let value = value.map(|rv| (ctx.ty_of(rv), ctx.operand(rv)));
                    block.push(Instruction::Ret { value });
                }
                InstKind::Unreachable => block.push(Instruction::Unreachable),
                InstKind::Phi { incoming } => {
                    let ty = ctx.ty_of(v);
                    let dst = ctx.reg(v);
                    let incoming = incoming
                        .iter()
                        .map(|&(pred, val)| (ctx.label(pred), ctx.operand(val)))
                        .collect();
                    block.push(Instruction::Phi { ty, dst, incoming });
                }
                InstKind::Call { callee, args, tail } => {
                    let target_dest = match callee {
                        Callee::Direct(f) => CallTarget::Sym(module.func_name(f).to_string()),
                        Callee::Indirect(t) => CallTarget::Reg(ctx.force_reg(t, &mut block)),
                    };
                    let conv = match callee {
                        Callee::Direct(f) => module.function(f).conv,
                        Callee::Indirect(_) => func.conv,
                    };
                    let lowered_args: Vec<(MirType, Operand)> = args
                        .iter()
                        .map(|&a| (ctx.ty_of(a), ctx.operand(a)))
                        .collect();

                    // A tail call directly followed by the block's return
                    // becomes a terminating jump hand-off.
                    let followed_by_ret = insts
                        .get(idx + 1)
                        .map(|&n| matches!(func.kind(n), InstKind::Return { .. }))
                        .unwrap_or(false);
                    if tail && followed_by_ret {
                        block.push(Instruction::TailCall {
                            target: target_dest,
                            args: lowered_args,
                            conv,
                        });
                        skip_next = true;
                    } else {
                        let ret = if module.types.is_void(func.ty(v)) {
                            None
                        } else {
                            Some((ctx.ty_of(v), ctx.reg(v)))
                        };
                        block.push(Instruction::Call {
                            target: target_dest,
                            args: lowered_args,
                            ret,
                            conv,
                        });
                    }
                }
                InstKind::Parameter { .. } | InstKind::Placeholder => {
                    return Err(BasaltError::InternalError(format!(
                        "unexpected instruction while lowering @{}",
                        name
                    )));
                }
            }
        }
        out.add_block(block);
    }

    out.validate()
        .map_err(|e| BasaltError::InternalError(format!("lowered MIR invalid: {}", e)))?;
    Ok(out)
}

fn int_bin_op(op: BinaryOp) -> IntBinOp {
    match op {
        BinaryOp::Add => IntBinOp::Add,
        BinaryOp::Sub => IntBinOp::Sub,
        BinaryOp::Mul => IntBinOp::Mul,
        BinaryOp::UDiv => IntBinOp::UDiv,
        BinaryOp::SDiv => IntBinOp::SDiv,
        BinaryOp::URem => IntBinOp::URem,
        BinaryOp::SRem => IntBinOp::SRem,
        BinaryOp::Shl => IntBinOp::Shl,
        BinaryOp::LShr => IntBinOp::LShr,
        BinaryOp::AShr => IntBinOp::AShr,
        BinaryOp::And => IntBinOp::And,
        BinaryOp::Or => IntBinOp::Or,
        BinaryOp::Xor => IntBinOp::Xor,
    }
}

fn int_cmp_op(op: CmpOp) -> IntCmpOp {
    match op {
        CmpOp::Eq => IntCmpOp::Eq,
        CmpOp::Ne => IntCmpOp::Ne,
        CmpOp::ULt => IntCmpOp::ULt,
        CmpOp::ULe => IntCmpOp::ULe,
        CmpOp::UGt => IntCmpOp::UGt,
        CmpOp::UGe => IntCmpOp::UGe,
        CmpOp::SLt => IntCmpOp::SLt,
        CmpOp::SLe => IntCmpOp::SLe,
        CmpOp::SGt => IntCmpOp::SGt,
        CmpOp::SGe => IntCmpOp::SGe,
    }
}

/// Rewrite phis into parallel copies on the incoming edges.
///
/// For each predecessor the phi sources are first copied into fresh
/// temporaries and the temporaries then copied into the phi destinations,
/// so mutually-referencing phis (swaps) stay correct.
pub fn eliminate_phis(func: &mut Function) {
    let mut next = func.max_vreg_id();

    let mut phis: Vec<(Register, MirType, Vec<(String, Operand)>)> = Vec::new();
    for block in &func.blocks {
        for inst in &block.instructions {
            if let Instruction::Phi { ty, dst, incoming } = inst {
                phis.push((*dst, *ty, incoming.clone()));
            }
        }
    }
    if phis.is_empty() {
        return;
    }
    debug!("eliminating {} phis in {}", phis.len(), func.sig.name);

    for block in &mut func.blocks {
        block
            .instructions
            .retain(|i| !matches!(i, Instruction::Phi { .. }));
    }

    // Group copies by predecessor edge.
    let mut per_pred: HashMap<String, Vec<(Register, MirType, Operand)>> = HashMap::new();
    for (dst, ty, incoming) in &phis {
        for (pred, src) in incoming {
            per_pred
                .entry(pred.clone())
                .or_default()
                .push((*dst, *ty, *src));
        }
    }

    for (pred, copies) in per_pred {
        let Some(block) = func.blocks.iter_mut().find(|b| b.label == pred) else {
            continue;
        };
        let at = block.instructions.len().saturating_sub(1);
        let mut seq = Vec::new();
        let mut temps = Vec::new();
        for (_, ty, src) in &copies {
            next += 1;
            let tmp: Register = VirtualReg::new(next).into();
            seq.push(Instruction::Copy {
                ty: *ty,
                dst: tmp,
                src: *src,
            });
            temps.push(tmp);
        }
        for ((dst, ty, _), tmp) in copies.iter().zip(temps) {
            seq.push(Instruction::Copy {
                ty: *ty,
                dst: *dst,
                src: Operand::Register(tmp),
            });
        }
        block.instructions.splice(at..at, seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verifier::verify_module;
    use crate::parser::parse_module;

    fn lower(text: &str) -> Module {
        let module = parse_module(text).unwrap();
        verify_module(&module).unwrap();
        lower_module(&module, &TargetDescription::default()).unwrap()
    }

    #[test]
    fn test_lowers_arithmetic() {
        let m = lower(
            r#"
            fn @f(i32 %a, i32 %b) -> i32 {
            entry:
              %s = add.i32 %a, %b
              ret.i32 %s
            }
        "#,
        );
        let f = m.functions.get("f").unwrap();
        assert_eq!(f.blocks.len(), 1);
        let text = f.to_string();
        assert!(text.contains("add.i32"));
        assert!(text.contains("ret.i32"));
    }

    #[test]
    fn test_alloca_becomes_frame_slot() {
        let m = lower(
            r#"
            fn @f() -> i32 {
            entry:
              %p = alloca i32
              %v = imm.i32 9
              store.i32 %v, %p
              %r = load.i32 %p
              ret.i32 %r
            }
        "#,
        );
        let f = m.functions.get("f").unwrap();
        assert_eq!(f.frame.len(), 1);
        assert_eq!(f.frame[0].size, 4);
        let text = f.to_string();
        assert!(text.contains("lea"));
        assert!(text.contains("st.i32"));
    }

    #[test]
    fn test_immediates_fold_into_operands() {
        let m = lower(
            r#"
            fn @f(i64 %x) -> i64 {
            entry:
              %r = add.i64 %x, 5
              ret.i64 %r
            }
        "#,
        );
        let f = m.functions.get("f").unwrap();
        let text = f.to_string();
        assert!(text.contains(", 5"));
        assert!(!text.contains("copy"));
    }

    #[test]
    fn test_phi_elimination_inserts_copies() {
        let m = lower(
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
        );
        let mut f = m.functions.get("f").unwrap().clone();
        eliminate_phis(&mut f);
        let text = f.to_string();
        assert!(!text.contains("phi"));
        assert!(text.contains("copy.i32"));
        // Copies land before the jumps in both predecessors.
        let a = f.get_block("bb1").unwrap();
        assert!(matches!(a.instructions.last(), Some(Instruction::Jmp { .. })));
        assert!(a.instructions.len() >= 3);
    }

    #[test]
    fn test_tail_call_lowered_to_terminator() {
        let m = lower(
            r#"
            fn @g(i32 %x) -> i32 {
            entry:
              ret.i32 %x
            }

            fn @f(i32 %x) -> i32 {
            entry:
              %r = tailcall @g(%x)
              ret.i32 %r
            }
        "#,
        );
        let f = m.functions.get("f").unwrap();
        let entry = &f.blocks[0];
        assert!(matches!(
            entry.instructions.last(),
            Some(Instruction::TailCall { .. })
        ));
        assert_eq!(entry.instructions.len(), 1);
    }

    #[test]
    fn test_globals_lowered_to_data() {
        let m = lower(
            r#"
            global @counter: i64 = 513
            global @buf: [8 x u8]

            fn @f() -> void {
            entry:
              ret.void
            }
        "#,
        );
        assert_eq!(m.data.len(), 2);
        assert_eq!(m.data[0].name, "counter");
        assert_eq!(m.data[0].bytes.as_ref().unwrap()[0], 1);
        assert_eq!(m.data[0].bytes.as_ref().unwrap()[1], 2);
        assert!(m.data[1].bytes.is_none());
        assert_eq!(m.data[1].size, 8);
    }
}
