//! Machine IR instructions.
//!
//! Three-address form over virtual registers. Every value is explicit; phi
//! nodes survive until [`super::lower::eliminate_phis`] rewrites them into
//! copies on the incoming edges.

use std::fmt;

use super::register::Register;
use super::types::MirType;
use crate::target::CallConv;

/// Integer binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl fmt::Display for IntBinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntBinOp::Add => "add",
            IntBinOp::Sub => "sub",
            IntBinOp::Mul => "mul",
            IntBinOp::UDiv => "udiv",
            IntBinOp::SDiv => "sdiv",
            IntBinOp::URem => "urem",
            IntBinOp::SRem => "srem",
            IntBinOp::And => "and",
            IntBinOp::Or => "or",
            IntBinOp::Xor => "xor",
            IntBinOp::Shl => "shl",
            IntBinOp::LShr => "lshr",
            IntBinOp::AShr => "ashr",
        };
        write!(f, "{}", s)
    }
}

/// Integer comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCmpOp {
    Eq,
    Ne,
    ULt,
    ULe,
    UGt,
    UGe,
    SLt,
    SLe,
    SGt,
    SGe,
}

impl fmt::Display for IntCmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntCmpOp::Eq => "eq",
            IntCmpOp::Ne => "ne",
            IntCmpOp::ULt => "ult",
            IntCmpOp::ULe => "ule",
            IntCmpOp::UGt => "ugt",
            IntCmpOp::UGe => "uge",
            IntCmpOp::SLt => "slt",
            IntCmpOp::SLe => "sle",
            IntCmpOp::SGt => "sgt",
            IntCmpOp::SGe => "sge",
        };
        write!(f, "{}", s)
    }
}

/// Width conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convert {
    ZExt,
    SExt,
    Trunc,
}

impl fmt::Display for Convert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Convert::ZExt => "zext",
            Convert::SExt => "sext",
            Convert::Trunc => "trunc",
        };
        write!(f, "{}", s)
    }
}

/// Operand: a register or an inline constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Immediate(i64),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{}", r),
            Operand::Immediate(i) => write!(f, "{}", i),
        }
    }
}

impl From<Register> for Operand {
    fn from(r: Register) -> Self {
        Operand::Register(r)
    }
}

/// Memory addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A slot in the current frame.
    Frame { slot: u32, offset: i32 },
    /// [base + offset]
    Base { base: Register, offset: i32 },
    /// A module-level symbol (pc-relative after selection).
    Global { name: String, offset: i32 },
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Frame { slot, offset } if *offset == 0 => write!(f, "[frame{}]", slot),
            Address::Frame { slot, offset } => write!(f, "[frame{} + {}]", slot, offset),
            Address::Base { base, offset } if *offset == 0 => write!(f, "[{}]", base),
            Address::Base { base, offset } => write!(f, "[{} + {}]", base, offset),
            Address::Global { name, offset } if *offset == 0 => write!(f, "[@{}]", name),
            Address::Global { name, offset } => write!(f, "[@{} + {}]", name, offset),
        }
    }
}

/// Call destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Sym(String),
    Reg(Register),
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Sym(s) => write!(f, "@{}", s),
            CallTarget::Reg(r) => write!(f, "{}", r),
        }
    }
}

/// Machine IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Copy {
        ty: MirType,
        dst: Register,
        src: Operand,
    },
    IntBinary {
        op: IntBinOp,
        ty: MirType,
        dst: Register,
        lhs: Operand,
        rhs: Operand,
    },
    Not {
        ty: MirType,
        dst: Register,
        src: Operand,
    },
    IntCmp {
        op: IntCmpOp,
        ty: MirType,
        dst: Register,
        lhs: Operand,
        rhs: Operand,
    },
    ConvertOp {
        kind: Convert,
        from: MirType,
        to: MirType,
        dst: Register,
        src: Operand,
    },
    Load {
        ty: MirType,
        dst: Register,
        addr: Address,
    },
    Store {
        ty: MirType,
        src: Operand,
        addr: Address,
    },
    Lea {
        dst: Register,
        addr: Address,
    },
    Jmp {
        target: String,
    },
    Br {
        cond: Register,
        true_target: String,
        false_target: String,
    },
    Call {
        target: CallTarget,
        args: Vec<(MirType, Operand)>,
        ret: Option<(MirType, Register)>,
        conv: CallConv,
    },
    TailCall {
        target: CallTarget,
        args: Vec<(MirType, Operand)>,
        conv: CallConv,
    },
    Ret {
        value: Option<(MirType, Operand)>,
    },
    Phi {
        ty: MirType,
        dst: Register,
        incoming: Vec<(String, Operand)>,
    },
    Unreachable,
}

impl Instruction {
    /// Visit every register this instruction mentions, definitions and uses
    /// alike.
    pub fn for_each_reg(&self, mut f: impl FnMut(&Register)) {
        fn op(o: &Operand, f: &mut dyn FnMut(&Register)) {
            if let Operand::Register(r) = o {
                f(r);
            }
        }
        fn addr(a: &Address, f: &mut dyn FnMut(&Register)) {
            if let Address::Base { base, .. } = a {
                f(base);
            }
        }
        match self {
            Instruction::Copy { dst, src, .. } | Instruction::Not { dst, src, .. } => {
                f(dst);
                op(src, &mut f);
            }
            Instruction::IntBinary { dst, lhs, rhs, .. }
            | Instruction::IntCmp { dst, lhs, rhs, .. } => {
                f(dst);
                op(lhs, &mut f);
                op(rhs, &mut f);
            }
            Instruction::ConvertOp { dst, src, .. } => {
                f(dst);
                op(src, &mut f);
            }
            Instruction::Load { dst, addr: a, .. } => {
                f(dst);
                addr(a, &mut f);
            }
            Instruction::Store { src, addr: a, .. } => {
                op(src, &mut f);
                addr(a, &mut f);
            }
            Instruction::Lea { dst, addr: a } => {
                f(dst);
                addr(a, &mut f);
            }
            Instruction::Br { cond, .. } => f(cond),
            Instruction::Call {
                target, args, ret, ..
            } => {
                if let CallTarget::Reg(r) = target {
                    f(r);
                }
                for (_, a) in args {
                    op(a, &mut f);
                }
                if let Some((_, r)) = ret {
                    f(r);
                }
            }
            Instruction::TailCall { target, args, .. } => {
                if let CallTarget::Reg(r) = target {
                    f(r);
                }
                for (_, a) in args {
                    op(a, &mut f);
                }
            }
            Instruction::Ret { value } => {
                if let Some((_, v)) = value {
                    op(v, &mut f);
                }
            }
            Instruction::Phi { dst, incoming, .. } => {
                f(dst);
                for (_, v) in incoming {
                    op(v, &mut f);
                }
            }
            Instruction::Jmp { .. } | Instruction::Unreachable => {}
        }
    }

    /// Whether this instruction ends a block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Jmp { .. }
                | Instruction::Br { .. }
                | Instruction::TailCall { .. }
                | Instruction::Ret { .. }
                | Instruction::Unreachable
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Copy { ty, dst, src } => write!(f, "{} = copy.{} {}", dst, ty, src),
            Instruction::IntBinary {
                op,
                ty,
                dst,
                lhs,
                rhs,
            } => write!(f, "{} = {}.{} {}, {}", dst, op, ty, lhs, rhs),
            Instruction::Not { ty, dst, src } => write!(f, "{} = not.{} {}", dst, ty, src),
            Instruction::IntCmp {
                op,
                ty,
                dst,
                lhs,
                rhs,
            } => write!(f, "{} = cmp.{}.{} {}, {}", dst, op, ty, lhs, rhs),
            Instruction::ConvertOp {
                kind,
                from,
                to,
                dst,
                src,
            } => write!(f, "{} = {}.{}.{} {}", dst, kind, from, to, src),
            Instruction::Load { ty, dst, addr } => write!(f, "{} = ld.{} {}", dst, ty, addr),
            Instruction::Store { ty, src, addr } => write!(f, "st.{} {}, {}", ty, src, addr),
            Instruction::Lea { dst, addr } => write!(f, "{} = lea {}", dst, addr),
            Instruction::Jmp { target } => write!(f, "jmp {}", target),
            Instruction::Br {
                cond,
                true_target,
                false_target,
            } => write!(f, "br {}, {}, {}", cond, true_target, false_target),
            Instruction::Call {
                target, args, ret, ..
            } => {
                if let Some((ty, dst)) = ret {
                    write!(f, "{} = call.{} {}(", dst, ty, target)?;
                } else {
                    write!(f, "call {}(", target)?;
                }
                for (i, (_, a)) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Instruction::TailCall { target, args, .. } => {
                write!(f, "tailcall {}(", target)?;
                for (i, (_, a)) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Instruction::Ret { value } => match value {
                Some((ty, v)) => write!(f, "ret.{} {}", ty, v),
                None => write!(f, "ret"),
            },
            Instruction::Phi { ty, dst, incoming } => {
                write!(f, "{} = phi.{} ", dst, ty)?;
                for (i, (label, v)) in incoming.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{}, {}]", v, label)?;
                }
                Ok(())
            }
            Instruction::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::register::VirtualReg;

    #[test]
    fn test_display() {
        let add = Instruction::IntBinary {
            op: IntBinOp::Add,
            ty: MirType::I64,
            dst: VirtualReg::new(2).into(),
            lhs: Operand::Register(VirtualReg::new(0).into()),
            rhs: Operand::Immediate(1),
        };
        assert_eq!(add.to_string(), "v2 = add.i64 v0, 1");

        let ld = Instruction::Load {
            ty: MirType::I32,
            dst: VirtualReg::new(1).into(),
            addr: Address::Frame { slot: 0, offset: 4 },
        };
        assert_eq!(ld.to_string(), "v1 = ld.i32 [frame0 + 4]");

        let br = Instruction::Br {
            cond: VirtualReg::new(3).into(),
            true_target: "bb1".to_string(),
            false_target: "bb2".to_string(),
        };
        assert_eq!(br.to_string(), "br v3, bb1, bb2");
        assert!(br.is_terminator());
    }
}
