//! GNU assembler output.
//!
//! Formats register-allocated, frame-resolved functions as GAS text in
//! either AT&T or Intel syntax. Block labels are made local per function;
//! data definitions go to `.data`/`.bss`.

use std::io::Write;

use crate::error::Result;
use crate::mir::function::DataDef;

use super::{Addr, CallDest, Gpr, Inst, Operand, Reg, Size, X64Function};

/// Assembly flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsmSyntax {
    #[default]
    Att,
    Intel,
}

/// Emit a compiled module as assembly text.
pub fn emit_assembly<W: Write>(
    funcs: &[X64Function],
    data: &[DataDef],
    externs: &[String],
    syntax: AsmSyntax,
    w: &mut W,
) -> Result<()> {
    if syntax == AsmSyntax::Intel {
        writeln!(w, ".intel_syntax noprefix")?;
    }
    for name in externs {
        writeln!(w, ".extern {}", name)?;
    }
    writeln!(w, ".text")?;
    for func in funcs {
        writeln!(w)?;
        if func.is_global {
            writeln!(w, ".globl {}", func.name)?;
        }
        writeln!(w, "{}:", func.name)?;
        for (label, insts) in &func.blocks {
            writeln!(w, "{}:", local_label(func, label))?;
            for inst in insts {
                writeln!(w, "\t{}", format_inst(func, inst, syntax))?;
            }
        }
    }

    let (init, bss): (Vec<_>, Vec<_>) = data.iter().partition(|d| d.bytes.is_some());
    if !init.is_empty() {
        writeln!(w, "\n.data")?;
        for d in init {
            writeln!(w, ".balign {}", d.align)?;
            writeln!(w, ".globl {}", d.name)?;
            writeln!(w, "{}:", d.name)?;
            let bytes = d.bytes.as_ref().expect("partitioned on presence");
            let formatted: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
            writeln!(w, "\t.byte {}", formatted.join(", "))?;
        }
    }
    if !bss.is_empty() {
        writeln!(w, "\n.bss")?;
        for d in bss {
            writeln!(w, ".balign {}", d.align)?;
            writeln!(w, ".globl {}", d.name)?;
            writeln!(w, "{}:", d.name)?;
            writeln!(w, "\t.zero {}", d.size)?;
        }
    }
    Ok(())
}

fn local_label(func: &X64Function, label: &str) -> String {
    format!(".L{}_{}", func.name, label)
}

fn reg_name(r: &Reg, size: Size) -> String {
    match r {
        Reg::Phys(g) => g.name_for_size(size).to_string(),
        // Virtual registers only appear in pre-allocation dumps.
        Reg::Virtual(v) => format!("v{}", v),
    }
}

fn format_inst(func: &X64Function, inst: &Inst, syntax: AsmSyntax) -> String {
    match syntax {
        AsmSyntax::Att => format_att(func, inst),
        AsmSyntax::Intel => format_intel(func, inst),
    }
}

// --- AT&T ---

fn att_reg(r: &Reg, size: Size) -> String {
    format!("%{}", reg_name(r, size))
}

fn att_op(o: &Operand, size: Size) -> String {
    match o {
        Operand::Reg(r) => att_reg(r, size),
        Operand::Imm(i) => format!("${}", i),
    }
}

fn att_addr(a: &Addr) -> String {
    match a {
        Addr::Base { base, offset } if *offset == 0 => format!("({})", att_reg(base, Size::Q)),
        Addr::Base { base, offset } => format!("{}({})", offset, att_reg(base, Size::Q)),
        Addr::Rip { symbol, offset } if *offset == 0 => format!("{}(%rip)", symbol),
        Addr::Rip { symbol, offset } => format!("{}+{}(%rip)", symbol, offset),
        Addr::Frame { slot, offset } => format!("frame{}+{}", slot, offset),
    }
}

fn format_att(func: &X64Function, inst: &Inst) -> String {
    let s = |size: Size| size.suffix();
    match inst {
        Inst::Mov { size, dst, src } => {
            format!("mov{} {}, {}", s(*size), att_op(src, *size), att_reg(dst, *size))
        }
        Inst::MovAbs { dst, imm } => {
            format!("movabsq ${}, {}", imm, att_reg(dst, Size::Q))
        }
        Inst::Load { size, dst, addr } => {
            format!("mov{} {}, {}", s(*size), att_addr(addr), att_reg(dst, *size))
        }
        Inst::StoreReg { size, src, addr } => {
            format!("mov{} {}, {}", s(*size), att_reg(src, *size), att_addr(addr))
        }
        Inst::StoreImm { size, imm, addr } => {
            format!("mov{} ${}, {}", s(*size), imm, att_addr(addr))
        }
        Inst::Movzx { from, dst, src } => {
            format!(
                "movz{}q {}, {}",
                s(*from),
                att_reg(src, *from),
                att_reg(dst, Size::Q)
            )
        }
        Inst::Movsx { from, dst, src } => {
            if *from == Size::L {
                format!("movslq {}, {}", att_reg(src, Size::L), att_reg(dst, Size::Q))
            } else {
                format!(
                    "movs{}q {}, {}",
                    s(*from),
                    att_reg(src, *from),
                    att_reg(dst, Size::Q)
                )
            }
        }
        Inst::Alu { op, size, dst, src } => {
            format!(
                "{}{} {}, {}",
                op.mnemonic(),
                s(*size),
                att_op(src, *size),
                att_reg(dst, *size)
            )
        }
        Inst::Imul { size, dst, src } => match src {
            Operand::Imm(i) => format!(
                "imul{} ${}, {}, {}",
                s(*size),
                i,
                att_reg(dst, *size),
                att_reg(dst, *size)
            ),
            Operand::Reg(r) => format!(
                "imul{} {}, {}",
                s(*size),
                att_reg(r, *size),
                att_reg(dst, *size)
            ),
        },
        Inst::Cqo { size } => match size {
            Size::Q => "cqto".to_string(),
            _ => "cltd".to_string(),
        },
        Inst::Idiv { size, divisor } => format!("idiv{} {}", s(*size), att_reg(divisor, *size)),
        Inst::Div { size, divisor } => format!("div{} {}", s(*size), att_reg(divisor, *size)),
        Inst::Shift {
            op,
            size,
            dst,
            amount,
        } => match amount {
            Some(n) => format!("{}{} ${}, {}", op.mnemonic(), s(*size), n, att_reg(dst, *size)),
            None => format!("{}{} %cl, {}", op.mnemonic(), s(*size), att_reg(dst, *size)),
        },
        Inst::Not { size, dst } => format!("not{} {}", s(*size), att_reg(dst, *size)),
        Inst::Neg { size, dst } => format!("neg{} {}", s(*size), att_reg(dst, *size)),
        Inst::Cmp { size, lhs, rhs } => {
            format!("cmp{} {}, {}", s(*size), att_op(rhs, *size), att_reg(lhs, *size))
        }
        Inst::Test { size, lhs, rhs } => {
            format!("test{} {}, {}", s(*size), att_reg(rhs, *size), att_reg(lhs, *size))
        }
        Inst::Setcc { cc, dst } => format!("set{} {}", cc.mnemonic(), att_reg(dst, Size::B)),
        Inst::Lea { dst, addr } => format!("leaq {}, {}", att_addr(addr), att_reg(dst, Size::Q)),
        Inst::Jmp { target } => format!("jmp {}", local_label(func, target)),
        Inst::Jcc { cc, target } => format!("j{} {}", cc.mnemonic(), local_label(func, target)),
        Inst::Call { dest, .. } => match dest {
            CallDest::Sym(name) => format!("call {}", name),
            CallDest::Reg(r) => format!("call *{}", att_reg(r, Size::Q)),
        },
        Inst::AdjustSp { bytes } => {
            if *bytes < 0 {
                format!("subq ${}, %rsp", -bytes)
            } else {
                format!("addq ${}, %rsp", bytes)
            }
        }
        Inst::Push { src } => format!("pushq {}", att_reg(src, Size::Q)),
        Inst::Pop { dst } => format!("popq {}", att_reg(dst, Size::Q)),
        Inst::TailJmp { dest, .. } => match dest {
            CallDest::Sym(name) => format!("jmp {}", name),
            CallDest::Reg(r) => format!("jmp *{}", att_reg(r, Size::Q)),
        },
        Inst::Ret => "ret".to_string(),
        Inst::Ud2 => "ud2".to_string(),
    }
}

// --- Intel ---

fn intel_op(o: &Operand, size: Size) -> String {
    match o {
        Operand::Reg(r) => reg_name(r, size),
        Operand::Imm(i) => i.to_string(),
    }
}

fn intel_ptr(size: Size) -> &'static str {
    match size {
        Size::B => "byte ptr",
        Size::W => "word ptr",
        Size::L => "dword ptr",
        Size::Q => "qword ptr",
    }
}

fn intel_addr(a: &Addr) -> String {
    match a {
        Addr::Base { base, offset } if *offset == 0 => format!("[{}]", reg_name(base, Size::Q)),
        Addr::Base { base, offset } if *offset < 0 => {
            format!("[{} - {}]", reg_name(base, Size::Q), -offset)
        }
        Addr::Base { base, offset } => format!("[{} + {}]", reg_name(base, Size::Q), offset),
        Addr::Rip { symbol, offset } if *offset == 0 => format!("{}[rip]", symbol),
        Addr::Rip { symbol, offset } => format!("{}+{}[rip]", symbol, offset),
        Addr::Frame { slot, offset } => format!("[frame{} + {}]", slot, offset),
    }
}

fn format_intel(func: &X64Function, inst: &Inst) -> String {
    match inst {
        Inst::Mov { size, dst, src } => {
            format!("mov {}, {}", reg_name(dst, *size), intel_op(src, *size))
        }
        Inst::MovAbs { dst, imm } => format!("movabs {}, {}", reg_name(dst, Size::Q), imm),
        Inst::Load { size, dst, addr } => format!(
            "mov {}, {} {}",
            reg_name(dst, *size),
            intel_ptr(*size),
            intel_addr(addr)
        ),
        Inst::StoreReg { size, src, addr } => format!(
            "mov {} {}, {}",
            intel_ptr(*size),
            intel_addr(addr),
            reg_name(src, *size)
        ),
        Inst::StoreImm { size, imm, addr } => format!(
            "mov {} {}, {}",
            intel_ptr(*size),
            intel_addr(addr),
            imm
        ),
        Inst::Movzx { from, dst, src } => format!(
            "movzx {}, {}",
            reg_name(dst, Size::Q),
            reg_name(src, *from)
        ),
        Inst::Movsx { from, dst, src } => {
            if *from == Size::L {
                format!("movsxd {}, {}", reg_name(dst, Size::Q), reg_name(src, Size::L))
            } else {
                format!("movsx {}, {}", reg_name(dst, Size::Q), reg_name(src, *from))
            }
        }
        Inst::Alu { op, size, dst, src } => format!(
            "{} {}, {}",
            op.mnemonic(),
            reg_name(dst, *size),
            intel_op(src, *size)
        ),
        Inst::Imul { size, dst, src } => match src {
            Operand::Imm(i) => format!(
                "imul {}, {}, {}",
                reg_name(dst, *size),
                reg_name(dst, *size),
                i
            ),
            Operand::Reg(r) => format!("imul {}, {}", reg_name(dst, *size), reg_name(r, *size)),
        },
        Inst::Cqo { size } => match size {
            Size::Q => "cqo".to_string(),
            _ => "cdq".to_string(),
        },
        Inst::Idiv { size, divisor } => format!("idiv {}", reg_name(divisor, *size)),
        Inst::Div { size, divisor } => format!("div {}", reg_name(divisor, *size)),
        Inst::Shift {
            op,
            size,
            dst,
            amount,
        } => match amount {
            Some(n) => format!("{} {}, {}", op.mnemonic(), reg_name(dst, *size), n),
            None => format!("{} {}, cl", op.mnemonic(), reg_name(dst, *size)),
        },
        Inst::Not { size, dst } => format!("not {}", reg_name(dst, *size)),
        Inst::Neg { size, dst } => format!("neg {}", reg_name(dst, *size)),
        Inst::Cmp { size, lhs, rhs } => {
            format!("cmp {}, {}", reg_name(lhs, *size), intel_op(rhs, *size))
        }
        Inst::Test { size, lhs, rhs } => {
            format!("test {}, {}", reg_name(lhs, *size), reg_name(rhs, *size))
        }
        Inst::Setcc { cc, dst } => format!("set{} {}", cc.mnemonic(), reg_name(dst, Size::B)),
        Inst::Lea { dst, addr } => format!("lea {}, {}", reg_name(dst, Size::Q), intel_addr(addr)),
        Inst::Jmp { target } => format!("jmp {}", local_label(func, target)),
        Inst::Jcc { cc, target } => format!("j{} {}", cc.mnemonic(), local_label(func, target)),
        Inst::Call { dest, .. } => match dest {
            CallDest::Sym(name) => format!("call {}", name),
            CallDest::Reg(r) => format!("call {}", reg_name(r, Size::Q)),
        },
        Inst::AdjustSp { bytes } => {
            if *bytes < 0 {
                format!("sub rsp, {}", -bytes)
            } else {
                format!("add rsp, {}", bytes)
            }
        }
        Inst::Push { src } => format!("push {}", reg_name(src, Size::Q)),
        Inst::Pop { dst } => format!("pop {}", reg_name(dst, Size::Q)),
        Inst::TailJmp { dest, .. } => match dest {
            CallDest::Sym(name) => format!("jmp {}", name),
            CallDest::Reg(r) => format!("jmp {}", reg_name(r, Size::Q)),
        },
        Inst::Ret => "ret".to_string(),
        Inst::Ud2 => "ud2".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::CallConv;

    fn demo_function() -> X64Function {
        X64Function {
            name: "demo".to_string(),
            conv: CallConv::SysV,
            is_global: true,
            blocks: vec![(
                "bb0".to_string(),
                vec![
                    Inst::Mov {
                        size: Size::Q,
                        dst: Reg::Phys(Gpr::Rax),
                        src: Operand::Reg(Reg::Phys(Gpr::Rdi)),
                    },
                    Inst::Alu {
                        op: super::super::AluOp::Add,
                        size: Size::Q,
                        dst: Reg::Phys(Gpr::Rax),
                        src: Operand::Imm(1),
                    },
                    Inst::Ret,
                ],
            )],
            frame: Vec::new(),
            returns_value: true,
            saved_regs: Vec::new(),
            frame_size: 0,
        }
    }

    #[test]
    fn test_att_formatting() {
        let f = demo_function();
        let mut out = Vec::new();
        emit_assembly(&[f], &[], &[], AsmSyntax::Att, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(".globl demo"));
        assert!(text.contains("movq %rdi, %rax"));
        assert!(text.contains("addq $1, %rax"));
        assert!(!text.contains("intel_syntax"));
    }

    #[test]
    fn test_intel_formatting() {
        let f = demo_function();
        let mut out = Vec::new();
        emit_assembly(&[f], &[], &[], AsmSyntax::Intel, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(".intel_syntax noprefix"));
        assert!(text.contains("mov rax, rdi"));
        assert!(text.contains("add rax, 1"));
    }

    #[test]
    fn test_memory_operands() {
        let store = Inst::StoreReg {
            size: Size::L,
            src: Reg::Phys(Gpr::Rax),
            addr: Addr::Base {
                base: Reg::Phys(Gpr::Rbp),
                offset: -8,
            },
        };
        let f = demo_function();
        assert_eq!(format_att(&f, &store), "movl %eax, -8(%rbp)");
        assert_eq!(format_intel(&f, &store), "mov dword ptr [rbp - 8], eax");
    }
}
