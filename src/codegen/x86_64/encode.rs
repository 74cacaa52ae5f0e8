//! Binary encoding of the selected instruction set.
//!
//! Emits machine code for register-allocated, frame-resolved functions.
//! Branches within a function resolve through rel32 fixups in a second
//! pass; calls and rip-relative symbol references become relocations
//! against the neutral object model.

use std::collections::HashMap;

use crate::error::{BasaltError, Result};
use crate::obj::RelocKind;

use super::{Addr, AluOp, CallDest, Gpr, Inst, Operand, Reg, ShiftOp, Size, X64Function};

/// A relocation recorded while encoding `.text` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextReloc {
    pub offset: u64,
    pub symbol: String,
    pub kind: RelocKind,
    pub addend: i64,
}

/// Result of encoding one function.
#[derive(Debug, Default)]
pub struct EncodedFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<TextReloc>,
}

struct Encoder {
    code: Vec<u8>,
    relocs: Vec<TextReloc>,
    labels: HashMap<String, u64>,
    fixups: Vec<(usize, String)>,
}

/// Encode a function into raw bytes plus relocations.
pub fn encode_function(func: &X64Function) -> Result<EncodedFunction> {
    let mut enc = Encoder {
        code: Vec::new(),
        relocs: Vec::new(),
        labels: HashMap::new(),
        fixups: Vec::new(),
    };

    for (label, insts) in &func.blocks {
        enc.labels.insert(label.clone(), enc.code.len() as u64);
        for inst in insts {
            enc.encode(inst).map_err(|e| {
                BasaltError::CodegenError(format!("encoding {} failed: {}", func.name, e))
            })?;
        }
    }

    // Patch intra-function rel32 branches.
    for (at, label) in &enc.fixups {
        let Some(&target) = enc.labels.get(label) else {
            return Err(BasaltError::CodegenError(format!(
                "undefined label '{}' in {}",
                label, func.name
            )));
        };
        let rel = target as i64 - (*at as i64 + 4);
        enc.code[*at..*at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
    }

    Ok(EncodedFunction {
        code: enc.code,
        relocs: enc.relocs,
    })
}

fn phys(r: &Reg) -> std::result::Result<Gpr, String> {
    match r {
        Reg::Phys(g) => Ok(*g),
        Reg::Virtual(v) => Err(format!("virtual register v{} reached the encoder", v)),
    }
}

impl Encoder {
    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn bytes(&mut self, b: &[u8]) {
        self.code.extend_from_slice(b);
    }

    /// Operand-size prefix and REX byte for one register/rm pair.
    fn prefix(&mut self, size: Size, reg: u8, rm: u8, byte_regs: &[u8]) {
        if size == Size::W {
            self.byte(0x66);
        }
        let mut rex = 0x40u8;
        if size == Size::Q {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if rm >= 8 {
            rex |= 0x01;
        }
        // spl/bpl/sil/dil need a REX prefix even without extension bits.
        let needs_byte_rex =
            size == Size::B && byte_regs.iter().any(|&e| (4..=7).contains(&e));
        if rex != 0x40 || needs_byte_rex {
            self.byte(rex);
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.byte((md << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// reg-direct ModRM.
    fn modrm_rr(&mut self, reg: u8, rm: u8) {
        self.modrm(0b11, reg, rm);
    }

    /// Memory ModRM for `[base + disp]` or rip-relative symbols.
    fn modrm_mem(&mut self, reg: u8, addr: &Addr) -> std::result::Result<(), String> {
        match addr {
            Addr::Base { base, offset } => {
                let b = phys(base)?.encoding();
                let small = *offset >= -128 && *offset <= 127;
                let md = if small { 0b01 } else { 0b10 };
                self.modrm(md, reg, b);
                if b & 7 == 4 {
                    // rsp/r12 addressing needs a SIB byte.
                    self.byte(0x24);
                }
                if small {
                    self.byte(*offset as i8 as u8);
                } else {
                    self.bytes(&offset.to_le_bytes());
                }
                Ok(())
            }
            Addr::Rip { symbol, offset } => {
                self.modrm(0b00, reg, 0b101);
                self.relocs.push(TextReloc {
                    offset: self.code.len() as u64,
                    symbol: symbol.clone(),
                    kind: RelocKind::Pc32,
                    addend: *offset as i64 - 4,
                });
                self.bytes(&[0, 0, 0, 0]);
                Ok(())
            }
            Addr::Frame { .. } => Err("frame slot survived frame construction".to_string()),
        }
    }

    /// REX accounting for a memory operand's base register.
    fn prefix_mem(&mut self, size: Size, reg: u8, addr: &Addr, byte_regs: &[u8]) {
        let rm = match addr {
            Addr::Base { base, .. } => match base {
                Reg::Phys(g) => g.encoding(),
                Reg::Virtual(_) => 0,
            },
            _ => 0,
        };
        self.prefix(size, reg, rm, byte_regs);
    }

    fn rel32_fixup(&mut self, label: &str) {
        self.fixups.push((self.code.len(), label.to_string()));
        self.bytes(&[0, 0, 0, 0]);
    }

    fn call_reloc(&mut self, symbol: &str) {
        self.relocs.push(TextReloc {
            offset: self.code.len() as u64,
            symbol: symbol.to_string(),
            kind: RelocKind::Plt32,
            addend: -4,
        });
        self.bytes(&[0, 0, 0, 0]);
    }

    fn encode(&mut self, inst: &Inst) -> std::result::Result<(), String> {
        match inst {
            Inst::Mov { size, dst, src } => {
                let d = phys(dst)?.encoding();
                match src {
                    Operand::Reg(r) => {
                        let s = phys(r)?.encoding();
                        self.prefix(*size, s, d, &[s, d]);
                        self.byte(if *size == Size::B { 0x88 } else { 0x89 });
                        self.modrm_rr(s, d);
                    }
                    Operand::Imm(i) => {
                        // mov r/m, imm32 (sign-extended for 64-bit).
                        self.prefix(*size, 0, d, &[d]);
                        match size {
                            Size::B => {
                                self.byte(0xc6);
                                self.modrm_rr(0, d);
                                self.byte(*i as u8);
                            }
                            Size::W => {
                                self.byte(0xc7);
                                self.modrm_rr(0, d);
                                self.bytes(&(*i as i16).to_le_bytes());
                            }
                            _ => {
                                self.byte(0xc7);
                                self.modrm_rr(0, d);
                                self.bytes(&(*i as i32).to_le_bytes());
                            }
                        }
                    }
                }
            }
            Inst::MovAbs { dst, imm } => {
                let d = phys(dst)?.encoding();
                self.prefix(Size::Q, 0, d, &[]);
                self.byte(0xb8 | (d & 7));
                self.bytes(&imm.to_le_bytes());
            }
            Inst::Load { size, dst, addr } => {
                let d = phys(dst)?.encoding();
                self.prefix_mem(*size, d, addr, &[d]);
                self.byte(if *size == Size::B { 0x8a } else { 0x8b });
                self.modrm_mem(d, addr)?;
            }
            Inst::StoreReg { size, src, addr } => {
                let s = phys(src)?.encoding();
                self.prefix_mem(*size, s, addr, &[s]);
                self.byte(if *size == Size::B { 0x88 } else { 0x89 });
                self.modrm_mem(s, addr)?;
            }
            Inst::StoreImm { size, imm, addr } => {
                self.prefix_mem(*size, 0, addr, &[]);
                self.byte(if *size == Size::B { 0xc6 } else { 0xc7 });
                self.modrm_mem(0, addr)?;
                match size {
                    Size::B => self.byte(*imm as u8),
                    Size::W => self.bytes(&(*imm as i16).to_le_bytes()),
                    _ => self.bytes(&imm.to_le_bytes()),
                }
            }
            Inst::Movzx { from, dst, src } => {
                let d = phys(dst)?.encoding();
                let s = phys(src)?.encoding();
                self.prefix(Size::Q, d, s, &[s]);
                self.byte(0x0f);
                self.byte(if *from == Size::B { 0xb6 } else { 0xb7 });
                self.modrm_rr(d, s);
            }
            Inst::Movsx { from, dst, src } => {
                let d = phys(dst)?.encoding();
                let s = phys(src)?.encoding();
                self.prefix(Size::Q, d, s, &[s]);
                match from {
                    Size::B => {
                        self.byte(0x0f);
                        self.byte(0xbe);
                    }
                    Size::W => {
                        self.byte(0x0f);
                        self.byte(0xbf);
                    }
                    _ => self.byte(0x63), // movsxd
                }
                self.modrm_rr(d, s);
            }
            Inst::Alu { op, size, dst, src } => {
                let d = phys(dst)?.encoding();
                let (rr_op, imm_ext) = match op {
                    AluOp::Add => (0x01, 0),
                    AluOp::Or => (0x09, 1),
                    AluOp::And => (0x21, 4),
                    AluOp::Sub => (0x29, 5),
                    AluOp::Xor => (0x31, 6),
                };
                match src {
                    Operand::Reg(r) => {
                        let s = phys(r)?.encoding();
                        self.prefix(*size, s, d, &[s, d]);
                        self.byte(if *size == Size::B { rr_op - 1 } else { rr_op });
                        self.modrm_rr(s, d);
                    }
                    Operand::Imm(i) => {
                        self.prefix(*size, 0, d, &[d]);
                        match size {
                            Size::B => {
                                self.byte(0x80);
                                self.modrm_rr(imm_ext, d);
                                self.byte(*i as u8);
                            }
                            Size::W => {
                                self.byte(0x81);
                                self.modrm_rr(imm_ext, d);
                                self.bytes(&(*i as i16).to_le_bytes());
                            }
                            _ => {
                                self.byte(0x81);
                                self.modrm_rr(imm_ext, d);
                                self.bytes(&(*i as i32).to_le_bytes());
                            }
                        }
                    }
                }
            }
            Inst::Imul { size, dst, src } => {
                let d = phys(dst)?.encoding();
                match src {
                    Operand::Reg(r) => {
                        let s = phys(r)?.encoding();
                        self.prefix(*size, d, s, &[]);
                        self.byte(0x0f);
                        self.byte(0xaf);
                        self.modrm_rr(d, s);
                    }
                    Operand::Imm(i) => {
                        // imul r, r/m, imm32 with both operands the same.
                        self.prefix(*size, d, d, &[]);
                        self.byte(0x69);
                        self.modrm_rr(d, d);
                        self.bytes(&(*i as i32).to_le_bytes());
                    }
                }
            }
            Inst::Cqo { size } => {
                if *size == Size::Q {
                    self.byte(0x48);
                }
                self.byte(0x99);
            }
            Inst::Idiv { size, divisor } => {
                let r = phys(divisor)?.encoding();
                self.prefix(*size, 0, r, &[r]);
                self.byte(if *size == Size::B { 0xf6 } else { 0xf7 });
                self.modrm_rr(7, r);
            }
            Inst::Div { size, divisor } => {
                let r = phys(divisor)?.encoding();
                self.prefix(*size, 0, r, &[r]);
                self.byte(if *size == Size::B { 0xf6 } else { 0xf7 });
                self.modrm_rr(6, r);
            }
            Inst::Shift {
                op,
                size,
                dst,
                amount,
            } => {
                let d = phys(dst)?.encoding();
                let ext = match op {
                    ShiftOp::Shl => 4,
                    ShiftOp::Shr => 5,
                    ShiftOp::Sar => 7,
                };
                self.prefix(*size, 0, d, &[d]);
                match amount {
                    Some(n) => {
                        self.byte(if *size == Size::B { 0xc0 } else { 0xc1 });
                        self.modrm_rr(ext, d);
                        self.byte(*n);
                    }
                    None => {
                        self.byte(if *size == Size::B { 0xd2 } else { 0xd3 });
                        self.modrm_rr(ext, d);
                    }
                }
            }
            Inst::Not { size, dst } => {
                let d = phys(dst)?.encoding();
                self.prefix(*size, 0, d, &[d]);
                self.byte(if *size == Size::B { 0xf6 } else { 0xf7 });
                self.modrm_rr(2, d);
            }
            Inst::Neg { size, dst } => {
                let d = phys(dst)?.encoding();
                self.prefix(*size, 0, d, &[d]);
                self.byte(if *size == Size::B { 0xf6 } else { 0xf7 });
                self.modrm_rr(3, d);
            }
            Inst::Cmp { size, lhs, rhs } => {
                let l = phys(lhs)?.encoding();
                match rhs {
                    Operand::Reg(r) => {
                        let s = phys(r)?.encoding();
                        self.prefix(*size, s, l, &[s, l]);
                        self.byte(if *size == Size::B { 0x38 } else { 0x39 });
                        self.modrm_rr(s, l);
                    }
                    Operand::Imm(i) => {
                        self.prefix(*size, 0, l, &[l]);
                        match size {
                            Size::B => {
                                self.byte(0x80);
                                self.modrm_rr(7, l);
                                self.byte(*i as u8);
                            }
                            Size::W => {
                                self.byte(0x81);
                                self.modrm_rr(7, l);
                                self.bytes(&(*i as i16).to_le_bytes());
                            }
                            _ => {
                                self.byte(0x81);
                                self.modrm_rr(7, l);
                                self.bytes(&(*i as i32).to_le_bytes());
                            }
                        }
                    }
                }
            }
            Inst::Test { size, lhs, rhs } => {
                let l = phys(lhs)?.encoding();
                let r = phys(rhs)?.encoding();
                self.prefix(*size, r, l, &[r, l]);
                self.byte(if *size == Size::B { 0x84 } else { 0x85 });
                self.modrm_rr(r, l);
            }
            Inst::Setcc { cc, dst } => {
                let d = phys(dst)?.encoding();
                self.prefix(Size::B, 0, d, &[d]);
                self.byte(0x0f);
                self.byte(0x90 | cc.encoding());
                self.modrm_rr(0, d);
            }
            Inst::Lea { dst, addr } => {
                let d = phys(dst)?.encoding();
                self.prefix_mem(Size::Q, d, addr, &[]);
                self.byte(0x8d);
                self.modrm_mem(d, addr)?;
            }
            Inst::Jmp { target } => {
                self.byte(0xe9);
                self.rel32_fixup(target);
            }
            Inst::Jcc { cc, target } => {
                self.byte(0x0f);
                self.byte(0x80 | cc.encoding());
                self.rel32_fixup(target);
            }
            Inst::Call { dest, .. } => match dest {
                CallDest::Sym(name) => {
                    self.byte(0xe8);
                    self.call_reloc(name);
                }
                CallDest::Reg(r) => {
                    let e = phys(r)?.encoding();
                    self.prefix(Size::L, 0, e, &[]);
                    self.byte(0xff);
                    self.modrm_rr(2, e);
                }
            },
            Inst::AdjustSp { bytes } => {
                // add/sub rsp, imm32
                let (ext, imm) = if *bytes < 0 { (5u8, -*bytes) } else { (0u8, *bytes) };
                self.prefix(Size::Q, 0, Gpr::Rsp.encoding(), &[]);
                self.byte(0x81);
                self.modrm_rr(ext, Gpr::Rsp.encoding());
                self.bytes(&imm.to_le_bytes());
            }
            Inst::Push { src } => {
                let e = phys(src)?.encoding();
                if e >= 8 {
                    self.byte(0x41);
                }
                self.byte(0x50 | (e & 7));
            }
            Inst::Pop { dst } => {
                let e = phys(dst)?.encoding();
                if e >= 8 {
                    self.byte(0x41);
                }
                self.byte(0x58 | (e & 7));
            }
            Inst::TailJmp { dest, .. } => match dest {
                CallDest::Sym(name) => {
                    self.byte(0xe9);
                    self.call_reloc(name);
                }
                CallDest::Reg(r) => {
                    let e = phys(r)?.encoding();
                    self.prefix(Size::L, 0, e, &[]);
                    self.byte(0xff);
                    self.modrm_rr(4, e);
                }
            },
            Inst::Ret => self.byte(0xc3),
            Inst::Ud2 => {
                self.byte(0x0f);
                self.byte(0x0b);
            }
        }
        Ok(())
    }
}
