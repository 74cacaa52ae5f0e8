//! Stack frame construction.
//!
//! Runs after register allocation: assigns rbp-relative offsets to frame
//! slots, inserts the prologue (push rbp, establish rbp, save callee-saved
//! registers, reserve locals) and expands every return and tail jump with
//! the matching epilogue. Stack alignment keeps rsp 16-byte aligned at call
//! sites.

use log::debug;

use super::{Addr, Gpr, Inst, Operand, Reg, Size, X64Function};

pub fn build_frame(func: &mut X64Function) {
    // Slot offsets below the callee-saved save area.
    let saved = func.saved_regs.clone();
    let save_bytes = 8 * saved.len() as i64;
    let mut cursor: i64 = -save_bytes;
    let mut offsets: Vec<i32> = Vec::with_capacity(func.frame.len());
    for slot in &func.frame {
        let align = slot.align.max(1) as i64;
        cursor -= slot.size.max(1) as i64;
        cursor &= !(align - 1);
        offsets.push(cursor as i32);
    }

    let mut locals = (-cursor - save_bytes).max(0);
    // Keep rsp 16-byte aligned at call sites: rbp push restores alignment,
    // so saves plus locals must stay a multiple of 16.
    locals = (locals + 7) & !7;
    if (locals + save_bytes) % 16 != 0 {
        locals += 16 - (locals + save_bytes) % 16;
    }
    func.frame_size = locals as i32;
    debug!(
        "{}: frame {} bytes, {} callee-saved",
        func.name,
        locals,
        saved.len()
    );

    let resolve = |addr: &mut Addr| {
        if let Addr::Frame { slot, offset } = addr {
            *addr = Addr::Base {
                base: Reg::Phys(Gpr::Rbp),
                offset: offsets[*slot as usize] + *offset,
            };
        }
    };

    let mut prologue = vec![
        Inst::Push {
            src: Reg::Phys(Gpr::Rbp),
        },
        Inst::Mov {
            size: Size::Q,
            dst: Reg::Phys(Gpr::Rbp),
            src: Operand::Reg(Reg::Phys(Gpr::Rsp)),
        },
    ];
    for &g in &saved {
        prologue.push(Inst::Push { src: Reg::Phys(g) });
    }
    if locals > 0 {
        prologue.push(Inst::AdjustSp {
            bytes: -(locals as i32),
        });
    }

    let epilogue = |out: &mut Vec<Inst>| {
        if locals > 0 {
            out.push(Inst::AdjustSp {
                bytes: locals as i32,
            });
        }
        for &g in saved.iter().rev() {
            out.push(Inst::Pop { dst: Reg::Phys(g) });
        }
        out.push(Inst::Pop {
            dst: Reg::Phys(Gpr::Rbp),
        });
    };

    let mut first = true;
    for (_, insts) in &mut func.blocks {
        let mut out: Vec<Inst> = Vec::with_capacity(insts.len() + 4);
        if first {
            out.extend(prologue.drain(..));
            first = false;
        }
        for mut inst in insts.drain(..) {
            match &mut inst {
                Inst::Load { addr, .. }
                | Inst::StoreReg { addr, .. }
                | Inst::StoreImm { addr, .. }
                | Inst::Lea { addr, .. } => resolve(addr),
                Inst::Ret | Inst::TailJmp { .. } => epilogue(&mut out),
                _ => {}
            }
            out.push(inst);
        }
        *insts = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verifier::verify_module;
    use crate::mir::lower::{eliminate_phis, lower_module};
    use crate::parser::parse_module;
    use crate::target::TargetDescription;

    fn compile(text: &str, name: &str) -> X64Function {
        let module = parse_module(text).unwrap();
        verify_module(&module).unwrap();
        let target = TargetDescription::default();
        let mir = lower_module(&module, &target).unwrap();
        let mut func = mir.functions.get(name).unwrap().clone();
        eliminate_phis(&mut func);
        let mut x64 = super::super::isel::select_function(&func, true, &target).unwrap();
        super::super::regalloc::allocate_function(&mut x64, &target).unwrap();
        build_frame(&mut x64);
        x64
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let f = compile(
            r#"
            fn @f(i64 %a) -> i64 {
            entry:
              %s = add.i64 %a, 1
              ret.i64 %s
            }
        "#,
            "f",
        );
        let entry = &f.blocks[0].1;
        assert!(matches!(
            entry[0],
            Inst::Push {
                src: Reg::Phys(Gpr::Rbp)
            }
        ));
        assert!(matches!(entry[1], Inst::Mov { .. }));
        // The epilogue pops rbp right before ret.
        let n = entry.len();
        assert!(matches!(entry[n - 1], Inst::Ret));
        assert!(matches!(
            entry[n - 2],
            Inst::Pop {
                dst: Reg::Phys(Gpr::Rbp)
            }
        ));
    }

    #[test]
    fn test_frame_slots_resolve_to_rbp() {
        let f = compile(
            r#"
            fn @f() -> i32 {
            entry:
              %p = alloca i32
              %v = imm.i32 3
              store.i32 %v, %p
              %r = load.i32 %p
              ret.i32 %r
            }
        "#,
            "f",
        );
        let no_frame_addr = f.blocks.iter().all(|(_, insts)| {
            insts.iter().all(|i| {
                let mut ok = true;
                if let Inst::Load { addr, .. } | Inst::StoreReg { addr, .. } = i {
                    ok = !matches!(addr, Addr::Frame { .. });
                }
                ok
            })
        });
        assert!(no_frame_addr);
        // Alignment keeps the reserved area a multiple of 16 with no saves.
        assert_eq!(f.frame_size % 16, 0);
    }
}
