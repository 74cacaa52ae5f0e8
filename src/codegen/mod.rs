//! Code generation pipeline.
//!
//! Drives a verified IR module through MIR lowering, phi elimination,
//! instruction selection, register allocation and frame construction, then
//! emits GNU assembly or a relocatable object through the neutral object
//! model.

pub mod x86_64;

use std::io::Write;

use log::info;

use crate::error::Result;
use crate::ir;
use crate::mir;
use crate::obj::{Binding, GenericObject, ObjReloc, ObjSymbol, SectionKind, SymbolKind};
use crate::target::{CallConv, TargetDescription};

pub use x86_64::asm::AsmSyntax;

use x86_64::X64Function;

/// Compile every function of `module` down to allocated x86_64 MIR.
fn compile_functions(
    module: &ir::Module,
    target: &TargetDescription,
) -> Result<(Vec<X64Function>, mir::Module)> {
    let lowered = mir::lower::lower_module(module, target)?;
    let mut funcs = Vec::new();
    for f in module.func_ids() {
        let func = module.function(f);
        if func.flags.is_extern {
            continue;
        }
        let name = module.func_name(f);
        let Some(mir_func) = lowered.functions.get(name) else {
            continue;
        };
        let mut mir_func = mir_func.clone();
        mir::lower::eliminate_phis(&mut mir_func);
        let mut x64 = x86_64::isel::select_function(&mir_func, func.flags.is_global, target)?;
        x86_64::regalloc::allocate_function(&mut x64, target)?;
        x86_64::frame::build_frame(&mut x64);
        funcs.push(x64);
    }
    info!("compiled {} function(s)", funcs.len());
    Ok((funcs, lowered))
}

/// Names of extern functions and external globals, for `.extern` lines.
fn extern_symbols(module: &ir::Module) -> Vec<String> {
    let mut out = Vec::new();
    for f in module.func_ids() {
        if module.function(f).flags.is_extern {
            out.push(module.func_name(f).to_string());
        }
    }
    for g in module.global_ids() {
        if module.global(g).is_external {
            out.push(module.global_name(g).to_string());
        }
    }
    out
}

/// Generate GNU assembler text for `module`.
pub fn generate_x86_64_assembly<W: Write>(
    module: &ir::Module,
    target: &TargetDescription,
    syntax: AsmSyntax,
    writer: &mut W,
) -> Result<()> {
    let (funcs, lowered) = compile_functions(module, target)?;
    let externs = extern_symbols(module);
    x86_64::asm::emit_assembly(&funcs, &lowered.data, &externs, syntax, writer)
}

/// Build a neutral relocatable object for `module`.
pub fn generate_x86_64_object(
    module: &ir::Module,
    target: &TargetDescription,
) -> Result<GenericObject> {
    let (funcs, lowered) = compile_functions(module, target)?;
    let mut obj = GenericObject::new();

    // Text: concatenate encoded functions, 16-byte aligned.
    for func in &funcs {
        while obj.text.len() % 16 != 0 {
            obj.text.push(0x90);
        }
        let start = obj.text.len() as u64;
        let encoded = x86_64::encode::encode_function(func)?;
        let size = encoded.code.len() as u64;
        obj.text.extend_from_slice(&encoded.code);
        obj.add_symbol(ObjSymbol {
            name: func.name.clone(),
            kind: SymbolKind::Function,
            section: Some(SectionKind::Text),
            offset: start,
            size,
            binding: if func.is_global {
                Binding::Global
            } else {
                Binding::Local
            },
        });
        for r in encoded.relocs {
            // Defer symbol resolution until all definitions are in.
            obj.relocs.push(ObjReloc {
                section: SectionKind::Text,
                offset: start + r.offset,
                symbol: usize::MAX,
                kind: r.kind,
                addend: r.addend,
            });
            let idx = obj.relocs.len() - 1;
            let sym = obj.external_index(&r.symbol);
            obj.relocs[idx].symbol = sym;
        }
    }

    // Data and bss.
    for d in &lowered.data {
        match &d.bytes {
            Some(bytes) => {
                let align = d.align.max(1) as usize;
                while obj.data.len() % align != 0 {
                    obj.data.push(0);
                }
                let start = obj.data.len() as u64;
                obj.data.extend_from_slice(bytes);
                obj.add_symbol(ObjSymbol {
                    name: d.name.clone(),
                    kind: SymbolKind::Object,
                    section: Some(SectionKind::Data),
                    offset: start,
                    size: d.size,
                    binding: Binding::Global,
                });
            }
            None => {
                let align = d.align.max(1);
                obj.bss_size = (obj.bss_size + align - 1) & !(align - 1);
                let start = obj.bss_size;
                obj.bss_size += d.size;
                obj.add_symbol(ObjSymbol {
                    name: d.name.clone(),
                    kind: SymbolKind::Object,
                    section: Some(SectionKind::Bss),
                    offset: start,
                    size: d.size,
                    binding: Binding::Global,
                });
            }
        }
    }

    // Deferred call/data references: now that every definition has a
    // symbol, repoint relocations made against provisional externals.
    resolve_local_relocs(&mut obj);
    Ok(obj)
}

/// Serialise the object in the flavour matching the calling convention.
pub fn generate_x86_64_object_bytes(
    module: &ir::Module,
    target: &TargetDescription,
) -> Result<Vec<u8>> {
    let obj = generate_x86_64_object(module, target)?;
    Ok(match target.conv {
        CallConv::SysV => obj.to_elf(),
        CallConv::MsWin => obj.to_coff(),
    })
}

/// Replace references to provisional external symbols with the defined
/// symbol of the same name, when one exists.
fn resolve_local_relocs(obj: &mut GenericObject) {
    for i in 0..obj.relocs.len() {
        let sym = obj.relocs[i].symbol;
        if obj.symbols[sym].kind != SymbolKind::External {
            continue;
        }
        let name = obj.symbols[sym].name.clone();
        if let Some(defined) = obj
            .symbols
            .iter()
            .position(|s| s.name == name && s.kind != SymbolKind::External)
        {
            obj.relocs[i].symbol = defined;
        }
    }
    // Externals that ended up shadowed by definitions but unreferenced are
    // left in place; linkers ignore duplicate externals resolved locally.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verifier::verify_module;
    use crate::parser::parse_module;

    const PROGRAM: &str = r#"
        extern fn @consume(i64) -> void

        global @counter: i64 = 7

        fn @bump(i64 %n) -> i64 {
        entry:
          %p = addr @counter
          %v = load.i64 %p
          %s = add.i64 %v, %n
          store.i64 %s, %p
          ret.i64 %s
        }

        fn @main() -> i64 {
        entry:
          %r = call @bump(3)
          call @consume(%r)
          ret.i64 %r
        }
    "#;

    #[test]
    fn test_assembly_pipeline() {
        let module = parse_module(PROGRAM).unwrap();
        verify_module(&module).unwrap();
        let target = TargetDescription::default();
        let mut out = Vec::new();
        generate_x86_64_assembly(&module, &target, AsmSyntax::Att, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(".globl bump"));
        assert!(text.contains(".globl main"));
        assert!(text.contains("call bump"));
        assert!(text.contains("call consume"));
        assert!(text.contains("counter(%rip)"));
        assert!(text.contains(".extern consume"));
    }

    #[test]
    fn test_object_pipeline() {
        let module = parse_module(PROGRAM).unwrap();
        verify_module(&module).unwrap();
        let target = TargetDescription::default();
        let obj = generate_x86_64_object(&module, &target).unwrap();
        assert!(obj.symbol_index("bump").is_some());
        assert!(obj.symbol_index("main").is_some());
        assert!(obj.symbol_index("counter").is_some());
        assert!(!obj.text.is_empty());
        assert_eq!(obj.data.len(), 8);
        // The call to @bump resolved to the local definition.
        let bump = obj.symbol_index("bump").unwrap();
        assert!(obj
            .relocs
            .iter()
            .any(|r| r.symbol == bump));
        // consume stays external.
        let consume = obj
            .symbols
            .iter()
            .find(|s| s.name == "consume")
            .unwrap();
        assert_eq!(consume.kind, SymbolKind::External);

        let elf = obj.to_elf();
        assert_eq!(&elf[0..4], &[0x7f, b'E', b'L', b'F']);
        let coff = obj.to_coff();
        assert_eq!(u16::from_le_bytes([coff[0], coff[1]]), 0x8664);
    }
}
