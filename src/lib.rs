//! Basalt: an SSA IR optimiser and x86_64 code generator.
//!
//! Frontends build a [`ir::Module`] through [`ir::IrBuilder`] (or hand the
//! compiler textual IR); the middle end verifies and optimises it; the back
//! end lowers to machine IR, selects x86_64 instructions, colours
//! registers and emits GNU assembly or a relocatable ELF/COFF object.

pub mod codegen;
pub mod error;
pub mod ir;
pub mod mir;
pub mod obj;
pub mod opt;
pub mod parser;
pub mod target;

use std::io::Write;

pub use codegen::AsmSyntax;
pub use error::{BasaltError, Result};
pub use target::{CallConv, TargetDescription};

use ir::printer::print_module;
use ir::verifier::verify_module;

/// Knobs shared by the compile entry points.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub opt_level: u8,
    pub syntax: AsmSyntax,
    pub conv: CallConv,
    pub inline_threshold: Option<u32>,
    /// Print the IR to stderr after each changing pass.
    pub dump_ir: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 1,
            syntax: AsmSyntax::Att,
            conv: CallConv::SysV,
            inline_threshold: None,
            dump_ir: false,
        }
    }
}

/// Parse, verify and optimise textual IR into a module.
pub fn prepare_module(input_ir: &str, options: &CompileOptions) -> Result<ir::Module> {
    let mut module = parser::parse_module(input_ir)?;
    // An invariant violation in fresh input is the frontend's fault, not
    // ours; report it as a source error.
    verify_module(&module)
        .map_err(|e| BasaltError::ParsingError(format!("invalid input IR: {}", e)))?;

    let mut pipeline =
        opt::PassPipeline::default_for_opt_level(options.opt_level, options.inline_threshold);
    if options.dump_ir {
        pipeline = pipeline.dump_after_each_pass();
    }
    pipeline.run(&mut module)?;
    Ok(module)
}

/// Compile textual IR and write assembly for the selected convention.
pub fn compile_ir_to_assembly<W: Write>(
    input_ir: &str,
    output_asm: &mut W,
    options: &CompileOptions,
) -> Result<()> {
    let module = prepare_module(input_ir, options)?;
    let target = TargetDescription::x86_64(options.conv);
    codegen::generate_x86_64_assembly(&module, &target, options.syntax, output_asm)
}

/// Compile textual IR into relocatable object bytes (ELF for System V,
/// COFF for Microsoft x64).
pub fn compile_ir_to_object(input_ir: &str, options: &CompileOptions) -> Result<Vec<u8>> {
    let module = prepare_module(input_ir, options)?;
    let target = TargetDescription::x86_64(options.conv);
    codegen::generate_x86_64_object_bytes(&module, &target)
}

/// Compile textual IR and print the optimised IR back out.
pub fn compile_ir_to_ir(input_ir: &str, options: &CompileOptions) -> Result<String> {
    let module = prepare_module(input_ir, options)?;
    Ok(print_module(&module))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_to_end_assembly() {
        let input = r#"
            fn @answer() -> i32 {
            entry:
              %a = add.i32 34, 35
              ret.i32 %a
            }
        "#;
        let mut out = Vec::new();
        let options = CompileOptions {
            opt_level: 2,
            ..CompileOptions::default()
        };
        compile_ir_to_assembly(input, &mut out, &options).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("answer:"));
        assert!(text.contains("$69"));
    }

    #[test]
    fn test_end_to_end_object() {
        let input = r#"
            fn @f() -> i64 {
            entry:
              %v = imm.i64 1
              ret.i64 %v
            }
        "#;
        let bytes = compile_ir_to_object(input, &CompileOptions::default()).unwrap();
        assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
    }

    #[test]
    fn test_parse_error_is_user_error() {
        let err = compile_ir_to_ir("fn junk", &CompileOptions::default()).unwrap_err();
        assert!(err.is_user_error());
    }
}
