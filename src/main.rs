use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use basalt::{AsmSyntax, BasaltError, CallConv, CompileOptions};

#[derive(Parser)]
#[command(name = "basalt", version, about = "SSA IR optimiser and x86_64 code generator")]
struct Args {
    /// Input IR files, concatenated into one module.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// What to produce.
    #[arg(long, value_enum, default_value_t = EmitKind::Asm)]
    emit: EmitKind,

    /// Assembly flavour.
    #[arg(long, value_enum, default_value_t = SyntaxArg::Att)]
    syntax: SyntaxArg,

    /// Calling convention (selects ELF or COFF for objects).
    #[arg(long, value_enum, default_value_t = CcArg::Sysv)]
    cc: CcArg,

    /// Optimisation level (0-3).
    #[arg(short = 'O', default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=3))]
    opt_level: u8,

    /// Override the inliner size threshold (0 inlines everything).
    #[arg(long)]
    inline_threshold: Option<u32>,

    /// Print the IR to stderr after each changing pass.
    #[arg(long)]
    dump_ir: bool,

    /// Output path; stdout for text outputs when absent.
    #[arg(short = 'o')]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmitKind {
    /// GNU assembler text.
    Asm,
    /// Relocatable object file.
    Obj,
    /// Optimised IR text.
    Ir,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyntaxArg {
    Att,
    Intel,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CcArg {
    Sysv,
    Mswin,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("basalt: {}", e);
            if e.is_user_error() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn run(args: &Args) -> Result<(), BasaltError> {
    let mut source = String::new();
    for path in &args.inputs {
        let text = fs::read_to_string(path)
            .map_err(|e| BasaltError::IoError(format!("{}: {}", path.display(), e)))?;
        source.push_str(&text);
        source.push('\n');
    }

    let options = CompileOptions {
        opt_level: args.opt_level,
        syntax: match args.syntax {
            SyntaxArg::Att => AsmSyntax::Att,
            SyntaxArg::Intel => AsmSyntax::Intel,
        },
        conv: match args.cc {
            CcArg::Sysv => CallConv::SysV,
            CcArg::Mswin => CallConv::MsWin,
        },
        inline_threshold: args.inline_threshold,
        dump_ir: args.dump_ir,
    };

    match args.emit {
        EmitKind::Asm => {
            let mut buffer = Vec::new();
            basalt::compile_ir_to_assembly(&source, &mut buffer, &options)?;
            write_output(args.output.as_deref(), &buffer)
        }
        EmitKind::Ir => {
            let text = basalt::compile_ir_to_ir(&source, &options)?;
            write_output(args.output.as_deref(), text.as_bytes())
        }
        EmitKind::Obj => {
            let bytes = basalt::compile_ir_to_object(&source, &options)?;
            let path = args
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from("out.o"));
            fs::write(&path, bytes)
                .map_err(|e| BasaltError::IoError(format!("{}: {}", path.display(), e)))?;
            Ok(())
        }
    }
}

fn write_output(path: Option<&std::path::Path>, bytes: &[u8]) -> Result<(), BasaltError> {
    match path {
        Some(p) => {
            fs::write(p, bytes)
                .map_err(|e| BasaltError::IoError(format!("{}: {}", p.display(), e)))?;
        }
        None => {
            std::io::stdout().write_all(bytes)?;
        }
    }
    Ok(())
}
