//! End-to-end tests over the textual IR surface: parse, verify, optimise,
//! and drive the backend down to assembly and object bytes.

use basalt::ir::instruction::InstKind;
use basalt::ir::printer::{print_function, print_module};
use basalt::ir::verifier::verify_module;
use basalt::opt::{DeadCodeElimination, Inline, Pass, PassPipeline, SparseConditionalConstants};
use basalt::parser::parse_module;
use basalt::{compile_ir_to_assembly, compile_ir_to_object, AsmSyntax, CompileOptions};

fn options(opt_level: u8) -> CompileOptions {
    CompileOptions {
        opt_level,
        ..CompileOptions::default()
    }
}

#[test]
fn constant_folding_collapses_to_return_immediate() {
    let input = r#"
        fn @f() -> i32 {
        entry:
          %a = imm.i32 34
          %b = imm.i32 35
          %c = add.i32 %a, %b
          ret.i32 %c
        }
    "#;
    let mut module = parse_module(input).unwrap();
    verify_module(&module).unwrap();
    let mut sccp = SparseConditionalConstants;
    let mut dce = DeadCodeElimination;
    assert!(sccp.run(&mut module).unwrap());
    let _ = dce.run(&mut module).unwrap();
    verify_module(&module).unwrap();

    let f = module.func_id("f").unwrap();
    let func = module.function(f);
    // Exactly the immediate and the return survive.
    assert_eq!(func.count_instructions(), 2);
    let text = print_function(&module, f);
    assert!(text.contains("imm.i32 69"));
}

#[test]
fn inliner_single_return_substitutes_value() {
    let input = r#"
        fn @f() -> i32 {
        entry:
          %v = imm.i32 42
          ret.i32 %v
        }

        fn @g() -> i32 {
        entry:
          %c = call @f()
          ret.i32 %c
        }
    "#;
    let mut module = parse_module(input).unwrap();
    let mut inline = Inline::with_threshold(40);
    assert!(inline.run(&mut module).unwrap());
    verify_module(&module).unwrap();
    let g = module.func_id("g").unwrap();
    assert_eq!(
        print_function(&module, g),
        "fn @g() -> i32 {\nb0:\n  %0 = imm.i32 42\n  ret.i32 %0\n}\n"
    );
}

#[test]
fn inliner_multi_return_introduces_phi_block() {
    let input = r#"
        fn @f(i32 %x) -> i32 {
        entry:
          %zero = imm.i32 0
          %c = ne.i32 %x, %zero
          br %c, then, else
        then:
          %one = imm.i32 1
          ret.i32 %one
        else:
          %two = imm.i32 2
          ret.i32 %two
        }

        fn @g() -> i32 {
        entry:
          %arg = imm.i32 0
          %c = call @f(%arg)
          ret.i32 %c
        }
    "#;
    let mut module = parse_module(input).unwrap();
    let mut inline = Inline::with_threshold(40);
    assert!(inline.run(&mut module).unwrap());
    verify_module(&module).unwrap();
    let g = module.func_id("g").unwrap();
    let func = module.function(g);
    assert_eq!(func.block_order().len(), 4);
    let text = print_function(&module, g);
    assert!(text.contains("phi.i32"));
    assert!(!text.contains("call"));

    // Constants then shrink the whole thing down to `ret 2`.
    let mut pipeline = PassPipeline::default_for_opt_level(2, None);
    pipeline.run(&mut module).unwrap();
    let text = print_function(&module, g);
    assert!(text.contains("imm.i32 2"));
    assert!(!text.contains("phi"));
}

#[test]
fn inliner_refuses_mutual_recursion_cycle() {
    let input = r#"
        fn @even(i32 %n) -> i32 {
        entry:
          %r = call @odd(%n)
          ret.i32 %r
        }

        fn @odd(i32 %n) -> i32 {
        entry:
          %r = call @even(%n)
          ret.i32 %r
        }
    "#;
    let mut module = parse_module(input).unwrap();
    let mut strict = Inline::with_threshold(0).strict();
    let err = strict.run(&mut module).unwrap_err();
    assert!(err.contains("infinite loop detected"));

    // Permissive mode leaves the refused call in place and still verifies.
    let mut module = parse_module(input).unwrap();
    let mut permissive = Inline::with_threshold(0);
    permissive.run(&mut module).unwrap();
    verify_module(&module).unwrap();
    let even = module.func_id("even").unwrap();
    assert!(print_function(&module, even).contains("call"));
}

#[test]
fn mem2reg_scenario_becomes_return_of_immediate() {
    let input = r#"
        fn @f() -> i32 {
        entry:
          %slot = alloca i32
          %v = imm.i32 11
          store.i32 %v, %slot
          %r = load.i32 %slot
          ret.i32 %r
        }
    "#;
    let mut module = parse_module(input).unwrap();
    let mut pipeline = PassPipeline::default_for_opt_level(1, None);
    pipeline.run(&mut module).unwrap();
    let f = module.func_id("f").unwrap();
    let text = print_function(&module, f);
    assert!(!text.contains("alloca"));
    assert!(!text.contains("store"));
    assert!(text.contains("imm.i32 11"));
}

#[test]
fn optimiser_is_idempotent_at_fixpoint() {
    let input = r#"
        fn @helper(i32 %x) -> i32 {
        entry:
          %r = add.i32 %x, 1
          ret.i32 %r
        }

        fn @main_fn(i32 %a) -> i32 {
        entry:
          %slot = alloca i32
          store.i32 %a, %slot
          %v = load.i32 %slot
          %r = call @helper(%v)
          ret.i32 %r
        }
    "#;
    let mut module = parse_module(input).unwrap();
    let mut pipeline = PassPipeline::default_for_opt_level(2, None);
    pipeline.run(&mut module).unwrap();
    let snapshot = print_module(&module);

    let stats = pipeline.run(&mut module).unwrap();
    assert_eq!(stats.passes_changed, 0);
    assert_eq!(print_module(&module), snapshot);
}

#[test]
fn textual_roundtrip_corpus() {
    let fixtures = [
        r#"
            fn @max(i32 %a, i32 %b) -> i32 {
            entry:
              %c = sgt.i32 %a, %b
              br %c, t, e
            t:
              ret.i32 %a
            e:
              ret.i32 %b
            }
        "#,
        r#"
            global @counter: i64 = 0

            fn @tick() -> i64 {
            entry:
              %p = addr @counter
              %v = load.i64 %p
              %one = imm.i64 1
              %n = add.i64 %v, %one
              store.i64 %n, %p
              ret.i64 %n
            }
        "#,
        r#"
            fn @loop_sum(i32 %n) -> i32 {
            entry:
              %zero = imm.i32 0
              jmp header
            header:
              %i = phi.i32 [%zero, entry], [%next, body]
              %acc = phi.i32 [%zero, entry], [%acc2, body]
              %c = slt.i32 %i, %n
              br %c, body, done
            body:
              %one = imm.i32 1
              %next = add.i32 %i, %one
              %acc2 = add.i32 %acc, %i
              jmp header
            done:
              ret.i32 %acc
            }
        "#,
        r#"
            extern fn @putchar(i32) -> i32

            fn @shout() -> void {
            entry:
              %bang = imm.i32 33
              call @putchar(%bang)
              ret.void
            }
        "#,
    ];
    for fixture in fixtures {
        let module = parse_module(fixture).expect("fixture must parse");
        verify_module(&module).expect("fixture must verify");
        let printed = print_module(&module);
        let reparsed = parse_module(&printed).expect("printed IR must reparse");
        verify_module(&reparsed).expect("reparsed IR must verify");
        assert_eq!(printed, print_module(&reparsed), "printing must be stable");
    }
}

#[test]
fn backend_compiles_loops_and_calls_to_assembly() {
    let input = r#"
        fn @mul_add(i64 %a, i64 %b, i64 %c) -> i64 {
        entry:
          %p = mul.i64 %a, %b
          %s = add.i64 %p, %c
          ret.i64 %s
        }

        fn @main() -> i64 {
        entry:
          %zero = imm.i64 0
          jmp header
        header:
          %i = phi.i64 [%zero, entry], [%next, body]
          %acc = phi.i64 [%zero, entry], [%acc2, body]
          %limit = imm.i64 10
          %c = slt.i64 %i, %limit
          br %c, body, done
        body:
          %one = imm.i64 1
          %next = add.i64 %i, %one
          %acc2 = call @mul_add(%acc, %i, %one)
          jmp header
        done:
          ret.i64 %acc
        }
    "#;
    for level in [0u8, 1, 2, 3] {
        let mut out = Vec::new();
        compile_ir_to_assembly(input, &mut out, &options(level)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("main:"), "O{} output misses main", level);
        assert!(text.contains("mul_add:"), "O{} output misses mul_add", level);
        assert!(text.contains("ret"));
    }
}

#[test]
fn backend_spills_or_saves_across_calls() {
    // Several values stay live across the call, so the generated code must
    // either dedicate callee-saved registers or spill to the frame.
    let input = r#"
        fn @sink(i64 %x) -> i64 {
        entry:
          ret.i64 %x
        }

        fn @f(i64 %a, i64 %b, i64 %c) -> i64 {
        entry:
          %r = call @sink(%a)
          %s1 = add.i64 %r, %b
          %s2 = add.i64 %s1, %c
          ret.i64 %s2
        }
    "#;
    let mut out = Vec::new();
    compile_ir_to_assembly(input, &mut out, &options(0)).unwrap();
    let text = String::from_utf8(out).unwrap();
    let uses_callee_saved = ["%rbx", "%r12", "%r13", "%r14", "%r15"]
        .iter()
        .any(|r| text.contains(r));
    let spills = text.contains("(%rbp)");
    assert!(uses_callee_saved || spills, "no save or spill in:\n{}", text);
}

#[test]
fn intel_syntax_output() {
    let input = r#"
        fn @f(i64 %a) -> i64 {
        entry:
          %r = add.i64 %a, 5
          ret.i64 %r
        }
    "#;
    let mut out = Vec::new();
    let opts = CompileOptions {
        syntax: AsmSyntax::Intel,
        ..options(1)
    };
    compile_ir_to_assembly(input, &mut out, &opts).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains(".intel_syntax noprefix"));
    assert!(!text.contains("%rax"));
}

#[test]
fn object_output_is_wellformed_elf() {
    let input = r#"
        global @msg: [3 x u8] = "ok\00"

        fn @f() -> i64 {
        entry:
          %p = addr @msg
          %v = ptrtoint.i64 %p
          ret.i64 %v
        }
    "#;
    let bytes = compile_ir_to_object(input, &options(1)).unwrap();
    assert_eq!(&bytes[0..4], &[0x7f, b'E', b'L', b'F']);
    // ET_REL for x86-64.
    assert_eq!(u16::from_le_bytes([bytes[16], bytes[17]]), 1);
    assert_eq!(u16::from_le_bytes([bytes[18], bytes[19]]), 62);
}

#[test]
fn tail_recursion_is_marked_and_compiled() {
    let input = r#"
        fn @count(i64 %n, i64 %acc) -> i64 {
        entry:
          %zero = imm.i64 0
          %c = sle.i64 %n, %zero
          br %c, base, rec
        base:
          ret.i64 %acc
        rec:
          %one = imm.i64 1
          %m = sub.i64 %n, %one
          %acc2 = add.i64 %acc, %n
          %r = call @count(%m, %acc2)
          ret.i64 %r
        }
    "#;
    let mut module = parse_module(input).unwrap();
    let mut pipeline = PassPipeline::default_for_opt_level(2, None);
    pipeline.run(&mut module).unwrap();
    verify_module(&module).unwrap();
    let f = module.func_id("count").unwrap();
    let func = module.function(f);
    let marked = func.inst_ids().any(|v| {
        matches!(func.kind(v), InstKind::Call { tail: true, .. })
    });
    assert!(marked, "self-recursive tail call not marked");

    // The tail call lowers to a jump, not a call.
    let mut out = Vec::new();
    compile_ir_to_assembly(input, &mut out, &options(2)).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("jmp count"), "missing tail jump in:\n{}", text);
}
