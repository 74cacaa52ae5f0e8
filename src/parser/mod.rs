//! Textual IR parsing.
//!
//! Reads the format produced by [`crate::ir::printer`] back into a module.
//! Parsing builds through the IR builder, so every accepted module satisfies
//! the construction-time rules; the verifier is still run separately by the
//! driver.

pub mod parser;

pub use parser::parse_module;

#[cfg(test)]
mod tests {
    use super::parse_module;
    use crate::ir::instruction::{BinaryOp, CmpOp, InstKind};
    use crate::ir::printer::print_module;
    use crate::ir::verifier::verify_module;

    #[test]
    fn test_parse_simple_add_function() {
        let input = r#"
            fn @add(i32 %a, i32 %b) -> i32 {
            entry:
              %sum = add.i32 %a, %b
              ret.i32 %sum
            }
        "#;

        let module = parse_module(input).expect("parsing failed");
        let f = module.func_id("add").expect("function @add not found");
        let func = module.function(f);
        assert_eq!(func.params().len(), 2);
        let entry = func.entry().unwrap();
        let insts = func.block_insts(entry);
        assert_eq!(insts.len(), 2);
        match func.kind(insts[0]) {
            InstKind::Binary { op, lhs, rhs } => {
                assert_eq!(*op, BinaryOp::Add);
                assert_eq!(*lhs, func.params()[0]);
                assert_eq!(*rhs, func.params()[1]);
            }
            other => panic!("unexpected instruction: {:?}", other),
        }
        assert!(matches!(
            func.kind(insts[1]),
            InstKind::Return { value: Some(_) }
        ));
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_parse_literal_operands() {
        let input = r#"
            fn @answer() -> i32 {
            entry:
              %x = add.i32 34, 35
              ret.i32 %x
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
        let f = module.func_id("answer").unwrap();
        let func = module.function(f);
        // Two immediates are synthesised before the add.
        assert_eq!(func.block_insts(func.entry().unwrap()).len(), 4);
    }

    #[test]
    fn test_parse_branches_and_phi() {
        let input = r#"
            fn @pick(i32 %x) -> i32 {
            entry:
              %zero = imm.i32 0
              %c = sgt.i32 %x, %zero
              br %c, then, else
            then:
              %a = imm.i32 1
              jmp join
            else:
              %b = imm.i32 2
              jmp join
            join:
              %r = phi.i32 [%a, then], [%b, else]
              ret.i32 %r
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
        let f = module.func_id("pick").unwrap();
        let func = module.function(f);
        assert_eq!(func.block_order().len(), 4);
        let join = func.block_order()[3];
        let phi = func.block_insts(join)[0];
        match func.kind(phi) {
            InstKind::Phi { incoming } => assert_eq!(incoming.len(), 2),
            other => panic!("expected phi, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_phi_forward_reference() {
        // The phi in the loop header names a value defined further down.
        let input = r#"
            fn @count(i32 %n) -> i32 {
            entry:
              %zero = imm.i32 0
              jmp header
            header:
              %i = phi.i32 [%zero, entry], [%next, body]
              %c = slt.i32 %i, %n
              br %c, body, done
            body:
              %one = imm.i32 1
              %next = add.i32 %i, %one
              jmp header
            done:
              ret.i32 %i
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_parse_globals_and_extern() {
        let input = r#"
            global @counter: i64 = 10
            global @msg: [3 x u8] = "hi\00"
            extern global @tab: i64
            extern fn @puts(*u8) -> i32

            fn @get() -> i64 {
            entry:
              %p = addr @counter
              %v = load.i64 %p
              ret.i64 %v
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
        assert!(module.global_id("counter").is_some());
        assert!(module.global_id("msg").is_some());
        let tab = module.global_id("tab").unwrap();
        assert!(module.global(tab).is_external);
        let puts = module.func_id("puts").unwrap();
        assert!(module.function(puts).flags.is_extern);
    }

    #[test]
    fn test_parse_calls() {
        let input = r#"
            fn @callee(i32 %x) -> i32 {
            entry:
              ret.i32 %x
            }

            fn @caller() -> i32 {
            entry:
              %r = call @callee(7)
              ret.i32 %r
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
        let f = module.func_id("caller").unwrap();
        let func = module.function(f);
        let has_call = func
            .block_insts(func.entry().unwrap())
            .iter()
            .any(|&v| matches!(func.kind(v), InstKind::Call { .. }));
        assert!(has_call);
    }

    #[test]
    fn test_parse_forward_function_reference() {
        let input = r#"
            fn @first() -> i32 {
            entry:
              %r = call @second()
              ret.i32 %r
            }

            fn @second() -> i32 {
            entry:
              %v = imm.i32 3
              ret.i32 %v
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_parse_comments_and_whitespace() {
        let input = r#"
            # leading comment
            fn @f() -> void { # trailing comment
            entry: # block comment
              ret.void # done
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        verify_module(&module).unwrap();
    }

    #[test]
    fn test_parse_missing_terminator() {
        let input = r#"
            fn @bad() -> i32 {
            entry:
              %a = imm.i32 1
            }
        "#;
        let err = parse_module(input).unwrap_err();
        assert!(err.to_string().contains("terminator"));
    }

    #[test]
    fn test_parse_unknown_value() {
        let input = r#"
            fn @bad() -> i32 {
            entry:
              ret.i32 %nope
            }
        "#;
        let err = parse_module(input).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_roundtrip_through_printer() {
        let input = r#"
            fn @pick(i32 %x) -> i32 {
            entry:
              %zero = imm.i32 0
              %c = sgt.i32 %x, %zero
              br %c, then, else
            then:
              ret.i32 %x
            else:
              %n = sub.i32 %zero, %x
              ret.i32 %n
            }
        "#;
        let module = parse_module(input).expect("parsing failed");
        let printed = print_module(&module);
        let reparsed = parse_module(&printed).expect("reparsing failed");
        verify_module(&reparsed).unwrap();
        // A second print is stable.
        assert_eq!(printed, print_module(&reparsed));
    }
}
