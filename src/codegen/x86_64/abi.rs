//! Calling-convention tables for the x86_64 backend.
//!
//! Thin layer translating the target description's register names into
//! [`Gpr`] values, plus the allocator's register pools.

use super::Gpr;
use crate::target::{CallConv, TargetDescription};

/// Integer argument registers in parameter order.
pub fn arg_registers(target: &TargetDescription, conv: CallConv) -> Vec<Gpr> {
    target
        .arg_registers(conv)
        .iter()
        .filter_map(|n| Gpr::from_name(n))
        .collect()
}

/// Registers the callee must preserve.
pub fn callee_saved(target: &TargetDescription, conv: CallConv) -> Vec<Gpr> {
    target
        .callee_saved(conv)
        .iter()
        .filter_map(|n| Gpr::from_name(n))
        .collect()
}

/// Registers a call clobbers.
pub fn caller_saved(target: &TargetDescription, conv: CallConv) -> Vec<Gpr> {
    target
        .caller_saved(conv)
        .iter()
        .filter_map(|n| Gpr::from_name(n))
        .collect()
}

/// Allocatable pool, caller-saved first so leaf code avoids save/restore
/// traffic. `rsp` and `rbp` are never allocatable.
pub fn allocatable(target: &TargetDescription, conv: CallConv) -> Vec<Gpr> {
    let mut pool = caller_saved(target, conv);
    for g in callee_saved(target, conv) {
        if !pool.contains(&g) {
            pool.push(g);
        }
    }
    pool.retain(|g| !matches!(g, Gpr::Rsp | Gpr::Rbp));
    pool
}

/// The register carrying the return value.
pub fn return_register() -> Gpr {
    Gpr::Rax
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_tables() {
        let t = TargetDescription::x86_64(CallConv::SysV);
        let args = arg_registers(&t, CallConv::SysV);
        assert_eq!(args[0], Gpr::Rdi);
        assert_eq!(args.len(), 6);
        assert!(callee_saved(&t, CallConv::SysV).contains(&Gpr::Rbx));
        let pool = allocatable(&t, CallConv::SysV);
        assert!(!pool.contains(&Gpr::Rsp));
        assert!(!pool.contains(&Gpr::Rbp));
        assert_eq!(pool.len(), 14);
    }

    #[test]
    fn test_win64_tables() {
        let t = TargetDescription::x86_64(CallConv::MsWin);
        let args = arg_registers(&t, CallConv::MsWin);
        assert_eq!(args, vec![Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9]);
        assert!(callee_saved(&t, CallConv::MsWin).contains(&Gpr::Rsi));
    }
}
