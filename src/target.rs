//! Target description for x86_64.
//!
//! A [`TargetDescription`] is a read-only record describing data layout and
//! calling-convention details. It is constructed once per compilation and
//! may be shared freely; nothing in it is mutated after construction.
//!
//! Two calling conventions are supported: System V AMD64 (Linux, BSD, macOS)
//! and Microsoft x64 (Windows). The convention also selects the object
//! flavour the backend emits (ELF for System V, COFF for Microsoft).

use std::fmt;

/// Calling convention tag carried by functions and function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConv {
    /// System V AMD64 ABI (Linux/macOS/FreeBSD).
    #[default]
    SysV,
    /// Microsoft x64 ABI (Windows).
    MsWin,
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallConv::SysV => write!(f, "sysv"),
            CallConv::MsWin => write!(f, "mswin"),
        }
    }
}

// System V AMD64: first six integer arguments in registers.
const SYSV_ARG_REGISTERS: &[&str] = &["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
const SYSV_CALLEE_SAVED: &[&str] = &["rbx", "r12", "r13", "r14", "r15"];
const SYSV_CALLER_SAVED: &[&str] = &[
    "rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11",
];

// Microsoft x64: four register arguments and a 32-byte shadow area.
const WIN64_ARG_REGISTERS: &[&str] = &["rcx", "rdx", "r8", "r9"];
const WIN64_CALLEE_SAVED: &[&str] = &["rbx", "rsi", "rdi", "r12", "r13", "r14", "r15"];
const WIN64_CALLER_SAVED: &[&str] = &["rax", "rcx", "rdx", "r8", "r9", "r10", "r11"];

/// Read-only description of the compilation target.
///
/// All size and alignment queries in the type system go through this record;
/// the compiler itself never hard-codes data-layout facts.
#[derive(Debug, Clone)]
pub struct TargetDescription {
    /// Calling convention (also selects the object flavour).
    pub conv: CallConv,
    /// Pointer size in bytes.
    pub pointer_size: u64,
    /// Pointer alignment in bytes.
    pub pointer_align: u64,
    /// Whether plain `char` is signed in the source ABI.
    pub char_signed: bool,
    /// Size of the red zone below the stack pointer, in bytes.
    pub red_zone: u64,
}

impl TargetDescription {
    /// Target description for x86_64 with the given calling convention.
    pub fn x86_64(conv: CallConv) -> Self {
        Self {
            conv,
            pointer_size: 8,
            pointer_align: 8,
            char_signed: conv == CallConv::SysV,
            red_zone: match conv {
                CallConv::SysV => 128,
                CallConv::MsWin => 0,
            },
        }
    }

    /// Size in bytes of an integer with the given bit width.
    ///
    /// Widths are rounded up to a whole number of bytes; `i1` occupies one.
    pub fn int_size(&self, bits: u8) -> u64 {
        ((bits as u64) + 7) / 8
    }

    /// Alignment in bytes of an integer with the given bit width.
    ///
    /// x86_64 aligns integers naturally up to eight bytes.
    pub fn int_align(&self, bits: u8) -> u64 {
        self.int_size(bits).next_power_of_two().min(8)
    }

    /// Integer argument registers for `conv`, in parameter order.
    pub fn arg_registers(&self, conv: CallConv) -> &'static [&'static str] {
        match conv {
            CallConv::SysV => SYSV_ARG_REGISTERS,
            CallConv::MsWin => WIN64_ARG_REGISTERS,
        }
    }

    /// Registers the callee must preserve.
    pub fn callee_saved(&self, conv: CallConv) -> &'static [&'static str] {
        match conv {
            CallConv::SysV => SYSV_CALLEE_SAVED,
            CallConv::MsWin => WIN64_CALLEE_SAVED,
        }
    }

    /// Registers a call may clobber.
    pub fn caller_saved(&self, conv: CallConv) -> &'static [&'static str] {
        match conv {
            CallConv::SysV => SYSV_CALLER_SAVED,
            CallConv::MsWin => WIN64_CALLER_SAVED,
        }
    }

    /// Bytes of stack the caller must reserve below the arguments.
    ///
    /// Microsoft x64 requires a 32-byte shadow area for the four register
    /// parameters; System V has no equivalent.
    pub fn shadow_space(&self, conv: CallConv) -> u64 {
        match conv {
            CallConv::SysV => 0,
            CallConv::MsWin => 32,
        }
    }
}

impl Default for TargetDescription {
    fn default() -> Self {
        Self::x86_64(CallConv::SysV)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_layout() {
        let t = TargetDescription::default();
        assert_eq!(t.int_size(1), 1);
        assert_eq!(t.int_size(8), 1);
        assert_eq!(t.int_size(16), 2);
        assert_eq!(t.int_size(32), 4);
        assert_eq!(t.int_size(64), 8);
        assert_eq!(t.int_align(64), 8);
        assert_eq!(t.int_align(24), 4);
    }

    #[test]
    fn test_arg_registers() {
        let t = TargetDescription::default();
        assert_eq!(t.arg_registers(CallConv::SysV).len(), 6);
        assert_eq!(t.arg_registers(CallConv::MsWin).len(), 4);
        assert_eq!(t.arg_registers(CallConv::SysV)[0], "rdi");
        assert_eq!(t.arg_registers(CallConv::MsWin)[0], "rcx");
    }

    #[test]
    fn test_shadow_and_red_zone() {
        assert_eq!(TargetDescription::x86_64(CallConv::SysV).red_zone, 128);
        assert_eq!(TargetDescription::x86_64(CallConv::MsWin).red_zone, 0);
        let t = TargetDescription::default();
        assert_eq!(t.shadow_space(CallConv::MsWin), 32);
    }
}
