//! # Machine IR
//!
//! A low-level, three-address layer between the SSA IR and instruction
//! selection. Assembly-like, with virtual registers, explicit frame slots
//! and string block labels.
//!
//! Types
//!   i8 | i16 | i32 | i64 | ptr | i1
//!
//! Registers
//!   Virtual regs v0, v1, ... before allocation; physical regs appear only
//!   after register allocation.
//!
//! Core ops
//!   int  : add/sub/mul/udiv/sdiv/urem/srem/and/or/xor/not/shl/lshr/ashr
//!   cmp  : cmp.{eq,ne,ult,ule,ugt,uge,slt,sle,sgt,sge} -> i1
//!   conv : zext/sext/trunc, copy
//!   mem  : ld.<ty> dst, [addr] | st.<ty> src, [addr] | lea dst, addr
//!   ctrl : jmp, br, call, tailcall, ret, unreachable, phi
//!
//! Phis survive lowering and are removed by [`lower::eliminate_phis`]
//! before instruction selection.

pub mod function;
pub mod instruction;
pub mod lower;
pub mod register;
pub mod types;

pub use function::{Block, FrameSlot, Function, Module, Parameter, Signature};
pub use instruction::{Address, CallTarget, Convert, Instruction, IntBinOp, IntCmpOp, Operand};
pub use register::{Register, VirtualReg, VirtualRegAllocator};
pub use types::MirType;
