//! # IR Builder
//!
//! Cursor-style construction API used by frontends. The builder keeps a
//! current block; `emit_*` methods append to it and branching emits close
//! it. Emitting into a closed (or absent) block is rejected, which enforces
//! the one-terminator-per-block discipline at construction time rather than
//! leaving it for the verifier.
//!
//! ## Example
//!
//! ```rust
//! use basalt::ir::{IrBuilder, Module};
//! use basalt::ir::instruction::BinaryOp;
//! use basalt::target::CallConv;
//!
//! let mut module = Module::new("demo");
//! let i32t = module.types.int(32, true);
//! let f = module.declare_function("add_one", i32t, CallConv::SysV);
//! let mut b = IrBuilder::new(&mut module, f);
//! let x = b.add_param(i32t);
//! let entry = b.create_block();
//! b.set_block(entry);
//! let one = b.emit_imm(1, i32t).unwrap();
//! let sum = b.emit_binary(BinaryOp::Add, x, one).unwrap();
//! b.emit_return(Some(sum)).unwrap();
//! ```

use crate::error::{BasaltError, Result};

use super::function::Function;
use super::instruction::{
    BinaryOp, BlockId, Callee, CastOp, CmpOp, InstData, InstKind, SourceLoc, ValueId,
};
use super::module::{FuncId, GlobalId, Module};
use super::types::{TypeId, TypeKind};

/// Builder over one function of a module.
pub struct IrBuilder<'m> {
    module: &'m mut Module,
    func: FuncId,
    block: Option<BlockId>,
    loc: Option<SourceLoc>,
}

impl<'m> IrBuilder<'m> {
    pub fn new(module: &'m mut Module, func: FuncId) -> Self {
        Self {
            module,
            func,
            block: None,
            loc: None,
        }
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    pub fn func_id(&self) -> FuncId {
        self.func
    }

    fn f(&self) -> &Function {
        self.module.function(self.func)
    }

    fn f_mut(&mut self) -> &mut Function {
        self.module.function_mut(self.func)
    }

    /// Source position attached to subsequently emitted instructions.
    pub fn set_loc(&mut self, line: u32, column: u32) {
        self.loc = Some(SourceLoc { line, column });
    }

    pub fn add_param(&mut self, ty: TypeId) -> ValueId {
        self.f_mut().add_param(ty)
    }

    pub fn create_block(&mut self) -> BlockId {
        self.f_mut().create_block()
    }

    /// Make `b` the insertion point.
    pub fn set_block(&mut self, b: BlockId) {
        self.block = Some(b);
    }

    pub fn current_block(&self) -> Option<BlockId> {
        self.block
    }

    /// True iff `b` already ends in a terminator.
    pub fn closes_block(&self, b: BlockId) -> bool {
        self.f().closes_block(b)
    }

    fn emit(&mut self, kind: InstKind, ty: TypeId) -> Result<ValueId> {
        let b = self.block.ok_or_else(|| {
            BasaltError::BuilderError("no current block to emit into".to_string())
        })?;
        if self.f().closes_block(b) {
            return Err(BasaltError::BuilderError(format!(
                "block {} is closed; attach a new block before emitting",
                b
            )));
        }
        let mut data = InstData::new(kind, ty);
        data.loc = self.loc;
        Ok(self.f_mut().push_inst(b, data))
    }

    // --- Constants ---

    pub fn emit_imm(&mut self, value: i64, ty: TypeId) -> Result<ValueId> {
        if !self.module.types.is_integer(ty) && !self.module.types.is_bool(ty) {
            return Err(BasaltError::BuilderError(format!(
                "immediate requires an integer or bool type, got {}",
                self.module.types.display(ty)
            )));
        }
        self.emit(InstKind::Immediate { value }, ty)
    }

    /// Address of a static variable; the result is a pointer to its type.
    pub fn emit_static_ref(&mut self, global: GlobalId) -> Result<ValueId> {
        let ty = self.module.global(global).ty;
        let ptr = self.module.types.pointer(ty);
        self.emit(InstKind::StaticRef { global }, ptr)
    }

    /// Address of a function; the result is a pointer to its function type.
    pub fn emit_func_ref(&mut self, func: FuncId) -> Result<ValueId> {
        let fnty = self.function_type_of(func);
        let ptr = self.module.types.pointer(fnty);
        self.emit(InstKind::FuncRef { func }, ptr)
    }

    fn function_type_of(&mut self, func: FuncId) -> TypeId {
        let f = self.module.function(func);
        let ret = f.ret_ty;
        let conv = f.conv;
        let params: Vec<TypeId> = f.params().iter().map(|&p| f.ty(p)).collect();
        self.module.types.function(ret, params, false, conv)
    }

    // --- Memory ---

    pub fn emit_alloca(&mut self, allocated: TypeId) -> Result<ValueId> {
        let ptr = self.module.types.pointer(allocated);
        self.emit(InstKind::Alloca { allocated }, ptr)
    }

    pub fn emit_load(&mut self, addr: ValueId) -> Result<ValueId> {
        let addr_ty = self.f().ty(addr);
        let pointee = self.module.types.pointee(addr_ty).ok_or_else(|| {
            BasaltError::BuilderError(format!(
                "load address must be a pointer, got {}",
                self.module.types.display(addr_ty)
            ))
        })?;
        self.emit(InstKind::Load { addr }, pointee)
    }

    pub fn emit_store(&mut self, value: ValueId, addr: ValueId) -> Result<ValueId> {
        let addr_ty = self.f().ty(addr);
        let pointee = self.module.types.pointee(addr_ty).ok_or_else(|| {
            BasaltError::BuilderError(format!(
                "store address must be a pointer, got {}",
                self.module.types.display(addr_ty)
            ))
        })?;
        if self.f().ty(value) != pointee {
            return Err(BasaltError::BuilderError(
                "stored value does not match pointee type".to_string(),
            ));
        }
        let void = self.module.types.void();
        self.emit(InstKind::Store { value, addr }, void)
    }

    // --- Arithmetic and comparison ---

    pub fn emit_binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let ty = self.f().ty(lhs);
        if self.f().ty(rhs) != ty {
            return Err(BasaltError::BuilderError(format!(
                "operand types of {} differ",
                op
            )));
        }
        self.emit(InstKind::Binary { op, lhs, rhs }, ty)
    }

    pub fn emit_not(&mut self, value: ValueId) -> Result<ValueId> {
        let ty = self.f().ty(value);
        self.emit(InstKind::Not { value }, ty)
    }

    pub fn emit_cmp(&mut self, op: CmpOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        if self.f().ty(lhs) != self.f().ty(rhs) {
            return Err(BasaltError::BuilderError(format!(
                "operand types of {} differ",
                op
            )));
        }
        let b = self.module.types.bool_ty();
        self.emit(InstKind::Cmp { op, lhs, rhs }, b)
    }

    pub fn emit_cast(&mut self, op: CastOp, value: ValueId, to: TypeId) -> Result<ValueId> {
        self.emit(InstKind::Cast { op, value }, to)
    }

    // --- Control flow ---

    pub fn emit_branch(&mut self, target: BlockId) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(InstKind::Branch { target }, void)
    }

    pub fn emit_cond_branch(
        &mut self,
        cond: ValueId,
        then_dest: BlockId,
        else_dest: BlockId,
    ) -> Result<ValueId> {
        if !self.module.types.is_bool(self.f().ty(cond)) {
            return Err(BasaltError::BuilderError(
                "branch condition must be bool".to_string(),
            ));
        }
        let void = self.module.types.void();
        self.emit(
            InstKind::CondBranch {
                cond,
                then_dest,
                else_dest,
            },
            void,
        )
    }

    pub fn emit_return(&mut self, value: Option<ValueId>) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(InstKind::Return { value }, void)
    }

    pub fn emit_unreachable(&mut self) -> Result<ValueId> {
        let void = self.module.types.void();
        self.emit(InstKind::Unreachable, void)
    }

    /// Emit a phi. Incoming pairs may name values defined later; the
    /// verifier checks them once the function is complete.
    pub fn emit_phi(&mut self, ty: TypeId, incoming: Vec<(BlockId, ValueId)>) -> Result<ValueId> {
        self.emit(InstKind::Phi { incoming }, ty)
    }

    // --- Calls ---

    pub fn emit_call(&mut self, callee: FuncId, args: Vec<ValueId>) -> Result<ValueId> {
        let ret = self.module.function(callee).ret_ty;
        self.emit(
            InstKind::Call {
                callee: Callee::Direct(callee),
                args,
                tail: false,
            },
            ret,
        )
    }

    /// Call through a function pointer. A single level of pointer-to-function
    /// indirection is expected on `target`.
    pub fn emit_call_indirect(&mut self, target: ValueId, args: Vec<ValueId>) -> Result<ValueId> {
        let target_ty = self.f().ty(target);
        let pointee = self.module.types.pointee(target_ty).ok_or_else(|| {
            BasaltError::BuilderError("indirect call target must be a function pointer".to_string())
        })?;
        let ret = match self.module.types.kind(pointee) {
            TypeKind::Function { ret, .. } => *ret,
            _ => {
                return Err(BasaltError::BuilderError(
                    "indirect call target must point to a function type".to_string(),
                ))
            }
        };
        self.emit(
            InstKind::Call {
                callee: Callee::Indirect(target),
                args,
                tail: false,
            },
            ret,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::InstKind;
    use crate::target::CallConv;

    fn new_module() -> Module {
        Module::new("test")
    }

    #[test]
    fn test_emit_requires_open_block() {
        let mut m = new_module();
        let i32t = m.types.int(32, true);
        let f = m.declare_function("f", i32t, CallConv::SysV);
        let mut b = IrBuilder::new(&mut m, f);
        assert!(b.emit_imm(1, i32t).is_err());

        let entry = b.create_block();
        b.set_block(entry);
        let v = b.emit_imm(1, i32t).unwrap();
        b.emit_return(Some(v)).unwrap();
        assert!(b.closes_block(entry));

        // The block is closed; further emission is rejected.
        assert!(b.emit_imm(2, i32t).is_err());
    }

    #[test]
    fn test_load_store_types() {
        let mut m = new_module();
        let i32t = m.types.int(32, true);
        let void = m.types.void();
        let f = m.declare_function("f", void, CallConv::SysV);
        let mut b = IrBuilder::new(&mut m, f);
        let entry = b.create_block();
        b.set_block(entry);
        let slot = b.emit_alloca(i32t).unwrap();
        let v = b.emit_imm(7, i32t).unwrap();
        b.emit_store(v, slot).unwrap();
        let loaded = b.emit_load(slot).unwrap();
        b.emit_return(None).unwrap();

        let func = m.function(f);
        assert_eq!(func.ty(loaded), i32t);
        assert!(matches!(func.kind(slot), InstKind::Alloca { .. }));
        // Loading through a non-pointer is rejected.
    }

    #[test]
    fn test_call_types() {
        let mut m = new_module();
        let i32t = m.types.int(32, true);
        let callee = m.declare_function("callee", i32t, CallConv::SysV);
        {
            let mut b = IrBuilder::new(&mut m, callee);
            let entry = b.create_block();
            b.set_block(entry);
            let v = b.emit_imm(42, i32t).unwrap();
            b.emit_return(Some(v)).unwrap();
        }
        let caller = m.declare_function("caller", i32t, CallConv::SysV);
        let mut b = IrBuilder::new(&mut m, caller);
        let entry = b.create_block();
        b.set_block(entry);
        let c = b.emit_call(callee, vec![]).unwrap();
        b.emit_return(Some(c)).unwrap();
        assert_eq!(m.function(caller).ty(c), i32t);
    }

    #[test]
    fn test_source_locations_attach() {
        let mut m = new_module();
        let i32t = m.types.int(32, true);
        let f = m.declare_function("f", i32t, CallConv::SysV);
        let mut b = IrBuilder::new(&mut m, f);
        let entry = b.create_block();
        b.set_block(entry);
        b.set_loc(3, 7);
        let v = b.emit_imm(1, i32t).unwrap();
        b.emit_return(Some(v)).unwrap();
        let loc = m.function(f).loc(v).unwrap();
        assert_eq!((loc.line, loc.column), (3, 7));
    }
}
