//! Module representation.
//!
//! A [`Module`] owns the type table, the string pool, all functions (defined
//! and external) and all static variables. Functions and globals are
//! addressed by dense handles; name lookup goes through insertion-ordered
//! maps so iteration is deterministic.

use indexmap::IndexMap;

use super::function::Function;
use super::intern::{StringInterner, Symbol};
use super::types::{TypeId, TypeTable};
use crate::target::CallConv;

/// Handle to a function owned by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a static variable owned by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(u32);

impl GlobalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Initial contents of a static variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalInit {
    /// Integer constant, stored with the width of the global's type.
    Int(i64),
    /// Raw bytes, typically string data.
    Bytes(Vec<u8>),
}

/// A static variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalData {
    pub name: Symbol,
    pub ty: TypeId,
    /// `None` for zero-initialised or external data.
    pub init: Option<GlobalInit>,
    /// Declared here, defined in another object.
    pub is_external: bool,
}

/// A complete IR module.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub types: TypeTable,
    pub strings: StringInterner,
    functions: Vec<Function>,
    func_by_name: IndexMap<Symbol, FuncId>,
    globals: Vec<GlobalData>,
    global_by_name: IndexMap<Symbol, GlobalId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: TypeTable::new(),
            strings: StringInterner::new(),
            functions: Vec::new(),
            func_by_name: IndexMap::new(),
            globals: Vec::new(),
            global_by_name: IndexMap::new(),
        }
    }

    // --- Functions ---

    /// Declare a function symbol. Bodies are filled in afterwards through
    /// the builder, so forward references between functions resolve.
    pub fn declare_function(&mut self, name: &str, ret_ty: TypeId, conv: CallConv) -> FuncId {
        let sym = self.strings.intern(name);
        if let Some(&id) = self.func_by_name.get(&sym) {
            return id;
        }
        let id = FuncId(self.functions.len() as u32);
        let mut func = Function::new(sym, ret_ty, conv);
        func.flags.is_global = true;
        self.functions.push(func);
        self.func_by_name.insert(sym, id);
        id
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn func_id(&self, name: &str) -> Option<FuncId> {
        let sym = self.strings.lookup(name)?;
        self.func_by_name.get(&sym).copied()
    }

    pub fn func_name(&self, id: FuncId) -> &str {
        self.strings.resolve(self.functions[id.index()].name)
    }

    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> + '_ {
        (0..self.functions.len() as u32).map(FuncId)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    // --- Globals ---

    /// Define a static variable.
    pub fn define_global(&mut self, name: &str, ty: TypeId, init: Option<GlobalInit>) -> GlobalId {
        self.add_global(name, ty, init, false)
    }

    /// Declare an external data symbol.
    pub fn declare_external_global(&mut self, name: &str, ty: TypeId) -> GlobalId {
        self.add_global(name, ty, None, true)
    }

    fn add_global(
        &mut self,
        name: &str,
        ty: TypeId,
        init: Option<GlobalInit>,
        is_external: bool,
    ) -> GlobalId {
        let sym = self.strings.intern(name);
        if let Some(&id) = self.global_by_name.get(&sym) {
            return id;
        }
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalData {
            name: sym,
            ty,
            init,
            is_external,
        });
        self.global_by_name.insert(sym, id);
        id
    }

    pub fn global(&self, id: GlobalId) -> &GlobalData {
        &self.globals[id.index()]
    }

    pub fn global_id(&self, name: &str) -> Option<GlobalId> {
        let sym = self.strings.lookup(name)?;
        self.global_by_name.get(&sym).copied()
    }

    pub fn global_name(&self, id: GlobalId) -> &str {
        self.strings.resolve(self.globals[id.index()].name)
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> + '_ {
        (0..self.globals.len() as u32).map(GlobalId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_function_idempotent() {
        let mut m = Module::new("m");
        let ret = m.types.int(32, true);
        let a = m.declare_function("f", ret, CallConv::SysV);
        let b = m.declare_function("f", ret, CallConv::SysV);
        assert_eq!(a, b);
        assert_eq!(m.function_count(), 1);
        assert_eq!(m.func_name(a), "f");
        assert_eq!(m.func_id("f"), Some(a));
        assert_eq!(m.func_id("g"), None);
    }

    #[test]
    fn test_globals() {
        let mut m = Module::new("m");
        let i64t = m.types.int(64, true);
        let g = m.define_global("counter", i64t, Some(GlobalInit::Int(10)));
        let e = m.declare_external_global("errno_location", i64t);
        assert_eq!(m.global_name(g), "counter");
        assert!(!m.global(g).is_external);
        assert!(m.global(e).is_external);
        assert_eq!(m.global_id("counter"), Some(g));
    }
}
