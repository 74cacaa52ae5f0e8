//! Per-module string interning.
//!
//! Symbol names, global initialiser text and other byte strings are interned
//! once per module; the rest of the compiler passes around stable [`Symbol`]
//! handles instead of owned strings.

use indexmap::IndexSet;
use std::fmt;

/// Stable handle into a module's string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sym{}", self.0)
    }
}

/// Interning table. Insertion order is stable, so symbols are deterministic
/// across runs for identical input.
#[derive(Debug, Clone, Default)]
pub struct StringInterner {
    strings: IndexSet<String>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning the existing handle if already present.
    pub fn intern(&mut self, s: &str) -> Symbol {
        if let Some(idx) = self.strings.get_index_of(s) {
            return Symbol(idx as u32);
        }
        let (idx, _) = self.strings.insert_full(s.to_string());
        Symbol(idx as u32)
    }

    /// Look up a string without interning it.
    pub fn lookup(&self, s: &str) -> Option<Symbol> {
        self.strings.get_index_of(s).map(|idx| Symbol(idx as u32))
    }

    /// Resolve a handle back to its string.
    pub fn resolve(&self, sym: Symbol) -> &str {
        self.strings
            .get_index(sym.index())
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let mut pool = StringInterner::new();
        let a = pool.intern("main");
        let b = pool.intern("helper");
        let c = pool.intern("main");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_resolve() {
        let mut pool = StringInterner::new();
        let sym = pool.intern("puts");
        assert_eq!(pool.resolve(sym), "puts");
    }
}
