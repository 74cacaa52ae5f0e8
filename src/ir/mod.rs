//! # SSA Intermediate Representation
//!
//! The shared middle-end IR every frontend lowers into. A module owns its
//! type table, string pool, functions and static variables; functions own
//! dense instruction and block arenas addressed by handles. Instructions
//! carry bidirectional use/def links maintained by the mutation helpers on
//! [`Function`].
//!
//! Construction goes through [`IrBuilder`]; the invariants are stated and
//! enforced by [`verifier`]. The [`printer`] module renders the textual
//! format accepted by [`crate::parser`].

pub mod builder;
pub mod dom;
pub mod function;
pub mod instruction;
pub mod intern;
pub mod module;
pub mod printer;
pub mod types;
pub mod verifier;

pub use builder::IrBuilder;
pub use function::{Function, FunctionFlags};
pub use instruction::{
    BinaryOp, BlockId, Callee, CastOp, CmpOp, InstData, InstKind, SourceLoc, ValueId,
};
pub use intern::{StringInterner, Symbol};
pub use module::{FuncId, GlobalData, GlobalId, GlobalInit, Module};
pub use types::{TypeId, TypeKind, TypeTable};
