//! Machine IR functions, blocks and modules.

use indexmap::IndexMap;
use std::fmt;

use super::instruction::Instruction;
use super::register::Register;
use super::types::MirType;
use crate::target::CallConv;

/// Function parameter bound to a virtual register.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub reg: Register,
    pub ty: MirType,
}

/// Function signature.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub name: String,
    pub params: Vec<Parameter>,
    /// `None` for void.
    pub ret_ty: Option<MirType>,
    pub conv: CallConv,
}

impl Signature {
    pub fn new(name: impl Into<String>, conv: CallConv) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret_ty: None,
            conv,
        }
    }
}

/// A stack slot reserved in the function frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub size: u64,
    pub align: u64,
}

/// Basic block: a label and an instruction list whose last element is a
/// terminator once the block is complete.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: String,
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, instr: Instruction) {
        self.instructions.push(instr);
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.is_terminator())
    }

    pub fn has_terminator(&self) -> bool {
        self.terminator().is_some()
    }

    /// Successor block labels.
    pub fn successors(&self) -> Vec<&str> {
        match self.terminator() {
            Some(Instruction::Jmp { target }) => vec![target.as_str()],
            Some(Instruction::Br {
                true_target,
                false_target,
                ..
            }) => vec![true_target.as_str(), false_target.as_str()],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for instr in &self.instructions {
            writeln!(f, "  {}", instr)?;
        }
        Ok(())
    }
}

/// Machine IR function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub sig: Signature,
    pub blocks: Vec<Block>,
    pub frame: Vec<FrameSlot>,
}

impl Function {
    pub fn new(sig: Signature) -> Self {
        Self {
            sig,
            blocks: Vec::new(),
            frame: Vec::new(),
        }
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn get_block(&self, label: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.label == label)
    }

    pub fn get_block_mut(&mut self, label: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.label == label)
    }

    /// Reserve a frame slot, returning its index.
    pub fn add_frame_slot(&mut self, size: u64, align: u64) -> u32 {
        self.frame.push(FrameSlot { size, align });
        (self.frame.len() - 1) as u32
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instructions.len()).sum()
    }

    /// Highest virtual register id in use, counting parameters.
    pub fn max_vreg_id(&self) -> u32 {
        let mut max = 0;
        let mut see = |r: &Register| {
            if let Register::Virtual(v) = r {
                max = max.max(v.id);
            }
        };
        for p in &self.sig.params {
            see(&p.reg);
        }
        for block in &self.blocks {
            for inst in &block.instructions {
                inst.for_each_reg(&mut see);
            }
        }
        max
    }

    /// Structural sanity: unique labels and a terminator per block.
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err(format!("function '{}' has no blocks", self.sig.name));
        }
        let mut seen = std::collections::HashSet::new();
        for block in &self.blocks {
            if !seen.insert(&block.label) {
                return Err(format!("duplicate block label: {}", block.label));
            }
            if !block.has_terminator() {
                return Err(format!("block '{}' has no terminator", block.label));
            }
            for succ in block.successors() {
                if self.get_block(succ).is_none() {
                    return Err(format!(
                        "block '{}' branches to unknown label '{}'",
                        block.label, succ
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn {}(", self.sig.name)?;
        for (i, p) in self.sig.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", p.reg, p.ty)?;
        }
        write!(f, ")")?;
        if let Some(ret) = &self.sig.ret_ty {
            write!(f, " -> {}", ret)?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        write!(f, "}}")
    }
}

/// Data symbol lowered from an IR global.
#[derive(Debug, Clone, PartialEq)]
pub struct DataDef {
    pub name: String,
    pub size: u64,
    pub align: u64,
    /// `None` goes to `.bss`.
    pub bytes: Option<Vec<u8>>,
}

/// Machine IR module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: IndexMap<String, Function>,
    pub data: Vec<DataDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: IndexMap::new(),
            data: Vec::new(),
        }
    }

    pub fn add_function(&mut self, func: Function) {
        self.functions.insert(func.sig.name.clone(), func);
    }

    pub fn validate(&self) -> Result<(), String> {
        for func in self.functions.values() {
            func.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::instruction::{Instruction, Operand};
    use crate::mir::register::VirtualReg;

    #[test]
    fn test_block_successors() {
        let mut b = Block::new("entry");
        b.push(Instruction::Br {
            cond: VirtualReg::new(0).into(),
            true_target: "a".to_string(),
            false_target: "b".to_string(),
        });
        assert!(b.has_terminator());
        assert_eq!(b.successors(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_rejects_unknown_target() {
        let mut f = Function::new(Signature::new("f", CallConv::SysV));
        let mut b = Block::new("entry");
        b.push(Instruction::Jmp {
            target: "missing".to_string(),
        });
        f.add_block(b);
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_simple_function() {
        let mut f = Function::new(Signature::new("f", CallConv::SysV));
        let mut b = Block::new("entry");
        b.push(Instruction::Ret {
            value: Some((MirType::I64, Operand::Immediate(0))),
        });
        f.add_block(b);
        f.validate().unwrap();
        assert_eq!(f.instruction_count(), 1);
    }
}
