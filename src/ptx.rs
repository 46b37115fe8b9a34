//! Assembly of inline PTX snippets.

use crate::ir::{FuncBuilder, Value};
use crate::types::Ty;
use itertools::Itertools;
use std::fmt;

/// Collects PTX instructions and their register operands, then emits them as a single inline
/// assembly call.
#[derive(Debug, Default)]
pub struct PtxBuilder {
    instrs: Vec<PtxInstr>,
    args: Vec<(Value, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtxInstr {
    opcode: String,
    operands: Vec<PtxOperand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtxOperand {
    /// An immediate, written into the assembly text.
    Constant(String),
    /// The `n`th bound argument, referenced as `$n`.
    Arg(usize),
}

impl PtxBuilder {
    pub fn new() -> Self {
        PtxBuilder::default()
    }

    /// Binds `value` as an assembly argument with the given constraint (e.g. `"r"`).
    pub fn new_operand(&mut self, value: Value, constraint: impl Into<String>) -> PtxOperand {
        self.args.push((value, constraint.into()));
        PtxOperand::Arg(self.args.len() - 1)
    }

    /// An immediate, rendered in hexadecimal.
    pub fn new_constant_operand(&self, value: u64) -> PtxOperand {
        PtxOperand::Constant(format!("{value:#x}"))
    }

    pub fn create(&mut self, opcode: impl Into<String>) -> &mut PtxInstr {
        self.instrs.push(PtxInstr {
            opcode: opcode.into(),
            operands: vec![],
        });
        self.instrs.last_mut().unwrap()
    }

    pub fn asm_text(&self) -> String {
        self.instrs.iter().join("\n")
    }

    pub fn constraints(&self) -> String {
        self.args.iter().map(|(_, c)| c.as_str()).join(",")
    }

    /// Emits the collected instructions as one side-effecting inline assembly call.
    pub fn launch(self, builder: &mut FuncBuilder, ret: Ty) -> Option<Value> {
        let asm = self.asm_text();
        let constraints = self.constraints();
        let operands = self.args.into_iter().map(|(v, _)| v).collect();
        log::trace!("launching inline PTX: {asm}");
        builder.inline_asm(asm, constraints, operands, true, ret)
    }
}

impl PtxInstr {
    pub fn push(&mut self, operand: PtxOperand) -> &mut Self {
        self.operands.push(operand);
        self
    }
}

impl fmt::Display for PtxOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PtxOperand::Constant(text) => write!(f, "{text}"),
            PtxOperand::Arg(idx) => write!(f, "${idx}"),
        }
    }
}

impl fmt::Display for PtxInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if !self.operands.is_empty() {
            write!(f, " {}", self.operands.iter().join(", "))?;
        }
        write!(f, ";")
    }
}
