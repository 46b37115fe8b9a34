//! A small SSA instruction set for per-thread code.
//!
//! Values are numbered per [Function]. Module-level symbols (globals, external declarations, and
//! lowered functions) live in a [Module]'s ordered symbol table.

mod builder;

pub use builder::{Checkpoint, FuncBuilder};

use crate::types::Ty;
use indexmap::IndexMap;
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub(crate) u32);

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    Null,
    Undef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BinOp {
    Add,
    Mul,
    UDiv,
    URem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CastOp {
    SExt,
    ZExt,
    FPExt,
    Bitcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

/// A hardware register read by a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    ThreadIdX,
    BlockId(Axis),
    GridDim(Axis),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Const(ConstValue),
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Cast {
        op: CastOp,
        value: Value,
    },
    /// Address arithmetic: `base` advanced by `indices`, scaled by the pointee type.
    Gep {
        base: Value,
        indices: Vec<Value>,
    },
    ExtractValue {
        aggregate: Value,
        index: u32,
    },
    InsertValue {
        aggregate: Value,
        value: Value,
        index: u32,
    },
    Alloca {
        elem: Ty,
        count: Value,
        align: u32,
    },
    Store {
        value: Value,
        ptr: Value,
    },
    AddressOf {
        global: String,
    },
    Call {
        callee: String,
        args: Vec<Value>,
    },
    InlineAsm {
        asm: String,
        constraints: String,
        operands: Vec<Value>,
        side_effects: bool,
    },
    ReadReg(SpecialReg),
    Return {
        values: Vec<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub result: Option<Value>,
    /// The result type, or [Ty::Void] for instructions without a result.
    pub ty: Ty,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Value>,
    pub ret: Ty,
    pub body: Vec<Inst>,
    pub attrs: Vec<(String, String)>,
    value_types: Vec<Ty>,
    defs: HashMap<Value, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Linkage {
    Internal,
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub ty: Ty,
    pub addr_space: u32,
    pub constant: bool,
    pub linkage: Linkage,
    pub init: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncDecl {
    pub name: String,
    /// Always a [Ty::Func].
    pub ty: Ty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Global(Global),
    Decl(FuncDecl),
    Func(Function),
}

/// An ordered symbol table.
#[derive(Debug, Clone, Default)]
pub struct Module {
    symbols: IndexMap<String, Symbol>,
}

impl Value {
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl Axis {
    pub fn from_index(axis: u32) -> Option<Axis> {
        match axis {
            0 => Some(Axis::X),
            1 => Some(Axis::Y),
            2 => Some(Axis::Z),
            _ => None,
        }
    }
}

impl Display for SpecialReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialReg::ThreadIdX => write!(f, "tid.x"),
            SpecialReg::BlockId(axis) => write!(f, "ctaid.{axis}"),
            SpecialReg::GridDim(axis) => write!(f, "nctaid.{axis}"),
        }
    }
}

impl InstKind {
    /// The values this instruction reads.
    pub fn operands(&self) -> SmallVec<[Value; 4]> {
        match self {
            InstKind::Const(_) | InstKind::AddressOf { .. } | InstKind::ReadReg(_) => smallvec![],
            InstKind::Binary { lhs, rhs, .. } => smallvec![*lhs, *rhs],
            InstKind::Cast { value, .. } => smallvec![*value],
            InstKind::Gep { base, indices } => {
                let mut ops = smallvec![*base];
                ops.extend(indices.iter().copied());
                ops
            }
            InstKind::ExtractValue { aggregate, .. } => smallvec![*aggregate],
            InstKind::InsertValue {
                aggregate, value, ..
            } => smallvec![*aggregate, *value],
            InstKind::Alloca { count, .. } => smallvec![*count],
            InstKind::Store { value, ptr } => smallvec![*value, *ptr],
            InstKind::Call { args, .. } => args.iter().copied().collect(),
            InstKind::InlineAsm { operands, .. } => operands.iter().copied().collect(),
            InstKind::Return { values } => values.iter().copied().collect(),
        }
    }
}

impl Function {
    pub fn ty(&self, value: Value) -> &Ty {
        &self.value_types[usize::try_from(value.0).unwrap()]
    }

    /// Returns the instruction defining `value`, or `None` for parameters.
    pub fn def(&self, value: Value) -> Option<&Inst> {
        self.defs.get(&value).map(|&idx| &self.body[idx])
    }

    pub fn param_types(&self) -> impl Iterator<Item = &Ty> + '_ {
        self.params.iter().map(|p| self.ty(*p))
    }

    pub fn func_type(&self) -> Ty {
        Ty::func(self.ret.clone(), self.param_types().cloned().collect())
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the instructions of the given kind, in program order.
    pub fn insts_matching<'a, F>(&'a self, mut pred: F) -> impl Iterator<Item = &'a Inst> + 'a
    where
        F: FnMut(&InstKind) -> bool + 'a,
    {
        self.body.iter().filter(move |inst| pred(&inst.kind))
    }
}

#[cfg(test)]
impl Function {
    /// Evaluates an integer expression, taking the values of non-constant leaves from `env`.
    pub(crate) fn eval_int(
        &self,
        value: Value,
        env: &impl Fn(Value) -> Option<i64>,
    ) -> Option<i64> {
        if let Some(x) = env(value) {
            return Some(x);
        }
        match &self.def(value)?.kind {
            InstKind::Const(ConstValue::Int(x)) => Some(*x),
            InstKind::Binary { op, lhs, rhs } => {
                let (a, b) = (self.eval_int(*lhs, env)?, self.eval_int(*rhs, env)?);
                match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::UDiv => a.checked_div(b),
                    BinOp::URem => a.checked_rem(b),
                }
            }
            _ => None,
        }
    }
}

impl Global {
    /// The type of the global's address.
    pub fn ptr_ty(&self) -> Ty {
        Ty::ptr(self.ty.clone(), self.addr_space)
    }
}

impl FuncDecl {
    pub fn ret_ty(&self) -> &Ty {
        match &self.ty {
            Ty::Func { ret, .. } => ret,
            _ => unreachable!("FuncDecl with non-function type {}", self.ty),
        }
    }
}

impl Symbol {
    pub fn name(&self) -> &str {
        match self {
            Symbol::Global(g) => &g.name,
            Symbol::Decl(d) => &d.name,
            Symbol::Func(f) => &f.name,
        }
    }
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> + '_ {
        self.symbols.values()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        match self.lookup(name)? {
            Symbol::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        match self.lookup(name)? {
            Symbol::Global(g) => Some(g),
            _ => None,
        }
    }

    /// Inserts `symbol` at the start of the module.
    ///
    /// Returns `false`, leaving the module unchanged, if the name is already taken.
    pub fn insert_front(&mut self, symbol: Symbol) -> bool {
        if self.contains(symbol.name()) {
            return false;
        }
        self.symbols
            .shift_insert(0, symbol.name().to_string(), symbol);
        true
    }

    /// Appends `symbol` to the end of the module.
    ///
    /// Returns `false`, leaving the module unchanged, if the name is already taken.
    pub fn push(&mut self, symbol: Symbol) -> bool {
        if self.contains(symbol.name()) {
            return false;
        }
        self.symbols.insert(symbol.name().to_string(), symbol);
        true
    }

    /// Returns `<prefix><N>` for the smallest `N` not already naming a symbol.
    pub fn unique_name(&self, prefix: &str) -> String {
        let mut n: u64 = 0;
        loop {
            let candidate = format!("{prefix}{n}");
            if !self.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}
