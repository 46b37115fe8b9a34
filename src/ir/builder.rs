use super::{
    BinOp, CastOp, ConstValue, FuncDecl, Function, Global, Inst, InstKind, SpecialReg, Value,
};
use crate::types::{FloatKind, Signedness, Ty};
use std::collections::{HashMap, HashSet};

/// Appends instructions to a single [Function].
///
/// Integer arithmetic and casts over constants are folded as they are built, and `extractvalue`
/// of a field set by a visible `insertvalue` resolves to the inserted value.
#[derive(Debug)]
pub struct FuncBuilder {
    func: Function,
}

/// A position in a [FuncBuilder] to which it can be rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    body_len: usize,
    value_count: usize,
}

impl FuncBuilder {
    pub fn new(name: impl Into<String>, param_tys: impl IntoIterator<Item = Ty>, ret: Ty) -> Self {
        let mut func = Function {
            name: name.into(),
            params: vec![],
            ret,
            body: vec![],
            attrs: vec![],
            value_types: vec![],
            defs: HashMap::new(),
        };
        for ty in param_tys {
            let v = Value(u32::try_from(func.value_types.len()).unwrap());
            func.value_types.push(ty);
            func.params.push(v);
        }
        FuncBuilder { func }
    }

    pub fn function(&self) -> &Function {
        &self.func
    }

    pub fn params(&self) -> &[Value] {
        &self.func.params
    }

    pub fn ty(&self, value: Value) -> &Ty {
        self.func.ty(value)
    }

    pub fn def(&self, value: Value) -> Option<&Inst> {
        self.func.def(value)
    }

    pub fn as_const(&self, value: Value) -> Option<&ConstValue> {
        match &self.def(value)?.kind {
            InstKind::Const(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_const_int(&self, value: Value) -> Option<i64> {
        match self.as_const(value)? {
            ConstValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.func.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.func.attrs.push((key, value)),
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            body_len: self.func.body.len(),
            value_count: self.func.value_types.len(),
        }
    }

    /// Discards every instruction and value created since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        debug_assert!(checkpoint.value_count >= self.func.params.len());
        self.func.body.truncate(checkpoint.body_len);
        self.func.value_types.truncate(checkpoint.value_count);
        self.func
            .defs
            .retain(|_, idx| *idx < checkpoint.body_len);
    }

    /// Returns `true` if the last instruction is a return.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.func.body.last(),
            Some(Inst {
                kind: InstKind::Return { .. },
                ..
            })
        )
    }

    /// Drops unused constants and returns the finished function.
    pub fn finish(mut self) -> Function {
        let used: HashSet<Value> = self
            .func
            .body
            .iter()
            .flat_map(|inst| inst.kind.operands())
            .collect();
        self.func.body.retain(|inst| match (&inst.kind, inst.result) {
            (InstKind::Const(_), Some(v)) => used.contains(&v),
            _ => true,
        });
        self.func.defs = self
            .func
            .body
            .iter()
            .enumerate()
            .filter_map(|(idx, inst)| inst.result.map(|v| (v, idx)))
            .collect();
        self.func
    }

    fn push(&mut self, ty: Ty, kind: InstKind) -> Value {
        let v = Value(u32::try_from(self.func.value_types.len()).unwrap());
        self.func.value_types.push(ty.clone());
        self.func.defs.insert(v, self.func.body.len());
        self.func.body.push(Inst {
            result: Some(v),
            ty,
            kind,
        });
        v
    }

    fn push_void(&mut self, kind: InstKind) {
        self.func.body.push(Inst {
            result: None,
            ty: Ty::Void,
            kind,
        });
    }

    pub fn const_int(&mut self, ty: Ty, value: i64) -> Value {
        let normalized = match &ty {
            Ty::Int { bits, signedness } => normalize_int(value, *bits, *signedness),
            _ => unreachable!("integer constant of type {ty}"),
        };
        self.push(ty, InstKind::Const(ConstValue::Int(normalized)))
    }

    pub fn i32_const(&mut self, value: i32) -> Value {
        self.const_int(Ty::i32(), value.into())
    }

    /// Builds a float constant, rounded to the precision of `kind`.
    pub fn const_float(&mut self, kind: FloatKind, value: f64) -> Value {
        let rounded = match kind {
            FloatKind::Bf16 => half::bf16::from_f64(value).to_f64(),
            FloatKind::F16 => half::f16::from_f64(value).to_f64(),
            FloatKind::F32 => f64::from(value as f32),
            FloatKind::F64 => value,
        };
        self.push(Ty::Float(kind), InstKind::Const(ConstValue::Float(rounded)))
    }

    pub fn null(&mut self, ty: Ty) -> Value {
        debug_assert!(ty.is_ptr());
        self.push(ty, InstKind::Const(ConstValue::Null))
    }

    pub fn undef(&mut self, ty: Ty) -> Value {
        self.push(ty, InstKind::Const(ConstValue::Undef))
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.ty(lhs).clone();
        debug_assert_eq!(&ty, self.ty(rhs));
        let bits = match &ty {
            Ty::Int { bits, .. } => Some(*bits),
            _ => None,
        };
        if let (Some(a), Some(b), Some(bits)) =
            (self.as_const_int(lhs), self.as_const_int(rhs), bits)
        {
            if let Some(folded) = fold_binary(op, a, b, bits) {
                return self.const_int(ty, folded);
            }
        }
        self.push(ty, InstKind::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn udiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::UDiv, lhs, rhs)
    }

    pub fn urem(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinOp::URem, lhs, rhs)
    }

    /// Builds `Σ lhs[i] * rhs[i]` over `i32`, starting from the constant zero.
    pub fn dot(&mut self, lhs: &[Value], rhs: &[Value]) -> Value {
        debug_assert_eq!(lhs.len(), rhs.len());
        let mut acc = self.i32_const(0);
        for (&a, &b) in lhs.iter().zip(rhs) {
            let product = self.mul(a, b);
            acc = self.add(acc, product);
        }
        acc
    }

    pub fn gep(&mut self, result_ty: Ty, base: Value, indices: Vec<Value>) -> Value {
        debug_assert!(self.ty(base).is_ptr());
        self.push(result_ty, InstKind::Gep { base, indices })
    }

    pub fn extract_value(&mut self, aggregate: Value, index: u32) -> Value {
        let mut cursor = aggregate;
        loop {
            match self.def(cursor).map(|inst| &inst.kind) {
                Some(InstKind::InsertValue {
                    aggregate: inner,
                    value,
                    index: inserted_at,
                }) => {
                    if *inserted_at == index {
                        return *value;
                    }
                    cursor = *inner;
                }
                _ => break,
            }
        }
        let agg_ty = self.ty(aggregate);
        let Some(field_ty) = agg_ty.field(index).cloned() else {
            unreachable!("extractvalue index {index} out of range for {agg_ty}");
        };
        self.push(field_ty, InstKind::ExtractValue { aggregate, index })
    }

    pub fn insert_value(&mut self, aggregate: Value, value: Value, index: u32) -> Value {
        let ty = self.ty(aggregate).clone();
        debug_assert_eq!(ty.field(index), Some(self.ty(value)));
        self.push(
            ty,
            InstKind::InsertValue {
                aggregate,
                value,
                index,
            },
        )
    }

    pub fn cast(&mut self, op: CastOp, value: Value, to: Ty) -> Value {
        let from = self.ty(value).clone();
        let konst = self.as_const(value).cloned();
        match (op, konst, &from, &to) {
            (CastOp::SExt, Some(ConstValue::Int(v)), Ty::Int { bits, .. }, Ty::Int { .. }) => {
                let extended = normalize_int(v, *bits, Signedness::Signed);
                return self.const_int(to, extended);
            }
            (CastOp::ZExt, Some(ConstValue::Int(v)), Ty::Int { bits, .. }, Ty::Int { .. }) => {
                let extended = normalize_int(v, *bits, Signedness::Unsigned);
                return self.const_int(to, extended);
            }
            (CastOp::FPExt, Some(ConstValue::Float(v)), Ty::Float(_), Ty::Float(kind)) => {
                let kind = *kind;
                return self.const_float(kind, v);
            }
            _ => {}
        }
        self.push(to, InstKind::Cast { op, value })
    }

    pub fn bitcast(&mut self, value: Value, to: Ty) -> Value {
        if self.ty(value) == &to {
            return value;
        }
        self.cast(CastOp::Bitcast, value, to)
    }

    /// Reserves stack space for `count` values of type `elem`, returning a generic pointer.
    pub fn alloca(&mut self, elem: Ty, count: Value, align: u32) -> Value {
        let ty = Ty::ptr(elem.clone(), crate::types::GENERIC_ADDR_SPACE);
        self.push(ty, InstKind::Alloca { elem, count, align })
    }

    pub fn store(&mut self, value: Value, ptr: Value) {
        debug_assert_eq!(self.ty(ptr).pointee(), Some(self.ty(value)));
        self.push_void(InstKind::Store { value, ptr });
    }

    pub fn address_of(&mut self, global: &Global) -> Value {
        self.push(
            global.ptr_ty(),
            InstKind::AddressOf {
                global: global.name.clone(),
            },
        )
    }

    /// Calls `decl`, returning its result unless it returns `void`.
    pub fn call(&mut self, decl: &FuncDecl, args: Vec<Value>) -> Option<Value> {
        let kind = InstKind::Call {
            callee: decl.name.clone(),
            args,
        };
        match decl.ret_ty() {
            Ty::Void => {
                self.push_void(kind);
                None
            }
            ret => Some(self.push(ret.clone(), kind)),
        }
    }

    pub fn inline_asm(
        &mut self,
        asm: impl Into<String>,
        constraints: impl Into<String>,
        operands: Vec<Value>,
        side_effects: bool,
        ret: Ty,
    ) -> Option<Value> {
        let kind = InstKind::InlineAsm {
            asm: asm.into(),
            constraints: constraints.into(),
            operands,
            side_effects,
        };
        match ret {
            Ty::Void => {
                self.push_void(kind);
                None
            }
            ret => Some(self.push(ret, kind)),
        }
    }

    pub fn read_reg(&mut self, reg: SpecialReg) -> Value {
        self.push(Ty::i32(), InstKind::ReadReg(reg))
    }

    pub fn ret(&mut self, values: Vec<Value>) {
        self.push_void(InstKind::Return { values });
    }
}

/// Truncates `value` to `bits` and re-extends it as the signedness dictates.
fn normalize_int(value: i64, bits: u8, signedness: Signedness) -> i64 {
    if bits >= 64 || bits == 0 {
        return value;
    }
    let shift = 64 - u32::from(bits);
    match signedness {
        Signedness::Unsigned => ((value as u64) << shift >> shift) as i64,
        _ if bits == 1 => ((value as u64) << shift >> shift) as i64,
        _ => (value << shift) >> shift,
    }
}

fn fold_binary(op: BinOp, a: i64, b: i64, bits: u8) -> Option<i64> {
    let as_unsigned = |v: i64| normalize_int(v, bits, Signedness::Unsigned) as u64;
    match op {
        BinOp::Add => Some(a.wrapping_add(b)),
        BinOp::Mul => Some(a.wrapping_mul(b)),
        BinOp::UDiv => as_unsigned(a)
            .checked_div(as_unsigned(b))
            .map(|r| r as i64),
        BinOp::URem => as_unsigned(a)
            .checked_rem(as_unsigned(b))
            .map(|r| r as i64),
    }
}
