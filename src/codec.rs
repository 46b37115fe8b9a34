//! Packing per-thread values into struct aggregates and back.

use crate::ir::{FuncBuilder, Value};
use crate::types::Ty;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Aggregate {ty} has {expected} fields but {actual} values were given")]
    Arity {
        ty: Ty,
        expected: usize,
        actual: usize,
    },
    #[error("Field {index} of an aggregate has type {expected}, not {actual}")]
    FieldType {
        index: usize,
        expected: Ty,
        actual: Ty,
    },
    #[error("{0} is not a struct type")]
    NotAStruct(Ty),
}

/// Builds a value of struct type `ty` from `values`, one per field.
pub fn pack(builder: &mut FuncBuilder, values: &[Value], ty: &Ty) -> Result<Value, CodecError> {
    let Ty::Struct(fields) = ty else {
        return Err(CodecError::NotAStruct(ty.clone()));
    };
    if fields.len() != values.len() {
        return Err(CodecError::Arity {
            ty: ty.clone(),
            expected: fields.len(),
            actual: values.len(),
        });
    }
    for (index, (field, &value)) in fields.iter().zip(values).enumerate() {
        if builder.ty(value) != field {
            return Err(CodecError::FieldType {
                index,
                expected: field.clone(),
                actual: builder.ty(value).clone(),
            });
        }
    }
    let mut packed = builder.undef(ty.clone());
    for (index, &value) in values.iter().enumerate() {
        packed = builder.insert_value(packed, value, u32::try_from(index).unwrap());
    }
    Ok(packed)
}

/// Splits a struct value into its fields. Any other value unpacks to itself.
pub fn unpack(builder: &mut FuncBuilder, value: Value) -> Vec<Value> {
    let field_count = match builder.ty(value) {
        Ty::Struct(fields) => fields.len(),
        _ => return vec![value],
    };
    (0..field_count)
        .map(|index| builder.extract_value(value, u32::try_from(index).unwrap()))
        .collect()
}
