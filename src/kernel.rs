//! The tensor-level kernel representation consumed by lowering.

use crate::common::{drop_dims_from_order, DimSize, Shape};
use crate::layout::{DistributedLayout, Layout, LayoutError, SharedLayout};
use crate::types::Ty;
use itertools::Itertools;
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HlValue(u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub shape: Shape,
    pub elem: Ty,
    pub encoding: Layout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HlType {
    Scalar(Ty),
    Tensor(TensorType),
}

/// A per-dimension slice offset, either known when the kernel is built or computed at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOffset {
    Static(i64),
    Dynamic(HlValue),
}

#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Op {
    Broadcast {
        source: HlValue,
        result: HlValue,
    },
    AddPtr {
        ptr: HlValue,
        offset: HlValue,
        result: HlValue,
    },
    AllocTensor {
        result: HlValue,
    },
    ExtractSlice {
        source: HlValue,
        offsets: Vec<SliceOffset>,
        sizes: Vec<DimSize>,
        strides: Vec<u32>,
        result: HlValue,
    },
    Printf {
        prefix: String,
        args: Vec<HlValue>,
    },
    AsyncWait {
        num: u32,
    },
    GetProgramId {
        axis: u32,
        result: HlValue,
    },
    GetNumPrograms {
        axis: u32,
        result: HlValue,
    },
    MakeRange {
        start: u32,
        end: u32,
        result: HlValue,
    },
    Return {
        operands: Vec<HlValue>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub params: Vec<HlValue>,
    pub ops: Vec<Op>,
    types: Vec<HlType>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Value {0} is not a tensor")]
    NotATensor(HlValue),
    #[error("Empty range {start}..{end}")]
    EmptyRange { start: u32, end: u32 },
    #[error("Slice of rank {given} applied to tensor of rank {rank}")]
    SliceRank { given: usize, rank: usize },
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug)]
pub struct KernelBuilder {
    kernel: Kernel,
}

impl Display for HlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl TensorType {
    pub fn new(shape: Shape, elem: Ty, encoding: impl Into<Layout>) -> Self {
        TensorType {
            shape,
            elem,
            encoding: encoding.into(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tensor<{}x{}, {}>",
            self.shape.iter().join("x"),
            self.elem,
            self.encoding
        )
    }
}

impl HlType {
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            HlType::Tensor(t) => Some(t),
            HlType::Scalar(_) => None,
        }
    }
}

impl From<Ty> for HlType {
    fn from(ty: Ty) -> Self {
        HlType::Scalar(ty)
    }
}

impl From<TensorType> for HlType {
    fn from(ty: TensorType) -> Self {
        HlType::Tensor(ty)
    }
}

impl Display for HlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HlType::Scalar(ty) => write!(f, "{ty}"),
            HlType::Tensor(t) => write!(f, "{t}"),
        }
    }
}

impl Op {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn result(&self) -> Option<HlValue> {
        match self {
            Op::Broadcast { result, .. }
            | Op::AddPtr { result, .. }
            | Op::AllocTensor { result }
            | Op::ExtractSlice { result, .. }
            | Op::GetProgramId { result, .. }
            | Op::GetNumPrograms { result, .. }
            | Op::MakeRange { result, .. } => Some(*result),
            Op::Printf { .. } | Op::AsyncWait { .. } | Op::Return { .. } => None,
        }
    }

    pub fn operands(&self) -> Vec<HlValue> {
        match self {
            Op::Broadcast { source, .. } => vec![*source],
            Op::AddPtr { ptr, offset, .. } => vec![*ptr, *offset],
            Op::ExtractSlice {
                source, offsets, ..
            } => std::iter::once(*source)
                .chain(offsets.iter().filter_map(|o| match o {
                    SliceOffset::Dynamic(v) => Some(*v),
                    SliceOffset::Static(_) => None,
                }))
                .collect(),
            Op::Printf { args, .. } => args.clone(),
            Op::Return { operands } => operands.clone(),
            Op::AllocTensor { .. }
            | Op::AsyncWait { .. }
            | Op::GetProgramId { .. }
            | Op::GetNumPrograms { .. }
            | Op::MakeRange { .. } => vec![],
        }
    }
}

impl Kernel {
    pub fn ty(&self, value: HlValue) -> &HlType {
        &self.types[usize::try_from(value.0).unwrap()]
    }

    /// Iterates over every value a kernel defines, with its type.
    pub fn values(&self) -> impl Iterator<Item = (HlValue, &HlType)> + '_ {
        self.types
            .iter()
            .enumerate()
            .map(|(idx, ty)| (HlValue(u32::try_from(idx).unwrap()), ty))
    }
}

impl Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| format!("{p}: {}", self.ty(*p)))
            .join(", ");
        writeln!(f, "kernel @{}({params}) {{", self.name)?;
        for op in &self.ops {
            write!(f, "  ")?;
            if let Some(result) = op.result() {
                write!(f, "{result} = ")?;
            }
            write!(f, "{}", op.name())?;
            let operands = op.operands();
            if !operands.is_empty() {
                write!(f, " {}", operands.iter().join(", "))?;
            }
            if let Some(result) = op.result() {
                write!(f, " : {}", self.ty(result))?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

impl KernelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        KernelBuilder {
            kernel: Kernel {
                name: name.into(),
                params: vec![],
                ops: vec![],
                types: vec![],
            },
        }
    }

    pub fn ty(&self, value: HlValue) -> &HlType {
        self.kernel.ty(value)
    }

    fn fresh(&mut self, ty: impl Into<HlType>) -> HlValue {
        let value = HlValue(u32::try_from(self.kernel.types.len()).unwrap());
        self.kernel.types.push(ty.into());
        value
    }

    fn tensor(&self, value: HlValue) -> Result<&TensorType, KernelError> {
        self.ty(value)
            .as_tensor()
            .ok_or(KernelError::NotATensor(value))
    }

    pub fn param(&mut self, ty: impl Into<HlType>) -> HlValue {
        let value = self.fresh(ty);
        self.kernel.params.push(value);
        value
    }

    /// Appends an arbitrary op whose result, if any, has type `result_ty`.
    ///
    /// Returns the result value that `make_op` was given.
    pub fn op_with_result(
        &mut self,
        result_ty: impl Into<HlType>,
        make_op: impl FnOnce(HlValue) -> Op,
    ) -> HlValue {
        let result = self.fresh(result_ty);
        self.kernel.ops.push(make_op(result));
        result
    }

    pub fn broadcast(&mut self, source: HlValue, result_ty: TensorType) -> HlValue {
        self.op_with_result(result_ty, |result| Op::Broadcast { source, result })
    }

    /// Offsets `ptr` by `offset` elements. The result has the type of `ptr`.
    pub fn add_ptr(&mut self, ptr: HlValue, offset: HlValue) -> HlValue {
        let ty = self.ty(ptr).clone();
        self.op_with_result(ty, |result| Op::AddPtr {
            ptr,
            offset,
            result,
        })
    }

    pub fn alloc_tensor(&mut self, ty: TensorType) -> HlValue {
        self.op_with_result(ty, |result| Op::AllocTensor { result })
    }

    /// Takes a sub-view of a shared-memory tensor.
    ///
    /// Dimensions of size one are dropped from the result type, and the result's encoding
    /// carries the source's view order with those dimensions removed.
    pub fn extract_slice(
        &mut self,
        source: HlValue,
        offsets: Vec<SliceOffset>,
        sizes: Vec<DimSize>,
        strides: Vec<u32>,
    ) -> Result<HlValue, KernelError> {
        let src = self.tensor(source)?;
        if offsets.len() != src.rank() || sizes.len() != src.rank() {
            return Err(KernelError::SliceRank {
                given: offsets.len().max(sizes.len()),
                rank: src.rank(),
            });
        }
        let dropped = sizes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.get() == 1)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        let encoding = match &src.encoding {
            Layout::Shared(enc) if !dropped.is_empty() => {
                let order = enc.view_order(src.rank())?;
                SharedLayout::new(
                    enc.vec,
                    enc.per_phase,
                    enc.max_phase,
                    drop_dims_from_order(&order, &dropped),
                )
                .into()
            }
            other => other.clone(),
        };
        let result_ty = TensorType {
            shape: sizes.iter().copied().filter(|s| s.get() != 1).collect(),
            elem: src.elem.clone(),
            encoding,
        };
        Ok(self.op_with_result(result_ty, |result| Op::ExtractSlice {
            source,
            offsets,
            sizes,
            strides,
            result,
        }))
    }

    pub fn printf(&mut self, prefix: impl Into<String>, args: Vec<HlValue>) {
        self.kernel.ops.push(Op::Printf {
            prefix: prefix.into(),
            args,
        });
    }

    pub fn async_wait(&mut self, num: u32) {
        self.kernel.ops.push(Op::AsyncWait { num });
    }

    pub fn get_program_id(&mut self, axis: u32) -> HlValue {
        self.op_with_result(Ty::i32(), |result| Op::GetProgramId { axis, result })
    }

    pub fn get_num_programs(&mut self, axis: u32) -> HlValue {
        self.op_with_result(Ty::i32(), |result| Op::GetNumPrograms { axis, result })
    }

    /// Builds the rank-1 `i32` tensor `[start, end)` with the given encoding.
    pub fn make_range(
        &mut self,
        start: u32,
        end: u32,
        encoding: impl Into<Layout>,
    ) -> Result<HlValue, KernelError> {
        let len = end
            .checked_sub(start)
            .and_then(DimSize::new)
            .ok_or(KernelError::EmptyRange { start, end })?;
        let ty = TensorType::new(vec![len], Ty::i32(), encoding);
        Ok(self.op_with_result(ty, |result| Op::MakeRange { start, end, result }))
    }

    pub fn ret(&mut self, operands: Vec<HlValue>) {
        self.kernel.ops.push(Op::Return { operands });
    }

    pub fn finish(self) -> Kernel {
        self.kernel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BlockedLayout;
    use crate::shape;
    use smallvec::smallvec;

    fn shared(order: &[u8]) -> SharedLayout {
        SharedLayout::new(1, 1, 1, order.into())
    }

    #[test]
    fn test_op_names() {
        assert_eq!(Op::AsyncWait { num: 0 }.name(), "async_wait");
        let mut kb = KernelBuilder::new("k");
        let pid = kb.get_program_id(0);
        kb.printf("x", vec![pid]);
        let kernel = kb.finish();
        assert_eq!(kernel.ops[0].name(), "get_program_id");
        assert_eq!(kernel.ops[1].name(), "printf");
        assert_eq!(kernel.ops[1].operands(), vec![pid]);
    }

    #[test]
    fn test_extract_slice_drops_unit_dims() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(shape![3, 16, 32], Ty::f32(), shared(&[1, 0])));
        let offsets = vec![SliceOffset::Static(1), SliceOffset::Static(0), SliceOffset::Static(0)];
        let view = kb
            .extract_slice(buf, offsets, shape![1, 16, 32], vec![1, 1, 1])
            .unwrap();
        let ty = kb.ty(view).as_tensor().unwrap();
        assert_eq!(ty.shape, shape![16, 32]);
        assert_eq!(ty.encoding, shared(&[1, 0]).into());
    }

    #[test]
    fn test_extract_slice_rejects_rank_mismatch() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(shape![16, 32], Ty::f32(), shared(&[1, 0])));
        let result = kb.extract_slice(buf, vec![SliceOffset::Static(0)], shape![16], vec![1]);
        assert_eq!(result, Err(KernelError::SliceRank { given: 1, rank: 2 }));
    }

    #[test]
    fn test_make_range_type() {
        let blocked = BlockedLayout::new(vec![1], vec![32], vec![4], smallvec![0]).unwrap();
        let mut kb = KernelBuilder::new("k");
        let r = kb.make_range(4, 132, blocked).unwrap();
        let ty = kb.ty(r).as_tensor().unwrap();
        assert_eq!(ty.shape, shape![128]);
        assert_eq!(ty.elem, Ty::i32());
        assert!(matches!(
            kb.make_range(5, 5, shared(&[0])),
            Err(KernelError::EmptyRange { start: 5, end: 5 })
        ));
    }
}
