//! Views into the CTA-wide shared-memory region.

use crate::codec::{pack, unpack, CodecError};
use crate::common::{drop_dims_from_order, DimSize, Order, Shape};
use crate::ir::{FuncBuilder, Value};
use crate::typeconv::shared_struct_type;
use crate::types::Ty;

/// A rectangular view of shared memory.
///
/// `base` points at the view's first element. `offsets` record where that element sits within
/// the parent allocation; they are carried along for consumers that need absolute positions, but
/// are already folded into `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryObject {
    pub base: Value,
    pub shape: Shape,
    pub strides: Vec<Value>,
    pub offsets: Vec<Value>,
    pub order: Order,
}

/// Returns the element strides of a dense allocation laid out by `order`, or `None` if a stride
/// does not fit in an `i32`.
///
/// # Examples
/// ```
/// # use tessera::{shape, smem::strides_from_shape_and_order};
/// assert_eq!(strides_from_shape_and_order(&shape![4, 8], &[1, 0]), Some(vec![8, 1]));
/// assert_eq!(strides_from_shape_and_order(&shape![4, 8], &[0, 1]), Some(vec![1, 4]));
/// assert_eq!(strides_from_shape_and_order(&shape![2, 65536, 65536], &[2, 1, 0]), None);
/// ```
pub fn strides_from_shape_and_order(shape: &[DimSize], order: &[u8]) -> Option<Vec<u32>> {
    debug_assert_eq!(shape.len(), order.len());
    let limit = u32::try_from(i32::MAX).unwrap();
    let mut strides = vec![0; shape.len()];
    let mut stride = 1u32;
    for (i, &dim) in order.iter().enumerate() {
        let dim = usize::from(dim);
        strides[dim] = stride;
        // The slowest dimension's extent never contributes to a stride.
        if i + 1 < order.len() {
            stride = stride
                .checked_mul(shape[dim].get())
                .filter(|&s| s <= limit)?;
        }
    }
    Some(strides)
}

impl SharedMemoryObject {
    /// A view of a whole allocation starting at `base`.
    ///
    /// Returns `None` if the allocation is too large for its strides to be addressed with `i32`.
    pub fn new(
        builder: &mut FuncBuilder,
        base: Value,
        shape: Shape,
        order: Order,
    ) -> Option<Self> {
        let strides = strides_from_shape_and_order(&shape, &order)?
            .into_iter()
            .map(|s| builder.const_int(Ty::i32(), i64::from(s)))
            .collect();
        let offsets = shape.iter().map(|_| builder.i32_const(0)).collect();
        Some(SharedMemoryObject {
            base,
            shape,
            strides,
            offsets,
            order,
        })
    }

    pub fn from_parts(
        base: Value,
        shape: Shape,
        strides: Vec<Value>,
        offsets: Vec<Value>,
        order: Order,
    ) -> Self {
        debug_assert_eq!(shape.len(), strides.len());
        debug_assert_eq!(shape.len(), offsets.len());
        debug_assert_eq!(shape.len(), order.len());
        SharedMemoryObject {
            base,
            shape,
            strides,
            offsets,
            order,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_ty(&self, builder: &FuncBuilder) -> Ty {
        builder
            .ty(self.base)
            .pointee()
            .cloned()
            .unwrap_or(Ty::Void)
    }

    /// Packs the view as `{ base, strides..., offsets... }`.
    pub fn to_struct(&self, builder: &mut FuncBuilder) -> Result<Value, CodecError> {
        let ty = shared_struct_type(&self.elem_ty(builder), self.rank());
        let values = std::iter::once(self.base)
            .chain(self.strides.iter().copied())
            .chain(self.offsets.iter().copied())
            .collect::<Vec<_>>();
        pack(builder, &values, &ty)
    }

    /// Rebuilds a view from its packed form. The shape and order are not part of the packed
    /// form and must come from the tensor's type.
    pub fn from_struct(
        builder: &mut FuncBuilder,
        packed: Value,
        shape: Shape,
        order: Order,
    ) -> Result<Self, CodecError> {
        let rank = shape.len();
        let fields = unpack(builder, packed);
        if fields.len() != 1 + 2 * rank {
            return Err(CodecError::Arity {
                ty: builder.ty(packed).clone(),
                expected: 1 + 2 * rank,
                actual: fields.len(),
            });
        }
        Ok(SharedMemoryObject::from_parts(
            fields[0],
            shape,
            fields[1..=rank].to_vec(),
            fields[rank + 1..].to_vec(),
            order,
        ))
    }

    /// Derives the sub-view starting at `offsets` with extent `sizes`.
    ///
    /// Dimensions of size one are removed. The remaining dimensions keep their strides, so the
    /// child addresses the same memory as the parent.
    pub fn slice(&self, builder: &mut FuncBuilder, offsets: &[Value], sizes: &[DimSize]) -> Self {
        debug_assert_eq!(offsets.len(), self.rank());
        debug_assert_eq!(sizes.len(), self.rank());
        let delta = builder.dot(offsets, &self.strides);

        let mut shape = Shape::new();
        let mut strides = vec![];
        let mut new_offsets = vec![];
        let mut dropped = vec![];
        for (dim, &size) in sizes.iter().enumerate() {
            if size.get() == 1 {
                dropped.push(dim);
                continue;
            }
            shape.push(size);
            strides.push(self.strides[dim]);
            new_offsets.push(builder.add(self.offsets[dim], offsets[dim]));
        }

        let ty = builder.ty(self.base).clone();
        let base = builder.gep(ty, self.base, vec![delta]);
        SharedMemoryObject::from_parts(
            base,
            shape,
            strides,
            new_offsets,
            drop_dims_from_order(&self.order, &dropped),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstKind;
    use crate::shape;
    use crate::types::SHARED_ADDR_SPACE;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn builder_with_base() -> (FuncBuilder, Value) {
        let b = FuncBuilder::new("f", [Ty::ptr(Ty::f32(), SHARED_ADDR_SPACE)], Ty::Void);
        let base = b.params()[0];
        (b, base)
    }

    fn consts(b: &FuncBuilder, values: &[Value]) -> Vec<i64> {
        values.iter().map(|v| b.as_const_int(*v).unwrap()).collect()
    }

    #[test]
    fn test_new_computes_strides_from_order() {
        let (mut b, base) = builder_with_base();
        let smem =
            SharedMemoryObject::new(&mut b, base, shape![2, 16, 32], smallvec![2, 1, 0]).unwrap();
        assert_eq!(consts(&b, &smem.strides), vec![512, 32, 1]);
        assert_eq!(consts(&b, &smem.offsets), vec![0, 0, 0]);
    }

    #[test]
    fn test_slice_address_algebra() {
        let (mut b, base) = builder_with_base();
        let parent =
            SharedMemoryObject::new(&mut b, base, shape![4, 16], smallvec![1, 0]).unwrap();
        let offsets = [b.i32_const(2), b.i32_const(3)];
        let child = parent.slice(&mut b, &offsets, &shape![1, 5]);

        assert_eq!(child.shape, shape![5]);
        assert_eq!(child.order.as_slice(), &[0]);
        assert_eq!(consts(&b, &child.strides), vec![1]);
        assert_eq!(consts(&b, &child.offsets), vec![3]);
        let Some(InstKind::Gep { base: gep_base, indices }) = b.def(child.base).map(|i| &i.kind)
        else {
            panic!("child base is not a gep");
        };
        assert_eq!(*gep_base, base);
        assert_eq!(consts(&b, indices), vec![35]);
    }

    #[test]
    fn test_struct_round_trip() {
        let (mut b, base) = builder_with_base();
        let smem =
            SharedMemoryObject::new(&mut b, base, shape![4, 16], smallvec![1, 0]).unwrap();
        let packed = smem.to_struct(&mut b).unwrap();
        assert_eq!(
            b.ty(packed).to_string(),
            "{ f32 addrspace(3)*, i32, i32, i32, i32 }"
        );
        let back =
            SharedMemoryObject::from_struct(&mut b, packed, shape![4, 16], smallvec![1, 0])
                .unwrap();
        assert_eq!(back, smem);
    }

    #[test]
    fn test_from_struct_checks_rank() {
        let (mut b, base) = builder_with_base();
        let smem =
            SharedMemoryObject::new(&mut b, base, shape![4, 16], smallvec![1, 0]).unwrap();
        let packed = smem.to_struct(&mut b).unwrap();
        let err = SharedMemoryObject::from_struct(&mut b, packed, shape![4], smallvec![0]);
        assert!(matches!(err, Err(CodecError::Arity { expected: 3, actual: 5, .. })));
    }

    #[test]
    fn test_strides_skip_the_slowest_extent() {
        assert_eq!(
            strides_from_shape_and_order(&shape![65536, 65536], &[1, 0]),
            Some(vec![65536, 1])
        );
        assert_eq!(
            strides_from_shape_and_order(&shape![2, 50000, 50000], &[2, 1, 0]),
            None
        );
        let (mut b, base) = builder_with_base();
        assert_eq!(
            SharedMemoryObject::new(&mut b, base, shape![2, 50000, 50000], smallvec![2, 1, 0]),
            None
        );
    }

    #[test]
    fn test_pipelined_stage_slice() {
        let mut b = FuncBuilder::new(
            "f",
            [Ty::ptr(Ty::f32(), SHARED_ADDR_SPACE), Ty::i32()],
            Ty::Void,
        );
        let (base, stage) = (b.params()[0], b.params()[1]);
        let order = crate::layout::SharedLayout::new(1, 1, 1, smallvec![1, 0])
            .allocation_order(3)
            .unwrap();
        let parent = SharedMemoryObject::new(&mut b, base, shape![3, 32, 64], order).unwrap();
        assert_eq!(parent.order.as_slice(), &[2, 1, 0]);
        assert_eq!(consts(&b, &parent.strides), vec![2048, 64, 1]);

        let offsets = [stage, b.i32_const(0), b.i32_const(0)];
        let child = parent.slice(&mut b, &offsets, &shape![1, 32, 64]);
        assert_eq!(child.shape, shape![32, 64]);
        assert_eq!(child.order.as_slice(), &[1, 0]);
        assert_eq!(consts(&b, &child.strides), vec![64, 1]);
        assert_eq!(consts(&b, &child.offsets), vec![0, 0]);

        let Some(InstKind::Gep { base: gep_base, indices }) = b.def(child.base).map(|i| &i.kind)
        else {
            panic!("child base is not a gep");
        };
        assert_eq!(*gep_base, base);
        for s in 0..3 {
            let delta = b
                .function()
                .eval_int(indices[0], &|v| (v == stage).then_some(s));
            assert_eq!(delta, Some(s * 2048));
        }
    }

    proptest! {
        #[test]
        fn test_repeated_slicing_of_unit_dims_is_stable(
            extents in prop::collection::vec(2u32..6, 2..4),
        ) {
            let (mut b, base) = builder_with_base();
            let shape: Shape = extents.iter().map(|&e| DimSize::new(e).unwrap()).collect();
            let rank = shape.len();
            let order: Order = (0..u8::try_from(rank).unwrap()).rev().collect();
            let parent = SharedMemoryObject::new(&mut b, base, shape.clone(), order).unwrap();

            // Drop the leading dimension, then take the whole of what remains.
            let zeros = (0..rank).map(|_| b.i32_const(0)).collect::<Vec<_>>();
            let mut sizes = shape.clone();
            sizes[0] = DimSize::MIN;
            let child = parent.slice(&mut b, &zeros, &sizes);
            prop_assert_eq!(child.rank(), rank - 1);

            let zeros = (0..rank - 1).map(|_| b.i32_const(0)).collect::<Vec<_>>();
            let again = child.slice(&mut b, &zeros, &child.shape.clone());
            prop_assert_eq!(&again.shape, &child.shape);
            prop_assert_eq!(&again.order, &child.order);
            prop_assert_eq!(consts(&b, &again.strides), consts(&b, &child.strides));
            prop_assert_eq!(consts(&b, &again.offsets), consts(&b, &child.offsets));
        }
    }
}
