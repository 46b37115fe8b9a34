use super::{LoweringError, Rewriter};
use crate::common::DimSize;
use crate::kernel::{HlType, HlValue, SliceOffset};
use crate::layout::Layout;
use crate::smem::SharedMemoryObject;
use crate::types::Ty;

const OP: &str = "extract_slice";

/// Lowers a unit-stride slice of a shared-memory tensor to a new view of the same memory.
pub fn lower_extract_slice(
    rw: &mut Rewriter<'_>,
    source: HlValue,
    offsets: &[SliceOffset],
    sizes: &[DimSize],
    strides: &[u32],
    result: HlValue,
) -> Result<(), LoweringError> {
    if let Some((dim, &stride)) = strides.iter().enumerate().find(|&(_, &s)| s != 1) {
        return Err(LoweringError::UnsupportedSlice { dim, stride });
    }
    let src_ty = rw.tensor_type(source, OP)?;
    let Layout::Shared(encoding) = &src_ty.encoding else {
        return Err(LoweringError::unsupported(
            OP,
            format!("cannot slice a tensor with encoding {}", src_ty.encoding),
        ));
    };
    let rank = src_ty.rank();
    if offsets.len() != rank || sizes.len() != rank || strides.len() != rank {
        return Err(LoweringError::unsupported(
            OP,
            format!("slice parameters do not match source rank {rank}"),
        ));
    }

    let order = encoding.view_order(rank)?;
    let packed = rw.lookup(source)?;
    let parent =
        SharedMemoryObject::from_struct(&mut rw.builder, packed, src_ty.shape.clone(), order)?;
    let offset_values = offsets
        .iter()
        .map(|offset| match offset {
            SliceOffset::Static(o) => Ok(rw.builder.const_int(Ty::i32(), *o)),
            SliceOffset::Dynamic(v) => match rw.hl_type(*v) {
                HlType::Scalar(ty) if *ty == Ty::i32() => rw.lookup(*v),
                other => Err(LoweringError::TypeMismatch {
                    expected: Ty::i32().to_string(),
                    found: other.to_string(),
                }),
            },
        })
        .collect::<Result<Vec<_>, _>>()?;

    let child = parent.slice(&mut rw.builder, &offset_values, sizes);
    log::trace!(
        "slice of {source} has shape {:?} and order {:?}",
        child.shape,
        child.order
    );
    let lowered = child.to_struct(&mut rw.builder)?;
    rw.bind(result, lowered);
    Ok(())
}
