use super::{LoweringError, Rewriter};
use crate::codec::{pack, unpack, CodecError};
use crate::kernel::{HlType, HlValue};
use crate::typeconv::convert_tensor;
use crate::types::Ty;

const OP: &str = "add_ptr";

/// Lowers `ptr + offset`, scaled by the pointee size, element-wise for tensors.
pub fn lower_add_ptr(
    rw: &mut Rewriter<'_>,
    ptr: HlValue,
    offset: HlValue,
    result: HlValue,
) -> Result<(), LoweringError> {
    let ptr_lowered = rw.lookup(ptr)?;
    let offset_lowered = rw.lookup(offset)?;
    match rw.hl_type(result) {
        HlType::Tensor(result_ty) => {
            if !result_ty.elem.is_ptr() {
                return Err(LoweringError::TypeMismatch {
                    expected: "a tensor of pointers".to_string(),
                    found: result_ty.to_string(),
                });
            }
            let struct_ty = convert_tensor(result_ty)?;
            let elems = usize::try_from(rw.elems_per_thread(result_ty)?).unwrap();
            let ptrs = unpack(&mut rw.builder, ptr_lowered);
            let offsets = unpack(&mut rw.builder, offset_lowered);
            for count in [ptrs.len(), offsets.len()] {
                if count != elems {
                    return Err(CodecError::Arity {
                        ty: struct_ty,
                        expected: elems,
                        actual: count,
                    }
                    .into());
                }
            }
            let addresses = ptrs
                .into_iter()
                .zip(offsets)
                .map(|(p, o)| rw.builder.gep(result_ty.elem.clone(), p, vec![o]))
                .collect::<Vec<_>>();
            let lowered = pack(&mut rw.builder, &addresses, &struct_ty)?;
            rw.bind(result, lowered);
        }
        HlType::Scalar(ty @ Ty::Ptr { .. }) => {
            let address = rw.builder.gep(ty.clone(), ptr_lowered, vec![offset_lowered]);
            rw.bind(result, address);
        }
        HlType::Scalar(ty) => {
            return Err(LoweringError::TypeMismatch {
                expected: "a pointer".to_string(),
                found: ty.to_string(),
            })
        }
    }
    Ok(())
}
