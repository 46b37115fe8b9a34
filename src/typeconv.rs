//! Conversion of tensor-level types to the aggregates lowered code passes around.

use crate::kernel::{HlType, TensorType};
use crate::layout::{DistributedLayout, Layout, LayoutError};
use crate::types::{Ty, SHARED_ADDR_SPACE};

pub fn convert_type(ty: &HlType) -> Result<Ty, LayoutError> {
    match ty {
        HlType::Scalar(ty) => Ok(ty.clone()),
        HlType::Tensor(t) => convert_tensor(t),
    }
}

/// Distributed tensors become a struct of one field per element a thread owns. Shared tensors
/// become the packed form of a [SharedMemoryObject](crate::smem::SharedMemoryObject).
pub fn convert_tensor(ty: &TensorType) -> Result<Ty, LayoutError> {
    match &ty.encoding {
        Layout::Shared(_) => Ok(shared_struct_type(&ty.elem, ty.rank())),
        encoding => {
            let n = encoding.elems_per_thread(&ty.shape)?;
            Ok(Ty::Struct(vec![ty.elem.clone(); usize::try_from(n).unwrap()]))
        }
    }
}

/// `{ elem addrspace(3)*, i32 x rank, i32 x rank }`: base, strides, then offsets.
pub fn shared_struct_type(elem: &Ty, rank: usize) -> Ty {
    let mut fields = Vec::with_capacity(1 + 2 * rank);
    fields.push(Ty::ptr(elem.clone(), SHARED_ADDR_SPACE));
    fields.extend(std::iter::repeat(Ty::i32()).take(2 * rank));
    Ty::Struct(fields)
}
