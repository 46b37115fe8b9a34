use super::{LoweringError, Rewriter};
use crate::codec::{pack, unpack};
use crate::common::{Coord, DimSize};
use crate::kernel::HlValue;
use crate::layout::{DistributedLayout, Layout};
use crate::typeconv::convert_tensor;
use std::collections::HashMap;

const OP: &str = "broadcast";

/// Re-indexes a thread's source values into its destination values.
///
/// Every destination slot takes the source value at the same coordinate, with dimensions
/// that have extent one in the source pinned to zero.
pub fn broadcast_values<T: Copy>(
    src_layout: &Layout,
    src_shape: &[DimSize],
    src_values: &[T],
    dst_layout: &Layout,
    dst_shape: &[DimSize],
) -> Result<Vec<T>, LoweringError> {
    if src_shape.len() != dst_shape.len() {
        return Err(LoweringError::unsupported(
            OP,
            format!(
                "cannot broadcast rank {} to rank {}",
                src_shape.len(),
                dst_shape.len()
            ),
        ));
    }
    if let Some((dim, (s, d))) = src_shape
        .iter()
        .zip(dst_shape)
        .enumerate()
        .find(|(_, (s, d))| s != d && s.get() != 1)
    {
        return Err(LoweringError::unsupported(
            OP,
            format!("dimension {dim} has extent {s}, which cannot broadcast to {d}"),
        ));
    }

    let src_coords = src_layout.coordinates(src_shape)?;
    if src_coords.len() != src_values.len() {
        return Err(LoweringError::TypeMismatch {
            expected: format!("{} source values", src_coords.len()),
            found: src_values.len().to_string(),
        });
    }
    let by_coord = index_by_coord(src_coords, src_values);

    let singleton_dims = src_shape
        .iter()
        .enumerate()
        .filter(|(_, s)| s.get() == 1)
        .map(|(dim, _)| dim)
        .collect::<Vec<_>>();
    dst_layout
        .coordinates(dst_shape)?
        .into_iter()
        .map(|mut coord| {
            for &dim in &singleton_dims {
                coord[dim] = 0;
            }
            by_coord
                .get(&coord)
                .copied()
                .ok_or_else(|| LoweringError::MalformedLayoutCorrespondence {
                    coord: coord.to_vec(),
                })
        })
        .collect()
}

/// Maps each coordinate to its value. If a coordinate repeats, the later value wins.
fn index_by_coord<T: Copy>(coords: Vec<Coord>, values: &[T]) -> HashMap<Coord, T> {
    coords.into_iter().zip(values.iter().copied()).collect()
}

pub fn lower_broadcast(
    rw: &mut Rewriter<'_>,
    source: HlValue,
    result: HlValue,
) -> Result<(), LoweringError> {
    let src_ty = rw.tensor_type(source, OP)?;
    let dst_ty = rw.tensor_type(result, OP)?;
    let packed = rw.lookup(source)?;
    let src_values = unpack(&mut rw.builder, packed);
    let dst_values = broadcast_values(
        &src_ty.encoding,
        &src_ty.shape,
        &src_values,
        &dst_ty.encoding,
        &dst_ty.shape,
    )?;
    let lowered = pack(&mut rw.builder, &dst_values, &convert_tensor(dst_ty)?)?;
    rw.bind(result, lowered);
    Ok(())
}
