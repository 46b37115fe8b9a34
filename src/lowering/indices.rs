//! Per-thread logical indices of distributed tensors.
//!
//! A thread's coordinates are its base index (which depends on the thread id) plus the
//! thread-independent offsets enumerated by [DistributedLayout::coordinates].

use super::LoweringError;
use crate::common::DimSize;
use crate::ir::{FuncBuilder, SpecialReg, Value};
use crate::layout::{BlockedLayout, DistributedLayout, Layout, LayoutError};
use crate::types::Ty;
use smallvec::SmallVec;

pub type IndexValues = SmallVec<[Value; 4]>;

/// Splits `linear` into per-dimension indices over `extents`, `order[0]` varying fastest.
pub fn delinearize_values(
    builder: &mut FuncBuilder,
    linear: Value,
    extents: &[u32],
    order: &[u8],
) -> IndexValues {
    let mut result = IndexValues::from_elem(linear, extents.len());
    let mut remaining = linear;
    for (i, &dim) in order.iter().enumerate() {
        let dim = usize::from(dim);
        if i + 1 == order.len() {
            result[dim] = remaining;
        } else {
            let extent = builder.const_int(Ty::i32(), i64::from(extents[dim]));
            result[dim] = builder.urem(remaining, extent);
            remaining = builder.udiv(remaining, extent);
        }
    }
    result
}

/// Emits the index of the first element the current thread owns, per dimension.
pub fn emit_base_index(
    builder: &mut FuncBuilder,
    layout: &Layout,
    shape: &[DimSize],
) -> Result<IndexValues, LoweringError> {
    match layout {
        Layout::Blocked(blocked) => Ok(emit_blocked_base_index(builder, blocked, shape)?),
        Layout::Slice(slice) => {
            let padded = slice.padded_shape(shape);
            let mut base = emit_base_index(builder, slice.parent(), &padded)?;
            base.remove(usize::from(slice.dim()));
            Ok(base)
        }
        Layout::Shared(_) => Err(LayoutError::NotDistributed.into()),
    }
}

fn emit_blocked_base_index(
    builder: &mut FuncBuilder,
    layout: &BlockedLayout,
    shape: &[DimSize],
) -> Result<IndexValues, LayoutError> {
    if shape.len() != layout.rank() {
        return Err(LayoutError::RankMismatch {
            layout_rank: layout.rank(),
            shape: shape.iter().map(|d| d.get()).collect(),
        });
    }
    let spt = layout.size_per_thread();
    let tpw = layout.threads_per_warp();
    let order = layout.order();

    let thread_id = builder.read_reg(SpecialReg::ThreadIdX);
    let warp_size = builder.const_int(Ty::i32(), i64::from(tpw.iter().product::<u32>()));
    let lane = builder.urem(thread_id, warp_size);
    let warp = builder.udiv(thread_id, warp_size);
    let warp_ids = delinearize_values(builder, warp, layout.warps_per_cta(), &order);
    let lane_ids = delinearize_values(builder, lane, tpw, &order);

    let mut base = IndexValues::with_capacity(shape.len());
    for k in 0..shape.len() {
        // Threads and warps beyond the extent of a small tensor wrap around and duplicate
        // elements owned by lower-numbered ones.
        let max_warps = shape[k].get().div_ceil(spt[k] * tpw[k]);
        let max_threads = shape[k].get().div_ceil(spt[k]);
        let max_warps = builder.const_int(Ty::i32(), i64::from(max_warps));
        let max_threads = builder.const_int(Ty::i32(), i64::from(max_threads));
        let warp_k = builder.urem(warp_ids[k], max_warps);
        let lane_k = builder.urem(lane_ids[k], max_threads);

        let tpw_k = builder.const_int(Ty::i32(), i64::from(tpw[k]));
        let spt_k = builder.const_int(Ty::i32(), i64::from(spt[k]));
        let warp_offset = builder.mul(warp_k, tpw_k);
        let thread = builder.add(lane_k, warp_offset);
        base.push(builder.mul(spt_k, thread));
    }
    Ok(base)
}

/// Emits the logical index of every element the current thread owns, in packing order.
pub fn emit_indices(
    builder: &mut FuncBuilder,
    layout: &Layout,
    shape: &[DimSize],
) -> Result<Vec<IndexValues>, LoweringError> {
    let offsets = layout.coordinates(shape)?;
    let base = emit_base_index(builder, layout, shape)?;
    Ok(offsets
        .iter()
        .map(|offset| {
            base.iter()
                .zip(offset)
                .map(|(&b, &o)| {
                    let o = builder.const_int(Ty::i32(), i64::from(o));
                    builder.add(b, o)
                })
                .collect()
        })
        .collect())
}
