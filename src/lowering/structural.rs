use super::indices::emit_indices;
use super::{LoweringError, Rewriter};
use crate::codec::pack;
use crate::ir::{Axis, SpecialReg};
use crate::kernel::HlValue;
use crate::typeconv::convert_tensor;
use crate::types::Ty;

pub fn lower_return(rw: &mut Rewriter<'_>, operands: &[HlValue]) -> Result<(), LoweringError> {
    if !operands.is_empty() {
        return Err(LoweringError::unsupported(
            "return",
            "only kernels returning nothing are supported",
        ));
    }
    rw.builder.ret(vec![]);
    Ok(())
}

fn grid_axis(op: &'static str, axis: u32) -> Result<Axis, LoweringError> {
    Axis::from_index(axis)
        .ok_or_else(|| LoweringError::unsupported(op, format!("axis {axis} is not one of 0, 1, 2")))
}

pub fn lower_get_program_id(
    rw: &mut Rewriter<'_>,
    axis: u32,
    result: HlValue,
) -> Result<(), LoweringError> {
    let axis = grid_axis("get_program_id", axis)?;
    let id = rw.builder.read_reg(SpecialReg::BlockId(axis));
    rw.bind(result, id);
    Ok(())
}

pub fn lower_get_num_programs(
    rw: &mut Rewriter<'_>,
    axis: u32,
    result: HlValue,
) -> Result<(), LoweringError> {
    let axis = grid_axis("get_num_programs", axis)?;
    let count = rw.builder.read_reg(SpecialReg::GridDim(axis));
    rw.bind(result, count);
    Ok(())
}

/// Lowers `[start, end)` to each thread's share of the range.
pub fn lower_make_range(
    rw: &mut Rewriter<'_>,
    start: u32,
    result: HlValue,
) -> Result<(), LoweringError> {
    const OP: &str = "make_range";
    let ty = rw.tensor_type(result, OP)?;
    if ty.elem != Ty::i32() {
        return Err(LoweringError::TypeMismatch {
            expected: "a tensor of i32".to_string(),
            found: ty.to_string(),
        });
    }
    if ty.rank() != 1 {
        return Err(LoweringError::unsupported(
            OP,
            format!("ranges must be one-dimensional, not {}", ty),
        ));
    }
    let indices = emit_indices(&mut rw.builder, &ty.encoding, &ty.shape)?;
    let start = rw.builder.const_int(Ty::i32(), i64::from(start));
    let values = indices
        .iter()
        .map(|idx| rw.builder.add(idx[0], start))
        .collect::<Vec<_>>();
    let lowered = pack(&mut rw.builder, &values, &convert_tensor(ty)?)?;
    rw.bind(result, lowered);
    Ok(())
}
