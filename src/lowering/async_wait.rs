use crate::ir::FuncBuilder;
use crate::ptx::PtxBuilder;
use crate::types::Ty;

/// Blocks until at most `num` groups of asynchronous copies are still in flight.
pub fn emit_async_wait(builder: &mut FuncBuilder, num: u32) {
    let mut ptx = PtxBuilder::new();
    let groups = ptx.new_constant_operand(num.into());
    ptx.create("cp.async.wait_group").push(groups);
    ptx.launch(builder, Ty::Void);
}
