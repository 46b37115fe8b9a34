//! Small kernels exercising each lowering, used by the command-line driver.

use crate::kernel::{Kernel, KernelBuilder, KernelError, SliceOffset, TensorType};
use crate::layout::{BlockedLayout, Layout, LayoutError, SharedLayout};
use crate::shape;
use crate::types::{FloatKind, Ty};
use smallvec::smallvec;

/// A row-major blocked layout for 4 warps of 32 threads.
pub fn blocked_2d(size_per_thread: [u32; 2]) -> Result<Layout, LayoutError> {
    Ok(BlockedLayout::new(
        size_per_thread.to_vec(),
        vec![4, 8],
        vec![4, 1],
        smallvec![1, 0],
    )?
    .into())
}

pub fn blocked_1d(size_per_thread: u32) -> Result<Layout, LayoutError> {
    Ok(BlockedLayout::new(vec![size_per_thread], vec![32], vec![4], smallvec![0])?.into())
}

pub fn broadcast_kernel() -> Result<Kernel, KernelError> {
    let layout = blocked_2d([1, 2])?;
    let mut kb = KernelBuilder::new("broadcast_rows");
    let row = kb.param(TensorType::new(shape![1, 64], Ty::f32(), layout.clone()));
    kb.broadcast(row, TensorType::new(shape![16, 64], Ty::f32(), layout));
    kb.ret(vec![]);
    Ok(kb.finish())
}

pub fn add_ptr_kernel() -> Result<Kernel, KernelError> {
    let layout = blocked_1d(1)?;
    let f32_ptr = Ty::ptr(Ty::f32(), 1);
    let mut kb = KernelBuilder::new("add_ptr");
    let base = kb.param(f32_ptr.clone());
    let ptrs = kb.param(TensorType::new(shape![128], f32_ptr, layout.clone()));
    let offsets = kb.param(TensorType::new(shape![128], Ty::i32(), layout));
    let pid = kb.get_program_id(0);
    kb.add_ptr(base, pid);
    kb.add_ptr(ptrs, offsets);
    kb.ret(vec![]);
    Ok(kb.finish())
}

pub fn alloc_slice_kernel() -> Result<Kernel, KernelError> {
    let encoding = SharedLayout::new(8, 1, 8, smallvec![1, 0]);
    let mut kb = KernelBuilder::new("alloc_slice");
    let stages = kb.alloc_tensor(TensorType::new(
        shape![3, 32, 64],
        Ty::Float(FloatKind::F16),
        encoding,
    ));
    let stage = kb.get_program_id(0);
    let tile = kb.extract_slice(
        stages,
        vec![
            SliceOffset::Dynamic(stage),
            SliceOffset::Static(0),
            SliceOffset::Static(0),
        ],
        shape![1, 32, 64],
        vec![1, 1, 1],
    )?;
    kb.extract_slice(
        tile,
        vec![SliceOffset::Static(16), SliceOffset::Static(0)],
        shape![16, 64],
        vec![1, 1],
    )?;
    kb.ret(vec![]);
    Ok(kb.finish())
}

pub fn printf_kernel(prefix: &str) -> Result<Kernel, KernelError> {
    let mut kb = KernelBuilder::new("print_ids");
    let pid = kb.get_program_id(0);
    let small = kb.param(Ty::sint(8));
    let half = kb.param(Ty::Float(FloatKind::F16));
    let range = kb.make_range(0, 128, blocked_1d(1)?)?;
    kb.printf(prefix, vec![pid, small, half, range]);
    kb.printf("done", vec![]);
    kb.ret(vec![]);
    Ok(kb.finish())
}

pub fn async_wait_kernel(num: u32) -> Result<Kernel, KernelError> {
    let mut kb = KernelBuilder::new("async_wait");
    kb.async_wait(num);
    kb.ret(vec![]);
    Ok(kb.finish())
}

pub fn make_range_kernel(start: u32, end: u32) -> Result<Kernel, KernelError> {
    let len = end.saturating_sub(start);
    let spt = len.div_ceil(128).max(1);
    let mut kb = KernelBuilder::new("make_range");
    kb.make_range(start, end, blocked_1d(spt)?)?;
    kb.get_num_programs(0);
    kb.ret(vec![]);
    Ok(kb.finish())
}

/// One of each demonstration kernel.
pub fn all_kernels() -> Result<Vec<Kernel>, KernelError> {
    Ok(vec![
        broadcast_kernel()?,
        add_ptr_kernel()?,
        alloc_slice_kernel()?,
        printf_kernel("pid, x, h, i: ")?,
        async_wait_kernel(0)?,
        make_range_kernel(0, 256)?,
    ])
}
