//! Shared-memory planning for a kernel's scratch tensors.

use crate::common::volume;
use crate::kernel::{HlValue, Kernel, Op};
use std::collections::HashMap;
use std::ops::Range;

/// Byte ranges of every `alloc_tensor` result within the kernel's shared-memory region.
///
/// Buffers are placed one after another, each aligned to the configured boundary. Nothing is
/// reused, so the plan is valid regardless of buffer lifetimes. Sizes saturate at `u64::MAX`;
/// whether a buffer is addressable is checked when it is lowered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    buffers: HashMap<HlValue, Range<u64>>,
    total_bytes: u64,
}

impl Allocation {
    pub fn plan(kernel: &Kernel, alignment: u32) -> Self {
        let alignment = u64::from(alignment.max(1));
        let mut allocation = Allocation::default();
        for op in &kernel.ops {
            let Op::AllocTensor { result } = op else {
                continue;
            };
            let Some(ty) = kernel.ty(*result).as_tensor() else {
                continue;
            };
            let bytes = volume(&ty.shape).saturating_mul(u64::from(ty.elem.size_in_bytes()));
            let offset = allocation
                .total_bytes
                .checked_next_multiple_of(alignment)
                .unwrap_or(u64::MAX);
            let end = offset.saturating_add(bytes);
            log::debug!("placing {result} ({bytes} bytes) at shared-memory offset {offset}");
            allocation.buffers.insert(*result, offset..end);
            allocation.total_bytes = end;
        }
        allocation
    }

    pub fn offset(&self, value: HlValue) -> Option<u64> {
        self.buffers.get(&value).map(|r| r.start)
    }

    /// The byte range planned for `value`.
    pub fn range(&self, value: HlValue) -> Option<Range<u64>> {
        self.buffers.get(&value).cloned()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
