//! Lowering of tensor-level kernels to per-thread code.
//!
//! A [LoweringSession] owns the output [Module]. Each [Kernel] is lowered one op at a time into
//! a single function; each op's lowering reads the lowered forms of its operands and binds the
//! lowered form of its result.

pub mod addptr;
pub mod alloc;
pub mod async_wait;
pub mod broadcast;
pub mod indices;
pub mod printf;
pub mod slice;
pub mod structural;

use crate::allocation::Allocation;
use crate::codec::CodecError;
use crate::config::{FailurePolicy, LoweringConfig};
use crate::ir::{FuncBuilder, Module, Symbol, Value};
use crate::kernel::{HlType, HlValue, Kernel, Op, TensorType};
use crate::layout::{DistributedLayout, Layout, LayoutError};
use crate::typeconv::convert_type;
use crate::types::{Ty, SHARED_ADDR_SPACE};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt::{self, Display};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LoweringError {
    #[error("Unsupported {op}: {reason}")]
    UnsupportedOperation { op: &'static str, reason: String },
    #[error("No source element corresponds to coordinate {coord:?}")]
    MalformedLayoutCorrespondence { coord: Vec<u32> },
    #[error("Cannot print values of type {0}")]
    UnsupportedPrintType(Ty),
    #[error("Only unit-stride slices are supported, but dimension {dim} has stride {stride}")]
    UnsupportedSlice { dim: usize, stride: u32 },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Value {0} is used before it is defined")]
    UnboundValue(HlValue),
    #[error("No shared memory was planned for {0}")]
    MissingAllocation(HlValue),
    #[error("Symbol @{0} already exists with a different kind")]
    SymbolConflict(String),
    #[error("Expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Kernel(String),
    Op { index: usize, name: &'static str },
}

/// A [LoweringError] and where it occurred.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{location}: {error}")]
pub struct Diagnostic {
    pub location: Location,
    #[source]
    pub error: LoweringError,
}

#[derive(Debug, Default)]
pub struct LoweringSession {
    config: LoweringConfig,
    module: Module,
}

/// Per-kernel state shared by the individual op lowerings.
pub struct Rewriter<'a> {
    pub builder: FuncBuilder,
    pub module: &'a mut Module,
    pub config: &'a LoweringConfig,
    kernel: &'a Kernel,
    allocation: Allocation,
    mapping: HashMap<HlValue, Value>,
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Kernel(name) => write!(f, "kernel @{name}"),
            Location::Op { index, name } => write!(f, "op #{index} ({name})"),
        }
    }
}

impl LoweringError {
    pub fn unsupported(op: &'static str, reason: impl Into<String>) -> Self {
        LoweringError::UnsupportedOperation {
            op,
            reason: reason.into(),
        }
    }
}

impl LoweringSession {
    pub fn new(config: LoweringConfig) -> Self {
        LoweringSession {
            config,
            module: Module::new(),
        }
    }

    pub fn config(&self) -> &LoweringConfig {
        &self.config
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    /// Lowers `kernel` into a function of the same name.
    ///
    /// Under [FailurePolicy::Abort], the first failure is returned and nothing is added to the
    /// module other than symbols already interned by earlier ops. Under
    /// [FailurePolicy::Continue], failed ops are skipped, the function is still emitted, and
    /// every failure is returned.
    pub fn lower_kernel(&mut self, kernel: &Kernel) -> Result<(), Vec<Diagnostic>> {
        info!(
            "lowering kernel @{} ({} ops, {} threads per CTA)",
            kernel.name,
            kernel.ops.len(),
            self.config.threads_per_cta()
        );
        let at_kernel = |error: LoweringError| {
            vec![Diagnostic {
                location: Location::Kernel(kernel.name.clone()),
                error,
            }]
        };

        let param_tys = kernel
            .params
            .iter()
            .map(|p| convert_type(kernel.ty(*p)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| at_kernel(e.into()))?;
        let mut builder = FuncBuilder::new(kernel.name.clone(), param_tys, Ty::Void);
        builder.set_attr("nvvm.kernel", "1");
        builder.set_attr("nvvm.maxntid", self.config.threads_per_cta().to_string());
        let mapping = kernel
            .params
            .iter()
            .copied()
            .zip(builder.params().iter().copied())
            .collect();

        let allocation = Allocation::plan(kernel, self.config.smem_alignment);
        if !allocation.is_empty() {
            info!(
                "kernel @{} uses {} bytes of shared memory",
                kernel.name,
                allocation.total_bytes()
            );
        }

        let mut rw = Rewriter {
            builder,
            module: &mut self.module,
            config: &self.config,
            kernel,
            allocation,
            mapping,
        };
        let mut diagnostics = vec![];
        for (index, op) in kernel.ops.iter().enumerate() {
            debug!("lowering op #{index}: {}", op.name());
            let checkpoint = rw.builder.checkpoint();
            if let Err(error) = rw.lower_op(op) {
                rw.builder.rollback(checkpoint);
                if let Some(result) = op.result() {
                    rw.mapping.remove(&result);
                }
                let diagnostic = Diagnostic {
                    location: Location::Op {
                        index,
                        name: op.name(),
                    },
                    error,
                };
                match self.config.failure_policy {
                    FailurePolicy::Abort => return Err(vec![diagnostic]),
                    FailurePolicy::Continue => {
                        warn!("{diagnostic}");
                        diagnostics.push(diagnostic);
                    }
                }
            }
        }
        if !rw.builder.is_terminated() {
            rw.builder.ret(vec![]);
        }

        let func = rw.builder.finish();
        if !self.module.push(Symbol::Func(func)) {
            diagnostics.extend(at_kernel(LoweringError::SymbolConflict(
                kernel.name.clone(),
            )));
        }
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(diagnostics)
        }
    }
}

impl<'a> Rewriter<'a> {
    fn lower_op(&mut self, op: &Op) -> Result<(), LoweringError> {
        self.check_layouts(op)?;
        match op {
            Op::Broadcast { source, result } => broadcast::lower_broadcast(self, *source, *result),
            Op::AddPtr {
                ptr,
                offset,
                result,
            } => addptr::lower_add_ptr(self, *ptr, *offset, *result),
            Op::AllocTensor { result } => alloc::lower_alloc_tensor(self, *result),
            Op::ExtractSlice {
                source,
                offsets,
                sizes,
                strides,
                result,
            } => slice::lower_extract_slice(self, *source, offsets, sizes, strides, *result),
            Op::Printf { prefix, args } => printf::lower_printf(self, prefix, args),
            Op::AsyncWait { num } => {
                async_wait::emit_async_wait(&mut self.builder, *num);
                Ok(())
            }
            Op::GetProgramId { axis, result } => {
                structural::lower_get_program_id(self, *axis, *result)
            }
            Op::GetNumPrograms { axis, result } => {
                structural::lower_get_num_programs(self, *axis, *result)
            }
            Op::MakeRange { start, result, .. } => {
                structural::lower_make_range(self, *start, *result)
            }
            Op::Return { operands } => structural::lower_return(self, operands),
        }
    }

    /// Rejects blocked layouts that do not match the configured CTA shape.
    fn check_layouts(&self, op: &Op) -> Result<(), LoweringError> {
        let values = op.operands().into_iter().chain(op.result());
        for value in values {
            let Some(tensor) = self.hl_type(value).as_tensor() else {
                continue;
            };
            let Some(blocked) = tensor.encoding.blocked_root() else {
                continue;
            };
            let warps: u32 = blocked.warps_per_cta().iter().product();
            let threads: u32 = blocked.threads_per_warp().iter().product();
            if warps != self.config.num_warps.get()
                || threads != self.config.threads_per_warp.get()
            {
                return Err(LoweringError::unsupported(
                    op.name(),
                    format!(
                        "{} does not match {} warps of {} threads",
                        tensor.encoding, self.config.num_warps, self.config.threads_per_warp
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn hl_type(&self, value: HlValue) -> &'a HlType {
        self.kernel.ty(value)
    }

    pub fn tensor_type(
        &self,
        value: HlValue,
        op: &'static str,
    ) -> Result<&'a TensorType, LoweringError> {
        self.hl_type(value)
            .as_tensor()
            .ok_or_else(|| LoweringError::unsupported(op, format!("{value} is not a tensor")))
    }

    /// The lowered form of `value`.
    pub fn lookup(&self, value: HlValue) -> Result<Value, LoweringError> {
        self.mapping
            .get(&value)
            .copied()
            .ok_or(LoweringError::UnboundValue(value))
    }

    pub fn bind(&mut self, value: HlValue, lowered: Value) {
        let prev = self.mapping.insert(value, lowered);
        debug_assert!(prev.is_none(), "{value} bound twice");
    }

    /// The address of the shared-memory buffer planned for `value`, as an `i8 addrspace(3)*`.
    pub fn shared_memory_base(&mut self, value: HlValue) -> Result<Value, LoweringError> {
        let range = self
            .allocation
            .range(value)
            .ok_or(LoweringError::MissingAllocation(value))?;
        if i32::try_from(range.end).is_err() {
            return Err(LoweringError::unsupported(
                "alloc_tensor",
                format!(
                    "shared-memory buffer {}..{} is not addressable with i32",
                    range.start, range.end
                ),
            ));
        }
        let offset = i32::try_from(range.start).unwrap();
        let global = alloc::declare_shared_memory(self.module)?;
        let addr = self.builder.address_of(&global);
        let zero = self.builder.i32_const(0);
        let offset = self.builder.i32_const(offset);
        Ok(self.builder.gep(
            Ty::ptr(Ty::i8(), SHARED_ADDR_SPACE),
            addr,
            vec![zero, offset],
        ))
    }

    /// Per-thread element count of a distributed tensor.
    pub fn elems_per_thread(&self, ty: &TensorType) -> Result<u32, LoweringError> {
        match &ty.encoding {
            Layout::Shared(_) => Err(LayoutError::NotDistributed.into()),
            layout => Ok(layout.elems_per_thread(&ty.shape)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Axis, BinOp, CastOp, ConstValue, Function, InstKind, SpecialReg};
    use crate::kernel::{KernelBuilder, SliceOffset};
    use crate::layout::{BlockedLayout, SharedLayout};
    use crate::shape;
    use smallvec::smallvec;

    fn blocked(spt: [u32; 2], tpw: [u32; 2], wpc: [u32; 2]) -> Layout {
        BlockedLayout::new(spt.to_vec(), tpw.to_vec(), wpc.to_vec(), smallvec![1, 0])
            .unwrap()
            .into()
    }

    fn const_int(func: &Function, value: Value) -> Option<i64> {
        match func.def(value).map(|i| &i.kind) {
            Some(InstKind::Const(ConstValue::Int(x))) => Some(*x),
            _ => None,
        }
    }

    fn count(func: &Function, pred: impl Fn(&InstKind) -> bool) -> usize {
        func.body.iter().filter(|i| pred(&i.kind)).count()
    }

    fn lower_one(kernel: &Kernel) -> Result<Module, Vec<Diagnostic>> {
        let mut session = LoweringSession::default();
        session.lower_kernel(kernel)?;
        Ok(session.into_module())
    }

    #[test]
    fn test_kernel_gets_implicit_return() {
        let mut kb = KernelBuilder::new("k");
        kb.async_wait(0);
        let kernel = kb.finish();
        let mut session = LoweringSession::default();
        session.lower_kernel(&kernel).unwrap();
        let func = session.module().function("k").unwrap();
        assert!(matches!(
            func.body.last().map(|i| &i.kind),
            Some(InstKind::Return { values }) if values.is_empty()
        ));
        assert_eq!(func.attr("nvvm.maxntid"), Some("128"));
    }

    #[test]
    fn test_duplicate_kernel_name_conflicts() {
        let kernel = KernelBuilder::new("k").finish();
        let mut session = LoweringSession::default();
        session.lower_kernel(&kernel).unwrap();
        let errs = session.lower_kernel(&kernel).unwrap_err();
        assert_eq!(
            errs,
            vec![Diagnostic {
                location: Location::Kernel("k".to_string()),
                error: LoweringError::SymbolConflict("k".to_string()),
            }]
        );
    }

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic {
            location: Location::Op {
                index: 2,
                name: "return",
            },
            error: LoweringError::unsupported(
                "return",
                "only kernels returning nothing are supported",
            ),
        };
        assert_eq!(
            diagnostic.to_string(),
            "op #2 (return): Unsupported return: only kernels returning nothing are supported"
        );
    }

    #[test]
    fn test_broadcast_row_across_tile() {
        let layout = blocked([1, 4], [8, 4], [4, 1]);
        let mut kb = KernelBuilder::new("k");
        let row = kb.param(TensorType::new(shape![1, 16], Ty::f32(), layout.clone()));
        kb.broadcast(row, TensorType::new(shape![16, 16], Ty::f32(), layout));
        let module = lower_one(&kb.finish()).unwrap();
        let func = module.function("k").unwrap();
        assert_eq!(count(func, |k| matches!(k, InstKind::ExtractValue { .. })), 4);
        assert_eq!(count(func, |k| matches!(k, InstKind::InsertValue { .. })), 4);
    }

    #[test]
    fn test_malformed_broadcast_correspondence() {
        let mut kb = KernelBuilder::new("k");
        let src = kb.param(TensorType::new(
            shape![1, 16],
            Ty::f32(),
            blocked([1, 4], [8, 4], [4, 1]),
        ));
        kb.broadcast(
            src,
            TensorType::new(shape![16, 16], Ty::f32(), blocked([1, 1], [8, 4], [4, 1])),
        );
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(
            errs[0].error,
            LoweringError::MalformedLayoutCorrespondence { .. }
        ));
    }

    #[test]
    fn test_slice_offsets_are_folded_into_base() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(
            shape![4, 16],
            Ty::f32(),
            SharedLayout::new(1, 1, 1, smallvec![1, 0]),
        ));
        let view = kb
            .extract_slice(
                buf,
                vec![SliceOffset::Static(2), SliceOffset::Static(3)],
                shape![1, 5],
                vec![1, 1],
            )
            .unwrap();
        assert_eq!(kb.ty(view).as_tensor().unwrap().shape, shape![5]);
        let module = lower_one(&kb.finish()).unwrap();
        let func = module.function("k").unwrap();
        let geps = func
            .insts_matching(|k| matches!(k, InstKind::Gep { .. }))
            .filter_map(|i| match &i.kind {
                InstKind::Gep { indices, .. } if indices.len() == 1 => const_int(func, indices[0]),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(geps, vec![35]);
        assert!(module.global("global_smem").is_some());
    }

    #[test]
    fn test_pipelined_buffer_slices_down_to_a_tile() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(
            shape![3, 32, 64],
            Ty::Float(crate::types::FloatKind::F16),
            SharedLayout::new(8, 1, 8, smallvec![1, 0]),
        ));
        let stage = kb.get_program_id(0);
        let tile = kb
            .extract_slice(
                buf,
                vec![
                    SliceOffset::Dynamic(stage),
                    SliceOffset::Static(0),
                    SliceOffset::Static(0),
                ],
                shape![1, 32, 64],
                vec![1, 1, 1],
            )
            .unwrap();
        let tile_ty = kb.ty(tile).as_tensor().unwrap().clone();
        assert_eq!(tile_ty.shape, shape![32, 64]);
        assert_eq!(
            tile_ty.encoding,
            Layout::from(SharedLayout::new(8, 1, 8, smallvec![1, 0]))
        );
        let module = lower_one(&kb.finish()).unwrap();
        let func = module.function("k").unwrap();

        let pid = func
            .insts_matching(|k| matches!(k, InstKind::ReadReg(SpecialReg::BlockId(Axis::X))))
            .find_map(|i| i.result)
            .unwrap();
        let stage_stride = func
            .insts_matching(|k| {
                matches!(k, InstKind::Binary { op: BinOp::Mul, lhs, .. } if *lhs == pid)
            })
            .find_map(|i| match i.kind {
                InstKind::Binary { rhs, .. } => const_int(func, rhs),
                _ => None,
            });
        assert_eq!(stage_stride, Some(2048));

        let geps = func
            .insts_matching(|k| matches!(k, InstKind::Gep { indices, .. } if indices.len() == 1))
            .collect::<Vec<_>>();
        assert_eq!(geps.len(), 1);
        let InstKind::Gep { base, indices } = &geps[0].kind else {
            unreachable!()
        };
        assert!(matches!(
            func.def(*base).map(|i| &i.kind),
            Some(InstKind::Cast {
                op: CastOp::Bitcast,
                ..
            })
        ));
        for s in 0..3 {
            let delta = func.eval_int(indices[0], &|v| (v == pid).then_some(s));
            assert_eq!(delta, Some(s * 2048));
        }

        // The tile packs as { base, 64, 1, 0, 0 }.
        let mut tile_fields = func
            .insts_matching(|_| true)
            .filter(|i| matches!(&i.ty, Ty::Struct(fields) if fields.len() == 5))
            .filter_map(|i| match i.kind {
                InstKind::InsertValue { value, index, .. } => Some((index, value)),
                _ => None,
            })
            .collect::<Vec<_>>();
        tile_fields.sort_by_key(|&(index, _)| index);
        assert_eq!(tile_fields[0], (0, geps[0].result.unwrap()));
        assert_eq!(
            tile_fields[1..]
                .iter()
                .map(|&(_, v)| const_int(func, v))
                .collect::<Vec<_>>(),
            vec![Some(64), Some(1), Some(0), Some(0)]
        );
    }

    #[test]
    fn test_dynamic_slice_offset_must_be_i32() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(
            shape![3, 32, 64],
            Ty::f32(),
            SharedLayout::new(1, 1, 1, smallvec![1, 0]),
        ));
        let stage = kb.param(Ty::sint(64));
        kb.extract_slice(
            buf,
            vec![
                SliceOffset::Dynamic(stage),
                SliceOffset::Static(0),
                SliceOffset::Static(0),
            ],
            shape![1, 32, 64],
            vec![1, 1, 1],
        )
        .unwrap();
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert_eq!(
            errs[0].error,
            LoweringError::TypeMismatch {
                expected: Ty::i32().to_string(),
                found: Ty::sint(64).to_string(),
            }
        );
    }

    #[test]
    fn test_unaddressable_allocation_is_rejected() {
        let mut kb = KernelBuilder::new("k");
        kb.alloc_tensor(TensorType::new(
            shape![2, 50000, 50000],
            Ty::f32(),
            SharedLayout::new(1, 1, 1, smallvec![1, 0]),
        ));
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(
            errs[0].error,
            LoweringError::UnsupportedOperation {
                op: "alloc_tensor",
                ..
            }
        ));
    }

    #[test]
    fn test_non_unit_stride_slice_is_rejected() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(
            shape![4, 16],
            Ty::f32(),
            SharedLayout::new(1, 1, 1, smallvec![1, 0]),
        ));
        kb.extract_slice(
            buf,
            vec![SliceOffset::Static(0), SliceOffset::Static(0)],
            shape![2, 8],
            vec![1, 2],
        )
        .unwrap();
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert_eq!(
            errs[0].error,
            LoweringError::UnsupportedSlice { dim: 1, stride: 2 }
        );
    }

    #[test]
    fn test_rank_4_allocation_is_unsupported() {
        let mut kb = KernelBuilder::new("k");
        kb.alloc_tensor(TensorType::new(
            shape![2, 2, 4, 4],
            Ty::f32(),
            SharedLayout::new(1, 1, 1, smallvec![1, 0]),
        ));
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert_eq!(
            errs,
            vec![Diagnostic {
                location: Location::Op {
                    index: 0,
                    name: "alloc_tensor"
                },
                error: LoweringError::Layout(LayoutError::UnsupportedSharedRank(4)),
            }]
        );
    }

    #[test]
    fn test_printf_shares_vprintf_across_kernels() {
        let mut session = LoweringSession::default();
        for name in ["a", "b"] {
            let mut kb = KernelBuilder::new(name);
            let x = kb.param(Ty::sint(8));
            let y = kb.param(Ty::uint(16));
            kb.printf("x, y: ", vec![x, y]);
            kb.printf("", vec![]);
            session.lower_kernel(&kb.finish()).unwrap();
        }
        let module = session.into_module();
        let decls = module
            .symbols()
            .filter(|s| matches!(s, Symbol::Decl(_)))
            .count();
        assert_eq!(decls, 1);
        for n in 0..4 {
            assert!(module.global(&format!("printfFormat_{n}")).is_some());
        }
        let first = module.global("printfFormat_0").unwrap();
        assert_eq!(first.init.as_deref(), Some(&b"x, y: %i, %u\n\0"[..]));
        assert_eq!(first.ty, Ty::array(Ty::i8(), 14));

        let func = module.function("a").unwrap();
        let Some(InstKind::Alloca { elem, .. }) = func
            .insts_matching(|k| matches!(k, InstKind::Alloca { .. }))
            .map(|i| &i.kind)
            .next()
        else {
            panic!("no argument buffer");
        };
        assert_eq!(
            *elem,
Ty::Struct(vec![Ty::sint(32), Ty::uint(32)])
        );
        assert_eq!(count(func, |k| matches!(k, InstKind::Call { .. })), 2);
    }

    #[test]
    fn test_printf_of_shared_tensor_is_rejected() {
        let mut kb = KernelBuilder::new("k");
        let buf = kb.alloc_tensor(TensorType::new(
            shape![4, 16],
            Ty::f32(),
            SharedLayout::new(1, 1, 1, smallvec![1, 0]),
        ));
        kb.printf("buf: ", vec![buf]);
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(errs[0].error, LoweringError::UnsupportedPrintType(_)));
    }

    #[test]
    fn test_return_with_operands_is_unsupported() {
        let mut kb = KernelBuilder::new("k");
        let x = kb.param(Ty::i32());
        kb.ret(vec![x]);
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(
            errs[0].error,
            LoweringError::UnsupportedOperation { op: "return", .. }
        ));
    }

    #[test]
    fn test_program_id_axis_out_of_range() {
        let mut kb = KernelBuilder::new("k");
        kb.get_program_id(3);
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(
            errs[0].error,
            LoweringError::UnsupportedOperation {
                op: "get_program_id",
                ..
            }
        ));
    }

    #[test]
    fn test_continue_policy_reports_every_failure() {
        let mut kb = KernelBuilder::new("k");
        kb.get_program_id(3);
        kb.async_wait(1);
        kb.get_num_programs(7);
        let kernel = kb.finish();

        let mut session = LoweringSession::new(LoweringConfig {
            failure_policy: FailurePolicy::Continue,
            ..LoweringConfig::default()
        });
        let errs = session.lower_kernel(&kernel).unwrap_err();
        assert_eq!(
            errs.iter().map(|d| d.location.clone()).collect::<Vec<_>>(),
            vec![
                Location::Op {
                    index: 0,
                    name: "get_program_id"
                },
                Location::Op {
                    index: 2,
                    name: "get_num_programs"
                },
            ]
        );
        let func = session.module().function("k").unwrap();
        assert_eq!(count(func, |k| matches!(k, InstKind::InlineAsm { .. })), 1);
        assert_eq!(count(func, |k| matches!(k, InstKind::ReadReg(_))), 0);

        let errs = LoweringSession::default().lower_kernel(&kernel).unwrap_err();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn test_abort_policy_emits_no_function() {
        let mut kb = KernelBuilder::new("k");
        kb.get_program_id(3);
        let mut session = LoweringSession::default();
        session.lower_kernel(&kb.finish()).unwrap_err();
        assert!(session.module().function("k").is_none());
    }

    #[test]
    fn test_layout_must_match_config() {
        let mut kb = KernelBuilder::new("k");
        kb.make_range(
            0,
            64,
            BlockedLayout::new(vec![1], vec![32], vec![2], smallvec![0]).unwrap(),
        )
        .unwrap();
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(
            errs[0].error,
            LoweringError::UnsupportedOperation {
                op: "make_range",
                ..
            }
        ));

        let mut session = LoweringSession::new(LoweringConfig {
            num_warps: nonzero::nonzero!(2u32),
            ..LoweringConfig::default()
        });
        let mut kb = KernelBuilder::new("k");
        kb.make_range(
            0,
            64,
            BlockedLayout::new(vec![1], vec![32], vec![2], smallvec![0]).unwrap(),
        )
        .unwrap();
        session.lower_kernel(&kb.finish()).unwrap();
    }

    #[test]
    fn test_add_ptr_over_tensor() {
        let layout: Layout = BlockedLayout::new(vec![2], vec![32], vec![4], smallvec![0])
            .unwrap()
            .into();
        let ptr_ty = Ty::ptr(Ty::f32(), 1);
        let mut kb = KernelBuilder::new("k");
        let ptrs = kb.param(TensorType::new(shape![256], ptr_ty, layout.clone()));
        let offsets = kb.param(TensorType::new(shape![256], Ty::i32(), layout));
        kb.add_ptr(ptrs, offsets);
        let module = lower_one(&kb.finish()).unwrap();
        let func = module.function("k").unwrap();
        assert_eq!(count(func, |k| matches!(k, InstKind::Gep { .. })), 2);
    }

    #[test]
    fn test_add_ptr_requires_pointers() {
        let mut kb = KernelBuilder::new("k");
        let x = kb.param(Ty::i32());
        let y = kb.param(Ty::i32());
        kb.add_ptr(x, y);
        let errs = lower_one(&kb.finish()).unwrap_err();
        assert!(matches!(errs[0].error, LoweringError::TypeMismatch { .. }));
    }

    #[test]
    fn test_make_range_adds_start() {
        let mut kb = KernelBuilder::new("k");
        kb.make_range(
            16,
            144,
            BlockedLayout::new(vec![1], vec![32], vec![4], smallvec![0]).unwrap(),
        )
        .unwrap();
        let module = lower_one(&kb.finish()).unwrap();
        let func = module.function("k").unwrap();
        let starts = func
            .insts_matching(|k| matches!(k, InstKind::Binary { op: BinOp::Add, .. }))
            .filter_map(|i| match i.kind {
                InstKind::Binary { rhs, .. } => const_int(func, rhs),
                _ => None,
            })
            .filter(|&c| c == 16)
            .count();
        assert_eq!(starts, 1);
    }
}
