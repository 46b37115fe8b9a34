use super::{LoweringError, Rewriter};
use crate::ir::{Global, Linkage, Module, Symbol};
use crate::kernel::HlValue;
use crate::layout::Layout;
use crate::smem::SharedMemoryObject;
use crate::types::{Ty, SHARED_ADDR_SPACE};

const OP: &str = "alloc_tensor";

/// The zero-length array marking the start of dynamically-sized shared memory.
pub const SHARED_MEMORY_GLOBAL: &str = "global_smem";

/// Returns the module's shared-memory global, declaring it if needed.
pub fn declare_shared_memory(module: &mut Module) -> Result<Global, LoweringError> {
    match module.lookup(SHARED_MEMORY_GLOBAL) {
        Some(Symbol::Global(g)) => return Ok(g.clone()),
        Some(_) => {
            return Err(LoweringError::SymbolConflict(
                SHARED_MEMORY_GLOBAL.to_string(),
            ))
        }
        None => {}
    }
    let global = Global {
        name: SHARED_MEMORY_GLOBAL.to_string(),
        ty: Ty::array(Ty::i8(), 0),
        addr_space: SHARED_ADDR_SPACE,
        constant: false,
        linkage: Linkage::External,
        init: None,
    };
    log::trace!("declaring @{SHARED_MEMORY_GLOBAL}");
    module.insert_front(Symbol::Global(global.clone()));
    Ok(global)
}

pub fn lower_alloc_tensor(rw: &mut Rewriter<'_>, result: HlValue) -> Result<(), LoweringError> {
    let ty = rw.tensor_type(result, OP)?;
    let Layout::Shared(encoding) = &ty.encoding else {
        return Err(LoweringError::unsupported(
            OP,
            format!("{} is not a shared-memory encoding", ty.encoding),
        ));
    };
    let order = encoding.allocation_order(ty.rank())?;
    let raw = rw.shared_memory_base(result)?;
    let base = rw
        .builder
        .bitcast(raw, Ty::ptr(ty.elem.clone(), SHARED_ADDR_SPACE));
    let smem = SharedMemoryObject::new(&mut rw.builder, base, ty.shape.clone(), order)
        .ok_or_else(|| {
            LoweringError::unsupported(OP, format!("strides of {ty} do not fit in i32"))
        })?;
    let lowered = smem.to_struct(&mut rw.builder)?;
    rw.bind(result, lowered);
    Ok(())
}
