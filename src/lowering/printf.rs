//! Device-side printing through `vprintf`.
//!
//! `vprintf` takes a format string and a pointer to a buffer holding the arguments, laid out as
//! a struct. Integers narrower than 32 bits and floats narrower than 64 bits are widened first,
//! matching C's default argument promotions.

use super::{LoweringError, Rewriter};
use crate::codec::unpack;
use crate::ir::{CastOp, FuncBuilder, FuncDecl, Global, Linkage, Module, Symbol, Value};
use crate::kernel::{HlType, HlValue};
use crate::layout::Layout;
use crate::types::{FloatKind, Signedness, Ty, GENERIC_ADDR_SPACE};
use itertools::Itertools;

pub const VPRINTF: &str = "vprintf";
pub const FORMAT_GLOBAL_PREFIX: &str = "printfFormat_";

/// The conversion specifier used to print a value of type `ty`.
pub fn format_substr(ty: &Ty) -> Result<&'static str, LoweringError> {
    match ty {
        Ty::Ptr { .. } => Ok("%p"),
        Ty::Float(_) => Ok("%f"),
        Ty::Int {
            signedness: Signedness::Signed,
            ..
        } => Ok("%i"),
        Ty::Int { .. } => Ok("%u"),
        _ => Err(LoweringError::UnsupportedPrintType(ty.clone())),
    }
}

/// Builds `prefix` followed by one comma-separated specifier per argument type.
///
/// # Examples
/// ```
/// # use tessera::lowering::printf::format_string;
/// # use tessera::types::Ty;
/// let tys = [Ty::sint(32), Ty::f32(), Ty::i8_ptr()];
/// assert_eq!(format_string("pid ", &tys).unwrap(), "pid %i, %f, %p");
/// ```
pub fn format_string(prefix: &str, tys: &[Ty]) -> Result<String, LoweringError> {
    let specifiers = tys.iter().map(format_substr).collect::<Result<Vec<_>, _>>()?;
    Ok(format!("{prefix}{}", specifiers.iter().join(", ")))
}

/// The type a value of type `ty` is widened to before being passed to `vprintf`.
pub fn promoted_type(ty: &Ty) -> Ty {
    match ty {
        Ty::Int { bits, signedness } if *bits < 32 => Ty::Int {
            bits: 32,
            signedness: *signedness,
        },
        Ty::Float(FloatKind::Bf16 | FloatKind::F16 | FloatKind::F32) => Ty::f64(),
        _ => ty.clone(),
    }
}

/// Widens `value` to its [promoted type](promoted_type).
///
/// Signed integers are sign-extended. Unsigned and signless integers are zero-extended.
pub fn promote(builder: &mut FuncBuilder, value: Value) -> Value {
    let ty = builder.ty(value).clone();
    let promoted = promoted_type(&ty);
    if promoted == ty {
        return value;
    }
    let op = match ty {
        Ty::Int {
            signedness: Signedness::Signed,
            ..
        } => CastOp::SExt,
        Ty::Int { .. } => CastOp::ZExt,
        _ => CastOp::FPExt,
    };
    builder.cast(op, value, promoted)
}

/// Returns the module's `vprintf` declaration, adding it at the front of the module if needed.
pub fn declare_vprintf(module: &mut Module) -> Result<FuncDecl, LoweringError> {
    let ty = Ty::func(Ty::i32(), vec![Ty::i8_ptr(), Ty::i8_ptr()]);
    match module.lookup(VPRINTF) {
        Some(Symbol::Decl(decl)) if decl.ty == ty => return Ok(decl.clone()),
        Some(Symbol::Func(func)) if func.func_type() == ty => {
            return Ok(FuncDecl {
                name: VPRINTF.to_string(),
                ty,
            })
        }
        Some(_) => return Err(LoweringError::SymbolConflict(VPRINTF.to_string())),
        None => {}
    }
    let decl = FuncDecl {
        name: VPRINTF.to_string(),
        ty,
    };
    log::trace!("declaring @{VPRINTF}");
    module.insert_front(Symbol::Decl(decl.clone()));
    Ok(decl)
}

/// Adds `text` plus a newline and NUL terminator as a new constant global.
///
/// Each call creates a new global, named with the smallest unused `printfFormat_<N>`.
pub fn intern_format_string(module: &mut Module, text: &str) -> Global {
    let mut bytes = text.as_bytes().to_vec();
    bytes.extend_from_slice(b"\n\0");
    let global = Global {
        name: module.unique_name(FORMAT_GLOBAL_PREFIX),
        ty: Ty::array(Ty::i8(), u32::try_from(bytes.len()).unwrap()),
        addr_space: GENERIC_ADDR_SPACE,
        constant: true,
        linkage: Linkage::Internal,
        init: Some(bytes),
    };
    log::trace!("interning format string @{}: {text:?}", global.name);
    module.insert_front(Symbol::Global(global.clone()));
    global
}

/// Emits a `vprintf` call printing `prefix` followed by `args`.
pub fn emit_printf(
    builder: &mut FuncBuilder,
    module: &mut Module,
    prefix: &str,
    args: &[Value],
) -> Result<(), LoweringError> {
    let arg_tys = args.iter().map(|a| builder.ty(*a).clone()).collect::<Vec<_>>();
    let text = format_string(prefix, &arg_tys)?;
    let vprintf = declare_vprintf(module)?;
    let format = intern_format_string(module, &text);

    let zero = builder.i32_const(0);
    let format_addr = builder.address_of(&format);
    let format_ptr = builder.gep(Ty::i8_ptr(), format_addr, vec![zero, zero]);

    let buffer = if args.is_empty() {
        builder.null(Ty::i8_ptr())
    } else {
        let promoted = args
            .iter()
            .map(|a| promote(builder, *a))
            .collect::<Vec<_>>();
        let field_tys = promoted
            .iter()
            .map(|v| builder.ty(*v).clone())
            .collect::<Vec<_>>();
        let one = builder.i32_const(1);
        let allocated = builder.alloca(Ty::Struct(field_tys.clone()), one, 0);
        for (index, (value, field_ty)) in promoted.into_iter().zip(field_tys).enumerate() {
            let index = builder.i32_const(i32::try_from(index).unwrap());
            let field_ptr = builder.gep(
                Ty::ptr(field_ty, GENERIC_ADDR_SPACE),
                allocated,
                vec![zero, index],
            );
            builder.store(value, field_ptr);
        }
        builder.bitcast(allocated, Ty::i8_ptr())
    };
    builder.call(&vprintf, vec![format_ptr, buffer]);
    Ok(())
}

pub fn lower_printf(
    rw: &mut Rewriter<'_>,
    prefix: &str,
    args: &[HlValue],
) -> Result<(), LoweringError> {
    let mut flat = vec![];
    for &arg in args {
        let lowered = rw.lookup(arg)?;
        match rw.hl_type(arg) {
            HlType::Tensor(t) if matches!(t.encoding, Layout::Shared(_)) => {
                return Err(LoweringError::UnsupportedPrintType(
                    rw.builder.ty(lowered).clone(),
                ));
            }
            HlType::Tensor(_) => flat.extend(unpack(&mut rw.builder, lowered)),
            HlType::Scalar(_) => flat.push(lowered),
        }
    }
    emit_printf(&mut rw.builder, rw.module, prefix, &flat)
}
