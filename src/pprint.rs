//! Textual rendering of [Module]s in an LLVM-like syntax.

use crate::ir::{ConstValue, Function, Global, Inst, InstKind, Module, Symbol, Value};
use crate::types::{Ty, GENERIC_ADDR_SPACE};
use itertools::Itertools;
use std::fmt::{self, Write};

const INDENT: &str = "  ";

/// Renders a whole module, one symbol after another.
pub fn pprint_module(module: &Module) -> String {
    let mut out = String::new();
    pprint_module_write(&mut out, module).expect("writing to a String cannot fail");
    out
}

pub fn pprint_module_write<W: Write>(out: &mut W, module: &Module) -> fmt::Result {
    for (idx, symbol) in module.symbols().enumerate() {
        if idx > 0 && matches!(symbol, Symbol::Func(_)) {
            writeln!(out)?;
        }
        match symbol {
            Symbol::Global(g) => write_global(out, g)?,
            Symbol::Decl(d) => {
                let Ty::Func { ret, params } = &d.ty else {
                    unreachable!("declaration of non-function type {}", d.ty);
                };
                writeln!(out, "declare {ret} @{}({})", d.name, params.iter().join(", "))?
            }
            Symbol::Func(f) => write_function(out, f)?,
        }
    }
    Ok(())
}

fn write_global<W: Write>(out: &mut W, global: &Global) -> fmt::Result {
    write!(out, "@{} = {}", global.name, global.linkage)?;
    if global.addr_space != GENERIC_ADDR_SPACE {
        write!(out, " addrspace({})", global.addr_space)?;
    }
    let kind = if global.constant { "constant" } else { "global" };
    write!(out, " {kind} {}", global.ty)?;
    if let Some(bytes) = &global.init {
        write!(out, " c\"{}\"", escape_bytes(bytes))?;
    }
    writeln!(out)
}

/// Escapes bytes the way LLVM prints `c"..."` string constants.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut escaped = String::with_capacity(bytes.len());
    for &b in bytes {
        if (b.is_ascii_graphic() && b != b'"' && b != b'\\') || b == b' ' {
            escaped.push(char::from(b));
        } else {
            write!(escaped, "\\{b:02X}").unwrap();
        }
    }
    escaped
}

fn write_function<W: Write>(out: &mut W, func: &Function) -> fmt::Result {
    for (key, value) in &func.attrs {
        writeln!(out, "; {key} = {value}")?;
    }
    let params = func
        .params
        .iter()
        .map(|p| format!("{} {p}", func.ty(*p)))
        .join(", ");
    writeln!(out, "define {} @{}({params}) {{", func.ret, func.name)?;
    for inst in &func.body {
        write!(out, "{INDENT}")?;
        write_inst(out, func, inst)?;
        writeln!(out)?;
    }
    writeln!(out, "}}")
}

fn typed(func: &Function, value: Value) -> String {
    format!("{} {value}", func.ty(value))
}

fn write_inst<W: Write>(out: &mut W, func: &Function, inst: &Inst) -> fmt::Result {
    if let Some(result) = inst.result {
        write!(out, "{result} = ")?;
    }
    match &inst.kind {
        InstKind::Const(c) => {
            write!(out, "const {} ", inst.ty)?;
            match c {
                ConstValue::Int(i) => write!(out, "{i}"),
                ConstValue::Float(x) => write!(out, "{x:?}"),
                ConstValue::Null => write!(out, "null"),
                ConstValue::Undef => write!(out, "undef"),
            }
        }
        InstKind::Binary { op, lhs, rhs } => {
            write!(out, "{op} {}, {rhs}", typed(func, *lhs))
        }
        InstKind::Cast { op, value } => {
            write!(out, "{op} {} to {}", typed(func, *value), inst.ty)
        }
        InstKind::Gep { base, indices } => {
            let pointee = func
                .ty(*base)
                .pointee()
                .map(|p| p.to_string())
                .unwrap_or_default();
            write!(out, "getelementptr {pointee}, {}", typed(func, *base))?;
            for idx in indices {
                write!(out, ", {}", typed(func, *idx))?;
            }
            Ok(())
        }
        InstKind::ExtractValue { aggregate, index } => {
            write!(out, "extractvalue {}, {index}", typed(func, *aggregate))
        }
        InstKind::InsertValue {
            aggregate,
            value,
            index,
        } => write!(
            out,
            "insertvalue {}, {}, {index}",
            typed(func, *aggregate),
            typed(func, *value)
        ),
        InstKind::Alloca { elem, count, align } => {
            write!(out, "alloca {elem}, {}", typed(func, *count))?;
            if *align > 0 {
                write!(out, ", align {align}")?;
            }
            Ok(())
        }
        InstKind::Store { value, ptr } => {
            write!(out, "store {}, {}", typed(func, *value), typed(func, *ptr))
        }
        InstKind::AddressOf { global } => write!(out, "addressof {} @{global}", inst.ty),
        InstKind::Call { callee, args } => write!(
            out,
            "call {} @{callee}({})",
            inst.ty,
            args.iter().map(|a| typed(func, *a)).join(", ")
        ),
        InstKind::InlineAsm {
            asm,
            constraints,
            operands,
            side_effects,
        } => {
            write!(out, "call {} asm ", inst.ty)?;
            if *side_effects {
                write!(out, "sideeffect ")?;
            }
            write!(
                out,
                "\"{}\", \"{}\"({})",
                asm.escape_default(),
                constraints,
                operands.iter().map(|o| typed(func, *o)).join(", ")
            )
        }
        InstKind::ReadReg(reg) => write!(out, "call i32 @llvm.nvvm.read.ptx.sreg.{reg}()"),
        InstKind::Return { values } => {
            if values.is_empty() {
                write!(out, "ret void")
            } else {
                write!(
                    out,
                    "ret {}",
                    values.iter().map(|v| typed(func, *v)).join(", ")
                )
            }
        }
    }
}
