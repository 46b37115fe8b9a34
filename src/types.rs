use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub const GENERIC_ADDR_SPACE: u32 = 0;
pub const SHARED_ADDR_SPACE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Signedness {
    Signless,
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FloatKind {
    Bf16,
    F16,
    F32,
    F64,
}

/// A low-level type.
///
/// Integer types keep their signedness so that printing and argument promotion can tell signed
/// from unsigned values. Pointers are typed and carry an address space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Ty {
    Void,
    Int { bits: u8, signedness: Signedness },
    Float(FloatKind),
    Ptr { pointee: Box<Ty>, addr_space: u32 },
    Array { elem: Box<Ty>, len: u32 },
    Struct(Vec<Ty>),
    Func { ret: Box<Ty>, params: Vec<Ty> },
}

impl FloatKind {
    pub fn bits(&self) -> u8 {
        match self {
            FloatKind::Bf16 | FloatKind::F16 => 16,
            FloatKind::F32 => 32,
            FloatKind::F64 => 64,
        }
    }
}

impl Ty {
    pub fn int(bits: u8) -> Ty {
        Ty::Int {
            bits,
            signedness: Signedness::Signless,
        }
    }

    pub fn sint(bits: u8) -> Ty {
        Ty::Int {
            bits,
            signedness: Signedness::Signed,
        }
    }

    pub fn uint(bits: u8) -> Ty {
        Ty::Int {
            bits,
            signedness: Signedness::Unsigned,
        }
    }

    pub fn i8() -> Ty {
        Ty::int(8)
    }

    pub fn i32() -> Ty {
        Ty::int(32)
    }

    pub fn f32() -> Ty {
        Ty::Float(FloatKind::F32)
    }

    pub fn f64() -> Ty {
        Ty::Float(FloatKind::F64)
    }

    pub fn ptr(pointee: Ty, addr_space: u32) -> Ty {
        Ty::Ptr {
            pointee: Box::new(pointee),
            addr_space,
        }
    }

    /// The `i8*` type used for untyped addresses.
    pub fn i8_ptr() -> Ty {
        Ty::ptr(Ty::i8(), GENERIC_ADDR_SPACE)
    }

    pub fn array(elem: Ty, len: u32) -> Ty {
        Ty::Array {
            elem: Box::new(elem),
            len,
        }
    }

    pub fn func(ret: Ty, params: Vec<Ty>) -> Ty {
        Ty::Func {
            ret: Box::new(ret),
            params,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Ty::Int { .. })
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Ty::Float(_))
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Ty::Ptr { .. })
    }

    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Ty::Ptr { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    pub fn addr_space(&self) -> Option<u32> {
        match self {
            Ty::Ptr { addr_space, .. } => Some(*addr_space),
            _ => None,
        }
    }

    /// Returns the type of field `index` of a struct or array type.
    pub fn field(&self, index: u32) -> Option<&Ty> {
        match self {
            Ty::Struct(fields) => fields.get(usize::try_from(index).ok()?),
            Ty::Array { elem, len } if index < *len => Some(elem),
            _ => None,
        }
    }

    /// The number of bytes a value of this type occupies, without padding.
    pub fn size_in_bytes(&self) -> u32 {
        match self {
            Ty::Void | Ty::Func { .. } => 0,
            Ty::Int { bits, .. } => u32::from(*bits).div_ceil(8),
            Ty::Float(kind) => u32::from(kind.bits()) / 8,
            Ty::Ptr { .. } => 8,
            Ty::Array { elem, len } => elem.size_in_bytes() * len,
            Ty::Struct(fields) => fields.iter().map(|f| f.size_in_bytes()).sum(),
        }
    }
}

impl Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Int { bits, signedness } => match signedness {
                Signedness::Signless => write!(f, "i{bits}"),
                Signedness::Signed => write!(f, "si{bits}"),
                Signedness::Unsigned => write!(f, "ui{bits}"),
            },
            Ty::Float(kind) => write!(f, "{kind}"),
            Ty::Ptr {
                pointee,
                addr_space,
            } => {
                if *addr_space == GENERIC_ADDR_SPACE {
                    write!(f, "{pointee}*")
                } else {
                    write!(f, "{pointee} addrspace({addr_space})*")
                }
            }
            Ty::Array { elem, len } => write!(f, "[{len} x {elem}]"),
            Ty::Struct(fields) => {
                write!(f, "{{")?;
                for (idx, field) in fields.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {field}")?;
                }
                write!(f, " }}")
            }
            Ty::Func { ret, params } => {
                write!(f, "{ret} (")?;
                for (idx, param) in params.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ")")
            }
        }
    }
}
