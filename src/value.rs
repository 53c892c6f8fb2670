//! Managed value model.
//!
//! [`ManagedType`] is the closed description of every type this core can
//! represent across the boundary; generated binding code constructs these
//! tokens and hands them to the marshaler. [`MarshalKind`] is the closed
//! dispatch tag computed once per type; marshaling code matches on it
//! exhaustively instead of chaining predicates. [`Value`] carries managed
//! values on this side of the boundary.

use std::fmt;

use once_cell::sync::OnceCell;

use crate::marshal::closure::ManagedCallable;
use crate::marshal::nominal::NominalValue;
use crate::metadata::Metatype;
use crate::registry::ObjectRef;
use crate::runtime::ForeignRuntime;

/// Parameter ownership for closure parameters, encoded in the low byte of
/// the per-parameter flag word of a function-type metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamOwnership {
    #[default]
    Default,
    InOut,
}

impl ParamOwnership {
    pub fn flag_bits(self) -> u32 {
        match self {
            ParamOwnership::Default => 0,
            ParamOwnership::InOut => 1,
        }
    }
}

/// One closure parameter: its type plus ownership/variadic flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClosureParam {
    pub ty: ManagedType,
    pub ownership: ParamOwnership,
    pub variadic: bool,
}

impl ClosureParam {
    pub fn plain(ty: ManagedType) -> Self {
        ClosureParam {
            ty,
            ownership: ParamOwnership::Default,
            variadic: false,
        }
    }

    /// Per-parameter flag word for the function-type metadata request.
    pub fn flag_bits(&self) -> u32 {
        let mut bits = self.ownership.flag_bits();
        if self.variadic {
            bits |= 0x100;
        }
        bits
    }
}

/// Parameter/return shape of a cross-boundary callable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClosureShape {
    pub params: Vec<ClosureParam>,
    /// `None` for an action (no return value).
    pub result: Option<Box<ManagedType>>,
}

/// Closed description of a type representable across the boundary.
///
/// Named variants (`Nominal`, `TrivialEnum`, `Object`, `Protocol`) carry the
/// identifier under which the type was registered in the
/// [`TypeTable`](crate::registry::TypeTable).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManagedType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Platform-width signed integer.
    Int,
    /// Platform-width unsigned integer.
    UInt,
    Tuple(Vec<ManagedType>),
    /// A registered struct/enum value type whose layout is known only via
    /// its witness table.
    Nominal(String),
    /// A registered enum with a closed set of nullary cases, marshaled as a
    /// machine-word tag.
    TrivialEnum(String),
    /// A registered class type, marshaled as a refcounted pointer.
    Object(String),
    /// A registered protocol, marshaled as an existential container.
    Protocol(String),
    Closure(ClosureShape),
    /// A foreign error value.
    Error,
}

/// The closed marshal classification, computed once per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarshalKind {
    /// Fixed-width scalar.
    Scalar,
    /// Platform-width int/uint.
    Machine,
    Tuple,
    TrivialEnum,
    Nominal,
    Object,
    Existential,
    Error,
    Closure,
}

impl ManagedType {
    /// Classify this type for marshal dispatch.
    pub fn marshal_kind(&self) -> MarshalKind {
        match self {
            ManagedType::Bool
            | ManagedType::Int8
            | ManagedType::UInt8
            | ManagedType::Int16
            | ManagedType::UInt16
            | ManagedType::Int32
            | ManagedType::UInt32
            | ManagedType::Int64
            | ManagedType::UInt64
            | ManagedType::Float32
            | ManagedType::Float64 => MarshalKind::Scalar,
            ManagedType::Int | ManagedType::UInt => MarshalKind::Machine,
            ManagedType::Tuple(_) => MarshalKind::Tuple,
            ManagedType::Nominal(_) => MarshalKind::Nominal,
            ManagedType::TrivialEnum(_) => MarshalKind::TrivialEnum,
            ManagedType::Object(_) => MarshalKind::Object,
            ManagedType::Protocol(_) => MarshalKind::Existential,
            ManagedType::Closure(_) => MarshalKind::Closure,
            ManagedType::Error => MarshalKind::Error,
        }
    }

    /// Byte width of a fixed-width scalar; `None` for everything else.
    pub fn scalar_size(&self) -> Option<usize> {
        match self {
            ManagedType::Bool | ManagedType::Int8 | ManagedType::UInt8 => Some(1),
            ManagedType::Int16 | ManagedType::UInt16 => Some(2),
            ManagedType::Int32 | ManagedType::UInt32 | ManagedType::Float32 => Some(4),
            ManagedType::Int64 | ManagedType::UInt64 | ManagedType::Float64 => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for ManagedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedType::Bool => write!(f, "Bool"),
            ManagedType::Int8 => write!(f, "Int8"),
            ManagedType::UInt8 => write!(f, "UInt8"),
            ManagedType::Int16 => write!(f, "Int16"),
            ManagedType::UInt16 => write!(f, "UInt16"),
            ManagedType::Int32 => write!(f, "Int32"),
            ManagedType::UInt32 => write!(f, "UInt32"),
            ManagedType::Int64 => write!(f, "Int64"),
            ManagedType::UInt64 => write!(f, "UInt64"),
            ManagedType::Float32 => write!(f, "Float"),
            ManagedType::Float64 => write!(f, "Double"),
            ManagedType::Int => write!(f, "Int"),
            ManagedType::UInt => write!(f, "UInt"),
            ManagedType::Tuple(elems) => {
                write!(f, "(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            ManagedType::Nominal(name)
            | ManagedType::TrivialEnum(name)
            | ManagedType::Object(name)
            | ManagedType::Protocol(name) => write!(f, "{name}"),
            ManagedType::Closure(shape) => {
                write!(f, "(")?;
                for (i, p) in shape.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.ty)?;
                }
                write!(f, ") -> ")?;
                match &shape.result {
                    Some(r) => write!(f, "{r}"),
                    None => write!(f, "()"),
                }
            }
            ManagedType::Error => write!(f, "Error"),
        }
    }
}

/// Wrapper over a foreign error existential handle.
///
/// The handle addresses a refcounted foreign error box; ownership is
/// tracked by the marshaler's release path, not by this wrapper. The
/// human-readable description is fetched from the foreign side on first
/// access and cached.
#[derive(Debug, Clone)]
pub struct ForeignError {
    handle: usize,
    description: OnceCell<String>,
}

impl ForeignError {
    pub fn new(handle: usize) -> Self {
        ForeignError {
            handle,
            description: OnceCell::new(),
        }
    }

    pub fn handle(&self) -> usize {
        self.handle
    }

    /// The foreign error's description, computed lazily.
    pub fn description(&self, runtime: &ForeignRuntime) -> &str {
        self.description
            .get_or_init(|| runtime.error_description(self.handle as *mut std::ffi::c_void))
    }
}

impl PartialEq for ForeignError {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

/// Fixed-shape protocol existential container: three inline data words, the
/// payload metatype, then one witness-table word per conformed protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistentialContainer {
    pub data: [usize; 3],
    pub metatype: Metatype,
    pub witnesses: Vec<usize>,
}

impl ExistentialContainer {
    /// Total byte size of this container's foreign representation, derived
    /// from its own witness count.
    pub fn byte_size(&self) -> usize {
        (4 + self.witnesses.len()) * std::mem::size_of::<usize>()
    }
}

/// A managed value crossing the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Int(isize),
    UInt(usize),
    Tuple(Vec<Value>),
    Nominal(NominalValue),
    /// Tag of a trivial-enum case.
    EnumCase(isize),
    Object(ObjectRef),
    Existential(ExistentialContainer),
    Error(ForeignError),
    Closure(ManagedCallable),
}

impl Value {
    /// Short classification name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "Bool",
            Value::Int8(_) => "Int8",
            Value::UInt8(_) => "UInt8",
            Value::Int16(_) => "Int16",
            Value::UInt16(_) => "UInt16",
            Value::Int32(_) => "Int32",
            Value::UInt32(_) => "UInt32",
            Value::Int64(_) => "Int64",
            Value::UInt64(_) => "UInt64",
            Value::Float32(_) => "Float",
            Value::Float64(_) => "Double",
            Value::Int(_) => "Int",
            Value::UInt(_) => "UInt",
            Value::Tuple(_) => "Tuple",
            Value::Nominal(_) => "Nominal",
            Value::EnumCase(_) => "EnumCase",
            Value::Object(_) => "Object",
            Value::Existential(_) => "Existential",
            Value::Error(_) => "Error",
            Value::Closure(_) => "Closure",
        }
    }
}
