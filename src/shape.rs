//! What generated code sees of a [`facet::Shape`].
//!
//! Types describe themselves by deriving [`Facet`]. This module sorts a shape
//! into the handful of kinds the planner knows how to lower, reads the field
//! attributes it cares about, and provides the key routines are cached under.

use core::fmt;
use core::hash::{Hash, Hasher};

use bitflags::bitflags;
use facet::{ArrayDef, Def, KnownPointer, ListDef, MapDef, OptionDef, ScalarType, StructKind, StructType, Type, UserType};

pub use facet::{Facet, Shape};

use crate::value::{AnyValue, Bytes, Value};

#[derive(Clone, Copy)]
pub enum ShapeKind {
    Unit,
    Bool,
    Int(IntKind),
    Float(FloatKind),
    String,
    /// [`Bytes`], base64 on the wire.
    Bytes,
    Struct(&'static StructType),
    Option(&'static OptionDef),
    /// `Box<T>`, holding the pointee's shape.
    Pointer(&'static Shape),
    Seq(&'static ListDef),
    Array(&'static ArrayDef),
    /// Maps keyed by `String`.
    Map(&'static MapDef),
    /// [`Value`].
    Dynamic,
    /// [`AnyValue`].
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl IntKind {
    pub const ALL: [IntKind; 8] = [
        IntKind::I8,
        IntKind::I16,
        IntKind::I32,
        IntKind::I64,
        IntKind::U8,
        IntKind::U16,
        IntKind::U32,
        IntKind::U64,
    ];

    pub const fn size(self) -> usize {
        match self {
            IntKind::I8 | IntKind::U8 => 1,
            IntKind::I16 | IntKind::U16 => 2,
            IntKind::I32 | IntKind::U32 => 4,
            IntKind::I64 | IntKind::U64 => 8,
        }
    }

    pub const fn signed(self) -> bool {
        matches!(self, IntKind::I8 | IntKind::I16 | IntKind::I32 | IntKind::I64)
    }

    /// Inclusive bounds as `i64` for signed kinds, or as `u64` bit patterns
    /// for unsigned ones.
    pub const fn bounds(self) -> (i64, i64) {
        match self {
            IntKind::I8 => (i8::MIN as i64, i8::MAX as i64),
            IntKind::I16 => (i16::MIN as i64, i16::MAX as i64),
            IntKind::I32 => (i32::MIN as i64, i32::MAX as i64),
            IntKind::I64 => (i64::MIN, i64::MAX),
            IntKind::U8 => (0, u8::MAX as i64),
            IntKind::U16 => (0, u16::MAX as i64),
            IntKind::U32 => (0, u32::MAX as i64),
            IntKind::U64 => (0, u64::MAX as i64),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            IntKind::I8 => "i8",
            IntKind::I16 => "i16",
            IntKind::I32 => "i32",
            IntKind::I64 => "i64",
            IntKind::U8 => "u8",
            IntKind::U16 => "u16",
            IntKind::U32 => "u32",
            IntKind::U64 => "u64",
        }
    }

    pub fn from_index(i: u64) -> Option<IntKind> {
        IntKind::ALL.get(i as usize).copied()
    }

    pub fn index(self) -> u64 {
        self as u64
    }

    fn from_scalar(scalar: ScalarType) -> Option<IntKind> {
        Some(match scalar {
            ScalarType::I8 => IntKind::I8,
            ScalarType::I16 => IntKind::I16,
            ScalarType::I32 => IntKind::I32,
            ScalarType::I64 => IntKind::I64,
            ScalarType::U8 => IntKind::U8,
            ScalarType::U16 => IntKind::U16,
            ScalarType::U32 => IntKind::U32,
            ScalarType::U64 => IntKind::U64,
            #[cfg(target_pointer_width = "64")]
            ScalarType::ISize => IntKind::I64,
            #[cfg(target_pointer_width = "64")]
            ScalarType::USize => IntKind::U64,
            #[cfg(target_pointer_width = "32")]
            ScalarType::ISize => IntKind::I32,
            #[cfg(target_pointer_width = "32")]
            ScalarType::USize => IntKind::U32,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    F32,
    F64,
}

impl FloatKind {
    pub const fn name(self) -> &'static str {
        match self {
            FloatKind::F32 => "f32",
            FloatKind::F64 => "f64",
        }
    }
}

impl ShapeKind {
    /// Sort `shape` into a kind, or say why it cannot be handled.
    pub fn of(shape: &'static Shape) -> Result<ShapeKind, &'static str> {
        if shape.id == Bytes::SHAPE.id {
            return Ok(ShapeKind::Bytes);
        }
        if shape.id == Value::SHAPE.id {
            return Ok(ShapeKind::Dynamic);
        }
        if shape.id == AnyValue::SHAPE.id {
            return Ok(ShapeKind::Any);
        }

        if let Some(scalar) = shape.scalar_type() {
            return match scalar {
                ScalarType::Unit => Ok(ShapeKind::Unit),
                ScalarType::Bool => Ok(ShapeKind::Bool),
                ScalarType::F32 => Ok(ShapeKind::Float(FloatKind::F32)),
                ScalarType::F64 => Ok(ShapeKind::Float(FloatKind::F64)),
                ScalarType::String => Ok(ShapeKind::String),
                ScalarType::Str | ScalarType::CowStr => Err("borrowed strings cannot be decoded into"),
                other => IntKind::from_scalar(other)
                    .map(ShapeKind::Int)
                    .ok_or("scalar type has no JSON mapping"),
            };
        }

        match &shape.def {
            Def::Option(def) => return Ok(ShapeKind::Option(def)),
            Def::List(def) => return Ok(ShapeKind::Seq(def)),
            Def::Array(def) => return Ok(ShapeKind::Array(def)),
            Def::Map(def) => {
                if def.k.scalar_type() != Some(ScalarType::String) {
                    return Err("map keys must be String");
                }
                return Ok(ShapeKind::Map(def));
            }
            Def::Pointer(def) => {
                return match (def.known, def.pointee) {
                    (Some(KnownPointer::Box), Some(pointee)) if pointee.layout.sized_layout().is_ok() => {
                        Ok(ShapeKind::Pointer(pointee))
                    }
                    _ => Err("only Box of a sized type is supported"),
                };
            }
            _ => {}
        }

        match &shape.ty {
            Type::User(UserType::Struct(st)) if matches!(st.kind, StructKind::Struct | StructKind::Unit) => {
                Ok(ShapeKind::Struct(st))
            }
            Type::User(UserType::Struct(_)) => Err("tuple structs have no field names"),
            Type::User(UserType::Enum(_)) => Err("enums are not supported"),
            _ => Err("no JSON mapping for this type"),
        }
    }
}

/// Size of one value of `shape`, which must be sized.
pub fn stride(shape: &'static Shape) -> Option<usize> {
    shape.layout.sized_layout().ok().map(|l| l.size())
}

/// Whether a default value of `shape` can be built in place.
pub fn has_default(shape: &'static Shape) -> bool {
    match shape.type_ops {
        Some(facet::TypeOps::Direct(ops)) => ops.default_in_place.is_some(),
        Some(facet::TypeOps::Indirect(ops)) => ops.default_in_place.is_some(),
        None => false,
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldFlags: u8 {
        /// `#[facet(jitson::omit_empty)]`: leave the field out when it holds
        /// its zero value or is empty.
        const OMIT_EMPTY = 1 << 0;
        /// `#[facet(jitson::quoted)]`: wrap a scalar in a JSON string.
        const QUOTED = 1 << 1;
        const SKIP_ENCODE = 1 << 2;
        const SKIP_DECODE = 1 << 3;
    }
}

/// One field as the planner lays it out. Flattened fields are hoisted into
/// their parent with the offset adjusted.
#[derive(Clone, Copy)]
pub struct FieldInfo {
    /// Name on the wire.
    pub name: &'static str,
    pub offset: usize,
    pub shape: &'static Shape,
    pub flags: FieldFlags,
}

pub fn fields(st: &'static StructType) -> Vec<FieldInfo> {
    let mut out = Vec::with_capacity(st.fields.len());
    collect_fields(st, 0, &mut out);
    out
}

fn collect_fields(st: &'static StructType, base: usize, out: &mut Vec<FieldInfo>) {
    for f in st.fields {
        if f.is_flattened()
            && let Type::User(UserType::Struct(inner)) = &f.shape().ty
        {
            collect_fields(inner, base + f.offset, out);
            continue;
        }
        let mut flags = FieldFlags::empty();
        if f.has_attr(Some("jitson"), "omit_empty") {
            flags |= FieldFlags::OMIT_EMPTY;
        }
        if f.has_attr(Some("jitson"), "quoted") {
            flags |= FieldFlags::QUOTED;
        }
        if f.should_skip_serializing_unconditional() {
            flags |= FieldFlags::SKIP_ENCODE;
        }
        if f.should_skip_deserializing() {
            flags |= FieldFlags::SKIP_DECODE;
        }
        out.push(FieldInfo {
            name: f.effective_name(),
            offset: base + f.offset,
            shape: f.shape(),
            flags,
        });
    }
}

/// Shapes nested directly inside `shape`, in declaration order.
pub fn children(shape: &'static Shape) -> Vec<&'static Shape> {
    match ShapeKind::of(shape) {
        Ok(ShapeKind::Struct(st)) => fields(st).into_iter().map(|f| f.shape).collect(),
        Ok(ShapeKind::Option(def)) => vec![def.t],
        Ok(ShapeKind::Pointer(pointee)) => vec![pointee],
        Ok(ShapeKind::Seq(def)) => vec![def.t],
        Ok(ShapeKind::Array(def)) => vec![def.t],
        Ok(ShapeKind::Map(def)) => vec![def.v],
        _ => Vec::new(),
    }
}

/// Cache key for a shape: one per Rust type.
///
/// A type's shape may be reachable through more than one address (consts
/// are not guaranteed a single location), so keys compare the type id.
#[derive(Clone, Copy)]
pub struct ShapeKey(&'static Shape);

impl ShapeKey {
    pub fn new(shape: &'static Shape) -> Self {
        ShapeKey(shape)
    }

    pub fn shape(&self) -> &'static Shape {
        self.0
    }
}

impl PartialEq for ShapeKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ShapeKey {}

impl Hash for ShapeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.type_identifier)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;

    #[derive(Facet, Default)]
    #[facet(traits(Default))]
    struct Node {
        value: i32,
        #[facet(recursive_type)]
        children: Vec<Node>,
    }

    #[derive(Facet, Default)]
    #[facet(traits(Default))]
    struct Twin {
        value: i32,
        #[facet(recursive_type)]
        children: Vec<Twin>,
    }

    #[derive(Facet, Default)]
    #[facet(traits(Default))]
    struct Inner {
        b: u8,
    }

    #[derive(Facet, Default)]
    #[facet(traits(Default))]
    struct Outer {
        a: u8,
        #[facet(flatten)]
        inner: Inner,
        #[facet(rename = "C")]
        c: u8,
    }

    #[test]
    fn struct_fields_carry_offsets() {
        let Ok(ShapeKind::Struct(st)) = ShapeKind::of(Node::SHAPE) else {
            panic!("not a struct");
        };
        let fields = fields(st);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "value");
        assert_eq!(fields[0].offset, core::mem::offset_of!(Node, value));
        assert!(fields[1].flags.is_empty());
        assert!(matches!(ShapeKind::of(fields[1].shape), Ok(ShapeKind::Seq(_))));
    }

    #[test]
    fn flattened_fields_are_hoisted() {
        let Ok(ShapeKind::Struct(st)) = ShapeKind::of(Outer::SHAPE) else {
            panic!("not a struct");
        };
        let names: Vec<_> = fields(st).iter().map(|f| (f.name, f.offset)).collect();
        assert_eq!(
            names,
            vec![
                ("a", core::mem::offset_of!(Outer, a)),
                ("b", core::mem::offset_of!(Outer, inner) + core::mem::offset_of!(Inner, b)),
                ("C", core::mem::offset_of!(Outer, c)),
            ]
        );
    }

    #[test]
    fn keys_follow_type_identity() {
        assert_eq!(ShapeKey::new(Node::SHAPE), ShapeKey::new(Node::SHAPE));
        assert_ne!(ShapeKey::new(Node::SHAPE), ShapeKey::new(Twin::SHAPE));
        assert_ne!(ShapeKey::new(<Vec<u32>>::SHAPE), ShapeKey::new(<Vec<u64>>::SHAPE));

        let Ok(ShapeKind::Struct(st)) = ShapeKind::of(Node::SHAPE) else {
            panic!("not a struct");
        };
        let Ok(ShapeKind::Seq(def)) = ShapeKind::of(fields(st)[1].shape) else {
            panic!("not a seq");
        };
        assert_eq!(ShapeKey::new(def.t), ShapeKey::new(Node::SHAPE));
    }

    #[test]
    fn scalars_and_containers_classify() {
        assert!(matches!(ShapeKind::of(u8::SHAPE), Ok(ShapeKind::Int(IntKind::U8))));
        assert!(matches!(ShapeKind::of(usize::SHAPE), Ok(ShapeKind::Int(_))));
        assert!(matches!(ShapeKind::of(f32::SHAPE), Ok(ShapeKind::Float(FloatKind::F32))));
        assert!(matches!(ShapeKind::of(<()>::SHAPE), Ok(ShapeKind::Unit)));
        assert!(matches!(ShapeKind::of(String::SHAPE), Ok(ShapeKind::String)));
        assert!(matches!(ShapeKind::of(<Option<u8>>::SHAPE), Ok(ShapeKind::Option(_))));
        assert!(matches!(ShapeKind::of(<Box<u8>>::SHAPE), Ok(ShapeKind::Pointer(_))));
        assert!(matches!(ShapeKind::of(<[u8; 3]>::SHAPE), Ok(ShapeKind::Array(def)) if def.n == 3));
        assert!(matches!(ShapeKind::of(<HashMap<String, u8>>::SHAPE), Ok(ShapeKind::Map(_))));
        assert!(matches!(ShapeKind::of(<BTreeMap<String, u8>>::SHAPE), Ok(ShapeKind::Map(_))));
        assert!(matches!(ShapeKind::of(Bytes::SHAPE), Ok(ShapeKind::Bytes)));
        assert!(matches!(ShapeKind::of(Value::SHAPE), Ok(ShapeKind::Dynamic)));
        assert!(matches!(ShapeKind::of(AnyValue::SHAPE), Ok(ShapeKind::Any)));

        assert!(ShapeKind::of(<BTreeMap<u32, u8>>::SHAPE).is_err());
        assert!(ShapeKind::of(u128::SHAPE).is_err());
    }

    #[test]
    fn defaults_are_detected() {
        assert!(has_default(String::SHAPE));
        assert!(has_default(<Vec<Node>>::SHAPE));
        assert_eq!(stride(u32::SHAPE), Some(4));
    }
}
