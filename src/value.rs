use core::any::Any;
use core::fmt;
use std::collections::BTreeMap;

use facet::Facet;

use crate::shape::Shape;

/// A JSON number as it appeared on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Uint(v) => v as f64,
            Number::Float(v) => v,
        }
    }
}

/// Dynamically-typed JSON tree.
///
/// Objects keep their keys sorted, so encoding a `Value` is deterministic.
#[derive(Debug, Clone, PartialEq, Default, Facet)]
#[facet(opaque)]
#[repr(C)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::Int(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(Number::Float(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Binary data, carried as a base64 string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Facet)]
pub struct Bytes(pub Vec<u8>);

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Bytes(v)
    }
}

impl core::ops::Deref for Bytes {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.0
    }
}

trait Erased: Send + Sync {
    fn shape(&self) -> &'static Shape;
    fn data(&self) -> *const u8;
    fn data_mut(&mut self) -> *mut u8;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Facet<'static> + Send + Sync> Erased for T {
    fn shape(&self) -> &'static Shape {
        T::SHAPE
    }

    fn data(&self) -> *const u8 {
        self as *const T as *const u8
    }

    fn data_mut(&mut self) -> *mut u8 {
        self as *mut T as *mut u8
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A value of any [`Facet`] type, boxed together with its shape.
///
/// Encoding dispatches on the carried shape at run time. Decoding into an
/// empty `AnyValue` produces one holding a [`Value`].
#[derive(Default, Facet)]
#[facet(opaque)]
pub struct AnyValue(Option<Box<dyn Erased>>);

impl AnyValue {
    pub fn new<T: Facet<'static> + Send + Sync>(value: T) -> Self {
        AnyValue(Some(Box::new(value)))
    }

    pub fn empty() -> Self {
        AnyValue(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn shape(&self) -> Option<&'static Shape> {
        self.0.as_ref().map(|v| v.shape())
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_ref()?.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.0.as_mut()?.as_any_mut().downcast_mut()
    }

    /// Move the value out if it has type `T`; otherwise leave it in place.
    pub fn take<T: 'static>(&mut self) -> Option<T> {
        if self.downcast_ref::<T>().is_none() {
            return None;
        }
        let boxed = self.0.take()?.into_any();
        boxed.downcast::<T>().ok().map(|b| *b)
    }

    /// Raw view used by runtime support: data pointer plus shape.
    pub(crate) fn raw(&self) -> Option<(*const u8, &'static Shape)> {
        self.0.as_ref().map(|v| (v.data(), v.shape()))
    }

    pub(crate) fn raw_mut(&mut self) -> Option<(*mut u8, &'static Shape)> {
        self.0.as_mut().map(|v| (v.data_mut(), v.shape()))
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape() {
            Some(shape) => write!(f, "AnyValue({})", shape.type_identifier),
            None => write!(f, "AnyValue(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_value_downcasts_and_takes() {
        let mut v = AnyValue::new(42u32);
        assert_eq!(v.shape().map(|s| s.type_identifier), Some("u32"));
        assert_eq!(v.downcast_ref::<u32>(), Some(&42));
        assert_eq!(v.downcast_ref::<i32>(), None);
        assert_eq!(v.take::<i32>(), None);
        assert!(!v.is_empty());
        assert_eq!(v.take::<u32>(), Some(42));
        assert!(v.is_empty());
    }

    #[test]
    fn raw_view_points_at_payload() {
        let v = AnyValue::new(String::from("abc"));
        let (ptr, shape) = v.raw().unwrap();
        assert_eq!(shape.type_identifier, "String");
        assert_eq!(unsafe { &*(ptr as *const String) }, "abc");
    }

    #[test]
    fn value_object_lookup() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::from(1i64));
        let v = Value::Object(map);
        assert_eq!(v.get("a"), Some(&Value::Number(Number::Int(1))));
        assert_eq!(v.get("b"), None);
        assert!(Value::default().is_null());
    }
}
