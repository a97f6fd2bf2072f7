//! The dynamically typed value model shared by all properties.
//!
//! Properties declare a [`TypeDescriptor`] and store a [`Value`]. Raw values
//! are routed through [`adapt`], which validates them against the declared
//! type and applies the well-known coercions (strings become paths, integers
//! widen to floats). Union types are resolved in declaration order, which is
//! observable: `union<string | path>` stores a string unchanged while
//! `union<path | string>` coerces it to a path.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::TypeMismatch;

/// A ground value or a homogeneous container of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Path(Utf8PathBuf),
    Sequence(Vec<Value>),
    Set(BTreeSet<Value>),
    Mapping(BTreeMap<String, Value>),
}

impl Value {
    /// The kind of this value, as shown in type errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Path(_) => "path",
            Value::Sequence(_) => "sequence",
            Value::Set(_) => "set",
            Value::Mapping(_) => "mapping",
        }
    }

    pub fn sequence(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Sequence(items.into_iter().collect())
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(items.into_iter().collect())
    }

    pub fn mapping(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Mapping(entries.into_iter().collect())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Utf8Path> {
        match self {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Path(_) => 5,
            Value::Sequence(_) => 6,
            Value::Set(_) => 7,
            Value::Mapping(_) => 8,
        }
    }
}

// A total order so values can live in sets and maps. Floats are ordered by
// `total_cmp`, values of different kinds by kind rank.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Path(a), Value::Path(b)) => a.cmp(b),
            (Value::Sequence(a), Value::Sequence(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (Value::Mapping(a), Value::Mapping(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(value: Utf8PathBuf) -> Self {
        Value::Path(value)
    }
}

impl From<&Utf8Path> for Value {
    fn from(value: &Utf8Path) -> Self {
        Value::Path(value.to_path_buf())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Sequence(value)
    }
}

/// Declared type of a property, consumable by the value adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeDescriptor {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Path,
    Sequence(Box<TypeDescriptor>),
    Set(Box<TypeDescriptor>),
    Mapping(Box<TypeDescriptor>),
    Union(Vec<TypeDescriptor>),
}

impl TypeDescriptor {
    pub fn sequence(item: TypeDescriptor) -> Self {
        TypeDescriptor::Sequence(Box::new(item))
    }

    pub fn set(item: TypeDescriptor) -> Self {
        TypeDescriptor::Set(Box::new(item))
    }

    pub fn mapping(value: TypeDescriptor) -> Self {
        TypeDescriptor::Mapping(Box::new(value))
    }

    pub fn union(alternatives: impl IntoIterator<Item = TypeDescriptor>) -> Self {
        TypeDescriptor::Union(alternatives.into_iter().collect())
    }

    /// An optional type: `union<T | null>`.
    pub fn optional(inner: TypeDescriptor) -> Self {
        TypeDescriptor::Union(vec![inner, TypeDescriptor::Null])
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Null => write!(f, "null"),
            TypeDescriptor::Bool => write!(f, "bool"),
            TypeDescriptor::Integer => write!(f, "integer"),
            TypeDescriptor::Float => write!(f, "float"),
            TypeDescriptor::String => write!(f, "string"),
            TypeDescriptor::Path => write!(f, "path"),
            TypeDescriptor::Sequence(item) => write!(f, "sequence<{item}>"),
            TypeDescriptor::Set(item) => write!(f, "set<{item}>"),
            TypeDescriptor::Mapping(value) => write!(f, "mapping<string, {value}>"),
            TypeDescriptor::Union(alternatives) => {
                write!(f, "union<")?;
                for (i, alt) in alternatives.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{alt}")?;
                }
                write!(f, ">")
            }
        }
    }
}

fn mismatch(expected: &TypeDescriptor, actual: &Value) -> TypeMismatch {
    TypeMismatch {
        expected: expected.clone(),
        actual: actual.kind(),
    }
}

/// Validate and coerce a raw value against a declared type.
///
/// Containers validate their elements one level deep: an element whose
/// declared type is itself a container is only checked for its variant kind.
pub fn adapt(ty: &TypeDescriptor, value: Value) -> Result<Value, TypeMismatch> {
    match (ty, value) {
        (TypeDescriptor::Null, Value::Null) => Ok(Value::Null),
        (TypeDescriptor::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (TypeDescriptor::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
        (TypeDescriptor::Float, Value::Float(x)) => Ok(Value::Float(x)),
        (TypeDescriptor::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
        (TypeDescriptor::String, Value::String(s)) => Ok(Value::String(s)),
        (TypeDescriptor::Path, Value::Path(p)) => Ok(Value::Path(p)),
        (TypeDescriptor::Path, Value::String(s)) => Ok(Value::Path(Utf8PathBuf::from(s))),
        (TypeDescriptor::Sequence(item), Value::Sequence(items)) => items
            .into_iter()
            .map(|v| adapt_element(item, v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        (TypeDescriptor::Set(item), Value::Set(items)) => items
            .into_iter()
            .map(|v| adapt_element(item, v))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Value::Set),
        // Sequences are accepted where a set is declared; duplicates collapse.
        (TypeDescriptor::Set(item), Value::Sequence(items)) => items
            .into_iter()
            .map(|v| adapt_element(item, v))
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Value::Set),
        (TypeDescriptor::Mapping(value_ty), Value::Mapping(entries)) => entries
            .into_iter()
            .map(|(k, v)| adapt_element(value_ty, v).map(|v| (k, v)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Value::Mapping),
        (TypeDescriptor::Union(alternatives), value) => {
            for alt in alternatives {
                if let Ok(adapted) = adapt(alt, value.clone()) {
                    return Ok(adapted);
                }
            }
            Err(mismatch(ty, &value))
        }
        (ty, value) => Err(mismatch(ty, &value)),
    }
}

// One level deep: container-typed elements are only kind-checked.
fn adapt_element(ty: &TypeDescriptor, value: Value) -> Result<Value, TypeMismatch> {
    match (ty, value) {
        (TypeDescriptor::Sequence(_), value @ Value::Sequence(_)) => Ok(value),
        (TypeDescriptor::Set(_), value @ Value::Set(_)) => Ok(value),
        (TypeDescriptor::Mapping(_), value @ Value::Mapping(_)) => Ok(value),
        (TypeDescriptor::Union(alternatives), value) => {
            for alt in alternatives {
                if let Ok(adapted) = adapt_element(alt, value.clone()) {
                    return Ok(adapted);
                }
            }
            Err(mismatch(ty, &value))
        }
        (ty, value) => adapt(ty, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip() {
        assert_eq!(
            adapt(&TypeDescriptor::Bool, Value::Bool(true)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            adapt(&TypeDescriptor::Integer, Value::Integer(42)).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            adapt(&TypeDescriptor::String, Value::from("hi")).unwrap(),
            Value::from("hi")
        );
        assert_eq!(adapt(&TypeDescriptor::Null, Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn integers_widen_to_float() {
        assert_eq!(
            adapt(&TypeDescriptor::Float, Value::Integer(3)).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn strings_coerce_to_paths() {
        assert_eq!(
            adapt(&TypeDescriptor::Path, Value::from("foo/bar")).unwrap(),
            Value::Path(Utf8PathBuf::from("foo/bar"))
        );
    }

    #[test]
    fn rejects_wrong_kind() {
        let err = adapt(&TypeDescriptor::Integer, Value::from("nope")).unwrap_err();
        assert_eq!(err.actual, "string");
        assert_eq!(err.expected, TypeDescriptor::Integer);
    }

    #[test]
    fn union_resolution_order_is_observable() {
        let string_first =
            TypeDescriptor::union([TypeDescriptor::String, TypeDescriptor::Path]);
        assert_eq!(
            adapt(&string_first, Value::from("foo/bar")).unwrap(),
            Value::from("foo/bar")
        );

        let path_first =
            TypeDescriptor::union([TypeDescriptor::Path, TypeDescriptor::String]);
        assert_eq!(
            adapt(&path_first, Value::from("foo/bar")).unwrap(),
            Value::Path(Utf8PathBuf::from("foo/bar"))
        );
    }

    #[test]
    fn sequence_elements_are_validated() {
        let ty = TypeDescriptor::sequence(TypeDescriptor::Path);
        let adapted = adapt(
            &ty,
            Value::sequence([Value::from("a"), Value::from("b")]),
        )
        .unwrap();
        assert_eq!(
            adapted,
            Value::sequence([
                Value::Path(Utf8PathBuf::from("a")),
                Value::Path(Utf8PathBuf::from("b")),
            ])
        );

        let err = adapt(&ty, Value::sequence([Value::Integer(1)])).unwrap_err();
        assert_eq!(err.actual, "integer");
    }

    #[test]
    fn nested_containers_are_checked_one_level_deep() {
        let ty = TypeDescriptor::sequence(TypeDescriptor::sequence(TypeDescriptor::Integer));
        // The inner sequence's elements are not inspected.
        let inner = Value::sequence([Value::from("not an integer")]);
        assert!(adapt(&ty, Value::sequence([inner])).is_ok());
        // But a non-sequence element is rejected.
        assert!(adapt(&ty, Value::sequence([Value::Integer(1)])).is_err());
    }

    #[test]
    fn sequences_collapse_into_sets() {
        let ty = TypeDescriptor::set(TypeDescriptor::Integer);
        let adapted = adapt(
            &ty,
            Value::sequence([Value::Integer(1), Value::Integer(1), Value::Integer(2)]),
        )
        .unwrap();
        assert_eq!(adapted.as_set().unwrap().len(), 2);
    }

    #[test]
    fn mapping_values_are_validated() {
        let ty = TypeDescriptor::mapping(TypeDescriptor::String);
        let ok = Value::mapping([("k".to_string(), Value::from("v"))]);
        assert!(adapt(&ty, ok).is_ok());

        let bad = Value::mapping([("k".to_string(), Value::Integer(1))]);
        assert!(adapt(&ty, bad).is_err());
    }

    #[test]
    fn optional_accepts_null() {
        let ty = TypeDescriptor::optional(TypeDescriptor::String);
        assert_eq!(adapt(&ty, Value::Null).unwrap(), Value::Null);
        assert_eq!(adapt(&ty, Value::from("x")).unwrap(), Value::from("x"));
        assert!(adapt(&ty, Value::Integer(1)).is_err());
    }

    #[test]
    fn values_order_totally() {
        let mut set = BTreeSet::new();
        set.insert(Value::Float(1.0));
        set.insert(Value::Float(f64::NAN));
        set.insert(Value::Float(f64::NAN));
        set.insert(Value::Integer(1));
        assert_eq!(set.len(), 3);
    }
}
