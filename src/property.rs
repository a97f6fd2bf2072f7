//! Typed value cells attached to tasks.
//!
//! A [`Property`] is a handle to a shared cell holding one of three states:
//! unset, a static value, or a derivation from other suppliers. Cells carry
//! provenance (the task that owns them), which is what lets the task graph
//! infer strict dependencies from data flow: deriving an input from another
//! task's output implies an edge.
//!
//! Mutation rules:
//! * Input properties are writable during script loading and finalization,
//!   and frozen once the context is finalized.
//! * Output properties are writable only while their owning task's `execute`
//!   runs; the executor unlocks them for exactly that window.

use std::fmt;
use std::sync::{Arc, RwLock};

use crate::context::TaskId;
use crate::error::PropertyError;
use crate::supplier::Supplier;
use crate::value::{Value, TypeDescriptor, adapt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Input,
    Output,
}

impl PropertyKind {
    pub fn label(self) -> &'static str {
        match self {
            PropertyKind::Input => "input",
            PropertyKind::Output => "output",
        }
    }
}

/// What [`Property::set`] accepts: either a raw value (adapter validated) or
/// a supplier (stored as a derivation).
pub enum PropertyValue {
    Value(Value),
    Supplier(Supplier),
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        PropertyValue::Value(value)
    }
}

impl From<Supplier> for PropertyValue {
    fn from(supplier: Supplier) -> Self {
        PropertyValue::Supplier(supplier)
    }
}

impl From<Property> for PropertyValue {
    fn from(property: Property) -> Self {
        PropertyValue::Supplier(Supplier::from_property(property))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Value(value.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Value(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Value(value.into())
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Value(value.into())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Value(value.into())
    }
}

impl From<camino::Utf8PathBuf> for PropertyValue {
    fn from(value: camino::Utf8PathBuf) -> Self {
        PropertyValue::Value(value.into())
    }
}

#[derive(Clone)]
enum State {
    Unset,
    Static(Value),
    Derived(Supplier),
}

struct Cell {
    owner: Option<TaskId>,
    task_path: String,
    name: &'static str,
    kind: PropertyKind,
    ty: TypeDescriptor,
    state: State,
    frozen: bool,
}

impl Cell {
    fn display(&self) -> String {
        if self.task_path.is_empty() {
            self.name.to_string()
        } else {
            format!("{}.{}", self.task_path, self.name)
        }
    }
}

/// A handle to a property cell. Clones share the cell.
#[derive(Clone)]
pub struct Property {
    cell: Arc<RwLock<Cell>>,
}

impl Property {
    pub(crate) fn new(
        owner: TaskId,
        task_path: &str,
        name: &'static str,
        kind: PropertyKind,
        ty: TypeDescriptor,
    ) -> Self {
        Property {
            cell: Arc::new(RwLock::new(Cell {
                owner: Some(owner),
                task_path: task_path.to_string(),
                name,
                kind,
                ty,
                state: State::Unset,
                // Outputs are only writable inside their owner's execute.
                frozen: kind == PropertyKind::Output,
            })),
        }
    }

    /// A property not owned by any task. Useful for composing suppliers and
    /// in tests; ownerless properties never imply graph edges.
    pub fn standalone(name: &'static str, ty: TypeDescriptor, kind: PropertyKind) -> Self {
        Property {
            cell: Arc::new(RwLock::new(Cell {
                owner: None,
                task_path: String::new(),
                name,
                kind,
                ty,
                state: State::Unset,
                frozen: false,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.cell.read().unwrap().name
    }

    pub fn kind(&self) -> PropertyKind {
        self.cell.read().unwrap().kind
    }

    pub fn ty(&self) -> TypeDescriptor {
        self.cell.read().unwrap().ty.clone()
    }

    pub(crate) fn owner(&self) -> Option<TaskId> {
        self.cell.read().unwrap().owner
    }

    /// `true` if both handles refer to the same cell.
    pub fn same_cell(&self, other: &Property) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Set the property to a raw value or a supplier. Raw values are routed
    /// through the value adapters; suppliers are stored as derivations and
    /// evaluated on read.
    pub fn set(&self, value: impl Into<PropertyValue>) -> Result<(), PropertyError> {
        let value = value.into();
        let mut cell = self.cell.write().unwrap();
        if cell.frozen {
            return Err(PropertyError::Frozen {
                property: cell.display(),
            });
        }
        cell.state = match value {
            PropertyValue::Value(raw) => {
                let adapted = adapt(&cell.ty, raw).map_err(|source| {
                    PropertyError::TypeMismatch {
                        property: cell.display(),
                        source,
                    }
                })?;
                State::Static(adapted)
            }
            PropertyValue::Supplier(supplier) => State::Derived(supplier),
        };
        Ok(())
    }

    /// As [`set`](Self::set), but only if the property is currently unset.
    pub fn set_default(&self, value: impl Into<PropertyValue>) -> Result<(), PropertyError> {
        if self.is_filled() {
            return Ok(());
        }
        self.set(value)
    }

    /// Set a static value if the property is unset, then return the current
    /// effective value. Meant for output properties inside `execute`.
    pub fn setdefault(&self, value: impl Into<Value>) -> Result<Value, PropertyError> {
        self.set_default(PropertyValue::Value(value.into()))?;
        self.get()
    }

    /// Replace the current value with a derivation that maps it through
    /// `func`. Fails if the property is unset.
    pub fn set_map(
        &self,
        func: impl Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Result<(), PropertyError> {
        let supplier = {
            let cell = self.cell.read().unwrap();
            if cell.frozen {
                return Err(PropertyError::Frozen {
                    property: cell.display(),
                });
            }
            match &cell.state {
                State::Unset => {
                    return Err(PropertyError::Unset {
                        property: cell.display(),
                    });
                }
                State::Static(value) => Supplier::of(value.clone()).map(func),
                State::Derived(supplier) => supplier.map(func),
            }
        };
        let mut cell = self.cell.write().unwrap();
        cell.state = State::Derived(supplier);
        Ok(())
    }

    /// Reset the property to unset.
    pub fn clear(&self) -> Result<(), PropertyError> {
        let mut cell = self.cell.write().unwrap();
        if cell.frozen {
            return Err(PropertyError::Frozen {
                property: cell.display(),
            });
        }
        cell.state = State::Unset;
        Ok(())
    }

    /// Read the current value. Derivations are evaluated on every call.
    pub fn get(&self) -> Result<Value, PropertyError> {
        let (state, display, producer) = {
            let cell = self.cell.read().unwrap();
            let producer = match (cell.kind, &cell.state) {
                // An unset output read before its owner ran: the value is not
                // hydrated yet, and the error names the producing task.
                (PropertyKind::Output, State::Unset) if cell.owner.is_some() => {
                    Some(cell.task_path.clone())
                }
                _ => None,
            };
            (cell.state.clone(), cell.display(), producer)
        };

        match state {
            State::Unset => match producer {
                Some(producer) => Err(PropertyError::NotHydrated {
                    property: display,
                    producer,
                }),
                None => Err(PropertyError::Unset { property: display }),
            },
            State::Static(value) => Ok(value),
            State::Derived(supplier) => supplier.get(),
        }
    }

    /// As [`get`](Self::get), but yields `default` if the property is unset
    /// or not yet hydrated.
    pub fn get_or(&self, default: impl Into<Value>) -> Value {
        self.get().unwrap_or_else(|_| default.into())
    }

    /// `true` if a read would currently succeed.
    pub fn is_set(&self) -> bool {
        self.get().is_ok()
    }

    /// `true` if the property holds a value or a derivation, even one that
    /// is not yet hydrated.
    pub fn is_filled(&self) -> bool {
        !matches!(self.cell.read().unwrap().state, State::Unset)
    }

    /// All properties this property's derivation transitively references.
    pub fn upstream(&self) -> Vec<Property> {
        let mut acc = Vec::new();
        self.collect_upstream(&mut acc);
        acc
    }

    pub(crate) fn collect_upstream(&self, acc: &mut Vec<Property>) {
        let state = self.cell.read().unwrap().state.clone();
        if let State::Derived(supplier) = state {
            supplier.collect_upstream(acc);
        }
    }

    pub(crate) fn freeze(&self) {
        self.cell.write().unwrap().frozen = true;
    }

    pub(crate) fn unfreeze(&self) {
        self.cell.write().unwrap().frozen = false;
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.read().unwrap();
        write!(f, "Property({})", cell.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn input(name: &'static str, ty: TypeDescriptor) -> Property {
        Property::standalone(name, ty, PropertyKind::Input)
    }

    #[test]
    fn set_and_get_round_trips_through_adapters() {
        let prop = input("src", TypeDescriptor::Path);
        prop.set("foo/bar").unwrap();
        assert_eq!(prop.get().unwrap(), Value::Path(Utf8PathBuf::from("foo/bar")));
    }

    #[test]
    fn union_ordering_applies_on_set() {
        let string_first = input(
            "a",
            TypeDescriptor::union([TypeDescriptor::String, TypeDescriptor::Path]),
        );
        string_first.set("foo/bar").unwrap();
        assert_eq!(string_first.get().unwrap(), Value::from("foo/bar"));

        let path_first = input(
            "b",
            TypeDescriptor::union([TypeDescriptor::Path, TypeDescriptor::String]),
        );
        path_first.set("foo/bar").unwrap();
        assert_eq!(
            path_first.get().unwrap(),
            Value::Path(Utf8PathBuf::from("foo/bar"))
        );
    }

    #[test]
    fn set_rejects_mismatched_values() {
        let prop = input("n", TypeDescriptor::Integer);
        let err = prop.set("nope").unwrap_err();
        assert!(matches!(err, PropertyError::TypeMismatch { .. }));
    }

    #[test]
    fn reading_unset_fails() {
        let prop = input("n", TypeDescriptor::Integer);
        assert!(matches!(
            prop.get().unwrap_err(),
            PropertyError::Unset { .. }
        ));
        assert!(!prop.is_set());
        assert!(!prop.is_filled());
    }

    #[test]
    fn set_default_only_applies_when_unset() {
        let prop = input("n", TypeDescriptor::Integer);
        prop.set_default(1i64).unwrap();
        prop.set_default(2i64).unwrap();
        assert_eq!(prop.get().unwrap(), Value::Integer(1));
    }

    #[test]
    fn setdefault_returns_the_effective_value() {
        let prop = input("n", TypeDescriptor::Integer);
        assert_eq!(prop.setdefault(7i64).unwrap(), Value::Integer(7));
        assert_eq!(prop.setdefault(9i64).unwrap(), Value::Integer(7));
    }

    #[test]
    fn get_or_falls_back_on_unset() {
        let prop = input("n", TypeDescriptor::Integer);
        assert_eq!(prop.get_or(5i64), Value::Integer(5));
        prop.set(1i64).unwrap();
        assert_eq!(prop.get_or(5i64), Value::Integer(1));
    }

    #[test]
    fn derived_properties_follow_their_source() {
        let source = input("src", TypeDescriptor::String);
        let sink = input("dst", TypeDescriptor::String);
        sink.set(source.clone()).unwrap();

        assert!(sink.is_filled());
        source.set("hello").unwrap();
        assert_eq!(sink.get().unwrap(), Value::from("hello"));

        // Re-evaluated on every read, not snapshotted.
        source.set("changed").unwrap();
        assert_eq!(sink.get().unwrap(), Value::from("changed"));
    }

    #[test]
    fn upstream_reports_transitive_sources() {
        let a = input("a", TypeDescriptor::Integer);
        let b = input("b", TypeDescriptor::Integer);
        let c = input("c", TypeDescriptor::Integer);
        b.set(a.clone()).unwrap();
        c.set(b.clone()).unwrap();

        let upstream = c.upstream();
        assert_eq!(upstream.len(), 2);
        assert!(upstream.iter().any(|p| p.same_cell(&a)));
        assert!(upstream.iter().any(|p| p.same_cell(&b)));
    }

    #[test]
    fn frozen_properties_reject_writes() {
        let prop = input("n", TypeDescriptor::Integer);
        prop.set(1i64).unwrap();
        prop.freeze();
        assert!(matches!(
            prop.set(2i64).unwrap_err(),
            PropertyError::Frozen { .. }
        ));
        assert_eq!(prop.get().unwrap(), Value::Integer(1));
    }

    #[test]
    fn set_map_transforms_the_current_value() {
        let prop = input("p", TypeDescriptor::Path);
        prop.set("foo/bar").unwrap();
        prop.set_map(|v| {
            let path = v.as_path().unwrap();
            Ok(Value::Path(path.join("baz")))
        })
        .unwrap();
        assert_eq!(
            prop.get().unwrap(),
            Value::Path(Utf8PathBuf::from("foo/bar/baz"))
        );
    }

    #[test]
    fn clear_resets_to_unset() {
        let prop = input("n", TypeDescriptor::Integer);
        prop.set(1i64).unwrap();
        prop.clear().unwrap();
        assert!(!prop.is_filled());
    }
}
