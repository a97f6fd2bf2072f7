//! Lazy value providers.
//!
//! A [`Supplier`] is a cheap, clonable handle to a value that is computed on
//! demand. Properties are suppliers too (see [`Property`]), which makes
//! wiring one task's output into another task's input a first class act of
//! data flow: the graph discovers strict dependencies by walking
//! [`Supplier::upstream`].

use std::fmt;
use std::sync::Arc;

use crate::error::PropertyError;
use crate::property::Property;
use crate::value::Value;

type CallableFn = dyn Fn() -> anyhow::Result<Value> + Send + Sync;
type MapFn = dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync;
type LiftFn = dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync;

/// A lazy value handle. Suppliers are pure and may be evaluated any number
/// of times during a build; callers must not depend on the call count.
#[derive(Clone)]
pub struct Supplier {
    kind: Arc<SupplierKind>,
}

enum SupplierKind {
    Of(Value),
    Callable {
        func: Box<CallableFn>,
        upstream: Vec<Property>,
    },
    FromProperty(Property),
    Map {
        inner: Supplier,
        func: Box<MapFn>,
    },
    Lift {
        inputs: Vec<Supplier>,
        func: Box<LiftFn>,
    },
}

impl Supplier {
    /// A supplier that always yields the given value.
    pub fn of(value: impl Into<Value>) -> Self {
        Supplier {
            kind: Arc::new(SupplierKind::Of(value.into())),
        }
    }

    /// A supplier backed by a callable, with an explicitly declared upstream.
    pub fn of_callable(
        func: impl Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
        upstream: impl IntoIterator<Item = Property>,
    ) -> Self {
        Supplier {
            kind: Arc::new(SupplierKind::Callable {
                func: Box::new(func),
                upstream: upstream.into_iter().collect(),
            }),
        }
    }

    /// A supplier that reads the given property when evaluated.
    pub fn from_property(property: Property) -> Self {
        Supplier {
            kind: Arc::new(SupplierKind::FromProperty(property)),
        }
    }

    /// A new supplier that maps this supplier's value through `func`. The
    /// upstream of the result is the upstream of `self`.
    pub fn map(&self, func: impl Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static) -> Self {
        Supplier {
            kind: Arc::new(SupplierKind::Map {
                inner: self.clone(),
                func: Box::new(func),
            }),
        }
    }

    /// Combine several suppliers into one. The upstream of the result is the
    /// union of the inputs' upstreams.
    pub fn lift(
        inputs: impl IntoIterator<Item = Supplier>,
        func: impl Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Supplier {
            kind: Arc::new(SupplierKind::Lift {
                inputs: inputs.into_iter().collect(),
                func: Box::new(func),
            }),
        }
    }

    /// Evaluate the supplier.
    pub fn get(&self) -> Result<Value, PropertyError> {
        match &*self.kind {
            SupplierKind::Of(value) => Ok(value.clone()),
            SupplierKind::Callable { func, .. } => {
                func().map_err(|err| PropertyError::Supplier(Arc::new(err)))
            }
            SupplierKind::FromProperty(property) => property.get(),
            SupplierKind::Map { inner, func } => {
                let value = inner.get()?;
                func(value).map_err(|err| PropertyError::Supplier(Arc::new(err)))
            }
            SupplierKind::Lift { inputs, func } => {
                let values = inputs
                    .iter()
                    .map(Supplier::get)
                    .collect::<Result<Vec<_>, _>>()?;
                func(values).map_err(|err| PropertyError::Supplier(Arc::new(err)))
            }
        }
    }

    /// All properties this supplier transitively depends on.
    pub fn upstream(&self) -> Vec<Property> {
        let mut acc = Vec::new();
        self.collect_upstream(&mut acc);
        acc
    }

    pub(crate) fn collect_upstream(&self, acc: &mut Vec<Property>) {
        // Recurse only into properties seen for the first time, so shared or
        // cyclic derivations terminate.
        fn push(acc: &mut Vec<Property>, property: &Property) -> bool {
            if acc.iter().any(|p| p.same_cell(property)) {
                return false;
            }
            acc.push(property.clone());
            true
        }

        match &*self.kind {
            SupplierKind::Of(_) => {}
            SupplierKind::Callable { upstream, .. } => {
                for property in upstream {
                    if push(acc, property) {
                        property.collect_upstream(acc);
                    }
                }
            }
            SupplierKind::FromProperty(property) => {
                if push(acc, property) {
                    property.collect_upstream(acc);
                }
            }
            SupplierKind::Map { inner, .. } => inner.collect_upstream(acc),
            SupplierKind::Lift { inputs, .. } => {
                for input in inputs {
                    input.collect_upstream(acc);
                }
            }
        }
    }
}

impl From<Property> for Supplier {
    fn from(property: Property) -> Self {
        Supplier::from_property(property)
    }
}

impl fmt::Debug for Supplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind {
            SupplierKind::Of(value) => write!(f, "Supplier::Of({value:?})"),
            SupplierKind::Callable { .. } => write!(f, "Supplier::Callable(*)"),
            SupplierKind::FromProperty(property) => {
                write!(f, "Supplier::FromProperty({property:?})")
            }
            SupplierKind::Map { inner, .. } => write!(f, "Supplier::Map({inner:?})"),
            SupplierKind::Lift { inputs, .. } => write!(f, "Supplier::Lift({inputs:?})"),
        }
    }
}
