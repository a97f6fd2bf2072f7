#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod error;
mod executor;
mod graph;
mod project;
mod property;
mod selector;
mod supplier;
mod task;
mod utils;
mod value;

pub use crate::context::{Context, Metadata, ProjectId, TaskId};
pub use crate::error::{
    BuildError, GraphError, ProjectError, PropertyError, SelectorError, TypeMismatch,
};
pub use crate::executor::{
    BuildSummary, ExecutionObserver, Executor, ExecutorConfig, LogObserver, SummaryEntry,
};
pub use crate::graph::{Edge, TaskGraph};
pub use crate::project::{DEFAULT_GROUPS, Member, ProjectMut, ProjectRef};
pub use crate::property::{Property, PropertyKind, PropertyValue};
pub use crate::supplier::Supplier;
pub use crate::task::{
    Action, FnAction, Relationship, RelationshipTarget, Schema, SchemaEntry, TaskMut, TaskRef,
    TaskStatus,
};
pub use crate::utils::{as_overhead, init_logging};
pub use crate::value::{TypeDescriptor, Value, adapt};
