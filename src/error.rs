use std::sync::Arc;

use thiserror::Error;

use crate::value::TypeDescriptor;

/// A value adapter rejected a raw value for a declared property type.
#[derive(Debug, Clone, Error)]
#[error("expected {expected}, got {actual}")]
pub struct TypeMismatch {
    pub expected: TypeDescriptor,
    pub actual: &'static str,
}

#[derive(Debug, Clone, Error)]
pub enum PropertyError {
    #[error("{property}: {source}")]
    TypeMismatch {
        property: String,
        #[source]
        source: TypeMismatch,
    },

    #[error("{property} has no value")]
    Unset { property: String },

    #[error("{property} is not hydrated yet; task {producer} has not produced it")]
    NotHydrated { property: String, producer: String },

    #[error("{property} is frozen and can no longer be set")]
    Frozen { property: String },

    #[error("task {task} has no {kind} property named {name:?}")]
    NoSuchProperty {
        task: String,
        kind: &'static str,
        name: String,
    },

    #[error("supplier error: {0}")]
    Supplier(Arc<anyhow::Error>),
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("project {project} already has a member named {name:?}")]
    NameCollision { project: String, name: String },

    #[error("the context is sealed; projects and tasks can no longer be added")]
    ContextSealed,

    #[error("{path} is not a group task")]
    NotAGroup { path: String },
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("invalid selector {selector:?}: {reason}")]
    Invalid { selector: String, reason: &'static str },

    #[error("path {path:?} does not exist")]
    UnknownPath { path: String },

    #[error("no tasks matched selector {selector:?}")]
    UnknownTask { selector: String },

    #[error("no tasks selected")]
    NothingSelected,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("in task {task}: {source}")]
    Relationship {
        task: String,
        #[source]
        source: SelectorError,
    },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },
}

/// Top level error of a build invocation.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("{}", format_failed(.tasks))]
    TasksFailed { tasks: Vec<String> },
}

fn format_failed(tasks: &[String]) -> String {
    match tasks {
        [single] => format!("task \"{single}\" failed"),
        many => format!(
            "tasks {} failed",
            many.iter()
                .map(|t| format!("\"{t}\""))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
