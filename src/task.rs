//! Tasks: isolated units of work configured through typed properties.
//!
//! The behaviour of a task is an [`Action`] trait object; its shape (which
//! properties exist, and whether they are inputs or outputs) is declared by
//! the action's [`Schema`]. One property cell is materialized per schema
//! entry when the task is registered with a project.

use std::sync::Arc;

use serde::Serialize;

use crate::context::{Context, TaskId};
use crate::error::{BuildError, PropertyError};
use crate::property::{Property, PropertyKind};
use crate::value::TypeDescriptor;

/// The status a task ends up with after (or instead of) executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task started background work that outlives `execute`.
    Started,
    /// The task ran its work and completed.
    Succeeded,
    /// The task ran and found nothing to do.
    SucceededNoop,
    /// The task decided its prior state is current and did not run.
    UpToDate,
    /// The task was not executed.
    Skipped { reason: String },
    /// The task raised an error or failed explicitly.
    Failed { reason: String },
}

impl TaskStatus {
    pub fn skipped(reason: impl Into<String>) -> Self {
        TaskStatus::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TaskStatus::Failed {
            reason: reason.into(),
        }
    }

    /// Status for a finished subprocess.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            TaskStatus::Succeeded
        } else {
            TaskStatus::failed(format!("command returned exit code {code}"))
        }
    }

    /// Every terminal status except `Failed` satisfies dependents.
    pub fn is_ok(&self) -> bool {
        !self.is_failed()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskStatus::Skipped { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Started => "STARTED",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::SucceededNoop => "SUCCEEDED (noop)",
            TaskStatus::UpToDate => "UP TO DATE",
            TaskStatus::Skipped { .. } => "SKIPPED",
            TaskStatus::Failed { .. } => "FAILED",
        }
    }

    /// The reason attached to a skipped or failed status.
    pub fn reason(&self) -> Option<&str> {
        match self {
            TaskStatus::Skipped { reason } | TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Declares the properties of a task: name, kind and value type per entry.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub(crate) entries: Vec<SchemaEntry>,
}

#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub ty: TypeDescriptor,
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    pub fn input(mut self, name: &'static str, ty: TypeDescriptor) -> Self {
        self.entries.push(SchemaEntry {
            name,
            kind: PropertyKind::Input,
            ty,
        });
        self
    }

    pub fn output(mut self, name: &'static str, ty: TypeDescriptor) -> Self {
        self.entries.push(SchemaEntry {
            name,
            kind: PropertyKind::Output,
            ty,
        });
        self
    }
}

/// The work of a task.
///
/// `execute` runs once all strict dependencies completed; it may read input
/// properties (including derived ones, which are hydrated by then) and write
/// its own output properties. `finalize` is called exactly once by
/// [`Context::finalize`](crate::Context::finalize) and may still reshape the
/// task: add relationships, adjust properties, even register more tasks.
pub trait Action: Send + Sync + 'static {
    fn schema(&self) -> Schema {
        Schema::new()
    }

    fn execute(&self, task: TaskRef<'_>) -> anyhow::Result<TaskStatus>;

    fn finalize(&self, _task: &mut TaskMut<'_>) -> Result<(), BuildError> {
        Ok(())
    }

    fn description(&self) -> Option<String> {
        None
    }
}

/// An [`Action`] built from a closure.
pub struct FnAction<F> {
    schema: Schema,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(TaskRef<'_>) -> anyhow::Result<TaskStatus> + Send + Sync + 'static,
{
    pub fn new(func: F) -> Self {
        FnAction {
            schema: Schema::new(),
            func,
        }
    }

    pub fn with_schema(schema: Schema, func: F) -> Self {
        FnAction { schema, func }
    }
}

impl<F> Action for FnAction<F>
where
    F: Fn(TaskRef<'_>) -> anyhow::Result<TaskStatus> + Send + Sync + 'static,
{
    fn schema(&self) -> Schema {
        self.schema.clone()
    }

    fn execute(&self, task: TaskRef<'_>) -> anyhow::Result<TaskStatus> {
        (self.func)(task)
    }
}

/// The no-op behind group tasks. Groups are structural and are trimmed out
/// of every executed graph, so this only exists to satisfy the task shape.
pub(crate) struct GroupAction;

impl Action for GroupAction {
    fn execute(&self, _task: TaskRef<'_>) -> anyhow::Result<TaskStatus> {
        Ok(TaskStatus::SucceededNoop)
    }
}

/// Target of a relationship: a concrete task or a selector string resolved
/// against the surrounding project at graph construction time.
#[derive(Debug, Clone)]
pub enum RelationshipTarget {
    Task(TaskId),
    Selector(String),
}

impl From<TaskId> for RelationshipTarget {
    fn from(id: TaskId) -> Self {
        RelationshipTarget::Task(id)
    }
}

impl From<&str> for RelationshipTarget {
    fn from(selector: &str) -> Self {
        RelationshipTarget::Selector(selector.to_string())
    }
}

impl From<String> for RelationshipTarget {
    fn from(selector: String) -> Self {
        RelationshipTarget::Selector(selector)
    }
}

/// A directed relationship to another task. Strict relationships force the
/// target into the graph and order execution; non-strict ones only order
/// execution when both tasks are present.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub target: RelationshipTarget,
    pub strict: bool,
}

pub(crate) struct TaskData {
    pub(crate) name: String,
    pub(crate) project: crate::context::ProjectId,
    pub(crate) path: String,
    pub(crate) default: bool,
    pub(crate) capture: bool,
    pub(crate) description: Option<String>,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) properties: Vec<Property>,
    pub(crate) relationships: Vec<Relationship>,
    pub(crate) members: Vec<TaskId>,
    pub(crate) is_group: bool,
    pub(crate) finalized: bool,
}

impl TaskData {
    pub(crate) fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }
}

/// A read handle to a task. This is what actions receive during `execute`.
#[derive(Clone, Copy)]
pub struct TaskRef<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) id: TaskId,
}

impl<'a> TaskRef<'a> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn context(&self) -> &'a Context {
        self.ctx
    }

    pub fn name(&self) -> &'a str {
        &self.data().name
    }

    /// The colon-joined path of the task, e.g. `:sub:compile`.
    pub fn path(&self) -> &'a str {
        &self.data().path
    }

    pub fn is_default(&self) -> bool {
        self.data().default
    }

    pub fn capture(&self) -> bool {
        self.data().capture
    }

    pub fn is_group(&self) -> bool {
        self.data().is_group
    }

    /// The tasks grouped under this task, if it is a group.
    pub fn members(&self) -> &'a [TaskId] {
        &self.data().members
    }

    pub fn description(&self) -> Option<String> {
        let data = self.data();
        data.description
            .clone()
            .or_else(|| data.action.description())
    }

    pub fn property(&self, name: &str) -> Option<Property> {
        self.data().property(name).cloned()
    }

    pub fn input(&self, name: &str) -> Result<Property, PropertyError> {
        self.kinded_property(name, PropertyKind::Input)
    }

    pub fn output(&self, name: &str) -> Result<Property, PropertyError> {
        self.kinded_property(name, PropertyKind::Output)
    }

    pub fn properties(&self) -> &'a [Property] {
        &self.data().properties
    }

    pub fn relationships(&self) -> &'a [Relationship] {
        &self.data().relationships
    }

    fn kinded_property(&self, name: &str, kind: PropertyKind) -> Result<Property, PropertyError> {
        match self.data().property(name) {
            Some(property) if property.kind() == kind => Ok(property.clone()),
            _ => Err(PropertyError::NoSuchProperty {
                task: self.path().to_string(),
                kind: kind.label(),
                name: name.to_string(),
            }),
        }
    }

    fn data(&self) -> &'a TaskData {
        self.ctx.task_data(self.id)
    }
}

/// A mutable handle to a task, used while the build script is loading and
/// inside finalizers.
pub struct TaskMut<'a> {
    pub(crate) ctx: &'a mut Context,
    pub(crate) id: TaskId,
}

impl<'a> TaskMut<'a> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn as_ref(&self) -> TaskRef<'_> {
        TaskRef {
            ctx: self.ctx,
            id: self.id,
        }
    }

    pub fn path(&self) -> String {
        self.ctx.task_data(self.id).path.clone()
    }

    pub fn property(&self, name: &str) -> Option<Property> {
        self.ctx.task_data(self.id).property(name).cloned()
    }

    pub fn input(&self, name: &str) -> Result<Property, PropertyError> {
        self.as_ref().input(name)
    }

    pub fn output(&self, name: &str) -> Result<Property, PropertyError> {
        self.as_ref().output(name)
    }

    /// Record a relationship to another task or to a selector string. String
    /// targets are resolved against the surrounding project when the graph
    /// is constructed; an unresolvable selector fails there.
    pub fn add_relationship(&mut self, target: impl Into<RelationshipTarget>, strict: bool) {
        self.ctx
            .task_data_mut(self.id)
            .relationships
            .push(Relationship {
                target: target.into(),
                strict,
            });
    }

    /// Declare strict dependencies on the given tasks.
    pub fn depends_on(&mut self, targets: impl IntoIterator<Item = TaskId>) {
        for target in targets {
            self.add_relationship(target, true);
        }
    }

    /// The symmetric inverse of [`depends_on`](Self::depends_on): make each
    /// given task strictly depend on this one.
    pub fn required_by(&mut self, targets: impl IntoIterator<Item = TaskId>) {
        let id = self.id;
        for target in targets {
            self.ctx
                .task_data_mut(target)
                .relationships
                .push(Relationship {
                    target: RelationshipTarget::Task(id),
                    strict: true,
                });
        }
    }

    /// Mark the task as part of the default selection.
    pub fn set_default(&mut self, default: bool) {
        self.ctx.task_data_mut(self.id).default = default;
    }

    pub fn set_capture(&mut self, capture: bool) {
        self.ctx.task_data_mut(self.id).capture = capture;
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.ctx.task_data_mut(self.id).description = Some(description.into());
    }

    /// Add members to a group task, by id or by selector string (resolved
    /// immediately, relative to the group's project).
    pub fn add_member(&mut self, target: impl Into<RelationshipTarget>) -> Result<(), BuildError> {
        let data = self.ctx.task_data(self.id);
        if !data.is_group {
            return Err(crate::error::ProjectError::NotAGroup {
                path: data.path.clone(),
            }
            .into());
        }
        let project = data.project;
        let resolved: Vec<TaskId> = match target.into() {
            RelationshipTarget::Task(id) => vec![id],
            RelationshipTarget::Selector(selector) => {
                crate::selector::resolve_one(self.ctx, &selector, project)?
            }
        };
        let members = &mut self.ctx.task_data_mut(self.id).members;
        for id in resolved {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        Ok(())
    }
}
