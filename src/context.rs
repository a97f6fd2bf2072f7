//! The [`Context`] is the single place where all parts of a build invocation
//! come together: it owns the project tree and every task in it, carries the
//! build directory and a typed metadata store, and drives finalization and
//! execution.
//!
//! Projects and tasks are stored in arena vectors; [`ProjectId`] and
//! [`TaskId`] are indices into them, so back references never form ownership
//! cycles. The task graph and all handles borrow the context and must not
//! outlive it.

use std::any::{Any, TypeId as StdTypeId};
use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{BuildError, ProjectError};
use crate::executor::{BuildSummary, ExecutionObserver, Executor, ExecutorConfig};
use crate::graph::TaskGraph;
use crate::project::{DEFAULT_GROUPS, Member, ProjectData, ProjectMut, ProjectRef, validate_name};
use crate::property::{Property, PropertyKind};
use crate::task::{Action, GroupAction, TaskData, TaskMut, TaskRef};

/// Handle to a project in the context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(pub(crate) u32);

/// Handle to a task in the context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

/// A store of arbitrary user objects keyed by their type.
#[derive(Default)]
pub struct Metadata {
    entries: HashMap<StdTypeId, Box<dyn Any + Send + Sync>>,
}

impl Metadata {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(StdTypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&StdTypeId::of::<T>())
            .and_then(|b| b.downcast_ref())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&StdTypeId::of::<T>())
            .and_then(|b| b.downcast_mut())
    }

    pub fn get_or_insert_with<T: Any + Send + Sync>(&mut self, create: impl FnOnce() -> T) -> &mut T {
        self.entries
            .entry(StdTypeId::of::<T>())
            .or_insert_with(|| Box::new(create()))
            .downcast_mut()
            .expect("metadata entry has the keyed type")
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&StdTypeId::of::<T>())
    }
}

/// Root object of one build invocation.
pub struct Context {
    build_directory: Utf8PathBuf,
    pub(crate) projects: Vec<ProjectData>,
    pub(crate) tasks: Vec<TaskData>,
    metadata: Metadata,
    sealed: bool,
}

impl Context {
    /// Create a context with an empty root project. The root's directory is
    /// the current directory (`.`); the build directory is where tasks may
    /// place their outputs.
    pub fn new(build_directory: impl Into<Utf8PathBuf>) -> Self {
        let mut ctx = Context {
            build_directory: build_directory.into(),
            projects: Vec::new(),
            tasks: Vec::new(),
            metadata: Metadata::default(),
            sealed: false,
        };
        ctx.projects.push(ProjectData {
            name: String::new(),
            directory: Utf8PathBuf::from("."),
            parent: None,
            path: ":".to_string(),
            members: Vec::new(),
        });
        for group in DEFAULT_GROUPS {
            ctx.ensure_group(ProjectId(0), group)
                .expect("default groups on a fresh root cannot collide");
        }
        ctx
    }

    pub fn build_directory(&self) -> &Utf8Path {
        &self.build_directory
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable access to the metadata store. Only available while the caller
    /// holds the context exclusively, which rules out writes concurrent with
    /// task execution.
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn root(&self) -> ProjectId {
        ProjectId(0)
    }

    pub fn root_project(&self) -> ProjectRef<'_> {
        self.project(ProjectId(0))
    }

    pub fn root_mut(&mut self) -> ProjectMut<'_> {
        ProjectMut {
            ctx: self,
            id: ProjectId(0),
        }
    }

    pub fn project(&self, id: ProjectId) -> ProjectRef<'_> {
        ProjectRef { ctx: self, id }
    }

    pub fn project_mut(&mut self, id: ProjectId) -> ProjectMut<'_> {
        ProjectMut { ctx: self, id }
    }

    pub fn task(&self, id: TaskId) -> TaskRef<'_> {
        TaskRef { ctx: self, id }
    }

    pub fn task_mut(&mut self, id: TaskId) -> TaskMut<'_> {
        TaskMut { ctx: self, id }
    }

    /// All projects, root first, in depth-first registration order.
    pub fn projects(&self) -> Vec<ProjectId> {
        let mut order = Vec::with_capacity(self.projects.len());
        let mut stack = vec![ProjectId(0)];
        while let Some(id) = stack.pop() {
            order.push(id);
            // Reversed so the leftmost child is visited first.
            for (_, member) in self.project_data(id).members.iter().rev() {
                if let Member::Project(child) = member {
                    stack.push(*child);
                }
            }
        }
        order
    }

    /// All tasks, in depth-first project order and registration order within
    /// each project.
    pub fn all_tasks(&self) -> Vec<TaskId> {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for project in self.projects() {
            for (_, member) in &self.project_data(project).members {
                if let Member::Task(id) = member {
                    tasks.push(*id);
                }
            }
        }
        tasks
    }

    /// Every task marked `default`, across all projects.
    pub fn default_tasks(&self) -> Vec<TaskId> {
        self.all_tasks()
            .into_iter()
            .filter(|&id| self.task_data(id).default)
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.sealed
    }

    /// Call every task's finalizer exactly once, then seal the context:
    /// structural mutation fails afterwards and all input properties are
    /// frozen. Finalizers may still add tasks and relationships; tasks added
    /// during finalization are finalized as well.
    pub fn finalize(&mut self) -> Result<(), BuildError> {
        if self.sealed {
            return Ok(());
        }
        loop {
            let pending: Vec<TaskId> = self
                .all_tasks()
                .into_iter()
                .filter(|&id| !self.task_data(id).finalized)
                .collect();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                if self.task_data(id).finalized {
                    continue;
                }
                self.task_data_mut(id).finalized = true;
                let action = self.task_data(id).action.clone();
                let mut scope = TaskMut { ctx: self, id };
                action.finalize(&mut scope)?;
            }
        }
        self.sealed = true;
        for task in &self.tasks {
            for property in &task.properties {
                if property.kind() == PropertyKind::Input {
                    property.freeze();
                }
            }
        }
        Ok(())
    }

    /// Resolve selectors, build and trim the task graph, and run it with the
    /// given configuration. Finalizes the context first if necessary.
    ///
    /// Configuration errors (unknown selectors, cycles) fail before any task
    /// runs. Task failures do not: they are recorded in the returned
    /// [`BuildSummary`]; use [`BuildSummary::check`] to turn them into an
    /// error.
    pub fn execute(
        &mut self,
        selectors: &[&str],
        config: &ExecutorConfig,
    ) -> Result<BuildSummary, BuildError> {
        self.execute_with_observer(selectors, config, &mut crate::executor::LogObserver::default())
    }

    pub fn execute_with_observer(
        &mut self,
        selectors: &[&str],
        config: &ExecutorConfig,
        observer: &mut dyn ExecutionObserver,
    ) -> Result<BuildSummary, BuildError> {
        if !self.sealed {
            self.finalize()?;
        }
        let goals = crate::selector::select(self, selectors)?;
        let graph = TaskGraph::build(self, &goals)?;
        let executor = Executor::new(config.clone());
        Ok(executor.run_with_observer(self, &graph, observer))
    }

    /// Resolve a single selector relative to a project (the root by
    /// default). Exposed for relationship and group-member resolution.
    pub fn resolve(
        &self,
        selector: &str,
        relative_to: Option<ProjectId>,
    ) -> Result<Vec<TaskId>, crate::error::SelectorError> {
        crate::selector::resolve_one(self, selector, relative_to.unwrap_or(ProjectId(0)))
    }

    // Arena internals

    pub(crate) fn project_data(&self, id: ProjectId) -> &ProjectData {
        &self.projects[id.0 as usize]
    }

    pub(crate) fn project_data_mut(&mut self, id: ProjectId) -> &mut ProjectData {
        &mut self.projects[id.0 as usize]
    }

    pub(crate) fn task_data(&self, id: TaskId) -> &TaskData {
        &self.tasks[id.0 as usize]
    }

    pub(crate) fn task_data_mut(&mut self, id: TaskId) -> &mut TaskData {
        &mut self.tasks[id.0 as usize]
    }

    pub(crate) fn task_path(&self, id: TaskId) -> &str {
        &self.task_data(id).path
    }

    fn member_path(&self, parent: ProjectId, name: &str) -> String {
        let parent_path = &self.project_data(parent).path;
        if parent_path == ":" {
            format!(":{name}")
        } else {
            format!("{parent_path}:{name}")
        }
    }

    fn check_collision(&self, project: ProjectId, name: &str) -> Result<(), ProjectError> {
        if self.project_data(project).member(name).is_some() {
            return Err(ProjectError::NameCollision {
                project: self.project_data(project).path.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn register_project(
        &mut self,
        parent: ProjectId,
        name: &str,
        directory: Utf8PathBuf,
    ) -> Result<ProjectId, ProjectError> {
        if self.sealed {
            return Err(ProjectError::ContextSealed);
        }
        validate_name(name)?;
        self.check_collision(parent, name)?;

        let id = ProjectId(self.projects.len() as u32);
        let path = self.member_path(parent, name);
        self.projects.push(ProjectData {
            name: name.to_string(),
            directory,
            parent: Some(parent),
            path,
            members: Vec::new(),
        });
        self.project_data_mut(parent)
            .members
            .push((name.to_string(), Member::Project(id)));

        for group in DEFAULT_GROUPS {
            self.ensure_group(id, group)
                .expect("default groups on a fresh project cannot collide");
        }
        Ok(id)
    }

    pub(crate) fn register_task(
        &mut self,
        project: ProjectId,
        name: &str,
        action: impl Action,
        is_group: bool,
    ) -> Result<TaskId, ProjectError> {
        if self.sealed {
            return Err(ProjectError::ContextSealed);
        }
        validate_name(name)?;
        self.check_collision(project, name)?;

        let id = TaskId(self.tasks.len() as u32);
        let path = self.member_path(project, name);
        let schema = action.schema();
        let properties = schema
            .entries
            .iter()
            .map(|entry| Property::new(id, &path, entry.name, entry.kind, entry.ty.clone()))
            .collect();

        self.tasks.push(TaskData {
            name: name.to_string(),
            project,
            path,
            default: false,
            capture: false,
            description: None,
            action: std::sync::Arc::new(action),
            properties,
            relationships: Vec::new(),
            members: Vec::new(),
            is_group,
            finalized: false,
        });
        self.project_data_mut(project)
            .members
            .push((name.to_string(), Member::Task(id)));
        Ok(id)
    }

    /// Idempotent getter-or-creator for a named group task.
    pub(crate) fn ensure_group(
        &mut self,
        project: ProjectId,
        name: &str,
    ) -> Result<TaskId, ProjectError> {
        match self.project_data(project).member(name) {
            Some(Member::Task(id)) if self.task_data(id).is_group => Ok(id),
            Some(Member::Task(id)) => Err(ProjectError::NotAGroup {
                path: self.task_data(id).path.clone(),
            }),
            Some(Member::Project(_)) => Err(ProjectError::NameCollision {
                project: self.project_data(project).path.clone(),
                name: name.to_string(),
            }),
            None => self.register_task(project, name, GroupAction, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FnAction, TaskStatus};

    fn noop() -> FnAction<impl Fn(TaskRef<'_>) -> anyhow::Result<TaskStatus> + Send + Sync> {
        FnAction::new(|_| Ok(TaskStatus::Succeeded))
    }

    #[test]
    fn root_path_is_a_single_colon() {
        let ctx = Context::new("build");
        assert_eq!(ctx.root_project().path(), ":");
    }

    #[test]
    fn every_project_gets_the_default_groups() {
        let mut ctx = Context::new("build");
        let child = ctx.root_mut().create_child("sub").unwrap();
        for group in DEFAULT_GROUPS {
            assert!(ctx.project(ctx.root()).task(group).is_some());
            assert!(ctx.project(child).task(group).is_some());
        }
        assert!(ctx.project(child).task("build").unwrap().is_group());
    }

    #[test]
    fn task_paths_chain_from_the_root() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let sub = ctx.root_mut().create_child("sub").unwrap();
        let b = ctx.project_mut(sub).add_task("b", noop()).unwrap();

        assert_eq!(ctx.task(a).path(), ":a");
        assert_eq!(ctx.task(b).path(), ":sub:b");
        assert_eq!(ctx.project(sub).path(), ":sub");
    }

    #[test]
    fn member_names_are_unique_within_a_project() {
        let mut ctx = Context::new("build");
        ctx.root_mut().add_task("x", noop()).unwrap();
        let err = ctx.root_mut().add_task("x", noop()).unwrap_err();
        assert!(matches!(err, ProjectError::NameCollision { .. }));
        let err = ctx.root_mut().create_child("x").unwrap_err();
        assert!(matches!(err, ProjectError::NameCollision { .. }));
    }

    #[test]
    fn group_is_idempotent() {
        let mut ctx = Context::new("build");
        let g1 = ctx.root_mut().group("docs").unwrap();
        let g2 = ctx.root_mut().group("docs").unwrap();
        assert_eq!(g1, g2);
    }

    #[test]
    fn group_rejects_plain_task_names() {
        let mut ctx = Context::new("build");
        ctx.root_mut().add_task("compile", noop()).unwrap();
        assert!(matches!(
            ctx.root_mut().group("compile").unwrap_err(),
            ProjectError::NotAGroup { .. }
        ));
    }

    #[test]
    fn sealed_context_rejects_structural_changes() {
        let mut ctx = Context::new("build");
        ctx.root_mut().add_task("a", noop()).unwrap();
        ctx.finalize().unwrap();

        assert!(matches!(
            ctx.root_mut().add_task("b", noop()).unwrap_err(),
            ProjectError::ContextSealed
        ));
        assert!(matches!(
            ctx.root_mut().create_child("sub").unwrap_err(),
            ProjectError::ContextSealed
        ));
    }

    #[test]
    fn finalize_freezes_input_properties() {
        use crate::task::{Action, Schema};
        use crate::value::TypeDescriptor;

        struct WithInput;
        impl Action for WithInput {
            fn schema(&self) -> Schema {
                Schema::new().input("src", TypeDescriptor::String)
            }
            fn execute(&self, _task: TaskRef<'_>) -> anyhow::Result<TaskStatus> {
                Ok(TaskStatus::Succeeded)
            }
        }

        let mut ctx = Context::new("build");
        let id = ctx.root_mut().add_task("t", WithInput).unwrap();
        ctx.task(id).input("src").unwrap().set("ok").unwrap();
        ctx.finalize().unwrap();

        let err = ctx.task(id).input("src").unwrap().set("nope").unwrap_err();
        assert!(matches!(err, crate::error::PropertyError::Frozen { .. }));
    }

    #[test]
    fn finalizers_run_once_and_may_add_relationships() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Finalizing;
        impl Action for Finalizing {
            fn execute(&self, _task: TaskRef<'_>) -> anyhow::Result<TaskStatus> {
                Ok(TaskStatus::Succeeded)
            }
            fn finalize(&self, task: &mut TaskMut<'_>) -> Result<(), BuildError> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                task.add_relationship("helper", true);
                Ok(())
            }
        }

        let mut ctx = Context::new("build");
        ctx.root_mut().add_task("helper", noop()).unwrap();
        let id = ctx.root_mut().add_task("t", Finalizing).unwrap();
        ctx.finalize().unwrap();
        ctx.finalize().unwrap();

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.task(id).relationships().len(), 1);
    }

    #[test]
    fn metadata_stores_by_type() {
        #[derive(Debug, PartialEq)]
        struct Marker(u32);

        let mut ctx = Context::new("build");
        ctx.metadata_mut().insert(Marker(7));
        assert_eq!(ctx.metadata().get::<Marker>(), Some(&Marker(7)));
        assert!(!ctx.metadata().contains::<String>());

        let entry = ctx.metadata_mut().get_or_insert_with(|| Marker(9));
        assert_eq!(entry, &mut Marker(7));
    }
}
