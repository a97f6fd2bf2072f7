//! Projects: path-addressable namespaces of tasks and child projects.
//!
//! The project tree is owned by the [`Context`] arena; [`ProjectRef`] and
//! [`ProjectMut`] are thin handles around a [`ProjectId`]. The root project's
//! path is `:`; every other member's path is the colon-joined chain from the
//! root, e.g. `:backend:compile`.

use camino::{Utf8Path, Utf8PathBuf};

use crate::context::{Context, ProjectId, TaskId};
use crate::error::{BuildError, ProjectError, SelectorError};
use crate::property::PropertyValue;
use crate::task::{Action, TaskMut, TaskRef};

/// Groups every project starts out with.
pub const DEFAULT_GROUPS: [&str; 4] = ["fmt", "lint", "build", "test"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Project(ProjectId),
    Task(TaskId),
}

pub(crate) struct ProjectData {
    pub(crate) name: String,
    pub(crate) directory: Utf8PathBuf,
    pub(crate) parent: Option<ProjectId>,
    pub(crate) path: String,
    // Insertion ordered; member names are unique across tasks and children.
    pub(crate) members: Vec<(String, Member)>,
}

impl ProjectData {
    pub(crate) fn member(&self, name: &str) -> Option<Member> {
        self.members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| *m)
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), ProjectError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name.contains(':') {
        Some("must not contain colons")
    } else if name.starts_with('^') || name.ends_with('?') {
        Some("must not use selector metacharacters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ProjectError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// A read handle to a project.
#[derive(Clone, Copy)]
pub struct ProjectRef<'a> {
    pub(crate) ctx: &'a Context,
    pub(crate) id: ProjectId,
}

impl<'a> ProjectRef<'a> {
    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn name(&self) -> &'a str {
        &self.data().name
    }

    /// The colon-joined path from the root; the root's path is `:`.
    pub fn path(&self) -> &'a str {
        &self.data().path
    }

    pub fn directory(&self) -> &'a Utf8Path {
        &self.data().directory
    }

    pub fn parent(&self) -> Option<ProjectRef<'a>> {
        self.data().parent.map(|id| ProjectRef { ctx: self.ctx, id })
    }

    /// Look up a task member by name.
    pub fn task(&self, name: &str) -> Option<TaskRef<'a>> {
        match self.data().member(name) {
            Some(Member::Task(id)) => Some(TaskRef { ctx: self.ctx, id }),
            _ => None,
        }
    }

    /// Look up a child project by name.
    pub fn project(&self, name: &str) -> Option<ProjectRef<'a>> {
        match self.data().member(name) {
            Some(Member::Project(id)) => Some(ProjectRef { ctx: self.ctx, id }),
            _ => None,
        }
    }

    /// All task members, in registration order.
    pub fn tasks(self) -> impl Iterator<Item = TaskRef<'a>> + 'a {
        let ctx = self.ctx;
        self.data().members.iter().filter_map(move |(_, m)| match m {
            Member::Task(id) => Some(TaskRef { ctx, id: *id }),
            Member::Project(_) => None,
        })
    }

    /// All child projects, in registration order.
    pub fn children(self) -> impl Iterator<Item = ProjectRef<'a>> + 'a {
        let ctx = self.ctx;
        self.data().members.iter().filter_map(move |(_, m)| match m {
            Member::Project(id) => Some(ProjectRef { ctx, id: *id }),
            Member::Task(_) => None,
        })
    }

    /// Resolve a selector (relative like `foo:bar` or absolute like
    /// `:foo:bar`) against this project.
    pub fn resolve(&self, selector: &str) -> Result<Vec<TaskId>, SelectorError> {
        crate::selector::resolve_one(self.ctx, selector, self.id)
    }

    fn data(&self) -> &'a ProjectData {
        self.ctx.project_data(self.id)
    }
}

/// A mutable handle to a project: the registration API a build script uses.
pub struct ProjectMut<'a> {
    pub(crate) ctx: &'a mut Context,
    pub(crate) id: ProjectId,
}

impl<'a> ProjectMut<'a> {
    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn as_ref(&self) -> ProjectRef<'_> {
        ProjectRef {
            ctx: self.ctx,
            id: self.id,
        }
    }

    pub fn path(&self) -> String {
        self.ctx.project_data(self.id).path.clone()
    }

    /// Register a child project. Its directory defaults to a subdirectory of
    /// this project's directory named after it.
    pub fn create_child(&mut self, name: &str) -> Result<ProjectId, ProjectError> {
        let directory = self.ctx.project_data(self.id).directory.join(name);
        self.ctx.register_project(self.id, name, directory)
    }

    pub fn create_child_in(
        &mut self,
        name: &str,
        directory: impl Into<Utf8PathBuf>,
    ) -> Result<ProjectId, ProjectError> {
        self.ctx.register_project(self.id, name, directory.into())
    }

    /// Register a child project and return a handle to it.
    pub fn child(&mut self, name: &str) -> Result<ProjectMut<'_>, ProjectError> {
        let id = self.create_child(name)?;
        Ok(ProjectMut { ctx: self.ctx, id })
    }

    /// Register a task with the given action.
    pub fn add_task(&mut self, name: &str, action: impl Action) -> Result<TaskId, ProjectError> {
        self.ctx.register_task(self.id, name, action, false)
    }

    /// Factory shortcut: register a task and set its declared properties.
    /// Every value is routed through [`Property::set`](crate::Property::set),
    /// so adapter validation applies.
    pub fn do_task(
        &mut self,
        name: &str,
        action: impl Action,
        properties: impl IntoIterator<Item = (&'static str, PropertyValue)>,
    ) -> Result<TaskId, BuildError> {
        let id = self.ctx.register_task(self.id, name, action, false)?;
        for (prop_name, value) in properties {
            let property = self.ctx.task_data(id).property(prop_name).cloned().ok_or(
                crate::error::PropertyError::NoSuchProperty {
                    task: self.ctx.task_data(id).path.clone(),
                    kind: "declared",
                    name: prop_name.to_string(),
                },
            )?;
            property.set(value)?;
        }
        Ok(id)
    }

    /// Get or create the named group task.
    pub fn group(&mut self, name: &str) -> Result<TaskId, ProjectError> {
        self.ctx.ensure_group(self.id, name)
    }

    pub fn task(&self, name: &str) -> Option<TaskId> {
        match self.ctx.project_data(self.id).member(name) {
            Some(Member::Task(id)) => Some(id),
            _ => None,
        }
    }

    pub fn task_mut(&mut self, name: &str) -> Option<TaskMut<'_>> {
        match self.ctx.project_data(self.id).member(name) {
            Some(Member::Task(id)) => Some(TaskMut { ctx: self.ctx, id }),
            _ => None,
        }
    }

    pub fn project(&self, name: &str) -> Option<ProjectId> {
        match self.ctx.project_data(self.id).member(name) {
            Some(Member::Project(id)) => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_reject_selector_syntax() {
        assert!(validate_name("compile").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a:b").is_err());
        assert!(validate_name("^x").is_err());
        assert!(validate_name("x?").is_err());
    }
}
