//! Parsing and resolution of task selectors.
//!
//! Grammar:
//! * `:`: the root project; selects its default tasks.
//! * `:a:b:c`: absolute path; a task selects itself, a project selects its
//!   default tasks.
//! * `a:b`: path relative to the surrounding project (the root, when
//!   selecting from the command line).
//! * `name`: every task of that name, anywhere in the tree.
//! * `^…` prefix: exclude the matched tasks from the selection.
//! * `…?` suffix: optional: a selector that matches nothing contributes
//!   nothing instead of failing.

use crate::context::{Context, ProjectId, TaskId};
use crate::error::SelectorError;
use crate::project::Member;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Selector {
    raw: String,
    exclude: bool,
    optional: bool,
    target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Root,
    Path { absolute: bool, parts: Vec<String> },
    Name(String),
}

pub(crate) fn parse(input: &str) -> Result<Selector, SelectorError> {
    let raw = input.to_string();
    let mut rest = input;

    let exclude = rest.starts_with('^');
    if exclude {
        rest = &rest[1..];
    }
    let optional = rest.ends_with('?');
    if optional {
        rest = &rest[..rest.len() - 1];
    }

    if rest.is_empty() {
        return Err(SelectorError::Invalid {
            selector: raw,
            reason: "empty selector",
        });
    }

    let target = if rest == ":" {
        Target::Root
    } else if rest.contains(':') {
        let absolute = rest.starts_with(':');
        let body = if absolute { &rest[1..] } else { rest };
        // A trailing colon marks a project reference; the empty tail segment
        // is dropped and resolution selects the project's default tasks.
        let body = body.strip_suffix(':').unwrap_or(body);
        let parts: Vec<String> = body.split(':').map(str::to_string).collect();
        if parts.iter().any(String::is_empty) {
            return Err(SelectorError::Invalid {
                selector: raw,
                reason: "empty path segment",
            });
        }
        Target::Path { absolute, parts }
    } else {
        Target::Name(rest.to_string())
    };

    Ok(Selector {
        raw,
        exclude,
        optional,
        target,
    })
}

fn default_tasks_of(ctx: &Context, project: ProjectId) -> Vec<TaskId> {
    ctx.project(project)
        .tasks()
        .filter(|t| t.is_default())
        .map(|t| t.id())
        .collect()
}

fn resolve_target(
    ctx: &Context,
    selector: &Selector,
    relative_to: ProjectId,
) -> Result<Vec<TaskId>, SelectorError> {
    let matched = match &selector.target {
        Target::Root => default_tasks_of(ctx, ctx.root()),
        Target::Name(name) => ctx
            .all_tasks()
            .into_iter()
            .filter(|&id| ctx.task_data(id).name == *name)
            .collect(),
        Target::Path { absolute, parts } => {
            let mut project = if *absolute { ctx.root() } else { relative_to };
            let mut idx = 0;
            while idx < parts.len() {
                match ctx.project_data(project).member(&parts[idx]) {
                    Some(Member::Project(child)) => {
                        project = child;
                        idx += 1;
                    }
                    _ => break,
                }
            }
            match &parts[idx..] {
                [] => default_tasks_of(ctx, project),
                [last] => match ctx.project_data(project).member(last) {
                    Some(Member::Task(id)) => vec![id],
                    _ => Vec::new(),
                },
                // An intermediate segment did not resolve to a project.
                _ => {
                    if selector.optional {
                        return Ok(Vec::new());
                    }
                    return Err(SelectorError::UnknownPath {
                        path: selector.raw.clone(),
                    });
                }
            }
        }
    };

    if matched.is_empty() && !selector.optional {
        return Err(SelectorError::UnknownTask {
            selector: selector.raw.clone(),
        });
    }
    Ok(matched)
}

/// Resolve a single non-excluding selector relative to a project. Used for
/// relationship targets and group members.
pub(crate) fn resolve_one(
    ctx: &Context,
    input: &str,
    relative_to: ProjectId,
) -> Result<Vec<TaskId>, SelectorError> {
    let selector = parse(input)?;
    if selector.exclude {
        return Err(SelectorError::Invalid {
            selector: selector.raw,
            reason: "exclusion is not allowed here",
        });
    }
    resolve_target(ctx, &selector, relative_to)
}

/// Resolve a full selection: inclusions in order (or every default task when
/// there are none), minus exclusions. Duplicates collapse to the first
/// occurrence. An empty final selection is an error.
pub(crate) fn select(ctx: &Context, inputs: &[&str]) -> Result<Vec<TaskId>, SelectorError> {
    let selectors = inputs
        .iter()
        .map(|input| parse(input))
        .collect::<Result<Vec<_>, _>>()?;

    let mut included: Vec<TaskId> = Vec::new();
    let mut any_inclusion = false;
    for selector in selectors.iter().filter(|s| !s.exclude) {
        any_inclusion = true;
        for id in resolve_target(ctx, selector, ctx.root())? {
            if !included.contains(&id) {
                included.push(id);
            }
        }
    }
    if !any_inclusion {
        included = ctx.default_tasks();
    }

    let mut excluded: Vec<TaskId> = Vec::new();
    for selector in selectors.iter().filter(|s| s.exclude) {
        excluded.extend(resolve_target(ctx, selector, ctx.root())?);
    }
    included.retain(|id| !excluded.contains(id));

    if included.is_empty() {
        return Err(SelectorError::NothingSelected);
    }
    Ok(included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use crate::task::{FnAction, TaskRef, TaskStatus};

    fn noop() -> FnAction<impl Fn(TaskRef<'_>) -> anyhow::Result<TaskStatus> + Send + Sync> {
        FnAction::new(|_| Ok(TaskStatus::Succeeded))
    }

    /// Root with tasks a (default), b; child `sub` with tasks a, c (default).
    fn fixture() -> (Context, [TaskId; 4]) {
        let mut ctx = Context::new("build");
        let root_a = ctx.root_mut().add_task("a", noop()).unwrap();
        let root_b = ctx.root_mut().add_task("b", noop()).unwrap();
        let sub = ctx.root_mut().create_child("sub").unwrap();
        let sub_a = ctx.project_mut(sub).add_task("a", noop()).unwrap();
        let sub_c = ctx.project_mut(sub).add_task("c", noop()).unwrap();
        ctx.task_mut(root_a).set_default(true);
        ctx.task_mut(sub_c).set_default(true);
        (ctx, [root_a, root_b, sub_a, sub_c])
    }

    #[test]
    fn parse_rejects_empty_and_broken_paths() {
        assert!(matches!(parse(""), Err(SelectorError::Invalid { .. })));
        assert!(matches!(parse("^"), Err(SelectorError::Invalid { .. })));
        assert!(matches!(parse("a::b"), Err(SelectorError::Invalid { .. })));
    }

    #[test]
    fn absolute_path_selects_a_task() {
        let (ctx, [_, root_b, sub_a, _]) = fixture();
        assert_eq!(select(&ctx, &[":b"]).unwrap(), vec![root_b]);
        assert_eq!(select(&ctx, &[":sub:a"]).unwrap(), vec![sub_a]);
    }

    #[test]
    fn relative_path_resolves_from_the_root() {
        let (ctx, [.., sub_a, _]) = fixture();
        assert_eq!(select(&ctx, &["sub:a"]).unwrap(), vec![sub_a]);
    }

    #[test]
    fn project_path_selects_its_default_tasks() {
        let (ctx, [.., sub_c]) = fixture();
        assert_eq!(select(&ctx, &[":sub"]).unwrap(), vec![sub_c]);
        assert_eq!(select(&ctx, &[":sub:"]).unwrap(), vec![sub_c]);
    }

    #[test]
    fn root_selector_selects_root_defaults_only() {
        let (ctx, [root_a, ..]) = fixture();
        assert_eq!(select(&ctx, &[":"]).unwrap(), vec![root_a]);
    }

    #[test]
    fn bare_name_matches_everywhere() {
        let (ctx, [root_a, _, sub_a, _]) = fixture();
        assert_eq!(select(&ctx, &["a"]).unwrap(), vec![root_a, sub_a]);
    }

    #[test]
    fn empty_selection_falls_back_to_defaults() {
        let (ctx, [root_a, _, _, sub_c]) = fixture();
        assert_eq!(select(&ctx, &[]).unwrap(), vec![root_a, sub_c]);
    }

    #[test]
    fn exclusions_subtract_from_the_selection() {
        let (ctx, [root_a, _, sub_a, sub_c]) = fixture();
        assert_eq!(select(&ctx, &["a", "^:a"]).unwrap(), vec![sub_a]);
        // Exclusion applies to the default selection too.
        assert_eq!(select(&ctx, &["^a"]).unwrap(), vec![sub_c]);
    }

    #[test]
    fn selection_deduplicates() {
        let (ctx, [_, root_b, ..]) = fixture();
        assert_eq!(select(&ctx, &[":b", ":b", "b"]).unwrap(), vec![root_b]);
    }

    #[test]
    fn unknown_selectors_fail() {
        let (ctx, _) = fixture();
        assert!(matches!(
            select(&ctx, &[":nope"]),
            Err(SelectorError::UnknownTask { .. })
        ));
        assert!(matches!(
            select(&ctx, &[":nope:deeper:x"]),
            Err(SelectorError::UnknownPath { .. })
        ));
        assert!(matches!(
            select(&ctx, &["ghost"]),
            Err(SelectorError::UnknownTask { .. })
        ));
    }

    #[test]
    fn optional_suffix_tolerates_no_match() {
        let (ctx, [root_a, ..]) = fixture();
        assert_eq!(select(&ctx, &[":a", "ghost?"]).unwrap(), vec![root_a]);
        assert!(matches!(
            select(&ctx, &["ghost?"]),
            Err(SelectorError::NothingSelected)
        ));
    }

    #[test]
    fn excluding_everything_is_an_error() {
        let (ctx, _) = fixture();
        assert!(matches!(
            select(&ctx, &[":a", "^:a"]),
            Err(SelectorError::NothingSelected)
        ));
    }

    #[test]
    fn resolve_one_handles_names_and_absolute_paths() {
        let (ctx, [root_a, _, sub_a, _]) = fixture();
        let sub = ctx.root_project().project("sub").unwrap().id();
        // Bare names match across the whole tree, regardless of the base.
        assert_eq!(resolve_one(&ctx, "a", sub).unwrap(), vec![root_a, sub_a]);
        // Absolute paths ignore the base project.
        assert_eq!(resolve_one(&ctx, ":a", sub).unwrap(), vec![root_a]);
        // Exclusions are rejected outside of a full selection.
        assert!(matches!(
            resolve_one(&ctx, "^a", sub),
            Err(SelectorError::Invalid { .. })
        ));
    }
}
