//! The materialized task graph.
//!
//! [`TaskGraph::build`] turns a selected set of tasks into an executable DAG:
//! it pulls in every relationship target reachable from the selection,
//! derives strict edges from property provenance, trims away tasks that are
//! not strictly required, dissolves group tasks into direct edges between
//! their members and dependents, and fails fast on cycles.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::context::{Context, TaskId};
use crate::error::GraphError;
use crate::task::RelationshipTarget;

/// Edge label. Strict edges force inclusion and ordering; non-strict edges
/// only order execution when both endpoints are present.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub strict: bool,
}

#[derive(Debug)]
pub struct TaskGraph {
    graph: StableDiGraph<TaskId, Edge>,
    index: HashMap<TaskId, NodeIndex>,
    goals: Vec<TaskId>,
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Build the graph for the given goal tasks. Edges point from a
    /// dependency to its dependent.
    pub fn build(ctx: &Context, goals: &[TaskId]) -> Result<TaskGraph, GraphError> {
        let mut graph: StableDiGraph<TaskId, Edge> = StableDiGraph::new();
        let mut index: HashMap<TaskId, NodeIndex> = HashMap::new();

        fn ensure(
            graph: &mut StableDiGraph<TaskId, Edge>,
            index: &mut HashMap<TaskId, NodeIndex>,
            id: TaskId,
        ) -> NodeIndex {
            *index.entry(id).or_insert_with(|| graph.add_node(id))
        }

        // Populate: walk out from the goals over every relationship, strict
        // or not. Inclusion is decided later by the trim.
        let mut queue: VecDeque<TaskId> = goals.iter().copied().collect();
        let mut seen: HashSet<TaskId> = queue.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let node = ensure(&mut graph, &mut index, id);
            for (target, strict) in dependencies_of(ctx, id)? {
                let target_node = ensure(&mut graph, &mut index, target);
                match graph.find_edge(target_node, node) {
                    Some(edge) => {
                        if let Some(weight) = graph.edge_weight_mut(edge) {
                            weight.strict |= strict;
                        }
                    }
                    None => {
                        graph.add_edge(target_node, node, Edge { strict });
                    }
                }
                if seen.insert(target) {
                    queue.push_back(target);
                }
            }
        }

        // Required: transitive closure of the goals under strict edges.
        let mut required: HashSet<NodeIndex> = HashSet::new();
        let mut stack: Vec<NodeIndex> = goals.iter().map(|id| index[id]).collect();
        while let Some(node) = stack.pop() {
            if !required.insert(node) {
                continue;
            }
            for edge in graph.edges_directed(node, Direction::Incoming) {
                if edge.weight().strict {
                    stack.push(edge.source());
                }
            }
        }

        // Trim tasks that are not required; their edges are promoted so
        // ordering constraints survive.
        let unrequired: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|node| !required.contains(node))
            .collect();
        for node in unrequired {
            remove_preserving_edges(&mut graph, node);
        }

        // Dissolve groups: a group is structural, never executed work. Its
        // dependents inherit direct edges to the group's dependencies.
        let group_nodes: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&node| ctx.task_data(graph[node]).is_group)
            .collect();
        for node in group_nodes {
            remove_preserving_edges(&mut graph, node);
        }

        let index: HashMap<TaskId, NodeIndex> = graph
            .node_indices()
            .map(|node| (graph[node], node))
            .collect();

        let order = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|node| graph[node]).collect(),
            Err(_) => {
                return Err(GraphError::CycleDetected {
                    cycle: find_cycle(ctx, &graph),
                });
            }
        };

        Ok(TaskGraph {
            graph,
            index,
            goals: goals.to_vec(),
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// The originally selected tasks (groups included, even though they are
    /// dissolved out of the executable graph).
    pub fn goals(&self) -> &[TaskId] {
        &self.goals
    }

    /// Tasks in a valid execution order.
    pub fn execution_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Direct predecessors (dependencies) of a task with edge strictness.
    pub fn predecessors(&self, id: TaskId) -> Vec<(TaskId, bool)> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct successors (dependents) of a task with edge strictness.
    pub fn successors(&self, id: TaskId) -> Vec<(TaskId, bool)> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: TaskId, direction: Direction) -> Vec<(TaskId, bool)> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(node, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                (self.graph[other], edge.weight().strict)
            })
            .collect()
    }
}

/// Direct dependencies of a task: group members, explicit relationships
/// (selector strings resolved against the surrounding project), and strict
/// edges implied by property provenance.
///
/// Duplicates collapse to the strictest edge, except that an explicit task
/// reference wins over a string reference to the same task.
fn dependencies_of(ctx: &Context, id: TaskId) -> Result<Vec<(TaskId, bool)>, GraphError> {
    fn merge(acc: &mut Vec<(TaskId, bool)>, own: TaskId, target: TaskId, strict: bool) {
        if target == own {
            return;
        }
        match acc.iter_mut().find(|(t, _)| *t == target) {
            Some((_, s)) => *s |= strict,
            None => acc.push((target, strict)),
        }
    }

    let data = ctx.task_data(id);
    let mut merged: Vec<(TaskId, bool)> = Vec::new();

    for &member in &data.members {
        merge(&mut merged, id, member, true);
    }
    for relationship in &data.relationships {
        if let RelationshipTarget::Task(target) = relationship.target {
            merge(&mut merged, id, target, relationship.strict);
        }
    }

    let mut resolved: Vec<(TaskId, bool)> = Vec::new();
    for relationship in &data.relationships {
        if let RelationshipTarget::Selector(selector) = &relationship.target {
            let targets = crate::selector::resolve_one(ctx, selector, data.project).map_err(
                |source| GraphError::Relationship {
                    task: data.path.clone(),
                    source,
                },
            )?;
            for target in targets {
                merge(&mut resolved, id, target, relationship.strict);
            }
        }
    }
    for (target, strict) in resolved {
        if !merged.iter().any(|(t, _)| *t == target) {
            merged.push((target, strict));
        }
    }

    // Deriving an input from another task's property implies a strict
    // dependency on that task.
    for property in &data.properties {
        for upstream in property.upstream() {
            if let Some(owner) = upstream.owner() {
                merge(&mut merged, id, owner, true);
            }
        }
    }

    Ok(merged)
}

/// Remove a node, bridging every incoming edge to every outgoing edge. The
/// bridged edge is strict if either side was.
fn remove_preserving_edges(graph: &mut StableDiGraph<TaskId, Edge>, node: NodeIndex) {
    let incoming: Vec<(NodeIndex, bool)> = graph
        .edges_directed(node, Direction::Incoming)
        .map(|e| (e.source(), e.weight().strict))
        .collect();
    let outgoing: Vec<(NodeIndex, bool)> = graph
        .edges_directed(node, Direction::Outgoing)
        .map(|e| (e.target(), e.weight().strict))
        .collect();

    for &(pred, pred_strict) in &incoming {
        for &(succ, succ_strict) in &outgoing {
            if pred == succ {
                continue;
            }
            let strict = pred_strict || succ_strict;
            match graph.find_edge(pred, succ) {
                Some(edge) => {
                    if let Some(weight) = graph.edge_weight_mut(edge) {
                        weight.strict |= strict;
                    }
                }
                None => {
                    graph.add_edge(pred, succ, Edge { strict });
                }
            }
        }
    }
    graph.remove_node(node);
}

/// Reconstruct the offending cycle as task paths, closed on itself.
fn find_cycle(ctx: &Context, graph: &StableDiGraph<TaskId, Edge>) -> Vec<String> {
    for scc in tarjan_scc(graph) {
        let cyclic = scc.len() > 1
            || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
        if cyclic {
            let mut cycle: Vec<String> = scc
                .iter()
                .map(|&node| ctx.task_path(graph[node]).to_string())
                .collect();
            cycle.push(cycle[0].clone());
            return cycle;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Context;
    use crate::task::{FnAction, TaskRef, TaskStatus};

    fn noop() -> FnAction<impl Fn(TaskRef<'_>) -> anyhow::Result<TaskStatus> + Send + Sync> {
        FnAction::new(|_| Ok(TaskStatus::Succeeded))
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        let c = ctx.root_mut().add_task("c", noop()).unwrap();
        ctx.task_mut(c).depends_on([b]);
        ctx.task_mut(b).depends_on([a]);

        let graph = TaskGraph::build(&ctx, &[c]).unwrap();
        assert_eq!(graph.execution_order(), &[a, b, c]);
    }

    #[test]
    fn non_strict_targets_are_pruned_when_not_required() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        ctx.task_mut(a).add_relationship(b, false);

        let graph = TaskGraph::build(&ctx, &[a]).unwrap();
        assert!(graph.contains(a));
        assert!(!graph.contains(b));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn non_strict_edges_order_when_both_are_required() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        ctx.task_mut(a).add_relationship(b, false);

        let graph = TaskGraph::build(&ctx, &[a, b]).unwrap();
        assert_eq!(graph.execution_order(), &[b, a]);
        assert_eq!(graph.predecessors(a), vec![(b, false)]);
    }

    #[test]
    fn groups_dissolve_into_member_edges() {
        let mut ctx = Context::new("build");
        let compile = ctx.root_mut().add_task("compile", noop()).unwrap();
        let link = ctx.root_mut().add_task("link", noop()).unwrap();
        ctx.task_mut(compile).depends_on([link]);
        let build = ctx.root_mut().group("build").unwrap();
        ctx.task_mut(build).add_member(compile).unwrap();
        ctx.task_mut(build).add_member(link).unwrap();

        let graph = TaskGraph::build(&ctx, &[build]).unwrap();
        assert!(!graph.contains(build));
        assert_eq!(graph.execution_order(), &[link, compile]);
    }

    #[test]
    fn dependents_of_a_group_depend_on_its_members() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        let g = ctx.root_mut().group("pre").unwrap();
        ctx.task_mut(g).add_member(a).unwrap();
        let after = ctx.root_mut().add_task("after", noop()).unwrap();
        ctx.task_mut(after).depends_on([g, b]);

        let graph = TaskGraph::build(&ctx, &[after]).unwrap();
        assert!(!graph.contains(g));
        let preds = graph.predecessors(after);
        assert!(preds.contains(&(a, true)));
        assert!(preds.contains(&(b, true)));
    }

    #[test]
    fn cycles_are_fatal_and_name_the_participants() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        ctx.task_mut(a).depends_on([b]);
        ctx.task_mut(b).depends_on([a]);

        let err = TaskGraph::build(&ctx, &[a]).unwrap_err();
        match err {
            GraphError::CycleDetected { cycle } => {
                assert!(cycle.contains(&":a".to_string()));
                assert!(cycle.contains(&":b".to_string()));
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn selector_relationships_resolve_against_the_project() {
        let mut ctx = Context::new("build");
        let helper = ctx.root_mut().add_task("helper", noop()).unwrap();
        let main = ctx.root_mut().add_task("main", noop()).unwrap();
        ctx.task_mut(main).add_relationship("helper", true);

        let graph = TaskGraph::build(&ctx, &[main]).unwrap();
        assert_eq!(graph.execution_order(), &[helper, main]);
    }

    #[test]
    fn unresolvable_selector_relationships_fail_at_construction() {
        let mut ctx = Context::new("build");
        let main = ctx.root_mut().add_task("main", noop()).unwrap();
        ctx.task_mut(main).add_relationship("ghost", true);

        let err = TaskGraph::build(&ctx, &[main]).unwrap_err();
        assert!(matches!(err, GraphError::Relationship { .. }));
    }

    #[test]
    fn duplicate_relationships_collapse_to_the_strictest() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        ctx.task_mut(b).add_relationship(a, false);
        ctx.task_mut(b).add_relationship(a, true);

        let graph = TaskGraph::build(&ctx, &[b]).unwrap();
        assert_eq!(graph.predecessors(b), vec![(a, true)]);
    }

    #[test]
    fn explicit_references_win_over_string_references() {
        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", noop()).unwrap();
        let b = ctx.root_mut().add_task("b", noop()).unwrap();
        ctx.task_mut(b).add_relationship(a, false);
        ctx.task_mut(b).add_relationship("a", true);

        // Both tasks are selected so the non-strict edge survives the trim.
        let graph = TaskGraph::build(&ctx, &[a, b]).unwrap();
        assert_eq!(graph.predecessors(b), vec![(a, false)]);
    }

    #[test]
    fn derived_properties_imply_strict_edges() {
        use crate::task::{Action, Schema};
        use crate::value::TypeDescriptor;

        struct Produce;
        impl Action for Produce {
            fn schema(&self) -> Schema {
                Schema::new().output("path", TypeDescriptor::Path)
            }
            fn execute(&self, task: TaskRef<'_>) -> anyhow::Result<TaskStatus> {
                task.output("path")?.set("out.txt")?;
                Ok(TaskStatus::Succeeded)
            }
        }

        struct Consume;
        impl Action for Consume {
            fn schema(&self) -> Schema {
                Schema::new().input("path", TypeDescriptor::Path)
            }
            fn execute(&self, task: TaskRef<'_>) -> anyhow::Result<TaskStatus> {
                task.input("path")?.get()?;
                Ok(TaskStatus::Succeeded)
            }
        }

        let mut ctx = Context::new("build");
        let a = ctx.root_mut().add_task("a", Produce).unwrap();
        let output = ctx.task(a).output("path").unwrap();
        let b = ctx
            .root_mut()
            .do_task("b", Consume, [("path", output.into())])
            .unwrap();

        let graph = TaskGraph::build(&ctx, &[b]).unwrap();
        assert_eq!(graph.execution_order(), &[a, b]);
        assert_eq!(graph.predecessors(b), vec![(a, true)]);
    }
}
