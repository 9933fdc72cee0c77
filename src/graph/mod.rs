//! The dependency graph: topology, parent/completion bookkeeping, and
//! barrier-readiness signalling.
//!
//! `DependencyGraph` is built once at registration time from the declared
//! [`crate::step::StepConfig`]s and never mutated structurally afterwards;
//! only the per-run `CompletedParents` bookkeeping changes as a run
//! progresses, and that is reset per run by constructing a fresh
//! [`RunProgress`].

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::step::StepConfig;

/// Errors raised by [`DependencyGraph::validate`]. All of these are
/// registration-time (`VALIDATION`) failures — they are never produced
/// during a run, matching §7's propagation rules.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("step '{from}' routes to unknown step '{target}'")]
    #[diagnostic(
        code(workweave::graph::unknown_target),
        help("Register a step named '{target}', or remove it from '{from}'s routing fields.")
    )]
    UnknownTarget { from: String, target: String },
    #[error("step '{step}' cannot route to itself in static topology")]
    #[diagnostic(code(workweave::graph::self_routing))]
    SelfRouting { step: String },
    #[error("cycle detected in static topology: {}", path.join(" -> "))]
    #[diagnostic(
        code(workweave::graph::cycle),
        help("Static routing must form a DAG; break the cycle shown in the path.")
    )]
    Cycle { path: Vec<String> },
    #[error("no steps registered")]
    #[diagnostic(code(workweave::graph::empty))]
    Empty,
    #[error("step(s) unreachable from any root: {}", steps.join(", "))]
    #[diagnostic(
        code(workweave::graph::unreachable),
        help("Route to these steps from a root, or remove them from registration.")
    )]
    Unreachable { steps: Vec<String> },
}

/// Ordered adjacency: step name -> ordered successor step names, derived
/// from `to`, `map_target`, and `switch_routes`/`switch_default` as
/// appropriate to each step's [`StepKind`]. Sub-pipeline edges are resolved
/// at runtime against the separate `sub_pipelines` namespace and never
/// appear here.
#[derive(Debug, Default, Clone)]
pub struct Topology {
    adjacency: FxHashMap<String, Vec<String>>,
}

impl Topology {
    pub fn successors(&self, step: &str) -> &[String] {
        self.adjacency.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert(&mut self, from: &str, to: &str) {
        let entry = self.adjacency.entry(from.to_string()).or_default();
        if !entry.iter().any(|t| t == to) {
            entry.push(to.to_string());
        }
    }
}

/// Reverse index (`Parents map`) plus the per-run `CompletedParents` state
/// and barrier-readiness logic described in §4.1.
#[derive(Debug)]
pub struct DependencyGraph {
    steps: Vec<String>,
    topology: Topology,
    parents: FxHashMap<String, FxHashSet<String>>,
}

impl DependencyGraph {
    /// Build the graph from the registered step configs. `configs` must be
    /// in registration order; root detection and the deterministic
    /// single-root fallback both depend on that order being preserved.
    pub fn build(configs: &[StepConfig]) -> Self {
        let steps: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        let mut topology = Topology::default();
        for config in configs {
            for target in config.all_targets() {
                topology.insert(&config.name, &target);
            }
        }
        let mut parents: FxHashMap<String, FxHashSet<String>> = FxHashMap::default();
        for name in &steps {
            parents.entry(name.clone()).or_default();
        }
        for config in configs {
            for target in config.all_targets() {
                parents.entry(target).or_default().insert(config.name.clone());
            }
        }
        Self { steps, topology, parents }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn parents_of(&self, step: &str) -> &FxHashSet<String> {
        static EMPTY: once_cell_empty::Lazy = once_cell_empty::Lazy;
        self.parents.get(step).unwrap_or_else(|| EMPTY.get())
    }

    /// All targets reachable from any step's routing configuration, used to
    /// compute roots as `steps \ all_targets`.
    fn all_targets(&self) -> FxHashSet<&str> {
        self.parents
            .iter()
            .filter(|(_, parents)| !parents.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// `steps \ all_targets`, else (if that is empty but steps exist) a
    /// deterministic singleton of the first-registered step. Shared by
    /// [`Self::get_roots`] and the reachability pass in [`Self::validate`].
    fn root_candidates(&self) -> Vec<&str> {
        let all_targets = self.all_targets();
        let candidates: Vec<&str> =
            self.steps.iter().map(String::as_str).filter(|name| !all_targets.contains(name)).collect();
        if candidates.is_empty() {
            vec![self.steps[0].as_str()]
        } else {
            candidates
        }
    }

    /// Roots per §4.1: the explicit `start` step if given, else
    /// [`Self::root_candidates`].
    pub fn get_roots(&self, start: Option<&str>) -> Result<Vec<String>, GraphError> {
        if let Some(start) = start {
            return Ok(vec![start.to_string()]);
        }
        if self.steps.is_empty() {
            return Err(GraphError::Empty);
        }
        Ok(self.root_candidates().into_iter().map(str::to_string).collect())
    }

    /// Validate the static topology: every routing target exists, no step
    /// routes to itself, the graph (topology + map/switch edges, excluding
    /// the `Stop` sentinel) is acyclic, and every step is reachable from a
    /// root.
    pub fn validate(&self, configs: &[StepConfig]) -> Result<(), GraphError> {
        let known: FxHashSet<&str> = self.steps.iter().map(String::as_str).collect();
        for config in configs {
            for target in config.all_targets() {
                if !known.contains(target.as_str()) {
                    return Err(GraphError::UnknownTarget {
                        from: config.name.clone(),
                        target,
                    });
                }
                if target == config.name {
                    // Runtime redirection (a step dynamically returning its
                    // own name) is a different code path and is permitted;
                    // only a *static* self-target is rejected (invariant 7).
                    return Err(GraphError::SelfRouting { step: config.name.clone() });
                }
            }
        }
        self.detect_cycle_and_unreachable()
    }

    /// DFS from the roots only: a back-edge to a `Visiting` node is a cycle
    /// (§4.1's cycle check), and any step never marked `Done` once the DFS
    /// is exhausted is unreachable from every root (§4.1's "no unreachable
    /// steps" check).
    fn detect_cycle_and_unreachable(&self) -> Result<(), GraphError> {
        if self.steps.is_empty() {
            return Ok(());
        }

        #[derive(PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: FxHashMap<&str, Mark> = FxHashMap::default();
        let mut path: Vec<String> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            topology: &'a Topology,
            marks: &mut FxHashMap<&'a str, Mark>,
            path: &mut Vec<String>,
        ) -> Result<(), GraphError> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    path.push(node.to_string());
                    return Err(GraphError::Cycle { path: path.clone() });
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            path.push(node.to_string());
            for succ in topology.successors(node) {
                visit(succ, topology, marks, path)?;
            }
            path.pop();
            marks.insert(node, Mark::Done);
            Ok(())
        }

        for root in self.root_candidates() {
            if !matches!(marks.get(root), Some(Mark::Done)) {
                visit(root, &self.topology, &mut marks, &mut path)?;
            }
        }

        let unreachable: Vec<String> = self
            .steps
            .iter()
            .filter(|name| !matches!(marks.get(name.as_str()), Some(Mark::Done)))
            .cloned()
            .collect();
        if !unreachable.is_empty() {
            return Err(GraphError::Unreachable { steps: unreachable });
        }
        Ok(())
    }
}

/// Per-run mutable barrier-tracking state: which parents of each step have
/// completed so far. Reset fresh for every run by the scheduler.
#[derive(Debug, Default)]
pub struct RunProgress {
    completed_parents: FxHashMap<String, FxHashSet<String>>,
}

/// Outcome of [`RunProgress::mark_completed`], exactly mirroring the
/// `(is_ready, cancel_timeout, schedule_timeout)` tuple of §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionSignal {
    pub is_ready: bool,
    pub cancel_timeout: bool,
    pub schedule_timeout: bool,
}

impl RunProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `owner` completed and is a parent of `succ`. Returns the
    /// barrier signal the scheduler uses to decide whether to schedule
    /// `succ`, cancel a pending timeout watcher, or arm one.
    pub fn mark_completed(
        &mut self,
        graph: &DependencyGraph,
        owner: &str,
        succ: &str,
    ) -> CompletionSignal {
        let parents_needed = graph.parents_of(succ);
        let entry = self.completed_parents.entry(succ.to_string()).or_default();
        let is_first = entry.is_empty();
        entry.insert(owner.to_string());
        let is_ready = parents_needed.iter().all(|p| entry.contains(p));
        let schedule_timeout = !is_ready && is_first && parents_needed.len() > 1;
        CompletionSignal {
            is_ready,
            cancel_timeout: is_ready,
            schedule_timeout,
        }
    }

    pub fn is_barrier_satisfied(&self, graph: &DependencyGraph, step: &str) -> bool {
        let parents_needed = graph.parents_of(step);
        match self.completed_parents.get(step) {
            Some(completed) => parents_needed.iter().all(|p| completed.contains(p)),
            None => parents_needed.is_empty(),
        }
    }
}

/// Tiny helper giving `parents_of` a stable empty set to hand back for
/// steps with no parents, without allocating on every lookup.
mod once_cell_empty {
    use rustc_hash::FxHashSet;
    use std::sync::OnceLock;

    pub struct Lazy;

    impl Lazy {
        pub fn get(&self) -> &'static FxHashSet<String> {
            static CELL: OnceLock<FxHashSet<String>> = OnceLock::new();
            CELL.get_or_init(FxHashSet::default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepConfig, StepKind};

    fn cfg(name: &str, kind: StepKind, to: &[&str]) -> StepConfig {
        let mut c = StepConfig::new(name, kind);
        c.to = to.iter().map(|s| s.to_string()).collect();
        c
    }

    #[test]
    fn roots_are_steps_minus_all_targets() {
        let configs = vec![
            cfg("a", StepKind::Step, &["b"]),
            cfg("b", StepKind::Step, &[]),
        ];
        let graph = DependencyGraph::build(&configs);
        assert_eq!(graph.get_roots(None).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn empty_root_set_falls_back_to_first_step() {
        // a -> b -> a forms a cycle with no step outside all_targets;
        // get_roots must still produce a deterministic singleton.
        let configs = vec![
            cfg("a", StepKind::Step, &["b"]),
            cfg("b", StepKind::Step, &["a"]),
        ];
        let graph = DependencyGraph::build(&configs);
        assert_eq!(graph.get_roots(None).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn barrier_ready_iff_completed_parents_superset() {
        let configs = vec![
            cfg("a", StepKind::Step, &["c"]),
            cfg("b", StepKind::Step, &["c"]),
            cfg("c", StepKind::Step, &[]),
        ];
        let graph = DependencyGraph::build(&configs);
        let mut progress = RunProgress::new();
        let first = progress.mark_completed(&graph, "a", "c");
        assert!(!first.is_ready);
        assert!(first.schedule_timeout);
        let second = progress.mark_completed(&graph, "b", "c");
        assert!(second.is_ready);
        assert!(second.cancel_timeout);
        assert!(!second.schedule_timeout);
    }

    #[test]
    fn validate_rejects_self_routing() {
        let configs = vec![cfg("a", StepKind::Step, &["a"])];
        let graph = DependencyGraph::build(&configs);
        assert_eq!(
            graph.validate(&configs).unwrap_err(),
            GraphError::SelfRouting { step: "a".to_string() }
        );
    }

    #[test]
    fn validate_detects_cycles() {
        let configs = vec![
            cfg("a", StepKind::Step, &["b"]),
            cfg("b", StepKind::Step, &["a"]),
        ];
        let graph = DependencyGraph::build(&configs);
        assert!(matches!(graph.validate(&configs), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn validate_rejects_unknown_targets() {
        let configs = vec![cfg("a", StepKind::Step, &["ghost"])];
        let graph = DependencyGraph::build(&configs);
        assert!(matches!(
            graph.validate(&configs),
            Err(GraphError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn validate_rejects_unreachable_steps() {
        // "b" is never targeted by "a" and targets nothing itself, so it
        // sits outside the graph reachable from the only root ("a").
        let configs = vec![cfg("a", StepKind::Step, &[]), cfg("b", StepKind::Step, &[])];
        let graph = DependencyGraph::build(&configs);
        assert_eq!(
            graph.validate(&configs).unwrap_err(),
            GraphError::Unreachable { steps: vec!["b".to_string()] }
        );
    }

    #[test]
    fn validate_allows_sub_pipeline_targets_outside_step_names() {
        // A `sub_pipeline_ref` names an entry in the separate
        // `sub_pipelines` namespace, not a step, so it must not be treated
        // as a routing target for existence/reachability/cycle purposes.
        let configs = vec![StepConfig::new("delegate", StepKind::Sub).with_sub_pipeline("child")];
        let graph = DependencyGraph::build(&configs);
        assert!(graph.validate(&configs).is_ok());
    }
}
