//! Dependency graph over the phases of a deployment plan.
//!
//! Constraints: validation is pure; the topological order is stable (ties broken by
//! declaration order); a cycle error names every phase that sits on some cycle.

use std::collections::{BTreeSet, HashMap};

use crate::kernel::identity::PhaseName;
use crate::kernel::plan::DeploymentPlan;

/// Plan validation failure. Fatal for the run; nothing is scheduled.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle among phases: {}", members.join(", "))]
    Cycle { members: Vec<PhaseName> },
    #[error("phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency {
        phase: PhaseName,
        dependency: PhaseName,
    },
    #[error("duplicate phase name: {0}")]
    DuplicatePhase(PhaseName),
    #[error("phase {phase} has invalid concurrency limit {limit}")]
    InvalidConcurrency { phase: PhaseName, limit: usize },
    #[error("failure threshold {threshold} for {scope} is outside [0, 1]")]
    InvalidThreshold { scope: String, threshold: f64 },
    #[error("deployment plan id is empty")]
    EmptyPlanId,
    #[error("phase name is empty")]
    EmptyPhaseName,
}

fn check_threshold(scope: impl Into<String>, threshold: f64) -> Result<(), PlanError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(PlanError::InvalidThreshold {
            scope: scope.into(),
            threshold,
        })
    }
}

/// Validated phase graph with edges dependency -> dependent.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    names: Vec<PhaseName>,
    index: HashMap<PhaseName, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    pub fn build(plan: &DeploymentPlan) -> Result<Self, PlanError> {
        if plan.id.trim().is_empty() {
            return Err(PlanError::EmptyPlanId);
        }
        check_threshold("plan", plan.failure_threshold)?;

        let mut names = Vec::with_capacity(plan.phases.len());
        let mut index = HashMap::with_capacity(plan.phases.len());
        for phase in &plan.phases {
            if phase.name.trim().is_empty() {
                return Err(PlanError::EmptyPhaseName);
            }
            if index.insert(phase.name.clone(), names.len()).is_some() {
                return Err(PlanError::DuplicatePhase(phase.name.clone()));
            }
            if phase.concurrency == 0 {
                return Err(PlanError::InvalidConcurrency {
                    phase: phase.name.clone(),
                    limit: phase.concurrency,
                });
            }
            if let Some(threshold) = phase.failure_threshold {
                check_threshold(format!("phase {}", phase.name), threshold)?;
            }
            names.push(phase.name.clone());
        }

        let n = names.len();
        let mut dependencies = vec![BTreeSet::new(); n];
        let mut dependents = vec![BTreeSet::new(); n];
        for (i, phase) in plan.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let j = *index
                    .get(dep)
                    .ok_or_else(|| PlanError::UnknownDependency {
                        phase: phase.name.clone(),
                        dependency: dep.clone(),
                    })?;
                dependencies[i].insert(j);
                dependents[j].insert(i);
            }
        }

        let mut graph = Self {
            names,
            index,
            dependencies,
            dependents,
            order: Vec::with_capacity(n),
        };
        graph.order = graph.topological_order()?;
        Ok(graph)
    }

    /// Kahn's algorithm; the ready set is ordered by declaration index.
    fn topological_order(&self) -> Result<Vec<usize>, PlanError> {
        let n = self.names.len();
        let mut indegree: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &d in &self.dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() == n {
            return Ok(order);
        }
        let placed: BTreeSet<usize> = order.into_iter().collect();
        let leftover: Vec<usize> = (0..n).filter(|i| !placed.contains(i)).collect();
        let mut on_cycle = self.cycle_members(&leftover);
        if on_cycle.is_empty() {
            on_cycle = leftover;
        }
        on_cycle.sort_unstable();
        Err(PlanError::Cycle {
            members: on_cycle.into_iter().map(|i| self.names[i].clone()).collect(),
        })
    }

    /// Tarjan SCC restricted to `candidates`: every node in a non-trivial component,
    /// plus nodes that depend on themselves.
    fn cycle_members(&self, candidates: &[usize]) -> Vec<usize> {
        struct Tarjan<'a> {
            graph: &'a DependencyGraph,
            allowed: BTreeSet<usize>,
            next_index: usize,
            index: HashMap<usize, usize>,
            lowlink: HashMap<usize, usize>,
            stack: Vec<usize>,
            on_stack: BTreeSet<usize>,
            members: Vec<usize>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index.insert(v, self.next_index);
                self.lowlink.insert(v, self.next_index);
                self.next_index += 1;
                self.stack.push(v);
                self.on_stack.insert(v);

                let successors: Vec<usize> = self.graph.dependents[v]
                    .iter()
                    .copied()
                    .filter(|w| self.allowed.contains(w))
                    .collect();
                for w in successors {
                    if !self.index.contains_key(&w) {
                        self.visit(w);
                        let low = self.lowlink[&v].min(self.lowlink[&w]);
                        self.lowlink.insert(v, low);
                    } else if self.on_stack.contains(&w) {
                        let low = self.lowlink[&v].min(self.index[&w]);
                        self.lowlink.insert(v, low);
                    }
                }

                if self.lowlink[&v] == self.index[&v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack.remove(&w);
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    let self_loop = self.graph.dependencies[v].contains(&v);
                    if component.len() > 1 || self_loop {
                        self.members.extend(component);
                    }
                }
            }
        }

        let mut tarjan = Tarjan {
            graph: self,
            allowed: candidates.iter().copied().collect(),
            next_index: 0,
            index: HashMap::new(),
            lowlink: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            members: Vec::new(),
        };
        for &v in candidates {
            if !tarjan.index.contains_key(&v) {
                tarjan.visit(v);
            }
        }
        tarjan.members
    }

    /// Phase names in execution order.
    pub fn order(&self) -> Vec<PhaseName> {
        self.order.iter().map(|&i| self.names[i].clone()).collect()
    }

    pub fn contains(&self, phase: &str) -> bool {
        self.index.contains_key(phase)
    }

    /// Direct dependencies of `phase`, in declaration order.
    pub fn dependencies(&self, phase: &str) -> Vec<PhaseName> {
        self.index
            .get(phase)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&j| self.names[j].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every phase that directly or indirectly depends on `phase`, in execution order.
    pub fn transitive_dependents(&self, phase: &str) -> Vec<PhaseName> {
        let Some(&start) = self.index.get(phase) else {
            return Vec::new();
        };
        let mut reached = BTreeSet::new();
        let mut frontier = vec![start];
        while let Some(i) = frontier.pop() {
            for &d in &self.dependents[i] {
                if reached.insert(d) {
                    frontier.push(d);
                }
            }
        }
        self.order
            .iter()
            .filter(|i| reached.contains(i))
            .map(|&i| self.names[i].clone())
            .collect()
    }
}

/// Validates `plan` and returns its phases in execution order.
pub fn validate(plan: &DeploymentPlan) -> Result<Vec<PhaseName>, PlanError> {
    DependencyGraph::build(plan).map(|g| g.order())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::plan::PhaseSpec;

    fn phase(name: &str, deps: &[&str]) -> PhaseSpec {
        deps.iter()
            .fold(PhaseSpec::with_nodes(name, [format!("{name}-1")]), |p, d| {
                p.depends_on(*d)
            })
    }

    fn plan(phases: Vec<PhaseSpec>) -> DeploymentPlan {
        phases
            .into_iter()
            .fold(DeploymentPlan::new("deploy-1", 0.1), |p, ph| p.with_phase(ph))
    }

    #[test]
    fn linear_chain_orders_dependencies_first() {
        let p = plan(vec![
            phase("web", &["app"]),
            phase("app", &["db"]),
            phase("db", &[]),
        ]);
        assert_eq!(validate(&p).unwrap(), vec!["db", "app", "web"]);
    }

    #[test]
    fn ties_follow_declaration_order() {
        let p = plan(vec![
            phase("cache", &[]),
            phase("db", &[]),
            phase("app", &["db", "cache"]),
            phase("metrics", &[]),
        ]);
        assert_eq!(validate(&p).unwrap(), vec!["cache", "db", "app", "metrics"]);
    }

    #[test]
    fn cycle_names_all_members_but_not_downstream_phases() {
        let p = plan(vec![
            phase("a", &["c"]),
            phase("b", &["a"]),
            phase("c", &["b"]),
            phase("d", &["c"]),
            phase("e", &[]),
        ]);
        assert_eq!(
            validate(&p).unwrap_err(),
            PlanError::Cycle {
                members: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn disjoint_cycles_are_all_reported() {
        let p = plan(vec![
            phase("a", &["b"]),
            phase("b", &["a"]),
            phase("x", &["y"]),
            phase("y", &["x"]),
        ]);
        let PlanError::Cycle { members } = validate(&p).unwrap_err() else {
            panic!("expected cycle");
        };
        assert_eq!(members, vec!["a", "b", "x", "y"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let p = plan(vec![phase("db", &[]), phase("app", &["app", "db"])]);
        assert_eq!(
            validate(&p).unwrap_err(),
            PlanError::Cycle {
                members: vec!["app".into()]
            }
        );
    }

    #[test]
    fn structural_errors_are_rejected() {
        let unknown = plan(vec![phase("app", &["db"])]);
        assert!(matches!(
            validate(&unknown),
            Err(PlanError::UnknownDependency { ref dependency, .. }) if dependency == "db"
        ));

        let dup = plan(vec![phase("db", &[]), phase("db", &[])]);
        assert_eq!(validate(&dup), Err(PlanError::DuplicatePhase("db".into())));

        let zero = plan(vec![phase("db", &[]).concurrency(0)]);
        assert!(matches!(
            validate(&zero),
            Err(PlanError::InvalidConcurrency { limit: 0, .. })
        ));

        let bad_threshold = plan(vec![phase("db", &[]).failure_threshold(1.5)]);
        assert!(matches!(
            validate(&bad_threshold),
            Err(PlanError::InvalidThreshold { .. })
        ));

        let mut no_id = plan(vec![phase("db", &[])]);
        no_id.id = " ".into();
        assert_eq!(validate(&no_id), Err(PlanError::EmptyPlanId));

        let unnamed = plan(vec![phase("", &[])]);
        assert_eq!(validate(&unnamed), Err(PlanError::EmptyPhaseName));
    }

    #[test]
    fn transitive_dependents_in_execution_order() {
        let p = plan(vec![
            phase("db", &[]),
            phase("app", &["db"]),
            phase("web", &["app"]),
            phase("cdn", &["web"]),
            phase("batch", &["db"]),
            phase("docs", &[]),
        ]);
        let g = DependencyGraph::build(&p).unwrap();
        assert_eq!(g.transitive_dependents("app"), vec!["web", "cdn"]);
        assert_eq!(
            g.transitive_dependents("db"),
            vec!["app", "web", "cdn", "batch"]
        );
        assert!(g.transitive_dependents("docs").is_empty());
        assert_eq!(g.dependencies("app"), vec!["db"]);
    }
}
