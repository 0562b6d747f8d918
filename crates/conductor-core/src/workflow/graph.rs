//! Task graph and wave planner.
//!
//! An edge `A → B` means "B depends on A". Planning is Kahn-style
//! layering: each wave is the set of stages whose dependencies have all
//! been placed in earlier waves, stable-sorted by priority and then by
//! declaration order.
//!
//! ```text
//!   extract ──► parse ──┬──► skills ──┐
//!                       │             ├──► report
//!                       └──► summary ─┘
//!
//!   waves: [extract] [parse] [skills, summary] [report]
//! ```
//!
//! A failed dependency still unblocks its dependents (they are skipped at
//! run time), so the layering never depends on run outcomes and is
//! computed once, up front.
//!
//! When layering stalls, the remaining stages contain at least one cycle.
//! The most urgent stage lying on a cycle (ties broken by declaration
//! order) has all of its unmet dependency edges dropped, one
//! [`BrokenEdge`] per edge, and layering resumes. This is a best-effort
//! heuristic, not a minimal feedback-edge set.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::workflow::schema::{Priority, WorkflowTemplate};

/// A dependency edge dropped to break a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenEdge {
    /// The stage whose dependency was dropped.
    pub stage: String,
    /// The dependency that was dropped.
    pub dependency: String,
}

impl std::fmt::Display for BrokenEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} → {}", self.dependency, self.stage)
    }
}

/// Result of planning a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub broken_edges: Vec<BrokenEdge>,
    /// Dependencies each stage actually waits on, after cycle breaking.
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl ExecutionPlan {
    pub fn wave_of(&self, stage: &str) -> Option<usize> {
        self.waves.iter().position(|w| w.iter().any(|s| s == stage))
    }

    pub fn effective_dependencies(&self, stage: &str) -> &[String] {
        self.dependencies.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn stage_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Directed dependency graph over a template's stages, indexed by
/// declaration order.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    names: Vec<String>,
    priorities: Vec<Priority>,
    /// Forward edges: stage → stages it depends on.
    dependencies: Vec<Vec<usize>>,
    /// Reverse edges: stage → stages that depend on it.
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Build the graph. Dependencies naming unknown stages are ignored here;
    /// [`WorkflowTemplate::validate`] reports them.
    pub fn new(template: &WorkflowTemplate) -> Self {
        let index: HashMap<&str, usize> = template
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let n = template.stages.len();
        let mut dependencies = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];

        for (i, stage) in template.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let Some(&j) = index.get(dep.as_str()) else {
                    continue;
                };
                if !dependencies[i].contains(&j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        Self {
            names: template.stages.iter().map(|s| s.name.clone()).collect(),
            priorities: template.stages.iter().map(|s| s.priority).collect(),
            dependencies,
            dependents,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn dependents(&self, stage: &str) -> Vec<&str> {
        self.position(stage)
            .map(|i| self.dependents[i].iter().map(|&j| self.names[j].as_str()).collect())
            .unwrap_or_default()
    }

    fn position(&self, stage: &str) -> Option<usize> {
        self.names.iter().position(|n| n == stage)
    }

    /// First cycle found by a mark-and-visit traversal, as a path of stage
    /// names that starts and ends with the same stage.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut path = Vec::new();
        for start in 0..self.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                    return Some(cycle.into_iter().map(|i| self.names[i].clone()).collect());
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        path.push(node);
        for &dep in &self.dependencies[node] {
            match marks[dep] {
                Mark::InProgress => {
                    let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Compute the wave plan, breaking cycles as needed.
    pub fn plan(&self) -> ExecutionPlan {
        let n = self.len();
        let mut effective: Vec<Vec<usize>> = self.dependencies.clone();
        let mut placed = vec![false; n];
        let mut remaining: Vec<usize> = (0..n).collect();
        let mut waves = Vec::new();
        let mut broken_edges = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| effective[i].iter().all(|&d| placed[d]))
                .collect();

            if ready.is_empty() {
                let Some(victim) = self.cycle_break_candidate(&remaining, &placed) else {
                    // Unreachable for a stalled graph, but never loop forever.
                    break;
                };
                let dropped: Vec<usize> = effective[victim]
                    .iter()
                    .copied()
                    .filter(|&d| !placed[d])
                    .collect();
                for d in &dropped {
                    tracing::warn!(
                        "[Planner] Breaking cycle: '{}' no longer waits on '{}'",
                        self.names[victim],
                        self.names[*d]
                    );
                    broken_edges.push(BrokenEdge {
                        stage: self.names[victim].clone(),
                        dependency: self.names[*d].clone(),
                    });
                }
                effective[victim].retain(|d| placed[*d]);
                continue;
            }

            ready.sort_by_key(|&i| (self.priorities[i], i));
            for &i in &ready {
                placed[i] = true;
            }
            remaining.retain(|i| !placed[*i]);
            waves.push(ready.iter().map(|&i| self.names[i].clone()).collect::<Vec<_>>());
        }

        let dependencies = (0..n)
            .map(|i| {
                (
                    self.names[i].clone(),
                    effective[i].iter().map(|&d| self.names[d].clone()).collect(),
                )
            })
            .collect();

        tracing::debug!(
            "[Planner] {} stage(s) in {} wave(s), {} broken edge(s)",
            n,
            waves.len(),
            broken_edges.len()
        );

        ExecutionPlan {
            waves,
            broken_edges,
            dependencies,
        }
    }

    /// Most urgent unplaced stage that lies on a cycle among unplaced stages.
    fn cycle_break_candidate(&self, remaining: &[usize], placed: &[bool]) -> Option<usize> {
        remaining
            .iter()
            .copied()
            .filter(|&i| self.reaches_itself(i, placed))
            .min_by_key(|&i| (self.priorities[i], i))
    }

    fn reaches_itself(&self, start: usize, placed: &[bool]) -> bool {
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.dependencies[start]
            .iter()
            .copied()
            .filter(|&d| !placed[d])
            .collect();
        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if seen.insert(node) {
                stack.extend(self.dependencies[node].iter().copied().filter(|&d| !placed[d]));
            }
        }
        false
    }
}
