//! Blocker graph diagnostics.
//!
//! Claiming only ever looks one level deep (are this task's blockers
//! completed?). A cycle or a blocker id that names no task makes a task
//! permanently ineligible without any error being raised, so monitors use
//! this analysis to surface them.

use std::collections::HashMap;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::task::{compare_task_ids, TaskFile};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockerReport {
    /// Each cycle's task ids, sorted. Self-blocking tasks form a cycle of one.
    pub cycles: Vec<Vec<String>>,
    /// `(task, blocker)` pairs where the blocker does not exist.
    pub dangling: Vec<(String, String)>,
}

impl BlockerReport {
    pub fn is_clean(&self) -> bool {
        self.cycles.is_empty() && self.dangling.is_empty()
    }

    /// Ids of every task that can never become eligible.
    pub fn stuck_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .cycles
            .iter()
            .flatten()
            .cloned()
            .chain(self.dangling.iter().map(|(task, _)| task.clone()))
            .collect();
        ids.sort_by(|a, b| compare_task_ids(a, b));
        ids.dedup();
        ids
    }
}

/// Build the blocker graph (edge: blocker -> blocked) and report cycles and
/// dangling references.
pub fn analyze_blockers(tasks: &[TaskFile]) -> BlockerReport {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = tasks
        .iter()
        .map(|t| (t.id.as_str(), graph.add_node(t.id.as_str())))
        .collect();

    let mut report = BlockerReport::default();
    for task in tasks {
        let to = index[task.id.as_str()];
        for blocker in &task.blocked_by {
            match index.get(blocker.as_str()) {
                Some(&from) => {
                    graph.update_edge(from, to, ());
                }
                None => report.dangling.push((task.id.clone(), blocker.clone())),
            }
        }
    }

    for component in tarjan_scc(&graph) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| graph.contains_edge(n, n));
        if is_cycle {
            let mut ids: Vec<String> = component.iter().map(|&n| graph[n].to_string()).collect();
            ids.sort_by(|a, b| compare_task_ids(a, b));
            report.cycles.push(ids);
        }
    }
    report.cycles.sort_by(|a, b| compare_task_ids(&a[0], &b[0]));
    report
}
