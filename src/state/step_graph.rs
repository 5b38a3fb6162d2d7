//! Reload dependency graph.
//!
//! Each reloadable item (accounts, quests, item tables, config) is a named
//! step; edges encode "X must rerun when Y does". Running a set of start
//! steps collects either their downstream closure (fresh data invalidates
//! consumers) or their upstream closure (ensure prerequisites), topologically
//! orders the set, and executes each step at most once per trigger.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StepGraphError {
    #[error("unknown step {0:?}")]
    UnknownStep(String),
    #[error("dependency graph contains a cycle")]
    Cycle,
}

type StepFn = Box<dyn FnMut() + Send>;

struct Step {
    execute: StepFn,
    upstream: Vec<usize>,
    downstream: Vec<usize>,
    last_run_id: u64,
}

/// Which closure of the start set to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDirection {
    /// Start steps plus everything that depends on them.
    Downstream,
    /// Start steps plus everything they depend on.
    Upstream,
}

#[derive(Default)]
pub struct StepGraph {
    steps: Vec<Step>,
    by_name: HashMap<String, usize>,
    last_run_id: u64,
}

impl StepGraph {
    pub fn new() -> Self {
        StepGraph::default()
    }

    /// Register a step. Dependencies must already be registered.
    pub fn add_step(
        &mut self,
        name: &str,
        depends_on: &[&str],
        execute: impl FnMut() + Send + 'static,
    ) -> Result<(), StepGraphError> {
        let mut upstream = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            let idx = *self
                .by_name
                .get(*dep)
                .ok_or_else(|| StepGraphError::UnknownStep((*dep).to_string()))?;
            upstream.push(idx);
        }
        let index = self.steps.len();
        for &up in &upstream {
            self.steps[up].downstream.push(index);
        }
        self.steps.push(Step {
            execute: Box::new(execute),
            upstream,
            downstream: Vec::new(),
            last_run_id: 0,
        });
        self.by_name.insert(name.to_string(), index);
        Ok(())
    }

    pub fn run_one(&mut self, start: &str, direction: RunDirection) -> Result<(), StepGraphError> {
        self.run(&[start], direction)
    }

    /// Collect the closure of `starts`, topologically order it, and run each
    /// member once.
    pub fn run(&mut self, starts: &[&str], direction: RunDirection) -> Result<(), StepGraphError> {
        let mut to_visit: VecDeque<usize> = VecDeque::new();
        for name in starts {
            let idx = *self
                .by_name
                .get(*name)
                .ok_or_else(|| StepGraphError::UnknownStep((*name).to_string()))?;
            to_visit.push_back(idx);
        }

        let mut selected: HashSet<usize> = HashSet::new();
        while let Some(idx) = to_visit.pop_front() {
            if selected.insert(idx) {
                let neighbors = match direction {
                    RunDirection::Downstream => &self.steps[idx].downstream,
                    RunDirection::Upstream => &self.steps[idx].upstream,
                };
                for &n in neighbors {
                    to_visit.push_back(n);
                }
            }
        }

        // Peel off steps with no un-run upstream inside the selected set.
        let mut order: Vec<usize> = Vec::with_capacity(selected.len());
        let mut remaining = selected.clone();
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&idx| {
                    self.steps[idx]
                        .upstream
                        .iter()
                        .all(|up| !remaining.contains(up))
                })
                .collect();
            if ready.is_empty() {
                return Err(StepGraphError::Cycle);
            }
            for idx in ready {
                remaining.remove(&idx);
                order.push(idx);
            }
        }

        self.last_run_id += 1;
        let run_id = self.last_run_id;
        for idx in order {
            let step = &mut self.steps[idx];
            if step.last_run_id < run_id {
                step.last_run_id = run_id;
                (step.execute)();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> StepFn) {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &'static str| -> StepFn {
            let log = log2.clone();
            Box::new(move || log.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[test]
    fn downstream_run_respects_order() {
        let (log, make) = recorder();
        let mut graph = StepGraph::new();
        graph.add_step("config", &[], make("config")).unwrap();
        graph.add_step("accounts", &["config"], make("accounts")).unwrap();
        graph.add_step("quests", &["config"], make("quests")).unwrap();

        graph.run_one("config", RunDirection::Downstream).unwrap();
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran[0], "config");
        assert_eq!(ran.len(), 3);
        assert!(ran.contains(&"accounts") && ran.contains(&"quests"));
    }

    #[test]
    fn upstream_run_pulls_prerequisites() {
        let (log, make) = recorder();
        let mut graph = StepGraph::new();
        graph.add_step("config", &[], make("config")).unwrap();
        graph.add_step("item-tables", &["config"], make("item-tables")).unwrap();
        graph
            .add_step("quests", &["item-tables"], make("quests"))
            .unwrap();

        graph.run_one("quests", RunDirection::Upstream).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["config", "item-tables", "quests"]);
    }

    #[test]
    fn each_step_runs_once_per_trigger() {
        let (log, make) = recorder();
        let mut graph = StepGraph::new();
        graph.add_step("a", &[], make("a")).unwrap();
        graph.add_step("b", &["a"], make("b")).unwrap();
        graph.add_step("c", &["a", "b"], make("c")).unwrap();

        // c is reachable from a both directly and through b; it must still
        // run exactly once.
        graph.run(&["a"], RunDirection::Downstream).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_step_rejected() {
        let mut graph = StepGraph::new();
        assert_eq!(
            graph.run_one("nope", RunDirection::Downstream),
            Err(StepGraphError::UnknownStep("nope".into()))
        );
        assert_eq!(
            graph.add_step("x", &["missing"], || {}),
            Err(StepGraphError::UnknownStep("missing".into()))
        );
    }
}
