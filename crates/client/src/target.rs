//! Execution target resolution.
//!
//! A session always binds to exactly one allocation of a task. When several
//! allocations run the task and none was pinned, an [`AllocationPicker`]
//! chooses one, once.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client status of an allocation that can accept exec sessions.
pub const RUNNING: &str = "running";

/// Task state the scheduler reports for a task that has stopped for good.
const DEAD: &str = "dead";

/// Zero timestamp the API uses for "not finished".
const ZERO_TIME_PREFIX: &str = "0001-01-01";

/// Allocation as listed by `GET /v1/job/:job/allocations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,
    pub task_group: String,
    pub client_status: String,
    #[serde(default)]
    pub task_states: Option<BTreeMap<String, TaskState>>,
}

/// State of one task inside an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    pub state: String,
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl TaskState {
    /// Whether the task is still running.
    pub fn is_active(&self) -> bool {
        let finished = self
            .finished_at
            .as_deref()
            .is_some_and(|t| !t.is_empty() && !t.starts_with(ZERO_TIME_PREFIX));
        !finished && self.state != DEAD
    }
}

impl Allocation {
    pub fn is_running(&self) -> bool {
        self.client_status == RUNNING
    }

    /// Names of the tasks that are still running in this allocation.
    pub fn active_tasks(&self) -> impl Iterator<Item = &str> {
        self.task_states
            .iter()
            .flatten()
            .filter(|(_, state)| state.is_active())
            .map(|(name, _)| name.as_str())
    }

    /// Whether `task` can accept an exec session in this allocation.
    pub fn runs_task(&self, task: &str) -> bool {
        self.is_running() && self.active_tasks().any(|name| name == task)
    }
}

/// The task and allocation a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionTarget {
    pub task_group: String,
    pub task: String,
    pub allocation_id: String,
}

impl ExecutionTarget {
    pub fn new(
        task_group: impl Into<String>,
        task: impl Into<String>,
        allocation_id: impl Into<String>,
    ) -> Self {
        Self {
            task_group: task_group.into(),
            task: task.into(),
            allocation_id: allocation_id.into(),
        }
    }

    /// First segment of the allocation UUID, as shown by the CLI.
    pub fn short_allocation_id(&self) -> &str {
        short_id(&self.allocation_id)
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.task_group, self.task, self.short_allocation_id())
    }
}

/// First segment of a UUID-style identifier.
pub fn short_id(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

/// Chooses one allocation among several eligible ones.
pub trait AllocationPicker: Send + Sync {
    /// Returns an index into `candidates`, which is never empty.
    fn pick(&self, candidates: &[&Allocation]) -> usize;
}

/// Uniform random draw.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPicker;

impl AllocationPicker for RandomPicker {
    fn pick(&self, candidates: &[&Allocation]) -> usize {
        rand::thread_rng().gen_range(0..candidates.len())
    }
}

/// Always the first candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstPicker;

impl AllocationPicker for FirstPicker {
    fn pick(&self, _candidates: &[&Allocation]) -> usize {
        0
    }
}

/// Target resolution errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no running instances of task {task}")]
    NoRunningInstances { task: String },

    #[error("no running allocation of task {task} matches {prefix}")]
    AllocationNotFound { task: String, prefix: String },

    #[error("allocation prefix {prefix} matches {matches} allocations")]
    AmbiguousAllocation { prefix: String, matches: usize },
}

/// Outcome of resolving a task to an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub target: ExecutionTarget,
    /// Number of allocations that were eligible.
    pub eligible: usize,
    /// True when the allocation was chosen by the picker among several.
    pub drawn: bool,
}

/// Resolves a task (and optional allocation prefix) to one allocation.
#[derive(Clone)]
pub struct TargetResolver {
    picker: Arc<dyn AllocationPicker>,
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self::new(Arc::new(RandomPicker))
    }
}

impl TargetResolver {
    pub fn new(picker: Arc<dyn AllocationPicker>) -> Self {
        Self { picker }
    }

    /// Resolves `task` among `allocations`.
    ///
    /// `task_group` narrows the search when the same task name exists in
    /// several groups. `pinned` is an allocation id prefix; when present the
    /// picker is not consulted.
    pub fn resolve(
        &self,
        allocations: &[Allocation],
        task_group: Option<&str>,
        task: &str,
        pinned: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        let eligible: Vec<&Allocation> = allocations
            .iter()
            .filter(|alloc| task_group.is_none_or(|group| alloc.task_group == group))
            .filter(|alloc| alloc.runs_task(task))
            .collect();

        if eligible.is_empty() {
            return Err(ResolveError::NoRunningInstances {
                task: task.to_string(),
            });
        }

        let (chosen, drawn) = match pinned {
            Some(prefix) => {
                let matches: Vec<&Allocation> = eligible
                    .iter()
                    .copied()
                    .filter(|alloc| alloc.id.starts_with(prefix))
                    .collect();
                match matches.as_slice() {
                    [] => {
                        return Err(ResolveError::AllocationNotFound {
                            task: task.to_string(),
                            prefix: prefix.to_string(),
                        })
                    }
                    [one] => (*one, false),
                    many => {
                        return Err(ResolveError::AmbiguousAllocation {
                            prefix: prefix.to_string(),
                            matches: many.len(),
                        })
                    }
                }
            }
            None if eligible.len() == 1 => (eligible[0], false),
            None => {
                let index = self.picker.pick(&eligible).min(eligible.len() - 1);
                (eligible[index], true)
            }
        };

        tracing::debug!(
            task,
            allocation = %chosen.id,
            eligible = eligible.len(),
            drawn,
            "Resolved exec target"
        );

        Ok(Resolution {
            target: ExecutionTarget::new(&chosen.task_group, task, &chosen.id),
            eligible: eligible.len(),
            drawn,
        })
    }
}

/// A task group with at least one running task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningGroup {
    pub name: String,
    pub tasks: Vec<String>,
}

/// Groups and tasks that currently have a running instance, sorted by name.
pub fn running_groups(allocations: &[Allocation]) -> Vec<RunningGroup> {
    let mut groups: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for alloc in allocations.iter().filter(|alloc| alloc.is_running()) {
        for task in alloc.active_tasks() {
            groups.entry(alloc.task_group.as_str()).or_default().insert(task);
        }
    }

    groups
        .into_iter()
        .map(|(name, tasks)| RunningGroup {
            name: name.to_string(),
            tasks: tasks.into_iter().map(str::to_string).collect(),
        })
        .collect()
}
