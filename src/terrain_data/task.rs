use bevy::utils::{HashMap, HashSet};
use derive_more::derive::{Display, From};
use itertools::Itertools;

/// The identifier of a production task.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Display, From)]
#[display("task_{_0}")]
pub struct TaskId(pub u64);

/// The state of a production task.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskStatus {
    #[default]
    Pending,
    /// The task has been executed. Stamps increase monotonically with each completion.
    Done { completed_at: u64 },
}

impl TaskStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done { .. })
    }

    pub fn completed_at(&self) -> Option<u64> {
        match *self {
            TaskStatus::Done { completed_at } => Some(completed_at),
            TaskStatus::Pending => None,
        }
    }
}

#[derive(Clone, Debug)]
struct TaskEntry {
    id: TaskId,
    name: String,
    dependencies: Vec<TaskId>,
}

/// The tasks that have to be executed before the current frame can be drawn.
///
/// The graph only records what has to run, executing it is up to the scheduler.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    tasks: Vec<TaskEntry>,
    /// The position of each task inside `tasks`.
    index: HashMap<TaskId, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task to the graph, unless it is already part of it.
    pub fn add_task(&mut self, id: TaskId, name: impl Into<String>) {
        if self.contains(id) {
            return;
        }

        self.index.insert(id, self.tasks.len());
        self.tasks.push(TaskEntry {
            id,
            name: name.into(),
            dependencies: Vec::new(),
        });
    }

    /// Records that `task` may only run after `dependency` is done.
    pub fn add_dependency(&mut self, task: TaskId, dependency: TaskId) {
        let Some(&position) = self.index.get(&task) else {
            return;
        };

        let entry = &mut self.tasks[position];

        if !entry.dependencies.contains(&dependency) {
            entry.dependencies.push(dependency);
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.index.clear();
    }

    pub fn name(&self, id: TaskId) -> Option<&str> {
        self.entry(id).map(|entry| entry.name.as_str())
    }

    #[cfg(test)]
    pub(crate) fn dependencies(&self, id: TaskId) -> &[TaskId] {
        self.entry(id).map_or(&[], |entry| entry.dependencies.as_slice())
    }

    fn entry(&self, id: TaskId) -> Option<&TaskEntry> {
        self.index.get(&id).map(|&position| &self.tasks[position])
    }

    /// Returns the tasks in an order that respects their dependencies.
    ///
    /// Dependencies outside of the graph are assumed to be satisfied.
    /// Tasks caught in a dependency cycle are appended in insertion order.
    pub fn execution_order(&self) -> Vec<TaskId> {
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut done = HashSet::default();
        let mut remaining = self.tasks.iter().collect_vec();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|entry| {
                entry
                    .dependencies
                    .iter()
                    .all(|dependency| !self.contains(*dependency) || done.contains(dependency))
            });

            if ready.is_empty() {
                order.extend(blocked.iter().map(|entry| entry.id));
                break;
            }

            done.extend(ready.iter().map(|entry| entry.id));
            order.extend(ready.iter().map(|entry| entry.id));
            remaining = blocked;
        }

        order
    }
}
