// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Split intake for the scan nodes of one task
//!
//! The coordinator adds splits while any number of drivers poll them, so all
//! state lives behind one lock. Drivers that find an empty queue get a future
//! that resolves on the next change to their node instead of spinning.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use snafu::location;
use strata_core::{Error, Result};
use tokio::sync::watch;

use crate::split::Split;

/// A split handed to a driver
#[derive(Debug, Clone)]
pub struct ScheduledSplit {
    pub split: Split,
    pub sequence: Option<u64>,
}

/// Result of asking the scheduler for the next split of a node
pub enum SplitPoll {
    Split(ScheduledSplit),
    /// Nothing queued yet. The future resolves once the node's queue changes.
    Blocked(BoxFuture<'static, ()>),
    /// The queue is drained and no more splits will arrive
    NoMoreSplits,
    /// The task was failed, the message is the reason given to [`SplitScheduler::fail`]
    Failed(String),
}

impl std::fmt::Debug for SplitPoll {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split(split) => f.debug_tuple("Split").field(split).finish(),
            Self::Blocked(_) => f.write_str("Blocked"),
            Self::NoMoreSplits => f.write_str("NoMoreSplits"),
            Self::Failed(message) => f.debug_tuple("Failed").field(message).finish(),
        }
    }
}

/// Running totals of one node's splits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitStats {
    pub queued_count: usize,
    pub queued_weight: u64,
    pub running_count: usize,
    pub running_weight: u64,
    pub completed_count: usize,
}

struct NodeQueue {
    queue: VecDeque<ScheduledSplit>,
    max_sequence: Option<u64>,
    no_more_splits: bool,
    stats: SplitStats,
    changed: watch::Sender<u64>,
}

impl NodeQueue {
    fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            queue: VecDeque::new(),
            max_sequence: None,
            no_more_splits: false,
            stats: SplitStats::default(),
            changed,
        }
    }

    fn release(&mut self, weight: u64) {
        self.stats.running_count = self.stats.running_count.saturating_sub(1);
        self.stats.running_weight = self.stats.running_weight.saturating_sub(weight);
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }

    fn push(&mut self, scheduled: ScheduledSplit) {
        self.stats.queued_count += 1;
        self.stats.queued_weight += scheduled.split.weight;
        match scheduled.sequence {
            // Keep sequenced splits ascending so output follows sequence order
            Some(sequence) => {
                let position = self
                    .queue
                    .iter()
                    .rposition(|queued| queued.sequence.is_none_or(|s| s <= sequence))
                    .map_or(0, |p| p + 1);
                self.queue.insert(position, scheduled);
            }
            None => self.queue.push_back(scheduled),
        }
        self.notify();
    }
}

#[derive(Default)]
struct SchedulerState {
    nodes: HashMap<String, NodeQueue>,
    failure: Option<String>,
}

impl SchedulerState {
    fn node(&mut self, node_id: &str) -> &mut NodeQueue {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(NodeQueue::new)
    }
}

/// The split queues of every scan node of one task
pub struct SplitScheduler {
    task_id: String,
    state: Mutex<SchedulerState>,
}

impl std::fmt::Debug for SplitScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitScheduler")
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl SplitScheduler {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a split. The same split added twice is read twice.
    pub fn add_split(&self, node_id: &str, split: Split) {
        let mut state = self.lock();
        if state.failure.is_some() {
            log::debug!("Task {} failed, ignoring split {}", self.task_id, split);
            return;
        }
        state.node(node_id).push(ScheduledSplit {
            split,
            sequence: None,
        });
    }

    /// Enqueue a split only if `sequence` is greater than the node's max sequence id.
    ///
    /// Returns whether the split was added.
    pub fn add_split_with_sequence(&self, node_id: &str, split: Split, sequence: u64) -> bool {
        let mut state = self.lock();
        if state.failure.is_some() {
            return false;
        }
        let node = state.node(node_id);
        if node.max_sequence.is_some_and(|max| sequence <= max) {
            log::debug!(
                "Dropping split {} of node {}: sequence {} is not above {:?}",
                split,
                node_id,
                sequence,
                node.max_sequence
            );
            return false;
        }
        node.push(ScheduledSplit {
            split,
            sequence: Some(sequence),
        });
        true
    }

    pub fn set_max_split_sequence_id(&self, node_id: &str, sequence: u64) {
        let mut state = self.lock();
        let node = state.node(node_id);
        node.max_sequence = Some(node.max_sequence.map_or(sequence, |max| max.max(sequence)));
    }

    /// Signal that no further splits will be added to the node
    pub fn no_more_splits(&self, node_id: &str) {
        let mut state = self.lock();
        let node = state.node(node_id);
        if !node.no_more_splits {
            log::debug!("No more splits for node {} of task {}", node_id, self.task_id);
            node.no_more_splits = true;
            node.notify();
        }
    }

    /// Fail the task. Queued splits are dropped and blocked drivers are woken up.
    pub fn fail(&self, message: impl Into<String>) {
        let mut state = self.lock();
        if state.failure.is_some() {
            return;
        }
        let message = message.into();
        log::warn!("Task {} failed: {}", self.task_id, message);
        state.failure = Some(message);
        for node in state.nodes.values_mut() {
            node.queue.clear();
            node.stats.queued_count = 0;
            node.stats.queued_weight = 0;
            node.notify();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failure.is_some()
    }

    /// Take the next split of a node
    pub fn poll_split(&self, node_id: &str) -> SplitPoll {
        let mut state = self.lock();
        if let Some(message) = &state.failure {
            return SplitPoll::Failed(message.clone());
        }
        let node = state.node(node_id);
        if let Some(scheduled) = node.queue.pop_front() {
            let weight = scheduled.split.weight;
            node.stats.queued_count -= 1;
            node.stats.queued_weight -= weight;
            node.stats.running_count += 1;
            node.stats.running_weight += weight;
            return SplitPoll::Split(scheduled);
        }
        if node.no_more_splits {
            return SplitPoll::NoMoreSplits;
        }
        let mut changed = node.changed.subscribe();
        SplitPoll::Blocked(
            async move {
                // An error means the scheduler is gone, polling again reports that
                let _ = changed.changed().await;
            }
            .boxed(),
        )
    }

    /// Mark a split returned by [`Self::poll_split`] as done
    pub fn split_finished(&self, node_id: &str, split: &ScheduledSplit) {
        let mut state = self.lock();
        let node = state.node(node_id);
        node.release(split.split.weight);
        node.stats.completed_count += 1;
    }

    /// Release a split returned by [`Self::poll_split`] that will not be read to the end
    pub fn split_abandoned(&self, node_id: &str, split: &ScheduledSplit) {
        let mut state = self.lock();
        state.node(node_id).release(split.split.weight);
    }

    pub fn stats(&self, node_id: &str) -> SplitStats {
        self.lock()
            .nodes
            .get(node_id)
            .map(|node| node.stats)
            .unwrap_or_default()
    }
}

/// Keeps track of the tasks running in this process.
///
/// Passed explicitly to whoever creates tasks. A task is registered for as long
/// as its [`TaskHandle`] lives.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, Arc<SplitScheduler>>>>,
}

impl TaskRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SplitScheduler>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a task and create its scheduler
    pub fn create_task(&self, task_id: impl Into<String>) -> Result<TaskHandle> {
        let task_id = task_id.into();
        let mut tasks = self.lock();
        if tasks.contains_key(&task_id) {
            return Err(Error::invalid_input(
                format!("Task {} is already registered", task_id),
                location!(),
            ));
        }
        let scheduler = Arc::new(SplitScheduler::new(task_id.clone()));
        tasks.insert(task_id.clone(), scheduler.clone());
        Ok(TaskHandle {
            task_id,
            scheduler,
            registry: self.clone(),
        })
    }

    pub fn num_running_tasks(&self) -> usize {
        self.lock().len()
    }

    pub fn scheduler(&self, task_id: &str) -> Option<Arc<SplitScheduler>> {
        self.lock().get(task_id).cloned()
    }
}

/// A registered task. Dropping the handle deregisters the task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    scheduler: Arc<SplitScheduler>,
    registry: TaskRegistry,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn scheduler(&self) -> &Arc<SplitScheduler> {
        &self.scheduler
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.task_id);
    }
}
