//! Admission bookkeeping for scheduled units.
//!
//! One global FIFO of waiting units plus the set of running ones. The
//! scheduler only decides *what* may run; spawning and completion handling
//! live in the engine.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use sliceup_transfer::ChunkDescriptor;
use tokio_util::sync::CancellationToken;

use crate::config::ConcurrencyScope;
use crate::task::TaskId;

/// Work item kind. Every kind occupies one concurrency slot while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitKind {
    /// Hash, dedup check and session setup.
    Prepare,
    Chunk(ChunkDescriptor),
    Merge,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => f.write_str("prepare"),
            Self::Chunk(chunk) => write!(f, "chunk {}", chunk.sequence),
            Self::Merge => f.write_str("merge"),
        }
    }
}

/// One schedulable unit of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Unit {
    pub task: TaskId,
    pub kind: UnitKind,
    /// Retries already spent on this unit.
    pub retries: u32,
}

impl Unit {
    pub fn new(task: TaskId, kind: UnitKind) -> Self {
        Self {
            task,
            kind,
            retries: 0,
        }
    }
}

/// Why a running unit was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// Put the unit back at the head of the queue.
    Pause,
    /// Drop the unit; the task was cancelled.
    Cancel,
    /// Drop the unit; another unit of the task failed.
    TaskFailed,
}

#[derive(Debug)]
pub(crate) struct RunningUnit {
    pub unit: Unit,
    pub cancel: CancellationToken,
    pub interrupt: Option<Interrupt>,
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub queued: usize,
    pub running: usize,
    /// Units sleeping out a retry backoff.
    pub backing_off: usize,
    /// Highest number of simultaneously running units seen.
    pub peak_running: usize,
    pub paused: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: VecDeque<Unit>,
    running: HashMap<u64, RunningUnit>,
    next_id: u64,
    backing_off: usize,
    peak_running: usize,
    paused: bool,
}

impl Scheduler {
    pub fn push_back(&mut self, unit: Unit) {
        self.queue.push_back(unit);
    }

    pub fn push_front(&mut self, unit: Unit) {
        self.queue.push_front(unit);
    }

    /// Removes and returns the first unit allowed to start, if any.
    ///
    /// `Global` admits the queue head while fewer than `limit` units run.
    /// `PerTask` admits the first unit whose task runs fewer than `limit`.
    pub fn next_admissible(&mut self, limit: usize, scope: ConcurrencyScope) -> Option<Unit> {
        if self.paused {
            return None;
        }
        match scope {
            ConcurrencyScope::Global => {
                if self.running.len() >= limit {
                    return None;
                }
                self.queue.pop_front()
            }
            ConcurrencyScope::PerTask => {
                let idx = self
                    .queue
                    .iter()
                    .position(|unit| self.running_for(&unit.task) < limit)?;
                self.queue.remove(idx)
            }
        }
    }

    /// Registers a unit as running and returns its handle id.
    pub fn start(&mut self, unit: Unit, cancel: CancellationToken) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.running.insert(
            id,
            RunningUnit {
                unit,
                cancel,
                interrupt: None,
            },
        );
        self.peak_running = self.peak_running.max(self.running.len());
        id
    }

    /// Unregisters a finished unit.
    pub fn finish(&mut self, id: u64) -> Option<RunningUnit> {
        self.running.remove(&id)
    }

    /// Drops the queued units of `task` and interrupts its running ones.
    /// Returns how many units were affected.
    pub fn remove_task(&mut self, task: &TaskId, interrupt: Interrupt) -> usize {
        let before = self.queue.len();
        self.queue.retain(|unit| &unit.task != task);
        let mut affected = before - self.queue.len();

        for running in self.running.values_mut() {
            if &running.unit.task == task {
                running.interrupt = Some(interrupt);
                running.cancel.cancel();
                affected += 1;
            }
        }
        affected
    }

    /// Stops admission and interrupts every running unit. Returns how many
    /// were interrupted.
    pub fn pause(&mut self) -> usize {
        self.paused = true;
        let mut interrupted = 0;
        for running in self.running.values_mut() {
            if running.interrupt.is_none() {
                running.interrupt = Some(Interrupt::Pause);
                running.cancel.cancel();
                interrupted += 1;
            }
        }
        interrupted
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn begin_backoff(&mut self) {
        self.backing_off += 1;
    }

    pub fn end_backoff(&mut self) {
        self.backing_off = self.backing_off.saturating_sub(1);
    }

    /// Nothing queued, running or waiting on a backoff timer.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty() && self.backing_off == 0
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queued: self.queue.len(),
            running: self.running.len(),
            backing_off: self.backing_off,
            peak_running: self.peak_running,
            paused: self.paused,
        }
    }

    fn running_for(&self, task: &TaskId) -> usize {
        self.running
            .values()
            .filter(|r| &r.unit.task == task)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(sequence: u64) -> UnitKind {
        UnitKind::Chunk(ChunkDescriptor {
            sequence,
            start: sequence * 4,
            end: sequence * 4 + 4,
        })
    }

    fn unit(task: &str, kind: UnitKind) -> Unit {
        Unit::new(TaskId::from(task), kind)
    }

    #[test]
    fn global_limit_is_fifo() {
        let mut s = Scheduler::default();
        s.push_back(unit("a", chunk(0)));
        s.push_back(unit("a", chunk(1)));
        s.push_back(unit("b", chunk(0)));

        let first = s.next_admissible(2, ConcurrencyScope::Global).unwrap();
        assert_eq!(first, unit("a", chunk(0)));
        s.start(first, CancellationToken::new());
        let second = s.next_admissible(2, ConcurrencyScope::Global).unwrap();
        assert_eq!(second, unit("a", chunk(1)));
        let id = s.start(second, CancellationToken::new());

        assert!(s.next_admissible(2, ConcurrencyScope::Global).is_none());
        s.finish(id);
        assert_eq!(
            s.next_admissible(2, ConcurrencyScope::Global).unwrap(),
            unit("b", chunk(0))
        );
    }

    #[test]
    fn per_task_limit_skips_saturated_tasks() {
        let mut s = Scheduler::default();
        s.push_back(unit("a", chunk(0)));
        s.push_back(unit("a", chunk(1)));
        s.push_back(unit("b", chunk(0)));

        let a0 = s.next_admissible(1, ConcurrencyScope::PerTask).unwrap();
        s.start(a0, CancellationToken::new());
        let next = s.next_admissible(1, ConcurrencyScope::PerTask).unwrap();
        assert_eq!(next, unit("b", chunk(0)));
        s.start(next, CancellationToken::new());
        assert!(s.next_admissible(1, ConcurrencyScope::PerTask).is_none());
        assert_eq!(s.stats().peak_running, 2);
    }

    #[test]
    fn pause_interrupts_and_blocks_admission() {
        let mut s = Scheduler::default();
        let token = CancellationToken::new();
        let id = s.start(unit("a", UnitKind::Prepare), token.clone());
        s.push_back(unit("a", chunk(0)));

        assert_eq!(s.pause(), 1);
        assert!(token.is_cancelled());
        assert!(s.next_admissible(4, ConcurrencyScope::Global).is_none());

        let running = s.finish(id).unwrap();
        assert_eq!(running.interrupt, Some(Interrupt::Pause));

        s.resume();
        assert!(s.next_admissible(4, ConcurrencyScope::Global).is_some());
    }

    #[test]
    fn remove_task_only_touches_that_task() {
        let mut s = Scheduler::default();
        let a_token = CancellationToken::new();
        let b_token = CancellationToken::new();
        let a_id = s.start(unit("a", chunk(0)), a_token.clone());
        s.start(unit("b", chunk(0)), b_token.clone());
        s.push_back(unit("a", chunk(1)));
        s.push_back(unit("b", chunk(1)));

        assert_eq!(s.remove_task(&TaskId::from("a"), Interrupt::Cancel), 2);
        assert!(a_token.is_cancelled());
        assert!(!b_token.is_cancelled());
        assert_eq!(s.stats().queued, 1);
        assert_eq!(s.finish(a_id).unwrap().interrupt, Some(Interrupt::Cancel));
        assert_eq!(s.next_admissible(4, ConcurrencyScope::Global), Some(unit("b", chunk(1))));
    }

    #[test]
    fn backoff_keeps_scheduler_busy() {
        let mut s = Scheduler::default();
        assert!(s.is_idle());
        s.begin_backoff();
        assert!(!s.is_idle());
        s.end_backoff();
        s.end_backoff();
        assert!(s.is_idle());
    }

    #[test]
    fn unit_kind_display() {
        assert_eq!(UnitKind::Prepare.to_string(), "prepare");
        assert_eq!(chunk(3).to_string(), "chunk 3");
        assert_eq!(UnitKind::Merge.to_string(), "merge");
    }
}
