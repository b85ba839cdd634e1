use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tokio::sync::Mutex;

use crate::messaging::RunRequest;
use crate::tasks::TaskDefinition;

/// A run request waiting for a worker slot, with whatever the transport
/// needs to acknowledge it (`D`).
#[derive(Debug)]
pub struct QueuedRun<D> {
  pub request: RunRequest,
  pub delivery: D,
  seq: u64,
}

impl<D> QueuedRun<D> {
  pub fn priority(&self) -> u8 {
    self.request.priority
  }
}

impl<D> Eq for QueuedRun<D> {}

impl<D> PartialEq for QueuedRun<D> {
  fn eq(&self, other: &Self) -> bool {
    self.request.priority == other.request.priority && self.seq == other.seq
  }
}

impl<D> PartialOrd for QueuedRun<D> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

// lowest priority value first, then arrival order
impl<D> Ord for QueuedRun<D> {
  fn cmp(&self, other: &Self) -> Ordering {
    other
      .request
      .priority
      .cmp(&self.request.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

struct Inner<D> {
  heap: BinaryHeap<QueuedRun<D>>,
  next_seq: u64,
}

pub struct RunQueue<D> {
  queue: Mutex<Inner<D>>,
}

impl<D> Default for RunQueue<D> {
  fn default() -> Self {
    Self::new()
  }
}

impl<D> RunQueue<D> {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(Inner { heap: BinaryHeap::new(), next_seq: 0 }),
    }
  }

  pub async fn push(&self, request: RunRequest, delivery: D) {
    let mut inner = self.queue.lock().await;
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.heap.push(QueuedRun { request, delivery, seq });
  }

  pub async fn pop(&self) -> Option<QueuedRun<D>> {
    self.queue.lock().await.heap.pop()
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.heap.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

/// Remembers when each task was last put on the queue, so a run still
/// waiting there is not enqueued again on the next tick.
#[derive(Debug, Default)]
pub struct EnqueueTracker {
  enqueued: HashMap<String, DateTime<Utc>>,
}

impl EnqueueTracker {
  /// Names of active tasks due at `now`, counting an enqueue as a start.
  pub fn due(&self, tasks: &[(TaskDefinition, Option<DateTime<Utc>>)], now: DateTime<Utc>) -> Vec<String> {
    tasks
      .iter()
      .filter(|(definition, _)| definition.active)
      .filter(|(definition, last_started)| {
        let last = (*last_started).max(self.enqueued.get(&definition.name).copied());
        definition.schedule.is_due(last, now)
      })
      .map(|(definition, _)| definition.name.clone())
      .collect()
  }

  pub fn mark(&mut self, task: &str, now: DateTime<Utc>) {
    self.enqueued.insert(task.to_string(), now);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::RunTrigger;
  use chrono::TimeZone;

  fn request(task: &str, priority: u8) -> RunRequest {
    RunRequest { priority, ..RunRequest::new(task, RunTrigger::Manual) }
  }

  #[tokio::test]
  async fn pops_by_priority_then_arrival() {
    let queue = RunQueue::new();
    queue.push(request("late_low", 9), 1).await;
    queue.push(request("first_normal", 5), 2).await;
    queue.push(request("urgent", 1), 3).await;
    queue.push(request("second_normal", 5), 4).await;

    let mut order = Vec::new();
    while let Some(run) = queue.pop().await {
      order.push((run.request.task, run.delivery));
    }
    assert_eq!(
      order,
      vec![
        ("urgent".to_string(), 3),
        ("first_normal".to_string(), 2),
        ("second_normal".to_string(), 4),
        ("late_low".to_string(), 1),
      ]
    );
    assert!(queue.is_empty().await);
  }

  #[test]
  fn tracker_holds_back_enqueued_tasks() {
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    let mut hourly = TaskDefinition::new("air_global", "openaq");
    hourly.schedule = "@every 1h".parse().unwrap();
    let mut paused = TaskDefinition::new("fires_nordic", "firms");
    paused.schedule = "@every 1h".parse().unwrap();
    paused.active = false;
    let manual = TaskDefinition::new("ocean_once", "copernicus");
    let tasks = vec![(hourly, None), (paused, None), (manual, None)];

    let mut tracker = EnqueueTracker::default();
    assert_eq!(tracker.due(&tasks, t0), vec!["air_global".to_string()]);

    tracker.mark("air_global", t0);
    assert!(tracker.due(&tasks, t0 + chrono::Duration::minutes(30)).is_empty());
    assert_eq!(tracker.due(&tasks, t0 + chrono::Duration::hours(1)), vec!["air_global".to_string()]);
  }
}
