//! Per-task event history and subscriber fan-out.
//!
//! Publishing and history reads share one lock per task, which is what
//! makes ids and history appends atomic. Delivery to subscribers is
//! non-blocking: a subscriber whose queue is full loses that event, and
//! only that subscriber.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::{Event, EventKind};

/// Default bounded history per task
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Queue depth per subscriber; at typical chunk rates this is several
/// seconds of slack before events are dropped for a slow client.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Grace period a terminal task stays registered
pub const DEFAULT_TERMINAL_GRACE: Duration = Duration::from_secs(120);

struct TaskChannel {
    last_event_id: u64,
    history: VecDeque<Event>,
    subscribers: Vec<mpsc::Sender<Event>>,
    terminal_since: Option<Instant>,
}

impl TaskChannel {
    fn new() -> Self {
        Self {
            last_event_id: 0,
            history: VecDeque::new(),
            subscribers: Vec::new(),
            terminal_since: None,
        }
    }
}

/// Central event bus keyed by task id
pub struct EventBus {
    tasks: Mutex<HashMap<String, Arc<Mutex<TaskChannel>>>>,
    history_capacity: usize,
    terminal_grace: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY, DEFAULT_TERMINAL_GRACE)
    }
}

impl EventBus {
    pub fn new(history_capacity: usize, terminal_grace: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            history_capacity,
            terminal_grace,
        }
    }

    fn channel(&self, task_id: &str) -> Arc<Mutex<TaskChannel>> {
        let mut tasks = self.tasks.lock().expect("bus lock");
        tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TaskChannel::new())))
            .clone()
    }

    fn existing_channel(&self, task_id: &str) -> Option<Arc<Mutex<TaskChannel>>> {
        self.tasks.lock().expect("bus lock").get(task_id).cloned()
    }

    /// Publish an event: assign the next id, append to the ring, fan out.
    /// Returns the assigned id.
    pub fn publish(&self, task_id: &str, kind: EventKind, payload: Value) -> u64 {
        let channel = self.channel(task_id);
        let mut guard = channel.lock().expect("task lock");

        guard.last_event_id += 1;
        let event = Event {
            id: guard.last_event_id,
            kind,
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            payload,
        };

        guard.history.push_back(event.clone());
        while guard.history.len() > self.history_capacity {
            guard.history.pop_front();
        }

        // Non-blocking delivery: a full queue drops the event for that
        // subscriber, a closed queue drops the subscriber.
        guard.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task_id, event_id = event.id, "subscriber queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(task_id, "pruning closed subscriber");
                false
            }
        });

        event.id
    }

    /// Subscribe to live events only.
    pub fn subscribe(&self, task_id: &str) -> mpsc::Receiver<Event> {
        let (_, rx) = self.subscribe_with_history(task_id, None);
        rx
    }

    /// Atomically snapshot history newer than `last_id` and register a live
    /// subscriber, under the task lock. The returned replay plus the live
    /// receiver observe each id exactly once, in order.
    pub fn subscribe_with_history(
        &self,
        task_id: &str,
        last_id: Option<u64>,
    ) -> (Vec<Event>, mpsc::Receiver<Event>) {
        let channel = self.channel(task_id);
        let mut guard = channel.lock().expect("task lock");

        let replay = history_after(&guard.history, last_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        guard.subscribers.push(tx);
        debug!(task_id, replay_len = replay.len(), "subscriber registered");
        (replay, rx)
    }

    /// Events with `id > last_id`; everything when `last_id` is `None`.
    pub fn history_since(&self, task_id: &str, last_id: Option<u64>) -> Vec<Event> {
        match self.existing_channel(task_id) {
            Some(channel) => {
                let guard = channel.lock().expect("task lock");
                history_after(&guard.history, last_id)
            }
            None => Vec::new(),
        }
    }

    pub fn last_event_id(&self, task_id: &str) -> u64 {
        self.existing_channel(task_id)
            .map(|c| c.lock().expect("task lock").last_event_id)
            .unwrap_or(0)
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.tasks.lock().expect("bus lock").contains_key(task_id)
    }

    /// Mark a task terminal; it stays registered for the grace period so
    /// late subscribers can still replay its history.
    pub fn mark_terminal(&self, task_id: &str) {
        if let Some(channel) = self.existing_channel(task_id) {
            let mut guard = channel.lock().expect("task lock");
            if guard.terminal_since.is_none() {
                guard.terminal_since = Some(Instant::now());
            }
        }
    }

    /// Drop tasks whose terminal grace period has elapsed. Returns how many
    /// were evicted.
    pub fn sweep_expired(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("bus lock");
        let grace = self.terminal_grace;
        let before = tasks.len();
        tasks.retain(|task_id, channel| {
            let guard = channel.lock().expect("task lock");
            match guard.terminal_since {
                Some(since) if since.elapsed() > grace => {
                    debug!(task_id, "terminal grace elapsed, dropping event channel");
                    false
                }
                _ => true,
            }
        });
        before - tasks.len()
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.existing_channel(task_id)
            .map(|c| c.lock().expect("task lock").subscribers.len())
            .unwrap_or(0)
    }
}

fn history_after(history: &VecDeque<Event>, last_id: Option<u64>) -> Vec<Event> {
    match last_id {
        Some(last) => history.iter().filter(|e| e.id > last).cloned().collect(),
        None => history.iter().cloned().collect(),
    }
}

/// Create a bus wrapped in an Arc for shared ownership.
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::default())
}
