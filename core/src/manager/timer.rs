//! Generation-checked timers.
//!
//! Each scheduled timer is a tokio task that posts its key and generation
//! back to the engine. Rescheduling or cancelling bumps the generation, so a
//! late firing of a superseded timer is recognised and ignored.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::Command;
use crate::effect::TimerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    pub key: TimerKey,
    pub generation: u64,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub(crate) struct TimerRegistry {
    armed: HashMap<TimerKey, Armed>,
    generation: u64,
    commands: mpsc::WeakSender<Command>,
}

impl TimerRegistry {
    pub fn new(commands: mpsc::WeakSender<Command>) -> Self {
        Self {
            armed: HashMap::new(),
            generation: 0,
            commands,
        }
    }

    pub fn schedule(&mut self, key: TimerKey, after: Duration) {
        self.generation += 1;
        let id = TimerId {
            key,
            generation: self.generation,
        };
        let commands = self.commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Timer(id)).await;
            }
        });
        if let Some(previous) = self.armed.insert(
            key,
            Armed {
                generation: id.generation,
                task,
            },
        ) {
            previous.task.abort();
        }
    }

    pub fn cancel(&mut self, key: TimerKey) {
        if let Some(armed) = self.armed.remove(&key) {
            armed.task.abort();
        }
    }

    /// Whether a fired timer is still the current one for its key. A current
    /// timer is disarmed.
    pub fn fire(&mut self, id: TimerId) -> bool {
        match self.armed.get(&id.key) {
            Some(armed) if armed.generation == id.generation => {
                self.armed.remove(&id.key);
                true
            }
            _ => {
                trace!(key = ?id.key, "Stale timer ignored");
                false
            }
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
