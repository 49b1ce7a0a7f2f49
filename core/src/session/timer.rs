// Cancellable one-shot timers feeding an actor mailbox
//
// Each arm bumps a generation counter. The fired message carries the
// generation, and the actor only acts on it if `take_if_current` agrees, so a
// timer that was cancelled or re-armed after its sleep finished is ignored.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Timers owned by one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Ready must be reached before this fires
    Connection,
    /// Status must arrive before this fires
    Task,
    /// Delay between the disconnect request and releasing the slot
    Settle,
}

struct Armed {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct Timers<K, M> {
    tx: mpsc::UnboundedSender<M>,
    fired: fn(K, u64) -> M,
    next_generation: u64,
    armed: HashMap<K, Armed>,
}

impl<K, M> Timers<K, M>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
    M: Send + 'static,
{
    /// `fired` builds the mailbox message for a key and generation
    pub fn new(tx: mpsc::UnboundedSender<M>, fired: fn(K, u64) -> M) -> Self {
        Self {
            tx,
            fired,
            next_generation: 0,
            armed: HashMap::new(),
        }
    }

    /// Arm `key`, replacing a pending timer with the same key
    pub fn arm(&mut self, key: K, after: Duration) {
        self.cancel(&key);
        self.next_generation += 1;
        let generation = self.next_generation;
        let message = (self.fired)(key.clone(), generation);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(message);
        });
        self.armed.insert(key, Armed { generation, task });
    }

    /// Idempotent
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.armed.remove(key) {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        let keys: Vec<K> = self.armed.keys().filter(|k| predicate(k)).cloned().collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.armed.contains_key(key)
    }

    /// Consume a fired timer; false if it was cancelled or re-armed since
    pub fn take_if_current(&mut self, key: &K, generation: u64) -> bool {
        match self.armed.get(key) {
            Some(armed) if armed.generation == generation => {
                self.armed.remove(key);
                true
            }
            _ => {
                debug!("Ignoring stale timer {:?} (generation {})", key, generation);
                false
            }
        }
    }
}

impl<K, M> Drop for Timers<K, M> {
    fn drop(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Fired(TimerKind, u64);

    fn timers() -> (Timers<TimerKind, Fired>, mpsc::UnboundedReceiver<Fired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Timers::new(tx, |k: TimerKind, g: u64| Fired(k, g)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (mut timers, mut rx) = timers();
        timers.arm(TimerKind::Task, Duration::from_secs(60));
        let Fired(kind, generation) = rx.recv().await.expect("fired");
        assert_eq!(kind, TimerKind::Task);
        assert!(timers.take_if_current(&kind, generation));
        assert!(!timers.take_if_current(&kind, generation));
        assert!(!timers.is_armed(&TimerKind::Task));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (mut timers, mut rx) = timers();
        timers.arm(TimerKind::Connection, Duration::from_secs(30));
        assert!(timers.cancel(&TimerKind::Connection));
        assert!(!timers.cancel(&TimerKind::Connection));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_makes_old_generation_stale() {
        let (mut timers, mut rx) = timers();
        timers.arm(TimerKind::Settle, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // fired but not yet consumed; re-arm replaces it
        timers.arm(TimerKind::Settle, Duration::from_secs(1));
        let Fired(kind, first) = rx.recv().await.expect("first fire");
        assert!(!timers.take_if_current(&kind, first));
        let Fired(kind, second) = rx.recv().await.expect("second fire");
        assert!(timers.take_if_current(&kind, second));
    }
}
