//! `queue` crate: per-key serial mailboxes.
//!
//! A [`KeyedQueue`] funnels every message for one key through a single
//! worker, so handlers for the same key never run concurrently while
//! different keys are processed in parallel. Workers are spawned on demand
//! and exit as soon as their mailbox drains: an idle key costs one missing
//! map entry, nothing more.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Consumer of the messages pushed for a key.
#[async_trait]
pub trait MessageHandler<K, M>: Send + Sync + 'static {
    async fn handle(&self, key: &K, message: M);
}

/// Per-key FIFO mailboxes drained by on-demand workers.
pub struct KeyedQueue<K, M> {
    mailboxes: Arc<Mutex<HashMap<K, UnboundedSender<M>>>>,
}

impl<K, M> Clone for KeyedQueue<K, M> {
    fn clone(&self) -> Self {
        Self { mailboxes: Arc::clone(&self.mailboxes) }
    }
}

impl<K, M> Default for KeyedQueue<K, M> {
    fn default() -> Self {
        Self { mailboxes: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<K, M> KeyedQueue<K, M>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    M: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to the mailbox of `key`, spawning a worker that runs
    /// `handler` if none is active. Must be called inside a tokio runtime.
    pub fn push<H>(&self, key: K, message: M, handler: Arc<H>)
    where
        H: MessageHandler<K, M>,
    {
        let mut boxes = lock(&self.mailboxes);

        // The send happens under the map lock; the worker only retires while
        // holding the same lock, so a message can never land in a mailbox
        // that nobody will drain.
        let message = match boxes.get(&key) {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive in this scope, so this send cannot fail.
        let _ = tx.send(message);
        boxes.insert(key.clone(), tx);
        drop(boxes);

        debug!(?key, "spawning mailbox worker");
        tokio::spawn(drain(key, rx, Arc::clone(&self.mailboxes), handler));
    }

    /// `true` when no worker is currently active for `key`.
    pub fn is_idle(&self, key: &K) -> bool {
        !lock(&self.mailboxes).contains_key(key)
    }

    /// Number of keys with an active worker.
    pub fn active_keys(&self) -> usize {
        lock(&self.mailboxes).len()
    }
}

async fn drain<K, M, H>(
    key: K,
    mut rx: UnboundedReceiver<M>,
    mailboxes: Arc<Mutex<HashMap<K, UnboundedSender<M>>>>,
    handler: Arc<H>,
) where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    M: Send + 'static,
    H: MessageHandler<K, M>,
{
    loop {
        match rx.try_recv() {
            Ok(message) => handler.handle(&key, message).await,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                let last = {
                    let mut boxes = lock(&mailboxes);
                    let last = rx.try_recv().ok();
                    if last.is_none() {
                        boxes.remove(&key);
                    }
                    last
                };
                match last {
                    Some(message) => handler.handle(&key, message).await,
                    None => {
                        debug!(?key, "mailbox drained, worker exiting");
                        return;
                    }
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("mailbox registry lock was poisoned; continuing");
        poisoned.into_inner()
    })
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    /// Records `(key, message)` pairs and tracks how many handlers overlap
    /// for the same key.
    #[derive(Default)]
    struct Recorder {
        seen: AsyncMutex<Vec<(u32, u32)>>,
        in_flight: Mutex<HashMap<u32, usize>>,
        max_overlap: Mutex<usize>,
    }

    #[async_trait]
    impl MessageHandler<u32, u32> for Recorder {
        async fn handle(&self, key: &u32, message: u32) {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(*key).or_default();
                *n += 1;
                let mut max = self.max_overlap.lock().unwrap();
                *max = (*max).max(*n);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.seen.lock().await.push((*key, message));
            *self.in_flight.lock().unwrap().get_mut(key).unwrap() -= 1;
        }
    }

    async fn wait_idle(queue: &KeyedQueue<u32, u32>) {
        for _ in 0..500 {
            if queue.active_keys() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never drained");
    }

    #[tokio::test]
    async fn messages_for_one_key_are_handled_in_order() {
        let queue = KeyedQueue::new();
        let recorder = Arc::new(Recorder::default());

        for m in 0..20 {
            queue.push(1, m, Arc::clone(&recorder));
        }
        wait_idle(&queue).await;

        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen.iter().map(|(_, m)| *m).collect::<Vec<_>>(), (0..20).collect::<Vec<_>>());
        assert_eq!(*recorder.max_overlap.lock().unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_keys_do_not_serialize_each_other() {
        let queue = KeyedQueue::new();
        let recorder = Arc::new(Recorder::default());

        for key in 0..8 {
            for m in 0..5 {
                queue.push(key, m, Arc::clone(&recorder));
            }
        }
        wait_idle(&queue).await;

        let seen = recorder.seen.lock().await.clone();
        assert_eq!(seen.len(), 40);
        for key in 0..8 {
            let per_key: Vec<u32> = seen.iter().filter(|(k, _)| *k == key).map(|(_, m)| *m).collect();
            assert_eq!(per_key, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(*recorder.max_overlap.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn worker_retires_and_respawns() {
        let queue = KeyedQueue::new();
        let recorder = Arc::new(Recorder::default());

        queue.push(7, 1, Arc::clone(&recorder));
        assert!(!queue.is_idle(&7));
        wait_idle(&queue).await;
        assert!(queue.is_idle(&7));

        queue.push(7, 2, Arc::clone(&recorder));
        wait_idle(&queue).await;
        assert_eq!(recorder.seen.lock().await.clone(), vec![(7, 1), (7, 2)]);
    }
}
