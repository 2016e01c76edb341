//! Deduplicating, rate-limited work queue.
//!
//! A key is in at most one of three states: queued, processing, or processing
//! and dirty. Adding a key that is already queued is a no-op; adding a key that
//! is being processed marks it dirty and it is queued again by [`WorkQueue::done`].
//! This keeps every key serialized while distinct keys run in parallel.

mod rate_limiter;

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;
pub use rate_limiter::ItemExponentialBackoff;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue;
use tokio_util::time::DelayQueue;
use tracing::debug;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    item_ready: Notify,
    idle: Notify,
    rate_limiter: ItemExponentialBackoff<K>,
    delayed: mpsc::UnboundedSender<(K, Duration)>,
    stop: CancellationToken,
}

impl<K> WorkQueue<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    /// Creates the queue and spawns its delay timer. Must be called inside a
    /// tokio runtime.
    pub fn new(name: &'static str, rate_limiter: ItemExponentialBackoff<K>) -> Arc<Self> {
        let (delayed, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let queue = Arc::new(Self {
            name,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            item_ready: Notify::new(),
            idle: Notify::new(),
            rate_limiter,
            delayed,
            stop: stop.clone(),
        });
        tokio::spawn(run_delays(Arc::downgrade(&queue), rx, stop));
        queue
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.item_ready.notify_one();
    }

    /// Adds `key` once `delay` has elapsed. A pending earlier deadline for the
    /// same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        // The timer task only stops after shutdown, when adds are ignored.
        let _ = self.delayed.send((key, delay));
    }

    /// Adds `key` after its backoff delay and counts one more failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.rate_limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Like [`Self::add_rate_limited`], but never sooner than `floor`.
    pub fn add_rate_limited_at_least(&self, key: K, floor: Duration) {
        let delay = self.rate_limiter.when(&key).max(floor);
        self.add_after(key, delay);
    }

    pub fn base_delay(&self) -> Duration {
        self.rate_limiter.base()
    }

    pub fn forget(&self, key: &K) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let ready = self.item_ready.notified();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            ready.await;
        }
    }

    /// Releases a key handed out by [`WorkQueue::get`].
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = !state.shutting_down && state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);
        if requeue {
            self.item_ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stops handing out keys and wakes every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.stop.cancel();
        self.item_ready.notify_waiters();
    }

    /// Shuts down and waits until every key handed out has been marked done.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let idle = self.idle.notified();
            let in_flight = self.lock().processing.len();
            if in_flight == 0 {
                return;
            }
            debug!(queue = self.name, in_flight, "Waiting for in-flight keys to finish");
            idle.await;
        }
    }
}

async fn run_delays<K>(
    queue: Weak<WorkQueue<K>>,
    mut requests: mpsc::UnboundedReceiver<(K, Duration)>,
    stop: CancellationToken,
) where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    let mut delays: DelayQueue<K> = DelayQueue::new();
    let mut pending: HashMap<K, (delay_queue::Key, Instant)> = HashMap::new();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            request = requests.recv() => {
                let Some((key, delay)) = request else { break };
                let deadline = Instant::now() + delay;
                match pending.get_mut(&key) {
                    Some((slot, at)) => {
                        if deadline < *at {
                            delays.reset_at(slot, deadline);
                            *at = deadline;
                        }
                    }
                    None => {
                        let slot = delays.insert_at(key.clone(), deadline);
                        pending.insert(key, (slot, deadline));
                    }
                }
            }
            Some(expired) = delays.next(), if !delays.is_empty() => {
                let key = expired.into_inner();
                pending.remove(&key);
                match queue.upgrade() {
                    Some(queue) => queue.add(key),
                    None => break,
                }
            }
        }
    }
}
