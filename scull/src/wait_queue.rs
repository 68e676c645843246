//! Wait queues
//!
//! Every condition a device can block on (data available, space available,
//! owner released) is a queue registered under its own [`Handle`]. A queue
//! holds the tasks sleeping on it and, optionally, a broadcast channel for
//! pollers that only want to hear "something changed".
//!
//! # 1) Sleeping on a condition
//!
//! Checking the predicate and going to sleep must be one step, or a wake
//! landing in between is lost. The queue lock makes it one step:
//!
//! ```ignore
//! let lock = queue.get_lock();
//! if must_wait() {            // takes and drops the device lock
//!     queue.wait_interruptible(handle, "reader", lock, &signal).await?;
//!     // lock was consumed and released before suspending
//! }
//! // loop back and recheck: a wake-up is a hint, not a hand-off
//! ```
//!
//! Lock order is queue → device for sleepers. Wakers change device state,
//! drop the device lock, then wake the queue.
//!
//! # 2) Leaving without a wake-up
//!
//! Each sleeper holds a ticket. A sleep that ends any other way (the caller
//! was interrupted, or dropped the future) removes its own ticket, so a
//! queue that is rarely woken does not collect dead sleepers.
//!
//! # 3) Retiring
//!
//! A retired queue wakes everyone with `-1` and closes its broadcast
//! channel. Later sleeps on the handle return at once.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};

use crate::error::{DeviceError, Result};
use crate::idgen::{Handle, WakeArg};
use crate::signal::Signal;

struct Sleeper {
    ticket: u64,
    wake: oneshot::Sender<WakeArg>,
    hint: String,
}

/// One registered condition
struct Queue {
    name: String,
    sleepers: Vec<Sleeper>,
    watchers: Option<broadcast::Sender<WakeArg>>,
}

pub struct QueueState {
    queues: HashMap<Handle, Queue>,
    next_ticket: u64,
}

impl QueueState {
    /// Park a new sleeper on `handle`; `None` if the handle is not registered
    fn enqueue(&mut self, handle: Handle, hint: &str) -> Option<(u64, oneshot::Receiver<WakeArg>)> {
        let queue = self.queues.get_mut(&handle)?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let (wake, rx) = oneshot::channel();
        queue.sleepers.push(Sleeper {
            ticket,
            wake,
            hint: hint.to_string(),
        });
        Some((ticket, rx))
    }
}

/// Shared wait-queue table; clones refer to the same table
#[derive(Clone)]
pub struct WaitQueueArc {
    inner: Arc<Mutex<QueueState>>,
}

impl WaitQueueArc {
    #[must_use]
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueState {
                queues: HashMap::new(),
                next_ticket: 0,
            })),
        }
    }

    /// Get the lock for an atomic check-and-sleep
    pub fn get_lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock()
    }

    /// Make a handle sleepable
    pub fn register(&self, handle: Handle, name: &str) {
        let mut state = self.inner.lock();
        if let Some(queue) = state.queues.get(&handle) {
            log::warn!("wait_queue: {handle} already registered as '{}'", queue.name);
            return;
        }
        state.queues.insert(
            handle,
            Queue {
                name: name.to_string(),
                sleepers: Vec::new(),
                watchers: None,
            },
        );
    }

    #[must_use]
    pub fn is_registered(&self, handle: Handle) -> bool {
        self.inner.lock().queues.contains_key(&handle)
    }

    /// Tasks currently asleep on `handle`
    #[must_use]
    pub fn sleeper_count(&self, handle: Handle) -> usize {
        self.inner
            .lock()
            .queues
            .get(&handle)
            .map_or(0, |queue| queue.sleepers.len())
    }

    /// Tasks asleep on any queue of this table
    #[must_use]
    pub fn sleeper_total(&self) -> usize {
        self.inner
            .lock()
            .queues
            .values()
            .map(|queue| queue.sleepers.len())
            .sum()
    }

    /// Remove the queue, waking everyone on it with `-1`
    pub fn retire(&self, handle: Handle) {
        let removed = self.inner.lock().queues.remove(&handle);
        match removed {
            Some(queue) => deliver(handle, queue.sleepers, queue.watchers, -1),
            None => log::warn!("wait_queue.retire: {handle} not registered"),
        }
    }

    /// Wake every sleeper and watcher of a queue
    pub fn wake(&self, handle: Handle, arg: WakeArg) {
        let (sleepers, watchers) = {
            let mut state = self.inner.lock();
            let Some(queue) = state.queues.get_mut(&handle) else {
                return;
            };
            (std::mem::take(&mut queue.sleepers), queue.watchers.clone())
        };
        deliver(handle, sleepers, watchers, arg);
    }

    /// Sleep until the queue is woken or retired
    ///
    /// Precondition: the caller holds `lock` and has just checked its predicate.
    /// The lock is released before this returns. Dropping the returned future
    /// before it completes takes the sleeper off the queue.
    pub fn wait_async(
        &self,
        handle: Handle,
        hint: &str,
        mut lock: MutexGuard<'_, QueueState>,
    ) -> impl Future<Output = ()> + Send {
        let parked = lock.enqueue(handle, hint);
        drop(lock);

        let sleep = parked.map(|(ticket, rx)| {
            let guard = TicketGuard {
                queue: self.clone(),
                handle,
                ticket,
                armed: true,
            };
            (guard, rx)
        });

        async move {
            // No queue: nothing will ever wake us
            let Some((mut guard, rx)) = sleep else {
                return;
            };
            // The sender only goes away unsent with the whole table
            let _ = rx.await;
            guard.armed = false;
        }
    }

    /// Like [`Self::wait_async`], but gives up with `Interrupted` when
    /// `signal` is raised first. A signal that is already pending never
    /// reaches the queue.
    pub fn wait_interruptible(
        &self,
        handle: Handle,
        hint: &str,
        lock: MutexGuard<'_, QueueState>,
        signal: &Signal,
    ) -> impl Future<Output = Result<()>> + Send {
        let sleep = if signal.is_pending() {
            drop(lock);
            None
        } else {
            Some(self.wait_async(handle, hint, lock))
        };
        let signal = signal.clone();

        async move {
            let Some(sleep) = sleep else {
                return Err(DeviceError::Interrupted);
            };
            tokio::select! {
                () = sleep => Ok(()),
                () = signal.raised() => Err(DeviceError::Interrupted),
            }
        }
    }

    /// Subscribe to wake-ups of a queue
    ///
    /// Returns `None` if the handle is not registered. Dropping the receiver
    /// unsubscribes.
    #[must_use]
    pub fn subscribe(
        &self,
        handle: Handle,
        channel_capacity: usize,
        hint: &str,
    ) -> Option<broadcast::Receiver<WakeArg>> {
        let mut state = self.inner.lock();
        let Some(queue) = state.queues.get_mut(&handle) else {
            log::warn!("wait_queue.subscribe: {handle} not registered ({hint})");
            return None;
        };
        let watchers = queue
            .watchers
            .get_or_insert_with(|| broadcast::channel(channel_capacity).0);
        Some(watchers.subscribe())
    }

    fn cancel(&self, handle: Handle, ticket: u64) {
        let mut state = self.inner.lock();
        if let Some(queue) = state.queues.get_mut(&handle) {
            queue.sleepers.retain(|sleeper| sleeper.ticket != ticket);
            log::debug!("wait_queue: sleeper left {} ('{}') unwoken", handle, queue.name);
        }
    }
}

impl fmt::Debug for WaitQueueArc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        write!(f, "WaitQueueArc(queues={})", state.queues.len())
    }
}

/// Takes an unwoken sleeper off its queue when its future goes away
struct TicketGuard {
    queue: WaitQueueArc,
    handle: Handle,
    ticket: u64,
    armed: bool,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if self.armed {
            self.queue.cancel(self.handle, self.ticket);
        }
    }
}

fn deliver(
    handle: Handle,
    sleepers: Vec<Sleeper>,
    watchers: Option<broadcast::Sender<WakeArg>>,
    arg: WakeArg,
) {
    log::debug!(
        "wait_queue.wake: {handle}, arg={arg}, sleepers: {}, watchers: {}",
        sleepers.len(),
        watchers.as_ref().map_or(0, broadcast::Sender::receiver_count)
    );
    for sleeper in sleepers {
        if sleeper.wake.send(arg).is_err() {
            log::debug!("wait_queue.wake: '{}' on {handle} already gone", sleeper.hint);
        }
    }
    if let Some(watchers) = watchers {
        // Nobody polling right now is fine
        let _ = watchers.send(arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retired_handle_does_not_block() {
        let queue = WaitQueueArc::new();
        let handle = Handle::new(7);
        queue.register(handle, "test");
        queue.retire(handle);

        let lock = queue.get_lock();
        queue.wait_async(handle, "waiter", lock).await;
        assert!(!queue.is_registered(handle));
    }

    #[tokio::test]
    async fn test_pending_signal_never_parks() {
        let queue = WaitQueueArc::new();
        let handle = Handle::new(8);
        queue.register(handle, "test");

        let signal = Signal::new();
        signal.raise();
        let lock = queue.get_lock();
        let sleep = queue.wait_interruptible(handle, "waiter", lock, &signal);
        assert_eq!(queue.sleeper_count(handle), 0);
        assert_eq!(sleep.await, Err(DeviceError::Interrupted));
    }

    #[test]
    fn test_dropped_sleep_leaves_queue() {
        let queue = WaitQueueArc::new();
        let handle = Handle::new(9);
        queue.register(handle, "test");

        let sleep = queue.wait_async(handle, "waiter", queue.get_lock());
        assert_eq!(queue.sleeper_count(handle), 1);
        drop(sleep);
        assert_eq!(queue.sleeper_count(handle), 0);
    }

    #[test]
    fn test_wake_empties_queue() {
        let queue = WaitQueueArc::new();
        let handle = Handle::new(10);
        queue.register(handle, "test");

        let _a = queue.wait_async(handle, "a", queue.get_lock());
        let _b = queue.wait_async(handle, "b", queue.get_lock());
        assert_eq!(queue.sleeper_total(), 2);
        queue.wake(handle, 0);
        assert_eq!(queue.sleeper_total(), 0);
    }
}
