//! Bounded in-memory pipe
//!
//! A ring of `capacity` bytes shared by all readers and writers of one pipe
//! device:
//! - Readers sleep on `inq` while the ring is empty
//! - Writers sleep on `outq` while the ring is full
//! - Every successful write wakes `inq` and calls the async listeners
//! - Every successful read wakes `outq`
//!
//! One slot always stays empty, so `rp == wp` unambiguously means "empty"
//! and a ring of `capacity` bytes holds at most `capacity - 1`.
//!
//! The ring is allocated by the first open and freed by the last release;
//! a pipe reopened after that starts empty.
//!
//! # Thread Safety
//!
//! One `parking_lot::Mutex` guards the ring and the opener counts. Waits
//! follow the [`crate::wait_queue`] protocol, so the mutex is never held
//! while a caller sleeps, and wake-ups and listener calls happen after it
//! is released.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;

use crate::error::{DeviceError, Result};
use crate::fasync::{AsyncCallback, AsyncListeners};
use crate::file::AccessMode;
use crate::idgen::{Handle, IdGen, WakeArg};
use crate::signal::Signal;
use crate::wait_queue::WaitQueueArc;

/// Result of a readiness query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

struct Ring {
    buffer: Box<[u8]>,
    rp: usize,
    wp: usize,
}

impl Ring {
    fn allocate(capacity: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(capacity)?;
        buffer.resize(capacity, 0u8);
        Ok(Self {
            buffer: buffer.into_boxed_slice(),
            rp: 0,
            wp: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    fn space_free(&self) -> usize {
        let capacity = self.capacity();
        if self.rp == self.wp {
            return capacity - 1;
        }
        (self.rp + capacity - self.wp) % capacity - 1
    }

    fn occupied(&self) -> usize {
        let capacity = self.capacity();
        (self.wp + capacity - self.rp) % capacity
    }

    /// Copy out one contiguous run; caller checked the ring is not empty
    fn take(&mut self, buf: &mut [u8]) -> usize {
        let run_end = if self.wp > self.rp {
            self.wp
        } else {
            self.capacity()
        };
        let count = buf.len().min(run_end - self.rp);
        buf[..count].copy_from_slice(&self.buffer[self.rp..self.rp + count]);
        self.rp += count;
        if self.rp == self.capacity() {
            self.rp = 0;
        }
        count
    }

    /// Copy in one contiguous run; caller checked there is free space
    fn put(&mut self, data: &[u8]) -> usize {
        let mut count = data.len().min(self.space_free());
        if self.wp >= self.rp {
            count = count.min(self.capacity() - self.wp);
        } else {
            count = count.min(self.rp - self.wp - 1);
        }
        self.buffer[self.wp..self.wp + count].copy_from_slice(&data[..count]);
        self.wp += count;
        if self.wp == self.capacity() {
            self.wp = 0;
        }
        count
    }
}

#[derive(Default)]
struct PipeState {
    ring: Option<Ring>,
    nreaders: usize,
    nwriters: usize,
}

impl PipeState {
    fn must_wait_for_data(&self) -> bool {
        self.ring
            .as_ref()
            .is_some_and(|ring| ring.is_empty() && self.nwriters > 0)
    }

    fn must_wait_for_space(&self) -> bool {
        self.ring.as_ref().is_some_and(|ring| ring.space_free() == 0)
    }
}

pub struct ScullPipe {
    name: String,
    capacity: usize,
    state: Mutex<PipeState>,
    queue: WaitQueueArc,
    inq: Handle,
    outq: Handle,
    listeners: AsyncListeners,
}

impl ScullPipe {
    /// `capacity` must be at least 2
    #[must_use]
    pub fn new(name: &str, capacity: usize, queue: WaitQueueArc, idgen: &IdGen) -> Self {
        debug_assert!(capacity >= 2, "pipe ring needs at least two bytes");
        let inq = idgen.next_handle();
        let outq = idgen.next_handle();
        queue.register(inq, &format!("{name}.inq"));
        queue.register(outq, &format!("{name}.outq"));

        Self {
            name: name.to_string(),
            capacity,
            state: Mutex::new(PipeState::default()),
            queue,
            inq,
            outq,
            listeners: AsyncListeners::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ring size; usable space is one byte less
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Count a new opener, allocating the ring for the first one.
    ///
    /// # Errors
    /// `OutOfMemory` if the ring cannot be allocated; counts are unchanged.
    pub fn open(&self, mode: AccessMode) -> Result<()> {
        let mut state = self.state.lock();
        if state.ring.is_none() {
            state.ring = Some(Ring::allocate(self.capacity)?);
            log::debug!("pipe {}: allocated {} byte ring", self.name, self.capacity);
        }
        if mode.readable() {
            state.nreaders += 1;
        }
        if mode.writable() {
            state.nwriters += 1;
        }
        Ok(())
    }

    /// Forget an opener; the last one frees the ring. Never fails.
    pub fn close(&self, mode: AccessMode) {
        let last_writer_left = {
            let mut state = self.state.lock();
            if mode.readable() {
                debug_assert!(state.nreaders > 0, "pipe reader close without open");
                state.nreaders = state.nreaders.saturating_sub(1);
            }
            let mut last_writer_left = false;
            if mode.writable() {
                debug_assert!(state.nwriters > 0, "pipe writer close without open");
                state.nwriters = state.nwriters.saturating_sub(1);
                last_writer_left = state.nwriters == 0;
            }
            if state.nreaders + state.nwriters == 0 && state.ring.take().is_some() {
                log::debug!("pipe {}: last opener gone, ring released", self.name);
            }
            last_writer_left
        };

        if last_writer_left {
            // Sleeping readers must notice end-of-stream
            self.queue.wake(self.inq, 0);
        }
    }

    /// Read one contiguous run of available bytes.
    ///
    /// Sleeps while the ring is empty and writers remain.
    ///
    /// # Errors
    /// - `EndOfStream`: empty and no writers
    /// - `WouldBlock`: empty and `nonblocking`
    /// - `Interrupted`: `signal` raised while sleeping
    /// - `BadHandle`: the pipe has no opener (ring released)
    pub async fn read(&self, buf: &mut [u8], nonblocking: bool, signal: &Signal) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(count) = self.try_take(buf)? {
                self.queue.wake(self.outq, count as WakeArg);
                log::debug!("pipe {}: did read {count} bytes", self.name);
                return Ok(count);
            }
            if nonblocking {
                return Err(DeviceError::WouldBlock);
            }
            log::debug!("pipe {}: reader going to sleep", self.name);
            if let Some(wait) = self.prepare_wait(self.inq, "reader", signal, PipeState::must_wait_for_data) {
                wait.await?;
            }
        }
    }

    /// Write one contiguous run of `data`, as much as fits.
    ///
    /// Sleeps while the ring is full. Callers loop to write everything.
    ///
    /// # Errors
    /// - `WouldBlock`: full and `nonblocking`
    /// - `Interrupted`: `signal` raised while sleeping
    /// - `BadHandle`: the pipe has no opener (ring released)
    pub async fn write(&self, data: &[u8], nonblocking: bool, signal: &Signal) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(count) = self.try_put(data)? {
                self.queue.wake(self.inq, count as WakeArg);
                self.listeners.notify(count);
                log::debug!("pipe {}: did write {count} bytes", self.name);
                return Ok(count);
            }
            if nonblocking {
                return Err(DeviceError::WouldBlock);
            }
            log::debug!("pipe {}: writer going to sleep", self.name);
            if let Some(wait) = self.prepare_wait(self.outq, "writer", signal, PipeState::must_wait_for_space) {
                wait.await?;
            }
        }
    }

    /// Readable iff the ring holds data, writable iff it has free space
    #[must_use]
    pub fn poll_readiness(&self) -> Readiness {
        let state = self.state.lock();
        state.ring.as_ref().map_or_else(Readiness::default, |ring| Readiness {
            readable: !ring.is_empty(),
            writable: ring.space_free() > 0,
        })
    }

    /// Watch for events that may change readiness
    #[must_use]
    pub fn subscribe_readiness(&self, channel_capacity: usize) -> Option<ReadinessWatch> {
        let data = self.queue.subscribe(self.inq, channel_capacity, "poll.inq")?;
        let space = self.queue.subscribe(self.outq, channel_capacity, "poll.outq")?;
        Some(ReadinessWatch { data, space })
    }

    pub fn register_async_listener(&self, handle: Handle, callback: AsyncCallback) {
        self.listeners.register(handle, callback);
    }

    pub fn unregister_async_listener(&self, handle: Handle) -> bool {
        self.listeners.unregister(handle)
    }

    /// Bytes currently buffered
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.state.lock().ring.as_ref().map_or(0, Ring::occupied)
    }

    /// Bytes a write could add right now
    #[must_use]
    pub fn space_free(&self) -> usize {
        self.state.lock().ring.as_ref().map_or(0, Ring::space_free)
    }

    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.state.lock().ring.is_some()
    }

    /// (readers, writers)
    #[must_use]
    pub fn opener_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.nreaders, state.nwriters)
    }

    /// Drop the ring regardless of openers and wake every sleeper
    pub fn teardown(&self) {
        {
            let mut state = self.state.lock();
            state.ring = None;
        }
        self.queue.wake(self.inq, -1);
        self.queue.wake(self.outq, -1);
    }

    fn try_take(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock();
        let nwriters = state.nwriters;
        let ring = state.ring.as_mut().ok_or(DeviceError::BadHandle)?;
        if ring.is_empty() {
            if nwriters == 0 {
                return Err(DeviceError::EndOfStream);
            }
            return Ok(None);
        }
        Ok(Some(ring.take(buf)))
    }

    fn try_put(&self, data: &[u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock();
        let ring = state.ring.as_mut().ok_or(DeviceError::BadHandle)?;
        if ring.space_free() == 0 {
            return Ok(None);
        }
        Ok(Some(ring.put(data)))
    }

    /// Register on `queue` if `must_wait` still holds under the queue lock
    fn prepare_wait(
        &self,
        queue: Handle,
        debug_hint: &str,
        signal: &Signal,
        must_wait: fn(&PipeState) -> bool,
    ) -> Option<impl Future<Output = Result<()>> + Send> {
        let lock = self.queue.get_lock();
        if !must_wait(&self.state.lock()) {
            drop(lock);
            return None;
        }
        Some(self.queue.wait_interruptible(queue, debug_hint, lock, signal))
    }
}

impl Drop for ScullPipe {
    fn drop(&mut self) {
        self.queue.retire(self.inq);
        self.queue.retire(self.outq);
    }
}

impl fmt::Debug for ScullPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "ScullPipe(name={}, capacity={}, readers={}, writers={}, occupied={}, listeners={})",
            self.name,
            self.capacity,
            state.nreaders,
            state.nwriters,
            state.ring.as_ref().map_or(0, Ring::occupied),
            self.listeners.len()
        )
    }
}

/// Wakes an external poller when a pipe's readiness may have changed
pub struct ReadinessWatch {
    data: tokio::sync::broadcast::Receiver<WakeArg>,
    space: tokio::sync::broadcast::Receiver<WakeArg>,
}

impl ReadinessWatch {
    /// Resolve on the next data or space event.
    ///
    /// Returns `false` once the pipe is gone.
    pub async fn changed(&mut self) -> bool {
        use tokio::sync::broadcast::error::RecvError;

        let event = tokio::select! {
            event = self.data.recv() => event,
            event = self.space.recv() => event,
        };
        match event {
            Ok(arg) => arg >= 0,
            // Missed events still mean "something changed"
            Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => false,
        }
    }
}
