//! Admission control for sparse-store devices
//!
//! Each [`AccessDevice`] pairs a policy with the store(s) it guards and
//! decides whether an open proceeds, fails, or waits.
//!
//! | policy              | on conflict                         |
//! |---------------------|-------------------------------------|
//! | `Unrestricted`      | never conflicts                     |
//! | `Exclusive`         | `Busy`                              |
//! | `ConcurrentByOwner` | `Busy`                              |
//! | `BlockingByOwner`   | waits (or `WouldBlock` if nonblocking) |
//! | `KeyedPerClient`    | never conflicts, store per session  |
//!
//! Every policy truncates the store when it is opened write-only.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::device::ScullDevice;
use crate::error::{DeviceError, Result};
use crate::file::AccessMode;
use crate::idgen::{Handle, IdGen};
use crate::keyed::KeyedStores;
use crate::signal::Caller;
use crate::sparse::Geometry;
use crate::wait_queue::WaitQueueArc;

/// Key of a per-client store, e.g. the caller's controlling terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Who is opening a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    /// Bypasses owner checks
    pub override_privilege: bool,
    pub session: Option<SessionKey>,
}

impl Credentials {
    #[must_use]
    pub fn user(uid: u32) -> Self {
        Self {
            uid,
            euid: uid,
            override_privilege: false,
            session: None,
        }
    }

    #[must_use]
    pub fn with_euid(mut self, euid: u32) -> Self {
        self.euid = euid;
        self
    }

    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.override_privilege = true;
        self
    }

    #[must_use]
    pub fn with_session(mut self, key: SessionKey) -> Self {
        self.session = Some(key);
        self
    }
}

/// True if `credentials` may join a device currently owned by `owner`
#[must_use]
pub fn owner_admits(owner: u32, credentials: &Credentials) -> bool {
    owner == credentials.uid || owner == credentials.euid || credentials.override_privilege
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    Unrestricted,
    Exclusive,
    ConcurrentByOwner,
    BlockingByOwner,
    KeyedPerClient,
}

#[derive(Debug, Default)]
struct Occupancy {
    count: usize,
    owner: Option<u32>,
}

impl Occupancy {
    fn admits(&self, credentials: &Credentials) -> bool {
        match self.owner {
            _ if self.count == 0 => true,
            Some(owner) => owner_admits(owner, credentials),
            None => credentials.override_privilege,
        }
    }
}

enum Backing {
    Single(Arc<ScullDevice>),
    Keyed(KeyedStores),
}

pub struct AccessDevice {
    name: String,
    policy: AccessPolicy,
    backing: Backing,
    occupancy: Mutex<Occupancy>,
    queue: WaitQueueArc,
    /// Woken when a `BlockingByOwner` device drops to zero openers
    released: Handle,
}

impl AccessDevice {
    #[must_use]
    pub fn new(
        name: &str,
        policy: AccessPolicy,
        geometry: Geometry,
        queue: WaitQueueArc,
        idgen: &IdGen,
    ) -> Self {
        let backing = match policy {
            AccessPolicy::KeyedPerClient => Backing::Keyed(KeyedStores::new(name, geometry)),
            _ => Backing::Single(Arc::new(ScullDevice::new(name, geometry))),
        };
        let released = idgen.next_handle();
        queue.register(released, &format!("{name}.released"));

        Self {
            name: name.to_string(),
            policy,
            backing,
            occupancy: Mutex::new(Occupancy::default()),
            queue,
            released,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    #[must_use]
    pub fn opener_count(&self) -> usize {
        self.occupancy.lock().count
    }

    #[must_use]
    pub fn owner(&self) -> Option<u32> {
        self.occupancy.lock().owner
    }

    /// The shared store, or `None` for a keyed device
    #[must_use]
    pub fn device(&self) -> Option<&Arc<ScullDevice>> {
        match &self.backing {
            Backing::Single(device) => Some(device),
            Backing::Keyed(_) => None,
        }
    }

    /// The per-session map, for a keyed device
    #[must_use]
    pub fn keyed(&self) -> Option<&KeyedStores> {
        match &self.backing {
            Backing::Keyed(stores) => Some(stores),
            Backing::Single(_) => None,
        }
    }

    /// Admit `caller` and return the store it is bound to.
    ///
    /// # Errors
    /// - `Busy`: `Exclusive`/`ConcurrentByOwner` conflict
    /// - `WouldBlock`: `BlockingByOwner` conflict with `nonblocking`
    /// - `Interrupted`: the caller's signal fired while waiting
    /// - `InvalidArgument`: `KeyedPerClient` without a session key
    /// - `OutOfMemory`: keyed entry could not be created
    pub async fn try_open(
        &self,
        caller: &Caller,
        mode: AccessMode,
        nonblocking: bool,
    ) -> Result<Arc<ScullDevice>> {
        let credentials = &caller.credentials;
        let device = match self.policy {
            AccessPolicy::Unrestricted => self.single()?,
            AccessPolicy::Exclusive => {
                self.claim_exclusive()?;
                self.single()?
            }
            AccessPolicy::ConcurrentByOwner => {
                if !self.claim_owned(credentials) {
                    return Err(DeviceError::Busy);
                }
                self.single()?
            }
            AccessPolicy::BlockingByOwner => {
                while !self.claim_owned(credentials) {
                    if nonblocking {
                        return Err(DeviceError::WouldBlock);
                    }
                    log::debug!("{}: uid {} waiting for owner to leave", self.name, credentials.uid);
                    if let Some(wait) = self.prepare_wait(caller) {
                        wait.await?;
                    }
                }
                self.single()?
            }
            AccessPolicy::KeyedPerClient => {
                let key = credentials.session.ok_or_else(|| {
                    log::debug!("{}: uid {} has no session key", self.name, credentials.uid);
                    DeviceError::InvalidArgument
                })?;
                match &self.backing {
                    Backing::Keyed(stores) => stores.lookup_or_create(key)?,
                    Backing::Single(device) => Arc::clone(device),
                }
            }
        };

        if mode == AccessMode::WriteOnly {
            device.trim();
        }
        Ok(device)
    }

    /// Undo one successful `try_open`. Never fails.
    pub fn on_close(&self, credentials: &Credentials) {
        match self.policy {
            AccessPolicy::Unrestricted | AccessPolicy::KeyedPerClient => {}
            AccessPolicy::Exclusive => {
                let mut occupancy = self.occupancy.lock();
                debug_assert_eq!(occupancy.count, 1, "exclusive close without open");
                if occupancy.count != 1 {
                    log::warn!("{}: exclusive close with count {}", self.name, occupancy.count);
                }
                occupancy.count = 0;
            }
            AccessPolicy::ConcurrentByOwner | AccessPolicy::BlockingByOwner => {
                let remaining = {
                    let mut occupancy = self.occupancy.lock();
                    debug_assert!(occupancy.count > 0, "owner close without open");
                    if occupancy.count == 0 {
                        log::warn!("{}: close by uid {} with no openers", self.name, credentials.uid);
                    }
                    occupancy.count = occupancy.count.saturating_sub(1);
                    if occupancy.count == 0 {
                        occupancy.owner = None;
                    }
                    occupancy.count
                };

                if remaining == 0 && self.policy == AccessPolicy::BlockingByOwner {
                    // Everyone rechecks; not all of them will get in
                    self.queue.wake(self.released, 0);
                }
            }
        }
    }

    /// Trim every store this device owns
    pub fn trim_all(&self) {
        match &self.backing {
            Backing::Single(device) => device.trim(),
            Backing::Keyed(stores) => stores.destroy(),
        }
    }

    fn single(&self) -> Result<Arc<ScullDevice>> {
        match &self.backing {
            Backing::Single(device) => Ok(Arc::clone(device)),
            Backing::Keyed(_) => Err(DeviceError::InvalidArgument),
        }
    }

    fn claim_exclusive(&self) -> Result<()> {
        let mut occupancy = self.occupancy.lock();
        if occupancy.count != 0 {
            return Err(DeviceError::Busy);
        }
        occupancy.count = 1;
        Ok(())
    }

    fn claim_owned(&self, credentials: &Credentials) -> bool {
        let mut occupancy = self.occupancy.lock();
        if !occupancy.admits(credentials) {
            return false;
        }
        if occupancy.count == 0 {
            occupancy.owner = Some(credentials.uid);
        }
        occupancy.count += 1;
        true
    }

    /// Register on the release queue if the caller still cannot get in.
    ///
    /// The guard never reaches the async caller's frame.
    fn prepare_wait(&self, caller: &Caller) -> Option<impl Future<Output = Result<()>> + Send> {
        let lock = self.queue.get_lock();
        if self.occupancy.lock().admits(&caller.credentials) {
            drop(lock);
            return None;
        }
        Some(
            self.queue
                .wait_interruptible(self.released, "opener", lock, &caller.signal),
        )
    }
}

impl Drop for AccessDevice {
    fn drop(&mut self) {
        self.queue.retire(self.released);
    }
}

impl fmt::Debug for AccessDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let occupancy = self.occupancy.lock();
        write!(
            f,
            "AccessDevice(name={}, policy={:?}, count={}, owner={:?})",
            self.name, self.policy, occupancy.count, occupancy.owner
        )
    }
}
