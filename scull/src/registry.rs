//! Device registry
//!
//! Owns every device instance, assigns device numbers and routes opens.
//! Minor numbers are handed out in this order:
//!
//! ```text
//!  scull0 .. scull{nr_devs-1}            Unrestricted stores
//!  scullpipe0 .. scullpipe{nr_pipe-1}    bounded pipes
//!  scullsingle                           Exclusive
//!  sculluid                              ConcurrentByOwner
//!  scullwuid                             BlockingByOwner
//!  scullpriv                             KeyedPerClient
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::access::{AccessDevice, AccessPolicy};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::fasync::AsyncCallback;
use crate::file::{OpenFlags, PipeFile, StoreFile, Whence};
use crate::idgen::{Handle, IdGen};
use crate::pipe::{Readiness, ScullPipe};
use crate::signal::Caller;
use crate::sparse::Geometry;
use crate::wait_queue::WaitQueueArc;

/// Names and policies of the access-controlled devices
pub const ACCESS_DEVICES: [(&str, AccessPolicy); 4] = [
    ("scullsingle", AccessPolicy::Exclusive),
    ("sculluid", AccessPolicy::ConcurrentByOwner),
    ("scullwuid", AccessPolicy::BlockingByOwner),
    ("scullpriv", AccessPolicy::KeyedPerClient),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for DevNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone)]
pub enum DeviceKind {
    Store(Arc<AccessDevice>),
    Pipe(Arc<ScullPipe>),
}

#[derive(Debug)]
struct Entry {
    name: String,
    devnum: DevNum,
    kind: DeviceKind,
}

pub struct DeviceRegistry {
    config: DeviceConfig,
    idgen: Arc<IdGen>,
    entries: Vec<Entry>,
}

impl DeviceRegistry {
    /// Build every device the config describes
    ///
    /// # Errors
    /// `InvalidArgument` if the config fails validation.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;

        let idgen = Arc::new(IdGen::new());
        let queue = WaitQueueArc::new();
        let geometry = Geometry {
            quantum: config.quantum,
            qset: config.qset,
        };
        let major = config.major();

        let mut kinds: Vec<(String, DeviceKind)> = Vec::new();
        for i in 0..config.nr_devs {
            let name = format!("scull{i}");
            let device = AccessDevice::new(&name, AccessPolicy::Unrestricted, geometry, queue.clone(), &idgen);
            kinds.push((name, DeviceKind::Store(Arc::new(device))));
        }
        for i in 0..config.nr_pipe_devs {
            let name = format!("scullpipe{i}");
            let pipe = ScullPipe::new(&name, config.pipe_buffer, queue.clone(), &idgen);
            kinds.push((name, DeviceKind::Pipe(Arc::new(pipe))));
        }
        for (name, policy) in ACCESS_DEVICES {
            let device = AccessDevice::new(name, policy, geometry, queue.clone(), &idgen);
            kinds.push((name.to_string(), DeviceKind::Store(Arc::new(device))));
        }

        let entries: Vec<Entry> = kinds
            .into_iter()
            .zip(0u32..)
            .map(|((name, kind), minor)| {
                let devnum = DevNum { major, minor };
                info!(%devnum, name = %name, "registered device");
                Entry { name, devnum, kind }
            })
            .collect();

        Ok(Self {
            config,
            idgen,
            entries,
        })
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Device names in minor-number order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<DevNum> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.devnum)
    }

    /// # Errors
    /// `NoSuchDevice` for an unknown name.
    pub fn device(&self, name: &str) -> Result<&DeviceKind> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &e.kind)
            .ok_or(DeviceError::NoSuchDevice)
    }

    /// # Errors
    /// `NoSuchDevice` for an unknown number.
    pub fn device_by_number(&self, devnum: DevNum) -> Result<&DeviceKind> {
        self.entries
            .iter()
            .find(|e| e.devnum == devnum)
            .map(|e| &e.kind)
            .ok_or(DeviceError::NoSuchDevice)
    }

    /// Open a device by name
    ///
    /// # Errors
    /// `NoSuchDevice`, or whatever the device's admission rejects with.
    pub async fn open(&self, name: &str, caller: &Caller, flags: OpenFlags) -> Result<OpenFile> {
        let kind = self.device(name)?.clone();
        self.open_kind(kind, caller, flags).await
    }

    /// Open a device by number
    ///
    /// # Errors
    /// As [`Self::open`].
    pub async fn open_devnum(&self, devnum: DevNum, caller: &Caller, flags: OpenFlags) -> Result<OpenFile> {
        let kind = self.device_by_number(devnum)?.clone();
        self.open_kind(kind, caller, flags).await
    }

    /// Trim every store and drop every pipe ring
    pub fn shutdown(&self) {
        for entry in &self.entries {
            match &entry.kind {
                DeviceKind::Store(access) => access.trim_all(),
                DeviceKind::Pipe(pipe) => pipe.teardown(),
            }
            debug!(devnum = %entry.devnum, name = %entry.name, "device torn down");
        }
        info!(count = self.entries.len(), "registry shut down");
    }

    async fn open_kind(&self, kind: DeviceKind, caller: &Caller, flags: OpenFlags) -> Result<OpenFile> {
        let handle = self.idgen.next_handle();
        match kind {
            DeviceKind::Store(access) => {
                let file = StoreFile::open(access, handle, caller.clone(), flags).await?;
                Ok(OpenFile::Store(file))
            }
            DeviceKind::Pipe(pipe) => {
                let file = PipeFile::open(pipe, handle, caller.clone(), flags)?;
                Ok(OpenFile::Pipe(file))
            }
        }
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("config", &self.config)
            .field("devices", &self.entries.len())
            .finish()
    }
}

/// Any open handle, as the dispatch table sees it
#[derive(Debug)]
pub enum OpenFile {
    Store(StoreFile),
    Pipe(PipeFile),
}

impl OpenFile {
    #[must_use]
    pub fn handle(&self) -> Handle {
        match self {
            Self::Store(file) => file.handle(),
            Self::Pipe(file) => file.handle(),
        }
    }

    /// # Errors
    /// Device-specific; a pipe read may sleep.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Store(file) => file.read(buf),
            Self::Pipe(file) => file.read(buf).await,
        }
    }

    /// # Errors
    /// Device-specific; a pipe write may sleep.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self {
            Self::Store(file) => file.write(data),
            Self::Pipe(file) => file.write(data).await,
        }
    }

    /// # Errors
    /// `InvalidArgument` for pipes and for bad targets.
    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64> {
        match self {
            Self::Store(file) => file.seek(whence, offset),
            Self::Pipe(file) => file.seek(whence, offset),
        }
    }

    /// Stores are always ready, like a device without a poll method
    ///
    /// # Errors
    /// `BadHandle` if released.
    pub fn poll_readiness(&self) -> Result<Readiness> {
        match self {
            Self::Store(_) => Ok(Readiness {
                readable: true,
                writable: true,
            }),
            Self::Pipe(file) => file.poll_readiness(),
        }
    }

    /// # Errors
    /// `InvalidArgument` for stores, which have no async notification.
    pub fn register_async_listener(&self, callback: AsyncCallback) -> Result<()> {
        match self {
            Self::Store(_) => Err(DeviceError::InvalidArgument),
            Self::Pipe(file) => file.register_async_listener(callback),
        }
    }

    pub fn unregister_async_listener(&self) -> bool {
        match self {
            Self::Store(_) => false,
            Self::Pipe(file) => file.unregister_async_listener(),
        }
    }

    pub fn release(self) {
        match self {
            Self::Store(file) => file.release(),
            Self::Pipe(file) => file.release(),
        }
    }

    #[must_use]
    pub fn into_store(self) -> Option<StoreFile> {
        match self {
            Self::Store(file) => Some(file),
            Self::Pipe(_) => None,
        }
    }

    #[must_use]
    pub fn into_pipe(self) -> Option<PipeFile> {
        match self {
            Self::Pipe(file) => Some(file),
            Self::Store(_) => None,
        }
    }
}
