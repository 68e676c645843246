//! In-memory character devices
//!
//! Three device families share one open/read/write/release model:
//! - sparse stores that grow by quantum as they are written
//! - access-controlled stores (exclusive, per-owner, blocking per-owner,
//!   per-session)
//! - bounded pipes with blocking I/O, readiness polling and async
//!   "data available" listeners
//!
//! [`DeviceRegistry`] owns the instances and hands out [`OpenFile`] handles.

pub mod access;
pub mod config;
pub mod device;
pub mod error;
pub mod fasync;
pub mod file;
pub mod idgen;
pub mod keyed;
pub mod pipe;
pub mod registry;
pub mod signal;
pub mod sparse;
pub mod wait_queue;

// Re-export error types for convenience
pub use error::{DeviceError, Result};

// Re-export configuration
pub use config::DeviceConfig;

// Re-export handle types
pub use idgen::{Handle, IdGen, WakeArg};

// Re-export device types
pub use access::{owner_admits, AccessDevice, AccessPolicy, Credentials, SessionKey};
pub use device::ScullDevice;
pub use keyed::KeyedStores;
pub use pipe::{Readiness, ReadinessWatch, ScullPipe};
pub use sparse::{Geometry, SparseStore};

// Re-export open-file types
pub use fasync::{AsyncCallback, AsyncEvent, AsyncListeners};
pub use file::{AccessMode, OpenFlags, PipeFile, StoreFile, Whence};
pub use signal::{Caller, Signal};

// Re-export the registry
pub use registry::{DevNum, DeviceKind, DeviceRegistry, OpenFile, ACCESS_DEVICES};

pub use wait_queue::WaitQueueArc;
