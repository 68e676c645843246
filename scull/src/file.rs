//! Open-file handles
//!
//! A handle is what a successful open hands back: the bound device, the
//! caller that opened it, its flags and (for stores) a file position.
//! Dropping a handle releases it.

use std::fmt;
use std::sync::Arc;

use crate::access::AccessDevice;
use crate::device::ScullDevice;
use crate::error::{DeviceError, Result};
use crate::fasync::AsyncCallback;
use crate::idgen::Handle;
use crate::pipe::{Readiness, ReadinessWatch, ScullPipe};
use crate::signal::Caller;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub mode: AccessMode,
    pub nonblocking: bool,
}

impl OpenFlags {
    #[must_use]
    pub fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            nonblocking: false,
        }
    }

    #[must_use]
    pub fn nonblocking(mut self) -> Self {
        self.nonblocking = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

// ============================================================================
// Store files
// ============================================================================

/// Handle on a sparse-store device
pub struct StoreFile {
    handle: Handle,
    access: Arc<AccessDevice>,
    device: Arc<ScullDevice>,
    caller: Caller,
    flags: OpenFlags,
    pos: u64,
    released: bool,
}

impl StoreFile {
    /// Pass admission on `access` and bind to the resulting store
    ///
    /// # Errors
    /// Whatever [`AccessDevice::try_open`] rejects with.
    pub async fn open(
        access: Arc<AccessDevice>,
        handle: Handle,
        caller: Caller,
        flags: OpenFlags,
    ) -> Result<Self> {
        let device = access
            .try_open(&caller, flags.mode, flags.nonblocking)
            .await?;
        Ok(Self {
            handle,
            access,
            device,
            caller,
            flags,
            pos: 0,
            released: false,
        })
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    #[must_use]
    pub fn device(&self) -> &Arc<ScullDevice> {
        &self.device
    }

    /// Read from the file position, at most one quantum's remainder.
    /// Returns 0 at end of data.
    ///
    /// # Errors
    /// `BadHandle` if released or opened write-only; `InvalidAddress` for
    /// an unaddressable position.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check(self.flags.mode.readable())?;
        let count = self.device.read(self.pos, buf)?;
        self.pos += count as u64;
        Ok(count)
    }

    /// Read from the file position until a zero-length read
    ///
    /// # Errors
    /// As [`Self::read`].
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; self.device.geometry().quantum];
        loop {
            let count = self.read(&mut chunk)?;
            if count == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..count]);
        }
    }

    /// Write at the file position, at most one quantum's remainder
    ///
    /// # Errors
    /// `BadHandle` if released or opened read-only; `OutOfMemory` or
    /// `InvalidAddress` from the store.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check(self.flags.mode.writable())?;
        let count = self.device.write(self.pos, data)?;
        self.pos += count as u64;
        Ok(count)
    }

    /// Loop [`Self::write`] until all of `data` is stored
    ///
    /// # Errors
    /// As [`Self::write`]; bytes written before the error stay written.
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let count = self.write(data)?;
            data = &data[count..];
        }
        Ok(())
    }

    /// Move the file position
    ///
    /// # Errors
    /// `InvalidArgument` if the target is negative or overflows.
    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64> {
        self.check(true)?;
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => self.pos,
            Whence::End => self.device.size(),
        };
        self.pos = base
            .checked_add_signed(offset)
            .ok_or(DeviceError::InvalidArgument)?;
        Ok(self.pos)
    }

    /// Give the handle back to the device's access policy. Never fails.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.access.on_close(&self.caller.credentials);
        log::debug!("{}: released {}", self.access.name(), self.handle);
    }

    fn check(&self, allowed: bool) -> Result<()> {
        if self.released || !allowed {
            return Err(DeviceError::BadHandle);
        }
        Ok(())
    }
}

impl Drop for StoreFile {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for StoreFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreFile(handle={}, device={}, mode={:?}, pos={}, released={})",
            self.handle,
            self.device.name(),
            self.flags.mode,
            self.pos,
            self.released
        )
    }
}

impl embedded_io::ErrorType for StoreFile {
    type Error = DeviceError;
}

impl embedded_io::Read for StoreFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        StoreFile::read(self, buf)
    }
}

impl embedded_io::Write for StoreFile {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        StoreFile::write(self, buf)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl embedded_io::Seek for StoreFile {
    fn seek(&mut self, pos: embedded_io::SeekFrom) -> Result<u64> {
        match pos {
            embedded_io::SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset).map_err(|_| DeviceError::InvalidArgument)?;
                StoreFile::seek(self, Whence::Start, offset)
            }
            embedded_io::SeekFrom::Current(offset) => StoreFile::seek(self, Whence::Current, offset),
            embedded_io::SeekFrom::End(offset) => StoreFile::seek(self, Whence::End, offset),
        }
    }
}

// ============================================================================
// Pipe files
// ============================================================================

/// Handle on a pipe device. Not seekable.
pub struct PipeFile {
    handle: Handle,
    pipe: Arc<ScullPipe>,
    caller: Caller,
    flags: OpenFlags,
    released: bool,
}

impl PipeFile {
    /// # Errors
    /// `OutOfMemory` if this is the first opener and the ring cannot be allocated.
    pub fn open(pipe: Arc<ScullPipe>, handle: Handle, caller: Caller, flags: OpenFlags) -> Result<Self> {
        pipe.open(flags.mode)?;
        Ok(Self {
            handle,
            pipe,
            caller,
            flags,
            released: false,
        })
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    #[must_use]
    pub fn pipe(&self) -> &Arc<ScullPipe> {
        &self.pipe
    }

    /// Change the default blocking mode of later calls
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.flags.nonblocking = nonblocking;
    }

    /// Read using the handle's blocking mode
    ///
    /// # Errors
    /// See [`ScullPipe::read`]; `BadHandle` if released or write-only.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_with(buf, self.flags.nonblocking).await
    }

    /// Read without ever sleeping
    ///
    /// # Errors
    /// As [`Self::read`], `WouldBlock` when empty.
    pub async fn try_read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_with(buf, true).await
    }

    /// Write using the handle's blocking mode
    ///
    /// # Errors
    /// See [`ScullPipe::write`]; `BadHandle` if released or read-only.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.write_with(data, self.flags.nonblocking).await
    }

    /// Write without ever sleeping
    ///
    /// # Errors
    /// As [`Self::write`], `WouldBlock` when full.
    pub async fn try_write(&mut self, data: &[u8]) -> Result<usize> {
        self.write_with(data, true).await
    }

    /// Loop [`Self::write`] until all of `data` is in the pipe
    ///
    /// # Errors
    /// As [`Self::write`]; bytes accepted before the error stay in the pipe.
    pub async fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let count = self.write(data).await?;
            data = &data[count..];
        }
        Ok(())
    }

    /// # Errors
    /// `BadHandle` if released.
    pub fn poll_readiness(&self) -> Result<Readiness> {
        self.check(true)?;
        Ok(self.pipe.poll_readiness())
    }

    /// # Errors
    /// `BadHandle` if released.
    pub fn subscribe_readiness(&self, channel_capacity: usize) -> Result<Option<ReadinessWatch>> {
        self.check(true)?;
        Ok(self.pipe.subscribe_readiness(channel_capacity))
    }

    /// Be told about every successful write, from any writer
    ///
    /// # Errors
    /// `BadHandle` if released.
    pub fn register_async_listener(&self, callback: AsyncCallback) -> Result<()> {
        self.check(true)?;
        self.pipe.register_async_listener(self.handle, callback);
        Ok(())
    }

    pub fn unregister_async_listener(&self) -> bool {
        self.pipe.unregister_async_listener(self.handle)
    }

    /// # Errors
    /// Always `InvalidArgument`: pipes have no position.
    pub fn seek(&mut self, _whence: Whence, _offset: i64) -> Result<u64> {
        Err(DeviceError::InvalidArgument)
    }

    /// Drop the listener and the opener count. Never fails.
    pub fn release(mut self) {
        self.release_inner();
    }

    async fn read_with(&mut self, buf: &mut [u8], nonblocking: bool) -> Result<usize> {
        self.check(self.flags.mode.readable())?;
        self.pipe.read(buf, nonblocking, &self.caller.signal).await
    }

    async fn write_with(&mut self, data: &[u8], nonblocking: bool) -> Result<usize> {
        self.check(self.flags.mode.writable())?;
        self.pipe.write(data, nonblocking, &self.caller.signal).await
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pipe.unregister_async_listener(self.handle);
        self.pipe.close(self.flags.mode);
        log::debug!("{}: released {}", self.pipe.name(), self.handle);
    }

    fn check(&self, allowed: bool) -> Result<()> {
        if self.released || !allowed {
            return Err(DeviceError::BadHandle);
        }
        Ok(())
    }
}

impl Drop for PipeFile {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for PipeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PipeFile(handle={}, pipe={}, flags={:?}, released={})",
            self.handle,
            self.pipe.name(),
            self.flags,
            self.released
        )
    }
}

impl embedded_io_async::ErrorType for PipeFile {
    type Error = DeviceError;
}

impl embedded_io_async::Read for PipeFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match PipeFile::read(self, buf).await {
            Err(DeviceError::EndOfStream) => Ok(0),
            other => other,
        }
    }
}

impl embedded_io_async::Write for PipeFile {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        PipeFile::write(self, buf).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
