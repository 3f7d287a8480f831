//! Page-protected storage for key material.
//!
//! A [`SecureBuffer`] owns its own anonymous mapping, locked into RAM where the
//! platform allows it. The protection state is explicit: at rest, secrets sit
//! at [`MemoryState::NoAccess`] and the bytes are only reachable through one of
//! the scoped views:
//!
//! - [`ReadView`]: lifts the protection to read-only for its lifetime.
//! - [`WriteView`]: lifts the protection to read-write for its lifetime.
//! - [`StateGuard`]: an arbitrary temporary state with a configurable final
//!   state, released on drop or explicitly.
//!
//! Every view restores the previous state when dropped, panics included.
//! Platforms without `mprotect` fall back to a heap buffer whose state is only
//! tracked, so the API contract stays the same everywhere.

use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use base64::{engine::general_purpose, Engine as _};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryState {
    Unallocated,
    NoAccess,
    ReadOnly,
    ReadWrite,
}

impl MemoryState {
    fn is_readable(self) -> bool {
        matches!(self, MemoryState::ReadOnly | MemoryState::ReadWrite)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Secure allocation of {0} bytes failed")]
    AllocationFailed(usize),

    #[error("Changing memory protection to {0:?} failed")]
    ProtectFailed(MemoryState),

    #[error("Secure buffer is not allocated")]
    Unallocated,

    #[error("Unallocated cannot be set as a state, use deallocate() instead")]
    InvalidTarget,

    #[error("Secure buffer is {0:?}, the requested access is not permitted")]
    AccessDenied(MemoryState),

    #[error("Invalid base64 key material: {0}")]
    Base64(String),
}

#[cfg(unix)]
mod sys {
    use super::{MemoryError, MemoryState};
    use std::ptr::NonNull;

    pub(super) struct Region {
        ptr: NonNull<u8>,
        mapped: usize,
    }

    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    impl Region {
        pub(super) fn map(len: usize) -> Result<Self, MemoryError> {
            let page = page_size();
            let mapped = len
                .max(1)
                .checked_add(page - 1)
                .map(|n| n / page * page)
                .ok_or(MemoryError::AllocationFailed(len))?;

            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mapped,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(MemoryError::AllocationFailed(len));
            }
            if unsafe { libc::mlock(raw, mapped) } != 0 {
                // RLIMIT_MEMLOCK exhausted; the pages stay swappable.
                tracing::debug!(bytes = mapped, "mlock refused for secure buffer");
            }
            let ptr = NonNull::new(raw.cast::<u8>()).ok_or(MemoryError::AllocationFailed(len))?;
            Ok(Self { ptr, mapped })
        }

        pub(super) fn protect(&self, state: MemoryState) -> Result<(), MemoryError> {
            let prot = match state {
                MemoryState::NoAccess => libc::PROT_NONE,
                MemoryState::ReadOnly => libc::PROT_READ,
                MemoryState::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
                MemoryState::Unallocated => return Err(MemoryError::InvalidTarget),
            };
            let rc = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.mapped, prot) };
            if rc == 0 {
                Ok(())
            } else {
                Err(MemoryError::ProtectFailed(state))
            }
        }

        pub(super) fn as_ptr(&self) -> *mut u8 {
            self.ptr.as_ptr()
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe {
                libc::munlock(self.ptr.as_ptr().cast(), self.mapped);
                libc::munmap(self.ptr.as_ptr().cast(), self.mapped);
            }
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use super::{MemoryError, MemoryState};

    pub(super) struct Region {
        ptr: *mut u8,
        mapped: usize,
    }

    impl Region {
        pub(super) fn map(len: usize) -> Result<Self, MemoryError> {
            let mapped = len.max(1);
            let buf = vec![0u8; mapped].into_boxed_slice();
            Ok(Self {
                ptr: Box::into_raw(buf).cast::<u8>(),
                mapped,
            })
        }

        pub(super) fn protect(&self, state: MemoryState) -> Result<(), MemoryError> {
            match state {
                MemoryState::Unallocated => Err(MemoryError::InvalidTarget),
                _ => Ok(()),
            }
        }

        pub(super) fn as_ptr(&self) -> *mut u8 {
            self.ptr
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr, self.mapped);
            drop(unsafe { Box::from_raw(slice) });
        }
    }
}

/// Secret bytes behind explicit memory protection.
///
/// Reading goes through [`SecureBuffer::read`], which works from `&self` so
/// that secrets held in shared structures (e.g. a registry) can be transmitted
/// without copying them out first. Concurrent read views share one unlock; the
/// last one to drop puts the previous protection back.
pub struct SecureBuffer {
    region: Option<sys::Region>,
    len: usize,
    state: Cell<MemoryState>,
    readers: Cell<usize>,
    restore: Cell<MemoryState>,
}

// The mapping is exclusively owned; `Cell` already keeps the type `!Sync`.
unsafe impl Send for SecureBuffer {}

impl SecureBuffer {
    pub const fn new() -> Self {
        Self {
            region: None,
            len: 0,
            state: Cell::new(MemoryState::Unallocated),
            readers: Cell::new(0),
            restore: Cell::new(MemoryState::Unallocated),
        }
    }

    pub fn with_len(len: usize, state: MemoryState) -> Result<Self, MemoryError> {
        let mut buffer = Self::new();
        buffer.allocate(len, state)?;
        Ok(buffer)
    }

    pub fn from_slice(bytes: &[u8], state: MemoryState) -> Result<Self, MemoryError> {
        let mut buffer = Self::with_len(bytes.len(), MemoryState::ReadWrite)?;
        buffer.write()?.copy_from_slice(bytes);
        buffer.set_state(state)?;
        Ok(buffer)
    }

    pub fn from_base64(encoded: &str, state: MemoryState) -> Result<Self, MemoryError> {
        let decoded = Zeroizing::new(
            general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| MemoryError::Base64(e.to_string()))?,
        );
        Self::from_slice(&decoded, state)
    }

    /// Releases any previous allocation and maps a zeroed region of `len` bytes.
    pub fn allocate(&mut self, len: usize, state: MemoryState) -> Result<(), MemoryError> {
        if state == MemoryState::Unallocated {
            return Err(MemoryError::InvalidTarget);
        }
        self.deallocate();
        self.region = Some(sys::Region::map(len)?);
        self.len = len;
        self.state.set(MemoryState::ReadWrite);
        if let Err(err) = self.set_state(state) {
            self.deallocate();
            return Err(err);
        }
        Ok(())
    }

    /// Zeroes and unmaps the buffer. Safe to call on an unallocated buffer.
    pub fn deallocate(&mut self) {
        let Some(region) = self.region.take() else {
            return;
        };
        if self.state.get() == MemoryState::ReadWrite || region.protect(MemoryState::ReadWrite).is_ok() {
            unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), self.len) }.zeroize();
        } else {
            tracing::error!("could not unprotect secure buffer for zeroing, unmapping as is");
        }
        drop(region);
        self.len = 0;
        self.readers.set(0);
        self.state.set(MemoryState::Unallocated);
        self.restore.set(MemoryState::Unallocated);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_allocated(&self) -> bool {
        self.region.is_some()
    }

    pub fn state(&self) -> MemoryState {
        self.state.get()
    }

    /// Changes the resting protection. On failure the state is left unchanged.
    pub fn set_state(&mut self, state: MemoryState) -> Result<(), MemoryError> {
        if state == MemoryState::Unallocated {
            return Err(MemoryError::InvalidTarget);
        }
        let region = self.region.as_ref().ok_or(MemoryError::Unallocated)?;
        if self.state.get() == state {
            return Ok(());
        }
        region.protect(state)?;
        self.state.set(state);
        Ok(())
    }

    pub fn make_no_access(&mut self) -> Result<(), MemoryError> {
        self.set_state(MemoryState::NoAccess)
    }

    pub fn make_read_only(&mut self) -> Result<(), MemoryError> {
        self.set_state(MemoryState::ReadOnly)
    }

    pub fn make_read_write(&mut self) -> Result<(), MemoryError> {
        self.set_state(MemoryState::ReadWrite)
    }

    pub fn read(&self) -> Result<ReadView<'_>, MemoryError> {
        let region = self.region.as_ref().ok_or(MemoryError::Unallocated)?;
        if self.readers.get() == 0 {
            let current = self.state.get();
            if !current.is_readable() {
                region.protect(MemoryState::ReadOnly)?;
                self.state.set(MemoryState::ReadOnly);
            }
            self.restore.set(current);
        }
        self.readers.set(self.readers.get() + 1);
        Ok(ReadView { buffer: self })
    }

    pub fn write(&mut self) -> Result<WriteView<'_>, MemoryError> {
        let previous = self.state.get();
        self.set_state(MemoryState::ReadWrite)?;
        Ok(WriteView {
            buffer: self,
            restore: previous,
        })
    }

    /// Temporarily switches to `state`; the previous state comes back on drop.
    pub fn scoped(&mut self, state: MemoryState) -> Result<StateGuard<'_>, MemoryError> {
        let previous = self.state.get();
        self.scoped_with_final(state, previous)
    }

    /// Temporarily switches to `state` and lands on `final_state` on drop.
    pub fn scoped_with_final(
        &mut self,
        state: MemoryState,
        final_state: MemoryState,
    ) -> Result<StateGuard<'_>, MemoryError> {
        if final_state == MemoryState::Unallocated {
            return Err(MemoryError::InvalidTarget);
        }
        self.set_state(state)?;
        Ok(StateGuard {
            buffer: Some(self),
            final_state,
        })
    }

    /// Little-endian increment with carry over the whole buffer.
    pub fn increment(&mut self) -> Result<(), MemoryError> {
        let mut view = self.write()?;
        for byte in view.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
        Ok(())
    }

    pub fn to_base64(&self) -> Result<String, MemoryError> {
        let view = self.read()?;
        Ok(general_purpose::STANDARD.encode(view.as_slice()))
    }

    /// Deep copy into a fresh allocation that ends in the same state as `self`.
    pub fn try_clone(&self) -> Result<Self, MemoryError> {
        if !self.is_allocated() {
            return Ok(Self::new());
        }
        let mut copy = {
            let view = self.read()?;
            Self::from_slice(view.as_slice(), MemoryState::ReadWrite)?
        };
        copy.set_state(self.state.get())?;
        Ok(copy)
    }

    fn bytes(&self) -> &[u8] {
        match &self.region {
            Some(region) => unsafe { std::slice::from_raw_parts(region.as_ptr(), self.len) },
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &self.region {
            Some(region) => unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl Default for SecureBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.deallocate();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.len)
            .field("state", &self.state.get())
            .finish()
    }
}

impl PartialEq for SecureBuffer {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        match (self.is_allocated(), other.is_allocated()) {
            (false, false) => true,
            (true, true) => match (self.read(), other.read()) {
                (Ok(a), Ok(b)) => a.as_slice().ct_eq(b.as_slice()).into(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl Eq for SecureBuffer {}

pub struct ReadView<'a> {
    buffer: &'a SecureBuffer,
}

impl ReadView<'_> {
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.bytes()
    }
}

impl Deref for ReadView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for ReadView<'_> {
    fn drop(&mut self) {
        let buffer = self.buffer;
        let left = buffer.readers.get().saturating_sub(1);
        buffer.readers.set(left);
        if left > 0 {
            return;
        }
        let target = buffer.restore.get();
        if target == buffer.state.get() || target == MemoryState::Unallocated {
            return;
        }
        if let Some(region) = &buffer.region {
            match region.protect(target) {
                Ok(()) => buffer.state.set(target),
                Err(err) => tracing::error!(error = %err, "failed to restore buffer protection"),
            }
        }
    }
}

pub struct WriteView<'a> {
    buffer: &'a mut SecureBuffer,
    restore: MemoryState,
}

impl WriteView<'_> {
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.bytes()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.bytes_mut()
    }
}

impl Deref for WriteView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for WriteView<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for WriteView<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.buffer.set_state(self.restore) {
            tracing::error!(error = %err, "failed to restore buffer protection");
        }
    }
}

/// Scoped protection override, see [`SecureBuffer::scoped`].
pub struct StateGuard<'a> {
    buffer: Option<&'a mut SecureBuffer>,
    final_state: MemoryState,
}

impl StateGuard<'_> {
    pub fn set_final_state(&mut self, final_state: MemoryState) -> Result<(), MemoryError> {
        if final_state == MemoryState::Unallocated {
            return Err(MemoryError::InvalidTarget);
        }
        self.final_state = final_state;
        Ok(())
    }

    pub fn state(&self) -> MemoryState {
        self.buffer
            .as_ref()
            .map_or(MemoryState::Unallocated, |buffer| buffer.state())
    }

    pub fn bytes(&self) -> Result<&[u8], MemoryError> {
        let buffer = self.buffer.as_deref().ok_or(MemoryError::Unallocated)?;
        if buffer.state().is_readable() {
            Ok(buffer.bytes())
        } else {
            Err(MemoryError::AccessDenied(buffer.state()))
        }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8], MemoryError> {
        let buffer = self.buffer.as_deref_mut().ok_or(MemoryError::Unallocated)?;
        if buffer.state() == MemoryState::ReadWrite {
            Ok(buffer.bytes_mut())
        } else {
            Err(MemoryError::AccessDenied(buffer.state()))
        }
    }

    /// Applies the final state now instead of on drop.
    pub fn release(mut self) -> Result<(), MemoryError> {
        match self.buffer.take() {
            Some(buffer) => buffer.set_state(self.final_state),
            None => Ok(()),
        }
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(err) = buffer.set_state(self.final_state) {
                tracing::error!(error = %err, "failed to restore buffer protection");
            }
        }
    }
}
