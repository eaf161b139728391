//! Byte buffers and their address identity
//!
//! A `ByteBuffer` is the currency for arguments and return values. It either
//! owns its bytes (ephemeral identity: the address is whatever the current
//! storage happens to be) or views arena memory (stable identity: the address
//! is fixed until the owning allocation is freed).
//!
//! # Safety
//!
//! Ephemeral contents are always safe to read. Dereferencing a stable view is
//! `unsafe`: the caller guarantees the backing allocation has not been freed.
//! Violations are undefined behavior, not reportable errors.

use crate::error::{FfiError, FfiResult};
use crate::types::TypeDescriptor;
use std::ptr::NonNull;

/// Whether a buffer's address can be relied on across observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressIdentity {
    /// Address unspecified; may differ between observations
    Ephemeral,
    /// Arena-owned; address fixed for the allocation's lifetime
    Stable,
}

/// Non-owning view of arena memory
///
/// Copies of a view alias the same memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableView {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a view never dereferences without an `unsafe` call whose contract
// covers liveness, so moving the handle between threads adds no hazard.
unsafe impl Send for StableView {}
unsafe impl Sync for StableView {}

impl StableView {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Rebuild a view from an address previously returned by `address()`
    ///
    /// Returns `None` for the null address.
    ///
    /// # Safety
    ///
    /// `address..address + len` must lie inside one live allocation.
    pub unsafe fn from_raw_parts(address: usize, len: usize) -> Option<Self> {
        NonNull::new(address as *mut u8).map(|ptr| Self { ptr, len })
    }

    /// Fixed base address
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the viewed bytes
    ///
    /// # Safety
    ///
    /// The backing allocation must be live and not written concurrently.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Copy `bytes` into the view starting at `offset`
    ///
    /// # Safety
    ///
    /// The backing allocation must be live and not borrowed elsewhere.
    pub unsafe fn write_at(&self, offset: usize, bytes: &[u8]) -> FfiResult<()> {
        let end = offset.checked_add(bytes.len());
        if end.map_or(true, |end| end > self.len) {
            return Err(FfiError::OutOfBounds {
                offset,
                len: bytes.len(),
                capacity: self.len,
            });
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Ephemeral(Vec<u8>),
    Stable(StableView),
}

/// Contiguous bytes passed to or returned from native code
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    storage: Storage,
}

impl ByteBuffer {
    /// Owned bytes with ephemeral identity
    pub fn ephemeral(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            storage: Storage::Ephemeral(bytes.into()),
        }
    }

    /// Native-endian image of a scalar
    ///
    /// # Examples
    ///
    /// ```
    /// # use atlas_ffi::ByteBuffer;
    /// let buf = ByteBuffer::from_scalar(5i32);
    /// assert_eq!(buf.len(), 4);
    /// assert_eq!(buf.scalar::<i32>(), Some(5));
    /// ```
    pub fn from_scalar<T: NativeScalar>(value: T) -> Self {
        Self::ephemeral(value.to_native_bytes())
    }

    pub fn identity(&self) -> AddressIdentity {
        match self.storage {
            Storage::Ephemeral(_) => AddressIdentity::Ephemeral,
            Storage::Stable(_) => AddressIdentity::Stable,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.identity() == AddressIdentity::Stable
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Ephemeral(bytes) => bytes.len(),
            Storage::Stable(view) => view.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base address of the buffer
    ///
    /// Stable buffers always report the address fixed at allocation time.
    /// For ephemeral buffers the value is implementation-defined and must not
    /// be relied on across observations.
    pub fn address(&self) -> usize {
        match &self.storage {
            Storage::Ephemeral(bytes) => bytes.as_ptr() as usize,
            Storage::Stable(view) => view.address(),
        }
    }

    /// Owned contents, if this buffer is ephemeral
    pub fn as_ephemeral(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Ephemeral(bytes) => Some(bytes),
            Storage::Stable(_) => None,
        }
    }

    /// Arena view, if this buffer is stable
    pub fn stable_view(&self) -> Option<&StableView> {
        match &self.storage {
            Storage::Stable(view) => Some(view),
            Storage::Ephemeral(_) => None,
        }
    }

    /// Take the owned bytes of an ephemeral buffer
    pub fn into_vec(self) -> Option<Vec<u8>> {
        match self.storage {
            Storage::Ephemeral(bytes) => Some(bytes),
            Storage::Stable(_) => None,
        }
    }

    /// Decode an ephemeral buffer as a scalar of exactly matching size
    pub fn scalar<T: NativeScalar>(&self) -> Option<T> {
        self.as_ephemeral().and_then(T::from_native_bytes)
    }

    /// Borrow the contents regardless of identity
    ///
    /// # Safety
    ///
    /// For stable buffers, the backing allocation must be live.
    pub unsafe fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Ephemeral(bytes) => bytes,
            Storage::Stable(view) => view.as_slice(),
        }
    }

    /// Snapshot the contents into a new ephemeral buffer
    ///
    /// # Safety
    ///
    /// For stable buffers, the backing allocation must be live.
    pub unsafe fn to_ephemeral(&self) -> ByteBuffer {
        ByteBuffer::ephemeral(self.as_slice().to_vec())
    }
}

impl From<StableView> for ByteBuffer {
    fn from(view: StableView) -> Self {
        Self {
            storage: Storage::Stable(view),
        }
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::ephemeral(bytes)
    }
}

/// Rust scalars with a fixed C-ABI counterpart
pub trait NativeScalar: Copy {
    /// Matching descriptor
    fn descriptor() -> TypeDescriptor;

    fn to_native_bytes(self) -> Vec<u8>;

    /// Decode from exactly `size_of::<Self>()` bytes
    fn from_native_bytes(bytes: &[u8]) -> Option<Self>;
}

macro_rules! native_scalar {
    ($($ty:ty => $desc:expr),* $(,)?) => {
        $(
            impl NativeScalar for $ty {
                fn descriptor() -> TypeDescriptor {
                    $desc
                }

                fn to_native_bytes(self) -> Vec<u8> {
                    self.to_ne_bytes().to_vec()
                }

                fn from_native_bytes(bytes: &[u8]) -> Option<Self> {
                    bytes.try_into().ok().map(<$ty>::from_ne_bytes)
                }
            }
        )*
    };
}

native_scalar! {
    u8 => TypeDescriptor::U8,
    i8 => TypeDescriptor::I8,
    u16 => TypeDescriptor::U16,
    i16 => TypeDescriptor::I16,
    u32 => TypeDescriptor::U32,
    i32 => TypeDescriptor::I32,
    u64 => TypeDescriptor::U64,
    i64 => TypeDescriptor::I64,
    f32 => TypeDescriptor::Float,
    f64 => TypeDescriptor::Double,
}

#[cfg(target_pointer_width = "64")]
native_scalar! { usize => TypeDescriptor::U64 }

#[cfg(target_pointer_width = "32")]
native_scalar! { usize => TypeDescriptor::U32 }
