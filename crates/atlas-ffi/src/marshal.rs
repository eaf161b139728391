//! Byte-level marshaling across the ABI boundary
//!
//! Provides:
//! - `MarshalContext`: aligned scratch copies of argument bytes, kept alive for
//!   the duration of one native call
//! - `pack_struct` / `unpack_struct`: struct byte images laid out per the target ABI
//! - return slot sizing and narrowing of widened integral returns
//!
//! # Memory Safety
//!
//! - Argument images are copied into 16-byte aligned storage, so the adapter
//!   never reads through a misaligned pointer
//! - Storage is released when the context drops, after the call returns

use crate::error::{FfiError, FfiResult};
use crate::types::TypeDescriptor;
use std::mem::size_of;
use std::os::raw::c_void;

/// One 16-byte aligned storage unit
#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct AlignedChunk([u8; 16]);

/// Zeroed byte storage aligned to 16 bytes
pub(crate) struct AlignedBytes {
    chunks: Vec<AlignedChunk>,
    len: usize,
}

impl AlignedBytes {
    /// At least one chunk is always reserved so the pointer is never dangling
    pub(crate) fn zeroed(len: usize) -> Self {
        let count = len.div_ceil(16).max(1);
        Self {
            chunks: vec![AlignedChunk([0; 16]); count],
            len,
        }
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut storage = Self::zeroed(bytes.len());
        storage.as_mut_slice().copy_from_slice(bytes);
        storage
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.chunks.as_mut_ptr() as *mut u8
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // Safety: `chunks` holds at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr() as *const u8, self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, with exclusive access through `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }
}

/// Marshal context for one native call
///
/// Owns aligned copies of every argument and hands out the pointer array the
/// ABI adapter reads from.
///
/// # Example
///
/// ```
/// # use atlas_ffi::MarshalContext;
/// let mut ctx = MarshalContext::new();
/// ctx.stage(&7i32.to_ne_bytes());
/// ctx.stage(&1.5f64.to_ne_bytes());
/// assert_eq!(ctx.len(), 2);
/// // storage is released when ctx drops
/// ```
pub struct MarshalContext {
    staged: Vec<AlignedBytes>,
    pointers: Vec<*mut c_void>,
}

impl MarshalContext {
    /// Create a new marshal context
    pub fn new() -> Self {
        Self {
            staged: Vec::new(),
            pointers: Vec::new(),
        }
    }

    /// Copy one argument image into aligned storage
    pub fn stage(&mut self, bytes: &[u8]) {
        let mut storage = AlignedBytes::from_slice(bytes);
        // The chunk buffer is heap-allocated, so the pointer survives moving `storage`.
        self.pointers.push(storage.as_mut_ptr() as *mut c_void);
        self.staged.push(storage);
    }

    /// Number of staged arguments
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Pointer array for the adapter's `avalue` parameter
    pub(crate) fn argument_pointers(&mut self) -> *mut *mut c_void {
        self.pointers.as_mut_ptr()
    }
}

impl Default for MarshalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Width of the register slot the adapter widens small integral returns into
const RETURN_REGISTER: usize = size_of::<usize>();

/// Storage for a return value of type `ty`
pub(crate) fn return_slot(ty: &TypeDescriptor) -> AlignedBytes {
    AlignedBytes::zeroed(ty.size_of().max(RETURN_REGISTER))
}

/// Extract the `ty`-sized result from the adapter's return slot
///
/// Integral results narrower than a register come back widened to a full
/// register; on big-endian targets the value sits in the high-address bytes.
pub(crate) fn narrow_return(ty: &TypeDescriptor, slot: &[u8]) -> Vec<u8> {
    let size = ty.size_of();
    if ty.is_integral() && size < RETURN_REGISTER && cfg!(target_endian = "big") {
        slot[RETURN_REGISTER - size..RETURN_REGISTER].to_vec()
    } else {
        slot[..size].to_vec()
    }
}

/// Lay out field images as a native struct
///
/// Each field is written at its ABI offset; padding bytes are zero.
///
/// # Examples
///
/// ```
/// # use atlas_ffi::{pack_struct, TypeDescriptor};
/// let ty = TypeDescriptor::structure([TypeDescriptor::U8, TypeDescriptor::I32]);
/// let bytes = pack_struct(&ty, &[&[1], &7i32.to_ne_bytes()]).unwrap();
/// assert_eq!(bytes.len(), 8);
/// assert_eq!(&bytes[4..], &7i32.to_ne_bytes());
/// ```
pub fn pack_struct(ty: &TypeDescriptor, fields: &[&[u8]]) -> FfiResult<Vec<u8>> {
    let layout = struct_fields(ty)?;
    if fields.len() != layout.len() {
        return Err(FfiError::ArityMismatch {
            expected: layout.len(),
            got: fields.len(),
        });
    }

    let mut image = vec![0u8; ty.size_of()];
    for (index, ((field_ty, offset), bytes)) in layout.iter().zip(fields).enumerate() {
        let expected = field_ty.size_of();
        if bytes.len() != expected {
            return Err(FfiError::TypeSizeMismatch {
                index,
                ty: field_ty.to_string(),
                expected,
                got: bytes.len(),
            });
        }
        image[*offset..offset + expected].copy_from_slice(bytes);
    }
    Ok(image)
}

/// Split a native struct image into per-field slices
pub fn unpack_struct<'a>(ty: &TypeDescriptor, image: &'a [u8]) -> FfiResult<Vec<&'a [u8]>> {
    let layout = struct_fields(ty)?;
    let size = ty.size_of();
    if image.len() != size {
        return Err(FfiError::TypeSizeMismatch {
            index: 0,
            ty: ty.to_string(),
            expected: size,
            got: image.len(),
        });
    }

    Ok(layout
        .iter()
        .map(|(field_ty, offset)| &image[*offset..offset + field_ty.size_of()])
        .collect())
}

fn struct_fields(ty: &TypeDescriptor) -> FfiResult<Vec<(&TypeDescriptor, usize)>> {
    match ty {
        TypeDescriptor::Struct(fields) => Ok(fields.iter().zip(ty.field_offsets()).collect()),
        other => Err(FfiError::UnsupportedType {
            ty: other.to_string(),
            position: "struct image".to_string(),
            reason: "not a struct type",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_bytes_alignment() {
        for len in [0, 1, 15, 16, 17, 33] {
            let mut storage = AlignedBytes::zeroed(len);
            assert_eq!(storage.as_mut_ptr() as usize % 16, 0);
            assert_eq!(storage.as_slice().len(), len);
            assert!(storage.as_slice().iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_stage_copies_bytes() {
        let mut ctx = MarshalContext::new();
        ctx.stage(&[1, 2, 3]);
        ctx.stage(&[4]);
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.staged[0].as_slice(), &[1, 2, 3]);
        assert_eq!(ctx.pointers[1] as usize % 16, 0);
        assert_eq!(ctx.pointers[1] as usize, ctx.staged[1].chunks.as_ptr() as usize);
    }

    #[test]
    fn test_narrow_return_little_endian_widened() {
        let slot = AlignedBytes::from_slice(&{
            let mut raw = vec![0u8; RETURN_REGISTER];
            let value = (-3i64 as usize).to_ne_bytes();
            raw.copy_from_slice(&value);
            raw
        });
        let narrowed = narrow_return(&TypeDescriptor::I16, slot.as_slice());
        assert_eq!(narrowed, (-3i16).to_ne_bytes().to_vec());
    }

    #[test]
    fn test_return_slot_covers_register() {
        assert!(return_slot(&TypeDescriptor::U8).as_slice().len() >= RETURN_REGISTER);
        let big = TypeDescriptor::structure(vec![TypeDescriptor::U64; 4]);
        assert_eq!(return_slot(&big).as_slice().len(), 32);
    }

    #[test]
    fn test_pack_struct_with_padding() {
        let ty = TypeDescriptor::structure([
            TypeDescriptor::U8,
            TypeDescriptor::Double,
            TypeDescriptor::U16,
        ]);
        let bytes = pack_struct(&ty, &[&[0xAA], &2.5f64.to_ne_bytes(), &[1, 2]]).unwrap();

        assert_eq!(bytes.len(), ty.size_of());
        assert_eq!(bytes[0], 0xAA);
        assert!(bytes[1..8].iter().all(|b| *b == 0));
        assert_eq!(&bytes[8..16], &2.5f64.to_ne_bytes());
        assert_eq!(&bytes[16..18], &[1, 2]);

        let fields = unpack_struct(&ty, &bytes).unwrap();
        assert_eq!(fields, vec![&[0xAAu8][..], &2.5f64.to_ne_bytes()[..], &[1u8, 2][..]]);
    }

    #[test]
    fn test_pack_struct_field_size_mismatch() {
        let ty = TypeDescriptor::structure([TypeDescriptor::I32, TypeDescriptor::I32]);
        let err = pack_struct(&ty, &[&[0; 4], &[0; 2]]).unwrap_err();
        assert!(matches!(
            err,
            FfiError::TypeSizeMismatch {
                index: 1,
                expected: 4,
                got: 2,
                ..
            }
        ));
        assert!(matches!(
            pack_struct(&ty, &[&[0; 4]]),
            Err(FfiError::ArityMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_scalar_is_not_a_struct() {
        assert!(pack_struct(&TypeDescriptor::I32, &[]).is_err());
        assert!(unpack_struct(&TypeDescriptor::I32, &[0; 4]).is_err());
    }
}
