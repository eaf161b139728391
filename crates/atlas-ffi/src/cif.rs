//! Call interfaces prepared with libffi
//!
//! A `CallInterface` owns a libffi `Cif` together with the type trees it was
//! built from, so one prepared signature can be reused for many calls.
//! Variadic interfaces take the fixed prefix length and the types of the
//! trailing arguments actually passed.
//!
//! All libffi access in the crate lives in this file.

use crate::buffer::ByteBuffer;
use crate::caller::FunctionAddress;
use crate::error::{FfiError, FfiResult};
use crate::marshal::{narrow_return, return_slot, MarshalContext};
use crate::types::TypeDescriptor;
use libffi::low;
use libffi::middle::{ffi_abi_FFI_DEFAULT_ABI, Cif, CodePtr, Type};
use libffi::raw;
use std::iter::once;
use std::os::raw::{c_char, c_void};
use tracing::trace;

/// (size, alignment) of `long double` as the ABI adapter sees it
pub(crate) fn long_double_layout() -> (usize, usize) {
    let ty = Type::longdouble();
    // Safety: builtin libffi types are statically initialized and never written.
    let raw_ty = unsafe { &*ty.as_raw_ptr() };
    (raw_ty.size, raw_ty.alignment as usize)
}

/// libffi type tree for one descriptor
fn ffi_type(desc: &TypeDescriptor) -> Type {
    match desc {
        TypeDescriptor::Void => Type::void(),
        TypeDescriptor::U8 => Type::u8(),
        TypeDescriptor::I8 => Type::i8(),
        TypeDescriptor::U16 => Type::u16(),
        TypeDescriptor::I16 => Type::i16(),
        TypeDescriptor::U32 => Type::u32(),
        TypeDescriptor::I32 => Type::i32(),
        TypeDescriptor::U64 => Type::u64(),
        TypeDescriptor::I64 => Type::i64(),
        TypeDescriptor::Float => Type::f32(),
        TypeDescriptor::Double => Type::f64(),
        TypeDescriptor::Char if c_char::MIN != 0 => Type::c_schar(),
        TypeDescriptor::Char | TypeDescriptor::UChar => Type::c_uchar(),
        TypeDescriptor::Short => Type::c_short(),
        TypeDescriptor::UShort => Type::c_ushort(),
        TypeDescriptor::Int => Type::c_int(),
        TypeDescriptor::UInt => Type::c_uint(),
        TypeDescriptor::Long => Type::c_long(),
        TypeDescriptor::ULong => Type::c_ulong(),
        TypeDescriptor::LongDouble => Type::longdouble(),
        TypeDescriptor::Struct(fields) => Type::structure(fields.iter().map(ffi_type)),
    }
}

fn preparation_error(err: low::Error) -> FfiError {
    FfiError::CifPreparation(match err {
        low::Error::Typedef => "malformed type definition",
        low::Error::Abi => "unsupported calling convention",
        // unpromoted variadic types (float, sub-int integers) land here
        low::Error::ArgType => "argument type not allowed in this position",
        _ => "libffi could not prepare the call",
    })
}

/// Lay out a struct type with libffi and compare it with the descriptor
fn check_layout(desc: &TypeDescriptor, ty: &mut Type) -> FfiResult<()> {
    if !desc.is_struct() {
        return Ok(());
    }
    let offsets = ty
        .struct_offsets(ffi_abi_FFI_DEFAULT_ABI)
        .map_err(preparation_error)?;
    // Safety: `ty` owns the struct type libffi just laid out.
    let size = unsafe { (*ty.as_raw_ptr()).size };
    if offsets != desc.field_offsets() || size != desc.size_of() {
        return Err(FfiError::CifPreparation(
            "struct layout disagrees with the ABI adapter",
        ));
    }
    Ok(())
}

/// Prepared native call signature
///
/// # Example
///
/// ```
/// # use atlas_ffi::{ByteBuffer, CallInterface, FunctionAddress, TypeDescriptor};
/// extern "C" fn add(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// let cif = CallInterface::new(
///     vec![TypeDescriptor::I32, TypeDescriptor::I32],
///     TypeDescriptor::I32,
/// )
/// .unwrap();
/// let args = [ByteBuffer::from_scalar(2i32), ByteBuffer::from_scalar(3i32)];
/// let address = FunctionAddress::from(add as *const () as usize);
/// let result = unsafe { cif.call(address, &args) }.unwrap();
/// assert_eq!(result.scalar::<i32>(), Some(5));
/// ```
pub struct CallInterface {
    cif: Cif,
    fixed: Vec<TypeDescriptor>,
    variadic: Option<Vec<TypeDescriptor>>,
    ret: TypeDescriptor,
}

impl CallInterface {
    /// Prepare a fixed-arity signature
    pub fn new(params: Vec<TypeDescriptor>, ret: TypeDescriptor) -> FfiResult<Self> {
        Self::prepare(params, None, ret)
    }

    /// Prepare a variadic signature for one concrete set of trailing argument types
    pub fn new_variadic(
        fixed: Vec<TypeDescriptor>,
        variadic: Vec<TypeDescriptor>,
        ret: TypeDescriptor,
    ) -> FfiResult<Self> {
        Self::prepare(fixed, Some(variadic), ret)
    }

    fn prepare(
        fixed: Vec<TypeDescriptor>,
        variadic: Option<Vec<TypeDescriptor>>,
        ret: TypeDescriptor,
    ) -> FfiResult<Self> {
        let all: Vec<&TypeDescriptor> = fixed.iter().chain(variadic.iter().flatten()).collect();
        for (index, ty) in all.iter().enumerate() {
            ty.check_argument(index)?;
        }
        ret.check_return()?;

        let mut arg_types: Vec<Type> = all.iter().map(|ty| ffi_type(ty)).collect();
        let mut ret_type = ffi_type(&ret);
        let laid_out = all
            .iter()
            .copied()
            .zip(arg_types.iter_mut())
            .chain(once((&ret, &mut ret_type)));
        for (desc, ty) in laid_out {
            check_layout(desc, ty)?;
        }

        let cif = match &variadic {
            Some(_) => Cif::try_new_variadic(arg_types, fixed.len(), ret_type),
            None => Cif::try_new(arg_types, ret_type),
        }
        .map_err(preparation_error)?;

        trace!(
            fixed = fixed.len(),
            variadic = variadic.as_ref().map_or(0, Vec::len),
            ret = %ret,
            "prepared call interface"
        );

        Ok(Self {
            cif,
            fixed,
            variadic,
            ret,
        })
    }

    /// Fixed parameter types (all parameters for non-variadic signatures)
    pub fn fixed_types(&self) -> &[TypeDescriptor] {
        &self.fixed
    }

    /// Trailing argument types, for variadic signatures
    pub fn variadic_types(&self) -> Option<&[TypeDescriptor]> {
        self.variadic.as_deref()
    }

    pub fn return_type(&self) -> &TypeDescriptor {
        &self.ret
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic.is_some()
    }

    /// Total number of arguments a call must supply
    pub fn arity(&self) -> usize {
        self.fixed.len() + self.variadic.as_ref().map_or(0, Vec::len)
    }

    /// Every argument type in call order
    pub fn arg_types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.fixed.iter().chain(self.variadic.iter().flatten())
    }

    /// Check argument count and per-argument byte sizes
    pub fn check_args(&self, args: &[ByteBuffer]) -> FfiResult<()> {
        check_shapes(args, self.arg_types(), self.arity())
    }

    /// Call the native function at `address`
    ///
    /// Argument bytes are copied into aligned storage, the call is performed,
    /// and the result bytes (sized by the return type) come back as a fresh
    /// ephemeral buffer. A `void` return yields an empty buffer.
    ///
    /// # Safety
    ///
    /// - `address` must be a function whose real signature matches this interface
    /// - stable buffers among `args` must belong to live allocations
    /// - pointer-valued arguments must be valid for whatever the callee does with them
    pub unsafe fn call(
        &self,
        address: FunctionAddress,
        args: &[ByteBuffer],
    ) -> FfiResult<ByteBuffer> {
        if address.is_null() {
            return Err(FfiError::NullAddress);
        }
        self.check_args(args)?;

        let mut ctx = MarshalContext::new();
        for arg in args {
            ctx.stage(arg.as_slice());
        }

        let mut slot = return_slot(&self.ret);
        let code = CodePtr::from_ptr(address.as_usize() as *const c_void);

        // The return slot is register sized, so the byte-level call goes
        // through the raw entry point rather than `Cif::call::<R>`.
        raw::ffi_call(
            self.cif.as_raw_ptr(),
            Some(*code.as_fun()),
            slot.as_mut_ptr() as *mut c_void,
            ctx.argument_pointers(),
        );

        if self.ret.is_void() {
            return Ok(ByteBuffer::ephemeral(Vec::new()));
        }
        Ok(ByteBuffer::ephemeral(narrow_return(&self.ret, slot.as_slice())))
    }
}

impl std::fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInterface")
            .field("fixed", &self.fixed)
            .field("variadic", &self.variadic)
            .field("ret", &self.ret)
            .finish()
    }
}

/// Arity and size validation shared by every call shape
pub(crate) fn check_shapes<'a>(
    args: &[ByteBuffer],
    types: impl IntoIterator<Item = &'a TypeDescriptor>,
    expected: usize,
) -> FfiResult<()> {
    if args.len() != expected {
        return Err(FfiError::ArityMismatch {
            expected,
            got: args.len(),
        });
    }
    for (index, (arg, ty)) in args.iter().zip(types).enumerate() {
        let size = ty.size_of();
        if arg.len() != size {
            return Err(FfiError::TypeSizeMismatch {
                index,
                ty: ty.to_string(),
                expected: size,
                got: arg.len(),
            });
        }
    }
    Ok(())
}
