//! Native function calls by address
//!
//! Three entry points share one path:
//! - `invoke`: fixed-arity call, every type is a declared parameter
//! - `invoke_variadic`: fixed prefix plus the concrete types of the trailing arguments
//! - `invoke_generic`: one type list with a split index, equivalent to `invoke_variadic`
//!   over the two halves
//!
//! Arity and per-argument sizes are checked before anything is handed to the
//! ABI adapter, so a rejected call never reaches native code.
//!
//! `ExternFunction` binds an address to a prepared `CallInterface` for
//! repeated calls with the same signature.

use crate::buffer::ByteBuffer;
use crate::cif::{check_shapes, CallInterface};
use crate::error::{FfiError, FfiResult};
use crate::types::TypeDescriptor;
use std::fmt;
use tracing::{debug, trace};

/// Address of a native function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FunctionAddress(usize);

impl FunctionAddress {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for FunctionAddress {
    fn from(address: usize) -> Self {
        Self(address)
    }
}

impl From<FunctionAddress> for usize {
    fn from(address: FunctionAddress) -> Self {
        address.0
    }
}

impl fmt::Display for FunctionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Call a fixed-arity native function
///
/// # Safety
///
/// `address` must be a function whose real signature is `arg_types -> return_type`,
/// and every pointer-valued argument must be valid for the callee.
pub unsafe fn invoke(
    address: FunctionAddress,
    args: &[ByteBuffer],
    arg_types: &[TypeDescriptor],
    return_type: &TypeDescriptor,
) -> FfiResult<ByteBuffer> {
    invoke_generic(false, address, args, arg_types, 0, return_type)
}

/// Call a variadic native function
///
/// `fixed_types` are the declared parameters; `variadic_types` are the types of
/// the trailing arguments actually supplied, already default-promoted.
///
/// # Safety
///
/// As for [`invoke`], with the fixed prefix matching the callee's declaration.
pub unsafe fn invoke_variadic(
    address: FunctionAddress,
    args: &[ByteBuffer],
    fixed_types: &[TypeDescriptor],
    variadic_types: &[TypeDescriptor],
    return_type: &TypeDescriptor,
) -> FfiResult<ByteBuffer> {
    let types: Vec<TypeDescriptor> = fixed_types.iter().chain(variadic_types).cloned().collect();
    invoke_generic(true, address, args, &types, fixed_types.len(), return_type)
}

/// Call a native function, splitting `types` at `fixed_count` when variadic
///
/// `fixed_count` is ignored for fixed-arity calls.
///
/// # Safety
///
/// As for [`invoke`].
pub unsafe fn invoke_generic(
    is_variadic: bool,
    address: FunctionAddress,
    args: &[ByteBuffer],
    types: &[TypeDescriptor],
    fixed_count: usize,
    return_type: &TypeDescriptor,
) -> FfiResult<ByteBuffer> {
    check_shapes(args, types, types.len())?;
    if is_variadic && fixed_count > types.len() {
        return Err(FfiError::FixedCountOutOfRange {
            fixed_count,
            total: types.len(),
        });
    }
    if address.is_null() {
        return Err(FfiError::NullAddress);
    }

    let interface = if is_variadic {
        let (fixed, variadic) = types.split_at(fixed_count);
        CallInterface::new_variadic(fixed.to_vec(), variadic.to_vec(), return_type.clone())?
    } else {
        CallInterface::new(types.to_vec(), return_type.clone())?
    };

    trace!(%address, variadic = is_variadic, args = args.len(), "invoking native function");
    interface.call(address, args)
}

/// Native function bound to a prepared signature
///
/// # Example
///
/// ```
/// # use atlas_ffi::{ByteBuffer, ExternFunction, FunctionAddress, TypeDescriptor};
/// extern "C" fn twice(x: f64) -> f64 {
///     x * 2.0
/// }
///
/// let func = unsafe {
///     ExternFunction::new(
///         FunctionAddress::from(twice as *const () as usize),
///         vec![TypeDescriptor::Double],
///         TypeDescriptor::Double,
///     )
/// }
/// .unwrap();
/// let result = unsafe { func.call(&[ByteBuffer::from_scalar(21.0f64)]) }.unwrap();
/// assert_eq!(result.scalar::<f64>(), Some(42.0));
/// ```
#[derive(Debug)]
pub struct ExternFunction {
    address: FunctionAddress,
    interface: CallInterface,
}

impl ExternFunction {
    /// Bind a fixed-arity function
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `address` points to a valid function
    /// - its actual signature matches `param_types` and `return_type`
    /// - it stays valid (its library stays loaded) for the lifetime of this value
    pub unsafe fn new(
        address: FunctionAddress,
        param_types: Vec<TypeDescriptor>,
        return_type: TypeDescriptor,
    ) -> FfiResult<Self> {
        if address.is_null() {
            return Err(FfiError::NullAddress);
        }
        let interface = CallInterface::new(param_types, return_type)?;
        debug!(%address, signature = %interface_signature(&interface), "bound extern function");
        Ok(Self { address, interface })
    }

    /// Bind a variadic function for one concrete set of trailing argument types
    ///
    /// # Safety
    ///
    /// As for [`ExternFunction::new`].
    pub unsafe fn new_variadic(
        address: FunctionAddress,
        fixed_types: Vec<TypeDescriptor>,
        variadic_types: Vec<TypeDescriptor>,
        return_type: TypeDescriptor,
    ) -> FfiResult<Self> {
        if address.is_null() {
            return Err(FfiError::NullAddress);
        }
        let interface = CallInterface::new_variadic(fixed_types, variadic_types, return_type)?;
        debug!(%address, signature = %interface_signature(&interface), "bound extern function");
        Ok(Self { address, interface })
    }

    /// Call with argument images in declaration order
    ///
    /// # Safety
    ///
    /// Pointer-valued arguments must be valid for the callee, and stable
    /// buffers must belong to live allocations.
    pub unsafe fn call(&self, args: &[ByteBuffer]) -> FfiResult<ByteBuffer> {
        self.interface.call(self.address, args)
    }

    pub fn address(&self) -> FunctionAddress {
        self.address
    }

    pub fn interface(&self) -> &CallInterface {
        &self.interface
    }

    /// Get parameter types
    pub fn param_types(&self) -> Vec<&TypeDescriptor> {
        self.interface.arg_types().collect()
    }

    /// Get return type
    pub fn return_type(&self) -> &TypeDescriptor {
        self.interface.return_type()
    }

    /// Readable signature, e.g. `(int, ...double) -> int`
    pub fn signature(&self) -> String {
        interface_signature(&self.interface)
    }
}

fn interface_signature(interface: &CallInterface) -> String {
    let mut params: Vec<String> = interface.fixed_types().iter().map(|t| t.to_string()).collect();
    if let Some(variadic) = interface.variadic_types() {
        params.extend(variadic.iter().map(|t| format!("...{}", t)));
    }
    format!("({}) -> {}", params.join(", "), interface.return_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::{c_double, c_int};
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

    extern "C" fn test_add(a: c_int, b: c_int) -> c_int {
        a + b
    }

    extern "C" fn test_double(x: c_double) -> c_double {
        x * 2.0
    }

    extern "C" fn test_no_args() -> c_int {
        42
    }

    extern "C" fn test_mixed(a: u8, b: f32, c: i64) -> f64 {
        a as f64 + b as f64 + c as f64
    }

    extern "C" fn test_u16(x: u16) -> u16 {
        x.wrapping_add(1)
    }

    static RECORDED: AtomicI32 = AtomicI32::new(0);

    extern "C" fn test_record(x: c_int) {
        RECORDED.store(x, Ordering::SeqCst);
    }

    static TOUCHED: AtomicBool = AtomicBool::new(false);

    extern "C" fn test_touch(_x: c_int) -> c_int {
        TOUCHED.store(true, Ordering::SeqCst);
        0
    }

    fn addr(f: usize) -> FunctionAddress {
        FunctionAddress::from(f)
    }

    #[test]
    fn test_invoke_add() {
        let result = unsafe {
            invoke(
                addr(test_add as *const () as usize),
                &[ByteBuffer::from_scalar(2i32), ByteBuffer::from_scalar(3i32)],
                &[TypeDescriptor::Int, TypeDescriptor::Int],
                &TypeDescriptor::Int,
            )
        }
        .unwrap();
        assert_eq!(result.scalar::<i32>(), Some(5));
    }

    #[test]
    fn test_invoke_mixed_widths() {
        let result = unsafe {
            invoke(
                addr(test_mixed as *const () as usize),
                &[
                    ByteBuffer::from_scalar(1u8),
                    ByteBuffer::from_scalar(0.5f32),
                    ByteBuffer::from_scalar(-4i64),
                ],
                &[TypeDescriptor::U8, TypeDescriptor::Float, TypeDescriptor::I64],
                &TypeDescriptor::Double,
            )
        }
        .unwrap();
        assert_eq!(result.scalar::<f64>(), Some(-2.5));
    }

    #[test]
    fn test_invoke_small_return() {
        let result = unsafe {
            invoke(
                addr(test_u16 as *const () as usize),
                &[ByteBuffer::from_scalar(u16::MAX)],
                &[TypeDescriptor::U16],
                &TypeDescriptor::U16,
            )
        }
        .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.scalar::<u16>(), Some(0));
    }

    #[test]
    fn test_invoke_void_return() {
        let result = unsafe {
            invoke(
                addr(test_record as *const () as usize),
                &[ByteBuffer::from_scalar(77i32)],
                &[TypeDescriptor::Int],
                &TypeDescriptor::Void,
            )
        }
        .unwrap();
        assert!(result.is_empty());
        assert_eq!(RECORDED.load(Ordering::SeqCst), 77);
    }

    #[test]
    fn test_arity_mismatch_makes_no_call() {
        let err = unsafe {
            invoke(
                addr(test_touch as *const () as usize),
                &[ByteBuffer::from_scalar(1i32), ByteBuffer::from_scalar(2i32)],
                &[TypeDescriptor::Int],
                &TypeDescriptor::Int,
            )
        }
        .unwrap_err();
        assert_eq!(
            err,
            FfiError::ArityMismatch {
                expected: 1,
                got: 2
            }
        );
        assert!(!TOUCHED.load(Ordering::SeqCst));
    }

    #[test]
    fn test_size_mismatch() {
        let err = unsafe {
            invoke(
                addr(test_add as *const () as usize),
                &[ByteBuffer::from_scalar(2i32), ByteBuffer::from_scalar(3i64)],
                &[TypeDescriptor::Int, TypeDescriptor::Int],
                &TypeDescriptor::Int,
            )
        }
        .unwrap_err();
        assert!(matches!(
            err,
            FfiError::TypeSizeMismatch {
                index: 1,
                expected: 4,
                got: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_fixed_count_out_of_range() {
        let err = unsafe {
            invoke_generic(
                true,
                addr(test_add as *const () as usize),
                &[ByteBuffer::from_scalar(2i32)],
                &[TypeDescriptor::Int],
                2,
                &TypeDescriptor::Int,
            )
        }
        .unwrap_err();
        assert_eq!(
            err,
            FfiError::FixedCountOutOfRange {
                fixed_count: 2,
                total: 1
            }
        );
    }

    #[test]
    fn test_fixed_count_ignored_when_not_variadic() {
        let result = unsafe {
            invoke_generic(
                false,
                addr(test_double as *const () as usize),
                &[ByteBuffer::from_scalar(1.25f64)],
                &[TypeDescriptor::Double],
                99,
                &TypeDescriptor::Double,
            )
        }
        .unwrap();
        assert_eq!(result.scalar::<f64>(), Some(2.5));
    }

    #[test]
    fn test_null_address() {
        let err = unsafe { invoke(FunctionAddress::default(), &[], &[], &TypeDescriptor::Int) }
            .unwrap_err();
        assert_eq!(err, FfiError::NullAddress);
    }

    #[test]
    fn test_extern_function_reuse() {
        unsafe {
            let func = ExternFunction::new(
                addr(test_add as *const () as usize),
                vec![TypeDescriptor::Int, TypeDescriptor::Int],
                TypeDescriptor::Int,
            )
            .unwrap();

            for i in 0..4 {
                let result = func
                    .call(&[ByteBuffer::from_scalar(i), ByteBuffer::from_scalar(10i32)])
                    .unwrap();
                assert_eq!(result.scalar::<i32>(), Some(i + 10));
            }
            assert_eq!(func.signature(), "(int, int) -> int");
            assert_eq!(func.param_types().len(), 2);
        }
    }

    #[test]
    fn test_extern_function_no_args() {
        unsafe {
            let func =
                ExternFunction::new(addr(test_no_args as *const () as usize), vec![], TypeDescriptor::Int)
                    .unwrap();
            let result = func.call(&[]).unwrap();
            assert_eq!(result.scalar::<i32>(), Some(42));
        }
    }

    #[test]
    fn test_variadic_signature_text() {
        let func = unsafe {
            ExternFunction::new_variadic(
                addr(test_no_args as *const () as usize),
                vec![TypeDescriptor::U64],
                vec![TypeDescriptor::Int, TypeDescriptor::Double],
                TypeDescriptor::Int,
            )
        }
        .unwrap();
        assert_eq!(func.signature(), "(u64, ...int, ...double) -> int");
    }

    #[test]
    fn test_address_display() {
        assert_eq!(FunctionAddress::new(0x1000).to_string(), "0x1000");
        assert!(FunctionAddress::default().is_null());
    }
}
