//! Atlas FFI - native call marshalling and stable-address memory
//!
//! Lets a managed runtime call C-ABI functions by address:
//! - Type descriptors with target ABI size and alignment
//! - Byte buffers as the currency for arguments and results
//! - Fixed-arity, variadic and split-index calls through libffi
//! - A keyed arena of memory whose address never moves
//! - Symbol lookup in the process and in explicitly loaded libraries
//!
//! # Safety
//!
//! Only locally checkable mistakes are reported as errors: arity, argument
//! sizes, alignment, duplicate keys, unknown symbols. Calling a function with
//! the wrong real signature, passing a dangling pointer, or reading a stable
//! buffer after its allocation is freed is undefined behavior. Every entry
//! point that can lead there is an `unsafe fn`.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod arena;
pub mod bridge;
pub mod buffer;
pub mod caller;
pub mod cif;
pub mod error;
pub mod events;
pub mod loader;
pub mod logging;
pub mod marshal;
pub mod resolver;
pub mod types;

pub use arena::{address_of, AllocationRecord, AllocationState, Arena};
pub use bridge::NativeBridge;
pub use buffer::{AddressIdentity, ByteBuffer, NativeScalar, StableView};
pub use caller::{invoke, invoke_generic, invoke_variadic, ExternFunction, FunctionAddress};
pub use cif::CallInterface;
pub use error::{FfiError, FfiResult};
pub use events::{EventEntry, EventLogger, FfiEvent, MemoryEventLogger, NullEventLogger};
pub use loader::LibraryLoader;
pub use logging::{init_logging, LoggingConfig};
pub use marshal::{pack_struct, unpack_struct, MarshalContext};
pub use resolver::SymbolResolver;
pub use types::{TypeDescriptor, MAX_STRUCT_DEPTH, SCALAR_TYPES};
