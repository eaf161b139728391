//! Host-facing bridge
//!
//! `NativeBridge` bundles one arena, one resolver and one event log behind
//! the operations a managed runtime binds to: symbol lookup, the three call
//! shapes, stable allocation by key, and address queries.

use crate::arena::{self, Arena};
use crate::buffer::ByteBuffer;
use crate::caller::{self, FunctionAddress};
use crate::error::FfiResult;
use crate::events::{EventLogger, FfiEvent, MemoryEventLogger, NullEventLogger};
use crate::resolver::SymbolResolver;
use crate::types::TypeDescriptor;
use atlas_ffi_config::{ConfigLoader, EventSink, FfiConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Native call and stable-memory surface for one runtime instance
///
/// # Example
///
/// ```
/// # use atlas_ffi::{ByteBuffer, FunctionAddress, NativeBridge, TypeDescriptor};
/// extern "C" fn add(a: i32, b: i32) -> i32 {
///     a + b
/// }
///
/// let bridge = NativeBridge::new().unwrap();
/// let out = bridge.allocate("scratch", 8, 8).unwrap();
/// assert_eq!(bridge.address_of(&out), out.address());
///
/// let result = unsafe {
///     bridge.invoke(
///         FunctionAddress::from(add as *const () as usize),
///         &[ByteBuffer::from_scalar(2i32), ByteBuffer::from_scalar(3i32)],
///         &[TypeDescriptor::Int, TypeDescriptor::Int],
///         &TypeDescriptor::Int,
///     )
/// }
/// .unwrap();
/// assert_eq!(result.scalar::<i32>(), Some(5));
/// bridge.free("scratch");
/// ```
pub struct NativeBridge {
    arena: Arena<String>,
    resolver: SymbolResolver,
    events: Arc<dyn EventLogger>,
}

impl NativeBridge {
    /// Bridge with default settings
    pub fn new() -> FfiResult<Self> {
        Self::from_config(&FfiConfig::default())
    }

    /// Bridge configured from the config files found from `start_dir`
    pub fn from_directory(start_dir: &Path) -> FfiResult<Self> {
        let loaded = ConfigLoader::new().load_from_directory(start_dir)?;
        Self::from_config(&loaded.config)
    }

    /// Bridge configured from `config`
    ///
    /// Libraries listed under `resolver.preload` are loaded immediately and
    /// treated as trusted.
    pub fn from_config(config: &FfiConfig) -> FfiResult<Self> {
        let events: Arc<dyn EventLogger> = match config.event_sink() {
            EventSink::Memory => Arc::new(MemoryEventLogger::new()),
            EventSink::Null => Arc::new(NullEventLogger::new()),
        };
        Self::with_logger(config, events)
    }

    /// Bridge configured from `config`, recording events to `events`
    pub fn with_logger(config: &FfiConfig, events: Arc<dyn EventLogger>) -> FfiResult<Self> {
        config.validate()?;

        let arena = Arena::new()
            .with_limit(config.max_live_bytes())
            .with_logger(Arc::clone(&events));
        let resolver = SymbolResolver::new()?
            .with_search_paths(config.search_paths())
            .with_cache(config.cache_symbols())
            .with_logger(Arc::clone(&events));

        for library in config.preload() {
            // Safety: preloaded libraries come from the host's own configuration.
            unsafe { resolver.load_library(library)? };
        }

        info!(
            max_live_bytes = ?config.max_live_bytes(),
            preloaded = config.preload().len(),
            "native bridge ready"
        );
        Ok(Self {
            arena,
            resolver,
            events,
        })
    }

    /// Address of an exported native symbol
    pub fn resolve_symbol(&self, name: &str) -> FfiResult<FunctionAddress> {
        self.resolver.resolve(name)
    }

    /// Load a shared library so its symbols become resolvable
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers; it must be trusted.
    pub unsafe fn load_library(&self, name: &str) -> FfiResult<PathBuf> {
        self.resolver.load_library(name)
    }

    /// Fixed-arity call
    ///
    /// # Safety
    ///
    /// See [`caller::invoke`].
    pub unsafe fn invoke(
        &self,
        address: FunctionAddress,
        args: &[ByteBuffer],
        arg_types: &[TypeDescriptor],
        return_type: &TypeDescriptor,
    ) -> FfiResult<ByteBuffer> {
        self.invoke_generic(false, address, args, arg_types, 0, return_type)
    }

    /// Variadic call with separate fixed and trailing type lists
    ///
    /// # Safety
    ///
    /// See [`caller::invoke_variadic`].
    pub unsafe fn invoke_variadic(
        &self,
        address: FunctionAddress,
        args: &[ByteBuffer],
        fixed_types: &[TypeDescriptor],
        variadic_types: &[TypeDescriptor],
        return_type: &TypeDescriptor,
    ) -> FfiResult<ByteBuffer> {
        let types: Vec<TypeDescriptor> = fixed_types.iter().chain(variadic_types).cloned().collect();
        self.invoke_generic(true, address, args, &types, fixed_types.len(), return_type)
    }

    /// Call with one type list, split at `fixed_count` when variadic
    ///
    /// # Safety
    ///
    /// See [`caller::invoke_generic`].
    pub unsafe fn invoke_generic(
        &self,
        is_variadic: bool,
        address: FunctionAddress,
        args: &[ByteBuffer],
        types: &[TypeDescriptor],
        fixed_count: usize,
        return_type: &TypeDescriptor,
    ) -> FfiResult<ByteBuffer> {
        match caller::invoke_generic(is_variadic, address, args, types, fixed_count, return_type) {
            Ok(result) => {
                self.events.log(FfiEvent::CallDispatched {
                    address: address.as_usize(),
                    variadic: is_variadic,
                    args: args.len(),
                });
                Ok(result)
            }
            Err(e) => {
                warn!(%address, error = %e, "call rejected");
                self.events.log(FfiEvent::CallRejected {
                    address: address.as_usize(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Reserve stable memory under `key`
    pub fn allocate(
        &self,
        key: impl Into<String>,
        size: usize,
        alignment: usize,
    ) -> FfiResult<ByteBuffer> {
        self.arena.allocate(key.into(), size, alignment)
    }

    /// Address of `buffer`; fixed for stable buffers
    pub fn address_of(&self, buffer: &ByteBuffer) -> usize {
        arena::address_of(buffer)
    }

    /// Release the allocation under `key`; unknown keys are ignored
    pub fn free(&self, key: &str) {
        self.arena.free(key);
    }

    pub fn arena(&self) -> &Arena<String> {
        &self.arena
    }

    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    pub fn events(&self) -> &dyn EventLogger {
        self.events.as_ref()
    }
}

impl std::fmt::Debug for NativeBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBridge")
            .field("arena", &self.arena)
            .field("resolver", &self.resolver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FfiError;
    use atlas_ffi_config::{ArenaSection, LoggingSection};
    use std::os::raw::c_int;

    extern "C" fn test_add(a: c_int, b: c_int) -> c_int {
        a + b
    }

    #[test]
    fn test_default_bridge_records_events() {
        let bridge = NativeBridge::new().unwrap();
        bridge.allocate("a", 4, 4).unwrap();
        bridge.free("a");
        bridge.free("a");
        assert_eq!(bridge.events().entries().len(), 3);
        assert_eq!(bridge.arena().live_count(), 0);
    }

    #[test]
    fn test_null_event_sink() {
        let config = FfiConfig {
            logging: Some(LoggingSection {
                events: Some(EventSink::Null),
                ..Default::default()
            }),
            ..Default::default()
        };
        let bridge = NativeBridge::from_config(&config).unwrap();
        bridge.allocate("a", 4, 4).unwrap();
        assert!(bridge.events().entries().is_empty());
    }

    #[test]
    fn test_budget_from_config() {
        let config = FfiConfig {
            arena: Some(ArenaSection {
                max_live_bytes: Some(8),
            }),
            ..Default::default()
        };
        let bridge = NativeBridge::from_config(&config).unwrap();
        assert!(matches!(
            bridge.allocate("big", 16, 8),
            Err(FfiError::ArenaExhausted { .. })
        ));
    }

    #[test]
    fn test_invoke_logs_dispatch_and_rejection() {
        let bridge = NativeBridge::new().unwrap();
        let address = FunctionAddress::from(test_add as *const () as usize);
        let types = [TypeDescriptor::Int, TypeDescriptor::Int];

        let ok = unsafe {
            bridge.invoke(
                address,
                &[ByteBuffer::from_scalar(1i32), ByteBuffer::from_scalar(2i32)],
                &types,
                &TypeDescriptor::Int,
            )
        }
        .unwrap();
        assert_eq!(ok.scalar::<i32>(), Some(3));

        let err = unsafe {
            bridge.invoke(
                address,
                &[ByteBuffer::from_scalar(1i32)],
                &types,
                &TypeDescriptor::Int,
            )
        }
        .unwrap_err();
        assert!(matches!(err, FfiError::ArityMismatch { .. }));

        let events: Vec<FfiEvent> = bridge.events().entries().into_iter().map(|e| e.event).collect();
        assert!(matches!(events[0], FfiEvent::CallDispatched { variadic: false, args: 2, .. }));
        assert!(matches!(events[1], FfiEvent::CallRejected { .. }));
    }

    #[test]
    fn test_preload_missing_library_fails() {
        let config = FfiConfig::parse(
            r#"
[resolver]
preload = ["atlas_ffi_no_such_library"]
"#,
        )
        .unwrap();
        assert_eq!(
            NativeBridge::from_config(&config).unwrap_err(),
            FfiError::LibraryNotFound("atlas_ffi_no_such_library".to_string())
        );
    }
}
