//! Symbol resolution
//!
//! Looks names up in the host process's global symbol scope first, then in
//! each library loaded through the resolver, oldest first. Results are cached
//! by name; the cache is dropped whenever a library is loaded, so answers are
//! stable for as long as the module set is.

use crate::caller::FunctionAddress;
use crate::error::{FfiError, FfiResult};
use crate::events::{EventLogger, FfiEvent, NullEventLogger};
use crate::loader::LibraryLoader;
use libloading::Library;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::os::raw::c_void;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handle to the symbols already linked into this process
#[cfg(unix)]
fn process_scope() -> FfiResult<Library> {
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn process_scope() -> FfiResult<Library> {
    libloading::os::windows::Library::this()
        .map(Library::from)
        .map_err(|e| FfiError::LibraryLoadFailed(format!("process handle: {}", e)))
}

fn lookup(library: &Library, name: &str) -> Option<FunctionAddress> {
    // Safety: the symbol is only read as an address, never called here.
    let symbol = unsafe { library.get::<*const c_void>(name.as_bytes()) }.ok()?;
    let address = *symbol as usize;
    (address != 0).then_some(FunctionAddress::from(address))
}

/// Name to address lookup over the process and explicitly loaded libraries
///
/// # Example
///
/// ```
/// # use atlas_ffi::{FfiError, SymbolResolver};
/// let resolver = SymbolResolver::new().unwrap();
/// let err = resolver.resolve("no_such_symbol_xyz").unwrap_err();
/// assert_eq!(err, FfiError::SymbolNotFound("no_such_symbol_xyz".to_string()));
/// ```
pub struct SymbolResolver {
    process: Library,
    libraries: RwLock<LibraryLoader>,
    cache: Mutex<HashMap<String, FunctionAddress>>,
    cache_enabled: bool,
    events: Arc<dyn EventLogger>,
}

impl SymbolResolver {
    /// Resolver over the process scope with default search paths
    pub fn new() -> FfiResult<Self> {
        Ok(Self {
            process: process_scope()?,
            libraries: RwLock::new(LibraryLoader::new()),
            cache: Mutex::new(HashMap::new()),
            cache_enabled: true,
            events: Arc::new(NullEventLogger),
        })
    }

    /// Prepend library search paths, in priority order
    pub fn with_search_paths(self, paths: &[PathBuf]) -> Self {
        {
            let mut libraries = self.libraries.write();
            for path in paths.iter().rev() {
                libraries.add_search_path(path.clone());
            }
        }
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_logger(mut self, events: Arc<dyn EventLogger>) -> Self {
        self.events = events;
        self
    }

    /// Address of the exported symbol `name`
    pub fn resolve(&self, name: &str) -> FfiResult<FunctionAddress> {
        if self.cache_enabled {
            if let Some(address) = self.cache.lock().get(name) {
                trace!(name, %address, "symbol cache hit");
                return Ok(*address);
            }
        }

        // The read guard is held until the cache insert so a concurrent load
        // cannot clear the cache between lookup and insert.
        let libraries = self.libraries.read();
        let found = lookup(&self.process, name)
            .or_else(|| libraries.libraries().find_map(|(_, lib)| lookup(lib, name)));

        match found {
            Some(address) => {
                if self.cache_enabled {
                    self.cache.lock().insert(name.to_string(), address);
                }
                debug!(name, %address, "resolved symbol");
                self.events.log(FfiEvent::SymbolResolved {
                    name: name.to_string(),
                    address: address.as_usize(),
                });
                Ok(address)
            }
            None => {
                debug!(name, "symbol not found");
                self.events.log(FfiEvent::SymbolMissing {
                    name: name.to_string(),
                });
                Err(FfiError::SymbolNotFound(name.to_string()))
            }
        }
    }

    /// Load a library into the resolver's search set
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers; it must be trusted.
    pub unsafe fn load_library(&self, name: &str) -> FfiResult<PathBuf> {
        let mut libraries = self.libraries.write();
        let before = libraries.loaded_count();
        let path = libraries.load(name)?;

        if libraries.loaded_count() != before {
            self.cache.lock().clear();
            self.events.log(FfiEvent::LibraryLoaded {
                name: name.to_string(),
                path: path.clone(),
            });
        }
        Ok(path)
    }

    /// Number of libraries loaded through this resolver
    pub fn loaded_count(&self) -> usize {
        self.libraries.read().loaded_count()
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.libraries.read().search_paths().to_vec()
    }

    /// Number of cached name lookups
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("loaded", &self.loaded_count())
            .field("cached", &self.cached_count())
            .field("cache_enabled", &self.cache_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLogger;

    #[test]
    fn test_symbol_not_found() {
        let resolver = SymbolResolver::new().unwrap();
        assert_eq!(
            resolver.resolve("atlas_ffi_missing_symbol"),
            Err(FfiError::SymbolNotFound("atlas_ffi_missing_symbol".to_string()))
        );
        assert_eq!(resolver.cached_count(), 0);
    }

    #[test]
    fn test_nul_in_name_is_not_found() {
        let resolver = SymbolResolver::new().unwrap();
        assert!(matches!(
            resolver.resolve("mal\0loc"),
            Err(FfiError::SymbolNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolves_libc_symbol_and_caches() {
        let resolver = SymbolResolver::new().unwrap();
        let first = resolver.resolve("strlen").unwrap();
        assert!(!first.is_null());
        assert_eq!(resolver.cached_count(), 1);
        assert_eq!(resolver.resolve("strlen").unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_disabled() {
        let resolver = SymbolResolver::new().unwrap().with_cache(false);
        let a = resolver.resolve("strlen").unwrap();
        let b = resolver.resolve("strlen").unwrap();
        assert_eq!(a, b);
        assert_eq!(resolver.cached_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_load_keeps_cache() {
        let events = MemoryEventLogger::new();
        let resolver = SymbolResolver::new()
            .unwrap()
            .with_logger(Arc::new(events.clone()));
        resolver.resolve("strlen").unwrap();
        assert_eq!(resolver.cached_count(), 1);

        let err = unsafe { resolver.load_library("atlas_ffi_no_such_library") }.unwrap_err();
        assert_eq!(
            err,
            FfiError::LibraryNotFound("atlas_ffi_no_such_library".to_string())
        );
        assert_eq!(resolver.loaded_count(), 0);
        assert_eq!(resolver.cached_count(), 1);
        assert_eq!(events.entries().len(), 1);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_loading_library_clears_cache() {
        let events = MemoryEventLogger::new();
        let resolver = SymbolResolver::new()
            .unwrap()
            .with_logger(Arc::new(events.clone()));
        resolver.resolve("strlen").unwrap();
        assert_eq!(resolver.cached_count(), 1);

        let path = unsafe { resolver.load_library("libm.so.6") }.unwrap();
        assert!(path.to_string_lossy().contains("libm.so.6"));
        assert_eq!(resolver.loaded_count(), 1);
        assert_eq!(resolver.cached_count(), 0);

        let cos = resolver.resolve("cos").unwrap();
        assert!(!cos.is_null());
        assert_eq!(resolver.cached_count(), 1);

        // same module set, so the cache survives a repeated load
        let again = unsafe { resolver.load_library("libm.so.6") }.unwrap();
        assert_eq!(again, path);
        assert_eq!(resolver.loaded_count(), 1);
        assert_eq!(resolver.cached_count(), 1);

        let loads = events
            .entries()
            .iter()
            .filter(|e| matches!(e.event, FfiEvent::LibraryLoaded { .. }))
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_search_paths_prepended_in_order() {
        let paths = [PathBuf::from("/first"), PathBuf::from("/second")];
        let resolver = SymbolResolver::new().unwrap().with_search_paths(&paths);
        let search = resolver.search_paths();
        assert_eq!(&search[..2], &paths[..]);
    }
}
