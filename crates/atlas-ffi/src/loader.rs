//! Shared library loading
//!
//! Wraps `libloading` with the file naming rules of each platform and an
//! ordered list of directories to probe. Libraries stay open for the life of
//! the loader and are kept in the order they were opened, so symbol lookup
//! can walk them deterministically.

use crate::error::{FfiError, FfiResult};
use libloading::Library;
use std::path::{Path, PathBuf};
use tracing::debug;

#[cfg(target_os = "windows")]
const NAME_PATTERNS: &[(&str, &str)] = &[("", "dll"), ("lib", "dll")];

#[cfg(target_os = "macos")]
const NAME_PATTERNS: &[(&str, &str)] = &[
    ("lib", "dylib"),
    ("lib", "so"),
    ("", "dylib"),
    ("", "so"),
];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const NAME_PATTERNS: &[(&str, &str)] = &[("lib", "so"), ("", "so")];

/// Opens shared libraries by short name, file name, or absolute path
///
/// # Safety
///
/// Opening a library runs its initializers inside this process. Only load
/// libraries you trust.
pub struct LibraryLoader {
    /// Open libraries, oldest first
    open: Vec<(PathBuf, Library)>,
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    pub fn new() -> Self {
        Self {
            open: Vec::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Directories probed when no custom path matches
    ///
    /// The working directory always comes first, followed by the usual
    /// system library directories of the target.
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = std::env::current_dir().into_iter().collect();

        #[cfg(target_os = "linux")]
        {
            paths.extend(["/usr/lib", "/usr/local/lib", "/lib"].map(PathBuf::from));
            paths.push(PathBuf::from(format!(
                "/usr/lib/{}-linux-gnu",
                std::env::consts::ARCH
            )));
            if cfg!(target_pointer_width = "64") {
                paths.extend(["/usr/lib64", "/lib64"].map(PathBuf::from));
            }
        }

        #[cfg(target_os = "macos")]
        paths.extend(["/usr/lib", "/usr/local/lib", "/opt/homebrew/lib"].map(PathBuf::from));

        #[cfg(target_os = "windows")]
        {
            let root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
            paths.push(Path::new(&root).join("System32"));
        }

        paths
    }

    /// File names tried for `name` inside a single directory
    fn candidates(name: &str) -> impl Iterator<Item = String> + '_ {
        // "libm.so.6" style names are tried verbatim before any decoration
        let verbatim = Path::new(name)
            .extension()
            .map(|_| name.to_string())
            .into_iter();
        verbatim.chain(
            NAME_PATTERNS
                .iter()
                .map(move |(prefix, ext)| format!("{prefix}{name}.{ext}")),
        )
    }

    /// First existing file for `name` across the search paths
    fn find(&self, name: &str) -> Option<PathBuf> {
        let direct = Path::new(name);
        if direct.is_absolute() {
            return direct.is_file().then(|| direct.to_path_buf());
        }

        self.search_paths.iter().find_map(|dir| {
            Self::candidates(name)
                .map(|file| dir.join(file))
                .find(|path| path.is_file())
        })
    }

    /// Open a library and return the path it was opened from
    ///
    /// Opening the same path twice is a no-op. A name carrying a file
    /// extension that no search path contains, such as `libc.so.6`, is passed
    /// to the system loader so its own search order applies.
    ///
    /// # Safety
    ///
    /// The library's initialization code runs during this call.
    pub unsafe fn load(&mut self, name: &str) -> FfiResult<PathBuf> {
        let path = self
            .find(name)
            .or_else(|| Path::new(name).extension().map(|_| PathBuf::from(name)))
            .ok_or_else(|| FfiError::LibraryNotFound(name.to_string()))?;

        if !self.is_loaded(&path) {
            let library = Library::new(&path).map_err(|err| {
                FfiError::LibraryLoadFailed(format!("{}: {}", path.display(), err))
            })?;
            debug!(name, path = %path.display(), "opened library");
            self.open.push((path.clone(), library));
        }
        Ok(path)
    }

    pub fn is_loaded(&self, path: &Path) -> bool {
        self.open.iter().any(|(open, _)| open == path)
    }

    pub(crate) fn libraries(&self) -> impl Iterator<Item = (&Path, &Library)> {
        self.open.iter().map(|(path, lib)| (path.as_path(), lib))
    }

    /// Probe `path` before every existing search path
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn loaded_count(&self) -> usize {
        self.open.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}
