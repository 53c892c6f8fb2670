//! Dynamic Library Resolver
//!
//! Safe wrapper around libloading for opening the foreign runtime's shared
//! libraries and resolving exported symbols. Two candidate locations are
//! tried in order: the literal path, then the app-relative
//! `Frameworks/<name>.framework/<name>` convention. A failed open reports
//! every attempted path together with the loader's error text, since a miss
//! here is almost always a configuration problem.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::ops::BitOr;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, LoadAttempt, LoadAttempts, Result};

#[cfg(unix)]
type PlatformLibrary = libloading::os::unix::Library;
#[cfg(not(unix))]
type PlatformLibrary = libloading::Library;

/// Loader mode flags, composed per platform-loader semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode(u32);

impl OpenMode {
    pub const LAZY: OpenMode = OpenMode(1);
    pub const NOW: OpenMode = OpenMode(2);
    pub const LOCAL: OpenMode = OpenMode(4);
    pub const GLOBAL: OpenMode = OpenMode(8);
    pub const NO_LOAD: OpenMode = OpenMode(16);
    pub const NO_DELETE: OpenMode = OpenMode(128);
    pub const FIRST: OpenMode = OpenMode(256);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// A loaded shared library.
///
/// The handle is released exactly once, whether through an explicit
/// [`Library::close`] or on drop.
pub struct Library {
    /// Path of the candidate that actually loaded.
    file_name: PathBuf,
    inner: Mutex<Option<PlatformLibrary>>,
    /// Cached symbol addresses.
    symbols: Mutex<HashMap<String, usize>>,
}

impl Library {
    /// Open a library, searching the literal path first and the
    /// app-relative framework convention second.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        if mode.is_empty() {
            return Err(Error::Validation(format!(
                "open mode for {} must not be empty",
                path.display()
            )));
        }

        let mut attempts = Vec::new();
        for candidate in candidate_paths(path) {
            match open_platform(&candidate, mode) {
                Ok(lib) => {
                    log::debug!("loaded library {}", candidate.display());
                    return Ok(Library {
                        file_name: candidate,
                        inner: Mutex::new(Some(lib)),
                        symbols: Mutex::new(HashMap::new()),
                    });
                }
                Err(detail) => {
                    attempts.push(LoadAttempt {
                        exists: candidate.exists(),
                        path: candidate,
                        detail,
                    });
                }
            }
        }

        Err(Error::LibraryLoad {
            name: path.display().to_string(),
            attempts: LoadAttempts(attempts),
        })
    }

    /// Path of the file that was actually loaded, which may be the
    /// framework-convention candidate rather than the literal path.
    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    /// Resolve an exported symbol to its address.
    pub fn find_symbol(&self, name: &str) -> Result<*const c_void> {
        if let Some(&addr) = self.symbols.lock().get(name) {
            return Ok(addr as *const c_void);
        }

        let c_name = CString::new(name).map_err(|_| {
            Error::Validation(format!("symbol name {name:?} contains a NUL byte"))
        })?;

        let guard = self.inner.lock();
        let lib = guard.as_ref().ok_or_else(|| {
            Error::Validation(format!("library {} already closed", self.file_name.display()))
        })?;

        // Safety: the symbol is used as a raw address; typed use happens at
        // the call sites that know the export's signature.
        let addr = unsafe {
            lib.get::<*mut c_void>(c_name.as_bytes_with_nul())
                .map(|sym| *sym as usize)
                .map_err(|e| Error::SymbolNotFound {
                    symbol: name.to_string(),
                    library: self.file_name.display().to_string(),
                    detail: e.to_string(),
                })?
        };

        log::trace!("resolved {} in {}", name, self.file_name.display());
        self.symbols.lock().insert(name.to_string(), addr);
        Ok(addr as *const c_void)
    }

    /// Release the handle. Safe to call at most once; a second call (or a
    /// later drop) is a no-op.
    pub fn close(&self) {
        if let Some(lib) = self.inner.lock().take() {
            drop(lib);
        }
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Candidate locations for a library, in search order.
pub fn candidate_paths(path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![path.to_path_buf()];
    if let Some(framework) = framework_candidate(path) {
        candidates.push(framework);
    }
    candidates
}

/// The app-relative `Frameworks/<name>.framework/<name>` location, rooted
/// at the running executable's directory.
fn framework_candidate(path: &Path) -> Option<PathBuf> {
    let name = path.file_stem()?.to_str()?;
    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    Some(exe_dir.join(format!("Frameworks/{name}.framework/{name}")))
}

#[cfg(unix)]
fn open_platform(path: &Path, mode: OpenMode) -> std::result::Result<PlatformLibrary, String> {
    // Safety: loading a shared library runs its initializers. The caller
    // selected the library; we only translate the mode bits.
    unsafe {
        PlatformLibrary::open(Some(path), mode.bits() as libc::c_int).map_err(|e| e.to_string())
    }
}

#[cfg(not(unix))]
fn open_platform(path: &Path, _mode: OpenMode) -> std::result::Result<PlatformLibrary, String> {
    // The mode bits follow POSIX dlopen semantics; the fallback loader has
    // no equivalent and ignores them.
    unsafe { PlatformLibrary::new(path).map_err(|e| e.to_string()) }
}
