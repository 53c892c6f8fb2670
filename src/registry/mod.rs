//! Registration tables and process-wide registries.
//!
//! Three registries back the bridge:
//!
//! - [`TypeTable`]: the statically built registration table mapping a
//!   managed type identifier to the library and symbols that describe it.
//!   Populated by generated binding code, or loaded from a TOML manifest.
//! - [`TypeRegistry`]: the reverse map from foreign metatype to managed
//!   type, populated as metatypes are resolved and consulted when foreign
//!   code hands back a metatype we must name.
//! - [`ObjectRegistry`]: deduplicates inbound class references so one
//!   foreign instance maps to one managed proxy.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metadata::Metatype;
use crate::runtime::ForeignRuntime;
use crate::value::ManagedType;

/// Where to find a registered type's metadata: the library that exports it
/// and the symbols generated for it. Absent symbols mean the type does not
/// carry that record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRegistration {
    /// Library exporting the type's metadata records.
    pub library: PathBuf,
    /// Nominal type descriptor symbol.
    #[serde(default)]
    pub descriptor_symbol: Option<String>,
    /// Direct type metadata symbol.
    #[serde(default)]
    pub metadata_symbol: Option<String>,
    /// Value witness table symbol.
    #[serde(default)]
    pub witness_table_symbol: Option<String>,
    /// Zero-argument metatype accessor export, the fallback when no direct
    /// metadata symbol exists and the only path for class types.
    #[serde(default)]
    pub metatype_accessor: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    types: HashMap<String, TypeRegistration>,
}

/// The registration table: managed type identifier → metadata location.
#[derive(Debug, Default)]
pub struct TypeTable {
    entries: Mutex<HashMap<String, TypeRegistration>>,
}

impl TypeTable {
    pub fn new() -> Self {
        TypeTable::default()
    }

    /// Register one type. Later registrations replace earlier ones.
    pub fn register(&self, name: impl Into<String>, registration: TypeRegistration) {
        self.entries.lock().insert(name.into(), registration);
    }

    /// Look up a registration by managed type identifier.
    pub fn lookup(&self, name: &str) -> Option<TypeRegistration> {
        self.entries.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Parse a TOML manifest of registrations.
    ///
    /// ```toml
    /// [types."Shapes.Rectangle"]
    /// library = "/opt/shapes/libShapes.dylib"
    /// descriptor_symbol = "$s6Shapes9RectangleVMn"
    /// metadata_symbol = "$s6Shapes9RectangleVN"
    /// witness_table_symbol = "$s6Shapes9RectangleVWV"
    /// ```
    pub fn from_manifest_str(text: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(text)?;
        let table = TypeTable::new();
        for (name, registration) in manifest.types {
            table.register(name, registration);
        }
        Ok(table)
    }

    /// Load a TOML manifest from disk.
    pub fn load_manifest(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_manifest_str(&text)
    }
}

/// Reverse registry: foreign metatype → managed type.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    entries: Mutex<HashMap<Metatype, ManagedType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    /// Record a resolved metatype under its managed type.
    pub fn record(&self, metatype: Metatype, ty: ManagedType) {
        self.entries.lock().entry(metatype).or_insert(ty);
    }

    /// The managed type registered for a metatype, if any.
    pub fn try_resolve(&self, metatype: Metatype) -> Option<ManagedType> {
        self.entries.lock().get(&metatype).cloned()
    }
}

struct ObjectInstance {
    handle: *mut c_void,
    class: String,
    runtime: Arc<ForeignRuntime>,
}

// The handle is a refcounted foreign object; the foreign runtime's
// retain/release are atomic.
unsafe impl Send for ObjectInstance {}
unsafe impl Sync for ObjectInstance {}

impl Drop for ObjectInstance {
    fn drop(&mut self) {
        self.runtime.release(self.handle);
    }
}

/// Managed proxy for a foreign class instance.
///
/// All live proxies for the same foreign instance share one underlying
/// reference, which is released exactly once when the last clone drops.
#[derive(Clone)]
pub struct ObjectRef {
    inner: Arc<ObjectInstance>,
}

impl ObjectRef {
    pub fn handle(&self) -> *mut c_void {
        self.inner.handle
    }

    /// The registered class identifier this proxy was wrapped under.
    pub fn class(&self) -> &str {
        &self.inner.class
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectRef({} @ {:p})", self.inner.class, self.inner.handle)
    }
}

/// Deduplicating registry of live object proxies.
#[derive(Default)]
pub struct ObjectRegistry {
    entries: Mutex<HashMap<usize, Weak<ObjectInstance>>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        ObjectRegistry::default()
    }

    /// Wrap an inbound instance pointer.
    ///
    /// With `takes_ownership` false the wrapper performs one additional
    /// retain, so the wrapper's eventual release and the original call's
    /// ownership stay individually balanced. With `takes_ownership` true
    /// the inbound reference is adopted, and released immediately if a
    /// live proxy already owns one.
    pub fn wrap(
        &self,
        handle: *mut c_void,
        class: &str,
        takes_ownership: bool,
        runtime: &Arc<ForeignRuntime>,
    ) -> ObjectRef {
        let key = handle as usize;
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            if takes_ownership {
                // The proxy already owns a reference; drop the surplus one
                // that came with this call.
                runtime.release(handle);
            }
            return ObjectRef { inner: existing };
        }

        if !takes_ownership {
            runtime.retain(handle);
        }
        let instance = Arc::new(ObjectInstance {
            handle,
            class: class.to_string(),
            runtime: Arc::clone(runtime),
        });
        entries.insert(key, Arc::downgrade(&instance));
        entries.retain(|_, weak| weak.strong_count() > 0);
        ObjectRef { inner: instance }
    }

    /// Whether a live proxy exists for the given instance pointer.
    pub fn contains(&self, handle: *mut c_void) -> bool {
        self.entries
            .lock()
            .get(&(handle as usize))
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }
}
