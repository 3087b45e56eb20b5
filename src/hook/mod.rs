//! The import hook: logical module names in, loaded extension modules out.
//!
//! [`ImportHook`] is the policy layer between a host runtime's module resolution and the
//! [`crate::loader::Loader`]. For a dotted module name it
//!
//! 1. derives candidate archive paths and the entry point name ([`NamingConvention`])
//! 2. finds the first candidate present in the [`ArchiveIndex`]
//! 3. loads it, resolving dependency DLLs from the same archive
//! 4. caches the resulting [`ModuleObject`] under the module name
//!
//! Every name is loaded at most once. Concurrent requests for a name that is not cached yet
//! serialize on a single load lock; the first one loads, the others find the published module
//! when they get the lock. Cache hits never take the lock.
//!
//! Entry points that import further modules through the same hook on the same thread are not
//! supported: the load lock is not re-entrant.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memimport::{
//!     archive::ZipArchiveIndex,
//!     hook::{HookConfig, ImportHook},
//!     loader::{Loader, LoaderConfig, NativeExecutor, NativeMemory, SystemLibraries},
//! };
//!
//! let archive = ZipArchiveIndex::from_file("library.zip".as_ref())?;
//! let loader = Loader::new(
//!     Arc::new(NativeMemory::new()),
//!     // SAFETY: library.zip is built and shipped together with this application
//!     Arc::new(unsafe { NativeExecutor::new() }),
//!     LoaderConfig::default(),
//! );
//! let hook = ImportHook::new(
//!     archive,
//!     loader,
//!     HookConfig::new().with_host_resolver(SystemLibraries).verbose(),
//! );
//!
//! let socket = hook.load("_socket")?;
//! println!("{} from {}", socket.name, socket.file);
//! assert!(Arc::ptr_eq(&socket, &hook.load("_socket")?));
//! # Ok::<(), memimport::Error>(())
//! ```

mod config;
mod naming;

use std::{fmt, sync::Arc, sync::Mutex};

use dashmap::DashMap;

use crate::{
    archive::ArchiveIndex,
    loader::{DependencyResolver, LoadedModule, Loader, ModuleRegistry, Symbol},
    Error, Result,
};

pub use config::{Diagnostics, HookConfig};
pub use naming::{NamingConvention, RuntimeVersion};

/// A module the archive can provide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loadable {
    /// The logical module name
    pub name: String,
    /// Path of the image inside the archive
    pub path: String,
    /// Export that initializes the module
    pub entry_point: String,
}

/// A loaded extension module, as handed to the host.
#[derive(Debug)]
pub struct ModuleObject {
    /// The logical module name
    pub name: String,
    /// `<archive>/<path>`
    pub file: String,
    /// Display name of the hook that loaded the module
    pub loader: String,
    /// The mapped library and the object its entry point returned
    pub module: LoadedModule,
}

/// Dependency lookup inside the archive, with an optional fallback for host libraries.
struct ArchiveResolver<'a> {
    archive: &'a dyn ArchiveIndex,
    host: Option<&'a (dyn DependencyResolver + Send + Sync)>,
}

impl DependencyResolver for ArchiveResolver<'_> {
    fn locate(&self, name: &str) -> Option<Vec<u8>> {
        if let Some(path) = self.archive.find(name) {
            match self.archive.read(&path) {
                Ok(data) => return Some(data),
                Err(error) => log::warn!("{}: reading {} failed - {}", self.archive.name(), path, error),
            }
        }
        self.host.and_then(|host| host.locate(name))
    }

    fn host_symbol(&self, library: &str, symbol: &Symbol) -> Option<u64> {
        self.host
            .and_then(|host| host.host_symbol(library, symbol))
    }
}

/// Loads extension modules out of an archive, each at most once.
pub struct ImportHook<A: ArchiveIndex> {
    archive: A,
    loader: Loader,
    config: HookConfig,
    cache: DashMap<String, Arc<ModuleObject>>,
    registry: Mutex<ModuleRegistry>,
}

impl<A: ArchiveIndex> ImportHook<A> {
    /// Creates a hook over `archive`.
    pub fn new(archive: A, loader: Loader, config: HookConfig) -> ImportHook<A> {
        ImportHook {
            archive,
            loader,
            config,
            cache: DashMap::new(),
            registry: Mutex::new(ModuleRegistry::new()),
        }
    }

    /// The archive modules are loaded from.
    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// The active configuration.
    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    /// Decides whether the archive provides `name`.
    ///
    /// Returns the first candidate path present in the archive, or `None`.
    pub fn resolve(&self, name: &str) -> Option<Loadable> {
        let naming = &self.config.naming;
        let path = naming
            .candidates(name)
            .into_iter()
            .find(|candidate| self.archive.has(candidate))?;

        let Some(entry_point) = naming.entry_point(name) else {
            log::debug!(
                "no entry point convention for runtime {}",
                naming.version()
            );
            return None;
        };

        Some(Loadable {
            name: name.to_string(),
            path,
            entry_point,
        })
    }

    /// Loads `name`, or returns the module loaded for it before.
    ///
    /// # Errors
    ///
    /// Every failure is an [`Error::Import`] naming the module. Its source is
    /// [`Error::NotFoundInArchive`] if the archive does not provide the module, otherwise the
    /// error of the archive or the loader. A failed load leaves nothing behind.
    pub fn load(&self, name: &str) -> Result<Arc<ModuleObject>> {
        if let Some(module) = self.cached(name) {
            return Ok(module);
        }

        self.load_locked(name).map_err(|error| Error::Import {
            module: name.to_string(),
            source: Box::new(error),
        })
    }

    fn cached(&self, name: &str) -> Option<Arc<ModuleObject>> {
        let module = self.cache.get(name).map(|entry| Arc::clone(entry.value()))?;
        self.config.diagnostics.line(format_args!(
            "import {} # previously loaded from archive {}",
            name,
            self.archive.name()
        ));
        Some(module)
    }

    fn load_locked(&self, name: &str) -> Result<Arc<ModuleObject>> {
        let mut registry = lock!(self.registry)?;
        if let Some(module) = self.cached(name) {
            return Ok(module);
        }

        let loadable = self
            .resolve(name)
            .ok_or_else(|| Error::NotFoundInArchive(name.to_string()))?;
        self.config.diagnostics.line(format_args!(
            "# found {} in archive {}",
            loadable.path,
            self.archive.name()
        ));

        let data = self.archive.read(&loadable.path)?;
        let resolver = ArchiveResolver {
            archive: &self.archive,
            host: self.config.host.as_deref(),
        };
        let module = self.loader.load(
            data,
            &loadable.entry_point,
            &loadable.path,
            &resolver,
            &mut registry,
        )?;

        let object = Arc::new(ModuleObject {
            name: name.to_string(),
            file: format!("{}/{}", self.archive.name(), loadable.path),
            loader: self.to_string(),
            module,
        });
        self.cache.insert(name.to_string(), Arc::clone(&object));
        log::debug!("{}: loaded from {}", name, object.file);
        self.config.diagnostics.line(format_args!(
            "import {} # loaded from archive {}",
            name, object.file
        ));

        Ok(object)
    }

    /// Forgets `name` and unloads its library.
    ///
    /// The library's detach initializers run now; its memory is released once nothing refers
    /// to it anymore, including [`ModuleObject`]s the host still holds.
    ///
    /// Returns `false` if `name` was not loaded.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] for a poisoned load lock, or an error of the detach initializers.
    pub fn unload(&self, name: &str) -> Result<bool> {
        let mut registry = lock!(self.registry)?;
        let Some((_, object)) = self.cache.remove(name) else {
            return Ok(false);
        };

        self.loader
            .unload(object.module.name(), &mut registry)
            .map(|_| true)
    }

    /// Returns `true` if `name` is loaded.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    /// The names of all loaded modules, sorted.
    pub fn loaded_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.iter().map(|entry| entry.key().clone()).collect();
        names.sort_unstable();
        names
    }
}

impl<A: ArchiveIndex> fmt::Display for ImportHook<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ImportHook archive '{}'>", self.archive.name())
    }
}

impl<A: ArchiveIndex> fmt::Debug for ImportHook<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportHook")
            .field("archive", &self.archive.name())
            .field("loaded", &self.loaded_names())
            .finish()
    }
}
