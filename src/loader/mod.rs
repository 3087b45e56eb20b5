//! The in-memory library loader.
//!
//! [`Loader`] does for a byte buffer what the operating system loader does for a DLL on disk:
//! it maps the image into fresh memory, applies base relocations, binds imports (loading
//! dependencies recursively), seals every page with the protection its sections ask for, runs
//! the static initializers and finally calls a named entry point.
//!
//! # Architecture
//!
//! A load runs as a sequence of steps over one [`MappedRegion`]:
//!
//! 1. **Validation** - [`crate::file::Image`] checks the headers, the target machine is
//!    compared against [`LoaderConfig::machine`]. Nothing is reserved before this succeeds.
//! 2. **Layout** - `SizeOfImage` bytes are reserved from the [`MemoryBackend`], headers and
//!    section data are copied in. Uninitialized data stays zero.
//! 3. **Relocation** - see [`relocate`]
//! 4. **Exports** - the export table is parsed and the library enters the
//!    [`ModuleRegistry`] as [`ModuleState::Loading`]
//! 5. **Binding** - every import is resolved, dependencies are mapped through the
//!    [`DependencyResolver`] and the IAT slots are written
//! 6. **Sealing** - page protections are applied; until here every page is read-write and
//!    never executable
//! 7. **Initialization** - TLS callbacks, then `DllMain`, through the [`Executor`]
//! 8. **Entry point** - the requested export is called and its result becomes the module
//!    object
//!
//! # Failure handling
//!
//! Every library a call to [`Loader::load`] creates is recorded. If any step fails, those
//! libraries are detached (if their initializers already ran), removed from the registry and
//! released, newest first. Nothing a failed load touched stays reachable.
//!
//! # Trust boundary
//!
//! Loading an image means executing its code. The loader performs no sandboxing of any kind;
//! callers must only hand it images from sources they trust. [`NativeExecutor::new`] is
//! `unsafe` to make that contract explicit.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memimport::loader::{
//!     Loader, LoaderConfig, ModuleRegistry, NativeExecutor, NativeMemory, SystemLibraries,
//! };
//!
//! let loader = Loader::new(
//!     Arc::new(NativeMemory::new()),
//!     // SAFETY: spam.pyd ships with this application
//!     Arc::new(unsafe { NativeExecutor::new() }),
//!     LoaderConfig::default(),
//! );
//!
//! let mut registry = ModuleRegistry::new();
//! let module = loader.load(
//!     std::fs::read("spam.pyd")?,
//!     "PyInit_spam",
//!     "spam.pyd",
//!     &SystemLibraries,
//!     &mut registry,
//! )?;
//! println!("{} mapped at 0x{:X}", module.name(), module.image().base());
//! # Ok::<(), memimport::Error>(())
//! ```

mod config;
mod executor;
mod exports;
mod host;
mod image;
mod imports;
mod memory;
mod protect;
mod registry;
mod relocate;
mod tls;

use std::{path::Path, sync::Arc};

use goblin::pe::data_directories::DataDirectoryType;

use crate::{
    file::{section_copy_len, section_extent, section_name, Image},
    Error, Result,
};

pub use config::{LoaderConfig, DEFAULT_MAX_DEPTH};
pub use executor::{
    Executor, Initializer, NativeExecutor, DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH,
};
pub use exports::{ExportTarget, ModuleExports, Symbol};
pub use host::{NoDependencies, SystemLibraries};
pub use image::{LoadedImage, LoadedModule, LoadedSection};
pub use imports::{parse_imports, ImportDescriptor, ImportEntry};
pub use memory::{
    HeapMemory, MappedRegion, MemoryBackend, NativeMemory, Protection, DEFAULT_HEAP_BASE,
    DEFAULT_MAX_RESERVATION,
};
pub use protect::ProtectedRange;
pub use registry::{ModuleRegistry, ModuleState};
pub use relocate::relocate;
pub use tls::{parse_tls, TlsDirectory};

/// Supplies the images of dependencies while imports are bound.
///
/// Called from inside a load, possibly several levels deep. The resolver only provides bytes;
/// mapping them and detecting cycles is the loader's job.
pub trait DependencyResolver {
    /// Returns the image of the library `name` as it appears in an import table, or `None`
    /// if this resolver does not provide it.
    fn locate(&self, name: &str) -> Option<Vec<u8>>;

    /// Address of `symbol` in a library the host process provides.
    ///
    /// Consulted only for libraries [`DependencyResolver::locate`] does not provide.
    fn host_symbol(&self, _library: &str, _symbol: &Symbol) -> Option<u64> {
        None
    }
}

/// Maps PE images into memory and runs them.
///
/// The loader itself holds no per-library state; everything it maps goes into the
/// [`ModuleRegistry`] handed to each call. One loader can serve several registries, and one
/// registry must only be used by one load at a time.
#[derive(Clone)]
pub struct Loader {
    memory: Arc<dyn MemoryBackend>,
    executor: Arc<dyn Executor>,
    config: LoaderConfig,
}

impl Loader {
    /// Creates a loader.
    ///
    /// ## Arguments
    /// * `memory`   - Where images are mapped
    /// * `executor` - How initializers and entry points are run
    /// * `config`   - What is accepted and how it is treated
    #[must_use]
    pub fn new(
        memory: Arc<dyn MemoryBackend>,
        executor: Arc<dyn Executor>,
        config: LoaderConfig,
    ) -> Loader {
        Loader {
            memory,
            executor,
            config,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Loads a library and calls `entry_point`.
    ///
    /// If `registry` already holds a library called `name`, it is reused and `data` is
    /// ignored; only the entry point is called again.
    ///
    /// ## Arguments
    /// * `data`        - The raw image
    /// * `entry_point` - Name of the export to call, e.g. `PyInit_spam`
    /// * `name`        - Name the library is registered under
    /// * `resolver`    - Supplies the images of dependencies
    /// * `registry`    - The libraries loaded so far
    ///
    /// # Errors
    ///
    /// Any failure of validation, mapping, binding or initialization, as well as
    /// [`Error::EntryPointNotFound`] and [`Error::EntryPointFailed`]. On error, every library
    /// this call created is released again.
    pub fn load(
        &self,
        data: Vec<u8>,
        entry_point: &str,
        name: &str,
        resolver: &dyn DependencyResolver,
        registry: &mut ModuleRegistry,
    ) -> Result<LoadedModule> {
        let mut session = Session::new(self, resolver, registry);
        let result = session.load_module(data, entry_point, name);
        if result.is_err() {
            session.rollback();
        }
        result
    }

    /// Loads a library without calling any entry point.
    ///
    /// # Errors
    ///
    /// See [`Loader::load`].
    pub fn load_library(
        &self,
        data: Vec<u8>,
        name: &str,
        resolver: &dyn DependencyResolver,
        registry: &mut ModuleRegistry,
    ) -> Result<Arc<LoadedImage>> {
        if let Some(image) = registry.loaded(name) {
            return Ok(image);
        }

        let mut session = Session::new(self, resolver, registry);
        let result = session.map(data, name, 0);
        if result.is_err() {
            session.rollback();
        }
        result
    }

    /// Loads a library from disk and calls `entry_point`. The file name is the registry name.
    ///
    /// # Errors
    ///
    /// [`Error::FileError`] if the file cannot be read, otherwise see [`Loader::load`].
    pub fn load_file(
        &self,
        path: &Path,
        entry_point: &str,
        resolver: &dyn DependencyResolver,
        registry: &mut ModuleRegistry,
    ) -> Result<LoadedModule> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        self.load(data, entry_point, &name, resolver, registry)
    }

    /// Detaches a library and removes it from the registry.
    ///
    /// The detach initializers run at most once per library. Its memory is released once no
    /// dependent library and no [`LoadedModule`] refers to it anymore.
    ///
    /// Returns `false` if no library called `name` was registered.
    ///
    /// # Errors
    ///
    /// An error of the executor while running the detach initializers. The library is removed
    /// from the registry regardless.
    pub fn unload(&self, name: &str, registry: &mut ModuleRegistry) -> Result<bool> {
        let Some(state) = registry.remove(name) else {
            return Ok(false);
        };

        if let ModuleState::Loaded(image) = state {
            log::debug!("{}: unloading", image.name());
            if image.set_initialized(false) {
                self.detach(&image)?;
            }
        }
        Ok(true)
    }

    /// Runs the attach initializers of a sealed image.
    fn attach(&self, image: &LoadedImage) -> Result<()> {
        for callback in image.tls_callbacks() {
            self.executor.run_initializer(
                image,
                Initializer::TlsCallback,
                image.va(*callback),
                DLL_PROCESS_ATTACH,
            )?;
        }

        if let (true, Some(dll_main)) = (image.is_dll(), image.entry_point()) {
            if !self.executor.run_initializer(
                image,
                Initializer::DllMain,
                dll_main,
                DLL_PROCESS_ATTACH,
            )? {
                return Err(Error::InitializerFailed(image.name().to_string()));
            }
        }

        image.set_initialized(true);
        Ok(())
    }

    /// Runs the detach initializers. The result of `DllMain` is ignored on detach.
    fn detach(&self, image: &LoadedImage) -> Result<()> {
        for callback in image.tls_callbacks() {
            self.executor.run_initializer(
                image,
                Initializer::TlsCallback,
                image.va(*callback),
                DLL_PROCESS_DETACH,
            )?;
        }

        if let (true, Some(dll_main)) = (image.is_dll(), image.entry_point()) {
            self.executor.run_initializer(
                image,
                Initializer::DllMain,
                dll_main,
                DLL_PROCESS_DETACH,
            )?;
        }
        Ok(())
    }
}

/// State of one top-level load.
struct Session<'a> {
    loader: &'a Loader,
    resolver: &'a dyn DependencyResolver,
    registry: &'a mut ModuleRegistry,
    /// Registry names this load inserted, in creation order
    created: Vec<String>,
}

impl<'a> Session<'a> {
    fn new(
        loader: &'a Loader,
        resolver: &'a dyn DependencyResolver,
        registry: &'a mut ModuleRegistry,
    ) -> Session<'a> {
        Session {
            loader,
            resolver,
            registry,
            created: Vec::new(),
        }
    }

    fn load_module(&mut self, data: Vec<u8>, entry_point: &str, name: &str) -> Result<LoadedModule> {
        let image = match self.registry.loaded(name) {
            Some(image) => {
                log::debug!("{}: already loaded", name);
                image
            }
            None => self.map(data, name, 0)?,
        };

        let symbol = Symbol::Name(entry_point.to_string());
        let mut reached = Vec::new();
        let address = match image.exports().lookup(&symbol).cloned() {
            Some(ExportTarget::Address(rva)) => image.va(rva),
            Some(ExportTarget::Forwarder { library, symbol }) => {
                self.resolve(&library, &symbol, 0, 1, &mut reached)?
            }
            None => return Err(Error::EntryPointNotFound(entry_point.to_string())),
        };

        let owner = self.owner(&image, &reached, address);
        log::debug!(
            "{}: calling {} at 0x{:X}",
            owner.name(),
            entry_point,
            address
        );
        let object = self.loader.executor.call_entry_point(&owner, address)?;
        if object == 0 {
            return Err(Error::EntryPointFailed(entry_point.to_string()));
        }

        Ok(LoadedModule::new(image, owner, entry_point, object))
    }

    /// The loaded image `address` lies in, `image` itself unless a forwarder led elsewhere.
    ///
    /// `reached` are the libraries the forwarder chain passed through.
    fn owner(
        &self,
        image: &Arc<LoadedImage>,
        reached: &[Arc<LoadedImage>],
        address: u64,
    ) -> Arc<LoadedImage> {
        let contains = |candidate: &LoadedImage| {
            address >= candidate.base() && address - candidate.base() < candidate.size() as u64
        };
        if contains(image.as_ref()) {
            return Arc::clone(image);
        }

        reached
            .iter()
            .chain(self.registry.images())
            .find(|candidate| contains(candidate.as_ref()))
            .cloned()
            .unwrap_or_else(|| Arc::clone(image))
    }

    /// Maps, binds, seals and initializes one library.
    fn map(&mut self, data: Vec<u8>, name: &str, depth: usize) -> Result<Arc<LoadedImage>> {
        let loader = self.loader;
        let config = &loader.config;
        if depth > config.max_depth {
            return Err(Error::RecursionLimit(config.max_depth));
        }

        let image = Image::from_mem(data)?;
        if config.machine != Some(image.machine()) {
            return Err(malformed_error!(
                "{} is built for {:?}, this loader accepts {:?}",
                name,
                image.machine(),
                config.machine
            ));
        }

        let page_size = loader.memory.page_size();
        let size = align_up!(image.size_of_image() as usize, page_size);
        let preferred = image.imagebase();
        let is_64 = image.is_64();

        let mut region = loader.memory.reserve(size, Some(preferred))?;
        let base = region.base();
        log::debug!(
            "{}: reserved 0x{:X} bytes at 0x{:X} (preferred 0x{:X})",
            name,
            size,
            base,
            preferred
        );

        let headers = (image.size_of_headers() as usize).min(image.len());
        region.write(0, image.data_slice(0, headers)?)?;
        for section in image.sections() {
            let len = section_copy_len(section) as usize;
            if len == 0 {
                continue;
            }
            let raw = image.data_slice(section.pointer_to_raw_data as usize, len)?;
            region.write(section.virtual_address as usize, raw)?;
        }

        let applied = relocate(
            &mut *region,
            image.get_data_directory(DataDirectoryType::BaseRelocationTable),
            image.relocs_stripped(),
            preferred,
            is_64,
        )?;
        if applied != 0 {
            log::debug!(
                "{}: applied {} relocations, delta 0x{:X}",
                name,
                applied,
                base.wrapping_sub(preferred)
            );
        }

        let (exports, descriptors, tls) = {
            let mapped = region.read(0, region.len())?;
            (
                ModuleExports::parse(
                    mapped,
                    image.get_data_directory(DataDirectoryType::ExportTable),
                    name,
                    base,
                )?,
                parse_imports(
                    mapped,
                    image.get_data_directory(DataDirectoryType::ImportTable),
                    is_64,
                )?,
                parse_tls(
                    mapped,
                    image.get_data_directory(DataDirectoryType::TlsTable),
                    is_64,
                    base,
                )?,
            )
        };

        let exports = Arc::new(exports);
        self.registry
            .insert(name, ModuleState::Loading(Arc::clone(&exports)));
        self.created.push(name.to_string());

        let mut dependencies = Vec::new();
        for descriptor in &descriptors {
            for entry in &descriptor.entries {
                let address = self.resolve(
                    &descriptor.library,
                    &entry.symbol,
                    depth,
                    0,
                    &mut dependencies,
                )?;
                log::trace!(
                    "{}: {}!{} -> 0x{:X}",
                    name,
                    descriptor.library,
                    entry.symbol,
                    address
                );
                region.write_pointer(entry.slot as usize, address, is_64)?;
            }
        }

        let tls = tls.unwrap_or_default();
        if tls.data_size != 0 {
            log::warn!(
                "{}: 0x{:X} bytes of implicit TLS data are not set up",
                name,
                tls.data_size
            );
        }

        let sections: Vec<_> = image.sections().cloned().collect();
        let plan = protect::plan(
            &sections,
            image.size_of_headers(),
            region.len(),
            page_size,
            config.reject_write_execute,
            name,
        )?;
        for range in &plan.ranges {
            region.protect(range.rva as usize, range.size as usize, range.protection)?;
        }
        log::debug!(
            "{}: sealed {} page ranges, bound against {} libraries",
            name,
            plan.ranges.len(),
            dependencies.len()
        );

        let loaded = Arc::new(LoadedImage {
            name: name.to_string(),
            region,
            preferred_base: preferred,
            machine: image.machine(),
            is_dll: image.is_dll(),
            entry_point: image.entry_point(),
            sections: sections
                .iter()
                .zip(&plan.sections)
                .map(|(section, protection)| LoadedSection {
                    name: section_name(section),
                    virtual_address: section.virtual_address,
                    virtual_size: section_extent(section) as u32,
                    characteristics: section.characteristics,
                    declared: Protection::from_characteristics(section.characteristics),
                    protection: *protection,
                })
                .collect(),
            ranges: plan.ranges,
            exports,
            tls_callbacks: tls.callbacks,
            dependencies,
            initialized: false.into(),
        });
        self.registry
            .insert(name, ModuleState::Loaded(Arc::clone(&loaded)));

        if config.run_initializers {
            loader.attach(&loaded)?;
        }

        Ok(loaded)
    }

    /// The registry entry of `library`, mapping it first if the resolver provides it.
    fn library(&mut self, library: &str, depth: usize) -> Result<Option<ModuleState>> {
        if let Some(state) = self.registry.get(library) {
            return Ok(Some(state.clone()));
        }

        let Some(data) = self.resolver.locate(library) else {
            return Ok(None);
        };

        log::debug!("loading dependency {} at depth {}", library, depth + 1);
        let image = self
            .map(data, library, depth + 1)
            .map_err(|error| Error::UnresolvedImport {
                dependency: library.to_string(),
                symbol: None,
                source: Some(Box::new(error)),
            })?;
        Ok(Some(ModuleState::Loaded(image)))
    }

    /// Resolves `library!symbol` to an address, following forwarders.
    ///
    /// Every loaded library reached is added to `dependencies`.
    fn resolve(
        &mut self,
        library: &str,
        symbol: &Symbol,
        depth: usize,
        hops: usize,
        dependencies: &mut Vec<Arc<LoadedImage>>,
    ) -> Result<u64> {
        if hops > self.loader.config.max_depth {
            return Err(Error::RecursionLimit(self.loader.config.max_depth));
        }

        let Some(state) = self.library(library, depth)? else {
            return self
                .resolver
                .host_symbol(library, symbol)
                .ok_or_else(|| Error::UnresolvedImport {
                    dependency: library.to_string(),
                    symbol: None,
                    source: None,
                });
        };

        if let ModuleState::Loaded(image) = &state {
            if !dependencies
                .iter()
                .any(|known| Arc::ptr_eq(known, image))
            {
                dependencies.push(Arc::clone(image));
            }
        }

        let exports = state.exports();
        match exports.lookup(symbol) {
            Some(ExportTarget::Address(rva)) => Ok(exports.base + u64::from(*rva)),
            Some(ExportTarget::Forwarder {
                library: next,
                symbol: next_symbol,
            }) => {
                log::trace!("{}!{} forwards to {}!{}", library, symbol, next, next_symbol);
                self.resolve(next, next_symbol, depth, hops + 1, dependencies)
            }
            None => Err(Error::UnresolvedImport {
                dependency: library.to_string(),
                symbol: Some(symbol.to_string()),
                source: None,
            }),
        }
    }

    /// Releases everything this session created, newest first.
    fn rollback(&mut self) {
        while let Some(name) = self.created.pop() {
            let Some(state) = self.registry.remove(&name) else {
                continue;
            };
            if let ModuleState::Loaded(image) = state {
                if image.set_initialized(false) {
                    if let Err(error) = self.loader.detach(&image) {
                        log::warn!("{}: detach during rollback failed - {}", name, error);
                    }
                }
                log::debug!("{}: rolled back", name);
            }
        }
    }
}
