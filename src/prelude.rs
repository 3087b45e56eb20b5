//! # memimport Prelude
//!
//! The types needed to set up an import hook or drive the loader directly, for glob import.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all memimport operations
pub use crate::Error;

/// The result type used throughout memimport
pub use crate::Result;

// ================================================================================================
// Loader
// ================================================================================================

/// The in-memory loader and its configuration
pub use crate::loader::{Loader, LoaderConfig};

/// What a load produces
pub use crate::loader::{LoadedImage, LoadedModule, LoadedSection, ModuleRegistry};

/// The seams a loader is assembled from
pub use crate::loader::{
    DependencyResolver, Executor, HeapMemory, MemoryBackend, NativeExecutor, NativeMemory,
    NoDependencies, Protection, SystemLibraries,
};

// ================================================================================================
// Archives and the Import Hook
// ================================================================================================

/// Archive access
pub use crate::archive::{ArchiveIndex, MemoryArchive, ZipArchiveIndex};

/// The import hook
pub use crate::hook::{
    Diagnostics, HookConfig, ImportHook, Loadable, ModuleObject, NamingConvention,
    RuntimeVersion,
};

/// Validated PE image view
pub use crate::file::{Image, Machine};
