// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/physical.rs' uses mmap to map a file into memory
// - 'loader/memory/native.rs' reserves and protects pages through the operating system
// - 'loader/executor.rs' calls into mapped code

//! # memimport
//!
//! Load PE extension modules (`.pyd` / `.dll`) straight out of a zip archive, without ever
//! writing them to disk.
//!
//! `memimport` is made of three layers:
//!
//! - an **archive index** that finds files inside a container ([`archive`])
//! - an **in-memory loader** that does what `LoadLibrary` does, but for a byte buffer:
//!   mapping, relocation, import binding, page protection, TLS callbacks, `DllMain` and the
//!   module entry point ([`loader`])
//! - an **import hook** that turns dotted module names into archive paths and entry points,
//!   and loads every module at most once ([`hook`])
//!
//! ## Trust boundary
//!
//! Loading a module executes its code with the full privileges of the process. No part of
//! this crate sandboxes anything. Only load images from sources you trust; creating a
//! [`loader::NativeExecutor`] is `unsafe` for exactly this reason.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memimport::prelude::*;
//!
//! let loader = Loader::new(
//!     Arc::new(NativeMemory::new()),
//!     // SAFETY: library.zip ships with this application
//!     Arc::new(unsafe { NativeExecutor::new() }),
//!     LoaderConfig::default(),
//! );
//! let hook = ImportHook::new(
//!     ZipArchiveIndex::from_file("library.zip".as_ref())?,
//!     loader,
//!     HookConfig::new().with_host_resolver(SystemLibraries),
//! );
//!
//! let module = hook.load("pkg._speedups")?;
//! println!("{} -> 0x{:X}", module.file, module.module.object());
//! # Ok::<(), memimport::Error>(())
//! ```
//!
//! ## Inspection without execution
//!
//! With [`loader::HeapMemory`] and initializers disabled, images are mapped, relocated, bound
//! and sealed without running a single instruction, which makes the loaded state available for
//! inspection on any platform.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memimport::{file::Machine, loader::*};
//!
//! struct NoCode;
//! impl Executor for NoCode {
//!     fn run_initializer(&self, _: &LoadedImage, _: Initializer, _: u64, _: u32) -> memimport::Result<bool> {
//!         Ok(true)
//!     }
//!     fn call_entry_point(&self, _: &LoadedImage, _: u64) -> memimport::Result<u64> {
//!         Err(memimport::Error::NotSupported)
//!     }
//! }
//!
//! let loader = Loader::new(
//!     Arc::new(HeapMemory::new()),
//!     Arc::new(NoCode),
//!     LoaderConfig::new().with_machine(Machine::Amd64).without_initializers(),
//! );
//! let mut registry = ModuleRegistry::new();
//! let image = loader.load_library(
//!     std::fs::read("spam.pyd")?,
//!     "spam.pyd",
//!     &NoDependencies,
//!     &mut registry,
//! )?;
//!
//! for section in image.sections() {
//!     println!("{:8} 0x{:08X} {:?}", section.name, section.virtual_address, section.protection);
//! }
//! # Ok::<(), memimport::Error>(())
//! ```

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Validated, read-only access to raw PE images.
///
/// See [`file::Image`] for the checks every image passes before the loader touches it.
pub mod file;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use memimport::prelude::*;
///
/// let archive = ZipArchiveIndex::from_file("library.zip".as_ref())?;
/// println!("{} files", archive.paths().len());
/// # Ok::<(), memimport::Error>(())
/// ```
pub mod prelude;

/// The in-memory library loader
///
/// # Key Types
///
/// - [`loader::Loader`] - Maps, binds, seals and runs images
/// - [`loader::LoadedImage`] / [`loader::LoadedModule`] - The results of a load
/// - [`loader::ModuleRegistry`] - The caller owned arena of loaded libraries
/// - [`loader::DependencyResolver`] - Where the images of dependencies come from
/// - [`loader::MemoryBackend`] - Where images are mapped ([`loader::NativeMemory`],
///   [`loader::HeapMemory`])
/// - [`loader::Executor`] - How image code runs ([`loader::NativeExecutor`])
pub mod loader;

/// Lookup of module images inside archives
pub mod archive;

/// Module names to loaded modules, at most once each
pub mod hook;

/// `memimport` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `memimport` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use memimport::{prelude::*, Error};
///
/// # let hook: ImportHook<MemoryArchive> = unimplemented!();
/// match hook.load("spam") {
///     Ok(module) => println!("loaded from {}", module.file),
///     Err(error) => match error.root_cause() {
///         Error::NotFoundInArchive(path) => println!("not in the archive: {}", path),
///         Error::UnresolvedImport { dependency, .. } => println!("missing {}", dependency),
///         other => println!("failed: {}", other),
///     },
/// }
/// ```
pub use error::Error;

/// Cursor based reader for in-image tables.
///
/// See [`file::parser::Parser`].
pub use file::parser::Parser;
