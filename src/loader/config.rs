//! Loader configuration.

use crate::file::Machine;

/// Default bound on nested dependency loads and forwarder chains.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Configuration options for mapping images.
///
/// This struct controls which images the [`crate::loader::Loader`] accepts and what it does
/// with them once they are mapped. It uses the builder pattern for convenient configuration.
///
/// # Default Configuration
///
/// The default configuration:
/// - Accepts images built for the architecture of the running process
/// - Follows dependencies and forwarders up to [`DEFAULT_MAX_DEPTH`] levels deep
/// - Runs TLS callbacks and `DllMain` after an image is sealed
/// - Maps pages that would be writable and executable as read-execute, with a warning
///
/// # Example
///
/// ```rust
/// use memimport::{file::Machine, loader::LoaderConfig};
///
/// // Map x64 images for inspection only, refusing W+X sections outright
/// let config = LoaderConfig::new()
///     .with_machine(Machine::Amd64)
///     .without_initializers()
///     .reject_write_execute();
///
/// assert_eq!(config.machine, Some(Machine::Amd64));
/// assert!(!config.run_initializers);
/// ```
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Architecture images must be built for.
    ///
    /// `None` means the host architecture is not one PE images exist for; every image is then
    /// rejected.
    pub machine: Option<Machine>,

    /// How many levels of dependency loads and export forwarders are followed before the load
    /// fails with [`crate::Error::RecursionLimit`].
    pub max_depth: usize,

    /// Whether TLS callbacks and `DllMain` run on attach and detach.
    ///
    /// When `false`, images are only mapped, relocated, bound and sealed. The entry point is
    /// still called by [`crate::loader::Loader::load`].
    pub run_initializers: bool,

    /// Whether a page that would be writable and executable fails the load.
    ///
    /// When `false` (default) such pages are mapped read-execute and a warning is logged.
    pub reject_write_execute: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            machine: Machine::host(),
            max_depth: DEFAULT_MAX_DEPTH,
            run_initializers: true,
            reject_write_execute: false,
        }
    }
}

impl LoaderConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts images for `machine` instead of the host architecture.
    #[must_use]
    pub fn with_machine(mut self, machine: Machine) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Sets the bound on nested dependency loads and forwarder chains.
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Maps images without running TLS callbacks or `DllMain`.
    #[must_use]
    pub fn without_initializers(mut self) -> Self {
        self.run_initializers = false;
        self
    }

    /// Fails loads of images that have writable and executable pages.
    #[must_use]
    pub fn reject_write_execute(mut self) -> Self {
        self.reject_write_execute = true;
        self
    }
}
