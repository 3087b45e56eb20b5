//! Mapped libraries and modules.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    file::Machine,
    loader::{MappedRegion, ModuleExports, ProtectedRange, Protection, Symbol},
    Result,
};

/// One section of a mapped image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedSection {
    /// Section name, e.g. `.text`
    pub name: String,
    /// RVA of the section
    pub virtual_address: u32,
    /// Number of bytes the section spans once mapped
    pub virtual_size: u32,
    /// Raw section characteristics
    pub characteristics: u32,
    /// Protection derived from the characteristics
    pub declared: Protection,
    /// Protection every page of the section actually grants
    pub protection: Protection,
}

impl LoadedSection {
    /// Returns `true` if the section contains code.
    #[must_use]
    pub fn is_code(&self) -> bool {
        self.characteristics & 0x0000_0020 != 0
    }

    /// Returns `true` if the section is uninitialized data.
    #[must_use]
    pub fn is_uninitialized(&self) -> bool {
        self.characteristics & 0x0000_0080 != 0
    }

    /// Returns `true` if `rva` lies inside the section.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && rva - self.virtual_address < self.virtual_size
    }
}

/// A library mapped, relocated, bound and sealed in memory.
///
/// Images are shared as `Arc<LoadedImage>`; every image holds the dependencies it bound
/// against, so a library's memory stays mapped while anything that imports from it is alive.
/// The memory is released when the last reference is dropped.
pub struct LoadedImage {
    pub(crate) name: String,
    pub(crate) region: Box<dyn MappedRegion>,
    pub(crate) preferred_base: u64,
    pub(crate) machine: Machine,
    pub(crate) is_dll: bool,
    pub(crate) entry_point: Option<u32>,
    pub(crate) sections: Vec<LoadedSection>,
    pub(crate) ranges: Vec<ProtectedRange>,
    pub(crate) exports: Arc<ModuleExports>,
    pub(crate) tls_callbacks: Vec<u32>,
    pub(crate) dependencies: Vec<Arc<LoadedImage>>,
    pub(crate) initialized: AtomicBool,
}

impl LoadedImage {
    /// Name the image was loaded under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the image is mapped at.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.region.base()
    }

    /// Number of bytes mapped.
    #[must_use]
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Address the image was linked for.
    #[must_use]
    pub fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    /// Architecture of the image.
    #[must_use]
    pub fn machine(&self) -> Machine {
        self.machine
    }

    /// Returns `true` for PE32+ images.
    #[must_use]
    pub fn is_64(&self) -> bool {
        self.machine.is_64()
    }

    /// Returns `true` if the image is flagged as a dynamic-link library.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.is_dll
    }

    /// Returns `true` if the image's code can run, i.e. it was mapped into real pages.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.region.is_executable()
    }

    /// Address of `DllMain`, if the image has one.
    #[must_use]
    pub fn entry_point(&self) -> Option<u64> {
        self.entry_point.map(|rva| self.va(rva))
    }

    /// Converts an RVA to an address.
    #[must_use]
    pub fn va(&self, rva: u32) -> u64 {
        self.base() + u64::from(rva)
    }

    /// The sections of the image, with the protections they were sealed with.
    #[must_use]
    pub fn sections(&self) -> &[LoadedSection] {
        &self.sections
    }

    /// The section containing `rva`.
    #[must_use]
    pub fn section_for_rva(&self, rva: u32) -> Option<&LoadedSection> {
        self.sections.iter().find(|section| section.contains(rva))
    }

    /// The page runs of the image and their protections, covering every mapped byte.
    #[must_use]
    pub fn protections(&self) -> &[ProtectedRange] {
        &self.ranges
    }

    /// The current protection of the page containing `rva`.
    #[must_use]
    pub fn protection_at(&self, rva: u32) -> Protection {
        self.region.protection_at(rva as usize)
    }

    /// The export table of the image.
    #[must_use]
    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    /// Address of a symbol exported by this image itself.
    ///
    /// Forwarded exports are not followed; use [`crate::loader::Loader::load`] with the
    /// symbol as entry point name to resolve those.
    #[must_use]
    pub fn export_address(&self, name: &str) -> Option<u64> {
        self.exports.address(&Symbol::Name(name.to_string()))
    }

    /// RVAs of the TLS callbacks.
    #[must_use]
    pub fn tls_callbacks(&self) -> &[u32] {
        &self.tls_callbacks
    }

    /// Libraries this image bound against and keeps alive.
    #[must_use]
    pub fn dependencies(&self) -> &[Arc<LoadedImage>] {
        &self.dependencies
    }

    /// Returns `true` while attach initializers have run and detach has not.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self, value: bool) -> bool {
        self.initialized.swap(value, Ordering::AcqRel)
    }

    /// Reads mapped bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::AccessDenied`] if any page touched is not readable and
    /// [`crate::Error::OutOfBounds`] outside the image.
    pub fn read(&self, rva: u32, len: usize) -> Result<&[u8]> {
        self.region.read(rva as usize, len)
    }

    /// Reads a pointer-sized value.
    ///
    /// # Errors
    /// See [`LoadedImage::read`].
    pub fn read_pointer(&self, rva: u32) -> Result<u64> {
        self.region.read_pointer(rva as usize, self.is_64())
    }
}

impl fmt::Debug for LoadedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedImage")
            .field("name", &self.name)
            .field("base", &format_args!("0x{:X}", self.base()))
            .field("size", &format_args!("0x{:X}", self.size()))
            .field("machine", &self.machine)
            .field("sections", &self.sections.len())
            .field(
                "dependencies",
                &self
                    .dependencies
                    .iter()
                    .map(|dependency| dependency.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        log::debug!(
            "{}: releasing 0x{:X} bytes at 0x{:X}",
            self.name,
            self.region.len(),
            self.region.base()
        );
    }
}

/// A library whose entry point has been called.
///
/// Holds both the library and the image the entry point's code lives in. The two differ when
/// the entry point is forwarded to another library, which then stays mapped for as long as
/// the module does.
#[derive(Clone, Debug)]
pub struct LoadedModule {
    image: Arc<LoadedImage>,
    entry_image: Arc<LoadedImage>,
    entry_point: String,
    object: u64,
}

impl LoadedModule {
    pub(crate) fn new(
        image: Arc<LoadedImage>,
        entry_image: Arc<LoadedImage>,
        entry_point: &str,
        object: u64,
    ) -> LoadedModule {
        LoadedModule {
            image,
            entry_image,
            entry_point: entry_point.to_string(),
            object,
        }
    }

    /// The mapped library.
    #[must_use]
    pub fn image(&self) -> &Arc<LoadedImage> {
        &self.image
    }

    /// The image containing the code of the entry point.
    #[must_use]
    pub fn entry_image(&self) -> &Arc<LoadedImage> {
        &self.entry_image
    }

    /// Name the library was loaded under.
    #[must_use]
    pub fn name(&self) -> &str {
        self.image.name()
    }

    /// Name of the export that was called.
    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// The value the entry point returned, never zero.
    #[must_use]
    pub fn object(&self) -> u64 {
        self.object
    }
}
