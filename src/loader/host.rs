//! Dependency resolvers that need no archive.

use crate::loader::{DependencyResolver, Symbol};

/// Resolver that knows no libraries at all.
///
/// Images loaded with it may only import from libraries already present in the registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDependencies;

impl DependencyResolver for NoDependencies {
    fn locate(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Resolver for libraries the host process provides, such as `KERNEL32.dll`.
///
/// Symbols are looked up through the operating system loader, which loads the library into the
/// process if it is not there yet. On platforms other than Windows no symbol is ever found.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemLibraries;

impl DependencyResolver for SystemLibraries {
    fn locate(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }

    fn host_symbol(&self, library: &str, symbol: &Symbol) -> Option<u64> {
        platform::symbol(library, symbol)
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::CString;

    use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

    use crate::loader::Symbol;

    pub fn symbol(library: &str, symbol: &Symbol) -> Option<u64> {
        let library = CString::new(library).ok()?;
        // SAFETY: `library` is a valid, null-terminated string.
        let module = unsafe { LoadLibraryA(library.as_ptr().cast()) };
        if module.is_null() {
            log::debug!("host does not provide {:?}", library);
            return None;
        }

        let address = match symbol {
            Symbol::Name(name) => {
                let name = CString::new(name.as_str()).ok()?;
                // SAFETY: `module` is a live module handle and `name` is null-terminated.
                unsafe { GetProcAddress(module, name.as_ptr().cast()) }
            }
            // SAFETY: ordinals are passed in the low word of the name pointer.
            Symbol::Ordinal(ordinal) => unsafe {
                GetProcAddress(module, usize::from(*ordinal) as *const u8)
            },
        }?;

        Some(address as usize as u64)
    }
}

#[cfg(not(windows))]
mod platform {
    use crate::loader::Symbol;

    pub fn symbol(_library: &str, _symbol: &Symbol) -> Option<u64> {
        None
    }
}
