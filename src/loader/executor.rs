//! Running code of mapped images.
//!
//! Everything the loader executes goes through an [`Executor`]: TLS callbacks and `DllMain` on
//! attach and detach, and the entry point a module is loaded for. [`NativeExecutor`] calls the
//! mapped code directly; other implementations can record, emulate or refuse the calls.

use std::{ffi::c_void, fmt, ptr};

use crate::{
    loader::{LoadedImage, Protection},
    Error, Result,
};

/// `DLL_PROCESS_DETACH`
pub const DLL_PROCESS_DETACH: u32 = 0;
/// `DLL_PROCESS_ATTACH`
pub const DLL_PROCESS_ATTACH: u32 = 1;

/// The kind of initializer being run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Initializer {
    /// An entry of the TLS callback table; its return value is ignored
    TlsCallback,
    /// The image entry point of a DLL
    DllMain,
}

impl fmt::Display for Initializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initializer::TlsCallback => f.write_str("TLS callback"),
            Initializer::DllMain => f.write_str("DllMain"),
        }
    }
}

/// Runs code inside mapped images.
pub trait Executor: Send + Sync {
    /// Calls a TLS callback or `DllMain` with `reason`.
    ///
    /// Returns what the initializer returned; TLS callbacks always count as successful.
    ///
    /// # Errors
    /// Returns an error if the code cannot be run at all.
    fn run_initializer(
        &self,
        image: &LoadedImage,
        kind: Initializer,
        address: u64,
        reason: u32,
    ) -> Result<bool>;

    /// Calls a module entry point and returns the object it produced.
    ///
    /// # Errors
    /// Returns an error if the code cannot be run at all.
    fn call_entry_point(&self, image: &LoadedImage, address: u64) -> Result<u64>;
}

/// Signature of `DllMain`.
type DllMain = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> i32;
/// Signature of a TLS callback.
type TlsCallback = unsafe extern "system" fn(*mut c_void, u32, *mut c_void);
/// Signature of a module entry point, e.g. `PyInit_spam`.
type EntryPoint = unsafe extern "C" fn() -> *mut c_void;

/// Executor that calls mapped code as native functions.
#[derive(Debug)]
pub struct NativeExecutor {
    _private: (),
}

impl NativeExecutor {
    /// Creates the executor.
    ///
    /// # Safety
    ///
    /// Code of every image loaded with this executor runs with the full privileges of the
    /// process. The caller must only load images from sources it trusts, built for the
    /// architecture of the running process.
    #[must_use]
    pub unsafe fn new() -> NativeExecutor {
        NativeExecutor { _private: () }
    }

    /// Verifies `address` is executable code of `image`.
    fn check(image: &LoadedImage, address: u64) -> Result<()> {
        if !image.is_executable() {
            return Err(Error::NotSupported);
        }

        let rva = address
            .checked_sub(image.base())
            .filter(|rva| *rva < image.size() as u64)
            .ok_or(out_of_bounds_error!())?;
        if !image
            .protection_at(rva as u32)
            .contains(Protection::EXECUTE)
        {
            return Err(Error::AccessDenied {
                address,
                required: Protection::EXECUTE,
            });
        }

        Ok(())
    }
}

impl Executor for NativeExecutor {
    fn run_initializer(
        &self,
        image: &LoadedImage,
        kind: Initializer,
        address: u64,
        reason: u32,
    ) -> Result<bool> {
        Self::check(image, address)?;
        let instance = image.base() as usize as *mut c_void;

        match kind {
            Initializer::TlsCallback => {
                // SAFETY: the address is executable code inside the image, and the caller of
                // `NativeExecutor::new` vouched for the image.
                let callback: TlsCallback = unsafe { std::mem::transmute(address as usize) };
                unsafe { callback(instance, reason, ptr::null_mut()) };
                Ok(true)
            }
            Initializer::DllMain => {
                // SAFETY: as above.
                let dll_main: DllMain = unsafe { std::mem::transmute(address as usize) };
                Ok(unsafe { dll_main(instance, reason, ptr::null_mut()) } != 0)
            }
        }
    }

    fn call_entry_point(&self, image: &LoadedImage, address: u64) -> Result<u64> {
        Self::check(image, address)?;

        // SAFETY: the address is executable code inside the image, and the caller of
        // `NativeExecutor::new` vouched for the image.
        let entry_point: EntryPoint = unsafe { std::mem::transmute(address as usize) };
        Ok(unsafe { entry_point() } as usize as u64)
    }
}
