//! Shared helpers for unit tests: synthetic images, flat mapping and a recording executor.


use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

pub use builder::*;

use crate::{
    file::{section_copy_len, Image},
    loader::{Executor, Initializer, LoadedImage, Protection},
    Error, Result,
};

/// Lays an image out the way the loader maps it, without relocating anything.
pub fn map_flat(image: &Image) -> Vec<u8> {
    let mut flat = vec![0u8; image.size_of_image() as usize];

    let headers = (image.size_of_headers() as usize).min(image.len());
    flat[..headers].copy_from_slice(&image.data()[..headers]);

    for section in image.sections() {
        let len = section_copy_len(section) as usize;
        let raw = section.pointer_to_raw_data as usize;
        let rva = section.virtual_address as usize;
        flat[rva..rva + len].copy_from_slice(&image.data()[raw..raw + len]);
    }
    flat
}

/// Executor that records every call instead of running code.
///
/// Like real code it requires the called page to be executable.
#[derive(Debug)]
pub struct RecordingExecutor {
    initializers: Mutex<Vec<(Initializer, u32, u32)>>,
    entry_points: Mutex<Vec<(String, u32)>>,
    entry_result: AtomicU64,
    fail_dll_main: AtomicBool,
}

impl RecordingExecutor {
    /// What entry points return unless told otherwise.
    pub const DEFAULT_OBJECT: u64 = 0x5EED_0B1E;

    pub fn new() -> RecordingExecutor {
        RecordingExecutor {
            initializers: Mutex::new(Vec::new()),
            entry_points: Mutex::new(Vec::new()),
            entry_result: AtomicU64::new(Self::DEFAULT_OBJECT),
            fail_dll_main: AtomicBool::new(false),
        }
    }

    /// Makes every entry point return `object`.
    pub fn set_entry_result(&self, object: u64) {
        self.entry_result.store(object, Ordering::SeqCst);
    }

    /// Makes `DllMain` refuse to attach.
    pub fn fail_dll_main(&self) {
        self.fail_dll_main.store(true, Ordering::SeqCst);
    }

    /// `(kind, rva, reason)` of every initializer run so far.
    pub fn initializer_calls(&self) -> Vec<(Initializer, u32, u32)> {
        self.initializers.lock().unwrap().clone()
    }

    /// `(image name, rva)` of every entry point called so far.
    pub fn entry_calls(&self) -> Vec<(String, u32)> {
        self.entry_points.lock().unwrap().clone()
    }

    fn rva(image: &LoadedImage, address: u64) -> Result<u32> {
        let rva = address
            .checked_sub(image.base())
            .filter(|rva| *rva < image.size() as u64)
            .ok_or(out_of_bounds_error!())? as u32;

        if image.protection_at(rva).contains(Protection::EXECUTE) {
            Ok(rva)
        } else {
            Err(Error::AccessDenied {
                address,
                required: Protection::EXECUTE,
            })
        }
    }
}

impl Executor for RecordingExecutor {
    fn run_initializer(
        &self,
        image: &LoadedImage,
        kind: Initializer,
        address: u64,
        reason: u32,
    ) -> Result<bool> {
        let rva = Self::rva(image, address)?;
        self.initializers.lock().unwrap().push((kind, rva, reason));

        Ok(kind == Initializer::TlsCallback || !self.fail_dll_main.load(Ordering::SeqCst))
    }

    fn call_entry_point(&self, image: &LoadedImage, address: u64) -> Result<u64> {
        let rva = Self::rva(image, address)?;
        self.entry_points
            .lock()
            .unwrap()
            .push((image.name().to_string(), rva));

        Ok(self.entry_result.load(Ordering::SeqCst))
    }
}
