#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use memimport::{
    file::Image,
    loader::{
        Executor, HeapMemory, Initializer, LoadedImage, Loader, LoaderConfig, ModuleRegistry,
        NoDependencies,
    },
    Error, Result,
};

struct NoCode;

impl Executor for NoCode {
    fn run_initializer(&self, _: &LoadedImage, _: Initializer, _: u64, _: u32) -> Result<bool> {
        Ok(true)
    }

    fn call_entry_point(&self, _: &LoadedImage, _: u64) -> Result<u64> {
        Err(Error::NotSupported)
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(image) = Image::from_mem(data.to_vec()) else {
        return;
    };

    // Headers can declare up to 4 GiB of image for a few bytes of input
    let loader = Loader::new(
        Arc::new(HeapMemory::new().with_max_reservation(16 << 20)),
        Arc::new(NoCode),
        LoaderConfig::new()
            .with_machine(image.machine())
            .without_initializers(),
    );
    let mut registry = ModuleRegistry::new();
    let _ = loader.load_library(data.to_vec(), "fuzz.dll", &NoDependencies, &mut registry);
});
