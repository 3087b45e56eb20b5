//! Heap-backed memory for inspection loads and tests.
//!
//! Regions live in ordinary heap buffers and are handed out at synthetic, non-overlapping base
//! addresses. Page protections are tracked and enforced on every access exactly as with
//! [`super::NativeMemory`], but nothing mapped here can ever be executed.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use super::{MappedRegion, MemoryBackend, PageTable, Protection};
use crate::{Error, Result};

/// Default first synthetic base address.
pub const DEFAULT_HEAP_BASE: u64 = 0x6000_0000;

/// Default upper bound of a single reservation, 1 GiB.
pub const DEFAULT_MAX_RESERVATION: usize = 0x4000_0000;

/// Granularity of synthetic base addresses, the Windows allocation granularity.
const BASE_GRANULARITY: u64 = 0x1_0000;

#[derive(Debug)]
struct HeapState {
    next_base: u64,
    /// base -> length of live regions
    live: BTreeMap<u64, usize>,
    allocated: usize,
    total: usize,
}

impl HeapState {
    fn is_free(&self, base: u64, size: usize) -> bool {
        let end = base.saturating_add(size as u64);
        self.live
            .range(..end)
            .next_back()
            .map_or(true, |(start, len)| start + *len as u64 <= base)
    }
}

/// Backend that hands out heap buffers at synthetic addresses.
///
/// Clones share their bookkeeping, so a test can keep a clone to observe what the loader
/// reserved and released.
///
/// # Examples
///
/// ```rust
/// use memimport::loader::{HeapMemory, MemoryBackend};
///
/// let memory = HeapMemory::new();
/// let region = memory.reserve(0x1800, Some(0x1_8000_0000))?;
///
/// assert_eq!(region.len(), 0x2000);
/// assert_eq!(memory.allocated_bytes(), 0x2000);
///
/// drop(region);
/// assert_eq!(memory.allocated_bytes(), 0);
/// # Ok::<(), memimport::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct HeapMemory {
    state: Arc<Mutex<HeapState>>,
    page_size: usize,
    honor_preferred: bool,
    max_reservation: usize,
}

impl Default for HeapMemory {
    fn default() -> Self {
        Self::with_start(DEFAULT_HEAP_BASE)
    }
}

impl HeapMemory {
    /// Creates a backend whose first region is placed at [`DEFAULT_HEAP_BASE`].
    #[must_use]
    pub fn new() -> HeapMemory {
        HeapMemory::default()
    }

    /// Creates a backend whose first region is placed at `start`.
    #[must_use]
    pub fn with_start(start: u64) -> HeapMemory {
        HeapMemory {
            state: Arc::new(Mutex::new(HeapState {
                next_base: align_up!(start, BASE_GRANULARITY),
                live: BTreeMap::new(),
                allocated: 0,
                total: 0,
            })),
            page_size: 0x1000,
            honor_preferred: false,
            max_reservation: DEFAULT_MAX_RESERVATION,
        }
    }

    /// Uses `page_size` as protection granularity instead of 4 KiB.
    ///
    /// # Panics
    ///
    /// If `page_size` is not a power of two.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> HeapMemory {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        self.page_size = page_size;
        self
    }

    /// Refuses reservations larger than `max` bytes instead of [`DEFAULT_MAX_RESERVATION`].
    ///
    /// Every region is backed by a zeroed buffer of its full size, so this bounds what a
    /// single image header can make the backend allocate.
    #[must_use]
    pub fn with_max_reservation(mut self, max: usize) -> HeapMemory {
        self.max_reservation = max;
        self
    }

    /// Places regions at the preferred base of the image whenever that range is still free.
    #[must_use]
    pub fn honor_preferred_base(mut self) -> HeapMemory {
        self.honor_preferred = true;
        self
    }

    /// Bytes currently reserved and not yet released.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocated
    }

    /// Number of live regions.
    #[must_use]
    pub fn reservations(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }

    /// Number of regions ever reserved, including released ones.
    #[must_use]
    pub fn total_reservations(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total
    }
}

impl MemoryBackend for HeapMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize, preferred: Option<u64>) -> Result<Box<dyn MappedRegion>> {
        let size = align_up!(size.max(1), self.page_size);
        if size > self.max_reservation {
            return Err(Error::Error(format!(
                "Reservation of 0x{:X} bytes exceeds the limit of 0x{:X}",
                size, self.max_reservation
            )));
        }
        let mut state = lock!(self.state)?;

        let base = match preferred {
            Some(preferred)
                if self.honor_preferred
                    && preferred != 0
                    && preferred % BASE_GRANULARITY == 0
                    && state.is_free(preferred, size) =>
            {
                preferred
            }
            _ => {
                let mut base = state.next_base;
                while !state.is_free(base, size) {
                    base = align_up!(base + size as u64, BASE_GRANULARITY);
                }
                state.next_base = align_up!(base + size as u64, BASE_GRANULARITY);
                base
            }
        };

        if base.checked_add(size as u64).is_none() {
            return Err(Error::Error(format!(
                "Synthetic address space exhausted reserving 0x{:X} bytes",
                size
            )));
        }

        state.live.insert(base, size);
        state.allocated += size;
        state.total += 1;
        drop(state);

        Ok(Box::new(HeapRegion {
            base,
            data: vec![0; size],
            pages: PageTable::new(self.page_size, size),
            state: Arc::clone(&self.state),
        }))
    }
}

/// A heap buffer posing as mapped memory.
struct HeapRegion {
    base: u64,
    data: Vec<u8>,
    pages: PageTable,
    state: Arc<Mutex<HeapState>>,
}

impl MappedRegion for HeapRegion {
    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn protection_at(&self, offset: usize) -> Protection {
        self.pages.get(offset)
    }

    fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.pages.check(self.base, offset, len, Protection::READ)?;
        Ok(&self.data[offset..offset + len])
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.pages
            .check(self.base, offset, data.len(), Protection::WRITE)?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn protect(&mut self, offset: usize, len: usize, protection: Protection) -> Result<()> {
        if protection.is_write_execute() {
            return Err(Error::WriteExecute(self.base + offset as u64));
        }

        let (start, size) = self.pages.span(offset, len)?;
        self.pages.set(start, size, protection);
        Ok(())
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(size) = state.live.remove(&self.base) {
            state.allocated -= size;
        }
    }
}
