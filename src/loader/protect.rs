//! Final page protections of a mapped image.
//!
//! Protections are planned per page: the header pages are read-only, every page a section
//! touches receives the union of the protections of all sections on it, and pages no section
//! covers stay inaccessible. Pages whose union would be writable and executable are either
//! mapped read-execute or fail the load.

use goblin::pe::section_table::SectionTable;

use crate::{
    file::{section_extent, section_name},
    loader::Protection,
    Result,
};

/// A run of pages sharing one protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectedRange {
    /// RVA of the first page
    pub rva: u32,
    /// Length in bytes, a multiple of the page size
    pub size: u32,
    /// Protection applied to the pages
    pub protection: Protection,
}

/// Outcome of planning.
#[derive(Debug)]
pub(crate) struct ProtectionPlan {
    /// Coalesced page runs covering the whole region
    pub ranges: Vec<ProtectedRange>,
    /// Per section, the protection every one of its pages grants
    pub sections: Vec<Protection>,
}

/// Computes the protections of a region of `region_len` bytes.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if `reject_write_execute` is set and any page would be
/// writable and executable.
pub(crate) fn plan(
    sections: &[SectionTable],
    size_of_headers: u32,
    region_len: usize,
    page_size: usize,
    reject_write_execute: bool,
    name: &str,
) -> Result<ProtectionPlan> {
    let page_count = region_len / page_size;
    let mut pages = vec![Protection::empty(); page_count];
    let page_span = |start: u64, len: u64| {
        let first = (start / page_size as u64) as usize;
        let last = (start + len).div_ceil(page_size as u64) as usize;
        first.min(page_count)..last.min(page_count)
    };

    let headers = page_span(0, u64::from(size_of_headers).max(1));
    for section in sections {
        let extent = section_extent(section);
        if extent == 0 {
            continue;
        }
        let declared = Protection::from_characteristics(section.characteristics);
        if declared.is_write_execute() && reject_write_execute {
            return Err(malformed_error!(
                "Section {} of {} is writable and executable",
                section_name(section),
                name
            ));
        }
        for page in page_span(u64::from(section.virtual_address), extent) {
            pages[page] |= declared;
        }
    }
    for page in headers {
        pages[page] |= Protection::READ;
    }

    let mut demoted = 0;
    for (index, page) in pages.iter_mut().enumerate() {
        if page.is_write_execute() {
            if reject_write_execute {
                return Err(malformed_error!(
                    "Page 0x{:X} of {} would be writable and executable",
                    index * page_size,
                    name
                ));
            }
            *page = Protection::READ | Protection::EXECUTE;
            demoted += 1;
        }
    }
    if demoted != 0 {
        log::warn!(
            "{}: {} writable and executable page(s) mapped read-execute",
            name,
            demoted
        );
    }

    let section_protections = sections
        .iter()
        .map(|section| {
            let extent = section_extent(section);
            if extent == 0 {
                return Protection::empty();
            }
            page_span(u64::from(section.virtual_address), extent)
                .map(|page| pages[page])
                .reduce(|granted, page| granted & page)
                .unwrap_or_default()
        })
        .collect();

    let mut ranges: Vec<ProtectedRange> = Vec::new();
    for (index, protection) in pages.iter().enumerate() {
        match ranges.last_mut() {
            Some(last) if last.protection == *protection => last.size += page_size as u32,
            _ => ranges.push(ProtectedRange {
                rva: (index * page_size) as u32,
                size: page_size as u32,
                protection: *protection,
            }),
        }
    }

    Ok(ProtectionPlan {
        ranges,
        sections: section_protections,
    })
}
