#![forbid(unsafe_code)]
//! Core identifiers and page addressing for PageVault.
//!
//! A PageVault device is a large virtual byte range split into fixed-size
//! pages. Pages are the unit of remote upload/download and of local cache
//! residency; byte-level requests are translated into per-page accesses by
//! [`determine_pages`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Size of one page in bytes. Pages are the unit of remote transfer, so this
/// is deliberately large to amortize round trips to the remote store.
pub const PAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Default maximum number of locally cached pages. New admissions block once
/// this many pages are resident.
pub const DEFAULT_HARD_MAX_CACHED: usize = 192;

/// Default target number of cached pages; eviction drives the count down
/// toward this threshold.
pub const DEFAULT_SOFT_MAX_CACHED: usize = 176;

/// Default minimum time since the last write before a dirty page is flushed.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Default sleep between wait-and-retry attempts and maintainer cycles.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Default base unit of the exponential write throttle.
pub const DEFAULT_WRITE_THROTTLE_INTERVAL: Duration = Duration::from_millis(5);

/// Replication factor above which an upload counts as durable.
pub const MINIMUM_REDUNDANCY: f64 = 2.5;

/// Index of a page within the virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    /// Index into a page table. Saturates on 32-bit targets; callers bound
    /// the value against the table length.
    #[must_use]
    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of pages needed to cover `device_size` bytes.
#[must_use]
pub fn page_count_for(device_size: u64) -> u64 {
    device_size.div_ceil(PAGE_SIZE)
}

/// One per-page slice of a byte-level request.
///
/// `buf_high - buf_low == len`, and concatenating `buf[buf_low..buf_high]`
/// over the access list reassembles the caller's buffer in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAccess {
    /// Page the slice lands in.
    pub page: PageId,
    /// Byte offset within the page.
    pub page_offset: u64,
    /// Length of the slice in bytes.
    pub len: usize,
    /// Start of the slice in the caller's buffer.
    pub buf_low: usize,
    /// End of the slice in the caller's buffer (exclusive).
    pub buf_high: usize,
}

/// Split a `(offset, length)` request into the minimal ordered list of
/// per-page accesses. Each entry lies entirely within one page.
///
/// Bounds against the device size are the caller's responsibility.
#[must_use]
pub fn determine_pages(offset: u64, length: usize) -> Vec<PageAccess> {
    let mut accesses = Vec::new();

    let mut offset = offset;
    let mut remaining = length;
    let mut buf_pos = 0_usize;
    while remaining > 0 {
        let page = PageId(offset / PAGE_SIZE);
        let page_offset = offset % PAGE_SIZE;
        let page_room = usize::try_from(PAGE_SIZE - page_offset).unwrap_or(usize::MAX);
        let len = remaining.min(page_room);

        accesses.push(PageAccess {
            page,
            page_offset,
            len,
            buf_low: buf_pos,
            buf_high: buf_pos + len,
        });

        offset += len as u64;
        remaining -= len;
        buf_pos += len;
    }

    accesses
}
