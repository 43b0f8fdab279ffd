#![forbid(unsafe_code)]
//! Cache decision engine for PageVault.
//!
//! [`CacheBrain`] is a pure state machine over per-page metadata. Fed with a
//! block access, a maintenance tick, or a shutdown request, it returns the
//! ordered list of [`Action`]s the executor must perform before the access
//! may proceed. The brain itself performs no I/O and has no internal locking;
//! the dispatcher serializes all calls under one mutex.

use pgv_error::{PgvError, Result};
use pgv_types::PageId;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Residency state of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageState {
    /// Never written or downloaded; logically all zeroes.
    Zero,
    /// A remote copy exists; no local copy.
    NotCached,
    /// Local copy equals the last known remote copy.
    CachedUnchanged,
    /// Local copy has unflushed writes.
    CachedChanged,
    /// Upload in flight; further writes must cancel it first.
    CachedUploading,
}

impl PageState {
    /// Whether a local page file exists for this state.
    #[must_use]
    pub fn is_cached(self) -> bool {
        matches!(
            self,
            Self::CachedUnchanged | Self::CachedChanged | Self::CachedUploading
        )
    }
}

/// Side effect requested from the action executor.
///
/// Actions emitted by one brain call are executed in order, without
/// interleaving from other callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a fresh local page file and fill it with `PAGE_SIZE` zero bytes.
    ZeroCache(PageId),
    /// Remove the local page file.
    DeleteCache(PageId),
    /// Populate the local page file from the remote copy.
    Download(PageId),
    /// Begin uploading the local page file to the remote store.
    StartUpload(PageId),
    /// Abort the in-flight upload by deleting the partial remote object.
    CancelUpload(PageId),
    /// Open a handle to the local page file.
    OpenFile(PageId),
    /// Close the handle to the local page file.
    CloseFile(PageId),
    /// Control token: release the lock, sleep, and consult the brain again.
    WaitAndRetry,
}

#[derive(Debug, Clone, Copy)]
struct PageMeta {
    state: PageState,
    last_access: Option<Instant>,
    last_write_access: Option<Instant>,
}

impl PageMeta {
    const fn fresh() -> Self {
        Self {
            state: PageState::Zero,
            last_access: None,
            last_write_access: None,
        }
    }
}

/// Per-state page counts, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub zero: usize,
    pub not_cached: usize,
    pub cached_unchanged: usize,
    pub cached_changed: usize,
    pub cached_uploading: usize,
}

/// In-memory cache state machine over a fixed page table.
///
/// Invariants maintained across every call:
/// - `cache_count` equals the number of pages in a cached state.
/// - `cache_count <= hard_max_cached` whenever a call returns without
///   [`Action::WaitAndRetry`].
/// - A page that has left [`PageState::Zero`] never returns to it.
/// - `last_access >= last_write_access` for every page.
#[derive(Debug)]
pub struct CacheBrain {
    page_count: usize,
    cache_count: usize,
    hard_max_cached: usize,
    soft_max_cached: usize,
    idle_interval: Duration,
    pages: Vec<PageMeta>,
}

impl CacheBrain {
    /// Build a fresh brain with every page in [`PageState::Zero`].
    ///
    /// Fails with [`PgvError::Config`] unless
    /// `soft_max_cached < hard_max_cached`.
    pub fn new(
        page_count: usize,
        hard_max_cached: usize,
        soft_max_cached: usize,
        idle_interval: Duration,
    ) -> Result<Self> {
        if soft_max_cached >= hard_max_cached {
            return Err(PgvError::Config(format!(
                "soft cache limit must be below hard limit: soft={soft_max_cached} hard={hard_max_cached}"
            )));
        }

        Ok(Self {
            page_count,
            cache_count: 0,
            hard_max_cached,
            soft_max_cached,
            idle_interval,
            pages: vec![PageMeta::fresh(); page_count],
        })
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Number of pages currently in a cached state. Sole authority on cache
    /// occupancy; read it only under the dispatcher mutex.
    #[must_use]
    pub fn cache_count(&self) -> usize {
        self.cache_count
    }

    #[must_use]
    pub fn hard_max_cached(&self) -> usize {
        self.hard_max_cached
    }

    #[must_use]
    pub fn soft_max_cached(&self) -> usize {
        self.soft_max_cached
    }

    #[must_use]
    pub fn state(&self, page: PageId) -> PageState {
        self.meta(page).state
    }

    /// Whether any page has an upload in flight.
    #[must_use]
    pub fn any_uploading(&self) -> bool {
        self.pages
            .iter()
            .any(|meta| meta.state == PageState::CachedUploading)
    }

    #[must_use]
    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for meta in &self.pages {
            match meta.state {
                PageState::Zero => counts.zero += 1,
                PageState::NotCached => counts.not_cached += 1,
                PageState::CachedUnchanged => counts.cached_unchanged += 1,
                PageState::CachedChanged => counts.cached_changed += 1,
                PageState::CachedUploading => counts.cached_uploading += 1,
            }
        }
        counts
    }

    /// Startup overlay: a remote copy of `page` is known to exist.
    ///
    /// Only meaningful before the first access; a page already past
    /// [`PageState::Zero`] is left alone.
    pub fn note_remote_copy(&mut self, page: PageId) {
        let meta = self.meta_mut(page);
        if meta.state == PageState::Zero {
            meta.state = PageState::NotCached;
        }
    }

    /// Startup overlay: a residual local page file was found for `page`.
    ///
    /// The local copy is assumed newer than any remote copy, so the page
    /// enters [`PageState::CachedChanged`] and counts toward the cache.
    pub fn note_resident_copy(&mut self, page: PageId) {
        let meta = self.meta_mut(page);
        if !meta.state.is_cached() {
            meta.state = PageState::CachedChanged;
            self.cache_count += 1;
        }
    }

    /// The remote store has confirmed `page` at full redundancy.
    ///
    /// Returns whether the page transitioned out of
    /// [`PageState::CachedUploading`].
    pub fn note_upload_complete(&mut self, page: PageId) -> bool {
        let meta = self.meta_mut(page);
        if meta.state == PageState::CachedUploading {
            meta.state = PageState::CachedUnchanged;
            true
        } else {
            false
        }
    }

    /// Decide what must happen before the caller may read or write `page`.
    ///
    /// If the hard cache limit blocks admission, the returned list ends in
    /// [`Action::WaitAndRetry`] and `page` is left untouched; the dispatcher
    /// must release its lock, sleep, and consult the brain again.
    pub fn prepare_access(&mut self, page: PageId, is_write: bool, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        if !self.meta(page).state.is_cached() && self.cache_count >= self.hard_max_cached {
            // No room to admit the page; push maintenance forward and make
            // the caller wait.
            trace!(
                target: "pgv::cache",
                event = "admission_blocked",
                page = page.0,
                cache_count = self.cache_count,
                hard_max_cached = self.hard_max_cached
            );
            actions = self.maintenance(now);
            actions.push(Action::WaitAndRetry);
            return actions;
        }

        match self.meta(page).state {
            PageState::Zero => {
                actions.push(Action::ZeroCache(page));
                self.meta_mut(page).state = PageState::CachedChanged;
                self.cache_count += 1;
            }
            PageState::NotCached => {
                actions.push(Action::OpenFile(page));
                actions.push(Action::Download(page));
                self.meta_mut(page).state = if is_write {
                    PageState::CachedChanged
                } else {
                    PageState::CachedUnchanged
                };
                self.cache_count += 1;
            }
            PageState::CachedUnchanged => {
                if is_write {
                    self.meta_mut(page).state = PageState::CachedChanged;
                }
            }
            PageState::CachedChanged => {}
            PageState::CachedUploading => {
                // Reads are safe while an upload is in flight; a write must
                // abort the upload first or the remote copy would tear.
                if is_write {
                    actions.push(Action::CancelUpload(page));
                    self.meta_mut(page).state = PageState::CachedChanged;
                }
            }
        }

        let meta = self.meta_mut(page);
        meta.last_access = Some(now);
        if is_write {
            meta.last_write_access = Some(now);
        }

        actions
    }

    /// Periodic upkeep: flush idle dirty pages, then evict toward the soft
    /// limit.
    ///
    /// At most one eviction cluster is emitted per call; repeated calls walk
    /// `cache_count` down toward `soft_max_cached`.
    pub fn maintenance(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut lru_candidate: Option<(Option<Instant>, PageId)> = None;

        for index in 0..self.page_count {
            let meta = self.pages[index];
            if !meta.state.is_cached() {
                continue;
            }

            let page = PageId(index as u64);
            // Strict comparison: on equal timestamps the lowest index wins.
            let replace = match lru_candidate {
                None => true,
                Some((best_access, _)) => meta.last_access < best_access,
            };
            if replace {
                lru_candidate = Some((meta.last_access, page));
            }

            if meta.state != PageState::CachedChanged {
                continue;
            }

            let idle = match meta.last_write_access {
                Some(last_write) => now > last_write + self.idle_interval,
                None => true,
            };
            if idle {
                actions.push(Action::StartUpload(page));
                self.pages[index].state = PageState::CachedUploading;
            }
        }

        // Nothing further if uploads were just started or the cache is still
        // under its soft limit.
        if !actions.is_empty() || self.cache_count < self.soft_max_cached {
            return actions;
        }

        if let Some((_, victim)) = lru_candidate {
            match self.meta(victim).state {
                PageState::CachedUnchanged => {
                    debug!(
                        target: "pgv::cache",
                        event = "evict",
                        page = victim.0,
                        cache_count = self.cache_count
                    );
                    actions.push(Action::DeleteCache(victim));
                    actions.push(Action::CloseFile(victim));
                    self.meta_mut(victim).state = PageState::NotCached;
                    self.cache_count -= 1;
                }
                PageState::CachedChanged => {
                    actions.push(Action::StartUpload(victim));
                    self.meta_mut(victim).state = PageState::CachedUploading;
                }
                // Already on its way out.
                _ => {}
            }
        }

        actions
    }

    /// Drive every page toward a quiescent terminal state.
    ///
    /// The dispatcher loops on this until the returned list is empty: dirty
    /// pages are flushed, in-flight uploads are waited on, and clean cache
    /// entries are dropped.
    pub fn prepare_shutdown(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut any_uploading = false;

        for index in 0..self.page_count {
            let page = PageId(index as u64);
            match self.pages[index].state {
                PageState::CachedChanged => {
                    actions.push(Action::StartUpload(page));
                    self.pages[index].state = PageState::CachedUploading;
                    any_uploading = true;
                }
                PageState::CachedUploading => {
                    any_uploading = true;
                }
                PageState::CachedUnchanged => {
                    actions.push(Action::DeleteCache(page));
                    actions.push(Action::CloseFile(page));
                    self.pages[index].state = PageState::NotCached;
                    self.cache_count -= 1;
                }
                PageState::Zero | PageState::NotCached => {}
            }
        }

        if any_uploading {
            actions.push(Action::WaitAndRetry);
        }

        actions
    }

    fn meta(&self, page: PageId) -> &PageMeta {
        let index = page.index();
        assert!(index < self.page_count, "page {page} out of range");
        &self.pages[index]
    }

    fn meta_mut(&mut self, page: PageId) -> &mut PageMeta {
        let index = page.index();
        assert!(index < self.page_count, "page {page} out of range");
        &mut self.pages[index]
    }
}
