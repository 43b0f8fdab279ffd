#![forbid(unsafe_code)]
//! Block access dispatcher for PageVault.
//!
//! [`PagedDevice`] exposes positional reads and writes over the virtual
//! device. Each request is split into per-page accesses, the cache brain is
//! consulted for every access, and the returned actions are executed against
//! the local page files and the remote store before the byte-level I/O
//! proceeds. One mutex serializes everything; the only suspension points are
//! the wait-and-retry sleep, the write throttle, and the maintainer's tick,
//! all of which release the mutex first.

use parking_lot::{Mutex, MutexGuard};
use pgv_cache::{Action, CacheBrain, StateCounts};
use pgv_error::{PgvError, Result};
use pgv_store::{PageFiles, RemoteStore};
use pgv_types::{
    DEFAULT_HARD_MAX_CACHED, DEFAULT_IDLE_INTERVAL, DEFAULT_SOFT_MAX_CACHED,
    DEFAULT_WAIT_INTERVAL, DEFAULT_WRITE_THROTTLE_INTERVAL, PAGE_SIZE, PageId, determine_pages,
    page_count_for,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

// ── Tuning ──────────────────────────────────────────────────────────────────

/// Cache-shape and pacing knobs of a [`PagedDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceTuning {
    /// Admission ceiling: accesses to uncached pages block at this many
    /// resident pages.
    pub hard_max_cached: usize,
    /// Eviction target: maintenance drives residency down toward this.
    pub soft_max_cached: usize,
    /// Minimum quiet period after the last write before a dirty page is
    /// flushed.
    pub idle_interval: Duration,
    /// Sleep between wait-and-retry attempts and maintainer cycles.
    pub wait_interval: Duration,
    /// Base unit of the exponential write throttle.
    pub write_throttle_interval: Duration,
}

impl Default for DeviceTuning {
    fn default() -> Self {
        Self {
            hard_max_cached: DEFAULT_HARD_MAX_CACHED,
            soft_max_cached: DEFAULT_SOFT_MAX_CACHED,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            write_throttle_interval: DEFAULT_WRITE_THROTTLE_INTERVAL,
        }
    }
}

impl DeviceTuning {
    fn validate(self) -> Result<Self> {
        if self.soft_max_cached >= self.hard_max_cached {
            return Err(PgvError::Config(format!(
                "soft cache limit must be below hard limit: soft={} hard={}",
                self.soft_max_cached, self.hard_max_cached
            )));
        }
        if self.idle_interval.is_zero() {
            return Err(PgvError::Config("idle_interval must be > 0".to_owned()));
        }
        if self.wait_interval.is_zero() {
            return Err(PgvError::Config("wait_interval must be > 0".to_owned()));
        }
        if self.write_throttle_interval.is_zero() {
            return Err(PgvError::Config(
                "write_throttle_interval must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Pause to impose on a writer, if residency is crowding the upload pipeline.
///
/// Doubles per page of excess over `soft_max_cached + max_concurrent_uploads`;
/// the only backpressure signal fast writers get before the hard limit.
fn write_throttle_duration(
    cache_count: usize,
    soft_max_cached: usize,
    max_concurrent_uploads: usize,
    interval: Duration,
) -> Option<Duration> {
    let permitted = soft_max_cached + max_concurrent_uploads;
    if cache_count < permitted {
        return None;
    }
    let level = u32::try_from(cache_count - permitted).unwrap_or(u32::MAX);
    Some(interval.saturating_mul(2_u32.saturating_pow(level)))
}

// ── Device ──────────────────────────────────────────────────────────────────

/// Point-in-time snapshot of device and cache occupancy.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeviceStatus {
    pub size: u64,
    pub page_count: u64,
    pub cache_count: usize,
    pub hard_max_cached: usize,
    pub soft_max_cached: usize,
    pub pages: StateCounts,
}

#[derive(Debug)]
struct DeviceState {
    brain: CacheBrain,
    files: PageFiles,
}

/// Virtual block device backed by a remote page store through a local
/// write-back page cache.
#[derive(Debug)]
pub struct PagedDevice<R: RemoteStore> {
    state: Mutex<DeviceState>,
    remote: R,
    tuning: DeviceTuning,
    size: u64,
    page_count: u64,
}

impl<R: RemoteStore> PagedDevice<R> {
    /// Open a device of `size` bytes, reconstructing cache state from the
    /// remote listing and any residual local page files.
    ///
    /// A residual file is assumed to hold data newer than the remote copy
    /// and re-enters the cache dirty.
    pub fn new(
        size: u64,
        cache_dir: impl Into<PathBuf>,
        remote: R,
        tuning: DeviceTuning,
    ) -> Result<Self> {
        let tuning = tuning.validate()?;
        let page_count = page_count_for(size);
        let table_len = usize::try_from(page_count)
            .map_err(|_| PgvError::Config(format!("device too large: {page_count} pages")))?;

        let brain = CacheBrain::new(
            table_len,
            tuning.hard_max_cached,
            tuning.soft_max_cached,
            tuning.idle_interval,
        )?;
        let files = PageFiles::new(cache_dir)?;
        let mut state = DeviceState { brain, files };

        info!(
            target: "pgv::device",
            event = "device_open",
            size,
            page_count,
        );

        for page in remote.list_uploaded(false)? {
            if page.0 >= page_count {
                warn!(
                    target: "pgv::device",
                    event = "stray_remote_object",
                    page = page.0,
                    page_count
                );
                continue;
            }
            state.brain.note_remote_copy(page);
        }

        for page in state.files.scan_resident(page_count)? {
            info!(
                target: "pgv::device",
                event = "residual_cache_found",
                page = page.0
            );
            state.files.open(page)?;
            state.brain.note_resident_copy(page);
        }

        Ok(Self {
            state: Mutex::new(state),
            remote,
            tuning,
            size,
            page_count,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    #[must_use]
    pub fn tuning(&self) -> DeviceTuning {
        self.tuning
    }

    #[must_use]
    pub fn remote(&self) -> &R {
        &self.remote
    }

    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        let guard = self.state.lock();
        DeviceStatus {
            size: self.size,
            page_count: self.page_count,
            cache_count: guard.brain.cache_count(),
            hard_max_cached: self.tuning.hard_max_cached,
            soft_max_cached: self.tuning.soft_max_cached,
            pages: guard.brain.state_counts(),
        }
    }

    /// Read `buf.len()` bytes at `offset`. On success every byte was read;
    /// on error, pages already processed have been applied and the completed
    /// byte count is logged.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let accesses = determine_pages(offset, buf.len());
        let mut guard = self.state.lock();
        let mut completed = 0_usize;

        for access in accesses {
            guard = self.admit(guard, access.page, false).map_err(|err| {
                warn!(
                    target: "pgv::device",
                    event = "short_read",
                    offset,
                    completed,
                    error = %err
                );
                err
            })?;
            if let Err(err) = guard.files.read_at(
                access.page,
                &mut buf[access.buf_low..access.buf_high],
                access.page_offset,
            ) {
                warn!(
                    target: "pgv::device",
                    event = "short_read",
                    offset,
                    completed,
                    error = %err
                );
                return Err(err);
            }
            completed += access.len;
        }

        Ok(completed)
    }

    /// Write all of `buf` at `offset`, throttling first if the cache is
    /// crowding the upload pipeline.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let accesses = determine_pages(offset, buf.len());
        let mut guard = self.state.lock();

        if let Some(pause) = write_throttle_duration(
            guard.brain.cache_count(),
            self.tuning.soft_max_cached,
            self.remote.max_concurrent_uploads(),
            self.tuning.write_throttle_interval,
        ) {
            trace!(
                target: "pgv::device",
                event = "write_throttled",
                pause_ms = pause.as_millis() as u64,
                cache_count = guard.brain.cache_count()
            );
            drop(guard);
            thread::sleep(pause);
            guard = self.state.lock();
        }

        let mut completed = 0_usize;
        for access in accesses {
            guard = self.admit(guard, access.page, true).map_err(|err| {
                warn!(
                    target: "pgv::device",
                    event = "short_write",
                    offset,
                    completed,
                    error = %err
                );
                err
            })?;
            if let Err(err) = guard.files.write_at(
                access.page,
                &buf[access.buf_low..access.buf_high],
                access.page_offset,
            ) {
                warn!(
                    target: "pgv::device",
                    event = "short_write",
                    offset,
                    completed,
                    error = %err
                );
                return Err(err);
            }
            completed += access.len;
        }

        Ok(completed)
    }

    /// One maintenance pass: flush idle dirty pages, evict toward the soft
    /// limit, then reconcile in-flight uploads against the remote listing.
    pub fn run_maintenance(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let actions = guard.brain.maintenance(Instant::now());
        self.apply_actions(&mut guard, &actions)?;

        if !guard.brain.any_uploading() {
            return Ok(());
        }
        self.reconcile_uploads(&mut guard)
    }

    /// Flush and drop every cached page, waiting for uploads to reach full
    /// redundancy. Blocks until the cache is quiescent.
    pub fn close(&self) -> Result<()> {
        info!(target: "pgv::device", event = "shutdown_begin");
        let mut guard = self.state.lock();

        loop {
            let actions = guard.brain.prepare_shutdown();
            if actions.is_empty() {
                break;
            }
            let retry = self.apply_actions(&mut guard, &actions)?;
            if !retry {
                continue;
            }
            drop(guard);
            thread::sleep(self.tuning.wait_interval);
            guard = self.state.lock();
            // The maintainer may already be stopped during shutdown, so
            // confirm uploads here as well.
            self.reconcile_uploads(&mut guard)?;
        }

        info!(target: "pgv::device", event = "shutdown_complete");
        Ok(())
    }

    /// Consult the brain for `page` and execute its actions, sleeping and
    /// retrying for as long as the brain asks the caller to wait.
    fn admit<'a>(
        &'a self,
        mut guard: MutexGuard<'a, DeviceState>,
        page: PageId,
        is_write: bool,
    ) -> Result<MutexGuard<'a, DeviceState>> {
        loop {
            let actions = guard.brain.prepare_access(page, is_write, Instant::now());
            let retry = self.apply_actions(&mut guard, &actions)?;
            if !retry {
                return Ok(guard);
            }
            drop(guard);
            thread::sleep(self.tuning.wait_interval);
            guard = self.state.lock();
        }
    }

    /// Execute one brain-issued action batch in order. Returns whether the
    /// batch ended in [`Action::WaitAndRetry`].
    fn apply_actions(&self, state: &mut DeviceState, actions: &[Action]) -> Result<bool> {
        for action in actions {
            match *action {
                Action::ZeroCache(page) => {
                    info!(target: "pgv::device", event = "zero_fill", page = page.0);
                    state.files.open(page)?;
                    state.files.zero_fill(page, PAGE_SIZE)?;
                }
                Action::DeleteCache(page) => {
                    info!(target: "pgv::device", event = "cache_dropped", page = page.0);
                    state.files.remove(page)?;
                }
                Action::Download(page) => {
                    info!(target: "pgv::device", event = "download", page = page.0);
                    self.remote.download(page, &state.files.path(page))?;
                }
                Action::StartUpload(page) => {
                    info!(target: "pgv::device", event = "upload_started", page = page.0);
                    self.remote.upload(page, &state.files.path(page))?;
                }
                Action::CancelUpload(page) => {
                    info!(target: "pgv::device", event = "upload_cancelled", page = page.0);
                    self.remote.delete(page)?;
                }
                Action::OpenFile(page) => state.files.open(page)?,
                Action::CloseFile(page) => state.files.close(page),
                Action::WaitAndRetry => return Ok(true),
            }
        }
        Ok(false)
    }

    fn reconcile_uploads(&self, state: &mut DeviceState) -> Result<()> {
        let uploaded = self.remote.list_uploaded(true)?;
        for page in uploaded {
            if state.brain.note_upload_complete(page) {
                info!(
                    target: "pgv::maintainer",
                    event = "upload_complete",
                    page = page.0
                );
            }
        }
        Ok(())
    }
}

// ── Background maintainer ───────────────────────────────────────────────────

/// Handle for the background maintenance thread.
///
/// The thread wakes every `wait_interval`, runs one maintenance pass, and
/// reconciles uploads. Dropping the handle stops the thread.
#[derive(Debug)]
pub struct Maintainer {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Maintainer {
    /// Request shutdown and block until the thread exits.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl<R: RemoteStore + 'static> PagedDevice<R> {
    /// Spawn the background maintainer thread for this device.
    pub fn start_maintainer(self: &Arc<Self>) -> Result<Maintainer> {
        let stop = Arc::new(AtomicBool::new(false));
        let device = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);

        let join = thread::Builder::new()
            .name("pgv-maintainer".to_owned())
            .spawn(move || {
                loop {
                    if stop_flag.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(device.tuning.wait_interval);
                    if let Err(err) = device.run_maintenance() {
                        error!(
                            target: "pgv::maintainer",
                            event = "maintenance_failed",
                            error = %err
                        );
                    }
                }
            })
            .map_err(PgvError::from)?;

        Ok(Maintainer {
            stop,
            join: Some(join),
        })
    }
}
