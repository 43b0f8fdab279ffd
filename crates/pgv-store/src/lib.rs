#![forbid(unsafe_code)]
//! External collaborators of the PageVault cache engine.
//!
//! Two seams live here: [`RemoteStore`], the whole-page remote object store
//! the device flushes to, and [`PageFiles`], the local on-disk page cache
//! with its open-handle table. The cache brain never touches either; the
//! dispatcher executes brain actions against them.

use pgv_error::{PgvError, Result};
use pgv_types::{MINIMUM_REDUNDANCY, PageId};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Data pieces per uploaded page object.
pub const DEFAULT_DATA_PIECES: usize = 10;
/// Parity pieces per uploaded page object.
pub const DEFAULT_PARITY_PIECES: usize = 20;
/// Upload concurrency the remote store sustains; feeds the dispatcher's
/// write-throttle formula.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 10;
/// Namespace prefix for page objects at the remote.
pub const DEFAULT_REMOTE_PREFIX: &str = "pgv";

// ── Remote object naming ────────────────────────────────────────────────────

/// Remote object name for `page`: `<prefix>/page<N>`.
#[must_use]
pub fn remote_object_name(prefix: &str, page: PageId) -> String {
    format!("{prefix}/page{page}")
}

/// Inverse of [`remote_object_name`]. Returns `None` for names outside the
/// prefix or not of the `page<N>` form.
#[must_use]
pub fn page_from_object_name(prefix: &str, name: &str) -> Option<PageId> {
    let rest = name.strip_prefix(prefix)?.strip_prefix("/page")?;
    rest.parse().ok().map(PageId)
}

/// File name of `page` inside a local cache directory.
#[must_use]
pub fn page_file_name(page: PageId) -> String {
    format!("page{page}")
}

/// Inverse of [`page_file_name`].
#[must_use]
pub fn page_from_file_name(name: &str) -> Option<PageId> {
    name.strip_prefix("page")?.parse().ok().map(PageId)
}

// ── Remote store ────────────────────────────────────────────────────────────

/// Whole-page remote object store.
///
/// Pages map to remote objects via [`remote_object_name`]. Uploads complete
/// asynchronously at the remote; an upload counts as durable only once the
/// object is listed at or above the minimum redundancy.
pub trait RemoteStore: Send + Sync {
    /// Pages with an available, recoverable remote copy. With
    /// `check_redundancy`, only pages whose reported redundancy meets
    /// [`MINIMUM_REDUNDANCY`] are returned.
    fn list_uploaded(&self, check_redundancy: bool) -> Result<Vec<PageId>>;

    /// Upload the page file at `local_path`, replacing any remote copy.
    fn upload(&self, page: PageId, local_path: &Path) -> Result<()>;

    /// Populate `local_path` from the remote copy.
    ///
    /// Implementations must write the existing file in place (create or
    /// truncate); the dispatcher may already hold an open handle to it.
    fn download(&self, page: PageId, local_path: &Path) -> Result<()>;

    /// Delete the remote copy, if any. Absence is not an error.
    fn delete(&self, page: PageId) -> Result<()>;

    /// Upload concurrency this store sustains.
    fn max_concurrent_uploads(&self) -> usize {
        DEFAULT_MAX_CONCURRENT_UPLOADS
    }
}

impl<R: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<R> {
    fn list_uploaded(&self, check_redundancy: bool) -> Result<Vec<PageId>> {
        (**self).list_uploaded(check_redundancy)
    }

    fn upload(&self, page: PageId, local_path: &Path) -> Result<()> {
        (**self).upload(page, local_path)
    }

    fn download(&self, page: PageId, local_path: &Path) -> Result<()> {
        (**self).download(page, local_path)
    }

    fn delete(&self, page: PageId) -> Result<()> {
        (**self).delete(page)
    }

    fn max_concurrent_uploads(&self) -> usize {
        (**self).max_concurrent_uploads()
    }
}

/// Directory-backed [`RemoteStore`].
///
/// Models the remote as a mounted directory: uploads land atomically under
/// `<root>/<prefix>/` via a temp-file rename, so a listed object is always
/// complete. Redundancy is derived from the configured erasure-coding shape
/// and reported for every listed object.
#[derive(Debug)]
pub struct DirRemoteStore {
    objects: PathBuf,
    prefix: String,
    data_pieces: usize,
    parity_pieces: usize,
}

impl DirRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_prefix(root, DEFAULT_REMOTE_PREFIX)
    }

    pub fn with_prefix(root: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let objects = root.into().join(prefix);
        fs::create_dir_all(&objects)?;
        Ok(Self {
            objects,
            prefix: prefix.to_owned(),
            data_pieces: DEFAULT_DATA_PIECES,
            parity_pieces: DEFAULT_PARITY_PIECES,
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Replication factor the store reports for a fully stored object.
    #[must_use]
    pub fn redundancy(&self) -> f64 {
        (self.data_pieces + self.parity_pieces) as f64 / self.data_pieces as f64
    }

    fn object_path(&self, page: PageId) -> PathBuf {
        self.objects.join(page_file_name(page))
    }
}

impl RemoteStore for DirRemoteStore {
    fn list_uploaded(&self, check_redundancy: bool) -> Result<Vec<PageId>> {
        if check_redundancy && self.redundancy() < MINIMUM_REDUNDANCY {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.objects)
            .map_err(|err| PgvError::remote("list", err.to_string()))?;

        let mut pages = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PgvError::remote("list", err.to_string()))?;
            let name = entry.file_name();
            // Temp files are in-flight uploads; they are neither available
            // nor recoverable yet.
            let Some(page) = name.to_str().and_then(page_from_file_name) else {
                continue;
            };
            pages.push(page);
        }
        pages.sort_unstable();
        Ok(pages)
    }

    fn upload(&self, page: PageId, local_path: &Path) -> Result<()> {
        let target = self.object_path(page);
        let staging = self.objects.join(format!(".page{page}.tmp"));

        fs::copy(local_path, &staging)
            .and_then(|_| fs::rename(&staging, &target))
            .map_err(|err| PgvError::remote("upload", format!("page {page}: {err}")))?;

        debug!(
            target: "pgv::store",
            event = "object_stored",
            page = page.0,
            object = %remote_object_name(&self.prefix, page)
        );
        Ok(())
    }

    fn download(&self, page: PageId, local_path: &Path) -> Result<()> {
        let source = self.object_path(page);
        let copy = || -> io::Result<u64> {
            let mut object = File::open(&source)?;
            // Truncate in place rather than replacing the file: the
            // dispatcher's open handle must keep observing the content.
            let mut local = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(local_path)?;
            io::copy(&mut object, &mut local)
        };
        copy().map_err(|err| PgvError::remote("download", format!("page {page}: {err}")))?;
        Ok(())
    }

    fn delete(&self, page: PageId) -> Result<()> {
        match fs::remove_file(self.object_path(page)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PgvError::remote("delete", format!("page {page}: {err}"))),
        }
    }
}

// ── Local page files ────────────────────────────────────────────────────────

/// Local on-disk page cache plus the open-handle table.
///
/// Not internally synchronized; the dispatcher mutates it only under its
/// mutex. Handle bookkeeping is an internal invariant: opening an open page
/// or touching a closed one is a bug in the action stream, not an I/O error,
/// and panics.
#[derive(Debug)]
pub struct PageFiles {
    dir: PathBuf,
    handles: HashMap<PageId, File>,
}

impl PageFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            handles: HashMap::new(),
        })
    }

    /// Path of the page file, whether or not it exists.
    #[must_use]
    pub fn path(&self, page: PageId) -> PathBuf {
        self.dir.join(page_file_name(page))
    }

    #[must_use]
    pub fn is_open(&self, page: PageId) -> bool {
        self.handles.contains_key(&page)
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Open (creating if needed) the page file and register its handle.
    pub fn open(&mut self, page: PageId) -> Result<()> {
        assert!(
            !self.handles.contains_key(&page),
            "page {page} file handle already open"
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(page))?;
        self.handles.insert(page, file);
        Ok(())
    }

    /// Drop the registered handle for `page`.
    pub fn close(&mut self, page: PageId) {
        let handle = self.handles.remove(&page);
        assert!(handle.is_some(), "page {page} file handle not open");
    }

    /// Extend the freshly opened page file to `len` bytes of zeroes.
    ///
    /// The file is written sparse; reads of unwritten ranges observe zeroes.
    pub fn zero_fill(&mut self, page: PageId, len: u64) -> Result<()> {
        let file = self.handle(page);
        file.set_len(0)?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn read_at(&self, page: PageId, buf: &mut [u8], page_offset: u64) -> Result<()> {
        self.handle(page).read_exact_at(buf, page_offset)?;
        Ok(())
    }

    pub fn write_at(&self, page: PageId, buf: &[u8], page_offset: u64) -> Result<()> {
        self.handle(page).write_all_at(buf, page_offset)?;
        Ok(())
    }

    /// Remove the page file from disk. Any open handle stays readable until
    /// closed; eviction deletes first and closes second.
    pub fn remove(&mut self, page: PageId) -> Result<()> {
        fs::remove_file(self.path(page))?;
        Ok(())
    }

    /// Page files left behind by an earlier run, in ascending page order.
    ///
    /// Entries at or beyond `page_count` are reported and skipped; they
    /// belong to a device of a different size.
    pub fn scan_resident(&self, page_count: u64) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(page) = name.to_str().and_then(page_from_file_name) else {
                continue;
            };
            if page.0 >= page_count {
                warn!(
                    target: "pgv::store",
                    event = "stray_page_file",
                    page = page.0,
                    page_count
                );
                continue;
            }
            pages.push(page);
        }
        pages.sort_unstable();
        Ok(pages)
    }

    fn handle(&self, page: PageId) -> &File {
        self.handles
            .get(&page)
            .unwrap_or_else(|| panic!("page {page} file handle not open"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn object_names_round_trip() {
        let name = remote_object_name("pgv", PageId(42));
        assert_eq!(name, "pgv/page42");
        assert_eq!(page_from_object_name("pgv", &name), Some(PageId(42)));
        assert_eq!(page_from_object_name("other", &name), None);
        assert_eq!(page_from_object_name("pgv", "pgv/page"), None);
        assert_eq!(page_from_object_name("pgv", "pgv/pagex"), None);
    }

    #[test]
    fn page_file_names_round_trip() {
        assert_eq!(page_file_name(PageId(7)), "page7");
        assert_eq!(page_from_file_name("page7"), Some(PageId(7)));
        assert_eq!(page_from_file_name(".page7.tmp"), None);
        assert_eq!(page_from_file_name("page"), None);
    }

    #[test]
    fn page_files_write_read_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let mut files = PageFiles::new(dir.path()).expect("page files");

        files.open(PageId(3)).expect("open");
        files.zero_fill(PageId(3), 4096).expect("zero fill");

        let mut buf = [0xFF_u8; 16];
        files.read_at(PageId(3), &mut buf, 100).expect("read zeroes");
        assert_eq!(buf, [0_u8; 16]);

        files.write_at(PageId(3), b"hello", 100).expect("write");
        let mut buf = [0_u8; 5];
        files.read_at(PageId(3), &mut buf, 100).expect("read back");
        assert_eq!(&buf, b"hello");

        files.close(PageId(3));
        assert!(!files.is_open(PageId(3)));
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn double_open_is_a_bug() {
        let dir = TempDir::new().expect("tempdir");
        let mut files = PageFiles::new(dir.path()).expect("page files");
        files.open(PageId(0)).expect("open");
        let _ = files.open(PageId(0));
    }

    #[test]
    #[should_panic(expected = "not open")]
    fn close_without_open_is_a_bug() {
        let dir = TempDir::new().expect("tempdir");
        let mut files = PageFiles::new(dir.path()).expect("page files");
        files.close(PageId(0));
    }

    #[test]
    fn scan_finds_residual_pages_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let mut files = PageFiles::new(dir.path()).expect("page files");
        for page in [PageId(5), PageId(1), PageId(9)] {
            files.open(page).expect("open");
            files.close(page);
        }
        // Out-of-range and unrelated entries are ignored.
        std::fs::write(dir.path().join("page99"), b"").expect("stray");
        std::fs::write(dir.path().join("notes.txt"), b"").expect("unrelated");

        let resident = files.scan_resident(10).expect("scan");
        assert_eq!(resident, vec![PageId(1), PageId(5), PageId(9)]);
    }

    #[test]
    fn removed_page_survives_via_open_handle() {
        let dir = TempDir::new().expect("tempdir");
        let mut files = PageFiles::new(dir.path()).expect("page files");
        files.open(PageId(2)).expect("open");
        files.write_at(PageId(2), b"abc", 0).expect("write");

        files.remove(PageId(2)).expect("remove");
        assert!(!files.path(PageId(2)).exists());

        let mut buf = [0_u8; 3];
        files.read_at(PageId(2), &mut buf, 0).expect("read");
        assert_eq!(&buf, b"abc");
        files.close(PageId(2));
    }

    #[test]
    fn dir_store_upload_list_download_delete() {
        let remote_dir = TempDir::new().expect("remote dir");
        let local_dir = TempDir::new().expect("local dir");
        let store = DirRemoteStore::new(remote_dir.path()).expect("store");

        let local = local_dir.path().join("page4");
        std::fs::write(&local, b"payload").expect("seed local");

        assert!(store.list_uploaded(false).expect("empty list").is_empty());
        store.upload(PageId(4), &local).expect("upload");
        assert_eq!(store.list_uploaded(false).expect("list"), vec![PageId(4)]);
        assert_eq!(store.list_uploaded(true).expect("list"), vec![PageId(4)]);

        let fetched = local_dir.path().join("fetched");
        store.download(PageId(4), &fetched).expect("download");
        assert_eq!(std::fs::read(&fetched).expect("read"), b"payload");

        store.delete(PageId(4)).expect("delete");
        assert!(store.list_uploaded(false).expect("list").is_empty());
        // Deleting again is a no-op.
        store.delete(PageId(4)).expect("repeat delete");
    }

    #[test]
    fn dir_store_reports_erasure_coded_redundancy() {
        let remote_dir = TempDir::new().expect("remote dir");
        let store = DirRemoteStore::new(remote_dir.path()).expect("store");
        assert!(store.redundancy() >= MINIMUM_REDUNDANCY);
        assert!((store.redundancy() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dir_store_listing_skips_staging_files() {
        let remote_dir = TempDir::new().expect("remote dir");
        let store = DirRemoteStore::new(remote_dir.path()).expect("store");
        std::fs::write(remote_dir.path().join("pgv/.page3.tmp"), b"partial").expect("tmp");

        assert!(store.list_uploaded(false).expect("list").is_empty());
    }

    #[test]
    fn download_truncates_in_place() {
        let remote_dir = TempDir::new().expect("remote dir");
        let local_dir = TempDir::new().expect("local dir");
        let store = DirRemoteStore::new(remote_dir.path()).expect("store");

        let seed = local_dir.path().join("seed");
        std::fs::write(&seed, b"short").expect("seed");
        store.upload(PageId(0), &seed).expect("upload");

        let target = local_dir.path().join("target");
        std::fs::write(&target, b"longer stale content").expect("stale");
        store.download(PageId(0), &target).expect("download");
        assert_eq!(std::fs::read(&target).expect("read"), b"short");
    }
}
