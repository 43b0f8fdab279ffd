#![forbid(unsafe_code)]
//! PageVault public API facade.
//!
//! Re-exports the device, cache engine, and collaborator seams through one
//! crate. This is the crate downstream consumers (CLI, embedding servers)
//! depend on.

pub use pgv_cache::{Action, CacheBrain, PageState, StateCounts};
pub use pgv_device::{DeviceStatus, DeviceTuning, Maintainer, PagedDevice};
pub use pgv_error::{PgvError, Result};
pub use pgv_store::{DirRemoteStore, PageFiles, RemoteStore};
pub use pgv_types::{PAGE_SIZE, PageAccess, PageId, determine_pages, page_count_for};
