//! External interfaces consumed by the core.
//!
//! Everything in this module is a trait: the hard engineering this crate
//! implements is the trace-to-pack pipeline (C1-C7), not the kernel trace
//! transport, the on-disk extent ioctl plumbing, or the pack writer's wire
//! format. [`crate::linux`] and [`crate::pack_codec`] provide real but
//! deliberately thin implementations so the pipeline is runnable end to end;
//! tests exercise the pipeline against fakes implementing these traits.

use crate::model::{DeviceId, PackFile};
use std::io;
use std::path::Path;

/// One extent returned by a FIEMAP-style query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical_start: u64,
    pub logical_length: u64,
    pub physical_start: u64,
    pub physical_known: bool,
}

/// Authoritative identity and size of an open file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub device_id: DeviceId,
    pub inode_id: u64,
    pub size: u64,
}

/// Per-file and per-device filesystem queries the scanner (C3) needs.
pub trait FileSystemProbe {
    /// Stats `path` without following symlinks; returns `None` for anything
    /// that isn't a regular file.
    fn stat_no_follow(&self, path: &Path) -> io::Result<Option<FileIdentity>>;

    /// Opens `path` read-only with no-atime and re-stats the descriptor to
    /// get the authoritative identity.
    fn open_identity(&self, path: &Path) -> io::Result<FileIdentity>;

    /// Queries per-page residency for the open file, returning one bool per
    /// page in file order.
    fn page_residency(&self, path: &Path, size: u64) -> io::Result<Vec<bool>>;

    /// Queries whether the device backing `device_id` is rotational. A
    /// failed query defaults to rotational at the call site.
    fn is_rotational(&self, device_id: DeviceId) -> io::Result<bool>;

    /// FIEMAP-style extent query for the logical byte range
    /// `[offset, offset+length)` of `path` (rotational media only).
    fn extents(&self, path: &Path, offset: u64, length: u64) -> io::Result<Vec<Extent>>;
}

/// Optional ext-family inode→block-group mapping.
pub trait GroupMapper {
    /// Returns the allocation group containing `inode_id`, if the mapping
    /// is available for this device.
    fn group_of(&self, device_id: DeviceId, inode_id: u64) -> Option<u64>;
}

/// A single decoded kernel trace record.
#[derive(Debug, Clone)]
pub enum TraceRecord {
    /// `fs:do_sys_open` / `fs:open_exec` / `fs:uselib`.
    Open { filename: String },
    /// `filemap:mm_filemap_fault` / `_get_pages` / `_map_pages`.
    Filemap {
        device_raw: u64,
        inode_id: u64,
        page_index: u64,
        last_page_index: Option<u64>,
    },
    /// Anything else; ignored by C4.
    Unknown,
}

/// The kernel trace-event transport. Enabling/disabling events,
/// buffer sizing, and raw-record decoding are out of scope for this crate;
/// this trait is the seam.
pub trait TraceTransport {
    fn event_enable(&mut self, system: &str, name: &str) -> io::Result<()>;
    fn event_disable(&mut self, system: &str, name: &str);
    fn event_is_enabled(&self, system: &str, name: &str) -> bool;

    fn buffer_size_get(&self, cpu: Option<u32>) -> io::Result<u64>;
    fn buffer_size_set(&mut self, kb: u64, cpu: Option<u32>) -> io::Result<()>;

    fn trace_on(&mut self) -> io::Result<()>;
    fn trace_off(&mut self) -> io::Result<()>;
    fn trace_is_on(&self) -> bool;

    /// Blocking drain of buffered records in emission order, calling `on_record`
    /// for each one until the transport is stopped.
    fn iterate_events(&mut self, on_record: &mut dyn FnMut(TraceRecord));
}

/// Accepts a fully-built [`PackFile`] and emits bytes, returning the path
/// written to. The on-disk layout is an implementation detail of
/// this trait's implementor, not part of the pipeline's contract.
pub trait PackWriter {
    fn write(&self, pack: &PackFile, explicit_path: Option<&Path>) -> io::Result<std::path::PathBuf>;
}
