//! Error kinds.
//!
//! Only [`CoreError::FatalSetup`] and [`CoreError::FatalInvariant`] are meant
//! to escape to `main`; recoverable and soft errors are absorbed at their
//! component boundary and only ever logged.

use crate::model::DeviceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Cannot enable required trace events, size the buffer, or open the
    /// trace stream. Already-applied transport state must be restored
    /// before this propagates.
    #[error("trace setup failed: {0}")]
    FatalSetup(String),

    /// The explicit `--pack-file PATH` given could not be matched to a
    /// single traced device.
    #[error("cannot compute pack filename: {0}")]
    CannotComputePackFilename(String),

    /// Allocation failure or an impossible numeric overflow.
    #[error("invariant violated: {0}")]
    FatalInvariant(String),

    /// A single file could not be stat'd, opened, mapped, or extent-queried.
    /// Never escapes the scanner; logged and the path is skipped.
    #[error("skipping {path}: {source}")]
    RecoverablePerFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A trace record was missing an expected field. Never escapes the
    /// ingester; logged and the record is dropped.
    #[error("dropping record: {0}")]
    RecoverablePerRecord(String),

    /// An optional event group (the filemap family) is unavailable; the
    /// reducer is disabled for the affected device's pack but tracing
    /// continues.
    #[error("optional events unavailable for device {device:?}: {reason}")]
    Soft { device: DeviceId, reason: String },
}
