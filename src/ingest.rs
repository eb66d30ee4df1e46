//! C4 — Trace ingester: dispatches typed records to C1 or C2+C3.

use crate::error::CoreError;
use crate::iface::{FileSystemProbe, TraceRecord};
use crate::interval::IntervalIndex;
use crate::model::DeviceId;
use crate::pathfilter::PathNormaliser;
use crate::scanner::Scanner;
use log::warn;

/// Running counters so a caller can assert on ingestion behavior without
/// scraping logs (SPEC_FULL.md ambient-stack addition).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub opens_scanned: u64,
    pub opens_rejected: u64,
    pub filemap_records: u64,
    pub records_dropped: u64,
}

pub struct Ingester<'a, P: FileSystemProbe> {
    intervals: IntervalIndex,
    scanner: Scanner<'a, P>,
    normaliser: PathNormaliser<'a>,
    stats: IngestStats,
}

impl<'a, P: FileSystemProbe> Ingester<'a, P> {
    pub fn new(scanner: Scanner<'a, P>, normaliser: PathNormaliser<'a>) -> Self {
        Self {
            intervals: IntervalIndex::new(),
            scanner,
            normaliser,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Dispatches one decoded record. Unknown events are
    /// ignored; records missing required fields are represented as
    /// [`TraceRecord::Unknown`] or rejected earlier by the decoder and never
    /// reach this point with partial data.
    pub fn ingest(
        &mut self,
        record: TraceRecord,
        exists_on_device: &impl Fn(&str, DeviceId) -> bool,
    ) {
        match record {
            TraceRecord::Open { filename } => match self
                .normaliser
                .normalise(&filename, exists_on_device)
            {
                Ok(path) => {
                    if self.normaliser.first_seen(&path) {
                        if self.scanner.scan(&path).is_some() {
                            self.stats.opens_scanned += 1;
                        } else {
                            self.stats.opens_rejected += 1;
                        }
                    }
                }
                Err(_) => {
                    self.stats.opens_rejected += 1;
                }
            },
            TraceRecord::Filemap {
                device_raw,
                inode_id,
                page_index,
                last_page_index,
            } => {
                let device_id = DeviceId::from_trace_raw(device_raw);
                let last = last_page_index.unwrap_or(page_index);
                self.intervals.add(device_id, inode_id, page_index, last);
                self.stats.filemap_records += 1;
            }
            TraceRecord::Unknown => {
                self.stats.records_dropped += 1;
                let err = CoreError::RecoverablePerRecord(
                    "unrecognised or incomplete trace record".into(),
                );
                warn!("{err}");
            }
        }
    }

    /// Consumes the ingester, returning the interval index and the scanned
    /// per-device packs for C5.
    pub fn finish(self) -> (IntervalIndex, Scanner<'a, P>) {
        (self.intervals, self.scanner)
    }
}
