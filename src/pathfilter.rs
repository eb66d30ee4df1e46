//! C2 — Path normaliser & filter.

use crate::model::{DeviceId, PACK_PATH_MAX};
use std::collections::HashSet;
use std::path::Path;

/// Absolute paths under any of these prefixes are never traced
/// "Non-goals": virtual filesystem content).
const IGNORE_PREFIXES: &[&str] = &[
    "/proc/",
    "/sys/",
    "/dev/",
    "/tmp/",
    "/run/",
    "/var/run/",
    "/var/log/",
    "/var/lock/",
];

/// Why [`PathNormaliser::normalise`] rejected a candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Relative,
    TooLong,
    IgnoredPrefix,
    CallerFilter,
}

/// An optional `(device_id, prefix)` rewrite rule: traced paths that exist
/// under `prefix + path` on `device_id` are rewritten to that form, to
/// support tracing against a mounted alternate root.
#[derive(Debug, Clone)]
pub struct PrefixRewrite {
    pub device_id: DeviceId,
    pub prefix: String,
}

/// Caller-supplied predicate restricting which normalised paths are kept.
pub type PrefixFilter = dyn Fn(&str) -> bool;

pub struct PathNormaliser<'a> {
    seen: HashSet<String>,
    rewrite: Option<PrefixRewrite>,
    filter: Option<&'a PrefixFilter>,
}

impl<'a> PathNormaliser<'a> {
    pub fn new(rewrite: Option<PrefixRewrite>, filter: Option<&'a PrefixFilter>) -> Self {
        Self {
            seen: HashSet::new(),
            rewrite,
            filter,
        }
    }

    /// Collapses `//` and `/./`, resolves `/../`, and strips trailing
    /// slashes, in one left-to-right pass.
    pub fn collapse(raw: &str) -> Option<String> {
        if !raw.starts_with('/') {
            return None;
        }
        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            Some("/".to_string())
        } else {
            Some(format!("/{}", segments.join("/")))
        }
    }

    /// Applies the full normalise-then-filter pipeline. `exists_on_device`
    /// is consulted whenever a prefix rewrite is configured, to test
    /// whether the rewritten path exists on the configured device.
    pub fn normalise(
        &mut self,
        raw: &str,
        exists_on_device: impl Fn(&str, DeviceId) -> bool,
    ) -> Result<String, RejectReason> {
        let Some(mut path) = Self::collapse(raw) else {
            return Err(RejectReason::Relative);
        };

        if path.len() > PACK_PATH_MAX {
            return Err(RejectReason::TooLong);
        }
        if IGNORE_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return Err(RejectReason::IgnoredPrefix);
        }
        if let Some(filter) = self.filter {
            if !filter(&path) {
                return Err(RejectReason::CallerFilter);
            }
        }

        if let Some(rewrite) = &self.rewrite {
            let candidate = format!("{}{}", rewrite.prefix, path);
            if exists_on_device(&candidate, rewrite.device_id) {
                path = candidate;
            }
        }

        Ok(path)
    }

    /// De-duplicates repeat opens of the same (already-normalised) path.
    /// Returns `true` the first time a path is seen.
    pub fn first_seen(&mut self, path: &str) -> bool {
        self.seen.insert(path.to_string())
    }
}

pub fn is_absolute(path: &str) -> bool {
    Path::new(path).is_absolute()
}
