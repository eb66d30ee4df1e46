//! Orchestrates one `trace()` call: wires C1-C7 together against the
//! external interfaces, following the lifecycle, concurrency,
//! and error-handling rules.
//!
//! The seen-paths and seen-inodes state lives on a session context scoped
//! to one `trace()` call, rather than as process-lifetime global state.

use crate::assemble::{self, WrittenPack};
use crate::error::CoreError;
use crate::iface::{FileSystemProbe, GroupMapper, PackWriter, TraceTransport};
use crate::ingest::{IngestStats, Ingester};
use crate::model::{DeviceId, PackFile};
use crate::order;
use crate::pathfilter::{PathNormaliser, PrefixRewrite};
use crate::reduce;
use crate::scanner::Scanner;
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trace buffer size cap: 8 MiB per CPU during collection.
pub const TRACE_BUFFER_KB_PER_CPU: u64 = 8 * 1024;

/// Niceness lowered by this much before the I/O-heavy scan phase.
pub const SCAN_NICE_DELTA: i32 = 15;

const REQUIRED_EVENTS: &[(&str, &str)] = &[("fs", "do_sys_open"), ("fs", "open_exec")];
const OPTIONAL_EVENTS: &[(&str, &str)] = &[
    ("fs", "uselib"),
    ("filemap", "mm_filemap_fault"),
    ("filemap", "mm_filemap_get_pages"),
    ("filemap", "mm_filemap_map_pages"),
];

/// CLI-level knobs that affect the core (SPEC_FULL.md ambient-stack addition;
/// the CLI exposes these as flags).
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub force_ssd_mode: bool,
    pub path_prefix: Option<PrefixRewrite>,
    pub path_prefix_filter: Option<String>,
    pub pack_file_override: Option<PathBuf>,
    pub use_existing_trace_events: bool,
    pub timeout: Option<Duration>,
}

/// Aggregate outcome of a `trace()` call (SPEC_FULL.md ambient-stack addition).
#[derive(Debug, Clone, Default)]
pub struct TraceReport {
    pub ingest: IngestStats,
    pub written: Vec<WrittenPack>,
    pub blocks_before_reduction: usize,
    pub blocks_after_reduction: usize,
}

/// Cooperative cancellation flag for the wait phase: set from a
/// signal handler, polled by [`wait_for_signal_or_timeout`].
pub fn new_cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

/// Sleeps in short increments until `cancel` is set or, if given, `timeout`
/// elapses, implementing an interruptible sleep for the wait phase. With no
/// timeout the wait blocks indefinitely on the signal alone — a signal is
/// the normal way to end collection. Delivery of SIGINT/SIGTERM is expected
/// to set `cancel` from outside this function (installing the handler is
/// the out-of-scope CLI front end's job).
pub fn wait_for_signal_or_timeout(timeout: Option<Duration>, cancel: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        if let Some(timeout) = timeout {
            if waited >= timeout {
                return;
            }
            std::thread::sleep(STEP.min(timeout - waited));
            waited += STEP;
        } else {
            std::thread::sleep(STEP);
        }
    }
}

/// Runs one full trace-to-pack cycle.
pub fn trace<T, P, G, W>(
    transport: &mut T,
    probe: &P,
    groups: Option<&G>,
    writer: &W,
    config: &TraceConfig,
    cancel: &AtomicBool,
) -> Result<TraceReport, CoreError>
where
    T: TraceTransport,
    P: FileSystemProbe,
    G: GroupMapper,
    W: PackWriter,
{
    let mut enabled_here = Vec::new();
    let mut reducer_enabled = true;

    if !config.use_existing_trace_events {
        let prior_buffer = transport.buffer_size_get(None).ok();

        for &(system, name) in REQUIRED_EVENTS {
            if !transport.event_is_enabled(system, name) {
                transport.event_enable(system, name).map_err(|e| {
                    CoreError::FatalSetup(format!("cannot enable {system}:{name}: {e}"))
                })?;
                enabled_here.push((system, name));
            }
        }
        for &(system, name) in OPTIONAL_EVENTS {
            if transport.event_is_enabled(system, name) {
                continue;
            }
            match transport.event_enable(system, name) {
                Ok(()) => enabled_here.push((system, name)),
                Err(e) => {
                    warn!("optional event {system}:{name} unavailable: {e}");
                    if system == "filemap" {
                        reducer_enabled = false;
                    }
                }
            }
        }

        if let Err(e) = transport.buffer_size_set(TRACE_BUFFER_KB_PER_CPU, None) {
            restore_transport_state(transport, &enabled_here, prior_buffer);
            return Err(CoreError::FatalSetup(format!(
                "cannot size trace buffer: {e}"
            )));
        }

        if let Err(e) = transport.trace_on() {
            restore_transport_state(transport, &enabled_here, prior_buffer);
            return Err(CoreError::FatalSetup(format!("cannot start trace: {e}")));
        }

        wait_for_signal_or_timeout(config.timeout, cancel);

        let _ = transport.trace_off();
        restore_transport_state(transport, &enabled_here, prior_buffer);
    }

    lower_niceness(SCAN_NICE_DELTA);

    let path_filter_prefix = config.path_prefix_filter.clone();
    let filter = path_filter_prefix
        .as_ref()
        .map(|prefix| -> Box<dyn Fn(&str) -> bool> {
            let prefix = prefix.clone();
            Box::new(move |p: &str| p.starts_with(prefix.as_str()))
        });
    let filter_ref: Option<&crate::pathfilter::PrefixFilter> = filter.as_deref();

    let normaliser = PathNormaliser::new(config.path_prefix.clone(), filter_ref);
    let scanner = Scanner::new(probe, config.force_ssd_mode);
    let mut ingester = Ingester::new(scanner, normaliser);

    let exists_on_device = |path: &str, device_id: DeviceId| -> bool {
        probe
            .stat_no_follow(Path::new(path))
            .ok()
            .flatten()
            .is_some_and(|id| id.device_id == device_id)
    };

    transport.iterate_events(&mut |record| {
        ingester.ingest(record, &exists_on_device);
    });

    let ingest_stats = ingester.stats();
    let (intervals, scanner) = ingester.finish();
    let table = intervals.into_table();
    let candidate_packs = scanner.into_packs();

    let blocks_before_reduction: usize = candidate_packs.values().map(|p| p.blocks.len()).sum();

    let mut final_packs: HashMap<DeviceId, PackFile> = HashMap::new();
    for (device_id, pack) in candidate_packs {
        if cancel.load(Ordering::SeqCst) {
            info!("cancellation observed at a device phase boundary; stopping before further devices are processed");
            break;
        }
        let reduced = if reducer_enabled {
            reduce::reduce(&pack, &table)
        } else {
            let soft = CoreError::Soft {
                device: device_id,
                reason: "filemap events unavailable; skipping block reduction".into(),
            };
            warn!("{soft}");
            pack
        };
        let ordered = if reduced.rotational {
            order::order(&reduced, groups.map(|g| g as &dyn GroupMapper))
        } else {
            reduced
        };
        final_packs.insert(device_id, ordered);
    }
    let blocks_after_reduction: usize = final_packs.values().map(|p| p.blocks.len()).sum();

    let explicit = resolve_explicit_target(config, probe, &final_packs)?;
    let written = assemble::assemble(&final_packs, writer, explicit.as_ref().map(|(p, d)| (p.as_path(), *d)))
        .map_err(|e| CoreError::FatalInvariant(format!("pack assembly failed: {e}")))?;

    Ok(TraceReport {
        ingest: ingest_stats,
        written,
        blocks_before_reduction,
        blocks_after_reduction,
    })
}

/// Determines which device an explicit `--pack-file PATH` targets, if given.
///
/// If the path already identifies a device (it exists and can be stat'd) we
/// use that device. Otherwise, if exactly one device was traced, we target
/// it; a genuinely ambiguous explicit path is a setup error (exit
/// code 2: "cannot compute pack filename").
fn resolve_explicit_target<P: FileSystemProbe>(
    config: &TraceConfig,
    probe: &P,
    packs: &HashMap<DeviceId, PackFile>,
) -> Result<Option<(PathBuf, DeviceId)>, CoreError> {
    let Some(path) = &config.pack_file_override else {
        return Ok(None);
    };
    if let Ok(Some(identity)) = probe.stat_no_follow(path) {
        return Ok(Some((path.clone(), identity.device_id)));
    }
    match packs.len() {
        1 => {
            let device_id = *packs.keys().next().unwrap();
            Ok(Some((path.clone(), device_id)))
        }
        0 => Ok(Some((path.clone(), DeviceId::default()))),
        _ => Err(CoreError::CannotComputePackFilename(format!(
            "{} devices were traced; {} doesn't already identify one of them",
            packs.len(),
            path.display()
        ))),
    }
}

fn restore_transport_state<T: TraceTransport>(
    transport: &mut T,
    enabled_here: &[(&str, &str)],
    prior_buffer_kb: Option<u64>,
) {
    for &(system, name) in enabled_here {
        transport.event_disable(system, name);
    }
    if let Some(kb) = prior_buffer_kb {
        if let Err(e) = transport.buffer_size_set(kb, None) {
            warn!("failed to restore trace buffer size: {e}");
        }
    }
}

/// Lowers the process niceness by `delta` before the I/O-heavy scan phase
/// so tracing doesn't starve boot-critical tasks. `nice(2)`
/// overloads `-1` as both an error and a legitimate new niceness value, so
/// errno must be cleared first and consulted afterward.
fn lower_niceness(delta: i32) {
    unsafe {
        *libc::__errno_location() = 0;
        let ret = libc::nice(delta);
        if ret == -1 && *libc::__errno_location() != 0 {
            warn!(
                "failed to lower niceness by {delta}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

