mod cli;

use clap::Parser;
use cli::{Args, ExitCode};
use coldcache::error::CoreError;
use coldcache::iface::FileSystemProbe;
use coldcache::linux::{self, FtraceTransport, LinuxFileSystemProbe, NoGroupMapper};
use coldcache::model::DeviceId;
use coldcache::pack_codec::{self, BincodePackWriter};
use coldcache::pathfilter::PrefixRewrite;
use coldcache::session::{self, TraceConfig};
use log::{error, info};
use std::process::ExitCode as ProcessExitCode;

fn main() -> ProcessExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    if args.dump {
        return run_dump(&args);
    }

    if args.daemon {
        match daemonise() {
            Ok(true) => return ProcessExitCode::SUCCESS, // parent
            Ok(false) => {}                              // child continues
            Err(e) => {
                error!("failed to daemonise: {e}");
                return exit_code(ExitCode::TraceError);
            }
        }
    }

    run_trace(&args)
}

fn run_dump(args: &Args) -> ProcessExitCode {
    let Some(path) = &args.pack_file else {
        error!("--dump requires --pack-file PATH");
        return exit_code(ExitCode::BadArgs);
    };
    match pack_codec::read_pack(path) {
        Ok(pack) => {
            let summary = pack.summary();
            println!(
                "{}: {} paths, {} blocks, {} bytes",
                path.display(),
                summary.path_count,
                summary.block_count,
                summary.total_bytes
            );
            ProcessExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to read {}: {e}", path.display());
            exit_code(ExitCode::PackReadError)
        }
    }
}

fn run_trace(args: &Args) -> ProcessExitCode {
    let probe = LinuxFileSystemProbe::new();
    let groups = NoGroupMapper;
    let writer = BincodePackWriter::default_dir();
    let mut transport = FtraceTransport::new(FtraceTransport::default_root());

    if !args.force_trace {
        if let Some(device_id) = probe_device_of(&probe, &args.mount) {
            let existing = writer.path_for_device(device_id);
            if existing.is_file() {
                info!(
                    "pack already exists at {} for {}; skipping (use --force-trace to re-trace)",
                    existing.display(),
                    args.mount.display()
                );
                return ProcessExitCode::SUCCESS;
            }
        }
    }

    let path_prefix = match &args.path_prefix {
        Some(prefix) => match probe_device_of(&probe, prefix) {
            Some(device_id) => Some(PrefixRewrite {
                device_id,
                prefix: prefix.display().to_string(),
            }),
            None => {
                error!("cannot stat --path-prefix {}", prefix.display());
                return exit_code(ExitCode::BadArgs);
            }
        },
        None => None,
    };

    let config = TraceConfig {
        force_ssd_mode: args.force_ssd_mode,
        path_prefix,
        path_prefix_filter: args.path_prefix_filter.clone(),
        pack_file_override: args.pack_file.clone(),
        use_existing_trace_events: args.use_existing_trace_events,
        timeout: args.timeout_duration(),
    };

    let cancel = match linux::install_signal_flag() {
        Ok(flag) => flag,
        Err(e) => {
            error!("failed to install signal handlers: {e}");
            session::new_cancel_flag()
        }
    };

    match session::trace(&mut transport, &probe, Some(&groups), &writer, &config, &cancel) {
        Ok(report) => {
            info!(
                "scanned {} paths ({} rejected), {} filemap records, {} -> {} blocks after reduction, wrote {} pack(s)",
                report.ingest.opens_scanned,
                report.ingest.opens_rejected,
                report.ingest.filemap_records,
                report.blocks_before_reduction,
                report.blocks_after_reduction,
                report.written.len(),
            );
            ProcessExitCode::SUCCESS
        }
        Err(CoreError::CannotComputePackFilename(msg)) => {
            error!("{msg}");
            exit_code(ExitCode::CannotComputePackFilename)
        }
        Err(e) => {
            error!("trace failed: {e}");
            exit_code(ExitCode::TraceError)
        }
    }
}

/// Resolves the device id that `--path-prefix PATH` targets, for matching
/// against traced opens. `PATH` is typically a mounted directory rather than
/// a regular file, so `stat_no_follow` (which only recognises regular files)
/// falls back to a plain directory `stat`.
fn probe_device_of(probe: &LinuxFileSystemProbe, path: &std::path::Path) -> Option<DeviceId> {
    if let Some(identity) = probe.stat_no_follow(path).ok().flatten() {
        return Some(identity.device_id);
    }
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| DeviceId::from_stat_dev(m.dev()))
}

fn daemonise() -> std::io::Result<bool> {
    use nix::unistd::{fork, ForkResult};
    match unsafe { fork() }.map_err(|e| std::io::Error::from_raw_os_error(e as i32))? {
        ForkResult::Parent { .. } => Ok(true),
        ForkResult::Child => Ok(false),
    }
}

fn exit_code(code: ExitCode) -> ProcessExitCode {
    ProcessExitCode::from(code as u8)
}
