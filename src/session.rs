//! Sampling orchestrator: drives N rounds at a fixed cadence, spools raw
//! samples, then streams the spool through the symbolizer into a renderer.
//!
//! Everything here runs on one profiler control thread. Pacing uses
//! absolute deadlines computed from the session start on the monotonic
//! clock, so rounds don't accumulate drift; the wall clock is read once per
//! round for the timestamps that end up in the output.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::maps::{Arch, MappingSnapshot};
use crate::render::OutputFormat;
use crate::sample::{SENTINEL_SP, Sample, StackFrame};
use crate::spool::SpoolWriter;
use crate::stopper;
use crate::symbolize::{BackendChoice, Symbolizer};
use crate::threads;
use crate::walker;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of sampling rounds.
    pub sample_count: u32,
    /// Target gap between round starts.
    pub interval: Duration,
    pub format: OutputFormat,
    pub backend: BackendChoice,
    /// Per-sample frame cap; deeper stacks are truncated innermost-first.
    pub max_depth: usize,
    /// Watchdog for a single thread stop.
    pub stop_timeout: Duration,
    /// Where the spool file lives; defaults to the system temp dir.
    pub spool_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_count: 100,
            interval: Duration::from_millis(10),
            format: OutputFormat::default(),
            backend: BackendChoice::Native,
            max_depth: walker::DEFAULT_MAX_DEPTH,
            stop_timeout: stopper::DEFAULT_STOP_TIMEOUT,
            spool_dir: None,
        }
    }
}

/// What a finished (or cancelled) session did.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SessionReport {
    pub rounds_completed: u32,
    pub samples_recorded: u64,
    /// Samples emitted with an empty stack (thread gone, stuck, or the
    /// control thread itself).
    pub empty_samples: u64,
    pub truncated_samples: u64,
    /// Rounds whose deadline had already passed when the previous round
    /// finished.
    pub falling_behind: u32,
    pub cancelled: bool,
}

/// Run one sampling session, writing rendered output to `sink`.
///
/// Cancellation between rounds terminates cleanly; cancellation observed
/// mid-round finishes the in-flight stop first. Either way the renderer is
/// finalised with whatever was recorded. The spool is deleted on success
/// and retained (with a warning) when spool I/O itself failed.
pub fn run_session(
    config: &SessionConfig,
    sink: &mut dyn Write,
    cancel: &CancellationToken,
) -> Result<SessionReport> {
    stopper::ensure_handler()?;

    let spool_dir = config
        .spool_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let spool = tempfile::Builder::new()
        .prefix("profile-recorder-")
        .suffix(".spool")
        .tempfile_in(spool_dir)
        .map_err(Error::Spool)?;
    let spool_path = spool.path().to_path_buf();

    match run_rounds_and_render(config, sink, cancel, &spool_path) {
        Ok(report) => Ok(report),
        Err(err) => {
            if matches!(err, Error::Spool(_))
                && let Ok((_file, path)) = spool.keep()
            {
                tracing::warn!(spool = %path.display(), "session failed; partial spool retained");
            }
            Err(err)
        }
    }
}

fn run_rounds_and_render(
    config: &SessionConfig,
    sink: &mut dyn Write,
    cancel: &CancellationToken,
    spool_path: &Path,
) -> Result<SessionReport> {
    let pid = std::process::id();
    let mappings = Arc::new(MappingSnapshot::capture().map_err(Error::Maps)?);
    let mut writer = SpoolWriter::create(spool_path).map_err(Error::Spool)?;
    let mut frame_buf = vec![StackFrame::new(0, SENTINEL_SP); config.max_depth.max(1)];
    let mut report = SessionReport::default();
    let started = Instant::now();

    tracing::debug!(
        rounds = config.sample_count,
        interval_us = config.interval.as_micros() as u64,
        "sampling session started"
    );

    'rounds: for round in 0..config.sample_count {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        let (time_sec, time_nsec) = wall_clock();
        let tids = threads::enumerate().map_err(Error::ThreadList)?;
        for tid in tids {
            let thread_name = threads::thread_name(tid).unwrap_or_default();
            let walked = stopper::with_thread_paused(tid, config.stop_timeout, |ctx| {
                walker::walk(ctx, &mut frame_buf)
            });
            let sample = match walked {
                Ok(outcome) => {
                    if outcome.truncated {
                        report.truncated_samples += 1;
                    }
                    Sample {
                        pid,
                        tid,
                        thread_name,
                        time_sec,
                        time_nsec,
                        frames: frame_buf[..outcome.depth].to_vec(),
                    }
                }
                Err(
                    Error::ThreadGone(_)
                    | Error::StuckThread(_)
                    | Error::AlreadyMe(_)
                    | Error::SignalDelivery { .. },
                ) => {
                    report.empty_samples += 1;
                    Sample::empty(pid, tid, thread_name, time_sec, time_nsec)
                }
                Err(fatal) => return Err(fatal),
            };
            writer.append(&sample).map_err(Error::Spool)?;
            report.samples_recorded += 1;
            if cancel.is_cancelled() {
                // The in-flight stop already completed; stop mid-round.
                report.cancelled = true;
                break 'rounds;
            }
        }
        report.rounds_completed += 1;

        let deadline = started + config.interval * (round + 1);
        if Instant::now() >= deadline {
            if round + 1 < config.sample_count {
                report.falling_behind += 1;
            }
            continue;
        }
        if !sleep_until(deadline, cancel) {
            report.cancelled = true;
            break;
        }
    }

    writer.flush().map_err(Error::Spool)?;

    // Post-pass: spool → symbolizer → renderer → sink.
    let mut reader = writer.into_reader().map_err(Error::Spool)?;
    let backend = config.backend.create()?;
    let symbolizer = Symbolizer::new(mappings, backend);
    let mut renderer = config.format.new_renderer(Arch::host());
    while let Some(sample) = reader.next_sample().map_err(Error::Spool)? {
        let bytes = match renderer.consume_single_sample(&sample, &symbolizer) {
            Ok(bytes) => bytes,
            Err(e) => return Err(cut_stream(sink, e)),
        };
        sink.write_all(&bytes).map_err(Error::Sink)?;
    }
    let tail = match renderer.finalise(&symbolizer) {
        Ok(tail) => tail,
        Err(e) => return Err(cut_stream(sink, e)),
    };
    sink.write_all(&tail).map_err(Error::Sink)?;
    sink.flush().map_err(Error::Sink)?;
    symbolizer.shutdown();

    tracing::debug!(
        samples = report.samples_recorded,
        rounds = report.rounds_completed,
        falling_behind = report.falling_behind,
        cancelled = report.cancelled,
        "sampling session finished"
    );
    Ok(report)
}

/// A renderer failure is fatal; leave a trailing marker in the stream when
/// the sink still accepts writes.
fn cut_stream(sink: &mut dyn Write, err: std::io::Error) -> Error {
    let _ = sink.write_all(format!("\n# stream aborted: {err}\n").as_bytes());
    Error::Render(err)
}

/// Sleep until `deadline` in small slices so cancellation stays responsive.
/// Returns false when cancelled.
fn sleep_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

/// Wall-clock stamp for output timestamps. Scheduling never uses this.
fn wall_clock() -> (i64, u32) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    (ts.tv_sec as i64, ts.tv_nsec as u32)
}
