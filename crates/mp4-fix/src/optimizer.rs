//! Optimization orchestration.
//!
//! One run: scan the top-level boxes, plan the output layout, load the
//! `moov` payload, rewrite its chunk-offset tables by the planned delta and
//! stream the result out. Inputs that already carry `moov` ahead of `mdat`
//! take a plain-copy fast path that never touches the payload.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mp4::{Mp4Error, is_fast_start, plan_layout, scan_boxes};

use crate::error::OptimizerError;
use crate::events::{OptimizerEvent, ProgressTracker};
use crate::writer::{WriteProgress, copy_file_verbatim, write_fast_start};

pub const DEFAULT_MOOV_SIZE_CAP: u64 = 512 * 1024 * 1024;
pub const DEFAULT_COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Capacity of the event channel handed to [`Mp4Optimizer::optimize`]
/// callers. A slow consumer backpressures the worker rather than dropping
/// progress events.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Configuration options for the optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Refuse inputs whose `moov` payload exceeds this many bytes; the whole
    /// payload is held in memory during fixup.
    pub moov_size_cap: u64,

    /// Chunk size for streaming copies of large boxes, `mdat` in particular.
    pub copy_chunk_size: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            moov_size_cap: DEFAULT_MOOV_SIZE_CAP,
            copy_chunk_size: DEFAULT_COPY_CHUNK_SIZE,
        }
    }
}

impl OptimizerConfig {
    pub fn builder() -> OptimizerConfigBuilder {
        OptimizerConfigBuilder::new()
    }
}

pub struct OptimizerConfigBuilder {
    config: OptimizerConfig,
}

impl OptimizerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OptimizerConfig::default(),
        }
    }

    pub fn moov_size_cap(mut self, moov_size_cap: u64) -> Self {
        self.config.moov_size_cap = moov_size_cap;
        self
    }

    pub fn copy_chunk_size(mut self, copy_chunk_size: usize) -> Self {
        self.config.copy_chunk_size = copy_chunk_size;
        self
    }

    pub fn build(self) -> OptimizerConfig {
        self.config
    }
}

impl Default for OptimizerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fast-start optimizer for one or more sequential runs.
///
/// The cancellation token is shared across runs started from this instance;
/// cancelling it aborts the in-flight run at the next chunk boundary.
pub struct Mp4Optimizer {
    config: OptimizerConfig,
    token: CancellationToken,
}

impl Default for Mp4Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mp4Optimizer {
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            token: CancellationToken::new(),
        }
    }

    /// Token polled by the writer between chunk copies and box emissions.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Optimize `input` into `output` on a worker task.
    ///
    /// Returns immediately with the event receiver. The run produces
    /// monotone [`OptimizerEvent::Progress`] fractions followed by exactly
    /// one terminal event; on failure or cancellation any partial output
    /// file has already been deleted.
    pub fn optimize(
        &self,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> mpsc::Receiver<OptimizerEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let worker = Mp4Optimizer {
            config: self.config.clone(),
            token: self.token.clone(),
        };
        let input = input.into();
        let output = output.into();

        tokio::task::spawn_blocking(move || {
            let progress_tx = tx.clone();
            let result = worker.optimize_blocking(&input, &output, move |fraction| {
                let _ = progress_tx.blocking_send(OptimizerEvent::Progress(fraction));
            });

            let terminal = match result {
                Ok(()) => OptimizerEvent::Completed(output),
                Err(e) => OptimizerEvent::Failed(e),
            };
            let _ = tx.blocking_send(terminal);
        });

        rx
    }

    /// Synchronous core of [`Mp4Optimizer::optimize`], for callers that
    /// already own a thread.
    ///
    /// `progress` receives fractions clamped to `[0, 1]` and non-decreasing
    /// across the run, ending at 1.0 on success.
    pub fn optimize_blocking<F>(
        &self,
        input: &Path,
        output: &Path,
        mut progress: F,
    ) -> Result<(), OptimizerError>
    where
        F: FnMut(f32),
    {
        let mut tracker = ProgressTracker::default();
        let mut report = move |raw: f32| progress(tracker.update(raw));

        let result = self.run(input, output, &mut report);
        if result.is_err() {
            remove_partial_output(output);
        }
        result
    }

    /// Optimize from an opaque random-access source into an opaque sink.
    ///
    /// Lower-level sibling of [`Mp4Optimizer::optimize_blocking`] for callers
    /// whose bytes do not live on the filesystem. On error the sink may hold
    /// a partial write; discarding it is the caller's responsibility.
    pub fn optimize_stream<R, W, F>(
        &self,
        reader: &mut R,
        writer: &mut W,
        mut progress: F,
    ) -> Result<(), OptimizerError>
    where
        R: Read + Seek,
        W: Write,
        F: FnMut(f32),
    {
        let mut tracker = ProgressTracker::default();
        let mut report = move |raw: f32| progress(tracker.update(raw));

        match self.prepare(reader)? {
            Prepared::AlreadyOptimized { input_len } => {
                let mut progress = WriteProgress {
                    input_len,
                    bytes_written: 0,
                    report: &mut report,
                };
                copy_file_verbatim(
                    reader,
                    writer,
                    input_len,
                    self.config.copy_chunk_size,
                    &self.token,
                    &mut progress,
                )
            }
            Prepared::Remux {
                plan,
                moov_payload,
                input_len,
            } => {
                let mut progress = WriteProgress {
                    input_len,
                    bytes_written: 0,
                    report: &mut report,
                };
                write_fast_start(
                    reader,
                    writer,
                    &plan,
                    &moov_payload,
                    self.config.copy_chunk_size,
                    &self.token,
                    &mut progress,
                )
            }
        }
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        report: &mut dyn FnMut(f32),
    ) -> Result<(), OptimizerError> {
        let start = Instant::now();
        info!(input = %input.display(), output = %output.display(), "Starting fast-start optimization");

        let file = File::open(input)?;
        let mut reader = BufReader::new(file);

        // Scan, plan and fix up in memory before the output file exists, so
        // structural and overflow failures leave nothing on disk.
        let prepared = self.prepare(&mut reader)?;
        let mut writer = self.open_output(output)?;

        match prepared {
            Prepared::AlreadyOptimized { input_len } => {
                info!("Input already has moov ahead of mdat; copying verbatim");
                let mut progress = WriteProgress {
                    input_len,
                    bytes_written: 0,
                    report,
                };
                copy_file_verbatim(
                    &mut reader,
                    &mut writer,
                    input_len,
                    self.config.copy_chunk_size,
                    &self.token,
                    &mut progress,
                )?;
                writer.flush()?;
                info!(duration = ?start.elapsed(), bytes = input_len, "Copy complete");
            }
            Prepared::Remux {
                plan,
                moov_payload,
                input_len,
            } => {
                let mut progress = WriteProgress {
                    input_len,
                    bytes_written: 0,
                    report,
                };
                write_fast_start(
                    &mut reader,
                    &mut writer,
                    &plan,
                    &moov_payload,
                    self.config.copy_chunk_size,
                    &self.token,
                    &mut progress,
                )?;
                writer.flush()?;
                info!(
                    duration = ?start.elapsed(),
                    mdat_delta = plan.mdat_delta,
                    output_len = plan.output_len(),
                    "Optimization complete"
                );
            }
        }
        Ok(())
    }

    /// Scan and plan, and for the remux case load the `moov` payload and
    /// rewrite its chunk-offset tables.
    fn prepare<R: Read + Seek>(&self, reader: &mut R) -> Result<Prepared, OptimizerError> {
        let input_len = reader.seek(SeekFrom::End(0))?;
        let records = scan_boxes(reader)?;
        let plan = plan_layout(&records)?;

        if plan.is_already_fast_start() {
            return Ok(Prepared::AlreadyOptimized { input_len });
        }

        if plan.moov.payload_len > self.config.moov_size_cap {
            return Err(OptimizerError::Mp4(Mp4Error::MoovTooLarge {
                size: plan.moov.payload_len,
                cap: self.config.moov_size_cap,
            }));
        }

        let mut moov_payload = vec![0u8; plan.moov.payload_len as usize];
        reader.seek(SeekFrom::Start(plan.moov.payload_offset))?;
        reader.read_exact(&mut moov_payload)?;
        mp4::apply_chunk_offset_delta(&mut moov_payload, plan.mdat_delta)?;

        Ok(Prepared::Remux {
            plan,
            moov_payload,
            input_len,
        })
    }

    fn open_output(&self, output: &Path) -> Result<BufWriter<File>, OptimizerError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output)?;
        Ok(BufWriter::with_capacity(self.config.copy_chunk_size, file))
    }
}

/// Outcome of the read-side phase, before any output exists.
enum Prepared {
    AlreadyOptimized {
        input_len: u64,
    },
    Remux {
        plan: mp4::LayoutPlan,
        moov_payload: Vec<u8>,
        input_len: u64,
    },
}

/// Whether `input` already has the fast-start property.
pub fn is_optimized(input: &Path) -> Result<bool, OptimizerError> {
    let mut reader = BufReader::new(File::open(input)?);
    let records = scan_boxes(&mut reader)?;
    Ok(is_fast_start(&records)?)
}

fn remove_partial_output(output: &Path) {
    if let Err(e) = fs::remove_file(output)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %output.display(), error = %e, "Failed to remove partial output file");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use mp4::test_support::{
        make_box, make_moov_payload, make_moov_payload_padded, make_stco, make_optimized_file,
        make_unoptimized_file, read_first_stco,
    };
    use tempfile::TempDir;

    use super::*;

    fn write_input(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn optimize_ok(input: &Path, output: &Path) -> Vec<f32> {
        let mut fractions = Vec::new();
        Mp4Optimizer::new()
            .optimize_blocking(input, output, |f| fractions.push(f))
            .unwrap();
        fractions
    }

    #[test]
    fn already_optimized_input_is_copied_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let bytes = make_optimized_file(&[440, 500], &vec![0x11u8; 1000]);
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");

        let fractions = optimize_ok(&input, &output);

        assert_eq!(fs::read(&output).unwrap(), bytes.as_ref());
        assert_eq!(*fractions.last().unwrap(), 1.0);
    }

    #[test]
    fn relocates_moov_and_shifts_stco() {
        // ftyp(24) mdat(10000) moov(408), stco entries pointing into mdat.
        let dir = TempDir::new().unwrap();
        let mdat_body: Vec<u8> = (0..9992u32).map(|i| (i % 251) as u8).collect();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&make_box(b"ftyp", &[0u8; 16]));
        bytes.extend_from_slice(&make_box(b"mdat", &mdat_body));
        let moov_payload = make_moov_payload_padded(&make_stco(&[32, 1032, 2032]), 400);
        bytes.extend_from_slice(&make_box(b"moov", &moov_payload));

        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");
        optimize_ok(&input, &output);

        let out = fs::read(&output).unwrap();
        let records = scan_boxes(&mut Cursor::new(out.clone())).unwrap();
        let fourccs: Vec<&[u8; 4]> = records.iter().map(|r| &r.fourcc).collect();
        assert_eq!(fourccs, vec![b"ftyp", b"moov", b"mdat"]);

        // mdat moved from 24 to 24 + 408.
        assert_eq!(records[2].header_offset, 432);
        assert_eq!(
            read_first_stco(&out[32..432]).unwrap(),
            vec![440, 1440, 2440]
        );
        // Sample bytes are untouched.
        assert_eq!(&out[440..], &mdat_body[..]);
    }

    #[test]
    fn sample_bytes_land_at_shifted_offsets() {
        // Every input offset o resolves to the same byte at o + delta.
        let dir = TempDir::new().unwrap();
        let mdat_body: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8).collect();
        let offsets = [32u32, 300, 900];
        let bytes = make_unoptimized_file(&offsets, &mdat_body);
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");
        optimize_ok(&input, &output);

        let out = fs::read(&output).unwrap();
        let records = scan_boxes(&mut Cursor::new(out.clone())).unwrap();
        let delta = records[2].header_offset as i64 - 24;
        for o in offsets {
            let shifted = (o as i64 + delta) as usize;
            assert_eq!(out[shifted], bytes[o as usize]);
        }
    }

    #[test]
    fn missing_mdat_fails_and_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let mut bytes = make_box(b"ftyp", &[0u8; 16]);
        bytes.extend_from_slice(&make_box(
            b"moov",
            &make_moov_payload(&make_stco(&[32])),
        ));
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");

        let err = Mp4Optimizer::new()
            .optimize_blocking(&input, &output, |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizerError::Mp4(Mp4Error::MissingBox("mdat"))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn stco_overflow_fails_and_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let bytes = make_unoptimized_file(&[i32::MAX as u32 - 10], &vec![0u8; 100]);
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");

        let err = Mp4Optimizer::new()
            .optimize_blocking(&input, &output, |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizerError::Mp4(Mp4Error::OffsetOverflow { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn second_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let bytes = make_unoptimized_file(&[32, 500], &vec![0x42u8; 1000]);
        let input = write_input(&dir, "in.mp4", &bytes);
        let first = dir.path().join("first.mp4");
        let second = dir.path().join("second.mp4");

        optimize_ok(&input, &first);
        assert!(is_optimized(&first).unwrap());

        optimize_ok(&first, &second);
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn preserves_box_multiset_and_payloads() {
        // An extra free box and a trailing skip box ride along unchanged.
        let dir = TempDir::new().unwrap();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&make_box(b"ftyp", &[0u8; 16]));
        bytes.extend_from_slice(&make_box(b"free", &[0xFEu8; 32]));
        bytes.extend_from_slice(&make_box(b"mdat", &vec![0x99u8; 500]));
        bytes.extend_from_slice(&make_box(
            b"moov",
            &make_moov_payload(&make_stco(&[72])),
        ));
        bytes.extend_from_slice(&make_box(b"skip", &[0xADu8; 16]));

        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");
        optimize_ok(&input, &output);

        let out = fs::read(&output).unwrap();
        let records = scan_boxes(&mut Cursor::new(out.clone())).unwrap();
        let fourccs: Vec<&[u8; 4]> = records.iter().map(|r| &r.fourcc).collect();
        assert_eq!(fourccs, vec![b"ftyp", b"moov", b"free", b"mdat", b"skip"]);

        // Non-moov payloads are byte-equal to the input's.
        let in_records = scan_boxes(&mut Cursor::new(bytes.clone())).unwrap();
        for fourcc in [b"ftyp", b"free", b"mdat", b"skip"] {
            let a = in_records.iter().find(|r| &r.fourcc == fourcc).unwrap();
            let b = records.iter().find(|r| &r.fourcc == fourcc).unwrap();
            assert_eq!(
                &bytes[a.payload_offset as usize..a.end_offset() as usize],
                &out[b.payload_offset as usize..b.end_offset() as usize],
                "payload mismatch for {}",
                mp4::fourcc_to_string(fourcc)
            );
        }
    }

    #[test]
    fn cancellation_removes_partial_output() {
        let dir = TempDir::new().unwrap();
        let bytes = make_unoptimized_file(&[32], &vec![0u8; 4096]);
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");

        let optimizer = Mp4Optimizer::new();
        optimizer.cancellation_token().cancel();

        let err = optimizer
            .optimize_blocking(&input, &output, |_| {})
            .unwrap_err();
        assert!(matches!(err, OptimizerError::Cancelled));
        assert!(!output.exists());
    }

    #[test]
    fn moov_cap_is_enforced() {
        let dir = TempDir::new().unwrap();
        let bytes = make_unoptimized_file(&[32], &vec![0u8; 100]);
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");

        let config = OptimizerConfig::builder().moov_size_cap(16).build();
        let err = Mp4Optimizer::with_config(config)
            .optimize_blocking(&input, &output, |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            OptimizerError::Mp4(Mp4Error::MoovTooLarge { cap: 16, .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn probes_fast_start_property() {
        let dir = TempDir::new().unwrap();
        let optimized = write_input(
            &dir,
            "opt.mp4",
            &make_optimized_file(&[100], &vec![0u8; 64]),
        );
        let unoptimized = write_input(
            &dir,
            "unopt.mp4",
            &make_unoptimized_file(&[32], &vec![0u8; 64]),
        );

        assert!(is_optimized(&optimized).unwrap());
        assert!(!is_optimized(&unoptimized).unwrap());

        let no_mdat = write_input(&dir, "bare.mp4", &make_box(b"ftyp", &[0u8; 16]));
        assert!(matches!(
            is_optimized(&no_mdat),
            Err(OptimizerError::Mp4(Mp4Error::MissingBox(_)))
        ));
    }

    #[test]
    fn optimizes_between_in_memory_streams() {
        let bytes = make_unoptimized_file(&[32, 500], &vec![0x27u8; 1000]);
        let mut reader = Cursor::new(bytes.to_vec());
        let mut out = Vec::new();

        Mp4Optimizer::new()
            .optimize_stream(&mut reader, &mut out, |_| {})
            .unwrap();

        let records = scan_boxes(&mut Cursor::new(out)).unwrap();
        let fourccs: Vec<&[u8; 4]> = records.iter().map(|r| &r.fourcc).collect();
        assert_eq!(fourccs, vec![b"ftyp", b"moov", b"mdat"]);
    }

    #[tokio::test]
    async fn worker_emits_monotone_progress_then_single_terminal() {
        let dir = TempDir::new().unwrap();
        let bytes = make_unoptimized_file(&[32, 600], &vec![0x33u8; 200_000]);
        let input = write_input(&dir, "in.mp4", &bytes);
        let output = dir.path().join("out.mp4");

        let optimizer = Mp4Optimizer::new();
        let mut rx = optimizer.optimize(&input, &output);

        let mut fractions = Vec::new();
        let mut terminal_seen = false;
        while let Some(event) = rx.recv().await {
            match event {
                OptimizerEvent::Progress(f) => {
                    assert!(!terminal_seen, "progress after terminal event");
                    fractions.push(f);
                }
                OptimizerEvent::Completed(path) => {
                    assert!(!terminal_seen, "second terminal event");
                    terminal_seen = true;
                    assert_eq!(path, output);
                }
                OptimizerEvent::Failed(e) => panic!("unexpected failure: {e}"),
            }
        }

        assert!(terminal_seen);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*fractions.last().unwrap(), 1.0);
        assert!(is_optimized(&output).unwrap());
    }

    #[tokio::test]
    async fn worker_reports_failure_as_terminal_event() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, "in.mp4", &make_box(b"ftyp", &[0u8; 16]));
        let output = dir.path().join("out.mp4");

        let optimizer = Mp4Optimizer::new();
        let mut rx = optimizer.optimize(&input, &output);

        let mut failures = 0;
        while let Some(event) = rx.recv().await {
            match event {
                OptimizerEvent::Failed(OptimizerError::Mp4(Mp4Error::MissingBox(_))) => {
                    failures += 1;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(failures, 1);
        assert!(!output.exists());
    }
}
