//! The converter role: turn the recorder's raw stream into sample files.
//!
//! Conversion runs until the recorder closes the stream. Samples are
//! aggregated in memory and written when the stream ends, or when it breaks
//! part-way, so that whatever was parsed is kept. Afterwards the JIT helper
//! gets its chance.

pub mod images;
pub mod rotation;
pub mod sample_files;

use log::{debug, info, warn};
use profsession_common::{
    Frame, FrameError, FrameReader, Record, SampleRecord, StreamHeader, SUPPORTED_SAMPLE_TYPE,
};
use std::io::{BufReader, Read};
use std::path::PathBuf;

use self::images::ImageTable;
use self::sample_files::{SampleKey, SampleSet, Separation};
use crate::domain::{ConvertError, KernelRange, Role};
use crate::ipc::StreamReader;
use crate::jit::{run_jit_bridge, JitRequest};
use crate::process::signals;
use crate::process::{ChildRole, EXIT_FAILURE, EXIT_REPORTED, EXIT_SUCCESS};

#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// `<session-dir>/oprofile_data/samples`
    pub samples_dir: PathBuf,
    pub append: bool,
    pub separation: Separation,
    /// Directory name used for kernel samples under `{kern}`
    pub kernel_image: String,
    /// JIT helper to run after conversion, if enabled
    pub jit: Option<JitRequest>,
}

/// What a completed conversion produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionSummary {
    pub records: u64,
    pub samples: u64,
    pub lost: u64,
    pub files: usize,
}

struct Conversion<'a> {
    header: &'a StreamHeader,
    separation: Separation,
    images: ImageTable,
    samples: SampleSet,
    lost: u64,
}

impl<'a> Conversion<'a> {
    fn new(header: &'a StreamHeader, separation: Separation) -> Self {
        let kernel = KernelRange { start: header.kernel_start, end: header.kernel_end };
        Self {
            header,
            separation,
            images: ImageTable::new(kernel),
            samples: SampleSet::default(),
            lost: 0,
        }
    }

    fn consume<R: Read>(&mut self, frames: &mut FrameReader<R>) -> Result<(), ConvertError> {
        loop {
            let frame = match frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(source) => return Err(ConvertError::Frame { frames: frames.frames_read(), source }),
            };
            self.apply(&frame)
                .map_err(|source| ConvertError::Frame { frames: frames.frames_read(), source })?;
        }
    }

    fn apply(&mut self, frame: &Frame) -> Result<(), FrameError> {
        match Record::decode(&frame.header, &frame.body, self.header.sample_type)? {
            Record::Sample(sample) => self.add_sample(frame.event, &sample),
            Record::Mmap(mmap) => self.images.add_mapping(&mmap),
            Record::Comm(comm) => self.images.set_comm(comm.pid, &comm.comm),
            Record::Fork(task) => self.images.fork(task.ppid, task.pid),
            Record::Lost { lost, .. } => self.lost += lost,
            Record::Exit(_) => {}
            Record::Unknown(kind) => debug!("Skipping record type {kind}"),
        }
        Ok(())
    }

    fn add_sample(&mut self, event: u32, sample: &SampleRecord) {
        let (image, offset) = self.images.resolve(sample.pid, sample.ip, sample.is_kernel());
        if let images::Image::Anon(pid) = image {
            debug!("Sample at {:#x} in pid {pid} ({}) has no mapping", sample.ip, self.images.comm(pid).unwrap_or("?"));
        }
        let key = SampleKey::new(image.clone(), event, sample.pid, sample.tid, sample.cpu, self.separation);

        // callchain[0] is the sampled address itself; record the arc from its
        // caller when both are in the same image
        if let Some(&caller) = sample.callchain.get(1) {
            let (caller_image, caller_offset) = self.images.resolve(sample.pid, caller, sample.is_kernel());
            if caller_image == image {
                self.samples.add_arc(key.clone(), caller_offset, offset);
            }
        }
        self.samples.add(key, offset);
    }
}

/// Rotate the samples directory, then read `stream` to its end and write
/// sample files.
///
/// # Errors
/// Returns an error if rotation fails, the header is unreadable, the stream
/// is corrupt, or a sample file cannot be written. Files for everything
/// parsed before a stream error are still written.
pub fn convert_stream<R: Read>(stream: R, config: &ConverterConfig) -> Result<ConversionSummary, ConvertError> {
    let current = rotation::prepare_samples_dir(&config.samples_dir, config.append)?;

    let mut reader = BufReader::new(stream);
    let header = StreamHeader::read_from(&mut reader)?;
    if header.sample_type & !SUPPORTED_SAMPLE_TYPE != 0 {
        return Err(ConvertError::UnsupportedSampleType(header.sample_type));
    }
    debug!("Successfully read header info for sample data ({} events)", header.events.len());

    let mut conversion = Conversion::new(&header, config.separation);
    let mut frames = FrameReader::new(reader);
    let consumed = conversion.consume(&mut frames);
    if consumed.is_err() {
        warn!("Sample stream ended abnormally; writing the {} samples parsed so far", conversion.samples.total());
    }

    let files = conversion.samples.write_to(&current, &config.kernel_image, &header.events)?;
    consumed?;

    if conversion.lost > 0 {
        warn!("{} samples were lost by the kernel", conversion.lost);
    }
    Ok(ConversionSummary {
        records: frames.frames_read(),
        samples: conversion.samples.total(),
        lost: conversion.lost,
        files,
    })
}

pub struct Converter {
    stream: StreamReader,
    config: ConverterConfig,
}

impl Converter {
    #[must_use]
    pub fn new(stream: StreamReader, config: ConverterConfig) -> Self {
        Self { stream, config }
    }
}

impl ChildRole for Converter {
    const ROLE: Role = Role::Converter;

    fn run(self) -> i32 {
        if let Err(e) = signals::ignore_interrupts() {
            eprintln!("converter: {e}");
            return EXIT_FAILURE;
        }

        match convert_stream(self.stream, &self.config) {
            Ok(summary) => info!(
                "Converted {} records: {} samples into {} files",
                summary.records, summary.samples, summary.files
            ),
            Err(e) if e.is_handled() => {
                debug!("No sample data to convert: {e}");
                return EXIT_REPORTED;
            }
            Err(e @ ConvertError::Header(_)) => {
                eprintln!("Error: {e}");
                return EXIT_FAILURE;
            }
            Err(e) => {
                eprintln!("Caught error while converting sample data: {e}");
                return EXIT_FAILURE;
            }
        }

        if let Some(jit) = &self.config.jit {
            debug!("Running JIT conversion helper {}", jit.helper.display());
            let outcome = run_jit_bridge(jit);
            debug!("JIT conversion finished: {outcome:?}");
        }
        EXIT_SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use profsession_common::{
        encode_mmap, encode_sample, write_frame, EventDesc, MmapRecord, PERF_RECORD_MISC_KERNEL,
        PERF_RECORD_MISC_USER, PERF_SAMPLE_CALLCHAIN,
    };
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn header(sample_type: u64) -> StreamHeader {
        StreamHeader {
            sample_type,
            callgraph: sample_type & PERF_SAMPLE_CALLCHAIN != 0,
            kernel_start: 0xffff_ffff_8100_0000,
            kernel_end: 0xffff_ffff_8200_0000,
            events: vec![EventDesc { name: "CPU_CLK_UNHALTED".into(), count: 100_000, unit_mask: 0, code: 0x3c }],
        }
    }

    fn config(dir: &TempDir) -> ConverterConfig {
        ConverterConfig {
            samples_dir: dir.path().join("samples"),
            append: false,
            separation: Separation::default(),
            kernel_image: "vmlinux".into(),
            jit: None,
        }
    }

    fn sample(pid: u32, ip: u64, misc: u16) -> SampleRecord {
        SampleRecord { misc, ip, pid, tid: pid, time: 1, cpu: 0, period: 100_000, callchain: Vec::new() }
    }

    fn stream(sample_type: u64, records: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        header(sample_type).write_to(&mut buf).unwrap();
        for record in records {
            write_frame(&mut buf, 0, record).unwrap();
        }
        buf
    }

    fn app_mmap() -> Vec<u8> {
        encode_mmap(&MmapRecord {
            pid: 100,
            tid: 100,
            addr: 0x40_0000,
            len: 0x1000,
            pgoff: 0,
            filename: "/usr/bin/app".into(),
        })
    }

    const FILE: &str = "CPU_CLK_UNHALTED.100000.0.all.all.all";

    #[test]
    fn test_samples_attributed_to_images() {
        let dir = TempDir::new().unwrap();
        let st = SUPPORTED_SAMPLE_TYPE & !PERF_SAMPLE_CALLCHAIN;
        let data = stream(
            st,
            &[
                app_mmap(),
                encode_sample(st, &sample(100, 0x40_0010, PERF_RECORD_MISC_USER)),
                encode_sample(st, &sample(100, 0x40_0010, PERF_RECORD_MISC_USER)),
                encode_sample(st, &sample(100, 0xffff_ffff_8100_0040, PERF_RECORD_MISC_KERNEL)),
                encode_sample(st, &sample(100, 0x7000_0000, PERF_RECORD_MISC_USER)),
            ],
        );

        let summary = convert_stream(Cursor::new(data), &config(&dir)).unwrap();
        assert_eq!(summary.samples, 4);
        assert_eq!(summary.files, 3);

        let current = dir.path().join("samples/current");
        let app = fs::read_to_string(current.join("{root}/usr/bin/app").join(FILE)).unwrap();
        assert_eq!(app, "0x10 2\n");
        assert!(current.join("{kern}/vmlinux").join(FILE).exists());
        assert!(current.join("{anon}/100").join(FILE).exists());
    }

    #[test]
    fn test_callchain_produces_arcs() {
        let dir = TempDir::new().unwrap();
        let st = SUPPORTED_SAMPLE_TYPE;
        let mut s = sample(100, 0x40_0010, PERF_RECORD_MISC_USER);
        s.callchain = vec![0x40_0010, 0x40_0200];
        let data = stream(st, &[app_mmap(), encode_sample(st, &s)]);

        convert_stream(Cursor::new(data), &config(&dir)).unwrap();
        let arcs = dir.path().join("samples/current/{root}/usr/bin/app").join(format!("{FILE}.arcs"));
        assert_eq!(fs::read_to_string(arcs).unwrap(), "0x200 0x10 1\n");
    }

    #[test]
    fn test_empty_stream_is_handled() {
        let dir = TempDir::new().unwrap();
        let err = convert_stream(Cursor::new(Vec::new()), &config(&dir)).unwrap_err();
        assert!(err.is_handled());
        // Rotation already happened
        assert!(dir.path().join("samples/current").is_dir());
    }

    #[test]
    fn test_truncated_stream_keeps_parsed_samples() {
        let dir = TempDir::new().unwrap();
        let st = SUPPORTED_SAMPLE_TYPE & !PERF_SAMPLE_CALLCHAIN;
        let mut data = stream(st, &[app_mmap(), encode_sample(st, &sample(100, 0x40_0010, PERF_RECORD_MISC_USER))]);
        let tail = encode_sample(st, &sample(100, 0x40_0020, PERF_RECORD_MISC_USER));
        write_frame(&mut data, 0, &tail[..tail.len() - 4]).unwrap();

        let err = convert_stream(Cursor::new(data), &config(&dir)).unwrap_err();
        assert!(matches!(err, ConvertError::Frame { frames: 2, .. }));
        assert!(!err.is_handled());
        let app = dir.path().join("samples/current/{root}/usr/bin/app").join(FILE);
        assert_eq!(fs::read_to_string(app).unwrap(), "0x10 1\n");
    }

    #[test]
    fn test_second_session_rotates_first() {
        let dir = TempDir::new().unwrap();
        let st = SUPPORTED_SAMPLE_TYPE & !PERF_SAMPLE_CALLCHAIN;
        let data = stream(st, &[app_mmap(), encode_sample(st, &sample(100, 0x40_0010, PERF_RECORD_MISC_USER))]);

        convert_stream(Cursor::new(data.clone()), &config(&dir)).unwrap();
        convert_stream(Cursor::new(data), &config(&dir)).unwrap();

        let rel = std::path::Path::new("{root}/usr/bin/app").join(FILE);
        let samples = dir.path().join("samples");
        assert_eq!(fs::read_to_string(samples.join("current").join(&rel)).unwrap(), "0x10 1\n");
        assert_eq!(fs::read_to_string(samples.join("previous").join(&rel)).unwrap(), "0x10 1\n");
    }

    #[test]
    fn test_append_merges_counts() {
        let dir = TempDir::new().unwrap();
        let st = SUPPORTED_SAMPLE_TYPE & !PERF_SAMPLE_CALLCHAIN;
        let data = stream(st, &[app_mmap(), encode_sample(st, &sample(100, 0x40_0010, PERF_RECORD_MISC_USER))]);

        convert_stream(Cursor::new(data.clone()), &config(&dir)).unwrap();
        let mut append = config(&dir);
        append.append = true;
        convert_stream(Cursor::new(data), &append).unwrap();

        let app = dir.path().join("samples/current/{root}/usr/bin/app").join(FILE);
        assert_eq!(fs::read_to_string(app).unwrap(), "0x10 2\n");
        assert!(!dir.path().join("samples/previous").exists());
    }
}
