// Output sink: one append-only text file per (run, device), one line per sample.
//
// Lines are written with a single unbuffered write each, so every sample is in the file as soon as
// `append()` returns and nothing is held back between samples.

use crate::error::{Error, Result};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const POWER_PREFIX: &str = "power_usage";
pub const ENERGY_PREFIX: &str = "gpu_usage";

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub value: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LineFormat {
    // `<timestamp_ms>,<value>`
    Timestamped,
    // `<value>`, the old power-only format
    Legacy,
}

// The backend reports mW and mJ.
pub fn milli_to_unit(n: u64) -> f64 {
    n as f64 / 1000.0
}

pub fn format_line(sample: &Sample, format: LineFormat) -> String {
    match format {
        LineFormat::Timestamped => format!("{},{:.3}\n", sample.timestamp_ms, sample.value),
        LineFormat::Legacy => format!("{:.3}\n", sample.value),
    }
}

// `<directory>/<prefix>_rank<rank>_gpu<device>.txt`.  Concurrent samplers must use distinct
// (rank, device) pairs or distinct directories, or their lines will interleave.
pub fn output_path(directory: &Path, prefix: &str, rank: u32, device: u32) -> PathBuf {
    directory.join(format!("{prefix}_rank{rank}_gpu{device}.txt"))
}

pub struct OutputSink {
    path: PathBuf,
    format: LineFormat,
    file: File,
}

impl OutputSink {
    pub fn open(path: &Path, format: LineFormat) -> Result<OutputSink> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::io(path, e))?;
        Ok(OutputSink {
            path: path.to_path_buf(),
            format,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, sample: &Sample) -> Result<()> {
        let line = format_line(sample, self.format);
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| Error::io(&self.path, e))
    }

    pub fn close(mut self) -> Result<PathBuf> {
        self.file.flush().map_err(|e| Error::io(&self.path, e))?;
        Ok(self.path)
    }
}

#[test]
pub fn test_unit_conversion() {
    let s = Sample {
        timestamp_ms: 17,
        value: milli_to_unit(125000),
    };
    assert!(format_line(&s, LineFormat::Legacy) == "125.000\n");
    let s = Sample {
        timestamp_ms: 1700000000123,
        value: milli_to_unit(4500000),
    };
    assert!(format_line(&s, LineFormat::Timestamped) == "1700000000123,4500.000\n");
    let s = Sample {
        timestamp_ms: 5,
        value: milli_to_unit(1),
    };
    assert!(format_line(&s, LineFormat::Timestamped) == "5,0.001\n");
}

#[test]
pub fn test_output_path() {
    let p = output_path(Path::new("."), POWER_PREFIX, 3, 1);
    assert!(p == Path::new("./power_usage_rank3_gpu1.txt"));
    let p = output_path(Path::new("/scratch/run"), ENERGY_PREFIX, 0, 0);
    assert!(p == Path::new("/scratch/run/gpu_usage_rank0_gpu0.txt"));
}

#[test]
pub fn test_sink_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = output_path(dir.path(), POWER_PREFIX, 0, 0);
    std::fs::write(&path, "1,1.000\n").unwrap();
    let mut sink = OutputSink::open(&path, LineFormat::Timestamped).unwrap();
    sink.append(&Sample {
        timestamp_ms: 2,
        value: 2.5,
    })
    .unwrap();
    assert!(sink.close().unwrap() == path);
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text == "1,1.000\n2,2.500\n");
}

#[test]
pub fn test_sink_open_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no/such/dir/x.txt");
    match OutputSink::open(&path, LineFormat::Timestamped) {
        Err(Error::Io { path: p, .. }) => assert!(p == path),
        _ => assert!(false),
    }
}
