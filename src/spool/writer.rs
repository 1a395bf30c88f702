use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::sample::Sample;
use crate::spool::format;

/// Single-writer append end of a spool file.
///
/// The orchestrator is the only writer; once the session's rounds are done
/// the file is flushed and handed to a [`SpoolReader`] for the post-pass.
pub struct SpoolWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    samples_written: u64,
}

impl SpoolWriter {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        format::write_header(&mut writer)?;
        Ok(Self {
            writer,
            path,
            samples_written: 0,
        })
    }

    pub fn append(&mut self, sample: &Sample) -> std::io::Result<()> {
        format::write_sample(&mut self.writer, sample)?;
        self.samples_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and reopen the spool for the post-pass.
    pub fn into_reader(mut self) -> std::io::Result<SpoolReader> {
        self.writer.flush()?;
        SpoolReader::open(&self.path)
    }
}

/// Single-reader end of a spool file. Validates the header on open and
/// yields samples in append order; a truncated tail reads as EOF.
pub struct SpoolReader {
    reader: BufReader<File>,
}

impl SpoolReader {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let (magic, version) = format::read_header(&mut reader)?;
        if magic.as_bytes() != format::MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("not a spool file (magic {magic:?})"),
            ));
        }
        if version != format::VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported spool version {version}"),
            ));
        }
        Ok(Self { reader })
    }

    pub fn next_sample(&mut self) -> std::io::Result<Option<Sample>> {
        format::read_sample(&mut self.reader)
    }

    /// Drain the remaining samples into a vector.
    pub fn read_all(&mut self) -> std::io::Result<Vec<Sample>> {
        let mut samples = Vec::new();
        while let Some(sample) = self.next_sample()? {
            samples.push(sample);
        }
        Ok(samples)
    }
}
