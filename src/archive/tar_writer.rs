//! Compressed tar datafile writer and reader

use crate::archive::compression::{self, Compressor, FinishWrite};
use crate::archive::{append_counted, ArchiveWriter};
use crate::error::{Result, TransmitError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// One worker's datafile: a tar stream wrapped in the run's compressor.
pub struct CompressedTarWriter {
    builder: Option<tar::Builder<Box<dyn FinishWrite>>>,
    path: PathBuf,
}

impl CompressedTarWriter {
    pub fn new(path: impl Into<PathBuf>, compressor: Compressor) -> Result<CompressedTarWriter> {
        let path = path.into();
        let file = File::create(&path)?;
        let writer = compression::compress_writer(file, compressor)?;
        Ok(CompressedTarWriter {
            builder: Some(tar::Builder::new(writer)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn builder(&mut self) -> Result<&mut tar::Builder<Box<dyn FinishWrite>>> {
        self.builder
            .as_mut()
            .ok_or_else(|| TransmitError::Io(format!("writer for {} already closed", self.path.display())))
    }
}

impl ArchiveWriter for CompressedTarWriter {
    /// Write a tar header for `name` and stream exactly `size` bytes; a
    /// short or long stream is an integrity error.
    fn append_file_stream(&mut self, name: &str, size: i64, reader: &mut dyn Read) -> Result<()> {
        append_counted(self.builder()?, name, size, reader)
    }

    /// Terminate the tar stream and flush the compressor.
    fn close(&mut self) -> Result<()> {
        if let Some(builder) = self.builder.take() {
            let writer = builder.into_inner()?;
            writer.finish()?;
        }
        Ok(())
    }
}

impl Drop for CompressedTarWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Sequential reader over one datafile. Blobs are located by digest-hex
/// prefix, so both current and legacy suffixes match.
pub struct CompressedTarReader {
    archive: tar::Archive<Box<dyn Read + Send>>,
}

impl CompressedTarReader {
    pub fn new(path: &Path, compressor: Compressor) -> Result<CompressedTarReader> {
        let file = File::open(path)?;
        let reader = compression::compress_reader(file, compressor)?;
        Ok(CompressedTarReader {
            archive: tar::Archive::new(reader),
        })
    }

    /// Scan for the first entry whose name starts with `prefix` and copy
    /// its bytes into `sink`. Returns the entry's name and size, or None
    /// when the archive is exhausted first. Consumes the reader; open a
    /// fresh one per lookup.
    pub fn copy_blob_to(
        mut self,
        prefix: &str,
        sink: &mut dyn Write,
    ) -> Result<Option<(String, i64)>> {
        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().to_string();
            if name.starts_with(prefix) {
                let size = entry.header().size()? as i64;
                io::copy(&mut entry, sink)?;
                return Ok(Some((name, size)));
            }
        }
        Ok(None)
    }
}
