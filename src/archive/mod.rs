//! Archive writers and readers for offline datafiles

pub mod compression;
pub mod docker_save;
pub mod single;
pub mod tar_writer;

pub use compression::Compressor;
pub use docker_save::{DockerTarWriter, LoadTarget};
pub use single::SingleTarWriter;
pub use tar_writer::{CompressedTarReader, CompressedTarWriter};

use crate::error::{Result, TransmitError};
use std::io::{self, Read, Write};

/// The one shape every archive variant shares: write a named member of a
/// declared size from a stream, and a close/flush protocol.
pub trait ArchiveWriter: Send {
    fn append_file_stream(&mut self, name: &str, size: i64, reader: &mut dyn Read) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// The docker-save variant exposes itself for trailing metadata.
    fn as_docker(&mut self) -> Option<&mut DockerTarWriter> {
        None
    }
}

/// Append a tar member and verify the stream delivered exactly the
/// declared byte count.
pub(crate) fn append_counted<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: i64,
    reader: &mut dyn Read,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut counted = CountingReader { inner: reader, count: 0 };
    builder.append_data(&mut header, name, (&mut counted).take(size as u64))?;

    if counted.count != size as u64 {
        return Err(TransmitError::Integrity(format!(
            "blob {} size mismatch, declared: {}, copied: {}",
            name, size, counted.count
        )));
    }
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
