//! Compressor selection for archive datafiles

use crate::error::{Result, TransmitError};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::str::FromStr;

/// Archive format of a save run's datafiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Tar,
    Gzip,
    Zstd,
    Xz,
    Lz4,
    Squashfs,
}

impl Compressor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compressor::Tar => "tar",
            Compressor::Gzip => "gzip",
            Compressor::Zstd => "zstd",
            Compressor::Xz => "xz",
            Compressor::Lz4 => "lz4",
            Compressor::Squashfs => "squashfs",
        }
    }

    /// Datafile extension; doubles as the meta-file compressor value.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compressor {
    type Err = TransmitError;

    fn from_str(s: &str) -> Result<Compressor> {
        match s {
            "tar" => Ok(Compressor::Tar),
            "gzip" => Ok(Compressor::Gzip),
            "zstd" => Ok(Compressor::Zstd),
            "xz" => Ok(Compressor::Xz),
            "lz4" => Ok(Compressor::Lz4),
            "squashfs" => Ok(Compressor::Squashfs),
            other => Err(TransmitError::Config(format!(
                "unknown compression format: {}",
                other
            ))),
        }
    }
}

/// A compressing writer that must be finalized explicitly so trailing
/// frames reach the file.
pub trait FinishWrite: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl FinishWrite for File {
    fn finish(self: Box<Self>) -> io::Result<()> {
        self.sync_all()
    }
}

impl FinishWrite for flate2::write::GzEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.sync_all()
    }
}

impl FinishWrite for zstd::stream::write::Encoder<'static, File> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.sync_all()
    }
}

impl FinishWrite for xz2::write::XzEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.sync_all()
    }
}

impl FinishWrite for lz4_flex::frame::FrameEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        (*self)
            .finish()
            .map_err(io::Error::other)?
            .sync_all()
    }
}

/// Wrap a fresh datafile in the chosen compressor.
pub fn compress_writer(file: File, compressor: Compressor) -> Result<Box<dyn FinishWrite>> {
    Ok(match compressor {
        Compressor::Tar => Box::new(file),
        Compressor::Gzip => Box::new(flate2::write::GzEncoder::new(
            file,
            flate2::Compression::default(),
        )),
        Compressor::Zstd => Box::new(zstd::stream::write::Encoder::new(file, 0)?),
        Compressor::Xz => Box::new(xz2::write::XzEncoder::new(file, 6)),
        Compressor::Lz4 => Box::new(lz4_flex::frame::FrameEncoder::new(file)),
        Compressor::Squashfs => {
            return Err(TransmitError::Config(
                "squashfs datafiles are produced by the layer engine, not a tar writer".to_string(),
            ));
        }
    })
}

/// Open an existing datafile for decompression.
pub fn compress_reader(file: File, compressor: Compressor) -> Result<Box<dyn Read + Send>> {
    Ok(match compressor {
        Compressor::Tar => Box::new(file),
        Compressor::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compressor::Zstd => Box::new(zstd::stream::read::Decoder::new(file)?),
        Compressor::Xz => Box::new(xz2::read::XzDecoder::new(file)),
        Compressor::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(file)),
        Compressor::Squashfs => {
            return Err(TransmitError::Config(
                "squashfs datafiles are read through the layer engine".to_string(),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for name in ["tar", "gzip", "zstd", "xz", "lz4", "squashfs"] {
            assert_eq!(name.parse::<Compressor>().unwrap().as_str(), name);
        }
        assert!("brotli".parse::<Compressor>().is_err());
    }
}
