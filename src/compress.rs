//! The compression tag attached to a [`Blob`](crate::catalog::model::Blob),
//! and streaming (de)compressors used while writing/reading blob bodies.
//!
//! Mirrors the way `pack.rs`'s `PackfileWriter` wraps a plain writer with a
//! streaming `zstd::Encoder`, generalized to the handful of tags the
//! configuration can select between via `get_compress_method_from_size`.

use std::fmt;
use std::io::{self, Read, Write};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// One of the compression tags a [`Blob`](crate::catalog::model::Blob) can
/// be stored under.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressMethod {
    Plain,
    Gzip,
    Zstd,
    Lzma,
}

impl fmt::Display for CompressMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressMethod::Plain => "plain",
            CompressMethod::Gzip => "gzip",
            CompressMethod::Zstd => "zstd",
            CompressMethod::Lzma => "lzma",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CompressMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "plain" => CompressMethod::Plain,
            "gzip" => CompressMethod::Gzip,
            "zstd" => CompressMethod::Zstd,
            "lzma" => CompressMethod::Lzma,
            other => bail!("Unknown compression method {other}"),
        })
    }
}

const ZSTD_LEVEL: i32 = 3;

/// A streaming compressor over some inner writer (a blob-store file or a
/// temp file). Dropping without calling [`finish`](Self::finish) may lose
/// buffered bytes; callers must always call `finish()`.
pub enum CompressWriter<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lzma(xz2::write::XzEncoder<W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(method: CompressMethod, inner: W) -> Result<Self> {
        Ok(match method {
            CompressMethod::Plain => CompressWriter::Plain(inner),
            CompressMethod::Gzip => {
                CompressWriter::Gzip(flate2::write::GzEncoder::new(inner, flate2::Compression::default()))
            }
            CompressMethod::Zstd => {
                CompressWriter::Zstd(zstd::stream::write::Encoder::new(inner, ZSTD_LEVEL)?)
            }
            CompressMethod::Lzma => {
                CompressWriter::Lzma(xz2::write::XzEncoder::new(inner, 6))
            }
        })
    }

    /// Flushes and unwraps the inner writer. The number of bytes the inner
    /// writer received is the blob's `stored_size`.
    pub fn finish(self) -> Result<W> {
        Ok(match self {
            CompressWriter::Plain(w) => w,
            CompressWriter::Gzip(e) => e.finish()?,
            CompressWriter::Zstd(e) => e.finish()?,
            CompressWriter::Lzma(e) => e.finish()?,
        })
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressWriter::Plain(w) => w.write(buf),
            CompressWriter::Gzip(e) => e.write(buf),
            CompressWriter::Zstd(e) => e.write(buf),
            CompressWriter::Lzma(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressWriter::Plain(w) => w.flush(),
            CompressWriter::Gzip(e) => e.flush(),
            CompressWriter::Zstd(e) => e.flush(),
            CompressWriter::Lzma(e) => e.flush(),
        }
    }
}

/// A streaming decompressor, used by tests and by any future verification
/// pass that wants to check a blob's on-disk bytes decompress to the
/// fingerprinted content.
pub enum DecompressReader<R: Read> {
    Plain(R),
    Gzip(flate2::read::GzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, io::BufReader<R>>),
    Lzma(xz2::read::XzDecoder<R>),
}

impl<R: Read> DecompressReader<R> {
    pub fn new(method: CompressMethod, inner: R) -> Result<Self> {
        Ok(match method {
            CompressMethod::Plain => DecompressReader::Plain(inner),
            CompressMethod::Gzip => DecompressReader::Gzip(flate2::read::GzDecoder::new(inner)),
            CompressMethod::Zstd => {
                DecompressReader::Zstd(zstd::stream::read::Decoder::new(inner)?)
            }
            CompressMethod::Lzma => DecompressReader::Lzma(xz2::read::XzDecoder::new(inner)),
        })
    }
}

impl<R: Read> Read for DecompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressReader::Plain(r) => r.read(buf),
            DecompressReader::Gzip(r) => r.read(buf),
            DecompressReader::Zstd(r) => r.read(buf),
            DecompressReader::Lzma(r) => r.read(buf),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_round_trips() -> Result<()> {
        let mut w = CompressWriter::new(CompressMethod::Plain, Vec::new())?;
        w.write_all(b"hello")?;
        let buf = w.finish()?;

        let mut r = DecompressReader::new(CompressMethod::Plain, buf.as_slice())?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        assert_eq!(out, b"hello");
        Ok(())
    }

    #[test]
    fn zstd_round_trips() -> Result<()> {
        let mut w = CompressWriter::new(CompressMethod::Zstd, Vec::new())?;
        w.write_all(b"hello, zstd")?;
        let buf = w.finish()?;
        assert_ne!(buf, b"hello, zstd");

        let mut r = DecompressReader::new(CompressMethod::Zstd, buf.as_slice())?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        assert_eq!(out, b"hello, zstd");
        Ok(())
    }

    #[test]
    fn gzip_round_trips() -> Result<()> {
        let mut w = CompressWriter::new(CompressMethod::Gzip, Vec::new())?;
        w.write_all(b"hello, gzip")?;
        let buf = w.finish()?;

        let mut r = DecompressReader::new(CompressMethod::Gzip, buf.as_slice())?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        assert_eq!(out, b"hello, gzip");
        Ok(())
    }

    #[test]
    fn lzma_round_trips() -> Result<()> {
        let mut w = CompressWriter::new(CompressMethod::Lzma, Vec::new())?;
        w.write_all(b"hello, lzma")?;
        let buf = w.finish()?;

        let mut r = DecompressReader::new(CompressMethod::Lzma, buf.as_slice())?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        assert_eq!(out, b"hello, lzma");
        Ok(())
    }
}
