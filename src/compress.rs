use std::fmt;
use std::io::{self, Read, Write};

use serde::Serialize;

use crate::error::FormatError;

const ZSTD_LEVEL: i32 = 3;

/// Compression applied to every payload segment of one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionKind {
    Gzip = 0,
    Bzip2 = 1,
    Zstd = 2,
}

impl CompressionKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionKind {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Gzip),
            1 => Ok(Self::Bzip2),
            2 => Ok(Self::Zstd),
            other => Err(FormatError::UnknownCompression(other)),
        }
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Zstd => "zstd",
        };
        f.pad(name)
    }
}

/// A streaming compressor for one of the supported kinds.
///
/// Must be closed with [`Encoder::finish`]; dropping it may leave a truncated stream.
pub enum Encoder<W: Write> {
    Gzip(flate2::write::GzEncoder<W>),
    Bzip2(bzip2::write::BzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(kind: CompressionKind, writer: W) -> io::Result<Self> {
        Ok(match kind {
            CompressionKind::Gzip => Self::Gzip(flate2::write::GzEncoder::new(
                writer,
                flate2::Compression::default(),
            )),
            CompressionKind::Bzip2 => Self::Bzip2(bzip2::write::BzEncoder::new(
                writer,
                bzip2::Compression::best(),
            )),
            CompressionKind::Zstd => {
                Self::Zstd(zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?)
            }
        })
    }

    /// Flush the trailer and hand back the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(e) => e.finish(),
            Self::Bzip2(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(e) => e.write(buf),
            Self::Bzip2(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(e) => e.flush(),
            Self::Bzip2(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
        }
    }
}

/// Open a decompressor over `reader` that stops at the end of the first stream.
pub fn decoder<'a, R: Read + 'a>(kind: CompressionKind, reader: R) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match kind {
        CompressionKind::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        CompressionKind::Bzip2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        CompressionKind::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?.single_frame()),
    })
}

/// Compress an in-memory buffer into a fresh vector.
pub fn compress_bytes(kind: CompressionKind, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(kind, Vec::with_capacity(data.len() / 2 + 64))?;
    encoder.write_all(data)?;
    encoder.finish()
}

/// Compress everything `reader` yields into `writer`. Returns the uncompressed byte count.
pub fn compress_stream<R: Read, W: Write>(
    kind: CompressionKind,
    reader: &mut R,
    writer: W,
) -> io::Result<u64> {
    let mut encoder = Encoder::new(kind, writer)?;
    let copied = io::copy(reader, &mut encoder)?;
    encoder.finish()?;
    Ok(copied)
}

/// Decompress one stream from `reader` into `writer`. Returns the decompressed byte count.
pub fn decompress_stream<R: Read, W: Write>(
    kind: CompressionKind,
    reader: R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut decoder = decoder(kind, reader)?;
    io::copy(&mut decoder, writer)
}
