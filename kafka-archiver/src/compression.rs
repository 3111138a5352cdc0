use std::fmt;
use std::io::{self, Read, Write};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::ConfigError;

/// Codec applied to batch files before upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Snappy,
}

const CODECS: &[(&str, CompressionType)] = &[
    ("none", CompressionType::None),
    ("gzip", CompressionType::Gzip),
    ("snappy", CompressionType::Snappy),
];

impl CompressionType {
    /// Looks a codec up by name, ignoring case
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        let wanted = name.trim();
        CODECS
            .iter()
            .find(|(codec_name, _)| codec_name.eq_ignore_ascii_case(wanted))
            .map(|(_, codec)| *codec)
            .ok_or_else(|| ConfigError::UnknownCompression(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Snappy => "snappy",
        }
    }

    /// File extension including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => ".txt",
            CompressionType::Gzip => ".gz",
            CompressionType::Snappy => ".snappy",
        }
    }

    pub fn wrap_writer<W: Write>(&self, inner: W) -> CompressedWriter<W> {
        match self {
            CompressionType::None => CompressedWriter::Plain(inner),
            CompressionType::Gzip => {
                CompressedWriter::Gzip(GzEncoder::new(inner, Compression::default()))
            }
            CompressionType::Snappy => {
                CompressedWriter::Snappy(snap::write::FrameEncoder::new(inner))
            }
        }
    }

    pub fn wrap_reader<'a, R: Read + 'a>(&self, inner: R) -> Box<dyn Read + 'a> {
        match self {
            CompressionType::None => Box::new(inner),
            CompressionType::Gzip => Box::new(MultiGzDecoder::new(inner)),
            CompressionType::Snappy => Box::new(snap::read::FrameDecoder::new(inner)),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A write stream with one of the supported codecs applied.
///
/// `finish` must be called to write the codec trailer; dropping the writer leaves a truncated
/// stream behind.
pub enum CompressedWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Snappy(snap::write::FrameEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Terminates the compressed stream and hands back the underlying writer, flushed
    pub fn finish(self) -> io::Result<W> {
        let mut inner = match self {
            CompressedWriter::Plain(w) => w,
            CompressedWriter::Gzip(encoder) => encoder.finish()?,
            CompressedWriter::Snappy(encoder) => encoder
                .into_inner()
                .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))?,
        };
        inner.flush()?;
        Ok(inner)
    }

    pub fn get_ref(&self) -> &W {
        match self {
            CompressedWriter::Plain(w) => w,
            CompressedWriter::Gzip(encoder) => encoder.get_ref(),
            CompressedWriter::Snappy(encoder) => encoder.get_ref(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Gzip(encoder) => encoder.write(buf),
            CompressedWriter::Snappy(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Gzip(encoder) => encoder.flush(),
            CompressedWriter::Snappy(encoder) => encoder.flush(),
        }
    }
}
