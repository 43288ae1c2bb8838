//! Whole-file compression codecs for record containers

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::str::FromStr;

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression applied to a whole record file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionType {
    /// Uncompressed
    #[default]
    None,

    /// ZLIB stream
    Zlib,

    /// GZIP stream
    Gzip,
}

impl FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(CompressionType::None),
            "ZLIB" => Ok(CompressionType::Zlib),
            "GZIP" => Ok(CompressionType::Gzip),
            other => Err(Error::InvalidArgument(format!(
                "unsupported compression type `{other}`, expected \"\", \"ZLIB\" or \"GZIP\""
            ))),
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressionType::None => "",
            CompressionType::Zlib => "ZLIB",
            CompressionType::Gzip => "GZIP",
        })
    }
}

impl CompressionType {
    /// Wrap an open file in the matching decoder
    pub fn decoder(self, file: File, buffer_size: usize) -> BufReader<Box<dyn Read + Send>> {
        let raw: Box<dyn Read + Send> = match self {
            CompressionType::None => Box::new(file),
            CompressionType::Zlib => Box::new(ZlibDecoder::new(file)),
            CompressionType::Gzip => Box::new(GzDecoder::new(file)),
        };
        BufReader::with_capacity(buffer_size, raw)
    }

    /// Wrap an open file in the matching encoder
    pub fn encoder(self, file: File) -> Encoder {
        let file = BufWriter::new(file);
        match self {
            CompressionType::None => Encoder::Plain(file),
            CompressionType::Zlib => Encoder::Zlib(ZlibEncoder::new(file, Compression::default())),
            CompressionType::Gzip => Encoder::Gzip(GzEncoder::new(file, Compression::default())),
        }
    }
}

/// A file writer applying one of the supported codecs
pub enum Encoder {
    /// Uncompressed
    Plain(BufWriter<File>),

    /// ZLIB stream
    Zlib(ZlibEncoder<BufWriter<File>>),

    /// GZIP stream
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Encoder {
    /// Write any trailer and flush the file
    pub fn finish(self) -> Result<()> {
        let mut file = match self {
            Encoder::Plain(w) => w,
            Encoder::Zlib(w) => w.finish().map_err(|e| Error::Compression(e.to_string()))?,
            Encoder::Gzip(w) => w.finish().map_err(|e| Error::Compression(e.to_string()))?,
        };
        file.flush()?;
        Ok(())
    }
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Zlib(w) => w.write(buf),
            Encoder::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Zlib(w) => w.flush(),
            Encoder::Gzip(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("".parse::<CompressionType>().unwrap(), CompressionType::None);
        assert_eq!("ZLIB".parse::<CompressionType>().unwrap(), CompressionType::Zlib);
        assert_eq!("GZIP".parse::<CompressionType>().unwrap(), CompressionType::Gzip);
        assert!(matches!("gzip".parse::<CompressionType>(), Err(Error::InvalidArgument(_))));
        assert_eq!(CompressionType::Zlib.to_string(), "ZLIB");
    }
}
