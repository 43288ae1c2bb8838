//! Length-prefixed record container
//!
//! Each entry is framed as:
//! - 8 bytes: payload length (u64 little endian)
//! - 4 bytes: masked CRC32C of the length bytes
//! - N bytes: payload
//! - 4 bytes: masked CRC32C of the payload
//!
//! With ZLIB or GZIP compression the whole framed file is compressed.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ml_input_core::error::Result as CoreResult;
use ml_input_core::{DType, Dataset, DatasetBase, RecordIterator, Signature, TensorSpec};

use crate::common::{to_paths, FileReader, FileRecordIterator};
use crate::compression::{CompressionType, Encoder};
use crate::error::{Error, Result};

/// CRC32C (Castagnoli) lookup table, reflected polynomial 0x82f63b78
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ 0x82f6_3b78 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

const MASK_DELTA: u32 = 0xa282_ead8;

/// Compute the CRC32C checksum of `data`
pub fn crc32c(data: &[u8]) -> u32 {
    !data.iter().fold(!0u32, |crc, &b| {
        CRC32C_TABLE[((crc ^ u32::from(b)) & 0xff) as usize] ^ (crc >> 8)
    })
}

/// Mask a CRC so that checksums of data containing CRCs stay well distributed
pub fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Options for reading and writing record containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TfRecordOptions {
    /// Whole-file compression
    pub compression: CompressionType,

    /// Read buffer size in bytes
    pub buffer_size: usize,
}

impl Default for TfRecordOptions {
    fn default() -> Self {
        Self {
            compression: CompressionType::None,
            buffer_size: 256 * 1024,
        }
    }
}

impl TfRecordOptions {
    /// Options with the given compression and default buffering
    pub fn with_compression(compression: CompressionType) -> Self {
        Self {
            compression,
            ..Self::default()
        }
    }
}

/// Fill `buf` completely, returning false if the stream ended before any byte
fn read_full(reader: &mut impl Read, buf: &mut [u8], what: &str) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(Error::Format(format!("truncated record: incomplete {what}"))),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::InvalidInput || e.kind() == ErrorKind::InvalidData => {
                return Err(Error::Compression(e.to_string()))
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(true)
}

fn read_checked_crc(reader: &mut impl Read, data: &[u8], what: &str) -> Result<()> {
    let mut crc = [0u8; 4];
    if !read_full(reader, &mut crc, what)? {
        return Err(Error::Format(format!("truncated record: missing {what}")));
    }
    let expected = u32::from_le_bytes(crc);
    let actual = mask_crc(crc32c(data));
    if expected != actual {
        return Err(Error::Format(format!(
            "corrupted record: {what} mismatch (stored {expected:#010x}, computed {actual:#010x})"
        )));
    }
    Ok(())
}

/// Reads the framed entries of one file
struct TfRecordReader {
    reader: BufReader<Box<dyn Read + Send>>,
    /// Upper bound on the initial payload allocation
    buffer_size: usize,
}

impl TfRecordReader {
    fn open(path: &Path, options: TfRecordOptions) -> Result<Self> {
        let file = File::open(path)?;
        let buffer_size = options.buffer_size.max(1);
        Ok(Self {
            reader: options.compression.decoder(file, buffer_size),
            buffer_size,
        })
    }
}

impl FileReader for TfRecordReader {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 8];
        if !read_full(&mut self.reader, &mut header, "length")? {
            return Ok(None);
        }
        read_checked_crc(&mut self.reader, &header, "length crc")?;
        let stored = u64::from_le_bytes(header);
        let length = usize::try_from(stored)
            .map_err(|_| Error::Format("record length does not fit in memory".into()))?;
        // allocation grows only with the bytes actually present
        let mut payload = Vec::with_capacity(length.min(self.buffer_size));
        (&mut self.reader)
            .take(stored)
            .read_to_end(&mut payload)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidInput | ErrorKind::InvalidData => Error::Compression(e.to_string()),
                _ => Error::Io(e),
            })?;
        if payload.len() != length {
            return Err(Error::Format(format!(
                "truncated record: missing payload ({} of {length} bytes present)",
                payload.len()
            )));
        }
        read_checked_crc(&mut self.reader, &payload, "payload crc")?;
        Ok(Some(payload))
    }
}

/// A source yielding the entries of several record containers in order
pub struct TfRecordDataset {
    /// Files to read
    paths: Arc<[PathBuf]>,

    /// Compression and buffering
    options: TfRecordOptions,

    /// Scalar string signature
    signature: Signature,
}

impl TfRecordDataset {
    /// Create a source over `paths`
    pub fn new<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>, options: TfRecordOptions) -> Self {
        Self {
            paths: to_paths(paths),
            options,
            signature: Signature::single(TensorSpec::scalar(DType::String)),
        }
    }

    /// Create a source naming the compression as `""`, `"ZLIB"` or `"GZIP"`
    pub fn with_compression_name<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
        compression: &str,
    ) -> Result<Self> {
        let compression = compression.parse()?;
        Ok(Self::new(paths, TfRecordOptions::with_compression(compression)))
    }

    /// Wrap into a pipeline handle
    pub fn into_dataset(self) -> Dataset {
        Dataset::new(self)
    }
}

impl DatasetBase for TfRecordDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> CoreResult<Box<dyn RecordIterator>> {
        let options = self.options;
        Ok(Box::new(FileRecordIterator::new(
            Arc::clone(&self.paths),
            Arc::new(move |path: &Path| -> Result<Box<dyn FileReader>> {
                Ok(Box::new(TfRecordReader::open(path, options)?))
            }),
        )))
    }

    fn debug_name(&self) -> &'static str {
        "TfRecordDataset"
    }
}

/// Writes framed entries to a record container
pub struct TfRecordWriter {
    encoder: Encoder,
}

impl TfRecordWriter {
    /// Create or truncate `path`
    pub fn create(path: impl AsRef<Path>, compression: CompressionType) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            encoder: compression.encoder(file),
        })
    }

    /// Append one entry
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        let length = (payload.len() as u64).to_le_bytes();
        self.write_all(&length)?;
        self.write_all(&mask_crc(crc32c(&length)).to_le_bytes())?;
        self.write_all(payload)?;
        self.write_all(&mask_crc(crc32c(payload)).to_le_bytes())?;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.encoder.write_all(bytes)
    }

    /// Write any compression trailer and flush
    pub fn finish(self) -> Result<()> {
        self.encoder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test]
    fn test_crc32c_known_values() {
        assert_eq!(crc32c(b""), 0);
        assert_eq!(crc32c(b"123456789"), 0xe306_9283);
        assert_eq!(crc32c(&[0u8; 32]), 0x8a91_36aa);
    }

    #[test_case(CompressionType::None ; "uncompressed")]
    #[test_case(CompressionType::Zlib ; "zlib")]
    #[test_case(CompressionType::Gzip ; "gzip")]
    fn test_write_then_read(compression: CompressionType) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.tfrecord");
        let mut writer = TfRecordWriter::create(&path, compression).unwrap();
        for i in 0..5 {
            writer.write(format!("record {i}").as_bytes()).unwrap();
        }
        writer.write(b"").unwrap();
        writer.finish().unwrap();

        let ds = TfRecordDataset::new([&path], TfRecordOptions::with_compression(compression)).into_dataset();
        let records: Vec<Vec<u8>> = ds
            .collect_records()
            .unwrap()
            .iter()
            .map(|r| r.scalar::<Vec<u8>>(0).unwrap())
            .collect();
        assert_eq!(records.len(), 6);
        assert_eq!(records[3], b"record 3".to_vec());
        assert!(records[5].is_empty());
    }

    #[test]
    fn test_corruption_is_data_loss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.tfrecord");
        let mut writer = TfRecordWriter::create(&path, CompressionType::None).unwrap();
        writer.write(b"payload").unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[14] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let ds = TfRecordDataset::new([&path], TfRecordOptions::default()).into_dataset();
        assert!(ds.collect_records().unwrap_err().is_data_loss());
    }

    #[test]
    fn test_truncated_file_is_data_loss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.tfrecord");
        let mut writer = TfRecordWriter::create(&path, CompressionType::None).unwrap();
        writer.write(b"payload").unwrap();
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        let ds = TfRecordDataset::new([&path], TfRecordOptions::default()).into_dataset();
        assert!(ds.collect_records().unwrap_err().is_data_loss());
    }

    #[test]
    fn test_oversized_length_is_data_loss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.tfrecord");
        let length = (1u64 << 42).to_le_bytes();
        let mut bytes = length.to_vec();
        bytes.extend_from_slice(&mask_crc(crc32c(&length)).to_le_bytes());
        bytes.extend_from_slice(b"xy");
        std::fs::write(&path, &bytes).unwrap();

        let ds = TfRecordDataset::new([&path], TfRecordOptions::default()).into_dataset();
        assert!(ds.collect_records().unwrap_err().is_data_loss());
    }

    #[test]
    fn test_unknown_compression_name() {
        assert!(TfRecordDataset::with_compression_name(["a"], "SNAPPY").is_err());
        assert!(TfRecordDataset::with_compression_name(["a"], "ZLIB").is_ok());
    }
}
