//! Line-delimited text source
//!
//! Yields one byte-string record per line. Trailing `\n` or `\r\n` is
//! stripped, and the last line of a file is yielded even without a
//! terminating newline.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ml_input_core::error::Result as CoreResult;
use ml_input_core::{DType, Dataset, DatasetBase, RecordIterator, Signature, TensorSpec};

use crate::common::{to_paths, FileReader, FileRecordIterator};
use crate::error::Result;

/// Default read buffer size in bytes
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Reads lines from one file
struct LineReader {
    reader: BufReader<File>,
    line: Vec<u8>,
}

impl LineReader {
    fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::with_capacity(buffer_size, file),
            line: Vec::new(),
        })
    }
}

impl FileReader for LineReader {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        self.line.clear();
        if self.reader.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        if self.line.last() == Some(&b'\n') {
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
        }
        Ok(Some(std::mem::take(&mut self.line)))
    }
}

/// A source yielding the lines of several text files in order
pub struct TextLineDataset {
    /// Files to read
    paths: Arc<[PathBuf]>,

    /// Read buffer size in bytes
    buffer_size: usize,

    /// Scalar string signature
    signature: Signature,
}

impl TextLineDataset {
    /// Create a source over `paths`
    pub fn new<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self {
            paths: to_paths(paths),
            buffer_size: DEFAULT_BUFFER_SIZE,
            signature: Signature::single(TensorSpec::scalar(DType::String)),
        }
    }

    /// Set the read buffer size
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Wrap into a pipeline handle
    pub fn into_dataset(self) -> Dataset {
        Dataset::new(self)
    }
}

impl DatasetBase for TextLineDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> CoreResult<Box<dyn RecordIterator>> {
        let buffer_size = self.buffer_size;
        Ok(Box::new(FileRecordIterator::new(
            Arc::clone(&self.paths),
            Arc::new(move |path: &Path| -> Result<Box<dyn FileReader>> {
                Ok(Box::new(LineReader::open(path, buffer_size)?))
            }),
        )))
    }

    fn debug_name(&self) -> &'static str {
        "TextLineDataset"
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use tempfile::NamedTempFile;

    fn lines(ds: &Dataset) -> Vec<String> {
        ds.collect_records()
            .unwrap()
            .iter()
            .map(|r| String::from_utf8(r.scalar::<Vec<u8>>(0).unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_line_endings() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"one\r\ntwo\n\nthree").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"four\n").unwrap();

        let ds = TextLineDataset::new([a.path(), b.path()]).into_dataset();
        assert_eq!(lines(&ds), vec!["one", "two", "", "three", "four"]);
    }

    #[test]
    fn test_small_buffer() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"a fairly long line of text\nshort\n").unwrap();
        let ds = TextLineDataset::new([f.path()]).with_buffer_size(3).into_dataset();
        assert_eq!(lines(&ds), vec!["a fairly long line of text", "short"]);
    }

    #[test]
    fn test_missing_file_fails_on_pull() {
        let ds = TextLineDataset::new(["/definitely/not/here.txt"]).into_dataset();
        let mut iter = ds.make_iterator().unwrap();
        assert!(matches!(iter.get_next(), Err(ml_input_core::Error::Io(_))));
    }
}
