//! Fixed-length record source
//!
//! Each file is a header of `header_bytes`, a sequence of records of
//! exactly `record_bytes` each, and a footer of `footer_bytes`. Files are
//! memory-mapped and records are copied out one at a time.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use tracing::trace;

use ml_input_core::error::{Error as CoreError, Result as CoreResult};
use ml_input_core::{DType, Dataset, DatasetBase, RecordIterator, Signature, TensorSpec};

use crate::common::{to_paths, FileReader, FileRecordIterator};
use crate::error::{Error, Result};

/// Record layout of a fixed-length file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    record_bytes: usize,
    header_bytes: usize,
    footer_bytes: usize,
}

/// Memory-mapped cursor over the records of one file
struct FixedLengthReader {
    /// Mapped file, `None` for empty files which cannot be mapped
    mmap: Option<Mmap>,

    /// Offset of the next record
    position: usize,

    /// Offset where the footer starts
    limit: usize,

    record_bytes: usize,
}

impl FixedLengthReader {
    fn open(path: &Path, layout: Layout) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::Format(format!("{} is too large to map", path.display())))?;
        let framing = layout.header_bytes + layout.footer_bytes;
        if file_size < framing || (file_size - framing) % layout.record_bytes != 0 {
            return Err(Error::Format(format!(
                "{} has size {} which is not {} header bytes plus a multiple of {} record bytes plus {} footer bytes",
                path.display(),
                file_size,
                layout.header_bytes,
                layout.record_bytes,
                layout.footer_bytes
            )));
        }
        let mmap = if file_size == 0 {
            None
        } else {
            #[allow(unsafe_code)]
            // the mapping is read-only and dropped with the reader
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            Some(mmap)
        };
        trace!(path = %path.display(), records = (file_size - framing) / layout.record_bytes, "mapped fixed-length file");
        Ok(Self {
            mmap,
            position: layout.header_bytes,
            limit: file_size - layout.footer_bytes,
            record_bytes: layout.record_bytes,
        })
    }
}

impl FileReader for FixedLengthReader {
    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(mmap) = self.mmap.as_ref() else {
            return Ok(None);
        };
        let end = self.position + self.record_bytes;
        if end > self.limit {
            return Ok(None);
        }
        let record = mmap[self.position..end].to_vec();
        self.position = end;
        Ok(Some(record))
    }
}

/// A source yielding fixed-size byte records from several files in order
pub struct FixedLengthRecordDataset {
    /// Files to read
    paths: Arc<[PathBuf]>,

    /// Size of each record in bytes
    record_bytes: i64,

    /// Bytes to skip at the start of each file
    header_bytes: i64,

    /// Bytes to ignore at the end of each file
    footer_bytes: i64,

    /// Scalar string signature
    signature: Signature,
}

impl FixedLengthRecordDataset {
    /// Create a source over `paths` with the given layout
    ///
    /// Sizes are validated when an iterator is created.
    pub fn new<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
        record_bytes: i64,
        header_bytes: i64,
        footer_bytes: i64,
    ) -> Self {
        Self {
            paths: to_paths(paths),
            record_bytes,
            header_bytes,
            footer_bytes,
            signature: Signature::single(TensorSpec::scalar(DType::String)),
        }
    }

    /// Wrap into a pipeline handle
    pub fn into_dataset(self) -> Dataset {
        Dataset::new(self)
    }

    fn layout(&self) -> CoreResult<Layout> {
        let record_bytes = usize::try_from(self.record_bytes)
            .ok()
            .filter(|&b| b > 0)
            .ok_or_else(|| {
                CoreError::invalid_argument(format!(
                    "record_bytes must be greater than zero, got {}",
                    self.record_bytes
                ))
            })?;
        let non_negative = |name: &str, value: i64| {
            usize::try_from(value)
                .map_err(|_| CoreError::invalid_argument(format!("{name} must be non-negative, got {value}")))
        };
        Ok(Layout {
            record_bytes,
            header_bytes: non_negative("header_bytes", self.header_bytes)?,
            footer_bytes: non_negative("footer_bytes", self.footer_bytes)?,
        })
    }
}

impl DatasetBase for FixedLengthRecordDataset {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn make_iterator(&self) -> CoreResult<Box<dyn RecordIterator>> {
        let layout = self.layout()?;
        Ok(Box::new(FileRecordIterator::new(
            Arc::clone(&self.paths),
            Arc::new(move |path: &Path| -> Result<Box<dyn FileReader>> {
                Ok(Box::new(FixedLengthReader::open(path, layout)?))
            }),
        )))
    }

    fn debug_name(&self) -> &'static str {
        "FixedLengthRecordDataset"
    }
}
