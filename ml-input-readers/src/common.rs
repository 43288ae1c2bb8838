//! Shared plumbing for sources that read a list of files in order

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use ml_input_core::error::Result as CoreResult;
use ml_input_core::{Record, RecordIterator, Tensor};

use crate::error::Result;

/// Reads the byte-string records of one open file
pub trait FileReader: Send {
    /// Read the next record, `Ok(None)` at end of file
    fn read_record(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Opens a [`FileReader`] for one path
pub type OpenFn = Arc<dyn Fn(&Path) -> Result<Box<dyn FileReader>> + Send + Sync>;

/// Concatenates the records of several files, opening each lazily
///
/// Each record is a single byte-string scalar. A file is closed as soon as
/// its last record has been read.
pub struct FileRecordIterator {
    /// Files to read, in order
    paths: Arc<[PathBuf]>,

    /// Index of the next file to open
    next_file: usize,

    /// Reader over the currently open file
    current: Option<Box<dyn FileReader>>,

    /// Format-specific opener
    open: OpenFn,
}

impl FileRecordIterator {
    /// Create an iterator over `paths` using `open` for each file
    pub fn new(paths: Arc<[PathBuf]>, open: OpenFn) -> Self {
        Self {
            paths,
            next_file: 0,
            current: None,
            open,
        }
    }

    fn advance(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(bytes) = reader.read_record()? {
                    return Ok(Some(bytes));
                }
                debug!(path = %self.paths[self.next_file - 1].display(), "closed file");
                self.current = None;
            }
            let Some(path) = self.paths.get(self.next_file) else {
                return Ok(None);
            };
            debug!(path = %path.display(), "opened file");
            self.current = Some((self.open)(path)?);
            self.next_file += 1;
        }
    }
}

impl RecordIterator for FileRecordIterator {
    fn get_next(&mut self) -> CoreResult<Option<Record>> {
        Ok(self
            .advance()?
            .map(|bytes| Record::single(Tensor::string(bytes))))
    }
}

/// Collect paths into the shared form used by file sources
pub fn to_paths<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> Arc<[PathBuf]> {
    paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect()
}
