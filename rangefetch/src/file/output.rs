//! Output backend abstraction and the default file-backed implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::DownloadError;

/// One writable handle onto the target file, owned by a single block.
pub trait OutputStream: Send {
    /// Writes `bytes` at the handle's current position.
    fn write(&mut self, bytes: &[u8]) -> Result<(), DownloadError>;

    /// Flushes buffered bytes and syncs them to stable storage.
    fn flush_and_sync(&mut self) -> Result<(), DownloadError>;

    /// Positions the handle at an absolute file offset. Errors when the
    /// backend reported `supports_seek() == false`.
    fn seek(&mut self, offset: u64) -> Result<(), DownloadError>;

    /// Extends the file to `length` bytes. Errors when the backend
    /// reported `supports_pre_allocate() == false`.
    fn set_length(&mut self, length: u64) -> Result<(), DownloadError>;
}

/// Creates per-block [`OutputStream`] handles and declares the backend's
/// capabilities. Capabilities gate both resume eligibility and whether a
/// resource may be split into concurrent blocks.
pub trait OutputStreamFactory: Send + Sync {
    fn create(&self, path: &Path, flush_buffer_size: usize)
        -> Result<Box<dyn OutputStream>, DownloadError>;

    fn supports_seek(&self) -> bool;

    fn supports_pre_allocate(&self) -> bool;
}

/// Default backend: buffered writes onto a shared regular file, one
/// handle per block, `sync_all` for durability.
pub struct FileOutputStream {
    writer: BufWriter<File>,
}

impl FileOutputStream {
    fn open(path: &Path, flush_buffer_size: usize) -> Result<Self, DownloadError> {
        let file = OpenOptions::new().write(true).create(true).open(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(flush_buffer_size, file),
        })
    }
}

impl OutputStream for FileOutputStream {
    fn write(&mut self, bytes: &[u8]) -> Result<(), DownloadError> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), DownloadError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), DownloadError> {
        self.writer.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn set_length(&mut self, length: u64) -> Result<(), DownloadError> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(length)?;
        Ok(())
    }
}

/// Factory for [`FileOutputStream`] handles.
#[derive(Default)]
pub struct FileOutputStreamFactory;

impl OutputStreamFactory for FileOutputStreamFactory {
    fn create(
        &self,
        path: &Path,
        flush_buffer_size: usize,
    ) -> Result<Box<dyn OutputStream>, DownloadError> {
        Ok(Box::new(FileOutputStream::open(path, flush_buffer_size)?))
    }

    fn supports_seek(&self) -> bool {
        true
    }

    fn supports_pre_allocate(&self) -> bool {
        true
    }
}
