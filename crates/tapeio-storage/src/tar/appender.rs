//! Streaming tar writer with a size cap.

use super::{
    BLOCK_SIZE, DigestingWriter, FOOTER_SIZE, TAR_DIGEST_TYPE, build_header, entry_footprint,
    padded_size,
};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tapeio_common::{DigestCalculator, DigestWithSize, Error, Result, TarEntryDescription};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Appends entries to a new tar file, never letting it grow (footer
/// included) past `max_tar_size`.
///
/// An append failing after its header was written leaves a partial entry
/// behind. The appender then refuses any further write; the file is left
/// for the repairer, which cuts it back to [`failed_at`](Self::failed_at).
pub struct TarAppender {
    path: PathBuf,
    tar_id: String,
    max_tar_size: u64,
    writer: DigestingWriter,
    entry_count: usize,
    failed_at: Option<u64>,
}

impl TarAppender {
    /// Create the tar file. Fails if it already exists.
    pub fn create(path: impl Into<PathBuf>, tar_id: &str, max_tar_size: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create_new(&path)?;
        Ok(Self {
            path,
            tar_id: tar_id.to_string(),
            max_tar_size,
            writer: DigestingWriter::new(file),
            entry_count: 0,
            failed_at: None,
        })
    }

    /// Whether an entry of `size` bytes still fits before the footer
    #[must_use]
    pub const fn can_append(&self, size: u64) -> bool {
        self.writer.position() + entry_footprint(size) + FOOTER_SIZE <= self.max_tar_size
    }

    /// Append `size` bytes from `input` as one entry
    pub fn append(
        &mut self,
        entry_name: &str,
        input: &mut impl Read,
        size: u64,
    ) -> Result<TarEntryDescription> {
        self.check_usable()?;
        if !self.can_append(size) {
            return Err(Error::internal(format!(
                "entry {entry_name} of {size} bytes does not fit in tar {}",
                self.tar_id
            )));
        }
        let mtime = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let header = build_header(entry_name, size, mtime)?;

        let start_pos = self.writer.position();
        match self.write_entry(entry_name, &header, input, size) {
            Ok(digest_value) => {
                self.entry_count += 1;
                Ok(TarEntryDescription {
                    tar_file_id: self.tar_id.clone(),
                    entry_name: entry_name.to_string(),
                    start_pos,
                    size,
                    digest_value,
                })
            }
            Err(e) => {
                self.failed_at = Some(start_pos);
                Err(e)
            }
        }
    }

    /// Write header, content and padding; returns the content digest
    fn write_entry(
        &mut self,
        entry_name: &str,
        header: &::tar::Header,
        input: &mut impl Read,
        size: u64,
    ) -> Result<String> {
        self.writer.write_all(header.as_bytes())?;

        let mut entry_digest = DigestCalculator::new(TAR_DIGEST_TYPE);
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = usize::try_from(remaining.min(COPY_BUFFER_SIZE as u64))
                .map_err(|_| Error::internal("copy chunk overflow"))?;
            let n = input.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Error::FileLengthMismatch {
                    path: entry_name.to_string(),
                    expected: size,
                    actual: size - remaining,
                });
            }
            self.writer.write_all(&buf[..n])?;
            entry_digest.update(&buf[..n]);
            remaining -= n as u64;
        }
        self.writer.write_zeros(padded_size(size) - size)?;
        Ok(entry_digest.finalize_hex())
    }

    fn check_usable(&self) -> Result<()> {
        match self.failed_at {
            None => Ok(()),
            Some(offset) => Err(Error::storage(format!(
                "tar {} holds a partial entry at offset {offset}",
                self.tar_id
            ))),
        }
    }

    /// Make everything appended so far durable
    pub fn flush(&mut self) -> Result<()> {
        self.check_usable()?;
        self.writer.sync()?;
        Ok(())
    }

    /// Write the footer, fsync and return the final size and digest
    pub fn close(mut self) -> Result<DigestWithSize> {
        self.check_usable()?;
        self.writer.write_zeros(FOOTER_SIZE)?;
        let (size, digest) = self.writer.finish()?;
        debug_assert_eq!(size % BLOCK_SIZE, 0);
        Ok(DigestWithSize { size, digest })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn tar_id(&self) -> &str {
        &self.tar_id
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.writer.position()
    }

    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Start of the partial entry left by a failed append
    #[must_use]
    pub const fn failed_at(&self) -> Option<u64> {
        self.failed_at
    }
}
