//! POSIX tar archives holding packed objects.
//!
//! An archive is a sequence of 512-byte ustar headers, each followed by the
//! entry content padded to the next 512-byte boundary, and ends with two
//! zero-filled records. Entries are named `{container}/{storageId}-{segment}`.

pub mod appender;
pub mod digest_verifier;
pub mod repairer;

pub use appender::TarAppender;
pub use digest_verifier::{TarEntryDigestCheck, TarFileDigestVerifier};
pub use repairer::TarFileRepairer;

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tapeio_common::{DigestCalculator, DigestType, Error, Result, TarEntryDescription};

/// Size of a tar record
pub const BLOCK_SIZE: u64 = 512;

/// Two zero records closing an archive
pub const FOOTER_SIZE: u64 = 2 * BLOCK_SIZE;

/// Digest algorithm of tar entries and whole tar files
pub const TAR_DIGEST_TYPE: DigestType = DigestType::Sha512;

/// Content size rounded up to a whole number of records
#[must_use]
pub const fn padded_size(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Bytes an entry occupies in an archive, header included
#[must_use]
pub const fn entry_footprint(size: u64) -> u64 {
    BLOCK_SIZE + padded_size(size)
}

#[must_use]
pub fn entry_name(container_name: &str, storage_id: &str, segment: usize) -> String {
    format!("{container_name}/{storage_id}-{segment}")
}

/// Split an entry name into container, storage id and segment index
pub fn parse_entry_name(name: &str) -> Result<(&str, &str, usize)> {
    let malformed = || Error::IllegalName(format!("malformed tar entry name: {name}"));
    let (container, rest) = name.split_once('/').ok_or_else(malformed)?;
    let (storage_id, segment) = rest.rsplit_once('-').ok_or_else(malformed)?;
    let segment = segment.parse::<usize>().map_err(|_| malformed())?;
    Ok((container, storage_id, segment))
}

pub(crate) fn build_header(name: &str, size: u64, mtime: u64) -> Result<::tar::Header> {
    let mut header = ::tar::Header::new_ustar();
    header
        .set_path(name)
        .map_err(|e| Error::IllegalName(format!("{name}: {e}")))?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_entry_type(::tar::EntryType::Regular);
    header.set_cksum();
    Ok(header)
}

/// What a 512-byte record turned out to be
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Record {
    Header { name: String, size: u64 },
    Zero,
    Invalid(String),
}

pub(crate) fn parse_record(block: &[u8; BLOCK_SIZE as usize]) -> Record {
    // Footer records are plain zeros, not headers
    if block.iter().all(|b| *b == 0) {
        return Record::Zero;
    }
    let header = ::tar::Header::from_byte_slice(block);
    if header.as_ustar().is_none() {
        return Record::Invalid("not a ustar header".to_string());
    }
    let stored = match header.cksum() {
        Ok(stored) => stored,
        Err(e) => return Record::Invalid(format!("unreadable checksum: {e}")),
    };
    let mut recomputed = header.clone();
    recomputed.set_cksum();
    let computed = match recomputed.cksum() {
        Ok(computed) => computed,
        Err(e) => return Record::Invalid(format!("unreadable checksum: {e}")),
    };
    if stored != computed {
        return Record::Invalid(format!(
            "header checksum mismatch: stored {stored}, computed {computed}"
        ));
    }
    if header.entry_type() != ::tar::EntryType::Regular {
        return Record::Invalid(format!("unexpected entry type {:?}", header.entry_type()));
    }
    let size = match header.entry_size() {
        Ok(size) => size,
        Err(e) => return Record::Invalid(format!("unreadable size: {e}")),
    };
    match header.path() {
        Ok(path) => Record::Header {
            name: path.to_string_lossy().into_owned(),
            size,
        },
        Err(e) => Record::Invalid(format!("unreadable path: {e}")),
    }
}

/// Read until `buf` is full or the input ends; returns the bytes read
pub(crate) fn read_fully(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Buffered file writer hashing everything written through it
pub(crate) struct DigestingWriter {
    writer: BufWriter<File>,
    digest: DigestCalculator,
}

impl DigestingWriter {
    pub(crate) fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            digest: DigestCalculator::new(TAR_DIGEST_TYPE),
        }
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.digest.update(data);
        Ok(())
    }

    pub(crate) fn write_zeros(&mut self, mut count: u64) -> io::Result<()> {
        const ZEROS: [u8; BLOCK_SIZE as usize] = [0; BLOCK_SIZE as usize];
        while count > 0 {
            let chunk = count.min(BLOCK_SIZE);
            // chunk <= 512
            #[allow(clippy::cast_possible_truncation)]
            self.write_all(&ZEROS[..chunk as usize])?;
            count -= chunk;
        }
        Ok(())
    }

    pub(crate) const fn position(&self) -> u64 {
        self.digest.length()
    }

    /// Flush buffers and fsync the file data
    pub(crate) fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub(crate) fn finish(mut self) -> io::Result<(u64, String)> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        let size = self.digest.length();
        Ok((size, self.digest.finalize_hex()))
    }
}

/// Open the content of an entry for reading, after checking the header at
/// its recorded position still describes it
pub fn read_entry(tar_path: &Path, entry: &TarEntryDescription) -> Result<io::Take<File>> {
    let mut file = File::open(tar_path)?;
    file.seek(SeekFrom::Start(entry.start_pos))?;
    let mut block = [0u8; BLOCK_SIZE as usize];
    if read_fully(&mut file, &mut block)? != block.len() {
        return Err(Error::TruncatedTar(tar_path.display().to_string()));
    }
    match parse_record(&block) {
        Record::Header { name, size } if name == entry.entry_name && size == entry.size => {
            Ok(file.take(entry.size))
        }
        other => Err(Error::referential(format!(
            "entry {} not found at offset {} of {}: {:?}",
            entry.entry_name,
            entry.start_pos,
            tar_path.display(),
            other
        ))),
    }
}
