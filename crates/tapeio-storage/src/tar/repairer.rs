//! Verification and repair of tars left behind by a crash.

use super::{
    BLOCK_SIZE, FOOTER_SIZE, Record, TAR_DIGEST_TYPE, TarEntryDigestCheck, TarFileDigestVerifier,
    padded_size, parse_record, read_fully,
};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tapeio_common::{DigestCalculator, DigestReader, DigestWithSize, Error, Result};
use tapeio_meta_store::ObjectReferentialRepository;
use tracing::{info, warn};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

type DigestCheckFactory = dyn Fn(&str) -> Box<dyn TarEntryDigestCheck> + Send + Sync;

/// Re-reads tars left in a transient state and cross-checks their entries
/// against the object referential
#[derive(Clone)]
pub struct TarFileRepairer {
    digest_check_factory: Arc<DigestCheckFactory>,
}

/// Outcome of reading one entry body
enum EntryRead {
    Complete(String),
    Truncated(u64),
}

impl TarFileRepairer {
    /// Build a repairer from a factory creating one digest check per tar id
    pub fn new(
        factory: impl Fn(&str) -> Box<dyn TarEntryDigestCheck> + Send + Sync + 'static,
    ) -> Self {
        Self {
            digest_check_factory: Arc::new(factory),
        }
    }

    /// Repairer checking entries with a [`TarFileDigestVerifier`]
    pub fn with_object_repository(
        object_repository: Arc<ObjectReferentialRepository>,
        bulk_size: usize,
    ) -> Self {
        Self::new(move |tar_id| {
            Box::new(TarFileDigestVerifier::new(
                Arc::clone(&object_repository),
                tar_id,
                bulk_size,
            ))
        })
    }

    /// Read a complete tar end to end, checking every entry digest.
    ///
    /// Fails on any truncation: a sealed tar must hold its full footer.
    pub fn verify_tar_archive(&self, tar_path: &Path, tar_id: &str) -> Result<DigestWithSize> {
        let mut checks = (self.digest_check_factory)(tar_id);
        let file = File::open(tar_path)?;
        let mut reader = DigestReader::new(BufReader::new(file), TAR_DIGEST_TYPE);
        let truncated = || Error::TruncatedTar(tar_path.display().to_string());

        let mut block = [0u8; BLOCK_SIZE as usize];
        loop {
            if read_fully(&mut reader, &mut block)? != block.len() {
                return Err(truncated());
            }
            match parse_record(&block) {
                Record::Zero => {
                    if read_fully(&mut reader, &mut block)? != block.len()
                        || parse_record(&block) != Record::Zero
                    {
                        return Err(truncated());
                    }
                    break;
                }
                Record::Invalid(reason) => {
                    return Err(Error::storage(format!(
                        "corrupted tar {}: {reason}",
                        tar_path.display()
                    )));
                }
                Record::Header { name, size } => {
                    match read_entry_body(&mut reader, size, None)? {
                        EntryRead::Complete(digest) => {
                            checks.add_digest_to_check(&name, &digest)?;
                        }
                        EntryRead::Truncated(_) => return Err(truncated()),
                    }
                }
            }
        }
        // Trailing zero padding after the footer belongs to the file digest
        io::copy(&mut reader, &mut io::sink())?;
        checks.finalize_checks()?;

        let size = reader.length();
        Ok(DigestWithSize {
            size,
            digest: reader.finalize_hex(),
        })
    }

    /// Copy the complete entries of a possibly truncated tar into a fresh
    /// file, closed with a footer, then check their digests.
    ///
    /// An entry is kept only if its header, content and padding are all
    /// present; the first incomplete or unreadable record ends the copy.
    pub fn repair_and_verify_tar_archive(
        &self,
        input: &mut impl Read,
        output_path: &Path,
        tar_id: &str,
    ) -> Result<DigestWithSize> {
        let mut checks = (self.digest_check_factory)(tar_id);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(output_path)?;
        let mut writer = BufWriter::new(file);
        let mut committed: u64 = 0;
        let mut entries = 0usize;

        let mut block = [0u8; BLOCK_SIZE as usize];
        loop {
            let read = read_fully(input, &mut block)?;
            if read != block.len() {
                if read > 0 {
                    info!("Dropping truncated header at offset {} of {}", committed, tar_id);
                }
                break;
            }
            let (name, size) = match parse_record(&block) {
                Record::Zero => break,
                Record::Invalid(reason) => {
                    warn!(
                        "Dropping unreadable record at offset {} of {}: {}",
                        committed, tar_id, reason
                    );
                    break;
                }
                Record::Header { name, size } => (name, size),
            };
            writer.write_all(&block)?;
            match read_entry_body(input, size, Some(&mut writer))? {
                EntryRead::Complete(digest) => {
                    committed += BLOCK_SIZE + padded_size(size);
                    entries += 1;
                    checks.add_digest_to_check(&name, &digest)?;
                }
                EntryRead::Truncated(copied) => {
                    info!(
                        "Dropping truncated entry {} of {} ({} of {} bytes present)",
                        name,
                        tar_id,
                        copied,
                        padded_size(size)
                    );
                    writer.flush()?;
                    let file = writer.get_mut();
                    file.set_len(committed)?;
                    file.seek(SeekFrom::Start(committed))?;
                    break;
                }
            }
        }

        let zeros = [0u8; FOOTER_SIZE as usize];
        writer.write_all(&zeros)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        checks.finalize_checks()?;

        let output = BufReader::new(File::open(output_path)?);
        let mut reader = DigestReader::new(output, TAR_DIGEST_TYPE);
        io::copy(&mut reader, &mut io::sink())?;
        let size = reader.length();
        info!("Repaired tar {} with {} entries ({} bytes)", tar_id, entries, size);
        Ok(DigestWithSize {
            size,
            digest: reader.finalize_hex(),
        })
    }
}

/// Read an entry body and its padding, optionally copying both to `output`.
/// Returns the content digest, or the bytes present when the input ends early.
fn read_entry_body(
    input: &mut impl Read,
    size: u64,
    mut output: Option<&mut BufWriter<File>>,
) -> Result<EntryRead> {
    let total = padded_size(size);
    let mut digest = DigestCalculator::new(TAR_DIGEST_TYPE);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut done: u64 = 0;
    while done < total {
        let want = usize::try_from((total - done).min(COPY_BUFFER_SIZE as u64))
            .map_err(|_| Error::internal("copy chunk overflow"))?;
        let n = read_fully(input, &mut buf[..want])?;
        if n > 0 {
            if let Some(out) = output.as_mut() {
                out.write_all(&buf[..n])?;
            }
            if done < size {
                let content = usize::try_from((size - done).min(n as u64))
                    .map_err(|_| Error::internal("copy chunk overflow"))?;
                digest.update(&buf[..content]);
            }
            done += n as u64;
        }
        if n < want {
            return Ok(EntryRead::Truncated(done));
        }
    }
    Ok(EntryRead::Complete(digest.finalize_hex()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tar::TarAppender;
    use parking_lot::Mutex;
    use std::fs;
    use std::io::Cursor;
    use tapeio_common::checksum::digest_hex;
    use tempfile::{TempDir, tempdir};

    type Recorded = Arc<Mutex<Vec<(String, String)>>>;

    /// Accepts every entry
    pub(crate) struct NoCheck;

    impl TarEntryDigestCheck for NoCheck {
        fn add_digest_to_check(&mut self, _entry_name: &str, _digest: &str) -> Result<()> {
            Ok(())
        }

        fn finalize_checks(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingCheck {
        recorded: Recorded,
        finalized: Arc<Mutex<bool>>,
    }

    impl TarEntryDigestCheck for RecordingCheck {
        fn add_digest_to_check(&mut self, entry_name: &str, digest: &str) -> Result<()> {
            self.recorded
                .lock()
                .push((entry_name.to_string(), digest.to_string()));
            Ok(())
        }

        fn finalize_checks(&mut self) -> Result<()> {
            *self.finalized.lock() = true;
            Ok(())
        }
    }

    fn recording_repairer() -> (TarFileRepairer, Recorded, Arc<Mutex<bool>>) {
        let recorded: Recorded = Arc::default();
        let finalized = Arc::new(Mutex::new(false));
        let (r, f) = (Arc::clone(&recorded), Arc::clone(&finalized));
        let repairer = TarFileRepairer::new(move |_| {
            Box::new(RecordingCheck {
                recorded: Arc::clone(&r),
                finalized: Arc::clone(&f),
            })
        });
        (repairer, recorded, finalized)
    }

    /// Write a tar with the given entries; returns its path and the byte
    /// length without footer
    fn write_tar(dir: &TempDir, entries: &[(&str, &[u8])], close: bool) -> (std::path::PathBuf, u64) {
        let path = dir.path().join("myTarFile.tar");
        let mut appender = TarAppender::create(&path, "myTarFile.tar", 1_000_000).unwrap();
        for (name, content) in entries {
            appender
                .append(name, &mut Cursor::new(content.to_vec()), content.len() as u64)
                .unwrap();
        }
        let body = appender.bytes_written();
        if close {
            appender.close().unwrap();
        } else {
            appender.flush().unwrap();
        }
        (path, body)
    }

    fn truncate(path: &Path, len: u64) {
        OpenOptions::new().write(true).open(path).unwrap().set_len(len).unwrap();
    }

    fn repair(repairer: &TarFileRepairer, dir: &TempDir, input: &Path) -> (std::path::PathBuf, DigestWithSize) {
        let output = dir.path().join("myRepairedTarFile.tar");
        let result = repairer
            .repair_and_verify_tar_archive(&mut File::open(input).unwrap(), &output, "myTarFile.tar")
            .unwrap();
        (output, result)
    }

    fn assert_tar_content(path: &Path, expected: &[(&str, &[u8])], result: &DigestWithSize) {
        let bytes = fs::read(path).unwrap();
        assert_eq!(result.size, bytes.len() as u64);
        assert_eq!(result.digest, digest_hex(TAR_DIGEST_TYPE, &bytes));
        assert!(bytes.ends_with(&[0u8; FOOTER_SIZE as usize]));

        let mut archive = ::tar::Archive::new(Cursor::new(bytes));
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            found.push((name, content));
        }
        let expected: Vec<(String, Vec<u8>)> = expected
            .iter()
            .map(|(n, c)| ((*n).to_string(), c.to_vec()))
            .collect();
        assert_eq!(found, expected);
    }

    const ENTRIES: [(&str, &[u8]); 4] = [
        ("0_object/entry1-0", b"test data"),
        ("0_object/entry2-0", b"test data 2"),
        ("0_object/entry3-0", b"another test data"),
        ("0_object/entry4-0", b"yet another test data"),
    ];

    #[test]
    fn test_repair_empty_file() {
        let dir = tempdir().unwrap();
        let (repairer, recorded, finalized) = recording_repairer();
        let (path, _) = write_tar(&dir, &[], false);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        let (output, result) = repair(&repairer, &dir, &path);
        assert_eq!(result.size, FOOTER_SIZE);
        assert_tar_content(&output, &[], &result);
        assert!(recorded.lock().is_empty());
        assert!(*finalized.lock());
    }

    #[test]
    fn test_repair_complete_tars_is_identity() {
        for count in [0, 1, 3] {
            let dir = tempdir().unwrap();
            let (repairer, recorded, _) = recording_repairer();
            let (path, _) = write_tar(&dir, &ENTRIES[..count], true);

            let (output, result) = repair(&repairer, &dir, &path);
            assert_eq!(fs::read(&output).unwrap(), fs::read(&path).unwrap());
            assert_tar_content(&output, &ENTRIES[..count], &result);
            assert_eq!(recorded.lock().len(), count);
        }
    }

    #[test]
    fn test_repair_without_footer() {
        let dir = tempdir().unwrap();
        let (repairer, _, _) = recording_repairer();
        let (path, _) = write_tar(&dir, &ENTRIES[..3], false);

        let (output, result) = repair(&repairer, &dir, &path);
        assert_tar_content(&output, &ENTRIES[..3], &result);
    }

    #[test]
    fn test_repair_truncated_first_header() {
        let dir = tempdir().unwrap();
        let (repairer, recorded, _) = recording_repairer();
        let (path, _) = write_tar(&dir, &ENTRIES[..1], true);
        truncate(&path, 100);

        let (output, result) = repair(&repairer, &dir, &path);
        assert_tar_content(&output, &[], &result);
        assert!(recorded.lock().is_empty());
    }

    #[test]
    fn test_repair_truncated_first_content() {
        let dir = tempdir().unwrap();
        let (repairer, recorded, _) = recording_repairer();
        let (path, _) = write_tar(&dir, &ENTRIES[..1], true);
        truncate(&path, BLOCK_SIZE + 5);

        let (output, result) = repair(&repairer, &dir, &path);
        assert_eq!(result.size, FOOTER_SIZE);
        assert_tar_content(&output, &[], &result);
        assert!(recorded.lock().is_empty());
    }

    #[test]
    fn test_repair_drops_entry_with_truncated_padding() {
        let dir = tempdir().unwrap();
        let (repairer, _, _) = recording_repairer();
        let (path, body) = write_tar(&dir, &ENTRIES[..1], true);
        truncate(&path, body - 10);

        let (output, result) = repair(&repairer, &dir, &path);
        assert_tar_content(&output, &[], &result);
    }

    #[test]
    fn test_repair_keeps_complete_entries_before_truncated_one() {
        let dir = tempdir().unwrap();
        let (repairer, recorded, finalized) = recording_repairer();
        let (path, _) = write_tar(&dir, &ENTRIES[..3], false);
        let three_entries = fs::metadata(&path).unwrap().len();
        let (path, _) = {
            fs::remove_file(&path).unwrap();
            write_tar(&dir, &ENTRIES, false)
        };
        // Header of the 4th entry plus a few content bytes
        truncate(&path, three_entries + BLOCK_SIZE + 3);

        let (output, result) = repair(&repairer, &dir, &path);
        assert_eq!(result.size, three_entries + FOOTER_SIZE);
        assert_tar_content(&output, &ENTRIES[..3], &result);

        let names: Vec<String> = recorded.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(
            names,
            vec!["0_object/entry1-0", "0_object/entry2-0", "0_object/entry3-0"]
        );
        for ((_, digest), (_, content)) in recorded.lock().iter().zip(ENTRIES) {
            assert_eq!(digest, &digest_hex(TAR_DIGEST_TYPE, content));
        }
        assert!(*finalized.lock());
    }

    #[test]
    fn test_verify_complete_tar() {
        let dir = tempdir().unwrap();
        let (repairer, recorded, finalized) = recording_repairer();
        let (path, _) = write_tar(&dir, &ENTRIES, true);

        let result = repairer.verify_tar_archive(&path, "myTarFile.tar").unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(result.size, bytes.len() as u64);
        assert_eq!(result.digest, digest_hex(TAR_DIGEST_TYPE, &bytes));
        assert_eq!(recorded.lock().len(), 4);
        assert!(*finalized.lock());
    }

    #[test]
    fn test_verify_rejects_truncated_tar() {
        let dir = tempdir().unwrap();
        let (repairer, _, _) = recording_repairer();
        let (path, body) = write_tar(&dir, &ENTRIES, true);
        truncate(&path, body + BLOCK_SIZE);
        assert!(matches!(
            repairer.verify_tar_archive(&path, "myTarFile.tar"),
            Err(Error::TruncatedTar(_))
        ));

        truncate(&path, body - 1);
        assert!(matches!(
            repairer.verify_tar_archive(&path, "myTarFile.tar"),
            Err(Error::TruncatedTar(_))
        ));
    }
}
