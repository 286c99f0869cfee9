use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::record::{self, Record};

pub(crate) const DATA_FILE_EXT: &str = "data";

pub(crate) const HINT_FILE_EXT: &str = "hint";

pub(crate) const TMP_FILE_EXT: &str = "tmp";

pub(crate) const LOCK_FILE_NAME: &str = ".lock";

pub(crate) fn data_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:016x}.{}", id, DATA_FILE_EXT))
}

pub(crate) fn hint_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:016x}.{}", id, HINT_FILE_EXT))
}

/// Scratch name a merge output is written under before the commit rename.
pub(crate) fn tmp_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".");
    name.push(TMP_FILE_EXT);
    PathBuf::from(name)
}

/// The file kinds the engine recognizes inside a store directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileKind {
    Data,
    Hint,
}

/// Parse a directory-entry name into a segment id and file kind. Anything
/// that is not `{16 hex digits}.data` or `{16 hex digits}.hint` is ignored.
pub(crate) fn parse_file_name(name: &str) -> Option<(u64, FileKind)> {
    let (stem, ext) = name.split_once('.')?;
    let kind = match ext {
        DATA_FILE_EXT => FileKind::Data,
        HINT_FILE_EXT => FileKind::Hint,
        _ => return None,
    };
    if stem.len() != 16 {
        return None;
    }
    let id = u64::from_str_radix(stem, 16).ok()?;
    Some((id, kind))
}

/// The unique segment currently open for appending. Sealed segments are
/// plain files on disk; only the active segment holds a write handle.
#[derive(Debug)]
pub(crate) struct ActiveSegment {
    id: u64,
    file: File,
    size: u64,
}

impl ActiveSegment {
    /// Create a fresh zero-length segment at `path`. Fails if the file
    /// already exists, since segment ids are never reused.
    pub fn create(path: &Path, id: u64) -> Result<Self> {
        let file = OpenOptions::new().create_new(true).append(true).open(path)?;
        Ok(ActiveSegment { id, file, size: 0 })
    }

    /// Reopen an existing segment of known size for further appends.
    pub fn reopen(path: &Path, id: u64, size: u64) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(ActiveSegment { id, file, size })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append an encoded record, returning the offset it was written at.
    /// The tracked size moves only after the whole write succeeds; a partial
    /// write is truncated away so later appends stay at known offsets.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        if let Err(e) = self.file.write_all(bytes) {
            let _ = self.file.set_len(self.size);
            return Err(e.into());
        }
        let offset = self.size;
        self.size += bytes.len() as u64;
        Ok(offset)
    }

    /// Flush and ask the OS to persist the segment to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// A lazy forward scan over the records of one segment file. Terminates at
/// end-of-file; a decode failure is surfaced to the caller, which decides
/// between tail truncation and refusing the store.
#[derive(Debug)]
pub(crate) struct SegmentIter {
    reader: BufReader<File>,
    len: u64,
    offset: u64,
}

/// One record yielded by a segment scan, with its file coordinates.
#[derive(Debug)]
pub(crate) struct RecordAt {
    pub offset: u64,
    pub value_offset: u64,
    pub record: Record,
}

impl SegmentIter {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(SegmentIter { reader: BufReader::new(file), len, offset: 0 })
    }

    /// Offset of the first byte not consumed by a successfully decoded
    /// record, i.e. the last known-good record boundary.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn next(&mut self) -> Result<Option<RecordAt>> {
        if self.offset >= self.len {
            return Ok(None);
        }
        let (record, len) = record::read_from(&mut self.reader, self.len - self.offset)?;
        let at = RecordAt {
            offset: self.offset,
            value_offset: self.offset + record::HEADER_LEN + record.key.len() as u64,
            record,
        };
        self.offset += len;
        Ok(Some(at))
    }
}

/// Truncate a segment to `len` bytes, discarding a corrupt tail.
pub(crate) fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// Remove a file, treating an already-missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use tempfile::TempDir;

    #[test]
    fn file_name_parsing() {
        assert_eq!(parse_file_name("000000000000002a.data"), Some((42, FileKind::Data)));
        assert_eq!(parse_file_name("000000000000002a.hint"), Some((42, FileKind::Hint)));
        assert_eq!(parse_file_name(".lock"), None);
        assert_eq!(parse_file_name("000000000000002a.data.tmp"), None);
        assert_eq!(parse_file_name("2a.data"), None);
        assert_eq!(parse_file_name("000000000000002g.data"), None);
        assert_eq!(parse_file_name("notes.txt"), None);
    }

    #[test]
    fn append_then_scan() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let path = data_path(temp_dir.path(), 0);
        let mut segment = ActiveSegment::create(&path, 0)?;

        let first = record::encode(b"a", Some(b"1"), 1)?;
        let second = record::encode(b"bb", Some(b"22"), 2)?;
        assert_eq!(segment.append(&first)?, 0);
        assert_eq!(segment.append(&second)?, first.len() as u64);
        assert_eq!(segment.size(), (first.len() + second.len()) as u64);

        let mut iter = SegmentIter::open(&path)?;
        let a = iter.next()?.expect("first record");
        assert_eq!(a.record.key, b"a");
        assert_eq!(a.value_offset, record::HEADER_LEN + 1);
        let b = iter.next()?.expect("second record");
        assert_eq!(b.record.key, b"bb");
        assert_eq!(b.offset, first.len() as u64);
        assert!(iter.next()?.is_none());
        Ok(())
    }

    #[test]
    fn scan_stops_at_truncated_tail() -> Result<()> {
        let temp_dir = TempDir::new().expect("unable to create temporary working directory");
        let path = data_path(temp_dir.path(), 0);
        let mut segment = ActiveSegment::create(&path, 0)?;

        let first = record::encode(b"a", Some(b"1"), 1)?;
        let second = record::encode(b"bb", Some(b"22"), 2)?;
        segment.append(&first)?;
        segment.append(&second)?;
        truncate(&path, (first.len() + second.len() - 3) as u64)?;

        let mut iter = SegmentIter::open(&path)?;
        assert!(iter.next().is_ok());
        assert!(iter.next().is_err());
        assert_eq!(iter.offset(), first.len() as u64);
        Ok(())
    }
}
