use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keydir::{Keydir, KeydirEntry};
use crate::record::{HintEntry, HINT_HEADER_LEN};
use crate::segment::{self, FileKind, SegmentIter};

/// The files discovered for one segment id.
#[derive(Debug, Default)]
struct SegmentFiles {
    data: Option<PathBuf>,
    hint: Option<PathBuf>,
}

/// The result of replaying a store directory: the rebuilt keydir, the
/// segment to continue as active (if any is suitable), the id to use when a
/// fresh active segment is needed, and the largest timestamp seen, used to
/// seed the monotonic write clock.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub keydir: Keydir,
    pub active: Option<ActiveCandidate>,
    pub next_id: u64,
    pub max_timestamp: u64,
}

/// The highest-id segment, eligible to continue as the active segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveCandidate {
    pub id: u64,
    pub size: u64,
}

/// Classify the directory entries into per-segment data/hint pairs. Unknown
/// files are ignored.
fn scan_dir(dir: &Path) -> Result<BTreeMap<u64, SegmentFiles>> {
    let mut segments = BTreeMap::<u64, SegmentFiles>::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match segment::parse_file_name(name) {
            Some((id, FileKind::Data)) => segments.entry(id).or_default().data = Some(path),
            Some((id, FileKind::Hint)) => segments.entry(id).or_default().hint = Some(path),
            None => debug!(file = name, "ignoring unrecognized file"),
        }
    }
    Ok(segments)
}

/// Remove scratch files left behind by a merge that never committed.
pub(crate) fn sweep_tmp_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tmp = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e == segment::TMP_FILE_EXT);
        if is_tmp {
            warn!(file = %path.display(), "removing abandoned merge scratch file");
            segment::remove_if_exists(&path)?;
        }
    }
    Ok(())
}

/// Rebuild the keydir from the segments in `dir`.
///
/// Segments replay in ascending id order, records in ascending offset, so
/// later writes overwrite earlier ones without consulting timestamps. Each
/// segment replays from its hint file when one is present and intact, and
/// from a full data-file scan otherwise.
pub(crate) fn recover(dir: &Path, config: &Config) -> Result<Recovered> {
    let segments = scan_dir(dir)?;
    let keydir = Keydir::new();
    let mut max_timestamp = 0u64;

    let highest_data_id = segments
        .iter()
        .rev()
        .find(|(_, files)| files.data.is_some())
        .map(|(id, _)| *id);

    for (id, files) in &segments {
        let Some(data) = &files.data else {
            debug!(segment = id, "hint file without data file, ignoring");
            continue;
        };
        if let Some(hint) = &files.hint {
            match replay_hint(hint, *id, &keydir, &mut max_timestamp) {
                Ok(entries) => {
                    debug!(segment = id, entries, "replayed hint file");
                    continue;
                }
                Err(e) => {
                    warn!(segment = id, error = %e, "hint file unreadable, scanning segment");
                }
            }
        }
        let is_highest = Some(*id) == highest_data_id;
        replay_segment(data, *id, is_highest, config.read_only, &keydir, &mut max_timestamp)?;
    }

    let next_id = highest_data_id.map_or(0, |id| id + 1);
    let active = match highest_data_id {
        Some(id) => {
            let files = &segments[&id];
            // A hinted segment is permanently sealed: appending to it would
            // leave records invisible to the hint-first replay.
            if files.hint.is_some() {
                None
            } else {
                let size = fs::metadata(files.data.as_ref().expect("data file present"))?.len();
                if size < config.segment_threshold_bytes {
                    Some(ActiveCandidate { id, size })
                } else {
                    None
                }
            }
        }
        None => None,
    };

    Ok(Recovered { keydir, active, next_id, max_timestamp })
}

/// Replay one hint file into the keydir, returning the entry count. The file
/// is parsed completely before the keydir is touched, so a malformed hint
/// leaves no partial state behind and the caller can fall back to scanning
/// the data file.
fn replay_hint(path: &Path, id: u64, keydir: &Keydir, max_timestamp: &mut u64) -> Result<usize> {
    let entries = load_hint(path)?;
    let count = entries.len();
    for hint in entries {
        *max_timestamp = (*max_timestamp).max(hint.timestamp);
        keydir.insert(
            hint.key,
            KeydirEntry {
                segment_id: id,
                value_offset: hint.value_offset,
                value_size: hint.value_size,
                timestamp: hint.timestamp,
            },
        );
    }
    Ok(count)
}

fn load_hint(path: &Path) -> Result<Vec<HintEntry>> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset = 0u64;
    while offset < len {
        if len - offset < HINT_HEADER_LEN {
            return Err(Error::Corruption("truncated hint entry".to_owned()));
        }
        let entry = HintEntry::read_from(&mut reader)?;
        offset += entry.encoded_len();
        if offset > len {
            return Err(Error::Corruption("truncated hint entry".to_owned()));
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Replay one data file into the keydir. A record that fails to decode stops
/// the scan: on the highest-id segment it is an incomplete final write and
/// the tail is truncated away (the segment then continues as the active
/// one); on any earlier segment the store is refused, since every sealed
/// segment below the highest id must be complete.
fn replay_segment(
    path: &Path,
    id: u64,
    is_highest: bool,
    read_only: bool,
    keydir: &Keydir,
    max_timestamp: &mut u64,
) -> Result<()> {
    let mut iter = SegmentIter::open(path)?;
    loop {
        match iter.next() {
            Ok(Some(at)) => {
                *max_timestamp = (*max_timestamp).max(at.record.timestamp);
                match at.record.value {
                    Some(value) => {
                        keydir.insert(
                            at.record.key,
                            KeydirEntry {
                                segment_id: id,
                                value_offset: at.value_offset,
                                value_size: value.len() as u32,
                                timestamp: at.record.timestamp,
                            },
                        );
                    }
                    None => {
                        keydir.remove(&at.record.key);
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(e) if is_highest => {
                warn!(
                    segment = id,
                    offset = iter.offset(),
                    error = %e,
                    "incomplete write at segment tail, truncating"
                );
                if !read_only {
                    segment::truncate(path, iter.offset())?;
                }
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Corruption(format!(
                    "sealed segment {:016x} corrupt at offset {}: {}",
                    id,
                    iter.offset(),
                    e
                )));
            }
        }
    }
}

/// Open the lock file for a writable store, creating it if needed.
pub(crate) fn create_lock_file(dir: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dir.join(segment::LOCK_FILE_NAME))?;
    Ok(file)
}

/// Open the lock file for a read-only store, if one exists.
pub(crate) fn open_lock_file(dir: &Path) -> Result<Option<File>> {
    match File::open(dir.join(segment::LOCK_FILE_NAME)) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
