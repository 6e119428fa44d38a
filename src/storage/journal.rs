//! Append-only JSON-lines journal.
//!
//! Each record is one line. On open the journal is replayed; a torn final
//! line left by a crash mid-write is truncated away, while a corrupt line
//! anywhere else is a hard error. [`read`] replays without repairing, for
//! tools that inspect a directory they do not own.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// A durable (or in-memory, when opened without a path) record log.
#[derive(Debug)]
pub struct Journal<T> {
    path: Option<PathBuf>,
    file: Option<File>,
    fsync: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// A journal that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self { path: None, file: None, fsync: false, _marker: PhantomData }
    }

    /// Open (creating if needed) and replay the journal at `path`.
    pub fn open(path: Option<&Path>, fsync: bool) -> Result<(Self, Vec<T>)> {
        let Some(path) = path else {
            return Ok((Self::in_memory(), Vec::new()));
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = if path.exists() { replay(path, true)? } else { Vec::new() };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok((
            Self { path: Some(path.to_path_buf()), file: Some(file), fsync, _marker: PhantomData },
            records,
        ))
    }

    pub fn append(&mut self, record: &T) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Atomically replace the journal contents with `records`.
    pub fn rewrite(&mut self, records: &[T]) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let tmp = path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            for record in records {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');
                out.write_all(&line)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.file = Some(OpenOptions::new().append(true).open(&path)?);
        Ok(())
    }
}

/// Replay the journal at `path` without writing to it. A torn tail is
/// skipped and left in place.
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    replay(path, false)
}

fn replay<T: DeserializeOwned>(path: &Path, repair: bool) -> Result<Vec<T>> {
    let bytes = fs::read(path)?;
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let end = bytes[offset..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| offset + p);
        let (line, next) = match end {
            Some(end) => (&bytes[offset..end], end + 1),
            None => (&bytes[offset..], bytes.len()),
        };

        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<T>(line) {
                Ok(record) => records.push(record),
                Err(e) if next >= bytes.len() => {
                    if repair {
                        warn!(path = %path.display(), offset, error = %e, "truncating torn journal tail");
                        let file = OpenOptions::new().write(true).open(path)?;
                        file.set_len(offset as u64)?;
                        file.sync_all()?;
                    } else {
                        warn!(path = %path.display(), offset, error = %e, "ignoring torn journal tail");
                    }
                    break;
                }
                Err(e) => {
                    return Err(GatewayError::storage(format!(
                        "corrupt journal {} at byte {}: {}",
                        path.display(),
                        offset,
                        e
                    )));
                }
            }
        }
        offset = next;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        {
            let (mut j, existing) = Journal::<Rec>::open(Some(&path), true).unwrap();
            assert!(existing.is_empty());
            j.append(&Rec { n: 1 }).unwrap();
            j.append(&Rec { n: 2 }).unwrap();
        }
        let (_, records) = Journal::<Rec>::open(Some(&path), true).unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        fs::write(&path, b"{\"n\":1}\n{\"n\":").unwrap();

        let (mut j, records) = Journal::<Rec>::open(Some(&path), false).unwrap();
        assert_eq!(records, vec![Rec { n: 1 }]);
        j.append(&Rec { n: 3 }).unwrap();
        drop(j);

        let (_, records) = Journal::<Rec>::open(Some(&path), false).unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 3 }]);
    }

    #[test]
    fn test_read_leaves_torn_tail_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let torn = b"{\"n\":1}\n{\"n\":";
        fs::write(&path, torn).unwrap();

        assert_eq!(read::<Rec>(&path).unwrap(), vec![Rec { n: 1 }]);
        assert_eq!(fs::read(&path).unwrap(), torn.to_vec());

        fs::write(&path, b"{\"n\":1}\ngarbage\n{\"n\":2}\n").unwrap();
        assert!(read::<Rec>(&path).is_err());
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        fs::write(&path, b"{\"n\":1}\ngarbage\n{\"n\":2}\n").unwrap();
        assert!(Journal::<Rec>::open(Some(&path), false).is_err());
    }

    #[test]
    fn test_rewrite_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let (mut j, _) = Journal::<Rec>::open(Some(&path), false).unwrap();
        for n in 0..5 {
            j.append(&Rec { n }).unwrap();
        }
        j.rewrite(&[Rec { n: 4 }]).unwrap();
        j.append(&Rec { n: 5 }).unwrap();
        drop(j);
        let (_, records) = Journal::<Rec>::open(Some(&path), false).unwrap();
        assert_eq!(records, vec![Rec { n: 4 }, Rec { n: 5 }]);
    }
}
