//! Append-only, FIFO, crash-tolerant record log.
//!
//! Records are stored one JSON document per line. The oldest record is the
//! first non-blank line. Removal rewrites the remainder into a sibling temp
//! file and renames it over the original.
//!
//! A line that does not parse is dropped from the front and logged; it is
//! never re-queued.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue full: {size} bytes queued + {record} byte record exceeds cap of {max}")]
    Full { size: u64, record: u64, max: u64 },
    #[error("queue I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A persistent queue of `T` records backed by a JSON-lines file.
#[derive(Debug)]
pub struct RecordQueue<T> {
    path: PathBuf,
    max_size: u64,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> RecordQueue<T> {
    /// Open (or create) the queue file at `path` with a byte cap of `max_size`.
    pub fn open(path: impl Into<PathBuf>, max_size: u64) -> Result<Self, QueueError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        sync_parent_dir(&path)?;
        let queue = RecordQueue {
            path,
            max_size,
            _record: PhantomData,
        };
        debug!(path = %queue.path.display(), size = queue.size_bytes(), "record queue opened");
        Ok(queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Current on-disk size of the queue in bytes.
    pub fn size_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Append `record` at the back. Fails with [`QueueError::Full`] instead of
    /// evicting anything already queued.
    pub fn append(&self, record: &T) -> Result<(), QueueError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let size = self.size_bytes();
        let torn_tail = size > 0 && !self.ends_with_newline()?;
        let record_len = line.len() as u64 + u64::from(torn_tail);
        if size.saturating_add(record_len) > self.max_size {
            return Err(QueueError::Full {
                size,
                record: record_len,
                max: self.max_size,
            });
        }

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        if torn_tail {
            // A crash left the last line unterminated; seal it off so the new
            // record stays on its own line.
            warn!(path = %self.path.display(), "terminating torn final line before append");
            file.write_all(b"\n")?;
        }
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// The oldest parseable record, or `None` when the queue is empty.
    pub fn peek_oldest(&self) -> Result<Option<T>, QueueError> {
        loop {
            let Some(line) = self.first_line()? else {
                return Ok(None);
            };
            match serde_json::from_str::<T>(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        bytes = line.len(),
                        "dropping corrupt record at queue front"
                    );
                    self.remove_oldest()?;
                }
            }
        }
    }

    /// Drop the oldest record. A no-op on an empty queue.
    pub fn remove_oldest(&self) -> Result<(), QueueError> {
        let mut content = Vec::new();
        File::open(&self.path)?.read_to_end(&mut content)?;

        let mut rest: &[u8] = &content;
        // Skip leading blank lines, then the record line itself.
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if !is_blank(line) {
                return self.rewrite(rest);
            }
        }
        // No terminated record left; whatever remains is a single (possibly torn) line.
        self.rewrite(&[])
    }

    /// Number of records currently queued (corrupt lines included).
    pub fn len(&self) -> Result<usize, QueueError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut count = 0;
        for line in reader.split(b'\n') {
            if !is_blank(&line?) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.first_line()?.is_none())
    }

    /// Discard every record.
    pub fn clear(&self) -> Result<(), QueueError> {
        self.rewrite(&[])
    }

    fn first_line(&self) -> Result<Option<String>, QueueError> {
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.split(b'\n') {
            let line = line?;
            if !is_blank(&line) {
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
        }
        Ok(None)
    }

    fn ends_with_newline(&self) -> Result<bool, QueueError> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::End(-1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        Ok(last[0] == b'\n')
    }

    fn rewrite(&self, remainder: &[u8]) -> Result<(), QueueError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(remainder)?;
            file.sync_all()?;
        }
        // The temp file's contents are on disk before the rename; the rename
        // itself is only durable once the directory entry is.
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

/// Flush the directory holding `path`, making creates and renames in it durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
