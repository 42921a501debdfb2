use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: u32 length prefix + u32 crc32 suffix.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "WAL record too large"))?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(frame)
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn EOF.
fn read_frame_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Persist a rename by syncing the directory entry that holds `path`.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Result of scanning a log file.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte length of the valid prefix. Anything past it is a torn or corrupt tail.
    pub valid_len: u64,
}

/// Append-only write-ahead log of [`Event`]s.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`, little endian.
/// A record is committed once `flush_sync` returns. On open, a torn or corrupt
/// tail left by a crash is cut off so new records land right after the last
/// good one. A failed batch is cut off the same way by `rollback`.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length covered by the last successful `flush_sync`.
    committed_len: u64,
    /// Appends buffered since then.
    pending_appends: u64,
    /// Set when a rollback failed; the file tail is unknown until the next
    /// compaction rewrites it.
    poisoned: bool,
    #[cfg(test)]
    fail_append_in: Option<usize>,
}

impl Wal {
    /// Replay the log at `path`, truncate any bad tail, and open it for appending.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        if file.metadata()?.len() > replay.valid_len {
            tracing::warn!(
                path = %path.display(),
                valid_len = replay.valid_len,
                "discarding torn WAL tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self::from_file(file, path.to_path_buf(), replay.valid_len);
        Ok((wal, replay.events))
    }

    fn from_file(file: File, path: PathBuf, committed_len: u64) -> Self {
        Self {
            writer: BufWriter::new(file),
            path,
            appends_since_compact: 0,
            committed_len,
            pending_appends: 0,
            poisoned: false,
            #[cfg(test)]
            fail_append_in: None,
        }
    }

    /// Append and fsync a single event. Tests only; the engine goes through
    /// `append_buffered` + `flush_sync` so concurrent commits share one fsync.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Make the append after the next `n` write half a frame and fail.
    #[cfg(test)]
    pub(crate) fn fail_append_after(&mut self, n: usize) {
        self.fail_append_in = Some(n);
    }

    #[cfg(test)]
    fn append_fault(&mut self) -> bool {
        match self.fail_append_in {
            Some(0) => {
                self.fail_append_in = None;
                true
            }
            Some(n) => {
                self.fail_append_in = Some(n - 1);
                false
            }
            None => false,
        }
    }

    #[cfg(not(test))]
    fn append_fault(&mut self) -> bool {
        false
    }

    /// Buffer one event. Not durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned after a failed rollback"));
        }
        let frame = encode_frame(event)?;
        if self.append_fault() {
            self.writer.write_all(&frame[..frame.len() / 2])?;
            return Err(io::Error::other("injected WAL write failure"));
        }
        self.writer.write_all(&frame)?;
        self.appends_since_compact += 1;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned after a failed rollback"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len = self.writer.get_ref().metadata()?.len();
        self.pending_appends = 0;
        Ok(())
    }

    /// Discard everything since the last successful `flush_sync`: buffered
    /// bytes are dropped and the file is cut back to its committed length.
    /// On failure the WAL refuses further appends until it is compacted.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.truncate_to_committed();
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_appends);
        self.pending_appends = 0;
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn truncate_to_committed(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        // into_parts hands back the unwritten buffer instead of flushing it.
        let (_old_file, _discarded) =
            std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replace the log with `events` via write-to-temp, fsync, rename, reopen.
    /// Also clears a poisoned log, since the old tail is gone.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                writer.write_all(&encode_frame(event)?)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        sync_parent_dir(&self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let committed_len = file.metadata()?.len();
        *self = Self::from_file(file, self.path.clone(), committed_len);
        Ok(())
    }

    /// Scan the log, stopping at the first truncated or corrupt record.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if !read_frame_part(&mut reader, &mut payload)? {
                break;
            }

            let mut crc_buf = [0u8; 4];
            if !read_frame_part(&mut reader, &mut crc_buf)? {
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
            valid_len += len as u64 + FRAME_OVERHEAD;
        }

        Ok(Replay { events, valid_len })
    }
}
