// File-backed state log.
//
// Layout of the log directory:
//
// ```text
// state.log        frames: | len: u32 LE | crc32: u32 LE | json record |
// checkpoint.json  latest compaction snapshot
// ```
//
// A frame cut short by a crash is truncated on open, and a failed append
// truncates back to the last acknowledged frame. A checksum mismatch on a
// complete frame is reported as corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::store::{StateLogStore, StoredState};
use super::{Checkpoint, LogError, LogRecord, Seq};

const LOG_FILE: &str = "state.log";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const FRAME_HEADER: usize = 8;

#[derive(Debug)]
pub struct FileLogStore {
    dir: PathBuf,
    file: File,
    last_seq: Seq,
    /// Byte length covered by acknowledged frames.
    len: u64,
    /// Set when a failed append could not be rolled back.
    torn: bool,
    #[cfg(test)]
    torn_write: Option<usize>,
}

impl FileLogStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let path = dir.join(LOG_FILE);
        let checkpoint = read_checkpoint(&dir)?;
        let (records, valid_len) = scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let actual_len = file.metadata()?.len();
        if valid_len < actual_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                actual_len,
                "truncating torn frame at end of state log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let last_seq = records
            .last()
            .map(|r| r.seq)
            .or_else(|| checkpoint.as_ref().map(|c| c.last_seq))
            .unwrap_or(0);

        Ok(Self {
            dir,
            file,
            last_seq,
            len: valid_len,
            torn: false,
            #[cfg(test)]
            torn_write: None,
        })
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.torn_write.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(io::Error::new(io::ErrorKind::Other, "injected torn write"));
        }
        self.file.write_all(frame)?;
        self.file.sync_data()
    }

    /// Cut the file back to the last acknowledged frame.
    fn truncate_to_acknowledged(&mut self) -> io::Result<()> {
        self.file.set_len(self.len)?;
        self.file.sync_all()
    }
}

impl StateLogStore for FileLogStore {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        if record.seq != self.last_seq + 1 {
            return Err(LogError::VersionConflict {
                expected: self.last_seq + 1,
                actual: record.seq,
            });
        }
        let frame = encode_frame(record)?;
        if self.torn {
            self.truncate_to_acknowledged()?;
            self.torn = false;
        }
        if let Err(e) = self.write_frame(&frame) {
            if let Err(undo) = self.truncate_to_acknowledged() {
                tracing::error!(
                    seq = record.seq,
                    len = self.len,
                    error = %undo,
                    "failed to roll back partial append"
                );
                self.torn = true;
            }
            return Err(e.into());
        }
        self.len += frame.len() as u64;
        self.last_seq = record.seq;
        Ok(())
    }

    fn load(&self) -> Result<StoredState, LogError> {
        let checkpoint = read_checkpoint(&self.dir)?;
        let (mut records, _) = scan(&self.dir.join(LOG_FILE))?;
        if let Some(checkpoint) = &checkpoint {
            records.retain(|r| r.seq > checkpoint.last_seq);
        }
        Ok(StoredState {
            checkpoint,
            records,
        })
    }

    fn install_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), LogError> {
        // Checkpoint first: if we crash before the log is rewritten, load()
        // still filters the covered records out.
        let tmp = self.dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        let mut out = File::create(&tmp)?;
        out.write_all(&serde_json::to_vec(checkpoint)?)?;
        out.sync_all()?;
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))?;

        let path = self.dir.join(LOG_FILE);
        let (records, _) = scan(&path)?;
        let tmp = self.dir.join(format!("{LOG_FILE}.tmp"));
        let mut out = File::create(&tmp)?;
        for record in records.iter().filter(|r| r.seq > checkpoint.last_seq) {
            out.write_all(&encode_frame(record)?)?;
        }
        out.sync_all()?;
        fs::rename(&tmp, &path)?;

        self.file = OpenOptions::new().read(true).append(true).open(&path)?;
        self.len = self.file.metadata()?.len();
        self.torn = false;
        Ok(())
    }
}

fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, LogError> {
    let payload = serde_json::to_vec(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| LogError::Unavailable("record exceeds frame size".into()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode every complete frame. Returns the records and the byte length
/// covered by them; anything past that is a torn tail.
fn scan(path: &Path) -> Result<(Vec<LogRecord>, u64), LogError> {
    let mut bytes = Vec::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_end(&mut bytes)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    }

    let mut records = Vec::new();
    let mut offset = 0usize;
    while bytes.len() - offset >= FRAME_HEADER {
        let len = read_u32(&bytes[offset..offset + 4]) as usize;
        let crc = read_u32(&bytes[offset + 4..offset + 8]);
        let start = offset + FRAME_HEADER;
        if bytes.len() - start < len {
            break;
        }
        let payload = &bytes[start..start + len];
        if crc32fast::hash(payload) != crc {
            return Err(LogError::Corrupt {
                offset: offset as u64,
            });
        }
        records.push(serde_json::from_slice(payload)?);
        offset = start + len;
    }
    Ok((records, offset as u64))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_checkpoint(dir: &Path) -> Result<Option<Checkpoint>, LogError> {
    match fs::read(dir.join(CHECKPOINT_FILE)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
