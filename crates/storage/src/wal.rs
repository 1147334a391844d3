//! Write-Ahead Log (WAL) for durability.
//!
//! Format: each committed transaction is one frame
//! `[4-byte CRC32][4-byte length][JSON WalEntry]\n`.
//! Replay stops at the first truncated or corrupt frame.

use crate::record::WalEntry;
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every commit.
    Always,
    /// Fsync when the caller asks for it.
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
}

enum Frame {
    Entry(Vec<u8>),
    /// Clean end of file.
    End,
    /// Truncated or corrupt frame; everything after it is discarded.
    Broken,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            entries_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one committed transaction.
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        let payload = serde_json::to_vec(entry)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Number of entries written since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replay all valid entries from a WAL file, in commit order.
    pub fn replay(path: &Path) -> Result<Vec<WalEntry>, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            match read_frame(&mut reader, entries.len())? {
                Frame::Entry(payload) => match serde_json::from_slice::<WalEntry>(&payload) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(
                            "WAL entry {} does not decode ({}); stopping replay",
                            entries.len(),
                            e
                        );
                        break;
                    }
                },
                Frame::End | Frame::Broken => break,
            }
        }

        Ok(entries)
    }
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WalError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(WalError::Io(e)),
    }
}

fn read_frame<R: Read>(reader: &mut R, index: usize) -> Result<Frame, WalError> {
    let mut crc_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut crc_buf)? {
        return Ok(Frame::End);
    }
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut len_buf = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len_buf)? {
        tracing::warn!("WAL truncated mid-entry at entry {}; stopping replay", index);
        return Ok(Frame::Broken);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    let mut nl = [0u8; 1];
    if !read_exact_or_eof(reader, &mut payload)? || !read_exact_or_eof(reader, &mut nl)? {
        tracing::warn!("WAL truncated mid-entry at entry {}; stopping replay", index);
        return Ok(Frame::Broken);
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let actual_crc = hasher.finalize();
    if actual_crc != expected_crc {
        tracing::warn!(
            "WAL CRC mismatch at entry {}: expected {:#010x}, got {:#010x}; stopping replay",
            index,
            expected_crc,
            actual_crc
        );
        return Ok(Frame::Broken);
    }

    Ok(Frame::Entry(payload))
}
