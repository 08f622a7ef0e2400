//! Persistent session storage: the append-only outbound message log used to
//! satisfy resend requests, and the small atomically-replaced state snapshot
//! holding the sequence number pair.

use crate::error::ConfigError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fixwire::SeqNum;
use serde_derive::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// seqnum (u64) + payload length (u32)
const RECORD_HEADER: u64 = 12;

/// One stored outbound message.
#[derive(Debug, PartialEq)]
pub struct Record {
    pub seq: SeqNum,
    pub data: Vec<u8>,
    /// File offset of the record after this one.
    pub next_pos: u64,
}

/// Opens a message store from a `file:<path>` URL.
pub fn open_store(url: &str) -> Result<MessageStore, ConfigError> {
    match url.strip_prefix("file:") {
        Some(path) if !path.is_empty() => Ok(MessageStore::new(path)),
        _ => Err(ConfigError::BadUrl(url.to_string())),
    }
}

/// Append-only log of `(seqnum, serialized message)` records. Records are
/// length-prefixed and written in seqnum order; every write is flushed
/// before the message may touch the wire.
pub struct MessageStore {
    path: PathBuf,
    file: Option<File>,
    sync: bool,
}

impl MessageStore {
    pub fn new<P: AsRef<Path>>(path: P) -> MessageStore {
        MessageStore {
            path: path.as_ref().to_path_buf(),
            file: None,
            sync: false,
        }
    }

    /// Enables fsync-per-record durability.
    #[inline]
    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Appends one record and makes it durable.
    pub fn save(&mut self, seq: SeqNum, msg: &[u8]) -> io::Result<()> {
        let sync = self.sync;
        let file = self.open()?;

        file.write_u64::<BigEndian>(seq)?;
        file.write_u32::<BigEndian>(msg.len() as u32)?;
        file.write_all(msg)?;
        file.flush()?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Byte size of the log.
    pub fn tell(&mut self) -> io::Result<u64> {
        if self.file.is_none() && !self.path.exists() {
            return Ok(0);
        }
        self.open()?.seek(SeekFrom::End(0))
    }

    /// Scans forward from `pos` for the record with the given seqnum.
    /// Returns `None` when the record is missing (the scan passed it or hit
    /// the end of the log).
    pub fn find(&mut self, seq: SeqNum, pos: u64) -> io::Result<Option<Record>> {
        let mut pos = pos;
        loop {
            match self.next(pos)? {
                Some(record) => {
                    if record.seq == seq {
                        return Ok(Some(record));
                    }
                    if record.seq > seq {
                        return Ok(None);
                    }
                    pos = record.next_pos;
                }
                None => return Ok(None),
            }
        }
    }

    /// Reads the record at `pos`, or `None` at end of log.
    pub fn next(&mut self, pos: u64) -> io::Result<Option<Record>> {
        if !self.path.exists() && self.file.is_none() {
            return Ok(None);
        }
        let file = self.open()?;
        file.seek(SeekFrom::Start(pos))?;

        let seq = match file.read_u64::<BigEndian>() {
            Ok(seq) => seq,
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        };
        let len = file.read_u32::<BigEndian>()? as usize;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;

        Ok(Some(Record {
            seq,
            data,
            next_pos: pos + RECORD_HEADER + len as u64,
        }))
    }

    /// Drops every record. Used when both sides agree to reset sequence
    /// numbers; the old epoch can no longer be asked for.
    pub fn truncate(&mut self) -> io::Result<()> {
        let file = self.open()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Seqnum of the last stored record.
    pub fn last_seqnum(&mut self) -> io::Result<Option<SeqNum>> {
        let mut last = None;
        let mut pos = 0;
        while let Some(record) = self.next(pos)? {
            last = Some(record.seq);
            pos = record.next_pos;
        }
        Ok(last)
    }
}

/// The persistent sequence-number pair plus the last peer address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub next_out: SeqNum,
    pub next_in: SeqNum,
    pub last_peer: Option<String>,
}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            next_out: 1,
            next_in: 1,
            last_peer: None,
        }
    }
}

impl SessionState {
    /// Resets both counters to 1 (ResetSeqNumFlag handling).
    #[inline]
    pub fn reset(&mut self) {
        self.next_out = 1;
        self.next_in = 1;
    }

    /// Writes the snapshot via a temp file and atomic rename.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");

        let mut file = File::create(&tmp)?;
        let encoded = serde_json::to_vec(self)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        file.write_all(&encoded)?;
        file.sync_data()?;
        drop(file);

        fs::rename(&tmp, path)
    }

    /// Loads a snapshot, `None` when no file exists yet.
    pub fn restore<P: AsRef<Path>>(path: P) -> io::Result<Option<SessionState>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let mut raw = Vec::new();
        File::open(path)?.read_to_end(&mut raw)?;
        let state = serde_json::from_slice(&raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(state))
    }
}
