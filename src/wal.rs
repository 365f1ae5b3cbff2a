use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::limits::MAX_WAL_ENTRY_BYTES;
use crate::model::Event;

/// Bytes of framing around each payload: length prefix plus trailing crc32.
const FRAME_OVERHEAD: u64 = 8;

/// Frame one event as `[u32 le: len][bincode payload][u32 le: crc32(payload)]`.
fn frame(event: &Event) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_ENTRY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("event of {} bytes exceeds the log entry limit", payload.len()),
        ));
    }
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(out)
}

enum Frame {
    Event(Event, u64),
    Eof,
    Torn(&'static str),
}

/// `Ok(false)` when EOF arrives before `buf` is full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn next_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(Frame::Eof);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_WAL_ENTRY_BYTES {
        return Ok(Frame::Torn("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(Frame::Torn("short frame"));
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event(event, len as u64 + FRAME_OVERHEAD)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// What a scan of the log found on disk.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Every intact event, in append order.
    pub events: Vec<Event>,
    /// Length of the intact prefix.
    pub valid_bytes: u64,
    /// Bytes after the intact prefix that could not be decoded.
    pub discarded_bytes: u64,
}

/// Append-only log of engine events.
///
/// Each record is one framed event. Only whole records are ever replayed: a
/// crash mid-write leaves a torn tail that `recover` cuts off before the
/// writer reopens the file, so later records never land behind garbage.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    records_since_rewrite: u64,
}

impl Wal {
    /// Scan the log at `path`, truncate any torn tail and open it for
    /// appending. A missing file starts an empty log.
    pub fn recover(path: &Path) -> io::Result<(Self, Recovery)> {
        let recovery = Self::scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if recovery.discarded_bytes > 0 {
            file.set_len(recovery.valid_bytes)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            records_since_rewrite: 0,
        };
        Ok((wal, recovery))
    }

    /// Read the log without touching it.
    pub fn scan(path: &Path) -> io::Result<Recovery> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Recovery::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut recovery = Recovery::default();

        loop {
            match next_frame(&mut reader)? {
                Frame::Event(event, size) => {
                    recovery.events.push(event);
                    recovery.valid_bytes += size;
                }
                Frame::Eof => break,
                Frame::Torn(reason) => {
                    recovery.discarded_bytes = total - recovery.valid_bytes;
                    warn!(
                        path = %path.display(),
                        kept = recovery.events.len(),
                        discarded_bytes = recovery.discarded_bytes,
                        reason,
                        "availability log has a torn tail"
                    );
                    break;
                }
            }
        }
        // A length prefix cut short at EOF is torn too.
        if recovery.discarded_bytes == 0 && recovery.valid_bytes < total {
            recovery.discarded_bytes = total - recovery.valid_bytes;
        }
        Ok(recovery)
    }

    /// Buffer one record. Nothing is durable until `sync`.
    pub fn push(&mut self, event: &Event) -> io::Result<()> {
        self.writer.write_all(&frame(event)?)?;
        self.records_since_rewrite += 1;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Replace the whole log with `events`. The new contents are written and
    /// fsynced to a sibling file first, then renamed over the log.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        self.sync()?;
        let staging = self.path.with_extension("wal.tmp");
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for event in events {
                out.write_all(&frame(event)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.records_since_rewrite = 0;
        Ok(())
    }

    /// Records pushed since the log was opened or last rewritten.
    pub fn records_since_rewrite(&self) -> u64 {
        self.records_since_rewrite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Availability, AvailabilityType, GroupInfo, ResourceInfo, TimelineChange, TimelineOp,
    };

    fn fresh(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("uptrail_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(id: u64) -> Event {
        Event::ResourceCreated {
            info: ResourceInfo::new(id),
            seed: Availability::open(id, 0, AvailabilityType::Unknown),
        }
    }

    fn went_up(id: u64, at: i64) -> Event {
        Event::TimelineChanged {
            changes: vec![TimelineChange {
                resource_id: id,
                ops: vec![TimelineOp::Append(Availability::open(id, at, AvailabilityType::Up))],
            }],
        }
    }

    fn write_all(path: &Path, events: &[Event]) {
        let (mut wal, _) = Wal::recover(path).unwrap();
        for e in events {
            wal.push(e).unwrap();
        }
        wal.sync().unwrap();
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn records_survive_reopen() {
        let path = fresh("reopen.wal");
        let events = vec![
            created(1),
            went_up(1, 1_000),
            Event::GroupCreated {
                group: GroupInfo { id: 9, name: Some("web".into()), members: vec![1] },
            },
        ];
        write_all(&path, &events);

        let (_, recovery) = Wal::recover(&path).unwrap();
        assert_eq!(recovery.events, events);
        assert_eq!(recovery.discarded_bytes, 0);
        assert_eq!(recovery.valid_bytes, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn missing_log_is_empty() {
        let path = fresh("missing.wal");
        let recovery = Wal::scan(&path).unwrap();
        assert!(recovery.events.is_empty());
        assert_eq!(recovery.valid_bytes, 0);
    }

    #[test]
    fn torn_tail_is_cut_before_new_records() {
        let path = fresh("torn_tail.wal");
        write_all(&path, &[created(1)]);
        let intact = fs::metadata(&path).unwrap().len();
        append_raw(&path, &[7u8, 0, 0, 0, 1, 2]);

        let later = went_up(1, 2_000);
        {
            let (mut wal, recovery) = Wal::recover(&path).unwrap();
            assert_eq!(recovery.events, vec![created(1)]);
            assert_eq!(recovery.discarded_bytes, 6);
            assert_eq!(fs::metadata(&path).unwrap().len(), intact);
            wal.push(&later).unwrap();
            wal.sync().unwrap();
        }

        assert_eq!(Wal::scan(&path).unwrap().events, vec![created(1), later]);
    }

    #[test]
    fn half_written_length_prefix_is_torn() {
        let path = fresh("short_prefix.wal");
        write_all(&path, &[created(1)]);
        append_raw(&path, &[3u8, 0]);

        let recovery = Wal::scan(&path).unwrap();
        assert_eq!(recovery.events.len(), 1);
        assert_eq!(recovery.discarded_bytes, 2);
    }

    #[test]
    fn bad_checksum_ends_the_log() {
        let path = fresh("bad_crc.wal");
        write_all(&path, &[created(1)]);
        let payload = bincode::serialize(&Event::ResourceDeleted { id: 1 }).unwrap();
        let mut forged = (payload.len() as u32).to_le_bytes().to_vec();
        forged.extend_from_slice(&payload);
        forged.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        append_raw(&path, &forged);
        append_raw(&path, &frame(&went_up(1, 5)).unwrap());

        // Nothing after the forged record is trusted, even if it is intact.
        assert_eq!(Wal::scan(&path).unwrap().events, vec![created(1)]);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let path = fresh("huge_len.wal");
        let mut junk = u32::MAX.to_le_bytes().to_vec();
        junk.extend_from_slice(&[0u8; 16]);
        append_raw(&path, &junk);

        let recovery = Wal::scan(&path).unwrap();
        assert!(recovery.events.is_empty());
        assert_eq!(recovery.discarded_bytes, 20);
    }

    #[test]
    fn rewrite_shrinks_history_and_keeps_appending() {
        let path = fresh("rewrite.wal");
        let mut history = vec![created(1)];
        history.extend((1..50).map(|i| went_up(1, i * 1_000)));
        write_all(&path, &history);
        let before = fs::metadata(&path).unwrap().len();

        let snapshot = vec![Event::ResourceRestored {
            info: ResourceInfo::new(1),
            intervals: vec![Availability::open(1, 0, AvailabilityType::Up)],
        }];
        let next = went_up(1, 60_000);
        {
            let (mut wal, _) = Wal::recover(&path).unwrap();
            wal.push(&created(2)).unwrap();
            assert_eq!(wal.records_since_rewrite(), 1);
            wal.rewrite(&snapshot).unwrap();
            assert_eq!(wal.records_since_rewrite(), 0);
            wal.push(&next).unwrap();
            wal.sync().unwrap();
        }

        assert!(fs::metadata(&path).unwrap().len() < before);
        let mut expected = snapshot;
        expected.push(next);
        assert_eq!(Wal::scan(&path).unwrap().events, expected);
        assert!(!path.with_extension("wal.tmp").exists());
    }
}
