use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Bytes around every payload: the length prefix and the trailing CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Write one `[u32 len][bincode Event][u32 crc32]` frame, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for one frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Frame {
    Event { event: Event, bytes: u64 },
    /// Clean end of file.
    End,
    /// A partial or corrupt frame: everything from here on is unusable.
    Torn(&'static str),
}

/// Fill `buf`, or report how many bytes were available before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        4 => {}
        _ => return Ok(Frame::Torn("partial length prefix")),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Frame::Torn("partial payload"));
    }
    let mut crc_buf = [0u8; 4];
    if read_full(reader, &mut crc_buf)? < 4 {
        return Ok(Frame::Torn("missing checksum"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event {
            event,
            bytes: len as u64 + FRAME_OVERHEAD,
        }),
        Err(_) => Ok(Frame::Torn("undecodable event")),
    }
}

/// What a scan of the log found.
#[derive(Debug)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the intact prefix in bytes.
    pub valid_len: u64,
    /// Why the scan stopped early, if it did.
    pub torn: Option<&'static str>,
}

/// Append-only write-ahead log for one clinic. Every accepted write is one
/// framed event; the in-memory state is whatever replaying the frames yields.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path` and open it for appends.
    ///
    /// A torn tail (crash mid-write) is cut off first, so new frames never
    /// land behind bytes that replay would stop at.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        if let Some(reason) = replay.torn {
            warn!(
                path = %path.display(),
                reason,
                kept_bytes = replay.valid_len,
                events = replay.events.len(),
                "discarding torn WAL tail"
            );
            OpenOptions::new()
                .write(true)
                .open(path)?
                .set_len(replay.valid_len)?;
        }
        let mut wal = Self::open(path)?;
        // Replayed history counts toward the next compaction.
        wal.appends_since_compact = replay.events.len() as u64;
        Ok((wal, replay.events))
    }

    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Scan every intact frame, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                    torn: None,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        let torn = loop {
            match read_frame(&mut reader)? {
                Frame::Event { event, bytes } => {
                    events.push(event);
                    valid_len += bytes;
                }
                Frame::End => break None,
                Frame::Torn(reason) => break Some(reason),
            }
        };
        Ok(Replay {
            events,
            valid_len,
            torn,
        })
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush buffered frames and fsync: the commit point of a batch.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("wal.compact")
    }

    /// Replace the log with `events`. The new log is written and synced
    /// beside the old one, then renamed over it, so a crash leaves one
    /// complete log or the other.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let staging = self.compact_path();
        {
            let mut writer = BufWriter::new(File::create(&staging)?);
            for event in events {
                write_frame(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            // Persist the rename itself. Not every platform can open a directory.
            if let Ok(dir) = File::open(dir) {
                let _ = dir.sync_all();
            }
        }
        *self = Self::open(&self.path)?;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Role, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("vetbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn user_event(name: &str) -> Event {
        Event::UserRegistered {
            id: Ulid::new(),
            name: name.into(),
            email: format!("{name}@clinic.test"),
            role: Role::PetOwner,
        }
    }

    fn slot_event(vet: Ulid, start: i64) -> Event {
        Event::SlotCreated {
            id: Ulid::new(),
            veterinarian_id: vet,
            span: Span::new(start, start + 1_800_000),
            blocked: false,
        }
    }

    fn write_all(path: &Path, events: &[Event]) {
        let (mut wal, _) = Wal::recover(path).unwrap();
        for e in events {
            wal.append_buffered(e).unwrap();
        }
        wal.flush_sync().unwrap();
    }

    fn append_raw(path: &Path, bytes: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn recover_returns_what_was_appended() {
        let path = tmp_path("recover.wal");
        let events = vec![user_event("rahim"), slot_event(Ulid::new(), 0)];
        write_all(&path, &events);

        let (wal, replayed) = Wal::recover(&path).unwrap();
        assert_eq!(replayed, events);
        assert_eq!(wal.appends_since_compact(), 2);
    }

    #[test]
    fn missing_file_is_an_empty_log() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
        assert!(replay.torn.is_none());
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let path = tmp_path("torn_tail.wal");
        let first = user_event("karim");
        write_all(&path, std::slice::from_ref(&first));
        let intact = fs::metadata(&path).unwrap().len();

        // Crash mid-frame: a length prefix promising more than was written.
        append_raw(&path, &[200, 0, 0, 0, 1, 2, 3]);
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.torn, Some("partial payload"));
        assert_eq!(replay.valid_len, intact);

        let later = user_event("nadia");
        write_all(&path, std::slice::from_ref(&later));

        let replay = Wal::replay(&path).unwrap();
        assert!(replay.torn.is_none());
        assert_eq!(replay.events, vec![first, later]);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let good = user_event("salma");
        write_all(&path, std::slice::from_ref(&good));

        let payload = bincode::serialize(&Event::HomepageContentRemoved { id: Ulid::new() }).unwrap();
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        append_raw(&path, &frame);

        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![good]);
        assert_eq!(replay.torn, Some("checksum mismatch"));
    }

    #[test]
    fn compact_shrinks_log_and_accepts_appends() {
        let path = tmp_path("compact.wal");
        let vet = Ulid::new();
        let keep = slot_event(vet, 0);
        let Event::SlotCreated { id, .. } = &keep else {
            unreachable!()
        };
        // Block/unblock churn that nets out to nothing.
        let mut churn = vec![keep.clone()];
        for blocked in [true, false].repeat(10) {
            churn.push(Event::SlotBlockChanged {
                id: *id,
                veterinarian_id: vet,
                blocked,
            });
        }
        write_all(&path, &churn);
        let before = fs::metadata(&path).unwrap().len();

        let (mut wal, _) = Wal::recover(&path).unwrap();
        wal.compact(std::slice::from_ref(&keep)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);
        assert!(!path.with_extension("wal.compact").exists());

        let later = user_event("tariq");
        wal.append_buffered(&later).unwrap();
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap().events, vec![keep, later]);
    }

    #[test]
    fn buffered_frames_are_invisible_until_flushed() {
        let path = tmp_path("buffered.wal");
        let vet = Ulid::new();
        let events: Vec<Event> = (0..5).map(|i| slot_event(vet, i * 3_600_000)).collect();

        let (mut wal, _) = Wal::recover(&path).unwrap();
        for e in &events {
            wal.append_buffered(e).unwrap();
        }
        assert_eq!(wal.appends_since_compact(), 5);
        assert!(Wal::replay(&path).unwrap().events.is_empty());
        wal.flush_sync().unwrap();

        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
