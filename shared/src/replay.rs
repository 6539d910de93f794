//! Replay files: every packet a client received, in arrival order, with an
//! optional metadata block appended when recording ends.
//!
//! ```text
//! {[from:i32][len:i32][packet]}*
//! [-1][version:i32][len:i32][bincode metadata][block len:i32][-2]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::ProtocolError;
use crate::io::{read_byte_blob, write_byte_blob};
use crate::order::{OrderReader, START_GAME};
use crate::packet::{classify, packet_payload, PacketKind};
use crate::MAX_PACKET_SIZE;

pub const REPLAY_EXTENSION: &str = "orarep";
pub const METADATA_START_MARKER: i32 = -1;
pub const METADATA_END_MARKER: i32 = -2;
pub const METADATA_VERSION: i32 = 1;

/// Attempts at finding an unused file name before giving up.
const MAX_NAME_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMetadata {
    pub start_time_utc: DateTime<Utc>,
    pub end_time_utc: Option<DateTime<Utc>>,
    pub map: String,
    pub players: Vec<String>,
}

impl ReplayMetadata {
    pub fn new(map: impl Into<String>, players: Vec<String>) -> Self {
        Self {
            start_time_utc: Utc::now(),
            end_time_utc: None,
            map: map.into(),
            players,
        }
    }

    fn write_block(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        let data = bincode::serialize(self)
            .map_err(|e| ProtocolError::InvalidReplay(format!("metadata encode failed: {}", e)))?;

        w.write_i32::<LittleEndian>(METADATA_START_MARKER)?;
        w.write_i32::<LittleEndian>(METADATA_VERSION)?;
        write_byte_blob(w, &data)?;
        w.write_i32::<LittleEndian>(12 + data.len() as i32)?;
        w.write_i32::<LittleEndian>(METADATA_END_MARKER)?;
        Ok(())
    }
}

/// True for the frame-0 packet that carries `StartGame`.
fn is_game_start(packet: &[u8]) -> bool {
    if classify(packet).ok() != Some(PacketKind::Immediate) {
        return false;
    }
    OrderReader::new(packet_payload(packet))
        .filter_map(Result::ok)
        .any(|o| o.order_string == START_GAME)
}

/// Tees received packets into a replay file.
///
/// Nothing touches the disk until the game actually starts: lobbies that
/// never launch leave no file behind.
pub struct ReplayRecorder {
    dir: PathBuf,
    name: String,
    pending: Vec<u8>,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    metadata: Option<ReplayMetadata>,
    disabled: bool,
    finished: bool,
}

impl ReplayRecorder {
    /// Records into `<dir>/<name>.orarep`, or a numbered variant if taken.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            pending: Vec::new(),
            writer: None,
            path: None,
            metadata: None,
            disabled: false,
            finished: false,
        }
    }

    /// Path of the replay file, once created.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn set_metadata(&mut self, metadata: ReplayMetadata) {
        self.metadata = Some(metadata);
    }

    pub fn metadata_mut(&mut self) -> Option<&mut ReplayMetadata> {
        self.metadata.as_mut()
    }

    pub fn receive(&mut self, from: i32, packet: &[u8]) -> Result<(), ProtocolError> {
        if self.disabled || self.finished {
            return Ok(());
        }

        let mut entry = Vec::with_capacity(8 + packet.len());
        entry.write_i32::<LittleEndian>(from)?;
        write_byte_blob(&mut entry, packet)?;

        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(&entry)?;
            return Ok(());
        }

        self.pending.extend_from_slice(&entry);
        if !is_game_start(packet) {
            return Ok(());
        }

        let file = match self.create_file() {
            Ok(file) => file,
            Err(e) => {
                warn!("Replay recording disabled: {}", e);
                self.disabled = true;
                self.pending.clear();
                return Err(e.into());
            }
        };

        let mut writer = BufWriter::new(file);
        writer.write_all(&std::mem::take(&mut self.pending))?;
        self.writer = Some(writer);
        Ok(())
    }

    fn create_file(&mut self) -> io::Result<File> {
        std::fs::create_dir_all(&self.dir)?;

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let file_name = if attempt == 0 {
                format!("{}.{}", self.name, REPLAY_EXTENSION)
            } else {
                format!("{}-{}.{}", self.name, attempt - 1, REPLAY_EXTENSION)
            };
            let path = self.dir.join(file_name);

            match File::create_new(&path) {
                Ok(file) => {
                    info!("Recording replay to {}", path.display());
                    self.path = Some(path);
                    return Ok(file);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Replay file {} already exists", path.display());
                }
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free replay file name for '{}'", self.name),
        ))
    }

    /// Appends the metadata block and closes the file. Safe to call twice.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        if let Some(metadata) = self.metadata.as_mut() {
            metadata.end_time_utc = Some(Utc::now());
            metadata.write_block(&mut writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl Drop for ReplayRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to finish replay: {}", e);
        }
    }
}

/// A replay file read back into memory.
#[derive(Debug, Clone)]
pub struct ReplayReader {
    packets: Vec<(i32, Vec<u8>)>,
    metadata: Option<ReplayMetadata>,
}

impl ReplayReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let mut file = BufReader::new(File::open(path)?);
        Self::read_from(&mut file)
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<Self, ProtocolError> {
        let file_len = r.seek(SeekFrom::End(0))?;
        let (metadata, packets_end) = read_metadata(r, file_len)?;

        r.seek(SeekFrom::Start(0))?;
        let mut packets = Vec::new();
        let mut pos = 0u64;
        while pos < packets_end {
            let from = r.read_i32::<LittleEndian>().map_err(|e| truncated(e.into()))?;
            let packet = read_byte_blob(r, MAX_PACKET_SIZE).map_err(truncated)?;
            pos += 8 + packet.len() as u64;
            packets.push((from, packet));
        }
        if pos != packets_end {
            return Err(ProtocolError::InvalidReplay(
                "packet stream overruns metadata block".to_string(),
            ));
        }

        Ok(Self { packets, metadata })
    }

    /// `(from, packet)` pairs in recorded order.
    pub fn packets(&self) -> &[(i32, Vec<u8>)] {
        &self.packets
    }

    pub fn into_packets(self) -> Vec<(i32, Vec<u8>)> {
        self.packets
    }

    pub fn metadata(&self) -> Option<&ReplayMetadata> {
        self.metadata.as_ref()
    }
}

fn truncated(e: ProtocolError) -> ProtocolError {
    match e {
        ProtocolError::Io(io) => ProtocolError::InvalidReplay(format!("truncated packet: {}", io)),
        ProtocolError::MalformedPacket(msg) => ProtocolError::InvalidReplay(msg),
        other => other,
    }
}

/// Returns the metadata, if any, and where the packet stream ends.
fn read_metadata<R: Read + Seek>(
    r: &mut R,
    file_len: u64,
) -> Result<(Option<ReplayMetadata>, u64), ProtocolError> {
    if file_len < 8 {
        return Ok((None, file_len));
    }

    r.seek(SeekFrom::End(-8))?;
    let block_len = r.read_i32::<LittleEndian>()?;
    if r.read_i32::<LittleEndian>()? != METADATA_END_MARKER {
        return Ok((None, file_len));
    }

    let block_start = (block_len >= 12)
        .then(|| file_len.checked_sub(8 + block_len as u64))
        .flatten()
        .ok_or_else(|| ProtocolError::InvalidReplay(format!("bad metadata length {}", block_len)))?;

    r.seek(SeekFrom::Start(block_start))?;
    if r.read_i32::<LittleEndian>()? != METADATA_START_MARKER {
        return Err(ProtocolError::InvalidReplay(
            "missing metadata start marker".to_string(),
        ));
    }
    let version = r.read_i32::<LittleEndian>()?;
    if version != METADATA_VERSION {
        return Err(ProtocolError::InvalidReplay(format!(
            "unsupported metadata version {}",
            version
        )));
    }

    let data = read_byte_blob(r, block_len as usize - 12)?;
    let metadata = bincode::deserialize(&data)
        .map_err(|e| ProtocolError::InvalidReplay(format!("metadata decode failed: {}", e)))?;
    Ok((Some(metadata), block_start))
}
