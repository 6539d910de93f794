//! Save files: the dispatched order stream plus the lobby state needed to
//! replay it.
//!
//! File layout, all integers little-endian `i32`:
//!
//! ```text
//! {[len + 8][frame][slot][payload]}*          order stream
//! [-1][last orders frame][last sync frame]    metadata
//!     [len][sync payload]
//!     [len][global settings text]
//!     [len][slots text]
//!     [len][slot clients text]
//! [-3][count]{[trait index][len][text]}*      trait data
//! [metadata offset][trait data offset][-2]
//! ```
//!
//! Orders are keyed by lobby slot rather than client index so a save stays
//! valid when clients get different indices on reload.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::ProtocolError;
use crate::io::{read_byte_blob, read_text_blob, write_byte_blob, write_text_blob};
use crate::order::Order;
use crate::session::{
    parse_sections, read_global, read_slot, write_global, write_slot, Client, GlobalSettings,
    Section, Session, Slot,
};
use crate::{
    DISCONNECT_TAG, IMMEDIATE_ORDER_TAG, MAX_PACKET_SIZE, SYNC_HASH_WIDTH, SYNC_TAG,
};

pub const METADATA_MARKER: i32 = -1;
pub const EOF_MARKER: i32 = -2;
pub const TRAIT_DATA_MARKER: i32 = -3;

/// Bytes of `[frame][slot]` counted in each entry's length prefix.
const ENTRY_HEADER: i32 = 8;

const SAVE_LAST_ORDERS_FRAME: &str = "SaveLastOrdersFrame";
const SAVE_SYNC_FRAME: &str = "SaveSyncFrame";

/// The game-relevant part of the client occupying a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotClient {
    pub slot: String,
    pub color: u32,
    pub team: i32,
    pub bot: Option<String>,
    /// Bots keep their display name; humans take whatever name they rejoin with.
    pub bot_name: Option<String>,
}

impl SlotClient {
    pub fn from_client(slot: &str, client: &Client) -> Self {
        Self {
            slot: slot.to_string(),
            color: client.color,
            team: client.team,
            bot: client.bot.clone(),
            bot_name: client.bot.as_ref().map(|_| client.name.clone()),
        }
    }

    pub fn apply_to(&self, client: &mut Client) {
        client.color = self.color;
        client.team = self.team;
        client.slot = Some(self.slot.clone());
        client.bot = self.bot.clone();
        if let Some(name) = &self.bot_name {
            client.name = name.clone();
        }
    }

    fn write(&self, out: &mut String) {
        let _ = writeln!(out, "SlotClient@{}:", self.slot);
        let _ = writeln!(out, "\tColor: {:06X}", self.color);
        let _ = writeln!(out, "\tTeam: {}", self.team);
        if let Some(bot) = &self.bot {
            let _ = writeln!(out, "\tBot: {}", bot);
        }
        if let Some(name) = &self.bot_name {
            let _ = writeln!(out, "\tBotName: {}", name);
        }
    }

    fn read(section: &Section) -> Result<Self, ProtocolError> {
        let invalid = |what: &str| ProtocolError::InvalidSave(format!("slot client {}", what));
        let slot = section.arg.clone().ok_or_else(|| invalid("without slot"))?;
        let color = match section.get("Color") {
            Some(v) => u32::from_str_radix(v, 16).map_err(|_| invalid("color"))?,
            None => 0,
        };
        let team = match section.get("Team") {
            Some(v) => v.parse().map_err(|_| invalid("team"))?,
            None => 0,
        };
        let non_empty = |key: &str| section.get(key).filter(|v| !v.is_empty()).map(str::to_string);

        Ok(Self {
            slot,
            color,
            team,
            bot: non_empty("Bot"),
            bot_name: non_empty("BotName"),
        })
    }
}

/// One `[frame][slot][payload]` record from the order stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveEntry {
    pub frame: i32,
    pub slot: i32,
    pub payload: Vec<u8>,
}

/// Frames carried by the `StartGame` order of a resumed game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumeFrames {
    pub last_orders_frame: Option<i32>,
    pub last_sync_frame: Option<i32>,
}

impl ResumeFrames {
    /// Reads `SaveLastOrdersFrame` / `SaveSyncFrame` lines from a `StartGame`
    /// target string. Missing or unparsable keys stay `None`.
    pub fn parse(data: &str) -> Self {
        let mut frames = ResumeFrames::default();
        for line in data.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().parse().ok();
            match key.trim() {
                SAVE_LAST_ORDERS_FRAME => frames.last_orders_frame = value,
                SAVE_SYNC_FRAME => frames.last_sync_frame = value,
                _ => {}
            }
        }
        frames
    }
}

#[derive(Debug, Clone)]
pub struct GameSave {
    orders_stream: Vec<u8>,
    last_orders_frame: i32,
    last_sync_frame: i32,
    last_sync_payload: Vec<u8>,

    global: GlobalSettings,
    slots: Vec<Slot>,
    slot_clients: Vec<SlotClient>,
    trait_data: BTreeMap<i32, String>,

    // Set on game start
    clients_by_slot_index: Vec<i32>,
    first_bot_slot_index: i32,
    /// Slots already recorded at `last_orders_frame`.
    seen_at_last_frame: BTreeSet<i32>,
}

impl Default for GameSave {
    fn default() -> Self {
        Self::new()
    }
}

impl GameSave {
    pub fn new() -> Self {
        Self {
            orders_stream: Vec::new(),
            last_orders_frame: -1,
            last_sync_frame: 0,
            last_sync_payload: Vec::new(),
            global: GlobalSettings::default(),
            slots: Vec::new(),
            slot_clients: Vec::new(),
            trait_data: BTreeMap::new(),
            clients_by_slot_index: Vec::new(),
            first_bot_slot_index: -1,
            seen_at_last_frame: BTreeSet::new(),
        }
    }

    pub fn last_orders_frame(&self) -> i32 {
        self.last_orders_frame
    }

    pub fn last_sync_frame(&self) -> i32 {
        self.last_sync_frame
    }

    pub fn last_sync_payload(&self) -> &[u8] {
        &self.last_sync_payload
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.global
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot_clients(&self) -> &[SlotClient] {
        &self.slot_clients
    }

    pub fn trait_data(&self) -> &BTreeMap<i32, String> {
        &self.trait_data
    }

    /// Captures the lobby as it was when the game started.
    pub fn start_game(&mut self, session: &Session) {
        self.clients_by_slot_index = session
            .slots
            .iter()
            .map(|s| {
                session
                    .client_in_slot(&s.player_reference)
                    .map_or(-1, |c| c.index)
            })
            .collect();

        self.global = session.global.clone();
        self.slots = session.slots.clone();
        self.slot_clients.clear();
        self.first_bot_slot_index = -1;

        for (index, slot) in session.slots.iter().enumerate() {
            let Some(client) = session.client_in_slot(&slot.player_reference) else {
                continue;
            };
            self.slot_clients
                .push(SlotClient::from_client(&slot.player_reference, client));

            if client.is_bot() && self.first_bot_slot_index < 0 {
                self.first_bot_slot_index = index as i32;
            }
        }
    }

    /// Records one packet delivered during play.
    pub fn dispatch_orders(&mut self, client: i32, frame: i32, payload: &[u8]) {
        match payload.first() {
            Some(&SYNC_TAG) => {
                if frame > self.last_sync_frame {
                    if payload.len() < 1 + SYNC_HASH_WIDTH
                        || (payload.len() - 1) % SYNC_HASH_WIDTH != 0
                    {
                        debug!(
                            "Dropped sync payload of length {} from client {} for frame {}",
                            payload.len(),
                            client,
                            frame
                        );
                        return;
                    }
                    self.last_sync_frame = frame;
                    self.last_sync_payload = payload.to_vec();
                }
                return;
            }
            Some(&IMMEDIATE_ORDER_TAG) => return,
            Some(&DISCONNECT_TAG) if payload.len() == 1 => return,
            _ => {}
        }

        // Late packets for frames already recorded are dropped; the save is best-effort.
        if frame <= 0 || frame < self.last_orders_frame {
            return;
        }

        let slot = match self.clients_by_slot_index.iter().position(|&c| c == client) {
            Some(slot) => slot as i32,
            // Orders from spectators are assumed to come from a bot's controller.
            // The wire format does not say which bot, so they all go to the first
            // bot slot. Good enough for skirmish saves with one human.
            None => self.first_bot_slot_index,
        };

        if slot < 0 {
            warn!(
                "Dropped orders from client {} for frame {}: client has no slot",
                client, frame
            );
            return;
        }

        if frame == self.last_orders_frame && !self.seen_at_last_frame.insert(slot) {
            return;
        }
        if frame > self.last_orders_frame {
            self.last_orders_frame = frame;
            self.seen_at_last_frame.clear();
            self.seen_at_last_frame.insert(slot);
        }

        self.orders_stream
            .extend_from_slice(&(payload.len() as i32 + ENTRY_HEADER).to_le_bytes());
        self.orders_stream.extend_from_slice(&frame.to_le_bytes());
        self.orders_stream.extend_from_slice(&slot.to_le_bytes());
        self.orders_stream.extend_from_slice(payload);
    }

    /// Decodes the raw order stream.
    pub fn entries(&self) -> Result<Vec<SaveEntry>, ProtocolError> {
        parse_entries(&self.orders_stream)
    }

    /// Replays a loaded save through `packet_fn(frame, client, payload)`.
    ///
    /// Trait data comes first so it is in place before any order needs it,
    /// then the order stream with slots mapped to the clients of `session`,
    /// and finally the last sync payload to validate the restore.
    pub fn parse_orders<F>(&self, session: &Session, mut packet_fn: F) -> Result<(), ProtocolError>
    where
        F: FnMut(i32, i32, &[u8]),
    {
        for (index, blob) in &self.trait_data {
            let order = Order::save_trait_data(*index, blob);
            packet_fn(0, 0, &order.to_bytes());
        }

        for entry in self.entries()? {
            let slot = usize::try_from(entry.slot)
                .ok()
                .and_then(|i| session.slots.get(i));
            let client = slot.and_then(|s| session.client_in_slot(&s.player_reference));

            let Some(client) = client else {
                warn!(
                    "Dropped saved orders for frame {}: no client in slot {}",
                    entry.frame, entry.slot
                );
                continue;
            };

            let client_index = if client.is_bot() {
                client.bot_controller_client_index
            } else {
                client.index
            };
            packet_fn(entry.frame, client_index, &entry.payload);
        }

        if !self.last_sync_payload.is_empty() {
            packet_fn(self.last_sync_frame, 0, &self.last_sync_payload);
        }
        Ok(())
    }

    pub fn add_trait_data(&mut self, index: i32, blob: impl Into<String>) {
        self.trait_data.insert(index, blob.into());
    }

    /// The `StartGame` order that resumes this save.
    pub fn start_game_order(&self) -> Order {
        Order::start_game(format!(
            "{}: {}\n{}: {}",
            SAVE_LAST_ORDERS_FRAME, self.last_orders_frame, SAVE_SYNC_FRAME, self.last_sync_frame
        ))
    }

    /// Restores the saved lobby layout onto a freshly joined session.
    ///
    /// Humans are matched to their saved slot by the slot they currently
    /// occupy; missing bots are re-added under the first human client.
    pub fn apply_to(&self, session: &mut Session) {
        session.global = self.global.clone();
        session.slots = self.slots.clone();

        let controller = session.non_bot_clients().map(|c| c.index).min().unwrap_or(0);
        let mut next_index = session.clients.iter().map(|c| c.index).max().unwrap_or(0) + 1;

        for slot_client in &self.slot_clients {
            let existing = session
                .clients
                .iter_mut()
                .find(|c| c.slot.as_deref() == Some(slot_client.slot.as_str()));

            match existing {
                Some(client) => slot_client.apply_to(client),
                None if slot_client.bot.is_some() => {
                    let mut bot = Client::new(next_index, "");
                    bot.bot_controller_client_index = controller;
                    slot_client.apply_to(&mut bot);
                    session.clients.push(bot);
                    next_index += 1;
                }
                None => warn!("Saved slot {} has no client to restore", slot_client.slot),
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProtocolError> {
        let mut file = BufWriter::new(File::create(path)?);
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<GameSave, ProtocolError> {
        let mut file = BufReader::new(File::open(path)?);
        GameSave::read_from(&mut file)
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        let metadata_offset = self.orders_stream.len() as i32;

        let mut metadata = Vec::new();
        metadata.write_i32::<LittleEndian>(METADATA_MARKER)?;
        metadata.write_i32::<LittleEndian>(self.last_orders_frame)?;
        metadata.write_i32::<LittleEndian>(self.last_sync_frame)?;
        write_byte_blob(&mut metadata, &self.last_sync_payload)?;

        let mut global = String::new();
        write_global(&mut global, &self.global);
        write_text_blob(&mut metadata, &global)?;

        let mut slots = String::new();
        for slot in &self.slots {
            write_slot(&mut slots, slot);
        }
        write_text_blob(&mut metadata, &slots)?;

        let mut slot_clients = String::new();
        for slot_client in &self.slot_clients {
            slot_client.write(&mut slot_clients);
        }
        write_text_blob(&mut metadata, &slot_clients)?;

        let trait_data_offset = metadata_offset + metadata.len() as i32;
        metadata.write_i32::<LittleEndian>(TRAIT_DATA_MARKER)?;
        metadata.write_i32::<LittleEndian>(self.trait_data.len() as i32)?;
        for (index, blob) in &self.trait_data {
            metadata.write_i32::<LittleEndian>(*index)?;
            write_text_blob(&mut metadata, blob)?;
        }

        metadata.write_i32::<LittleEndian>(metadata_offset)?;
        metadata.write_i32::<LittleEndian>(trait_data_offset)?;
        metadata.write_i32::<LittleEndian>(EOF_MARKER)?;

        w.write_all(&self.orders_stream)?;
        w.write_all(&metadata)?;
        Ok(())
    }

    pub fn read_from<R: Read + Seek>(r: &mut R) -> Result<GameSave, ProtocolError> {
        let invalid = |what: &str| ProtocolError::InvalidSave(what.to_string());

        let file_len = r.seek(SeekFrom::End(0))?;
        if file_len < 12 {
            return Err(invalid("file too short"));
        }
        r.seek(SeekFrom::End(-12))?;
        let metadata_offset = r.read_i32::<LittleEndian>()?;
        let trait_data_offset = r.read_i32::<LittleEndian>()?;
        if r.read_i32::<LittleEndian>()? != EOF_MARKER {
            return Err(invalid("missing end of file marker"));
        }

        let offsets_valid = metadata_offset >= 0
            && trait_data_offset > metadata_offset
            && (trait_data_offset as u64) < file_len - 12;
        if !offsets_valid {
            return Err(invalid("region offsets out of range"));
        }

        r.seek(SeekFrom::Start(metadata_offset as u64))?;
        if r.read_i32::<LittleEndian>()? != METADATA_MARKER {
            return Err(invalid("missing metadata marker"));
        }

        let mut save = GameSave::new();
        save.last_orders_frame = r.read_i32::<LittleEndian>()?;
        save.last_sync_frame = r.read_i32::<LittleEndian>()?;
        save.last_sync_payload = read_byte_blob(r, MAX_PACKET_SIZE)?;

        let global = read_text_blob(r, MAX_PACKET_SIZE)?;
        let sections = parse_sections(&global).map_err(to_save_error)?;
        let global_section = sections
            .iter()
            .find(|s| s.kind == "GlobalSettings")
            .ok_or_else(|| invalid("missing global settings"))?;
        save.global = read_global(global_section).map_err(to_save_error)?;

        let slots = read_text_blob(r, MAX_PACKET_SIZE)?;
        for section in parse_sections(&slots).map_err(to_save_error)? {
            save.slots.push(read_slot(&section).map_err(to_save_error)?);
        }

        let slot_clients = read_text_blob(r, MAX_PACKET_SIZE)?;
        for section in parse_sections(&slot_clients).map_err(to_save_error)? {
            save.slot_clients.push(SlotClient::read(&section)?);
        }

        if r.stream_position()? != trait_data_offset as u64 || r.read_i32::<LittleEndian>()? != TRAIT_DATA_MARKER {
            return Err(invalid("missing trait data marker"));
        }
        let count = r.read_i32::<LittleEndian>()?;
        if count < 0 {
            return Err(invalid("negative trait data count"));
        }
        for _ in 0..count {
            let index = r.read_i32::<LittleEndian>()?;
            let blob = read_text_blob(r, MAX_PACKET_SIZE)?;
            save.trait_data.insert(index, blob);
        }

        r.seek(SeekFrom::Start(0))?;
        let mut stream = vec![0u8; metadata_offset as usize];
        r.read_exact(&mut stream)?;
        save.orders_stream = stream;

        for entry in save.entries()? {
            if entry.frame == save.last_orders_frame {
                save.seen_at_last_frame.insert(entry.slot);
            }
        }

        Ok(save)
    }
}

fn to_save_error(e: ProtocolError) -> ProtocolError {
    match e {
        ProtocolError::InvalidSession(msg) => ProtocolError::InvalidSave(msg),
        other => other,
    }
}

fn parse_entries(stream: &[u8]) -> Result<Vec<SaveEntry>, ProtocolError> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    let read_at = |pos: usize| -> Result<i32, ProtocolError> {
        stream
            .get(pos..pos + 4)
            .map(LittleEndian::read_i32)
            .ok_or_else(|| ProtocolError::InvalidSave(format!("truncated order entry at {}", pos)))
    };

    while pos < stream.len() {
        let length = read_at(pos)?;
        if length < ENTRY_HEADER {
            return Err(ProtocolError::InvalidSave(format!(
                "order entry at {} has length {}",
                pos, length
            )));
        }
        let frame = read_at(pos + 4)?;
        let slot = read_at(pos + 8)?;
        let start = pos + 12;
        let end = start + (length - ENTRY_HEADER) as usize;
        let payload = stream.get(start..end).ok_or_else(|| {
            ProtocolError::InvalidSave(format!("truncated order payload at {}", start))
        })?;

        entries.push(SaveEntry {
            frame,
            slot,
            payload: payload.to_vec(),
        });
        pos = end;
    }
    Ok(entries)
}
