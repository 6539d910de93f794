//! Player commands and their self-describing byte encoding.

use log::warn;
use serde::{Deserialize, Serialize};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::error::ProtocolError;
use crate::io::{read_string, write_string};
use crate::{IMMEDIATE_ORDER_TAG, ORDER_TAG};

pub type ActorId = u32;

/// Subject id written when an order has no subject actor.
const NO_SUBJECT: u32 = 0xFFFF_FFFF;

const FIELD_TARGET_ACTOR: u8 = 0x01;
const FIELD_TARGET_LOCATION: u8 = 0x02;
const FIELD_TARGET_STRING: u8 = 0x04;
const FIELD_QUEUED: u8 = 0x08;

pub const SYNC_INFO: &str = "SyncInfo";
pub const START_GAME: &str = "StartGame";
pub const SAVE_TRAIT_DATA: &str = "SaveTraitData";
pub const CHAT: &str = "Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellPos {
    pub x: i32,
    pub y: i32,
}

impl CellPos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// An immutable command issued by a player or the lobby.
///
/// Builder methods consume the order, so nothing can change it after it has
/// been queued for sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_string: String,
    pub subject: Option<ActorId>,
    pub target_actor: Option<ActorId>,
    pub target_location: Option<CellPos>,
    pub target_string: Option<String>,
    pub queued: bool,
    pub is_immediate: bool,
}

impl Order {
    pub fn new(order_string: impl Into<String>, subject: Option<ActorId>) -> Self {
        Self {
            order_string: order_string.into(),
            subject,
            target_actor: None,
            target_location: None,
            target_string: None,
            queued: false,
            is_immediate: false,
        }
    }

    /// An order delivered outside the frame schedule, carrying a data string.
    pub fn immediate(order_string: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            target_string: Some(data.into()),
            is_immediate: true,
            ..Self::new(order_string, None)
        }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::immediate(CHAT, text)
    }

    /// Carries a serialized `Session` that replaces the receiver's lobby state.
    pub fn sync_info(session_text: impl Into<String>) -> Self {
        Self::immediate(SYNC_INFO, session_text)
    }

    pub fn start_game(data: impl Into<String>) -> Self {
        Self::immediate(START_GAME, data)
    }

    /// Restores one simulation-side trait snapshot; data is `"<index>\n<blob>"`.
    pub fn save_trait_data(index: i32, blob: &str) -> Self {
        Self::immediate(SAVE_TRAIT_DATA, format!("{}\n{}", index, blob))
    }

    pub fn with_target_actor(mut self, actor: ActorId) -> Self {
        self.target_actor = Some(actor);
        self
    }

    pub fn with_target_location(mut self, location: CellPos) -> Self {
        self.target_location = Some(location);
        self
    }

    pub fn with_target_string(mut self, target: impl Into<String>) -> Self {
        self.target_string = Some(target.into());
        self
    }

    pub fn queued(mut self, queued: bool) -> Self {
        self.queued = queued;
        self
    }

    /// Splits a `SaveTraitData` payload back into its index and blob.
    pub fn trait_data(&self) -> Option<(i32, &str)> {
        if self.order_string != SAVE_TRAIT_DATA {
            return None;
        }
        let data = self.target_string.as_deref()?;
        let (index, blob) = data.split_once('\n')?;
        Some((index.trim().parse().ok()?, blob))
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<(), ProtocolError> {
        if self.is_immediate {
            w.write_u8(IMMEDIATE_ORDER_TAG)?;
            write_string(w, &self.order_string)?;
            write_string(w, self.target_string.as_deref().unwrap_or(""))?;
            return Ok(());
        }

        w.write_u8(ORDER_TAG)?;
        write_string(w, &self.order_string)?;
        w.write_u32::<LittleEndian>(self.subject.unwrap_or(NO_SUBJECT))?;

        let mut fields = 0u8;
        if self.target_actor.is_some() {
            fields |= FIELD_TARGET_ACTOR;
        }
        if self.target_location.is_some() {
            fields |= FIELD_TARGET_LOCATION;
        }
        if self.target_string.is_some() {
            fields |= FIELD_TARGET_STRING;
        }
        if self.queued {
            fields |= FIELD_QUEUED;
        }
        w.write_u8(fields)?;

        if let Some(actor) = self.target_actor {
            w.write_u32::<LittleEndian>(actor)?;
        }
        if let Some(location) = self.target_location {
            w.write_i32::<LittleEndian>(location.x)?;
            w.write_i32::<LittleEndian>(location.y)?;
        }
        if let Some(target) = &self.target_string {
            write_string(w, target)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.order_string.len());
        // Writes into a Vec do not fail.
        let _ = self.write_to(&mut buf);
        buf
    }

    pub fn read_from(r: &mut impl Read) -> Result<Order, ProtocolError> {
        match r.read_u8()? {
            ORDER_TAG => {
                let order_string = read_string(r)?;
                let subject = match r.read_u32::<LittleEndian>()? {
                    NO_SUBJECT => None,
                    id => Some(id),
                };
                let fields = r.read_u8()?;

                let target_actor = if fields & FIELD_TARGET_ACTOR != 0 {
                    Some(r.read_u32::<LittleEndian>()?)
                } else {
                    None
                };
                let target_location = if fields & FIELD_TARGET_LOCATION != 0 {
                    let x = r.read_i32::<LittleEndian>()?;
                    let y = r.read_i32::<LittleEndian>()?;
                    Some(CellPos::new(x, y))
                } else {
                    None
                };
                let target_string = if fields & FIELD_TARGET_STRING != 0 {
                    Some(read_string(r)?)
                } else {
                    None
                };

                Ok(Order {
                    order_string,
                    subject,
                    target_actor,
                    target_location,
                    target_string,
                    queued: fields & FIELD_QUEUED != 0,
                    is_immediate: false,
                })
            }
            IMMEDIATE_ORDER_TAG => {
                let name = read_string(r)?;
                let data = read_string(r)?;
                Ok(Order::immediate(name, data))
            }
            other => Err(ProtocolError::UnknownOrderType(other)),
        }
    }
}

/// Concatenates orders into one frame payload.
pub fn encode_orders<'a>(orders: impl IntoIterator<Item = &'a Order>) -> Vec<u8> {
    let mut buf = Vec::new();
    for order in orders {
        let _ = order.write_to(&mut buf);
    }
    buf
}

/// Iterates the orders packed in a payload.
///
/// Yields an error once and then stops: a broken order leaves no way to find
/// where the next one starts.
pub struct OrderReader<'a> {
    cursor: Cursor<&'a [u8]>,
    failed: bool,
}

impl<'a> OrderReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(payload),
            failed: false,
        }
    }
}

impl Iterator for OrderReader<'_> {
    type Item = Result<Order, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor.position() as usize >= self.cursor.get_ref().len() {
            return None;
        }
        let result = Order::read_from(&mut self.cursor);
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Decodes every order in a payload, logging and skipping the undecodable tail.
pub fn decode_orders(client: i32, frame: i32, payload: &[u8]) -> Vec<Order> {
    let mut orders = Vec::new();
    for result in OrderReader::new(payload) {
        match result {
            Ok(order) => orders.push(order),
            Err(e) => warn!(
                "Dropping rest of payload from client {} for frame {}: {}",
                client, frame, e
            ),
        }
    }
    orders
}

/// An order tagged with the client that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOrder {
    pub client: i32,
    pub order: Order,
}
