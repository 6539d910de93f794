//! Lobby state and its line-oriented text format.
//!
//! ```text
//! Client@1:
//! 	Name: Alice
//! 	Slot: Multi0
//! Slot@Multi0:
//! 	AllowBots: True
//! GlobalSettings:
//! 	Map: desert
//! 	Mods: ra,common
//! ```
//!
//! Top-level lines name a section, optionally with an `@` argument. Child
//! lines are indented by one tab and hold `Key: Value`. Unknown keys are
//! ignored so newer lobbies can still be read.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::DEFAULT_ORDER_LATENCY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClientState {
    NotReady,
    #[default]
    Invalid,
    Ready,
    Disconnected,
}

impl ClientState {
    fn as_str(&self) -> &'static str {
        match self {
            ClientState::NotReady => "NotReady",
            ClientState::Invalid => "Invalid",
            ClientState::Ready => "Ready",
            ClientState::Disconnected => "Disconnected",
        }
    }
}

impl FromStr for ClientState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotReady" => Ok(ClientState::NotReady),
            "Invalid" => Ok(ClientState::Invalid),
            "Ready" => Ok(ClientState::Ready),
            "Disconnected" => Ok(ClientState::Disconnected),
            other => Err(ProtocolError::InvalidSession(format!(
                "unknown client state '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Client {
    pub index: i32,
    /// RGB, written as six hex digits.
    pub color: u32,
    pub preferred_color: u32,
    pub name: String,
    pub team: i32,
    /// Player reference of the occupied slot; `None` for spectators.
    pub slot: Option<String>,
    pub state: ClientState,
    /// Bot type; `None` for human clients.
    pub bot: Option<String>,
    /// The human client that added this bot and sends its orders.
    pub bot_controller_client_index: i32,
}

impl Client {
    pub fn new(index: i32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_bot(&self) -> bool {
        self.bot.is_some()
    }

    pub fn is_observer(&self) -> bool {
        self.slot.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Slot {
    pub player_reference: String,
    pub closed: bool,
    pub allow_bots: bool,
    pub lock_team: bool,
    pub required: bool,
}

impl Slot {
    pub fn new(player_reference: impl Into<String>) -> Self {
        Self {
            player_reference: player_reference.into(),
            allow_bots: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub server_name: String,
    pub map: String,
    pub mods: Vec<String>,
    /// Frames of look-ahead applied to locally issued orders.
    pub order_latency: i32,
    pub random_seed: i32,
    pub lock_teams: bool,
    pub allow_cheats: bool,
    pub enable_sync_reports: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            map: String::new(),
            mods: Vec::new(),
            order_latency: DEFAULT_ORDER_LATENCY,
            random_seed: 0,
            lock_teams: false,
            allow_cheats: false,
            enable_sync_reports: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Session {
    pub clients: Vec<Client>,
    pub slots: Vec<Slot>,
    pub global: GlobalSettings,
}

impl Session {
    pub fn client_with_index(&self, index: i32) -> Option<&Client> {
        self.clients.iter().find(|c| c.index == index)
    }

    pub fn client_with_index_mut(&mut self, index: i32) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.index == index)
    }

    pub fn client_in_slot(&self, player_reference: &str) -> Option<&Client> {
        self.clients
            .iter()
            .find(|c| c.slot.as_deref() == Some(player_reference))
    }

    pub fn slot_index(&self, player_reference: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.player_reference == player_reference)
    }

    pub fn non_bot_clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter().filter(|c| !c.is_bot())
    }

    pub fn first_empty_slot(&self) -> Option<&str> {
        self.slots
            .iter()
            .find(|s| !s.closed && self.client_in_slot(&s.player_reference).is_none())
            .map(|s| s.player_reference.as_str())
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for client in &self.clients {
            write_client(&mut out, &format!("Client@{}", client.index), client);
        }
        for slot in &self.slots {
            write_slot(&mut out, slot);
        }
        write_global(&mut out, &self.global);
        out
    }

    pub fn from_text(text: &str) -> Result<Session, ProtocolError> {
        let mut session = Session::default();
        for section in parse_sections(text)? {
            match section.kind.as_str() {
                "Client" => session.clients.push(read_client(&section)?),
                "Slot" => session.slots.push(read_slot(&section)?),
                "GlobalSettings" => session.global = read_global(&section)?,
                _ => {}
            }
        }
        Ok(session)
    }
}

/// One top-level block of the text format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: String,
    pub arg: Option<String>,
    pub fields: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ProtocolError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| {
                ProtocolError::InvalidSession(format!(
                    "{}: invalid value '{}' for {}",
                    self.kind, v, key
                ))
            }),
        }
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ProtocolError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) if v.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(v) if v.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(v) => Err(ProtocolError::InvalidSession(format!(
                "{}: invalid boolean '{}' for {}",
                self.kind, v, key
            ))),
        }
    }

    fn parse_color(&self, key: &str) -> Result<Option<u32>, ProtocolError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => u32::from_str_radix(v, 16).map(Some).map_err(|_| {
                ProtocolError::InvalidSession(format!("{}: invalid color '{}'", self.kind, v))
            }),
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).map(str::to_string)
    }
}

/// Splits text into sections, rejecting lines that fit neither form.
pub fn parse_sections(text: &str) -> Result<Vec<Section>, ProtocolError> {
    let mut sections: Vec<Section> = Vec::new();
    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        if let Some(child) = line.strip_prefix('\t') {
            let section = sections.last_mut().ok_or_else(|| {
                ProtocolError::InvalidSession(format!(
                    "line {}: field outside of a section",
                    number + 1
                ))
            })?;
            let (key, value) = child.split_once(':').ok_or_else(|| {
                ProtocolError::InvalidSession(format!("line {}: expected 'Key: Value'", number + 1))
            })?;
            section
                .fields
                .push((key.trim().to_string(), value.trim().to_string()));
            continue;
        }

        let header = line.trim_end().strip_suffix(':').ok_or_else(|| {
            ProtocolError::InvalidSession(format!(
                "line {}: section header must end with ':'",
                number + 1
            ))
        })?;
        let (kind, arg) = match header.split_once('@') {
            Some((kind, arg)) => (kind.to_string(), Some(arg.to_string())),
            None => (header.to_string(), None),
        };
        sections.push(Section {
            kind,
            arg,
            fields: Vec::new(),
        });
    }
    Ok(sections)
}

fn push_field(out: &mut String, key: &str, value: impl std::fmt::Display) {
    // Values are single-line
    let value = value.to_string().replace(['\n', '\r'], " ");
    let _ = writeln!(out, "\t{}: {}", key, value);
}

fn bool_text(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

pub(crate) fn write_client(out: &mut String, header: &str, client: &Client) {
    let _ = writeln!(out, "{}:", header);
    push_field(out, "Index", client.index);
    push_field(out, "Name", &client.name);
    push_field(out, "Color", format!("{:06X}", client.color));
    push_field(out, "PreferredColor", format!("{:06X}", client.preferred_color));
    push_field(out, "Team", client.team);
    if let Some(slot) = &client.slot {
        push_field(out, "Slot", slot);
    }
    push_field(out, "State", client.state.as_str());
    if let Some(bot) = &client.bot {
        push_field(out, "Bot", bot);
    }
    push_field(out, "BotControllerClientIndex", client.bot_controller_client_index);
}

pub(crate) fn read_client(section: &Section) -> Result<Client, ProtocolError> {
    let header_index = match &section.arg {
        Some(arg) => Some(arg.parse::<i32>().map_err(|_| {
            ProtocolError::InvalidSession(format!("invalid client index '{}'", arg))
        })?),
        None => None,
    };

    Ok(Client {
        index: section.parse("Index")?.or(header_index).unwrap_or_default(),
        color: section.parse_color("Color")?.unwrap_or_default(),
        preferred_color: section.parse_color("PreferredColor")?.unwrap_or_default(),
        name: section.get("Name").unwrap_or_default().to_string(),
        team: section.parse("Team")?.unwrap_or_default(),
        slot: section.string("Slot"),
        state: section.parse("State")?.unwrap_or_default(),
        bot: section.string("Bot"),
        bot_controller_client_index: section
            .parse("BotControllerClientIndex")?
            .unwrap_or_default(),
    })
}

pub(crate) fn write_slot(out: &mut String, slot: &Slot) {
    let _ = writeln!(out, "Slot@{}:", slot.player_reference);
    push_field(out, "PlayerReference", &slot.player_reference);
    push_field(out, "Closed", bool_text(slot.closed));
    push_field(out, "AllowBots", bool_text(slot.allow_bots));
    push_field(out, "LockTeam", bool_text(slot.lock_team));
    push_field(out, "Required", bool_text(slot.required));
}

pub(crate) fn read_slot(section: &Section) -> Result<Slot, ProtocolError> {
    let player_reference = section
        .string("PlayerReference")
        .or_else(|| section.arg.clone())
        .ok_or_else(|| ProtocolError::InvalidSession("slot without player reference".into()))?;

    Ok(Slot {
        player_reference,
        closed: section.parse_bool("Closed")?.unwrap_or(false),
        allow_bots: section.parse_bool("AllowBots")?.unwrap_or(true),
        lock_team: section.parse_bool("LockTeam")?.unwrap_or(false),
        required: section.parse_bool("Required")?.unwrap_or(false),
    })
}

pub(crate) fn write_global(out: &mut String, global: &GlobalSettings) {
    out.push_str("GlobalSettings:\n");
    push_field(out, "ServerName", &global.server_name);
    push_field(out, "Map", &global.map);
    push_field(out, "Mods", global.mods.join(","));
    push_field(out, "OrderLatency", global.order_latency);
    push_field(out, "RandomSeed", global.random_seed);
    push_field(out, "LockTeams", bool_text(global.lock_teams));
    push_field(out, "AllowCheats", bool_text(global.allow_cheats));
    push_field(out, "EnableSyncReports", bool_text(global.enable_sync_reports));
}

pub(crate) fn read_global(section: &Section) -> Result<GlobalSettings, ProtocolError> {
    let defaults = GlobalSettings::default();
    Ok(GlobalSettings {
        server_name: section.get("ServerName").unwrap_or_default().to_string(),
        map: section.get("Map").unwrap_or_default().to_string(),
        mods: section
            .get("Mods")
            .map(|m| {
                m.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        order_latency: section
            .parse("OrderLatency")?
            .unwrap_or(defaults.order_latency),
        random_seed: section.parse("RandomSeed")?.unwrap_or_default(),
        lock_teams: section.parse_bool("LockTeams")?.unwrap_or(false),
        allow_cheats: section.parse_bool("AllowCheats")?.unwrap_or(false),
        enable_sync_reports: section.parse_bool("EnableSyncReports")?.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        let mut alice = Client::new(1, "Alice");
        alice.slot = Some("Multi0".into());
        alice.color = 0xFF2010;
        alice.state = ClientState::Ready;

        let mut bot = Client::new(2, "Rush AI");
        bot.slot = Some("Multi1".into());
        bot.bot = Some("rush".into());
        bot.bot_controller_client_index = 1;

        let spectator = Client::new(3, "Bob");

        Session {
            clients: vec![alice, bot, spectator],
            slots: vec![Slot::new("Multi0"), Slot::new("Multi1"), Slot::new("Multi2")],
            global: GlobalSettings {
                server_name: "Test Server".into(),
                map: "desert-shellmap".into(),
                mods: vec!["ra".into(), "common".into()],
                order_latency: 4,
                random_seed: -12345,
                lock_teams: true,
                allow_cheats: false,
                enable_sync_reports: true,
            },
        }
    }

    #[test]
    fn test_text_round_trip() {
        let session = sample_session();
        let text = session.to_text();
        let decoded = Session::from_text(&text).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn test_text_layout() {
        let text = sample_session().to_text();
        assert!(text.starts_with("Client@1:\n\tIndex: 1\n"));
        assert!(text.contains("Slot@Multi1:\n"));
        assert!(text.contains("\tMods: ra,common\n"));
        assert!(text.contains("\tColor: FF2010\n"));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let text = "GlobalSettings:\n\tMap: arena\n\tFancyNewOption: 7\nLobbyOptions@crates:\n\tValue: True\n";
        let session = Session::from_text(text).unwrap();
        assert_eq!(session.global.map, "arena");
        assert_eq!(session.global.order_latency, DEFAULT_ORDER_LATENCY);
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(matches!(
            Session::from_text("\tMap: arena\n"),
            Err(ProtocolError::InvalidSession(_))
        ));
        assert!(matches!(
            Session::from_text("GlobalSettings\n"),
            Err(ProtocolError::InvalidSession(_))
        ));
        assert!(matches!(
            Session::from_text("GlobalSettings:\n\tOrderLatency: soon\n"),
            Err(ProtocolError::InvalidSession(_))
        ));
    }

    #[test]
    fn test_helpers() {
        let session = sample_session();
        assert_eq!(session.client_with_index(2).unwrap().name, "Rush AI");
        assert_eq!(session.client_in_slot("Multi0").unwrap().index, 1);
        assert_eq!(session.slot_index("Multi1"), Some(1));
        assert_eq!(session.first_empty_slot(), Some("Multi2"));

        let humans: Vec<i32> = session.non_bot_clients().map(|c| c.index).collect();
        assert_eq!(humans, vec![1, 3]);
        assert!(session.client_with_index(3).unwrap().is_observer());
    }
}
