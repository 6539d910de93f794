//! The per-client lockstep scheduler.
//!
//! Each real-time tick the host calls [`OrderManager::tick_immediate`] to
//! exchange packets, and, whenever [`OrderManager::is_ready_for_next_frame`]
//! holds, [`OrderManager::tick`] to advance the simulation by one frame.
//!
//! Local orders are scheduled `frames_ahead` frames into the future so the
//! other clients' packets for a frame have usually arrived by the time it is
//! due. After applying a frame every client broadcasts the simulation hash
//! sampled before the frame and after each order; comparing those packets is
//! how a desync is caught and pinned on a specific order.

use log::{debug, error, info, warn};
use shared::game_save::ResumeFrames;
use shared::order::{decode_orders, SAVE_TRAIT_DATA, START_GAME, SYNC_INFO};
use shared::packet::{
    classify, is_valid_sync_packet, packet_payload, sync_payload, with_frame, PacketKind,
};
use shared::{ClientState, GameSave, Order, Session, SYNC_HASH_WIDTH, SYNC_HEADER_SIZE};
use std::collections::BTreeMap;

use crate::connection::{Connection, ConnectionState};
use crate::error::{DesyncKind, LockstepError};
use crate::frame_data::FrameData;
use crate::sync_report::SyncReport;
use crate::world::Simulation;

/// Frames of sync and order history kept behind the look-ahead window, so a
/// lagging peer's sync packet can still be compared and pinned on an order.
const SYNC_HISTORY_FRAMES: i32 = 32;

pub struct OrderManager {
    connection: Box<dyn Connection>,
    session: Session,
    frame_data: FrameData,

    local_orders: Vec<Order>,
    local_immediate_orders: Vec<Order>,

    sync_for_frame: BTreeMap<i32, Vec<u8>>,
    out_of_sync_frame: Option<i32>,

    net_frame_number: i32,
    frames_ahead: i32,
    game_started: bool,

    game_save: Option<GameSave>,
    /// Frames already covered by a resumed save; local sends are suppressed.
    game_save_last_frame: i32,
    game_save_last_sync_frame: i32,

    sync_report: SyncReport,
    generate_sync_report: bool,
}

impl OrderManager {
    pub fn new(session: Session, connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            session,
            frame_data: FrameData::new(),
            local_orders: Vec::new(),
            local_immediate_orders: Vec::new(),
            sync_for_frame: BTreeMap::new(),
            out_of_sync_frame: None,
            net_frame_number: 0,
            frames_ahead: 0,
            game_started: false,
            game_save: None,
            game_save_last_frame: -1,
            game_save_last_sync_frame: -1,
            sync_report: SyncReport::new(),
            generate_sync_report: false,
        }
    }

    /// Records every dispatched packet into `save` from now on.
    pub fn attach_game_save(&mut self, save: GameSave) {
        self.game_save = Some(save);
    }

    pub fn game_save(&self) -> Option<&GameSave> {
        self.game_save.as_ref()
    }

    pub fn take_game_save(&mut self) -> Option<GameSave> {
        self.game_save.take()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn frame_data(&self) -> &FrameData {
        &self.frame_data
    }

    pub fn sync_report(&self) -> &SyncReport {
        &self.sync_report
    }

    pub fn local_client_id(&self) -> i32 {
        self.connection.local_client_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.connection_state()
    }

    /// The next frame to be simulated.
    pub fn net_frame_number(&self) -> i32 {
        self.net_frame_number
    }

    pub fn frames_ahead(&self) -> i32 {
        self.frames_ahead
    }

    pub fn is_game_started(&self) -> bool {
        self.game_started
    }

    pub fn out_of_sync_frame(&self) -> Option<i32> {
        self.out_of_sync_frame
    }

    pub fn issue_order(&mut self, order: Order) {
        if order.is_immediate {
            self.local_immediate_orders.push(order);
        } else {
            self.local_orders.push(order);
        }
    }

    pub fn issue_orders(&mut self, orders: impl IntoIterator<Item = Order>) {
        for order in orders {
            self.issue_order(order);
        }
    }

    /// Starts the lockstep schedule and seeds the look-ahead window with
    /// empty frames. Does nothing once started.
    pub fn start_game(&mut self) -> Result<(), LockstepError> {
        if self.game_started {
            return Ok(());
        }

        self.game_started = true;
        self.net_frame_number = 1;
        self.frames_ahead = self.session.global.order_latency.max(1);
        self.generate_sync_report = self.session.global.enable_sync_reports;

        let clients: Vec<i32> = self.session.non_bot_clients().map(|c| c.index).collect();
        for client in &clients {
            self.frame_data.add_client(*client);
        }
        info!(
            "Game started with clients {:?}, {} frames ahead",
            clients, self.frames_ahead
        );

        for frame in 1..=self.frames_ahead {
            if frame > self.game_save_last_frame {
                self.connection.send(frame, &[])?;
            }
        }
        Ok(())
    }

    pub fn is_ready_for_next_frame(&self) -> bool {
        self.game_started
            && self.out_of_sync_frame.is_none()
            && self.frame_data.is_ready_for_frame(self.net_frame_number)
    }

    /// Exchanges packets with the connection. Runs every real-time tick,
    /// whether or not the next frame is ready.
    pub fn tick_immediate(&mut self, world: &mut dyn Simulation) -> Result<(), LockstepError> {
        let covered_by_save =
            self.game_save_last_frame >= self.net_frame_number + self.frames_ahead;
        if !self.local_immediate_orders.is_empty() && !covered_by_save {
            let orders = std::mem::take(&mut self.local_immediate_orders);
            self.connection.send_immediate(&orders)?;
        }

        for received in self.connection.receive() {
            self.route_packet(world, received.from, &received.packet)?;
        }
        Ok(())
    }

    /// Advances the simulation by one frame.
    pub fn tick(&mut self, world: &mut dyn Simulation) -> Result<(), LockstepError> {
        if !self.is_ready_for_next_frame() {
            return Err(LockstepError::NotReady {
                frame: self.net_frame_number,
            });
        }

        let frame = self.net_frame_number;
        let orders = std::mem::take(&mut self.local_orders);
        if frame + self.frames_ahead > self.game_save_last_frame {
            self.connection.send(frame + self.frames_ahead, &orders)?;
        }

        let frame_orders = self.frame_data.orders_for_frame(frame);
        let mut hashes = Vec::with_capacity(frame_orders.len() + 1);
        hashes.push(world.sync_hash());
        for co in &frame_orders {
            self.handle_order(world, co.client, &co.order)?;
            hashes.push(world.sync_hash());
        }

        // Includes the saved sync frame, which is checked against the save.
        if frame >= self.game_save_last_sync_frame {
            self.connection.send_sync(frame, &sync_payload(&hashes))?;
        }

        if self.generate_sync_report {
            self.sync_report.update(frame, world, &frame_orders);
        }

        self.net_frame_number += 1;
        self.prune_history();
        Ok(())
    }

    /// Oldest frame whose sync packets are still compared.
    fn oldest_tracked_frame(&self) -> i32 {
        self.net_frame_number - self.frames_ahead - SYNC_HISTORY_FRAMES
    }

    fn prune_history(&mut self) {
        let oldest = self.oldest_tracked_frame();
        if oldest <= 1 {
            return;
        }
        self.sync_for_frame = self.sync_for_frame.split_off(&oldest);
        self.frame_data.discard_before(oldest);
    }

    /// Restores a saved game: lobby layout, trait data and the recorded
    /// order stream, then starts the game past the saved frames.
    pub fn resume(
        &mut self,
        world: &mut dyn Simulation,
        save: GameSave,
    ) -> Result<(), LockstepError> {
        save.apply_to(&mut self.session);

        let mut packets = Vec::new();
        save.parse_orders(&self.session, |frame, client, payload| {
            packets.push((client, with_frame(frame, payload)));
        })?;

        let start = save.start_game_order();
        self.game_save = Some(save);
        self.handle_order(world, 0, &start)?;

        for (client, packet) in packets {
            self.route_packet(world, client, &packet)?;
        }
        Ok(())
    }

    /// Routes one received packet. Immediate orders are applied on the spot
    /// so a `StartGame` takes effect before the frames that follow it.
    fn route_packet(
        &mut self,
        world: &mut dyn Simulation,
        from: i32,
        packet: &[u8],
    ) -> Result<(), LockstepError> {
        let kind = match classify(packet) {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Dropping packet from client {}: {}", from, e);
                return Ok(());
            }
        };
        let payload = packet_payload(packet);

        if let Some(save) = self.game_save.as_mut() {
            let frame = match kind {
                PacketKind::Quit { last_frame } => last_frame,
                PacketKind::Sync { frame } | PacketKind::Orders { frame } => frame,
                PacketKind::Immediate => 0,
            };
            save.dispatch_orders(from, frame, payload);
        }

        match kind {
            PacketKind::Quit { last_frame } => {
                info!("Client {} left after frame {}", from, last_frame);
                self.frame_data.client_quit(from, last_frame);
                if let Some(client) = self.session.client_with_index_mut(from) {
                    client.state = ClientState::Disconnected;
                }
            }
            PacketKind::Sync { frame } => self.check_sync(from, frame, packet)?,
            PacketKind::Immediate => {
                for order in decode_orders(from, 0, payload) {
                    self.handle_order(world, from, &order)?;
                }
            }
            PacketKind::Orders { frame } => {
                self.frame_data
                    .add_frame_orders(from, frame, payload.to_vec());
            }
        }
        Ok(())
    }

    /// Entry point for every order that reaches the simulation, scheduled or
    /// immediate. Lobby control orders are handled here first.
    fn handle_order(
        &mut self,
        world: &mut dyn Simulation,
        client: i32,
        order: &Order,
    ) -> Result<(), LockstepError> {
        if order.is_immediate {
            let data = order.target_string.as_deref().unwrap_or("");
            match order.order_string.as_str() {
                SYNC_INFO => {
                    self.session = Session::from_text(data)?;
                    debug!("Session updated by client {}", client);
                }
                START_GAME => {
                    let frames = ResumeFrames::parse(data);
                    if let Some(frame) = frames.last_orders_frame {
                        self.game_save_last_frame = frame;
                    }
                    if let Some(frame) = frames.last_sync_frame {
                        self.game_save_last_sync_frame = frame;
                    }
                    if let Some(save) = self.game_save.as_mut() {
                        save.start_game(&self.session);
                    }
                    self.start_game()?;
                }
                SAVE_TRAIT_DATA => match (order.trait_data(), self.game_save.as_mut()) {
                    (Some((index, blob)), Some(save)) => save.add_trait_data(index, blob),
                    (None, _) => warn!("Malformed trait data from client {}", client),
                    _ => {}
                },
                _ => {}
            }
        }

        world.process_order(&self.session, client, order);
        Ok(())
    }

    fn check_sync(&mut self, from: i32, frame: i32, packet: &[u8]) -> Result<(), LockstepError> {
        if !is_valid_sync_packet(packet) {
            warn!(
                "Dropping malformed sync packet of {} bytes from client {} for frame {}",
                packet.len(),
                from,
                frame
            );
            return Ok(());
        }
        if frame < self.oldest_tracked_frame() {
            debug!("Ignoring sync from client {} for old frame {}", from, frame);
            return Ok(());
        }

        let Some(existing) = self.sync_for_frame.get(&frame) else {
            self.sync_for_frame.insert(frame, packet.to_vec());
            return Ok(());
        };
        if existing.as_slice() == packet {
            return Ok(());
        }

        let kind = if existing.len() != packet.len() {
            DesyncKind::Length
        } else {
            let index = existing
                .iter()
                .zip(packet)
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            if index < SYNC_HEADER_SIZE {
                DesyncKind::Tick
            } else {
                let order_index = (index - SYNC_HEADER_SIZE) / SYNC_HASH_WIDTH;
                DesyncKind::Order {
                    index: order_index,
                    culprit: self
                        .frame_data
                        .orders_for_frame(frame)
                        .into_iter()
                        .nth(order_index),
                }
            }
        };

        self.out_of_sync_frame = Some(frame);
        error!(
            "Out of sync in frame {} (packet from client {}): {}",
            frame, from, kind
        );
        self.sync_report.dump(frame);
        Err(LockstepError::Desync { frame, kind })
    }
}

impl Drop for OrderManager {
    fn drop(&mut self) {
        self.connection.close();
    }
}
