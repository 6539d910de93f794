//! Per-frame buffering of every client's order payload.

use log::warn;
use shared::order::decode_orders;
use shared::ClientOrder;
use std::collections::BTreeMap;

/// Orders received for upcoming frames, keyed by frame then client.
///
/// BTreeMaps keep client iteration in ascending id order, which is the
/// order every peer applies simultaneous orders in.
#[derive(Debug, Default)]
pub struct FrameData {
    frames: BTreeMap<i32, BTreeMap<i32, Vec<u8>>>,
    /// Last frame each client takes part in; `i32::MAX` while playing.
    client_quit_times: BTreeMap<i32, i32>,
}

impl FrameData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client that plays until it quits.
    pub fn add_client(&mut self, client: i32) {
        self.client_quit_times.entry(client).or_insert(i32::MAX);
    }

    pub fn add_frame_orders(&mut self, client: i32, frame: i32, payload: Vec<u8>) {
        let clients = self.frames.entry(frame).or_default();
        if clients.contains_key(&client) {
            warn!(
                "Ignoring duplicate orders from client {} for frame {}",
                client, frame
            );
            return;
        }
        clients.insert(client, payload);
    }

    pub fn client_quit(&mut self, client: i32, last_frame: i32) {
        self.client_quit_times.insert(client, last_frame);
    }

    /// Drops the buffered payloads of every frame before `frame`.
    pub fn discard_before(&mut self, frame: i32) {
        self.frames = self.frames.split_off(&frame);
    }

    /// Number of frames with at least one buffered payload.
    pub fn buffered_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn clients_playing_in_frame(&self, frame: i32) -> Vec<i32> {
        self.client_quit_times
            .iter()
            .filter(|&(_, &quit)| quit >= frame)
            .map(|(&client, _)| client)
            .collect()
    }

    pub fn clients_not_ready_for_frame(&self, frame: i32) -> Vec<i32> {
        let buffered = self.frames.get(&frame);
        self.clients_playing_in_frame(frame)
            .into_iter()
            .filter(|client| !buffered.is_some_and(|b| b.contains_key(client)))
            .collect()
    }

    pub fn is_ready_for_frame(&self, frame: i32) -> bool {
        self.clients_not_ready_for_frame(frame).is_empty()
    }

    /// Decodes the frame's orders, client by client in ascending id order.
    ///
    /// Payloads from clients that already quit are ignored.
    pub fn orders_for_frame(&self, frame: i32) -> Vec<ClientOrder> {
        let Some(buffered) = self.frames.get(&frame) else {
            return Vec::new();
        };

        let mut orders = Vec::new();
        for client in self.clients_playing_in_frame(frame) {
            let Some(payload) = buffered.get(&client) else {
                continue;
            };
            orders.extend(
                decode_orders(client, frame, payload)
                    .into_iter()
                    .map(|order| ClientOrder { client, order }),
            );
        }
        orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::order::encode_orders;
    use shared::Order;

    fn payload(names: &[&str]) -> Vec<u8> {
        let orders: Vec<Order> = names.iter().map(|n| Order::new(*n, None)).collect();
        encode_orders(&orders)
    }

    #[test]
    fn test_ready_when_all_playing_clients_contributed() {
        let mut data = FrameData::new();
        data.add_client(1);
        data.add_client(2);

        data.add_frame_orders(2, 5, payload(&["A"]));
        assert!(!data.is_ready_for_frame(5));
        assert_eq!(data.clients_not_ready_for_frame(5), vec![1]);

        data.add_frame_orders(1, 5, Vec::new());
        assert!(data.is_ready_for_frame(5));

        // Readiness never goes away
        data.add_frame_orders(1, 5, payload(&["late"]));
        data.add_frame_orders(3, 5, payload(&["stranger"]));
        assert!(data.is_ready_for_frame(5));
    }

    #[test]
    fn test_quit_client_scenario() {
        let mut data = FrameData::new();
        data.add_client(1);
        data.add_client(2);
        data.client_quit(2, 97);

        assert_eq!(data.clients_playing_in_frame(97), vec![1, 2]);
        assert_eq!(data.clients_playing_in_frame(98), vec![1]);

        data.add_frame_orders(1, 98, Vec::new());
        assert!(data.is_ready_for_frame(98));
    }

    #[test]
    fn test_discard_before_keeps_later_frames() {
        let mut data = FrameData::new();
        data.add_client(1);
        for frame in 1..=10 {
            data.add_frame_orders(1, frame, payload(&["A"]));
        }

        data.discard_before(8);
        assert_eq!(data.buffered_frames(), 3);
        assert!(data.orders_for_frame(7).is_empty());
        assert_eq!(data.orders_for_frame(8).len(), 1);
        assert!(data.is_ready_for_frame(10));
    }

    #[test]
    fn test_orders_in_ascending_client_order() {
        let feed = [
            (3, payload(&["C1", "C2"])),
            (1, payload(&["A1"])),
            (2, payload(&[])),
        ];

        let mut forward = FrameData::new();
        let mut backward = FrameData::new();
        for client in [1, 2, 3] {
            forward.add_client(client);
            backward.add_client(client);
        }
        for (client, p) in feed.iter() {
            forward.add_frame_orders(*client, 7, p.clone());
        }
        for (client, p) in feed.iter().rev() {
            backward.add_frame_orders(*client, 7, p.clone());
        }

        let orders = forward.orders_for_frame(7);
        let summary: Vec<(i32, &str)> = orders
            .iter()
            .map(|co| (co.client, co.order.order_string.as_str()))
            .collect();
        assert_eq!(summary, vec![(1, "A1"), (3, "C1"), (3, "C2")]);
        assert_eq!(orders, backward.orders_for_frame(7));
    }

    #[test]
    fn test_undecodable_tail_skipped() {
        let mut data = FrameData::new();
        data.add_client(1);
        data.add_client(2);

        let mut broken = payload(&["ok"]);
        broken.push(0x33);
        data.add_frame_orders(1, 2, broken);
        data.add_frame_orders(2, 2, payload(&["fine"]));

        let names: Vec<String> = data
            .orders_for_frame(2)
            .into_iter()
            .map(|co| co.order.order_string)
            .collect();
        assert_eq!(names, vec!["ok", "fine"]);
    }
}
