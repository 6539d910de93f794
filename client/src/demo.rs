//! A tiny deterministic world for the headless client: one unit per player
//! wandering a grid and occasionally fighting.

use client::{RandomState, Simulation, TraitReport};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::order::{CHAT, START_GAME};
use shared::{CellPos, Order, Session};
use std::collections::BTreeMap;

pub const JOIN: &str = "Join";
pub const MOVE: &str = "Move";
pub const ATTACK: &str = "Attack";

const MAP_SIZE: i32 = 64;
const MAX_HEALTH: i32 = 100;

#[derive(Debug, Clone)]
struct Unit {
    owner: i32,
    position: CellPos,
    health: i32,
}

pub struct DemoWorld {
    rng: StdRng,
    random_count: i32,
    last_random: i32,
    units: BTreeMap<u32, Unit>,
    joined: Vec<(i32, String)>,
}

impl Default for DemoWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoWorld {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(0),
            random_count: 0,
            last_random: 0,
            units: BTreeMap::new(),
            joined: Vec::new(),
        }
    }

    pub fn unit_for(client: i32) -> u32 {
        client as u32 * 100
    }

    pub fn has_unit(&self, id: u32) -> bool {
        self.units.contains_key(&id)
    }

    pub fn unit_ids(&self) -> Vec<u32> {
        self.units.keys().copied().collect()
    }

    /// Clients that announced themselves in the lobby, in arrival order.
    pub fn joined(&self) -> &[(i32, String)] {
        &self.joined
    }

    fn next_random(&mut self, max: i32) -> i32 {
        self.last_random = self.rng.gen_range(0..max);
        self.random_count += 1;
        self.last_random
    }

    fn spawn_units(&mut self, session: &Session) {
        self.rng = StdRng::seed_from_u64(session.global.random_seed as u64);
        self.units.clear();
        for client in session.clients.iter().filter(|c| c.slot.is_some()) {
            let position = CellPos::new(self.next_random(MAP_SIZE), self.next_random(MAP_SIZE));
            self.units.insert(
                Self::unit_for(client.index),
                Unit {
                    owner: client.index,
                    position,
                    health: MAX_HEALTH,
                },
            );
        }
    }

    fn unit_hash(id: u32, unit: &Unit) -> i32 {
        (id as i32)
            .wrapping_mul(31)
            .wrapping_add(unit.position.x.wrapping_mul(17))
            .wrapping_add(unit.position.y.wrapping_mul(13))
            .wrapping_add(unit.health)
    }
}

impl Simulation for DemoWorld {
    fn sync_hash(&self) -> i32 {
        self.units
            .iter()
            .fold(self.last_random, |hash, (id, unit)| {
                hash.rotate_left(5) ^ Self::unit_hash(*id, unit)
            })
    }

    fn process_order(&mut self, session: &Session, client: i32, order: &Order) {
        match order.order_string.as_str() {
            JOIN => {
                let name = order.target_string.clone().unwrap_or_default();
                if !self.joined.iter().any(|(c, _)| *c == client) {
                    self.joined.push((client, name));
                }
            }
            START_GAME => self.spawn_units(session),
            CHAT => info!(
                "[chat] client {}: {}",
                client,
                order.target_string.as_deref().unwrap_or("")
            ),
            MOVE => {
                let (Some(id), Some(target)) = (order.subject, order.target_location) else {
                    return;
                };
                if let Some(unit) = self.units.get_mut(&id).filter(|u| u.owner == client) {
                    unit.position = target;
                }
            }
            ATTACK => {
                let (Some(id), Some(target)) = (order.subject, order.target_actor) else {
                    return;
                };
                let owned = self.units.get(&id).is_some_and(|u| u.owner == client);
                if !owned || !self.units.contains_key(&target) {
                    return;
                }
                let damage = self.next_random(10) + 1;
                if let Some(victim) = self.units.get_mut(&target) {
                    victim.health -= damage;
                    if victim.health <= 0 {
                        info!("Unit {} destroyed by client {}", target, client);
                        self.units.remove(&target);
                    }
                }
            }
            _ => {}
        }
    }

    fn shared_random(&self) -> RandomState {
        RandomState {
            last: self.last_random,
            total_count: self.random_count,
        }
    }

    fn sync_traits(&self) -> Vec<TraitReport> {
        self.units
            .iter()
            .map(|(id, unit)| TraitReport {
                actor_id: *id,
                name: "Unit".to_string(),
                hash: Self::unit_hash(*id, unit),
            })
            .collect()
    }
}
