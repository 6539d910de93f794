//! The boundary between the lockstep layer and the simulation it drives.

use shared::{Order, Session};

use crate::sync_report::TraitReport;

/// State of the simulation's shared random generator, for sync reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RandomState {
    pub last: i32,
    pub total_count: i32,
}

/// A deterministic simulation fed by the order stream.
///
/// Identical orders applied in identical order must yield identical
/// `sync_hash` values on every client.
pub trait Simulation {
    fn sync_hash(&self) -> i32;

    fn process_order(&mut self, session: &Session, client: i32, order: &Order);

    fn shared_random(&self) -> RandomState {
        RandomState::default()
    }

    /// Per-actor hash contributions, captured when sync reports are on.
    fn sync_traits(&self) -> Vec<TraitReport> {
        Vec::new()
    }
}
