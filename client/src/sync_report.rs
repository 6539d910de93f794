//! Rolling per-frame snapshots, dumped when a desync is detected.

use log::info;
use shared::ClientOrder;
use std::fmt::Write as _;

use crate::world::Simulation;

const NUM_SYNC_REPORTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitReport {
    pub actor_id: u32,
    pub name: String,
    pub hash: i32,
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub frame: i32,
    pub synced_random: i32,
    pub total_count: i32,
    pub traits: Vec<TraitReport>,
    pub orders: Vec<ClientOrder>,
}

/// Keeps the last five frames worth of diagnostics.
#[derive(Debug)]
pub struct SyncReport {
    reports: Vec<Option<Report>>,
    cur_index: usize,
}

impl Default for SyncReport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncReport {
    pub fn new() -> Self {
        Self {
            reports: vec![None; NUM_SYNC_REPORTS],
            cur_index: 0,
        }
    }

    pub fn update(&mut self, frame: i32, world: &dyn Simulation, orders: &[ClientOrder]) {
        let random = world.shared_random();
        self.reports[self.cur_index] = Some(Report {
            frame,
            synced_random: random.last,
            total_count: random.total_count,
            traits: world.sync_traits(),
            orders: orders.to_vec(),
        });
        self.cur_index = (self.cur_index + 1) % NUM_SYNC_REPORTS;
    }

    pub fn report_for(&self, frame: i32) -> Option<&Report> {
        self.reports.iter().flatten().find(|r| r.frame == frame)
    }

    /// Writes the report for `frame` to the `sync` log target.
    pub fn dump(&self, frame: i32) -> String {
        let text = match self.report_for(frame) {
            Some(report) => render(report),
            None => {
                let mut frames: Vec<i32> = self.reports.iter().flatten().map(|r| r.frame).collect();
                frames.sort_unstable();
                format!(
                    "No sync report available for frame {} (have {:?})\n",
                    frame, frames
                )
            }
        };

        for line in text.lines() {
            info!(target: "sync", "{}", line);
        }
        text
    }
}

fn render(report: &Report) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Sync for net frame {} -------------", report.frame);
    let _ = writeln!(
        out,
        "SharedRandom: {} (#{})",
        report.synced_random, report.total_count
    );
    let _ = writeln!(out, "Synced Traits:");
    for t in &report.traits {
        let _ = writeln!(out, "\t[{}] {} ({:#010x})", t.actor_id, t.name, t.hash);
    }
    let _ = writeln!(out, "Orders Issued:");
    for co in &report.orders {
        let o = &co.order;
        let _ = writeln!(
            out,
            "\t client {}: {} subject {:?} target {:?}/{:?}/{:?}",
            co.client, o.order_string, o.subject, o.target_actor, o.target_location, o.target_string
        );
    }
    out
}
