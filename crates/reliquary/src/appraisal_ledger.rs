// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Peer reliability from hour-of-week presence profiles
//!
//! Every peer accumulates fractional presence credit in 168 hour-of-week buckets, Monday 00:00
//! UTC being bucket 0. The same structure tracks this node's own uptime. A peer's rating is the
//! share of my own presence that the peer's presence covers:
//! `sum_h min(my[h], peer[h]) / sum_h my[h]`, or `1.0` while I have no uptime yet.

use std::{collections::BTreeSet, path::Path, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use reliquary_types::{
    constants::HOURS_PER_WEEK,
    data::{BlockId, PeerId},
    error::PersistenceError,
    temporal::{floor_hour, hour_of_week, to_time_delta},
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// An empty 168 bucket profile
fn empty_profile() -> Vec<f64> {
    vec![0.0; HOURS_PER_WEEK]
}

/// Credit `profile` with presence from `from` to `to`, splitting across hour buckets
fn credit_presence(profile: &mut [f64], from: DateTime<Utc>, to: DateTime<Utc>) {
    let mut cursor = from;
    while cursor < to {
        let next = (floor_hour(cursor) + TimeDelta::hours(1)).min(to);
        #[allow(clippy::cast_precision_loss)]
        let fraction = (next - cursor).num_milliseconds() as f64 / 3_600_000.0;
        profile[hour_of_week(cursor)] += fraction;
        cursor = next;
    }
}

/// Blocks already credited to a peer within one reporting window
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct CreditWindow {
    /// Start of the hour the window covers
    hour: Option<DateTime<Utc>>,
    /// Blocks credited in that hour
    blocks: BTreeSet<BlockId>,
}

/// What is known about one peer's reliability
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerAppraisal {
    /// The peer
    pub peer: PeerId,
    /// First time the peer was credited or penalized
    pub first_contact: DateTime<Utc>,
    /// Presence credit per hour-of-week bucket
    pub presence: Vec<f64>,
    /// Contracts that reached their expiry intact
    pub completed_contract_count: u64,
    /// Blocks confirmed lost
    pub broken_contract_count: u64,
    /// Deduplication of per-block credit
    window: CreditWindow,
}

impl PeerAppraisal {
    /// A fresh appraisal
    fn new(peer: PeerId, first_contact: DateTime<Utc>) -> Self {
        Self {
            peer,
            first_contact,
            presence: empty_profile(),
            completed_contract_count: 0,
            broken_contract_count: 0,
            window: CreditWindow::default(),
        }
    }
}

/// My own presence, advanced by a periodic tick
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UptimeCalculator {
    /// Presence credit per hour-of-week bucket
    presence: Vec<f64>,
    /// When the profile was last advanced
    last_update: Option<DateTime<Utc>>,
}

impl Default for UptimeCalculator {
    fn default() -> Self {
        Self {
            presence: empty_profile(),
            last_update: None,
        }
    }
}

impl UptimeCalculator {
    /// Advance to `now`. Gaps longer than `max_gap` mean the node was down and are not credited.
    pub fn advance(&mut self, now: DateTime<Utc>, max_gap: TimeDelta) {
        let Some(last) = self.last_update else {
            self.last_update = Some(now);
            return;
        };
        if now <= last {
            return;
        }
        if now - last <= max_gap {
            credit_presence(&mut self.presence, last, now);
        } else {
            debug!("Not crediting uptime gap of {}s", (now - last).num_seconds());
        }
        self.last_update = Some(now);
    }

    /// The profile as it would be if the node stayed up until `at`
    #[must_use]
    pub fn projected(&self, at: DateTime<Utc>) -> Vec<f64> {
        let mut presence = self.presence.clone();
        if let Some(last) = self.last_update {
            credit_presence(&mut presence, last, at);
        }
        presence
    }

    /// Presence credit per hour-of-week bucket
    #[must_use]
    pub fn presence(&self) -> &[f64] {
        &self.presence
    }

    /// When the profile was last advanced
    #[must_use]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}

/// Everything the appraisal ledger persists
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppraisalSnapshot {
    /// Peer appraisals
    pub peers: Vec<PeerAppraisal>,
    /// My own uptime
    pub uptime: UptimeCalculator,
}

/// Concurrent store of peer appraisals and my own uptime
#[derive(Debug)]
pub struct AppraisalLedger {
    /// Appraisals by peer
    peers: DashMap<PeerId, PeerAppraisal>,
    /// My own uptime
    uptime: RwLock<UptimeCalculator>,
    /// Longest tick gap still credited
    max_tick_gap: TimeDelta,
}

impl AppraisalLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new(max_tick_gap: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            uptime: RwLock::new(UptimeCalculator::default()),
            max_tick_gap: to_time_delta(max_tick_gap),
        }
    }

    /// Credit a peer for being present at `time`
    ///
    /// The hour-of-week bucket of `time` grows by `1 / expected_count`, unless `block_id` was
    /// already credited to the peer in the same hour. Returns whether credit was given.
    pub fn register_contact(
        &self,
        peer: PeerId,
        time: DateTime<Utc>,
        expected_count: usize,
        block_id: Option<BlockId>,
    ) -> bool {
        let mut appraisal = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerAppraisal::new(peer, time));

        if let Some(block_id) = block_id {
            let hour = floor_hour(time);
            if appraisal.window.hour != Some(hour) {
                appraisal.window = CreditWindow {
                    hour: Some(hour),
                    blocks: BTreeSet::new(),
                };
            }
            if !appraisal.window.blocks.insert(block_id) {
                return false;
            }
        }

        appraisal.presence[hour_of_week(time)] += share(expected_count);
        true
    }

    /// Penalize a peer for a block confirmed lost at `time`
    pub fn register_lost_block(&self, peer: PeerId, time: DateTime<Utc>, expected_count: usize) {
        let mut appraisal = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerAppraisal::new(peer, time));
        let bucket = &mut appraisal.presence[hour_of_week(time)];
        *bucket = (*bucket - share(expected_count)).max(0.0);
        appraisal.broken_contract_count += 1;
    }

    /// Record a contract with the peer that reached its expiry intact
    pub fn register_completed_contract(&self, peer: PeerId, time: DateTime<Utc>) {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerAppraisal::new(peer, time))
            .completed_contract_count += 1;
    }

    /// Advance my own uptime to `now`
    pub fn tick(&self, now: DateTime<Utc>) {
        self.uptime.write().advance(now, self.max_tick_gap);
    }

    /// How well the peer's presence covers mine, in `[0, 1]`
    ///
    /// With `at_time`, my profile is projected forward to that time first. The stored profile is
    /// never changed by this.
    #[must_use]
    pub fn get_peer_rating(&self, peer: &PeerId, at_time: Option<DateTime<Utc>>) -> f64 {
        let mine = {
            let uptime = self.uptime.read();
            match at_time {
                Some(at) => uptime.projected(at),
                None => uptime.presence.clone(),
            }
        };
        let my_total: f64 = mine.iter().sum();
        if my_total <= 0.0 {
            return 1.0;
        }
        let Some(appraisal) = self.peers.get(peer) else {
            return 0.0;
        };
        let covered: f64 = mine
            .iter()
            .zip(&appraisal.presence)
            .map(|(mine, theirs)| mine.min(*theirs))
            .sum();
        (covered / my_total).clamp(0.0, 1.0)
    }

    /// A copy of the peer's appraisal
    #[must_use]
    pub fn appraisal(&self, peer: &PeerId) -> Option<PeerAppraisal> {
        self.peers.get(peer).map(|appraisal| appraisal.clone())
    }

    /// When the peer was first appraised
    #[must_use]
    pub fn first_contact(&self, peer: &PeerId) -> Option<DateTime<Utc>> {
        self.peers.get(peer).map(|appraisal| appraisal.first_contact)
    }

    /// A copy of my own uptime
    #[must_use]
    pub fn uptime(&self) -> UptimeCalculator {
        self.uptime.read().clone()
    }

    /// Forget a peer
    pub fn remove_peer(&self, peer: &PeerId) -> Option<PeerAppraisal> {
        self.peers.remove(peer).map(|(_, appraisal)| appraisal)
    }

    /// Copy the full ledger state
    #[must_use]
    pub fn snapshot(&self) -> AppraisalSnapshot {
        AppraisalSnapshot {
            peers: self.peers.iter().map(|entry| entry.value().clone()).collect(),
            uptime: self.uptime(),
        }
    }

    /// Replace the ledger state with a snapshot
    pub fn restore(&self, snapshot: AppraisalSnapshot) {
        self.peers.clear();
        for mut appraisal in snapshot.peers {
            appraisal.presence.resize(HOURS_PER_WEEK, 0.0);
            self.peers.insert(appraisal.peer, appraisal);
        }
        let mut uptime = snapshot.uptime;
        uptime.presence.resize(HOURS_PER_WEEK, 0.0);
        *self.uptime.write() = uptime;
    }

    /// Write a snapshot to `path`
    ///
    /// # Errors
    /// If the file cannot be written
    pub async fn persist_to(&self, path: &Path) -> Result<(), PersistenceError> {
        let bytes = bincode::serialize(&self.snapshot())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, bytes).await?;
        Ok(())
    }

    /// Restore from a snapshot at `path`, returning whether one existed
    ///
    /// # Errors
    /// If the file exists but cannot be read or decoded
    pub async fn load_from(&self, path: &Path) -> Result<bool, PersistenceError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        self.restore(bincode::deserialize(&bytes)?);
        Ok(true)
    }
}

/// Credit for one of `expected_count` blocks
#[allow(clippy::cast_precision_loss)]
fn share(expected_count: usize) -> f64 {
    1.0 / expected_count.max(1) as f64
}
