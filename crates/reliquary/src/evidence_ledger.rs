// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! Hourly proof-of-storage challenges
//!
//! When a block is first verified, the owner precomputes one `(salt, expected)` pair per hour from
//! the current hour through the contract's expiry, with
//! `expected = hex(SHA-256(salt || block_bytes))`. The owner keeps only the chain, never the block
//! itself, so the holder can later prove possession by hashing the block with the hour's salt.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use reliquary_types::{
    constants::EVIDENCE_SALT_LEN,
    data::{BlockId, ContentHash},
    error::EvidenceError,
    temporal::{floor_hour, hours_between},
};
use sha2::{Digest, Sha256};

/// Lowercase hex of `SHA-256(salt || bytes)`
#[must_use]
pub fn salted_digest(salt: &[u8], bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One hour's challenge
#[derive(Clone, Debug)]
struct Challenge {
    /// Salt sent to the holder
    salt: Vec<u8>,
    /// Digest the holder must answer with
    expected: String,
}

/// The chain of challenges for one block
#[derive(Clone, Debug)]
pub struct EvidenceChain {
    /// Hour of the first challenge
    start: DateTime<Utc>,
    /// One challenge per hour from `start`
    challenges: Vec<Challenge>,
}

impl EvidenceChain {
    /// One challenge per hour from the hour of `now` through the hour of `expiry`
    ///
    /// An expiry in the past still yields the challenge for the current hour. Hashes the whole
    /// block once per hour of the contract, so callers on an async runtime should run it on a
    /// blocking thread.
    #[must_use]
    pub fn precompute(block_bytes: &[u8], now: DateTime<Utc>, expiry: DateTime<Utc>) -> Self {
        let start = floor_hour(now);
        let hours = usize::try_from(hours_between(start, expiry)).unwrap_or(0);

        let mut rng = rand::thread_rng();
        let challenges = (0..=hours)
            .map(|_| {
                let mut salt = vec![0u8; EVIDENCE_SALT_LEN];
                rng.fill_bytes(&mut salt);
                let expected = salted_digest(&salt, block_bytes);
                Challenge { salt, expected }
            })
            .collect();
        Self { start, challenges }
    }

    /// The challenge for the hour containing `time`
    fn at(&self, time: DateTime<Utc>) -> Option<&Challenge> {
        let offset = hours_between(self.start, time);
        usize::try_from(offset)
            .ok()
            .and_then(|offset| self.challenges.get(offset))
    }
}

/// Challenge chains by block
#[derive(Debug, Default)]
pub struct EvidenceLedger {
    /// Chains by block
    chains: DashMap<BlockId, EvidenceChain>,
}

impl EvidenceLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Precompute challenges for a block from the current hour through `expiry`
    pub fn add_contract(&self, block_bytes: &[u8], expiry: DateTime<Utc>) -> BlockId {
        self.add_contract_at(block_bytes, Utc::now(), expiry)
    }

    /// Precompute challenges for a block from the hour of `now` through the hour of `expiry`
    ///
    /// Any existing chain for the block is replaced.
    pub fn add_contract_at(
        &self,
        block_bytes: &[u8],
        now: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> BlockId {
        let block_id = ContentHash::of(block_bytes);
        self.insert(block_id, EvidenceChain::precompute(block_bytes, now, expiry));
        block_id
    }

    /// Install a chain built with [`EvidenceChain::precompute`], replacing any existing one
    pub fn insert(&self, block_id: BlockId, chain: EvidenceChain) {
        self.chains.insert(block_id, chain);
    }

    /// Run `f` against the challenge for the hour containing `time`
    fn with_challenge<R>(
        &self,
        block_id: &BlockId,
        time: DateTime<Utc>,
        f: impl FnOnce(&Challenge) -> R,
    ) -> Result<R, EvidenceError> {
        self.chains
            .get(block_id)
            .and_then(|chain| chain.at(time).map(f))
            .ok_or(EvidenceError::NotFound {
                block_id: *block_id,
                time,
            })
    }

    /// The salt for the hour containing `time`
    ///
    /// # Errors
    /// [`EvidenceError::NotFound`] for an unknown block or an hour outside the chain
    pub fn get_salt(&self, block_id: &BlockId, time: DateTime<Utc>) -> Result<Vec<u8>, EvidenceError> {
        self.with_challenge(block_id, time, |challenge| challenge.salt.clone())
    }

    /// Whether `candidate` is exactly the expected digest for the hour containing `time`
    ///
    /// # Errors
    /// [`EvidenceError::NotFound`] for an unknown block or an hour outside the chain
    pub fn confirm(
        &self,
        block_id: &BlockId,
        time: DateTime<Utc>,
        candidate: &str,
    ) -> Result<bool, EvidenceError> {
        self.with_challenge(block_id, time, |challenge| challenge.expected == candidate)
    }

    /// Whether a chain exists for the block
    #[must_use]
    pub fn contains(&self, block_id: &BlockId) -> bool {
        self.chains.contains_key(block_id)
    }

    /// Drop the chain for a block, returning whether there was one
    pub fn remove(&self, block_id: &BlockId) -> bool {
        self.chains.remove(block_id).is_some()
    }

    /// Drop every chain not in `keep`, returning how many were dropped
    pub fn remove_all_except(&self, keep: &BTreeSet<BlockId>) -> usize {
        let before = self.chains.len();
        self.chains.retain(|block_id, _| keep.contains(block_id));
        before.saturating_sub(self.chains.len())
    }

    /// Number of blocks with a chain
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Whether no block has a chain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 12, 34, 56).unwrap()
    }

    #[test]
    fn evidence_round_trip_within_the_chain() {
        let ledger = EvidenceLedger::new();
        let block = b"the block bytes".to_vec();
        let now = noon();
        let block_id = ledger.add_contract_at(&block, now, now + TimeDelta::hours(5));
        assert_eq!(block_id, ContentHash::of(&block));

        for hour in 0..=5 {
            let time = now + TimeDelta::hours(hour);
            let salt = ledger.get_salt(&block_id, time).unwrap();
            let answer = salted_digest(&salt, &block);
            assert!(ledger.confirm(&block_id, time, &answer).unwrap());
        }

        // the chain starts at the floored hour
        let start = floor_hour(now);
        assert!(ledger.get_salt(&block_id, start).is_ok());
        assert!(ledger.get_salt(&block_id, start - TimeDelta::seconds(1)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chains_built_off_the_runtime_can_be_installed() {
        let ledger = EvidenceLedger::new();
        let block = b"a large block".to_vec();
        let block_id = ContentHash::of(&block);
        let now = noon();

        let bytes = block.clone();
        let chain = tokio::task::spawn_blocking(move || {
            EvidenceChain::precompute(&bytes, now, now + TimeDelta::hours(3))
        })
        .await
        .unwrap();
        assert!(!ledger.contains(&block_id));
        ledger.insert(block_id, chain);

        let later = now + TimeDelta::hours(3);
        let salt = ledger.get_salt(&block_id, later).unwrap();
        assert!(ledger
            .confirm(&block_id, later, &salted_digest(&salt, &block))
            .unwrap());
        assert!(ledger.get_salt(&block_id, now + TimeDelta::hours(4)).is_err());
    }

    #[test]
    fn out_of_range_and_unknown_blocks_are_not_found() {
        let ledger = EvidenceLedger::new();
        let now = noon();
        let block_id = ledger.add_contract_at(b"block", now, now + TimeDelta::hours(2));

        let late = floor_hour(now) + TimeDelta::hours(3);
        assert_eq!(
            ledger.confirm(&block_id, late, "00"),
            Err(EvidenceError::NotFound {
                block_id,
                time: late
            })
        );
        assert!(ledger.get_salt(&block_id, now - TimeDelta::hours(1)).is_err());
        assert!(ledger
            .get_salt(&ContentHash::of(b"unknown"), now)
            .is_err());
    }

    #[test]
    fn tampered_blocks_and_wrong_case_fail() {
        let ledger = EvidenceLedger::new();
        let now = noon();
        let block_id = ledger.add_contract_at(b"block", now, now + TimeDelta::hours(1));
        let salt = ledger.get_salt(&block_id, now).unwrap();

        let tampered = salted_digest(&salt, b"bl0ck");
        assert!(!ledger.confirm(&block_id, now, &tampered).unwrap());

        let upper = salted_digest(&salt, b"block").to_uppercase();
        assert!(!ledger.confirm(&block_id, now, &upper).unwrap());
    }

    #[test]
    fn past_expiry_still_allows_the_current_hour() {
        let ledger = EvidenceLedger::new();
        let now = noon();
        let block_id = ledger.add_contract_at(b"block", now, now - TimeDelta::days(1));
        let salt = ledger.get_salt(&block_id, now).unwrap();
        assert!(ledger
            .confirm(&block_id, now, &salted_digest(&salt, b"block"))
            .unwrap());
        assert!(ledger.get_salt(&block_id, now + TimeDelta::hours(1)).is_err());
    }

    #[test]
    fn salts_differ_per_hour() {
        let ledger = EvidenceLedger::new();
        let now = noon();
        let block_id = ledger.add_contract_at(b"block", now, now + TimeDelta::hours(1));
        assert_ne!(
            ledger.get_salt(&block_id, now).unwrap(),
            ledger
                .get_salt(&block_id, now + TimeDelta::hours(1))
                .unwrap()
        );
    }

    #[test]
    fn garbage_collection_keeps_only_listed_blocks() {
        let ledger = EvidenceLedger::new();
        let now = noon();
        let a = ledger.add_contract_at(b"a", now, now);
        let b = ledger.add_contract_at(b"b", now, now);
        let c = ledger.add_contract_at(b"c", now, now);

        assert_eq!(ledger.remove_all_except(&[a].into()), 2);
        assert!(ledger.contains(&a));
        assert!(!ledger.contains(&b));
        assert!(!ledger.remove(&c));
        assert!(ledger.remove(&a));
        assert!(ledger.is_empty());
    }
}
