// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::{future::Future, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use reliquary::{ContractError, ContractManager};
use reliquary_example_types::node_types::MemoryImpl;
use reliquary_types::{
    data::{ContentHash, JournalEntry, ShardHash},
    traits::{Transport, TransportEvent},
};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use crate::node_ctx::TestNode;

/// How long [`pump`] waits for the next event before deciding the queue is empty
const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// A shard and its hash
#[must_use]
pub fn shard(content: &[u8]) -> (ShardHash, Vec<u8>) {
    (ContentHash::of(content), content.to_vec())
}

/// A journal entry for `path` made of `shards`
#[must_use]
pub fn journal_entry(path: &str, version: u64, shards: &[ShardHash]) -> JournalEntry {
    JournalEntry {
        path: path.to_string(),
        version,
        modified: DateTime::<Utc>::UNIX_EPOCH,
        shards: shards.to_vec(),
    }
}

/// A fixed wall-clock time on a fixed Monday
///
/// # Panics
/// If `hour` or `minute` is out of range
#[must_use]
pub fn test_time(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, hour, minute, 0).unwrap()
}

/// Feed every message waiting in `node`'s queue to `manager`, as if received at `now`
///
/// Returns the number of messages handled. Connection events are skipped.
///
/// # Errors
/// The first error a message produced. Later messages are still handled.
pub async fn pump(
    node: &TestNode,
    manager: &ContractManager<MemoryImpl>,
    now: DateTime<Utc>,
) -> Result<usize, ContractError> {
    manager.drain().await;
    let mut handled = 0;
    let mut first_error = None;
    while let Ok(event) = timeout(QUIET_PERIOD, node.network.recv_event()).await {
        let Ok(TransportEvent::Message { sender, message }) = event else {
            continue;
        };
        debug!("node {} handles {}", node.index, message.purpose());
        if let Err(e) = manager.handle_message(&sender, message, now).await {
            first_error.get_or_insert(e);
        }
        handled += 1;
    }
    manager.drain().await;
    match first_error {
        Some(e) => Err(e),
        None => Ok(handled),
    }
}

/// Poll `condition` until it holds or `limit` passes, returning whether it held
pub async fn wait_until<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// One full contract round between a holder and an owner, all at `now`
///
/// The holder reports what it holds, the owner challenges, the holder answers and the owner
/// checks the answers. Returns the number of messages exchanged.
///
/// # Errors
/// The first error any step produced
pub async fn contract_round(
    holder_node: &TestNode,
    holder: &ContractManager<MemoryImpl>,
    owner_node: &TestNode,
    owner: &ContractManager<MemoryImpl>,
    now: DateTime<Utc>,
) -> Result<usize, ContractError> {
    holder.send_contract_updates(now).await;
    let mut exchanged = pump(owner_node, owner, now).await?;
    exchanged += pump(holder_node, holder, now).await?;
    exchanged += pump(owner_node, owner, now).await?;
    Ok(exchanged)
}
