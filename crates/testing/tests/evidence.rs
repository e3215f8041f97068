// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use reliquary::ContractManager;
use reliquary_example_types::node_types::MemoryImpl;
use reliquary_testing::{
    helpers::{contract_round, pump, test_time},
    node_ctx::TestNode,
    test_builder::TestDescription,
};
use reliquary_types::{
    data::BlockId,
    logging::setup_logging,
    message::{EvidenceKind, EvidencePayload, EvidenceRequest, EvidenceResponse},
    temporal::{floor_hour, hour_of_week},
    traits::{ContentStore, Transport},
};

/// Place one block of `owner_node` with `holder_node` at 10:05 and return its id
async fn place_block(
    owner_node: &TestNode,
    owner: &ContractManager<MemoryImpl>,
    holder_node: &TestNode,
    holder: &ContractManager<MemoryImpl>,
) -> BlockId {
    let now = test_time(10, 5);
    owner_node
        .back_up("notes.txt", b"meeting notes")
        .await
        .unwrap();
    assert_eq!(owner.distribute(now).await.unwrap(), 1);
    owner.drain().await;
    assert_eq!(pump(holder_node, holder, now).await.unwrap(), 1);

    let held = holder.contracts().get_peer_block_ids(&owner_node.id());
    assert_eq!(held.len(), 1);
    let block_id = *held.iter().next().unwrap();
    assert_eq!(owner.contracts().holder_of(&block_id), Some(holder_node.id()));
    block_id
}

#[tokio::test(flavor = "multi_thread")]
async fn holder_proves_possession_every_hour() {
    setup_logging();
    let group = TestDescription::default().build();
    let managers = group.contracted_managers().await;
    let (a, b) = (group.node(0), group.node(1));
    let (owner, holder) = (&managers[0], &managers[1]);
    let block_id = place_block(a, owner, b, holder).await;

    // the first round fetches the whole block and starts the evidence chain
    let first = test_time(10, 5);
    assert_eq!(contract_round(b, holder, a, owner, first).await.unwrap(), 3);
    assert!(owner.evidence().contains(&block_id));
    let credited = owner.appraisals().appraisal(&b.id()).unwrap().presence[hour_of_week(first)];
    assert!(credited > 0.0);

    // a second proof in the same hour is not credited again
    let same_hour = test_time(10, 40);
    assert_eq!(contract_round(b, holder, a, owner, same_hour).await.unwrap(), 3);
    let appraisal = owner.appraisals().appraisal(&b.id()).unwrap();
    assert!((appraisal.presence[hour_of_week(first)] - credited).abs() < f64::EPSILON);

    // the next hour earns fresh credit
    let next_hour = test_time(11, 5);
    assert_eq!(contract_round(b, holder, a, owner, next_hour).await.unwrap(), 3);
    let appraisal = owner.appraisals().appraisal(&b.id()).unwrap();
    assert!(appraisal.presence[hour_of_week(next_hour)] > 0.0);
    assert_eq!(appraisal.broken_contract_count, 0);
    assert!(owner.strike(&b.id(), &block_id).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn first_report_fetches_the_block_and_later_ones_challenge_it() {
    setup_logging();
    let group = TestDescription::default().build();
    let managers = group.contracted_managers().await;
    let (a, b) = (group.node(0), group.node(1));
    let (owner, holder) = (&managers[0], &managers[1]);
    let block_id = place_block(a, owner, b, holder).await;
    let reported = holder.contracts().get_peer_block_ids(&a.id());

    let first = test_time(10, 5);
    let requests = owner
        .process_peer_contract_update(&b.id(), first, 0, &reported)
        .await
        .unwrap();
    assert_eq!(requests, [EvidenceRequest::send_block(block_id)].into());
    let responses = holder
        .process_evidence_requests(&a.id(), first, &requests)
        .await
        .unwrap();
    assert!(matches!(
        responses.iter().next().map(|response| &response.payload),
        Some(EvidencePayload::Block(_))
    ));
    let summary = owner
        .process_evidence_responses(&b.id(), first, responses)
        .await
        .unwrap();
    assert_eq!(summary.confirmed, [block_id].into());

    let next_hour = test_time(11, 5);
    let requests = owner
        .process_peer_contract_update(&b.id(), next_hour, 0, &reported)
        .await
        .unwrap();
    let kinds: Vec<EvidenceKind> = requests.iter().map(|request| request.kind).collect();
    assert_eq!(kinds, vec![EvidenceKind::ComputeHash]);
    let responses = holder
        .process_evidence_requests(&a.id(), next_hour, &requests)
        .await
        .unwrap();
    assert!(matches!(
        responses.iter().next().map(|response| &response.payload),
        Some(EvidencePayload::Digest(_))
    ));
    let summary = owner
        .process_evidence_responses(&b.id(), next_hour, responses)
        .await
        .unwrap();
    assert_eq!(summary.confirmed, [block_id].into());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_digest_is_penalized_and_deleted() {
    setup_logging();
    let group = TestDescription::default().build();
    let managers = group.contracted_managers().await;
    let (a, b) = (group.node(0), group.node(1));
    let (owner, holder) = (&managers[0], &managers[1]);
    let block_id = place_block(a, owner, b, holder).await;
    contract_round(b, holder, a, owner, test_time(10, 5))
        .await
        .unwrap();

    let now = test_time(12, 0);
    let requests = owner
        .process_peer_contract_update(&b.id(), now, 0, &[block_id].into())
        .await
        .unwrap();
    assert!(matches!(
        requests.iter().next(),
        Some(EvidenceRequest { block_id: id, .. }) if *id == block_id
    ));

    let forged: BTreeSet<_> = [EvidenceResponse {
        block_id,
        payload: EvidencePayload::Digest("0".repeat(64)),
    }]
    .into();
    let summary = owner
        .process_evidence_responses(&b.id(), now, forged)
        .await
        .unwrap();
    assert_eq!(summary.failed, [block_id].into());
    assert_eq!(
        owner
            .appraisals()
            .appraisal(&b.id())
            .unwrap()
            .broken_contract_count,
        1
    );
    assert!(!owner.evidence().contains(&block_id));

    // the next report from the holder deletes the block on both sides
    let later = test_time(12, 30);
    contract_round(b, holder, a, owner, later).await.unwrap();
    assert!(owner.contracts().get_my_block_ids(Some(&b.id())).is_empty());
    assert!(holder.contracts().get_peer_block_ids(&a.id()).is_empty());
    assert!(b.block_store.is_empty().await);
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_block_is_deleted_after_two_missing_reports() {
    setup_logging();
    let group = TestDescription::default().build();
    let managers = group.contracted_managers().await;
    let (a, b) = (group.node(0), group.node(1));
    let (owner, holder) = (&managers[0], &managers[1]);
    let block_id = place_block(a, owner, b, holder).await;
    contract_round(b, holder, a, owner, test_time(10, 5))
        .await
        .unwrap();

    // the holder loses its disk; the next challenge finds nothing and it stops reporting
    b.block_store.clear().await;
    contract_round(b, holder, a, owner, test_time(10, 20))
        .await
        .unwrap();
    assert!(holder.contracts().get_peer_block_ids(&a.id()).is_empty());

    // first missing report: tolerated
    contract_round(b, holder, a, owner, test_time(10, 30))
        .await
        .unwrap();
    assert!(owner.strike(&b.id(), &block_id).is_some());
    assert_eq!(owner.contracts().holder_of(&block_id), Some(b.id()));

    // still the same hour: tolerated
    contract_round(b, holder, a, owner, test_time(10, 50))
        .await
        .unwrap();
    assert_eq!(owner.contracts().holder_of(&block_id), Some(b.id()));

    // missing again in a later hour: deleted
    contract_round(b, holder, a, owner, test_time(11, 10))
        .await
        .unwrap();
    assert!(owner.contracts().holder_of(&block_id).is_none());
    assert!(owner.blocks().get(&block_id).is_none());
    assert!(!owner.evidence().contains(&block_id));
    assert!(owner.strike(&b.id(), &block_id).is_none());
}

/// Send the owner a contract update listing nothing and let it answer
async fn report_nothing(
    holder_node: &TestNode,
    owner_node: &TestNode,
    owner: &ContractManager<MemoryImpl>,
    now: DateTime<Utc>,
) {
    holder_node
        .network
        .send_contract_update(&owner_node.id(), floor_hour(now), 0, BTreeSet::new())
        .await
        .unwrap();
    pump(owner_node, owner, now).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn block_omitted_from_reports_is_purged_from_the_holder() {
    setup_logging();
    let group = TestDescription::default().build();
    let managers = group.contracted_managers().await;
    let (a, b) = (group.node(0), group.node(1));
    let (owner, holder) = (&managers[0], &managers[1]);
    let block_id = place_block(a, owner, b, holder).await;
    contract_round(b, holder, a, owner, test_time(10, 5))
        .await
        .unwrap();

    // the holder still stores the block but leaves it out of its reports
    report_nothing(b, a, owner, test_time(10, 30)).await;
    assert_eq!(owner.strike(&b.id(), &block_id), Some(test_time(10, 0)));
    assert_eq!(pump(b, holder, test_time(10, 30)).await.unwrap(), 0);
    assert!(b.block_store.has(&block_id).await);

    report_nothing(b, a, owner, test_time(11, 10)).await;
    assert!(owner.contracts().holder_of(&block_id).is_none());

    // the owner's DELETE_BLOCK reaches the holder
    assert_eq!(pump(b, holder, test_time(11, 10)).await.unwrap(), 1);
    assert!(!b.block_store.has(&block_id).await);
    assert!(holder.contracts().get_peer_block_ids(&a.id()).is_empty());
}
