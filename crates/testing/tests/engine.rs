// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

use std::time::Duration;

use reliquary::EngineEvent;
use reliquary_example_types::network_types::MasterMap;
use reliquary_testing::{
    helpers::wait_until,
    node_ctx::TestNode,
    test_builder::TestDescription,
};
use reliquary_types::{
    constants::{APPRAISAL_STATE_FILE, CONTRACT_STATE_DIR},
    logging::setup_logging,
    traits::{CertificateStore, ContentStore, Transport},
    EngineConfig,
};

const PATIENCE: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread")]
async fn engines_contract_place_and_prove_blocks() {
    setup_logging();
    let state = tempfile::tempdir().unwrap();
    let description = TestDescription::fast_engines(2);
    let group = description.build();
    let (a, b) = (group.node(0), group.node(1));
    a.back_up("photo.jpg", b"not really a photo").await.unwrap();

    let mut owner = a
        .engine(EngineConfig {
            state_dir: Some(state.path().to_path_buf()),
            ..group.config.clone()
        })
        .await
        .unwrap();
    let mut holder = b.engine(group.config.clone()).await.unwrap();
    owner.start();
    holder.start();
    assert!(owner.is_running());

    a.connect(b).await.unwrap();
    let (owner_manager, holder_manager) = (owner.manager(), holder.manager());
    assert!(
        wait_until(PATIENCE, || async move {
            owner_manager.contracts().is_contracted(&b.id())
                && holder_manager.contracts().is_contracted(&a.id())
        })
        .await
    );

    // the block lands at the holder and the owner starts challenging it
    let held = &b.block_store;
    assert!(wait_until(PATIENCE, || async move { !held.list().await.is_empty() }).await);
    owner.request(EngineEvent::RunContractCycle).await;
    let owner_manager = owner.manager();
    assert!(
        wait_until(PATIENCE, || async move { !owner_manager.evidence().is_empty() }).await
    );
    assert!(b.certificates.get(&a.id()).await.is_some());

    owner.shut_down().await.unwrap();
    holder.shut_down().await.unwrap();
    assert!(!a.network.peer_connected(&b.id()).await);
    assert!(state.path().join(APPRAISAL_STATE_FILE).exists());
    assert!(state.path().join(CONTRACT_STATE_DIR).is_dir());

    // a restarted owner remembers the contract and where its block is
    let restarted = TestNode::new(a.index, &MasterMap::new());
    let engine = restarted
        .engine(EngineConfig {
            state_dir: Some(state.path().to_path_buf()),
            ..group.config.clone()
        })
        .await
        .unwrap();
    let contracts = engine.manager().contracts();
    assert!(contracts.is_contracted(&b.id()));
    assert_eq!(contracts.get_my_block_ids(Some(&b.id())).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutting_down_an_idle_engine_is_clean() {
    setup_logging();
    let group = TestDescription::default().build();
    let node = group.node(0);
    let mut engine = node.engine(group.config.clone()).await.unwrap();
    assert!(!engine.is_running());

    engine.start();
    engine.start();
    assert!(engine.is_running());
    engine.request(EngineEvent::RunGatekeeper).await;
    engine.shut_down().await.unwrap();
    assert!(!engine.is_running());
    assert!(node.network.recv_event().await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn contracting_twice_changes_nothing() {
    setup_logging();
    let group = TestDescription::default().build();
    let managers = group.contracted_managers().await;
    let other = group.node(1).id();

    assert!(!managers[0].add_contracted_peer(other));
    assert_eq!(managers[0].contracts().contracted_count(), 1);
    assert!(managers[0].contracts().contract(&other).is_some());
}
