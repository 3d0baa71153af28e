use syncstore::block::BlockStore;
use syncstore::cluster::LocalCluster;
use syncstore::error::Error;
use syncstore::metadata::FileMetadata;
use syncstore::raft::{AppendEntriesRequest, InternalState, LogEntry};

async fn states(cluster: &LocalCluster) -> Vec<InternalState> {
    let mut states = Vec::new();
    for id in 0..cluster.len() as u64 {
        states.push(cluster.node(id).unwrap().internal_state().await);
    }
    states
}

async fn heartbeat_all(cluster: &LocalCluster) {
    for id in 0..cluster.len() as u64 {
        let _ = cluster.node(id).unwrap().heartbeat().await;
    }
}

/// Metadata for `content` as a single block, with the block stored.
async fn stored_file(cluster: &LocalCluster, name: &str, version: u64, content: &str) -> FileMetadata {
    let hash = cluster
        .block_store()
        .put_block(content.as_bytes().to_vec())
        .await
        .unwrap();
    FileMetadata::new(name, version, vec![hash])
}

#[tokio::test]
async fn test_set_leader() {
    let cluster = LocalCluster::new(3).unwrap();

    cluster.node(0).unwrap().assign_leader().await.unwrap();
    heartbeat_all(&cluster).await;
    for (idx, state) in states(&cluster).await.iter().enumerate() {
        assert_eq!(state.term, 1, "node {idx}");
        assert_eq!(state.is_leader, idx == 0, "node {idx}");
    }

    cluster.node(2).unwrap().assign_leader().await.unwrap();
    heartbeat_all(&cluster).await;
    for (idx, state) in states(&cluster).await.iter().enumerate() {
        assert_eq!(state.term, 2, "node {idx}");
        assert_eq!(state.is_leader, idx == 2, "node {idx}");
    }
}

#[tokio::test]
async fn test_update_replicates_and_commits() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();

    let meta = stored_file(&cluster, "a.txt", 1, "hello").await;
    assert_eq!(cluster.node(0).unwrap().update_file(meta.clone()).await, Ok(1));
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    let states = states(&cluster).await;
    for state in &states {
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log[0].command, meta);
        assert_eq!(state.commit_index, 1);
        assert_eq!(state.meta_map.get("a.txt"), Some(&meta));
    }

    let map = cluster.node(0).unwrap().get_file_info_map().await.unwrap();
    assert_eq!(map.len(), 1);
}

#[tokio::test]
async fn test_version_must_follow_stored_version() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    let leader = cluster.node(0).unwrap();

    let v1 = stored_file(&cluster, "a.txt", 1, "one").await;
    assert_eq!(leader.update_file(v1.clone()).await, Ok(1));

    let rival = stored_file(&cluster, "a.txt", 1, "rival").await;
    match leader.update_file(rival).await {
        Err(Error::VersionConflict(current)) => assert_eq!(*current, v1),
        other => panic!("expected conflict, got {:?}", other),
    }

    let skipped = stored_file(&cluster, "a.txt", 3, "three").await;
    assert!(matches!(
        leader.update_file(skipped).await,
        Err(Error::VersionConflict(_))
    ));

    let v2 = stored_file(&cluster, "a.txt", 2, "two").await;
    assert_eq!(leader.update_file(v2).await, Ok(2));

    // rejected proposals never reach the log
    assert_eq!(leader.internal_state().await.log.len(), 2);
}

#[tokio::test]
async fn test_update_on_missing_file_conflicts_with_version_zero() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();

    let meta = stored_file(&cluster, "new.txt", 2, "x").await;
    match cluster.node(0).unwrap().update_file(meta).await {
        Err(Error::VersionConflict(current)) => {
            assert_eq!(current.version, 0);
            assert!(current.tombstone);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_block_is_rejected() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();

    let meta = FileMetadata::new("a.txt", 1, vec!["00ff".to_string()]);
    assert_eq!(
        cluster.node(0).unwrap().update_file(meta).await,
        Err(Error::MissingBlock("00ff".to_string()))
    );
    assert!(cluster.node(0).unwrap().internal_state().await.log.is_empty());
}

#[tokio::test]
async fn test_followers_refuse_client_operations() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();

    assert_eq!(
        cluster.node(1).unwrap().get_file_info_map().await,
        Err(Error::NotLeader)
    );
    let meta = stored_file(&cluster, "a.txt", 1, "hi").await;
    assert_eq!(cluster.node(1).unwrap().update_file(meta).await, Err(Error::NotLeader));
    // heartbeat on a follower is a no-op
    assert_eq!(cluster.node(1).unwrap().heartbeat().await, Ok(()));
}

#[tokio::test]
async fn test_crashed_node_is_unavailable_and_keeps_state() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    let meta = stored_file(&cluster, "a.txt", 1, "hi").await;
    cluster.node(0).unwrap().update_file(meta).await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    let before = cluster.node(1).unwrap().internal_state().await;
    cluster.node(1).unwrap().crash().await;
    assert!(cluster.node(1).unwrap().internal_state().await.crashed);

    let next = stored_file(&cluster, "b.txt", 1, "there").await;
    cluster.node(0).unwrap().update_file(next).await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    let during = cluster.node(1).unwrap().internal_state().await;
    assert_eq!(during.log, before.log);
    assert_eq!(during.term, before.term);
    assert_eq!(during.commit_index, before.commit_index);
    assert_eq!(during.meta_map, before.meta_map);

    cluster.node(1).unwrap().restore().await;
    let after = cluster.node(1).unwrap().internal_state().await;
    assert_eq!(after, before);

    cluster.node(1).unwrap().crash().await;
    assert!(matches!(
        cluster.node(1).unwrap().heartbeat().await,
        Err(Error::Unavailable(_))
    ));
    assert!(matches!(
        cluster.node(1).unwrap().get_file_info_map().await,
        Err(Error::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_restored_follower_catches_up() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();

    cluster.node(2).unwrap().crash().await;
    for (idx, name) in ["a.txt", "b.txt", "c.txt"].iter().enumerate() {
        let meta = stored_file(&cluster, name, 1, &format!("content {idx}")).await;
        assert_eq!(cluster.node(0).unwrap().update_file(meta).await, Ok(1));
    }
    assert!(cluster.node(2).unwrap().internal_state().await.log.is_empty());

    cluster.node(2).unwrap().restore().await;
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    let states = states(&cluster).await;
    assert_eq!(states[2].log, states[0].log);
    assert_eq!(states[2].commit_index, 3);
    assert_eq!(states[2].meta_map, states[0].meta_map);
}

#[tokio::test]
async fn test_majority_down_appends_nothing() {
    let cluster = LocalCluster::new(5).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    for id in 2..5 {
        cluster.node(id).unwrap().crash().await;
    }
    let meta = stored_file(&cluster, "multi_file1.txt", 1, "data").await;
    assert!(matches!(
        cluster.node(0).unwrap().update_file(meta).await,
        Err(Error::Unavailable(_))
    ));
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    cluster.node(0).unwrap().crash().await;
    for id in 2..5 {
        cluster.node(id).unwrap().restore().await;
    }
    cluster.node(1).unwrap().assign_leader().await.unwrap();
    cluster.node(1).unwrap().heartbeat().await.unwrap();

    for (idx, state) in states(&cluster).await.iter().enumerate() {
        assert!(state.log.is_empty(), "node {idx} has a log");
    }
    assert!(cluster.node(1).unwrap().internal_state().await.is_leader);
}

#[tokio::test]
async fn test_new_leader_keeps_committed_entries() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    let a = stored_file(&cluster, "a.txt", 1, "a").await;
    cluster.node(0).unwrap().update_file(a).await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    // b commits on nodes 0 and 1 only
    cluster.node(2).unwrap().crash().await;
    let b = stored_file(&cluster, "b.txt", 1, "b").await;
    assert_eq!(cluster.node(0).unwrap().update_file(b).await, Ok(1));

    cluster.node(0).unwrap().crash().await;
    cluster.node(2).unwrap().restore().await;
    cluster.node(2).unwrap().assign_leader().await.unwrap();
    assert_eq!(cluster.node(2).unwrap().internal_state().await.log.len(), 2);

    let c = stored_file(&cluster, "c.txt", 1, "c").await;
    assert_eq!(cluster.node(2).unwrap().update_file(c).await, Ok(1));
    cluster.node(2).unwrap().heartbeat().await.unwrap();

    let map = cluster.node(2).unwrap().get_file_info_map().await.unwrap();
    assert_eq!(
        map.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["a.txt", "b.txt", "c.txt"]
    );
    let states = states(&cluster).await;
    assert_eq!(states[1].log, states[2].log);
    assert_eq!(states[1].commit_index, 3);
}

#[tokio::test]
async fn test_leader_adopts_log_of_late_follower() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    let a = stored_file(&cluster, "a.txt", 1, "a").await;
    cluster.node(0).unwrap().update_file(a).await.unwrap();
    cluster.node(0).unwrap().heartbeat().await.unwrap();

    cluster.node(2).unwrap().crash().await;
    let b = stored_file(&cluster, "b.txt", 1, "b").await;
    assert_eq!(cluster.node(0).unwrap().update_file(b.clone()).await, Ok(1));

    // node 2 takes over while the only other holder of b is down
    cluster.node(0).unwrap().crash().await;
    cluster.node(1).unwrap().crash().await;
    cluster.node(2).unwrap().restore().await;
    cluster.node(2).unwrap().assign_leader().await.unwrap();
    assert_eq!(cluster.node(2).unwrap().internal_state().await.log.len(), 1);

    cluster.node(1).unwrap().restore().await;
    cluster.node(2).unwrap().heartbeat().await.unwrap();
    let leader = cluster.node(2).unwrap().internal_state().await;
    assert_eq!(leader.log.len(), 2);
    assert_eq!(leader.log[1].command, b);

    let c = stored_file(&cluster, "c.txt", 1, "c").await;
    assert_eq!(cluster.node(2).unwrap().update_file(c).await, Ok(1));
    let map = cluster.node(2).unwrap().get_file_info_map().await.unwrap();
    assert!(map.contains_key("b.txt"));
}

#[tokio::test]
async fn test_stale_leader_steps_down() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();

    cluster.node(0).unwrap().crash().await;
    cluster.node(1).unwrap().assign_leader().await.unwrap();
    cluster.node(0).unwrap().restore().await;
    assert!(cluster.node(0).unwrap().internal_state().await.is_leader);

    cluster.node(0).unwrap().heartbeat().await.unwrap();
    let state = cluster.node(0).unwrap().internal_state().await;
    assert!(!state.is_leader);
    assert_eq!(state.term, 2);

    let meta = stored_file(&cluster, "a.txt", 1, "a").await;
    assert_eq!(cluster.node(0).unwrap().update_file(meta.clone()).await, Err(Error::NotLeader));
    assert_eq!(cluster.node(1).unwrap().update_file(meta).await, Ok(1));
}

#[tokio::test]
async fn test_reassigning_demotes_previous_leader() {
    let cluster = LocalCluster::new(3).unwrap();
    cluster.node(0).unwrap().assign_leader().await.unwrap();
    cluster.node(1).unwrap().assign_leader().await.unwrap();

    let states = states(&cluster).await;
    assert!(!states[0].is_leader);
    assert!(states[1].is_leader);
    assert!(states.iter().all(|s| s.term == 2));
}

#[tokio::test]
async fn test_conflict_reports_only_committed_records() {
    let cluster = LocalCluster::new(3).unwrap();

    // node 1 holds an entry of term 1 that never committed
    let pending = stored_file(&cluster, "a.txt", 1, "first").await;
    cluster
        .node(1)
        .unwrap()
        .append_entries(AppendEntriesRequest {
            term: 1,
            leader_id: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, pending.clone())],
            leader_commit: 0,
            last_log_index: 1,
            last_log_term: 1,
        })
        .await
        .unwrap();
    cluster.node(0).unwrap().crash().await;
    cluster.node(1).unwrap().assign_leader().await.unwrap();
    let leader = cluster.node(1).unwrap();
    assert_eq!(leader.internal_state().await.commit_index, 0);

    let rival = stored_file(&cluster, "a.txt", 1, "rival").await;
    assert!(matches!(
        leader.update_file(rival.clone()).await,
        Err(Error::Unavailable(_))
    ));

    // a current-term entry commits the earlier one along with it
    let b = stored_file(&cluster, "b.txt", 1, "b").await;
    assert_eq!(leader.update_file(b).await, Ok(1));
    assert_eq!(leader.internal_state().await.commit_index, 2);

    match leader.update_file(rival).await {
        Err(Error::VersionConflict(current)) => assert_eq!(*current, pending),
        other => panic!("expected conflict, got {:?}", other),
    }
}
